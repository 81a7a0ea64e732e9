use driftnet_types::StateError;
use thiserror::Error;

/// Errors surfaced by the repositories.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Unique-domain insert collided with an existing site.
    #[error("duplicate domain: {0}")]
    DuplicateDomain(String),

    /// CAS rejections and unknown status tags from stored rows.
    #[error(transparent)]
    State(#[from] StateError),

    /// A stored row failed to decode into its domain type.
    #[error("corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },
}

impl PersistenceError {
    /// A compare-and-set matched zero rows: another writer won.
    pub fn concurrent(entity: &'static str, id: impl ToString) -> Self {
        PersistenceError::State(StateError::ConcurrentUpdate {
            entity,
            id: id.to_string(),
        })
    }

    /// True when the operation lost a CAS race (callers log and skip).
    pub fn is_concurrent_update(&self) -> bool {
        matches!(
            self,
            PersistenceError::State(StateError::ConcurrentUpdate { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Map a postgres unique-violation on the sites domain key to a typed error.
pub(crate) fn map_insert_error(err: sqlx::Error, domain: &str) -> PersistenceError {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.code().as_deref() == Some("23505") {
            return PersistenceError::DuplicateDomain(domain.to_string());
        }
    }
    PersistenceError::Database(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_update_is_detectable() {
        let err = PersistenceError::concurrent("site", "abc");
        assert!(err.is_concurrent_update());

        let other = PersistenceError::CorruptRow {
            table: "sites",
            reason: "bad status".into(),
        };
        assert!(!other.is_concurrent_update());
    }
}
