use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Extracted content record for one URL, written only by the page processor.
///
/// `external_ids` is a bag keyed by catalogue name (kinopoisk, imdb, mal,
/// shikimori, ...) pointing at the identifier found on the page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub site_id: Uuid,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub main_text: Option<String>,
    #[serde(default)]
    pub external_ids: HashMap<String, String>,
    #[serde(default)]
    pub player_url: Option<String>,
    #[serde(default)]
    pub link_texts: Vec<String>,
    #[serde(default)]
    pub http_status: Option<i32>,
    pub indexed_at: DateTime<Utc>,
}

impl Page {
    pub fn new(site_id: Uuid, url: impl Into<String>) -> Self {
        Self {
            site_id,
            url: url.into(),
            title: None,
            year: None,
            description: None,
            main_text: None,
            external_ids: HashMap::new(),
            player_url: None,
            link_texts: Vec::new(),
            http_status: None,
            indexed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_serde_shape() {
        let mut page = Page::new(Uuid::new_v4(), "https://x.example/films/matrix");
        page.title = Some("The Matrix".into());
        page.year = Some(1999);
        page.external_ids.insert("kinopoisk".into(), "301".into());
        page.external_ids.insert("imdb".into(), "tt0133093".into());

        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["external_ids"]["imdb"], "tt0133093");
        assert_eq!(json["year"], 1999);

        let back: Page = serde_json::from_value(json).unwrap();
        assert_eq!(back.external_ids.len(), 2);
    }
}
