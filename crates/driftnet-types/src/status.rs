use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::StateError;

/// Lifecycle of an observed site.
///
/// Transitions form a closed table; every state-dependent write in the store
/// is a compare-and-set against the expected source states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SiteStatus {
    /// Created or reset, waiting for CMS/sitemap detection.
    Pending,
    /// Detection succeeded, site is in the scan rotation.
    Active,
    /// Last crawl failed; still scannable until the failure threshold.
    Down,
    /// Repeated failures or expired domain; out of rotation until revived.
    Dead,
    /// Blocked remotely or detection permanently failed; needs admin unfreeze.
    Frozen,
    /// Domain redirected elsewhere; a successor site carries the work. Terminal.
    Moved,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteStatus::Pending => "pending",
            SiteStatus::Active => "active",
            SiteStatus::Down => "down",
            SiteStatus::Dead => "dead",
            SiteStatus::Frozen => "frozen",
            SiteStatus::Moved => "moved",
        }
    }

    /// Sites eligible for scan scheduling.
    pub fn is_scannable(&self) -> bool {
        matches!(self, SiteStatus::Active | SiteStatus::Down)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SiteStatus::Moved)
    }

    /// Allowed transitions per the site state machine.
    pub fn can_transition_to(&self, next: SiteStatus) -> bool {
        use SiteStatus::*;
        match (self, next) {
            (Pending, Active) | (Pending, Frozen) | (Pending, Moved) => true,
            (Active, Down) | (Active, Frozen) | (Active, Pending) | (Active, Moved) => true,
            (Down, Active) | (Down, Dead) | (Down, Frozen) | (Down, Moved) => true,
            (Dead, Pending) => true,
            (Frozen, Active) | (Frozen, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SiteStatus::Pending),
            "active" => Ok(SiteStatus::Active),
            "down" => Ok(SiteStatus::Down),
            "dead" => Ok(SiteStatus::Dead),
            "frozen" => Ok(SiteStatus::Frozen),
            "moved" => Ok(SiteStatus::Moved),
            other => Err(StateError::InvalidStatus(other.to_string())),
        }
    }
}

/// Lifecycle of a scan task (one full refresh attempt for a site).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// A site may hold at most one active task at a time.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Processing) | (Pending, Cancelled) | (Pending, Failed) => true,
            (Processing, Completed) | (Processing, Failed) => true,
            // Retry path only.
            (Failed, Pending) | (Failed, Processing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(StateError::InvalidStatus(other.to_string())),
        }
    }
}

/// The two-stage scan pipeline: sitemap discovery, then page parsing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStage {
    Sitemap,
    Page,
    Done,
}

impl TaskStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStage::Sitemap => "sitemap",
            TaskStage::Page => "page",
            TaskStage::Done => "done",
        }
    }

    /// Stages only advance forward: sitemap → page → done.
    pub fn can_advance_to(&self, next: TaskStage) -> bool {
        matches!(
            (self, next),
            (TaskStage::Sitemap, TaskStage::Page)
                | (TaskStage::Sitemap, TaskStage::Done)
                | (TaskStage::Page, TaskStage::Done)
        )
    }
}

impl fmt::Display for TaskStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStage {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sitemap" => Ok(TaskStage::Sitemap),
            "page" => Ok(TaskStage::Page),
            "done" => Ok(TaskStage::Done),
            other => Err(StateError::InvalidStatus(other.to_string())),
        }
    }
}

/// Per-stage substatus stored inside a scan task.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Processing => "processing",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StageStatus::Pending),
            "processing" => Ok(StageStatus::Processing),
            "completed" => Ok(StageStatus::Completed),
            "failed" => Ok(StageStatus::Failed),
            other => Err(StateError::InvalidStatus(other.to_string())),
        }
    }
}

/// Lifecycle of a discovered sitemap URL in the page work queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UrlStatus {
    Pending,
    Processing,
    Indexed,
    Error,
    Skipped,
}

impl UrlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlStatus::Pending => "pending",
            UrlStatus::Processing => "processing",
            UrlStatus::Indexed => "indexed",
            UrlStatus::Error => "error",
            UrlStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UrlStatus::Indexed | UrlStatus::Skipped)
    }

    pub fn can_transition_to(&self, next: UrlStatus) -> bool {
        use UrlStatus::*;
        match (self, next) {
            (Pending, Processing) => true,
            (Pending, Indexed) | (Pending, Error) | (Pending, Skipped) => true,
            (Processing, Indexed) | (Processing, Error) | (Processing, Pending) => true,
            // Administrative reset.
            (Error, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for UrlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UrlStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UrlStatus::Pending),
            "processing" => Ok(UrlStatus::Processing),
            "indexed" => Ok(UrlStatus::Indexed),
            "error" => Ok(UrlStatus::Error),
            "skipped" => Ok(UrlStatus::Skipped),
            other => Err(StateError::InvalidStatus(other.to_string())),
        }
    }
}

/// Whether detection found a usable sitemap for the site.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SitemapStatus {
    #[default]
    Unknown,
    Found,
    Missing,
}

impl SitemapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SitemapStatus::Unknown => "unknown",
            SitemapStatus::Found => "found",
            SitemapStatus::Missing => "missing",
        }
    }
}

impl fmt::Display for SitemapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SitemapStatus {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(SitemapStatus::Unknown),
            "found" => Ok(SitemapStatus::Found),
            "missing" => Ok(SitemapStatus::Missing),
            other => Err(StateError::InvalidStatus(other.to_string())),
        }
    }
}

/// How the fetch workers drive this site.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ScannerType {
    /// Plain HTTP fetch.
    #[default]
    Http,
    /// Browser-rendered fetch for JS-heavy sites.
    Spa,
}

impl ScannerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScannerType::Http => "http",
            ScannerType::Spa => "spa",
        }
    }
}

impl fmt::Display for ScannerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScannerType {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(ScannerType::Http),
            "spa" => Ok(ScannerType::Spa),
            other => Err(StateError::InvalidStatus(other.to_string())),
        }
    }
}

/// Crawl strategy chosen by detection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStrategy {
    /// Walk the declared sitemaps.
    #[default]
    Sitemap,
    /// Follow links from the front page when no sitemap exists.
    Spider,
}

impl CrawlStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStrategy::Sitemap => "sitemap",
            CrawlStrategy::Spider => "spider",
        }
    }
}

impl fmt::Display for CrawlStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrawlStrategy {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sitemap" => Ok(CrawlStrategy::Sitemap),
            "spider" => Ok(CrawlStrategy::Spider),
            other => Err(StateError::InvalidStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_transitions() {
        use SiteStatus::*;

        assert!(Pending.can_transition_to(Active));
        assert!(Pending.can_transition_to(Frozen));
        assert!(Pending.can_transition_to(Moved));
        assert!(!Pending.can_transition_to(Dead));

        assert!(Active.can_transition_to(Down));
        assert!(Active.can_transition_to(Pending));
        assert!(!Active.can_transition_to(Dead));

        assert!(Down.can_transition_to(Dead));
        assert!(Down.can_transition_to(Active));

        assert!(Dead.can_transition_to(Pending));
        assert!(!Dead.can_transition_to(Active));

        assert!(Frozen.can_transition_to(Active));
        assert!(Frozen.can_transition_to(Pending));

        // Moved is terminal.
        for next in [Pending, Active, Down, Dead, Frozen, Moved] {
            assert!(!Moved.can_transition_to(next));
        }
    }

    #[test]
    fn test_scannable_predicate() {
        assert!(SiteStatus::Active.is_scannable());
        assert!(SiteStatus::Down.is_scannable());
        assert!(!SiteStatus::Pending.is_scannable());
        assert!(!SiteStatus::Frozen.is_scannable());
        assert!(!SiteStatus::Dead.is_scannable());
        assert!(!SiteStatus::Moved.is_scannable());
    }

    #[test]
    fn test_task_transitions() {
        use TaskStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Processing));

        for next in [Pending, Processing, Failed, Cancelled] {
            assert!(!Completed.can_transition_to(next));
            assert!(!Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn test_task_active_predicate() {
        assert!(TaskStatus::Pending.is_active());
        assert!(TaskStatus::Processing.is_active());
        assert!(!TaskStatus::Completed.is_active());
        assert!(!TaskStatus::Failed.is_active());
        assert!(!TaskStatus::Cancelled.is_active());
    }

    #[test]
    fn test_stage_advances_forward_only() {
        assert!(TaskStage::Sitemap.can_advance_to(TaskStage::Page));
        assert!(TaskStage::Sitemap.can_advance_to(TaskStage::Done));
        assert!(TaskStage::Page.can_advance_to(TaskStage::Done));
        assert!(!TaskStage::Page.can_advance_to(TaskStage::Sitemap));
        assert!(!TaskStage::Done.can_advance_to(TaskStage::Page));
    }

    #[test]
    fn test_url_transitions() {
        use UrlStatus::*;

        assert!(Pending.can_transition_to(Indexed));
        assert!(Pending.can_transition_to(Error));
        assert!(Pending.can_transition_to(Skipped));
        assert!(Error.can_transition_to(Pending));
        assert!(Processing.can_transition_to(Pending));

        for next in [Pending, Processing, Error] {
            assert!(!Indexed.can_transition_to(next));
            assert!(!Skipped.can_transition_to(next));
        }
    }

    #[test]
    fn test_status_round_trips() {
        for s in ["pending", "active", "down", "dead", "frozen", "moved"] {
            assert_eq!(s.parse::<SiteStatus>().unwrap().as_str(), s);
        }
        for s in ["pending", "processing", "completed", "failed", "cancelled"] {
            assert_eq!(s.parse::<TaskStatus>().unwrap().as_str(), s);
        }
        for s in ["pending", "processing", "indexed", "error", "skipped"] {
            assert_eq!(s.parse::<UrlStatus>().unwrap().as_str(), s);
        }
        assert!("bogus".parse::<SiteStatus>().is_err());
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_serde_tags_are_lowercase() {
        assert_eq!(
            serde_json::to_string(&SiteStatus::Frozen).unwrap(),
            "\"frozen\""
        );
        assert_eq!(
            serde_json::to_string(&ScannerType::Spa).unwrap(),
            "\"spa\""
        );
        let parsed: UrlStatus = serde_json::from_str("\"indexed\"").unwrap();
        assert_eq!(parsed, UrlStatus::Indexed);
        assert!(serde_json::from_str::<TaskStatus>("\"unknown-tag\"").is_err());
    }
}
