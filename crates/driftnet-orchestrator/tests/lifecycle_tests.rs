//! Scenario-level checks of the state machines and message contracts that
//! the orchestrator drives. Store- and broker-backed paths need live
//! infrastructure and are exercised in deployment smoke tests.

use driftnet_orchestrator::{blocked_reason, CrawlTunables, JobCadence};
use driftnet_types::{
    is_permanent_remote_error, retry_backoff, CrawlResult, DetectResult, DetectTask, ScanTask,
    Site, SiteStatus, StageStatus, TaskStage, TaskStatus, UrlStatus,
};
use uuid::Uuid;

#[test]
fn test_happy_path_state_walk() {
    // Site is created Pending and activates on detection.
    let site = Site::new("x.example");
    assert_eq!(site.status, SiteStatus::Pending);
    assert!(site.status.can_transition_to(SiteStatus::Active));

    // An immediate scan starts at the sitemap stage.
    let task = ScanTask::new(site.id, &site.domain);
    assert_eq!(task.status, TaskStatus::Processing);
    assert_eq!(task.stage, TaskStage::Sitemap);
    assert_eq!(task.sitemap_result.status, StageStatus::Processing);

    // Sitemap completes, page stage runs to exhaustion, task completes.
    assert!(task.stage.can_advance_to(TaskStage::Page));
    assert!(TaskStage::Page.can_advance_to(TaskStage::Done));
    assert!(task.status.can_transition_to(TaskStatus::Completed));

    // Discovered URLs settle as Indexed.
    assert!(UrlStatus::Pending.can_transition_to(UrlStatus::Indexed));
}

#[test]
fn test_domain_redirect_forks_successor() {
    let mut original = Site::new("x.example");
    original.status = SiteStatus::Active;
    original.scan_interval_hours = 48;

    // Moved is terminal for the original.
    assert!(original.status.can_transition_to(SiteStatus::Moved));
    assert!(!SiteStatus::Moved.can_transition_to(SiteStatus::Pending));

    // The successor starts a fresh detection cycle with the chain origin.
    let successor = Site::successor_of(&original, "y.example");
    assert_eq!(successor.status, SiteStatus::Pending);
    assert_eq!(successor.original_domain.as_deref(), Some("x.example"));
    assert_eq!(successor.scan_interval_hours, 48);

    let detect = DetectTask::for_site(&successor);
    assert_eq!(detect.site_id, successor.id);
    assert_eq!(detect.domain, "y.example");
}

#[test]
fn test_permanent_dns_failure_freezes() {
    let result = DetectResult {
        site_id: Uuid::new_v4(),
        success: false,
        error: "domain not resolvable".into(),
        ..Default::default()
    };
    assert!(is_permanent_remote_error(&result.error));
    // Frozen requires administrative unfreeze; no scannable transition out
    // except through Pending or Active.
    assert!(SiteStatus::Pending.can_transition_to(SiteStatus::Frozen));
    assert!(!SiteStatus::Frozen.is_scannable());
    assert!(SiteStatus::Frozen.can_transition_to(SiteStatus::Pending));
}

#[test]
fn test_block_reason_matches_contract() {
    assert_eq!(blocked_reason(7), "Blocked 7 requests (403/429/503)");
    // A block can land mid page-crawl while the site is Active.
    assert!(SiteStatus::Active.can_transition_to(SiteStatus::Frozen));
}

#[test]
fn test_stale_task_becomes_retryable() {
    // A failed task can only re-enter Processing through the retry path.
    assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Processing));
    assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Completed));

    // Backoff grows and caps at one hour.
    assert_eq!(retry_backoff(1), chrono::Duration::seconds(60));
    assert_eq!(retry_backoff(12), chrono::Duration::hours(1));
}

#[test]
fn test_lease_expiry_reclaims_to_pending() {
    // Processing goes back to Pending when the lease dies, and forward to
    // Indexed when the worker finishes; Indexed is terminal for dedupe.
    assert!(UrlStatus::Processing.can_transition_to(UrlStatus::Pending));
    assert!(UrlStatus::Processing.can_transition_to(UrlStatus::Indexed));
    assert!(!UrlStatus::Indexed.can_transition_to(UrlStatus::Processing));
}

#[test]
fn test_crawl_result_decodes_with_worker_omissions() {
    let raw = format!(
        r#"{{"task_id":"{}","site_id":"{}","success":true,"pages_saved":3}}"#,
        Uuid::new_v4(),
        Uuid::new_v4()
    );
    let result: CrawlResult = serde_json::from_str(&raw).unwrap();
    assert!(result.success);
    assert_eq!(result.pages_saved, 3);
    assert!(result.parsed_urls.is_empty());
    assert!(!result.is_blocked);
    assert_eq!(result.scan_interval_h, 0);
}

#[test]
fn test_tunables_and_cadence_contract() {
    let tunables = CrawlTunables::default();
    assert_eq!(tunables.site_dead_threshold, 3);
    assert_eq!(tunables.max_detect_failures, 3);
    assert_eq!(tunables.queue_batch, 50);

    let cadence = JobCadence::default();
    assert_eq!(cadence.queue_due_sites.as_secs(), 300);
    assert_eq!(cadence.recover_pending_sites.as_secs(), 120);
}

#[test]
fn test_counters_never_exceed_total_in_scenario_shape() {
    // Mirror of the idempotence law: total set at stage entry, then
    // increments, then terminal status only.
    let mut task = ScanTask::new_for_page_stage(Uuid::new_v4(), "x.example", 3);
    for _ in 0..2 {
        task.page_result.success += 1;
    }
    task.page_result.failed += 1;
    assert_eq!(task.page_result.total, 3);
    assert!(task.page_result.success + task.page_result.failed <= task.page_result.total);
    assert!(task.page_result.is_exhausted());
}
