//! Message router behavior against in-memory stores and a fake engine.

mod common;

use audit_worker::error::Error;
use audit_worker::model::{
    Disposition, JobId, Notification, OPTIONS_ATTR, Run, RunId, SkipReason,
};
use audit_worker::store::MemoryStore;
use common::{FakeEngine, audit_notification, dead_letter_for, harness, harness_with};
use serde_json::json;

// ---------------------------------------------------------------------------
// Primary path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn new_run_is_audited_uploaded_and_recorded() {
    let h = harness();
    let n = audit_notification("J1", "https://x.test", "M1");

    let disposition = h.router.handle(&n).await.unwrap();
    assert_eq!(disposition, Disposition::Recorded);

    let run = h.store.run(&RunId::from("M1")).expect("run recorded");
    assert_eq!(run.job_id, JobId::from("J1"));
    assert_eq!(run.url.as_deref(), Some("https://x.test"));
    assert!(run.error.is_none());

    let job = h.store.job(&JobId::from("J1"));
    assert_eq!(job.page_count_success, 1);
    assert_eq!(job.page_count_error, 0);

    assert_eq!(
        h.artifacts.keys(),
        vec![
            "reports/html/jobs/J1/runs/M1.html".to_string(),
            "reports/json/jobs/J1/runs/M1.json".to_string(),
        ]
    );
    let json_report = h.artifacts.get("reports/json/jobs/J1/runs/M1.json").unwrap();
    assert_eq!(json_report.content_type, "application/json");
    let html_report = h.artifacts.get("reports/html/jobs/J1/runs/M1.html").unwrap();
    assert_eq!(html_report.content_type, "text/html");

    assert_eq!(h.engine.runs(), 1);
    assert_eq!(h.engine.released(), 1);
    assert_eq!(h.engine.dropped_unreleased(), 0);
}

#[tokio::test]
async fn engine_receives_caller_options_plus_both_output_formats() {
    let h = harness();
    let mut n = audit_notification("J1", "https://x.test", "M1");
    n.message_attributes.insert(
        OPTIONS_ATTR.to_string(),
        json!({"onlyCategories": ["performance"], "output": "csv"}).to_string(),
    );

    h.router.handle(&n).await.unwrap();

    let seen = h.engine.seen_options();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["onlyCategories"], json!(["performance"]));
    assert_eq!(seen[0]["output"], json!(["json", "html"]));
}

#[tokio::test]
async fn duplicate_after_completion_is_fully_skipped() {
    let h = harness();
    let n = audit_notification("J1", "https://x.test", "M1");

    assert_eq!(h.router.handle(&n).await.unwrap(), Disposition::Recorded);
    let uploads_after_first = h.artifacts.put_count();

    let second = h.router.handle(&n).await.unwrap();
    assert_eq!(second, Disposition::Skipped(SkipReason::AlreadyRecorded));

    assert_eq!(h.engine.runs(), 1, "no second audit");
    assert_eq!(h.artifacts.put_count(), uploads_after_first, "no second upload");
    assert_eq!(h.store.job(&JobId::from("J1")).page_count_success, 1);
    assert_eq!(h.store.run_count(), 1);
}

#[tokio::test]
async fn concurrent_duplicates_record_once_and_release_both_engines() {
    // Stale eventual reads let both deliveries past the pre-check; the
    // rendezvous makes both audits finish before either records.
    let h = harness_with(
        MemoryStore::new().with_stale_eventual_reads(),
        FakeEngine::rendezvous(2),
        false,
    );
    let n = audit_notification("J1", "https://x.test", "M1");

    let (a, b) = tokio::join!(h.router.handle(&n), h.router.handle(&n));
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|d| d.as_str());
    assert_eq!(
        outcomes,
        vec![
            Disposition::Recorded,
            Disposition::Skipped(SkipReason::LostRace)
        ]
    );

    assert_eq!(h.engine.runs(), 2, "wasted work is accepted");
    assert_eq!(h.store.run_count(), 1);
    let job = h.store.job(&JobId::from("J1"));
    assert_eq!(job.page_count_success, 1);
    assert_eq!(job.page_count_error, 0);
    assert_eq!(h.engine.released(), 2);
    assert_eq!(h.engine.dropped_unreleased(), 0);
}

#[tokio::test]
async fn run_recorded_during_audit_is_discarded_without_upload() {
    let store = MemoryStore::new().with_stale_eventual_reads();
    let racer = store.clone();
    let engine = FakeEngine::with_hook(move || {
        racer.insert_run(Run::succeeded(
            RunId::from("M1"),
            JobId::from("J1"),
            "https://x.test",
        ));
    });
    let h = harness_with(store, engine, false);

    let disposition = h
        .router
        .handle(&audit_notification("J1", "https://x.test", "M1"))
        .await
        .unwrap();

    assert_eq!(disposition, Disposition::Skipped(SkipReason::LostRace));
    assert_eq!(h.artifacts.put_count(), 0);
    assert_eq!(h.store.job(&JobId::from("J1")).page_count_success, 0);
    assert_eq!(h.store.rejected_puts(), 0, "loser never attempted the insert");
    assert_eq!(h.engine.released(), 1);
}

#[tokio::test]
async fn upload_failure_does_not_block_bookkeeping() {
    let h = harness();
    h.artifacts.inject_failure("reports/");

    let disposition = h
        .router
        .handle(&audit_notification("J1", "https://x.test", "M1"))
        .await
        .unwrap();

    assert_eq!(disposition, Disposition::Recorded);
    assert!(h.artifacts.keys().is_empty());
    assert_eq!(h.artifacts.put_count(), 2, "both uploads attempted");
    assert!(h.store.run(&RunId::from("M1")).is_some());
    assert_eq!(h.store.job(&JobId::from("J1")).page_count_success, 1);
}

#[tokio::test]
async fn audit_failure_propagates_without_writes() {
    let h = harness_with(MemoryStore::new(), FakeEngine::failing("net::ERR_TIMED_OUT"), false);

    let result = h
        .router
        .handle(&audit_notification("J1", "https://x.test", "M1"))
        .await;

    assert!(matches!(result, Err(Error::Audit(ref m)) if m.contains("ERR_TIMED_OUT")));
    assert_eq!(h.store.run_count(), 0);
    assert_eq!(h.store.job(&JobId::from("J1")), Default::default());
    assert_eq!(h.artifacts.put_count(), 0);
}

#[tokio::test]
async fn store_failure_propagates_and_still_releases_engine() {
    let h = harness();
    h.store.fail_writes(true);

    let result = h
        .router
        .handle(&audit_notification("J1", "https://x.test", "M1"))
        .await;

    assert!(result.is_err());
    assert_eq!(h.store.run_count(), 0);
    assert_eq!(h.engine.released(), 1);

    // The redelivery succeeds once the store recovers.
    h.store.fail_writes(false);
    let retry = h
        .router
        .handle(&audit_notification("J1", "https://x.test", "M1"))
        .await
        .unwrap();
    assert_eq!(retry, Disposition::Recorded);
    assert_eq!(h.store.job(&JobId::from("J1")).page_count_success, 1);
}

#[tokio::test]
async fn failed_increment_rolls_back_so_redelivery_counts_the_run() {
    let h = harness();
    h.store.fail_next_increment();
    let n = audit_notification("J1", "https://x.test", "M1");

    assert!(h.router.handle(&n).await.is_err());
    assert!(h.store.run(&RunId::from("M1")).is_none(), "insert rolled back");
    assert_eq!(h.store.job(&JobId::from("J1")), Default::default());
    assert_eq!(h.engine.released(), 1);

    assert_eq!(h.router.handle(&n).await.unwrap(), Disposition::Recorded);
    assert!(h.store.run(&RunId::from("M1")).is_some());
    assert_eq!(h.store.job(&JobId::from("J1")).page_count_success, 1);
    assert_eq!(h.engine.runs(), 2);
}

#[tokio::test]
async fn eventual_read_failure_propagates_before_the_audit() {
    let h = harness();
    h.store.fail_reads(true);

    let result = h
        .router
        .handle(&audit_notification("J1", "https://x.test", "M1"))
        .await;

    assert!(result.is_err());
    assert_eq!(h.engine.runs(), 0);
    assert_eq!(h.store.run_count(), 0);
}

#[tokio::test]
async fn strong_read_failure_propagates_and_releases_engine() {
    let store = MemoryStore::new();
    let flaky = store.clone();
    // Reads start failing while the audit runs, so only the second check hits it.
    let engine = FakeEngine::with_hook(move || flaky.fail_reads(true));
    let h = harness_with(store, engine, false);

    let result = h
        .router
        .handle(&audit_notification("J1", "https://x.test", "M1"))
        .await;

    assert!(result.is_err());
    assert_eq!(h.engine.released(), 1);
    assert_eq!(h.engine.dropped_unreleased(), 0);
    assert_eq!(h.artifacts.put_count(), 0);
    assert_eq!(h.store.run_count(), 0);
}

#[tokio::test]
async fn malformed_primary_attributes_are_errors() {
    let h = harness();

    let mut missing_job = audit_notification("J1", "https://x.test", "M1");
    missing_job.message_attributes.remove("JobId");
    assert!(matches!(
        h.router.handle(&missing_job).await,
        Err(Error::MalformedNotification(_))
    ));

    let mut bad_options = audit_notification("J1", "https://x.test", "M2");
    bad_options
        .message_attributes
        .insert(OPTIONS_ATTR.to_string(), "{not json".to_string());
    assert!(matches!(
        h.router.handle(&bad_options).await,
        Err(Error::MalformedNotification(_))
    ));

    assert_eq!(h.engine.runs(), 0);
    assert_eq!(h.store.run_count(), 0);
}

#[tokio::test]
async fn injected_fault_fails_before_the_audit() {
    let h = harness_with(MemoryStore::new(), FakeEngine::new(), true);

    let result = h
        .router
        .handle(&audit_notification("J1", "https://x.test", "M1"))
        .await;

    assert!(matches!(result, Err(Error::InjectedFault)));
    assert_eq!(h.engine.runs(), 0);
    assert_eq!(h.store.run_count(), 0);
}

// ---------------------------------------------------------------------------
// Dead-letter path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dead_letter_records_failed_run_against_original_message() {
    let h = harness();
    let original = audit_notification("J1", "https://x.test", "M1");

    let disposition = h
        .router
        .handle(&dead_letter_for(&original, "Task timed out after 300 seconds"))
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::DeadLettered);

    let run = h.store.run(&RunId::from("M1")).expect("run keyed by original id");
    assert_eq!(run.job_id, JobId::from("J1"));
    assert_eq!(run.url.as_deref(), Some("https://x.test"));
    assert_eq!(
        run.error.as_deref(),
        Some("ended up in dlq: \"Task timed out after 300 seconds\"")
    );

    let job = h.store.job(&JobId::from("J1"));
    assert_eq!(job.page_count_error, 1);
    assert_eq!(job.page_count_success, 0);
    assert_eq!(h.engine.runs(), 0);
}

#[tokio::test]
async fn dead_letter_without_job_id_is_dropped_without_writes() {
    let h = harness();
    let mut original = audit_notification("J1", "https://x.test", "M1");
    original.message_attributes.remove("JobId");

    let disposition = h
        .router
        .handle(&dead_letter_for(&original, "boom"))
        .await
        .unwrap();

    assert_eq!(disposition, Disposition::Dropped);
    assert_eq!(h.store.run_count(), 0);
    assert_eq!(h.store.job(&JobId::from("J1")), Default::default());
}

#[tokio::test]
async fn dead_letter_with_undecodable_original_is_dropped() {
    let h = harness();
    let garbage = Notification::dead_letter(common::DLQ_TOPIC, "{\"Records\": 42", "boom");

    assert_eq!(h.router.handle(&garbage).await.unwrap(), Disposition::Dropped);
    assert_eq!(h.store.run_count(), 0);
}

#[tokio::test]
async fn dead_letter_after_success_does_not_double_count() {
    let h = harness();
    let original = audit_notification("J1", "https://x.test", "M1");
    assert_eq!(h.router.handle(&original).await.unwrap(), Disposition::Recorded);

    h.router
        .handle(&dead_letter_for(&original, "late failure"))
        .await
        .unwrap();

    let job = h.store.job(&JobId::from("J1"));
    assert_eq!(job.page_count_success, 1);
    assert_eq!(job.page_count_error, 0, "never both");
    assert!(h.store.run(&RunId::from("M1")).unwrap().error.is_none());
}

#[tokio::test]
async fn redelivered_dead_letter_counts_once() {
    let h = harness();
    let dead_letter = dead_letter_for(&audit_notification("J1", "https://x.test", "M1"), "boom");

    h.router.handle(&dead_letter).await.unwrap();
    h.router.handle(&dead_letter).await.unwrap();

    assert_eq!(h.store.job(&JobId::from("J1")).page_count_error, 1);
    assert_eq!(h.store.run_count(), 1);
}

#[tokio::test]
async fn dead_letter_with_failed_increment_is_counted_on_redelivery() {
    let h = harness();
    h.store.fail_next_increment();
    let dead_letter = dead_letter_for(&audit_notification("J1", "https://x.test", "M1"), "boom");

    assert!(h.router.handle(&dead_letter).await.is_err());
    assert_eq!(h.store.run_count(), 0);

    assert_eq!(
        h.router.handle(&dead_letter).await.unwrap(),
        Disposition::DeadLettered
    );
    let job = h.store.job(&JobId::from("J1"));
    assert_eq!(job.page_count_error, 1);
    assert_eq!(job.page_count_success, 0);
}

#[tokio::test]
async fn dead_letter_store_failure_propagates() {
    let h = harness();
    h.store.fail_writes(true);

    let result = h
        .router
        .handle(&dead_letter_for(&audit_notification("J1", "https://x.test", "M1"), "boom"))
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn runs_of_different_messages_count_independently() {
    let h = harness();
    for id in ["M1", "M2", "M3"] {
        h.router
            .handle(&audit_notification("J1", "https://x.test", id))
            .await
            .unwrap();
    }
    h.router
        .handle(&dead_letter_for(&audit_notification("J1", "https://y.test", "M4"), "boom"))
        .await
        .unwrap();

    let job = h.store.job(&JobId::from("J1"));
    assert_eq!(job.page_count_success, 3);
    assert_eq!(job.page_count_error, 1);
    assert_eq!(h.store.run_count(), 4);
}
