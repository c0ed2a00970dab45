//! Tests for the quotactl library functions.
//!
//! Commands run against an in-memory ledger and write into a buffer, so the
//! output can be checked without spawning the binary.

use std::io::Write;

use textract_quota::classify::ServiceError;
use textract_quota::job::{DocumentRef, ExtractionMode, FailureKind, JobRecord, JobState};
use textract_quota::ledger::{Ledger, MemoryLedger};
use textract_quota::quotactl::{self, GlobalOptions};

fn text_opts() -> GlobalOptions {
    GlobalOptions { json: false }
}

fn json_opts() -> GlobalOptions {
    GlobalOptions { json: true }
}

fn output(buf: Vec<u8>) -> String {
    String::from_utf8(buf).unwrap()
}

async fn seeded_ledger() -> MemoryLedger {
    let ledger = MemoryLedger::new();
    for (i, id) in ["doc-a", "doc-b"].into_iter().enumerate() {
        let record = JobRecord::new(
            id,
            DocumentRef::new("input", format!("{id}.pdf")),
            ExtractionMode::Text,
            1_700_000_000_000 + i as i64,
        );
        ledger.put(&record).await.unwrap();
    }

    let mut abandoned = JobRecord::new(
        "doc-dead",
        DocumentRef::new("input", "doc-dead.pdf"),
        ExtractionMode::Text,
        1_700_000_000_000,
    );
    abandoned.attempt = 7;
    abandoned.last_error = Some(ServiceError::throttled("rate exceeded"));
    abandoned.failure = Some(FailureKind::Exhausted);
    abandoned
        .transition(JobState::Abandoned, 1_700_000_060_000)
        .unwrap();
    ledger.put(&abandoned).await.unwrap();
    ledger
}

#[textract_quota::test]
async fn list_prints_a_table_per_state() {
    let ledger = seeded_ledger().await;

    let mut buf = Vec::new();
    quotactl::list_jobs(&ledger, &text_opts(), &mut buf, JobState::Pending)
        .await
        .unwrap();
    let out = output(buf);
    assert!(out.contains("Document"));
    assert!(out.contains("doc-a"));
    assert!(out.contains("doc-b"));
    assert!(!out.contains("doc-dead"));
    assert!(out.contains("2 document(s) pending"));

    let mut buf = Vec::new();
    quotactl::list_jobs(&ledger, &text_opts(), &mut buf, JobState::Polling)
        .await
        .unwrap();
    assert!(output(buf).contains("No documents in state polling"));
}

#[textract_quota::test]
async fn list_json_is_an_array_of_records() {
    let ledger = seeded_ledger().await;
    let mut buf = Vec::new();
    quotactl::list_jobs(&ledger, &json_opts(), &mut buf, JobState::Pending)
        .await
        .unwrap();
    let records: Vec<JobRecord> = serde_json::from_slice(&buf).unwrap();
    let ids: Vec<&str> = records.iter().map(|r| r.document_id.as_str()).collect();
    assert_eq!(ids, vec!["doc-a", "doc-b"]);
}

#[textract_quota::test]
async fn get_shows_failure_details() {
    let ledger = seeded_ledger().await;
    let mut buf = Vec::new();
    quotactl::job_get(&ledger, &text_opts(), &mut buf, "doc-dead")
        .await
        .unwrap();
    let out = output(buf);
    assert!(out.contains("State:    abandoned"));
    assert!(out.contains("Attempt:  7"));
    assert!(out.contains("Failure:  Exhausted"));
    assert!(out.contains("rate exceeded"));
    assert!(out.contains("2023-11-14T22:13:20.000Z"));

    let mut buf = Vec::new();
    let err = quotactl::job_get(&ledger, &text_opts(), &mut buf, "doc-missing")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[textract_quota::test]
async fn requeue_only_accepts_abandoned_documents() {
    let ledger = seeded_ledger().await;

    let mut buf = Vec::new();
    let err = quotactl::job_requeue(&ledger, &text_opts(), &mut buf, "doc-a")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("only abandoned documents"));
    assert_eq!(
        ledger.get("doc-a").await.unwrap().unwrap().state,
        JobState::Pending
    );

    let mut buf = Vec::new();
    quotactl::job_requeue(&ledger, &json_opts(), &mut buf, "doc-dead")
        .await
        .unwrap();
    let reply: serde_json::Value = serde_json::from_slice(&buf).unwrap();
    assert_eq!(reply["status"], "requeued");
    assert_eq!(reply["generation"], 1);

    let record = ledger.get("doc-dead").await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Pending);
    assert_eq!(record.attempt, 0);
    assert!(record.failure.is_none());
    assert!(
        ledger
            .list_by_state(JobState::Abandoned)
            .await
            .unwrap()
            .is_empty()
    );
}

#[textract_quota::test]
fn check_reports_derived_limits() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(
        br#"
[quota]
published_start_tps = 10.0
published_poll_tps = 20.0
published_max_concurrent_jobs = 50
safety_margin = 0.5
document_timeout_ms = 60000

[backoff.throttled]
base_delay_ms = 1000
max_delay_ms = 8000
max_attempts = 3

[backoff.transient]
base_delay_ms = 100
max_delay_ms = 1000
max_attempts = 2
"#,
    )
    .unwrap();

    let mut buf = Vec::new();
    quotactl::check_config(&json_opts(), &mut buf, Some(file.path())).unwrap();
    let reply: serde_json::Value = serde_json::from_slice(&buf).unwrap();
    assert_eq!(reply["status"], "valid");
    assert_eq!(reply["start_tps"], 5.0);
    assert_eq!(reply["poll_tps"], 10.0);
    assert_eq!(reply["max_in_flight"], 25);

    let mut buf = Vec::new();
    quotactl::check_config(&text_opts(), &mut buf, Some(file.path())).unwrap();
    let out = output(buf);
    assert!(out.contains("Config is valid"));
    assert!(out.contains("start rate:     5.00/s (published 10)"));
}

#[textract_quota::test]
fn check_rejects_invalid_config() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"[quota]\npublished_start_tps = 2.0\n").unwrap();

    let mut buf = Vec::new();
    let err = quotactl::check_config(&json_opts(), &mut buf, Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("Config validation failed"));
    let reply: serde_json::Value = serde_json::from_slice(&buf).unwrap();
    assert_eq!(reply["status"], "invalid");
}
