use std::time::Duration;

use serde_json::{Value, json};
use torswarm_client::JsonLinesSink;
use torswarm_core::job::{JobStatus, ScrapeJob};
use torswarm_core::outcome::{FetchOutcome, FetchResult, compute_hash};
use torswarm_core::traits::ResultSink;

fn read_lines(path: &std::path::Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn success(job: &ScrapeJob, body: &[u8]) -> FetchOutcome {
    FetchOutcome {
        job_id: job.id,
        slot: Some(1),
        generation: 3,
        attempts: 2,
        elapsed: Duration::from_millis(840),
        result: FetchResult::Success {
            status: 200,
            payload: body.to_vec(),
        },
    }
}

#[tokio::test]
async fn writes_one_line_per_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.jsonl");
    let sink = JsonLinesSink::create(&path).await.unwrap();

    let mut ok = ScrapeJob::new("https://example.com/a", 3)
        .with_context(json!({"page": 1}));
    ok.status = JobStatus::Succeeded;
    let mut failed = ScrapeJob::new("https://example.com/b", 3);
    failed.status = JobStatus::Failed;

    sink.record(&ok, &success(&ok, b"<html>a</html>")).await.unwrap();
    sink.record(
        &failed,
        &FetchOutcome {
            job_id: failed.id,
            slot: Some(0),
            generation: 1,
            attempts: 1,
            elapsed: Duration::from_millis(12),
            result: FetchResult::PermanentFailure {
                reason: "HTTP 404".into(),
                status: Some(404),
            },
        },
    )
    .await
    .unwrap();

    let lines = read_lines(&path);
    assert_eq!(lines.len(), 2);

    let first = &lines[0];
    assert_eq!(first["job_id"], ok.id.to_string());
    assert_eq!(first["status"], "succeeded");
    assert_eq!(first["http_status"], 200);
    assert_eq!(first["attempts"], 2);
    assert_eq!(first["slot"], 1);
    assert_eq!(first["generation"], 3);
    assert_eq!(first["elapsed_ms"], 840);
    assert_eq!(first["content_hash"], compute_hash(b"<html>a</html>"));
    assert_eq!(first["content_length"], 14);
    assert_eq!(first["context"], json!({"page": 1}));
    assert!(first.get("body").is_none());
    assert!(first.get("reason").is_none());

    let second = &lines[1];
    assert_eq!(second["status"], "failed");
    assert_eq!(second["reason"], "HTTP 404");
    assert_eq!(second["http_status"], 404);
    assert!(second.get("content_hash").is_none());
}

#[tokio::test]
async fn includes_body_when_asked() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bodies.jsonl");
    let sink = JsonLinesSink::create(&path).await.unwrap().with_body(true);

    let mut job = ScrapeJob::new("https://example.com", 0);
    job.status = JobStatus::Succeeded;
    sink.record(&job, &success(&job, b"hello")).await.unwrap();

    let lines = read_lines(&path);
    assert_eq!(lines[0]["body"], "hello");
}

#[tokio::test]
async fn interrupted_job_has_no_slot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("interrupted.jsonl");
    let sink = JsonLinesSink::create(&path).await.unwrap();

    let mut job = ScrapeJob::new("https://example.com", 0);
    job.status = JobStatus::Interrupted;
    let outcome = FetchOutcome::interrupted(job.id, 0, "shutdown requested");
    sink.record(&job, &outcome).await.unwrap();

    let lines = read_lines(&path);
    assert_eq!(lines[0]["status"], "interrupted");
    assert_eq!(lines[0]["slot"], Value::Null);
    assert_eq!(lines[0]["reason"], "shutdown requested");
}
