//! JSON-lines result sink.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use torswarm_core::error::AppError;
use torswarm_core::job::{JobStatus, ScrapeJob};
use torswarm_core::outcome::{FetchOutcome, FetchResult};
use torswarm_core::traits::ResultSink;

/// One line of output per finished job.
#[derive(Debug, Serialize)]
struct Record<'a> {
    job_id: Uuid,
    url: &'a str,
    status: JobStatus,
    attempts: u32,
    slot: Option<usize>,
    generation: u64,
    elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a serde_json::Value>,
    recorded_at: DateTime<Utc>,
}

/// Writes one JSON object per line to stdout or a file.
pub struct JsonLinesSink {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    include_body: bool,
}

impl JsonLinesSink {
    pub fn stdout() -> Self {
        Self::from_writer(tokio::io::stdout())
    }

    /// Create (or truncate) `path`.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let file = tokio::fs::File::create(path.as_ref()).await?;
        Ok(Self::from_writer(file))
    }

    pub fn from_writer(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
            include_body: false,
        }
    }

    /// Also write the payload of successful fetches (lossy UTF-8).
    pub fn with_body(mut self, include_body: bool) -> Self {
        self.include_body = include_body;
        self
    }

    fn line(&self, job: &ScrapeJob, outcome: &FetchOutcome) -> Result<String, AppError> {
        let (content_length, body) = match &outcome.result {
            FetchResult::Success { payload, .. } => (
                Some(payload.len()),
                self.include_body
                    .then(|| String::from_utf8_lossy(payload).into_owned()),
            ),
            _ => (None, None),
        };
        let record = Record {
            job_id: job.id,
            url: &job.url,
            status: job.status,
            attempts: outcome.attempts,
            slot: outcome.slot,
            generation: outcome.generation,
            elapsed_ms: outcome.elapsed.as_millis() as u64,
            http_status: outcome.result.status(),
            reason: outcome.result.reason(),
            content_hash: outcome.payload_hash(),
            content_length,
            body,
            context: job.context.as_ref(),
            recorded_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        Ok(line)
    }
}

impl ResultSink for JsonLinesSink {
    async fn record(&self, job: &ScrapeJob, outcome: &FetchOutcome) -> Result<(), AppError> {
        let line = self.line(job, outcome)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}
