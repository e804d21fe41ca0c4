use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::AppError;

/// Lifecycle state of a scrape job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Assigned,
    Succeeded,
    Failed,
    Interrupted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Assigned => "assigned",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Interrupted
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "assigned" => Ok(JobStatus::Assigned),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "interrupted" => Ok(JobStatus::Interrupted),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Retry configuration with exponential backoff.
///
/// The delay before retry `n` (1-indexed) is `base_delay * 2^(n-1)`,
/// capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl RetryConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        std::cmp::min(delay, self.max_delay)
    }
}

/// A single URL to fetch, plus its retry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// Caller data carried through to the result sink untouched.
    pub context: Option<serde_json::Value>,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl ScrapeJob {
    pub fn new(url: impl Into<String>, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            headers: BTreeMap::new(),
            context: None,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Number of fetches performed so far, counting the one in flight.
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn next_retry_delay(&self, config: &RetryConfig) -> Duration {
        config.delay_for_attempt(self.retry_count)
    }

    /// Only absolute http(s) URLs can be routed through a SOCKS proxy.
    pub fn validate(&self) -> Result<(), AppError> {
        let parsed =
            Url::parse(&self.url).map_err(|e| AppError::InvalidUrl(format!("{}: {e}", self.url)))?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(AppError::InvalidUrl(format!(
                    "{}: scheme '{scheme}' is not allowed (only http/https)",
                    self.url
                )));
            }
        }
        if parsed.host_str().is_none() {
            return Err(AppError::InvalidUrl(format!("{}: URL has no host", self.url)));
        }
        Ok(())
    }
}
