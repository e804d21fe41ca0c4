//! Typed run configuration.
//!
//! Everything the coordinator needs arrives here already parsed; the CLI is
//! responsible for reading files and flags and building a [`SwarmConfig`].

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classify::ClassificationPolicy;
use crate::error::AppError;
use crate::job::{RetryConfig, ScrapeJob};
use crate::pool::PoolConfig;

/// One entry of the job list: either a bare URL or a table with options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobSpec {
    Url(String),
    Detailed {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        max_retries: Option<u32>,
        #[serde(default)]
        context: Option<serde_json::Value>,
    },
}

impl JobSpec {
    pub fn url(&self) -> &str {
        match self {
            JobSpec::Url(url) | JobSpec::Detailed { url, .. } => url,
        }
    }
}

/// Configuration for a whole scrape run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Number of circuits, and therefore of concurrent fetches.
    pub pool_size: usize,

    /// Per-fetch timeout.
    #[serde(with = "secs")]
    pub timeout: Duration,

    /// Retries allowed per job after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry; doubles on every further retry.
    #[serde(with = "secs")]
    pub backoff_base: Duration,

    /// Upper bound for the retry delay.
    #[serde(with = "secs")]
    pub backoff_max: Duration,

    /// Attempts Tor gets to build a usable circuit before the slot is exhausted.
    pub renewal_attempts: u32,

    /// How long to wait for a new circuit to report usable, per attempt.
    #[serde(with = "secs")]
    pub renewal_timeout: Duration,

    /// Rotate every identity on this interval, if set.
    #[serde(with = "opt_secs")]
    pub rotate_interval: Option<Duration>,

    /// Try to restore exhausted circuits on this interval, if set.
    #[serde(with = "opt_secs")]
    pub health_check_interval: Option<Duration>,

    /// URL that echoes the caller's IP, fetched on every fresh circuit.
    pub identity_probe_url: Option<String>,

    pub classification: ClassificationPolicy,

    pub jobs: Vec<JobSpec>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(120),
            renewal_attempts: 3,
            renewal_timeout: Duration::from_secs(60),
            rotate_interval: None,
            health_check_interval: Some(Duration::from_secs(300)),
            identity_probe_url: None,
            classification: ClassificationPolicy::default(),
            jobs: Vec::new(),
        }
    }
}

impl SwarmConfig {
    /// Check ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.pool_size == 0 {
            return Err(AppError::ConfigError("pool_size must be at least 1".into()));
        }
        if self.timeout.is_zero() {
            return Err(AppError::ConfigError("timeout must be positive".into()));
        }
        if self.renewal_attempts == 0 {
            return Err(AppError::ConfigError(
                "renewal_attempts must be at least 1".into(),
            ));
        }
        if self.backoff_max < self.backoff_base {
            return Err(AppError::ConfigError(
                "backoff_max must not be smaller than backoff_base".into(),
            ));
        }
        if matches!(self.rotate_interval, Some(d) if d.is_zero()) {
            return Err(AppError::ConfigError("rotate_interval must be positive".into()));
        }
        if matches!(self.health_check_interval, Some(d) if d.is_zero()) {
            return Err(AppError::ConfigError(
                "health_check_interval must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay: self.backoff_base,
            max_delay: self.backoff_max,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            size: self.pool_size,
            renewal_attempts: self.renewal_attempts,
            renewal_timeout: self.renewal_timeout,
            ..PoolConfig::default()
        }
    }

    /// Turn the job list into queue entries, rejecting unusable URLs.
    pub fn build_jobs(&self) -> Result<Vec<ScrapeJob>, AppError> {
        self.jobs
            .iter()
            .map(|spec| {
                let job = match spec {
                    JobSpec::Url(url) => ScrapeJob::new(url, self.max_retries),
                    JobSpec::Detailed {
                        url,
                        headers,
                        max_retries,
                        context,
                    } => {
                        let mut job = ScrapeJob::new(url, max_retries.unwrap_or(self.max_retries))
                            .with_headers(headers.clone());
                        if let Some(context) = context {
                            job = job.with_context(context.clone());
                        }
                        job
                    }
                };
                job.validate()?;
                Ok(job)
            })
            .collect()
    }
}

/// Durations as fractional seconds, e.g. `timeout = 2.5`.
pub mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
