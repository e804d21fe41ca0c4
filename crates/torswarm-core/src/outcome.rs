use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::job::JobStatus;

/// Result of one fetch attempt, or the final disposition of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchResult {
    Success {
        status: u16,
        #[serde(skip)]
        payload: Vec<u8>,
    },
    RetryableFailure {
        reason: String,
        status: Option<u16>,
        renew_circuit: bool,
    },
    PermanentFailure {
        reason: String,
        status: Option<u16>,
    },
    /// Shutdown or a fatal halt stopped the job before it finished.
    Interrupted { reason: String },
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchResult::Success { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchResult::Success { status, .. } => Some(*status),
            FetchResult::RetryableFailure { status, .. }
            | FetchResult::PermanentFailure { status, .. } => *status,
            FetchResult::Interrupted { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            FetchResult::Success { .. } => None,
            FetchResult::RetryableFailure { reason, .. }
            | FetchResult::PermanentFailure { reason, .. }
            | FetchResult::Interrupted { reason } => Some(reason),
        }
    }

    /// Job status this result leaves the job in, if it is final.
    pub fn terminal_status(&self) -> Option<JobStatus> {
        match self {
            FetchResult::Success { .. } => Some(JobStatus::Succeeded),
            FetchResult::PermanentFailure { .. } => Some(JobStatus::Failed),
            FetchResult::Interrupted { .. } => Some(JobStatus::Interrupted),
            FetchResult::RetryableFailure { .. } => None,
        }
    }
}

/// Outcome of a fetch, tagged with the circuit identity that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub job_id: Uuid,
    /// Pool slot that served the fetch; `None` if the job never got a circuit.
    pub slot: Option<usize>,
    pub generation: u64,
    pub attempts: u32,
    #[serde(with = "millis")]
    pub elapsed: Duration,
    pub result: FetchResult,
}

impl FetchOutcome {
    /// Terminal outcome for a job that was never (or no longer) assigned.
    pub fn interrupted(job_id: Uuid, attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            job_id,
            slot: None,
            generation: 0,
            attempts,
            elapsed: Duration::ZERO,
            result: FetchResult::Interrupted {
                reason: reason.into(),
            },
        }
    }

    /// SHA-256 of the payload as 64-char hex, for successful fetches.
    pub fn payload_hash(&self) -> Option<String> {
        match &self.result {
            FetchResult::Success { payload, .. } => Some(compute_hash(payload)),
            _ => None,
        }
    }
}

/// Compute a SHA-256 hash of some bytes, returned as 64-char hex.
pub fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Why a run stopped before every job finished on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// Every circuit became exhausted.
    PoolExhausted,
    /// A shutdown was requested.
    Shutdown,
}

/// Aggregate counts reported when a run ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: u64,
    pub succeeded: u64,
    pub permanently_failed: u64,
    pub interrupted: u64,
    pub renewals_performed: u64,
    /// Outcomes dropped because the circuit was renewed mid-fetch.
    pub stale_discarded: u64,
    pub halt: Option<HaltReason>,
}

impl RunSummary {
    pub fn record(&mut self, result: &FetchResult) {
        match result {
            FetchResult::Success { .. } => self.succeeded += 1,
            FetchResult::PermanentFailure { .. } => self.permanently_failed += 1,
            FetchResult::Interrupted { .. } => self.interrupted += 1,
            FetchResult::RetryableFailure { .. } => {}
        }
    }

    pub fn reported(&self) -> u64 {
        self.succeeded + self.permanently_failed + self.interrupted
    }

    pub fn is_fatal(&self) -> bool {
        self.halt == Some(HaltReason::PoolExhausted)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash(b"hello world");
        let h2 = compute_hash(b"hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, compute_hash(b"hello"));
    }

    #[test]
    fn test_terminal_status_mapping() {
        let ok = FetchResult::Success {
            status: 200,
            payload: b"ok".to_vec(),
        };
        let retry = FetchResult::RetryableFailure {
            reason: "429".into(),
            status: Some(429),
            renew_circuit: true,
        };
        assert_eq!(ok.terminal_status(), Some(JobStatus::Succeeded));
        assert_eq!(retry.terminal_status(), None);
        assert_eq!(retry.status(), Some(429));
        assert_eq!(ok.reason(), None);
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = RunSummary {
            total: 3,
            ..Default::default()
        };
        summary.record(&FetchResult::Success {
            status: 200,
            payload: Vec::new(),
        });
        summary.record(&FetchResult::PermanentFailure {
            reason: "404".into(),
            status: Some(404),
        });
        summary.record(&FetchResult::Interrupted {
            reason: "shutdown".into(),
        });
        assert_eq!(summary.reported(), 3);
        assert!(!summary.is_fatal());
    }

    #[test]
    fn test_outcome_serializes_without_payload() {
        let outcome = FetchOutcome {
            job_id: Uuid::nil(),
            slot: Some(1),
            generation: 4,
            attempts: 1,
            elapsed: Duration::from_millis(1500),
            result: FetchResult::Success {
                status: 200,
                payload: b"<html></html>".to_vec(),
            },
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["result"]["kind"], "success");
        assert_eq!(json["result"]["status"], 200);
        assert!(json["result"].get("payload").is_none());
        assert_eq!(json["elapsed"], 1500);
        assert_eq!(outcome.payload_hash().unwrap().len(), 64);
    }
}
