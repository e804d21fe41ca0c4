use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::circuit::CircuitHandle;
use crate::classify::{ClassificationPolicy, Verdict};
use crate::error::TransportError;
use crate::job::ScrapeJob;
use crate::outcome::{FetchOutcome, FetchResult};
use crate::traits::{FetchRequest, FetchResponse, Transport};

/// Performs single fetches through a checked-out circuit and classifies them.
///
/// The worker never touches the queue or the pool; it only reports.
#[derive(Clone)]
pub struct FetchWorker<T: Transport> {
    transport: T,
    policy: Arc<ClassificationPolicy>,
    timeout: Duration,
    identity_probe_url: Option<String>,
}

impl<T: Transport> FetchWorker<T> {
    pub fn new(transport: T, policy: ClassificationPolicy, timeout: Duration) -> Self {
        Self {
            transport,
            policy: Arc::new(policy),
            timeout,
            identity_probe_url: None,
        }
    }

    /// Fetch `url` through every fresh circuit and log the exit address.
    pub fn with_identity_probe(mut self, url: impl Into<String>) -> Self {
        self.identity_probe_url = Some(url.into());
        self
    }

    /// Fetch `job` through `handle`, aborting early if `cancel` fires.
    pub async fn execute<S>(
        &self,
        job: &ScrapeJob,
        handle: &CircuitHandle<S>,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        let start = Instant::now();
        let request = FetchRequest {
            url: &job.url,
            headers: &job.headers,
            timeout: self.timeout,
            generation: handle.generation(),
        };

        let fetch = tokio::time::timeout(
            self.timeout,
            self.transport.fetch(request, handle.endpoint()),
        );
        let result = tokio::select! {
            () = cancel.cancelled() => FetchResult::Interrupted {
                reason: "shutdown requested during fetch".to_string(),
            },
            fetched = fetch => match fetched {
                Ok(Ok(response)) => self.classify_response(response),
                Ok(Err(e)) => self.classify_error(&e),
                Err(_) => self.classify_error(&TransportError::Timeout(
                    self.timeout.as_millis() as u64,
                )),
            },
        };

        tracing::debug!(
            job_id = %job.id,
            slot = handle.slot(),
            generation = handle.generation(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            success = result.is_success(),
            "Fetch finished"
        );

        FetchOutcome {
            job_id: job.id,
            slot: Some(handle.slot()),
            generation: handle.generation(),
            attempts: job.attempts(),
            elapsed: start.elapsed(),
            result,
        }
    }

    /// Log the exit address of a circuit, if a probe URL is configured.
    ///
    /// Probe failures are logged and otherwise ignored.
    pub async fn probe_identity<S>(&self, handle: &CircuitHandle<S>) -> Option<String> {
        let url = self.identity_probe_url.as_deref()?;
        let headers = BTreeMap::new();
        let request = FetchRequest {
            url,
            headers: &headers,
            timeout: self.timeout,
            generation: handle.generation(),
        };
        let fetch = self.transport.fetch(request, handle.endpoint());
        let fetched = tokio::time::timeout(self.timeout, fetch)
            .await
            .unwrap_or(Err(TransportError::Timeout(self.timeout.as_millis() as u64)));
        match fetched {
            Ok(response) if (200..300).contains(&response.status) => {
                let exit_ip = String::from_utf8_lossy(&response.body).trim().to_string();
                tracing::info!(
                    slot = handle.slot(),
                    generation = handle.generation(),
                    %exit_ip,
                    "Circuit identity"
                );
                Some(exit_ip)
            }
            Ok(response) => {
                tracing::warn!(slot = handle.slot(), status = response.status, "Identity probe rejected");
                None
            }
            Err(e) => {
                tracing::warn!(slot = handle.slot(), error = %e, "Identity probe failed");
                None
            }
        }
    }

    fn classify_response(&self, response: FetchResponse) -> FetchResult {
        let status = response.status;
        match self.policy.classify_status(status) {
            Verdict::Success => FetchResult::Success {
                status,
                payload: response.body,
            },
            Verdict::Retryable { renew_circuit } => FetchResult::RetryableFailure {
                reason: format!("HTTP {status}"),
                status: Some(status),
                renew_circuit,
            },
            Verdict::Permanent => FetchResult::PermanentFailure {
                reason: format!("HTTP {status}"),
                status: Some(status),
            },
        }
    }

    fn classify_error(&self, error: &TransportError) -> FetchResult {
        match self.policy.classify_error(error) {
            // Only responses can succeed; keep the job alive instead.
            Verdict::Success => FetchResult::RetryableFailure {
                reason: error.to_string(),
                status: None,
                renew_circuit: false,
            },
            Verdict::Retryable { renew_circuit } => FetchResult::RetryableFailure {
                reason: error.to_string(),
                status: None,
                renew_circuit,
            },
            Verdict::Permanent => FetchResult::PermanentFailure {
                reason: error.to_string(),
                status: None,
            },
        }
    }
}
