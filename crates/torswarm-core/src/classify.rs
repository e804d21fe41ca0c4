//! Fetch result classification.
//!
//! Decides whether a response or transport error is a success, worth
//! retrying (and whether the exit node looks blocked), or final.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// What the coordinator should do with a fetch result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Retryable { renew_circuit: bool },
    Permanent,
}

/// Configurable classification table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationPolicy {
    /// Statuses that mean the exit node is blocked or rate limited.
    pub blocking_statuses: BTreeSet<u16>,

    /// Renew the circuit when the connection is refused.
    pub renew_on_refused: bool,

    /// Renew the circuit when Tor's SOCKS listener reports a failure.
    pub renew_on_proxy_error: bool,

    /// Renew the circuit when a fetch times out.
    pub renew_on_timeout: bool,

    /// Case-insensitive fragments of Tor error text that indicate a broken circuit.
    pub tor_failure_markers: Vec<String>,
}

impl Default for ClassificationPolicy {
    fn default() -> Self {
        Self {
            blocking_statuses: BTreeSet::from([403, 429, 503]),
            renew_on_refused: true,
            renew_on_proxy_error: true,
            renew_on_timeout: false,
            tor_failure_markers: [
                "general socks server failure",
                "host unreachable",
                "network unreachable",
                "ttl expired",
                "connection not allowed by ruleset",
                "circuit",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl ClassificationPolicy {
    pub fn is_blocking(&self, status: u16) -> bool {
        self.blocking_statuses.contains(&status)
    }

    pub fn classify_status(&self, status: u16) -> Verdict {
        if self.is_blocking(status) {
            return Verdict::Retryable {
                renew_circuit: true,
            };
        }
        match status {
            200..=399 => Verdict::Success,
            400..=499 => Verdict::Permanent,
            // 5xx outside the blocking set and anything unexpected.
            _ => Verdict::Retryable {
                renew_circuit: false,
            },
        }
    }

    pub fn classify_error(&self, error: &TransportError) -> Verdict {
        if !error.is_retryable() {
            return Verdict::Permanent;
        }
        let renew_circuit = match error {
            TransportError::Timeout(_) => self.renew_on_timeout,
            TransportError::Proxy(_) => self.renew_on_proxy_error || self.matches_marker(error),
            TransportError::Connect(_) => {
                (self.renew_on_refused && error.is_refused()) || self.matches_marker(error)
            }
            TransportError::Tls(_) | TransportError::Other(_) => self.matches_marker(error),
            TransportError::InvalidRequest(_) => false,
        };
        Verdict::Retryable { renew_circuit }
    }

    fn matches_marker(&self, error: &TransportError) -> bool {
        let text = error.to_string().to_lowercase();
        self.tor_failure_markers
            .iter()
            .any(|marker| text.contains(&marker.to_lowercase()))
    }
}
