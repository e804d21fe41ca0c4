use thiserror::Error;

/// Application-wide error types for torswarm.
#[derive(Error, Debug)]
pub enum AppError {
    /// The circuit pool is closed or shutting down.
    #[error("Circuit pool is closed")]
    PoolClosed,

    /// Every circuit in the pool is exhausted.
    #[error("All circuits in the pool are exhausted")]
    PoolExhausted,

    /// The job queue no longer accepts submissions.
    #[error("Job queue is closed")]
    QueueClosed,

    /// Tor could not build a usable circuit for a slot.
    #[error("Circuit {slot} exhausted after {attempts} renewal attempts")]
    CircuitExhausted { slot: usize, attempts: u32 },

    /// Tor control channel failure.
    #[error("Tor control error: {0}")]
    Control(String),

    /// A fetch could not be performed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A job URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// I/O failure in an adapter (sink, launcher).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

/// Failure of a single fetch at the transport level.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The fetch did not finish within the per-request timeout.
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// TCP connection (to the proxy or through it) failed.
    #[error("Connection failed: {0}")]
    Connect(String),

    /// The SOCKS proxy or Tor reported a failure building the stream.
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// TLS handshake or certificate failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The request was rejected before it was sent.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Anything the transport could not categorize.
    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Returns true if the same request may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::InvalidRequest(_))
    }

    /// Returns true for "connection refused" style failures.
    pub fn is_refused(&self) -> bool {
        match self {
            TransportError::Connect(msg) | TransportError::Proxy(msg) => {
                msg.to_lowercase().contains("refused")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_transport_errors() {
        assert!(TransportError::Timeout(30_000).is_retryable());
        assert!(TransportError::Connect("reset".into()).is_retryable());
        assert!(TransportError::Tls("bad cert".into()).is_retryable());
        assert!(TransportError::Other("???".into()).is_retryable());
        assert!(!TransportError::InvalidRequest("bad header".into()).is_retryable());
    }

    #[test]
    fn test_refused_detection() {
        assert!(TransportError::Connect("Connection refused (os error 111)".into()).is_refused());
        assert!(TransportError::Proxy("connection refused by destination".into()).is_refused());
        assert!(!TransportError::Timeout(1).is_refused());
    }
}
