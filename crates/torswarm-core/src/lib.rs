pub mod circuit;
pub mod classify;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod job_queue;
pub mod outcome;
pub mod pool;
pub mod traits;
pub mod worker;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use circuit::{CircuitHandle, CircuitHealth, SocksEndpoint};
pub use classify::{ClassificationPolicy, Verdict};
pub use config::{JobSpec, SwarmConfig};
pub use coordinator::{
    Coordinator, CoordinatorEvent, CoordinatorHandle, CoordinatorReporter, TracingReporter,
};
pub use error::{AppError, TransportError};
pub use job::{JobStatus, RetryConfig, ScrapeJob};
pub use job_queue::JobQueue;
pub use outcome::{FetchOutcome, FetchResult, HaltReason, RunSummary, compute_hash};
pub use pool::{CircuitPool, PoolConfig, PoolStats};
pub use traits::{
    ControlSession, FetchRequest, FetchResponse, ResultSink, TorControl, Transport,
};
pub use worker::FetchWorker;
