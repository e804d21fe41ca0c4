use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use crate::circuit::SocksEndpoint;
use crate::error::{AppError, TransportError};
use crate::job::ScrapeJob;
use crate::outcome::FetchOutcome;

/// Opens control sessions to the Tor instance serving a pool slot.
pub trait TorControl: Send + Sync + 'static {
    type Session: ControlSession;

    /// Open (and authenticate) the control session for `slot`.
    fn open_session(
        &self,
        slot: usize,
    ) -> impl Future<Output = Result<Self::Session, AppError>> + Send;
}

/// An authenticated control channel bound to one SOCKS endpoint.
pub trait ControlSession: Send + Sync + 'static {
    fn endpoint(&self) -> &SocksEndpoint;

    /// Ask Tor to route new streams over a fresh circuit.
    fn new_circuit(&mut self) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Whether Tor reports an established circuit it can route through.
    fn circuit_usable(&mut self) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Tear down the session and whatever it owns.
    fn close(self) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// A single HTTP request routed through a SOCKS proxy.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub headers: &'a BTreeMap<String, String>,
    pub timeout: Duration,
    /// Circuit generation the request must leave through. Transports keep
    /// connections from different generations apart.
    pub generation: u64,
}

/// Raw response of a fetch; classification happens in the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Performs HTTP requests through a given SOCKS endpoint.
pub trait Transport: Send + Sync + Clone + 'static {
    fn fetch(
        &self,
        request: FetchRequest<'_>,
        endpoint: &SocksEndpoint,
    ) -> impl Future<Output = Result<FetchResponse, TransportError>> + Send;
}

/// Receives every job exactly once, when it reaches a terminal outcome.
pub trait ResultSink: Send + Sync {
    fn record(
        &self,
        job: &ScrapeJob,
        outcome: &FetchOutcome,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}
