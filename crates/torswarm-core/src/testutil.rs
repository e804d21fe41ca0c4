//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks with `Arc<Mutex<_>>` or atomics inside, so clones share
//! state and tests can assert on recorded calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::circuit::SocksEndpoint;
use crate::error::{AppError, TransportError};
use crate::job::ScrapeJob;
use crate::outcome::FetchOutcome;
use crate::traits::{
    ControlSession, FetchRequest, FetchResponse, ResultSink, TorControl, Transport,
};

// ---------------------------------------------------------------------------
// MockTorControl
// ---------------------------------------------------------------------------

/// First SOCKS port handed out by [`MockTorControl`]; slot `n` gets `9250 + n`.
pub const MOCK_SOCKS_BASE_PORT: u16 = 9250;

#[derive(Default)]
struct ControlCounters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    new_circuit_requests: AtomicUsize,
    renewals_fail: AtomicBool,
    renewals_stall: AtomicBool,
    failing_open: Mutex<HashSet<usize>>,
}

/// Mock Tor control that counts sessions and circuit requests.
#[derive(Clone, Default)]
pub struct MockTorControl {
    counters: Arc<ControlCounters>,
}

impl MockTorControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every NEWNYM request fails, so renewals exhaust their slot.
    pub fn failing_renewals(self) -> Self {
        self.set_renewals_fail(true);
        self
    }

    /// NEWNYM succeeds but the new circuit never reports usable.
    pub fn stalled_renewals(self) -> Self {
        self.counters.renewals_stall.store(true, Ordering::SeqCst);
        self
    }

    /// Opening a session for `slot` always fails.
    pub fn failing_open(self, slot: usize) -> Self {
        self.counters.failing_open.lock().unwrap().insert(slot);
        self
    }

    pub fn set_renewals_fail(&self, fail: bool) {
        self.counters.renewals_fail.store(fail, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn new_circuit_requests(&self) -> usize {
        self.counters.new_circuit_requests.load(Ordering::SeqCst)
    }
}

impl TorControl for MockTorControl {
    type Session = MockSession;

    async fn open_session(&self, slot: usize) -> Result<MockSession, AppError> {
        if self.counters.failing_open.lock().unwrap().contains(&slot) {
            return Err(AppError::Control(format!(
                "slot {slot}: connection refused"
            )));
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession {
            endpoint: SocksEndpoint::new("127.0.0.1", MOCK_SOCKS_BASE_PORT + slot as u16),
            counters: Arc::clone(&self.counters),
            renewed: false,
        })
    }
}

pub struct MockSession {
    endpoint: SocksEndpoint,
    counters: Arc<ControlCounters>,
    renewed: bool,
}

impl ControlSession for MockSession {
    fn endpoint(&self) -> &SocksEndpoint {
        &self.endpoint
    }

    async fn new_circuit(&mut self) -> Result<(), AppError> {
        self.counters
            .new_circuit_requests
            .fetch_add(1, Ordering::SeqCst);
        if self.counters.renewals_fail.load(Ordering::SeqCst) {
            return Err(AppError::Control("552 Unrecognized signal".into()));
        }
        self.renewed = true;
        Ok(())
    }

    async fn circuit_usable(&mut self) -> Result<bool, AppError> {
        Ok(!(self.renewed && self.counters.renewals_stall.load(Ordering::SeqCst)))
    }

    async fn close(self) -> Result<(), AppError> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// Build a response with a UTF-8 body.
pub fn response(status: u16, body: &str) -> FetchResponse {
    FetchResponse {
        status,
        body: body.as_bytes().to_vec(),
    }
}

#[derive(Clone)]
struct Scripted {
    result: Result<FetchResponse, TransportError>,
    latency: Option<Duration>,
}

#[derive(Default)]
struct TransportState {
    scripts: HashMap<String, VecDeque<Scripted>>,
    fallback: Option<Scripted>,
    requests: Vec<(String, SocksEndpoint)>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Mock transport with scripted responses per URL.
///
/// Scripted results for a URL are consumed in order and the last one repeats.
/// Unscripted URLs get a 200 with a small HTML body.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
    latency: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(self, url: &str, result: Result<FetchResponse, TransportError>, latency: Option<Duration>) -> Self {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(url.to_string())
            .or_default()
            .push_back(Scripted { result, latency });
        self
    }

    pub fn respond(self, url: &str, response: FetchResponse) -> Self {
        self.script(url, Ok(response), None)
    }

    /// Like [`respond`](Self::respond), but the response takes `latency`.
    pub fn respond_after(self, url: &str, response: FetchResponse, latency: Duration) -> Self {
        self.script(url, Ok(response), Some(latency))
    }

    pub fn fail(self, url: &str, error: TransportError) -> Self {
        self.script(url, Err(error), None)
    }

    /// Response for every URL without a script of its own.
    pub fn always_respond(self, response: FetchResponse) -> Self {
        self.state.lock().unwrap().fallback = Some(Scripted {
            result: Ok(response),
            latency: None,
        });
        self
    }

    /// Delay applied to every fetch without its own latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every request made so far, with the proxy it went through.
    pub fn requests(&self) -> Vec<(String, SocksEndpoint)> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|(requested, _)| requested == url)
            .count()
    }

    /// Highest number of fetches that were in flight at once.
    pub fn max_concurrency(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    fn next_for(&self, url: &str, endpoint: &SocksEndpoint) -> Scripted {
        let mut state = self.state.lock().unwrap();
        state.requests.push((url.to_string(), endpoint.clone()));
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);

        let fallback = state.fallback.clone();
        match state.scripts.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => fallback.unwrap_or_else(|| Scripted {
                result: Ok(response(200, "<html><body>default</body></html>")),
                latency: None,
            }),
        }
    }
}

/// Decrements the in-flight count even if the fetch future is dropped.
struct InFlight<'a>(&'a Mutex<TransportState>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.lock() {
            state.in_flight -= 1;
        }
    }
}

impl Transport for MockTransport {
    async fn fetch(
        &self,
        request: FetchRequest<'_>,
        endpoint: &SocksEndpoint,
    ) -> Result<FetchResponse, TransportError> {
        let scripted = self.next_for(request.url, endpoint);
        let _in_flight = InFlight(&self.state);

        let latency = scripted.latency.unwrap_or(self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        scripted.result
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

/// Sink that keeps every recorded outcome in memory.
#[derive(Clone, Default)]
pub struct RecordingSink {
    records: Arc<Mutex<Vec<(ScrapeJob, FetchOutcome)>>>,
    fail: Arc<AtomicBool>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record outcomes, but report an error for each one.
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.fail.store(true, Ordering::SeqCst);
        sink
    }

    pub fn records(&self) -> Vec<(ScrapeJob, FetchOutcome)> {
        self.records.lock().unwrap().clone()
    }

    pub fn outcomes_for(&self, job_id: Uuid) -> Vec<(ScrapeJob, FetchOutcome)> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|(job, _)| job.id == job_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultSink for RecordingSink {
    async fn record(&self, job: &ScrapeJob, outcome: &FetchOutcome) -> Result<(), AppError> {
        self.records
            .lock()
            .unwrap()
            .push((job.clone(), outcome.clone()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Generic("sink unavailable".into()));
        }
        Ok(())
    }
}
