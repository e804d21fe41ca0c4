//! Multi-circuit fetch coordinator.
//!
//! Runs one lane per circuit slot. A lane pops a job, checks out a circuit,
//! lets the [`FetchWorker`] fetch through it and sends the outcome here. The
//! coordinator alone decides what happens next: forward to the sink, requeue
//! with backoff, renew the circuit, or discard a stale result.
//!
//! # Job states
//!
//! ```text
//! PENDING --pop--> ASSIGNED --success--------------------> SUCCEEDED
//!    ^                 |------permanent / retries spent---> FAILED
//!    |                 |------shutdown / pool exhausted---> INTERRUPTED
//!    +---backoff-------+------retryable
//! ```

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::circuit::CircuitHealth;
use crate::config::SwarmConfig;
use crate::error::AppError;
use crate::job::{JobStatus, RetryConfig, ScrapeJob};
use crate::job_queue::JobQueue;
use crate::outcome::{FetchOutcome, FetchResult, HaltReason, RunSummary};
use crate::pool::CircuitPool;
use crate::traits::{ResultSink, TorControl, Transport};
use crate::worker::FetchWorker;

/// Events emitted by the coordinator for monitoring/logging.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent<'a> {
    Started {
        pool_size: usize,
        jobs: usize,
    },
    JobSucceeded {
        job: &'a ScrapeJob,
        status: u16,
        bytes: usize,
    },
    JobRetrying {
        job: &'a ScrapeJob,
        reason: &'a str,
        delay: Duration,
        renew_circuit: bool,
    },
    JobFailed {
        job: &'a ScrapeJob,
        reason: &'a str,
    },
    JobInterrupted {
        job: &'a ScrapeJob,
        reason: &'a str,
    },
    StaleDiscarded {
        job_id: Uuid,
        slot: usize,
        generation: u64,
        current: u64,
    },
    CircuitRenewed {
        slot: usize,
        generation: u64,
    },
    RenewalFailed {
        slot: usize,
        error: &'a AppError,
    },
    RotationRequested {
        slots: usize,
    },
    Halted {
        reason: HaltReason,
    },
    Finished {
        summary: &'a RunSummary,
    },
}

/// Trait for receiving coordinator events (decoupled logging).
pub trait CoordinatorReporter: Send + Sync {
    fn report(&self, event: CoordinatorEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl CoordinatorReporter for TracingReporter {
    fn report(&self, event: CoordinatorEvent<'_>) {
        match event {
            CoordinatorEvent::Started { pool_size, jobs } => {
                tracing::info!(%pool_size, %jobs, "Run started");
            }
            CoordinatorEvent::JobSucceeded { job, status, bytes } => {
                tracing::info!(job_id = %job.id, url = %job.url, %status, %bytes, "Job succeeded");
            }
            CoordinatorEvent::JobRetrying {
                job,
                reason,
                delay,
                renew_circuit,
            } => {
                tracing::warn!(
                    job_id = %job.id,
                    url = %job.url,
                    %reason,
                    attempt = job.retry_count,
                    max_retries = job.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    %renew_circuit,
                    "Job will be retried"
                );
            }
            CoordinatorEvent::JobFailed { job, reason } => {
                tracing::warn!(job_id = %job.id, url = %job.url, %reason, "Job failed");
            }
            CoordinatorEvent::JobInterrupted { job, reason } => {
                tracing::info!(job_id = %job.id, url = %job.url, %reason, "Job interrupted");
            }
            CoordinatorEvent::StaleDiscarded {
                job_id,
                slot,
                generation,
                current,
            } => {
                tracing::debug!(%job_id, %slot, %generation, %current, "Discarded stale outcome");
            }
            CoordinatorEvent::CircuitRenewed { slot, generation } => {
                tracing::debug!(%slot, %generation, "Circuit renewed");
            }
            CoordinatorEvent::RenewalFailed { slot, error } => {
                tracing::error!(%slot, %error, "Circuit renewal failed");
            }
            CoordinatorEvent::RotationRequested { slots } => {
                tracing::info!(%slots, "Rotating circuit identities");
            }
            CoordinatorEvent::Halted { reason } => match reason {
                HaltReason::PoolExhausted => {
                    tracing::error!("All circuits exhausted, halting new assignments");
                }
                HaltReason::Shutdown => tracing::info!("Shutdown requested, draining"),
            },
            CoordinatorEvent::Finished { summary } => {
                tracing::info!(
                    total = summary.total,
                    succeeded = summary.succeeded,
                    permanently_failed = summary.permanently_failed,
                    interrupted = summary.interrupted,
                    renewals = summary.renewals_performed,
                    stale_discarded = summary.stale_discarded,
                    halt = ?summary.halt,
                    "Run finished"
                );
            }
        }
    }
}

/// What a lane does with its circuit after reporting an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    Release,
    Renew,
}

enum Message {
    Outcome {
        job: ScrapeJob,
        outcome: FetchOutcome,
        reply: oneshot::Sender<Directive>,
    },
    /// A lane popped a job but could not get a circuit for it.
    Unassigned { job: ScrapeJob, error: AppError },
    Renewed {
        slot: usize,
        result: Result<u64, AppError>,
    },
    Submit {
        job: ScrapeJob,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
}

/// Handle for feeding jobs into, or stopping, a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

impl CoordinatorHandle {
    /// Add a job to the running set.
    ///
    /// Fails with [`AppError::QueueClosed`] once the run is halting or over.
    pub async fn submit(&self, job: ScrapeJob) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Submit { job, reply })
            .map_err(|_| AppError::QueueClosed)?;
        rx.await.unwrap_or(Err(AppError::QueueClosed))
    }

    /// Request a graceful shutdown: in-flight fetches are interrupted.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Owns the circuit pool and job queue for one scrape run.
pub struct Coordinator<C, T, S>
where
    C: TorControl,
    T: Transport,
    S: ResultSink,
{
    pool: CircuitPool<C>,
    queue: JobQueue,
    worker: FetchWorker<T>,
    sink: S,
    retry_config: RetryConfig,
    rotate_interval: Option<Duration>,
    health_check_interval: Option<Duration>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl<C, T, S> Coordinator<C, T, S>
where
    C: TorControl,
    T: Transport,
    S: ResultSink,
{
    pub fn new(
        pool: CircuitPool<C>,
        worker: FetchWorker<T>,
        sink: S,
        retry_config: RetryConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            pool,
            queue: JobQueue::new(),
            worker,
            sink,
            retry_config,
            rotate_interval: None,
            health_check_interval: None,
            cancel: CancellationToken::new(),
            tx,
            rx,
        }
    }

    /// Build the pool and worker from a validated configuration.
    pub fn from_config(
        config: &SwarmConfig,
        control: C,
        transport: T,
        sink: S,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let pool = CircuitPool::new(control, config.pool_config());
        let mut worker =
            FetchWorker::new(transport, config.classification.clone(), config.timeout);
        if let Some(url) = &config.identity_probe_url {
            worker = worker.with_identity_probe(url.clone());
        }
        let mut coordinator = Self::new(pool, worker, sink, config.retry_config());
        if let Some(interval) = config.rotate_interval {
            coordinator = coordinator.with_rotation(interval);
        }
        if let Some(interval) = config.health_check_interval {
            coordinator = coordinator.with_health_check(interval);
        }
        Ok(coordinator)
    }

    /// Rotate every circuit identity on `interval`. Fetches in progress
    /// finish on their current circuit; the slot rotates when released.
    pub fn with_rotation(mut self, interval: Duration) -> Self {
        self.rotate_interval = Some(interval);
        self
    }

    pub fn with_health_check(mut self, interval: Duration) -> Self {
        self.health_check_interval = Some(interval);
        self
    }

    /// Use an external token to trigger shutdown. Call before [`handle`](Self::handle).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }

    pub fn pool(&self) -> &CircuitPool<C> {
        &self.pool
    }

    /// Run until every job has reached a terminal outcome.
    ///
    /// Per-job failures never abort the run; only shutdown or exhaustion of
    /// every circuit halts it early, and even then every job is reported.
    pub async fn run<R: CoordinatorReporter>(
        mut self,
        jobs: Vec<ScrapeJob>,
        reporter: &R,
    ) -> RunSummary {
        let mut run = RunState::default();
        reporter.report(CoordinatorEvent::Started {
            pool_size: self.pool.size(),
            jobs: jobs.len(),
        });

        for job in jobs {
            self.admit(job, &mut run, reporter).await;
        }

        let mut tasks = JoinSet::new();
        for lane in 0..self.pool.size() {
            tasks.spawn(run_lane(
                lane,
                self.queue.clone(),
                self.pool.clone(),
                self.worker.clone(),
                self.tx.clone(),
                self.cancel.clone(),
            ));
        }

        let mut rotate = self.rotate_interval.map(periodic);
        let mut health_check = self.health_check_interval.map(periodic);

        while run.outstanding > 0 {
            tokio::select! {
                () = self.cancel.cancelled(), if run.halt.is_none() => {
                    self.halt(HaltReason::Shutdown, &mut run, reporter).await;
                }
                Some(message) = self.rx.recv() => {
                    self.handle_message(message, &mut run, reporter).await;
                }
                () = tick(&mut rotate), if run.halt.is_none() => {
                    let slots = self.pool.rotate_all();
                    reporter.report(CoordinatorEvent::RotationRequested { slots });
                }
                () = tick(&mut health_check), if run.halt.is_none() => {
                    let pool = self.pool.clone();
                    let cancel = self.cancel.clone();
                    tasks.spawn(async move {
                        tokio::select! {
                            _ = pool.restore_exhausted() => {}
                            () = cancel.cancelled() => {}
                        }
                    });
                }
            }
        }

        self.queue.close();
        // Late submissions are refused once the run is over.
        self.rx.close();
        while let Ok(message) = self.rx.try_recv() {
            if let Message::Submit { reply, .. } = message {
                let _ = reply.send(Err(AppError::QueueClosed));
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Lane task failed");
            }
        }
        self.pool.shutdown().await;

        run.summary.renewals_performed = self.pool.renewals_performed();
        run.summary.halt = run.halt;
        reporter.report(CoordinatorEvent::Finished {
            summary: &run.summary,
        });
        run.summary
    }

    async fn admit<R: CoordinatorReporter>(
        &mut self,
        mut job: ScrapeJob,
        run: &mut RunState,
        reporter: &R,
    ) {
        run.summary.total += 1;
        run.outstanding += 1;

        if let Err(e) = job.validate() {
            let outcome = FetchOutcome {
                job_id: job.id,
                slot: None,
                generation: 0,
                attempts: 0,
                elapsed: Duration::ZERO,
                result: FetchResult::PermanentFailure {
                    reason: e.to_string(),
                    status: None,
                },
            };
            self.finish(job, outcome, run, reporter).await;
            return;
        }

        job.status = JobStatus::Pending;
        if let Err(e) = self.queue.push(job.clone()) {
            let outcome = FetchOutcome::interrupted(job.id, job.retry_count, e.to_string());
            self.finish(job, outcome, run, reporter).await;
        }
    }

    async fn handle_message<R: CoordinatorReporter>(
        &mut self,
        message: Message,
        run: &mut RunState,
        reporter: &R,
    ) {
        match message {
            Message::Outcome {
                job,
                outcome,
                reply,
            } => {
                let directive = self.on_outcome(job, outcome, run, reporter).await;
                // A lane that vanished simply drops its circuit.
                let _ = reply.send(directive);
            }
            Message::Unassigned { job, error } => {
                if matches!(error, AppError::PoolExhausted) && run.halt.is_none() {
                    self.halt(HaltReason::PoolExhausted, run, reporter).await;
                }
                let reason = match run.halt {
                    Some(halt) => halt_message(halt).to_string(),
                    None => error.to_string(),
                };
                let outcome = FetchOutcome::interrupted(job.id, job.retry_count, reason);
                self.finish(job, outcome, run, reporter).await;
            }
            Message::Renewed { slot, result } => match result {
                Ok(generation) => {
                    reporter.report(CoordinatorEvent::CircuitRenewed { slot, generation });
                }
                Err(error) => {
                    reporter.report(CoordinatorEvent::RenewalFailed {
                        slot,
                        error: &error,
                    });
                    if self.pool.is_exhausted() && run.halt.is_none() {
                        self.halt(HaltReason::PoolExhausted, run, reporter).await;
                    }
                }
            },
            Message::Submit { job, reply } => {
                if run.halt.is_some() {
                    let _ = reply.send(Err(AppError::QueueClosed));
                } else {
                    self.admit(job, run, reporter).await;
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }

    async fn on_outcome<R: CoordinatorReporter>(
        &mut self,
        mut job: ScrapeJob,
        outcome: FetchOutcome,
        run: &mut RunState,
        reporter: &R,
    ) -> Directive {
        if matches!(outcome.result, FetchResult::Interrupted { .. }) {
            self.finish(job, outcome, run, reporter).await;
            return Directive::Release;
        }

        if let Some(slot) = outcome.slot {
            let current = self.pool.current_generation(slot);
            if outcome.generation < current {
                run.summary.stale_discarded += 1;
                reporter.report(CoordinatorEvent::StaleDiscarded {
                    job_id: job.id,
                    slot,
                    generation: outcome.generation,
                    current,
                });
                if let Some(halt) = run.halt {
                    let outcome =
                        FetchOutcome::interrupted(job.id, job.retry_count, halt_message(halt));
                    self.finish(job, outcome, run, reporter).await;
                    return Directive::Release;
                }
                // The attempt counts against the job's retries like any failure.
                let reason = "result came from a retired circuit".to_string();
                if !job.can_retry() {
                    let outcome = FetchOutcome {
                        result: FetchResult::PermanentFailure {
                            reason: format!(
                                "retries exhausted after {} attempts: {reason}",
                                job.attempts()
                            ),
                            status: None,
                        },
                        ..outcome
                    };
                    job.last_error = Some(reason);
                    self.finish(job, outcome, run, reporter).await;
                    return Directive::Release;
                }
                job.last_error = Some(reason.clone());
                job.retry_count += 1;
                reporter.report(CoordinatorEvent::JobRetrying {
                    job: &job,
                    reason: &reason,
                    delay: Duration::ZERO,
                    renew_circuit: true,
                });
                self.requeue(job, Duration::ZERO, run, reporter).await;
                return Directive::Renew;
            }
        }

        match outcome.result {
            FetchResult::RetryableFailure {
                ref reason,
                status,
                renew_circuit,
            } => {
                let reason = reason.clone();
                if let Some(halt) = run.halt {
                    let outcome = FetchOutcome {
                        result: FetchResult::Interrupted {
                            reason: format!("{}; last error: {reason}", halt_message(halt)),
                        },
                        ..outcome
                    };
                    self.finish(job, outcome, run, reporter).await;
                    return Directive::Release;
                }

                job.last_error = Some(reason.clone());
                if !job.can_retry() {
                    let outcome = FetchOutcome {
                        result: FetchResult::PermanentFailure {
                            reason: format!(
                                "retries exhausted after {} attempts: {reason}",
                                job.attempts()
                            ),
                            status,
                        },
                        ..outcome
                    };
                    self.finish(job, outcome, run, reporter).await;
                    return Directive::Release;
                }

                job.retry_count += 1;
                let delay = job.next_retry_delay(&self.retry_config);
                reporter.report(CoordinatorEvent::JobRetrying {
                    job: &job,
                    reason: &reason,
                    delay,
                    renew_circuit,
                });
                self.requeue(job, delay, run, reporter).await;
                if renew_circuit {
                    Directive::Renew
                } else {
                    Directive::Release
                }
            }
            _ => {
                self.finish(job, outcome, run, reporter).await;
                Directive::Release
            }
        }
    }

    async fn requeue<R: CoordinatorReporter>(
        &mut self,
        mut job: ScrapeJob,
        delay: Duration,
        run: &mut RunState,
        reporter: &R,
    ) {
        job.status = JobStatus::Pending;
        if let Err(e) = self.queue.requeue(job.clone(), delay) {
            let outcome = FetchOutcome::interrupted(job.id, job.retry_count, e.to_string());
            self.finish(job, outcome, run, reporter).await;
        }
    }

    /// Stop assignments and report every queued job as interrupted.
    async fn halt<R: CoordinatorReporter>(
        &mut self,
        reason: HaltReason,
        run: &mut RunState,
        reporter: &R,
    ) {
        run.halt = Some(reason);
        reporter.report(CoordinatorEvent::Halted { reason });
        self.queue.close();
        self.pool.close();

        for job in self.queue.drain() {
            let outcome = FetchOutcome::interrupted(job.id, job.retry_count, halt_message(reason));
            self.finish(job, outcome, run, reporter).await;
        }
    }

    /// Deliver a terminal outcome to the sink, exactly once per job.
    async fn finish<R: CoordinatorReporter>(
        &mut self,
        mut job: ScrapeJob,
        outcome: FetchOutcome,
        run: &mut RunState,
        reporter: &R,
    ) {
        if let Some(status) = outcome.result.terminal_status() {
            job.status = status;
        }
        match &outcome.result {
            FetchResult::Success { status, payload } => {
                reporter.report(CoordinatorEvent::JobSucceeded {
                    job: &job,
                    status: *status,
                    bytes: payload.len(),
                });
            }
            FetchResult::PermanentFailure { reason, .. } => {
                reporter.report(CoordinatorEvent::JobFailed {
                    job: &job,
                    reason,
                });
            }
            FetchResult::Interrupted { reason } => {
                reporter.report(CoordinatorEvent::JobInterrupted {
                    job: &job,
                    reason,
                });
            }
            FetchResult::RetryableFailure { .. } => {}
        }

        run.summary.record(&outcome.result);
        run.outstanding = run.outstanding.saturating_sub(1);

        if let Err(e) = self.sink.record(&job, &outcome).await {
            tracing::error!(job_id = %job.id, error = %e, "Result sink failed to record outcome");
        }
    }
}

#[derive(Default)]
struct RunState {
    outstanding: usize,
    halt: Option<HaltReason>,
    summary: RunSummary,
}

fn halt_message(reason: HaltReason) -> &'static str {
    match reason {
        HaltReason::PoolExhausted => "circuit pool exhausted",
        HaltReason::Shutdown => "shutdown requested",
    }
}

fn periodic(period: Duration) -> Interval {
    tokio::time::interval_at(Instant::now() + period, period)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// One execution lane: pop, check out, fetch, report, then renew or release.
async fn run_lane<C, T>(
    lane: usize,
    queue: JobQueue,
    pool: CircuitPool<C>,
    worker: FetchWorker<T>,
    tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
) where
    C: TorControl,
    T: Transport,
{
    tracing::debug!(%lane, "Lane started");

    while let Some(mut job) = queue.pop().await {
        let acquired = tokio::select! {
            acquired = pool.acquire() => acquired,
            () = cancel.cancelled() => Err(AppError::PoolClosed),
        };
        let mut handle = match acquired {
            Ok(handle) => handle,
            Err(error) => {
                if tx.send(Message::Unassigned { job, error }).is_err() {
                    break;
                }
                continue;
            }
        };

        job.status = JobStatus::Assigned;
        tracing::debug!(
            %lane,
            job_id = %job.id,
            slot = handle.slot(),
            generation = handle.generation(),
            "Job assigned"
        );

        if handle.health() == CircuitHealth::Fresh {
            tokio::select! {
                _ = worker.probe_identity(&handle) => {}
                () = cancel.cancelled() => {}
            }
        }
        let outcome = worker.execute(&job, &handle, &cancel).await;
        handle.mark_used();

        let (reply, directive) = oneshot::channel();
        if tx.send(Message::Outcome { job, outcome, reply }).is_err() {
            pool.release(handle);
            break;
        }

        match directive.await.unwrap_or(Directive::Release) {
            Directive::Release => pool.release(handle),
            Directive::Renew => {
                let slot = handle.slot();
                let renewed = tokio::select! {
                    result = pool.renew(&mut handle) => Some(result),
                    () = cancel.cancelled() => None,
                };
                pool.release(handle);
                match renewed {
                    Some(result) => {
                        let _ = tx.send(Message::Renewed { slot, result });
                    }
                    None => tracing::debug!(%lane, %slot, "Renewal abandoned on shutdown"),
                }
            }
        }
    }

    tracing::debug!(%lane, "Lane stopped");
}
