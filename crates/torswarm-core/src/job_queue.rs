use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::AppError;
use crate::job::ScrapeJob;

/// A job waiting out its backoff before it rejoins the queue.
struct Delayed {
    due: Instant,
    seq: u64,
    job: ScrapeJob,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the max-heap yields the earliest due job first.
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<ScrapeJob>,
    delayed: BinaryHeap<Delayed>,
    closed: bool,
    seq: u64,
}

impl QueueState {
    /// Move every job whose backoff has elapsed to the tail, in due order.
    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.due <= now) {
            if let Some(delayed) = self.delayed.pop() {
                self.ready.push_back(delayed.job);
            }
        }
    }
}

/// In-memory FIFO of scrape jobs with a delayed requeue path.
///
/// Retried jobs always rejoin at the tail once their backoff elapses, so a
/// failing job cannot monopolize a circuit. Cloning shares the same queue.
#[derive(Clone, Default)]
pub struct JobQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jobs(jobs: impl IntoIterator<Item = ScrapeJob>) -> Self {
        let queue = Self::new();
        queue.lock_state().ready.extend(jobs);
        queue
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned job queue mutex");
            poisoned.into_inner()
        })
    }

    /// Append a job to the tail.
    pub fn push(&self, job: ScrapeJob) -> Result<(), AppError> {
        {
            let mut state = self.lock_state();
            if state.closed {
                return Err(AppError::QueueClosed);
            }
            state.ready.push_back(job);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Append a job to the tail once `delay` has elapsed.
    pub fn requeue(&self, job: ScrapeJob, delay: Duration) -> Result<(), AppError> {
        if delay.is_zero() {
            return self.push(job);
        }
        {
            let mut state = self.lock_state();
            if state.closed {
                return Err(AppError::QueueClosed);
            }
            state.seq += 1;
            let seq = state.seq;
            state.delayed.push(Delayed {
                due: Instant::now() + delay,
                seq,
                job,
            });
        }
        // Waiters recompute their deadline against the new entry.
        self.notify.notify_waiters();
        Ok(())
    }

    /// Wait for the next ready job. Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<ScrapeJob> {
        loop {
            let (notified, next_due) = {
                let mut state = self.lock_state();
                if state.closed {
                    return None;
                }
                state.promote_due(Instant::now());
                if let Some(job) = state.ready.pop_front() {
                    return Some(job);
                }
                let mut notified = Box::pin(self.notify.notified());
                notified.as_mut().enable();
                (notified, state.delayed.peek().map(|d| d.due))
            };

            match next_due {
                Some(due) => {
                    tokio::select! {
                        () = notified => {}
                        () = tokio::time::sleep_until(due) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Stop accepting and handing out jobs; waiting `pop` calls return `None`.
    pub fn close(&self) {
        self.lock_state().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Remove every remaining job, ready ones first, then delayed by due time.
    pub fn drain(&self) -> Vec<ScrapeJob> {
        let mut state = self.lock_state();
        let mut jobs: Vec<_> = state.ready.drain(..).collect();
        let mut delayed = std::mem::take(&mut state.delayed).into_sorted_vec();
        // into_sorted_vec is ascending by Ord, which is reversed due order.
        delayed.reverse();
        jobs.extend(delayed.into_iter().map(|d| d.job));
        jobs
    }

    /// Jobs ready to be popped right now.
    pub fn ready_len(&self) -> usize {
        self.lock_state().ready.len()
    }

    /// Jobs waiting out a backoff.
    pub fn delayed_len(&self) -> usize {
        self.lock_state().delayed.len()
    }

    pub fn len(&self) -> usize {
        let state = self.lock_state();
        state.ready.len() + state.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
