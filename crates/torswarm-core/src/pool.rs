//! Fixed-size pool of Tor circuits.
//!
//! # Slot lifecycle
//!
//! ```text
//! UNOPENED --acquire--> CHECKED_OUT --release--> AVAILABLE --acquire--> CHECKED_OUT
//!                            |                                              |
//!                            +--renew fails--> EXHAUSTED --restore--> ------+
//! ```
//!
//! Handles are moved out on [`CircuitPool::acquire`] and back on
//! [`CircuitPool::release`]. The pool lock only guards bookkeeping; every
//! call into Tor happens on a handle the caller owns, so renewing one circuit
//! never blocks checkout of another.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::sync::futures::Notified;

use crate::circuit::{CircuitHandle, CircuitHealth};
use crate::error::AppError;
use crate::traits::{ControlSession, TorControl};

/// Configuration for the circuit pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of circuits (slots).
    pub size: usize,

    /// Attempts at building a usable circuit before a slot is exhausted.
    pub renewal_attempts: u32,

    /// Time allowed per attempt for the new circuit to report usable.
    pub renewal_timeout: Duration,

    /// Delay between "is the circuit usable" polls.
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            renewal_attempts: 3,
            renewal_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotPhase {
    Unopened,
    Opening,
    Available,
    CheckedOut,
    Exhausted,
}

#[derive(Debug, Clone, Copy)]
struct SlotState {
    generation: u64,
    health: CircuitHealth,
    phase: SlotPhase,
    has_session: bool,
    /// Rotate once the checked-out handle comes back.
    rotation_pending: bool,
}

struct PoolState<S> {
    slots: Vec<SlotState>,
    available: VecDeque<CircuitHandle<S>>,
    exhausted: Vec<CircuitHandle<S>>,
    closed: bool,
}

impl<S> PoolState<S> {
    fn all_exhausted(&self) -> bool {
        self.slots.iter().all(|s| s.phase == SlotPhase::Exhausted)
    }
}

struct PoolShared<C: TorControl> {
    control: C,
    config: PoolConfig,
    state: Mutex<PoolState<C::Session>>,
    notify: Notify,
    renewals: AtomicU64,
}

/// Snapshot of pool occupancy for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub checked_out: usize,
    pub exhausted: usize,
    pub unopened: usize,
    pub renewals: u64,
}

enum AcquireStep<'a, S> {
    Ready(CircuitHandle<S>),
    Renew(CircuitHandle<S>),
    Open(usize),
    Wait(Pin<Box<Notified<'a>>>),
}

/// Thread-safe pool of circuit handles. Cloning shares the same pool.
pub struct CircuitPool<C: TorControl> {
    shared: Arc<PoolShared<C>>,
}

impl<C: TorControl> Clone for CircuitPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: TorControl> CircuitPool<C> {
    /// Create a pool. Sessions are opened lazily on first `acquire`.
    pub fn new(control: C, config: PoolConfig) -> Self {
        let slots = (0..config.size)
            .map(|_| SlotState {
                generation: 0,
                health: CircuitHealth::Fresh,
                phase: SlotPhase::Unopened,
                has_session: false,
                rotation_pending: false,
            })
            .collect();
        let state = PoolState {
            slots,
            available: VecDeque::with_capacity(config.size),
            exhausted: Vec::new(),
            closed: false,
        };
        Self {
            shared: Arc::new(PoolShared {
                control,
                config,
                state: Mutex::new(state),
                notify: Notify::new(),
                renewals: AtomicU64::new(0),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.config.size
    }

    /// Acquires the state lock, recovering from poison if necessary.
    fn lock_state(&self) -> MutexGuard<'_, PoolState<C::Session>> {
        self.shared.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned circuit pool mutex");
            poisoned.into_inner()
        })
    }

    /// Check out a circuit, waiting until one is available.
    ///
    /// Fails with [`AppError::PoolClosed`] once the pool is closed and with
    /// [`AppError::PoolExhausted`] once every slot is exhausted.
    pub async fn acquire(&self) -> Result<CircuitHandle<C::Session>, AppError> {
        loop {
            let step = {
                let mut state = self.lock_state();
                if state.closed {
                    return Err(AppError::PoolClosed);
                }
                if state.all_exhausted() {
                    return Err(AppError::PoolExhausted);
                }

                if let Some(mut handle) = state.available.pop_front() {
                    let slot = &mut state.slots[handle.slot];
                    slot.phase = SlotPhase::CheckedOut;
                    handle.health = slot.health;
                    if handle.generation < slot.generation {
                        AcquireStep::Renew(handle)
                    } else {
                        AcquireStep::Ready(handle)
                    }
                } else if let Some(idx) = state
                    .slots
                    .iter()
                    .position(|s| s.phase == SlotPhase::Unopened)
                {
                    state.slots[idx].phase = SlotPhase::Opening;
                    AcquireStep::Open(idx)
                } else {
                    let mut notified = Box::pin(self.shared.notify.notified());
                    notified.as_mut().enable();
                    AcquireStep::Wait(notified)
                }
            };

            match step {
                AcquireStep::Ready(handle) => return Ok(handle),
                AcquireStep::Renew(mut handle) => {
                    tracing::debug!(slot = handle.slot, "Renewing rotated circuit before checkout");
                    match self.renew(&mut handle).await {
                        Ok(_) => return Ok(handle),
                        Err(_) => self.release(handle),
                    }
                }
                AcquireStep::Open(slot) => {
                    if let Ok(handle) = self.open_slot(slot).await {
                        if self.lock_state().closed {
                            self.release(handle);
                            return Err(AppError::PoolClosed);
                        }
                        return Ok(handle);
                    }
                }
                AcquireStep::Wait(notified) => notified.await,
            }
        }
    }

    /// Return a checked-out handle, preserving its health.
    ///
    /// Exhausted handles are parked out of rotation until
    /// [`restore_exhausted`](Self::restore_exhausted) recovers them.
    pub fn release(&self, handle: CircuitHandle<C::Session>) {
        let mut state = self.lock_state();
        let slot = &mut state.slots[handle.slot];
        slot.health = handle.health;
        let rotate = std::mem::take(&mut slot.rotation_pending);
        if rotate && handle.health != CircuitHealth::Exhausted {
            slot.generation += 1;
        }
        if handle.health == CircuitHealth::Exhausted {
            slot.phase = SlotPhase::Exhausted;
            state.exhausted.push(handle);
        } else {
            slot.phase = SlotPhase::Available;
            state.available.push_back(handle);
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }

    /// Build a fresh circuit (new exit node) for a checked-out handle.
    ///
    /// Returns the new generation number. After `renewal_attempts` failures
    /// the handle is marked [`CircuitHealth::Exhausted`].
    pub async fn renew(&self, handle: &mut CircuitHandle<C::Session>) -> Result<u64, AppError> {
        handle.health = CircuitHealth::Renewing;
        self.lock_state().slots[handle.slot].health = CircuitHealth::Renewing;

        let attempts = self.shared.config.renewal_attempts;
        for attempt in 1..=attempts {
            match self.rebuild(&mut handle.session).await {
                Ok(()) => {
                    let generation = {
                        let mut state = self.lock_state();
                        let slot = &mut state.slots[handle.slot];
                        slot.generation += 1;
                        slot.health = CircuitHealth::Fresh;
                        slot.rotation_pending = false;
                        slot.generation
                    };
                    handle.generation = generation;
                    handle.health = CircuitHealth::Fresh;
                    self.shared.renewals.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        slot = handle.slot,
                        generation,
                        endpoint = %handle.endpoint,
                        "Circuit renewed"
                    );
                    return Ok(generation);
                }
                Err(e) => {
                    tracing::warn!(
                        slot = handle.slot,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Circuit renewal attempt failed"
                    );
                }
            }
        }

        handle.health = CircuitHealth::Exhausted;
        self.lock_state().slots[handle.slot].health = CircuitHealth::Exhausted;
        tracing::error!(slot = handle.slot, attempts, "Circuit exhausted");
        Err(AppError::CircuitExhausted {
            slot: handle.slot,
            attempts,
        })
    }

    /// Invalidate a slot's identity right away.
    ///
    /// Outcomes of fetches already running on the slot become stale, and the
    /// handle is renewed before it serves another fetch.
    pub fn request_rotation(&self, slot: usize) -> Option<u64> {
        let mut state = self.lock_state();
        let slot = state.slots.get_mut(slot)?;
        if !slot.has_session || slot.phase == SlotPhase::Exhausted {
            return None;
        }
        slot.generation += 1;
        Some(slot.generation)
    }

    /// Rotate a slot's identity without invalidating a fetch in progress.
    ///
    /// An idle slot is renewed on its next checkout. A checked-out slot is
    /// marked and rotated when its handle is released, so the running fetch
    /// still reports under the generation it started with.
    pub fn schedule_rotation(&self, slot: usize) -> bool {
        let mut state = self.lock_state();
        let Some(slot) = state.slots.get_mut(slot) else {
            return false;
        };
        if !slot.has_session {
            return false;
        }
        match slot.phase {
            SlotPhase::Available => slot.generation += 1,
            SlotPhase::CheckedOut | SlotPhase::Opening => slot.rotation_pending = true,
            SlotPhase::Unopened | SlotPhase::Exhausted => return false,
        }
        true
    }

    /// [`schedule_rotation`](Self::schedule_rotation) for every live slot.
    pub fn rotate_all(&self) -> usize {
        (0..self.size())
            .filter(|&slot| self.schedule_rotation(slot))
            .count()
    }

    pub fn current_generation(&self, slot: usize) -> u64 {
        self.lock_state()
            .slots
            .get(slot)
            .map(|s| s.generation)
            .unwrap_or(0)
    }

    /// Whether the pool has moved past the generation this handle carries.
    pub fn is_stale(&self, handle: &CircuitHandle<C::Session>) -> bool {
        handle.generation < self.current_generation(handle.slot)
    }

    pub fn is_exhausted(&self) -> bool {
        self.lock_state().all_exhausted()
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Total successful renewals since the pool was created.
    pub fn renewals_performed(&self) -> u64 {
        self.shared.renewals.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        let count = |phase: SlotPhase| state.slots.iter().filter(|s| s.phase == phase).count();
        PoolStats {
            size: state.slots.len(),
            available: count(SlotPhase::Available),
            checked_out: count(SlotPhase::CheckedOut) + count(SlotPhase::Opening),
            exhausted: count(SlotPhase::Exhausted),
            unopened: count(SlotPhase::Unopened),
            renewals: self.renewals_performed(),
        }
    }

    /// Health check: try to bring exhausted slots back into rotation.
    ///
    /// Returns the number of slots restored.
    pub async fn restore_exhausted(&self) -> usize {
        let (handles, unopened) = {
            let mut state = self.lock_state();
            if state.closed {
                return 0;
            }
            let handles: Vec<_> = state.exhausted.drain(..).collect();
            for handle in &handles {
                state.slots[handle.slot].phase = SlotPhase::CheckedOut;
            }
            let unopened: Vec<usize> = state
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.phase == SlotPhase::Exhausted && !s.has_session)
                .map(|(idx, _)| idx)
                .collect();
            for &idx in &unopened {
                state.slots[idx].phase = SlotPhase::Opening;
            }
            (handles, unopened)
        };

        let mut restored = 0;
        for mut handle in handles {
            if self.renew(&mut handle).await.is_ok() {
                restored += 1;
            }
            self.release(handle);
        }
        for slot in unopened {
            if let Ok(handle) = self.open_slot(slot).await {
                restored += 1;
                self.release(handle);
            }
        }

        if restored > 0 {
            tracing::info!(restored, "Exhausted circuits restored");
        }
        restored
    }

    /// Stop handing out circuits. Waiting `acquire` calls fail with `PoolClosed`.
    pub fn close(&self) {
        self.lock_state().closed = true;
        self.shared.notify.notify_waiters();
    }

    /// Close the pool and tear down every control session it holds.
    ///
    /// Handles still checked out are not touched; release them first.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = {
            let mut state = self.lock_state();
            state.closed = true;
            let mut handles: Vec<_> = state.available.drain(..).collect();
            handles.append(&mut state.exhausted);
            handles
        };
        self.shared.notify.notify_waiters();

        for handle in handles {
            let slot = handle.slot;
            if let Err(e) = handle.session.close().await {
                tracing::warn!(slot, error = %e, "Failed to close control session");
            }
        }
        tracing::debug!("Circuit pool shut down");
    }

    async fn open_slot(&self, slot: usize) -> Result<CircuitHandle<C::Session>, AppError> {
        let attempts = self.shared.config.renewal_attempts;
        for attempt in 1..=attempts {
            match self.shared.control.open_session(slot).await {
                Ok(mut session) => {
                    if let Err(e) = self.wait_until_usable(&mut session).await {
                        tracing::warn!(slot, attempt, error = %e, "New circuit never became usable");
                        if let Err(e) = session.close().await {
                            tracing::debug!(slot, error = %e, "Failed to close control session");
                        }
                        continue;
                    }
                    let endpoint = session.endpoint().clone();
                    let generation = {
                        let mut state = self.lock_state();
                        let state_slot = &mut state.slots[slot];
                        state_slot.generation += 1;
                        state_slot.health = CircuitHealth::Fresh;
                        state_slot.phase = SlotPhase::CheckedOut;
                        state_slot.has_session = true;
                        state_slot.generation
                    };
                    tracing::info!(slot, generation, %endpoint, "Circuit opened");
                    let mut handle = CircuitHandle::new(slot, endpoint, session);
                    handle.generation = generation;
                    return Ok(handle);
                }
                Err(e) => {
                    tracing::warn!(slot, attempt, error = %e, "Failed to open control session");
                }
            }
        }

        {
            let mut state = self.lock_state();
            let state_slot = &mut state.slots[slot];
            state_slot.phase = SlotPhase::Exhausted;
            state_slot.health = CircuitHealth::Exhausted;
        }
        self.shared.notify.notify_waiters();
        tracing::error!(slot, attempts, "Circuit exhausted before first use");
        Err(AppError::CircuitExhausted { slot, attempts })
    }

    async fn rebuild(&self, session: &mut C::Session) -> Result<(), AppError> {
        session.new_circuit().await?;
        self.wait_until_usable(session).await
    }

    async fn wait_until_usable(&self, session: &mut C::Session) -> Result<(), AppError> {
        let timeout = self.shared.config.renewal_timeout;
        let poll_interval = self.shared.config.poll_interval;
        let wait = async {
            loop {
                if session.circuit_usable().await? {
                    return Ok::<(), AppError>(());
                }
                tokio::time::sleep(poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            AppError::Control(format!(
                "circuit not usable after {} ms",
                timeout.as_millis()
            ))
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockTorControl;

    fn config(size: usize) -> PoolConfig {
        PoolConfig {
            size,
            renewal_attempts: 2,
            renewal_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_sessions_open_lazily() {
        let control = MockTorControl::new();
        let pool = CircuitPool::new(control.clone(), config(3));
        assert_eq!(control.opened(), 0);
        assert_eq!(pool.stats().unopened, 3);

        let handle = pool.acquire().await.unwrap();
        assert_eq!(control.opened(), 1);
        assert_eq!(handle.slot(), 0);
        assert_eq!(handle.generation(), 1);
        assert_eq!(handle.health(), CircuitHealth::Fresh);
        assert_eq!(handle.endpoint().port, 9250);

        pool.release(handle);
        let again = pool.acquire().await.unwrap();
        assert_eq!(again.slot(), 0, "released handle is reused before opening new slots");
        assert_eq!(control.opened(), 1);
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let pool = CircuitPool::new(MockTorControl::new(), config(1));
        let handle = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|h| h.slot()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(handle);
        let slot = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(slot, 0);
    }

    #[tokio::test]
    async fn test_checked_out_never_exceeds_size() {
        let pool = CircuitPool::new(MockTorControl::new(), config(2));
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.slot(), b.slot());
        assert_eq!(pool.stats().checked_out, 2);

        let third = tokio::time::timeout(Duration::from_millis(30), pool.acquire()).await;
        assert!(third.is_err(), "third acquire must wait");

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.stats().checked_out, 0);
        assert_eq!(pool.stats().available, 2);
    }

    #[tokio::test]
    async fn test_renew_increments_generation() {
        let control = MockTorControl::new();
        let pool = CircuitPool::new(control.clone(), config(1));
        let mut handle = pool.acquire().await.unwrap();
        handle.mark_used();

        let first = handle.generation();
        let second = pool.renew(&mut handle).await.unwrap();
        let third = pool.renew(&mut handle).await.unwrap();

        assert!(second > first);
        assert!(third > second);
        assert_eq!(handle.health(), CircuitHealth::Fresh);
        assert_eq!(pool.current_generation(0), third);
        assert_eq!(pool.renewals_performed(), 2);
        assert_eq!(control.new_circuit_requests(), 2);
    }

    #[tokio::test]
    async fn test_renew_failure_exhausts_handle() {
        let control = MockTorControl::new().failing_renewals();
        let pool = CircuitPool::new(control.clone(), config(2));
        let mut handle = pool.acquire().await.unwrap();

        let err = pool.renew(&mut handle).await.unwrap_err();
        assert!(matches!(err, AppError::CircuitExhausted { slot: 0, attempts: 2 }));
        assert_eq!(handle.health(), CircuitHealth::Exhausted);
        assert_eq!(control.new_circuit_requests(), 2);

        pool.release(handle);
        assert_eq!(pool.stats().exhausted, 1);
        assert!(!pool.is_exhausted());

        let other = pool.acquire().await.unwrap();
        assert_eq!(other.slot(), 1, "exhausted slot is out of rotation");
    }

    #[tokio::test]
    async fn test_acquire_fails_when_all_exhausted() {
        let control = MockTorControl::new().failing_renewals();
        let pool = CircuitPool::new(control, config(1));
        let mut handle = pool.acquire().await.unwrap();
        let _ = pool.renew(&mut handle).await;
        pool.release(handle);

        assert!(pool.is_exhausted());
        assert!(matches!(pool.acquire().await, Err(AppError::PoolExhausted)));
    }

    #[tokio::test]
    async fn test_waiting_acquire_wakes_on_exhaustion() {
        let control = MockTorControl::new().failing_renewals();
        let pool = CircuitPool::new(control, config(1));
        let mut handle = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|h| h.slot()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let _ = pool.renew(&mut handle).await;
        pool.release(handle);

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(AppError::PoolExhausted)));
    }

    #[tokio::test]
    async fn test_open_failure_marks_slot_exhausted() {
        let control = MockTorControl::new().failing_open(0);
        let pool = CircuitPool::new(control, config(2));

        let handle = pool.acquire().await.unwrap();
        assert_eq!(handle.slot(), 1);
        assert_eq!(pool.stats().exhausted, 1);
    }

    #[tokio::test]
    async fn test_restore_exhausted_brings_slot_back() {
        let control = MockTorControl::new().failing_renewals();
        let pool = CircuitPool::new(control.clone(), config(1));
        let mut handle = pool.acquire().await.unwrap();
        let _ = pool.renew(&mut handle).await;
        pool.release(handle);
        assert!(pool.is_exhausted());

        control.set_renewals_fail(false);
        assert_eq!(pool.restore_exhausted().await, 1);
        assert!(!pool.is_exhausted());

        let handle = pool.acquire().await.unwrap();
        assert_eq!(handle.health(), CircuitHealth::Fresh);
    }

    #[tokio::test]
    async fn test_rotation_marks_inflight_handle_stale() {
        let pool = CircuitPool::new(MockTorControl::new(), config(1));
        let handle = pool.acquire().await.unwrap();
        assert!(!pool.is_stale(&handle));

        let bumped = pool.request_rotation(0).unwrap();
        assert!(bumped > handle.generation());
        assert!(pool.is_stale(&handle));

        pool.release(handle);
        let renewed = pool.acquire().await.unwrap();
        assert!(renewed.generation() > bumped, "rotated handle is renewed on checkout");
        assert!(!pool.is_stale(&renewed));
    }

    #[tokio::test]
    async fn test_scheduled_rotation_waits_for_release() {
        let control = MockTorControl::new();
        let pool = CircuitPool::new(control.clone(), config(1));
        let handle = pool.acquire().await.unwrap();

        assert!(pool.schedule_rotation(0));
        assert!(!pool.is_stale(&handle), "running fetch keeps its generation");

        pool.release(handle);
        let renewed = pool.acquire().await.unwrap();
        assert_eq!(control.new_circuit_requests(), 1);
        assert!(!pool.is_stale(&renewed));
        pool.release(renewed);

        let again = pool.acquire().await.unwrap();
        assert_eq!(control.new_circuit_requests(), 1, "pending rotation cleared by renewal");
        pool.release(again);
    }

    #[tokio::test]
    async fn test_rotate_all_skips_unopened_slots() {
        let pool = CircuitPool::new(MockTorControl::new(), config(2));
        let handle = pool.acquire().await.unwrap();
        assert_eq!(pool.rotate_all(), 1);
        pool.release(handle);
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails() {
        let pool = CircuitPool::new(MockTorControl::new(), config(1));
        let handle = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|h| h.slot()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.close();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(AppError::PoolClosed)));

        pool.release(handle);
        assert!(matches!(pool.acquire().await, Err(AppError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let control = MockTorControl::new();
        let pool = CircuitPool::new(control.clone(), config(2));
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a);
        pool.release(b);

        pool.shutdown().await;
        assert_eq!(control.closed(), 2);
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(AppError::PoolClosed)));
    }
}
