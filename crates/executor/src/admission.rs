//! Bounded-concurrency admission gate.
//!
//! Capacity lives in a fair (FIFO) semaphore; a ledger records which slot ids
//! are currently held so that a second release of the same slot, or a release
//! through the wrong controller, is caught instead of silently accepted.

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    tokio::sync::{OwnedSemaphorePermit, Semaphore},
    tracing::{debug, warn},
};

use crate::error::IntegrityError;

static NEXT_CONTROLLER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("no sandbox slot became available within {0:?}")]
    Timeout(Duration),
    #[error("admission controller is closed")]
    Closed,
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

#[derive(Debug)]
struct SlotLedger {
    controller: u64,
    max: usize,
    next_slot: AtomicU64,
    held: Mutex<HashSet<u64>>,
}

impl SlotLedger {
    fn record(&self) -> Result<u64, IntegrityError> {
        let id = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.len() >= self.max {
            return Err(IntegrityError::CapacityExceeded {
                held: held.len() + 1,
                max: self.max,
            });
        }
        held.insert(id);
        Ok(id)
    }

    fn release(&self, slot: u64) -> Result<(), IntegrityError> {
        let removed = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&slot);
        if removed {
            Ok(())
        } else {
            Err(IntegrityError::DoubleRelease { slot })
        }
    }

    fn held(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// One unit of execution capacity.
///
/// Hand it back with [`AdmissionController::release`]. A slot that is dropped
/// instead (cancelled task, panic) returns its capacity on drop.
#[must_use = "a slot holds capacity until it is released"]
#[derive(Debug)]
pub struct Slot {
    id: u64,
    ledger: Arc<SlotLedger>,
    permit: Option<OwnedSemaphorePermit>,
    granted_at: Instant,
}

impl Slot {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Time since the slot was granted.
    pub fn held_for(&self) -> Duration {
        self.granted_at.elapsed()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.permit.is_none() {
            return;
        }
        debug!(slot = self.id, "slot dropped without explicit release");
        if let Err(error) = self.ledger.release(self.id) {
            warn!(%error, "slot ledger out of sync on drop");
        }
    }
}

/// Fixed-size, FIFO slot pool.
#[derive(Debug)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    ledger: Arc<SlotLedger>,
}

impl AdmissionController {
    /// Create a pool of `max_concurrent` slots (at least one).
    pub fn new(max_concurrent: usize) -> Self {
        let max = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            ledger: Arc::new(SlotLedger {
                controller: NEXT_CONTROLLER_ID.fetch_add(1, Ordering::Relaxed),
                max,
                next_slot: AtomicU64::new(1),
                held: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Wait for a slot, in submission order.
    ///
    /// With a `timeout`, a request that is not granted in time is removed from
    /// the queue and fails with [`AdmissionError::Timeout`], holding nothing.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<Slot, AdmissionError> {
        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        let permit = match timeout {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| AdmissionError::Timeout(limit))?,
            None => acquire.await,
        }
        .map_err(|_| AdmissionError::Closed)?;

        let id = self.ledger.record()?;
        debug!(
            slot = id,
            available = self.semaphore.available_permits(),
            "slot granted"
        );
        Ok(Slot {
            id,
            ledger: Arc::clone(&self.ledger),
            permit: Some(permit),
            granted_at: Instant::now(),
        })
    }

    /// Return a slot to the pool, waking the oldest waiter.
    pub fn release(&self, mut slot: Slot) -> Result<(), IntegrityError> {
        if slot.ledger.controller != self.ledger.controller {
            return Err(IntegrityError::ForeignSlot { slot: slot.id });
        }
        let permit = slot.permit.take();
        let result = self.ledger.release(slot.id);
        drop(permit);
        if result.is_ok() {
            debug!(slot = slot.id, held_ms = slot.held_for().as_millis() as u64, "slot released");
        }
        result
    }

    /// Fail all pending and future `acquire` calls.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn max_concurrent(&self) -> usize {
        self.ledger.max
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn held(&self) -> usize {
        self.ledger.held()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn test_acquire_release_counts() {
        let controller = AdmissionController::new(2);
        let a = controller.acquire(None).await.unwrap();
        let b = controller.acquire(None).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(controller.held(), 2);
        assert_eq!(controller.available(), 0);

        controller.release(a).unwrap();
        assert_eq!(controller.available(), 1);
        controller.release(b).unwrap();
        assert_eq!(controller.held(), 0);
        assert_eq!(controller.available(), 2);
    }

    #[test]
    fn test_zero_pool_is_clamped() {
        assert_eq!(AdmissionController::new(0).max_concurrent(), 1);
    }

    #[tokio::test]
    async fn test_grants_are_fifo() {
        let controller = Arc::new(AdmissionController::new(1));
        let order = Arc::new(Mutex::new(Vec::new()));
        let blocker = controller.acquire(None).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let controller = Arc::clone(&controller);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let slot = controller.acquire(None).await.unwrap();
                order.lock().unwrap().push(i);
                controller.release(slot).unwrap();
            }));
            // Let the task reach the queue before spawning the next one.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        controller.release(blocker).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_admission_timeout_holds_nothing() {
        let controller = AdmissionController::new(1);
        let slot = controller.acquire(None).await.unwrap();

        let err = controller
            .acquire(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Timeout(_)));
        assert_eq!(controller.held(), 1);

        controller.release(slot).unwrap();
        assert_eq!(controller.available(), 1);
        let again = controller
            .acquire(Some(Duration::from_millis(50)))
            .await
            .unwrap();
        controller.release(again).unwrap();
    }

    #[tokio::test]
    async fn test_double_release_is_detected_without_over_granting() {
        let controller = AdmissionController::new(1);
        let slot = controller.acquire(None).await.unwrap();
        let id = slot.id();

        controller.ledger.release(id).unwrap();
        let err = controller.release(slot).unwrap_err();
        assert_eq!(err, IntegrityError::DoubleRelease { slot: id });
        assert_eq!(controller.available(), 1);
        assert!(controller.ledger.release(id).is_err());
    }

    #[tokio::test]
    async fn test_foreign_slot_is_rejected() {
        let first = AdmissionController::new(1);
        let second = AdmissionController::new(1);
        let slot = first.acquire(None).await.unwrap();
        let id = slot.id();

        let err = second.release(slot).unwrap_err();
        assert_eq!(err, IntegrityError::ForeignSlot { slot: id });
        // The slot went back to its own pool when it was dropped.
        assert_eq!(first.available(), 1);
        assert_eq!(first.held(), 0);
        assert_eq!(second.available(), 1);
    }

    #[tokio::test]
    async fn test_dropped_slot_returns_capacity() {
        let controller = AdmissionController::new(1);
        {
            let _slot = controller.acquire(None).await.unwrap();
            assert_eq!(controller.available(), 0);
        }
        assert_eq!(controller.available(), 1);
        assert_eq!(controller.held(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let controller = Arc::new(AdmissionController::new(1));
        let slot = controller.acquire(None).await.unwrap();
        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.acquire(None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.close();
        assert!(matches!(waiter.await.unwrap(), Err(AdmissionError::Closed)));
        controller.release(slot).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_held_never_exceeds_pool() {
        let controller = Arc::new(AdmissionController::new(3));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let controller = Arc::clone(&controller);
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    let slot = controller.acquire(None).await.unwrap();
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    controller.release(slot).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(controller.available(), 3);
    }
}
