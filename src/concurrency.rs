//! Concurrency slots for limiting in-flight extraction jobs.
//!
//! A document must hold a slot from the [`ConcurrencyGate`] from the moment it
//! is submitted until its job reaches a terminal state (or is sent back to
//! Pending for a retry).
//!
//! # Key Invariants
//!
//! - At most `max_in_flight` slots are held at any time. Enforced by a fair
//!   semaphore sized to the limit.
//! - Every grant is paired with exactly one release. A granted slot is a
//!   [`Slot`] value; releasing consumes it and dropping it releases it, so a
//!   slot can neither leak nor be returned twice.
//! - Waiters are woken in FIFO order, so documents that asked first are
//!   admitted first even in a large batch.
//! - A cancelled or timed out acquisition is never counted as granted.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("timed out waiting for a concurrency slot")]
    TimedOut,
    #[error("holder {0} already holds a concurrency slot")]
    AlreadyHeld(String),
    #[error("concurrency gate closed")]
    Closed,
}

/// A held concurrency slot. Returned to the gate when released or dropped.
#[derive(Debug)]
pub struct Slot {
    holder: String,
    holders: Arc<Mutex<HashSet<String>>>,
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        // The permit field is dropped after this runs, so the holder set never
        // lists more holders than there are outstanding permits.
        self.holders.lock().unwrap().remove(&self.holder);
    }
}

/// Outcome of re-reserving slots for recovered in-flight jobs.
#[derive(Debug, Default)]
pub struct HydrateOutcome {
    pub restored: Vec<Slot>,
    /// Holders that could not be given a slot because the gate is full
    pub over_capacity: Vec<String>,
}

pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
    holders: Arc<Mutex<HashSet<String>>>,
}

impl std::fmt::Debug for ConcurrencyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (in_flight, max) = self.current_load();
        f.debug_struct("ConcurrencyGate")
            .field("in_flight", &in_flight)
            .field("max_in_flight", &max)
            .finish()
    }
}

impl ConcurrencyGate {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            holders: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn check_not_held(&self, holder: &str) -> Result<(), SlotError> {
        if self.holders.lock().unwrap().contains(holder) {
            return Err(SlotError::AlreadyHeld(holder.to_string()));
        }
        Ok(())
    }

    fn register(&self, holder: &str, permit: OwnedSemaphorePermit) -> Result<Slot, SlotError> {
        // A concurrent acquisition for the same holder may have won the race
        // since the pre-check; the permit is dropped (returned) in that case.
        if !self.holders.lock().unwrap().insert(holder.to_string()) {
            return Err(SlotError::AlreadyHeld(holder.to_string()));
        }
        Ok(Slot {
            holder: holder.to_string(),
            holders: Arc::clone(&self.holders),
            _permit: permit,
        })
    }

    /// Wait for a free slot until `deadline`. The wait is cooperative and
    /// cancel-safe: dropping the future gives up the place in the queue
    /// without taking a slot.
    pub async fn acquire_slot(&self, holder: &str, deadline: Instant) -> Result<Slot, SlotError> {
        self.check_not_held(holder)?;
        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        match tokio::time::timeout_at(deadline, acquire).await {
            Ok(Ok(permit)) => self.register(holder, permit),
            Ok(Err(_)) => Err(SlotError::Closed),
            Err(_) => Err(SlotError::TimedOut),
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire_slot(&self, holder: &str) -> Result<Slot, SlotError> {
        self.check_not_held(holder)?;
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => self.register(holder, permit),
            Err(TryAcquireError::NoPermits) => Err(SlotError::TimedOut),
            Err(TryAcquireError::Closed) => Err(SlotError::Closed),
        }
    }

    /// Return a slot to the gate, waking the longest waiter if any.
    pub fn release_slot(&self, slot: Slot) {
        tracing::trace!(holder = %slot.holder, "releasing concurrency slot");
        drop(slot);
    }

    /// `(in_flight, max_in_flight)`
    pub fn current_load(&self) -> (usize, usize) {
        let in_flight = self.max_in_flight - self.semaphore.available_permits();
        (in_flight, self.max_in_flight)
    }

    /// Re-reserve slots for jobs that were already in flight before a restart.
    ///
    /// Never waits: those jobs are already running at the provider, so a holder
    /// that does not fit (limit lowered across the restart) is reported rather
    /// than queued.
    pub fn hydrate<I>(&self, holders: I) -> HydrateOutcome
    where
        I: IntoIterator<Item = String>,
    {
        let mut outcome = HydrateOutcome::default();
        for holder in holders {
            match self.try_acquire_slot(&holder) {
                Ok(slot) => outcome.restored.push(slot),
                Err(SlotError::AlreadyHeld(_)) => {}
                Err(_) => {
                    tracing::warn!(
                        holder = %holder,
                        max_in_flight = self.max_in_flight,
                        "recovered in-flight job exceeds concurrency limit"
                    );
                    outcome.over_capacity.push(holder);
                }
            }
        }
        outcome
    }

    /// Close the gate; pending and future acquisitions fail with `Closed`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
