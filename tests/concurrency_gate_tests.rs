//! Tests for the concurrency gate: capacity, FIFO wake order, deadlines and
//! cancellation, and hydration of recovered holders.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use textract_quota::concurrency::{ConcurrencyGate, SlotError};
use tokio::sync::mpsc;
use tokio::time::Instant;

fn soon() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

#[textract_quota::test]
fn try_acquire_respects_capacity() {
    let gate = ConcurrencyGate::new(2);
    let a = gate.try_acquire_slot("a").unwrap();
    let _b = gate.try_acquire_slot("b").unwrap();
    assert_eq!(gate.current_load(), (2, 2));
    assert_eq!(gate.try_acquire_slot("c").unwrap_err(), SlotError::TimedOut);

    gate.release_slot(a);
    assert_eq!(gate.current_load(), (1, 2));
    assert!(gate.try_acquire_slot("c").is_ok());
}

#[textract_quota::test]
fn same_holder_cannot_take_two_slots() {
    let gate = ConcurrencyGate::new(3);
    let _a = gate.try_acquire_slot("doc-1").unwrap();
    assert_eq!(
        gate.try_acquire_slot("doc-1").unwrap_err(),
        SlotError::AlreadyHeld("doc-1".to_string())
    );
    assert_eq!(gate.current_load(), (1, 3));
}

#[textract_quota::test]
fn dropping_a_slot_releases_it() {
    let gate = ConcurrencyGate::new(1);
    {
        let slot = gate.try_acquire_slot("a").unwrap();
        assert_eq!(slot.holder(), "a");
        assert_eq!(
            gate.try_acquire_slot("a").unwrap_err(),
            SlotError::AlreadyHeld("a".to_string())
        );
    }
    assert_eq!(gate.current_load(), (0, 1));
    assert!(gate.try_acquire_slot("a").is_ok());
}

#[textract_quota::test(start_paused = true)]
async fn acquire_times_out_at_deadline_without_counting() {
    let gate = ConcurrencyGate::new(1);
    let held = gate.try_acquire_slot("a").unwrap();

    let start = Instant::now();
    let err = gate
        .acquire_slot("b", start + Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err, SlotError::TimedOut);
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(gate.current_load(), (1, 1));

    gate.release_slot(held);
    assert_eq!(gate.current_load(), (0, 1));
}

#[textract_quota::test(start_paused = true)]
async fn cancelled_wait_is_not_granted() {
    let gate = ConcurrencyGate::new(1);
    let held = gate.try_acquire_slot("a").unwrap();

    let res = tokio::time::timeout(
        Duration::from_millis(50),
        gate.acquire_slot("b", Instant::now() + Duration::from_secs(60)),
    )
    .await;
    assert!(res.is_err());

    gate.release_slot(held);
    assert_eq!(gate.current_load(), (0, 1));
    let c = gate.try_acquire_slot("c").unwrap();
    assert_eq!(c.holder(), "c");
}

#[textract_quota::test(start_paused = true)]
async fn waiters_are_admitted_in_fifo_order() {
    let gate = Arc::new(ConcurrencyGate::new(1));
    let first = gate.try_acquire_slot("holder").unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut handles = Vec::new();
    for name in ["w1", "w2", "w3"] {
        let gate = Arc::clone(&gate);
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            let slot = gate
                .acquire_slot(name, Instant::now() + Duration::from_secs(60))
                .await
                .unwrap();
            tx.send(name).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(slot);
        }));
        // Let this waiter enqueue before the next one
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    drop(tx);

    gate.release_slot(first);
    let mut order = Vec::new();
    while let Some(name) = rx.recv().await {
        order.push(name);
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(order, vec!["w1", "w2", "w3"]);
    assert_eq!(gate.current_load(), (0, 1));
}

#[textract_quota::test(start_paused = true)]
async fn in_flight_never_exceeds_limit_under_contention() {
    let max = 5;
    let gate = Arc::new(ConcurrencyGate::new(max));
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..60 {
        let gate = Arc::clone(&gate);
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            let holder = format!("doc-{i}");
            let slot = gate
                .acquire_slot(&holder, Instant::now() + Duration::from_secs(600))
                .await
                .unwrap();
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            assert!(gate.current_load().0 <= max);
            tokio::time::sleep(Duration::from_millis(5 + (i % 7) as u64)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            gate.release_slot(slot);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), max);
    assert_eq!(gate.current_load(), (0, max));
}

#[textract_quota::test]
fn hydrate_reports_holders_beyond_capacity() {
    let gate = ConcurrencyGate::new(2);
    let outcome = gate.hydrate(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    assert_eq!(outcome.restored.len(), 2);
    assert_eq!(outcome.over_capacity, vec!["c".to_string()]);
    assert_eq!(gate.current_load(), (2, 2));
    for held in ["a", "b"] {
        assert_eq!(
            gate.try_acquire_slot(held).unwrap_err(),
            SlotError::AlreadyHeld(held.to_string())
        );
    }
    assert_eq!(gate.try_acquire_slot("c").unwrap_err(), SlotError::TimedOut);
}

#[textract_quota::test(start_paused = true)]
async fn closed_gate_rejects_waiters() {
    let gate = ConcurrencyGate::new(1);
    let _held = gate.try_acquire_slot("a").unwrap();
    gate.close();
    assert_eq!(
        gate.acquire_slot("b", soon()).await.unwrap_err(),
        SlotError::Closed
    );
}
