//! Integration tests for events, reservations and barriers across threads

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tessel_substrate::{
    Barrier, CompletionHandle, Poison, ProcessorConfig, ProcessorGroup, Reservation, SumU64,
    UserEvent, WaitMode,
};

fn group(workers: usize, help: bool) -> ProcessorGroup {
    ProcessorGroup::new(ProcessorConfig {
        workers,
        help_while_waiting: help,
        ..ProcessorConfig::default()
    })
    .unwrap()
}

/// Acquire by retrying on the returned handle until granted
fn acquire(rsrv: &Reservation, exclusive: bool) {
    loop {
        let ready = rsrv.lock(exclusive, WaitMode::Spin);
        if !ready.exists() {
            return;
        }
        ready.external_wait();
    }
}

#[test]
fn test_reservation_mutual_exclusion() {
    let rsrv = Arc::new(Reservation::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let total = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let rsrv = rsrv.clone();
            let inside = inside.clone();
            let total = total.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    acquire(&rsrv, true);
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    total.fetch_add(1, Ordering::SeqCst);
                    inside.fetch_sub(1, Ordering::SeqCst);
                    rsrv.unlock().unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(total.load(Ordering::SeqCst), 800);
    assert!(!rsrv.is_write_locked());
}

#[test]
fn test_readers_and_writers_never_mix() {
    let rsrv = Arc::new(Reservation::new());
    let writers = Arc::new(AtomicUsize::new(0));
    let readers = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let rsrv = rsrv.clone();
            let writers = writers.clone();
            let readers = readers.clone();
            thread::spawn(move || {
                let exclusive = i % 3 == 0;
                for _ in 0..100 {
                    acquire(&rsrv, exclusive);
                    if exclusive {
                        writers.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(readers.load(Ordering::SeqCst), 0);
                        assert_eq!(writers.load(Ordering::SeqCst), 1);
                        writers.fetch_sub(1, Ordering::SeqCst);
                    } else {
                        readers.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(writers.load(Ordering::SeqCst), 0);
                        readers.fetch_sub(1, Ordering::SeqCst);
                    }
                    rsrv.unlock().unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_poison_flows_through_chain() {
    let a = UserEvent::create();
    let b = UserEvent::create();
    b.trigger_after(&a.event()).unwrap();
    let merged = CompletionHandle::merge([b.event(), CompletionHandle::NO_EVENT]);

    let waiter = {
        let merged = merged.clone();
        thread::spawn(move || merged.external_wait_faultaware())
    };
    thread::sleep(Duration::from_millis(5));
    a.poison().unwrap();

    assert_eq!(waiter.join().unwrap(), Poison::Poisoned);
    assert_eq!(merged.ignorefaults().has_triggered_faultaware(), Some(Poison::Clean));
}

#[test]
fn test_barrier_across_workers() {
    let pool = group(4, false);
    let bar = Barrier::create_with_reduction(8, Arc::new(SumU64)).unwrap();
    let done = bar.phase_event();

    for i in 1..=8u64 {
        let bar = bar.clone();
        pool.spawn(move || bar.arrive_with_value(1, &i.to_le_bytes()).unwrap());
    }

    assert_eq!(done.external_wait_faultaware(), Poison::Clean);
    let mut buf = [0u8; 8];
    assert!(bar.current_phase().get_previous_phase().get_result(&mut buf));
    assert_eq!(u64::from_le_bytes(buf), 36);
}

#[test]
fn test_worker_wait_without_help_blocks_thread() {
    let pool = group(2, false);
    let gate = UserEvent::create();
    let (tx, rx) = mpsc::channel();

    let event = gate.event();
    pool.spawn(move || tx.send(event.wait_faultaware()).unwrap());
    thread::sleep(Duration::from_millis(10));
    assert!(rx.try_recv().is_err());

    gate.trigger().unwrap();
    assert_eq!(rx.recv().unwrap(), Poison::Clean);
}

#[test]
fn test_help_depth_is_bounded() {
    let pool = ProcessorGroup::new(ProcessorConfig {
        workers: 1,
        help_while_waiting: true,
        max_help_depth: 1,
        ..ProcessorConfig::default()
    })
    .unwrap();
    let spawner = pool.spawner();
    let outer_gate = UserEvent::create();
    let inner_gate = UserEvent::create();
    let (tx, rx) = mpsc::channel();

    let outer = outer_gate.event();
    let inner = inner_gate.clone();
    pool.spawn(move || {
        // Nested job parks at depth one and may not help further
        let inner_wait = inner.event();
        spawner.spawn(move || inner_wait.wait());
        outer.wait();
        tx.send(()).unwrap();
    });

    thread::sleep(Duration::from_millis(20));
    inner_gate.trigger().unwrap();
    outer_gate.trigger().unwrap();
    rx.recv().unwrap();
}
