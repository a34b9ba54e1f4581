use asset_sync::batch::{BatchExecutor, BatchOptions, Settlement};
use asset_sync::progress::{NoopProgressSink, ProgressPhase, ProgressTracker};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn never_exceeds_max_concurrent() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let results: Vec<Settlement<usize, ()>> = BatchExecutor::process(
        (0..10usize).collect::<Vec<_>>(),
        |n| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(n)
            }
        },
        BatchOptions::new(3),
    )
    .await;

    assert_eq!(results.len(), 10);
    assert!(peak.load(Ordering::SeqCst) <= 3, "peak was {}", peak.load(Ordering::SeqCst));
    assert!(peak.load(Ordering::SeqCst) >= 2, "items in a window should overlap");
}

#[tokio::test]
async fn settlements_keep_input_order_and_isolate_failures() {
    let results = BatchExecutor::process(
        vec![30u64, 5, 20, 1],
        |ms| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            if ms == 5 {
                Err(format!("item {ms} failed"))
            } else {
                Ok(ms)
            }
        },
        BatchOptions::new(4),
    )
    .await;

    assert_eq!(
        results,
        vec![
            Settlement::Fulfilled(30),
            Settlement::Rejected("item 5 failed".to_string()),
            Settlement::Fulfilled(20),
            Settlement::Fulfilled(1),
        ]
    );
}

#[tokio::test]
async fn timeout_is_reported_exactly_once_even_after_late_completion() {
    let reports: Arc<Mutex<Vec<(usize, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let finished_late = Arc::new(AtomicUsize::new(0));
    let progress = Arc::new(ProgressTracker::new(2, Arc::new(NoopProgressSink)));

    let sink = reports.clone();
    let late = finished_late.clone();
    let options = BatchOptions::new(2)
        .with_timeout(Duration::from_millis(30))
        .with_progress(progress.clone())
        .on_settled(move |index, settlement: &Settlement<u64, ()>| {
            sink.lock().unwrap().push((index, settlement.is_fulfilled()));
        });

    let results = BatchExecutor::process(
        vec![200u64, 1],
        move |ms| {
            let late = late.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                late.fetch_add(1, Ordering::SeqCst);
                Ok(ms)
            }
        },
        options,
    )
    .await;

    assert_eq!(results, vec![Settlement::TimedOut, Settlement::Fulfilled(1)]);

    // let the abandoned task run to completion
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(finished_late.load(Ordering::SeqCst), 2, "abandoned work keeps running");

    let mut reports = reports.lock().unwrap().clone();
    reports.sort();
    assert_eq!(reports, vec![(0, false), (1, true)]);

    let state = progress.snapshot();
    assert_eq!((state.completed, state.failed, state.in_progress), (1, 1, 0));
    assert_eq!(state.phase, ProgressPhase::Finished);
}

#[tokio::test]
async fn panicking_item_does_not_take_down_its_window() {
    let results: Vec<Settlement<u8, ()>> = BatchExecutor::process(
        vec![1u8, 2, 3],
        |n| async move {
            if n == 2 {
                panic!("boom");
            }
            Ok(n)
        },
        BatchOptions::new(3),
    )
    .await;

    assert_eq!(results[0], Settlement::Fulfilled(1));
    assert!(matches!(results[1], Settlement::Panicked(_)));
    assert_eq!(results[2], Settlement::Fulfilled(3));
}

#[tokio::test]
async fn next_window_waits_for_the_slowest_item() {
    let started = Arc::new(Mutex::new(Vec::new()));
    let log = started.clone();
    let begin = tokio::time::Instant::now();

    BatchExecutor::process(
        vec![60u64, 1, 1],
        move |ms| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(begin.elapsed());
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<_, ()>(())
            }
        },
        BatchOptions::new(2),
    )
    .await;

    let started = started.lock().unwrap();
    assert_eq!(started.len(), 3);
    assert!(
        started[2] >= Duration::from_millis(60),
        "third item must start only after the first window settled"
    );
}
