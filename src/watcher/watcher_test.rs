use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::timeout;
use tokio::time::Instant;

use super::*;
use crate::test_utils::enable_logger;
use crate::test_utils::list_response;
use crate::test_utils::ScriptedStore;
use crate::test_utils::StallingStore;
use crate::Error;
use crate::MockKvStore;
use crate::StoreError;

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        base_delay_ms: 100,
        max_delay_ms: 1000,
        multiplier: 2,
        jitter: false,
    }
}

#[tokio::test]
async fn test_first_response_is_always_emitted() {
    enable_logger();
    let store = Arc::new(ScriptedStore::new(vec![Ok(list_response(1, &[]))]));
    let mut watcher = Watcher::new(store.clone(), "test/", fast_backoff(), CancellationToken::new());

    let snapshot = watcher.next().await.unwrap().unwrap();

    assert_eq!(snapshot.index, 1);
    assert!(snapshot.entries.is_empty());
    assert_eq!(store.calls(), vec![("test/".to_string(), 0)]);
}

#[tokio::test]
async fn test_unchanged_index_is_skipped_and_latest_index_is_passed() {
    enable_logger();
    let store = Arc::new(ScriptedStore::new(vec![
        Ok(list_response(5, &[("test/addr", "foo")])),
        Ok(list_response(5, &[("test/addr", "foo")])),
        Ok(list_response(5, &[("test/addr", "foo")])),
        Ok(list_response(9, &[("test/addr", "bar")])),
    ]));
    let mut watcher = Watcher::new(store.clone(), "test/", fast_backoff(), CancellationToken::new());

    let first = watcher.next().await.unwrap().unwrap();
    let second = watcher.next().await.unwrap().unwrap();

    assert_eq!(first.index, 5);
    assert_eq!(second.index, 9);
    assert_eq!(second.entries[0].value, b"bar".to_vec());
    assert_eq!(watcher.last_index(), 9);

    let wait_indexes: Vec<u64> = store.calls().into_iter().map(|(_, i)| i).collect();
    assert_eq!(wait_indexes, vec![0, 5, 5, 5]);
}

#[tokio::test]
async fn test_index_going_backwards_is_not_emitted() {
    enable_logger();
    let store = Arc::new(ScriptedStore::new(vec![
        Ok(list_response(10, &[])),
        Ok(list_response(4, &[])),
        Ok(list_response(11, &[])),
    ]));
    let mut watcher = Watcher::new(store.clone(), "test/", fast_backoff(), CancellationToken::new());

    assert_eq!(watcher.next().await.unwrap().unwrap().index, 10);
    assert_eq!(watcher.next().await.unwrap().unwrap().index, 11);

    let wait_indexes: Vec<u64> = store.calls().into_iter().map(|(_, i)| i).collect();
    assert_eq!(wait_indexes, vec![0, 10, 10]);
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_emitted_then_retried_with_backoff() {
    enable_logger();
    let store = Arc::new(ScriptedStore::new(vec![
        Err(StoreError::Transport("connection refused".into())),
        Err(StoreError::Transport("connection refused".into())),
        Ok(list_response(3, &[("test/addr", "foo")])),
    ]));
    let mut watcher = Watcher::new(store.clone(), "test/", fast_backoff(), CancellationToken::new());

    let started = Instant::now();
    let first = watcher.next().await.unwrap();
    assert!(matches!(first, Err(Error::Store(StoreError::Transport(_)))));
    assert_eq!(started.elapsed(), Duration::ZERO);

    let second = watcher.next().await.unwrap();
    assert!(second.is_err());
    assert!(started.elapsed() >= Duration::from_millis(100));

    let third = watcher.next().await.unwrap().unwrap();
    assert_eq!(third.index, 3);
    // 100ms after the first failure, 200ms after the second
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(store.calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_resets_after_success() {
    enable_logger();
    let store = Arc::new(ScriptedStore::new(vec![
        Err(StoreError::Unavailable("no leader".into())),
        Ok(list_response(1, &[])),
        Err(StoreError::Unavailable("no leader".into())),
        Ok(list_response(2, &[])),
    ]));
    let mut watcher = Watcher::new(store, "test/", fast_backoff(), CancellationToken::new());

    assert!(watcher.next().await.unwrap().is_err());
    assert!(watcher.next().await.unwrap().is_ok());
    assert!(watcher.next().await.unwrap().is_err());

    let before = Instant::now();
    assert_eq!(watcher.next().await.unwrap().unwrap().index, 2);
    assert!(before.elapsed() >= Duration::from_millis(100));
    assert!(before.elapsed() < Duration::from_millis(200));
}

#[tokio::test]
async fn test_watcher_passes_prefix_verbatim_including_empty() {
    enable_logger();
    let mut store = MockKvStore::new();
    store
        .expect_list()
        .withf(|prefix, wait_index| prefix.is_empty() && *wait_index == 0)
        .times(1)
        .returning(|_, _| Ok(list_response(1, &[("a", "1")])));

    let mut watcher = Watcher::new(store, "", fast_backoff(), CancellationToken::new());

    let snapshot = watcher.next().await.unwrap().unwrap();
    assert_eq!(snapshot.entries.len(), 1);
}

#[tokio::test]
async fn test_cancel_abandons_in_flight_list() {
    enable_logger();
    let store = StallingStore::default();
    let cancel = CancellationToken::new();
    let mut watcher = Watcher::new(store.clone(), "test/", fast_backoff(), cancel.clone());

    let handle = tokio::spawn(async move { watcher.next().await });

    while store.started.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    cancel.cancel();

    let result = timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    assert!(result.is_none());
    assert_eq!(store.abandoned.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_backoff_sleep() {
    enable_logger();
    let store = Arc::new(ScriptedStore::new(vec![Err(StoreError::Transport("down".into()))]));
    let cancel = CancellationToken::new();
    let backoff = BackoffPolicy {
        base_delay_ms: 60_000,
        max_delay_ms: 60_000,
        multiplier: 2,
        jitter: false,
    };
    let mut watcher = Watcher::new(store.clone(), "test/", backoff, cancel.clone());

    assert!(watcher.next().await.unwrap().is_err());

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    assert!(watcher.next().await.is_none());
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(store.calls().len(), 1);
}

#[tokio::test]
async fn test_cancelled_watcher_makes_no_store_calls() {
    let mut store = MockKvStore::new();
    store.expect_list().never();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut watcher = Watcher::new(store, "test/", fast_backoff(), cancel);
    assert!(watcher.next().await.is_none());
    assert!(watcher.next().await.is_none());
}

#[tokio::test]
async fn test_stream_yields_snapshots_in_order_and_ends_on_cancel() {
    enable_logger();
    let store = Arc::new(ScriptedStore::new(vec![
        Ok(list_response(1, &[("test/a", "1")])),
        Ok(list_response(2, &[("test/a", "2")])),
    ]));
    let cancel = CancellationToken::new();
    let watcher = Watcher::new(store, "test/", fast_backoff(), cancel.clone());
    let mut stream = Box::pin(watcher.into_stream());

    assert_eq!(stream.next().await.unwrap().unwrap().index, 1);
    assert_eq!(stream.next().await.unwrap().unwrap().index, 2);

    cancel.cancel();
    assert!(stream.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_zero_index_store_is_polled_at_bounded_rate() {
    enable_logger();
    let wait_indexes = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorded = wait_indexes.clone();
    let mut store = MockKvStore::new();
    store.expect_list().returning(move |_, wait_index| {
        recorded.lock().push(wait_index);
        Ok(list_response(0, &[("test/addr", "foo")]))
    });
    let cancel = CancellationToken::new();
    let mut watcher = Watcher::new(store, "test/", fast_backoff(), cancel.clone());

    let first = watcher.next().await.unwrap().unwrap();
    assert_eq!(first.index, 1);
    assert_eq!(watcher.last_index(), 1);

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });
    assert!(watcher.next().await.is_none());

    let wait_indexes = wait_indexes.lock().clone();
    // One call per 100ms base delay, plus the initial one.
    assert!(wait_indexes.len() <= 12, "made {} calls", wait_indexes.len());
    assert_eq!(wait_indexes[0], 0);
    assert!(wait_indexes[1..].iter().all(|index| *index == 1));
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_responses_are_spaced_by_base_delay() {
    enable_logger();
    let store = Arc::new(ScriptedStore::new(vec![
        Ok(list_response(5, &[])),
        Ok(list_response(5, &[])),
        Ok(list_response(6, &[])),
    ]));
    let mut watcher = Watcher::new(store, "test/", fast_backoff(), CancellationToken::new());

    assert_eq!(watcher.next().await.unwrap().unwrap().index, 5);
    let started = Instant::now();
    assert_eq!(watcher.next().await.unwrap().unwrap().index, 6);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_millis(200));
}
