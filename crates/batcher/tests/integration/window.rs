use std::time::Duration;

use batcher::{Batcher, CacheKey, CallError};
use batcher_test::Counter;
use tokio::time;

/// Lets spawned tasks run until they are blocked.
async fn run_pending_tasks() {
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_zero_window_reinvokes_after_settlement() {
    batcher_test::setup();

    let batcher = Batcher::<(), ()>::with_window(Duration::ZERO);
    let counter = Counter::new();

    batcher
        .call(&["key"], counter.returning(()))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(counter.calls(), 1);

    tokio::task::yield_now().await;

    batcher
        .call(&["key"], counter.returning(()))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(counter.calls(), 2);
    assert!(batcher.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_settled_calls_are_never_joined() {
    batcher_test::setup();

    for _ in 0..2000 {
        let batcher = Batcher::<(), ()>::with_window(Duration::ZERO);
        let counter = Counter::new();

        batcher
            .call(&["key"], counter.returning(()))
            .unwrap()
            .await
            .unwrap();
        batcher
            .call(&["key"], counter.returning(()))
            .unwrap()
            .await
            .unwrap();

        assert_eq!(counter.calls(), 2);
    }
}

#[tokio::test]
async fn test_calls_within_window_share_invocation() {
    batcher_test::setup();
    time::pause();

    let batcher = Batcher::<u32, ()>::with_window(Duration::from_millis(10));
    let counter = Counter::new();

    let first = batcher.call(&["key"], counter.returning(1)).unwrap();
    run_pending_tasks().await;
    time::advance(Duration::from_millis(5)).await;

    assert_eq!(counter.calls(), 0);
    assert_eq!(batcher.pending_timers(), 1);

    let second = batcher.call(&["key"], counter.returning(2)).unwrap();
    assert!(first.ptr_eq(&second));

    let (first, second) = futures::join!(first, second);
    assert_eq!(*first.unwrap(), 1);
    assert_eq!(*second.unwrap(), 1);
    assert_eq!(counter.calls(), 1);
    assert_eq!(batcher.pending_timers(), 0);
}

#[tokio::test]
async fn test_window_expiry_reinvokes() {
    batcher_test::setup();
    time::pause();

    let batcher = Batcher::<u32, ()>::with_window(Duration::from_millis(10));
    let counter = Counter::new();

    let first = batcher.call(&["key"], counter.returning(1)).unwrap();
    assert_eq!(*first.clone().await.unwrap(), 1);

    time::advance(Duration::from_millis(10)).await;

    let second = batcher.call(&["key"], counter.returning(2)).unwrap();
    assert!(!first.ptr_eq(&second));
    assert_eq!(*second.await.unwrap(), 2);
    assert_eq!(counter.calls(), 2);
}

#[tokio::test]
async fn test_failed_entry_is_retried() {
    batcher_test::setup();
    time::pause();

    let batcher = Batcher::<u32, String>::with_window(Duration::from_millis(10));
    let counter = Counter::new();

    let failed = batcher
        .call(&["key"], counter.failing("timeout".to_owned()))
        .unwrap()
        .await;
    assert!(matches!(failed, Err(CallError::Operation(_))));

    let retried = batcher.call(&["key"], counter.returning(3)).unwrap().await;
    assert_eq!(*retried.unwrap(), 3);
    assert_eq!(counter.calls(), 2);
}

#[tokio::test]
async fn test_independent_expiry_per_key() {
    batcher_test::setup();
    time::pause();

    let batcher = Batcher::<&'static str, ()>::with_window(Duration::from_millis(10));
    let (a_counter, b_counter) = (Counter::new(), Counter::new());
    let (a_key, b_key) = (CacheKey::new(&["a"]).unwrap(), CacheKey::new(&["b"]).unwrap());

    let a = batcher.call_with_key(a_key.clone(), a_counter.returning("a"));
    run_pending_tasks().await;
    time::advance(Duration::from_millis(5)).await;

    let b = batcher.call_with_key(b_key.clone(), b_counter.returning("b"));
    run_pending_tasks().await;

    // `a` fires at 10ms, `b` only at 15ms
    assert_eq!(*a.await.unwrap(), "a");
    assert!(!batcher.contains(&a_key));
    assert!(batcher.contains(&b_key));
    assert!(!b.is_settled());
    assert_eq!(b_counter.calls(), 0);

    let a_again = batcher.call_with_key(a_key.clone(), a_counter.returning("a"));
    let (a_again, b) = futures::join!(a_again, b);
    assert_eq!(*a_again.unwrap(), "a");
    assert_eq!(*b.unwrap(), "b");

    assert_eq!(a_counter.calls(), 2);
    assert_eq!(b_counter.calls(), 1);
    assert!(batcher.is_empty());
}

#[tokio::test]
async fn test_drop_cancels_unfired_windows() {
    batcher_test::setup();
    time::pause();

    let batcher = Batcher::<u32, ()>::with_window(Duration::from_secs(1));
    let counter = Counter::new();

    let outcomes = [
        batcher.call(&["a"], counter.returning(1)).unwrap(),
        batcher.call(&["b"], counter.returning(2)).unwrap(),
    ];
    assert_eq!(batcher.pending_timers(), 2);
    drop(batcher);

    for outcome in outcomes {
        assert!(matches!(outcome.await, Err(CallError::Cancelled)));
    }
    time::advance(Duration::from_secs(2)).await;
    assert_eq!(counter.calls(), 0);
}

#[tokio::test]
async fn test_drop_keeps_running_operations() {
    batcher_test::setup();
    time::pause();

    let batcher = Batcher::<u32, ()>::with_window(Duration::ZERO);
    let counter = Counter::new();

    let outcome = batcher
        .call(&["key"], counter.delayed(Duration::from_millis(50), 4))
        .unwrap();
    while counter.calls() == 0 {
        tokio::task::yield_now().await;
    }
    drop(batcher);

    assert_eq!(*outcome.await.unwrap(), 4);
    assert_eq!(counter.calls(), 1);
}
