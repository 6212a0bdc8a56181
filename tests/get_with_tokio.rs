#![cfg(all(test, feature = "future"))]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_lock::Barrier;
use keyed_lazy_cache::{future::Cache, ComputeError};

const NUM_TASKS: u8 = 16;

#[tokio::test]
async fn test_get_with() {
    const TEN_MIB: usize = 10 * 1024 * 1024; // 10MiB
    let cache = Cache::new();
    let call_counter = Arc::new(AtomicUsize::default());
    let barrier = Arc::new(Barrier::new(NUM_TASKS as usize));

    let tasks: Vec<_> = (0..NUM_TASKS)
        .map(|task_id| {
            let my_cache = cache.clone();
            let my_call_counter = Arc::clone(&call_counter);
            let my_barrier = Arc::clone(&barrier);

            tokio::spawn(async move {
                my_barrier.wait().await;

                println!("Task {task_id} started.");

                let key = "key1".to_string();
                let value = match task_id % 2 {
                    0 => {
                        my_cache
                            .get_with(key.clone(), async move {
                                println!("Task {task_id} inserting a value.");
                                my_call_counter.fetch_add(1, Ordering::AcqRel);
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                Arc::new(vec![0u8; TEN_MIB])
                            })
                            .await
                    }
                    1 => {
                        my_cache
                            .get_with_by_ref(key.as_str(), async move {
                                println!("Task {task_id} inserting a value.");
                                my_call_counter.fetch_add(1, Ordering::AcqRel);
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                Arc::new(vec![0u8; TEN_MIB])
                            })
                            .await
                    }
                    _ => unreachable!(),
                };

                assert_eq!(value.len(), TEN_MIB);
                assert!(my_cache.get(key.as_str()).is_some());

                println!("Task {task_id} got the value. (len: {})", value.len());
            })
        })
        .collect();

    futures_util::future::join_all(tasks).await;

    assert_eq!(call_counter.load(Ordering::Acquire), 1);
}

#[tokio::test]
async fn test_try_get_with() {
    #[derive(Debug, thiserror::Error)]
    #[error("service unavailable")]
    struct Unavailable;

    let cache: Cache<String, u16> = Cache::builder().record_stats().build();
    let call_counter = Arc::new(AtomicUsize::default());
    let barrier = Arc::new(Barrier::new(NUM_TASKS as usize));

    let tasks: Vec<_> = (0..NUM_TASKS)
        .map(|_| {
            let my_cache = cache.clone();
            let my_call_counter = Arc::clone(&call_counter);
            let my_barrier = Arc::clone(&barrier);

            tokio::spawn(async move {
                my_barrier.wait().await;
                my_cache
                    .try_get_with("port".to_string(), async move {
                        my_call_counter.fetch_add(1, Ordering::AcqRel);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err::<u16, _>(Unavailable)
                    })
                    .await
            })
        })
        .collect();

    let results = futures_util::future::join_all(tasks).await;

    // Every failure a task sees came from some load, and no load was cached.
    let loads = call_counter.load(Ordering::Acquire);
    assert!(loads >= 1);
    for result in results {
        let err = result.expect("task failed").expect_err("nothing should load");
        assert!(matches!(err, ComputeError::ProducerFailed(_)));
        assert_eq!(err.to_string(), "the producer for this key failed");
    }
    assert!(cache.get("port").is_none());
    assert_eq!(cache.stats().load_failure_count(), loads as u64);

    // The key is retried, and this time it loads.
    let port = cache
        .try_get_with_by_ref("port", async { Ok::<_, Unavailable>(8080) })
        .await;
    assert_eq!(port.unwrap(), 8080);
    assert_eq!(cache.stats().load_success_count(), 1);
}

#[tokio::test]
async fn test_aborted_producer() {
    let cache: Cache<u32, &'static str> = Cache::new();

    let producer = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .get_with(1, async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    "never"
                })
                .await
        })
    };

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cache.get_with(1, async { "retried" }).await
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(100)).await;
    producer.abort();

    for waiter in futures_util::future::join_all(waiters).await {
        assert_eq!(waiter.expect("task failed"), "retried");
    }
    assert_eq!(cache.get(&1), Some("retried"));
}
