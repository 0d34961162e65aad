//! Admission tests: reuse, limits, queueing and priority

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{pool_with, settle, test_config};
use pretty_assertions::assert_eq;
use wirepool::{PoolConfig, PoolError, PoolEvent, Priority};

const URL: &str = "ws://feed.example/ticks";

fn single_slot_config() -> PoolConfig {
    PoolConfig {
        max_connections_per_host: 1,
        ..test_config()
    }
}

#[tokio::test(start_paused = true)]
async fn test_released_connection_is_reused() {
    let (pool, connector) = pool_with(test_config());

    let first = pool.acquire(URL, Priority::Normal).await.unwrap();
    assert!(pool.release(first.connection_id(), first.subscriber_id()));
    let second = pool.acquire(URL, Priority::Normal).await.unwrap();

    assert_eq!(first.connection_id(), second.connection_id());
    assert_ne!(first.subscriber_id(), second.subscriber_id());
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reuse_prefers_healthiest_connection() {
    let (pool, connector) = pool_with(test_config());
    let healthy = pool.acquire(URL, Priority::Normal).await.unwrap();
    // Newer id, so only health can rank it below the other one
    let degraded = pool.acquire(URL, Priority::Normal).await.unwrap();

    // A failed write costs health; the reconnect restores the socket
    connector.fail_sends(true);
    assert!(pool.send(degraded.connection_id(), "lost").await.is_err());
    connector.fail_sends(false);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        pool.connection_info(degraded.connection_id())
            .unwrap()
            .health_score,
        90
    );

    pool.release(healthy.connection_id(), healthy.subscriber_id());
    pool.release(degraded.connection_id(), degraded.subscriber_id());

    let picked = pool.acquire(URL, Priority::Normal).await.unwrap();
    assert_eq!(picked.connection_id(), healthy.connection_id());
    let next = pool.acquire(URL, Priority::Normal).await.unwrap();
    assert_eq!(next.connection_id(), degraded.connection_id());
    assert_eq!(connector.opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_reuse_tie_goes_to_newest_connection() {
    let (pool, connector) = pool_with(test_config());
    let older = pool.acquire(URL, Priority::Normal).await.unwrap();
    let newer = pool.acquire(URL, Priority::Normal).await.unwrap();

    pool.release(newer.connection_id(), newer.subscriber_id());
    pool.release(older.connection_id(), older.subscriber_id());

    let picked = pool.acquire(URL, Priority::Normal).await.unwrap();
    assert_eq!(picked.connection_id(), newer.connection_id());
    assert_eq!(connector.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reuse_requires_identical_url() {
    let (pool, connector) = pool_with(test_config());

    let a = pool.acquire("ws://feed.example/a", Priority::Normal).await.unwrap();
    pool.release(a.connection_id(), a.subscriber_id());
    let b = pool.acquire("ws://feed.example/b", Priority::Normal).await.unwrap();

    assert_ne!(a.connection_id(), b.connection_id());
    assert_eq!(connector.opens(), 2);
    assert_eq!(pool.status().hosts.get("ws://feed.example"), Some(&2));
}

#[tokio::test(start_paused = true)]
async fn test_queued_acquire_is_served_on_release() {
    let (pool, connector) = pool_with(test_config());

    let a = pool.acquire(URL, Priority::Normal).await.unwrap();
    let b = pool.acquire(URL, Priority::Normal).await.unwrap();
    assert_ne!(a.connection_id(), b.connection_id());

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(URL, Priority::Normal).await })
    };
    settle().await;
    assert_eq!(pool.status().queue_depth, 1);
    assert_eq!(pool.metrics().pending_requests, 1);

    assert!(pool.release(a.connection_id(), a.subscriber_id()));
    let c = waiter.await.unwrap().unwrap();

    assert_eq!(c.connection_id(), a.connection_id());
    assert_eq!(connector.opens(), 2);
    assert_eq!(pool.status().queue_depth, 0);
}

#[tokio::test(start_paused = true)]
async fn test_per_host_limit_under_concurrency() {
    let config = PoolConfig {
        max_connections_per_host: 3,
        ..test_config()
    };
    let (pool, connector) = pool_with(config);

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                let handle = pool.acquire(URL, Priority::Normal).await?;
                tokio::time::sleep(Duration::from_millis(10)).await;
                pool.release(handle.connection_id(), handle.subscriber_id());
                Ok::<_, PoolError>(handle.connection_id())
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for result in futures::future::join_all(tasks).await {
        ids.insert(result.unwrap().unwrap());
    }

    assert_eq!(connector.opens(), 3);
    assert_eq!(ids.len(), 3);
    assert_eq!(pool.size(), 3);
    assert_eq!(pool.metrics().idle_connections, 3);
}

#[tokio::test(start_paused = true)]
async fn test_global_limit_applies_across_hosts() {
    let config = PoolConfig {
        max_connections: 2,
        max_connections_per_host: 2,
        ..test_config()
    };
    let (pool, _connector) = pool_with(config);

    let _a = pool.acquire("ws://a.example/", Priority::Normal).await.unwrap();
    let _b = pool.acquire("ws://b.example/", Priority::Normal).await.unwrap();
    let err = pool
        .acquire("ws://c.example/", Priority::Normal)
        .await
        .unwrap_err();

    assert!(matches!(err, PoolError::RequestTimeout { .. }));
    assert_eq!(pool.size(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_high_priority_is_served_first() {
    let (pool, connector) = pool_with(single_slot_config());

    let holder = pool.acquire(URL, Priority::Normal).await.unwrap();

    let low = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(URL, Priority::Low).await })
    };
    settle().await;
    let high = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(URL, Priority::High).await })
    };
    settle().await;
    assert_eq!(pool.status().queue_depth, 2);

    pool.release(holder.connection_id(), holder.subscriber_id());
    let high_handle = high.await.unwrap().unwrap();
    assert_eq!(high_handle.connection_id(), holder.connection_id());

    settle().await;
    assert!(!low.is_finished());
    assert_eq!(pool.status().queue_depth, 1);

    pool.release(high_handle.connection_id(), high_handle.subscriber_id());
    let low_handle = low.await.unwrap().unwrap();
    assert_eq!(low_handle.connection_id(), holder.connection_id());
    assert_eq!(connector.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_saturated_host_does_not_block_other_hosts() {
    let config = PoolConfig {
        max_connections: 2,
        max_connections_per_host: 1,
        ..test_config()
    };
    let (pool, _connector) = pool_with(config);

    let a = pool.acquire("ws://a.example/", Priority::Normal).await.unwrap();
    let b = pool.acquire("ws://b.example/", Priority::Normal).await.unwrap();

    // Waits on host a, which stays busy
    let stuck = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire("ws://a.example/", Priority::High).await })
    };
    settle().await;
    let other = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire("ws://b.example/", Priority::Low).await })
    };
    settle().await;

    pool.release(b.connection_id(), b.subscriber_id());
    let served = other.await.unwrap().unwrap();
    assert_eq!(served.connection_id(), b.connection_id());
    assert!(!stuck.is_finished());

    pool.release(a.connection_id(), a.subscriber_id());
    let unstuck = stuck.await.unwrap().unwrap();
    assert_eq!(unstuck.connection_id(), a.connection_id());
}

#[tokio::test(start_paused = true)]
async fn test_queued_acquire_times_out() {
    let (pool, _connector) = pool_with(single_slot_config());
    let mut events = pool.events();

    let _holder = pool.acquire(URL, Priority::Normal).await.unwrap();
    let err = pool.acquire(URL, Priority::High).await.unwrap_err();

    match err {
        PoolError::RequestTimeout { url, waited } => {
            assert_eq!(url, URL);
            assert!(waited >= Duration::from_secs(5));
        }
        other => panic!("expected RequestTimeout, got {other:?}"),
    }
    assert_eq!(pool.status().queue_depth, 0);
    assert_eq!(pool.metrics().counters.queue_timeouts, 1);

    let mut saw_queued = false;
    let mut saw_timeout = false;
    while let Ok(event) = events.try_recv() {
        match event {
            PoolEvent::RequestQueued { priority, .. } => {
                assert_eq!(priority, Priority::High);
                saw_queued = true;
            }
            PoolEvent::RequestTimedOut { priority, .. } => {
                assert_eq!(priority, Priority::High);
                saw_timeout = true;
            }
            _ => {}
        }
    }
    assert!(saw_queued && saw_timeout);
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_rejects_immediately() {
    let config = PoolConfig {
        max_connections_per_host: 1,
        max_pending_requests: 1,
        ..test_config()
    };
    let (pool, _connector) = pool_with(config);

    let _holder = pool.acquire(URL, Priority::Normal).await.unwrap();
    let _queued = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(URL, Priority::Normal).await })
    };
    settle().await;

    let err = pool.acquire(URL, Priority::High).await.unwrap_err();
    assert!(matches!(err, PoolError::PoolExhausted(_)));
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_waiter_is_skipped() {
    let (pool, _connector) = pool_with(single_slot_config());

    let holder = pool.acquire(URL, Priority::Normal).await.unwrap();
    let abandoned = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(URL, Priority::High).await })
    };
    settle().await;
    let patient = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(URL, Priority::Low).await })
    };
    settle().await;

    abandoned.abort();
    settle().await;
    pool.release(holder.connection_id(), holder.subscriber_id());

    let handle = patient.await.unwrap().unwrap();
    assert_eq!(handle.connection_id(), holder.connection_id());
    assert_eq!(pool.status().queue_depth, 0);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout() {
    let (pool, connector) = pool_with(test_config());
    connector.set_handshake_delay(Duration::from_secs(60));

    let err = pool.acquire(URL, Priority::Normal).await.unwrap_err();

    assert!(matches!(err, PoolError::HandshakeTimeout { timeout, .. } if timeout == Duration::from_secs(5)));
    assert!(pool.is_empty());
    assert_eq!(pool.metrics().failed_connections, 1);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_failure_frees_capacity_for_queue() {
    let (pool, connector) = pool_with(single_slot_config());
    connector.set_handshake_delay(Duration::from_millis(100));
    connector.refuse(true);

    let first = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(URL, Priority::Normal).await })
    };
    settle().await;
    let second = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(URL, Priority::Normal).await })
    };
    settle().await;
    assert_eq!(pool.status().queue_depth, 1);

    // The queued request gets a fresh handshake once the first one fails
    connector.refuse(false);
    assert!(matches!(
        first.await.unwrap(),
        Err(PoolError::HandshakeFailed { .. })
    ));
    let handle = second.await.unwrap().unwrap();
    assert_eq!(connector.opens(), 2);
    assert_eq!(pool.size(), 1);
    assert!(pool.connection_info(handle.connection_id()).is_some());
}
