//! Integration tests against a live Redis-compatible backend. Ignored by
//! default since they need real infrastructure; run with
//! `REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_integration -- --ignored`.

use ratekeeper::algorithm::{AlgorithmKind, AlgorithmParams};
use ratekeeper::storage::{DistributedStore, Storage};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

#[tokio::test]
#[ignore]
async fn token_bucket_round_trips_through_a_real_backend() {
    let store = DistributedStore::new(&redis_url(), 60_000).unwrap();
    let params = AlgorithmParams {
        capacity: 5,
        refill_per_ms: 0.001,
        window_ms: 1000,
    };
    let mut allowed = 0;
    for i in 0..7 {
        let d = store
            .try_acquire("redis-it", "k1", AlgorithmKind::TokenBucket, &params, 1, i)
            .await
            .unwrap();
        allowed += d.allowed as u32;
    }
    assert_eq!(allowed, 5);
}

/// Scenario F — script eviction and reload. Flushing the backend's script
/// cache mid-run forces the next call to hit NOSCRIPT, reload, and retry
/// exactly once, converging without the caller ever seeing an error.
#[tokio::test]
#[ignore]
async fn scenario_f_script_eviction_triggers_one_reload_and_succeeds() {
    let store = DistributedStore::new(&redis_url(), 60_000).unwrap();
    let params = AlgorithmParams {
        capacity: 10,
        refill_per_ms: 0.01,
        window_ms: 1000,
    };

    store
        .try_acquire("redis-it", "k2", AlgorithmKind::TokenBucket, &params, 1, 0)
        .await
        .unwrap();

    let client = redis::Client::open(redis_url().as_str()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let _: () = redis::cmd("SCRIPT").arg("FLUSH").query_async(&mut conn).await.unwrap();

    let before = store.reload_count();
    let decision = store
        .try_acquire("redis-it", "k2", AlgorithmKind::TokenBucket, &params, 1, 1)
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(store.reload_count(), before + 1, "exactly one reload after the backend evicted the script");
}

#[tokio::test]
#[ignore]
async fn reset_clears_all_algorithm_keys_for_a_given_key() {
    let store = DistributedStore::new(&redis_url(), 60_000).unwrap();
    let params = AlgorithmParams {
        capacity: 1,
        refill_per_ms: 0.001,
        window_ms: 1000,
    };
    store
        .try_acquire("redis-it", "k3", AlgorithmKind::TokenBucket, &params, 1, 0)
        .await
        .unwrap();
    assert!(!store
        .try_acquire("redis-it", "k3", AlgorithmKind::TokenBucket, &params, 1, 0)
        .await
        .unwrap()
        .allowed);

    store.reset("redis-it", "k3").await.unwrap();

    assert!(store
        .try_acquire("redis-it", "k3", AlgorithmKind::TokenBucket, &params, 1, 0)
        .await
        .unwrap()
        .allowed);
}

#[tokio::test]
#[ignore]
async fn is_healthy_and_current_time_reach_the_backend() {
    let store = DistributedStore::new(&redis_url(), 60_000).unwrap();
    assert!(store.is_healthy().await);
    let t1 = store.current_time().await.unwrap();
    let t2 = store.current_time().await.unwrap();
    assert!(t2 >= t1, "backend clock must not move backward between two reads");
}
