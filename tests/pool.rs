//! Pool behavior tests against an in-memory resource factory.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use ctxpool::{Context, Error, PoolConfig, PoolManager, ResourceFactory, Status};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::Instant;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Clone, Debug, Default, Deserialize)]
struct MemConfig {
    #[serde(default)]
    tag: String,
}

#[derive(Debug, thiserror::Error)]
#[error("memory backend failure")]
struct MemError;

#[derive(Debug)]
struct MemConn {
    serial: usize,
    tag: String,
}

#[derive(Default)]
struct MemFactory {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    pings: AtomicUsize,
    fail_create: AtomicBool,
    sick: AtomicBool,
    panic_on_ping: AtomicBool,
    create_delay: Mutex<Duration>,
    ping_delay: Mutex<Duration>,
    tags: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl ResourceFactory for MemFactory {
    type Resource = MemConn;
    type Config = MemConfig;
    type Error = MemError;

    async fn create(&self, config: &MemConfig) -> Result<MemConn, MemError> {
        tokio::task::yield_now().await;
        let delay = *self.create_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(MemError);
        }
        self.tags.lock().push(config.tag.clone());
        Ok(MemConn {
            serial: self.created.fetch_add(1, Ordering::SeqCst) + 1,
            tag: config.tag.clone(),
        })
    }

    async fn ping(&self, _conn: &mut MemConn) -> Result<(), MemError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let delay = *self.ping_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.panic_on_ping.load(Ordering::SeqCst) {
            panic!("connection reset while probing");
        }
        if self.sick.load(Ordering::SeqCst) {
            return Err(MemError);
        }
        Ok(())
    }

    fn destroy(&self, conn: MemConn) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        drop(conn);
    }
}

/// Pool without periodic maintenance, so tests drive it by hand.
fn manual_config(max: usize, min: usize, free: usize) -> PoolConfig {
    PoolConfig::default()
        .with_name("test")
        .with_interval(Duration::ZERO)
        .with_max_size(max)
        .with_min_size(min)
        .with_min_free(free)
        .with_acquire_timeout(Duration::from_secs(1))
}

fn pool(config: PoolConfig) -> PoolManager<MemFactory> {
    init_tracing();
    PoolManager::new(config, MemFactory::default())
}

#[tokio::test]
async fn init_prewarms_to_min_and_free_floor() {
    let pool = pool(manual_config(4, 2, 3));
    assert!(!pool.is_initialized());
    pool.init().await.unwrap();
    assert!(pool.is_initialized());
    assert_eq!(
        pool.status(),
        Status {
            created: 3,
            used: 0,
            max: 4,
            min: 2
        }
    );
    // Second init is a no-op.
    pool.init().await.unwrap();
    assert_eq!(pool.factory().created.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn free_floor_is_bounded_by_max() {
    let pool = pool(manual_config(3, 1, 10));
    pool.init().await.unwrap();
    assert_eq!(pool.status().created, 3);
}

#[tokio::test]
async fn init_rejects_min_not_below_max() {
    let pool = pool(manual_config(2, 2, 0));
    assert!(matches!(pool.init().await, Err(Error::ConfigInvalid(_))));
    assert!(!pool.is_initialized());
    assert_eq!(pool.status().created, 0);
    let ctx = Context::new();
    assert!(matches!(
        pool.acquire_for(&ctx, None, None).await,
        Err(Error::ConfigInvalid(_))
    ));
}

#[tokio::test]
async fn init_rejects_mismatched_extra_settings() {
    let pool = pool(manual_config(2, 1, 0).with_extra(serde_json::json!(42)));
    assert!(matches!(pool.init().await, Err(Error::ConfigInvalid(_))));
    assert!(!pool.is_initialized());
}

#[tokio::test]
async fn extra_settings_configure_factory() {
    let pool = pool(manual_config(3, 1, 0).with_extra(serde_json::json!({ "tag": "primary" })));
    pool.init().await.unwrap();
    assert_eq!(*pool.factory().tags.lock(), vec!["primary".to_string()]);
}

#[tokio::test]
async fn acquire_is_reentrant_within_context() {
    let pool = pool(manual_config(3, 1, 1));
    pool.init().await.unwrap();
    Context::new()
        .scope(async {
            let outer = pool.acquire().await.unwrap();
            let live = pool.status().created;
            let inner = pool.acquire().await.unwrap();
            assert!(ctxpool::Lease::ptr_eq(&outer, &inner));
            assert_eq!(outer.resource_id(), inner.resource_id());
            assert_eq!(pool.status().created, live);
            assert_eq!(pool.bound(), 1);
            let serial = outer.get().await.unwrap().serial;
            assert_eq!(inner.get().await.unwrap().serial, serial);
        })
        .await;
}

#[tokio::test]
async fn context_end_returns_resource() {
    let pool = pool(manual_config(3, 1, 0));
    pool.init().await.unwrap();
    let lease = Context::new()
        .scope(async {
            let lease = pool.acquire().await.unwrap();
            assert_eq!(pool.status().used, 1);
            lease
        })
        .await;
    assert!(lease.is_released());
    assert!(matches!(lease.get().await, Err(Error::LeaseReleased)));
    let status = pool.status();
    assert_eq!(status.created, 1);
    assert_eq!(status.used, 0);
    assert_eq!(pool.bound(), 0);
    assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn acquire_outside_context_fails() {
    let pool = pool(manual_config(2, 1, 0));
    assert!(matches!(pool.acquire().await, Err(Error::NoContext)));
    let ctx = Context::new();
    ctx.finish();
    assert!(matches!(
        pool.acquire_for(&ctx, None, None).await,
        Err(Error::NoContext)
    ));
}

#[tokio::test(start_paused = true)]
async fn exhausted_pool_times_out() {
    let pool = pool(manual_config(2, 1, 0));
    pool.init().await.unwrap();
    let (ctx_a, ctx_b, ctx_c) = (Context::new(), Context::new(), Context::new());
    let _a = pool.acquire_for(&ctx_a, None, None).await.unwrap();
    let _b = pool.acquire_for(&ctx_b, None, None).await.unwrap();
    assert_eq!(pool.status().created, 2);
    assert_eq!(pool.status().used, 2);

    let started = Instant::now();
    let err = pool
        .acquire_for(&ctx_c, None, Some(Duration::from_millis(500)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PoolExhausted));
    assert!(err.is_retryable());
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(pool.status().created, 2);
    assert_eq!(pool.bound(), 2);

    // Once a context ends, its resource is available again.
    ctx_a.finish();
    let c = pool.acquire_for(&ctx_c, None, None).await.unwrap();
    assert_eq!(pool.status().created, 2);
    assert_eq!(c.context(), ctx_c.id());
}

#[tokio::test(start_paused = true)]
async fn waiting_acquire_wakes_on_release() {
    let pool = pool(manual_config(2, 1, 0));
    pool.init().await.unwrap();
    let (ctx_a, ctx_b) = (Context::new(), Context::new());
    let _a = pool.acquire_for(&ctx_a, None, None).await.unwrap();
    let _b = pool.acquire_for(&ctx_b, None, None).await.unwrap();
    let releaser = {
        let ctx_a = ctx_a.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            ctx_a.finish();
        })
    };
    let ctx_c = Context::new();
    let started = Instant::now();
    pool.acquire_for(&ctx_c, None, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    releaser.await.unwrap();
}

#[tokio::test]
async fn live_count_never_exceeds_max() {
    let pool = pool(manual_config(3, 1, 0).with_acquire_timeout(Duration::from_secs(10)));
    pool.init().await.unwrap();
    let peak = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let pool = pool.clone();
            let peak = peak.clone();
            tokio::spawn(Context::new().scope(async move {
                let lease = pool.acquire().await.unwrap();
                peak.fetch_max(pool.status().created, Ordering::SeqCst);
                let _conn = lease.get().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }))
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
    let status = pool.status();
    assert!(status.created <= 3);
    assert_eq!(status.used, 0);
    assert_eq!(pool.bound(), 0);
}

#[tokio::test]
async fn discard_binding_destroys_resource() {
    let pool = pool(manual_config(3, 1, 0));
    pool.init().await.unwrap();
    let ctx = Context::new();
    let lease = pool.acquire_for(&ctx, None, None).await.unwrap();
    let live = pool.status().created;
    assert!(pool.discard_binding(ctx.id()));
    assert!(lease.is_released());
    assert_eq!(pool.status().created, live - 1);
    assert_eq!(pool.bound(), 0);
    assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
    assert!(!pool.discard_binding(ctx.id()));
    // Context end after manual release does nothing.
    ctx.finish();
    assert_eq!(pool.status().created, live - 1);
}

#[tokio::test]
async fn discard_binding_ignores_health() {
    let pool = pool(manual_config(3, 0, 0));
    pool.init().await.unwrap();
    let ctx = Context::new();
    pool.acquire_for(&ctx, None, None).await.unwrap();
    assert_eq!(pool.status().created, 1);
    assert!(pool.discard_binding(ctx.id()));
    assert_eq!(pool.status().created, 0);
    assert_eq!(pool.factory().pings.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn return_binding_is_idempotent() {
    let pool = pool(manual_config(3, 1, 0));
    pool.init().await.unwrap();
    let ctx = Context::new();
    let first = pool.acquire_for(&ctx, None, None).await.unwrap();
    assert!(pool.return_binding(ctx.id()));
    assert!(first.is_released());
    assert!(!pool.return_binding(ctx.id()));
    ctx.finish();
    let status = pool.status();
    assert_eq!(status.created, 1);
    assert_eq!(status.used, 0);
    assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rebinding_after_early_return() {
    let pool = pool(manual_config(3, 1, 0));
    pool.init().await.unwrap();
    Context::new()
        .scope(async {
            let first = pool.acquire().await.unwrap();
            let ctx = Context::current().unwrap();
            pool.return_binding(ctx.id());
            let second = pool.acquire().await.unwrap();
            assert!(!ctxpool::Lease::ptr_eq(&first, &second));
            assert_eq!(pool.bound(), 1);
        })
        .await;
    assert_eq!(pool.bound(), 0);
    assert_eq!(pool.status().used, 0);
}

#[tokio::test]
async fn factory_config_from_acquisition() {
    let pool = pool(manual_config(3, 0, 0).with_extra(serde_json::json!({ "tag": "primary" })));
    let ctx = Context::new();
    let lease = pool
        .acquire_for(
            &ctx,
            Some(MemConfig {
                tag: "replica".into(),
            }),
            None,
        )
        .await
        .unwrap();
    assert_eq!(lease.get().await.unwrap().tag, "replica");
    assert_eq!(*pool.factory().tags.lock(), vec!["replica".to_string()]);
}

#[tokio::test]
async fn factory_failure_does_not_grow_pool() {
    let pool = pool(manual_config(3, 0, 0).with_acquire_timeout(Duration::from_millis(50)));
    pool.factory().fail_create.store(true, Ordering::SeqCst);
    pool.init().await.unwrap();
    assert!(!pool.create().await);
    let ctx = Context::new();
    assert!(matches!(
        pool.acquire_for(&ctx, None, None).await,
        Err(Error::PoolExhausted)
    ));
    assert_eq!(pool.status().created, 0);
    assert_eq!(pool.bound(), 0);

    pool.factory().fail_create.store(false, Ordering::SeqCst);
    assert!(pool.create().await);
    assert_eq!(pool.status().created, 1);
}

#[tokio::test]
async fn create_respects_max() {
    let pool = pool(manual_config(2, 0, 0));
    assert!(!pool.create().await, "uninitialized pool must not grow");
    pool.init().await.unwrap();
    assert!(pool.create().await);
    assert!(pool.create().await);
    assert!(!pool.create().await);
    assert_eq!(pool.status().created, 2);
}

#[tokio::test]
async fn pop_push_primitives() {
    let pool = pool(manual_config(2, 1, 0));
    let conn = pool.pop(Duration::from_millis(100)).await.unwrap();
    assert!(pool.is_initialized());
    assert_eq!(conn.serial, 1);
    assert_eq!(pool.status().used, 1);
    assert!(pool.push(conn));
    assert_eq!(pool.status().used, 0);

    // A checked out resource that is dropped is discarded, not leaked.
    let conn = pool.pop(Duration::from_millis(100)).await.unwrap();
    drop(conn);
    assert_eq!(pool.status().created, 0);
    assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn push_to_other_pool_is_rejected() {
    let first = pool(manual_config(2, 1, 0));
    let second = pool(manual_config(2, 1, 0));
    second.init().await.unwrap();
    let conn = first.pop(Duration::from_millis(100)).await.unwrap();
    assert!(!second.push(conn));
    assert_eq!(first.status().created, 0);
    assert_eq!(second.status().created, 1);
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_zero_evicts_on_next_pass() {
    let pool = pool(manual_config(3, 2, 0).with_idle_timeout(Duration::ZERO));
    pool.init().await.unwrap();
    assert_eq!(pool.status().created, 2);
    tokio::time::advance(Duration::from_millis(1)).await;
    pool.check_free().await;
    assert_eq!(pool.status().created, 0);
    assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 2);
    pool.check_min().await.unwrap();
    assert_eq!(pool.status().created, 2);
}

#[tokio::test(start_paused = true)]
async fn recently_used_resources_survive() {
    let pool = pool(manual_config(3, 2, 0).with_idle_timeout(Duration::from_secs(60)));
    pool.init().await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;
    pool.interval_check().await;
    assert_eq!(pool.status().created, 2);
    assert_eq!(pool.factory().pings.load(Ordering::SeqCst), 0);
    assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn unhealthy_resources_are_evicted() {
    let pool = pool(
        manual_config(3, 1, 0)
            .with_idle_timeout(Duration::from_secs(3600))
            .with_ping(Duration::from_secs(1)),
    );
    pool.init().await.unwrap();

    tokio::time::advance(Duration::from_secs(2)).await;
    pool.check_free().await;
    assert_eq!(pool.factory().pings.load(Ordering::SeqCst), 1);
    assert_eq!(pool.status().created, 1);

    pool.factory().sick.store(true, Ordering::SeqCst);
    tokio::time::advance(Duration::from_secs(2)).await;
    pool.check_free().await;
    assert_eq!(pool.factory().pings.load(Ordering::SeqCst), 2);
    assert_eq!(pool.status().created, 0);
}

#[tokio::test(start_paused = true)]
async fn panicking_probe_counts_as_unhealthy() {
    let pool = pool(
        manual_config(3, 1, 0)
            .with_idle_timeout(Duration::from_secs(3600))
            .with_ping(Duration::from_secs(1)),
    );
    pool.init().await.unwrap();
    pool.factory().panic_on_ping.store(true, Ordering::SeqCst);
    tokio::time::advance(Duration::from_secs(2)).await;
    pool.check_free().await;
    assert_eq!(pool.status().created, 0);
    assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn periodic_maintenance_replaces_idle_resources() {
    let pool = pool(
        manual_config(3, 1, 0)
            .with_interval(Duration::from_secs(1))
            .with_idle_timeout(Duration::ZERO),
    );
    pool.init().await.unwrap();
    assert_eq!(pool.factory().created.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(pool.factory().created.load(Ordering::SeqCst), 2);
    assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
    let conn = pool.pop(Duration::from_millis(10)).await.unwrap();
    assert_eq!(conn.serial, 2);
}

#[tokio::test]
async fn destroy_keeps_only_bound_resources() {
    let pool = pool(manual_config(4, 2, 3));
    pool.init().await.unwrap();
    let ctx = Context::new();
    let _lease = pool.acquire_for(&ctx, None, None).await.unwrap();
    pool.destroy();
    assert!(pool.is_destroyed());
    let status = pool.status();
    assert_eq!(status.created, 1);
    assert_eq!(status.used, status.created);

    // Destroyed pool hands nothing out, and init does not revive it.
    assert!(matches!(
        pool.pop(Duration::from_millis(10)).await,
        Err(Error::PoolExhausted)
    ));
    pool.init().await.unwrap();
    assert!(!pool.is_initialized());

    // The bound resource is discarded once its context ends.
    ctx.finish();
    assert_eq!(pool.status().created, 0);
    assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn reset_reinitializes() {
    let pool = pool(manual_config(4, 2, 0));
    pool.init().await.unwrap();
    let ctx = Context::new();
    let _lease = pool.acquire_for(&ctx, None, None).await.unwrap();
    pool.reset().await.unwrap();
    assert!(pool.is_initialized());
    assert!(!pool.is_destroyed());
    assert_eq!(pool.bound(), 0);
    // Bound resource survives the reset and counts towards the minimum.
    assert_eq!(pool.status().created, 2);

    ctx.finish();
    let status = pool.status();
    assert_eq!(status.created, 2);
    assert_eq!(status.used, 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_pop_releases_reserved_slot() {
    let pool = pool(manual_config(2, 0, 0));
    *pool.factory().create_delay.lock() = Duration::from_secs(1);
    let cancelled =
        tokio::time::timeout(Duration::from_millis(10), pool.pop(Duration::from_secs(5))).await;
    assert!(cancelled.is_err());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(pool.status().created, 0);
    assert_eq!(pool.factory().created.load(Ordering::SeqCst), 0);

    // Same through a cancelled context scope.
    let scoped = pool.clone();
    let cancelled = tokio::time::timeout(
        Duration::from_millis(10),
        Context::new().scope(async move { scoped.acquire().await.map(|_| ()) }),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(pool.status().created, 0);
    assert_eq!(pool.bound(), 0);

    // Full capacity is still available.
    *pool.factory().create_delay.lock() = Duration::ZERO;
    let first = pool.pop(Duration::from_millis(100)).await.unwrap();
    let second = pool.pop(Duration::from_millis(100)).await.unwrap();
    assert_eq!(pool.status().created, 2);
    pool.push(first);
    pool.push(second);
}

#[tokio::test(start_paused = true)]
async fn pop_timeout_covers_slow_factory() {
    let pool = pool(manual_config(2, 0, 0));
    *pool.factory().create_delay.lock() = Duration::from_secs(5);
    let started = Instant::now();
    assert!(matches!(
        pool.pop(Duration::from_millis(100)).await,
        Err(Error::PoolExhausted)
    ));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(pool.status().created, 0);

    let ctx = Context::new();
    assert!(matches!(
        pool.acquire_for(&ctx, None, Some(Duration::from_millis(100))).await,
        Err(Error::PoolExhausted)
    ));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(pool.status().created, 0);
}

#[tokio::test(start_paused = true)]
async fn destroy_during_maintenance_discards_probed_resource() {
    let pool = pool(
        manual_config(2, 1, 0)
            .with_interval(Duration::from_secs(1))
            .with_idle_timeout(Duration::from_secs(3600))
            .with_ping(Duration::from_millis(500)),
    );
    *pool.factory().ping_delay.lock() = Duration::from_secs(2);
    pool.init().await.unwrap();
    assert_eq!(pool.status().created, 1);

    // The first maintenance pass is stuck probing the only idle resource.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(pool.factory().pings.load(Ordering::SeqCst), 1);
    pool.destroy();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(pool.status().created, 0);
    assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
}
