//! Periodic pool maintenance: idle eviction, health probing and top-up.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, trace, trace_span, Instrument};

use crate::{
    factory::{self, Health, ResourceFactory},
    pool::PoolInner,
    resource::Slot,
};

/// How long the idle check waits for each queued resource.
const DRAIN_WAIT: Duration = Duration::from_millis(10);

/// Idle slot taken out of the queue for inspection.
///
/// Discarded on drop, so a pass cancelled mid-probe does not lose track of the resource.
struct Drained<'a, F: ResourceFactory> {
    pool: &'a PoolInner<F>,
    slot: Option<Slot<F::Resource>>,
}

impl<'a, F: ResourceFactory> Drained<'a, F> {
    fn new(pool: &'a PoolInner<F>, slot: Slot<F::Resource>) -> Self {
        Self {
            pool,
            slot: Some(slot),
        }
    }

    fn slot(&mut self) -> &mut Slot<F::Resource> {
        // Never None outside of into_inner().
        self.slot.as_mut().expect("drained slot already taken")
    }

    fn into_inner(mut self) -> Slot<F::Resource> {
        self.slot.take().expect("drained slot already taken")
    }
}

impl<F: ResourceFactory> Drop for Drained<'_, F> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            debug!(
                pool = self.pool.name(),
                id = slot.id,
                "maintenance cancelled, discarding resource"
            );
            self.pool.discard(slot, None);
        }
    }
}

impl<F: ResourceFactory> PoolInner<F> {
    /// Evict idle resources that are expired or unhealthy.
    ///
    /// Only the resources queued when the pass starts are examined. Resources returned while
    /// the pass is running wait for the next one.
    pub(crate) async fn check_free(&self) {
        let Some(queue) = self.queue() else {
            return;
        };
        if queue.is_empty() || queue.is_full() {
            return;
        }
        let idle_timeout = self.config.idle_timeout();
        let mut remaining = queue.len();
        let mut evicted = 0_u64;
        while remaining > 0 {
            remaining -= 1;
            let Some(slot) = queue.pop(DRAIN_WAIT).await else {
                continue;
            };
            let mut drained = Drained::new(self, slot);
            let expired = drained.slot().last_used_at.elapsed() > idle_timeout;
            if expired || self.check_ping(drained.slot()).await == Health::Unhealthy {
                let slot = drained.into_inner();
                trace!(pool = self.name(), id = slot.id, expired, "evicting idle resource");
                self.discard(slot, None);
                evicted += 1;
            } else if let Err(slot) = queue.push(drained.into_inner()) {
                self.discard(slot, None);
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.metrics.evictions.add(evicted, &self.label);
            debug!(pool = self.name(), evicted, "idle resources evicted");
        }
    }

    /// Probe the resource if it was not known to be working for a while.
    pub(crate) async fn check_ping(&self, slot: &mut Slot<F::Resource>) -> Health {
        if slot.last_active_at().elapsed() <= self.config.ping_interval() {
            return Health::Healthy;
        }
        let health = factory::probe(&self.factory, &mut slot.resource).await;
        if health == Health::Healthy {
            slot.last_checked_at = Instant::now();
        }
        health
    }

    /// Create resources until the live count reaches `min_size` and the idle queue reaches
    /// `min_free`, never exceeding `max_size`.
    pub(crate) async fn check_min(&self) {
        let Some(queue) = self.queue() else {
            return;
        };
        let max = self.config.max_size();
        let live = self.live();
        for _ in live..self.config.min_size() {
            if !self.create().await {
                break;
            }
        }
        let live = self.live();
        let idle = queue.len();
        if live < max && idle < self.config.min_free() {
            let wanted = (self.config.min_free() - idle).min(max - live);
            for _ in 0..wanted {
                if !self.create().await {
                    break;
                }
            }
        }
    }

    /// Full maintenance pass.
    pub(crate) async fn interval_check(&self) {
        self.check_free().await;
        self.check_min().await;
        self.record_status();
    }
}

/// Create maintenance task future.
fn maintenance_task<F: ResourceFactory>(inner: &Arc<PoolInner<F>>) -> impl Future<Output = ()> {
    let span = trace_span!("pool_maintenance", pool = inner.name());
    let period = inner.config.interval();
    let pool = Arc::downgrade(inner);
    async move {
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            timer.tick().await;
            let Some(inner) = pool.upgrade() else {
                break;
            };
            inner.interval_check().await;
        }
    }
    .instrument(span)
}

/// Start periodic maintenance task for the pool.
///
/// The task only holds a weak reference, and stops once the pool is dropped.
pub(crate) fn spawn<F: ResourceFactory>(inner: &Arc<PoolInner<F>>) -> JoinHandle<()> {
    tokio::spawn(maintenance_task(inner))
}
