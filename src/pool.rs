//! Context-bound pool manager.

use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use opentelemetry::KeyValue;
use parking_lot::{Mutex, RwLock};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, debug_span, info, trace, Instrument};

use crate::{
    config::PoolConfig,
    context::{Context, ContextId},
    error::Error,
    factory::{self, ResourceFactory},
    metrics::{pool_kv, Metrics, POOL_METRICS},
    queue::IdleQueue,
    resource::{Binding, Lease, Pooled, Slot},
};

/// Extra idle queue capacity on top of the maximum pool size.
const QUEUE_SLACK: usize = 8;

/// Number of times [`PoolManager::pop`] tries to grow the pool before giving up.
const POP_RETRIES: usize = 3;

type SlotQueue<F> = IdleQueue<Slot<<F as ResourceFactory>::Resource>>;

/// Point-in-time pool counts.
///
/// Not synchronized with concurrent pool operations, so only advisory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Status {
    /// Resources currently created, idle or checked out.
    pub created: usize,
    /// Resources currently checked out.
    pub used: usize,
    /// Configured maximum pool size.
    pub max: usize,
    /// Configured minimum pool size.
    pub min: usize,
}

/// One unit of the live count, claimed before a resource is created.
///
/// Dropping an uncommitted reservation gives the unit back, so creation cancelled at an
/// await point leaves the count intact.
struct Reservation<'a, F: ResourceFactory> {
    pool: &'a PoolInner<F>,
    committed: bool,
}

impl<'a, F: ResourceFactory> Reservation<'a, F> {
    /// Claim a unit if the pool is below its maximum size.
    fn acquire(pool: &'a PoolInner<F>) -> Option<Self> {
        let max = pool.config.max_size();
        pool.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| Self {
                pool,
                committed: false,
            })
    }

    /// Keep the unit. It is given back when the created resource is discarded.
    fn commit(mut self) {
        self.committed = true;
    }
}

impl<F: ResourceFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if !self.committed {
            self.pool.release_reservation();
        }
    }
}

/// Shared pool state.
pub(crate) struct PoolInner<F: ResourceFactory> {
    /// Pool configuration.
    pub(crate) config: PoolConfig,
    /// Resource factory.
    pub(crate) factory: F,
    /// Active factory configuration. `None` until set by init or acquisition.
    factory_config: RwLock<Option<Arc<F::Config>>>,
    /// Number of created resources, idle or checked out.
    live: AtomicUsize,
    /// Source of per-pool resource numbers.
    next_id: AtomicU64,
    /// Set by destroy, cleared by reset.
    destroyed: AtomicBool,
    /// Idle resources. `None` while uninitialized or destroyed.
    queue: RwLock<Option<Arc<SlotQueue<F>>>>,
    /// Resources bound to logical contexts.
    bindings: Mutex<HashMap<ContextId, Arc<Binding<F>>>>,
    /// Maintenance task handle.
    timer: Mutex<Option<JoinHandle<()>>>,
    /// Serializes init and reset.
    lifecycle: tokio::sync::Mutex<()>,
    /// Pool label.
    pub(crate) label: [KeyValue; 1],
    /// Linked metrics storage.
    pub(crate) metrics: Arc<Metrics>,
}

impl<F: ResourceFactory> PoolInner<F> {
    /// Current idle queue, if the pool is initialized.
    pub(crate) fn queue(&self) -> Option<Arc<SlotQueue<F>>> {
        self.queue.read().clone()
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Pool name for logs.
    pub(crate) fn name(&self) -> &str {
        self.config.name().unwrap_or("default")
    }

    /// Create one resource and put it into the idle queue.
    ///
    /// Returns `false` on any failure; factory errors are logged, never propagated.
    pub(crate) async fn create(&self) -> bool {
        if self.is_destroyed() {
            return false;
        }
        let Some(queue) = self.queue() else {
            return false;
        };
        let Some(reservation) = Reservation::acquire(self) else {
            return false;
        };
        let config = self.factory_config.read().clone().unwrap_or_default();
        let Some(resource) = factory::create(&self.factory, &config).await else {
            return false;
        };
        // From here on the slot owns its share of the live count.
        reservation.commit();
        let slot = Slot::new(self.next_id.fetch_add(1, Ordering::Relaxed), resource);
        let id = slot.id;
        if self.is_destroyed() {
            self.discard(slot, None);
            return false;
        }
        match queue.push(slot) {
            Ok(()) => {
                trace!(pool = self.name(), id, "resource created");
                true
            }
            Err(slot) => {
                self.discard(slot, None);
                false
            }
        }
    }

    /// Return a checked out resource to the idle queue.
    pub(crate) fn push(&self, mut pooled: Pooled<F>) -> bool {
        let Some((mut slot, checked_out_at)) = pooled.take() else {
            return true;
        };
        if self.is_destroyed() {
            self.discard(slot, Some(checked_out_at));
            return false;
        }
        self.metrics
            .use_time
            .record(checked_out_at.elapsed().as_secs_f64(), &self.label);
        slot.touch();
        let Some(queue) = self.queue() else {
            self.discard(slot, None);
            return false;
        };
        match queue.push(slot) {
            Ok(()) => true,
            Err(slot) => {
                debug!(pool = self.name(), id = slot.id, "idle queue full, discarding");
                self.discard(slot, None);
                false
            }
        }
    }

    /// Tear down a resource and drop it from the live count.
    pub(crate) fn discard(&self, slot: Slot<F::Resource>, checked_out_at: Option<Instant>) {
        if let Some(checked_out_at) = checked_out_at {
            self.metrics
                .use_time
                .record(checked_out_at.elapsed().as_secs_f64(), &self.label);
        }
        trace!(pool = self.name(), id = slot.id, "resource discarded");
        self.factory.destroy(slot.resource);
        self.release_reservation();
    }

    fn release_reservation(&self) {
        // Never wraps, even if a stray resource outlives a reset.
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Forget a binding, if it is still the one registered for its context.
    fn unbind(&self, binding: &Arc<Binding<F>>) {
        let mut bindings = self.bindings.lock();
        if bindings
            .get(&binding.context)
            .is_some_and(|current| Arc::ptr_eq(current, binding))
        {
            bindings.remove(&binding.context);
        }
    }

    /// Clear a binding, pushing its resource back to the idle queue.
    pub(crate) fn return_binding(&self, binding: &Arc<Binding<F>>) {
        self.unbind(binding);
        if let Some(pooled) = binding.take() {
            trace!(pool = self.name(), context = %binding.context, "binding returned");
            self.push(pooled);
        }
    }

    /// Clear a binding, discarding its resource.
    pub(crate) fn discard_binding(&self, binding: &Arc<Binding<F>>) {
        self.unbind(binding);
        if let Some(pooled) = binding.take() {
            trace!(pool = self.name(), context = %binding.context, "binding discarded");
            drop(pooled);
        }
    }

    pub(crate) fn status(&self) -> Status {
        let created = self.live();
        let idle = self.queue().map_or(0, |queue| queue.len());
        Status {
            created,
            used: created.saturating_sub(idle),
            max: self.config.max_size(),
            min: self.config.min_size(),
        }
    }

    pub(crate) fn record_status(&self) {
        self.metrics.record_status(&self.label, &self.status());
    }

    /// Stop maintenance, drain and close the idle queue.
    fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        if let Some(task) = self.timer.lock().take() {
            task.abort();
        }
        let queue = self.queue.write().take();
        if let Some(queue) = queue {
            let drained = queue.close();
            let count = drained.len();
            for slot in drained {
                self.discard(slot, None);
            }
            info!(pool = self.name(), discarded = count, "pool destroyed");
        }
        self.record_status();
    }
}

impl<F: ResourceFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        if let Some(task) = self.timer.get_mut().take() {
            task.abort();
        }
        if let Some(queue) = self.queue.get_mut().take() {
            for slot in queue.close() {
                self.factory.destroy(slot.resource);
            }
        }
    }
}

/// Bounded pool of expensive resources with per-context bindings.
///
/// The pool is created uninitialized and initializes itself on first use, or explicitly
/// via [`PoolManager::init`]. Cloning is cheap, all clones share the same pool.
pub struct PoolManager<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Clone for PoolManager<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ResourceFactory> fmt::Debug for PoolManager<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("name", &self.inner.name())
            .field("status", &self.inner.status())
            .field("destroyed", &self.inner.is_destroyed())
            .finish()
    }
}

impl<F: ResourceFactory> PoolManager<F> {
    /// Create uninitialized pool.
    pub fn new(config: PoolConfig, factory: F) -> Self {
        let label = pool_kv(config.name().map(|name| Cow::Owned(name.to_owned())));
        let metrics = POOL_METRICS.deref().clone();
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                factory_config: RwLock::new(None),
                live: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                destroyed: AtomicBool::new(false),
                queue: RwLock::new(None),
                bindings: Mutex::new(HashMap::new()),
                timer: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                label,
                metrics,
            }),
        }
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Resource factory.
    #[must_use]
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Whether the pool has been initialized and not destroyed since.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        !self.inner.is_destroyed() && self.inner.queue.read().is_some()
    }

    /// Whether the pool has been destroyed and not reset since.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Initialize the pool: create the idle queue, pre-warm it and start maintenance.
    ///
    /// Does nothing if the pool is already initialized, or if it was destroyed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if `min_size` is not less than `max_size`, or if
    /// extra settings cannot be parsed as factory configuration. The pool stays uninitialized.
    pub async fn init(&self) -> Result<(), Error> {
        if self.is_initialized() || self.inner.is_destroyed() {
            return Ok(());
        }
        let _lock = self.inner.lifecycle.lock().await;
        self.init_locked().await
    }

    async fn init_locked(&self) -> Result<(), Error> {
        let inner = &self.inner;
        if inner.is_destroyed() || inner.queue.read().is_some() {
            return Ok(());
        }
        inner.config.validate()?;
        let extra = inner.config.extra_as::<F::Config>()?;
        {
            let mut factory_config = inner.factory_config.write();
            if factory_config.is_none() {
                *factory_config = extra.map(Arc::new);
            }
        }
        if let Some(task) = inner.timer.lock().take() {
            task.abort();
        }
        inner.bindings.lock().clear();
        let capacity = inner.config.max_size() + QUEUE_SLACK;
        *inner.queue.write() = Some(Arc::new(IdleQueue::new(capacity)));
        inner.check_min().await;
        if !inner.config.interval().is_zero() && !inner.is_destroyed() {
            *inner.timer.lock() = Some(crate::maintenance::spawn(&self.inner));
        }
        inner.record_status();
        info!(
            pool = inner.name(),
            live = inner.live(),
            max = inner.config.max_size(),
            min = inner.config.min_size(),
            "pool initialized"
        );
        Ok(())
    }

    /// Destroy and re-initialize the pool.
    ///
    /// Resources still bound to contexts are not lost: they are accepted back by the new idle
    /// queue when their contexts end.
    ///
    /// # Errors
    ///
    /// See [`PoolManager::init`].
    pub async fn reset(&self) -> Result<(), Error> {
        let _lock = self.inner.lifecycle.lock().await;
        self.inner.destroy();
        self.inner.bindings.lock().clear();
        self.inner.destroyed.store(false, Ordering::Release);
        self.init_locked().await
    }

    /// Destroy the pool: stop maintenance and discard all idle resources.
    ///
    /// Resources still checked out are discarded when they come back. The pool stays unusable
    /// until [`PoolManager::reset`] is called.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    /// Snapshot of pool counts.
    #[must_use]
    pub fn status(&self) -> Status {
        self.inner.status()
    }

    /// Number of contexts currently holding a resource.
    #[must_use]
    pub fn bound(&self) -> usize {
        self.inner.bindings.lock().len()
    }

    /// Create one resource and put it into the idle queue.
    ///
    /// Returns `false` if the pool is not initialized, destroyed, full, or if the factory
    /// failed.
    pub async fn create(&self) -> bool {
        self.inner.create().await
    }

    /// Take an idle resource out of the pool, growing the pool if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if the pool is destroyed, or no resource became
    /// available within `timeout`. Returns [`Error::ConfigInvalid`] if lazy initialization
    /// failed.
    pub async fn pop(&self, timeout: Duration) -> Result<Pooled<F>, Error> {
        if self.inner.is_destroyed() {
            return Err(Error::PoolExhausted);
        }
        self.init().await?;
        let Some(queue) = self.inner.queue() else {
            return Err(Error::PoolExhausted);
        };
        let deadline = Instant::now() + timeout;
        // Resource creation counts against the deadline too.
        match tokio::time::timeout_at(deadline, self.take_idle(&queue, deadline)).await {
            Ok(Some(slot)) => Ok(Pooled::new(slot, Arc::downgrade(&self.inner))),
            Ok(None) | Err(_) => {
                self.inner.metrics.timeouts.add(1, &self.inner.label);
                Err(Error::PoolExhausted)
            }
        }
    }

    /// Pop an idle slot, creating up to [`POP_RETRIES`] resources before waiting for one.
    async fn take_idle(
        &self,
        queue: &SlotQueue<F>,
        deadline: Instant,
    ) -> Option<Slot<F::Resource>> {
        let max = self.inner.config.max_size();
        let mut retries = POP_RETRIES;
        loop {
            if let Some(slot) = queue.try_pop() {
                return Some(slot);
            }
            if retries > 0 && self.inner.live() < max && !self.inner.is_destroyed() {
                retries -= 1;
                self.inner.create().await;
                continue;
            }
            return queue
                .pop(deadline.saturating_duration_since(Instant::now()))
                .await;
        }
    }

    /// Return a resource obtained by [`PoolManager::pop`] to the idle queue.
    ///
    /// Returns `false` if the resource was discarded instead, because the pool is destroyed
    /// or the idle queue is full.
    pub fn push(&self, pooled: Pooled<F>) -> bool {
        if !pooled.belongs_to(&self.inner) {
            debug!(pool = self.inner.name(), "foreign resource pushed, discarding");
            return false;
        }
        self.inner.push(pooled)
    }

    /// Tear down a resource obtained by [`PoolManager::pop`].
    pub fn discard(&self, pooled: Pooled<F>) {
        drop(pooled);
    }

    /// Acquire the resource bound to the given context, binding one if needed.
    ///
    /// Repeated calls within the same context return leases on the same resource. When the
    /// context ends, the resource goes back to the idle queue.
    ///
    /// If `factory_config` is set, it becomes the active factory configuration of the whole
    /// pool before any new resource is created. Concurrent acquisitions with different
    /// factory configurations race with each other.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoContext`] if the context has already ended, and
    /// [`Error::PoolExhausted`] if no resource became available within `timeout` (by default
    /// [`PoolConfig::acquire_timeout`]).
    pub async fn acquire_for(
        &self,
        context: &Context,
        factory_config: Option<F::Config>,
        timeout: Option<Duration>,
    ) -> Result<Lease<F>, Error> {
        let ctx_id = context.id();
        if context.is_finished() {
            return Err(Error::NoContext);
        }
        if let Some(binding) = self.inner.bindings.lock().get(&ctx_id).cloned() {
            trace!(pool = self.inner.name(), context = %ctx_id, "reusing bound resource");
            return Ok(Lease::new(binding));
        }
        if let Some(factory_config) = factory_config {
            *self.inner.factory_config.write() = Some(Arc::new(factory_config));
        }
        let started = Instant::now();
        let span = debug_span!("pool_acquire", pool = self.inner.name(), context = %ctx_id);
        let pooled = self
            .pop(timeout.unwrap_or(self.inner.config.acquire_timeout()))
            .instrument(span)
            .await?;
        self.inner
            .metrics
            .wait_time
            .record(started.elapsed().as_secs_f64(), &self.inner.label);
        let binding = Arc::new(Binding::new(ctx_id, pooled));
        {
            let mut bindings = self.inner.bindings.lock();
            if let Some(existing) = bindings.get(&ctx_id).cloned() {
                // Another task of the same context won the race.
                drop(bindings);
                if let Some(pooled) = binding.take() {
                    self.inner.push(pooled);
                }
                return Ok(Lease::new(existing));
            }
            bindings.insert(ctx_id, binding.clone());
        }
        let pool = Arc::downgrade(&self.inner);
        let hook_binding = binding.clone();
        context.defer(move || {
            if let Some(pool) = pool.upgrade() {
                pool.return_binding(&hook_binding);
            }
        });
        debug!(
            pool = self.inner.name(),
            context = %ctx_id,
            id = binding.id,
            "resource bound"
        );
        Ok(Lease::new(binding))
    }

    /// Acquire the resource bound to the current logical context.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoContext`] outside of [`Context::scope`], otherwise see
    /// [`PoolManager::acquire_for`].
    pub async fn acquire(&self) -> Result<Lease<F>, Error> {
        let context = Context::current().ok_or(Error::NoContext)?;
        self.acquire_for(&context, None, None).await
    }

    /// Release the context's binding early, **discarding** the resource.
    ///
    /// This is the way to force-evict a resource suspected to be broken. Use
    /// [`PoolManager::return_binding`] for a normal early return. Returns `false` if the
    /// context had no binding.
    pub fn discard_binding(&self, context: ContextId) -> bool {
        let binding = self.inner.bindings.lock().get(&context).cloned();
        match binding {
            Some(binding) => {
                self.inner.discard_binding(&binding);
                true
            }
            None => false,
        }
    }

    /// Release the context's binding early, returning the resource to the idle queue.
    ///
    /// Returns `false` if the context had no binding.
    pub fn return_binding(&self, context: ContextId) -> bool {
        let binding = self.inner.bindings.lock().get(&context).cloned();
        match binding {
            Some(binding) => {
                self.inner.return_binding(&binding);
                true
            }
            None => false,
        }
    }

    /// Evict idle resources that are expired or unhealthy.
    pub async fn check_free(&self) {
        self.inner.check_free().await;
    }

    /// Top the pool up to its minimum size and idle floor, initializing it if needed.
    ///
    /// # Errors
    ///
    /// See [`PoolManager::init`].
    pub async fn check_min(&self) -> Result<(), Error> {
        self.init().await?;
        self.inner.check_min().await;
        Ok(())
    }

    /// Run one maintenance pass: eviction, then top-up.
    pub async fn interval_check(&self) {
        self.inner.interval_check().await;
    }
}
