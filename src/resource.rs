//! Pooled resource wrappers.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use tokio::{
    sync::{MappedMutexGuard, Mutex, MutexGuard},
    time::Instant,
};
use tracing::warn;

use crate::{context::ContextId, error::Error, factory::ResourceFactory, pool::PoolInner};

/// Resource together with pool-private bookkeeping.
pub(crate) struct Slot<R> {
    /// Sequential per-pool resource number.
    pub(crate) id: u64,
    /// Time of the last return to the idle queue.
    pub(crate) last_used_at: Instant,
    /// Time of the last successful health probe.
    pub(crate) last_checked_at: Instant,
    /// Original resource.
    pub(crate) resource: R,
}

impl<R> Slot<R> {
    pub(crate) fn new(id: u64, resource: R) -> Self {
        let now = Instant::now();
        Self {
            id,
            last_used_at: now,
            last_checked_at: now,
            resource,
        }
    }

    /// Mark the resource as just used.
    pub(crate) fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    /// Most recent moment the resource was known to be working.
    pub(crate) fn last_active_at(&self) -> Instant {
        self.last_used_at.max(self.last_checked_at)
    }
}

/// Resource checked out of the pool.
///
/// Must be handed back with [`PoolManager::push`]. If dropped instead, the resource is
/// discarded and the pool's live count shrinks accordingly.
///
/// [`PoolManager::push`]: crate::PoolManager::push
pub struct Pooled<F: ResourceFactory> {
    /// Checked out slot. Only `None` while being handed back.
    slot: Option<Slot<F::Resource>>,
    /// Originating pool.
    pool: Weak<PoolInner<F>>,
    /// Checkout time.
    checked_out_at: Instant,
}

impl<F: ResourceFactory> Pooled<F> {
    pub(crate) fn new(slot: Slot<F::Resource>, pool: Weak<PoolInner<F>>) -> Self {
        Self {
            slot: Some(slot),
            pool,
            checked_out_at: Instant::now(),
        }
    }

    /// Sequential number of the resource within its pool.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.slot.as_ref().map_or(0, |slot| slot.id)
    }

    /// Whether this resource was checked out of the given pool.
    pub(crate) fn belongs_to(&self, pool: &Arc<PoolInner<F>>) -> bool {
        Weak::ptr_eq(&self.pool, &Arc::downgrade(pool))
    }

    /// Take the slot out, leaving nothing for the destructor to discard.
    pub(crate) fn take(&mut self) -> Option<(Slot<F::Resource>, Instant)> {
        self.slot.take().map(|slot| (slot, self.checked_out_at))
    }
}

impl<F: ResourceFactory> Deref for Pooled<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        // Never None outside of take(), which consumes the wrapper right after.
        &self.slot.as_ref().expect("pooled resource already returned").resource
    }
}

impl<F: ResourceFactory> DerefMut for Pooled<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Never None outside of take(), which consumes the wrapper right after.
        &mut self.slot.as_mut().expect("pooled resource already returned").resource
    }
}

impl<F: ResourceFactory> fmt::Debug for Pooled<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled").field("id", &self.id()).finish()
    }
}

impl<F: ResourceFactory> Drop for Pooled<F> {
    fn drop(&mut self) {
        if let Some((slot, checked_out_at)) = self.take() {
            match self.pool.upgrade() {
                Some(pool) => pool.discard(slot, Some(checked_out_at)),
                None => drop(slot),
            }
        }
    }
}

/// Association of one checked out resource with one logical context.
pub(crate) struct Binding<F: ResourceFactory> {
    /// Owning context.
    pub(crate) context: ContextId,
    /// Resource number, readable without locking.
    pub(crate) id: u64,
    /// Set once the binding was returned or discarded.
    settled: AtomicBool,
    /// Bound resource.
    pooled: Mutex<Option<Pooled<F>>>,
}

impl<F: ResourceFactory> Binding<F> {
    pub(crate) fn new(context: ContextId, pooled: Pooled<F>) -> Self {
        Self {
            context,
            id: pooled.id(),
            settled: AtomicBool::new(false),
            pooled: Mutex::new(Some(pooled)),
        }
    }

    /// Settle the binding, taking the resource out of it.
    ///
    /// Only the first call may yield the resource. If the resource is locked by a lease at
    /// that moment, it stays inside and is discarded when the last lease goes away.
    pub(crate) fn take(&self) -> Option<Pooled<F>> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return None;
        }
        match self.pooled.try_lock() {
            Ok(mut pooled) => pooled.take(),
            Err(_) => {
                warn!(
                    context = %self.context,
                    id = self.id,
                    "bound resource still in use on release, it will be discarded"
                );
                None
            }
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}

/// Shared handle to the resource bound to a logical context.
///
/// All leases acquired within one context refer to the same resource. The resource is
/// returned to the pool when the context ends.
pub struct Lease<F: ResourceFactory> {
    binding: Arc<Binding<F>>,
}

impl<F: ResourceFactory> Clone for Lease<F> {
    fn clone(&self) -> Self {
        Self {
            binding: self.binding.clone(),
        }
    }
}

impl<F: ResourceFactory> fmt::Debug for Lease<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("context", &self.binding.context)
            .field("id", &self.binding.id)
            .field("released", &self.is_released())
            .finish()
    }
}

impl<F: ResourceFactory> Lease<F> {
    pub(crate) fn new(binding: Arc<Binding<F>>) -> Self {
        Self { binding }
    }

    /// Lock the bound resource for exclusive use.
    ///
    /// Nested work within one context waits for the previous user to drop its guard.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LeaseReleased`] if the binding has already been released.
    pub async fn get(&self) -> Result<MappedMutexGuard<'_, F::Resource>, Error> {
        let guard = self.binding.pooled.lock().await;
        if self.binding.is_settled() {
            return Err(Error::LeaseReleased);
        }
        MutexGuard::try_map(guard, |pooled| pooled.as_mut().map(|p| &mut **p))
            .map_err(|_| Error::LeaseReleased)
    }

    /// Context this lease is bound to.
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.binding.context
    }

    /// Sequential number of the bound resource within its pool.
    #[must_use]
    pub fn resource_id(&self) -> u64 {
        self.binding.id
    }

    /// Whether the binding has been returned or discarded.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.binding.is_settled()
    }

    /// Whether two leases share the same binding.
    #[must_use]
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.binding, &other.binding)
    }
}
