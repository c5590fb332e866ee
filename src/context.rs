//! Logical contexts: units of concurrent work with an identity and a defined end.
//!
//! A context is entered with [`Context::scope`]. While the scoped future runs,
//! [`Context::current`] returns the context, and hooks registered with [`Context::defer`] are
//! run exactly once when the future completes or is dropped.

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::trace;

tokio::task_local! {
    /// Logical context of the currently executing task, if any.
    static CURRENT_CONTEXT: Context;
}

/// Source of unique context identifiers.
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Hook run at the end of a logical context.
type ExitHook = Box<dyn FnOnce() + Send>;

/// Unique identity of a logical context.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Shared state of a context.
struct ContextInner {
    id: ContextId,
    /// Registered exit hooks. `None` once the context has finished.
    hooks: Mutex<Option<Vec<ExitHook>>>,
}

/// Handle to a logical context.
///
/// Cloning is cheap, all clones refer to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Create new logical context with a fresh identity.
    #[must_use]
    pub fn new() -> Self {
        let id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Arc::new(ContextInner {
                id,
                hooks: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    /// Context identity.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Context of the currently running task, if it runs inside [`Context::scope`].
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT_CONTEXT.try_with(Clone::clone).ok()
    }

    /// Whether exit hooks have already been run.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.hooks.lock().is_none()
    }

    /// Register a hook to run when this context ends.
    ///
    /// If the context has already finished, the hook is run immediately.
    pub fn defer<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut hooks = self.inner.hooks.lock();
        match hooks.as_mut() {
            Some(hooks) => hooks.push(Box::new(hook)),
            None => {
                drop(hooks);
                hook();
            }
        }
    }

    /// End the context, running all registered hooks in reverse registration order.
    ///
    /// Subsequent calls do nothing.
    pub fn finish(&self) {
        let hooks = self.inner.hooks.lock().take();
        if let Some(hooks) = hooks {
            trace!(context = %self.inner.id, hooks = hooks.len(), "context finished");
            for hook in hooks.into_iter().rev() {
                hook();
            }
        }
    }

    /// Run a future as this logical context.
    ///
    /// The context ends when the future completes, or when the returned future is dropped
    /// before completion.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        let _guard = FinishGuard(self.clone());
        CURRENT_CONTEXT.scope(self, fut).await
    }
}

/// Finishes the context on drop, covering both completion and cancellation.
struct FinishGuard(Context);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}
