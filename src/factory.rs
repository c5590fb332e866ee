//! Resource factory: the pluggable part that actually opens, checks and closes connections.

use std::{error::Error as StdError, panic::AssertUnwindSafe};

use futures::FutureExt;
use serde::de::DeserializeOwned;
use tracing::warn;

/// Outcome of a resource health probe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Health {
    /// Resource answered the probe and may be reused.
    Healthy,
    /// Resource failed the probe, or the probe itself failed, and must be evicted.
    Unhealthy,
}

/// Creates, probes and tears down pooled resources.
#[async_trait::async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    /// Resource type managed by the pool.
    type Resource: Send + 'static;
    /// Factory-specific configuration, such as a DSN and credentials.
    ///
    /// Initial value is taken from [`PoolConfig::extra`], falling back to
    /// [`Default::default`].
    ///
    /// [`PoolConfig::extra`]: crate::PoolConfig::extra
    type Config: Clone + Default + DeserializeOwned + Send + Sync + 'static;
    /// Error returned by factory operations.
    type Error: StdError + Send + Sync + 'static;

    /// Open a new resource.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the resource could not be opened. The pool recovers by itself.
    async fn create(&self, config: &Self::Config) -> Result<Self::Resource, Self::Error>;

    /// Perform a minimal round trip (`SELECT 1` or similar) to check that the resource works.
    ///
    /// Default implementation considers every resource healthy.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the resource is not usable anymore.
    async fn ping(&self, _resource: &mut Self::Resource) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Tear down a resource that leaves the pool.
    ///
    /// Default implementation simply drops it.
    fn destroy(&self, resource: Self::Resource) {
        drop(resource);
    }
}

/// Run the health probe, classifying errors and panics as [`Health::Unhealthy`].
pub(crate) async fn probe<F: ResourceFactory>(factory: &F, resource: &mut F::Resource) -> Health {
    match AssertUnwindSafe(factory.ping(resource)).catch_unwind().await {
        Ok(Ok(())) => Health::Healthy,
        Ok(Err(err)) => {
            warn!(error = %err, "health probe failed");
            Health::Unhealthy
        }
        Err(_) => {
            warn!("health probe panicked");
            Health::Unhealthy
        }
    }
}

/// Open a resource, converting errors and panics to `None`.
pub(crate) async fn create<F: ResourceFactory>(
    factory: &F,
    config: &F::Config,
) -> Option<F::Resource> {
    match AssertUnwindSafe(factory.create(config)).catch_unwind().await {
        Ok(Ok(resource)) => Some(resource),
        Ok(Err(err)) => {
            warn!(error = %err, "resource factory failed");
            None
        }
        Err(_) => {
            warn!("resource factory panicked");
            None
        }
    }
}
