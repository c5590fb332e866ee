#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(
    missing_docs,
    clippy::doc_link_with_quotes,
    clippy::doc_markdown,
    clippy::missing_errors_doc
)]

mod config;
pub mod context;
pub mod error;
mod factory;
mod maintenance;
mod metrics;
mod pool;
mod queue;
mod resource;

pub use crate::{
    config::{PoolConfig, PoolConfigLoader},
    context::{Context, ContextId},
    error::Error,
    factory::{Health, ResourceFactory},
    pool::{PoolManager, Status},
    resource::{Lease, Pooled},
};
