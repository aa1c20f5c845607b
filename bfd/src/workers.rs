//! Worker pool boundary
//!
//! The pool that actually fetches provider data is owned elsewhere; the
//! scheduler only starts it alongside the loops and stops it on shutdown.

use async_trait::async_trait;
use eyre::Result;

/// Lifecycle of the provider worker pool
#[async_trait]
pub trait WorkerPool: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}
