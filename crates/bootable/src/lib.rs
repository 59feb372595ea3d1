//! Lifecycle contract for coordination services.
//!
//! Services are wired explicitly by their owner and then driven through
//! `start`, `shutdown` and `wait`. There is no container; whoever constructs a
//! service is responsible for booting it.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use async_trait::async_trait;

/// Boxed error returned by lifecycle transitions.
pub type BootError = Box<dyn std::error::Error + Send + Sync>;

/// A service with background work that must be started and stopped.
#[async_trait]
pub trait Bootable
where
    Self: Send + Sync + 'static,
{
    /// Name used in lifecycle logs.
    fn name(&self) -> &str;

    /// Spawn background tasks and register listeners.
    ///
    /// Starting an already started service is a no-op.
    async fn start(&self) -> Result<(), BootError>;

    /// Signal background tasks to stop and wait for them to drain.
    async fn shutdown(&self) -> Result<(), BootError>;

    /// Resolve once every background task has exited.
    async fn wait(&self);
}
