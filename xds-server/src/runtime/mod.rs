//! Provides abstraction for async runtimes.

use std::future::Future;
use std::time::Duration;

#[cfg(feature = "rt-tokio")]
pub mod tokio;

/// Trait for the async runtime operations the server needs.
///
/// The server spawns one receive actor per connection and uses `sleep` to
/// bound response writes when a send timeout is configured.
pub trait Runtime: Send + Sync + Clone + 'static {
    /// Spawn a future to run in the background.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Sleep for the given duration.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}
