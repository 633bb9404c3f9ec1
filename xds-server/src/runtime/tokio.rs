//! `tokio` based runtime implementation.

use crate::runtime::Runtime;
use std::future::Future;
use std::time::Duration;

/// Tokio-based runtime: connection actors run as tokio tasks.
#[derive(Clone, Debug, Default)]
pub struct TokioRuntime;

impl Runtime for TokioRuntime {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawned_future_runs() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        TokioRuntime.spawn(async move {
            TokioRuntime.sleep(Duration::from_millis(1)).await;
            let _ = tx.send(());
        });
        assert!(rx.await.is_ok());
    }
}
