//! Abstract task scheduler (§5, §6 `TaskScheduler`).
//!
//! The crate does not assume a single-threaded event loop; it only requires a
//! way to spawn background work and to sleep cancellably. Sleeps are
//! themselves a suspension point: [`TaskScheduler::sleep`] checks the
//! context before sleeping and races the sleep against cancellation, so a
//! retry backoff or a timeout can be interrupted immediately rather than
//! waiting out the full duration.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::cancellation::CancellationContext;
use crate::error::OlpError;

/// A spawned unit of work, matching `tokio::task::JoinHandle`'s fire-and-forget
/// usage in this crate (we never need to join spawned tasks from here).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Abstract scheduler, injected so components stay runtime-agnostic in tests.
pub trait TaskScheduler: Send + Sync {
    /// Spawn `task` to run independently of the caller.
    fn spawn(&self, task: BoxFuture<'static, ()>);

    /// Sleep for `duration`, or return `Err(Cancelled)` immediately if
    /// `context` is cancelled before or during the sleep.
    fn sleep<'a>(
        &'a self,
        duration: Duration,
        context: &'a CancellationContext,
    ) -> BoxFuture<'a, Result<(), OlpError>>;
}

/// Default [`TaskScheduler`] backed by the Tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl TaskScheduler for TokioScheduler {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }

    fn sleep<'a>(
        &'a self,
        duration: Duration,
        context: &'a CancellationContext,
    ) -> BoxFuture<'a, Result<(), OlpError>> {
        Box::pin(async move {
            context.check()?;
            let (tx, rx) = tokio::sync::oneshot::channel::<()>();
            let tx = std::sync::Mutex::new(Some(tx));
            let attach_result = context.attach(Box::new(move || {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }));
            let attach_id = match attach_result {
                Ok(id) => Some(id),
                Err(_) => return Err(OlpError::Cancelled),
            };
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    if let Some(id) = attach_id {
                        context.detach(id);
                    }
                    Ok(())
                }
                _ = rx => Err(OlpError::Cancelled),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_completes_without_cancellation() {
        let scheduler = TokioScheduler;
        let ctx = CancellationContext::new();
        let result = scheduler.sleep(Duration::from_millis(5), &ctx).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn sleep_is_interrupted_by_cancellation() {
        let scheduler = TokioScheduler;
        let ctx = CancellationContext::new();
        let ctx2 = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            ctx2.cancel();
        });
        let result = scheduler.sleep(Duration::from_secs(10), &ctx).await;
        assert!(matches!(result, Err(OlpError::Cancelled)));
    }

    #[tokio::test]
    async fn sleep_on_already_cancelled_context_returns_immediately() {
        let scheduler = TokioScheduler;
        let ctx = CancellationContext::new();
        ctx.cancel();
        let result = scheduler.sleep(Duration::from_secs(10), &ctx).await;
        assert!(matches!(result, Err(OlpError::Cancelled)));
    }
}
