//! Liveness watches
//!
//! A [`Watch`] pairs an observed cancellation token with a one-shot action.
//! When the observed token fires the action runs exactly once; cancelling
//! (or dropping) the watch first guarantees the action never runs. Every
//! handle a coordinator stores is paired with one of these, and teardown
//! always cancels the watch before releasing the handle.

use tokio_util::sync::CancellationToken;

/// A one-shot liveness watch on a cancellation token
pub(crate) struct Watch {
    stop: CancellationToken,
}

impl Watch {
    /// Spawn a watch: run `on_fire` when `observed` fires, unless cancelled
    pub(crate) fn spawn<F>(observed: CancellationToken, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = observed.cancelled() => on_fire(),
                _ = stopped.cancelled() => {}
            }
        });
        Self { stop }
    }

    /// Cancel the watch; the action will not run
    pub(crate) fn cancel(&self) {
        self.stop.cancel();
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fires_on_observed_cancel() {
        let observed = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let _watch = Watch::spawn(observed.clone(), move || flag.store(true, Ordering::SeqCst));

        observed.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_watch_never_fires() {
        let observed = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let watch = Watch::spawn(observed.clone(), move || flag.store(true, Ordering::SeqCst));

        watch.cancel();
        observed.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
