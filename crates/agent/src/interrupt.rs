use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("interrupted by user")]
pub struct Interrupted;

/// Shared interrupt flag raced against every suspension point of a run.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortState>,
}

#[derive(Default)]
struct AbortState {
    triggered: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Clears the flag so a retried phase can run again.
    pub fn reset(&self) {
        self.inner.triggered.store(false, Ordering::SeqCst);
    }

    pub async fn triggered(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }

    /// Runs `future` unless the signal fires first. The losing future is dropped.
    pub async fn guard<F>(&self, future: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        if self.is_triggered() {
            return Err(Interrupted);
        }
        tokio::select! {
            biased;
            _ = self.triggered() => Err(Interrupted),
            output = future => Ok(output),
        }
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal").field("triggered", &self.is_triggered()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{AbortSignal, Interrupted};

    #[tokio::test]
    async fn guard_passes_output_through_when_quiet() {
        let signal = AbortSignal::new();
        assert_eq!(signal.guard(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn trigger_interrupts_a_pending_future() {
        let signal = AbortSignal::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger();
        });

        let result = signal.guard(std::future::pending::<()>()).await;
        assert_eq!(result, Err(Interrupted));
    }

    #[tokio::test]
    async fn reset_allows_new_work() {
        let signal = AbortSignal::new();
        signal.trigger();
        assert_eq!(signal.guard(async { 1 }).await, Err(Interrupted));

        signal.reset();
        assert_eq!(signal.guard(async { 2 }).await, Ok(2));
    }
}
