//! Cooperative cancellation shared by every awaited operation.
//!
//! One [`CancelHandle`] lives in `main` (wired to Ctrl-C); clones of the
//! matching [`CancelSignal`] are passed down to subprocesses, polling loops
//! and HTTP calls. Cancellation always surfaces as [`Error::Cancelled`].

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Create a connected handle/signal pair.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Return `Err(Cancelled)` if cancellation was already requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is requested. Pends forever if the handle
    /// was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Drive `fut` to completion unless cancelled first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Error::Cancelled),
            out = fut => out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_interrupts_sleep() {
        let (handle, signal) = cancel_pair();
        handle.cancel();
        let result = signal.sleep(Duration::from_secs(30)).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(signal.check().is_err());
    }

    #[tokio::test]
    async fn test_never_signal_lets_work_finish() {
        let signal = CancelSignal::never();
        let out = signal.run(async { Ok(7) }).await.unwrap();
        assert_eq!(out, 7);
        assert!(!signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_signal_from_handle_observes_cancel() {
        let (handle, _signal) = cancel_pair();
        let late = handle.signal();
        assert!(!late.is_cancelled());
        handle.cancel();
        assert!(late.is_cancelled());
    }
}
