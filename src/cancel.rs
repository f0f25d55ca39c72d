//! Cooperative cancellation, threaded into workers and handlers.
//!
//! A [`CancelToken`] is a cheap clone of a `tokio::sync::watch`
//! receiver. Handlers poll [`CancelToken::is_cancelled`] between units
//! of work; the server and worker loops await [`CancelToken::cancelled`]
//! for graceful shutdown. There is no hidden global: whoever constructs
//! the pipeline owns the [`CancelHandle`].

use tokio::sync::watch;

/// Create a linked (handle, token) pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Owner side: signals cancellation to every cloned token.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observer side, cloned into every worker and handler invocation.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that never fires. Useful for one-shot CLI commands.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is signalled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Handle dropped without cancelling; stay pending.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_observed_by_all_clones() {
        let (handle, token) = cancel_pair();
        let clone = token.clone();
        assert!(!token.is_cancelled());

        handle.cancel();
        assert!(token.is_cancelled());
        assert!(clone.is_cancelled());
        clone.cancelled().await;
    }

    #[tokio::test]
    async fn never_token_stays_live() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
    }
}
