//! Structured shutdown tokens
//!
//! A root token fans out to per-subsystem child tokens. Subsystems await
//! `cancelled()` at their suspension points; the runner triggers stages in
//! drain order (adapters first, outcome tracker last).

use tokio::sync::watch;

/// Owning side of a shutdown signal.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

/// Cloneable token handed to tasks.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Signal all tokens. Idempotent.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownToken {
    /// Resolves once the owning `Shutdown` has been triggered.
    /// If the owner was dropped without triggering, treat that as shutdown too.
    pub async fn cancelled(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        loop {
            if self.rx.changed().await.is_err() {
                return;
            }
            if *self.rx.borrow() {
                return;
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_wakes_all_tokens() {
        let root = Shutdown::new();
        let mut a = root.token();
        let mut b = root.token();

        let waiter = tokio::spawn(async move {
            a.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        root.trigger();

        assert!(waiter.await.unwrap());
        b.cancelled().await; // already triggered, returns immediately
        assert!(b.is_cancelled());
    }

    #[tokio::test]
    async fn dropped_owner_counts_as_shutdown() {
        let root = Shutdown::new();
        let mut tok = root.token();
        drop(root);
        tok.cancelled().await;
    }
}
