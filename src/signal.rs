//! A tiny broadcast flag used for cancellation and shutdown.

use tokio::sync::watch;

/// A clonable one-way flag.
///
/// Every blocking operation in this crate that may need to be abandoned from
/// the outside accepts a `Flag`; tripping it is idempotent and wakes every
/// task currently waiting in [`Flag::triggered`].
#[derive(Debug, Clone)]
pub struct Flag {
    tx: ::std::sync::Arc<watch::Sender<bool>>,
}

impl Flag {
    /// Create an untripped flag.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Flag {
            tx: ::std::sync::Arc::new(tx),
        }
    }

    /// Trip the flag, waking all waiters. Further calls are no-ops.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the flag has been tripped.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the flag trips. Returns immediately if it already has.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for returns an error only if the sender is dropped, which
        // cannot happen while &self holds it alive.
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Flag {
    fn default() -> Self {
        Flag::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn trigger_wakes_waiters() {
        let flag = Flag::new();
        assert!(!flag.is_triggered());

        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.triggered().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        flag.trigger();
        flag.trigger(); // idempotent

        waiter.await.unwrap();
        assert!(flag.is_triggered());
    }

    #[tokio::test]
    async fn triggered_returns_immediately_when_set() {
        let flag = Flag::new();
        flag.trigger();
        flag.triggered().await;
    }
}
