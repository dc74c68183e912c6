use std::sync::Arc;
use tokio::sync::watch;

/// One-way shutdown flag shared by every task. Once cancelled it stays
/// cancelled.
#[derive(Clone, Debug)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true if this call flipped the flag.
    pub fn cancel(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the flag is set. Safe to use inside `select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let cancel = Cancellation::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let c = cancel.clone();
                tokio::spawn(async move { c.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cancel.cancel());

        for w in waiters {
            tokio::time::timeout(Duration::from_secs(1), w)
                .await
                .expect("waiter did not observe cancellation")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_cancel_is_monotonic() {
        let cancel = Cancellation::new();
        assert!(!cancel.is_cancelled());
        assert!(cancel.cancel());
        assert!(!cancel.cancel());
        assert!(cancel.is_cancelled());
        // Already-fired signal resolves immediately for late subscribers.
        tokio::time::timeout(Duration::from_millis(100), cancel.cancelled())
            .await
            .unwrap();
    }
}
