use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// A handle which can be used to stop a group of related tasks.
/// You can create multiple connected handles by cloning.
///
/// Every background task a [`Socket`](crate::Socket) spawns selects against
/// [`wait`](Shutdown::wait) so that closing the socket unblocks all of them
/// promptly. Pipes carry their own `Shutdown` for the same reason at
/// connection scope.
#[derive(Debug, Clone)]
pub struct Shutdown {
    /// This channel is used to tell the waiting tasks to stop.
    notify: broadcast::Sender<()>,
    /// Set before notifying so that late subscribers still observe the
    /// signal.
    engaged: Arc<AtomicBool>,
}

impl Shutdown {
    /// Creates a new active shutdown.
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            notify,
            engaged: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signals every task waiting on a handle cloned from this one.
    pub fn shut_down(&self) {
        self.engaged.store(true, Ordering::SeqCst);
        // An error here means there are no waiters yet; the engaged flag
        // covers them when they arrive.
        let _ = self.notify.send(());
    }

    /// Whether the shutdown signal has been given.
    pub fn is_shut_down(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    /// Waits until the shutdown signal is given. Returns immediately if it
    /// already was.
    pub async fn wait(&self) {
        let mut recv = self.notify.subscribe();
        if self.is_shut_down() {
            return;
        }
        // Any outcome other than a clean value still means the signal was
        // sent: Lagged means we missed it, Closed cannot happen while we
        // hold `notify`.
        let _ = recv.recv().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wakes_all_clones() {
        let shut0 = Shutdown::new();
        let shuts = [shut0.clone(), shut0.clone(), shut0.clone()];

        shuts[0].shut_down();

        for shut in shuts {
            assert!(shut.is_shut_down());
            shut.wait().await;
        }
    }

    #[tokio::test]
    async fn wait_after_signal_returns_immediately() {
        let shut = Shutdown::new();
        shut.shut_down();
        // No subscriber existed when the signal was sent.
        shut.wait().await;
    }
}
