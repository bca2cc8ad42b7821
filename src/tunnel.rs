use tokio::sync::mpsc;

/// Lifecycle of a tunneled connection, shared by both peers.
///
/// Internal-side tunnels start in `Connecting`; public-side tunnels are
/// `Idle` as soon as the greeting is parsed. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Idle,
    Busy,
    Closed,
}

/// Edge-triggered status-change signal.
///
/// The channel has capacity 1 and the send never blocks: a signal that
/// would block is dropped, since the listener will observe the current
/// state on its next wake anyway. This keeps a burst of status changes
/// from queueing redundant wakeups.
#[derive(Debug, Clone)]
pub struct StatusNotifier {
    tx: mpsc::Sender<()>,
}

impl StatusNotifier {
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_coalesces_instead_of_queueing() {
        let (notifier, mut rx) = StatusNotifier::new();
        notifier.notify();
        notifier.notify();
        notifier.notify();

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
