use tokio::sync::broadcast::Receiver;

/// Listens for the server shutdown signal.
///
/// Only a single value is ever sent on the channel, and dropping the sender
/// counts as the signal too. Once observed, connection loops, replica links
/// and the propagation pipeline stop and drop whatever request they had in
/// flight.
#[derive(Debug)]
pub(crate) struct Shutdown {
    /// `true` once the signal has been observed.
    is_shutdown: bool,
    notify: Receiver<()>,
}

impl Shutdown {
    pub(crate) fn new(notify: Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Wait for the shutdown notice.
    pub(crate) async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }

        // Either the value or a closed channel, lagging is impossible with a single send.
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}
