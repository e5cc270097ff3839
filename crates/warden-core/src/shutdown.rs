use tokio::sync::watch;

/// Create the process-wide cancellation pair. Every pipeline task holds a
/// [`ShutdownSignal`] clone and exits at its next suspension point once the
/// [`ShutdownSender`] fires.
pub fn shutdown_channel() -> (ShutdownSender, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownSender(tx), ShutdownSignal(rx))
}

pub struct ShutdownSender(watch::Sender<bool>);

impl ShutdownSender {
    pub fn shutdown(self) {
        let _ = self.0.send(true);
    }
}

#[derive(Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Resolve once shutdown has been requested. Also resolves if the sender
    /// is gone, so tasks never outlive the daemon.
    pub async fn recv(&mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_reaches_every_clone() {
        let (tx, signal) = shutdown_channel();
        let mut a = signal.clone();
        let mut b = signal;
        assert!(!a.is_shutdown());
        tx.shutdown();
        a.recv().await;
        b.recv().await;
        assert!(a.is_shutdown());
    }

    #[tokio::test]
    async fn dropped_sender_releases_waiters() {
        let (tx, mut signal) = shutdown_channel();
        drop(tx);
        signal.recv().await;
    }
}
