use std::sync::Arc;

use tokio::sync::broadcast;

/// Bounded fan-out queue connecting pipeline stages.
///
/// Sending never blocks the producer: when a consumer cannot keep up, the
/// channel drops its oldest entries and the consumer observes the drop count
/// through [`broadcast::error::RecvError::Lagged`]. Every receiver holds its
/// own cursor, so delivery is FIFO per consumer.
pub struct Bus<T> {
    tx: broadcast::Sender<Arc<T>>,
}

impl<T> Clone for Bus<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Bus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an item. A send with no live receiver is not an error: the
    /// item is simply not observed.
    pub fn send(&self, item: T) {
        let _ = self.tx.send(Arc::new(item));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<T>> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn fifo_per_receiver() {
        let bus: Bus<u32> = Bus::new(8);
        let mut rx = bus.subscribe();
        bus.send(1);
        bus.send(2);
        assert_eq!(*rx.recv().await.unwrap(), 1);
        assert_eq!(*rx.recv().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_reports_the_count() {
        let bus: Bus<u32> = Bus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.send(i);
        }
        match rx.recv().await {
            Err(RecvError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("expected lag, got {other:?}"),
        }
        // the newest items survive
        assert_eq!(*rx.recv().await.unwrap(), 3);
        assert_eq!(*rx.recv().await.unwrap(), 4);
    }
}
