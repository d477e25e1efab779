//! Per-connection bridge queue
//!
//! Turns the push-based fan-out of the registry into a pull-based sequence
//! for one stream. The producing half is a [`LogObserver`] whose enqueue
//! never blocks and never logs; the consuming half is polled by the stream
//! driver with a bounded wait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use crate::error::{Error, Result};
use crate::registry::{LogMessage, LogObserver};

enum QueueSender {
    Bounded(mpsc::Sender<LogMessage>),
    Unbounded(mpsc::UnboundedSender<LogMessage>),
}

enum QueueReceiver {
    Bounded(mpsc::Receiver<LogMessage>),
    Unbounded(mpsc::UnboundedReceiver<LogMessage>),
}

/// Result of one bounded poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Polled {
    /// A message arrived within the wait
    Message(LogMessage),
    /// Nothing arrived before the wait elapsed
    Timeout,
    /// The producing half is gone and the queue is drained
    Closed,
}

/// Create a connected observer/queue pair.
///
/// `capacity` of `None` gives an unbounded queue. With a capacity, messages
/// arriving while the queue is full are dropped and counted.
pub fn bridge(capacity: Option<usize>) -> (BridgeObserver, BridgeQueue) {
    let dropped = Arc::new(AtomicU64::new(0));
    let (tx, rx) = match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity);
            (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
        }
    };
    (
        BridgeObserver {
            tx,
            dropped: Arc::clone(&dropped),
        },
        BridgeQueue { rx, dropped },
    )
}

/// Producing half, registered with the observer registry
pub struct BridgeObserver {
    tx: QueueSender,
    dropped: Arc<AtomicU64>,
}

impl LogObserver for BridgeObserver {
    fn on_message(&self, message: &LogMessage) -> Result<()> {
        match &self.tx {
            QueueSender::Unbounded(tx) => tx
                .send(Arc::clone(message))
                .map_err(|_| Error::QueueClosed),
            QueueSender::Bounded(tx) => match tx.try_send(Arc::clone(message)) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(TrySendError::Closed(_)) => Err(Error::QueueClosed),
            },
        }
    }
}

/// Consuming half, owned by one stream driver
pub struct BridgeQueue {
    rx: QueueReceiver,
    dropped: Arc<AtomicU64>,
}

impl BridgeQueue {
    /// Wait up to `wait` for the next message
    pub async fn poll(&mut self, wait: Duration) -> Polled {
        let next = match &mut self.rx {
            QueueReceiver::Bounded(rx) => tokio::time::timeout(wait, rx.recv()).await,
            QueueReceiver::Unbounded(rx) => tokio::time::timeout(wait, rx.recv()).await,
        };
        match next {
            Ok(Some(message)) => Polled::Message(message),
            Ok(None) => Polled::Closed,
            Err(_) => Polled::Timeout,
        }
    }

    /// Take the next message if one is already queued
    pub fn try_next(&mut self) -> Option<LogMessage> {
        let next = match &mut self.rx {
            QueueReceiver::Bounded(rx) => rx.try_recv(),
            QueueReceiver::Unbounded(rx) => rx.try_recv(),
        };
        match next {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Refuse further messages; anything already queued stays readable
    pub fn close(&mut self) {
        match &mut self.rx {
            QueueReceiver::Bounded(rx) => rx.close(),
            QueueReceiver::Unbounded(rx) => rx.close(),
        }
    }

    /// Messages dropped because a bounded queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(text: &str) -> LogMessage {
        LogMessage::from(text)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (observer, mut queue) = bridge(None);
        for text in ["m1", "m2", "m3"] {
            observer.on_message(&msg(text)).unwrap();
        }

        let wait = Duration::from_millis(10);
        assert_eq!(queue.poll(wait).await, Polled::Message(msg("m1")));
        assert_eq!(queue.poll(wait).await, Polled::Message(msg("m2")));
        assert_eq!(queue.try_next(), Some(msg("m3")));
        assert_eq!(queue.try_next(), None);
    }

    #[tokio::test]
    async fn test_poll_times_out_when_idle() {
        let (_observer, mut queue) = bridge(None);
        assert_eq!(queue.poll(Duration::from_millis(100)).await, Polled::Timeout);
    }

    #[tokio::test]
    async fn test_poll_reports_closed_after_producer_drops() {
        let (observer, mut queue) = bridge(None);
        observer.on_message(&msg("last words")).unwrap();
        drop(observer);

        let wait = Duration::from_millis(10);
        assert_eq!(queue.poll(wait).await, Polled::Message(msg("last words")));
        assert_eq!(queue.poll(wait).await, Polled::Closed);
    }

    #[test]
    fn test_bounded_queue_drops_instead_of_blocking() {
        let (observer, mut queue) = bridge(Some(2));
        for text in ["a", "b", "c", "d"] {
            observer.on_message(&msg(text)).unwrap();
        }

        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.try_next(), Some(msg("a")));
        assert_eq!(queue.try_next(), Some(msg("b")));
        assert_eq!(queue.try_next(), None);
    }

    #[test]
    fn test_closed_queue_rejects_messages() {
        let (observer, mut queue) = bridge(None);
        queue.close();
        assert!(matches!(
            observer.on_message(&msg("too late")),
            Err(Error::QueueClosed)
        ));
        assert_eq!(queue.try_next(), None);
    }
}
