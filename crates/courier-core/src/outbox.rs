//! Per-connection outbound queues.
//!
//! Each connection owns a bounded queue. Producers never wait on it: a full
//! or closed queue fails that one delivery and the fan-out moves on.

use crate::message::Delivery;
use crate::session::ConnectionId;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

/// Receiving end of a connection's queue, drained by the transport task.
pub type Mailbox = mpsc::Receiver<Arc<Delivery>>;

/// Per-recipient delivery failure.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The connection is not draining its queue fast enough.
    #[error("Outbound queue full for connection {0}")]
    QueueFull(ConnectionId),

    /// The transport side of the connection is gone.
    #[error("Connection {0} is closed")]
    Closed(ConnectionId),
}

/// Sending end of a connection's queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    connection_id: ConnectionId,
    tx: mpsc::Sender<Arc<Delivery>>,
}

/// Create a queue for a connection.
#[must_use]
pub fn outbox(connection_id: ConnectionId, capacity: usize) -> (Outbox, Mailbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Outbox { connection_id, tx }, rx)
}

impl Outbox {
    /// The connection this queue belongs to.
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Enqueue a delivery without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is full or the receiver was dropped.
    pub fn deliver(&self, delivery: &Arc<Delivery>) -> Result<(), DeliveryError> {
        self.tx
            .try_send(Arc::clone(delivery))
            .map_err(|e| match e {
                TrySendError::Full(_) => DeliveryError::QueueFull(self.connection_id.clone()),
                TrySendError::Closed(_) => DeliveryError::Closed(self.connection_id.clone()),
            })
    }

    /// Whether the receiving side has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Outcome of delivering one message to a set of connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Recipients whose queue accepted the message.
    pub delivered: usize,
    /// Recipients that were skipped.
    pub failed: usize,
}

impl DeliveryReport {
    /// Total recipients attempted.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Deliver one message to every target, isolating failures per recipient.
pub(crate) fn fan_out(targets: &[Outbox], delivery: &Arc<Delivery>) -> DeliveryReport {
    let mut report = DeliveryReport::default();

    for target in targets {
        match target.deliver(delivery) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                report.failed += 1;
                warn!(
                    connection = %target.connection_id(),
                    destination = %delivery.destination,
                    error = %e,
                    "Delivery failed, dropping message for this recipient"
                );
            }
        }
    }

    trace!(
        destination = %delivery.destination,
        delivered = report.delivered,
        failed = report.failed,
        "Fan-out complete"
    );

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use courier_protocol::ChatMessage;

    fn delivery() -> Arc<Delivery> {
        Arc::new(Delivery::new(
            "/topic/public",
            Payload::Chat(ChatMessage::chat("bob", "hi", 1)),
        ))
    }

    #[tokio::test]
    async fn test_deliver_and_receive() {
        let (tx, mut rx) = outbox(ConnectionId::new("conn-1"), 4);
        tx.deliver(&delivery()).unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.destination, "/topic/public");
    }

    #[test]
    fn test_full_queue_fails_fast() {
        let (tx, _rx) = outbox(ConnectionId::new("conn-1"), 1);
        tx.deliver(&delivery()).unwrap();
        assert!(matches!(
            tx.deliver(&delivery()),
            Err(DeliveryError::QueueFull(_))
        ));
    }

    #[test]
    fn test_fan_out_isolates_failures() {
        let (live, mut live_rx) = outbox(ConnectionId::new("live"), 4);
        let (stale, stale_rx) = outbox(ConnectionId::new("stale"), 4);
        drop(stale_rx);
        assert!(stale.is_closed());

        let report = fan_out(&[stale, live], &delivery());
        assert_eq!(report, DeliveryReport { delivered: 1, failed: 1 });
        assert_eq!(report.attempted(), 2);
        assert!(live_rx.try_recv().is_ok());
    }
}
