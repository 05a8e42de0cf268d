//! Sending side of the worker's outbound line stream.

use kakehashi_types::Outbound;
use tokio::sync::mpsc;
use tracing::trace;

/// Cloneable handle onto the single outbound message channel.
///
/// Exactly one writer task drains the receiving end, so messages sent from
/// any number of tasks (and blocking guest threads) land as whole lines.
#[derive(Clone, Debug)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    /// Create an outbox together with the receiver the writer drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a message. Returns false once the writer has gone away.
    pub fn send(&self, message: Outbound) -> bool {
        match self.tx.send(message) {
            Ok(()) => true,
            Err(err) => {
                trace!(message = ?err.0, "outbox closed, dropping message");
                false
            }
        }
    }

    pub fn log(&self, message: impl Into<String>) -> bool {
        self.send(Outbound::log(message))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_after_receiver_dropped() {
        let (outbox, rx) = Outbox::channel();
        assert!(outbox.log("hello"));
        drop(rx);
        assert!(outbox.is_closed());
        assert!(!outbox.log("gone"));
    }
}
