//! Message bus abstraction
//!
//! At-least-once publish/subscribe. Every delivered message must be
//! positively or negatively acknowledged: a transient nack causes
//! redelivery after backoff, a permanent nack drops the message and
//! copies it to the undeliverable topic. A delivery dropped without an
//! acknowledgement counts as a transient nack.
//!
//! Ordering per topic is best-effort FIFO; consumers must not assume
//! strict ordering across partitions.

pub mod memory;
pub mod nats;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{ErrorKind, Result};

/// Well-known topics
pub mod topics {
    /// Anchor hashlinks to process
    pub const ANCHOR: &str = "anchor";
    /// Out-of-band DID re-resolution requests (`<hashlink>:<suffix>`)
    pub const DID: &str = "did";
    /// Witness proofs on their way to the batch writer
    pub const PROOF: &str = "proof";
    /// Messages that exhausted their delivery budget
    pub const UNDELIVERABLE: &str = "undeliverable";
    /// Outbox activity deliveries
    pub const OUTBOX_DELIVERY: &str = "outbox-delivery";
}

/// Acknowledgement of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Processing succeeded
    Ok,
    /// Processing failed but may succeed later; redeliver
    Transient,
    /// Processing can never succeed; drop and record undeliverable
    Permanent,
}

/// A message handed to a subscriber. Must be acknowledged; dropping it
/// unacknowledged is a transient nack.
pub struct Delivery {
    pub payload: Bytes,
    /// 1-based delivery attempt
    pub attempt: u32,
    ack: Option<oneshot::Sender<Ack>>,
}

impl Delivery {
    pub fn new(payload: Bytes, attempt: u32) -> (Self, oneshot::Receiver<Ack>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                payload,
                attempt,
                ack: Some(tx),
            },
            rx,
        )
    }

    fn send(&mut self, ack: Ack) {
        if let Some(tx) = self.ack.take() {
            let _ = tx.send(ack);
        }
    }

    pub fn ack(mut self) {
        self.send(Ack::Ok);
    }

    pub fn nack_transient(mut self) {
        self.send(Ack::Transient);
    }

    pub fn nack_permanent(mut self) {
        self.send(Ack::Permanent);
    }

    /// Acknowledge according to the error kind of a processing result:
    /// success and permanent failures ack (the latter after being logged
    /// by the caller), transient failures nack for redelivery.
    pub fn ack_result(self, result: &Result<()>) {
        match result {
            Ok(()) => self.ack(),
            Err(e) if e.kind() == ErrorKind::Transient => self.nack_transient(),
            Err(_) => self.nack_permanent(),
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.send(Ack::Transient);
    }
}

/// Envelope copied to the undeliverable topic when a message is dropped
#[derive(Debug, Serialize, Deserialize)]
pub struct UndeliverableMessage {
    pub topic: String,
    /// Original payload, base64-encoded
    pub payload: String,
    pub reason: String,
    pub attempts: u32,
}

/// At-least-once message bus
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a message; returns once the broker has accepted it.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to a topic. Each subscriber receives every message
    /// published after the subscription is established.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Delivery>>;

    /// Close the bus; unacknowledged messages are redelivered by the
    /// broker to the next subscriber.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn test_ack_result_mapping() {
        let (delivery, rx) = Delivery::new(Bytes::from_static(b"m"), 1);
        delivery.ack_result(&Ok(()));
        assert_eq!(rx.await.unwrap(), Ack::Ok);

        let (delivery, rx) = Delivery::new(Bytes::from_static(b"m"), 1);
        delivery.ack_result(&Err(Error::transient("io")));
        assert_eq!(rx.await.unwrap(), Ack::Transient);

        let (delivery, rx) = Delivery::new(Bytes::from_static(b"m"), 1);
        delivery.ack_result(&Err(Error::permanent("bad")));
        assert_eq!(rx.await.unwrap(), Ack::Permanent);
    }

    #[tokio::test]
    async fn test_drop_without_ack_is_transient() {
        let (delivery, rx) = Delivery::new(Bytes::from_static(b"m"), 1);
        drop(delivery);
        assert_eq!(rx.await.unwrap(), Ack::Transient);
    }
}
