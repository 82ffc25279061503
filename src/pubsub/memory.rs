//! In-memory message bus
//!
//! Single-process implementation of the bus contract, used by tests and
//! single-node deployments. Each subscriber gets its own delivery loop
//! per message: transient nacks are redelivered with backoff up to the
//! redelivery budget, after which the message is copied to the
//! undeliverable topic. Back-pressure comes from the bounded subscriber
//! channels: a full channel blocks the delivery loop, not the publisher.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::retry::backoff_with_jitter;

use super::{topics, Ack, Delivery, PubSub, UndeliverableMessage};

/// Configuration of the in-memory bus
#[derive(Debug, Clone)]
pub struct MemPubSubConfig {
    /// Maximum delivery attempts per subscriber before the message is
    /// declared undeliverable
    pub max_attempts: u32,
    /// Base redelivery backoff
    pub base_delay: Duration,
    /// Redelivery backoff cap
    pub max_delay: Duration,
    /// Capacity of each subscriber channel
    pub channel_capacity: usize,
}

impl Default for MemPubSubConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            channel_capacity: 256,
        }
    }
}

struct Inner {
    config: MemPubSubConfig,
    subscribers: DashMap<String, Vec<mpsc::Sender<Delivery>>>,
}

/// In-memory [`PubSub`] implementation
#[derive(Clone)]
pub struct MemPubSub {
    inner: Arc<Inner>,
}

impl MemPubSub {
    pub fn new(config: MemPubSubConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                subscribers: DashMap::new(),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(MemPubSubConfig::default())
    }
}

#[async_trait]
impl PubSub for MemPubSub {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let senders = self
            .inner
            .subscribers
            .get(topic)
            .map(|s| s.clone())
            .unwrap_or_default();

        debug!(topic = topic, subscribers = senders.len(), size = payload.len(),
            "publishing message");

        for sender in senders {
            let inner = Arc::clone(&self.inner);
            let topic = topic.to_string();
            let payload = payload.clone();

            tokio::spawn(async move {
                deliver(inner, topic, sender, payload).await;
            });
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Delivery>> {
        let (tx, rx) = mpsc::channel(self.inner.config.channel_capacity);

        self.inner
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);

        debug!(topic = topic, "subscription added");

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        self.inner.subscribers.clear();
        Ok(())
    }
}

async fn deliver(inner: Arc<Inner>, topic: String, sender: mpsc::Sender<Delivery>, payload: Bytes) {
    let mut attempt: u32 = 1;

    loop {
        let (delivery, ack_rx) = Delivery::new(payload.clone(), attempt);

        if sender.send(delivery).await.is_err() {
            // Subscriber is gone; nothing left to deliver to.
            return;
        }

        let ack = ack_rx.await.unwrap_or(Ack::Transient);

        match ack {
            Ack::Ok => return,
            Ack::Permanent => {
                bury(&inner, &topic, &payload, attempt, "permanent failure").await;
                return;
            }
            Ack::Transient => {
                if attempt >= inner.config.max_attempts {
                    bury(&inner, &topic, &payload, attempt, "delivery attempts exhausted").await;
                    return;
                }

                let delay =
                    backoff_with_jitter(attempt - 1, inner.config.base_delay, inner.config.max_delay);
                debug!(topic = %topic, attempt = attempt, delay_ms = delay.as_millis() as u64,
                    "redelivering after transient nack");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn bury(inner: &Arc<Inner>, topic: &str, payload: &Bytes, attempts: u32, reason: &str) {
    if topic == topics::UNDELIVERABLE {
        warn!(reason = reason, "dropping undeliverable-topic message");
        return;
    }

    warn!(topic = topic, attempts = attempts, reason = reason,
        "message moved to undeliverable topic");

    let envelope = UndeliverableMessage {
        topic: topic.to_string(),
        payload: STANDARD.encode(payload),
        reason: reason.to_string(),
        attempts,
    };

    let bytes = match serde_json::to_vec(&envelope) {
        Ok(b) => Bytes::from(b),
        Err(e) => {
            warn!(error = %e, "failed to encode undeliverable envelope");
            return;
        }
    };

    // One delivery attempt per undeliverable subscriber, no retries.
    let senders = inner
        .subscribers
        .get(topics::UNDELIVERABLE)
        .map(|s| s.clone())
        .unwrap_or_default();

    for sender in senders {
        let (delivery, _ack) = Delivery::new(bytes.clone(), 1);
        let _ = sender.send(delivery).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_bus(max_attempts: u32) -> MemPubSub {
        MemPubSub::new(MemPubSubConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            channel_capacity: 16,
        })
    }

    #[tokio::test]
    async fn test_publish_subscribe_ack() {
        let bus = fast_bus(3);
        let mut rx = bus.subscribe("anchor").await.unwrap();

        bus.publish("anchor", Bytes::from_static(b"hl:u1")).await.unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.payload.as_ref(), b"hl:u1");
        assert_eq!(delivery.attempt, 1);
        delivery.ack();
    }

    #[tokio::test]
    async fn test_transient_nack_redelivers() {
        let bus = fast_bus(5);
        let mut rx = bus.subscribe("anchor").await.unwrap();

        bus.publish("anchor", Bytes::from_static(b"m")).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.attempt, 1);
        first.nack_transient();

        let second = rx.recv().await.unwrap();
        assert_eq!(second.attempt, 2);
        second.ack();
    }

    #[tokio::test]
    async fn test_permanent_nack_goes_undeliverable() {
        let bus = fast_bus(5);
        let mut rx = bus.subscribe("anchor").await.unwrap();
        let mut undeliverable = bus.subscribe(topics::UNDELIVERABLE).await.unwrap();

        bus.publish("anchor", Bytes::from_static(b"poison")).await.unwrap();

        rx.recv().await.unwrap().nack_permanent();

        let buried = undeliverable.recv().await.unwrap();
        let envelope: UndeliverableMessage = serde_json::from_slice(&buried.payload).unwrap();
        assert_eq!(envelope.topic, "anchor");
        assert_eq!(
            STANDARD.decode(&envelope.payload).unwrap(),
            b"poison".to_vec()
        );
    }

    #[tokio::test]
    async fn test_exhausted_attempts_go_undeliverable() {
        let bus = fast_bus(2);
        let mut rx = bus.subscribe("anchor").await.unwrap();
        let mut undeliverable = bus.subscribe(topics::UNDELIVERABLE).await.unwrap();

        bus.publish("anchor", Bytes::from_static(b"m")).await.unwrap();

        rx.recv().await.unwrap().nack_transient();
        rx.recv().await.unwrap().nack_transient();

        let buried = undeliverable.recv().await.unwrap();
        let envelope: UndeliverableMessage = serde_json::from_slice(&buried.payload).unwrap();
        assert_eq!(envelope.attempts, 2);
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscribers() {
        let bus = fast_bus(3);
        let mut rx1 = bus.subscribe("anchor").await.unwrap();
        let mut rx2 = bus.subscribe("anchor").await.unwrap();

        bus.publish("anchor", Bytes::from_static(b"m")).await.unwrap();

        rx1.recv().await.unwrap().ack();
        rx2.recv().await.unwrap().ack();
    }
}
