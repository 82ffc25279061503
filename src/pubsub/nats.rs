//! NATS-backed message bus
//!
//! Wraps a pool of NATS connections behind the bus contract. Publishes
//! are sharded across the pool with round-robin selection. Core NATS has
//! no broker-side acknowledgement, so the at-least-once contract is kept
//! by the subscriber side: a transient nack republishes the message after
//! backoff with an incremented attempt header, a permanent nack (or an
//! exhausted attempt budget) copies it to the undeliverable topic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::{Client, ConnectOptions, HeaderMap};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::retry::backoff_with_jitter;

use super::{topics, Ack, Delivery, PubSub, UndeliverableMessage};

/// Header carrying the delivery attempt across republishes
const ATTEMPT_HEADER: &str = "Anchorhold-Attempt";

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// Configuration of the NATS bus
#[derive(Debug, Clone)]
pub struct NatsPubSubConfig {
    pub url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Number of pooled connections for publishing
    pub publisher_pool_size: usize,
    /// Maximum delivery attempts before a message is undeliverable
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Capacity of each subscriber channel
    pub channel_capacity: usize,
}

impl Default for NatsPubSubConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            user: None,
            password: None,
            publisher_pool_size: 1,
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            channel_capacity: 256,
        }
    }
}

struct Inner {
    clients: Vec<Client>,
    next: AtomicUsize,
    config: NatsPubSubConfig,
}

impl Inner {
    fn next_client(&self) -> &Client {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[i]
    }

    async fn publish_with_attempt(&self, topic: &str, payload: Bytes, attempt: u32) -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert(ATTEMPT_HEADER, attempt.to_string().as_str());

        self.next_client()
            .publish_with_headers(topic.to_string(), headers, payload)
            .await
            .map_err(|e| Error::transient(format!("nats publish [{topic}]: {e}")))
    }

    async fn bury(&self, topic: &str, payload: &Bytes, attempts: u32, reason: &str) {
        if topic == topics::UNDELIVERABLE {
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

        match serde_json::to_vec(&envelope) {
            Ok(bytes) => {
                if let Err(e) = self
                    .publish_with_attempt(topics::UNDELIVERABLE, Bytes::from(bytes), 1)
                    .await
                {
                    warn!(error = %e, "failed to publish undeliverable envelope");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode undeliverable envelope"),
        }
    }
}

/// NATS-backed [`PubSub`] implementation
#[derive(Clone)]
pub struct NatsPubSub {
    inner: Arc<Inner>,
}

impl NatsPubSub {
    /// Connect the publisher pool. The connection at index 0 also serves
    /// the subscriptions.
    pub async fn connect(config: NatsPubSubConfig, name: &str) -> Result<Self> {
        let pool_size = config.publisher_pool_size.max(1);
        let mut clients = Vec::with_capacity(pool_size);

        for i in 0..pool_size {
            let mut options = ConnectOptions::new()
                .name(format!("{name}-{i}"))
                .ping_interval(DEFAULT_PING_INTERVAL)
                .connection_timeout(Duration::from_secs(5));

            if let (Some(user), Some(pass)) = (&config.user, &config.password) {
                options = options.user_and_password(user.clone(), pass.clone());
            }

            let client = options
                .connect(&config.url)
                .await
                .map_err(|e| Error::transient(format!("nats connect [{}]: {e}", config.url)))?;

            clients.push(client);
        }

        info!(url = %config.url, pool = pool_size, "connected to NATS");

        Ok(Self {
            inner: Arc::new(Inner {
                clients,
                next: AtomicUsize::new(0),
                config,
            }),
        })
    }
}

#[async_trait]
impl PubSub for NatsPubSub {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.inner.publish_with_attempt(topic, payload, 1).await
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Delivery>> {
        let mut subscription = self.inner.clients[0]
            .subscribe(topic.to_string())
            .await
            .map_err(|e| Error::transient(format!("nats subscribe [{topic}]: {e}")))?;

        let (tx, rx) = mpsc::channel(self.inner.config.channel_capacity);
        let inner = Arc::clone(&self.inner);
        let topic = topic.to_string();

        tokio::spawn(async move {
            while let Some(message) = subscription.next().await {
                let attempt = message
                    .headers
                    .as_ref()
                    .and_then(|h| h.get(ATTEMPT_HEADER))
                    .and_then(|v| v.as_str().parse::<u32>().ok())
                    .unwrap_or(1);

                let payload = message.payload.clone();
                let (delivery, ack_rx) = Delivery::new(payload.clone(), attempt);

                if tx.send(delivery).await.is_err() {
                    debug!(topic = %topic, "subscriber closed; ending nats pump");
                    return;
                }

                let inner = Arc::clone(&inner);
                let topic = topic.clone();

                // Acks resolve out of band so one slow message doesn't
                // stall the pump.
                tokio::spawn(async move {
                    let ack = ack_rx.await.unwrap_or(Ack::Transient);

                    match ack {
                        Ack::Ok => {}
                        Ack::Permanent => {
                            inner.bury(&topic, &payload, attempt, "permanent failure").await;
                        }
                        Ack::Transient => {
                            if attempt >= inner.config.max_attempts {
                                inner
                                    .bury(&topic, &payload, attempt, "delivery attempts exhausted")
                                    .await;
                                return;
                            }

                            let delay = backoff_with_jitter(
                                attempt - 1,
                                inner.config.base_delay,
                                inner.config.max_delay,
                            );
                            tokio::time::sleep(delay).await;

                            if let Err(e) = inner
                                .publish_with_attempt(&topic, payload.clone(), attempt + 1)
                                .await
                            {
                                warn!(topic = %topic, error = %e, "redelivery publish failed");
                            }
                        }
                    }
                });
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        for client in &self.inner.clients {
            client
                .flush()
                .await
                .map_err(|e| Error::transient(format!("nats flush: {e}")))?;
        }
        Ok(())
    }
}
