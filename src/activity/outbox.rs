//! Activity outbox
//!
//! Posting persists the activity, appends it to the outbox collection
//! (and the public outbox when addressed to the public), resolves the
//! audience (expanding the node's own followers collection and dropping
//! the public pseudo-IRI) and enqueues one delivery per recipient on the
//! message bus. The delivery consumer signs and POSTs to each recipient's
//! inbox; transient failures are redelivered by the bus with backoff and
//! exhausted or permanent failures surface on the undeliverable topic.
//!
//! Deliveries to one recipient happen in submission order; deliveries to
//! different recipients may overlap.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{self, Error, Result};
use crate::httpsig::SignedHttpClient;
use crate::lifecycle::Lifecycle;
use crate::pubsub::{topics, PubSub};

use super::client::ActivityClient;
use super::store::{ActivityStore, ReferenceKind};
use super::vocab::{Activity, PUBLIC_IRI};

/// Outbox configuration
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// The node's own service IRI
    pub service_iri: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeliveryTask {
    recipient: String,
    activity: serde_json::Value,
}

/// The node's activity outbox
pub struct Outbox {
    lifecycle: Lifecycle,
    config: OutboxConfig,
    store: Arc<ActivityStore>,
    pubsub: Arc<dyn PubSub>,
    client: Arc<ActivityClient>,
    http: Arc<SignedHttpClient>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Outbox {
    pub fn new(
        config: OutboxConfig,
        store: Arc<ActivityStore>,
        pubsub: Arc<dyn PubSub>,
        client: Arc<ActivityClient>,
        http: Arc<SignedHttpClient>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new("outbox"),
            config,
            store,
            pubsub,
            client,
            http,
            worker: Mutex::new(None),
        }
    }

    /// Start the delivery consumer
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut receiver = self.pubsub.subscribe(topics::OUTBOX_DELIVERY).await?;

        let mut slot = self.worker.lock().await;
        let this = Arc::clone(self);

        self.lifecycle.start(|| {
            let outbox = Arc::clone(&this);
            *slot = Some(tokio::spawn(async move {
                // Sequential consumption keeps per-recipient ordering.
                while let Some(delivery) = receiver.recv().await {
                    let result = outbox.deliver(&delivery.payload).await;

                    if let Err(e) = &result {
                        warn!(attempt = delivery.attempt, error = %e, "activity delivery failed");
                    }

                    delivery.ack_result(&result);
                }
            }));

            info!("outbox delivery consumer started");
        });

        Ok(())
    }

    pub async fn stop(&self) {
        let mut worker = self.worker.lock().await;
        self.lifecycle.stop(|| {
            if let Some(handle) = worker.take() {
                handle.abort();
            }
        });
    }

    /// Post an activity: persist it, add it to the outbox collections and
    /// enqueue deliveries to the resolved audience. Returns the activity id.
    pub async fn post(&self, activity: Activity) -> Result<String> {
        self.lifecycle.check_started()?;

        let id = activity.id.clone();

        self.store.add_activity(&activity).await?;
        self.store
            .add_reference(ReferenceKind::Outbox, &self.config.service_iri, &id)
            .await?;

        if activity.is_public() {
            self.store
                .add_reference(ReferenceKind::PublicOutbox, &self.config.service_iri, &id)
                .await?;
        }

        if activity.activity_type == crate::activity::ActivityType::Like {
            self.store
                .add_reference(ReferenceKind::Liked, &self.config.service_iri, &id)
                .await?;
        }

        let recipients = self.resolve_audience(&activity).await?;
        let json = serde_json::to_value(&activity)
            .map_err(|e| Error::permanent(format!("encode activity [{id}]: {e}")))?;

        debug!(id = %id, activity_type = %activity.activity_type, recipients = recipients.len(),
            "posting activity");

        for recipient in recipients {
            let task = DeliveryTask {
                recipient,
                activity: json.clone(),
            };

            let bytes = serde_json::to_vec(&task)
                .map_err(|e| Error::permanent(format!("encode delivery task: {e}")))?;

            self.pubsub
                .publish(topics::OUTBOX_DELIVERY, Bytes::from(bytes))
                .await?;
        }

        Ok(id)
    }

    /// Expand `to`/`cc` into concrete recipients: the public IRI is
    /// dropped, the node's own followers collection is expanded, the node
    /// itself is skipped, and duplicates are removed.
    async fn resolve_audience(&self, activity: &Activity) -> Result<Vec<String>> {
        let followers_iri = format!("{}/followers", self.config.service_iri);

        let mut seen = HashSet::new();
        let mut recipients = Vec::new();

        for iri in activity.recipients() {
            if iri == PUBLIC_IRI {
                continue;
            }

            if iri == followers_iri {
                let followers = self
                    .store
                    .references(
                        ReferenceKind::Follower,
                        &self.config.service_iri,
                        crate::store::SortOrder::Ascending,
                    )
                    .await?;

                for follower in followers {
                    if follower != self.config.service_iri && seen.insert(follower.clone()) {
                        recipients.push(follower);
                    }
                }
                continue;
            }

            if iri != self.config.service_iri && seen.insert(iri.to_string()) {
                recipients.push(iri.to_string());
            }
        }

        Ok(recipients)
    }

    /// Deliver one task: resolve the recipient's inbox and POST the
    /// signed activity.
    async fn deliver(&self, payload: &[u8]) -> Result<()> {
        let task: DeliveryTask = serde_json::from_slice(payload)
            .map_err(|e| Error::permanent(format!("decode delivery task: {e}")))?;

        let actor = self.client.get_actor(&task.recipient).await?;

        let response = self.http.post_json(&actor.inbox, &task.activity).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(error::from_status(
                status.as_u16(),
                format!("deliver to [{}]", actor.inbox),
            ));
        }

        debug!(recipient = %task.recipient, inbox = %actor.inbox, "activity delivered");

        Ok(())
    }
}
