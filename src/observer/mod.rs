//! Observer
//!
//! Consumes the anchor and DID topics. For each anchor announcement it
//! walks the anchor DAG for unprocessed ancestors, materialises each
//! anchor through the protocol client in deepest-first order, updates the
//! DID→anchor index, and posts `Like` activities to the actor the anchor
//! was attributed to (and to the anchor's author, resolved through
//! WebFinger, when different).
//!
//! Each subscription is fronted by a bounded worker pool; a full pool
//! delays acknowledgement so the bus holds further deliveries. Transient
//! failures (including content not yet replicated) nack the message for
//! redelivery; permanent failures are logged and buried.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::{Activity, ActivityType, AnchorReference, ObjectProperty, Outbox, PUBLIC_IRI};
use crate::anchor::graph::{AnchorGraph, AnchorRef};
use crate::anchor::indexes::{DidAnchorIndex, ProcessedAnchorStore};
use crate::anchor::AnchorInfo;
use crate::discovery::webfinger::ACTIVITY_JSON_TYPE;
use crate::discovery::WebFingerClient;
use crate::error::{Error, ErrorKind, Result};
use crate::lifecycle::Lifecycle;
use crate::operations::{AnchorTransaction, ProtocolClient};
use crate::pubsub::{topics, Delivery, PubSub};

/// Observer configuration
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// The node's own service IRI
    pub service_iri: String,
    /// Worker-pool size per subscription
    pub pool_size: usize,
    /// Processing budget per message; a stuck dependency must not starve
    /// the subscription
    pub process_timeout: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            service_iri: String::new(),
            pool_size: 4,
            process_timeout: Duration::from_secs(30),
        }
    }
}

/// Dependencies of the observer
pub struct ObserverProviders {
    pub graph: Arc<AnchorGraph>,
    pub did_index: Arc<DidAnchorIndex>,
    pub processed: Arc<ProcessedAnchorStore>,
    pub protocol: Arc<dyn ProtocolClient>,
    pub outbox: Arc<Outbox>,
    pub webfinger: Arc<WebFingerClient>,
    pub pubsub: Arc<dyn PubSub>,
}

/// The anchor observer
pub struct Observer {
    lifecycle: Lifecycle,
    config: ObserverConfig,
    providers: Arc<ObserverProviders>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Observer {
    pub fn new(config: ObserverConfig, providers: ObserverProviders) -> Self {
        Self {
            lifecycle: Lifecycle::new("observer"),
            config,
            providers: Arc::new(providers),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to both topics and start the worker pools
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let anchors = self.providers.pubsub.subscribe(topics::ANCHOR).await?;
        let dids = self.providers.pubsub.subscribe(topics::DID).await?;

        let mut workers = self.workers.lock().await;
        let this = Arc::clone(self);

        self.lifecycle.start(|| {
            workers.push(Self::spawn_dispatcher(
                Arc::clone(&this),
                anchors,
                Topic::Anchor,
            ));
            workers.push(Self::spawn_dispatcher(Arc::clone(&this), dids, Topic::Did));

            info!(pool_size = this.config.pool_size, "observer started");
        });

        Ok(())
    }

    pub async fn stop(&self) {
        let mut workers = self.workers.lock().await;
        self.lifecycle.stop(|| {
            for handle in workers.drain(..) {
                handle.abort();
            }
        });
    }

    fn spawn_dispatcher(
        observer: Arc<Observer>,
        mut receiver: mpsc::Receiver<Delivery>,
        topic: Topic,
    ) -> JoinHandle<()> {
        let pool = Arc::new(Semaphore::new(observer.config.pool_size.max(1)));

        tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                // Back-pressure: no new deliveries are taken (or acked)
                // until a worker slot opens.
                let permit = match Arc::clone(&pool).acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return,
                };

                let observer = Arc::clone(&observer);
                tokio::spawn(async move {
                    let _permit = permit;
                    observer.process_delivery(topic, delivery).await;
                });
            }
        })
    }

    async fn process_delivery(&self, topic: Topic, delivery: Delivery) {
        let payload = delivery.payload.clone();

        let work = async {
            match topic {
                Topic::Anchor => self.handle_anchor_payload(&payload).await,
                Topic::Did => self.handle_did_payload(&payload).await,
            }
        };

        let result = match tokio::time::timeout(self.config.process_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(Error::transient(format!(
                "processing exceeded {}s budget",
                self.config.process_timeout.as_secs()
            ))),
        };

        match &result {
            Ok(()) => delivery.ack(),
            Err(e) if matches!(e.kind(), ErrorKind::Transient | ErrorKind::NotFound) => {
                // Not-yet-replicated content resolves as NotFound; both
                // cases warrant redelivery.
                warn!(attempt = delivery.attempt, error = %e, "redelivering after failure");
                delivery.nack_transient();
            }
            Err(e) => {
                warn!(error = %e, "message buried after permanent failure");
                delivery.nack_permanent();
            }
        }
    }

    async fn handle_anchor_payload(&self, payload: &[u8]) -> Result<()> {
        let info: AnchorInfo = serde_json::from_slice(payload)
            .map_err(|e| Error::permanent(format!("decode anchor info: {e}")))?;

        self.handle_anchor(&info).await
    }

    /// Process one announced anchor: ancestors first, then the anchor
    /// itself, then the `Like` side effects.
    pub async fn handle_anchor(&self, info: &AnchorInfo) -> Result<()> {
        debug!(hashlink = %info.hashlink, attributed_to = ?info.attributed_to,
            "observing anchor");

        if self.providers.processed.contains(&info.hashlink).await? {
            debug!(hashlink = %info.hashlink, "anchor already processed");
            return Ok(());
        }

        let anchor = self.providers.graph.read(&info.hashlink).await?;
        let ancestors = self.providers.graph.unprocessed_ancestors(&anchor).await?;

        for ancestor in &ancestors {
            self.process_anchor(ancestor, &[]).await?;
        }

        self.process_anchor(&anchor, &[]).await?;

        // Likes are a courtesy; their failure must not trigger a retry of
        // an already-materialised anchor.
        if let Err(e) = self.post_likes(info, &anchor).await {
            warn!(hashlink = %info.hashlink, error = %e,
                "could not post 'Like' activity");
        }

        Ok(())
    }

    /// Materialise one anchor through the protocol client and update the
    /// indexes. An empty suffix list means all suffixes of the anchor.
    async fn process_anchor(&self, anchor: &AnchorRef, only_suffixes: &[String]) -> Result<()> {
        let linkset = &anchor.linkset;
        let core = self.providers.graph.read_core_index(&linkset.anchor).await?;

        let transaction_time = linkset
            .replies
            .first()
            .map(|c| c.issued.timestamp() as u64)
            .unwrap_or_default();

        let txn = AnchorTransaction {
            anchor_string: format!("{}.{}", core.operation_count, linkset.anchor),
            namespace: core.namespace.clone(),
            transaction_time,
            protocol_version: core.version,
            canonical_reference: crate::hashlink::resource_hash_of(&anchor.hashlink)?,
            equivalent_references: vec![anchor.hashlink.clone(), anchor.local_hashlink.clone()],
        };

        let suffixes: Vec<String> = core
            .suffixes
            .iter()
            .filter(|s| only_suffixes.is_empty() || only_suffixes.contains(&s.suffix))
            .map(|s| s.suffix.clone())
            .collect();

        if suffixes.is_empty() {
            debug!(anchor = %anchor.hashlink, "no suffixes to process");
            return Ok(());
        }

        let count = self.providers.protocol.process(txn, &suffixes).await?;

        // Only a full (unrestricted) pass updates the global indexes.
        if only_suffixes.is_empty() {
            let are_new: Vec<bool> = core
                .suffixes
                .iter()
                .map(|s| s.previous_anchor.is_none())
                .collect();

            self.providers
                .did_index
                .put_bulk(&suffixes, &are_new, &anchor.hashlink)
                .await?;

            self.providers.processed.put(&anchor.hashlink).await?;
        }

        info!(anchor = %anchor.hashlink, operations = count, suffixes = suffixes.len(),
            "anchor materialised");

        Ok(())
    }

    /// Post a `Like` to the actor the anchor was attributed to, and to
    /// the anchor's author when that resolves to a different actor.
    async fn post_likes(&self, info: &AnchorInfo, anchor: &AnchorRef) -> Result<()> {
        let Some(attributed_to) = info.attributed_to.as_deref().filter(|a| !a.is_empty()) else {
            debug!(hashlink = %info.hashlink, "no attribution; skipping 'Like'");
            return Ok(());
        };

        let result = info
            .local_hashlink
            .clone()
            .or_else(|| Some(anchor.local_hashlink.clone()))
            .map(|hl| ObjectProperty::AnchorRef(AnchorReference::new(hl)));

        self.post_like(attributed_to, &info.hashlink, result.clone()).await?;

        // The author may differ from the announcer (e.g. on an Announce
        // forwarded by an intermediary).
        match self
            .providers
            .webfinger
            .resolve_host_meta_link(&anchor.linkset.author, ACTIVITY_JSON_TYPE)
            .await
        {
            Ok(author) if author != attributed_to => {
                self.post_like(&author, &info.hashlink, result).await?;
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(author = %anchor.linkset.author, "author has no activity endpoint");
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }

    async fn post_like(
        &self,
        to: &str,
        anchor_hl: &str,
        result: Option<ObjectProperty>,
    ) -> Result<()> {
        let mut like = Activity::new(
            ActivityType::Like,
            &self.config.service_iri,
            ObjectProperty::AnchorRef(AnchorReference::new(anchor_hl)),
        )
        .with_to(to)
        .with_to(PUBLIC_IRI);

        if let Some(result) = result {
            like = like.with_result(result);
        }

        self.providers.outbox.post(like).await?;

        debug!(to = %to, anchor = %anchor_hl, "'Like' posted");

        Ok(())
    }

    async fn handle_did_payload(&self, payload: &[u8]) -> Result<()> {
        let request = std::str::from_utf8(payload)
            .map_err(|e| Error::permanent(format!("did request is not UTF-8: {e}")))?;

        self.handle_did(request).await
    }

    /// Out-of-band DID re-resolution: `<hashlink>:<suffix>`. The suffix
    /// is everything after the last `:`.
    pub async fn handle_did(&self, request: &str) -> Result<()> {
        let (anchor_ref, suffix) = request.rsplit_once(':').ok_or_else(|| {
            Error::permanent(format!("invalid did request [{request}]"))
        })?;

        if anchor_ref.is_empty() || suffix.is_empty() {
            return Err(Error::permanent(format!("invalid did request [{request}]")));
        }

        debug!(suffix = suffix, "re-resolving out-of-band did");

        let anchors = self.providers.graph.did_anchors(anchor_ref, suffix).await?;
        let only = vec![suffix.to_string()];

        for anchor in &anchors {
            match self.process_anchor(anchor, &only).await {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    // Redeliver so the whole request is retried.
                    return Err(e.context(format!("process anchor [{}]", anchor.hashlink)));
                }
                Err(e) => {
                    warn!(anchor = %anchor.hashlink, suffix = suffix, error = %e,
                        "ignoring anchor for did");
                }
            }
        }

        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Topic {
    Anchor,
    Did,
}
