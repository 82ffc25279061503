//! Batch writer
//!
//! The write path of the node: staged DID operations are drained on a
//! periodic tick, composed into a core index and an anchor linkset,
//! written to the CAS, and offered to the selected witnesses. Witness
//! proofs arrive over the proof topic; once the witness policy is
//! satisfied the final linkset (with the witnessed credential in
//! `replies`) is anchored, announced to followers with `Create`, and fed
//! to the local observer. Witnesses that have not responded by the proof
//! deadline are re-offered on the next tick.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::activity::{Activity, ActivityType, ActivityStore, ObjectProperty, Outbox, ReferenceKind, PUBLIC_IRI};
use crate::cas::CasStore;
use crate::error::{Error, Result};
use crate::httpsig::HttpSigner;
use crate::lifecycle::Lifecycle;
use crate::operations::store::UnpublishedOperationStore;
use crate::operations::AnchoredOperation;
use crate::pubsub::{topics, PubSub};
use crate::store::SortOrder;

use super::indexes::DidAnchorIndex;
use super::witness::{ClassState, WitnessPolicy};
use super::{
    AnchorCredential, AnchorInfo, AnchorLinkset, CoreIndex, CredentialSubject, Proof,
    ProofMessage, Related, SuffixAnchor, DEFAULT_PROFILE, DID_NAMESPACE,
};

/// Batch writer configuration
#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    /// The node's own service IRI
    pub service_iri: String,
    /// Witness policy evaluated over collected proofs
    pub witness_policy: WitnessPolicy,
    /// How long to wait for witness proofs before re-offering
    pub proof_deadline: Duration,
    /// Maximum operations per anchor
    pub max_batch_size: usize,
    /// Protocol generation
    pub protocol_version: u64,
}

struct PendingBatch {
    linkset: AnchorLinkset,
    credential: AnchorCredential,
    suffixes: Vec<String>,
    are_new: Vec<bool>,
    operations: Vec<AnchoredOperation>,
    batch_witnesses: HashSet<String>,
    system_witnesses: HashSet<String>,
    proofs: HashMap<String, Proof>,
    deadline: i64,
}

impl PendingBatch {
    fn class_states(&self) -> (ClassState, ClassState) {
        let batch = ClassState {
            selected: self.batch_witnesses.len(),
            proofs: self
                .proofs
                .keys()
                .filter(|w| self.batch_witnesses.contains(*w))
                .count(),
        };
        let system = ClassState {
            selected: self.system_witnesses.len(),
            proofs: self
                .proofs
                .keys()
                .filter(|w| self.system_witnesses.contains(*w))
                .count(),
        };

        (batch, system)
    }
}

/// Composes anchors from staged operations and drives witnessing
pub struct BatchWriter {
    lifecycle: Lifecycle,
    config: BatchWriterConfig,
    cas: Arc<CasStore>,
    store: Arc<ActivityStore>,
    outbox: Arc<Outbox>,
    unpublished: Arc<UnpublishedOperationStore>,
    did_index: Arc<DidAnchorIndex>,
    pubsub: Arc<dyn PubSub>,
    signer: Arc<HttpSigner>,
    pending: Mutex<HashMap<String, PendingBatch>>,
    proof_consumer: Mutex<Option<JoinHandle<()>>>,
}

impl BatchWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BatchWriterConfig,
        cas: Arc<CasStore>,
        store: Arc<ActivityStore>,
        outbox: Arc<Outbox>,
        unpublished: Arc<UnpublishedOperationStore>,
        did_index: Arc<DidAnchorIndex>,
        pubsub: Arc<dyn PubSub>,
        signer: Arc<HttpSigner>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new("batch-writer"),
            config,
            cas,
            store,
            outbox,
            unpublished,
            did_index,
            pubsub,
            signer,
            pending: Mutex::new(HashMap::new()),
            proof_consumer: Mutex::new(None),
        }
    }

    /// Stage an operation for the next batch
    pub async fn queue(&self, op: AnchoredOperation) -> Result<()> {
        self.lifecycle.check_started()?;
        self.unpublished.put(&op).await
    }

    /// Start the proof-topic consumer
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut receiver = self.pubsub.subscribe(topics::PROOF).await?;

        let mut slot = self.proof_consumer.lock().await;
        let this = Arc::clone(self);

        self.lifecycle.start(|| {
            let writer = Arc::clone(&this);
            *slot = Some(tokio::spawn(async move {
                while let Some(delivery) = receiver.recv().await {
                    let result = writer.handle_proof_payload(&delivery.payload).await;

                    if let Err(e) = &result {
                        warn!(error = %e, "witness proof handling failed");
                    }

                    delivery.ack_result(&result);
                }
            }));

            info!("batch writer started");
        });

        Ok(())
    }

    pub async fn stop(&self) {
        let mut consumer = self.proof_consumer.lock().await;
        self.lifecycle.stop(|| {
            if let Some(handle) = consumer.take() {
                handle.abort();
            }
        });
    }

    /// One batch tick: re-offer overdue pending batches, then compose a
    /// new anchor from the staged operations. Registered as a named task
    /// on the task manager.
    pub async fn run_batch(&self) -> Result<()> {
        self.lifecycle.check_started()?;

        self.reoffer_overdue().await?;

        let mut operations = self.unpublished.all().await?;
        if operations.is_empty() {
            return Ok(());
        }
        operations.truncate(self.config.max_batch_size);

        self.compose_anchor(operations).await
    }

    /// Build the core index and unwitnessed linkset, write them to CAS
    /// and offer the anchor to the selected witnesses.
    async fn compose_anchor(&self, operations: Vec<AnchoredOperation>) -> Result<()> {
        // One entry per suffix; insertion order of first appearance.
        let mut suffixes: Vec<String> = Vec::new();
        for op in &operations {
            if !suffixes.contains(&op.suffix) {
                suffixes.push(op.suffix.clone());
            }
        }

        let previous = self.did_index.get_bulk(&suffixes).await?;
        let are_new: Vec<bool> = previous.iter().map(Option::is_none).collect();

        let core_index = CoreIndex {
            namespace: DID_NAMESPACE.to_string(),
            version: self.config.protocol_version,
            operation_count: operations.len() as u64,
            suffixes: suffixes
                .iter()
                .zip(previous.iter())
                .map(|(suffix, prev)| SuffixAnchor {
                    suffix: suffix.clone(),
                    previous_anchor: prev.clone(),
                })
                .collect(),
        };

        let core_bytes = serde_json::to_vec(&core_index)
            .map_err(|e| Error::permanent(format!("encode core index: {e}")))?;
        let core_hl = self.cas.write(&core_bytes).await?;

        let payload = serde_json::to_vec(&operations)
            .map_err(|e| Error::permanent(format!("encode operations payload: {e}")))?;
        let via_hl = self.cas.write(&payload).await?;

        let mut up: Vec<String> = Vec::new();
        for prev in previous.iter().flatten() {
            if !up.contains(prev) {
                up.push(prev.clone());
            }
        }

        let linkset = AnchorLinkset {
            anchor: core_hl.clone(),
            author: self.config.service_iri.clone(),
            profile: DEFAULT_PROFILE.to_string(),
            original: vec![format!(
                "data:application/json;base64,{}",
                URL_SAFE_NO_PAD.encode(&payload)
            )],
            related: Related {
                up,
                via: Some(via_hl),
            },
            replies: Vec::new(),
        };

        // Witnesses sign over the unwitnessed linkset; its hashlink is the
        // credential subject.
        let unwitnessed_hl = self.cas.write(&linkset.canonical_bytes()?).await?;

        let mut credential = AnchorCredential {
            context: vec![
                "https://www.w3.org/2018/credentials/v1".to_string(),
                crate::activity::vocab::CONTEXT_ACTIVITY_ANCHORS.to_string(),
            ],
            id: format!("{}/credentials/{}", self.config.service_iri, uuid::Uuid::new_v4()),
            types: vec![
                "VerifiableCredential".to_string(),
                "AnchorCredential".to_string(),
            ],
            issuer: self.config.service_iri.clone(),
            issued: Utc::now(),
            subject: CredentialSubject {
                href: unwitnessed_hl.clone(),
                profile: DEFAULT_PROFILE.to_string(),
                anchor: core_hl,
                rel: "linkset".to_string(),
                types: vec!["AnchorLink".to_string()],
            },
            proof: Vec::new(),
        };

        // The author's own proof is always attached.
        credential.proof.push(Proof {
            proof_type: "Ed25519Signature2020".to_string(),
            verification_method: self.signer.key_id().to_string(),
            created: Utc::now(),
            proof_purpose: "assertionMethod".to_string(),
            proof_value: self.signer.sign_bytes(&credential.signable_bytes()?),
        });

        let batch_witnesses = self.batch_witnesses(&linkset).await;
        let system_witnesses: HashSet<String> = self
            .store
            .references(
                ReferenceKind::Witness,
                &self.config.service_iri,
                SortOrder::Ascending,
            )
            .await?
            .into_iter()
            .collect();

        let pending = PendingBatch {
            linkset,
            credential,
            suffixes,
            are_new,
            operations,
            batch_witnesses,
            system_witnesses,
            proofs: HashMap::new(),
            deadline: Utc::now().timestamp() + self.config.proof_deadline.as_secs() as i64,
        };

        info!(anchor = %unwitnessed_hl,
            operations = pending.operations.len(),
            batch_witnesses = pending.batch_witnesses.len(),
            system_witnesses = pending.system_witnesses.len(),
            "anchor composed; collecting witness proofs");

        let witnesses: HashSet<String> = pending
            .batch_witnesses
            .union(&pending.system_witnesses)
            .cloned()
            .collect();

        let (batch_state, system_state) = pending.class_states();
        let satisfied = self
            .config
            .witness_policy
            .satisfied(&batch_state, &system_state);

        {
            let mut map = self.pending.lock().await;
            map.insert(unwitnessed_hl.clone(), pending);
        }

        for witness in witnesses {
            if let Err(e) = self.offer_to(&unwitnessed_hl, &witness).await {
                warn!(witness = %witness, error = %e, "witness offer failed");
            }
        }

        if satisfied {
            // No witnesses selected: anchor immediately.
            self.try_finalize(&unwitnessed_hl).await?;
        }

        Ok(())
    }

    /// Batch witnesses are the authors of the anchors this batch builds on
    async fn batch_witnesses(&self, linkset: &AnchorLinkset) -> HashSet<String> {
        let mut witnesses = HashSet::new();

        for up in &linkset.related.up {
            match self.cas.read(up).await {
                Ok(bytes) => match AnchorLinkset::from_bytes(&bytes) {
                    Ok(prev) if prev.author != self.config.service_iri => {
                        witnesses.insert(prev.author);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(up = %up, error = %e, "unreadable previous anchor"),
                },
                Err(e) => debug!(up = %up, error = %e, "previous anchor not local"),
            }
        }

        witnesses
    }

    async fn offer_to(&self, anchor_hl: &str, witness: &str) -> Result<()> {
        let credential_json = {
            let map = self.pending.lock().await;
            let pending = map
                .get(anchor_hl)
                .ok_or_else(|| Error::NotFound(format!("pending batch [{anchor_hl}]")))?;

            serde_json::to_value(&pending.credential)
                .map_err(|e| Error::permanent(format!("encode credential: {e}")))?
        };

        let offer = Activity::new(
            ActivityType::Offer,
            &self.config.service_iri,
            ObjectProperty::Document(credential_json),
        )
        .with_to(witness);

        self.outbox.post(offer).await?;
        Ok(())
    }

    async fn handle_proof_payload(&self, payload: &[u8]) -> Result<()> {
        let message: ProofMessage = serde_json::from_slice(payload)
            .map_err(|e| Error::permanent(format!("decode proof message: {e}")))?;

        self.handle_proof(message).await
    }

    /// Attach one witness proof and finalize when the policy is satisfied.
    /// A proof for an anchor that is no longer pending (already anchored)
    /// is logged and dropped.
    pub async fn handle_proof(&self, message: ProofMessage) -> Result<()> {
        let satisfied = {
            let mut map = self.pending.lock().await;

            let Some(pending) = map.get_mut(&message.anchor) else {
                info!(anchor = %message.anchor, witness = %message.witness,
                    "proof for an anchor that is no longer pending; ignored");
                return Ok(());
            };

            if !pending.batch_witnesses.contains(&message.witness)
                && !pending.system_witnesses.contains(&message.witness)
            {
                return Err(Error::Unauthorized(format!(
                    "[{}] is not a selected witness for [{}]",
                    message.witness, message.anchor
                )));
            }

            let proof: Proof = serde_json::from_value(message.proof.clone())
                .map_err(|e| Error::permanent(format!("invalid witness proof: {e}")))?;

            pending.proofs.insert(message.witness.clone(), proof);

            let (batch_state, system_state) = pending.class_states();
            debug!(anchor = %message.anchor, witness = %message.witness,
                batch_proofs = batch_state.proofs, system_proofs = system_state.proofs,
                "witness proof collected");

            self.config
                .witness_policy
                .satisfied(&batch_state, &system_state)
        };

        if satisfied {
            self.try_finalize(&message.anchor).await?;
        }

        Ok(())
    }

    /// Write the witnessed linkset, update the indexes and announce the
    /// anchor.
    async fn try_finalize(&self, anchor_hl: &str) -> Result<()> {
        let Some(mut pending) = self.pending.lock().await.remove(anchor_hl) else {
            return Ok(());
        };

        pending
            .credential
            .proof
            .extend(pending.proofs.values().cloned());
        pending.linkset.replies = vec![pending.credential.clone()];

        let final_hl = self.cas.write(&pending.linkset.canonical_bytes()?).await?;

        self.did_index
            .put_bulk(&pending.suffixes, &pending.are_new, &final_hl)
            .await?;

        self.unpublished.delete_all(&pending.operations).await?;

        info!(anchor = %final_hl, operations = pending.operations.len(),
            proofs = pending.linkset.replies[0].proof.len(), "anchor finalized");

        // Announce to followers.
        let create = Activity::new(
            ActivityType::Create,
            &self.config.service_iri,
            ObjectProperty::AnchorRef(crate::activity::AnchorReference::new(&final_hl)),
        )
        .with_context(crate::activity::vocab::CONTEXT_ACTIVITY_ANCHORS)
        .with_to(PUBLIC_IRI)
        .with_to(format!("{}/followers", self.config.service_iri));

        self.outbox.post(create).await?;

        // Feed the local observer so this node materialises its own batch.
        let info = AnchorInfo {
            hashlink: final_hl.clone(),
            local_hashlink: Some(final_hl),
            attributed_to: None,
        };
        let payload = serde_json::to_vec(&info)
            .map_err(|e| Error::permanent(format!("encode anchor info: {e}")))?;
        self.pubsub
            .publish(topics::ANCHOR, Bytes::from(payload))
            .await?;

        Ok(())
    }

    /// Re-offer pending anchors whose proof deadline has passed to the
    /// witnesses that have not responded yet.
    async fn reoffer_overdue(&self) -> Result<()> {
        let now = Utc::now().timestamp();

        let overdue: Vec<(String, Vec<String>)> = {
            let mut map = self.pending.lock().await;
            map.iter_mut()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(hl, p)| {
                    p.deadline = now + self.config.proof_deadline.as_secs() as i64;

                    let unresponsive: Vec<String> = p
                        .batch_witnesses
                        .union(&p.system_witnesses)
                        .filter(|w| !p.proofs.contains_key(*w))
                        .cloned()
                        .collect();

                    (hl.clone(), unresponsive)
                })
                .collect()
        };

        for (anchor_hl, witnesses) in overdue {
            for witness in witnesses {
                info!(anchor = %anchor_hl, witness = %witness,
                    "re-offering anchor to unresponsive witness");

                if let Err(e) = self.offer_to(&anchor_hl, &witness).await {
                    warn!(witness = %witness, error = %e, "witness re-offer failed");
                }
            }
        }

        Ok(())
    }

    /// Number of batches awaiting witness proofs
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
