//! Activity inbox
//!
//! The protocol state machine. An inbound activity has already had its
//! HTTP signature verified; the inbox checks the claimed actor against
//! the signature principal, applies the per-relation accept lists, and
//! dispatches on the activity type. Anchor announcements feed the anchor
//! topic for the observer; witness offers are signed and answered;
//! accepted offers feed the proof topic for the batch writer. `Undo`
//! reverses the exact side effects of the original activity and is a
//! no-op when the original is unknown.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info};

use crate::anchor::{AnchorCredential, AnchorInfo, Proof, ProofMessage};
use crate::error::{Error, Result};
use crate::httpsig::HttpSigner;
use crate::lifecycle::Lifecycle;
use crate::pubsub::{topics, PubSub};

use super::acceptlist::{AcceptListManager, TYPE_FOLLOW, TYPE_INVITE_WITNESS};
use super::outbox::Outbox;
use super::store::{ActivityStore, ReferenceKind};
use super::vocab::{Activity, ActivityType, ObjectProperty, ANCHOR_WITNESS_IRI};

/// Inbox configuration
#[derive(Debug, Clone)]
pub struct InboxConfig {
    /// The node's own service IRI
    pub service_iri: String,
    /// Reject activities whose actor differs from the verified signature
    /// principal
    pub verify_actor_in_signature: bool,
}

/// The node's activity inbox
pub struct Inbox {
    lifecycle: Lifecycle,
    config: InboxConfig,
    store: Arc<ActivityStore>,
    accept_lists: Arc<AcceptListManager>,
    outbox: Arc<Outbox>,
    pubsub: Arc<dyn PubSub>,
    signer: Arc<HttpSigner>,
}

impl Inbox {
    pub fn new(
        config: InboxConfig,
        store: Arc<ActivityStore>,
        accept_lists: Arc<AcceptListManager>,
        outbox: Arc<Outbox>,
        pubsub: Arc<dyn PubSub>,
        signer: Arc<HttpSigner>,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new("inbox"),
            config,
            store,
            accept_lists,
            outbox,
            pubsub,
            signer,
        }
    }

    pub fn start(&self) {
        self.lifecycle.start(|| {});
    }

    pub fn stop(&self) {
        self.lifecycle.stop(|| {});
    }

    /// Process one inbound activity. `principal` is the actor that owns
    /// the verified request signature, when the request was signed.
    pub async fn handle(&self, activity: Activity, principal: Option<&str>) -> Result<()> {
        self.lifecycle.check_started()?;

        if self.config.verify_actor_in_signature {
            match principal {
                Some(p) if p == activity.actor => {}
                Some(p) => {
                    return Err(Error::Unauthorized(format!(
                        "activity actor [{}] does not match signature principal [{p}]",
                        activity.actor
                    )))
                }
                None => {
                    return Err(Error::Unauthorized(
                        "unsigned request to inbox".to_string(),
                    ))
                }
            }
        }

        // Redelivered activities are no-ops.
        if !self.store.add_activity(&activity).await? {
            debug!(id = %activity.id, "duplicate activity ignored");
            return Ok(());
        }

        self.store
            .add_reference(ReferenceKind::Inbox, &self.config.service_iri, &activity.id)
            .await?;

        debug!(id = %activity.id, activity_type = %activity.activity_type,
            actor = %activity.actor, "handling activity");

        match activity.activity_type {
            ActivityType::Create | ActivityType::Announce => {
                self.handle_announce(&activity).await
            }
            ActivityType::Follow => self.handle_follow(&activity).await,
            ActivityType::Accept => self.handle_accept(&activity).await,
            ActivityType::Reject => self.handle_reject(&activity),
            ActivityType::Invite => self.handle_invite(&activity).await,
            ActivityType::Offer => self.handle_offer(&activity).await,
            ActivityType::Like => self.handle_like(&activity).await,
            ActivityType::Undo => self.handle_undo(&activity).await,
        }
    }

    /// `Create` / `Announce`: publish the anchor hashlink to the anchor
    /// topic; the attribution for later `Like`s is the sending actor.
    async fn handle_announce(&self, activity: &Activity) -> Result<()> {
        let anchor = activity.object.anchor_url().ok_or_else(|| {
            Error::permanent(format!(
                "activity [{}] carries no anchor reference",
                activity.id
            ))
        })?;

        if activity.is_public() {
            self.store
                .add_reference(ReferenceKind::PublicOutbox, &activity.actor, &activity.id)
                .await?;
        }

        if activity.activity_type == ActivityType::Announce {
            self.store
                .add_reference(ReferenceKind::Share, anchor, &activity.id)
                .await?;
        }

        let info = AnchorInfo {
            hashlink: anchor.to_string(),
            local_hashlink: None,
            attributed_to: Some(activity.actor.clone()),
        };

        let payload = serde_json::to_vec(&info)
            .map_err(|e| Error::permanent(format!("encode anchor info: {e}")))?;

        self.pubsub
            .publish(topics::ANCHOR, Bytes::from(payload))
            .await?;

        debug!(anchor = %anchor, actor = %activity.actor, "anchor queued for processing");

        Ok(())
    }

    /// `Follow`: accept-listed actors become followers and receive
    /// `Accept(Follow)`; everyone else receives `Reject(Follow)`.
    async fn handle_follow(&self, activity: &Activity) -> Result<()> {
        let object = activity.object.iri().unwrap_or_default();
        if object != self.config.service_iri {
            return Err(Error::BadRequest(format!(
                "follow of [{object}] received by [{}]",
                self.config.service_iri
            )));
        }

        if self
            .accept_lists
            .is_allowed(TYPE_FOLLOW, &activity.actor)
            .await?
        {
            self.store
                .add_reference(ReferenceKind::Follower, &self.config.service_iri, &activity.actor)
                .await?;

            info!(actor = %activity.actor, "follower added");
            self.reply(ActivityType::Accept, activity).await
        } else {
            info!(actor = %activity.actor, "follow request rejected (not on accept list)");
            self.reply(ActivityType::Reject, activity).await
        }
    }

    /// `Invite(AnchorWitness)`: accept-listed actors are added to the
    /// witnessing collection and receive `Accept(Invite)`.
    async fn handle_invite(&self, activity: &Activity) -> Result<()> {
        let object = activity.object.iri().unwrap_or_default();
        if object != ANCHOR_WITNESS_IRI {
            return Err(Error::BadRequest(format!(
                "invite with unsupported object [{object}]"
            )));
        }

        let target = activity
            .target
            .as_ref()
            .and_then(|t| t.iri())
            .unwrap_or_default();
        if target != self.config.service_iri {
            return Err(Error::BadRequest(format!(
                "witness invite targeted at [{target}]"
            )));
        }

        if self
            .accept_lists
            .is_allowed(TYPE_INVITE_WITNESS, &activity.actor)
            .await?
        {
            self.store
                .add_reference(
                    ReferenceKind::Witnessing,
                    &self.config.service_iri,
                    &activity.actor,
                )
                .await?;

            info!(actor = %activity.actor, "witnessing for actor");
            self.reply(ActivityType::Accept, activity).await
        } else {
            info!(actor = %activity.actor, "witness invite rejected (not on accept list)");
            self.reply(ActivityType::Reject, activity).await
        }
    }

    /// `Accept`: dispatch on the embedded activity we originally sent
    async fn handle_accept(&self, activity: &Activity) -> Result<()> {
        let inner = activity.object.as_activity().ok_or_else(|| {
            Error::BadRequest(format!("accept [{}] embeds no activity", activity.id))
        })?;

        match inner.activity_type {
            ActivityType::Follow => {
                self.ensure_ours(inner).await?;

                // A second Accept for the same Follow is a no-op.
                self.store
                    .add_reference(
                        ReferenceKind::Following,
                        &self.config.service_iri,
                        &activity.actor,
                    )
                    .await?;

                info!(actor = %activity.actor, "now following");
                Ok(())
            }
            ActivityType::Invite => {
                self.ensure_ours(inner).await?;

                self.store
                    .add_reference(
                        ReferenceKind::Witness,
                        &self.config.service_iri,
                        &activity.actor,
                    )
                    .await?;

                info!(actor = %activity.actor, "witness added");
                Ok(())
            }
            ActivityType::Offer => self.handle_offer_accepted(activity, inner).await,
            other => Err(Error::permanent(format!(
                "accept of [{other}] is not supported"
            ))),
        }
    }

    fn handle_reject(&self, activity: &Activity) -> Result<()> {
        let inner_type = activity
            .object
            .as_activity()
            .map(|a| a.activity_type.as_str())
            .unwrap_or("unknown");

        // Nothing to roll back: follows and invites only take effect on
        // Accept.
        info!(actor = %activity.actor, rejected = inner_type, "request rejected by peer");

        Ok(())
    }

    /// `Offer(anchor credential)` from an actor we witness for: sign the
    /// credential and return `Accept(Offer, result=proof)`.
    async fn handle_offer(&self, activity: &Activity) -> Result<()> {
        if !self
            .store
            .reference_exists(
                ReferenceKind::Witnessing,
                &self.config.service_iri,
                &activity.actor,
            )
            .await?
        {
            return Err(Error::Unauthorized(format!(
                "not witnessing for [{}]",
                activity.actor
            )));
        }

        let document = activity.object.as_document().ok_or_else(|| {
            Error::BadRequest(format!("offer [{}] carries no credential", activity.id))
        })?;

        let credential: AnchorCredential = serde_json::from_value(document.clone())
            .map_err(|e| Error::BadRequest(format!("invalid anchor credential: {e}")))?;

        // The offered credential must reference a well-formed anchor.
        crate::hashlink::parse(&credential.subject.href)
            .map_err(|e| Error::BadRequest(format!("offered anchor reference: {e}")))?;

        let proof = Proof {
            proof_type: "Ed25519Signature2020".to_string(),
            verification_method: self.signer.key_id().to_string(),
            created: Utc::now(),
            proof_purpose: "assertionMethod".to_string(),
            proof_value: self.signer.sign_bytes(&credential.signable_bytes()?),
        };

        let proof_json = serde_json::to_value(&proof)
            .map_err(|e| Error::permanent(format!("encode witness proof: {e}")))?;

        info!(anchor = %credential.subject.href, actor = %activity.actor,
            "anchor witnessed");

        let accept = Activity::new(
            ActivityType::Accept,
            &self.config.service_iri,
            ObjectProperty::Activity(Box::new(activity.clone())),
        )
        .with_to(&activity.actor)
        .with_result(ObjectProperty::Document(proof_json))
        .with_in_reply_to(&activity.id);

        self.outbox.post(accept).await?;

        Ok(())
    }

    /// `Accept(Offer, result=proof)`: forward the witness proof to the
    /// batch writer over the proof topic.
    async fn handle_offer_accepted(&self, activity: &Activity, offer: &Activity) -> Result<()> {
        self.ensure_ours(offer).await?;

        let credential: AnchorCredential = offer
            .object
            .as_document()
            .cloned()
            .ok_or_else(|| {
                Error::BadRequest(format!("offer [{}] embeds no credential", offer.id))
            })
            .and_then(|doc| {
                serde_json::from_value(doc)
                    .map_err(|e| Error::BadRequest(format!("invalid offered credential: {e}")))
            })?;

        let proof = activity
            .result
            .as_ref()
            .and_then(|r| r.as_document())
            .cloned()
            .ok_or_else(|| {
                Error::BadRequest(format!("accept [{}] carries no proof", activity.id))
            })?;

        let message = ProofMessage {
            anchor: credential.subject.href.clone(),
            witness: activity.actor.clone(),
            proof,
        };

        let payload = serde_json::to_vec(&message)
            .map_err(|e| Error::permanent(format!("encode proof message: {e}")))?;

        self.pubsub
            .publish(topics::PROOF, Bytes::from(payload))
            .await?;

        debug!(anchor = %message.anchor, witness = %message.witness,
            "witness proof forwarded to batch writer");

        Ok(())
    }

    /// `Like(anchor)`: record it under the object's likes and the liker's
    /// liked collection.
    async fn handle_like(&self, activity: &Activity) -> Result<()> {
        let anchor = activity.object.anchor_url().ok_or_else(|| {
            Error::BadRequest(format!("like [{}] has no anchor object", activity.id))
        })?;

        self.store
            .add_reference(ReferenceKind::Like, anchor, &activity.id)
            .await?;
        self.store
            .add_reference(ReferenceKind::Liked, &activity.actor, &activity.id)
            .await?;

        Ok(())
    }

    /// `Undo`: reverse the side effects of the referenced activity.
    /// Unknown activities are no-ops; only the original actor may undo.
    async fn handle_undo(&self, activity: &Activity) -> Result<()> {
        let target_id = activity.object.iri().ok_or_else(|| {
            Error::BadRequest(format!("undo [{}] references no activity", activity.id))
        })?;

        let original = match self.store.get_activity(target_id).await {
            Ok(original) => original,
            Err(e) if e.is_not_found() => {
                debug!(id = %target_id, "undo of unknown activity is a no-op");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if original.actor != activity.actor {
            return Err(Error::Unauthorized(format!(
                "[{}] cannot undo an activity of [{}]",
                activity.actor, original.actor
            )));
        }

        match original.activity_type {
            ActivityType::Follow => {
                self.store
                    .delete_reference(
                        ReferenceKind::Follower,
                        &self.config.service_iri,
                        &original.actor,
                    )
                    .await?;
                info!(actor = %original.actor, "follower removed");
                Ok(())
            }
            ActivityType::Invite => {
                self.store
                    .delete_reference(
                        ReferenceKind::Witnessing,
                        &self.config.service_iri,
                        &original.actor,
                    )
                    .await?;
                info!(actor = %original.actor, "witnessing revoked");
                Ok(())
            }
            ActivityType::Like => {
                if let Some(anchor) = original.object.anchor_url() {
                    self.store
                        .delete_reference(ReferenceKind::Like, anchor, &original.id)
                        .await?;
                }
                self.store
                    .delete_reference(ReferenceKind::Liked, &original.actor, &original.id)
                    .await?;
                Ok(())
            }
            other => Err(Error::permanent(format!(
                "undo of [{other}] is not supported"
            ))),
        }
    }

    /// The embedded activity of an Accept/Reject must be one we posted.
    async fn ensure_ours(&self, inner: &Activity) -> Result<()> {
        if inner.actor != self.config.service_iri {
            return Err(Error::Unauthorized(format!(
                "embedded activity [{}] was not sent by this service",
                inner.id
            )));
        }

        match self.store.get_activity(&inner.id).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Err(Error::Unauthorized(format!(
                "embedded activity [{}] does not match any request of ours",
                inner.id
            ))),
            Err(e) => Err(e),
        }
    }

    /// Post an Accept or Reject embedding the request being answered
    async fn reply(&self, reply_type: ActivityType, request: &Activity) -> Result<()> {
        let reply = Activity::new(
            reply_type,
            &self.config.service_iri,
            ObjectProperty::Activity(Box::new(request.clone())),
        )
        .with_to(&request.actor)
        .with_in_reply_to(&request.id);

        self.outbox.post(reply).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::client::ActivityClient;
    use crate::activity::outbox::{Outbox, OutboxConfig};
    use crate::httpsig::SignedHttpClient;
    use crate::pubsub::memory::MemPubSub;
    use crate::store::memory::MemStore;
    use std::time::Duration;

    const SERVICE: &str = "https://node1.example.com/services/anchor";
    const PEER: &str = "https://node2.example.com/services/anchor";

    struct Fixture {
        inbox: Inbox,
        store: Arc<ActivityStore>,
        accept_lists: Arc<AcceptListManager>,
        outbox: Arc<Outbox>,
        bus: Arc<dyn PubSub>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(ActivityStore::new(
            Arc::new(MemStore::new("activity")),
            Arc::new(MemStore::new("activity-ref")),
        ));
        let accept_lists = Arc::new(AcceptListManager::new(Arc::new(MemStore::new(
            "accept-list",
        ))));
        let bus: Arc<dyn PubSub> = Arc::new(MemPubSub::with_defaults());
        let signer = Arc::new(HttpSigner::generate(format!("{SERVICE}/keys/main-key")));
        let http = Arc::new(
            SignedHttpClient::new(Arc::clone(&signer), Duration::from_secs(2)).unwrap(),
        );

        let outbox = Arc::new(Outbox::new(
            OutboxConfig {
                service_iri: SERVICE.to_string(),
            },
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::new(ActivityClient::new(Arc::clone(&http), Duration::from_secs(60))),
            http,
        ));
        outbox.start().await.unwrap();

        let inbox = Inbox::new(
            InboxConfig {
                service_iri: SERVICE.to_string(),
                verify_actor_in_signature: true,
            },
            Arc::clone(&store),
            Arc::clone(&accept_lists),
            Arc::clone(&outbox),
            Arc::clone(&bus),
            signer,
        );
        inbox.start();

        Fixture {
            inbox,
            store,
            accept_lists,
            outbox,
            bus,
        }
    }

    fn follow() -> Activity {
        Activity::new(
            ActivityType::Follow,
            PEER,
            ObjectProperty::Iri(SERVICE.to_string()),
        )
    }

    async fn last_outbox_activity(store: &ActivityStore) -> Activity {
        let page = store
            .query_activities(
                ReferenceKind::Outbox,
                SERVICE,
                None,
                &crate::activity::store::PageRequest {
                    page_size: 100,
                    page_num: None,
                    order: crate::store::SortOrder::Ascending,
                },
            )
            .await
            .unwrap();
        page.items.into_iter().last().expect("outbox activity")
    }

    #[tokio::test]
    async fn test_actor_must_match_principal() {
        let f = fixture().await;

        let err = f
            .inbox
            .handle(follow(), Some("https://evil.example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));

        let err = f.inbox.handle(follow(), None).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_follow_allowed_adds_follower_and_accepts() {
        let f = fixture().await;
        f.accept_lists
            .update(TYPE_FOLLOW, &[PEER.to_string()], &[])
            .await
            .unwrap();

        f.inbox.handle(follow(), Some(PEER)).await.unwrap();

        assert!(f
            .store
            .reference_exists(ReferenceKind::Follower, SERVICE, PEER)
            .await
            .unwrap());

        let reply = last_outbox_activity(&f.store).await;
        assert_eq!(reply.activity_type, ActivityType::Accept);
        assert_eq!(reply.to, vec![PEER.to_string()]);
    }

    // An actor off the accept list gets Reject(Follow) and the followers
    // collection is unchanged.
    #[tokio::test]
    async fn test_follow_not_on_accept_list_rejected() {
        let f = fixture().await;

        f.inbox.handle(follow(), Some(PEER)).await.unwrap();

        assert!(!f
            .store
            .reference_exists(ReferenceKind::Follower, SERVICE, PEER)
            .await
            .unwrap());

        let reply = last_outbox_activity(&f.store).await;
        assert_eq!(reply.activity_type, ActivityType::Reject);
    }

    #[tokio::test]
    async fn test_create_publishes_anchor_info() {
        let f = fixture().await;
        let mut anchors = f.bus.subscribe(topics::ANCHOR).await.unwrap();

        let create = Activity::new(
            ActivityType::Create,
            PEER,
            ObjectProperty::AnchorRef(crate::activity::vocab::AnchorReference::new("hl:uEiAx")),
        )
        .with_to(crate::activity::vocab::PUBLIC_IRI);

        f.inbox.handle(create.clone(), Some(PEER)).await.unwrap();

        let delivery = anchors.recv().await.unwrap();
        let info: AnchorInfo = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(info.hashlink, "hl:uEiAx");
        assert_eq!(info.attributed_to.as_deref(), Some(PEER));
        delivery.ack();

        // Public announcements mirror into the author's public outbox.
        assert!(f
            .store
            .reference_exists(ReferenceKind::PublicOutbox, PEER, &create.id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_activity_is_noop() {
        let f = fixture().await;
        let mut anchors = f.bus.subscribe(topics::ANCHOR).await.unwrap();

        let create = Activity::new(
            ActivityType::Create,
            PEER,
            ObjectProperty::AnchorRef(crate::activity::vocab::AnchorReference::new("hl:uEiAx")),
        );

        f.inbox.handle(create.clone(), Some(PEER)).await.unwrap();
        f.inbox.handle(create, Some(PEER)).await.unwrap();

        anchors.recv().await.unwrap().ack();
        // Only one anchor message was published.
        assert!(tokio::time::timeout(Duration::from_millis(50), anchors.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_accept_follow_adds_following() {
        let f = fixture().await;

        // Our own outbound follow, as the outbox would have stored it.
        let our_follow = Activity::new(
            ActivityType::Follow,
            SERVICE,
            ObjectProperty::Iri(PEER.to_string()),
        );
        f.outbox.post(our_follow.clone()).await.unwrap();

        let accept = Activity::new(
            ActivityType::Accept,
            PEER,
            ObjectProperty::Activity(Box::new(our_follow)),
        );

        f.inbox.handle(accept.clone(), Some(PEER)).await.unwrap();
        assert!(f
            .store
            .reference_exists(ReferenceKind::Following, SERVICE, PEER)
            .await
            .unwrap());

        // A second Accept for the same Follow is a no-op.
        let mut second = accept;
        second.id = format!("{PEER}/activities/second-accept");
        f.inbox.handle(second, Some(PEER)).await.unwrap();
    }

    #[tokio::test]
    async fn test_accept_for_unknown_request_unauthorized() {
        let f = fixture().await;

        let phantom = Activity::new(
            ActivityType::Follow,
            SERVICE,
            ObjectProperty::Iri(PEER.to_string()),
        );
        // Never posted through the outbox.
        let accept = Activity::new(
            ActivityType::Accept,
            PEER,
            ObjectProperty::Activity(Box::new(phantom)),
        );

        assert!(matches!(
            f.inbox.handle(accept, Some(PEER)).await.unwrap_err(),
            Error::Unauthorized(_)
        ));
    }

    #[tokio::test]
    async fn test_invite_witness_flow() {
        let f = fixture().await;
        f.accept_lists
            .update(TYPE_INVITE_WITNESS, &[PEER.to_string()], &[])
            .await
            .unwrap();

        let invite = Activity::new(
            ActivityType::Invite,
            PEER,
            ObjectProperty::Iri(ANCHOR_WITNESS_IRI.to_string()),
        )
        .with_target(ObjectProperty::Iri(SERVICE.to_string()));

        f.inbox.handle(invite, Some(PEER)).await.unwrap();

        assert!(f
            .store
            .reference_exists(ReferenceKind::Witnessing, SERVICE, PEER)
            .await
            .unwrap());

        let reply = last_outbox_activity(&f.store).await;
        assert_eq!(reply.activity_type, ActivityType::Accept);
    }

    #[tokio::test]
    async fn test_offer_signed_when_witnessing() {
        let f = fixture().await;
        f.store
            .add_reference(ReferenceKind::Witnessing, SERVICE, PEER)
            .await
            .unwrap();

        let linkset = crate::anchor::testutil::test_linkset(PEER, vec![]);
        let credential = serde_json::to_value(&linkset.replies[0]).unwrap();

        let offer = Activity::new(
            ActivityType::Offer,
            PEER,
            ObjectProperty::Document(credential),
        );

        f.inbox.handle(offer.clone(), Some(PEER)).await.unwrap();

        let reply = last_outbox_activity(&f.store).await;
        assert_eq!(reply.activity_type, ActivityType::Accept);
        assert_eq!(reply.in_reply_to.as_deref(), Some(offer.id.as_str()));
        let proof = reply.result.as_ref().and_then(|r| r.as_document()).unwrap();
        assert_eq!(proof["proofPurpose"], "assertionMethod");
    }

    #[tokio::test]
    async fn test_offer_from_stranger_unauthorized() {
        let f = fixture().await;

        let linkset = crate::anchor::testutil::test_linkset(PEER, vec![]);
        let offer = Activity::new(
            ActivityType::Offer,
            PEER,
            ObjectProperty::Document(serde_json::to_value(&linkset.replies[0]).unwrap()),
        );

        assert!(matches!(
            f.inbox.handle(offer, Some(PEER)).await.unwrap_err(),
            Error::Unauthorized(_)
        ));
    }

    #[tokio::test]
    async fn test_accept_offer_feeds_proof_topic() {
        let f = fixture().await;
        let mut proofs = f.bus.subscribe(topics::PROOF).await.unwrap();

        let linkset = crate::anchor::testutil::test_linkset(SERVICE, vec![]);
        let credential = &linkset.replies[0];

        let our_offer = Activity::new(
            ActivityType::Offer,
            SERVICE,
            ObjectProperty::Document(serde_json::to_value(credential).unwrap()),
        )
        .with_to(PEER);
        f.outbox.post(our_offer.clone()).await.unwrap();

        let accept = Activity::new(
            ActivityType::Accept,
            PEER,
            ObjectProperty::Activity(Box::new(our_offer)),
        )
        .with_result(ObjectProperty::Document(serde_json::json!({
            "type": "Ed25519Signature2020",
            "proofValue": "zSig"
        })));

        f.inbox.handle(accept, Some(PEER)).await.unwrap();

        let delivery = proofs.recv().await.unwrap();
        let message: ProofMessage = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(message.anchor, credential.subject.href);
        assert_eq!(message.witness, PEER);
        delivery.ack();
    }

    #[tokio::test]
    async fn test_like_and_undo_roundtrip() {
        let f = fixture().await;
        let anchor = "hl:uEiAanchor";

        let like = Activity::new(
            ActivityType::Like,
            PEER,
            ObjectProperty::Iri(anchor.to_string()),
        );
        f.inbox.handle(like.clone(), Some(PEER)).await.unwrap();

        assert!(f
            .store
            .reference_exists(ReferenceKind::Like, anchor, &like.id)
            .await
            .unwrap());
        assert!(f
            .store
            .reference_exists(ReferenceKind::Liked, PEER, &like.id)
            .await
            .unwrap());

        let undo = Activity::new(
            ActivityType::Undo,
            PEER,
            ObjectProperty::Iri(like.id.clone()),
        );
        f.inbox.handle(undo, Some(PEER)).await.unwrap();

        assert!(!f
            .store
            .reference_exists(ReferenceKind::Like, anchor, &like.id)
            .await
            .unwrap());
        assert!(!f
            .store
            .reference_exists(ReferenceKind::Liked, PEER, &like.id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_undo_follow_removes_follower() {
        let f = fixture().await;
        f.accept_lists
            .update(TYPE_FOLLOW, &[PEER.to_string()], &[])
            .await
            .unwrap();

        let follow = follow();
        f.inbox.handle(follow.clone(), Some(PEER)).await.unwrap();
        assert!(f
            .store
            .reference_exists(ReferenceKind::Follower, SERVICE, PEER)
            .await
            .unwrap());

        let undo = Activity::new(
            ActivityType::Undo,
            PEER,
            ObjectProperty::Iri(follow.id.clone()),
        );
        f.inbox.handle(undo, Some(PEER)).await.unwrap();

        assert!(!f
            .store
            .reference_exists(ReferenceKind::Follower, SERVICE, PEER)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_undo_unknown_activity_is_noop() {
        let f = fixture().await;

        let undo = Activity::new(
            ActivityType::Undo,
            PEER,
            ObjectProperty::Iri(format!("{PEER}/activities/never-seen")),
        );

        f.inbox.handle(undo, Some(PEER)).await.unwrap();
    }

    #[tokio::test]
    async fn test_undo_by_other_actor_unauthorized() {
        let f = fixture().await;
        let anchor = "hl:uEiAanchor";

        let like = Activity::new(
            ActivityType::Like,
            PEER,
            ObjectProperty::Iri(anchor.to_string()),
        );
        f.inbox.handle(like.clone(), Some(PEER)).await.unwrap();

        let other = "https://node3.example.com/services/anchor";
        let undo = Activity::new(ActivityType::Undo, other, ObjectProperty::Iri(like.id));

        assert!(matches!(
            f.inbox.handle(undo, Some(other)).await.unwrap_err(),
            Error::Unauthorized(_)
        ));
    }
}
