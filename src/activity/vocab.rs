//! Activity vocabulary
//!
//! The wire documents of the federation protocol: activities, actors and
//! object properties. Identity of an activity is its `id` URL; ordering
//! within a collection is insertion order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JSON-LD context of activity streams
pub const CONTEXT_ACTIVITY_STREAMS: &str = "https://www.w3.org/ns/activitystreams";
/// JSON-LD context of the anchoring extensions
pub const CONTEXT_ACTIVITY_ANCHORS: &str = "https://w3id.org/activityanchors/v1";
/// The public pseudo-recipient
pub const PUBLIC_IRI: &str = "https://www.w3.org/ns/activitystreams#Public";
/// Object IRI of a witness invitation
pub const ANCHOR_WITNESS_IRI: &str = "https://w3id.org/activityanchors#AnchorWitness";

/// Tag of an activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityType {
    Create,
    Announce,
    Follow,
    Accept,
    Reject,
    Invite,
    Like,
    Undo,
    Offer,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Create => "Create",
            ActivityType::Announce => "Announce",
            ActivityType::Follow => "Follow",
            ActivityType::Accept => "Accept",
            ActivityType::Reject => "Reject",
            ActivityType::Invite => "Invite",
            ActivityType::Like => "Like",
            ActivityType::Undo => "Undo",
            ActivityType::Offer => "Offer",
        }
    }
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to an anchor by hashlink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorReference {
    #[serde(rename = "type")]
    pub ref_type: String,
    pub url: String,
}

impl AnchorReference {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            ref_type: "AnchorReference".to_string(),
            url: url.into(),
        }
    }
}

/// Object of an activity: a bare IRI, an anchor reference, an embedded
/// activity, or an arbitrary document (e.g. an anchor credential).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectProperty {
    Iri(String),
    AnchorRef(AnchorReference),
    Activity(Box<Activity>),
    Document(serde_json::Value),
}

impl ObjectProperty {
    /// The IRI this object refers to, when it has one
    pub fn iri(&self) -> Option<&str> {
        match self {
            ObjectProperty::Iri(iri) => Some(iri),
            ObjectProperty::AnchorRef(r) => Some(&r.url),
            ObjectProperty::Activity(a) => Some(&a.id),
            ObjectProperty::Document(_) => None,
        }
    }

    pub fn as_activity(&self) -> Option<&Activity> {
        match self {
            ObjectProperty::Activity(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_anchor_ref(&self) -> Option<&AnchorReference> {
        match self {
            ObjectProperty::AnchorRef(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&serde_json::Value> {
        match self {
            ObjectProperty::Document(d) => Some(d),
            _ => None,
        }
    }

    /// The anchor hashlink carried by this object, for `Create`,
    /// `Announce`, `Like` and `Offer` objects.
    pub fn anchor_url(&self) -> Option<&str> {
        match self {
            ObjectProperty::AnchorRef(r) => Some(&r.url),
            ObjectProperty::Iri(iri) if iri.starts_with("hl:") => Some(iri),
            _ => None,
        }
    }
}

/// An activity document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "@context", default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,

    pub id: String,

    #[serde(rename = "type")]
    pub activity_type: ActivityType,

    pub actor: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,

    pub object: ObjectProperty,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<ObjectProperty>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ObjectProperty>,

    #[serde(rename = "inReplyTo", skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
}

impl Activity {
    /// New activity with a generated id and the current timestamp
    pub fn new(activity_type: ActivityType, actor: impl Into<String>, object: ObjectProperty) -> Self {
        let actor = actor.into();

        Self {
            context: vec![CONTEXT_ACTIVITY_STREAMS.to_string()],
            id: format!("{actor}/activities/{}", Uuid::new_v4()),
            activity_type,
            actor,
            to: Vec::new(),
            cc: Vec::new(),
            object,
            target: None,
            result: None,
            in_reply_to: None,
            published: Some(Utc::now()),
        }
    }

    pub fn with_context(mut self, context: &str) -> Self {
        if !self.context.iter().any(|c| c == context) {
            self.context.push(context.to_string());
        }
        self
    }

    pub fn with_to(mut self, iri: impl Into<String>) -> Self {
        self.to.push(iri.into());
        self
    }

    pub fn with_cc(mut self, iri: impl Into<String>) -> Self {
        self.cc.push(iri.into());
        self
    }

    pub fn with_target(mut self, target: ObjectProperty) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_result(mut self, result: ObjectProperty) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_in_reply_to(mut self, iri: impl Into<String>) -> Self {
        self.in_reply_to = Some(iri.into());
        self
    }

    /// Whether the activity is addressed to the public collection
    pub fn is_public(&self) -> bool {
        self.to.iter().chain(self.cc.iter()).any(|r| r == PUBLIC_IRI)
    }

    /// All recipients (to + cc), in order
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to.iter().chain(self.cc.iter()).map(String::as_str)
    }
}

/// The node's actor document, served at the service IRI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    #[serde(rename = "@context", default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,

    pub id: String,

    #[serde(rename = "type")]
    pub actor_type: String,

    #[serde(rename = "publicKey")]
    pub public_key: crate::httpsig::PublicKeyDoc,

    pub inbox: String,
    pub outbox: String,
    pub followers: String,
    pub following: String,
    pub witnesses: String,
    pub witnessing: String,
    pub liked: String,
}

impl Actor {
    /// Build the actor document for a service IRI
    pub fn for_service(service_iri: &str, public_key: crate::httpsig::PublicKeyDoc) -> Self {
        Self {
            context: vec![
                CONTEXT_ACTIVITY_STREAMS.to_string(),
                CONTEXT_ACTIVITY_ANCHORS.to_string(),
            ],
            id: service_iri.to_string(),
            actor_type: "Service".to_string(),
            public_key,
            inbox: format!("{service_iri}/inbox"),
            outbox: format!("{service_iri}/outbox"),
            followers: format!("{service_iri}/followers"),
            following: format!("{service_iri}/following"),
            witnesses: format!("{service_iri}/witnesses"),
            witnessing: format!("{service_iri}/witnessing"),
            liked: format!("{service_iri}/liked"),
        }
    }
}
