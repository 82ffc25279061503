//! Anchor model
//!
//! An anchor is an immutable batch commitment: a linkset document that
//! names the core index of the batch, back-references (`up`) to the
//! previous anchors of every DID it touches, and carries witness
//! credentials in `replies`. The anchor's own hashlink is the hash of the
//! canonical linkset document.

pub mod build;
pub mod graph;
pub mod indexes;
pub mod witness;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hashlink;

/// Profile identifier of the anchoring protocol generation
pub const DEFAULT_PROFILE: &str = "https://w3id.org/activityanchors#v1";

/// DID namespace anchored by this node
pub const DID_NAMESPACE: &str = "did:anchor";

/// Payload of the anchor topic: the hashlink to process, the local
/// replica's hashlink when content was re-hosted, and the actor the
/// anchor is attributed to (the target of the later `Like`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorInfo {
    pub hashlink: String,

    #[serde(rename = "localHashlink", skip_serializing_if = "Option::is_none")]
    pub local_hashlink: Option<String>,

    #[serde(rename = "attributedTo", skip_serializing_if = "Option::is_none")]
    pub attributed_to: Option<String>,
}

/// Payload of the proof topic: a witness proof on its way to the batch
/// writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofMessage {
    /// Hashlink of the anchor the proof attests to
    pub anchor: String,
    /// The witness actor that produced the proof
    pub witness: String,
    /// The proof document
    pub proof: serde_json::Value,
}

/// Latest-anchor entry for one DID suffix within a core index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuffixAnchor {
    pub suffix: String,

    /// Hashlink of the previous anchor of this suffix; absent for the
    /// suffix's first appearance.
    #[serde(rename = "previousAnchor", skip_serializing_if = "Option::is_none")]
    pub previous_anchor: Option<String>,
}

/// The core index of one batch, stored as its own CAS object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreIndex {
    pub namespace: String,
    pub version: u64,

    #[serde(rename = "operationCount")]
    pub operation_count: u64,

    pub suffixes: Vec<SuffixAnchor>,
}

/// A linked-data proof attached by a witness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proof {
    #[serde(rename = "type")]
    pub proof_type: String,

    #[serde(rename = "verificationMethod")]
    pub verification_method: String,

    pub created: DateTime<Utc>,

    #[serde(rename = "proofPurpose")]
    pub proof_purpose: String,

    #[serde(rename = "proofValue")]
    pub proof_value: String,
}

/// Subject of an anchor credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSubject {
    /// Hashlink of the anchor linkset the credential attests to
    pub href: String,

    pub profile: String,

    /// Hashlink of the core index
    pub anchor: String,

    pub rel: String,

    #[serde(rename = "type")]
    pub types: Vec<String>,
}

/// A verifiable credential whose proofs are witness signatures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorCredential {
    #[serde(rename = "@context", default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,

    pub id: String,

    #[serde(rename = "type")]
    pub types: Vec<String>,

    pub issuer: String,

    pub issued: DateTime<Utc>,

    #[serde(rename = "credentialSubject")]
    pub subject: CredentialSubject,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proof: Vec<Proof>,
}

impl AnchorCredential {
    /// The canonical bytes a witness signs: the credential without its
    /// proof set.
    pub fn signable_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.proof.clear();

        serde_json::to_vec(&unsigned)
            .map_err(|e| Error::permanent(format!("encode credential [{}]: {e}", self.id)))
    }
}

/// Back-references of an anchor linkset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Related {
    /// Previous anchors of each DID touched by the batch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub up: Vec<String>,

    /// Content-addressed reference to the original operations payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
}

/// The immutable document describing one batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorLinkset {
    /// Hashlink of the core index
    pub anchor: String,

    /// IRI of the node that produced the anchor
    pub author: String,

    /// Protocol/generator identifier
    pub profile: String,

    /// The operations payload: data URIs or content-addressed references
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub original: Vec<String>,

    #[serde(default)]
    pub related: Related,

    /// Witness credentials over this anchor
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replies: Vec<AnchorCredential>,
}

impl AnchorLinkset {
    /// Canonical serialization; the anchor's own hashlink is the hash of
    /// these bytes.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::permanent(format!("encode linkset [{}]: {e}", self.anchor)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::permanent(format!("decode anchor linkset: {e}")))
    }

    /// Structural validation per the anchor contract. Violations are
    /// permanent errors.
    pub fn validate(&self) -> Result<()> {
        if self.author.is_empty() {
            return Err(Error::permanent("anchor linkset has no author"));
        }

        hashlink::parse(&self.anchor)
            .map_err(|e| Error::permanent(format!("invalid core-index reference: {e}")))?;

        if self.original.is_empty() {
            return Err(Error::permanent(format!(
                "anchor [{}] has no original entry",
                self.anchor
            )));
        }

        for up in &self.related.up {
            hashlink::parse(up)
                .map_err(|e| Error::permanent(format!("invalid up reference [{up}]: {e}")))?;
        }

        if self.replies.is_empty() {
            return Err(Error::permanent(format!(
                "anchor [{}] has no witness credential",
                self.anchor
            )));
        }

        for credential in &self.replies {
            if credential.subject.anchor != self.anchor {
                return Err(Error::permanent(format!(
                    "credential [{}] subject does not match anchor [{}]",
                    credential.id, self.anchor
                )));
            }

            hashlink::parse(&credential.subject.href).map_err(|e| {
                Error::permanent(format!("credential [{}] href: {e}", credential.id))
            })?;

            if credential.proof.is_empty() {
                return Err(Error::permanent(format!(
                    "credential [{}] carries no proof",
                    credential.id
                )));
            }
        }

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::test_linkset;
    use super::*;

    #[test]
    fn test_linkset_roundtrip_and_validate() {
        let linkset = test_linkset("https://node1.example.com/services/anchor", vec![]);
        linkset.validate().unwrap();

        let bytes = linkset.canonical_bytes().unwrap();
        let parsed = AnchorLinkset::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.anchor, linkset.anchor);
        assert_eq!(parsed.canonical_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_validate_rejects_missing_pieces() {
        let base = || test_linkset("https://node1.example.com/services/anchor", vec![]);

        let mut ls = base();
        ls.author.clear();
        assert!(ls.validate().is_err());

        let mut ls = base();
        ls.original.clear();
        assert!(ls.validate().is_err());

        let mut ls = base();
        ls.replies.clear();
        assert!(ls.validate().is_err());

        let mut ls = base();
        ls.related.up.push("not-a-hashlink".to_string());
        assert!(ls.validate().is_err());

        let mut ls = base();
        ls.replies[0].proof.clear();
        assert!(ls.validate().is_err());

        let mut ls = base();
        ls.replies[0].subject.anchor = hashlink::create(b"other", &[]).unwrap();
        assert!(ls.validate().is_err());
    }

    #[test]
    fn test_anchor_info_wire_format() {
        let info = AnchorInfo {
            hashlink: "hl:uEiAx".to_string(),
            local_hashlink: Some("hl:uEiAy".to_string()),
            attributed_to: Some("https://node2.example.com/services/anchor".to_string()),
        };

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["hashlink"], "hl:uEiAx");
        assert_eq!(json["localHashlink"], "hl:uEiAy");
        assert_eq!(json["attributedTo"], "https://node2.example.com/services/anchor");
    }

    #[test]
    fn test_signable_bytes_excludes_proofs() {
        let linkset = test_linkset("https://node1.example.com/services/anchor", vec![]);
        let credential = &linkset.replies[0];

        let bytes = credential.signable_bytes().unwrap();
        let decoded: AnchorCredential = serde_json::from_slice(&bytes).unwrap();
        assert!(decoded.proof.is_empty());
    }
}
