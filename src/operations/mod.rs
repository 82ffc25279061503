//! DID operations and the materialisation boundary
//!
//! The Sidetree-style operation protocol itself is an external
//! collaborator: the observer hands each anchor to a [`ProtocolClient`]
//! which materialises the operations against the operation stores. This
//! module defines the operation model, the protocol-client trait and the
//! staging stores.

pub mod store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Kind of a DID operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Recover,
    Deactivate,
}

/// A DID operation, staged before anchoring and anchored afterwards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchoredOperation {
    /// DID suffix the operation applies to
    #[serde(rename = "uniqueSuffix")]
    pub suffix: String,

    #[serde(rename = "type")]
    pub operation_type: OperationType,

    /// The raw operation request, hashed to form the commitment key
    #[serde(rename = "operationRequest")]
    pub operation_request: serde_json::Value,

    /// Seconds-since-epoch of the anchoring transaction; unset while the
    /// operation is unpublished
    #[serde(rename = "transactionTime", skip_serializing_if = "Option::is_none")]
    pub transaction_time: Option<u64>,

    /// Hashlink of the anchor that published the operation
    #[serde(rename = "anchorReference", skip_serializing_if = "Option::is_none")]
    pub anchor_reference: Option<String>,

    /// Protocol generation the operation was created under
    #[serde(rename = "protocolVersion")]
    pub protocol_version: u64,
}

impl AnchoredOperation {
    /// The commitment key of the operation: the multihash of its request
    pub fn commitment_key(&self) -> Result<String> {
        let bytes = serde_json::to_vec(&self.operation_request)
            .map_err(|e| crate::error::Error::permanent(format!("encode operation request: {e}")))?;

        Ok(crate::hashlink::encode_resource_hash(&bytes))
    }
}

/// The transaction handed to the protocol client for one anchor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorTransaction {
    /// `<operation-count>.<core-index-uri>`
    #[serde(rename = "anchorString")]
    pub anchor_string: String,

    pub namespace: String,

    #[serde(rename = "transactionTime")]
    pub transaction_time: u64,

    #[serde(rename = "protocolVersion")]
    pub protocol_version: u64,

    /// The bare resource hash of the anchor
    #[serde(rename = "canonicalReference")]
    pub canonical_reference: String,

    /// Alternate references to the anchor (hashlink, discovery-domain form)
    #[serde(rename = "equivalentReferences")]
    pub equivalent_references: Vec<String>,
}

/// The pluggable operation protocol: materialises the operations of one
/// anchor transaction, optionally restricted to a set of suffixes.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn process(&self, txn: AnchorTransaction, suffixes: &[String]) -> Result<usize>;
}
