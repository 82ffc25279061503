//! Operation staging stores
//!
//! The unpublished store holds operations between submission and
//! anchoring, keyed by operation commitment, tagged by suffix and by an
//! expiry time that the expiry service sweeps. The published store holds
//! anchored operations keyed by (anchor, suffix, commitment) and tagged
//! by suffix for per-DID queries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::expiry::{ExpiryService, EXPIRY_TAG};
use crate::store::{BatchOperation, SortOrder, Store, StoreQuery, Tag};

use super::AnchoredOperation;

const TAG_SUFFIX: &str = "uniqueSuffix";

/// Store for operations awaiting anchoring
pub struct UnpublishedOperationStore {
    store: Arc<dyn Store>,
    lifespan: Duration,
}

impl UnpublishedOperationStore {
    /// Create the store and register it with the expiry service, which
    /// deletes operations that outlive `lifespan`.
    pub async fn new(
        store: Arc<dyn Store>,
        lifespan: Duration,
        expiry: &ExpiryService,
    ) -> Self {
        expiry
            .register(Arc::clone(&store), EXPIRY_TAG, "unpublished-operation", None)
            .await;

        Self { store, lifespan }
    }

    /// Stage an operation; an existing operation with the same commitment
    /// is overwritten.
    pub async fn put(&self, op: &AnchoredOperation) -> Result<()> {
        if op.suffix.is_empty() {
            return Err(Error::BadRequest(
                "unpublished operation has no suffix".to_string(),
            ));
        }

        let key = op.commitment_key()?;
        let expires = Utc::now().timestamp() + self.lifespan.as_secs() as i64;

        let bytes = serde_json::to_vec(op)
            .map_err(|e| Error::permanent(format!("encode operation [{}]: {e}", op.suffix)))?;

        debug!(suffix = %op.suffix, key = %key, "staging unpublished operation");

        self.store
            .put(
                &key,
                &bytes,
                &[
                    Tag::new(TAG_SUFFIX, &op.suffix),
                    Tag::new(EXPIRY_TAG, expires.to_string()),
                ],
            )
            .await
            .map_err(|e| Error::transient(format!("store operation [{}]: {e}", op.suffix)))
    }

    /// All staged operations for a suffix; `NotFound` when there are none
    pub async fn get(&self, suffix: &str) -> Result<Vec<AnchoredOperation>> {
        let results = self
            .store
            .query(&StoreQuery::by_tag(TAG_SUFFIX, suffix), SortOrder::Ascending)
            .await?;

        let ops: Vec<AnchoredOperation> = results
            .collect_remaining()
            .into_iter()
            .map(|entry| {
                serde_json::from_slice(&entry.value).map_err(|e| {
                    Error::permanent(format!("decode operation [{}]: {e}", entry.key))
                })
            })
            .collect::<Result<_>>()?;

        if ops.is_empty() {
            return Err(Error::NotFound(format!(
                "no unpublished operations for suffix [{suffix}]"
            )));
        }

        Ok(ops)
    }

    /// All staged operations across suffixes, in insertion order
    pub async fn all(&self) -> Result<Vec<AnchoredOperation>> {
        let results = self
            .store
            .query(&StoreQuery::tag_exists(TAG_SUFFIX), SortOrder::Ascending)
            .await?;

        results
            .collect_remaining()
            .into_iter()
            .map(|entry| {
                serde_json::from_slice(&entry.value).map_err(|e| {
                    Error::permanent(format!("decode operation [{}]: {e}", entry.key))
                })
            })
            .collect()
    }

    /// Delete the given operations in one batch, typically on publication
    pub async fn delete_all(&self, ops: &[AnchoredOperation]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let batch: Vec<BatchOperation> = ops
            .iter()
            .map(|op| {
                op.commitment_key()
                    .map(|key| BatchOperation::Delete { key })
            })
            .collect::<Result<_>>()?;

        self.store
            .batch(batch)
            .await
            .map_err(|e| Error::transient(format!("delete unpublished operations: {e}")))
    }
}

/// Store for anchored operations
pub struct PublishedOperationStore {
    store: Arc<dyn Store>,
}

impl PublishedOperationStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Persist the anchored operations of one batch
    pub async fn put(&self, anchor_hl: &str, ops: &[AnchoredOperation]) -> Result<()> {
        let anchor_hash = crate::hashlink::resource_hash_of(anchor_hl)?;

        let batch: Vec<BatchOperation> = ops
            .iter()
            .map(|op| {
                let commitment = op.commitment_key()?;
                let bytes = serde_json::to_vec(op).map_err(|e| {
                    Error::permanent(format!("encode operation [{}]: {e}", op.suffix))
                })?;

                Ok(BatchOperation::Put {
                    key: format!("{anchor_hash}|{}|{commitment}", op.suffix),
                    value: bytes,
                    tags: vec![Tag::new(TAG_SUFFIX, &op.suffix)],
                    is_new_key: false,
                })
            })
            .collect::<Result<_>>()?;

        self.store
            .batch(batch)
            .await
            .map_err(|e| Error::transient(format!("store published operations: {e}")))
    }

    /// All published operations of a suffix; `NotFound` when there are none
    pub async fn get(&self, suffix: &str) -> Result<Vec<AnchoredOperation>> {
        let results = self
            .store
            .query(&StoreQuery::by_tag(TAG_SUFFIX, suffix), SortOrder::Ascending)
            .await?;

        let ops: Vec<AnchoredOperation> = results
            .collect_remaining()
            .into_iter()
            .map(|entry| {
                serde_json::from_slice(&entry.value).map_err(|e| {
                    Error::permanent(format!("decode operation [{}]: {e}", entry.key))
                })
            })
            .collect::<Result<_>>()?;

        if ops.is_empty() {
            return Err(Error::NotFound(format!(
                "no published operations for suffix [{suffix}]"
            )));
        }

        Ok(ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::OperationType;
    use crate::store::memory::MemStore;

    fn op(suffix: &str, nonce: u64) -> AnchoredOperation {
        AnchoredOperation {
            suffix: suffix.to_string(),
            operation_type: OperationType::Create,
            operation_request: serde_json::json!({"suffix": suffix, "nonce": nonce}),
            transaction_time: None,
            anchor_reference: None,
            protocol_version: 1,
        }
    }

    async fn unpublished() -> UnpublishedOperationStore {
        let expiry = ExpiryService::new();
        UnpublishedOperationStore::new(
            Arc::new(MemStore::new("unpublished-operation")),
            Duration::from_secs(60),
            &expiry,
        )
        .await
    }

    #[tokio::test]
    async fn test_put_get_delete_unpublished() {
        let store = unpublished().await;

        store.put(&op("suffix-a", 1)).await.unwrap();
        store.put(&op("suffix-a", 2)).await.unwrap();
        store.put(&op("suffix-b", 3)).await.unwrap();

        let ops = store.get("suffix-a").await.unwrap();
        assert_eq!(ops.len(), 2);

        assert!(store.get("suffix-z").await.unwrap_err().is_not_found());

        let ops = store.get("suffix-a").await.unwrap();
        store.delete_all(&ops).await.unwrap();
        assert!(store.get("suffix-a").await.unwrap_err().is_not_found());
        assert_eq!(store.get("suffix-b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_suffix_rejected() {
        let store = unpublished().await;
        assert!(matches!(
            store.put(&op("", 1)).await.unwrap_err(),
            Error::BadRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_expiry_sweep_removes_staged_operations() {
        let expiry = Arc::new(ExpiryService::new());
        let store = UnpublishedOperationStore::new(
            Arc::new(MemStore::new("unpublished-operation")),
            Duration::ZERO,
            &expiry,
        )
        .await;

        store.put(&op("suffix-a", 1)).await.unwrap();

        // Lifespan zero means the operation is already expired.
        expiry.sweep().await;

        assert!(store.get("suffix-a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_published_store_by_suffix() {
        let store = PublishedOperationStore::new(Arc::new(MemStore::new("published-operation")));
        let anchor = crate::hashlink::create(b"anchor", &[]).unwrap();

        let mut published = op("suffix-a", 1);
        published.transaction_time = Some(12345);
        published.anchor_reference = Some(anchor.clone());

        store.put(&anchor, &[published.clone(), op("suffix-b", 2)]).await.unwrap();

        let ops = store.get("suffix-a").await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].transaction_time, Some(12345));

        assert!(store.get("suffix-z").await.unwrap_err().is_not_found());
    }
}
