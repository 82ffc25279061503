//! DID / anchor indexes
//!
//! `DidAnchorIndex` maps a DID suffix to the hashlink of the latest
//! anchor in which it appears; `ProcessedAnchorStore` is the set of
//! anchors this node has already materialised, consulted by the DAG walk.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{BatchOperation, Store};

/// Maps DID suffix → latest anchor hashlink
pub struct DidAnchorIndex {
    store: Arc<dyn Store>,
}

impl DidAnchorIndex {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Write the latest anchor for all suffixes of a batch in one atomic
    /// write. `are_new` hints which suffixes are expected to be first-time
    /// keys; when the hints turn out wrong (recovery flows) the batch is
    /// retried without them.
    pub async fn put_bulk(
        &self,
        suffixes: &[String],
        are_new: &[bool],
        anchor_hl: &str,
    ) -> Result<()> {
        if suffixes.is_empty() {
            return Err(Error::BadRequest("no suffixes provided".to_string()));
        }

        let ops = |with_hints: bool| {
            suffixes
                .iter()
                .enumerate()
                .map(|(i, suffix)| BatchOperation::Put {
                    key: suffix.clone(),
                    value: anchor_hl.as_bytes().to_vec(),
                    tags: Vec::new(),
                    is_new_key: with_hints && are_new.get(i).copied().unwrap_or(false),
                })
                .collect::<Vec<_>>()
        };

        match self.store.batch(ops(true)).await {
            Ok(()) => {}
            Err(Error::DuplicateKey(_)) => {
                warn!(anchor = %anchor_hl,
                    "new-key hints were wrong (recovery flow?); retrying without them");

                self.store.batch(ops(false)).await.map_err(|e| {
                    Error::transient(format!("update did anchors for [{anchor_hl}]: {e}"))
                })?;
            }
            Err(e) => {
                return Err(Error::transient(format!(
                    "update did anchors for [{anchor_hl}]: {e}"
                )))
            }
        }

        debug!(anchor = %anchor_hl, suffixes = suffixes.len(), "updated latest anchors");

        Ok(())
    }

    /// Latest anchor for a suffix; `NotFound` when the suffix is unknown
    pub async fn get(&self, suffix: &str) -> Result<String> {
        match self.store.get(suffix).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.is_not_found() => Err(Error::NotFound(format!("suffix [{suffix}]"))),
            Err(e) => Err(Error::transient(format!("did anchor get [{suffix}]: {e}"))),
        }
    }

    /// Latest anchors for several suffixes; `None` for unknown suffixes
    pub async fn get_bulk(&self, suffixes: &[String]) -> Result<Vec<Option<String>>> {
        let values = self
            .store
            .get_bulk(suffixes)
            .await
            .map_err(|e| Error::transient(format!("did anchor get bulk: {e}")))?;

        Ok(values
            .into_iter()
            .map(|v| v.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
            .collect())
    }
}

/// Set of anchors already materialised by this node
pub struct ProcessedAnchorStore {
    store: Arc<dyn Store>,
}

impl ProcessedAnchorStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn put(&self, anchor_hl: &str) -> Result<()> {
        let hash = crate::hashlink::resource_hash_of(anchor_hl)?;

        self.store
            .put(&hash, Utc::now().timestamp().to_string().as_bytes(), &[])
            .await
            .map_err(|e| Error::transient(format!("record processed anchor: {e}")))
    }

    pub async fn contains(&self, anchor_hl: &str) -> Result<bool> {
        let hash = crate::hashlink::resource_hash_of(anchor_hl)?;

        match self.store.get(&hash).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(Error::transient(format!("processed anchor lookup: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashlink;
    use crate::store::memory::MemStore;

    #[tokio::test]
    async fn test_put_bulk_and_get() {
        let index = DidAnchorIndex::new(Arc::new(MemStore::new("did-anchor")));

        index
            .put_bulk(
                &["suffix-a".to_string(), "suffix-b".to_string()],
                &[true, true],
                "hl:uEiA1",
            )
            .await
            .unwrap();

        assert_eq!(index.get("suffix-a").await.unwrap(), "hl:uEiA1");
        assert!(index.get("suffix-c").await.unwrap_err().is_not_found());

        let bulk = index
            .get_bulk(&["suffix-a".to_string(), "suffix-c".to_string()])
            .await
            .unwrap();
        assert_eq!(bulk, vec![Some("hl:uEiA1".to_string()), None]);
    }

    #[tokio::test]
    async fn test_put_bulk_retries_on_wrong_new_key_hint() {
        let index = DidAnchorIndex::new(Arc::new(MemStore::new("did-anchor")));

        index
            .put_bulk(&["suffix-a".to_string()], &[true], "hl:uEiA1")
            .await
            .unwrap();

        // The hint claims "new" but the suffix already exists; the retry
        // path must still land the update.
        index
            .put_bulk(&["suffix-a".to_string()], &[true], "hl:uEiA2")
            .await
            .unwrap();

        assert_eq!(index.get("suffix-a").await.unwrap(), "hl:uEiA2");
    }

    #[tokio::test]
    async fn test_empty_suffixes_rejected() {
        let index = DidAnchorIndex::new(Arc::new(MemStore::new("did-anchor")));
        assert!(matches!(
            index.put_bulk(&[], &[], "hl:uEiA1").await.unwrap_err(),
            Error::BadRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_processed_anchor_set() {
        let processed = ProcessedAnchorStore::new(Arc::new(MemStore::new("anchor-status")));
        let hl = hashlink::create(b"anchor", &["https://a.com/cas/x".to_string()]).unwrap();

        assert!(!processed.contains(&hl).await.unwrap());
        processed.put(&hl).await.unwrap();
        assert!(processed.contains(&hl).await.unwrap());

        // Membership is keyed by resource hash, not the full hashlink.
        let bare = hashlink::encode_resource_hash(b"anchor");
        assert!(processed.contains(&bare).await.unwrap());
    }
}
