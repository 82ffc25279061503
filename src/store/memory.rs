//! In-memory store provider
//!
//! Backs the store facade with a per-namespace map guarded by an async
//! RwLock, with a monotonic insertion sequence for ordered scans. Suitable
//! for tests and single-node deployments; persistent back-ends implement
//! the same traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

use super::{
    BatchOperation, QueryEntry, QueryResults, SortOrder, Store, StoreProvider, StoreQuery, Tag,
    TagFilter,
};

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    tags: Vec<Tag>,
    seq: u64,
}

/// In-memory implementation of [`Store`]
pub struct MemStore {
    namespace: String,
    entries: RwLock<HashMap<String, Entry>>,
    seq: AtomicU64,
}

impl MemStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn matches(entry: &Entry, filters: &[TagFilter]) -> bool {
        filters.iter().all(|f| {
            entry.tags.iter().any(|t| {
                t.name == f.name && f.value.as_deref().map(|v| v == t.value).unwrap_or(true)
            })
        })
    }
}

#[async_trait]
impl Store for MemStore {
    async fn put(&self, key: &str, value: &[u8], tags: &[Tag]) -> Result<()> {
        let mut entries = self.entries.write().await;
        let seq = match entries.get(key) {
            // An overwrite keeps its position in insertion order.
            Some(existing) => existing.seq,
            None => self.next_seq(),
        };

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                tags: tags.to_vec(),
                seq,
            },
        );

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .map(|e| e.value.clone())
            .ok_or_else(|| Error::NotFound(format!("{}: key [{key}]", self.namespace)))
    }

    async fn get_bulk(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let entries = self.entries.read().await;
        Ok(keys
            .iter()
            .map(|k| entries.get(k).map(|e| e.value.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn batch(&self, ops: Vec<BatchOperation>) -> Result<()> {
        let mut entries = self.entries.write().await;

        // Validate new-key hints before mutating anything so the batch
        // is observed atomically.
        for op in &ops {
            if let BatchOperation::Put { key, is_new_key, .. } = op {
                if *is_new_key && entries.contains_key(key) {
                    return Err(Error::DuplicateKey(format!(
                        "{}: key [{key}]",
                        self.namespace
                    )));
                }
            }
        }

        for op in ops {
            match op {
                BatchOperation::Put { key, value, tags, .. } => {
                    let seq = match entries.get(&key) {
                        Some(existing) => existing.seq,
                        None => self.next_seq(),
                    };
                    entries.insert(key, Entry { value, tags, seq });
                }
                BatchOperation::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }

        Ok(())
    }

    async fn query(&self, query: &StoreQuery, order: SortOrder) -> Result<QueryResults> {
        if query.filters.is_empty() {
            return Err(Error::UnsupportedQuery(format!(
                "{}: empty tag expression",
                self.namespace
            )));
        }

        let entries = self.entries.read().await;

        let mut matched: Vec<(u64, QueryEntry)> = entries
            .iter()
            .filter(|(_, e)| Self::matches(e, &query.filters))
            .map(|(k, e)| {
                (
                    e.seq,
                    QueryEntry {
                        key: k.clone(),
                        value: e.value.clone(),
                        tags: e.tags.clone(),
                    },
                )
            })
            .collect();

        matched.sort_by_key(|(seq, _)| *seq);
        if order == SortOrder::Descending {
            matched.reverse();
        }

        Ok(QueryResults::new(
            matched.into_iter().map(|(_, e)| e).collect(),
        ))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool> {
        let mut entries = self.entries.write().await;

        let current = entries.get(key).map(|e| e.value.as_slice());
        if current != expected {
            return Ok(false);
        }

        let seq = match entries.get(key) {
            Some(existing) => existing.seq,
            None => self.next_seq(),
        };
        entries.insert(
            key.to_string(),
            Entry {
                value: new.to_vec(),
                tags: Vec::new(),
                seq,
            },
        );

        Ok(true)
    }
}

/// In-memory [`StoreProvider`] handing out one [`MemStore`] per namespace
#[derive(Default)]
pub struct MemStoreProvider {
    stores: DashMap<String, Arc<MemStore>>,
}

impl MemStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreProvider for MemStoreProvider {
    fn open(&self, namespace: &str) -> Result<Arc<dyn Store>> {
        let store = self
            .stores
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(MemStore::new(namespace)))
            .clone();

        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemStore::new("test");

        assert!(store.get("a").await.unwrap_err().is_not_found());

        store.put("a", b"one", &[]).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), b"one");

        store.put("a", b"two", &[]).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), b"two");

        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap_err().is_not_found());

        // Deleting an absent key is fine.
        store.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_get_bulk_preserves_order() {
        let store = MemStore::new("test");
        store.put("a", b"1", &[]).await.unwrap();
        store.put("c", b"3", &[]).await.unwrap();

        let values = store
            .get_bulk(&["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();

        assert_eq!(values, vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())]);
    }

    #[tokio::test]
    async fn test_query_by_tag_insertion_order() {
        let store = MemStore::new("test");
        for i in 0..5 {
            store
                .put(
                    &format!("k{i}"),
                    format!("v{i}").as_bytes(),
                    &[Tag::new("kind", "x")],
                )
                .await
                .unwrap();
        }
        store.put("other", b"y", &[Tag::new("kind", "y")]).await.unwrap();

        let mut results = store
            .query(&StoreQuery::by_tag("kind", "x"), SortOrder::Ascending)
            .await
            .unwrap();

        assert_eq!(results.total_items(), 5);
        assert_eq!(results.next_entry().unwrap().key, "k0");
        assert_eq!(results.next_entry().unwrap().key, "k1");

        let results = store
            .query(&StoreQuery::by_tag("kind", "x"), SortOrder::Descending)
            .await
            .unwrap();
        let keys: Vec<String> = results
            .collect_remaining()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["k4", "k3", "k2", "k1", "k0"]);
    }

    #[tokio::test]
    async fn test_query_conjunction_and_existence() {
        let store = MemStore::new("test");
        store
            .put(
                "a",
                b"1",
                &[Tag::new("suffix", "abc"), Tag::new("expirationTime", "100")],
            )
            .await
            .unwrap();
        store.put("b", b"2", &[Tag::new("suffix", "abc")]).await.unwrap();

        let results = store
            .query(
                &StoreQuery::new(vec![
                    TagFilter::equals("suffix", "abc"),
                    TagFilter::exists("expirationTime"),
                ]),
                SortOrder::Ascending,
            )
            .await
            .unwrap();

        assert_eq!(results.total_items(), 1);
    }

    #[tokio::test]
    async fn test_batch_atomic_on_duplicate_key() {
        let store = MemStore::new("test");
        store.put("existing", b"x", &[]).await.unwrap();

        let err = store
            .batch(vec![
                BatchOperation::Put {
                    key: "new".into(),
                    value: b"1".to_vec(),
                    tags: vec![],
                    is_new_key: true,
                },
                BatchOperation::Put {
                    key: "existing".into(),
                    value: b"2".to_vec(),
                    tags: vec![],
                    is_new_key: true,
                },
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DuplicateKey(_)));
        // Nothing from the failed batch was applied.
        assert!(store.get("new").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let store = MemStore::new("test");

        // Create-if-absent.
        assert!(store.compare_and_swap("permit", None, b"a").await.unwrap());
        assert!(!store.compare_and_swap("permit", None, b"b").await.unwrap());

        // Swap with the right expectation.
        assert!(store
            .compare_and_swap("permit", Some(b"a"), b"b")
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap("permit", Some(b"a"), b"c")
            .await
            .unwrap());
        assert_eq!(store.get("permit").await.unwrap(), b"b");
    }

    #[tokio::test]
    async fn test_provider_reuses_namespaces() {
        let provider = MemStoreProvider::new();
        let a = provider.open("ns").unwrap();
        let b = provider.open("ns").unwrap();

        a.put("k", b"v", &[]).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), b"v");

        let other = provider.open("other").unwrap();
        assert!(other.get("k").await.unwrap_err().is_not_found());
    }
}
