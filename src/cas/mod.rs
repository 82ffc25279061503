//! Content-addressable storage
//!
//! The local CAS persists content keyed by its multihash through the store
//! facade and fronts reads with an LRU+TTL cache. A cache hit bypasses
//! hash verification; a cache miss verifies the fetched bytes before they
//! are inserted.

pub mod ipfs;
pub mod resolver;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hashlink;
use crate::store::Store;

use ipfs::IpfsClient;

/// Configuration for the local CAS
#[derive(Debug, Clone)]
pub struct CasConfig {
    /// Maximum entries in the read cache
    pub cache_entries: usize,
    /// TTL of read-cache entries
    pub cache_ttl: Duration,
    /// Public base URL of this node, used for the HTTPS self-link in
    /// returned hashlinks (e.g. `https://node1.example.com`)
    pub public_url: Option<String>,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            cache_entries: 1000,
            cache_ttl: Duration::from_secs(300),
            public_url: None,
        }
    }
}

struct CachedContent {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// Local content-addressable store
pub struct CasStore {
    store: Arc<dyn Store>,
    cache: Mutex<LruCache<String, CachedContent>>,
    config: CasConfig,
    ipfs: Option<Arc<IpfsClient>>,
}

impl CasStore {
    pub fn new(store: Arc<dyn Store>, config: CasConfig, ipfs: Option<Arc<IpfsClient>>) -> Self {
        let capacity = NonZeroUsize::new(config.cache_entries.max(1)).unwrap_or(NonZeroUsize::MIN);

        Self {
            store,
            cache: Mutex::new(LruCache::new(capacity)),
            config,
            ipfs,
        }
    }

    /// Write content and return its hashlink. The metadata lists the HTTPS
    /// self-URL and, when an IPFS client is configured, the IPFS CID.
    /// Empty content is rejected.
    pub async fn write(&self, content: &[u8]) -> Result<String> {
        if content.is_empty() {
            return Err(Error::BadRequest("empty content".to_string()));
        }

        let hash = hashlink::encode_resource_hash(content);

        self.store
            .put(&hash, content, &[])
            .await
            .map_err(|e| Error::transient(format!("cas write [{hash}]: {e}")))?;

        let mut links = Vec::new();
        if let Some(base) = &self.config.public_url {
            links.push(format!("{base}/cas/{hash}"));
        }

        // IPFS replication is best-effort; the local store is authoritative.
        if let Some(ipfs) = &self.ipfs {
            match ipfs.write(content).await {
                Ok(cid) => links.push(format!("ipfs://{cid}")),
                Err(e) => warn!(hash = %hash, error = %e, "ipfs replication failed"),
            }
        }

        self.cache_insert(&hash, content.to_vec()).await;

        debug!(hash = %hash, size = content.len(), "content written to cas");

        hashlink::create(content, &links)
    }

    /// Read content by multihash or hashlink from the local store only.
    /// Returns `Error::NotFound` on a miss; resolution across remote tiers
    /// is the resolver's job.
    pub async fn read(&self, id: &str) -> Result<Vec<u8>> {
        let hash = hashlink::resource_hash_of(id)?;

        if let Some(bytes) = self.cache_get(&hash).await {
            debug!(hash = %hash, "cas cache hit");
            return Ok(bytes);
        }

        let bytes = match self.store.get(&hash).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                return Err(Error::NotFound(format!("content [{hash}]")))
            }
            Err(e) => return Err(Error::transient(format!("cas read [{hash}]: {e}"))),
        };

        // Cache miss: verify before inserting.
        hashlink::verify(&bytes, &hash)?;
        self.cache_insert(&hash, bytes.clone()).await;

        Ok(bytes)
    }

    /// Store bytes fetched from a remote tier, verifying them against the
    /// expected hash first. Returns the local hashlink of the stored copy.
    /// A mismatch is permanent and nothing is stored.
    pub async fn store_fetched(&self, hash: &str, bytes: &[u8]) -> Result<String> {
        hashlink::verify(bytes, hash)?;
        self.write(bytes).await
    }

    /// The HTTPS self-link for a hash, when a public URL is configured
    pub fn web_cas_link(&self, hash: &str) -> Option<String> {
        self.config
            .public_url
            .as_ref()
            .map(|base| format!("{base}/cas/{hash}"))
    }

    async fn cache_get(&self, hash: &str) -> Option<Vec<u8>> {
        let mut cache = self.cache.lock().await;

        match cache.get(hash) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.bytes.clone()),
            Some(_) => {
                cache.pop(hash);
                None
            }
            None => None,
        }
    }

    async fn cache_insert(&self, hash: &str, bytes: Vec<u8>) {
        let mut cache = self.cache.lock().await;
        cache.put(
            hash.to_string(),
            CachedContent {
                bytes,
                expires_at: Instant::now() + self.config.cache_ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemStore;

    fn cas() -> CasStore {
        CasStore::new(
            Arc::new(MemStore::new("cas")),
            CasConfig {
                public_url: Some("https://node1.example.com".to_string()),
                ..CasConfig::default()
            },
            None,
        )
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let cas = cas();
        let content = b"anchor content";

        let hl = cas.write(content).await.unwrap();
        assert!(hl.starts_with("hl:"));

        let parsed = hashlink::parse(&hl).unwrap();
        assert_eq!(
            parsed.links,
            vec![format!(
                "https://node1.example.com/cas/{}",
                parsed.resource_hash
            )]
        );

        assert_eq!(cas.read(&hl).await.unwrap(), content);
        assert_eq!(cas.read(&parsed.resource_hash).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_read_miss_is_not_found() {
        let cas = cas();
        let missing = hashlink::encode_resource_hash(b"never written");
        assert!(cas.read(&missing).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_empty_content_rejected() {
        let cas = cas();
        assert!(matches!(
            cas.write(b"").await,
            Err(Error::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_store_fetched_rejects_mismatch() {
        let cas = cas();
        let hash = hashlink::encode_resource_hash(b"expected");

        let err = cas.store_fetched(&hash, b"different").await.unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));

        // The mismatching copy was not stored.
        assert!(cas.read(&hash).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_corrupted_store_entry_fails_verification() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new("cas"));
        let cas = CasStore::new(
            Arc::clone(&store),
            CasConfig {
                cache_entries: 1,
                ..CasConfig::default()
            },
            None,
        );

        let hash = hashlink::encode_resource_hash(b"good");
        store.put(&hash, b"tampered", &[]).await.unwrap();

        let err = cas.read(&hash).await.unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));
    }
}
