//! Multi-tier CAS resolver
//!
//! Resolves a content identifier to bytes by trying, in order: inline
//! bytes supplied by the caller, the local CAS, IPFS (when links or a
//! client are available), the HTTPS links carried in hashlink metadata,
//! and finally peer WebCAS endpoints discovered through WebFinger.
//! On success the bytes are verified against the hash and written to the
//! local CAS; the returned pair is `(bytes, local hashlink)`.
//!
//! A miss from every tier that reported "not present" is `NotFound`;
//! any tier failing with a transport error makes the aggregate transient.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::discovery::WebFingerClient;
use crate::error::{Error, Result};
use crate::hashlink;
use crate::httpsig::SignedHttpClient;
use crate::retry::{with_retries, RetryPolicy};

use super::ipfs::IpfsClient;
use super::CasStore;

/// The parsed form of a resolver input
#[derive(Debug, Clone, PartialEq, Eq)]
enum ContentRef {
    /// Bare multihash or full hashlink
    Hash { hash: String, links: Vec<String> },
    /// `ipfs:<cid>` scheme hint
    Ipfs { cid: String },
    /// `https:<domain>[:port]:<hash>` scheme hint
    WebCas { domain: String, hash: String },
}

fn parse_ref(id: &str) -> Result<ContentRef> {
    if id.starts_with(hashlink::HL_PREFIX) {
        let hl = hashlink::parse(id)?;
        return Ok(ContentRef::Hash {
            hash: hl.resource_hash,
            links: hl.links,
        });
    }

    if let Some(cid) = id.strip_prefix("ipfs:") {
        let cid = cid.trim_start_matches("//");
        if cid.is_empty() {
            return Err(Error::BadRequest(format!("no CID in [{id}]")));
        }
        return Ok(ContentRef::Ipfs {
            cid: cid.to_string(),
        });
    }

    if let Some(rest) = id.strip_prefix("https:") {
        if !rest.starts_with("//") {
            // https:<domain>[:port]:<hash> form; the hash is the last segment.
            let (domain, hash) = rest
                .rsplit_once(':')
                .ok_or_else(|| Error::BadRequest(format!("no hash in [{id}]")))?;
            hashlink::decode_resource_hash(hash)?;
            return Ok(ContentRef::WebCas {
                domain: domain.to_string(),
                hash: hash.to_string(),
            });
        }
    }

    hashlink::decode_resource_hash(id)?;
    Ok(ContentRef::Hash {
        hash: id.to_string(),
        links: Vec::new(),
    })
}

/// Resolver over the local CAS, IPFS and peer WebCAS endpoints
pub struct CasResolver {
    local: Arc<CasStore>,
    ipfs: Option<Arc<IpfsClient>>,
    webfinger: Arc<WebFingerClient>,
    http: Arc<SignedHttpClient>,
    retry: RetryPolicy,
}

impl CasResolver {
    pub fn new(
        local: Arc<CasStore>,
        ipfs: Option<Arc<IpfsClient>>,
        webfinger: Arc<WebFingerClient>,
        http: Arc<SignedHttpClient>,
    ) -> Self {
        Self {
            local,
            ipfs,
            webfinger,
            http,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(5),
            },
        }
    }

    /// Resolve the identifier to content. `web_cas_hint` is an optional
    /// peer WebCAS base URL to consult; `inline` is content supplied with
    /// the call, verified and stored without any remote round trip.
    pub async fn resolve(
        &self,
        web_cas_hint: Option<&str>,
        id: &str,
        inline: Option<&[u8]>,
    ) -> Result<(Vec<u8>, String)> {
        let content_ref = parse_ref(id)?;

        if let Some(bytes) = inline {
            let hash = match &content_ref {
                ContentRef::Hash { hash, .. } | ContentRef::WebCas { hash, .. } => hash.clone(),
                ContentRef::Ipfs { .. } => {
                    return Err(Error::BadRequest(
                        "inline content requires a hash-bearing identifier".to_string(),
                    ))
                }
            };

            let local_hl = self.local.store_fetched(&hash, bytes).await?;
            return Ok((bytes.to_vec(), local_hl));
        }

        match content_ref {
            ContentRef::Hash { hash, links } => {
                self.resolve_hash(web_cas_hint, &hash, &links).await
            }
            ContentRef::Ipfs { cid } => self.resolve_ipfs_only(&cid).await,
            ContentRef::WebCas { domain, hash } => {
                let mut failures = Vec::new();
                let mut not_present = 0usize;

                match self.try_web_cas(&domain, &hash).await {
                    Ok(found) => return Ok(found),
                    Err(e) if e.is_not_found() => not_present += 1,
                    Err(e) => failures.push(e),
                }

                Err(aggregate(&hash, not_present, failures))
            }
        }
    }

    async fn resolve_hash(
        &self,
        web_cas_hint: Option<&str>,
        hash: &str,
        links: &[String],
    ) -> Result<(Vec<u8>, String)> {
        // Local store first.
        match self.local.read(hash).await {
            Ok(bytes) => {
                let local_hl = hashlink::create(&bytes, &self.local_links(hash))?;
                return Ok((bytes, local_hl));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let mut failures: Vec<Error> = Vec::new();
        let mut not_present = 0usize;

        // IPFS links, when a client is configured.
        if let Some(ipfs) = &self.ipfs {
            for link in links.iter().filter(|l| l.starts_with("ipfs://")) {
                match ipfs.read(link).await {
                    Ok(bytes) => match self.verify_and_store(hash, &bytes).await {
                        Ok(found) => return Ok(found),
                        Err(e) => failures.push(e),
                    },
                    Err(e) if e.is_not_found() => not_present += 1,
                    Err(e) => {
                        warn!(link = %link, error = %e, "ipfs fetch failed");
                        failures.push(e);
                    }
                }
            }
        }

        // HTTPS alternate links, first success wins.
        for link in links.iter().filter(|l| l.starts_with("https://") || l.starts_with("http://")) {
            match self.fetch_https(link).await {
                Ok(bytes) => match self.verify_and_store(hash, &bytes).await {
                    Ok(found) => return Ok(found),
                    Err(e) => {
                        warn!(link = %link, error = %e, "fetched content failed verification");
                        failures.push(e);
                    }
                },
                Err(e) if e.is_not_found() => not_present += 1,
                Err(e) => {
                    warn!(link = %link, error = %e, "https fetch failed");
                    failures.push(e);
                }
            }
        }

        // Peer WebCAS via WebFinger.
        if let Some(domain) = web_cas_hint {
            match self.try_web_cas(domain, hash).await {
                Ok(found) => return Ok(found),
                Err(e) if e.is_not_found() => not_present += 1,
                Err(e) => failures.push(e),
            }
        }

        Err(aggregate(hash, not_present, failures))
    }

    async fn resolve_ipfs_only(&self, cid: &str) -> Result<(Vec<u8>, String)> {
        let ipfs = self
            .ipfs
            .as_ref()
            .ok_or_else(|| Error::permanent("no IPFS client configured"))?;

        let bytes = ipfs.read(cid).await?;

        // CID-addressed content carries its own integrity; re-hash locally.
        let local_hl = self.local.write(&bytes).await?;
        Ok((bytes, local_hl))
    }

    /// WebFinger lookup at the peer, then fetch the advertised URLs in order
    async fn try_web_cas(&self, domain: &str, hash: &str) -> Result<(Vec<u8>, String)> {
        let urls = self.webfinger.resolve_web_cas_urls(domain, hash).await?;

        let mut failures = Vec::new();
        let mut not_present = 0usize;

        for url in &urls {
            debug!(url = %url, hash = %hash, "trying webcas endpoint");
            match self.fetch_https(url).await {
                Ok(bytes) => match self.verify_and_store(hash, &bytes).await {
                    Ok(found) => return Ok(found),
                    Err(e) => failures.push(e),
                },
                Err(e) if e.is_not_found() => not_present += 1,
                Err(e) => failures.push(e),
            }
        }

        Err(aggregate(hash, not_present, failures))
    }

    async fn fetch_https(&self, url: &str) -> Result<Vec<u8>> {
        with_retries(&self.retry, Error::is_transient, || async {
            let response = self.http.get(url).await?;

            let status = response.status();
            if !status.is_success() {
                return Err(crate::error::from_status(
                    status.as_u16(),
                    format!("GET [{url}]"),
                ));
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| Error::transient(format!("read body from [{url}]: {e}")))?;

            Ok(bytes.to_vec())
        })
        .await
    }

    async fn verify_and_store(&self, hash: &str, bytes: &[u8]) -> Result<(Vec<u8>, String)> {
        let local_hl = self.local.store_fetched(hash, bytes).await?;
        Ok((bytes.to_vec(), local_hl))
    }

    fn local_links(&self, hash: &str) -> Vec<String> {
        self.local.web_cas_link(hash).into_iter().collect()
    }
}

fn aggregate(hash: &str, not_present: usize, failures: Vec<Error>) -> Error {
    if failures.is_empty() {
        return Error::NotFound(format!(
            "content [{hash}] not found at any of {not_present} endpoint(s)"
        ));
    }

    // Keep a permanent verification failure permanent when it is the only
    // kind of failure seen.
    if not_present == 0 && failures.iter().all(|e| !e.is_transient() && !e.is_not_found()) {
        let summary: Vec<String> = failures.iter().map(|e| e.to_string()).collect();
        return Error::permanent(format!("resolve [{hash}]: {}", summary.join("; ")));
    }

    let summary: Vec<String> = failures.iter().map(|e| e.to_string()).collect();
    Error::transient(format!(
        "resolve [{hash}]: {not_present} endpoint(s) reported not-present, failures: {}",
        summary.join("; ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::CasConfig;
    use crate::discovery::WebFingerConfig;
    use crate::httpsig::HttpSigner;
    use crate::store::memory::MemStore;

    fn resolver() -> CasResolver {
        let local = Arc::new(CasStore::new(
            Arc::new(MemStore::new("cas")),
            CasConfig {
                public_url: Some("https://local.example.com".to_string()),
                ..CasConfig::default()
            },
            None,
        ));

        CasResolver::new(
            local,
            None,
            Arc::new(WebFingerClient::new(WebFingerConfig::default()).unwrap()),
            Arc::new(
                SignedHttpClient::new(
                    Arc::new(HttpSigner::generate("test-key")),
                    Duration::from_secs(2),
                )
                .unwrap(),
            ),
        )
    }

    #[test]
    fn test_parse_ref_forms() {
        let hl = hashlink::create(b"x", &["https://a.com/cas/u1".to_string()]).unwrap();
        match parse_ref(&hl).unwrap() {
            ContentRef::Hash { links, .. } => assert_eq!(links.len(), 1),
            other => panic!("unexpected: {other:?}"),
        }

        assert_eq!(
            parse_ref("ipfs:bafkreix").unwrap(),
            ContentRef::Ipfs {
                cid: "bafkreix".to_string()
            }
        );

        let hash = hashlink::encode_resource_hash(b"y");
        match parse_ref(&format!("https:peer.example.com:8443:{hash}")).unwrap() {
            ContentRef::WebCas { domain, hash: h } => {
                assert_eq!(domain, "peer.example.com:8443");
                assert_eq!(h, hash);
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert!(parse_ref("garbage").is_err());
    }

    #[tokio::test]
    async fn test_inline_content_stored_and_returned() {
        let resolver = resolver();
        let content = b"inline anchor";
        let hl = hashlink::create(content, &[]).unwrap();

        let (bytes, local_hl) = resolver.resolve(None, &hl, Some(content)).await.unwrap();
        assert_eq!(bytes, content);
        assert!(local_hl.starts_with("hl:"));

        // Now resolvable locally without inline bytes.
        let (again, _) = resolver.resolve(None, &hl, None).await.unwrap();
        assert_eq!(again, content);
    }

    #[tokio::test]
    async fn test_inline_mismatch_is_permanent() {
        let resolver = resolver();
        let hl = hashlink::create(b"expected", &[]).unwrap();

        let err = resolver.resolve(None, &hl, Some(b"other")).await.unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn test_unresolvable_hash_is_not_found() {
        let resolver = resolver();
        let hash = hashlink::encode_resource_hash(b"nowhere");

        let err = resolver.resolve(None, &hash, None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_aggregate_error_mapping() {
        let hash = "uAbc";

        assert!(aggregate(hash, 3, vec![]).is_not_found());
        assert!(aggregate(hash, 1, vec![Error::transient("conn refused")]).is_transient());
        assert!(matches!(
            aggregate(
                hash,
                0,
                vec![Error::HashMismatch {
                    expected: "a".into(),
                    actual: "b".into()
                }]
            ),
            Error::Permanent(_)
        ));
    }
}
