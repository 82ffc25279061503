//! WebFinger / host-meta client
//!
//! Maps a resource IRI to one or more retrieval URLs by querying the
//! authority's `/.well-known/webfinger` and `/.well-known/host-meta.json`
//! documents. `alternate` links are followed up to a fixed depth with
//! cycle detection. Responses are cached for a few seconds to avoid
//! per-request storms; a missing host-meta is reported as `NotFound`,
//! which callers treat as "no alternates".

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{self, Error, Result};

use super::Jrd;

/// Link rel for the primary resource location
pub const REL_SELF: &str = "self";
/// Link rel for alternate locations
pub const REL_ALTERNATE: &str = "alternate";

/// Media type of activity documents
pub const ACTIVITY_JSON_TYPE: &str = "application/activity+json";

/// Configuration for the discovery client
#[derive(Debug, Clone)]
pub struct WebFingerConfig {
    /// How long JRDs are cached
    pub cache_ttl: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Maximum depth when following `alternate` links
    pub max_depth: usize,
}

impl Default for WebFingerConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            max_depth: 5,
        }
    }
}

struct CachedJrd {
    jrd: Jrd,
    expires_at: Instant,
}

/// WebFinger / host-meta resolver with a short-lived cache
pub struct WebFingerClient {
    http: reqwest::Client,
    config: WebFingerConfig,
    cache: RwLock<HashMap<String, CachedJrd>>,
}

impl WebFingerClient {
    pub fn new(config: WebFingerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(Error::transient)?;

        Ok(Self {
            http,
            config,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Query WebFinger at the authority of `base` for the given resource
    pub async fn resolve_webfinger(&self, base: &str, resource: &str) -> Result<Jrd> {
        let authority = authority_of(base)?;
        let url = format!(
            "{authority}/.well-known/webfinger?resource={}",
            urlencode(resource)
        );

        self.fetch_jrd(&url).await
    }

    /// Retrieval URLs for a remote WebCAS object: the `self` link followed
    /// by any `alternate` links, in document order.
    pub async fn resolve_web_cas_urls(&self, base: &str, hash: &str) -> Result<Vec<String>> {
        let authority = authority_of(base)?;
        let resource = format!("{authority}/cas/{hash}");

        let jrd = self.resolve_webfinger(base, &resource).await?;

        let mut urls: Vec<String> = jrd.hrefs(REL_SELF);
        urls.extend(jrd.hrefs(REL_ALTERNATE));

        if urls.is_empty() {
            return Err(Error::NotFound(format!("no links for resource [{resource}]")));
        }

        Ok(urls)
    }

    /// Resolve the host-meta link of the given type for a resource IRI,
    /// following `alternate` links. Used to map an anchor author IRI to
    /// its activity endpoint.
    pub async fn resolve_host_meta_link(&self, iri: &str, link_type: &str) -> Result<String> {
        let mut visited = HashSet::new();
        let mut base = authority_of(iri)?;

        for _depth in 0..self.config.max_depth {
            if !visited.insert(base.clone()) {
                return Err(Error::permanent(format!(
                    "cycle detected resolving host-meta for [{iri}]"
                )));
            }

            let url = format!("{base}/.well-known/host-meta.json");
            let jrd = self.fetch_jrd(&url).await?;

            let matching = jrd
                .links
                .iter()
                .find(|l| l.link_type.as_deref() == Some(link_type))
                .and_then(|l| l.href.clone());
            if let Some(href) = matching {
                return Ok(href);
            }

            match jrd.link(REL_ALTERNATE).and_then(|l| l.href.clone()) {
                Some(href) => {
                    debug!(from = %base, to = %href, "following host-meta alternate link");
                    base = authority_of(&href)?;
                }
                None => {
                    return Err(Error::NotFound(format!(
                        "no [{link_type}] link in host-meta for [{iri}]"
                    )))
                }
            }
        }

        Err(Error::permanent(format!(
            "host-meta alternate chain for [{iri}] exceeds depth {}",
            self.config.max_depth
        )))
    }

    async fn fetch_jrd(&self, url: &str) -> Result<Jrd> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(url) {
                if cached.expires_at > Instant::now() {
                    return Ok(cached.jrd.clone());
                }
            }
        }

        let response = self
            .http
            .get(url)
            .header("Accept", "application/jrd+json, application/json")
            .send()
            .await
            .map_err(|e| Error::transient(format!("fetch [{url}]: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(error::from_status(status.as_u16(), format!("fetch [{url}]")));
        }

        let jrd: Jrd = response
            .json()
            .await
            .map_err(|e| Error::permanent(format!("invalid JRD from [{url}]: {e}")))?;

        let mut cache = self.cache.write().await;
        cache.retain(|_, c| c.expires_at > Instant::now());
        cache.insert(
            url.to_string(),
            CachedJrd {
                jrd: jrd.clone(),
                expires_at: Instant::now() + self.config.cache_ttl,
            },
        );

        Ok(jrd)
    }
}

/// Reduce a URL or bare authority to `scheme://host[:port]`
pub fn authority_of(iri: &str) -> Result<String> {
    let (scheme, rest) = match iri.split_once("://") {
        Some((scheme, rest)) => (scheme.to_string(), rest.to_string()),
        None => ("https".to_string(), iri.to_string()),
    };

    let host = rest
        .split(['/', '?', '#'])
        .next()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::BadRequest(format!("no authority in [{iri}]")))?;

    Ok(format!("{scheme}://{host}"))
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_of() {
        assert_eq!(
            authority_of("https://node1.example.com/services/anchor").unwrap(),
            "https://node1.example.com"
        );
        assert_eq!(
            authority_of("http://localhost:8080/cas/u123?x=1").unwrap(),
            "http://localhost:8080"
        );
        assert_eq!(
            authority_of("node1.example.com").unwrap(),
            "https://node1.example.com"
        );
        assert!(authority_of("https:///path").is_err());
    }

    #[test]
    fn test_urlencode() {
        assert_eq!(
            urlencode("https://a.com/cas/u1"),
            "https%3A%2F%2Fa.com%2Fcas%2Fu1"
        );
        assert_eq!(urlencode("plain-text_1.0~x"), "plain-text_1.0~x");
    }

    #[test]
    fn test_jrd_link_selection() {
        let jrd: Jrd = serde_json::from_value(serde_json::json!({
            "subject": "https://a.com/cas/u1",
            "links": [
                {"rel": "self", "href": "https://a.com/cas/u1"},
                {"rel": "alternate", "type": "application/activity+json",
                 "href": "https://b.com/cas/u1"},
                {"rel": "alternate", "href": "ipfs://bafy123"}
            ]
        }))
        .unwrap();

        assert_eq!(jrd.link(REL_SELF).unwrap().href.as_deref(), Some("https://a.com/cas/u1"));
        assert_eq!(
            jrd.hrefs(REL_ALTERNATE),
            vec!["https://b.com/cas/u1", "ipfs://bafy123"]
        );
    }
}
