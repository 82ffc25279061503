//! Signed HTTP transport
//!
//! Outgoing requests are signed with the node's ed25519 key over the
//! canonical request parts (request target, host, date, body digest).
//! Inbound signatures are verified against the actor's public key, which
//! is resolved from the `keyId` URL and cached. The actor that owns a
//! verified key is the request principal.
//!
//! Unsupported key algorithms are permanent errors; resolver I/O failures
//! are transient; a bad signature is an authorisation failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{self, Error, Result};

/// Signature algorithm accepted by this node
pub const ALGORITHM: &str = "ed25519";

/// Headers covered by the signature, in canonical order
const SIGNED_HEADERS: &str = "(request-target) host date digest";

/// A public-key document as served from the keys endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyDoc {
    pub id: String,
    pub owner: String,
    #[serde(rename = "publicKeyBase64")]
    pub public_key_base64: String,
}

impl PublicKeyDoc {
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        let raw = STANDARD
            .decode(&self.public_key_base64)
            .map_err(|e| Error::permanent(format!("invalid public key encoding: {e}")))?;

        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| Error::permanent("unsupported key type: expected 32-byte ed25519 key"))?;

        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| Error::permanent(format!("unsupported key type: {e}")))
    }
}

/// Canonical parts of a request used for signing and verification
#[derive(Debug, Clone)]
pub struct RequestParts {
    /// Lower-case HTTP method
    pub method: String,
    /// Path plus query
    pub target: String,
    pub host: String,
    pub date: String,
    pub digest: String,
    /// The raw `Signature` header (verification only)
    pub signature: Option<String>,
}

fn signing_string(method: &str, target: &str, host: &str, date: &str, digest: &str) -> String {
    format!(
        "(request-target): {} {target}\nhost: {host}\ndate: {date}\ndigest: {digest}",
        method.to_lowercase()
    )
}

/// Body digest in `SHA-256=<base64>` form
pub fn body_digest(body: &[u8]) -> String {
    format!("SHA-256={}", STANDARD.encode(Sha256::digest(body)))
}

/// Signs outgoing requests with the node key
pub struct HttpSigner {
    key_id: String,
    key: SigningKey,
}

impl HttpSigner {
    pub fn new(key_id: impl Into<String>, key: SigningKey) -> Self {
        Self {
            key_id: key_id.into(),
            key,
        }
    }

    /// Generate a fresh node key
    pub fn generate(key_id: impl Into<String>) -> Self {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self::new(key_id, key)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// The node's public key document
    pub fn public_key_doc(&self, owner: &str) -> PublicKeyDoc {
        PublicKeyDoc {
            id: self.key_id.clone(),
            owner: owner.to_string(),
            public_key_base64: STANDARD.encode(self.verifying_key().to_bytes()),
        }
    }

    /// Sign a detached payload (witness proofs reuse the node key)
    pub fn sign_bytes(&self, payload: &[u8]) -> String {
        STANDARD.encode(self.key.sign(payload).to_bytes())
    }

    /// Compute the Date, Digest and Signature headers for a request
    pub fn sign(&self, method: &str, target: &str, host: &str, body: &[u8]) -> Vec<(String, String)> {
        let date = Utc::now().to_rfc2822();
        let digest = body_digest(body);

        let payload = signing_string(method, target, host, &date, &digest);
        let signature = STANDARD.encode(self.key.sign(payload.as_bytes()).to_bytes());

        vec![
            ("Date".to_string(), date),
            ("Digest".to_string(), digest),
            (
                "Signature".to_string(),
                format!(
                    "keyId=\"{}\",algorithm=\"{ALGORITHM}\",headers=\"{SIGNED_HEADERS}\",signature=\"{signature}\"",
                    self.key_id
                ),
            ),
        ]
    }
}

/// HTTP client that signs every request with the node key
pub struct SignedHttpClient {
    http: reqwest::Client,
    signer: Arc<HttpSigner>,
}

impl SignedHttpClient {
    pub fn new(signer: Arc<HttpSigner>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::transient)?;

        Ok(Self { http, signer })
    }

    pub async fn get(&self, url: &str) -> Result<reqwest::Response> {
        self.send(reqwest::Method::GET, url, Vec::new()).await
    }

    pub async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| Error::permanent(format!("encode request body: {e}")))?;
        self.send(reqwest::Method::POST, url, bytes).await
    }

    async fn send(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| Error::BadRequest(format!("invalid URL [{url}]: {e}")))?;

        let host = parsed
            .host_str()
            .map(|h| match parsed.port() {
                Some(p) => format!("{h}:{p}"),
                None => h.to_string(),
            })
            .ok_or_else(|| Error::BadRequest(format!("no host in URL [{url}]")))?;

        let target = match parsed.query() {
            Some(q) => format!("{}?{q}", parsed.path()),
            None => parsed.path().to_string(),
        };

        let mut request = self
            .http
            .request(method.clone(), parsed)
            .header("Accept", "application/activity+json, application/json");

        for (name, value) in self.signer.sign(method.as_str(), &target, &host, &body) {
            request = request.header(name, value);
        }

        if !body.is_empty() {
            request = request
                .header("Content-Type", "application/activity+json")
                .body(body);
        }

        let response = request.send().await?;
        Ok(response)
    }
}

/// A resolved actor key
#[derive(Debug, Clone)]
pub struct ResolvedKey {
    pub owner: String,
    pub key: VerifyingKey,
}

/// Resolves a `keyId` URL to the owning actor's public key
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, key_id: &str) -> Result<ResolvedKey>;
}

/// Key resolver that fetches the key document over HTTP and caches it
pub struct HttpKeyResolver {
    http: reqwest::Client,
    cache: RwLock<HashMap<String, (ResolvedKey, Instant)>>,
    ttl: Duration,
}

impl HttpKeyResolver {
    pub fn new(timeout: Duration, ttl: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::transient)?;

        Ok(Self {
            http,
            cache: RwLock::new(HashMap::new()),
            ttl,
        })
    }
}

#[async_trait]
impl KeyResolver for HttpKeyResolver {
    async fn resolve(&self, key_id: &str) -> Result<ResolvedKey> {
        {
            let cache = self.cache.read().await;
            if let Some((resolved, inserted)) = cache.get(key_id) {
                if inserted.elapsed() < self.ttl {
                    return Ok(resolved.clone());
                }
            }
        }

        let response = self
            .http
            .get(key_id)
            .header("Accept", "application/activity+json, application/json")
            .send()
            .await
            .map_err(|e| Error::transient(format!("fetch key [{key_id}]: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(error::from_status(
                status.as_u16(),
                format!("fetch key [{key_id}]"),
            ));
        }

        let doc: PublicKeyDoc = response
            .json()
            .await
            .map_err(|e| Error::permanent(format!("invalid key document [{key_id}]: {e}")))?;

        let resolved = ResolvedKey {
            owner: doc.owner.clone(),
            key: doc.verifying_key()?,
        };

        debug!(key_id = %key_id, owner = %resolved.owner, "resolved and cached actor key");

        let mut cache = self.cache.write().await;
        cache.insert(key_id.to_string(), (resolved.clone(), Instant::now()));

        Ok(resolved)
    }
}

/// Verifies inbound request signatures
pub struct HttpVerifier {
    resolver: Arc<dyn KeyResolver>,
}

impl HttpVerifier {
    pub fn new(resolver: Arc<dyn KeyResolver>) -> Self {
        Self { resolver }
    }

    /// Verify the signature over the request parts and body, returning the
    /// actor IRI that owns the signing key.
    pub async fn verify(&self, parts: &RequestParts, body: &[u8]) -> Result<String> {
        let header = parts
            .signature
            .as_deref()
            .ok_or_else(|| Error::Unauthorized("missing signature header".to_string()))?;

        let params = parse_signature_header(header)?;

        let algorithm = params
            .get("algorithm")
            .map(String::as_str)
            .unwrap_or(ALGORITHM);
        if algorithm != ALGORITHM {
            return Err(Error::permanent(format!(
                "unsupported signature algorithm [{algorithm}]"
            )));
        }

        let key_id = params
            .get("keyId")
            .ok_or_else(|| Error::Unauthorized("missing keyId in signature".to_string()))?;
        let signature_b64 = params
            .get("signature")
            .ok_or_else(|| Error::Unauthorized("missing signature value".to_string()))?;

        // The digest header must actually cover the body.
        if parts.digest != body_digest(body) {
            return Err(Error::Unauthorized("body digest mismatch".to_string()));
        }

        let signature_bytes = STANDARD
            .decode(signature_b64)
            .map_err(|e| Error::Unauthorized(format!("invalid signature encoding: {e}")))?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|e| Error::Unauthorized(format!("invalid signature: {e}")))?;

        let resolved = self.resolver.resolve(key_id).await?;

        let payload = signing_string(
            &parts.method,
            &parts.target,
            &parts.host,
            &parts.date,
            &parts.digest,
        );

        resolved
            .key
            .verify(payload.as_bytes(), &signature)
            .map_err(|_| Error::Unauthorized("signature verification failed".to_string()))?;

        Ok(resolved.owner)
    }
}

fn parse_signature_header(header: &str) -> Result<HashMap<String, String>> {
    let mut params = HashMap::new();

    for part in header.split(',') {
        let (name, value) = part
            .trim()
            .split_once('=')
            .ok_or_else(|| Error::Unauthorized(format!("malformed signature header [{header}]")))?;

        params.insert(
            name.trim().to_string(),
            value.trim().trim_matches('"').to_string(),
        );
    }

    Ok(params)
}
