//! IPFS CAS client
//!
//! Talks to an IPFS node over its HTTP API (`/api/v0/add`, `/api/v0/cat`).
//! The CID version used for writes is selectable (0 or 1); v1 is the
//! default. A `cat` that times out or returns the literal `null` maps to
//! `NotFound`; other transport failures are transient.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::hashlink;

/// Configuration for the IPFS client
#[derive(Debug, Clone)]
pub struct IpfsConfig {
    /// Base URL of the IPFS HTTP API (e.g. `http://localhost:5001`)
    pub url: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// CID version for writes: 0 or 1 (default 1)
    pub cid_version: u8,
}

impl Default for IpfsConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5001".to_string(),
            timeout: Duration::from_secs(20),
            cid_version: 1,
        }
    }
}

#[derive(Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

/// Client for reading and writing IPFS content
#[derive(Debug)]
pub struct IpfsClient {
    http: reqwest::Client,
    config: IpfsConfig,
}

impl IpfsClient {
    pub fn new(config: IpfsConfig) -> Result<Self> {
        if config.cid_version != 0 && config.cid_version != 1 {
            return Err(Error::BadRequest(format!(
                "{} is not a supported CID version; it must be either 0 or 1",
                config.cid_version
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(Error::transient)?;

        Ok(Self { http, config })
    }

    /// Write content to IPFS, returning its CID. Empty content is rejected.
    pub async fn write(&self, content: &[u8]) -> Result<String> {
        if content.is_empty() {
            return Err(Error::BadRequest("empty content".to_string()));
        }

        let url = format!(
            "{}/api/v0/add?cid-version={}",
            self.config.url, self.config.cid_version
        );

        let form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(content.to_vec()));

        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::transient(format!("ipfs add: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::transient(format!(
                "ipfs add returned HTTP {}",
                response.status()
            )));
        }

        let added: AddResponse = response
            .json()
            .await
            .map_err(|e| Error::transient(format!("ipfs add response: {e}")))?;

        debug!(cid = %added.hash, cid_version = self.config.cid_version, size = content.len(),
            "wrote content to ipfs");

        Ok(added.hash)
    }

    /// Read content by CID, multihash or hashlink
    pub async fn read(&self, id: &str) -> Result<Vec<u8>> {
        let cid = self.to_cid(id)?;

        let url = format!("{}/api/v0/cat?arg={cid}", self.config.url);

        let response = match self.http.post(&url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                debug!(cid = %cid, "cid not found in ipfs (timeout)");
                return Err(Error::NotFound(format!("ipfs content [{cid}]")));
            }
            Err(e) => return Err(Error::transient(format!("ipfs cat [{cid}]: {e}"))),
        };

        if !response.status().is_success() {
            return Err(Error::transient(format!(
                "ipfs cat [{cid}] returned HTTP {}",
                response.status()
            )));
        }

        let content = response
            .bytes()
            .await
            .map_err(|e| Error::transient(format!("ipfs cat body [{cid}]: {e}")))?;

        if content.as_ref() == b"null" {
            debug!(cid = %cid, "got 'null' from ipfs");
            return Err(Error::NotFound(format!("ipfs content [{cid}]")));
        }

        Ok(content.to_vec())
    }

    /// Resolve the argument to a CID. A bare multibase multihash or a
    /// hashlink is converted to a v1 CID; CID strings pass through.
    /// Conversion to v0 CIDs is not supported; v0 reads rely on the CID
    /// recorded in hashlink metadata at write time.
    fn to_cid(&self, id: &str) -> Result<String> {
        let id = id.strip_prefix("ipfs://").unwrap_or(id);

        if id.starts_with(hashlink::HL_PREFIX) {
            let hl = hashlink::parse(id)?;
            return hash_to_cid_v1(&hl.resource_hash);
        }

        if id.starts_with('u') && hashlink::decode_resource_hash(id).is_ok() {
            return hash_to_cid_v1(id);
        }

        Ok(id.to_string())
    }
}

/// Convert a multibase multihash to a v1 CID (raw codec, base32)
pub fn hash_to_cid_v1(resource_hash: &str) -> Result<String> {
    let mh = hashlink::decode_resource_hash(resource_hash)?;

    // CIDv1 = <version=0x01><codec=raw 0x55><multihash>
    let mut cid = Vec::with_capacity(2 + mh.len());
    cid.push(0x01);
    cid.push(0x55);
    cid.extend_from_slice(&mh);

    Ok(format!("b{}", base32_lower(&cid)))
}

/// RFC 4648 base32 (lowercase, no padding), as used by base32 CIDs.
fn base32_lower(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut buffer: u64 = 0;
    let mut bits: u32 = 0;

    for &byte in data {
        buffer = (buffer << 8) | u64::from(byte);
        bits += 8;

        while bits >= 5 {
            bits -= 5;
            let index = ((buffer >> bits) & 0x1f) as usize;
            out.push(ALPHABET[index] as char);
        }
    }

    if bits > 0 {
        let index = ((buffer << (5 - bits)) & 0x1f) as usize;
        out.push(ALPHABET[index] as char);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base32_rfc4648_vectors() {
        assert_eq!(base32_lower(b""), "");
        assert_eq!(base32_lower(b"f"), "my");
        assert_eq!(base32_lower(b"fo"), "mzxq");
        assert_eq!(base32_lower(b"foo"), "mzxw6");
        assert_eq!(base32_lower(b"foob"), "mzxw6yq");
        assert_eq!(base32_lower(b"fooba"), "mzxw6ytb");
        assert_eq!(base32_lower(b"foobar"), "mzxw6ytboi");
    }

    #[test]
    fn test_hash_to_cid_v1_shape() {
        let hash = hashlink::encode_resource_hash(b"content");
        let cid = hash_to_cid_v1(&hash).unwrap();

        // base32 CIDv1 for raw + sha2-256 always begins with "bafkrei".
        assert!(cid.starts_with("bafkrei"), "unexpected cid: {cid}");
    }

    #[test]
    fn test_invalid_cid_version_rejected() {
        let err = IpfsClient::new(IpfsConfig {
            cid_version: 2,
            ..IpfsConfig::default()
        })
        .unwrap_err();

        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn test_to_cid_passthrough_and_conversion() {
        let client = IpfsClient::new(IpfsConfig::default()).unwrap();

        assert_eq!(
            client.to_cid("bafkreigh2akiscaildc").unwrap(),
            "bafkreigh2akiscaildc"
        );
        assert_eq!(
            client.to_cid("ipfs://bafkreigh2akiscaildc").unwrap(),
            "bafkreigh2akiscaildc"
        );

        let hash = hashlink::encode_resource_hash(b"x");
        assert!(client.to_cid(&hash).unwrap().starts_with("bafkrei"));
    }
}
