//! Hashlink codec
//!
//! A hashlink is a self-certifying identifier for an immutable blob:
//! `hl:<multibase(multihash)>` optionally followed by a second segment of
//! base64url-encoded CBOR metadata listing alternate retrieval links
//! (IPFS CIDs, HTTPS URLs). The invariant is that content retrieved
//! through any link must hash to the multihash component.
//!
//! Multihashes use sha2-256 (code 0x12) and the base64url multibase
//! prefix `u`, so a resource hash looks like `uEiB...` and metadata like
//! `uoQ...` (a CBOR map).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Prefix of every hashlink
pub const HL_PREFIX: &str = "hl:";

/// Multihash code for sha2-256
const SHA2_256_CODE: u8 = 0x12;
/// Digest length of sha2-256
const SHA2_256_LEN: u8 = 0x20;
/// Multibase prefix for base64url (no padding)
const MULTIBASE_BASE64URL: char = 'u';

/// Parsed hashlink: the multibase-encoded resource hash plus any
/// alternate retrieval links carried in the metadata segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashLink {
    pub resource_hash: String,
    pub links: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct Metadata {
    links: Vec<String>,
}

/// Compute the sha2-256 multihash of the content
pub fn compute_multihash(content: &[u8]) -> Vec<u8> {
    let digest = Sha256::digest(content);

    let mut mh = Vec::with_capacity(2 + digest.len());
    mh.push(SHA2_256_CODE);
    mh.push(SHA2_256_LEN);
    mh.extend_from_slice(&digest);
    mh
}

/// Multibase (base64url) encoding of the content's multihash
pub fn encode_resource_hash(content: &[u8]) -> String {
    format!(
        "{}{}",
        MULTIBASE_BASE64URL,
        URL_SAFE_NO_PAD.encode(compute_multihash(content))
    )
}

/// Decode a multibase resource hash back to raw multihash bytes
pub fn decode_resource_hash(hash: &str) -> Result<Vec<u8>> {
    let encoded = hash
        .strip_prefix(MULTIBASE_BASE64URL)
        .ok_or_else(|| Error::BadRequest(format!("unsupported multibase prefix in [{hash}]")))?;

    let mh = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| Error::BadRequest(format!("invalid base64url in hash [{hash}]: {e}")))?;

    if mh.len() != 2 + SHA2_256_LEN as usize || mh[0] != SHA2_256_CODE || mh[1] != SHA2_256_LEN {
        return Err(Error::BadRequest(format!(
            "[{hash}] is not a sha2-256 multihash"
        )));
    }

    Ok(mh)
}

/// Create a hashlink for the content with the given alternate links.
/// Empty content is rejected.
pub fn create(content: &[u8], links: &[String]) -> Result<String> {
    if content.is_empty() {
        return Err(Error::BadRequest("empty content".to_string()));
    }

    let resource_hash = encode_resource_hash(content);

    if links.is_empty() {
        return Ok(format!("{HL_PREFIX}{resource_hash}"));
    }

    let metadata = serde_cbor::to_vec(&Metadata {
        links: links.to_vec(),
    })
    .map_err(|e| Error::permanent(format!("encode hashlink metadata: {e}")))?;

    Ok(format!(
        "{HL_PREFIX}{resource_hash}:{}{}",
        MULTIBASE_BASE64URL,
        URL_SAFE_NO_PAD.encode(metadata)
    ))
}

/// Parse a hashlink into its resource hash and links
pub fn parse(hl: &str) -> Result<HashLink> {
    let rest = hl
        .strip_prefix(HL_PREFIX)
        .ok_or_else(|| Error::BadRequest(format!("[{hl}] is not a hashlink")))?;

    let (hash, metadata) = match rest.split_once(':') {
        Some((hash, metadata)) => (hash, Some(metadata)),
        None => (rest, None),
    };

    // Validate the hash segment eagerly so bad links fail here, not on fetch.
    decode_resource_hash(hash)?;

    let links = match metadata {
        None => Vec::new(),
        Some(encoded) => {
            let raw = encoded
                .strip_prefix(MULTIBASE_BASE64URL)
                .ok_or_else(|| {
                    Error::BadRequest(format!("unsupported metadata multibase in [{hl}]"))
                })
                .and_then(|m| {
                    URL_SAFE_NO_PAD
                        .decode(m)
                        .map_err(|e| Error::BadRequest(format!("invalid metadata in [{hl}]: {e}")))
                })?;

            let metadata: Metadata = serde_cbor::from_slice(&raw)
                .map_err(|e| Error::BadRequest(format!("invalid metadata CBOR in [{hl}]: {e}")))?;

            metadata.links
        }
    };

    Ok(HashLink {
        resource_hash: hash.to_string(),
        links,
    })
}

/// Extract the resource hash from either a bare hash or a full hashlink
pub fn resource_hash_of(id: &str) -> Result<String> {
    if id.starts_with(HL_PREFIX) {
        Ok(parse(id)?.resource_hash)
    } else {
        decode_resource_hash(id)?;
        Ok(id.to_string())
    }
}

/// Verify that the content hashes to the given resource hash.
/// A mismatch is a permanent error.
pub fn verify(content: &[u8], resource_hash: &str) -> Result<()> {
    // Validates the encoding as a side effect.
    decode_resource_hash(resource_hash)?;

    let actual = encode_resource_hash(content);
    if actual != resource_hash {
        return Err(Error::HashMismatch {
            expected: resource_hash.to_string(),
            actual,
        });
    }

    Ok(())
}
