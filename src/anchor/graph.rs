//! Anchor graph
//!
//! Anchors form a DAG through their `up` references. Given a newly
//! received anchor, the graph walk resolves every unprocessed ancestor
//! through the CAS resolver and returns them deepest-first, so ancestors
//! are materialised before their descendants. Cycles and excessive depth
//! are permanent errors; resolution failures stay transient so the
//! triggering message is redelivered.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::debug;

use crate::cas::resolver::CasResolver;
use crate::error::{Error, Result};

use super::indexes::ProcessedAnchorStore;
use super::{AnchorLinkset, CoreIndex};

/// A resolved anchor: its hashlink, the local replica's hashlink, and
/// the parsed linkset.
#[derive(Debug, Clone)]
pub struct AnchorRef {
    pub hashlink: String,
    pub local_hashlink: String,
    pub linkset: AnchorLinkset,
}

/// Read access to the anchor DAG
pub struct AnchorGraph {
    resolver: Arc<CasResolver>,
    processed: Arc<ProcessedAnchorStore>,
    max_depth: usize,
}

impl AnchorGraph {
    pub fn new(
        resolver: Arc<CasResolver>,
        processed: Arc<ProcessedAnchorStore>,
        max_depth: usize,
    ) -> Self {
        Self {
            resolver,
            processed,
            max_depth,
        }
    }

    /// Resolve and validate one anchor
    pub async fn read(&self, hashlink: &str) -> Result<AnchorRef> {
        let (bytes, local_hashlink) = self.resolver.resolve(None, hashlink, None).await?;

        let linkset = AnchorLinkset::from_bytes(&bytes)?;
        linkset.validate()?;

        Ok(AnchorRef {
            hashlink: hashlink.to_string(),
            local_hashlink,
            linkset,
        })
    }

    /// Resolve the core index referenced by a linkset
    pub async fn read_core_index(&self, core_index_hl: &str) -> Result<CoreIndex> {
        let (bytes, _) = self.resolver.resolve(None, core_index_hl, None).await?;

        serde_json::from_slice(&bytes)
            .map_err(|e| Error::permanent(format!("decode core index [{core_index_hl}]: {e}")))
    }

    /// All unprocessed ancestors of the anchor, deepest first, so they
    /// can be applied before the triggering anchor itself.
    pub async fn unprocessed_ancestors(&self, anchor: &AnchorRef) -> Result<Vec<AnchorRef>> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut in_progress = HashSet::new();

        // The triggering anchor itself is not part of the result, but its
        // hashlink counts as "in progress" for cycle detection.
        in_progress.insert(crate::hashlink::resource_hash_of(&anchor.hashlink)?);

        for up in &anchor.linkset.related.up {
            self.visit(up, 1, &mut visited, &mut in_progress, &mut out)
                .await?;
        }

        debug!(anchor = %anchor.hashlink, ancestors = out.len(),
            "anchor graph walk complete");

        Ok(out)
    }

    fn visit<'a>(
        &'a self,
        hashlink: &'a str,
        depth: usize,
        visited: &'a mut HashSet<String>,
        in_progress: &'a mut HashSet<String>,
        out: &'a mut Vec<AnchorRef>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if depth > self.max_depth {
                return Err(Error::permanent(format!(
                    "anchor graph exceeds maximum depth {} at [{hashlink}]",
                    self.max_depth
                )));
            }

            let hash = crate::hashlink::resource_hash_of(hashlink)?;

            if visited.contains(&hash) {
                return Ok(());
            }

            if in_progress.contains(&hash) {
                return Err(Error::permanent(format!(
                    "cycle detected in anchor graph at [{hashlink}]"
                )));
            }

            if self.processed.contains(hashlink).await? {
                return Ok(());
            }

            in_progress.insert(hash.clone());

            let anchor = self.read(hashlink).await?;

            for up in &anchor.linkset.related.up {
                self.visit(up, depth + 1, visited, in_progress, out).await?;
            }

            in_progress.remove(&hash);
            visited.insert(hash);
            out.push(anchor);

            Ok(())
        }
        .boxed()
    }

    /// All anchors of one DID suffix, oldest first, ending with the given
    /// anchor. The chain follows the suffix's `previousAnchor` references
    /// through the core indexes.
    pub async fn did_anchors(&self, anchor_hl: &str, suffix: &str) -> Result<Vec<AnchorRef>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(anchor_hl.to_string());

        while let Some(hl) = current {
            if chain.len() >= self.max_depth {
                return Err(Error::permanent(format!(
                    "anchor chain for suffix [{suffix}] exceeds maximum depth {}",
                    self.max_depth
                )));
            }

            let hash = crate::hashlink::resource_hash_of(&hl)?;
            if !seen.insert(hash) {
                return Err(Error::permanent(format!(
                    "cycle detected in anchor chain for suffix [{suffix}] at [{hl}]"
                )));
            }

            let anchor = self.read(&hl).await?;
            let core_index = self.read_core_index(&anchor.linkset.anchor).await?;

            current = core_index
                .suffixes
                .iter()
                .find(|s| s.suffix == suffix)
                .and_then(|s| s.previous_anchor.clone());

            chain.push(anchor);
        }

        chain.reverse();
        Ok(chain)
    }
}
