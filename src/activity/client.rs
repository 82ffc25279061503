//! Activity client
//!
//! Fetches remote actor documents over the signed transport and caches
//! them, so audience resolution and key lookups don't hammer peers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{self, Error, Result};
use crate::httpsig::SignedHttpClient;

use super::vocab::Actor;

/// Client for remote actor documents
pub struct ActivityClient {
    http: Arc<SignedHttpClient>,
    cache: RwLock<HashMap<String, (Actor, Instant)>>,
    ttl: Duration,
}

impl ActivityClient {
    pub fn new(http: Arc<SignedHttpClient>, ttl: Duration) -> Self {
        Self {
            http,
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Fetch an actor document by IRI, consulting the cache first
    pub async fn get_actor(&self, iri: &str) -> Result<Actor> {
        {
            let cache = self.cache.read().await;
            if let Some((actor, inserted)) = cache.get(iri) {
                if inserted.elapsed() < self.ttl {
                    return Ok(actor.clone());
                }
            }
        }

        let response = self.http.get(iri).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(error::from_status(
                status.as_u16(),
                format!("fetch actor [{iri}]"),
            ));
        }

        let actor: Actor = response
            .json()
            .await
            .map_err(|e| Error::permanent(format!("invalid actor document [{iri}]: {e}")))?;

        debug!(iri = %iri, inbox = %actor.inbox, "resolved actor");

        let mut cache = self.cache.write().await;
        cache.insert(iri.to_string(), (actor.clone(), Instant::now()));

        Ok(actor)
    }
}
