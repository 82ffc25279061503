//! Data expiry service
//!
//! Stores register themselves with a tag whose value is a Unix-seconds
//! expiry time (ASCII integer). On each task-manager tick the sweep
//! queries every registered store for entries whose expiry tag is in the
//! past and hands the keys to the store's handler. Deletion is the
//! handler's responsibility; the default handler deletes. Handler
//! failures are logged and surviving keys are retried on the next sweep.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

use super::{BatchOperation, SortOrder, Store, StoreQuery};

/// Tag name under which stores record the expiry time (Unix seconds)
pub const EXPIRY_TAG: &str = "expirationTime";

/// Receives the keys of expired entries for one registered store
#[async_trait]
pub trait ExpiryHandler: Send + Sync {
    async fn handle_expired(&self, store: &Arc<dyn Store>, keys: Vec<String>) -> Result<()>;
}

/// Default handler: batch-delete the expired keys
pub struct DeleteExpiredHandler;

#[async_trait]
impl ExpiryHandler for DeleteExpiredHandler {
    async fn handle_expired(&self, store: &Arc<dyn Store>, keys: Vec<String>) -> Result<()> {
        let ops = keys
            .into_iter()
            .map(|key| BatchOperation::Delete { key })
            .collect();

        store.batch(ops).await
    }
}

struct Registration {
    name: String,
    store: Arc<dyn Store>,
    tag_name: String,
    handler: Arc<dyn ExpiryHandler>,
}

/// Sweeper over all registered stores, driven as a named periodic task
#[derive(Default)]
pub struct ExpiryService {
    registrations: Mutex<Vec<Registration>>,
}

impl ExpiryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store for expiry sweeps. `tag_name` holds the
    /// Unix-seconds expiry value; `handler` defaults to deletion.
    pub async fn register(
        &self,
        store: Arc<dyn Store>,
        tag_name: &str,
        name: &str,
        handler: Option<Arc<dyn ExpiryHandler>>,
    ) {
        let mut registrations = self.registrations.lock().await;
        registrations.push(Registration {
            name: name.to_string(),
            store,
            tag_name: tag_name.to_string(),
            handler: handler.unwrap_or_else(|| Arc::new(DeleteExpiredHandler)),
        });

        debug!(store = name, tag = tag_name, "registered store for expiry sweeps");
    }

    /// One pass over every registered store
    pub async fn sweep(&self) {
        let now = Utc::now().timestamp();
        let registrations = self.registrations.lock().await;

        for reg in registrations.iter() {
            match Self::expired_keys(&reg.store, &reg.tag_name, now).await {
                Ok(keys) if keys.is_empty() => {}
                Ok(keys) => {
                    let total = keys.len();
                    if let Err(e) = reg.handler.handle_expired(&reg.store, keys).await {
                        warn!(store = %reg.name, error = %e,
                            "expiry handler failed; keys will be retried on the next sweep");
                    } else {
                        debug!(store = %reg.name, total = total, "expired entries handled");
                    }
                }
                Err(e) => {
                    warn!(store = %reg.name, error = %e, "expiry query failed");
                }
            }
        }
    }

    async fn expired_keys(store: &Arc<dyn Store>, tag_name: &str, now: i64) -> Result<Vec<String>> {
        let mut results = store
            .query(&StoreQuery::tag_exists(tag_name), SortOrder::Ascending)
            .await?;

        let mut expired = Vec::new();

        while let Some(entry) = results.next_entry() {
            let Some(raw) = entry.tag_value(tag_name) else {
                continue;
            };

            match raw.parse::<i64>() {
                Ok(expiry) if expiry <= now => expired.push(entry.key),
                Ok(_) => {}
                Err(e) => {
                    warn!(key = %entry.key, value = raw, error = %e,
                        "invalid expiry tag value; entry skipped");
                }
            }
        }

        Ok(expired)
    }
}
