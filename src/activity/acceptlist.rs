//! Accept lists
//!
//! Per-relation allow lists consulted by the inbox: `follow` governs who
//! may follow this node, `invite-witness` who may invite it to witness.
//! The model is explicit-allow: an empty list rejects everyone for that
//! relation type.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::store::{SortOrder, Store, StoreQuery, Tag};

/// Accept-list type for follow requests
pub const TYPE_FOLLOW: &str = "follow";
/// Accept-list type for witness invitations
pub const TYPE_INVITE_WITNESS: &str = "invite-witness";

const TAG_TYPE: &str = "acceptType";

/// Manages the accept lists in a dedicated keyspace
pub struct AcceptListManager {
    store: Arc<dyn Store>,
}

impl AcceptListManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn key(list_type: &str, iri: &str) -> String {
        format!("{list_type}|{iri}")
    }

    /// Apply additions and removals to a list in one call
    pub async fn update(
        &self,
        list_type: &str,
        additions: &[String],
        removals: &[String],
    ) -> Result<()> {
        validate_type(list_type)?;

        for iri in additions {
            self.store
                .put(
                    &Self::key(list_type, iri),
                    iri.as_bytes(),
                    &[Tag::new(TAG_TYPE, list_type)],
                )
                .await?;
        }

        for iri in removals {
            self.store.delete(&Self::key(list_type, iri)).await?;
        }

        Ok(())
    }

    /// All entries of a list, in insertion order
    pub async fn get(&self, list_type: &str) -> Result<Vec<String>> {
        validate_type(list_type)?;

        let results = self
            .store
            .query(&StoreQuery::by_tag(TAG_TYPE, list_type), SortOrder::Ascending)
            .await?;

        Ok(results
            .collect_remaining()
            .into_iter()
            .map(|e| String::from_utf8_lossy(&e.value).into_owned())
            .collect())
    }

    /// Whether the actor is on the list
    pub async fn is_allowed(&self, list_type: &str, iri: &str) -> Result<bool> {
        validate_type(list_type)?;

        match self.store.get(&Self::key(list_type, iri)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(Error::transient(format!("accept-list lookup: {e}"))),
        }
    }
}

fn validate_type(list_type: &str) -> Result<()> {
    if list_type == TYPE_FOLLOW || list_type == TYPE_INVITE_WITNESS {
        Ok(())
    } else {
        Err(Error::BadRequest(format!(
            "unknown accept-list type [{list_type}]"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemStore;

    #[tokio::test]
    async fn test_update_and_lookup() {
        let mgr = AcceptListManager::new(Arc::new(MemStore::new("accept-list")));

        mgr.update(
            TYPE_FOLLOW,
            &["https://a.com/services/anchor".to_string()],
            &[],
        )
        .await
        .unwrap();

        assert!(mgr
            .is_allowed(TYPE_FOLLOW, "https://a.com/services/anchor")
            .await
            .unwrap());
        assert!(!mgr
            .is_allowed(TYPE_FOLLOW, "https://b.com/services/anchor")
            .await
            .unwrap());

        // The follow list does not leak into the witness list.
        assert!(!mgr
            .is_allowed(TYPE_INVITE_WITNESS, "https://a.com/services/anchor")
            .await
            .unwrap());

        mgr.update(
            TYPE_FOLLOW,
            &[],
            &["https://a.com/services/anchor".to_string()],
        )
        .await
        .unwrap();
        assert!(!mgr
            .is_allowed(TYPE_FOLLOW, "https://a.com/services/anchor")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_get_lists_entries() {
        let mgr = AcceptListManager::new(Arc::new(MemStore::new("accept-list")));

        mgr.update(
            TYPE_INVITE_WITNESS,
            &["https://w1.com".to_string(), "https://w2.com".to_string()],
            &[],
        )
        .await
        .unwrap();

        assert_eq!(
            mgr.get(TYPE_INVITE_WITNESS).await.unwrap(),
            vec!["https://w1.com", "https://w2.com"]
        );
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let mgr = AcceptListManager::new(Arc::new(MemStore::new("accept-list")));
        assert!(matches!(
            mgr.get("bogus").await.unwrap_err(),
            Error::BadRequest(_)
        ));
    }
}
