//! Activity store
//!
//! Persists activities and maintains the ordered reference collections
//! (inbox, outbox, followers, ...) on top of the store facade. References
//! are deduplicated per (kind, owner); deleting an activity removes it
//! from every collection that referenced it. Paged queries follow the
//! ascending/descending page-number formulas shared with the REST layer.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::store::{SortOrder, Store, StoreQuery, Tag, TagFilter};

use super::vocab::{Activity, ActivityType};

/// Kind of a reference collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    Inbox,
    Outbox,
    PublicOutbox,
    Follower,
    Following,
    Witness,
    Witnessing,
    Liked,
    /// Shares of an object; the owner is the object IRI
    Share,
    /// Likes of an object; the owner is the object IRI
    Like,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::Inbox => "inbox",
            ReferenceKind::Outbox => "outbox",
            ReferenceKind::PublicOutbox => "public-outbox",
            ReferenceKind::Follower => "follower",
            ReferenceKind::Following => "following",
            ReferenceKind::Witness => "witness",
            ReferenceKind::Witnessing => "witnessing",
            ReferenceKind::Liked => "liked",
            ReferenceKind::Share => "share",
            ReferenceKind::Like => "like",
        }
    }
}

/// Page request for collection queries. A `None` page number selects the
/// first page of the requested order.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub page_size: usize,
    pub page_num: Option<i64>,
    pub order: SortOrder,
}

/// One page of an ordered collection
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_items: usize,
    pub current: i64,
    pub prev: Option<i64>,
    pub next: Option<i64>,
}

/// Page number of the first page for the given order
pub fn first_page_num(total: usize, page_size: usize, order: SortOrder) -> i64 {
    match order {
        SortOrder::Ascending => 0,
        SortOrder::Descending => max_page_num(total, page_size),
    }
}

/// Page number of the last page for the given order
pub fn last_page_num(total: usize, page_size: usize, order: SortOrder) -> i64 {
    match order {
        SortOrder::Ascending => max_page_num(total, page_size),
        SortOrder::Descending => 0,
    }
}

fn max_page_num(total: usize, page_size: usize) -> i64 {
    let total = total as i64;
    let page_size = page_size.max(1) as i64;

    if total % page_size > 0 {
        total / page_size
    } else {
        total / page_size - 1
    }
}

fn prev_next_ascending(current: i64, first: i64, last: i64) -> (Option<i64>, Option<i64>) {
    let next = if current < last { Some(current + 1) } else { None };

    let prev = if current > first {
        if current > last {
            Some(last)
        } else {
            Some(current - 1)
        }
    } else {
        None
    };

    (prev, next)
}

fn prev_next_descending(current: i64, first: i64, last: i64) -> (Option<i64>, Option<i64>) {
    let next = if current > last {
        if current > first {
            Some(first)
        } else {
            Some(current - 1)
        }
    } else {
        None
    };

    let prev = if current < first { Some(current + 1) } else { None };

    (prev, next)
}

/// Slice an ordered item list into the requested page. `items` must
/// already be in the requested order.
pub fn paginate<T>(items: Vec<T>, request: &PageRequest) -> Page<T> {
    let total = items.len();
    let size = request.page_size.max(1);

    let first = first_page_num(total, size, request.order);
    let last = last_page_num(total, size, request.order);

    // An invalid or missing page number means the first page.
    let current = match request.page_num {
        Some(n) if n >= 0 => n,
        _ => first,
    };

    let (prev, next) = match request.order {
        SortOrder::Ascending => prev_next_ascending(current, first, last),
        SortOrder::Descending => prev_next_descending(current, first, last),
    };

    // Offset into the already-ordered sequence.
    let offset = match request.order {
        SortOrder::Ascending => current.checked_mul(size as i64),
        SortOrder::Descending => (first - current).checked_mul(size as i64),
    };

    let page_items = match offset {
        Some(o) if o >= 0 && (o as usize) < total => {
            let start = o as usize;
            let end = (start + size).min(total);
            items.into_iter().skip(start).take(end - start).collect()
        }
        _ => Vec::new(),
    };

    Page {
        items: page_items,
        total_items: total,
        current,
        prev,
        next,
    }
}

const TAG_KIND: &str = "kind";
const TAG_OWNER: &str = "owner";
const TAG_TARGET: &str = "target";
const TAG_TYPE: &str = "activityType";

/// Store for activities and reference collections
pub struct ActivityStore {
    activities: Arc<dyn Store>,
    references: Arc<dyn Store>,
}

impl ActivityStore {
    pub fn new(activities: Arc<dyn Store>, references: Arc<dyn Store>) -> Self {
        Self {
            activities,
            references,
        }
    }

    fn ref_key(kind: ReferenceKind, owner: &str, iri: &str) -> String {
        format!("{}|{owner}|{iri}", kind.as_str())
    }

    /// Append an activity. A duplicate id is a no-op; returns whether the
    /// activity was newly stored.
    pub async fn add_activity(&self, activity: &Activity) -> Result<bool> {
        match self.activities.get(&activity.id).await {
            Ok(_) => {
                debug!(id = %activity.id, "activity already stored");
                return Ok(false);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(Error::transient(format!("activity lookup: {e}"))),
        }

        let bytes = serde_json::to_vec(activity)
            .map_err(|e| Error::permanent(format!("encode activity [{}]: {e}", activity.id)))?;

        self.activities
            .put(
                &activity.id,
                &bytes,
                &[Tag::new(TAG_TYPE, activity.activity_type.as_str())],
            )
            .await
            .map_err(|e| Error::transient(format!("store activity [{}]: {e}", activity.id)))?;

        Ok(true)
    }

    /// Fetch an activity by its id URL
    pub async fn get_activity(&self, id: &str) -> Result<Activity> {
        let bytes = match self.activities.get(id).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                return Err(Error::NotFound(format!("activity [{id}]")))
            }
            Err(e) => return Err(Error::transient(format!("activity get [{id}]: {e}"))),
        };

        serde_json::from_slice(&bytes)
            .map_err(|e| Error::permanent(format!("decode activity [{id}]: {e}")))
    }

    /// Delete an activity and remove it from every collection that
    /// references it.
    pub async fn delete_activity(&self, id: &str) -> Result<()> {
        self.activities.delete(id).await?;

        let mut results = self
            .references
            .query(&StoreQuery::by_tag(TAG_TARGET, id), SortOrder::Ascending)
            .await?;

        while let Some(entry) = results.next_entry() {
            self.references.delete(&entry.key).await?;
        }

        Ok(())
    }

    /// Append an IRI to a collection. Duplicates per (kind, owner) are
    /// no-ops; returns whether the reference was newly added.
    pub async fn add_reference(
        &self,
        kind: ReferenceKind,
        owner: &str,
        iri: &str,
    ) -> Result<bool> {
        let key = Self::ref_key(kind, owner, iri);

        match self.references.get(&key).await {
            Ok(_) => return Ok(false),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(Error::transient(format!("reference lookup: {e}"))),
        }

        self.references
            .put(
                &key,
                iri.as_bytes(),
                &[
                    Tag::new(TAG_KIND, kind.as_str()),
                    Tag::new(TAG_OWNER, owner),
                    Tag::new(TAG_TARGET, iri),
                ],
            )
            .await
            .map_err(|e| Error::transient(format!("store reference: {e}")))?;

        Ok(true)
    }

    /// Remove an IRI from a collection; absent references are no-ops.
    pub async fn delete_reference(
        &self,
        kind: ReferenceKind,
        owner: &str,
        iri: &str,
    ) -> Result<()> {
        self.references
            .delete(&Self::ref_key(kind, owner, iri))
            .await
    }

    /// Whether the collection contains the IRI
    pub async fn reference_exists(
        &self,
        kind: ReferenceKind,
        owner: &str,
        iri: &str,
    ) -> Result<bool> {
        match self.references.get(&Self::ref_key(kind, owner, iri)).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(Error::transient(format!("reference lookup: {e}"))),
        }
    }

    /// All IRIs of a collection, in the requested insertion order
    pub async fn references(
        &self,
        kind: ReferenceKind,
        owner: &str,
        order: SortOrder,
    ) -> Result<Vec<String>> {
        let results = self
            .references
            .query(
                &StoreQuery::new(vec![
                    TagFilter::equals(TAG_KIND, kind.as_str()),
                    TagFilter::equals(TAG_OWNER, owner),
                ]),
                order,
            )
            .await?;

        Ok(results
            .collect_remaining()
            .into_iter()
            .map(|e| String::from_utf8_lossy(&e.value).into_owned())
            .collect())
    }

    /// One page of a collection
    pub async fn query_references(
        &self,
        kind: ReferenceKind,
        owner: &str,
        request: &PageRequest,
    ) -> Result<Page<String>> {
        let items = self.references(kind, owner, request.order).await?;
        Ok(paginate(items, request))
    }

    /// One page of the activities referenced by a collection, optionally
    /// filtered by activity type. The filter applies before paging so
    /// `total_items` counts matching activities.
    pub async fn query_activities(
        &self,
        kind: ReferenceKind,
        owner: &str,
        type_filter: Option<ActivityType>,
        request: &PageRequest,
    ) -> Result<Page<Activity>> {
        let iris = self.references(kind, owner, request.order).await?;
        let values = self.activities.get_bulk(&iris).await?;

        let mut activities = Vec::with_capacity(values.len());
        for (iri, value) in iris.iter().zip(values) {
            let Some(bytes) = value else {
                continue;
            };

            let activity: Activity = serde_json::from_slice(&bytes)
                .map_err(|e| Error::permanent(format!("decode activity [{iri}]: {e}")))?;

            if type_filter.map(|t| activity.activity_type == t).unwrap_or(true) {
                activities.push(activity);
            }
        }

        Ok(paginate(activities, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::vocab::{ActivityType, ObjectProperty};
    use crate::store::memory::MemStore;

    fn store() -> ActivityStore {
        ActivityStore::new(
            Arc::new(MemStore::new("activity")),
            Arc::new(MemStore::new("activity-ref")),
        )
    }

    fn activity(n: usize) -> Activity {
        let mut a = Activity::new(
            ActivityType::Create,
            "https://node1.example.com/services/anchor",
            ObjectProperty::Iri(format!("hl:uEiA{n}")),
        );
        a.id = format!("https://node1.example.com/activities/{n}");
        a
    }

    #[tokio::test]
    async fn test_add_activity_dedupes_by_id() {
        let store = store();
        let a = activity(1);

        assert!(store.add_activity(&a).await.unwrap());
        assert!(!store.add_activity(&a).await.unwrap());

        let fetched = store.get_activity(&a.id).await.unwrap();
        assert_eq!(fetched.id, a.id);
    }

    #[tokio::test]
    async fn test_reference_dedupe_and_order() {
        let store = store();
        let owner = "https://node1.example.com/services/anchor";

        for i in 0..3 {
            assert!(store
                .add_reference(ReferenceKind::Follower, owner, &format!("https://f{i}.com"))
                .await
                .unwrap());
        }
        assert!(!store
            .add_reference(ReferenceKind::Follower, owner, "https://f1.com")
            .await
            .unwrap());

        let refs = store
            .references(ReferenceKind::Follower, owner, SortOrder::Ascending)
            .await
            .unwrap();
        assert_eq!(refs, vec!["https://f0.com", "https://f1.com", "https://f2.com"]);

        let refs = store
            .references(ReferenceKind::Follower, owner, SortOrder::Descending)
            .await
            .unwrap();
        assert_eq!(refs, vec!["https://f2.com", "https://f1.com", "https://f0.com"]);
    }

    #[tokio::test]
    async fn test_delete_activity_removes_references() {
        let store = store();
        let owner = "https://node1.example.com/services/anchor";
        let a = activity(7);

        store.add_activity(&a).await.unwrap();
        store
            .add_reference(ReferenceKind::Inbox, owner, &a.id)
            .await
            .unwrap();
        store
            .add_reference(ReferenceKind::PublicOutbox, owner, &a.id)
            .await
            .unwrap();

        store.delete_activity(&a.id).await.unwrap();

        assert!(store.get_activity(&a.id).await.unwrap_err().is_not_found());
        assert!(!store
            .reference_exists(ReferenceKind::Inbox, owner, &a.id)
            .await
            .unwrap());
        assert!(!store
            .reference_exists(ReferenceKind::PublicOutbox, owner, &a.id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_query_activities_type_filter() {
        let store = store();
        let owner = "https://node1.example.com/services/anchor";

        for i in 0..4 {
            let mut a = activity(i);
            if i % 2 == 1 {
                a.activity_type = ActivityType::Announce;
            }
            store.add_activity(&a).await.unwrap();
            store
                .add_reference(ReferenceKind::Inbox, owner, &a.id)
                .await
                .unwrap();
        }

        let page = store
            .query_activities(
                ReferenceKind::Inbox,
                owner,
                Some(ActivityType::Announce),
                &PageRequest {
                    page_size: 10,
                    page_num: None,
                    order: SortOrder::Ascending,
                },
            )
            .await
            .unwrap();

        assert_eq!(page.total_items, 2);
        assert!(page
            .items
            .iter()
            .all(|a| a.activity_type == ActivityType::Announce));
    }

    // Scenario: 19 items, page size 4, descending. The first page holds
    // items 18..15 with next=3 and no prev; page 30 is out of range and
    // empty with next pointing at the first valid page.
    #[test]
    fn test_paginate_descending_19_items() {
        let items: Vec<usize> = (0..19).rev().collect();

        let page = paginate(
            items.clone(),
            &PageRequest {
                page_size: 4,
                page_num: None,
                order: SortOrder::Descending,
            },
        );

        assert_eq!(page.total_items, 19);
        assert_eq!(page.current, 4);
        assert_eq!(page.items, vec![18, 17, 16, 15]);
        assert_eq!(page.next, Some(3));
        assert_eq!(page.prev, None);

        let page = paginate(
            items.clone(),
            &PageRequest {
                page_size: 4,
                page_num: Some(0),
                order: SortOrder::Descending,
            },
        );
        assert_eq!(page.items, vec![2, 1, 0]);
        assert_eq!(page.prev, Some(1));
        assert_eq!(page.next, None);

        let page = paginate(
            items,
            &PageRequest {
                page_size: 4,
                page_num: Some(30),
                order: SortOrder::Descending,
            },
        );
        assert!(page.items.is_empty());
        assert_eq!(page.total_items, 19);
        assert_eq!(page.next, Some(4));
        assert_eq!(page.prev, None);
    }

    #[test]
    fn test_paginate_ascending_roundtrip() {
        let items: Vec<usize> = (0..19).collect();

        let mut seen = Vec::new();
        let mut page_num = Some(0);

        while let Some(n) = page_num {
            let page = paginate(
                items.clone(),
                &PageRequest {
                    page_size: 4,
                    page_num: Some(n),
                    order: SortOrder::Ascending,
                },
            );
            seen.extend(page.items);
            page_num = page.next;
        }

        assert_eq!(seen, items);
    }

    #[test]
    fn test_paginate_empty_collection() {
        let page = paginate(
            Vec::<usize>::new(),
            &PageRequest {
                page_size: 4,
                page_num: None,
                order: SortOrder::Ascending,
            },
        );

        assert_eq!(page.total_items, 0);
        assert!(page.items.is_empty());
        assert_eq!(page.prev, None);
        assert_eq!(page.next, None);
    }
}
