//! Generic store facade
//!
//! Key/value storage with tagged indexed queries, atomic batch writes and
//! snapshot iterators. Concrete back-ends plug in behind [`StoreProvider`];
//! the in-memory provider in [`memory`] is the default and is what the test
//! suite runs against.
//!
//! Tag expressions support existence (`name`) and equality (`name=value`)
//! filters combined by conjunction. A back-end that cannot index a
//! multi-tag conjunction must return [`Error::UnsupportedQuery`] rather than
//! wrong results.

pub mod expiry;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// An indexed attribute attached to a stored value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A single filter in a tag expression. A `None` value matches any value
/// of the tag (existence check).
#[derive(Debug, Clone)]
pub struct TagFilter {
    pub name: String,
    pub value: Option<String>,
}

impl TagFilter {
    pub fn exists(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    pub fn equals(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

/// Conjunction of tag filters
#[derive(Debug, Clone, Default)]
pub struct StoreQuery {
    pub filters: Vec<TagFilter>,
}

impl StoreQuery {
    pub fn new(filters: Vec<TagFilter>) -> Self {
        Self { filters }
    }

    pub fn by_tag(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            filters: vec![TagFilter::equals(name, value)],
        }
    }

    pub fn tag_exists(name: impl Into<String>) -> Self {
        Self {
            filters: vec![TagFilter::exists(name)],
        }
    }
}

/// Iteration order over a query result. Ordering is by insertion sequence,
/// never by any timestamp carried in the values; callers must not assume
/// chronological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// One operation in an atomic batch
#[derive(Debug, Clone)]
pub enum BatchOperation {
    Put {
        key: String,
        value: Vec<u8>,
        tags: Vec<Tag>,
        /// Hint that the key is expected to be absent. A back-end may use
        /// it to speed up the write and must fail the whole batch with
        /// `Error::DuplicateKey` when the hint is wrong.
        is_new_key: bool,
    },
    Delete {
        key: String,
    },
}

/// One matched entry of a tag query
#[derive(Debug, Clone)]
pub struct QueryEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub tags: Vec<Tag>,
}

impl QueryEntry {
    /// Value of the named tag, if present
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.value.as_str())
    }
}

/// Snapshot result of a tag query. `total_items` is fixed at creation and
/// does not change as new entries arrive during iteration.
pub struct QueryResults {
    entries: Vec<QueryEntry>,
    pos: usize,
}

impl QueryResults {
    pub fn new(entries: Vec<QueryEntry>) -> Self {
        Self { entries, pos: 0 }
    }

    /// Number of entries matched at snapshot time
    pub fn total_items(&self) -> usize {
        self.entries.len()
    }

    /// Advance to the next entry
    pub fn next_entry(&mut self) -> Option<QueryEntry> {
        let entry = self.entries.get(self.pos).cloned();
        if entry.is_some() {
            self.pos += 1;
        }
        entry
    }

    /// Drain the remaining entries
    pub fn collect_remaining(mut self) -> Vec<QueryEntry> {
        let rest = self.entries.split_off(self.pos);
        self.pos = self.entries.len();
        rest
    }
}

/// Key/value store with tagged queries
#[async_trait]
pub trait Store: Send + Sync {
    /// Store a value under a key with the given indexed tags,
    /// overwriting any previous value.
    async fn put(&self, key: &str, value: &[u8], tags: &[Tag]) -> Result<()>;

    /// Fetch a value. Returns `Error::NotFound` when absent.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Fetch several values; one entry (possibly `None`) per key,
    /// in the same order as the input.
    async fn get_bulk(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Apply the operations atomically, in order. Readers observe either
    /// none or all of the batch.
    async fn batch(&self, ops: Vec<BatchOperation>) -> Result<()>;

    /// Query by tag expression, returning a snapshot iterator.
    async fn query(&self, query: &StoreQuery, order: SortOrder) -> Result<QueryResults>;

    /// Single-key compare-and-swap: replace the value only if the current
    /// value equals `expected` (`None` = key absent). Returns whether the
    /// swap happened. Required by the task-manager permit store; back-ends
    /// that cannot provide it return `Error::UnsupportedQuery`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool>;
}

/// Opens named stores. Each namespace is an isolated keyspace.
pub trait StoreProvider: Send + Sync {
    fn open(&self, namespace: &str) -> Result<Arc<dyn Store>>;
}
