//! Storage abstraction for vector indexes.
//!
//! The [`Store`] trait holds any number of named indexes, each an ordered
//! set of [`StoredEntry`] rows plus an optional [`IndexBinding`] recording
//! which embedding model produced its vectors. Backends:
//!
//! - [`sqlite::SqliteStore`]: durable, shared across processes (WAL).
//! - [`memory::InMemoryStore`]: process-local, for tests and scratch use.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! Every write method is atomic: it either applies all entries or none.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{EmbeddedEntry, Metadata, StoredEntry};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// The embedding model an index was built with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexBinding {
    pub model: String,
    pub dims: usize,
    /// Content fingerprint of the last full build, if any.
    pub fingerprint: Option<String>,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`binding`](Store::binding) / [`bind`](Store::bind) | Read or set an index's model binding |
/// | [`upsert`](Store::upsert) | Insert or overwrite entries by id |
/// | [`insert_new`](Store::insert_new) | Insert entries, failing on any existing id |
/// | [`scan`](Store::scan) | Entries matching a metadata filter, in insertion order |
/// | [`max_metadata_int`](Store::max_metadata_int) | Largest integer metadata value |
/// | [`replace_all`](Store::replace_all) | Swap in a full new set of entries and binding |
/// | [`rebind`](Store::rebind) | Overwrite entries and the binding together |
/// | [`delete_all`](Store::delete_all) | Drop an index's entries and binding |
#[async_trait]
pub trait Store: Send + Sync {
    /// The binding for `index`, or `None` if the index has never been written.
    async fn binding(&self, index: &str) -> Result<Option<IndexBinding>>;

    /// Create or replace the binding for `index`.
    async fn bind(&self, index: &str, binding: &IndexBinding) -> Result<()>;

    /// All bindings, ordered by index name.
    async fn bindings(&self) -> Result<Vec<(String, IndexBinding)>>;

    /// Insert or overwrite entries by id. An overwritten entry keeps its `seq`.
    async fn upsert(&self, index: &str, entries: &[EmbeddedEntry]) -> Result<()>;

    /// Insert entries that must not exist yet.
    ///
    /// Fails with [`Error::IdConflict`](crate::error::Error::IdConflict)
    /// naming every existing id, and writes nothing.
    async fn insert_new(&self, index: &str, entries: &[EmbeddedEntry]) -> Result<()>;

    /// The subset of `ids` present in `index`.
    async fn existing_ids(&self, index: &str, ids: &[String]) -> Result<Vec<String>>;

    /// Entries whose metadata contains every key/value pair of `filter`, ordered by `seq`.
    async fn scan(&self, index: &str, filter: &Metadata) -> Result<Vec<StoredEntry>>;

    /// Maximum of `key` parsed as an integer over entries matching `filter`.
    async fn max_metadata_int(
        &self,
        index: &str,
        key: &str,
        filter: &Metadata,
    ) -> Result<Option<i64>>;

    async fn count(&self, index: &str) -> Result<usize>;

    /// Make `entries` the whole contents of `index` and set its binding, in
    /// one transaction. Ids already present are overwritten in place and keep
    /// their `seq`; ids missing from `entries` are removed.
    async fn replace_all(
        &self,
        index: &str,
        binding: &IndexBinding,
        entries: &[EmbeddedEntry],
    ) -> Result<()>;

    /// Upsert `entries` and set the binding of `index`, in one transaction.
    /// Entries not listed are left as they are.
    async fn rebind(
        &self,
        index: &str,
        binding: &IndexBinding,
        entries: &[EmbeddedEntry],
    ) -> Result<()>;

    /// Remove every entry of `index` and its binding.
    async fn delete_all(&self, index: &str) -> Result<()>;
}

/// Whether `metadata` contains every pair in `filter`.
pub(crate) fn matches_filter(metadata: &Metadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(k, v)| metadata.get(k).is_some_and(|m| m == v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_filter() {
        let mut meta = Metadata::new();
        meta.insert("role".into(), "assistant".into());
        meta.insert("conversation".into(), "c1".into());

        let mut filter = Metadata::new();
        assert!(matches_filter(&meta, &filter));
        filter.insert("role".into(), "assistant".into());
        assert!(matches_filter(&meta, &filter));
        filter.insert("conversation".into(), "c2".into());
        assert!(!matches_filter(&meta, &filter));
    }
}
