//! In-memory [`Store`] implementation for tests and ephemeral sessions.
//!
//! All indexes live behind a single `tokio::sync::RwLock`, so every write
//! is applied atomically with respect to readers. Nothing survives the
//! process.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::models::{EmbeddedEntry, Metadata, StoredEntry};

use super::{matches_filter, IndexBinding, Store};

#[derive(Default)]
struct Partition {
    binding: Option<IndexBinding>,
    /// Kept in ascending `seq` order.
    entries: Vec<StoredEntry>,
}

#[derive(Default)]
struct State {
    indexes: BTreeMap<String, Partition>,
    next_seq: i64,
}

/// Process-local store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl State {
    fn write_entry(&mut self, index: &str, entry: &EmbeddedEntry) {
        let seq = self.next_seq + 1;
        let partition = self.indexes.entry(index.to_string()).or_default();
        if let Some(existing) = partition.entries.iter_mut().find(|e| e.id == entry.id) {
            existing.text = entry.text.clone();
            existing.embedding = entry.embedding.clone();
            existing.metadata = entry.metadata.clone();
            return;
        }
        partition.entries.push(StoredEntry {
            id: entry.id.clone(),
            text: entry.text.clone(),
            embedding: entry.embedding.clone(),
            metadata: entry.metadata.clone(),
            seq,
        });
        self.next_seq = seq;
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn binding(&self, index: &str) -> Result<Option<IndexBinding>> {
        let state = self.state.read().await;
        Ok(state.indexes.get(index).and_then(|p| p.binding.clone()))
    }

    async fn bind(&self, index: &str, binding: &IndexBinding) -> Result<()> {
        let mut state = self.state.write().await;
        state.indexes.entry(index.to_string()).or_default().binding = Some(binding.clone());
        Ok(())
    }

    async fn bindings(&self) -> Result<Vec<(String, IndexBinding)>> {
        let state = self.state.read().await;
        Ok(state
            .indexes
            .iter()
            .filter_map(|(name, p)| p.binding.clone().map(|b| (name.clone(), b)))
            .collect())
    }

    async fn upsert(&self, index: &str, entries: &[EmbeddedEntry]) -> Result<()> {
        let mut state = self.state.write().await;
        for entry in entries {
            state.write_entry(index, entry);
        }
        Ok(())
    }

    async fn insert_new(&self, index: &str, entries: &[EmbeddedEntry]) -> Result<()> {
        let mut state = self.state.write().await;

        let mut seen = HashSet::new();
        let mut conflicts = Vec::new();
        let existing: HashSet<&str> = state
            .indexes
            .get(index)
            .map(|p| p.entries.iter().map(|e| e.id.as_str()).collect())
            .unwrap_or_default();
        for entry in entries {
            if existing.contains(entry.id.as_str()) || !seen.insert(entry.id.as_str()) {
                conflicts.push(entry.id.clone());
            }
        }
        if !conflicts.is_empty() {
            return Err(Error::IdConflict {
                index: index.to_string(),
                ids: conflicts,
            });
        }

        for entry in entries {
            state.write_entry(index, entry);
        }
        Ok(())
    }

    async fn existing_ids(&self, index: &str, ids: &[String]) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let Some(partition) = state.indexes.get(index) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter(|id| partition.entries.iter().any(|e| &e.id == *id))
            .cloned()
            .collect())
    }

    async fn scan(&self, index: &str, filter: &Metadata) -> Result<Vec<StoredEntry>> {
        let state = self.state.read().await;
        Ok(state
            .indexes
            .get(index)
            .map(|p| {
                p.entries
                    .iter()
                    .filter(|e| matches_filter(&e.metadata, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn max_metadata_int(
        &self,
        index: &str,
        key: &str,
        filter: &Metadata,
    ) -> Result<Option<i64>> {
        let state = self.state.read().await;
        Ok(state.indexes.get(index).and_then(|p| {
            p.entries
                .iter()
                .filter(|e| matches_filter(&e.metadata, filter))
                .filter_map(|e| e.metadata.get(key)?.parse::<i64>().ok())
                .max()
        }))
    }

    async fn count(&self, index: &str) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state.indexes.get(index).map_or(0, |p| p.entries.len()))
    }

    async fn replace_all(
        &self,
        index: &str,
        binding: &IndexBinding,
        entries: &[EmbeddedEntry],
    ) -> Result<()> {
        let keep: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        let mut state = self.state.write().await;
        let partition = state.indexes.entry(index.to_string()).or_default();
        partition.entries.retain(|e| keep.contains(e.id.as_str()));
        partition.binding = Some(binding.clone());
        for entry in entries {
            state.write_entry(index, entry);
        }
        Ok(())
    }

    async fn rebind(
        &self,
        index: &str,
        binding: &IndexBinding,
        entries: &[EmbeddedEntry],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.indexes.entry(index.to_string()).or_default().binding = Some(binding.clone());
        for entry in entries {
            state.write_entry(index, entry);
        }
        Ok(())
    }

    async fn delete_all(&self, index: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.indexes.remove(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, text: &str) -> EmbeddedEntry {
        EmbeddedEntry {
            id: id.to_string(),
            text: text.to_string(),
            embedding: vec![1.0, 0.0],
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn test_upsert_keeps_seq_on_overwrite() {
        let store = InMemoryStore::new();
        store
            .upsert("idx", &[entry("a", "one"), entry("b", "two")])
            .await
            .unwrap();
        store.upsert("idx", &[entry("a", "uno")]).await.unwrap();

        let all = store.scan("idx", &Metadata::new()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "a");
        assert_eq!(all[0].text, "uno");
        assert!(all[0].seq < all[1].seq);
    }

    #[tokio::test]
    async fn test_insert_new_conflict_writes_nothing() {
        let store = InMemoryStore::new();
        store.upsert("idx", &[entry("a", "one")]).await.unwrap();

        let err = store
            .insert_new("idx", &[entry("b", "two"), entry("a", "again")])
            .await
            .unwrap_err();
        match err {
            Error::IdConflict { ids, .. } => assert_eq!(ids, vec!["a".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.count("idx").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_max_metadata_int_with_filter() {
        let store = InMemoryStore::new();
        let mut e1 = entry("c1:1", "x");
        e1.metadata.insert("conversation".into(), "c1".into());
        e1.metadata.insert("turn_id".into(), "1".into());
        let mut e2 = entry("c1:9", "y");
        e2.metadata.insert("conversation".into(), "c1".into());
        e2.metadata.insert("turn_id".into(), "9".into());
        let mut e3 = entry("c2:40", "z");
        e3.metadata.insert("conversation".into(), "c2".into());
        e3.metadata.insert("turn_id".into(), "40".into());
        store.upsert("conv", &[e1, e2, e3]).await.unwrap();

        let mut filter = Metadata::new();
        filter.insert("conversation".into(), "c1".into());
        assert_eq!(
            store.max_metadata_int("conv", "turn_id", &filter).await.unwrap(),
            Some(9)
        );
        filter.insert("conversation".into(), "c3".into());
        assert_eq!(
            store.max_metadata_int("conv", "turn_id", &filter).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_delete_all_clears_binding() {
        let store = InMemoryStore::new();
        store
            .bind(
                "idx",
                &IndexBinding {
                    model: "hash".into(),
                    dims: 2,
                    fingerprint: None,
                },
            )
            .await
            .unwrap();
        store.upsert("idx", &[entry("a", "one")]).await.unwrap();
        store.delete_all("idx").await.unwrap();
        assert!(store.binding("idx").await.unwrap().is_none());
        assert_eq!(store.count("idx").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replace_all_keeps_retained_seq() {
        let store = InMemoryStore::new();
        store
            .upsert("idx", &[entry("a", "one"), entry("b", "two")])
            .await
            .unwrap();
        let before = store.scan("idx", &Metadata::new()).await.unwrap();

        let binding = IndexBinding {
            model: "hash".into(),
            dims: 2,
            fingerprint: Some("f".into()),
        };
        store
            .replace_all("idx", &binding, &[entry("b", "deux"), entry("c", "trois")])
            .await
            .unwrap();

        let after = store.scan("idx", &Metadata::new()).await.unwrap();
        let ids: Vec<&str> = after.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(after[0].seq, before[1].seq);
        assert_eq!(after[0].text, "deux");
        assert_eq!(store.binding("idx").await.unwrap(), Some(binding));
    }
}
