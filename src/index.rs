//! Named vector index over a [`Store`].
//!
//! A [`VectorIndex`] pairs one index partition with the single
//! [`EmbeddingProvider`] it is bound to. Entries without a vector are
//! embedded on write; queries embed the query text and rank stored entries
//! by cosine distance with a brute-force scan, breaking ties by insertion
//! order.
//!
//! The model binding is recorded on the first write. Opening with a
//! different model or dimensionality, or writing vectors of another size,
//! fails with [`Error::EmbeddingModelMismatch`] and leaves the index untouched.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::embedding::{cosine_similarity, embed_one, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::models::{EmbeddedEntry, Metadata, Neighbor, VectorEntry};
use crate::store::{IndexBinding, Store};

/// Default number of texts sent to the provider per request.
pub const DEFAULT_BATCH_SIZE: usize = 64;

#[derive(Clone)]
pub struct VectorIndex {
    name: String,
    store: Arc<dyn Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("name", &self.name)
            .field("model", &self.embedder.model_name())
            .finish()
    }
}

impl VectorIndex {
    /// Open `name`, checking that any existing binding matches `embedder`.
    pub async fn open(
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        name: &str,
    ) -> Result<Self> {
        if let Some(binding) = store.binding(name).await? {
            if binding.model != embedder.model_name() {
                return Err(Error::EmbeddingModelMismatch {
                    index: name.to_string(),
                    expected: binding.model,
                    found: embedder.model_name().to_string(),
                });
            }
            let dims = embedder.dims();
            if dims > 0 && binding.dims != dims {
                return Err(Error::EmbeddingModelMismatch {
                    index: name.to_string(),
                    expected: format!("{} ({} dims)", binding.model, binding.dims),
                    found: format!("{} ({} dims)", embedder.model_name(), dims),
                });
            }
        }
        Ok(Self::unchecked(store, embedder, name))
    }

    /// Open `name` without comparing its binding to `embedder`.
    ///
    /// Only for callers about to rebind the index with
    /// [`replace_all`](Self::replace_all) or [`reembed_all`](Self::reembed_all).
    pub(crate) fn unchecked(
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        name: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            store,
            embedder,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Insert or overwrite entries by id.
    pub async fn upsert(&self, entries: Vec<VectorEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let embedded = self.prepare(entries).await?;
        self.store.upsert(&self.name, &embedded).await
    }

    /// Write already-embedded entries without overwriting.
    pub async fn insert_embedded(&self, entries: &[EmbeddedEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.ensure_binding(entries)?;
        self.bind_if_new(entries).await?;
        self.store.insert_new(&self.name, entries).await
    }

    /// Write already-embedded entries, overwriting by id.
    pub async fn upsert_embedded(&self, entries: &[EmbeddedEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.ensure_binding(entries)?;
        self.bind_if_new(entries).await?;
        self.store.upsert(&self.name, entries).await
    }

    /// Embed missing vectors and validate the batch against the binding.
    ///
    /// Returns entries ready for the store. Nothing is written except the
    /// binding of a brand-new index.
    pub async fn prepare(&self, entries: Vec<VectorEntry>) -> Result<Vec<EmbeddedEntry>> {
        let embedded = self.embed(entries).await?;
        if !embedded.is_empty() {
            self.bind_if_new(&embedded).await?;
        }
        Ok(embedded)
    }

    /// Embed missing vectors. Touches neither the entries nor the binding
    /// in the store.
    pub async fn embed(&self, entries: Vec<VectorEntry>) -> Result<Vec<EmbeddedEntry>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let missing: Vec<String> = entries
            .iter()
            .filter(|e| e.embedding.is_none())
            .map(|e| e.text.clone())
            .collect();

        let mut computed = Vec::with_capacity(missing.len());
        for batch in missing.chunks(self.batch_size) {
            let vectors = self.embedder.embed_batch(batch).await?;
            if vectors.len() != batch.len() {
                return Err(Error::Embedding(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }
            computed.extend(vectors);
        }

        let mut computed = computed.into_iter();
        let mut embedded = Vec::with_capacity(entries.len());
        for entry in entries {
            let embedding = match entry.embedding {
                Some(v) => v,
                None => computed
                    .next()
                    .ok_or_else(|| Error::Embedding("missing computed embedding".to_string()))?,
            };
            embedded.push(EmbeddedEntry {
                id: entry.id,
                text: entry.text,
                embedding,
                metadata: entry.metadata,
            });
        }

        self.ensure_binding(&embedded)?;
        Ok(embedded)
    }

    /// Replace the whole index with `entries` and bind it to this index's
    /// embedder, atomically. On error the previous contents stay in place.
    pub async fn replace_all(
        &self,
        entries: &[EmbeddedEntry],
        fingerprint: Option<String>,
    ) -> Result<()> {
        if !entries.is_empty() {
            self.ensure_binding(entries)?;
        }
        let binding = IndexBinding {
            model: self.embedder.model_name().to_string(),
            dims: entries
                .first()
                .map_or(self.embedder.dims(), |e| e.embedding.len()),
            fingerprint,
        };
        self.store.replace_all(&self.name, &binding, entries).await
    }

    /// Re-embed every stored entry with this index's embedder and rebind.
    ///
    /// Ids, texts, metadata, and insertion order are kept. Returns the
    /// number of entries rewritten.
    pub async fn reembed_all(&self) -> Result<usize> {
        let stored = self.store.scan(&self.name, &Metadata::new()).await?;
        let pending: Vec<VectorEntry> = stored
            .into_iter()
            .map(|e| VectorEntry {
                id: e.id,
                text: e.text,
                embedding: None,
                metadata: e.metadata,
            })
            .collect();

        let mut embedded = Vec::with_capacity(pending.len());
        for batch in pending.chunks(self.batch_size) {
            embedded.extend(self.embed(batch.to_vec()).await?);
        }
        let binding = IndexBinding {
            model: self.embedder.model_name().to_string(),
            dims: embedded
                .first()
                .map_or(self.embedder.dims(), |e| e.embedding.len()),
            fingerprint: None,
        };
        self.store.rebind(&self.name, &binding, &embedded).await?;
        Ok(embedded.len())
    }

    /// All vectors in a batch must share one dimensionality.
    fn ensure_binding(&self, entries: &[EmbeddedEntry]) -> Result<()> {
        let dims = entries[0].embedding.len();
        if let Some(bad) = entries.iter().find(|e| e.embedding.len() != dims) {
            return Err(self.dims_mismatch(dims, bad.embedding.len()));
        }
        Ok(())
    }

    async fn bind_if_new(&self, entries: &[EmbeddedEntry]) -> Result<()> {
        let dims = entries[0].embedding.len();
        match self.store.binding(&self.name).await? {
            Some(binding) => {
                if binding.model != self.embedder.model_name() {
                    return Err(Error::EmbeddingModelMismatch {
                        index: self.name.clone(),
                        expected: binding.model,
                        found: self.embedder.model_name().to_string(),
                    });
                }
                if binding.dims != dims {
                    return Err(self.dims_mismatch(binding.dims, dims));
                }
            }
            None => {
                tracing::debug!(index = %self.name, model = self.embedder.model_name(), dims, "binding index");
                self.store
                    .bind(
                        &self.name,
                        &IndexBinding {
                            model: self.embedder.model_name().to_string(),
                            dims,
                            fingerprint: None,
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }

    fn dims_mismatch(&self, expected: usize, found: usize) -> Error {
        Error::EmbeddingModelMismatch {
            index: self.name.clone(),
            expected: format!("{} ({} dims)", self.embedder.model_name(), expected),
            found: format!("{} ({} dims)", self.embedder.model_name(), found),
        }
    }

    /// Up to `k` nearest entries matching `filter`, closest first.
    pub async fn query(&self, text: &str, k: usize, filter: &Metadata) -> Result<Vec<Neighbor>> {
        if k == 0 || self.store.count(&self.name).await? == 0 {
            return Ok(Vec::new());
        }
        let query_vec = embed_one(self.embedder.as_ref(), text).await?;
        self.query_vector(&query_vec, k, filter).await
    }

    /// As [`query`](Self::query) with a precomputed query vector.
    pub async fn query_vector(
        &self,
        query_vec: &[f32],
        k: usize,
        filter: &Metadata,
    ) -> Result<Vec<Neighbor>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let entries = self.store.scan(&self.name, filter).await?;

        let mut scored: Vec<Neighbor> = entries
            .into_iter()
            .map(|entry| {
                let distance = 1.0 - cosine_similarity(query_vec, &entry.embedding);
                Neighbor { entry, distance }
            })
            .collect();

        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then(a.entry.seq.cmp(&b.entry.seq))
        });
        scored.truncate(k);
        Ok(scored)
    }

    pub async fn delete_all(&self) -> Result<()> {
        self.store.delete_all(&self.name).await
    }

    pub async fn count(&self) -> Result<usize> {
        self.store.count(&self.name).await
    }

    pub async fn existing_ids(&self, ids: &[String]) -> Result<Vec<String>> {
        self.store.existing_ids(&self.name, ids).await
    }

    pub async fn max_metadata_int(&self, key: &str, filter: &Metadata) -> Result<Option<i64>> {
        self.store.max_metadata_int(&self.name, key, filter).await
    }

    pub async fn binding(&self) -> Result<Option<IndexBinding>> {
        self.store.binding(&self.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use crate::store::InMemoryStore;

    async fn open(store: Arc<dyn Store>) -> VectorIndex {
        VectorIndex::open(store, Arc::new(HashProvider::new(64)), "corpus")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_query_empty_index() {
        let index = open(Arc::new(InMemoryStore::new())).await;
        let hits = index.query("anything", 3, &Metadata::new()).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_query_k_zero() {
        let index = open(Arc::new(InMemoryStore::new())).await;
        index
            .upsert(vec![VectorEntry::new("a", "The sky is blue.")])
            .await
            .unwrap();
        assert!(index.query("sky", 0, &Metadata::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_ranks_by_similarity() {
        let index = open(Arc::new(InMemoryStore::new())).await;
        index
            .upsert(vec![
                VectorEntry::new("a", "Rust compiles to native code."),
                VectorEntry::new("b", "The sky is blue."),
            ])
            .await
            .unwrap();
        let hits = index.query("What color is the sky?", 1, &Metadata::new()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.id, "b");
    }

    #[tokio::test]
    async fn test_ties_resolve_to_earlier_entry() {
        let index = open(Arc::new(InMemoryStore::new())).await;
        index
            .upsert(vec![
                VectorEntry::new("first", "same words"),
                VectorEntry::new("second", "same words"),
            ])
            .await
            .unwrap();
        let hits = index.query("same words", 2, &Metadata::new()).await.unwrap();
        assert_eq!(hits[0].entry.id, "first");
        assert_eq!(hits[1].entry.id, "second");
    }

    #[tokio::test]
    async fn test_open_with_other_model_fails() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        store
            .bind(
                "corpus",
                &IndexBinding {
                    model: "text-embedding-3-small".into(),
                    dims: 1536,
                    fingerprint: None,
                },
            )
            .await
            .unwrap();
        let err = VectorIndex::open(store, Arc::new(HashProvider::new(64)), "corpus")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingModelMismatch { .. }));
    }

    #[tokio::test]
    async fn test_dims_mismatch_writes_nothing() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let index = open(Arc::clone(&store)).await;
        index
            .upsert(vec![VectorEntry::new("a", "alpha")])
            .await
            .unwrap();

        let err = index
            .upsert(vec![VectorEntry::new("b", "beta").with_embedding(vec![1.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmbeddingModelMismatch { .. }));
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_filter_restricts_results() {
        let index = open(Arc::new(InMemoryStore::new())).await;
        index
            .upsert(vec![
                VectorEntry::new("u", "hello there").with_metadata("role", "user"),
                VectorEntry::new("a", "hello back").with_metadata("role", "assistant"),
            ])
            .await
            .unwrap();
        let mut filter = Metadata::new();
        filter.insert("role".into(), "assistant".into());
        let hits = index.query("hello there", 5, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.id, "a");
    }

    #[tokio::test]
    async fn test_delete_all_empties_index() {
        let index = open(Arc::new(InMemoryStore::new())).await;
        index
            .upsert(vec![VectorEntry::new("a", "alpha"), VectorEntry::new("b", "beta")])
            .await
            .unwrap();
        index.delete_all().await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
        assert!(index.query("alpha", 3, &Metadata::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reembed_all_rebinds_and_keeps_order() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let index = open(Arc::clone(&store)).await;
        index
            .upsert(vec![
                VectorEntry::new("first", "same words").with_metadata("turn_id", "1"),
                VectorEntry::new("second", "same words").with_metadata("turn_id", "2"),
            ])
            .await
            .unwrap();

        let narrow = VectorIndex::unchecked(Arc::clone(&store), Arc::new(HashProvider::new(16)), "corpus");
        assert_eq!(narrow.reembed_all().await.unwrap(), 2);

        let binding = narrow.binding().await.unwrap().unwrap();
        assert_eq!(binding.dims, 16);
        let reopened = VectorIndex::open(store, Arc::new(HashProvider::new(16)), "corpus")
            .await
            .unwrap();
        let hits = reopened.query("same words", 2, &Metadata::new()).await.unwrap();
        assert_eq!(hits[0].entry.id, "first");
        assert_eq!(hits[0].entry.embedding.len(), 16);
        assert_eq!(hits[1].entry.metadata["turn_id"], "2");
    }
}
