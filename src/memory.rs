//! Long-term conversation memory.
//!
//! Turns are stored in the `conversations` vector index, one entry per turn
//! with id `"{conversation}:{turn_id}"` and metadata `conversation`, `role`,
//! `turn_id`, and `created_at`. Turn ids start at 1, increase strictly within
//! a conversation, and are never reused: the next id is always derived from
//! the largest id already persisted, so a restarted process continues where
//! the previous one stopped.
//!
//! # Writing
//!
//! [`ConversationMemory::append`] embeds the new turns first, then takes a
//! per-conversation lock, allocates ids, and writes with a strict insert.
//! Another process racing on the same database surfaces as
//! [`Error::IdConflict`]; allocation is then recomputed and the insert
//! retried. Existing turns are only ever replaced through
//! [`ConversationMemory::replace`].
//!
//! # Changing the embedding model
//!
//! Memory is never discarded. Opening it with a provider other than the one
//! it was written with re-embeds every stored turn in place, keeping ids,
//! metadata, and insertion order, and rebinds the index to the new model.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};

use tokio::sync::Mutex;

use crate::config::RecallRole;
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::models::{ConversationTurn, EmbeddedEntry, Metadata, Role, StoredEntry, VectorEntry};
use crate::store::Store;

/// Name of the conversation index.
pub const MEMORY_INDEX: &str = "conversations";

/// Strict-insert attempts before an id conflict is returned to the caller.
const MAX_APPEND_ATTEMPTS: usize = 5;

type LockRegistry = StdMutex<HashMap<String, Weak<Mutex<()>>>>;

fn lock_registry() -> &'static LockRegistry {
    static LOCKS: OnceLock<LockRegistry> = OnceLock::new();
    LOCKS.get_or_init(Default::default)
}

/// Per-conversation allocation lock shared by every memory in the process.
///
/// The registry only holds weak references; a lock lives as long as some
/// caller holds it, and dead entries are pruned on each lookup.
fn conversation_lock(conversation: &str) -> Arc<Mutex<()>> {
    let mut map = lock_registry().lock().unwrap_or_else(|e| e.into_inner());
    map.retain(|_, lock| lock.strong_count() > 0);
    if let Some(lock) = map.get(conversation).and_then(Weak::upgrade) {
        return lock;
    }
    let lock = Arc::new(Mutex::new(()));
    map.insert(conversation.to_string(), Arc::downgrade(&lock));
    lock
}

#[derive(Debug, Clone)]
pub struct ConversationMemory {
    index: VectorIndex,
    conversation: String,
    recall_role: RecallRole,
}

impl ConversationMemory {
    /// Open the memory of `conversation`.
    ///
    /// Memory written with another embedding model is re-embedded with
    /// `embedder` first.
    pub async fn open(
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        conversation: &str,
    ) -> Result<Self> {
        let index = match VectorIndex::open(Arc::clone(&store), Arc::clone(&embedder), MEMORY_INDEX).await {
            Ok(index) => index,
            Err(Error::EmbeddingModelMismatch { expected, found, .. }) => {
                tracing::warn!(
                    index = MEMORY_INDEX,
                    %expected,
                    %found,
                    "embedding model changed; re-embedding conversation memory"
                );
                let index = VectorIndex::unchecked(store, embedder, MEMORY_INDEX);
                let turns = index.reembed_all().await?;
                tracing::info!(index = MEMORY_INDEX, turns, "conversation memory re-embedded");
                index
            }
            Err(e) => return Err(e),
        };
        Self::from_index(index, conversation)
    }

    pub fn from_index(index: VectorIndex, conversation: &str) -> Result<Self> {
        if conversation.trim().is_empty() {
            return Err(Error::InvalidParameter(
                "conversation id must not be empty".to_string(),
            ));
        }
        Ok(Self {
            index,
            conversation: conversation.to_string(),
            recall_role: RecallRole::Assistant,
        })
    }

    /// Restrict [`recall`](Self::recall) to one role, or to none with [`RecallRole::Any`].
    pub fn with_recall_role(mut self, role: RecallRole) -> Self {
        self.recall_role = role;
        self
    }

    pub fn conversation(&self) -> &str {
        &self.conversation
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    fn conversation_filter(&self) -> Metadata {
        let mut filter = Metadata::new();
        filter.insert("conversation".to_string(), self.conversation.clone());
        filter
    }

    fn entry_id(&self, turn_id: i64) -> String {
        format!("{}:{}", self.conversation, turn_id)
    }

    /// One past the largest persisted turn id, or 1 for a new conversation.
    pub async fn next_turn_id(&self) -> Result<i64> {
        let max = self
            .index
            .max_metadata_int("turn_id", &self.conversation_filter())
            .await?;
        Ok(max.map_or(1, |m| m + 1))
    }

    /// Persist `turns` under freshly allocated ids, returned in input order.
    ///
    /// Writes all turns or none.
    pub async fn append(&self, turns: &[ConversationTurn]) -> Result<Vec<i64>> {
        if turns.is_empty() {
            return Ok(Vec::new());
        }
        let embedded = self.embed(turns).await?;

        let lock = conversation_lock(&self.conversation);
        let _guard = lock.lock().await;

        let mut last_conflict = None;
        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            let first = self.allocate(turns.len()).await?;
            let ids: Vec<i64> = (first..first + turns.len() as i64).collect();
            let entries = self.assign(&embedded, turns, &ids);

            match self.index.insert_embedded(&entries).await {
                Ok(()) => {
                    tracing::debug!(
                        conversation = %self.conversation,
                        first_id = first,
                        count = ids.len(),
                        "appended turns"
                    );
                    return Ok(ids);
                }
                Err(err @ Error::IdConflict { .. }) => {
                    tracing::debug!(
                        conversation = %self.conversation,
                        attempt,
                        error = %err,
                        "turn id conflict, reallocating"
                    );
                    last_conflict = Some(err);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_conflict.unwrap_or_else(|| Error::IdConflict {
            index: MEMORY_INDEX.to_string(),
            ids: Vec::new(),
        }))
    }

    /// Overwrite the turns starting at `first_id`, creating any that do not exist.
    pub async fn replace(&self, first_id: i64, turns: &[ConversationTurn]) -> Result<Vec<i64>> {
        if first_id < 1 {
            return Err(Error::InvalidParameter(format!(
                "turn ids start at 1, got {}",
                first_id
            )));
        }
        if turns.is_empty() {
            return Ok(Vec::new());
        }
        let embedded = self.embed(turns).await?;

        let lock = conversation_lock(&self.conversation);
        let _guard = lock.lock().await;

        let ids: Vec<i64> = (first_id..first_id + turns.len() as i64).collect();
        let entries = self.assign(&embedded, turns, &ids);
        self.index.upsert_embedded(&entries).await?;
        tracing::debug!(conversation = %self.conversation, first_id, count = ids.len(), "replaced turns");
        Ok(ids)
    }

    /// First id of a free run of `count` ids, skipping past any taken ones.
    async fn allocate(&self, count: usize) -> Result<i64> {
        let mut first = self.next_turn_id().await?;
        loop {
            let candidates: Vec<String> = (first..first + count as i64)
                .map(|id| self.entry_id(id))
                .collect();
            let taken = self.index.existing_ids(&candidates).await?;
            let highest = taken
                .iter()
                .filter_map(|id| parse_turn_id(id))
                .max();
            match highest {
                None => return Ok(first),
                Some(h) => {
                    tracing::debug!(conversation = %self.conversation, first, highest = h, "skipping taken turn ids");
                    first = h + 1;
                }
            }
        }
    }

    async fn embed(&self, turns: &[ConversationTurn]) -> Result<Vec<EmbeddedEntry>> {
        let pending = turns
            .iter()
            .enumerate()
            .map(|(i, t)| VectorEntry::new(format!("pending:{}", i), t.content.clone()))
            .collect();
        self.index.prepare(pending).await
    }

    fn assign(
        &self,
        embedded: &[EmbeddedEntry],
        turns: &[ConversationTurn],
        ids: &[i64],
    ) -> Vec<EmbeddedEntry> {
        embedded
            .iter()
            .zip(turns)
            .zip(ids)
            .map(|((entry, turn), &id)| {
                let mut metadata = Metadata::new();
                metadata.insert("conversation".to_string(), self.conversation.clone());
                metadata.insert("role".to_string(), turn.role.as_str().to_string());
                metadata.insert("turn_id".to_string(), id.to_string());
                metadata.insert("created_at".to_string(), turn.created_at.to_string());
                EmbeddedEntry {
                    id: self.entry_id(id),
                    text: turn.content.clone(),
                    embedding: entry.embedding.clone(),
                    metadata,
                }
            })
            .collect()
    }

    /// Up to `k` past turns most similar to `query`, closest first.
    pub async fn recall(&self, query: &str, k: usize) -> Result<Vec<ConversationTurn>> {
        let mut filter = self.conversation_filter();
        if let Some(role) = self.recall_role.role() {
            filter.insert("role".to_string(), role.as_str().to_string());
        }
        self.index
            .query(query, k, &filter)
            .await?
            .into_iter()
            .map(|n| entry_to_turn(&n.entry))
            .collect()
    }

    /// The most recent `limit` turns (all when `None`), oldest first.
    pub async fn history(&self, limit: Option<usize>) -> Result<Vec<ConversationTurn>> {
        let mut turns = self
            .index
            .store()
            .scan(self.index.name(), &self.conversation_filter())
            .await?
            .iter()
            .map(entry_to_turn)
            .collect::<Result<Vec<_>>>()?;
        turns.sort_by_key(|t| t.id);
        if let Some(limit) = limit {
            let skip = turns.len().saturating_sub(limit);
            turns.drain(..skip);
        }
        Ok(turns)
    }

    pub async fn turn_count(&self) -> Result<usize> {
        Ok(self
            .index
            .store()
            .scan(self.index.name(), &self.conversation_filter())
            .await?
            .len())
    }
}

fn parse_turn_id(entry_id: &str) -> Option<i64> {
    entry_id.rsplit_once(':')?.1.parse().ok()
}

fn entry_to_turn(entry: &StoredEntry) -> Result<ConversationTurn> {
    let field = |key: &str| {
        entry.metadata.get(key).ok_or_else(|| {
            Error::InvalidParameter(format!("turn '{}' has no '{}' metadata", entry.id, key))
        })
    };
    let role: Role = field("role")?.parse()?;
    let id = field("turn_id")?
        .parse()
        .map_err(|_| Error::InvalidParameter(format!("turn '{}' has a non-numeric id", entry.id)))?;
    let created_at = entry
        .metadata
        .get("created_at")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    Ok(ConversationTurn {
        id,
        role,
        content: entry.text.clone(),
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashProvider;
    use crate::store::InMemoryStore;

    async fn memory(store: &Arc<dyn Store>, conversation: &str) -> ConversationMemory {
        ConversationMemory::open(Arc::clone(store), Arc::new(HashProvider::new(64)), conversation)
            .await
            .unwrap()
    }

    fn exchange(q: &str, a: &str) -> Vec<ConversationTurn> {
        vec![
            ConversationTurn::new(Role::User, q),
            ConversationTurn::new(Role::Assistant, a),
        ]
    }

    #[test]
    fn test_released_locks_are_pruned() {
        let held = conversation_lock("lock-prune-a");
        assert!(Arc::ptr_eq(&held, &conversation_lock("lock-prune-a")));
        drop(held);

        let _other = conversation_lock("lock-prune-b");
        let map = lock_registry().lock().unwrap();
        assert!(!map.contains_key("lock-prune-a"));
        assert!(map.contains_key("lock-prune-b"));
    }

    #[tokio::test]
    async fn test_open_with_new_model_reembeds_turns() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let mem = memory(&store, "mem-remodel").await;
        mem.append(&exchange("hi", "hello")).await.unwrap();

        let mem = ConversationMemory::open(Arc::clone(&store), Arc::new(HashProvider::new(32)), "mem-remodel")
            .await
            .unwrap();
        let binding = mem.index().binding().await.unwrap().unwrap();
        assert_eq!(binding.dims, 32);
        let ids: Vec<i64> = mem.history(None).await.unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(mem.next_turn_id().await.unwrap(), 3);
        assert_eq!(mem.append(&exchange("bye", "goodbye")).await.unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_parse_turn_id() {
        assert_eq!(parse_turn_id("default:12"), Some(12));
        assert_eq!(parse_turn_id("team:alpha:3"), Some(3));
        assert_eq!(parse_turn_id("nocolon"), None);
    }

    #[tokio::test]
    async fn test_ids_start_at_one_and_increase() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let mem = memory(&store, "mem-ids").await;
        assert_eq!(mem.next_turn_id().await.unwrap(), 1);
        assert_eq!(mem.append(&exchange("hi", "hello")).await.unwrap(), vec![1, 2]);
        assert_eq!(mem.append(&exchange("bye", "goodbye")).await.unwrap(), vec![3, 4]);
        assert_eq!(mem.next_turn_id().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_empty_append_writes_nothing() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let mem = memory(&store, "mem-empty").await;
        assert!(mem.append(&[]).await.unwrap().is_empty());
        assert_eq!(mem.turn_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_allocation_skips_taken_ids() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let mem = memory(&store, "mem-gap").await;
        // An entry whose metadata lost its turn id still occupies its slot.
        store
            .upsert(
                MEMORY_INDEX,
                &[EmbeddedEntry {
                    id: "mem-gap:1".into(),
                    text: "orphan".into(),
                    embedding: vec![0.0; 64],
                    metadata: Metadata::new(),
                }],
            )
            .await
            .unwrap();

        let ids = mem.append(&exchange("q", "a")).await.unwrap();
        assert_eq!(ids, vec![2, 3]);
        let stored = store.scan(MEMORY_INDEX, &Metadata::new()).await.unwrap();
        assert_eq!(stored.iter().filter(|e| e.text == "orphan").count(), 1);
    }

    #[tokio::test]
    async fn test_conversations_are_partitioned() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let a = memory(&store, "mem-part-a").await;
        let b = memory(&store, "mem-part-b").await;
        a.append(&exchange("q1", "a1")).await.unwrap();
        a.append(&exchange("q2", "a2")).await.unwrap();
        assert_eq!(b.append(&exchange("q", "a")).await.unwrap(), vec![1, 2]);
        assert_eq!(a.turn_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_recall_defaults_to_assistant_turns() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let mem = memory(&store, "mem-recall").await;
        mem.append(&exchange("tell me about rust", "rust is a language"))
            .await
            .unwrap();
        let turns = mem.recall("tell me about rust", 5).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, Role::Assistant);
        assert_eq!(turns[0].id, 2);

        let mem = mem.with_recall_role(RecallRole::Any);
        assert_eq!(mem.recall("rust", 5).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_replace_overwrites_in_place() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let mem = memory(&store, "mem-replace").await;
        mem.append(&exchange("q", "first answer")).await.unwrap();
        mem.replace(2, &[ConversationTurn::new(Role::Assistant, "better answer")])
            .await
            .unwrap();

        let history = mem.history(None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "better answer");
        assert_eq!(mem.next_turn_id().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_history_limit_keeps_latest() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let mem = memory(&store, "mem-history").await;
        mem.append(&exchange("q1", "a1")).await.unwrap();
        mem.append(&exchange("q2", "a2")).await.unwrap();
        let last = mem.history(Some(2)).await.unwrap();
        let ids: Vec<i64> = last.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }
}
