//! Wiring from a [`Config`] to the engine's components.
//!
//! The CLI builds everything through an [`Engine`]: one SQLite store shared
//! by the corpus and conversation indexes, one embedding provider, and the
//! chat model. Library users with their own collaborators can construct
//! the components directly instead.

use std::path::Path;
use std::sync::Arc;

use crate::chat::{ChatSession, SessionSettings};
use crate::config::Config;
use crate::corpus::{BuildReport, CorpusBuilder, CORPUS_INDEX};
use crate::cost::CostAccountant;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::llm::ChatModel;
use crate::memory::ConversationMemory;
use crate::progress::{BuildProgressReporter, NoProgress};
use crate::store::{SqliteStore, Store};
use crate::tokenizer::create_tokenizer;

pub struct Engine {
    config: Config,
    store: Arc<dyn Store>,
    sqlite: Arc<SqliteStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl Engine {
    /// Open the configured database (creating it if needed) and embedding provider.
    pub async fn open(config: &Config) -> Result<Self> {
        let embedder = create_provider(&config.embeddings)?;
        Self::open_with_embedder(config, embedder).await
    }

    pub async fn open_with_embedder(
        config: &Config,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let sqlite = Arc::new(SqliteStore::open(&config.db_path()).await?);
        let store: Arc<dyn Store> = sqlite.clone();
        Ok(Self {
            config: config.clone(),
            store,
            sqlite,
            embedder,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Build the corpus from `documents_dir`.
    pub async fn build_corpus(
        &self,
        force: bool,
        progress: Box<dyn BuildProgressReporter>,
    ) -> Result<BuildReport> {
        self.build_corpus_from(&self.config.documents_dir, force, progress)
            .await
    }

    pub async fn build_corpus_from(
        &self,
        dir: &Path,
        force: bool,
        progress: Box<dyn BuildProgressReporter>,
    ) -> Result<BuildReport> {
        let builder = CorpusBuilder::new(Arc::clone(&self.store), Arc::clone(&self.embedder))
            .with_batch_size(self.config.embeddings.batch_size)
            .with_force(force)
            .with_progress(progress);
        let (_, report) = builder
            .build_directory(
                dir,
                &self.config.exclude_globs,
                self.config.chunk_size,
                self.config.chunk_overlap,
            )
            .await?;
        Ok(report)
    }

    /// Open the corpus index for querying.
    ///
    /// A corpus built with another embedding model is rebuilt from
    /// `documents_dir` first.
    pub async fn corpus(&self) -> Result<VectorIndex> {
        match self.open_corpus().await {
            Err(Error::EmbeddingModelMismatch { expected, found, .. }) => {
                tracing::warn!(%expected, %found, "corpus built with another embedding model; rebuilding");
                self.build_corpus(false, Box::new(NoProgress)).await?;
                self.open_corpus().await
            }
            other => other,
        }
    }

    async fn open_corpus(&self) -> Result<VectorIndex> {
        Ok(
            VectorIndex::open(Arc::clone(&self.store), Arc::clone(&self.embedder), CORPUS_INDEX)
                .await?
                .with_batch_size(self.config.embeddings.batch_size),
        )
    }

    /// Open the memory of `conversation`, or of the configured one.
    pub async fn memory(&self, conversation: Option<&str>) -> Result<ConversationMemory> {
        let conversation = conversation.unwrap_or(&self.config.session.conversation);
        Ok(ConversationMemory::open(
            Arc::clone(&self.store),
            Arc::clone(&self.embedder),
            conversation,
        )
        .await?
        .with_recall_role(self.config.retrieval.recall_role))
    }

    /// A chat session over the corpus and the memory of `conversation`.
    pub async fn session(
        &self,
        model: Arc<dyn ChatModel>,
        conversation: Option<&str>,
    ) -> Result<ChatSession> {
        let tokenizer = create_tokenizer(&self.config.tokenizer)?;
        Ok(ChatSession::new(
            self.corpus().await?,
            self.memory(conversation).await?,
            model,
            CostAccountant::new(tokenizer),
            SessionSettings::from_config(&self.config),
        ))
    }

    pub async fn close(&self) {
        self.sqlite.close().await;
    }
}
