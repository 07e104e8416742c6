//! Document corpus builder.
//!
//! Coordinates the indexing flow: directory walk → loaders → chunker →
//! embedding → corpus index. A build always leaves the index holding
//! exactly the chunks of the given documents. Every chunk is embedded before
//! the store is touched, and the swap to the new contents is a single
//! transaction, so a failed build leaves the previous corpus in place. An
//! index built with another embedding model is rebuilt rather than surfaced
//! as an error.
//!
//! Builds are fingerprinted (model, chunking parameters, and every chunk's
//! id and hash). Rebuilding unchanged documents is skipped unless forced.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::chunk::split_document;
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::index::{VectorIndex, DEFAULT_BATCH_SIZE};
use crate::loader::load_document;
use crate::models::{Chunk, Document, EmbeddedEntry, VectorEntry};
use crate::progress::{BuildProgressEvent, BuildProgressReporter, NoProgress};
use crate::store::Store;

/// Name of the document index.
pub const CORPUS_INDEX: &str = "corpus";

/// A file left out of the corpus, with the reason.
#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Documents read from a directory.
#[derive(Debug, Default)]
pub struct LoadedDocuments {
    pub documents: Vec<Document>,
    pub skipped_files: Vec<SkippedFile>,
}

/// Outcome of a build.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub documents: usize,
    pub chunks: usize,
    /// The index already matched the documents; nothing was written.
    pub skipped: bool,
    /// A stale index from another embedding model was discarded.
    pub rebuilt_after_mismatch: bool,
    pub skipped_files: Vec<SkippedFile>,
}

pub struct CorpusBuilder {
    store: Arc<dyn Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    force: bool,
    progress: Box<dyn BuildProgressReporter>,
}

impl CorpusBuilder {
    pub fn new(store: Arc<dyn Store>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            store,
            embedder,
            batch_size: DEFAULT_BATCH_SIZE,
            force: false,
            progress: Box::new(NoProgress),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Rebuild even when the fingerprint is unchanged.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn BuildProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Load every supported file under `dir`, skipping the rest.
    ///
    /// Files are visited in path order. Paths matching `exclude_globs`
    /// (relative to `dir`) are ignored silently; unsupported or unreadable
    /// files are logged and listed in `skipped_files`.
    pub fn load_directory(&self, dir: &Path, exclude_globs: &[String]) -> Result<LoadedDocuments> {
        if !dir.is_dir() {
            return Err(Error::Configuration(format!(
                "documents_dir does not exist or is not a directory: {}",
                dir.display()
            )));
        }
        self.progress.report(BuildProgressEvent::Discovering {
            dir: dir.display().to_string(),
        });

        let excludes = build_globset(exclude_globs)?;
        let mut paths = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e)))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            if excludes.is_match(relative) {
                continue;
            }
            paths.push(entry.into_path());
        }

        let total = paths.len() as u64;
        let mut loaded = LoadedDocuments::default();
        for (i, path) in paths.into_iter().enumerate() {
            match load_document(&path) {
                Ok(doc) => loaded.documents.push(doc),
                Err(e) if e.is_document_local() => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping document");
                    loaded.skipped_files.push(SkippedFile {
                        path,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
            self.progress.report(BuildProgressEvent::Loading {
                n: i as u64 + 1,
                total,
            });
        }
        Ok(loaded)
    }

    /// Load `dir` and build the corpus from it.
    pub async fn build_directory(
        &self,
        dir: &Path,
        exclude_globs: &[String],
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Result<(VectorIndex, BuildReport)> {
        let loaded = self.load_directory(dir, exclude_globs)?;
        let (index, mut report) = self
            .build(&loaded.documents, chunk_size, chunk_overlap)
            .await?;
        report.skipped_files = loaded.skipped_files;
        Ok((index, report))
    }

    /// Chunk and index `documents`, replacing the index's previous contents.
    pub async fn build(
        &self,
        documents: &[Document],
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Result<(VectorIndex, BuildReport)> {
        let mut chunks = Vec::new();
        let mut sources = Vec::new();
        for doc in documents {
            for chunk in split_document(doc, chunk_size, chunk_overlap)? {
                chunks.push(chunk);
                sources.push(doc);
            }
        }

        let mut report = BuildReport {
            documents: documents.len(),
            chunks: chunks.len(),
            ..BuildReport::default()
        };

        let index = match self.open_index().await {
            Ok(index) => index,
            Err(Error::EmbeddingModelMismatch { expected, found, .. }) => {
                tracing::warn!(
                    index = CORPUS_INDEX,
                    %expected,
                    %found,
                    "embedding model changed; rebuilding corpus"
                );
                report.rebuilt_after_mismatch = true;
                VectorIndex::unchecked(Arc::clone(&self.store), Arc::clone(&self.embedder), CORPUS_INDEX)
                    .with_batch_size(self.batch_size)
            }
            Err(e) => return Err(e),
        };

        let fingerprint = self.fingerprint(&chunks, chunk_size, chunk_overlap);
        if !self.force && !report.rebuilt_after_mismatch {
            let current = index.binding().await?.and_then(|b| b.fingerprint);
            if current.as_deref() == Some(fingerprint.as_str())
                && index.count().await? == chunks.len()
            {
                tracing::info!(index = CORPUS_INDEX, chunks = chunks.len(), "corpus up to date");
                self.progress.report(BuildProgressEvent::UpToDate {
                    chunks: chunks.len() as u64,
                });
                report.skipped = true;
                return Ok((index, report));
            }
        }

        let entries: Vec<VectorEntry> = chunks
            .iter()
            .zip(&sources)
            .map(|(chunk, doc)| chunk_entry(chunk, doc))
            .collect();
        let embedded = self.embed_all(&index, &entries).await?;
        index.replace_all(&embedded, Some(fingerprint)).await?;

        tracing::info!(
            index = CORPUS_INDEX,
            documents = report.documents,
            chunks = report.chunks,
            "corpus built"
        );
        Ok((index, report))
    }

    async fn open_index(&self) -> Result<VectorIndex> {
        Ok(
            VectorIndex::open(Arc::clone(&self.store), Arc::clone(&self.embedder), CORPUS_INDEX)
                .await?
                .with_batch_size(self.batch_size),
        )
    }

    /// Embed every entry in batches, reporting progress. Writes nothing.
    async fn embed_all(&self, index: &VectorIndex, entries: &[VectorEntry]) -> Result<Vec<EmbeddedEntry>> {
        let total = entries.len() as u64;
        let mut embedded = Vec::with_capacity(entries.len());
        for batch in entries.chunks(self.batch_size) {
            embedded.extend(index.embed(batch.to_vec()).await?);
            self.progress.report(BuildProgressEvent::Embedding {
                n: embedded.len() as u64,
                total,
            });
        }
        Ok(embedded)
    }

    fn fingerprint(&self, chunks: &[Chunk], chunk_size: usize, chunk_overlap: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.embedder.model_name().as_bytes());
        hasher.update((self.embedder.dims() as u64).to_le_bytes());
        hasher.update((chunk_size as u64).to_le_bytes());
        hasher.update((chunk_overlap as u64).to_le_bytes());
        for chunk in chunks {
            hasher.update(chunk.id.as_bytes());
            hasher.update(chunk.hash.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

fn chunk_entry(chunk: &Chunk, doc: &Document) -> VectorEntry {
    VectorEntry::new(chunk.id.clone(), chunk.text.clone())
        .with_metadata("source", doc.source.to_string_lossy())
        .with_metadata("document_id", chunk.document_id.clone())
        .with_metadata("chunk_index", chunk.index.to_string())
        .with_metadata("format", doc.format.as_str())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::Configuration(format!("invalid exclude glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Configuration(format!("invalid exclude globs: {}", e)))
}
