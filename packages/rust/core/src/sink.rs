//! Persistence seam between the pipeline and the index.

use std::collections::HashSet;
use std::future::Future;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use harvester_shared::{Result, SemanticChunk, SourceDocument};
use harvester_storage::{Storage, StoredEmbedding};

use crate::embed::{EmbedMode, Embedder};

/// Outcome of persisting one page's chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertReport {
    pub inserted: usize,
    /// Already stored, or repeated within the batch.
    pub skipped: usize,
    pub errors: usize,
}

impl InsertReport {
    pub fn absorb(&mut self, other: InsertReport) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

/// Where processed pages end up.
pub trait PageSink {
    /// Upsert the document and return its id.
    fn insert_document(&self, doc: &SourceDocument) -> impl Future<Output = Result<String>>;

    /// Store chunks under `document_id`. Per-chunk failures are counted, not returned.
    fn insert_chunks(
        &self,
        document_id: &str,
        chunks: &[SemanticChunk],
    ) -> impl Future<Output = Result<InsertReport>>;
}

/// Writes into [`Storage`], embedding new chunks when an embedder is configured.
pub struct IndexSink<E> {
    storage: Storage,
    embedder: Option<E>,
}

impl<E: Embedder> IndexSink<E> {
    pub fn new(storage: Storage, embedder: Option<E>) -> Self {
        Self { storage, embedder }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Vectors for `texts`, or `None` per text when embedding is off or fails.
    async fn vectors_for(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        let Some(embedder) = &self.embedder else {
            return vec![None; texts.len()];
        };
        if texts.is_empty() {
            return Vec::new();
        }
        match embedder.embed(texts, EmbedMode::Passage).await {
            Ok(vectors) => vectors.into_iter().map(Some).collect(),
            Err(e) => {
                warn!(error = %e, count = texts.len(), "embedding failed, storing chunks without vectors");
                vec![None; texts.len()]
            }
        }
    }
}

impl<E: Embedder> PageSink for IndexSink<E> {
    async fn insert_document(&self, doc: &SourceDocument) -> Result<String> {
        self.storage.insert_document(doc).await
    }

    #[instrument(skip_all, fields(document_id = %document_id, chunks = chunks.len()))]
    async fn insert_chunks(
        &self,
        document_id: &str,
        chunks: &[SemanticChunk],
    ) -> Result<InsertReport> {
        let mut report = InsertReport::default();
        let mut seen = HashSet::new();
        let mut fresh = Vec::new();

        for chunk in chunks {
            if !seen.insert(chunk.hash.as_str()) {
                report.skipped += 1;
                continue;
            }
            match self.storage.chunk_exists(&chunk.hash).await {
                Ok(true) => report.skipped += 1,
                Ok(false) => fresh.push(chunk),
                Err(e) => {
                    warn!(hash = %chunk.hash, error = %e, "chunk lookup failed");
                    report.errors += 1;
                }
            }
        }

        let texts: Vec<String> = fresh.iter().map(|c| c.text.clone()).collect();
        let vectors = self.vectors_for(&texts).await;
        let model = self.embedder.as_ref().map(|e| e.model()).unwrap_or_default();

        for (chunk, vector) in fresh.into_iter().zip(vectors) {
            let embedding = vector.as_deref().map(|v| StoredEmbedding { vector: v, model });
            match self.storage.insert_chunk(document_id, chunk, embedding).await {
                Ok(true) => report.inserted += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(hash = %chunk.hash, error = %e, "chunk insert failed");
                    report.errors += 1;
                }
            }
        }

        debug!(
            inserted = report.inserted,
            skipped = report.skipped,
            errors = report.errors,
            "chunks persisted"
        );
        Ok(report)
    }
}
