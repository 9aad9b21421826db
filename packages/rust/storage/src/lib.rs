//! libSQL storage for crawled documents and their chunks.
//!
//! The [`Storage`] struct wraps a local libSQL database. Documents are keyed by
//! normalized URL; chunks are keyed by content hash, so re-crawling a page never
//! duplicates a chunk.
//!
//! **Access rules:**
//! - `harvester crawl`: read-write via [`Storage::open`]
//! - `harvester status`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::Utc;
use harvester_shared::{ChunkMetadata, HarvestError, Result, SemanticChunk, SourceDocument};
use libsql::{Connection, Database, params};
use serde::Serialize;
use uuid::Uuid;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// An embedding vector and the model that produced it.
#[derive(Debug, Clone, Copy)]
pub struct StoredEmbedding<'a> {
    pub vector: &'a [f32],
    pub model: &'a str,
}

/// A chunk row read back from the database.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub hash: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub embedding: Option<Vec<f32>>,
    pub embedding_model: Option<String>,
}

/// Row counts for `harvester status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    pub documents: u64,
    pub chunks: u64,
    pub embedded_chunks: u64,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| HarvestError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(HarvestError::storage)?;

        let conn = db
            .connect()
            .map_err(HarvestError::storage)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(HarvestError::storage(format!(
                "database not found: {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(HarvestError::storage)?;

        let conn = db
            .connect()
            .map_err(HarvestError::storage)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        HarvestError::storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(HarvestError::storage("database is opened in read-only mode"));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Document operations
    // -----------------------------------------------------------------------

    /// Insert or refresh a document by normalized URL. Returns its stable id.
    pub async fn insert_document(&self, doc: &SourceDocument) -> Result<String> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .conn
            .query(
                "INSERT INTO documents (id, url, url_norm, title, source_type, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(url_norm) DO UPDATE SET
                   url = excluded.url,
                   title = excluded.title,
                   source_type = excluded.source_type,
                   updated_at = excluded.updated_at
                 RETURNING id",
                params![
                    id.as_str(),
                    doc.url.as_str(),
                    doc.normalized_url.as_str(),
                    doc.title.as_str(),
                    doc.source_type.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(HarvestError::storage)?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<String>(0)
                .map_err(HarvestError::storage),
            Ok(None) => Err(HarvestError::storage(format!(
                "upsert of {} returned no id",
                doc.normalized_url
            ))),
            Err(e) => Err(HarvestError::storage(e)),
        }
    }

    /// Look up a document id by normalized URL.
    pub async fn document_id(&self, url_norm: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM documents WHERE url_norm = ?1",
                params![url_norm],
            )
            .await
            .map_err(HarvestError::storage)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row.get::<String>(0)
                    .map_err(HarvestError::storage)?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(HarvestError::storage(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Chunk operations
    // -----------------------------------------------------------------------

    pub async fn chunk_exists(&self, hash: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM chunks WHERE chunk_hash = ?1 LIMIT 1",
                params![hash],
            )
            .await
            .map_err(HarvestError::storage)?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(HarvestError::storage(e)),
        }
    }

    /// Store a chunk under `document_id`. Returns `false` if the hash was already present.
    pub async fn insert_chunk(
        &self,
        document_id: &str,
        chunk: &SemanticChunk,
        embedding: Option<StoredEmbedding<'_>>,
    ) -> Result<bool> {
        self.check_writable()?;
        let metadata_json = serde_json::to_string(&chunk.metadata)
            .map_err(|e| HarvestError::storage(format!("metadata serialization: {e}")))?;
        let vector_json = embedding
            .map(|e| serde_json::to_string(e.vector))
            .transpose()
            .map_err(|e| HarvestError::storage(format!("embedding serialization: {e}")))?;
        let model = embedding.map(|e| e.model);
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();

        let affected = self
            .conn
            .execute(
                "INSERT INTO chunks (id, document_id, chunk_hash, chunk_text, embedding, embedding_model, metadata_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(chunk_hash) DO NOTHING",
                params![
                    id.as_str(),
                    document_id,
                    chunk.hash.as_str(),
                    chunk.text.as_str(),
                    vector_json,
                    model,
                    metadata_json,
                    now.as_str()
                ],
            )
            .await
            .map_err(HarvestError::storage)?;
        Ok(affected > 0)
    }

    /// All chunks of a document in insertion order.
    pub async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<StoredChunk>> {
        let mut rows = self
            .conn
            .query(
                "SELECT chunk_hash, chunk_text, metadata_json, embedding, embedding_model
                 FROM chunks WHERE document_id = ?1 ORDER BY id",
                params![document_id],
            )
            .await
            .map_err(HarvestError::storage)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_chunk(&row)?);
        }
        Ok(results)
    }

    pub async fn stats(&self) -> Result<StorageStats> {
        let mut rows = self
            .conn
            .query(
                "SELECT
                   (SELECT COUNT(*) FROM documents),
                   (SELECT COUNT(*) FROM chunks),
                   (SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL)",
                params![],
            )
            .await
            .map_err(HarvestError::storage)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count = |i: i32| -> Result<u64> {
                    let n = row
                        .get::<i64>(i)
                        .map_err(HarvestError::storage)?;
                    Ok(u64::try_from(n).unwrap_or(0))
                };
                Ok(StorageStats {
                    documents: count(0)?,
                    chunks: count(1)?,
                    embedded_chunks: count(2)?,
                })
            }
            Ok(None) => Ok(StorageStats::default()),
            Err(e) => Err(HarvestError::storage(e)),
        }
    }
}

/// Convert a database row to a [`StoredChunk`].
fn row_to_chunk(row: &libsql::Row) -> Result<StoredChunk> {
    let metadata_json: String = row
        .get(2)
        .map_err(HarvestError::storage)?;
    let metadata = serde_json::from_str(&metadata_json)
        .map_err(|e| HarvestError::storage(format!("invalid chunk metadata: {e}")))?;
    let embedding = row
        .get::<String>(3)
        .ok()
        .map(|json| serde_json::from_str::<Vec<f32>>(&json))
        .transpose()
        .map_err(|e| HarvestError::storage(format!("invalid embedding: {e}")))?;

    Ok(StoredChunk {
        hash: row
            .get::<String>(0)
            .map_err(HarvestError::storage)?,
        text: row
            .get::<String>(1)
            .map_err(HarvestError::storage)?,
        metadata,
        embedding,
        embedding_model: row.get::<String>(4).ok(),
    })
}
