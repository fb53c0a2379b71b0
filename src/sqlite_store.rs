//! SQLite-backed [`Store`] implementation.
//!
//! Vectors are stored as little-endian f32 BLOBs and compared by brute-force
//! cosine in Rust. Liveness is the `live_sources` pointer table: only chunks
//! of the version it points at are returned by the read paths.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use ragline_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use ragline_core::models::{Chunk, Embedding, ProcessingStatus, Scope, SourceDocument};
use ragline_core::store::{sort_vector_matches, Store, VectorMatch};
use ragline_core::{Error, Result};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn db_err(err: sqlx::Error) -> Error {
    Error::store(err.to_string())
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> Error {
    Error::store(format!("corrupt {} row: {}", what, detail))
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn scope_clause(scope: &Scope) -> (&'static str, Option<&str>) {
    match scope {
        Scope::Owner(tag) => (" AND c.owner_scope = ?", Some(tag.as_str())),
        Scope::Unscoped => ("", None),
    }
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk> {
    let ordinal: i64 = row.get("ordinal");
    let start_offset: i64 = row.get("start_offset");
    let end_offset: i64 = row.get("end_offset");
    Ok(Chunk {
        id: row.get("id"),
        source_document_id: row.get("source_document_id"),
        ordinal: u32::try_from(ordinal).map_err(|e| corrupt("chunk", e))?,
        text: row.get("text"),
        start_offset: usize::try_from(start_offset).map_err(|e| corrupt("chunk", e))?,
        end_offset: usize::try_from(end_offset).map_err(|e| corrupt("chunk", e))?,
        owner_scope: row.get("owner_scope"),
    })
}

fn row_to_document(row: &SqliteRow) -> Result<SourceDocument> {
    let kind: String = row.get("source_kind");
    let status: String = row.get("processing_status");
    let created_at: String = row.get("created_at");
    Ok(SourceDocument {
        id: row.get("id"),
        external_id: row.get("external_id"),
        owner_scope: row.get("owner_scope"),
        source_kind: kind.parse().map_err(|e| corrupt("document", e))?,
        raw_text: row.get("raw_text"),
        content_hash: row.get("content_hash"),
        created_at: parse_ts(&created_at)
            .ok_or_else(|| corrupt("document", format!("bad timestamp '{}'", created_at)))?,
        processing_status: status.parse().map_err(|e| corrupt("document", e))?,
    })
}

const CHUNK_COLUMNS: &str =
    "c.id, c.source_document_id, c.ordinal, c.text, c.start_offset, c.end_offset, c.owner_scope";

#[async_trait]
impl Store for SqliteStore {
    async fn put_document(&self, doc: &SourceDocument) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO source_documents (id, external_id, owner_scope, source_kind, raw_text,
                                          content_hash, created_at, processing_status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                processing_status = excluded.processing_status
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.external_id)
        .bind(&doc.owner_scope)
        .bind(doc.source_kind.as_str())
        .bind(&doc.raw_text)
        .bind(&doc.content_hash)
        .bind(format_ts(&doc.created_at))
        .bind(doc.processing_status.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_status(&self, document_id: &str, status: ProcessingStatus) -> Result<()> {
        let result = sqlx::query("UPDATE source_documents SET processing_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::validation(format!(
                "unknown document '{}'",
                document_id
            )));
        }
        Ok(())
    }

    async fn put_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, source_document_id, ordinal, text, start_offset,
                                    end_offset, owner_scope)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.source_document_id)
            .bind(i64::from(chunk.ordinal))
            .bind(&chunk.text)
            .bind(chunk.start_offset as i64)
            .bind(chunk.end_offset as i64)
            .bind(&chunk.owner_scope)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn put_embeddings(&self, embeddings: &[Embedding]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for emb in embeddings {
            sqlx::query(
                r#"
                INSERT INTO embeddings (id, chunk_id, model, dims, vector, owner_scope, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id, model) DO UPDATE SET
                    id = excluded.id,
                    dims = excluded.dims,
                    vector = excluded.vector,
                    owner_scope = excluded.owner_scope,
                    created_at = excluded.created_at
                "#,
            )
            .bind(&emb.id)
            .bind(&emb.chunk_id)
            .bind(&emb.model)
            .bind(emb.vector.len() as i64)
            .bind(vec_to_blob(&emb.vector))
            .bind(&emb.owner_scope)
            .bind(format_ts(&emb.created_at))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn activate(&self, document_id: &str) -> Result<Option<String>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let external_id: Option<String> =
            sqlx::query_scalar("SELECT external_id FROM source_documents WHERE id = ?")
                .bind(document_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
        let external_id = external_id
            .ok_or_else(|| Error::validation(format!("unknown document '{}'", document_id)))?;

        let previous: Option<String> =
            sqlx::query_scalar("SELECT document_id FROM live_sources WHERE external_id = ?")
                .bind(&external_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO live_sources (external_id, document_id, activated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(external_id) DO UPDATE SET
                document_id = excluded.document_id,
                activated_at = excluded.activated_at
            "#,
        )
        .bind(&external_id)
        .bind(document_id)
        .bind(format_ts(&Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(previous.filter(|id| id != document_id))
    }

    async fn scan_by_scope(&self, scope: &Scope) -> Result<Vec<Chunk>> {
        let (clause, owner) = scope_clause(scope);
        let sql = format!(
            "SELECT {} FROM chunks c \
             JOIN live_sources l ON l.document_id = c.source_document_id \
             WHERE 1 = 1{} ORDER BY c.source_document_id, c.ordinal",
            CHUNK_COLUMNS, clause
        );
        let mut query = sqlx::query(&sql);
        if let Some(owner) = owner {
            query = query.bind(owner);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn similarity_search(
        &self,
        query_vec: &[f32],
        model: &str,
        scope: &Scope,
        top_k: usize,
        threshold: f64,
    ) -> Result<Vec<VectorMatch>> {
        let (clause, owner) = scope_clause(scope);
        let sql = format!(
            "SELECT {}, e.vector FROM chunks c \
             JOIN live_sources l ON l.document_id = c.source_document_id \
             JOIN embeddings e ON e.chunk_id = c.id AND e.model = ? \
             WHERE 1 = 1{}",
            CHUNK_COLUMNS, clause
        );
        let mut query = sqlx::query(&sql).bind(model);
        if let Some(owner) = owner {
            query = query.bind(owner);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;

        let mut matches = Vec::new();
        for row in &rows {
            let blob: Vec<u8> = row.get("vector");
            let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
            if similarity >= threshold {
                matches.push(VectorMatch {
                    chunk: row_to_chunk(row)?,
                    similarity,
                });
            }
        }
        sort_vector_matches(&mut matches);
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn chunks_missing_embedding(&self, model: &str, limit: usize) -> Result<Vec<Chunk>> {
        let sql = format!(
            "SELECT {} FROM chunks c \
             JOIN live_sources l ON l.document_id = c.source_document_id \
             JOIN source_documents d ON d.id = c.source_document_id \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM embeddings e WHERE e.chunk_id = c.id AND e.model = ? \
             ) \
             ORDER BY d.created_at ASC, c.source_document_id, c.ordinal \
             LIMIT ?",
            CHUNK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(model)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn get_document(&self, id: &str) -> Result<Option<SourceDocument>> {
        let row = sqlx::query(
            "SELECT id, external_id, owner_scope, source_kind, raw_text, content_hash, \
             created_at, processing_status FROM source_documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_document).transpose()
    }
}
