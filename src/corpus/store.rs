//! SQLite-backed corpus store
//!
//! Hydration-only view over the unit table populated by the ingestion
//! pipeline. The retrieval paths issue read queries exclusively; the insert
//! helpers exist for the ingest boundary and test fixtures.

use crate::corpus::{FacetType, RetrievalUnit, UnitStore};
use crate::error::{EvidexError, Result};
use crate::query::CodeRef;
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::path::Path;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// SQLite unit store with pooled connections
pub struct SqliteUnitStore {
    pool: DbPool,
}

impl SqliteUnitStore {
    /// Open (or create) the store at the given path
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EvidexError::Io {
                source: e,
                context: format!("Failed to create store directory: {:?}", parent),
            })?;
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(16)
            .build(manager)
            .map_err(|e| EvidexError::Config(format!("Failed to create connection pool: {}", e)))?;

        {
            let conn = pool
                .get()
                .map_err(|e| EvidexError::Config(format!("Failed to get connection: {}", e)))?;

            // WAL so concurrent readers never block each other
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                ",
            )?;

            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS units (
                    id TEXT PRIMARY KEY,
                    document_id TEXT NOT NULL,
                    start_char INTEGER NOT NULL,
                    end_char INTEGER NOT NULL,
                    facet TEXT NOT NULL,
                    section TEXT,
                    text TEXT NOT NULL,
                    metadata TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_units_document
                    ON units(document_id, start_char);

                CREATE TABLE IF NOT EXISTS unit_embeddings (
                    unit_id TEXT PRIMARY KEY,
                    vector BLOB NOT NULL
                );

                CREATE TABLE IF NOT EXISTS document_codes (
                    document_id TEXT NOT NULL,
                    system TEXT NOT NULL,
                    value TEXT NOT NULL,
                    PRIMARY KEY (document_id, system, value)
                );
                ",
            )?;
        }

        Ok(Self { pool })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| EvidexError::Config(format!("Failed to get connection: {}", e)))
    }

    /// Ingest-boundary helper: store one unit
    pub fn insert_unit(&self, unit: &RetrievalUnit) -> Result<()> {
        let conn = self.conn()?;
        let metadata = serde_json::to_string(&unit.metadata).map_err(|e| EvidexError::Json {
            source: e,
            context: format!("Failed to serialize metadata for unit {}", unit.id),
        })?;
        conn.execute(
            "INSERT OR REPLACE INTO units
             (id, document_id, start_char, end_char, facet, section, text, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                unit.id,
                unit.document_id,
                unit.start_char as i64,
                unit.end_char as i64,
                unit.facet.as_str(),
                unit.section,
                unit.text,
                metadata,
            ],
        )?;
        Ok(())
    }

    /// Ingest-boundary helper: store a precomputed unit embedding
    pub fn insert_embedding(&self, unit_id: &str, vector: &[f32]) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO unit_embeddings (unit_id, vector) VALUES (?1, ?2)",
            params![unit_id, vector_to_blob(vector)],
        )?;
        Ok(())
    }

    /// Ingest-boundary helper: attach a code to a document
    pub fn insert_document_code(&self, document_id: &str, code: &CodeRef) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO document_codes (document_id, system, value)
             VALUES (?1, ?2, ?3)",
            params![document_id, code.system, code.value],
        )?;
        Ok(())
    }

    fn row_to_unit(row: &rusqlite::Row<'_>) -> rusqlite::Result<RetrievalUnit> {
        let facet: String = row.get(4)?;
        let metadata: Option<String> = row.get(7)?;
        Ok(RetrievalUnit {
            id: row.get(0)?,
            document_id: row.get(1)?,
            start_char: row.get::<_, i64>(2)? as usize,
            end_char: row.get::<_, i64>(3)? as usize,
            facet: FacetType::parse(&facet),
            section: row.get(5)?,
            text: row.get(6)?,
            metadata: metadata
                .and_then(|m| serde_json::from_str(&m).ok())
                .unwrap_or(serde_json::Value::Null),
        })
    }
}

#[async_trait]
impl UnitStore for SqliteUnitStore {
    async fn get_units(&self, ids: &[String]) -> Result<Vec<RetrievalUnit>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT id, document_id, start_char, end_char, facet, section, text, metadata
             FROM units WHERE id IN ({})",
            placeholders
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), Self::row_to_unit)?;

        let mut units = Vec::new();
        for row in rows {
            units.push(row?);
        }
        Ok(units)
    }

    async fn units_for_document(&self, document_id: &str) -> Result<Vec<RetrievalUnit>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, document_id, start_char, end_char, facet, section, text, metadata
             FROM units WHERE document_id = ?1 ORDER BY start_char ASC",
        )?;
        let rows = stmt.query_map(params![document_id], Self::row_to_unit)?;

        let mut units = Vec::new();
        for row in rows {
            units.push(row?);
        }
        Ok(units)
    }

    async fn embedding(&self, unit_id: &str) -> Result<Option<Vec<f32>>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT vector FROM unit_embeddings WHERE unit_id = ?1")?;
        let mut rows = stmt.query(params![unit_id])?;
        match rows.next()? {
            Some(row) => {
                let blob: Vec<u8> = row.get(0)?;
                Ok(Some(blob_to_vector(&blob)))
            }
            None => Ok(None),
        }
    }

    async fn document_codes(&self, document_id: &str) -> Result<Vec<CodeRef>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT system, value FROM document_codes
             WHERE document_id = ?1 ORDER BY system, value",
        )?;
        let rows = stmt.query_map(params![document_id], |row| {
            Ok(CodeRef {
                system: row.get(0)?,
                value: row.get(1)?,
            })
        })?;

        let mut codes = Vec::new();
        for row in rows {
            codes.push(row?);
        }
        Ok(codes)
    }
}

fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_unit(id: &str, doc: &str, start: usize) -> RetrievalUnit {
        RetrievalUnit {
            id: id.to_string(),
            document_id: doc.to_string(),
            start_char: start,
            end_char: start + 80,
            facet: FacetType::Outcome,
            section: Some("results".to_string()),
            text: format!("unit {} text", id),
            metadata: serde_json::json!({"source": "journal"}),
        }
    }

    #[tokio::test]
    async fn round_trips_units_in_offset_order() {
        let temp = TempDir::new().unwrap();
        let store = SqliteUnitStore::open(&temp.path().join("corpus.db")).unwrap();

        store.insert_unit(&sample_unit("u2", "d1", 200)).unwrap();
        store.insert_unit(&sample_unit("u1", "d1", 0)).unwrap();

        let units = store.units_for_document("d1").await.unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id, "u1");
        assert_eq!(units[1].id, "u2");
        assert_eq!(units[0].facet, FacetType::Outcome);
        assert_eq!(units[0].section.as_deref(), Some("results"));
    }

    #[tokio::test]
    async fn embedding_blob_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = SqliteUnitStore::open(&temp.path().join("corpus.db")).unwrap();

        store.insert_unit(&sample_unit("u1", "d1", 0)).unwrap();
        store.insert_embedding("u1", &[0.25, -1.5, 3.0]).unwrap();

        let vector = store.embedding("u1").await.unwrap().unwrap();
        assert_eq!(vector, vec![0.25, -1.5, 3.0]);
        assert!(store.embedding("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn document_codes_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = SqliteUnitStore::open(&temp.path().join("corpus.db")).unwrap();

        let code = CodeRef {
            system: "trial_registry".to_string(),
            value: "NCT01234567".to_string(),
        };
        store.insert_document_code("d1", &code).unwrap();
        store.insert_document_code("d1", &code).unwrap(); // idempotent

        let codes = store.document_codes("d1").await.unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].value, "NCT01234567");
    }
}
