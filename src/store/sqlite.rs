//! Default metadata store backed by SQLite.
//!
//! WAL mode keeps concurrent readers off the writers' backs; all access
//! from this process is serialized through one connection behind a mutex.
//! Schema changes are additive only: older database files are migrated by
//! adding missing columns, never by dropping or rewriting existing ones.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::{CacheRecord, MetadataStore, ResultType, StorageError};

const SELECT_COLUMNS: &str = "cache_key, func_name, input_id, version, result_type, \
                              content_type, result_value, result_data, updated_at";

pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            conn: Mutex::new(Connection::open(path)?),
        })
    }

    /// Fully in-memory store; useful for tests and throwaway runs.
    pub fn in_memory() -> Result<Self, StorageError> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheRecord> {
    let type_tag: String = row.get(4)?;
    let result_type = ResultType::parse(&type_tag).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown result_type '{type_tag}'").into(),
        )
    })?;
    Ok(CacheRecord {
        cache_key: row.get(0)?,
        func_name: row.get(1)?,
        input_id: row.get(2)?,
        version: row.get(3)?,
        result_type,
        content_type: row.get(5)?,
        result_value: row.get(6)?,
        result_data: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl MetadataStore for SqliteMetadataStore {
    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.lock();
        conn.pragma_update(None, "journal_mode", "WAL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                 cache_key    TEXT PRIMARY KEY,
                 func_name    TEXT,
                 input_id     TEXT,
                 version      TEXT,
                 result_type  TEXT,
                 content_type TEXT,
                 result_value TEXT,
                 result_data  BLOB,
                 updated_at   TIMESTAMP DEFAULT CURRENT_TIMESTAMP
             )",
            [],
        )?;

        // Additive migration for databases created by older layouts.
        let mut stmt = conn.prepare("PRAGMA table_info(records)")?;
        let existing: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        for (column, definition) in [
            ("version", "ALTER TABLE records ADD COLUMN version TEXT"),
            (
                "content_type",
                "ALTER TABLE records ADD COLUMN content_type TEXT",
            ),
            (
                "result_data",
                "ALTER TABLE records ADD COLUMN result_data BLOB",
            ),
        ] {
            if !existing.iter().any(|c| c == column) {
                conn.execute(definition, [])?;
            }
        }
        Ok(())
    }

    fn get(&self, cache_key: &str) -> Result<Option<CacheRecord>, StorageError> {
        let conn = self.lock();
        let record = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM records WHERE cache_key = ?1"),
                params![cache_key],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn put(&self, record: &CacheRecord) -> Result<(), StorageError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO records
                 (cache_key, func_name, input_id, version, result_type,
                  content_type, result_value, result_data, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, CURRENT_TIMESTAMP)",
            params![
                record.cache_key,
                record.func_name,
                record.input_id,
                record.version,
                record.result_type.as_str(),
                record.content_type,
                record.result_value,
                record.result_data,
            ],
        )?;
        Ok(())
    }

    fn delete(&self, cache_key: &str) -> Result<bool, StorageError> {
        let conn = self.lock();
        let affected = conn.execute("DELETE FROM records WHERE cache_key = ?1", params![cache_key])?;
        Ok(affected > 0)
    }

    fn history(&self, limit: usize) -> Result<Vec<CacheRecord>, StorageError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM records ORDER BY updated_at DESC, cache_key LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
