use super::Store;
use crate::cache::{CacheBackend, CacheEntry};
use crate::error::StoreError;
use rusqlite::{OptionalExtension, params};

impl CacheBackend for Store {
    fn lookup(&self, hash: &str) -> Result<Option<CacheEntry>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT hash, document_id, normalized_text, result_json, metrics_json
                     FROM extraction_cache WHERE hash = ?1",
                    params![hash],
                    |row| {
                        Ok(CacheEntry {
                            hash: row.get(0)?,
                            document_id: row.get(1)?,
                            normalized_text: row.get(2)?,
                            result_json: row.get(3)?,
                            metrics_json: row.get(4)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    fn insert(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO extraction_cache
                    (hash, document_id, normalized_text, result_json, metrics_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.hash,
                    entry.document_id,
                    entry.normalized_text,
                    entry.result_json,
                    entry.metrics_json,
                ],
            )?;
            Ok(())
        })
    }

    fn remove_for_document(&self, document_id: i64) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM extraction_cache WHERE document_id = ?1",
                params![document_id],
            )?)
        })
    }
}
