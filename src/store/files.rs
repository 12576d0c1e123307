use crate::error::StoreError;
use crate::metrics::ProcessingMetrics;
use crate::model::{ExtractionResult, ReviewStatus};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::info;

/// One uploaded bill document.
#[derive(Debug, Clone)]
pub struct BillFile {
    pub id: i64,
    pub project_id: String,
    pub filename: String,
    pub file_path: String,
    pub file_size: Option<i64>,
    pub processed: bool,
    pub processing_status: String,
    pub review_status: String,
    pub missing_fields: Vec<String>,
    pub service_type: Option<String>,
    pub extraction_payload: Option<String>,
    pub metrics: Option<String>,
}

impl BillFile {
    pub fn payload(&self) -> Result<Option<ExtractionResult>, StoreError> {
        self.extraction_payload
            .as_deref()
            .map(serde_json::from_str::<ExtractionResult>)
            .transpose()
            .map_err(StoreError::from)
    }
}

const FILE_COLUMNS: &str = "id, project_id, filename, file_path, file_size, processed, \
    processing_status, review_status, missing_fields, service_type, extraction_payload, metrics";

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<BillFile> {
    let missing: Option<String> = row.get(8)?;
    Ok(BillFile {
        id: row.get(0)?,
        project_id: row.get(1)?,
        filename: row.get(2)?,
        file_path: row.get(3)?,
        file_size: row.get(4)?,
        processed: row.get(5)?,
        processing_status: row.get(6)?,
        review_status: row.get(7)?,
        missing_fields: missing
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or_default(),
        service_type: row.get(9)?,
        extraction_payload: row.get(10)?,
        metrics: row.get(11)?,
    })
}

pub fn register_file(
    conn: &Connection,
    project_id: &str,
    filename: &str,
    file_path: &str,
    file_size: i64,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO bill_files (project_id, filename, file_path, file_size) VALUES (?1, ?2, ?3, ?4)",
        params![project_id, filename, file_path, file_size],
    )?;
    let id = conn.last_insert_rowid();
    info!(file_id = id, filename, "Bill file registered");
    Ok(id)
}

pub fn get_file(conn: &Connection, file_id: i64) -> Result<Option<BillFile>, StoreError> {
    let sql = format!("SELECT {FILE_COLUMNS} FROM bill_files WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![file_id], row_to_file)
        .optional()?)
}

pub fn files_for_project(conn: &Connection, project_id: &str) -> Result<Vec<BillFile>, StoreError> {
    let sql = format!("SELECT {FILE_COLUMNS} FROM bill_files WHERE project_id = ?1 ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![project_id], row_to_file)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn set_processing_status(conn: &Connection, file_id: i64, status: &str) -> Result<(), StoreError> {
    let n = conn.execute(
        "UPDATE bill_files SET processing_status = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
        params![status, file_id],
    )?;
    if n == 0 {
        return Err(StoreError::FileNotFound(file_id));
    }
    Ok(())
}

/// Persist the extraction payload and metrics and mark the file processed.
pub fn save_extraction(
    conn: &Connection,
    file_id: i64,
    result: &ExtractionResult,
    metrics: Option<&ProcessingMetrics>,
) -> Result<(), StoreError> {
    let payload = serde_json::to_string(result)?;
    let metrics = metrics.map(serde_json::to_string).transpose()?;
    let status = if result.error_code.is_some() { "failed" } else { "extracted" };
    let n = conn.execute(
        "UPDATE bill_files
         SET extraction_payload = ?1, metrics = ?2, service_type = ?3,
             processing_status = ?4, processed = 1, updated_at = CURRENT_TIMESTAMP
         WHERE id = ?5",
        params![payload, metrics, result.service_type.as_str(), status, file_id],
    )?;
    if n == 0 {
        return Err(StoreError::FileNotFound(file_id));
    }
    info!(file_id, status, "Extraction saved");
    Ok(())
}

pub fn set_review(
    conn: &Connection,
    file_id: i64,
    status: ReviewStatus,
    missing_fields: &[String],
) -> Result<(), StoreError> {
    let missing = serde_json::to_string(missing_fields)?;
    let n = conn.execute(
        "UPDATE bill_files SET review_status = ?1, missing_fields = ?2, updated_at = CURRENT_TIMESTAMP
         WHERE id = ?3",
        params![status.as_str(), missing, file_id],
    )?;
    if n == 0 {
        return Err(StoreError::FileNotFound(file_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn test_file_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                let id = register_file(conn, "proj-1", "sce.pdf", "/bills/sce.pdf", 2048)?;
                let f = get_file(conn, id)?.unwrap();
                assert_eq!(f.processing_status, "pending");
                assert!(!f.processed);

                let result = ExtractionResult {
                    success: true,
                    total_amount: Some(12.5),
                    ..ExtractionResult::default()
                };
                save_extraction(conn, id, &result, None)?;
                set_review(conn, id, ReviewStatus::NeedsReview, &["total_kwh".to_string()])?;

                let f = get_file(conn, id)?.unwrap();
                assert!(f.processed);
                assert_eq!(f.processing_status, "extracted");
                assert_eq!(f.review_status, "needs_review");
                assert_eq!(f.missing_fields, vec!["total_kwh"]);
                assert_eq!(f.service_type.as_deref(), Some("electric"));
                assert_eq!(f.payload()?.unwrap().total_amount, Some(12.5));
                assert_eq!(files_for_project(conn, "proj-1")?.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_unknown_file_is_error() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .with_conn(|conn| set_processing_status(conn, 404, "done"))
            .unwrap_err();
        assert!(matches!(err, StoreError::FileNotFound(404)));
    }
}
