// src/store/mod.rs
//
// SQLite persistence. Every query lives in this module's submodules as a
// narrow function over `&Connection`, so callers can compose them inside one
// transaction without writing SQL of their own.

pub mod cache;
pub mod files;
pub mod records;

use crate::error::StoreError;
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS bill_files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id TEXT NOT NULL,
        filename TEXT NOT NULL,
        file_path TEXT NOT NULL,
        file_size INTEGER,
        processed INTEGER NOT NULL DEFAULT 0,
        processing_status TEXT NOT NULL DEFAULT 'pending',
        review_status TEXT NOT NULL DEFAULT 'pending',
        missing_fields TEXT,
        service_type TEXT,
        extraction_payload TEXT,
        metrics TEXT,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX IF NOT EXISTS idx_bill_files_project ON bill_files(project_id);

    CREATE TABLE IF NOT EXISTS utility_accounts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id TEXT NOT NULL,
        utility_name TEXT NOT NULL,
        account_number TEXT NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX IF NOT EXISTS idx_utility_accounts_project ON utility_accounts(project_id);

    CREATE TABLE IF NOT EXISTS utility_meters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        utility_account_id INTEGER NOT NULL REFERENCES utility_accounts(id) ON DELETE CASCADE,
        meter_number TEXT NOT NULL,
        meter_key TEXT NOT NULL,
        service_address TEXT,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX IF NOT EXISTS idx_utility_meters_account ON utility_meters(utility_account_id);
    CREATE INDEX IF NOT EXISTS idx_utility_meters_key ON utility_meters(meter_key);

    CREATE TABLE IF NOT EXISTS bills (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        bill_file_id INTEGER REFERENCES bill_files(id) ON DELETE SET NULL,
        account_id INTEGER NOT NULL REFERENCES utility_accounts(id) ON DELETE CASCADE,
        meter_id INTEGER NOT NULL REFERENCES utility_meters(id) ON DELETE CASCADE,
        utility_name TEXT,
        service_type TEXT,
        service_address TEXT,
        rate_schedule TEXT,
        period_start TEXT,
        period_end TEXT,
        days_in_period INTEGER,
        due_date TEXT,
        total_kwh REAL,
        total_amount_due REAL,
        energy_charges REAL,
        demand_charges REAL,
        max_demand_kw REAL,
        blended_rate REAL,
        avg_cost_per_day REAL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX IF NOT EXISTS idx_bills_file ON bills(bill_file_id);
    CREATE INDEX IF NOT EXISTS idx_bills_meter ON bills(meter_id);
    CREATE INDEX IF NOT EXISTS idx_bills_period ON bills(period_start, period_end);

    CREATE TABLE IF NOT EXISTS bill_tou_periods (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        bill_id INTEGER NOT NULL REFERENCES bills(id) ON DELETE CASCADE,
        period TEXT NOT NULL,
        kwh REAL NOT NULL,
        rate_dollars_per_kwh REAL,
        est_cost_dollars REAL
    );
    CREATE INDEX IF NOT EXISTS idx_bill_tou_periods_bill ON bill_tou_periods(bill_id);

    CREATE TABLE IF NOT EXISTS extraction_cache (
        hash TEXT PRIMARY KEY,
        document_id INTEGER NOT NULL,
        normalized_text TEXT NOT NULL,
        result_json TEXT NOT NULL,
        metrics_json TEXT NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX IF NOT EXISTS idx_extraction_cache_document ON extraction_cache(document_id);
";

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file, creating parent directories.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self::init(Connection::open(path)?)?;
        info!(path = %path.display(), "Database initialized");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against the connection outside any explicit transaction.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` in a transaction; any error rolls every write back.
    pub fn with_transaction<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| Ok(conn.execute_batch(SCHEMA)?))
            .unwrap();
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();
        let result: Result<(), StoreError> = store.with_transaction(|tx| {
            files::register_file(tx, "p1", "a.pdf", "/tmp/a.pdf", 10)?;
            Err(StoreError::FileNotFound(99))
        });
        assert!(result.is_err());

        let count: i64 = store
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM bill_files", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bills.db");
        Store::open(&path).unwrap();
        assert!(path.exists());
    }
}
