// src/cache.rs

use crate::error::StoreError;
use crate::metrics::ProcessingMetrics;
use crate::model::ExtractionResult;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bumping this orphans every existing cache row.
pub const CACHE_VERSION: &str = "v1";

/// Stored copies of the normalized text are cut to this many chars.
const MAX_STORED_TEXT_CHARS: usize = 50_000;

/// One cache row as the backend sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub hash: String,
    pub document_id: i64,
    pub normalized_text: String,
    pub result_json: String,
    pub metrics_json: String,
}

/// Storage behind the cache. The SQLite store implements it; tests swap in
/// failing backends.
pub trait CacheBackend: Send + Sync {
    fn lookup(&self, hash: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Must not overwrite an existing row for the same hash.
    fn insert(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    fn remove_for_document(&self, document_id: i64) -> Result<usize, StoreError>;
}

pub fn compute_hash(normalized_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(CACHE_VERSION.as_bytes());
    hasher.update(b":");
    hasher.update(normalized_text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Content-addressed store of finished extractions.
///
/// Every backend failure is logged and reported as a miss, so a broken cache
/// never fails an extraction.
#[derive(Clone)]
pub struct CacheService {
    backend: Arc<dyn CacheBackend>,
}

impl CacheService {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub fn get(&self, hash: &str) -> Option<ExtractionResult> {
        let entry = match self.backend.lookup(hash) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(hash = short(hash), "cache miss");
                return None;
            }
            Err(e) => {
                warn!(hash = short(hash), error = %e, "cache lookup failed");
                return None;
            }
        };

        match serde_json::from_str::<ExtractionResult>(&entry.result_json) {
            Ok(result) => {
                info!(hash = short(hash), document_id = entry.document_id, "cache hit");
                Some(result)
            }
            Err(e) => {
                warn!(hash = short(hash), error = %e, "unreadable cache row, treating as miss");
                None
            }
        }
    }

    /// Hash the text and look it up in one step.
    pub fn check_and_get(&self, normalized_text: &str) -> (String, Option<ExtractionResult>) {
        let hash = compute_hash(normalized_text);
        let hit = self.get(&hash);
        (hash, hit)
    }

    /// Returns whether the row was written. An existing row for the same hash
    /// is left untouched.
    pub fn put(
        &self,
        document_id: i64,
        hash: &str,
        normalized_text: &str,
        result: &ExtractionResult,
        metrics: &ProcessingMetrics,
    ) -> bool {
        let mut stored = result.clone();
        stored.raw_text = None;

        let entry = match (serde_json::to_string(&stored), serde_json::to_string(metrics)) {
            (Ok(result_json), Ok(metrics_json)) => CacheEntry {
                hash: hash.to_string(),
                document_id,
                normalized_text: normalized_text.chars().take(MAX_STORED_TEXT_CHARS).collect(),
                result_json,
                metrics_json,
            },
            (Err(e), _) | (_, Err(e)) => {
                warn!(document_id, error = %e, "could not serialize cache row");
                return false;
            }
        };

        match self.backend.insert(&entry) {
            Ok(()) => {
                info!(document_id, hash = short(hash), "cached extraction");
                true
            }
            Err(e) => {
                warn!(document_id, error = %e, "cache save failed");
                false
            }
        }
    }

    pub fn invalidate(&self, document_id: i64) -> bool {
        match self.backend.remove_for_document(document_id) {
            Ok(removed) => {
                info!(document_id, removed, "invalidated cache");
                true
            }
            Err(e) => {
                warn!(document_id, error = %e, "cache invalidation failed");
                false
            }
        }
    }
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
