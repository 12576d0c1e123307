use crate::cache::CACHE_VERSION;
use crate::model::PassUsed;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-file processing record, stored with cache rows and on the bill file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    /// Normalization method, e.g. `pdf_native` or `image_ocr`.
    pub method: String,
    pub duration_ms: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub pages: usize,
    pub char_count: usize,
    pub cache_hit: bool,
    pub timestamp: DateTime<Utc>,
    pub cache_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_used: Option<PassUsed>,
}

impl ProcessingMetrics {
    pub fn new(method: impl Into<String>, duration_ms: f64) -> Self {
        Self {
            method: method.into(),
            duration_ms: (duration_ms * 100.0).round() / 100.0,
            tokens_in: 0,
            tokens_out: 0,
            pages: 1,
            char_count: 0,
            cache_hit: false,
            timestamp: Utc::now(),
            cache_version: CACHE_VERSION.to_string(),
            pass_used: None,
        }
    }

    pub fn with_tokens(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }

    pub fn with_document(mut self, pages: usize, char_count: usize) -> Self {
        self.pages = pages;
        self.char_count = char_count;
        self
    }

    pub fn with_pass(mut self, pass_used: PassUsed) -> Self {
        self.cache_hit = pass_used == PassUsed::Cached;
        self.pass_used = Some(pass_used);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_serialization() {
        let m = ProcessingMetrics::new("pdf_ocr", 1234.5678)
            .with_tokens(900, 120)
            .with_document(3, 4200)
            .with_pass(PassUsed::PassAB);
        assert_eq!(m.duration_ms, 1234.57);
        assert!(!m.cache_hit);

        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["pass_used"], "A+B");
        assert_eq!(json["cache_version"], "v1");
        assert_eq!(json["tokens_in"], 900);
    }

    #[test]
    fn test_cached_pass_sets_hit() {
        let m = ProcessingMetrics::new("pdf_native", 5.0).with_pass(PassUsed::Cached);
        assert!(m.cache_hit);
    }
}
