use crate::error::ConfigError;
use serde::Deserialize;
use std::{fs, path::Path};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub cleaner: CleanerConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "billstore/bills.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// OpenAI-compatible completion endpoint used for the two-pass fallback.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_pass_a_max_tokens")]
    pub pass_a_max_tokens: u32,
    #[serde(default = "default_pass_b_max_tokens")]
    pub pass_b_max_tokens: u32,
    #[serde(default = "default_pass_a_max_chars")]
    pub pass_a_max_chars: usize,
    #[serde(default = "default_pass_b_max_chars")]
    pub pass_b_max_chars: usize,
    #[serde(default = "default_llm_evidence_lines")]
    pub max_evidence_lines: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.x.ai/v1".to_string()
}

fn default_model() -> String {
    "grok-3-mini".to_string()
}

fn default_api_key_env() -> String {
    "XAI_API_KEY".to_string()
}

fn default_pass_a_max_tokens() -> u32 {
    500
}

fn default_pass_b_max_tokens() -> u32 {
    2000
}

fn default_pass_a_max_chars() -> usize {
    8_000
}

fn default_pass_b_max_chars() -> usize {
    15_000
}

fn default_llm_evidence_lines() -> usize {
    30
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            pass_a_max_tokens: default_pass_a_max_tokens(),
            pass_b_max_tokens: default_pass_b_max_tokens(),
            pass_a_max_chars: default_pass_a_max_chars(),
            pass_b_max_chars: default_pass_b_max_chars(),
            max_evidence_lines: default_llm_evidence_lines(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NormalizerConfig {
    /// Below this many characters of embedded text a PDF is OCR'd.
    #[serde(default = "default_min_native_chars")]
    pub min_native_chars: usize,
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_ocr_language")]
    pub ocr_language: String,
    #[serde(default = "default_spreadsheet_max_rows")]
    pub spreadsheet_max_rows: usize,
}

fn default_min_native_chars() -> usize {
    100
}

fn default_dpi() -> u32 {
    200
}

fn default_max_pages() -> u32 {
    20
}

fn default_ocr_language() -> String {
    "eng".to_string()
}

fn default_spreadsheet_max_rows() -> usize {
    500
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            min_native_chars: default_min_native_chars(),
            dpi: default_dpi(),
            max_pages: default_max_pages(),
            ocr_language: default_ocr_language(),
            spreadsheet_max_rows: default_spreadsheet_max_rows(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanerConfig {
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,
    #[serde(default = "default_repeat_threshold")]
    pub repeat_threshold: usize,
    #[serde(default = "default_max_repeat_line_len")]
    pub max_repeat_line_len: usize,
    #[serde(default = "default_min_line_length")]
    pub min_line_length: usize,
    #[serde(default = "default_fallback_lines")]
    pub fallback_lines: usize,
    #[serde(default = "default_cleaner_evidence_lines")]
    pub max_evidence_lines: usize,
}

fn default_max_output_chars() -> usize {
    20_000
}

fn default_context_lines() -> usize {
    2
}

fn default_repeat_threshold() -> usize {
    3
}

fn default_max_repeat_line_len() -> usize {
    100
}

fn default_min_line_length() -> usize {
    5
}

fn default_fallback_lines() -> usize {
    100
}

fn default_cleaner_evidence_lines() -> usize {
    50
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            max_output_chars: default_max_output_chars(),
            context_lines: default_context_lines(),
            repeat_threshold: default_repeat_threshold(),
            max_repeat_line_len: default_max_repeat_line_len(),
            min_line_length: default_min_line_length(),
            fallback_lines: default_fallback_lines(),
            max_evidence_lines: default_cleaner_evidence_lines(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    /// How many of the five critical electric fields the regex pass needs
    /// before the LLM is skipped.
    #[serde(default = "default_electric_success_threshold")]
    pub electric_success_threshold: usize,
    /// Minimum native text length worth trying the regex pass on before OCR.
    #[serde(default = "default_native_min_chars")]
    pub native_min_chars: usize,
}

fn default_electric_success_threshold() -> usize {
    4
}

fn default_native_min_chars() -> usize {
    50
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            electric_success_threshold: default_electric_success_threshold(),
            native_min_chars: default_native_min_chars(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

fn default_max_workers() -> usize {
    10
}

fn default_retention_secs() -> u64 {
    3600
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Like `load`, but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.storage.db_path, "billstore/bills.db");
        assert_eq!(cfg.llm.pass_a_max_tokens, 500);
        assert_eq!(cfg.extraction.electric_success_threshold, 4);
        assert_eq!(cfg.jobs.max_workers, 10);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [llm]
            model = "local-model"

            [extraction]
            electric_success_threshold = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.llm.model, "local-model");
        assert_eq!(cfg.llm.base_url, "https://api.x.ai/v1");
        assert_eq!(cfg.extraction.electric_success_threshold, 5);
        assert_eq!(cfg.extraction.native_min_chars, 50);
    }
}
