// src/error.rs

use std::path::PathBuf;
use thiserror::Error;

/// Failures while loading the TOML configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Typed failures from turning a source file into text.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("file is empty: {}", .0.display())]
    EmptyFile(PathBuf),

    #[error("could not decode document: {0}")]
    DecodeError(String),

    #[error("external tool not found: {0}")]
    ToolNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to the completion endpoint.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("{0} env var required for LLM extraction")]
    MissingApiKey(String),

    #[error("LLM transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("LLM API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("empty response from LLM")]
    EmptyResponse,

    #[error("unparsable LLM response: {0}")]
    Parse(String),
}

/// Failures in the relational store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("payload serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not prepare database path: {0}")]
    Io(#[from] std::io::Error),

    #[error("no bill file with id {0}")]
    FileNotFound(i64),
}

/// Rejections from the job queue.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("file {0} already has a job in progress")]
    AlreadyRunning(i64),

    #[error("job queue is shutting down")]
    ShuttingDown,
}
