//! Utility-bill intake: turns bill PDFs, images and spreadsheets into
//! structured account, meter and billing records.
//!
//! A file flows through [`normalize`], [`clean`], the zero-cost
//! [`patterns`] pass and, when that is not enough, the [`two_pass`] LLM
//! extractor. Results are cached by content hash ([`cache`]), merged
//! ([`resolve`]) and reconciled into the SQLite [`store`]
//! ([`reconcile`]). [`jobs`] runs files in the background and [`pipeline`]
//! ties the stages together.

pub mod cache;
pub mod clean;
pub mod config;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod patterns;
pub mod pipeline;
pub mod reconcile;
pub mod resolve;
pub mod store;
pub mod two_pass;
