// src/model.rs

use serde::{Deserialize, Serialize};
use std::fmt;

/// Content-based bill classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    #[default]
    Electric,
    Water,
    Gas,
    /// Water and electric sections on one statement; extracted as electric.
    Combined,
}

impl ServiceType {
    pub fn is_electric(self) -> bool {
        matches!(self, ServiceType::Electric | ServiceType::Combined)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Electric => "electric",
            ServiceType::Water => "water",
            ServiceType::Gas => "gas",
            ServiceType::Combined => "combined",
        }
    }
}

/// Canonical time-of-use period names, highest rate first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TouPeriodName {
    #[serde(rename = "On-Peak")]
    OnPeak,
    #[serde(rename = "Mid-Peak")]
    MidPeak,
    #[serde(rename = "Off-Peak")]
    OffPeak,
    #[serde(rename = "Super Off-Peak")]
    SuperOffPeak,
}

impl TouPeriodName {
    pub fn as_str(self) -> &'static str {
        match self {
            TouPeriodName::OnPeak => "On-Peak",
            TouPeriodName::MidPeak => "Mid-Peak",
            TouPeriodName::OffPeak => "Off-Peak",
            TouPeriodName::SuperOffPeak => "Super Off-Peak",
        }
    }
}

impl fmt::Display for TouPeriodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One time-of-use line of a bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouPeriod {
    pub period: TouPeriodName,
    pub kwh: f64,
    pub rate: Option<f64>,
    pub cost: Option<f64>,
}

impl TouPeriod {
    /// The printed cost, or kWh x rate rounded to cents.
    pub fn cost_or_estimate(&self) -> Option<f64> {
        self.cost
            .or_else(|| self.rate.map(|rate| round_cents(self.kwh * rate)))
    }
}

/// Per-meter figures when a statement covers several meters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterRecord {
    pub meter_number: Option<String>,
    pub service_address: Option<String>,
    pub kwh: Option<f64>,
    pub total_charge: Option<f64>,
}

/// Which stage produced an extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    #[default]
    Regex,
    Cached,
    AiPassA,
    AiPassAB,
}

/// Path through the pipeline, recorded in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassUsed {
    #[serde(rename = "native_regex_only")]
    NativeRegexOnly,
    #[serde(rename = "regex_only")]
    RegexOnly,
    #[serde(rename = "ocr_regex_only")]
    OcrRegexOnly,
    #[serde(rename = "cached")]
    Cached,
    #[serde(rename = "A")]
    PassA,
    #[serde(rename = "A+B")]
    PassAB,
}

impl PassUsed {
    pub fn as_str(self) -> &'static str {
        match self {
            PassUsed::NativeRegexOnly => "native_regex_only",
            PassUsed::RegexOnly => "regex_only",
            PassUsed::OcrRegexOnly => "ocr_regex_only",
            PassUsed::Cached => "cached",
            PassUsed::PassA => "A",
            PassUsed::PassAB => "A+B",
        }
    }
}

/// Soft-failure codes surfaced to the caller instead of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NormalizationFailed,
    ParsingFailed,
    ExtractionException,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NormalizationFailed => "NORMALIZATION_FAILED",
            ErrorCode::ParsingFailed => "PARSING_FAILED",
            ErrorCode::ExtractionException => "EXTRACTION_EXCEPTION",
        }
    }
}

/// Derived triage state of a processed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Skipped,
    NeedsReview,
    Ok,
    Complete,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewStatus::Skipped => "skipped",
            ReviewStatus::NeedsReview => "needs_review",
            ReviewStatus::Ok => "ok",
            ReviewStatus::Complete => "complete",
        }
    }
}

/// Everything extracted from one bill, whichever stage produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub success: bool,
    #[serde(default)]
    pub service_type: ServiceType,
    pub utility_name: Option<String>,
    pub account_number: Option<String>,
    pub service_account: Option<String>,
    pub customer_account: Option<String>,
    pub meter_number: Option<String>,
    pub service_address: Option<String>,
    pub rate_schedule: Option<String>,
    pub billing_period_start: Option<String>,
    pub billing_period_end: Option<String>,
    pub due_date: Option<String>,
    pub total_kwh: Option<f64>,
    pub total_amount: Option<f64>,
    pub energy_charges: Option<f64>,
    pub demand_charges: Option<f64>,
    pub max_demand_kw: Option<f64>,
    #[serde(default)]
    pub tou_breakdown: Vec<TouPeriod>,
    #[serde(default)]
    pub meters: Vec<MeterRecord>,
    pub confidence: Option<f64>,
    #[serde(rename = "_extraction_method", default)]
    pub method: ExtractionMethod,
    #[serde(rename = "_raw_text", default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl ExtractionResult {
    /// Structured failure payload the caller can still persist for review.
    pub fn soft_failure(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            error_code: Some(code),
            error_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn has_period(&self) -> bool {
        self.billing_period_start.is_some() && self.billing_period_end.is_some()
    }

    /// Money, usage, dates or TOU data: anything worth a bill row.
    pub fn has_signal(&self) -> bool {
        self.total_amount.is_some()
            || self.total_kwh.is_some_and(|k| k > 0.0)
            || self.has_period()
            || !self.tou_breakdown.is_empty()
    }
}

pub fn round_cents(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
