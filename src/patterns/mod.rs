// src/patterns/mod.rs
//
// Zero-cost extraction: ordered regex tables per field, content-based
// service-type detection and time-of-use parsing.

pub mod dates;
pub mod rules;
pub mod tou;

use crate::model::{ExtractionMethod, ExtractionResult, ServiceType};
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, info};

const WATER_MARKERS: &[&str] = &[
    "water charges",
    "water service charges",
    "sewer charges",
    "gallons used",
    "hcf used",
    "ccf used",
    "water usage",
    "sewer usage",
    "water schedule",
];

const ELECTRIC_MARKERS: &[&str] = &[
    "electric charges",
    "electric service",
    "electric usage",
    "electricity",
    "kwh used",
    "kwh total",
    "total kwh",
    "energy charges",
    "demand charges",
    "on-peak kwh",
    "off-peak kwh",
    "mid-peak kwh",
    "super off-peak",
    "high peak kwh",
    "low peak kwh",
    "base kwh",
    "southern california edison",
    "sce",
    "delivery service",
    "generation service",
    "transmission",
    "distribution",
    "your electric use",
    "your usage",
    "billed kwh",
    "total energy",
    "electric meter",
    "kilowatt",
    "kilowatt-hour",
    "pacific gas",
    "pg&e",
    "sdg&e",
    "san diego gas",
    "tou-",
    "time-of-use",
    "time of use",
];

const GAS_MARKERS: &[&str] = &[
    "gas charges",
    "gas service charges",
    "therms used",
    "therm usage",
    "natural gas",
];

/// One case-insensitive alternation per marker list. Markers that end in a
/// word character get a trailing boundary so "sce" does not fire on "scene".
fn marker_regex(markers: &[&str]) -> Regex {
    let alts: Vec<String> = markers
        .iter()
        .map(|m| {
            let tail = if m.ends_with(|c: char| c.is_alphanumeric()) {
                r"\b"
            } else {
                ""
            };
            format!("{}{tail}", regex::escape(m))
        })
        .collect();
    Regex::new(&format!(r"(?i)\b(?:{})", alts.join("|"))).unwrap()
}

static WATER: LazyLock<Regex> = LazyLock::new(|| marker_regex(WATER_MARKERS));
static ELECTRIC: LazyLock<Regex> = LazyLock::new(|| marker_regex(ELECTRIC_MARKERS));
static GAS: LazyLock<Regex> = LazyLock::new(|| marker_regex(GAS_MARKERS));

/// Classify by charge-section content rather than provider name, since one
/// provider can bill water and power on the same statement.
pub fn detect_service_type(text: &str) -> ServiceType {
    let water = WATER.is_match(text);
    let electric = ELECTRIC.is_match(text);
    let gas = GAS.is_match(text);
    debug!(water, electric, gas, "service markers");

    match (water, electric, gas) {
        (true, false, _) => ServiceType::Water,
        (false, false, true) => ServiceType::Gas,
        (true, true, _) => ServiceType::Combined,
        _ => ServiceType::Electric,
    }
}

pub struct PatternExtractor {
    electric_threshold: usize,
}

impl PatternExtractor {
    /// `electric_threshold` is how many of utility, account, amount, period
    /// and kWh an electric bill needs before regex output counts as success.
    pub fn new(electric_threshold: usize) -> Self {
        Self { electric_threshold }
    }

    pub fn extract(&self, text: &str) -> ExtractionResult {
        let mut result = ExtractionResult {
            method: ExtractionMethod::Regex,
            raw_text: Some(text.to_string()),
            ..ExtractionResult::default()
        };
        if text.trim().is_empty() {
            return result;
        }

        result.service_type = detect_service_type(text);
        result.utility_name = rules::utility_name(text);

        result.service_account = rules::service_account(text);
        result.customer_account = rules::customer_account(text);
        result.account_number = result
            .service_account
            .clone()
            .or_else(|| result.customer_account.clone())
            .or_else(|| rules::generic_account(text));

        result.service_address = rules::service_address(text);
        result.rate_schedule = rules::rate_schedule(text);
        if let Some((start, end)) = rules::billing_period(text) {
            result.billing_period_start = Some(start);
            result.billing_period_end = Some(end);
        }
        result.due_date = rules::due_date(text);
        result.total_amount = rules::total_amount(text);
        result.meter_number = rules::meter_number(text);

        // Usage and TOU rows are only printed on power bills.
        result.total_kwh = rules::total_kwh(text);
        result.tou_breakdown = tou::extract_tou(text);
        if (result.total_kwh.is_some() || !result.tou_breakdown.is_empty())
            && !result.service_type.is_electric()
        {
            debug!(from = result.service_type.as_str(), "usage found, treating as electric");
            result.service_type = ServiceType::Electric;
        }

        result.success = self.is_success(&result);
        info!(
            success = result.success,
            service_type = result.service_type.as_str(),
            "regex extraction finished"
        );
        result
    }

    fn is_success(&self, r: &ExtractionResult) -> bool {
        if !r.service_type.is_electric() {
            return r.utility_name.is_some() && r.account_number.is_some() && r.total_amount.is_some();
        }
        let found = [
            r.utility_name.is_some(),
            r.account_number.is_some(),
            r.total_amount.is_some(),
            r.has_period(),
            r.total_kwh.is_some(),
        ]
        .into_iter()
        .filter(|hit| *hit)
        .count();
        debug!(found, threshold = self.electric_threshold, "critical fields");
        found >= self.electric_threshold
    }
}
