// src/resolve.rs
//
// Field-by-field merge of the cached, AI and regex results.

use crate::model::{ExtractionMethod, ExtractionResult, ServiceType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Ai,
    Regex,
}

const DEFAULT_ORDER: &[Source] = &[Source::Cache, Source::Ai, Source::Regex];

/// Fields whose source order differs from the default.
const POLICY: &[(&str, &[Source])] = &[
    // content-based classification only the regex pass performs
    ("service_type", &[Source::Regex]),
];

pub const DEFAULT_CONFIDENCE: f64 = 0.5;

pub fn source_order(field: &str) -> &'static [Source] {
    POLICY
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, order)| *order)
        .unwrap_or(DEFAULT_ORDER)
}

struct Candidates<'a> {
    cache: Option<&'a ExtractionResult>,
    ai: Option<&'a ExtractionResult>,
    regex: &'a ExtractionResult,
}

impl Candidates<'_> {
    fn get(&self, source: Source) -> Option<&ExtractionResult> {
        match source {
            Source::Cache => self.cache,
            Source::Ai => self.ai,
            Source::Regex => Some(self.regex),
        }
    }

    fn pick<T>(&self, field: &str, value: impl Fn(&ExtractionResult) -> Option<T>) -> Option<T> {
        source_order(field)
            .iter()
            .filter_map(|s| self.get(*s))
            .find_map(value)
    }

    fn pick_text(&self, field: &str, value: impl Fn(&ExtractionResult) -> &Option<String>) -> Option<String> {
        self.pick(field, |e| value(e).as_ref().filter(|s| !s.trim().is_empty()).cloned())
    }

    fn pick_list<T: Clone>(&self, field: &str, value: impl Fn(&ExtractionResult) -> &Vec<T>) -> Vec<T> {
        self.pick(field, |e| Some(value(e)).filter(|v| !v.is_empty()).cloned())
            .unwrap_or_default()
    }
}

/// Build the final result. `raw_text` is the normalized document text.
pub fn resolve(
    regex: &ExtractionResult,
    ai: Option<&ExtractionResult>,
    cache: Option<&ExtractionResult>,
    raw_text: &str,
) -> ExtractionResult {
    let c = Candidates { cache, ai, regex };

    let method = if cache.is_some() {
        ExtractionMethod::Cached
    } else {
        ai.map(|a| a.method).unwrap_or(regex.method)
    };

    let mut out = ExtractionResult {
        success: false,
        service_type: c
            .pick("service_type", |e| Some(e.service_type))
            .unwrap_or(ServiceType::Electric),
        utility_name: c.pick_text("utility_name", |e| &e.utility_name),
        account_number: c.pick_text("account_number", |e| &e.account_number),
        service_account: c.pick_text("service_account", |e| &e.service_account),
        customer_account: c.pick_text("customer_account", |e| &e.customer_account),
        meter_number: c.pick_text("meter_number", |e| &e.meter_number),
        service_address: c.pick_text("service_address", |e| &e.service_address),
        rate_schedule: c.pick_text("rate_schedule", |e| &e.rate_schedule),
        billing_period_start: c.pick_text("billing_period_start", |e| &e.billing_period_start),
        billing_period_end: c.pick_text("billing_period_end", |e| &e.billing_period_end),
        due_date: c.pick_text("due_date", |e| &e.due_date),
        total_kwh: c.pick("total_kwh", |e| e.total_kwh),
        total_amount: c.pick("total_amount", |e| e.total_amount),
        energy_charges: c.pick("energy_charges", |e| e.energy_charges),
        demand_charges: c.pick("demand_charges", |e| e.demand_charges),
        max_demand_kw: c.pick("max_demand_kw", |e| e.max_demand_kw),
        tou_breakdown: c.pick_list("tou_breakdown", |e| &e.tou_breakdown),
        meters: c.pick_list("meters", |e| &e.meters),
        confidence: Some(c.pick("confidence", |e| e.confidence).unwrap_or(DEFAULT_CONFIDENCE)),
        method,
        raw_text: Some(raw_text.to_string()),
        error_code: None,
        error_reason: None,
    };
    out.success = out.account_number.is_some() && (out.total_kwh.is_some() || out.total_amount.is_some());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MeterRecord, TouPeriod, TouPeriodName};

    fn regex_result() -> ExtractionResult {
        ExtractionResult {
            service_type: ServiceType::Combined,
            utility_name: Some("LADWP".to_string()),
            account_number: Some("1234567890".to_string()),
            service_address: Some("111 N HOPE ST LOS ANGELES CA 90012".to_string()),
            total_kwh: Some(15000.0),
            tou_breakdown: vec![TouPeriod {
                period: TouPeriodName::OnPeak,
                kwh: 11680.0,
                rate: Some(0.25624),
                cost: Some(2992.92),
            }],
            confidence: Some(0.7),
            ..ExtractionResult::default()
        }
    }

    #[test]
    fn test_ai_wins_and_regex_fills_gaps() {
        let ai = ExtractionResult {
            service_type: ServiceType::Electric,
            utility_name: Some("Los Angeles Department of Water and Power".to_string()),
            account_number: Some("  ".to_string()),
            total_kwh: Some(15880.0),
            total_amount: Some(3748.92),
            meters: vec![MeterRecord {
                meter_number: Some("APMYV00222-00027735".to_string()),
                ..MeterRecord::default()
            }],
            method: ExtractionMethod::AiPassAB,
            ..ExtractionResult::default()
        };
        let out = resolve(&regex_result(), Some(&ai), None, "RAW TEXT");

        assert_eq!(out.utility_name.as_deref(), Some("Los Angeles Department of Water and Power"));
        // blank AI account falls through to regex
        assert_eq!(out.account_number.as_deref(), Some("1234567890"));
        assert_eq!(out.total_kwh, Some(15880.0));
        assert_eq!(out.service_address.as_deref(), Some("111 N HOPE ST LOS ANGELES CA 90012"));
        assert_eq!(out.tou_breakdown.len(), 1);
        assert_eq!(out.meters.len(), 1);
        assert_eq!(out.service_type, ServiceType::Combined);
        assert_eq!(out.confidence, Some(0.7));
        assert_eq!(out.method, ExtractionMethod::AiPassAB);
        assert_eq!(out.raw_text.as_deref(), Some("RAW TEXT"));
        assert!(out.success);
    }

    #[test]
    fn test_cache_hit_keeps_raw_text() {
        let cached = ExtractionResult {
            account_number: Some("8001053647".to_string()),
            total_amount: Some(37225.88),
            method: ExtractionMethod::AiPassA,
            ..ExtractionResult::default()
        };
        let out = resolve(&ExtractionResult::default(), None, Some(&cached), "normalized");
        assert_eq!(out.method, ExtractionMethod::Cached);
        assert_eq!(out.raw_text.as_deref(), Some("normalized"));
        assert_eq!(out.confidence, Some(DEFAULT_CONFIDENCE));
        assert!(out.success);
    }

    #[test]
    fn test_success_needs_account_and_usage_or_amount() {
        let only_account = ExtractionResult {
            account_number: Some("8001053647".to_string()),
            ..ExtractionResult::default()
        };
        assert!(!resolve(&only_account, None, None, "").success);

        let no_account = ExtractionResult {
            total_kwh: Some(10.0),
            total_amount: Some(5.0),
            ..ExtractionResult::default()
        };
        assert!(!resolve(&no_account, None, None, "").success);
    }

    #[test]
    fn test_policy_table() {
        assert_eq!(source_order("service_type"), &[Source::Regex]);
        assert_eq!(source_order("total_kwh"), DEFAULT_ORDER);
    }
}
