// src/two_pass.rs
//
// LLM extraction in two passes: a cheap minimal-schema call, and a larger
// call with utility hints only when the first one misses required fields.

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::{CompletionClient, CompletionRequest, extract_json_object};
use crate::model::{
    ExtractionMethod, ExtractionResult, MeterRecord, PassUsed, TouPeriod, TouPeriodName,
    round_cents,
};
use crate::patterns::dates;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

const SYSTEM_PROMPT: &str =
    "You are a utility bill parser. Return only valid JSON, no markdown or explanation.";

/// Placeholder the schema template shows; a reply echoing it found nothing.
const DATE_PLACEHOLDER: &str = "YYYY-MM-DD";

pub const PASS_B_FAILED: &str = "Pass B failed, using Pass A results";

const PASS_A_SCHEMA: &str = r#"{
  "utility_name": "",
  "account_number": "",
  "meter_number": "",
  "billing_period": {"start": "YYYY-MM-DD", "end": "YYYY-MM-DD"},
  "total_kwh": null,
  "total_charges": null,
  "amount_due": null,
  "confidence": 0.0
}"#;

const PASS_B_SCHEMA: &str = r#"{
  "utility_name": "",
  "account_number": "",
  "meter_number": "",
  "service_address": "",
  "rate_schedule": "",
  "billing_period": {"start": "YYYY-MM-DD", "end": "YYYY-MM-DD"},
  "due_date": "",
  "total_kwh": null,
  "total_charges": null,
  "amount_due": null,
  "energy_charges": null,
  "demand_charges": null,
  "kwh_on_peak": null,
  "kwh_mid_peak": null,
  "kwh_off_peak": null,
  "kwh_super_off_peak": null,
  "rate_on_peak": null,
  "rate_mid_peak": null,
  "rate_off_peak": null,
  "rate_super_off_peak": null,
  "max_demand_kw": null,
  "confidence": 0.0,
  "meters": []
}"#;

const UTILITY_HINTS: &str = r#"UTILITY-SPECIFIC EXTRACTION RULES:

For SCE (Southern California Edison) bills:
- utility_name: "Southern California Edison" or "SCE"
- account_number: 10-12 digit number near top
- rate_schedule: SHORT CODE like "TOU-GS-2-E", "TOU-8-B" (5-15 chars max). Look in Electric Charges section. Long text is NOT rate schedule.
- service_address: Complete address with street, city, state, ZIP
- TOU data: kwh_on_peak, kwh_mid_peak, kwh_off_peak, kwh_super_off_peak and rate_* per kWh as decimals (0.25 for $0.25/kWh)

For SDG&E (San Diego Gas & Electric) bills:
- utility_name: "San Diego Gas & Electric" or "SDG&E"
- account_number: Typically 10 digits
- rate_schedule: SHORT CODE like "DR-SES", "AL-TOU", "DG-R", "EV-TOU-5"
- TOU data: kwh_on_peak, kwh_off_peak, kwh_super_off_peak and corresponding rates

For PG&E (Pacific Gas & Electric) bills:
- utility_name: "Pacific Gas & Electric" or "PG&E"
- account_number: 10-12 digits, format XXXX-XXXX-XX
- rate_schedule: SHORT CODE like "E-TOU-C", "A-10", "E-19", "EV2-A"
- TOU data: "Peak"=kwh_on_peak, "Part-Peak"=kwh_mid_peak, "Off-Peak"=kwh_off_peak with rates

For LADWP (Los Angeles Department of Water and Power) bills:
- utility_name: "LADWP" or "Los Angeles Department of Water and Power"
- account_number: Use "ACCOUNT NUMBER" from header (NOT "SA #")
- rate_schedule: SHORT CODE like "R-1B", "A-2", "D-1"
- due_date: often labeled "AUTO PAYMENT" date
- Separate electric charges from water charges (often combined)
- TOU data: "High Peak"=kwh_on_peak, "Low Peak"=kwh_off_peak, "Base"=kwh_super_off_peak with rates

For RPU (Riverside Public Utilities) bills:
- utility_name: "Riverside Public Utilities" or "RPU"
- rate_schedule: SHORT CODE (municipal utility format)

For IID (Imperial Irrigation District) bills:
- utility_name: "Imperial Irrigation District" or "IID"
- rate_schedule: SHORT CODE

For Anaheim Public Utilities bills:
- utility_name: "Anaheim Public Utilities" or "City of Anaheim"
- rate_schedule: SHORT CODE (municipal format)"#;

// ---------------------------------------------------------------------------
// Reply shape
// ---------------------------------------------------------------------------

/// Numbers may come back as `1234.5`, `"1234.5"` or `"$1,234.50"`.
fn loose_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.replace(['$', ',', ' '], "").parse().ok(),
        _ => None,
    })
}

/// Empty strings count as missing; bare numbers (account numbers) are kept.
fn loose_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn loose_period<'de, D: Deserializer<'de>>(d: D) -> Result<Option<BillingPeriod>, D::Error> {
    Ok(Option::<Value>::deserialize(d)?.and_then(|v| serde_json::from_value(v).ok()))
}

fn loose_meters<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<LlmMeter>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect(),
        _ => Vec::new(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BillingPeriod {
    #[serde(deserialize_with = "loose_string")]
    pub start: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub end: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LlmMeter {
    #[serde(deserialize_with = "loose_string")]
    pub meter_number: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub service_address: Option<String>,
    #[serde(deserialize_with = "loose_f64")]
    pub kwh: Option<f64>,
    #[serde(deserialize_with = "loose_f64")]
    pub total_charge: Option<f64>,
}

/// Union of the Pass A and Pass B schemas.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LlmBill {
    #[serde(deserialize_with = "loose_string")]
    pub utility_name: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub account_number: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub meter_number: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub service_address: Option<String>,
    #[serde(deserialize_with = "loose_string")]
    pub rate_schedule: Option<String>,
    #[serde(deserialize_with = "loose_period")]
    pub billing_period: Option<BillingPeriod>,
    #[serde(deserialize_with = "loose_string")]
    pub due_date: Option<String>,
    #[serde(deserialize_with = "loose_f64")]
    pub total_kwh: Option<f64>,
    #[serde(deserialize_with = "loose_f64")]
    pub total_charges: Option<f64>,
    #[serde(deserialize_with = "loose_f64")]
    pub amount_due: Option<f64>,
    #[serde(deserialize_with = "loose_f64")]
    pub energy_charges: Option<f64>,
    #[serde(deserialize_with = "loose_f64")]
    pub demand_charges: Option<f64>,
    #[serde(deserialize_with = "loose_f64")]
    pub kwh_on_peak: Option<f64>,
    #[serde(deserialize_with = "loose_f64")]
    pub kwh_mid_peak: Option<f64>,
    #[serde(deserialize_with = "loose_f64")]
    pub kwh_off_peak: Option<f64>,
    #[serde(deserialize_with = "loose_f64")]
    pub kwh_super_off_peak: Option<f64>,
    #[serde(deserialize_with = "loose_f64")]
    pub rate_on_peak: Option<f64>,
    #[serde(deserialize_with = "loose_f64")]
    pub rate_mid_peak: Option<f64>,
    #[serde(deserialize_with = "loose_f64")]
    pub rate_off_peak: Option<f64>,
    #[serde(deserialize_with = "loose_f64")]
    pub rate_super_off_peak: Option<f64>,
    #[serde(deserialize_with = "loose_f64")]
    pub max_demand_kw: Option<f64>,
    #[serde(deserialize_with = "loose_f64")]
    pub confidence: Option<f64>,
    #[serde(deserialize_with = "loose_meters")]
    pub meters: Vec<LlmMeter>,
}

impl LlmBill {
    pub fn parse(content: &str) -> Result<Self, LlmError> {
        let json = extract_json_object(content)?;
        serde_json::from_str(json).map_err(|e| LlmError::Parse(e.to_string()))
    }

    fn period_bound(&self, pick: impl Fn(&BillingPeriod) -> Option<&String>) -> Option<&str> {
        self.billing_period
            .as_ref()
            .and_then(pick)
            .map(String::as_str)
            .filter(|d| *d != DATE_PLACEHOLDER)
    }

    pub fn period_start(&self) -> Option<&str> {
        self.period_bound(|p| p.start.as_ref())
    }

    pub fn period_end(&self) -> Option<&str> {
        self.period_bound(|p| p.end.as_ref())
    }

    pub fn charges(&self) -> Option<f64> {
        self.total_charges.or(self.amount_due)
    }

    /// Account, a real period, kWh and a charges figure.
    pub fn has_required_fields(&self) -> bool {
        self.account_number.is_some()
            && self.period_start().is_some()
            && self.period_end().is_some()
            && self.total_kwh.is_some()
            && self.charges().is_some()
    }

    /// Pass B's present fields win; a non-empty meters array replaces Pass A's.
    pub fn merge(a: LlmBill, b: LlmBill) -> LlmBill {
        let period = match (a.billing_period, b.billing_period) {
            (Some(pa), Some(pb)) => Some(BillingPeriod {
                start: pb.start.filter(|s| s != DATE_PLACEHOLDER).or(pa.start),
                end: pb.end.filter(|s| s != DATE_PLACEHOLDER).or(pa.end),
            }),
            (pa, pb) => pb.or(pa),
        };
        LlmBill {
            utility_name: b.utility_name.or(a.utility_name),
            account_number: b.account_number.or(a.account_number),
            meter_number: b.meter_number.or(a.meter_number),
            service_address: b.service_address.or(a.service_address),
            rate_schedule: b.rate_schedule.or(a.rate_schedule),
            billing_period: period,
            due_date: b.due_date.or(a.due_date),
            total_kwh: b.total_kwh.or(a.total_kwh),
            total_charges: b.total_charges.or(a.total_charges),
            amount_due: b.amount_due.or(a.amount_due),
            energy_charges: b.energy_charges.or(a.energy_charges),
            demand_charges: b.demand_charges.or(a.demand_charges),
            kwh_on_peak: b.kwh_on_peak.or(a.kwh_on_peak),
            kwh_mid_peak: b.kwh_mid_peak.or(a.kwh_mid_peak),
            kwh_off_peak: b.kwh_off_peak.or(a.kwh_off_peak),
            kwh_super_off_peak: b.kwh_super_off_peak.or(a.kwh_super_off_peak),
            rate_on_peak: b.rate_on_peak.or(a.rate_on_peak),
            rate_mid_peak: b.rate_mid_peak.or(a.rate_mid_peak),
            rate_off_peak: b.rate_off_peak.or(a.rate_off_peak),
            rate_super_off_peak: b.rate_super_off_peak.or(a.rate_super_off_peak),
            max_demand_kw: b.max_demand_kw.or(a.max_demand_kw),
            confidence: b.confidence.or(a.confidence),
            meters: if b.meters.is_empty() { a.meters } else { b.meters },
        }
    }

    /// Reshape into the common result type.
    pub fn into_result(self, method: ExtractionMethod) -> ExtractionResult {
        let billing_period_start = self.period_start().and_then(dates::to_iso);
        let billing_period_end = self.period_end().and_then(dates::to_iso);
        let total_amount = self.charges();

        let tou_breakdown = [
            (TouPeriodName::OnPeak, self.kwh_on_peak, self.rate_on_peak),
            (TouPeriodName::MidPeak, self.kwh_mid_peak, self.rate_mid_peak),
            (TouPeriodName::OffPeak, self.kwh_off_peak, self.rate_off_peak),
            (TouPeriodName::SuperOffPeak, self.kwh_super_off_peak, self.rate_super_off_peak),
        ]
        .into_iter()
        .filter_map(|(period, kwh, rate)| {
            let kwh = kwh?;
            Some(TouPeriod {
                period,
                kwh,
                rate,
                cost: rate.map(|r| round_cents(kwh * r)),
            })
        })
        .collect();

        let meters = if !self.meters.is_empty() {
            self.meters
                .into_iter()
                .map(|m| MeterRecord {
                    meter_number: m.meter_number,
                    service_address: m.service_address,
                    kwh: m.kwh,
                    total_charge: m.total_charge,
                })
                .collect()
        } else if self.meter_number.is_some() {
            vec![MeterRecord {
                meter_number: self.meter_number.clone(),
                service_address: self.service_address.clone(),
                kwh: self.total_kwh,
                total_charge: total_amount,
            }]
        } else {
            Vec::new()
        };

        ExtractionResult {
            success: true,
            utility_name: self.utility_name,
            account_number: self.account_number,
            meter_number: self.meter_number,
            service_address: self.service_address,
            rate_schedule: self.rate_schedule,
            billing_period_start,
            billing_period_end,
            due_date: self.due_date.as_deref().and_then(dates::to_iso),
            total_kwh: self.total_kwh,
            total_amount,
            energy_charges: self.energy_charges,
            demand_charges: self.demand_charges,
            max_demand_kw: self.max_demand_kw,
            tou_breakdown,
            meters,
            confidence: Some(self.confidence.unwrap_or(0.5)),
            method,
            ..ExtractionResult::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Tagged result of a two-pass run.
#[derive(Debug, Clone)]
pub struct TwoPassOutcome {
    pub data: Option<ExtractionResult>,
    pub pass_used: PassUsed,
    pub error: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub duration_ms: f64,
}

impl TwoPassOutcome {
    pub fn succeeded(&self) -> bool {
        self.data.is_some()
    }
}

enum Step {
    PassA,
    Evaluate(LlmBill),
    PassB(LlmBill),
    Merge(LlmBill, LlmBill),
    Done {
        data: Option<LlmBill>,
        pass_used: PassUsed,
        error: Option<String>,
    },
}

pub struct TwoPassExtractor {
    client: Arc<dyn CompletionClient>,
    config: LlmConfig,
}

impl TwoPassExtractor {
    pub fn new(client: Arc<dyn CompletionClient>, config: LlmConfig) -> Self {
        Self { client, config }
    }

    pub async fn extract(&self, cleaned_text: &str, evidence_lines: &[String]) -> TwoPassOutcome {
        self.extract_reporting(cleaned_text, evidence_lines, || {}).await
    }

    /// Like `extract`, calling `on_pass_b` just before the second request.
    pub async fn extract_reporting<F>(
        &self,
        cleaned_text: &str,
        evidence_lines: &[String],
        on_pass_b: F,
    ) -> TwoPassOutcome
    where
        F: Fn() + Send + Sync,
    {
        let started = Instant::now();
        let mut tokens = (0u64, 0u64);
        let mut step = Step::PassA;

        let (data, pass_used, error) = loop {
            step = match step {
                Step::PassA => match self.call(self.pass_a_request(cleaned_text), &mut tokens).await {
                    Ok(bill) => Step::Evaluate(bill),
                    Err(e) => {
                        warn!(error = %e, "Pass A failed");
                        Step::Done {
                            data: None,
                            pass_used: PassUsed::PassA,
                            error: Some(e.to_string()),
                        }
                    }
                },
                Step::Evaluate(a) if a.has_required_fields() => {
                    info!("Pass A sufficient, skipping Pass B");
                    Step::Done {
                        data: Some(a),
                        pass_used: PassUsed::PassA,
                        error: None,
                    }
                }
                Step::Evaluate(a) => {
                    info!("Pass A incomplete, running Pass B");
                    on_pass_b();
                    Step::PassB(a)
                }
                Step::PassB(a) => {
                    let request = self.pass_b_request(cleaned_text, evidence_lines);
                    match self.call(request, &mut tokens).await {
                        Ok(b) => Step::Merge(a, b),
                        Err(e) => {
                            warn!(error = %e, "Pass B failed, keeping Pass A");
                            Step::Done {
                                data: Some(a),
                                pass_used: PassUsed::PassA,
                                error: Some(PASS_B_FAILED.to_string()),
                            }
                        }
                    }
                }
                Step::Merge(a, b) => Step::Done {
                    data: Some(LlmBill::merge(a, b)),
                    pass_used: PassUsed::PassAB,
                    error: None,
                },
                Step::Done {
                    data,
                    pass_used,
                    error,
                } => break (data, pass_used, error),
            };
        };

        let method = match pass_used {
            PassUsed::PassAB => ExtractionMethod::AiPassAB,
            _ => ExtractionMethod::AiPassA,
        };
        let outcome = TwoPassOutcome {
            data: data.map(|bill| bill.into_result(method)),
            pass_used,
            error,
            tokens_in: tokens.0,
            tokens_out: tokens.1,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        info!(
            pass = pass_used.as_str(),
            success = outcome.succeeded(),
            tokens_in = outcome.tokens_in,
            tokens_out = outcome.tokens_out,
            "two-pass extraction finished"
        );
        outcome
    }

    async fn call(&self, request: CompletionRequest, tokens: &mut (u64, u64)) -> Result<LlmBill, LlmError> {
        let completion = self.client.complete(request).await?;
        tokens.0 += completion.tokens_in;
        tokens.1 += completion.tokens_out;
        LlmBill::parse(&completion.content)
    }

    fn pass_a_request(&self, text: &str) -> CompletionRequest {
        let text: String = text.chars().take(self.config.pass_a_max_chars).collect();
        let prompt = format!(
            "Extract utility bill data from this text. Return ONLY valid JSON, no explanation.\n\n\
             Use this exact schema:\n{PASS_A_SCHEMA}\n\n\
             Rules:\n\
             - Use null for values you cannot find\n\
             - Dates must be YYYY-MM-DD format\n\
             - Numbers should be numeric values (no $ or commas)\n\
             - confidence: 0.0-1.0 based on how certain you are\n\n\
             TEXT TO ANALYZE:\n{text}\n\nJSON:"
        );
        CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt,
            max_tokens: self.config.pass_a_max_tokens,
        }
    }

    fn pass_b_request(&self, text: &str, evidence_lines: &[String]) -> CompletionRequest {
        let text: String = text.chars().take(self.config.pass_b_max_chars).collect();
        let evidence = if evidence_lines.is_empty() {
            String::new()
        } else {
            let lines: Vec<&str> = evidence_lines
                .iter()
                .take(self.config.max_evidence_lines)
                .map(String::as_str)
                .collect();
            format!("\n\nKEY EVIDENCE LINES:\n{}", lines.join("\n"))
        };
        let prompt = format!(
            "Extract detailed utility bill data from this text. Return ONLY valid JSON, no explanation.\n\n\
             Use this exact schema:\n{PASS_B_SCHEMA}\n\n\
             Rules:\n\
             - Use null for values you cannot find\n\
             - Dates must be YYYY-MM-DD format\n\
             - Numbers should be numeric values (no $ or commas)\n\
             - For meters array: include meter_number, service_address, kwh, and total_charge per meter\n\
             - confidence: 0.0-1.0 based on extraction certainty\n\n\
             {UTILITY_HINTS}{evidence}\n\n\
             FULL TEXT:\n{text}\n\nJSON:"
        );
        CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt,
            max_tokens: self.config.pass_b_max_tokens,
        }
    }
}
