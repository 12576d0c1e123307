// src/reconcile.rs
//
// Writes an extraction into accounts -> meters -> bills -> TOU rows.
//
// Accounts and meters are matched before they are created: exact canonical
// key first, then a character-similarity check to absorb single-character
// OCR errors. Concurrent jobs can still race past the lookup, so
// `merge_duplicates` folds duplicates together after the fact.

use crate::error::StoreError;
use crate::model::{ExtractionResult, MeterRecord, ReviewStatus, round_cents};
use crate::patterns::{dates, rules};
use crate::store::Store;
use crate::store::files;
use crate::store::records::{self, MeterRow, NewBill};
use rusqlite::Connection;
use std::collections::HashMap;
use tracing::{debug, info};

pub const SIMILARITY_THRESHOLD: f64 = 0.9;
pub const UNKNOWN: &str = "Unknown";
pub const PRIMARY_METER: &str = "Primary";

const MAX_RATE_LEN: usize = 25;
const MIN_ADDRESS_LEN: usize = 20;

/// Lower-case aliases and the canonical name they map to. Single-token
/// aliases must match exactly; multi-word ones may appear anywhere.
const UTILITY_ALIASES: &[(&[&str], &str)] = &[
    (&["sce", "southern california edison"], "Southern California Edison"),
    (&["sdg&e", "sdge", "san diego gas"], "San Diego Gas & Electric"),
    (&["ladwp", "los angeles department of water", "los angeles dept of water"], "LADWP"),
    (&["pg&e", "pge", "pacific gas"], "Pacific Gas & Electric"),
];

const RATE_BOILERPLATE: &[&str] = &[
    "contact",
    "commission",
    "safety",
    "disconnected",
    "for more information",
    "please",
    "may",
    "ensure",
    "service is",
    "you may",
    "reasons",
    "public utilities",
];

const NO_DUE_DATE: &[&str] = &["N/A", "NA", "NONE"];

// ---------------------------------------------------------------------------
// Canonical forms and similarity
// ---------------------------------------------------------------------------

pub fn canonical_utility(name: Option<&str>) -> String {
    let name = name.map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return UNKNOWN.to_string();
    }
    let lower = name.to_lowercase();
    UTILITY_ALIASES
        .iter()
        .find(|(aliases, _)| {
            aliases
                .iter()
                .any(|a| lower == *a || (a.contains(' ') && lower.contains(a)))
        })
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or_else(|| name.to_string())
}

/// Digits only, or `Unknown` when there are none.
pub fn canonical_account(raw: Option<&str>) -> String {
    let digits: String = raw
        .unwrap_or_default()
        .chars()
        .filter(char::is_ascii_digit)
        .collect();
    if digits.is_empty() { UNKNOWN.to_string() } else { digits }
}

/// Comparison key for a meter number. OCR tends to swap letters and digits
/// inside meter ids, so only the digits are compared.
pub fn meter_key(display: &str) -> String {
    let digits: String = display.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        display.trim().to_uppercase()
    } else {
        digits
    }
}

fn positional_ratio(a: &str, b: &str) -> f64 {
    let len = a.chars().count();
    if len == 0 {
        return 0.0;
    }
    let same = a.chars().zip(b.chars()).filter(|(x, y)| x == y).count();
    same as f64 / len as f64
}

/// Equal length: positional match ratio. Length off by one: shared characters
/// over the longer length. Anything else: 0.
pub fn account_similarity(a: &str, b: &str) -> f64 {
    if a == UNKNOWN || b == UNKNOWN {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let (la, lb) = (a.chars().count(), b.chars().count());
    if la == lb {
        return positional_ratio(a, b);
    }
    if la.abs_diff(lb) != 1 {
        return 0.0;
    }
    let mut pool: HashMap<char, usize> = HashMap::new();
    for ch in a.chars() {
        *pool.entry(ch).or_default() += 1;
    }
    let mut shared = 0usize;
    for ch in b.chars() {
        if let Some(n) = pool.get_mut(&ch).filter(|n| **n > 0) {
            *n -= 1;
            shared += 1;
        }
    }
    shared as f64 / la.max(lb) as f64
}

/// Positional ratio for equal-length keys; different lengths never match.
pub fn meter_similarity(a: &str, b: &str) -> f64 {
    if a == UNKNOWN || b == UNKNOWN {
        return 0.0;
    }
    if a.chars().count() != b.chars().count() {
        return 0.0;
    }
    positional_ratio(a, b)
}

// ---------------------------------------------------------------------------
// Field cleanup
// ---------------------------------------------------------------------------

fn clean_rate(rate: Option<&str>, raw: &str) -> Option<String> {
    let rate = rate.map(str::trim).filter(|r| !r.is_empty());
    match rate {
        Some(r) if r.len() <= MAX_RATE_LEN && !is_rate_boilerplate(r) => Some(r.to_string()),
        _ => rules::fallback_rate_schedule(raw),
    }
}

fn is_rate_boilerplate(rate: &str) -> bool {
    let lower = rate.to_lowercase();
    RATE_BOILERPLATE.iter().any(|p| lower.contains(p))
}

fn clean_address(address: Option<&str>, raw: &str) -> Option<String> {
    let address = address.map(str::trim).filter(|a| !a.is_empty());
    match address {
        Some(a) if a.len() >= MIN_ADDRESS_LEN => Some(a.to_string()),
        short => rules::fallback_service_address(raw).or_else(|| short.map(str::to_string)),
    }
}

fn clean_due_date(due: Option<&str>, raw: &str) -> Option<String> {
    due.map(str::trim)
        .filter(|d| !d.is_empty() && !NO_DUE_DATE.iter().any(|n| d.eq_ignore_ascii_case(n)))
        .map(str::to_string)
        .or_else(|| rules::fallback_due_date(raw))
}

/// Derived triage state and the fields that drove it.
pub fn review_status(
    result: &ExtractionResult,
    service_address: Option<&str>,
    rate_schedule: Option<&str>,
) -> (ReviewStatus, Vec<String>) {
    if !result.service_type.is_electric() {
        return (ReviewStatus::Skipped, Vec::new());
    }
    let mut critical = Vec::new();
    if result.total_kwh.is_none() {
        critical.push("total_kwh".to_string());
    }
    if result.total_amount.is_none() {
        critical.push("total_amount".to_string());
    }
    if !result.has_period() {
        critical.push("billing_period".to_string());
    }
    let mut optional = Vec::new();
    if service_address.is_none() {
        optional.push("service_address".to_string());
    }
    if rate_schedule.is_none() {
        optional.push("rate_schedule".to_string());
    }

    let status = if !critical.is_empty() {
        ReviewStatus::NeedsReview
    } else if !optional.is_empty() {
        ReviewStatus::Ok
    } else {
        ReviewStatus::Complete
    };
    critical.extend(optional);
    (status, critical)
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub account_id: i64,
    pub bills_deleted: usize,
    pub bill_ids: Vec<i64>,
    pub meters_created: usize,
    pub review_status: ReviewStatus,
    pub missing_fields: Vec<String>,
}

/// Replace every bill written from `file_id` with the ones in `result`.
/// Runs in one transaction; any failure leaves the store untouched.
pub fn reconcile_file(
    store: &Store,
    project_id: &str,
    file_id: i64,
    result: &ExtractionResult,
) -> Result<ReconcileOutcome, StoreError> {
    store.with_transaction(|tx| write_file(tx, project_id, file_id, result))
}

fn write_file(
    conn: &Connection,
    project_id: &str,
    file_id: i64,
    result: &ExtractionResult,
) -> Result<ReconcileOutcome, StoreError> {
    let bills_deleted = records::delete_bills_for_file(conn, file_id)?;
    if bills_deleted > 0 {
        debug!(file_id, bills_deleted, "Removed previous bills for file");
    }

    let raw = result.raw_text.as_deref().unwrap_or_default();
    let utility = canonical_utility(result.utility_name.as_deref());
    let account = canonical_account(
        result
            .account_number
            .as_deref()
            .or(result.service_account.as_deref())
            .or(result.customer_account.as_deref()),
    );
    let account_id = upsert_account(conn, project_id, &utility, &account)?;

    let rate_schedule = clean_rate(result.rate_schedule.as_deref(), raw);
    let bill_address = clean_address(result.service_address.as_deref(), raw);
    let due_date = clean_due_date(result.due_date.as_deref(), raw);
    let days = match (&result.billing_period_start, &result.billing_period_end) {
        (Some(s), Some(e)) => dates::days_inclusive(s, e),
        _ => None,
    };

    let meters: Vec<MeterRecord> = if result.meters.is_empty() {
        vec![MeterRecord {
            meter_number: result.meter_number.clone(),
            service_address: result.service_address.clone(),
            kwh: None,
            total_charge: None,
        }]
    } else {
        result.meters.clone()
    };
    let single = meters.len() == 1;

    let mut bill_ids = Vec::new();
    let mut meters_created = 0;
    for m in &meters {
        let kwh = m.kwh.or(if single { result.total_kwh } else { None });
        let amount = m.total_charge.or(if single { result.total_amount } else { None });
        let has_signal = if single {
            result.has_signal() || kwh.is_some() || amount.is_some()
        } else {
            amount.is_some() || kwh.is_some_and(|k| k > 0.0)
        };
        let meter_display = m
            .meter_number
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(PRIMARY_METER);
        if !has_signal {
            debug!(file_id, meter = meter_display, "Skipping meter without usable data");
            continue;
        }

        let address = match m.service_address.as_deref() {
            Some(a) => clean_address(Some(a), raw),
            None => bill_address.clone(),
        };
        let (meter, created) = resolve_meter(conn, project_id, account_id, meter_display, address.as_deref())?;
        if created {
            meters_created += 1;
        } else if let Some(a) = address.as_deref() {
            records::backfill_meter_address(conn, meter.id, a)?;
        }

        let blended_rate = match (amount, kwh) {
            (Some(a), Some(k)) if k > 0.0 => Some(a / k),
            _ => None,
        };
        let avg_cost_per_day = match (amount, days) {
            (Some(a), Some(d)) => Some(round_cents(a / d as f64)),
            _ => None,
        };

        let bill_id = records::insert_bill(
            conn,
            &NewBill {
                bill_file_id: file_id,
                account_id: meter.account_id,
                meter_id: meter.id,
                utility_name: utility.clone(),
                service_type: result.service_type.as_str().to_string(),
                service_address: address,
                rate_schedule: rate_schedule.clone(),
                period_start: result.billing_period_start.clone(),
                period_end: result.billing_period_end.clone(),
                days_in_period: days,
                due_date: due_date.clone(),
                total_kwh: kwh,
                total_amount_due: amount,
                energy_charges: result.energy_charges,
                demand_charges: result.demand_charges,
                max_demand_kw: result.max_demand_kw,
                blended_rate,
                avg_cost_per_day,
            },
        )?;
        // the statement's TOU table belongs to the first bill written
        if bill_ids.is_empty() {
            for tou in &result.tou_breakdown {
                records::insert_tou_period(conn, bill_id, tou)?;
            }
        }
        bill_ids.push(bill_id);
    }

    let (review, missing_fields) =
        review_status(result, bill_address.as_deref(), rate_schedule.as_deref());
    files::set_review(conn, file_id, review, &missing_fields)?;
    let removed = records::delete_empty_accounts(conn, project_id)?;

    info!(
        file_id,
        project_id,
        bills = bill_ids.len(),
        bills_deleted,
        meters_created,
        empty_accounts_removed = removed,
        review = review.as_str(),
        "Reconciled extraction"
    );
    Ok(ReconcileOutcome {
        account_id,
        bills_deleted,
        bill_ids,
        meters_created,
        review_status: review,
        missing_fields,
    })
}

fn upsert_account(
    conn: &Connection,
    project_id: &str,
    utility: &str,
    account: &str,
) -> Result<i64, StoreError> {
    if let Some(id) = records::find_account(conn, project_id, utility, account)? {
        return Ok(id);
    }
    if let Some(existing) = records::accounts_for_utility(conn, project_id, utility)?
        .into_iter()
        .find(|a| account_similarity(&a.account_number, account) >= SIMILARITY_THRESHOLD)
    {
        debug!(
            existing = %existing.account_number,
            incoming = account,
            "Fuzzy-matched account"
        );
        return Ok(existing.id);
    }
    records::insert_account(conn, project_id, utility, account)
}

/// Project-wide key lookup first, so a meter never gains a second account;
/// then exact or fuzzy match among the account's own meters.
fn resolve_meter(
    conn: &Connection,
    project_id: &str,
    account_id: i64,
    display: &str,
    address: Option<&str>,
) -> Result<(MeterRow, bool), StoreError> {
    let key = meter_key(display);
    let is_primary = display == PRIMARY_METER;

    if !is_primary {
        if let Some(m) = records::find_meter_in_project(conn, project_id, &key)? {
            return Ok((m, false));
        }
    }
    let sibling = records::meters_for_account(conn, account_id)?
        .into_iter()
        .find(|m| {
            m.meter_key == key
                || (!is_primary && meter_similarity(&m.meter_key, &key) >= SIMILARITY_THRESHOLD)
        });
    if let Some(m) = sibling {
        return Ok((m, false));
    }

    let id = records::insert_meter(conn, account_id, display, &key, address)?;
    Ok((
        MeterRow {
            id,
            account_id,
            meter_number: display.to_string(),
            meter_key: key,
            service_address: address.map(str::to_string),
        },
        true,
    ))
}

// ---------------------------------------------------------------------------
// Duplicate merge pass
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub accounts_merged: usize,
    pub meters_merged: usize,
    pub empty_accounts_removed: usize,
}

/// Fold together accounts with the same canonical key and meters that share
/// a key across accounts. Safe to run any number of times.
pub fn merge_duplicates(store: &Store, project_id: &str) -> Result<MergeReport, StoreError> {
    store.with_transaction(|tx| {
        let mut report = MergeReport::default();

        let mut account_keepers: HashMap<(String, String), i64> = HashMap::new();
        for acct in records::accounts_for_project(tx, project_id)? {
            let key = (
                canonical_utility(Some(&acct.utility_name)),
                canonical_account(Some(&acct.account_number)),
            );
            match account_keepers.get(&key) {
                Some(&keep) => {
                    records::merge_account_into(tx, acct.id, keep)?;
                    report.accounts_merged += 1;
                }
                None => {
                    account_keepers.insert(key, acct.id);
                }
            }
        }

        // `Primary` placeholders are per account, never project-wide
        let primary_key = meter_key(PRIMARY_METER);
        let mut meter_keepers: HashMap<(String, Option<i64>), MeterRow> = HashMap::new();
        for meter in records::meters_for_project(tx, project_id)? {
            let scope = (meter.meter_key == primary_key).then_some(meter.account_id);
            let key = (meter.meter_key.clone(), scope);
            match meter_keepers.get(&key) {
                Some(keep) => {
                    records::merge_meter_into(tx, meter.id, keep)?;
                    report.meters_merged += 1;
                }
                None => {
                    meter_keepers.insert(key, meter);
                }
            }
        }

        report.empty_accounts_removed = records::delete_empty_accounts(tx, project_id)?;
        if report != MergeReport::default() {
            info!(
                project_id,
                accounts_merged = report.accounts_merged,
                meters_merged = report.meters_merged,
                empty_accounts_removed = report.empty_accounts_removed,
                "Merged duplicate accounts and meters"
            );
        }
        Ok(report)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServiceType, TouPeriod, TouPeriodName};
    use crate::store::records::BillRow;

    fn new_file(store: &Store) -> i64 {
        store
            .with_conn(|conn| files::register_file(conn, "proj", "bill.pdf", "/bills/bill.pdf", 100))
            .unwrap()
    }

    fn sce_result() -> ExtractionResult {
        ExtractionResult {
            success: true,
            utility_name: Some("SCE".to_string()),
            account_number: Some("8001053647".to_string()),
            meter_number: Some("V349N-002081".to_string()),
            service_address: Some("1234 MAIN ST RIVERSIDE CA 92501".to_string()),
            rate_schedule: Some("TOU-GS-2-E".to_string()),
            billing_period_start: Some("2025-07-21".to_string()),
            billing_period_end: Some("2025-08-18".to_string()),
            total_kwh: Some(160474.0),
            total_amount: Some(37225.88),
            ..ExtractionResult::default()
        }
    }

    fn without_ids(rows: Vec<BillRow>) -> Vec<BillRow> {
        rows.into_iter().map(|b| BillRow { id: 0, ..b }).collect()
    }

    #[test]
    fn test_canonical_forms() {
        assert_eq!(canonical_utility(Some("SCE")), "Southern California Edison");
        assert_eq!(canonical_utility(Some("San Diego Gas & Electric Co")), "San Diego Gas & Electric");
        assert_eq!(
            canonical_utility(Some("Los Angeles Department of Water and Power")),
            "LADWP"
        );
        assert_eq!(canonical_utility(Some("PGE")), "Pacific Gas & Electric");
        assert_eq!(canonical_utility(Some("Riverside Public Utilities")), "Riverside Public Utilities");
        assert_eq!(canonical_utility(Some("  ")), UNKNOWN);
        assert_eq!(canonical_account(Some("8001-0536-47")), "8001053647");
        assert_eq!(canonical_account(None), UNKNOWN);
        assert_eq!(meter_key("V349N-002081"), "349002081");
        assert_eq!(meter_key("primary"), "PRIMARY");
    }

    #[test]
    fn test_similarity() {
        assert_eq!(account_similarity("123456789", "1234567890"), 0.9);
        assert_eq!(account_similarity("1234567890", "1234567891"), 0.9);
        assert_eq!(account_similarity("123", "12345"), 0.0);
        assert_eq!(account_similarity(UNKNOWN, UNKNOWN), 0.0);
        assert_eq!(meter_similarity("0022200027735", "0022200027736"), 12.0 / 13.0);
        assert_eq!(meter_similarity("349002081", "34900208"), 0.0);
    }

    #[test]
    fn test_ocr_variant_reuses_existing_meter() {
        let store = Store::open_in_memory().unwrap();
        let file = new_file(&store);
        let existing = store
            .with_conn(|conn| {
                let acct = records::insert_account(conn, "proj", "Southern California Edison", "8001053647")?;
                records::insert_meter(conn, acct, "349002081", "349002081", None)
            })
            .unwrap();

        let out = reconcile_file(&store, "proj", file, &sce_result()).unwrap();
        assert_eq!(out.meters_created, 0);
        assert_eq!(out.review_status, ReviewStatus::Complete);

        store
            .with_conn(|conn| {
                assert_eq!(records::meters_for_project(conn, "proj")?.len(), 1);
                let bills = records::bills_for_file(conn, file)?;
                assert_eq!(bills.len(), 1);
                assert_eq!(bills[0].meter_id, existing);
                assert_eq!(bills[0].days_in_period, Some(29));
                assert_eq!(bills[0].avg_cost_per_day, Some(1283.65));
                let meter = &records::meters_for_project(conn, "proj")?[0];
                assert_eq!(meter.service_address.as_deref(), Some("1234 MAIN ST RIVERSIDE CA 92501"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_reprocessing_replaces_bills() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO bill_files (id, project_id, filename, file_path) VALUES (42, 'proj', 'multi.pdf', '/multi.pdf')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let meter = |n: &str, kwh: f64| MeterRecord {
            meter_number: Some(n.to_string()),
            kwh: Some(kwh),
            total_charge: Some(kwh * 0.2),
            ..MeterRecord::default()
        };
        let first = ExtractionResult {
            meters: vec![meter("1000001", 100.0), meter("1000002", 200.0), meter("1000003", 300.0)],
            ..sce_result()
        };
        assert_eq!(reconcile_file(&store, "proj", 42, &first).unwrap().bill_ids.len(), 3);

        let second = ExtractionResult {
            meters: vec![meter("1000001", 150.0), MeterRecord::default()],
            ..sce_result()
        };
        let out = reconcile_file(&store, "proj", 42, &second).unwrap();
        assert_eq!(out.bills_deleted, 3);

        let bills = store.with_conn(|conn| records::bills_for_file(conn, 42)).unwrap();
        assert_eq!(bills.len(), 1);
        assert_eq!(bills[0].total_kwh, Some(150.0));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let file = new_file(&store);
        let result = ExtractionResult {
            tou_breakdown: vec![TouPeriod {
                period: TouPeriodName::OffPeak,
                kwh: 4200.0,
                rate: Some(0.18),
                cost: None,
            }],
            ..sce_result()
        };

        reconcile_file(&store, "proj", file, &result).unwrap();
        let first = store.with_conn(|conn| records::bills_for_file(conn, file)).unwrap();
        let out = reconcile_file(&store, "proj", file, &result).unwrap();
        let second = store.with_conn(|conn| records::bills_for_file(conn, file)).unwrap();

        assert_eq!(without_ids(first), without_ids(second));
        let tou = store
            .with_conn(|conn| records::tou_for_bill(conn, out.bill_ids[0]))
            .unwrap();
        assert_eq!(tou.len(), 1);
        assert_eq!(tou[0].est_cost, Some(756.0));
        let accounts = store.with_conn(|conn| records::accounts_for_project(conn, "proj")).unwrap();
        assert_eq!(accounts.len(), 1);
    }

    #[test]
    fn test_fuzzy_account_match() {
        let store = Store::open_in_memory().unwrap();
        let a = reconcile_file(&store, "proj", new_file(&store), &sce_result()).unwrap();
        let typo = ExtractionResult {
            account_number: Some("8001053641".to_string()),
            meter_number: Some("555123".to_string()),
            ..sce_result()
        };
        let b = reconcile_file(&store, "proj", new_file(&store), &typo).unwrap();
        assert_eq!(a.account_id, b.account_id);
    }

    #[test]
    fn test_rejected_fields_fall_back_to_raw_text() {
        let store = Store::open_in_memory().unwrap();
        let file = new_file(&store);
        let result = ExtractionResult {
            rate_schedule: Some("Please contact us for more information".to_string()),
            service_address: Some("123 MAIN".to_string()),
            due_date: Some("N/A".to_string()),
            raw_text: Some(
                "Rate Schedule: TOU-GS-2\nSERVICE ADDRESS: 1234 MAIN ST LOS ANGELES CA 90012\nDue Date: 12/04/2024\n"
                    .to_string(),
            ),
            ..sce_result()
        };
        reconcile_file(&store, "proj", file, &result).unwrap();
        let bill = store
            .with_conn(|conn| records::bills_for_file(conn, file))
            .unwrap()
            .remove(0);
        assert_eq!(bill.rate_schedule.as_deref(), Some("TOU-GS-2"));
        assert_eq!(bill.service_address.as_deref(), Some("1234 MAIN ST LOS ANGELES CA 90012"));
        assert_eq!(bill.due_date.as_deref(), Some("2024-12-04"));
    }

    #[test]
    fn test_review_status_levels() {
        let water = ExtractionResult {
            service_type: ServiceType::Water,
            ..ExtractionResult::default()
        };
        assert_eq!(review_status(&water, None, None).0, ReviewStatus::Skipped);

        let (status, missing) = review_status(&sce_result(), None, Some("TOU-8"));
        assert_eq!(status, ReviewStatus::Ok);
        assert_eq!(missing, vec!["service_address"]);

        let partial = ExtractionResult {
            total_kwh: None,
            billing_period_end: None,
            ..sce_result()
        };
        let (status, missing) = review_status(&partial, Some("x"), Some("y"));
        assert_eq!(status, ReviewStatus::NeedsReview);
        assert_eq!(missing, vec!["total_kwh", "billing_period"]);
    }

    #[test]
    fn test_merge_pass_folds_race_duplicates() {
        let store = Store::open_in_memory().unwrap();
        let file = new_file(&store);
        store
            .with_conn(|conn| {
                let a1 = records::insert_account(conn, "proj", "LADWP", "123456789")?;
                let a2 = records::insert_account(conn, "proj", "LADWP", "123456789")?;
                let a3 = records::insert_account(conn, "proj", "LADWP", "555000111")?;
                let m1 = records::insert_meter(conn, a1, "APM-00027735", "00027735", None)?;
                records::insert_meter(conn, a2, "APMX-00027735", "00027735", None)?;
                let m3 = records::insert_meter(conn, a3, "00027735", "00027735", None)?;
                records::insert_meter(conn, a3, PRIMARY_METER, "PRIMARY", None)?;
                records::insert_meter(conn, a2, PRIMARY_METER, "PRIMARY", None)?;
                records::insert_bill(
                    conn,
                    &NewBill {
                        bill_file_id: file,
                        account_id: a3,
                        meter_id: m3,
                        ..NewBill::default()
                    },
                )?;
                assert!(m1 < m3);
                Ok(())
            })
            .unwrap();

        let report = merge_duplicates(&store, "proj").unwrap();
        assert_eq!(report.accounts_merged, 1);
        assert_eq!(report.meters_merged, 2);

        store
            .with_conn(|conn| {
                let meters = records::meters_for_project(conn, "proj")?;
                let real: Vec<_> = meters.iter().filter(|m| m.meter_key == "00027735").collect();
                assert_eq!(real.len(), 1);
                // both Primary placeholders survive under their own accounts
                assert_eq!(meters.iter().filter(|m| m.meter_key == "PRIMARY").count(), 2);
                let bills = records::bills_for_meter(conn, real[0].id)?;
                assert_eq!(bills[0].account_id, real[0].account_id);
                Ok(())
            })
            .unwrap();

        assert_eq!(merge_duplicates(&store, "proj").unwrap(), MergeReport::default());
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let store = Store::open_in_memory().unwrap();
        // no bill_files row 999: the bill insert violates its foreign key
        assert!(reconcile_file(&store, "proj", 999, &sce_result()).is_err());
        let accounts = store.with_conn(|conn| records::accounts_for_project(conn, "proj")).unwrap();
        assert!(accounts.is_empty());
    }
}
