use super::rules::parse_number;
use crate::model::{TouPeriod, TouPeriodName};
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// Rows under this many kWh are line items, not TOU periods.
const MIN_PERIOD_KWH: f64 = 100.0;

/// "High Peak Subtotal (11,680 kWh x $0.25624/kWh) $2,992.92"
static SUBTOTAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(High\s*Peak|Low\s*Peak|Base)\s*Subtotal\s*\(\s*([\d,]+(?:\.\d+)?)\s*kWh\s*x\s*\$?([\d.]+)/kWh\s*\)\s*\$?([\d,]+(?:\.\d+)?)",
    )
    .unwrap()
});

/// "Off peak 65375 kwh =x $0.12227 = $7,993.41", tolerant of the `=x`, `kwh_`
/// and `2`-for-`=` artifacts OCR introduces.
static LABELED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(On[\s\-]*Peak|Mid[\s\-]*Peak|Super\s*Off[\s\-]*Peak|Off[\s\-]*Peak)\s+([\d,]+)\s*kWh[_\s]*=?\s*x\s*=?\s*\$?([\d.]+)\s*[=2]\s*\$?([\d,]+\.\d{2})",
    )
    .unwrap()
});

/// "13401 kWh x $0.14823 = $1,986.43" with no period label.
static UNLABELED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([\d,]+)\s*kWh\s+x\s+\$?([\d.]+)\s*=\s*\$?([\d,]+\.\d{2})").unwrap()
});

/// Time-of-use rows found in the text, trying the subtotal layout, then
/// labeled rows, then rank-inferred unlabeled rows.
pub fn extract_tou(text: &str) -> Vec<TouPeriod> {
    let subtotal = subtotal_rows(text);
    if !subtotal.is_empty() {
        return subtotal;
    }
    let labeled = labeled_rows(text);
    if !labeled.is_empty() {
        return labeled;
    }
    inferred_rows(text)
}

fn triple(c: &Captures, kwh: usize) -> Option<(f64, f64, f64)> {
    Some((
        parse_number(&c[kwh])?,
        parse_number(&c[kwh + 1])?,
        parse_number(&c[kwh + 2])?,
    ))
}

fn subtotal_rows(text: &str) -> Vec<TouPeriod> {
    SUBTOTAL
        .captures_iter(text)
        .filter_map(|c| {
            let label = c[1].to_lowercase();
            let period = if label.starts_with("high") {
                TouPeriodName::OnPeak
            } else if label.starts_with("low") {
                TouPeriodName::OffPeak
            } else {
                TouPeriodName::SuperOffPeak
            };
            let (kwh, rate, cost) = triple(&c, 2)?;
            Some(TouPeriod {
                period,
                kwh,
                rate: Some(rate),
                cost: Some(cost),
            })
        })
        .collect()
}

fn period_from_label(label: &str) -> TouPeriodName {
    let l = label.to_lowercase();
    if l.contains("super") {
        TouPeriodName::SuperOffPeak
    } else if l.starts_with("on") {
        TouPeriodName::OnPeak
    } else if l.starts_with("mid") {
        TouPeriodName::MidPeak
    } else {
        TouPeriodName::OffPeak
    }
}

fn labeled_rows(text: &str) -> Vec<TouPeriod> {
    LABELED
        .captures_iter(text)
        .filter_map(|c| {
            let (kwh, rate, cost) = triple(&c, 2)?;
            (kwh >= MIN_PERIOD_KWH).then(|| TouPeriod {
                period: period_from_label(&c[1]),
                kwh,
                rate: Some(rate),
                cost: Some(cost),
            })
        })
        .collect()
}

fn inferred_rows(text: &str) -> Vec<TouPeriod> {
    let mut rows: Vec<(f64, f64, f64)> = UNLABELED
        .captures_iter(text)
        .filter_map(|c| triple(&c, 1))
        .filter(|(kwh, _, _)| *kwh >= MIN_PERIOD_KWH)
        .collect();

    use TouPeriodName::*;
    let names: &[TouPeriodName] = match rows.len() {
        2 => &[OnPeak, OffPeak],
        3 => &[OnPeak, MidPeak, OffPeak],
        4 => &[OnPeak, MidPeak, OffPeak, SuperOffPeak],
        _ => return Vec::new(),
    };

    rows.sort_by(|a, b| b.1.total_cmp(&a.1));
    rows.into_iter()
        .zip(names)
        .map(|((kwh, rate, cost), period)| TouPeriod {
            period: *period,
            kwh,
            rate: Some(rate),
            cost: Some(cost),
        })
        .collect()
}
