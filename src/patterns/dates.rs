use chrono::{Datelike, NaiveDate};
use regex::Regex;
use std::sync::LazyLock;

static SLASH_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})/(\d{1,2})/(\d{2,4})$").unwrap());

const WORD_FORMATS: &[&str] = &["%B %d, %Y", "%B %d %Y", "%b %d, %Y", "%b %d %Y", "%b. %d, %Y"];

/// Parse the date shapes bills print: `M/D/YY`, `M/D/YYYY`, `Month D, YYYY`,
/// `Mon D YYYY` and ISO.
///
/// Two-digit years below 50 land in the 2000s, the rest in the 1900s.
pub fn parse_bill_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim().trim_end_matches(['.', ',']);

    if let Some(c) = SLASH_DATE.captures(s) {
        let month: u32 = c[1].parse().ok()?;
        let day: u32 = c[2].parse().ok()?;
        let mut year: i32 = c[3].parse().ok()?;
        if c[3].len() <= 2 {
            year += if year < 50 { 2000 } else { 1900 };
        }
        return NaiveDate::from_ymd_opt(year, month, day);
    }

    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }

    WORD_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

/// ISO `YYYY-MM-DD` form of a bill date, if it parses.
pub fn to_iso(raw: &str) -> Option<String> {
    parse_bill_date(raw).map(|d| d.format("%Y-%m-%d").to_string())
}

/// Resolve a billing period, letting a year-less start borrow the end's year.
///
/// "Nov 05" .. "Dec 04, 2024" becomes 2024-11-05 .. 2024-12-04; a start that
/// would then fall after the end moves to the previous year.
pub fn resolve_period(start_raw: &str, end_raw: &str) -> Option<(String, String)> {
    let end = parse_bill_date(end_raw)?;
    let start = match parse_bill_date(start_raw) {
        Some(d) => d,
        None => {
            let with_year = format!("{} {}", start_raw.trim(), end.year());
            let guess = parse_bill_date(&with_year)?;
            if guess > end {
                guess.with_year(end.year() - 1)?
            } else {
                guess
            }
        }
    };
    Some((
        start.format("%Y-%m-%d").to_string(),
        end.format("%Y-%m-%d").to_string(),
    ))
}

/// Inclusive day count of a period given as ISO strings.
pub fn days_inclusive(start: &str, end: &str) -> Option<i64> {
    let s = NaiveDate::parse_from_str(start, "%Y-%m-%d").ok()?;
    let e = NaiveDate::parse_from_str(end, "%Y-%m-%d").ok()?;
    let days = (e - s).num_days() + 1;
    (days > 0).then_some(days)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_digit_year_pivot() {
        assert_eq!(to_iso("07/21/25").as_deref(), Some("2025-07-21"));
        assert_eq!(to_iso("1/2/99").as_deref(), Some("1999-01-02"));
        assert_eq!(to_iso("12/31/2024").as_deref(), Some("2024-12-31"));
    }

    #[test]
    fn test_word_and_iso_dates() {
        assert_eq!(to_iso("November 26, 2025").as_deref(), Some("2025-11-26"));
        assert_eq!(to_iso("Dec 4 2024").as_deref(), Some("2024-12-04"));
        assert_eq!(to_iso("2024-03-01").as_deref(), Some("2024-03-01"));
        assert_eq!(to_iso("N/A"), None);
        assert_eq!(to_iso("13/45/25"), None);
    }

    #[test]
    fn test_period_borrows_year() {
        assert_eq!(
            resolve_period("Nov 05", "Dec 04, 2024"),
            Some(("2024-11-05".to_string(), "2024-12-04".to_string()))
        );
        assert_eq!(
            resolve_period("Dec 15", "Jan 14, 2025"),
            Some(("2024-12-15".to_string(), "2025-01-14".to_string()))
        );
    }

    #[test]
    fn test_days_inclusive() {
        assert_eq!(days_inclusive("2025-07-21", "2025-08-18"), Some(29));
        assert_eq!(days_inclusive("2025-08-18", "2025-07-21"), None);
    }
}
