// src/clean.rs

use crate::config::CleanerConfig;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

const TRUNCATION_MARKER: &str = "\n[Truncated...]";
const GAP_MARKER: &str = "...";
/// When truncating, back up to a newline only if one lies this close to the cut.
const LINE_BOUNDARY_WINDOW: usize = 500;
const MAX_KEY_VALUES: usize = 20;

static KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)kwh|\bkw\b|total|amount|\bdue\b|\$\d|charges?|billing|period|account|meter|service|\brate\b|demand|energy|electric|usage|consumption|\bread|previous|current|balance|payment|credit|adjustment|peak|off-?peak|mid-?peak|super\s*off|summer|winter|baseline|\btier\b|facility|transmission|distribution|generation|delivery|supply",
    )
    .unwrap()
});

static DATE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"\b\d{1,2}/\d{1,2}/\d{2,4}\b").unwrap(),
        Regex::new(r"\b\d{1,2}-\d{1,2}-\d{2,4}\b").unwrap(),
        Regex::new(r"(?i)\b(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{1,2}\b").unwrap(),
        Regex::new(r"(?i)\b\d{1,2}\s+(?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\b").unwrap(),
    ]
});

static CRLF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\r\n?").unwrap());
static HSPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").unwrap());
static BLANK_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Counters describing what the cleaner did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleaningStats {
    pub original_chars: usize,
    pub final_chars: usize,
    pub original_lines: usize,
    pub lines_kept: usize,
    pub repeating_removed: usize,
    pub relevant_matches: usize,
}

/// Budget-bounded excerpt plus the lines that justified it.
#[derive(Debug, Clone, Default)]
pub struct CleanedText {
    pub text: String,
    pub evidence_lines: Vec<String>,
    pub stats: CleaningStats,
}

pub struct TextCleaner {
    config: CleanerConfig,
}

impl TextCleaner {
    pub fn new(config: CleanerConfig) -> Self {
        Self { config }
    }

    pub fn clean(&self, raw: &str) -> CleanedText {
        let mut stats = CleaningStats {
            original_chars: raw.chars().count(),
            ..CleaningStats::default()
        };

        let text = normalize_whitespace(raw);
        let lines: Vec<&str> = text.lines().collect();
        stats.original_lines = lines.len();

        let repeating = self.repeating_lines(&lines);
        let lines: Vec<&str> = lines
            .into_iter()
            .filter(|l| !repeating.contains(l.trim()))
            .collect();
        stats.repeating_removed = stats.original_lines - lines.len();

        let matched: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, l)| is_relevant(l))
            .map(|(i, _)| i)
            .collect();
        stats.relevant_matches = matched.len();

        let kept: BTreeSet<usize> = if matched.is_empty() {
            (0..lines.len().min(self.config.fallback_lines)).collect()
        } else {
            let ctx = self.config.context_lines;
            matched
                .iter()
                .flat_map(|&i| i.saturating_sub(ctx)..=(i + ctx).min(lines.len() - 1))
                .collect()
        };
        stats.lines_kept = kept.len();

        let mut out = String::new();
        let mut prev: Option<usize> = None;
        for &i in &kept {
            if let Some(p) = prev {
                if i > p + 1 {
                    out.push('\n');
                    out.push_str(GAP_MARKER);
                }
                out.push('\n');
            }
            out.push_str(lines[i]);
            prev = Some(i);
        }

        let out = truncate_at_line(out, self.config.max_output_chars);
        stats.final_chars = out.chars().count();

        let evidence_lines = matched
            .iter()
            .map(|&i| lines[i].trim().to_string())
            .take(self.config.max_evidence_lines)
            .collect();

        CleanedText {
            text: out,
            evidence_lines,
            stats,
        }
    }

    /// Short lines that recur often enough to be page headers or footers.
    fn repeating_lines(&self, lines: &[&str]) -> BTreeSet<String> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for line in lines {
            let t = line.trim();
            if t.len() >= self.config.min_line_length && t.len() < self.config.max_repeat_line_len
            {
                *counts.entry(t).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .filter(|(_, n)| *n >= self.config.repeat_threshold)
            .map(|(t, _)| t.to_string())
            .collect()
    }
}

fn normalize_whitespace(raw: &str) -> String {
    let s = CRLF.replace_all(raw, "\n");
    let s = HSPACE.replace_all(&s, " ");
    let s = BLANK_RUNS.replace_all(&s, "\n\n");
    s.trim().to_string()
}

fn is_relevant(line: &str) -> bool {
    KEYWORDS.is_match(line) || DATE_PATTERNS.iter().any(|re| re.is_match(line))
}

/// Cut to at most `max` chars including the marker, preferring a line
/// boundary near the end.
fn truncate_at_line(text: String, max: usize) -> String {
    if text.chars().count() <= max {
        return text;
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    let Some(budget) = max.checked_sub(marker_len).filter(|b| *b > 0) else {
        return text.chars().take(max).collect();
    };
    let byte_cut = text
        .char_indices()
        .nth(budget)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let mut cut = &text[..byte_cut];
    if let Some(nl) = cut.rfind('\n') {
        if cut.len() - nl < LINE_BOUNDARY_WINDOW {
            cut = &cut[..nl];
        }
    }
    format!("{cut}{TRUNCATION_MARKER}")
}

/// Diagnostic harvest of values that look like bill fields.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KeyValues {
    pub dollar_amounts: Vec<String>,
    pub kwh_values: Vec<String>,
    pub account_numbers: Vec<String>,
    pub dates: Vec<String>,
    pub meter_numbers: Vec<String>,
}

static DOLLARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\s*([\d,]+\.\d{2})").unwrap());
static KWH_VALUES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([\d,]+(?:\.\d+)?)\s*kwh").unwrap());
static ACCOUNT_NUMBERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:account|acct)[^\d\n]{0,20}([\d\-\s]{6,20}\d)").unwrap()
});
static METER_NUMBERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)meter[^\w\n]{0,10}(?:#|no\.?|number)?[:\s]*([A-Z0-9][A-Z0-9\-]{4,20})").unwrap());

pub fn extract_key_values(text: &str) -> KeyValues {
    let grab = |re: &Regex| -> Vec<String> {
        re.captures_iter(text)
            .map(|c| c[1].trim().to_string())
            .take(MAX_KEY_VALUES)
            .collect()
    };

    KeyValues {
        dollar_amounts: grab(&DOLLARS),
        kwh_values: grab(&KWH_VALUES),
        account_numbers: grab(&ACCOUNT_NUMBERS),
        dates: DATE_PATTERNS
            .iter()
            .flat_map(|re| re.find_iter(text).map(|m| m.as_str().to_string()))
            .take(MAX_KEY_VALUES)
            .collect(),
        meter_numbers: grab(&METER_NUMBERS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cleaner() -> TextCleaner {
        TextCleaner::new(CleanerConfig::default())
    }

    #[test]
    fn test_whitespace_normalization() {
        assert_eq!(
            normalize_whitespace("  a\t\tb\r\nc\r\n\n\n\nd  "),
            "a b\nc\n\nd"
        );
    }

    #[test]
    fn test_repeating_headers_removed() {
        let raw: String = (1..=3)
            .map(|p| format!("ACME POWER COMPANY\nTotal amount due ${p}0.00\n"))
            .collect();
        let cleaned = cleaner().clean(&raw);
        assert!(!cleaned.text.contains("ACME POWER COMPANY"));
        assert!(cleaned.text.contains("Total amount due $20.00"));
        assert_eq!(cleaned.stats.repeating_removed, 3);
    }

    #[test]
    fn test_context_window_and_gap_marker() {
        let mut lines: Vec<String> = (0..20).map(|i| format!("noise line {i}")).collect();
        lines[3] = "Total kWh 1,200".to_string();
        lines[15] = "Amount due $99.10".to_string();
        let cleaned = cleaner().clean(&lines.join("\n"));

        assert!(cleaned.text.contains("noise line 1\n"));
        assert!(cleaned.text.contains("noise line 5"));
        assert!(!cleaned.text.contains("noise line 6\n"));
        assert!(cleaned.text.contains("\n...\n"));
        assert_eq!(
            cleaned.evidence_lines,
            vec!["Total kWh 1,200".to_string(), "Amount due $99.10".to_string()]
        );
        assert_eq!(cleaned.stats.relevant_matches, 2);
    }

    #[test]
    fn test_no_matches_keeps_leading_lines() {
        let raw: Vec<String> = (0..150).map(|i| format!("lorem ipsum {i}")).collect();
        let cleaned = cleaner().clean(&raw.join("\n"));
        assert_eq!(cleaned.stats.lines_kept, 100);
        assert!(cleaned.text.ends_with("lorem ipsum 99"));
        assert!(cleaned.evidence_lines.is_empty());
    }

    #[test]
    fn test_truncation_prefers_line_boundary() {
        let cfg = CleanerConfig {
            max_output_chars: 50,
            ..CleanerConfig::default()
        };
        let raw: Vec<String> = (0..10).map(|i| format!("total charge line {i}")).collect();
        let cleaned = TextCleaner::new(cfg).clean(&raw.join("\n"));
        assert!(cleaned.text.ends_with("\n[Truncated...]"));
        assert!(cleaned.text.chars().count() <= 50);
        let body = cleaned.text.trim_end_matches(TRUNCATION_MARKER);
        assert_eq!(body, "total charge line 0");
    }

    #[test]
    fn test_truncation_never_exceeds_cap() {
        let text = "kWh ".repeat(400);
        for max in [5, 15, 16, 60, 1000] {
            let out = truncate_at_line(text.clone(), max);
            assert!(out.chars().count() <= max, "max {max} gave {}", out.chars().count());
        }
        let out = truncate_at_line(text.clone(), 1000);
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_key_values() {
        let kv = extract_key_values(
            "Account Number: 700203608397\nMeter #: V349N-002081\nTotal 160,474 kWh\nAmount due $37,225.88 by 09/08/25",
        );
        assert_eq!(kv.dollar_amounts, vec!["37,225.88"]);
        assert_eq!(kv.kwh_values, vec!["160,474"]);
        assert_eq!(kv.account_numbers, vec!["700203608397"]);
        assert_eq!(kv.dates, vec!["09/08/25"]);
        assert_eq!(kv.meter_numbers, vec!["V349N-002081"]);
    }
}
