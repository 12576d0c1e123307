use super::dates;
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// An ordered list of alternative patterns for one field.
///
/// Each pattern is tried in order against the first place it matches; the
/// first candidate the field's validator accepts wins.
pub struct RuleList {
    rules: Vec<Regex>,
}

impl RuleList {
    fn compile(flags: &str, patterns: &[&str]) -> Self {
        let rules = patterns
            .iter()
            .map(|p| Regex::new(&format!("{flags}{p}")).unwrap())
            .collect();
        Self { rules }
    }

    pub fn first<T>(&self, text: &str, accept: impl Fn(&Captures) -> Option<T>) -> Option<T> {
        self.rules
            .iter()
            .filter_map(|re| re.captures(text))
            .find_map(|c| accept(&c))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.rules.len()
    }
}

pub fn parse_number(raw: &str) -> Option<f64> {
    raw.replace([',', '$', ' '], "").parse::<f64>().ok()
}

/// Money and usage figures outside (0, 10M) are OCR noise or phone numbers.
fn plausible(v: f64) -> Option<f64> {
    (v > 0.0 && v < 10_000_000.0).then_some(v)
}

// ---------------------------------------------------------------------------
// Utility names
// ---------------------------------------------------------------------------

const UTILITY_NAMES: &[(&str, &str)] = &[
    // California
    (r"Southern California Edison|SCE", "Southern California Edison"),
    (
        r"Los Angeles Department of Water and Power|LADWP|LA\s*DWP",
        "Los Angeles Department of Water and Power",
    ),
    (r"Pacific Gas (?:and|&) Electric|PG&E|PGE", "Pacific Gas and Electric"),
    (r"San Diego Gas (?:and|&) Electric|SDG&E|SDGE", "San Diego Gas & Electric"),
    (r"Sacramento Municipal Utility District|SMUD", "Sacramento Municipal Utility District"),
    (r"Burbank Water and Power|BWP", "Burbank Water and Power"),
    (r"Glendale Water (?:and|&) Power|GWP", "Glendale Water and Power"),
    (r"Pasadena Water (?:and|&) Power|PWP", "Pasadena Water and Power"),
    (r"Imperial Irrigation District|IID", "Imperial Irrigation District"),
    (r"Riverside Public Utilities|RPU", "Riverside Public Utilities"),
    (r"Anaheim Public Utilities", "Anaheim Public Utilities"),
    // Texas
    (r"TXU Energy|TXU", "TXU Energy"),
    (r"Reliant Energy|Reliant", "Reliant Energy"),
    (r"Direct Energy", "Direct Energy"),
    (r"Oncor", "Oncor"),
    (r"CenterPoint Energy", "CenterPoint Energy"),
    (r"AEP Texas", "AEP Texas"),
    // Northeast
    (r"Con Edison|ConEd|Consolidated Edison", "Consolidated Edison"),
    (r"PSEG|Public Service Electric (?:and|&) Gas", "Public Service Electric and Gas"),
    (r"National Grid", "National Grid"),
    (r"Eversource", "Eversource"),
    (r"PECO Energy|PECO", "PECO Energy"),
    (r"PPL Electric", "PPL Electric"),
    (r"Jersey Central Power (?:and|&) Light|JCP&L", "Jersey Central Power & Light"),
    // Southeast
    (r"Duke Energy", "Duke Energy"),
    (r"Florida Power (?:and|&) Light|FPL", "Florida Power & Light"),
    (r"Georgia Power", "Georgia Power"),
    (r"Tampa Electric|TECO", "Tampa Electric"),
    (r"Dominion Energy|Dominion Virginia Power", "Dominion Energy"),
    (r"Progress Energy", "Progress Energy"),
    (r"Entergy", "Entergy"),
    // Midwest
    (r"ComEd|Commonwealth Edison", "Commonwealth Edison"),
    (r"Ameren", "Ameren"),
    (r"DTE Energy|DTE", "DTE Energy"),
    (r"Consumers Energy", "Consumers Energy"),
    (r"We Energies|Wisconsin Energy", "We Energies"),
    (r"Xcel Energy", "Xcel Energy"),
    (r"MidAmerican Energy", "MidAmerican Energy"),
    // West
    (r"Arizona Public Service|APS", "Arizona Public Service"),
    (r"Salt River Project|SRP", "Salt River Project"),
    (r"NV Energy|Nevada Energy", "NV Energy"),
    (r"Rocky Mountain Power", "Rocky Mountain Power"),
    (r"PacifiCorp", "PacifiCorp"),
    (r"Puget Sound Energy|PSE", "Puget Sound Energy"),
    (r"Portland General Electric", "Portland General Electric"),
    (r"Hawaiian Electric|HECO", "Hawaiian Electric"),
];

static UTILITY_TABLE: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    UTILITY_NAMES
        .iter()
        .map(|(p, name)| (Regex::new(&format!(r"(?i)\b(?:{p})\b")).unwrap(), *name))
        .collect()
});

static GENERIC_UTILITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)Electric\s*(?:Company|Service|Utility)[:\s]*([A-Z][A-Za-z\s&]+(?:Electric|Power|Energy|Utility))",
    )
    .unwrap()
});

pub fn utility_name(text: &str) -> Option<String> {
    UTILITY_TABLE
        .iter()
        .find(|(re, _)| re.is_match(text))
        .map(|(_, name)| name.to_string())
        .or_else(|| {
            GENERIC_UTILITY
                .captures(text)
                .map(|c| c[1].trim().to_string())
        })
}

// ---------------------------------------------------------------------------
// Account numbers
// ---------------------------------------------------------------------------

static SERVICE_ACCOUNT: LazyLock<RuleList> = LazyLock::new(|| {
    RuleList::compile(
        "(?im)",
        &[
            r"Service\s*account\s*[\n\r]+\s*(\d{10})\b",
            r"Service\s*account\s*[\n\r\s]+(\d{10})\b",
            r"Service\s*account[:\s]*(\d{10})\b",
            r"Service\s*account\s*(?:POD-?ID[^\n]*[\n\r]+)?\s*(\d{10})\b",
            r"Service\s+account[\s\S]{0,50}?(\d{10})\b",
            r"SA\s*#\s*[:\s]*(\d{10})",
        ],
    )
});

static CUSTOMER_ACCOUNT: LazyLock<RuleList> = LazyLock::new(|| {
    RuleList::compile(
        "(?im)",
        &[
            r"Customer\s*account\s*[\n\r]+\s*(\d{12})\b",
            r"Customer\s*account\s*[\n\r\s]+(\d{12})\b",
            r"Customer\s*account[:\s]*(\d{12})\b",
            r"Customer\s+account[\s\S]{0,50}?(\d{12})\b",
        ],
    )
});

static GENERIC_ACCOUNT: LazyLock<RuleList> = LazyLock::new(|| {
    RuleList::compile(
        "(?im)",
        &[
            r"Account\s*(?:Number|#|No\.?)[:\s]+(\d{6,15})",
            r"Account[:\s]+(\d{6,15})",
            r"Account[:\s]+(\d{3,4}[\-\s]\d{3,4}[\-\s]\d{3,4})",
            r"Acct\.?\s*#?[:\s]+(\d{6,15})",
            r"Bill(?:ing)?\s*Account[:\s]+(\d{6,15})",
            r"Service\s*ID[:\s]+(\d{6,15})",
            r"Electric\s*Account[:\s]+(\d{6,15})",
        ],
    )
});

fn exact_digits(len: usize) -> impl Fn(&Captures) -> Option<String> {
    move |c| {
        let v = c[1].trim();
        (v.len() == len && v.chars().all(|ch| ch.is_ascii_digit())).then(|| v.to_string())
    }
}

/// 10-digit service account (preferred where a bill prints both).
pub fn service_account(text: &str) -> Option<String> {
    SERVICE_ACCOUNT.first(text, exact_digits(10))
}

/// 12-digit customer account.
pub fn customer_account(text: &str) -> Option<String> {
    CUSTOMER_ACCOUNT.first(text, exact_digits(12))
}

pub fn generic_account(text: &str) -> Option<String> {
    GENERIC_ACCOUNT.first(text, |c| {
        let digits: String = c[1].chars().filter(|ch| !matches!(ch, '-' | ' ')).collect();
        (digits.chars().all(|ch| ch.is_ascii_digit()) && (6..=15).contains(&digits.len()))
            .then_some(digits)
    })
}

// ---------------------------------------------------------------------------
// Service address
// ---------------------------------------------------------------------------

static ADDRESS: LazyLock<RuleList> = LazyLock::new(|| {
    RuleList::compile(
        "(?i)",
        &[
            r"SERVICE\s*ADDRESS[:\-]?\s*(.{10,100})",
            r"Service\s*Location[:\-]?\s*(.{10,100})",
            r"Premise\s*(?:Address)?[:\-]?\s*(.{10,100})",
            r"Property\s*Address[:\-]?\s*(.{10,100})",
            r"Installation\s*Address[:\-]?\s*(.{10,100})",
            r"Billing\s*Address[:\-]?\s*(.{10,100})",
            r"Location[:\-]?\s*(.{10,100})",
            r"(\d{2,5}\s+[A-Z][A-Za-z\s]+(?:ST|STREET|AVE|AVENUE|BLVD|BOULEVARD|DR|DRIVE|RD|ROAD|WAY|LN|LANE|CT|COURT|PL|PLACE|CIR|CIRCLE|TRL|TRAIL|PKWY|PARKWAY)[,\s]+[A-Z][A-Za-z\s]+[,\s]*(?:CA|NY|TX|FL|IL|PA|OH|GA|NC|MI|NJ|VA|WA|AZ|MA|TN|IN|MO|MD|WI|CO|MN|SC|AL|LA|KY|OR|OK|CT|UT|IA|NV|AR|MS|KS|NM|NE|WV|ID|HI|NH|ME|RI|MT|DE|SD|ND|AK|VT|WY|DC)\s*\d{5}(?:-\d{4})?)",
            r"(\d{2,5}\s+[A-Z][A-Za-z0-9\s]+(?:ST|STREET|AVE|AVENUE|BLVD|BOULEVARD|DR|DRIVE|RD|ROAD|WAY|LN|LANE|CT|COURT|PL|PLACE)(?:\s*(?:#|APT|UNIT|STE|SUITE)\s*[A-Z0-9]+)?)",
        ],
    )
});

static ADDRESS_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\n\n|\nPOD-ID|\nBILLING|\nACCOUNT|\nMETER|\nRATE|\nNEXT|\nSERVICE\s*ACCOUNT|\nCUSTOMER")
        .unwrap()
});

const ADDRESS_REJECT: &[&str] = &["APM", "KVARH", "METER NUMBER", "SERVES"];

pub fn service_address(text: &str) -> Option<String> {
    ADDRESS.first(text, |c| {
        let raw = c[1].trim();
        let addr = ADDRESS_BOUNDARY
            .split(raw)
            .next()
            .unwrap_or(raw)
            .trim()
            .trim_end_matches([',', ';', ':', '.']);
        let upper = addr.to_uppercase();
        if ADDRESS_REJECT.iter().any(|bad| upper.contains(bad)) {
            return None;
        }
        let ok = addr.chars().count() >= 10
            && addr.chars().any(|ch| ch.is_ascii_digit())
            && addr.chars().any(|ch| ch.is_ascii_alphabetic());
        ok.then(|| addr.to_string())
    })
}

// ---------------------------------------------------------------------------
// Rate schedule
// ---------------------------------------------------------------------------

static RATE: LazyLock<RuleList> = LazyLock::new(|| {
    RuleList::compile(
        "(?im)",
        &[
            r"RATE\s*SCHEDULE\s*\n([A-Z][\-\d\[\]i]+(?:\s+and\s+[A-Z][\-\d\[\]i]+)?[^\n]*(?:\n[A-Z][^\n]*)?)",
            r"RATE\s*SCHEDULE[:\s]*([A-Z][\-\d\[\]i]+(?:\s+and\s+[A-Z][\-\d\[\]i]+)?[^\n]*)",
            r"Rate[:\s]*(TOU[\-\s]?[A-Z0-9\-]+(?:\-[A-Z0-9]+)*)",
            r"Schedule[:\s]*(TOU[\-\s]?[A-Z0-9\-]+)",
            r"Schedule[:\s]*([A-Z][\-]?[A-Z0-9\-]*)",
            r"Rate\s*(?:Code|Schedule)?[:\s]*([A-Z][\-]?\d+[A-Z]?(?:\-[A-Z0-9]+)?)",
            r"Your\s*Rate[:\s]+([A-Z0-9\-]+(?:\s*[A-Z0-9\-]+)?)",
            r"Tariff[:\s]*([A-Z0-9\-]+)",
            r"Service\s*Classification[:\s]*([A-Z0-9\-]+)",
            r"Rate\s*Class[:\s]*([A-Z0-9\-\s]+)",
            r"Electric\s*(?:Service\s*)?Rate[:\s]*([A-Z0-9\-]+)",
            r"Rate[:\s]*(Residential|Commercial|Industrial|Small\s*Business|General\s*Service|Time[\-\s]*of[\-\s]*Use)",
            r"(?:Water\s*)?Schedule[:\s]*(Water\s*Schedule\s*[A-Z][\s\-\w]*)",
        ],
    )
});

static RATE_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)NEXT\s*SCHEDULED|METER\s*NUMBER|BILLING\s*PERIOD|ZONE|RIN:").unwrap()
});
static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Phrases that mark boilerplate rather than a tariff code.
pub const RATE_BOILERPLATE: &[&str] = &["please", "www.", "contact", "questions"];

pub fn rate_schedule(text: &str) -> Option<String> {
    RATE.first(text, |c| {
        let collapsed = WHITESPACE_RUN.replace_all(c[1].trim(), " ");
        let rate = RATE_BOUNDARY
            .split(&collapsed)
            .next()
            .unwrap_or_default()
            .trim();
        let lower = rate.to_lowercase();
        let ok = !rate.is_empty()
            && rate.len() <= 100
            && !RATE_BOILERPLATE.iter().any(|bad| lower.contains(bad));
        ok.then(|| rate.to_string())
    })
}

// ---------------------------------------------------------------------------
// Billing period and due date
// ---------------------------------------------------------------------------

static PERIOD: LazyLock<RuleList> = LazyLock::new(|| {
    RuleList::compile(
        "(?i)",
        &[
            r"from\s+(\d{1,2}/\d{1,2}/\d{2,4})\s+to\s+(\d{1,2}/\d{1,2}/\d{2,4})",
            r"For\s+meter\s+[A-Z0-9\-]+\s+from\s+(\d{1,2}/\d{1,2}/\d{2,4})\s+to\s+(\d{1,2}/\d{1,2}/\d{2,4})",
            r"(?:Billing|Service|Statement|Usage)\s*Period[:\s]*(\d{1,2}/\d{1,2}/\d{2,4})\s*[-–to]+\s*(\d{1,2}/\d{1,2}/\d{2,4})",
            r"(?:Billing|Service|Statement)\s*Period[:\s]*(\w+\s+\d{1,2},?\s+\d{4})\s*[-–to]+\s*(\w+\s+\d{1,2},?\s+\d{4})",
            r"From[:\s]*(\d{1,2}/\d{1,2}/\d{2,4})\s*(?:To|[-–])\s*(\d{1,2}/\d{1,2}/\d{2,4})",
            r"Service\s*From[:\s]*(\d{1,2}/\d{1,2}/\d{2,4})\s*(?:To|Through)[:\s]*(\d{1,2}/\d{1,2}/\d{2,4})",
            r"(\d{1,2}/\d{1,2}/\d{2,4})\s*[-–]\s*(\d{1,2}/\d{1,2}/\d{2,4})",
            r"(\d{1,2}/\d{1,2}/\d{2,4})\s+to\s+(\d{1,2}/\d{1,2}/\d{2,4})",
            r"(?:For\s*)?Usage\s*(?:from\s*)?(\w+\s+\d{1,2})\s*(?:to|through|-)\s*(\w+\s+\d{1,2},?\s+\d{4})",
            r"Previous\s*Read[:\s]*(\d{1,2}/\d{1,2}/\d{2,4}).*?Current\s*Read[:\s]*(\d{1,2}/\d{1,2}/\d{2,4})",
            r"Meter\s*Read\s*Dates?[:\s]*(\d{1,2}/\d{1,2}/\d{2,4})\s*[-–to]+\s*(\d{1,2}/\d{1,2}/\d{2,4})",
            r"(\d{1,2}/\d{1,2}/\d{2,4})\s*(?:thru|through)\s*(\d{1,2}/\d{1,2}/\d{2,4})",
        ],
    )
});

/// Reversed read order: current first, previous second.
static PERIOD_REVERSED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)Current\s*Read[:\s]*(\d{1,2}/\d{1,2}/\d{2,4}).*?Previous\s*Read[:\s]*(\d{1,2}/\d{1,2}/\d{2,4})",
    )
    .unwrap()
});

/// ISO start and end of the billing period.
pub fn billing_period(text: &str) -> Option<(String, String)> {
    PERIOD
        .first(text, |c| dates::resolve_period(&c[1], &c[2]))
        .or_else(|| {
            PERIOD_REVERSED
                .captures(text)
                .and_then(|c| dates::resolve_period(&c[2], &c[1]))
        })
}

static DUE_DATE: LazyLock<RuleList> = LazyLock::new(|| {
    RuleList::compile(
        "(?i)",
        &[
            r"Due\s*By\s*(\d{1,2}/\d{1,2}/\d{2,4})",
            r"(?:Total\s*)?Amount\s*(?:you\s*)?Owe\s*By\s*(\d{1,2}/\d{1,2}/\d{2,4})",
            r"Due\s*Date\s*[:\-]?\s*(\d{1,2}/\d{1,2}/\d{2,4})",
            r"Due\s*Date\s*[:\-]?\s*(\w+\s+\d{1,2},?\s+\d{4})",
            r"Payment\s*Due\s*[:\-]?\s*(\d{1,2}/\d{1,2}/\d{2,4})",
            r"Payment\s*Due\s*[:\-]?\s*(\w+\s+\d{1,2},?\s+\d{4})",
            r"Pay\s*By\s*[:\-]?\s*(\d{1,2}/\d{1,2}/\d{2,4})",
            r"Pay\s*By\s*[:\-]?\s*(\w+\s+\d{1,2},?\s+\d{4})",
            r"Due\s*On\s*[:\-]?\s*(\d{1,2}/\d{1,2}/\d{2,4})",
            r"Due\s*On\s*[:\-]?\s*(\w+\s+\d{1,2},?\s+\d{4})",
            r"AUTO\s*PAYMENT\s*[:\-]?\s*(\w+\s+\d{1,2},?\s+\d{4})",
            r"Auto(?:matic)?\s*Payment\s*[:\-]?\s*(\d{1,2}/\d{1,2}/\d{2,4})",
            r"Amount\s*Due\s*(?:By|On)\s*[:\-]?\s*(\d{1,2}/\d{1,2}/\d{2,4})",
            r"Bill\s*Due\s*[:\-]?\s*(\d{1,2}/\d{1,2}/\d{2,4})",
            r"\bDUE[:\s]+(\d{1,2}/\d{1,2}/\d{2,4})",
        ],
    )
});

pub fn due_date(text: &str) -> Option<String> {
    DUE_DATE.first(text, |c| dates::to_iso(&c[1]))
}

// ---------------------------------------------------------------------------
// Usage and money
// ---------------------------------------------------------------------------

static KWH: LazyLock<RuleList> = LazyLock::new(|| {
    RuleList::compile(
        "(?i)",
        &[
            r"Total\s+electricity\s+you\s+used\s+this\s+month\s+in\s+kWh\s+([\d,]+)",
            r"Total\s+electricity\s+you\s+used[\s\S]{0,30}?([\d,]{4,})",
            r"(?m)^\s*([\d,]{4,})\s*kWh\s*$",
            r"(?:On|Off|Mid)\s*peak\s*[\s\S]{0,50}?([\d,]+)\s*kWh",
            r"Electric\s*Charges\s*\d{1,2}/\d{1,2}/\d{2,4}\s*[-–]\s*\d{1,2}/\d{1,2}/\d{2,4}\s*([\d,]+(?:\.\d+)?)\s*kWh",
            r"Total\s*kWh\s*Consumption[^\d]*([\d,]+(?:\.\d+)?)",
            r"Total\s*(?:Usage|kWh|Energy)[:\s]*([\d,]+(?:\.\d+)?)\s*kWh",
            r"Total\s*(?:Usage|kWh|Energy)[:\s]*([\d,]+(?:\.\d+)?)\s*kilowatt",
            r"([\d,]+(?:\.\d+)?)\s*kWh\s*Total",
            r"Total\s*kWh[:\s]*([\d,]+(?:\.\d+)?)",
            r"Usage[:\s]*([\d,]+(?:\.\d+)?)\s*kWh",
            r"kWh\s*Used[:\s]*([\d,]+(?:\.\d+)?)",
            r"Energy\s*Charges.*?([\d,]+(?:\.\d+)?)\s*kWh",
            r"Your\s*Usage\s*(?:this\s*month)?[:\s]*([\d,]+(?:\.\d+)?)\s*kWh",
            r"Billed\s*kWh[:\s]*([\d,]+(?:\.\d+)?)",
            r"Total\s*Billed\s*kWh[:\s]*([\d,]+(?:\.\d+)?)",
            r"kWh\s*Billed[:\s]*([\d,]+(?:\.\d+)?)",
            r"Delivery[:\s]*([\d,]+(?:\.\d+)?)\s*kWh",
            r"Generation[:\s]*([\d,]+(?:\.\d+)?)\s*kWh",
            r"Meter\s*Reading.*?([\d,]+(?:\.\d+)?)\s*kWh",
            r"Total\s*Consumption[:\s]*([\d,]+(?:\.\d+)?)\s*kWh",
            r"Electricity\s*Used[:\s]*([\d,]+(?:\.\d+)?)\s*kWh",
            r"kWh\s*Delivered[:\s]*([\d,]+(?:\.\d+)?)",
            r"Electric\s*Delivery[:\s]*([\d,]+(?:\.\d+)?)\s*kWh",
            r"U(?:sage|sed)[:\s]*([\d,]+(?:\.\d+)?)\s*kWh",
            r"\b([\d,]{4,})\s*kWh\b",
        ],
    )
});

pub fn total_kwh(text: &str) -> Option<f64> {
    KWH.first(text, |c| parse_number(&c[1]).and_then(plausible))
}

static AMOUNT: LazyLock<RuleList> = LazyLock::new(|| {
    RuleList::compile(
        "(?i)",
        &[
            r"Amount\s+due\s+\$\s*([\d,]+\.\d{2})",
            r"Amount\s+due\s*\$?([\d,]+\.\d{2})",
            r"Total\s+amount\s+you\s+owe\s+by\s+\d{1,2}/\d{1,2}/\d{2,4}\s+\$?\s*([\d,]+\.\d{2})",
            r"Total\s+amount\s+you\s+owe[\s\S]{0,30}?\$\s*([\d,]+\.\d{2})",
            r"Amount\s*due[:\s]*\$\s*([\d,]+\.\d{2})",
            r"Total\s*Amount\s*Due\s*\$\s*([\d,]+\.\d{2})",
            r"Total\s*Amount\s*You\s*Owe[:\s]*\$?\s*([\d,]+\.\d{2})",
            r"Total\s*(?:Due|Owed)[:\s]*\$?\s*([\d,]+\.\d{2})",
            r"Total\s*Amount\s*(?:Owed|Payable)[:\s]*\$?\s*([\d,]+\.\d{2})",
            r"(?:Total\s*)?Amount\s*Due[:\s]*\$?\s*([\d,]+\.\d{2})",
            r"Amount\s*(?:Now\s*)?Due[:\s]*\$?\s*([\d,]+\.\d{2})",
            r"(?:Please\s*)?Pay\s*(?:This\s*)?Amount[:\s]*\$?\s*([\d,]+\.\d{2})",
            r"Amount\s*(?:To\s*)?Pay[:\s]*\$?\s*([\d,]+\.\d{2})",
            r"(?:Total\s*)?Balance\s*Due[:\s]*\$?\s*([\d,]+\.\d{2})",
            r"Total\s*Electric\s*Charges[:\s]*\$?\s*([\d,]+\.\d{2})",
            r"Total\s*Gas\s*Charges[:\s]*\$?\s*([\d,]+\.\d{2})",
            r"(?:Your|This)\s*Bill[:\s]*\$?\s*([\d,]+\.\d{2})",
            r"Pay\s*Online[:\s]*\$?\s*([\d,]+\.\d{2})",
            r"Total\s*Bill[:\s]*\$?\s*([\d,]+\.\d{2})",
            r"Statement\s*Balance[:\s]*\$?\s*([\d,]+\.\d{2})",
            r"(?:Total\s*)?Current\s*Charges[:\s]*\$?\s*([\d,]+\.\d{2})",
            // New charges are not the amount owed; last resort only.
            r"Your\s+new\s+charges[:\s]*\$?\s*([\d,]+\.\d{2})",
            r"(?:Total\s*)?New\s*Charges[:\s]*\$?\s*([\d,]+\.\d{2})",
            r"(?:total|due)[:\s]*\$\s*([\d,]+\.\d{2})",
        ],
    )
});

pub fn total_amount(text: &str) -> Option<f64> {
    AMOUNT.first(text, |c| parse_number(&c[1]).and_then(plausible))
}

// ---------------------------------------------------------------------------
// Meter number
// ---------------------------------------------------------------------------

static METER: LazyLock<RuleList> = LazyLock::new(|| {
    RuleList::compile(
        "(?i)",
        &[
            r"For\s*meter\s+([A-Z]\d{3}[A-Z]-\d{6})",
            r"\bmeter\s+([A-Z]\d{3}[A-Z]-\d{6})",
            r"\b([A-Z]\d{3}[A-Z]-\d{6})\b",
            r"\b(E-\d{7,10})\b",
            r"(APM[A-Z0-9]{2,10}-[0-9\-]{8,15})",
            r"METER\s*(?:NUMBER|#|NO\.?|ID)[\s:]+([A-Z0-9][\-A-Z0-9]{4,20})",
            r"Electric\s*Meter[:\s]+([A-Z0-9][\-A-Z0-9]{4,20})",
            r"Meter\s*Serial[:\s]+([A-Z0-9][\-A-Z0-9]{4,20})",
            r"Service\s*Point\s*(?:ID|#)?[:\s]+([A-Z0-9][\-A-Z0-9]{4,20})",
            r"\bMeter[:\s]+(\d{6,15})\b",
        ],
    )
});

/// Label words OCR tends to put where the meter id should be.
const METER_LABEL_WORDS: &[&str] = &[
    "SERVES", "NUMBER", "READING", "READ", "TYPE", "LOCATION", "STATUS", "UNKNOWN",
];

pub fn meter_number(text: &str) -> Option<String> {
    METER.first(text, |c| {
        let v = c[1].trim();
        if METER_LABEL_WORDS.contains(&v.to_uppercase().as_str()) {
            return None;
        }
        (v.len() >= 5 && v.chars().any(|ch| ch.is_ascii_digit())).then(|| v.to_string())
    })
}

// ---------------------------------------------------------------------------
// Raw-text fallbacks used when a stored value is rejected
// ---------------------------------------------------------------------------

static FALLBACK_RATE: LazyLock<RuleList> = LazyLock::new(|| {
    RuleList::compile(
        "(?m)",
        &[
            r"Rate\s*Schedule\s*[:\-]?\s*([A-Z0-9\-]+(?:[ \t][A-Z0-9\-]+)?)",
            r"RATE\s*SCHEDULE\s*[:\-]?\s*([A-Z0-9\-]+(?:[ \t][A-Z0-9\-]+)?)",
            r"Rate\s*Plan\s*[:\-]?\s*([A-Z0-9\-]+(?:[ \t][A-Z0-9\-]+)?)",
            r"Tariff\s*[:\-]?\s*([A-Z0-9\-]+(?:[ \t][A-Z0-9\-]+)?)",
            r"Service\s*Class\s*[:\-]?\s*([A-Z0-9\-]+)",
            r"Schedule\s*[:\-]?\s*([A-Z0-9\-]+(?:[ \t][A-Z0-9\-]+)?)",
        ],
    )
});

const FALLBACK_RATE_REJECT: &[&str] = &["contact", "please", "may", "service"];

/// Short tariff code only; 3 to 25 chars.
pub fn fallback_rate_schedule(text: &str) -> Option<String> {
    FALLBACK_RATE.first(text, |c| {
        let v = c[1].trim();
        let lower = v.to_lowercase();
        let ok = (3..=25).contains(&v.len())
            && !FALLBACK_RATE_REJECT.iter().any(|bad| lower.contains(bad));
        ok.then(|| v.to_string())
    })
}

static FALLBACK_ADDRESS: LazyLock<RuleList> = LazyLock::new(|| {
    RuleList::compile(
        "(?i)",
        &[
            r"SERVICE\s*ADDRESS[:\-]?\s*(.{10,100})",
            r"Service\s*Location[:\-]?\s*(.{10,100})",
            r"Premise\s*Address[:\-]?\s*(.{10,100})",
            r"Site\s*Address[:\-]?\s*(.{10,100})",
            r"(\d{2,5}\s+[A-Z][A-Za-z\s]+(?:Street|ST|Avenue|AVE|Boulevard|BLVD|Road|RD|Drive|DR|Lane|LN|Way|WAY|Court|CT|Place|PL|Circle|CIR|Parkway|PKY)[^\n]{0,50})",
        ],
    )
});

static FALLBACK_ADDRESS_BOUNDARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n|POD-ID|BILLING|ACCOUNT|METER").unwrap());

pub fn fallback_service_address(text: &str) -> Option<String> {
    FALLBACK_ADDRESS.first(text, |c| {
        let addr = FALLBACK_ADDRESS_BOUNDARY
            .split(&c[1])
            .next()
            .unwrap_or_default()
            .trim();
        (!addr.is_empty()).then(|| addr.to_string())
    })
}

static FALLBACK_DUE: LazyLock<RuleList> = LazyLock::new(|| {
    RuleList::compile(
        "(?i)",
        &[
            r"Due\s*Date\s*[:\-]?\s*(\d{1,2}/\d{1,2}/\d{4})",
            r"Due\s*Date\s*[:\-]?\s*(\w+\s+\d{1,2},?\s+\d{4})",
            r"Payment\s*Due\s*[:\-]?\s*(\d{1,2}/\d{1,2}/\d{4})",
            r"Payment\s*Due\s*[:\-]?\s*(\w+\s+\d{1,2},?\s+\d{4})",
            r"AUTO\s*PAYMENT\s*[:\-]?\s*(\w+\s+\d{1,2},?\s+\d{4})",
            r"AUTO\s*PAYMENT\s*[:\-]?\s*(\d{1,2}/\d{1,2}/\d{4})",
            r"Pay\s*By\s*[:\-]?\s*(\d{1,2}/\d{1,2}/\d{4})",
            r"Pay\s*By\s*[:\-]?\s*(\w+\s+\d{1,2},?\s+\d{4})",
            r"DUE\s*[:\-]?\s*(\d{1,2}/\d{1,2}/\d{4})",
            r"DUE\s*[:\-]?\s*(\w+\s+\d{1,2},?\s+\d{4})",
        ],
    )
});

pub fn fallback_due_date(text: &str) -> Option<String> {
    FALLBACK_DUE.first(text, |c| dates::to_iso(&c[1]))
}
