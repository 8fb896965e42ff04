//! Locale-aware numeric and date parsing for extracted order data.
//!
//! European order documents mix decimal commas, thousands dots and currency
//! symbols; the decimal style is detected from sample lines when ambiguous.

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref CURRENCY_SYMBOLS: Regex = Regex::new(r"[€$£¥\s\u{202f}\u{00a0}]").unwrap();
    static ref DECIMAL_COMMA: Regex = Regex::new(r"\d,\d{1,3}(\D|$)").unwrap();
    static ref DECIMAL_DOT: Regex = Regex::new(r"\d\.\d{1,3}(\D|$)").unwrap();
}

/// Decimal separator style of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecimalStyle {
    /// 1.234,56
    Comma,
    /// 1,234.56
    Dot,
}

/// Detect the dominant decimal style by counting comma-decimal vs
/// dot-decimal shapes across sample lines. Ties fall back to comma, the
/// dominant convention in the inbound corpus.
pub fn detect_decimal_style(samples: &[&str]) -> DecimalStyle {
    let mut comma = 0usize;
    let mut dot = 0usize;
    for line in samples {
        comma += DECIMAL_COMMA.find_iter(line).count();
        dot += DECIMAL_DOT.find_iter(line).count();
    }
    if dot > comma {
        DecimalStyle::Dot
    } else {
        DecimalStyle::Comma
    }
}

/// Parse a decimal that may carry currency symbols, thousands separators and
/// either decimal convention. Position of the last comma/dot decides when
/// both appear.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let cleaned = CURRENCY_SYMBOLS.replace_all(raw.trim(), "").to_string();
    if cleaned.is_empty() {
        return None;
    }

    let has_comma = cleaned.contains(',');
    let has_dot = cleaned.contains('.');

    let normalized = match (has_comma, has_dot) {
        (true, true) => {
            let comma_pos = cleaned.rfind(',').unwrap();
            let dot_pos = cleaned.rfind('.').unwrap();
            if comma_pos > dot_pos {
                // European: 1.234,56
                cleaned.replace('.', "").replace(',', ".")
            } else {
                // US: 1,234.56
                cleaned.replace(',', "")
            }
        }
        (true, false) => {
            // Only commas. One comma followed by 1-3 digits reads as a
            // decimal; multiple commas read as thousands separators.
            let parts: Vec<&str> = cleaned.split(',').collect();
            if parts.len() == 2 && parts[1].len() <= 3 && !parts[1].is_empty() {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        _ => cleaned,
    };

    normalized.parse::<f64>().ok()
}

/// Parse a decimal with a known document-level style.
pub fn parse_decimal_styled(raw: &str, style: DecimalStyle) -> Option<f64> {
    let cleaned = CURRENCY_SYMBOLS.replace_all(raw.trim(), "").to_string();
    if cleaned.is_empty() {
        return None;
    }
    let normalized = match style {
        DecimalStyle::Comma => cleaned.replace('.', "").replace(',', "."),
        DecimalStyle::Dot => cleaned.replace(',', ""),
    };
    normalized.parse::<f64>().ok()
}

/// Parse dates in the formats order documents actually carry.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    const FORMATS: [&str; 7] = [
        "%Y-%m-%d",
        "%d.%m.%Y",
        "%d/%m/%Y",
        "%d-%m-%Y",
        "%d.%m.%y",
        "%d/%m/%y",
        "%Y/%m/%d",
    ];
    for format in FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
    }
    None
}
