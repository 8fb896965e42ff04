//! Hallucination guards applied to LLM extraction output.
//!
//! Every line must be anchored in the source bytes, quantities must sit in a
//! sane range, and the line count must be plausible for the page count.

use lazy_static::lazy_static;
use regex::Regex;

use super::{warning_codes, CanonicalOutput};

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

fn normalize(text: &str) -> String {
    WHITESPACE
        .replace_all(&text.to_uppercase(), " ")
        .trim()
        .to_string()
}

fn compact(text: &str) -> String {
    text.replace([' ', '-'], "")
}

/// At least one of: the raw SKU appears in the source, an 8+ character token
/// from the description appears, or the integer part of the quantity appears.
pub fn anchor_check(
    customer_sku_raw: Option<&str>,
    description: Option<&str>,
    qty: Option<f64>,
    source_norm: &str,
    source_compact: &str,
) -> bool {
    if let Some(sku) = customer_sku_raw {
        let sku_norm = normalize(sku);
        if !sku_norm.is_empty()
            && (source_norm.contains(&sku_norm) || source_compact.contains(&compact(&sku_norm)))
        {
            return true;
        }
    }
    if let Some(desc) = description {
        for token in desc.split_whitespace() {
            if token.len() >= 8 && source_norm.contains(&normalize(token)) {
                return true;
            }
        }
    }
    if let Some(qty) = qty {
        let qty_int = format!("{}", qty.trunc() as i64);
        if source_norm.contains(&qty_int) {
            return true;
        }
    }
    false
}

/// Apply all guards in place. Anchor failures halve the affected line's field
/// confidences; range violations null the quantity; suspicious line counts
/// and high anchor-failure rates reduce the overall confidence.
pub fn apply_guards(
    output: &mut CanonicalOutput,
    source_text: &str,
    page_count: Option<usize>,
    max_qty: f64,
) {
    let source_norm = normalize(source_text);
    let source_compact = compact(&source_norm);

    let mut anchor_failures = 0usize;
    let line_count = output.lines.len();

    for idx in 0..line_count {
        let line = &output.lines[idx];
        let anchored = anchor_check(
            line.customer_sku_raw.as_deref(),
            line.product_description.as_deref(),
            line.qty,
            &source_norm,
            &source_compact,
        );
        let line_no = line.line_no;

        if !anchored {
            anchor_failures += 1;
            if let Some(conf) = output.confidence.lines.get_mut(idx) {
                conf.customer_sku_raw *= 0.5;
                conf.qty *= 0.5;
                conf.uom *= 0.5;
                conf.unit_price *= 0.5;
                conf.product_description *= 0.5;
            }
            output.push_warning(
                warning_codes::ANCHOR_CHECK_FAILED,
                format!("Line {line_no}: data not found in source"),
            );
        }

        let line = &mut output.lines[idx];
        if let Some(qty) = line.qty {
            if qty <= 0.0 || qty > max_qty {
                line.qty = None;
                output.push_warning(
                    warning_codes::QTY_RANGE_VIOLATION,
                    format!("Line {line_no}: quantity {qty} outside (0, {max_qty}]"),
                );
            }
        }
    }

    if let Some(pages) = page_count {
        if pages > 0 {
            let lines_per_page = line_count as f64 / pages as f64;
            let suspicious = (line_count > 200 && pages <= 2) || lines_per_page > 100.0;
            if suspicious {
                output.confidence.overall *= 0.7;
                output.push_warning(
                    warning_codes::LINES_COUNT_SUSPICIOUS,
                    format!("{line_count} lines from {pages} pages"),
                );
            }
        }
    }

    if line_count > 0 && anchor_failures as f64 / line_count as f64 > 0.3 {
        output.confidence.overall *= 0.7;
        output.push_warning(
            warning_codes::HIGH_ANCHOR_FAILURE_RATE,
            format!("{anchor_failures}/{line_count} lines failed the anchor check"),
        );
    }

    output.confidence.overall = output.confidence.overall.clamp(0.0, 1.0);
}
