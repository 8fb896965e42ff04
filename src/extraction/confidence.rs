//! Confidence scoring for rule-based extraction output.
//!
//! Header confidence is the fraction of {order number, order date, currency}
//! present; line confidence averages {sku, qty, description} presence per
//! line; the overall score weights header and lines (tenant-configurable,
//! normalized to sum 1.0). Low text coverage on a PDF halves the result.

use super::{CanonicalOutput, Confidence, LineConfidence, OrderConfidence};

pub const SCAN_COVERAGE_THRESHOLD: f64 = 0.15;

fn presence(present: bool) -> f64 {
    if present {
        1.0
    } else {
        0.0
    }
}

/// Compute and attach confidence scores to a rule-based extraction output.
/// Returns the overall score.
pub fn score_output(
    output: &mut CanonicalOutput,
    header_weight: f64,
    lines_weight: f64,
    text_coverage: Option<f64>,
) -> f64 {
    let (header_weight, lines_weight) = normalize_weights(header_weight, lines_weight);

    let order = &output.order;
    let order_fields = [
        presence(order.external_order_number.is_some()),
        presence(order.order_date.is_some()),
        presence(order.currency.is_some()),
    ];
    let header_score = order_fields.iter().sum::<f64>() / order_fields.len() as f64;

    let mut line_scores = Vec::with_capacity(output.lines.len());
    for line in &output.lines {
        let sku = presence(line.customer_sku_raw.is_some());
        let qty = presence(line.qty.is_some());
        let desc = presence(line.product_description.is_some());
        line_scores.push(LineConfidence {
            customer_sku_raw: sku,
            product_description: desc,
            qty,
            uom: presence(line.uom.is_some()),
            unit_price: presence(line.unit_price.is_some()),
        });
    }
    let lines_score = if line_scores.is_empty() {
        0.0
    } else {
        line_scores
            .iter()
            .map(|c| (c.customer_sku_raw + c.qty + c.product_description) / 3.0)
            .sum::<f64>()
            / line_scores.len() as f64
    };

    let mut overall = header_weight * header_score + lines_weight * lines_score;
    if let Some(coverage) = text_coverage {
        if coverage < SCAN_COVERAGE_THRESHOLD {
            overall *= 0.5;
        }
    }
    overall = overall.clamp(0.0, 1.0);

    output.confidence = Confidence {
        order: OrderConfidence {
            external_order_number: order_fields[0],
            order_date: order_fields[1],
            currency: order_fields[2],
        },
        lines: line_scores,
        overall,
    };
    overall
}

fn normalize_weights(header: f64, lines: f64) -> (f64, f64) {
    let sum = header + lines;
    if sum <= 0.0 {
        (0.4, 0.6)
    } else {
        (header / sum, lines / sum)
    }
}

/// text_coverage_ratio = min(1, chars / (pages × 2500)); zero pages is zero
/// coverage.
pub fn text_coverage_ratio(text_chars: usize, page_count: usize) -> f64 {
    if page_count == 0 {
        return 0.0;
    }
    let expected = page_count as f64 * 2500.0;
    (text_chars as f64 / expected).min(1.0)
}
