//! Customer price tier selection.
//!
//! Tiers are stepped by minimum quantity inside a validity window; the
//! applicable tier is the greatest `min_qty <= line_qty` valid on the order
//! date.

use chrono::NaiveDate;

use crate::store::catalog::CustomerPriceRow;

/// Pick the applicable tier for a line. `on_date` defaults to today when the
/// order has no date.
pub fn select_price_tier<'a>(
    prices: &'a [CustomerPriceRow],
    internal_sku: &str,
    currency: &str,
    uom: &str,
    qty: f64,
    on_date: Option<NaiveDate>,
) -> Option<&'a CustomerPriceRow> {
    let date = on_date.unwrap_or_else(|| chrono::Utc::now().date_naive());

    prices
        .iter()
        .filter(|p| p.internal_sku == internal_sku && p.currency == currency && p.uom == uom)
        .filter(|p| within_validity(p, date))
        .filter(|p| p.min_qty <= qty)
        .max_by(|a, b| {
            a.min_qty
                .partial_cmp(&b.min_qty)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

fn within_validity(price: &CustomerPriceRow, date: NaiveDate) -> bool {
    let parse = |raw: &str| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok();
    if let Some(from) = price.valid_from.as_deref().and_then(parse) {
        if from > date {
            return false;
        }
    }
    if let Some(to) = price.valid_to.as_deref().and_then(parse) {
        if to < date {
            return false;
        }
    }
    true
}
