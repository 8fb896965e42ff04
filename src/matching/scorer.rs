//! Hybrid match scoring with UoM and price penalties.
//!
//! S_tri  = max(S_tri_sku, 0.7 × S_tri_desc)
//! S_emb  = clamp((cosine + 1) / 2, 0..1)
//! S_raw  = max(0.99 × S_map, 0.62 × S_tri + 0.38 × S_emb)
//! conf   = clamp(S_raw × P_uom × P_price, 0..1)

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::pricing::select_price_tier;
use crate::store::catalog::{CustomerPriceRow, ProductRow};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MatchFeatures {
    pub s_tri: f64,
    pub s_tri_sku: f64,
    pub s_tri_desc: f64,
    pub s_emb: f64,
    pub s_map: f64,
    pub s_hybrid_raw: f64,
    pub p_uom: f64,
    pub p_price: f64,
}

/// Map a cosine similarity in [-1, 1] to [0, 1].
pub fn embedding_score(cosine: f64) -> f64 {
    ((1.0 + cosine) / 2.0).clamp(0.0, 1.0)
}

/// 1.0 when the line unit matches the base unit or a conversion exists,
/// 0.9 when the line has no unit, 0.2 when the unit is incompatible.
pub fn uom_penalty(product: &ProductRow, line_uom: Option<&str>) -> f64 {
    match line_uom {
        None => 0.9,
        Some(uom) if product.uom_compatible(uom) => 1.0,
        Some(_) => 0.2,
    }
}

/// Penalty against the applicable customer price tier; no tier, no penalty.
#[allow(clippy::too_many_arguments)]
pub fn price_penalty(
    prices: &[CustomerPriceRow],
    internal_sku: &str,
    currency: Option<&str>,
    uom: Option<&str>,
    qty: Option<f64>,
    unit_price_micros: Option<i64>,
    order_date: Option<NaiveDate>,
    tolerance_percent: f64,
) -> f64 {
    let (Some(currency), Some(uom), Some(qty), Some(line_price)) =
        (currency, uom, qty, unit_price_micros)
    else {
        return 1.0;
    };
    let Some(tier) = select_price_tier(prices, internal_sku, currency, uom, qty, order_date) else {
        return 1.0;
    };
    if tier.unit_price_micros == 0 {
        return 1.0;
    }

    let delta = (line_price - tier.unit_price_micros).abs() as f64 / tier.unit_price_micros as f64;
    let tolerance = tolerance_percent / 100.0;
    if delta <= tolerance {
        1.0
    } else if delta <= 2.0 * tolerance {
        0.85
    } else {
        0.65
    }
}

/// Combine component scores into the final candidate confidence.
pub fn hybrid_confidence(
    s_tri_sku: f64,
    s_tri_desc: f64,
    s_emb: f64,
    s_map: f64,
    p_uom: f64,
    p_price: f64,
) -> (f64, MatchFeatures) {
    let s_tri = s_tri_sku.max(0.7 * s_tri_desc);
    let s_hybrid_raw = (0.99 * s_map).max(0.62 * s_tri + 0.38 * s_emb).max(0.0);
    let confidence = (s_hybrid_raw * p_uom * p_price).clamp(0.0, 1.0);
    (
        confidence,
        MatchFeatures {
            s_tri,
            s_tri_sku,
            s_tri_desc,
            s_emb,
            s_map,
            s_hybrid_raw,
            p_uom,
            p_price,
        },
    )
}
