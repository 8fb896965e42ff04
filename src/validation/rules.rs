//! Validation rules. Each rule is a pure function over the draft, its lines
//! and the context caches; rules return issue drafts and never touch storage.

use anyhow::Result;
use serde_json::json;
use std::collections::HashMap;

use crate::models::{IssueSeverity, CANONICAL_UOMS};
use crate::pricing::select_price_tier;
use crate::store::catalog::{CustomerPriceRow, ProductRow};
use crate::store::orders::{DraftLineRow, DraftOrderRow};
use crate::store::TenantSettings;

pub mod issue_types {
    pub const MISSING_CUSTOMER: &str = "MISSING_CUSTOMER";
    pub const MISSING_CURRENCY: &str = "MISSING_CURRENCY";
    pub const MISSING_SKU: &str = "MISSING_SKU";
    pub const UNKNOWN_PRODUCT: &str = "UNKNOWN_PRODUCT";
    pub const MISSING_QTY: &str = "MISSING_QTY";
    pub const INVALID_QTY: &str = "INVALID_QTY";
    pub const MISSING_UOM: &str = "MISSING_UOM";
    pub const UNKNOWN_UOM: &str = "UNKNOWN_UOM";
    pub const UOM_INCOMPATIBLE: &str = "UOM_INCOMPATIBLE";
    pub const MISSING_PRICE: &str = "MISSING_PRICE";
    pub const PRICE_MISMATCH: &str = "PRICE_MISMATCH";
    pub const DUPLICATE_LINE: &str = "DUPLICATE_LINE";
    pub const CURRENCY_INCONSISTENT: &str = "CURRENCY_INCONSISTENT";
    pub const RULE_FAILED: &str = "RULE_FAILED";
}

/// An issue produced by a rule, before persistence.
#[derive(Debug, Clone)]
pub struct IssueDraft {
    pub issue_type: String,
    pub severity: IssueSeverity,
    pub line_id: Option<String>,
    pub line_no: Option<i64>,
    pub message: String,
    pub details: serde_json::Value,
}

impl IssueDraft {
    fn for_draft(issue_type: &str, severity: IssueSeverity, message: String) -> Self {
        Self {
            issue_type: issue_type.to_string(),
            severity,
            line_id: None,
            line_no: None,
            message,
            details: json!({}),
        }
    }

    fn for_line(
        issue_type: &str,
        severity: IssueSeverity,
        line: &DraftLineRow,
        message: String,
        details: serde_json::Value,
    ) -> Self {
        Self {
            issue_type: issue_type.to_string(),
            severity,
            line_id: Some(line.id.clone()),
            line_no: Some(line.line_no),
            message,
            details,
        }
    }
}

/// Read caches handed to every rule.
pub struct ValidationContext {
    pub settings: TenantSettings,
    pub products_by_sku: HashMap<String, ProductRow>,
    pub customer_prices: Vec<CustomerPriceRow>,
}

pub type Rule =
    fn(&DraftOrderRow, &[DraftLineRow], &ValidationContext) -> Result<Vec<IssueDraft>>;

pub const RULES: &[(&str, Rule)] = &[
    ("header_rules", header_rules),
    ("line_rules", line_rules),
    ("uom_rules", uom_rules),
    ("price_rules", price_rules),
    ("currency_consistency", currency_consistency),
    ("duplicate_lines", duplicate_lines),
];

pub fn header_rules(
    draft: &DraftOrderRow,
    _lines: &[DraftLineRow],
    _ctx: &ValidationContext,
) -> Result<Vec<IssueDraft>> {
    let mut issues = Vec::new();
    if draft.customer_id.is_none() {
        issues.push(IssueDraft::for_draft(
            issue_types::MISSING_CUSTOMER,
            IssueSeverity::Error,
            "customer must be selected before the order can be approved".into(),
        ));
    }
    if draft.currency.is_none() {
        issues.push(IssueDraft::for_draft(
            issue_types::MISSING_CURRENCY,
            IssueSeverity::Error,
            "currency must be specified".into(),
        ));
    }
    Ok(issues)
}

pub fn line_rules(
    _draft: &DraftOrderRow,
    lines: &[DraftLineRow],
    ctx: &ValidationContext,
) -> Result<Vec<IssueDraft>> {
    let mut issues = Vec::new();
    for line in lines {
        match line.internal_sku.as_deref() {
            None => issues.push(IssueDraft::for_line(
                issue_types::MISSING_SKU,
                IssueSeverity::Error,
                line,
                format!("line {}: product mapping is required", line.line_no),
                json!({ "customer_sku": line.customer_sku_norm.clone().or(line.customer_sku_raw.clone()) }),
            )),
            Some(sku) => match ctx.products_by_sku.get(sku) {
                None => issues.push(IssueDraft::for_line(
                    issue_types::UNKNOWN_PRODUCT,
                    IssueSeverity::Error,
                    line,
                    format!("line {}: product '{sku}' not found in catalog", line.line_no),
                    json!({ "internal_sku": sku }),
                )),
                Some(product) if !product.active => issues.push(IssueDraft::for_line(
                    issue_types::UNKNOWN_PRODUCT,
                    IssueSeverity::Error,
                    line,
                    format!("line {}: product '{sku}' is inactive", line.line_no),
                    json!({ "internal_sku": sku, "reason": "inactive" }),
                )),
                Some(_) => {}
            },
        }

        match line.qty {
            None => issues.push(IssueDraft::for_line(
                issue_types::MISSING_QTY,
                IssueSeverity::Error,
                line,
                format!("line {}: quantity is required", line.line_no),
                json!({}),
            )),
            Some(qty) if qty <= 0.0 || !qty.is_finite() => issues.push(IssueDraft::for_line(
                issue_types::INVALID_QTY,
                IssueSeverity::Error,
                line,
                format!("line {}: quantity must be greater than 0 (got {qty})", line.line_no),
                json!({ "qty": qty }),
            )),
            Some(_) => {}
        }

        match line.uom.as_deref() {
            None => issues.push(IssueDraft::for_line(
                issue_types::MISSING_UOM,
                IssueSeverity::Error,
                line,
                format!("line {}: unit of measure is required", line.line_no),
                json!({}),
            )),
            Some(uom) if !CANONICAL_UOMS.contains(&uom) => issues.push(IssueDraft::for_line(
                issue_types::UNKNOWN_UOM,
                IssueSeverity::Error,
                line,
                format!("line {}: unknown unit of measure '{uom}'", line.line_no),
                json!({ "uom": uom }),
            )),
            Some(_) => {}
        }
    }
    Ok(issues)
}

pub fn uom_rules(
    _draft: &DraftOrderRow,
    lines: &[DraftLineRow],
    ctx: &ValidationContext,
) -> Result<Vec<IssueDraft>> {
    let mut issues = Vec::new();
    for line in lines {
        let (Some(sku), Some(uom)) = (line.internal_sku.as_deref(), line.uom.as_deref()) else {
            continue;
        };
        let Some(product) = ctx.products_by_sku.get(sku) else {
            continue;
        };
        if !product.uom_compatible(uom) {
            issues.push(IssueDraft::for_line(
                issue_types::UOM_INCOMPATIBLE,
                IssueSeverity::Error,
                line,
                format!(
                    "line {}: unit '{uom}' is incompatible with base unit '{}' (no conversion)",
                    line.line_no, product.base_uom
                ),
                json!({
                    "line_uom": uom,
                    "base_uom": product.base_uom,
                    "conversions": product.uom_conversions.keys().collect::<Vec<_>>(),
                }),
            ));
        }
    }
    Ok(issues)
}

pub fn price_rules(
    draft: &DraftOrderRow,
    lines: &[DraftLineRow],
    ctx: &ValidationContext,
) -> Result<Vec<IssueDraft>> {
    let mut issues = Vec::new();
    if draft.customer_id.is_none() {
        return Ok(issues);
    }
    let tolerance = ctx.settings.price_tolerance_percent;
    let order_date = draft
        .order_date
        .as_deref()
        .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());

    for line in lines {
        let Some(sku) = line.internal_sku.as_deref() else {
            continue;
        };
        let Some(line_price) = line.unit_price_micros else {
            issues.push(IssueDraft::for_line(
                issue_types::MISSING_PRICE,
                IssueSeverity::Warning,
                line,
                format!("line {}: unit price not specified", line.line_no),
                json!({ "internal_sku": sku }),
            ));
            continue;
        };

        let (Some(currency), Some(uom), Some(qty)) = (
            line.currency.as_deref().or(draft.currency.as_deref()),
            line.uom.as_deref(),
            line.qty,
        ) else {
            continue;
        };
        let Some(tier) =
            select_price_tier(&ctx.customer_prices, sku, currency, uom, qty, order_date)
        else {
            continue;
        };
        if tier.unit_price_micros == 0 {
            continue;
        }

        let deviation = (line_price - tier.unit_price_micros).abs() as f64
            / tier.unit_price_micros as f64
            * 100.0;
        if deviation > tolerance {
            issues.push(IssueDraft::for_line(
                issue_types::PRICE_MISMATCH,
                ctx.settings.price_mismatch_severity,
                line,
                format!(
                    "line {}: price deviates {:.1}% from the agreed tier (tolerance {:.1}%)",
                    line.line_no, deviation, tolerance
                ),
                json!({
                    "internal_sku": sku,
                    "line_price_micros": line_price,
                    "tier_price_micros": tier.unit_price_micros,
                    "tier_min_qty": tier.min_qty,
                    "deviation_percent": deviation,
                }),
            ));
        }
    }
    Ok(issues)
}

pub fn currency_consistency(
    draft: &DraftOrderRow,
    lines: &[DraftLineRow],
    _ctx: &ValidationContext,
) -> Result<Vec<IssueDraft>> {
    let mut issues = Vec::new();
    let Some(header_currency) = draft.currency.as_deref() else {
        return Ok(issues);
    };
    for line in lines {
        if let Some(line_currency) = line.currency.as_deref() {
            if line_currency != header_currency {
                issues.push(IssueDraft::for_line(
                    issue_types::CURRENCY_INCONSISTENT,
                    IssueSeverity::Warning,
                    line,
                    format!(
                        "line {}: currency '{line_currency}' differs from header '{header_currency}'",
                        line.line_no
                    ),
                    json!({ "line_currency": line_currency, "header_currency": header_currency }),
                ));
            }
        }
    }
    Ok(issues)
}

pub fn duplicate_lines(
    _draft: &DraftOrderRow,
    lines: &[DraftLineRow],
    _ctx: &ValidationContext,
) -> Result<Vec<IssueDraft>> {
    let mut issues = Vec::new();
    let mut seen: HashMap<(String, String, String), i64> = HashMap::new();
    for line in lines {
        let Some(sku) = line.internal_sku.as_deref() else {
            continue;
        };
        let key = (
            sku.to_string(),
            line.qty.map(|q| format!("{q}")).unwrap_or_default(),
            line.uom.clone().unwrap_or_default(),
        );
        if let Some(first_line_no) = seen.get(&key) {
            issues.push(IssueDraft::for_line(
                issue_types::DUPLICATE_LINE,
                IssueSeverity::Warning,
                line,
                format!(
                    "line {}: duplicate of line {first_line_no} (same SKU, qty, UoM)",
                    line.line_no
                ),
                json!({ "duplicate_of_line": first_line_no, "internal_sku": sku }),
            ));
        } else {
            seen.insert(key, line.line_no);
        }
    }
    Ok(issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::new_id;

    pub(crate) fn draft(customer: Option<&str>, currency: Option<&str>) -> DraftOrderRow {
        DraftOrderRow {
            id: new_id(),
            tenant_id: "t1".into(),
            customer_id: customer.map(str::to_string),
            document_id: None,
            extraction_run_id: None,
            external_order_number: None,
            order_date: None,
            requested_delivery_date: None,
            currency: currency.map(str::to_string),
            ship_to_json: None,
            bill_to_json: None,
            notes: None,
            status: crate::models::DraftStatus::New,
            version: 1,
            approved_by: None,
            approved_at: None,
            erp_order_ref: None,
            pushed_at: None,
            deleted_at: None,
            ready_json: None,
            overall_confidence: None,
            extraction_confidence: None,
            customer_confidence: None,
            matching_confidence: None,
        }
    }

    pub(crate) fn line(
        line_no: i64,
        sku: Option<&str>,
        qty: Option<f64>,
        uom: Option<&str>,
        price: Option<i64>,
    ) -> DraftLineRow {
        DraftLineRow {
            id: new_id(),
            tenant_id: "t1".into(),
            draft_id: "d1".into(),
            line_no,
            customer_sku_raw: Some("RAW".into()),
            customer_sku_norm: Some("RAW".into()),
            internal_sku: sku.map(str::to_string),
            description: None,
            qty,
            uom: uom.map(str::to_string),
            unit_price_micros: price,
            currency: None,
            requested_delivery_date: None,
            match_method: None,
            match_confidence: None,
            candidates_json: "[]".into(),
        }
    }

    fn product(sku: &str, base_uom: &str, active: bool) -> ProductRow {
        ProductRow {
            id: new_id(),
            tenant_id: "t1".into(),
            internal_sku: sku.to_string(),
            name: sku.to_string(),
            description: None,
            base_uom: base_uom.to_string(),
            uom_conversions: HashMap::new(),
            attributes: HashMap::new(),
            active,
        }
    }

    fn ctx_with(products: Vec<ProductRow>, prices: Vec<CustomerPriceRow>) -> ValidationContext {
        ValidationContext {
            settings: TenantSettings::default(),
            products_by_sku: products
                .into_iter()
                .map(|p| (p.internal_sku.clone(), p))
                .collect(),
            customer_prices: prices,
        }
    }

    #[test]
    fn header_rules_flag_missing_fields() {
        let ctx = ctx_with(vec![], vec![]);
        let issues = header_rules(&draft(None, None), &[], &ctx).unwrap();
        let types: Vec<&str> = issues.iter().map(|i| i.issue_type.as_str()).collect();
        assert!(types.contains(&issue_types::MISSING_CUSTOMER));
        assert!(types.contains(&issue_types::MISSING_CURRENCY));
        assert!(header_rules(&draft(Some("c1"), Some("EUR")), &[], &ctx)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn line_rules_cover_sku_qty_uom() {
        let ctx = ctx_with(vec![product("INT-1", "ST", true), product("INT-2", "ST", false)], vec![]);
        let d = draft(Some("c1"), Some("EUR"));
        let lines = vec![
            line(1, None, Some(1.0), Some("ST"), None),
            line(2, Some("INT-404"), Some(1.0), Some("ST"), None),
            line(3, Some("INT-2"), Some(1.0), Some("ST"), None),
            line(4, Some("INT-1"), None, Some("ST"), None),
            line(5, Some("INT-1"), Some(0.0), Some("ST"), None),
            line(6, Some("INT-1"), Some(1.0), None, None),
            line(7, Some("INT-1"), Some(1.0), Some("BOGUS"), None),
        ];
        let issues = line_rules(&d, &lines, &ctx).unwrap();
        let type_for = |no: i64| -> Vec<&str> {
            issues
                .iter()
                .filter(|i| i.line_no == Some(no))
                .map(|i| i.issue_type.as_str())
                .collect()
        };
        assert_eq!(type_for(1), vec![issue_types::MISSING_SKU]);
        assert_eq!(type_for(2), vec![issue_types::UNKNOWN_PRODUCT]);
        assert_eq!(type_for(3), vec![issue_types::UNKNOWN_PRODUCT]);
        assert_eq!(type_for(4), vec![issue_types::MISSING_QTY]);
        assert_eq!(type_for(5), vec![issue_types::INVALID_QTY]);
        assert_eq!(type_for(6), vec![issue_types::MISSING_UOM]);
        assert_eq!(type_for(7), vec![issue_types::UNKNOWN_UOM]);
    }

    #[test]
    fn qty_at_bound_is_valid() {
        let ctx = ctx_with(vec![product("INT-1", "ST", true)], vec![]);
        let d = draft(Some("c1"), Some("EUR"));
        let lines = vec![line(1, Some("INT-1"), Some(1_000_000.0), Some("ST"), None)];
        assert!(line_rules(&d, &lines, &ctx).unwrap().is_empty());
    }

    #[test]
    fn uom_incompatibility_needs_conversion() {
        let mut convertible = product("INT-1", "M", true);
        convertible.uom_conversions.insert("CM".into(), 0.01);
        let ctx = ctx_with(vec![convertible, product("INT-2", "M", true)], vec![]);
        let d = draft(Some("c1"), Some("EUR"));
        let lines = vec![
            line(1, Some("INT-1"), Some(1.0), Some("CM"), None),
            line(2, Some("INT-2"), Some(1.0), Some("KG"), None),
        ];
        let issues = uom_rules(&d, &lines, &ctx).unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].line_no, Some(2));
        assert_eq!(issues[0].issue_type, issue_types::UOM_INCOMPATIBLE);
    }

    #[test]
    fn price_rules_warn_and_respect_tolerance() {
        let tier = CustomerPriceRow {
            id: new_id(),
            tenant_id: "t1".into(),
            customer_id: "c1".into(),
            internal_sku: "INT-1".into(),
            currency: "EUR".into(),
            uom: "ST".into(),
            min_qty: 1.0,
            unit_price_micros: 10_000_000,
            valid_from: None,
            valid_to: None,
        };
        let ctx = ctx_with(vec![product("INT-1", "ST", true)], vec![tier]);
        let d = draft(Some("c1"), Some("EUR"));

        let lines = vec![
            line(1, Some("INT-1"), Some(1.0), Some("ST"), None),
            line(2, Some("INT-1"), Some(1.0), Some("ST"), Some(10_200_000)),
            line(3, Some("INT-1"), Some(1.0), Some("ST"), Some(12_000_000)),
        ];
        let issues = price_rules(&d, &lines, &ctx).unwrap();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].issue_type, issue_types::MISSING_PRICE);
        assert_eq!(issues[1].issue_type, issue_types::PRICE_MISMATCH);
        assert_eq!(issues[1].line_no, Some(3));
        assert_eq!(issues[1].severity, IssueSeverity::Warning);
    }

    #[test]
    fn price_mismatch_severity_follows_settings() {
        let tier = CustomerPriceRow {
            id: new_id(),
            tenant_id: "t1".into(),
            customer_id: "c1".into(),
            internal_sku: "INT-1".into(),
            currency: "EUR".into(),
            uom: "ST".into(),
            min_qty: 1.0,
            unit_price_micros: 10_000_000,
            valid_from: None,
            valid_to: None,
        };
        let mut ctx = ctx_with(vec![product("INT-1", "ST", true)], vec![tier]);
        ctx.settings.price_mismatch_severity = IssueSeverity::Error;
        let d = draft(Some("c1"), Some("EUR"));
        let lines = vec![line(1, Some("INT-1"), Some(1.0), Some("ST"), Some(20_000_000))];
        let issues = price_rules(&d, &lines, &ctx).unwrap();
        assert_eq!(issues[0].severity, IssueSeverity::Error);
    }

    #[test]
    fn duplicates_and_currency_consistency() {
        let ctx = ctx_with(vec![product("INT-1", "ST", true)], vec![]);
        let d = draft(Some("c1"), Some("EUR"));
        let mut l1 = line(1, Some("INT-1"), Some(5.0), Some("ST"), None);
        l1.currency = Some("EUR".into());
        let mut l2 = line(2, Some("INT-1"), Some(5.0), Some("ST"), None);
        l2.currency = Some("CHF".into());
        let lines = vec![l1, l2];

        let dupes = duplicate_lines(&d, &lines, &ctx).unwrap();
        assert_eq!(dupes.len(), 1);
        assert_eq!(dupes[0].issue_type, issue_types::DUPLICATE_LINE);
        assert_eq!(dupes[0].line_no, Some(2));

        let currency = currency_consistency(&d, &lines, &ctx).unwrap();
        assert_eq!(currency.len(), 1);
        assert_eq!(currency[0].line_no, Some(2));
    }
}
