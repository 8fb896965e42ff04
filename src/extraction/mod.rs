//! Extraction: canonical output model, rule-based extractors, LLM routing
//! and hallucination guards.

pub mod columns;
pub mod confidence;
pub mod guards;
pub mod numeric;
pub mod pdf;
pub mod router;
pub mod table;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Extractor version tags recorded on extraction runs.
pub const CSV_RULE_V1: &str = "csv_rule_v1";
pub const XLSX_RULE_V1: &str = "xlsx_rule_v1";
pub const PDF_RULE_V1: &str = "pdf_rule_v1";
pub const TEXT_RULE_V1: &str = "text_rule_v1";
pub const LLM_V1: &str = "llm_v1";

/// Warning codes attached to canonical output.
pub mod warning_codes {
    pub const ANCHOR_CHECK_FAILED: &str = "ANCHOR_CHECK_FAILED";
    pub const QTY_RANGE_VIOLATION: &str = "QTY_RANGE_VIOLATION";
    pub const LINES_COUNT_SUSPICIOUS: &str = "LINES_COUNT_SUSPICIOUS";
    pub const HIGH_ANCHOR_FAILURE_RATE: &str = "HIGH_ANCHOR_FAILURE_RATE";
    pub const LOW_TEXT_COVERAGE: &str = "LOW_TEXT_COVERAGE";
    pub const NO_LINES: &str = "NO_LINES";
    pub const BUDGET_EXCEEDED: &str = "BUDGET_EXCEEDED";
    pub const LLM_INVALID_JSON: &str = "LLM_INVALID_JSON";
    pub const LLM_SCHEMA_MISMATCH: &str = "LLM_SCHEMA_MISMATCH";
    pub const UNKNOWN_UOM: &str = "UNKNOWN_UOM";
}

#[derive(Debug, Error)]
#[error("canonical output schema violation: {0}")]
pub struct SchemaError(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CustomerHint {
    pub name: Option<String>,
    pub email: Option<String>,
    pub erp_customer_number: Option<String>,
}

impl CustomerHint {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.erp_customer_number.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Address {
    pub company: Option<String>,
    pub street: Option<String>,
    pub zip: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrderHeader {
    pub external_order_number: Option<String>,
    pub order_date: Option<NaiveDate>,
    pub currency: Option<String>,
    pub requested_delivery_date: Option<NaiveDate>,
    #[serde(default)]
    pub customer_hint: Option<CustomerHint>,
    pub notes: Option<String>,
    #[serde(default)]
    pub ship_to: Option<Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LineItem {
    pub line_no: u32,
    pub customer_sku_raw: Option<String>,
    pub product_description: Option<String>,
    pub qty: Option<f64>,
    /// Canonical UoM code, or `None` when the source unit was unmappable.
    pub uom: Option<String>,
    pub unit_price: Option<f64>,
    pub currency: Option<String>,
    pub requested_delivery_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrderConfidence {
    #[serde(default)]
    pub external_order_number: f64,
    #[serde(default)]
    pub order_date: f64,
    #[serde(default)]
    pub currency: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LineConfidence {
    #[serde(default)]
    pub customer_sku_raw: f64,
    #[serde(default)]
    pub product_description: f64,
    #[serde(default)]
    pub qty: f64,
    #[serde(default)]
    pub uom: f64,
    #[serde(default)]
    pub unit_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Confidence {
    #[serde(default)]
    pub order: OrderConfidence,
    #[serde(default)]
    pub lines: Vec<LineConfidence>,
    #[serde(default)]
    pub overall: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub code: String,
    pub message: String,
}

impl Warning {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Canonical structured representation of one extracted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalOutput {
    pub order: OrderHeader,
    pub lines: Vec<LineItem>,
    pub confidence: Confidence,
    #[serde(default)]
    pub warnings: Vec<Warning>,
    #[serde(default)]
    pub extractor_version: String,
}

impl CanonicalOutput {
    pub fn empty(extractor_version: &str) -> Self {
        Self {
            order: OrderHeader::default(),
            lines: Vec::new(),
            confidence: Confidence::default(),
            warnings: Vec::new(),
            extractor_version: extractor_version.to_string(),
        }
    }

    /// Invariants every canonical output must satisfy: line numbers run 1..n
    /// without gaps and all confidences sit in [0, 1].
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (idx, line) in self.lines.iter().enumerate() {
            let expected = (idx + 1) as u32;
            if line.line_no != expected {
                return Err(SchemaError(format!(
                    "line_no {} at position {} (expected {})",
                    line.line_no, idx, expected
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.confidence.overall) {
            return Err(SchemaError(format!(
                "overall confidence {} outside [0, 1]",
                self.confidence.overall
            )));
        }
        for c in &self.confidence.lines {
            for v in [c.customer_sku_raw, c.product_description, c.qty, c.uom, c.unit_price] {
                if !(0.0..=1.0).contains(&v) {
                    return Err(SchemaError(format!("line field confidence {v} outside [0, 1]")));
                }
            }
        }
        Ok(())
    }

    /// Renumber lines 1..n, preserving order.
    pub fn renumber_lines(&mut self) {
        for (idx, line) in self.lines.iter_mut().enumerate() {
            line.line_no = (idx + 1) as u32;
        }
    }

    pub fn push_warning(&mut self, code: &str, message: impl Into<String>) {
        self.warnings.push(Warning::new(code, message));
    }
}

/// Parse and validate an LLM payload against the canonical schema.
/// Distinguishes malformed JSON from schema mismatches so the caller can
/// label the failure.
pub fn parse_canonical(value: &serde_json::Value) -> Result<CanonicalOutput, SchemaError> {
    let output: CanonicalOutput = serde_json::from_value(value.clone())
        .map_err(|e| SchemaError(format!("deserialize: {e}")))?;
    output.validate()?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_payload() -> serde_json::Value {
        json!({
            "order": {
                "external_order_number": "PO-1",
                "order_date": "2025-01-04",
                "currency": "EUR",
                "requested_delivery_date": null,
                "customer_hint": null,
                "notes": null,
                "ship_to": null
            },
            "lines": [
                {
                    "line_no": 1,
                    "customer_sku_raw": "ABC-123",
                    "product_description": "Kabel NYM-J 3x1,5",
                    "qty": 10.0,
                    "uom": "M",
                    "unit_price": 1.23,
                    "currency": null,
                    "requested_delivery_date": null
                }
            ],
            "confidence": {
                "order": { "external_order_number": 0.9, "order_date": 0.9, "currency": 0.9 },
                "lines": [ { "customer_sku_raw": 0.9, "qty": 0.9, "uom": 0.8, "unit_price": 0.8 } ],
                "overall": 0.85
            },
            "warnings": [],
            "extractor_version": "llm_v1"
        })
    }

    #[test]
    fn round_trip_preserves_structure() {
        let output = parse_canonical(&minimal_payload()).unwrap();
        let serialized = serde_json::to_value(&output).unwrap();
        let reparsed = parse_canonical(&serialized).unwrap();
        assert_eq!(reparsed.lines.len(), 1);
        assert_eq!(reparsed.order.external_order_number.as_deref(), Some("PO-1"));
        assert_eq!(
            reparsed.order.order_date,
            NaiveDate::from_ymd_opt(2025, 1, 4)
        );
    }

    #[test]
    fn gap_in_line_numbers_is_rejected() {
        let mut payload = minimal_payload();
        payload["lines"][0]["line_no"] = json!(3);
        assert!(parse_canonical(&payload).is_err());
    }

    #[test]
    fn missing_order_block_is_schema_mismatch() {
        let mut payload = minimal_payload();
        payload.as_object_mut().unwrap().remove("order");
        assert!(parse_canonical(&payload).is_err());
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let mut payload = minimal_payload();
        payload["confidence"]["overall"] = json!(1.4);
        assert!(parse_canonical(&payload).is_err());
    }

    #[test]
    fn renumber_restores_invariant() {
        let mut output = parse_canonical(&minimal_payload()).unwrap();
        output.lines.push(LineItem {
            line_no: 9,
            ..Default::default()
        });
        output.renumber_lines();
        assert!(output.validate().is_ok());
        assert_eq!(output.lines[1].line_no, 2);
    }
}
