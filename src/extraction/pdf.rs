//! Rule-based extraction from text-based PDFs.
//!
//! The PDF is reduced to (page count, extracted text); line items are
//! recovered from table-like text rows, the header from a pattern sweep over
//! the first part of the document.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;

use super::columns;
use super::confidence::text_coverage_ratio;
use super::numeric;
use super::{warning_codes, CanonicalOutput, LineItem, OrderHeader, PDF_RULE_V1};
use crate::models::canonical_uom;

/// Minimum characters before a PDF counts as text-based at all.
pub const MIN_TEXT_CHARS: usize = 500;

#[derive(Debug, Clone)]
pub struct PdfContent {
    pub page_count: usize,
    pub text: String,
    pub coverage: f64,
}

/// Load a PDF and pull text from every page.
pub fn read_pdf(bytes: &[u8]) -> Result<PdfContent> {
    let doc = lopdf::Document::load_mem(bytes).context("parse pdf")?;
    let pages = doc.get_pages();
    let page_count = pages.len();

    let mut text = String::new();
    for page_number in pages.keys() {
        if let Ok(page_text) = doc.extract_text(&[*page_number]) {
            text.push_str(&page_text);
            text.push('\n');
        }
    }
    let coverage = text_coverage_ratio(text.trim().len(), page_count);
    Ok(PdfContent {
        page_count,
        text,
        coverage,
    })
}

/// A PDF is scanned when coverage is below the threshold or there is hardly
/// any text at all.
pub fn is_scanned(content: &PdfContent) -> bool {
    content.coverage < super::confidence::SCAN_COVERAGE_THRESHOLD
        || content.text.trim().len() < MIN_TEXT_CHARS
}

lazy_static! {
    // Table-like text row: [pos] SKU description qty uom [price]
    static ref LINE_PATTERN: Regex = Regex::new(
        r"(?m)^\s*(?:(\d{1,3})\s+)?([A-Za-z0-9][A-Za-z0-9\-_./]{2,})\s+(.+?)\s+(\d+(?:[.,]\d+)?)\s+([A-Za-zÄÖÜäöü]{1,4})\.?(?:\s+(\d{1,3}(?:[.,]\d{3})*(?:[.,]\d+)?))?\s*$"
    )
    .unwrap();
}

/// Parse already-extracted PDF text into canonical output.
pub fn parse_pdf_text(text: &str) -> CanonicalOutput {
    let mut output = CanonicalOutput::empty(PDF_RULE_V1);

    let header_area: String = text.chars().take(3000).collect();
    let metadata = columns::extract_header_metadata(&header_area);
    output.order = OrderHeader {
        external_order_number: metadata.order_number,
        order_date: metadata.order_date.as_deref().and_then(numeric::parse_date),
        currency: metadata.currency,
        requested_delivery_date: metadata.delivery_date.as_deref().and_then(numeric::parse_date),
        ..Default::default()
    };

    for caps in LINE_PATTERN.captures_iter(text) {
        let sku = caps[2].to_string();
        let description = caps[3].trim().to_string();
        let qty = numeric::parse_decimal(&caps[4]);
        let uom_raw = &caps[5];
        let price = caps.get(6).and_then(|m| numeric::parse_decimal(m.as_str()));

        // Accept only rows with a mappable unit or an explicit price; plain
        // prose otherwise slips through the pattern.
        let uom = canonical_uom(uom_raw);
        if uom.is_none() && price.is_none() {
            continue;
        }

        output.lines.push(LineItem {
            line_no: 0,
            customer_sku_raw: Some(sku),
            product_description: (!description.is_empty()).then_some(description),
            qty,
            uom: uom.map(str::to_string),
            unit_price: price,
            currency: None,
            requested_delivery_date: None,
        });
        if output.lines.len() >= 500 {
            break;
        }
    }

    output.renumber_lines();
    if output.lines.is_empty() {
        output.push_warning(warning_codes::NO_LINES, "no table-like rows found in pdf text");
    }
    output
}

/// Full rule-based PDF extraction over raw bytes.
pub fn extract_from_pdf(content: &PdfContent) -> CanonicalOutput {
    let mut output = parse_pdf_text(&content.text);
    if content.coverage < super::confidence::SCAN_COVERAGE_THRESHOLD {
        output.push_warning(
            warning_codes::LOW_TEXT_COVERAGE,
            format!("text coverage ratio {:.3}", content.coverage),
        );
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    const PDF_TEXT: &str = "\
Musterfirma GmbH
Bestellnummer: PO-2025-001
Datum: 2025-01-04
Währung: EUR

Pos Artikel Bezeichnung Menge Einheit Preis
1 ABC-123 Kabel NYM-J 3x1,5 10 M 1,23
2 DEF-456 Schalter weiss 5 ST 4,50
3 GHI-789 Abzweigdose IP54 20 ST 0,80

Vielen Dank für Ihre Bestellung
";

    #[test]
    fn parses_header_and_lines() {
        let output = parse_pdf_text(PDF_TEXT);
        assert_eq!(output.order.external_order_number.as_deref(), Some("PO-2025-001"));
        assert_eq!(output.order.currency.as_deref(), Some("EUR"));
        assert_eq!(output.lines.len(), 3);

        let first = &output.lines[0];
        assert_eq!(first.customer_sku_raw.as_deref(), Some("ABC-123"));
        assert_eq!(first.product_description.as_deref(), Some("Kabel NYM-J 3x1,5"));
        assert_eq!(first.qty, Some(10.0));
        assert_eq!(first.uom.as_deref(), Some("M"));
        assert_eq!(first.unit_price, Some(1.23));
        assert!(output.validate().is_ok());
    }

    #[test]
    fn prose_lines_are_not_items() {
        let output = parse_pdf_text("Wir bestellen wie besprochen die folgenden Artikel\n");
        assert!(output.lines.is_empty());
        assert!(output
            .warnings
            .iter()
            .any(|w| w.code == warning_codes::NO_LINES));
    }

    #[test]
    fn scanned_detection_by_coverage() {
        let scanned = PdfContent {
            page_count: 2,
            text: "stub".into(),
            coverage: 0.05,
        };
        assert!(is_scanned(&scanned));
        let text_based = PdfContent {
            page_count: 1,
            text: "x".repeat(2400),
            coverage: 0.9,
        };
        assert!(!is_scanned(&text_based));
    }

    #[test]
    fn short_text_counts_as_scanned_despite_coverage() {
        let content = PdfContent {
            page_count: 0,
            text: "tiny".into(),
            coverage: 1.0,
        };
        assert!(is_scanned(&content));
    }

    #[test]
    fn line_cap_stops_runaway_matches() {
        let mut text = String::new();
        for i in 0..600 {
            text.push_str(&format!("{} SKU-{:04} Teil Nummer {} 1 ST 2,00\n", i % 100, i, i));
        }
        let output = parse_pdf_text(&text);
        assert_eq!(output.lines.len(), 500);
    }
}
