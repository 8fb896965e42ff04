//! Column header mapping for structured files.
//!
//! Maps German and English column names onto canonical fields, and sweeps the
//! first rows of a file for header metadata like "Bestellnummer: PO-12345".

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnField {
    LineNo,
    CustomerSku,
    Description,
    Qty,
    Uom,
    UnitPrice,
    LineTotal,
    Currency,
    DeliveryDate,
}

const COLUMN_ALIASES: &[(ColumnField, &[&str])] = &[
    (
        ColumnField::CustomerSku,
        &[
            "artikelnummer", "artnr", "artikelnr", "sku", "article", "articlenumber",
            "productcode", "itemnumber", "material", "materialnummer", "bestellnr",
        ],
    ),
    (
        ColumnField::Qty,
        &["menge", "anzahl", "quantity", "qty", "count", "stuck", "stueck"],
    ),
    (
        ColumnField::Uom,
        &["einheit", "me", "mengeneinheit", "uom", "unit", "unitofmeasure", "masseinheit"],
    ),
    (
        ColumnField::UnitPrice,
        &[
            "preis", "epreis", "einzelpreis", "stuckpreis", "stueckpreis", "unitprice",
            "price", "priceperunit", "ep",
        ],
    ),
    (
        ColumnField::Description,
        &[
            "bezeichnung", "beschreibung", "text", "artikelbezeichnung", "description",
            "productdescription", "itemdescription", "name", "productname", "artikel",
        ],
    ),
    (
        ColumnField::LineTotal,
        &["gesamtpreis", "gesamt", "total", "linetotal", "betrag", "summe", "zeilensumme"],
    ),
    (
        ColumnField::LineNo,
        &["pos", "position", "zeile", "line", "lineno", "linenumber", "nr"],
    ),
    (ColumnField::Currency, &["wahrung", "waehrung", "currency", "curr", "whr"]),
    (
        ColumnField::DeliveryDate,
        &[
            "liefertermin", "lieferdatum", "wunschtermin", "deliverydate",
            "requesteddelivery", "shipdate",
        ],
    ),
];

lazy_static! {
    static ref NON_ALNUM: Regex = Regex::new(r"[^a-z0-9]").unwrap();
    static ref ORDER_NUMBER_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)bestellnummer[:\s]+([A-Z0-9\-/_]+)").unwrap(),
        Regex::new(r"(?i)bestell-?nr[.:\s]+([A-Z0-9\-/_]+)").unwrap(),
        Regex::new(r"(?i)order\s*(?:number|no|nr)[.:\s#]+([A-Z0-9\-/_]+)").unwrap(),
        Regex::new(r"(?i)auftrag(?:snummer)?[.:\s]+([A-Z0-9\-/_]+)").unwrap(),
        Regex::new(r"(?i)\bpo[#:\s]+([A-Z0-9\-/_]+)").unwrap(),
        Regex::new(r"(?i)purchase\s*order[.:\s#]+([A-Z0-9\-/_]+)").unwrap(),
    ];
    static ref ORDER_DATE_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)bestelldatum[:\s]+([\d./\-]+)").unwrap(),
        Regex::new(r"(?i)order\s*date[:\s]+([\d./\-]+)").unwrap(),
        Regex::new(r"(?i)datum[:\s]+([\d./\-]+)").unwrap(),
        Regex::new(r"(?i)\bdate[:\s]+([\d./\-]+)").unwrap(),
    ];
    static ref CURRENCY_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)w(?:ä|ae?)hrung[:\s]+([A-Za-z]{3})").unwrap(),
        Regex::new(r"(?i)currency[:\s]+([A-Za-z]{3})").unwrap(),
        Regex::new(r"\b(EUR|CHF|USD|GBP)\b").unwrap(),
    ];
    static ref DELIVERY_DATE_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)liefertermin[:\s]+([\d./\-]+)").unwrap(),
        Regex::new(r"(?i)lieferdatum[:\s]+([\d./\-]+)").unwrap(),
        Regex::new(r"(?i)wunschtermin[:\s]+([\d./\-]+)").unwrap(),
        Regex::new(r"(?i)delivery\s*date[:\s]+([\d./\-]+)").unwrap(),
        Regex::new(r"(?i)requested\s*delivery[:\s]+([\d./\-]+)").unwrap(),
    ];
}

fn normalize_header(header: &str) -> String {
    NON_ALNUM
        .replace_all(&header.to_lowercase(), "")
        .to_string()
}

/// Map one header cell to its canonical field.
pub fn map_column(header: &str) -> Option<ColumnField> {
    let normalized = normalize_header(header);
    if normalized.is_empty() {
        return None;
    }
    for (field, aliases) in COLUMN_ALIASES {
        if aliases.contains(&normalized.as_str()) {
            return Some(*field);
        }
    }
    None
}

/// Map a header row to field -> column index. First alias hit per field wins.
pub fn map_columns(headers: &[String]) -> HashMap<ColumnField, usize> {
    let mut out = HashMap::new();
    for (idx, header) in headers.iter().enumerate() {
        if let Some(field) = map_column(header) {
            out.entry(field).or_insert(idx);
        }
    }
    out
}

/// A row is a plausible table header when at least two cells map to known
/// fields, one of them SKU or description.
pub fn looks_like_header(row: &[String]) -> bool {
    let mapped = map_columns(row);
    mapped.len() >= 2
        && (mapped.contains_key(&ColumnField::CustomerSku)
            || mapped.contains_key(&ColumnField::Description))
}

#[derive(Debug, Clone, Default)]
pub struct HeaderMetadata {
    pub order_number: Option<String>,
    pub order_date: Option<String>,
    pub currency: Option<String>,
    pub delivery_date: Option<String>,
}

fn first_capture(patterns: &[Regex], text: &str) -> Option<String> {
    for pattern in patterns {
        if let Some(cap) = pattern.captures(text) {
            return Some(cap[1].trim().to_string());
        }
    }
    None
}

/// Sweep free text (header area of a document, or pre-table rows of a
/// spreadsheet joined into lines) for order metadata.
pub fn extract_header_metadata(text: &str) -> HeaderMetadata {
    HeaderMetadata {
        order_number: first_capture(&ORDER_NUMBER_PATTERNS, text),
        order_date: first_capture(&ORDER_DATE_PATTERNS, text),
        currency: first_capture(&CURRENCY_PATTERNS, text).map(|c| c.to_uppercase()),
        delivery_date: first_capture(&DELIVERY_DATE_PATTERNS, text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn german_and_english_aliases() {
        assert_eq!(map_column("Artikelnummer"), Some(ColumnField::CustomerSku));
        assert_eq!(map_column("Menge"), Some(ColumnField::Qty));
        assert_eq!(map_column("Unit Price"), Some(ColumnField::UnitPrice));
        assert_eq!(map_column("Bezeichnung"), Some(ColumnField::Description));
        assert_eq!(map_column("Pos."), Some(ColumnField::LineNo));
        assert_eq!(map_column("Unknown Column"), None);
    }

    #[test]
    fn header_row_detection() {
        let header = vec![
            "Pos".to_string(),
            "Artikelnummer".to_string(),
            "Bezeichnung".to_string(),
            "Menge".to_string(),
        ];
        assert!(looks_like_header(&header));
        let data = vec!["1".to_string(), "ABC-123".to_string(), "10".to_string()];
        assert!(!looks_like_header(&data));
    }

    #[test]
    fn metadata_sweep_finds_german_header() {
        let text = "Bestellnummer: PO-2025-001\nDatum: 2025-01-04\nWährung: EUR\n";
        let meta = extract_header_metadata(text);
        assert_eq!(meta.order_number.as_deref(), Some("PO-2025-001"));
        assert_eq!(meta.order_date.as_deref(), Some("2025-01-04"));
        assert_eq!(meta.currency.as_deref(), Some("EUR"));
    }

    #[test]
    fn metadata_sweep_finds_english_header() {
        let text = "Order No: 4711-A\nOrder Date: 04.01.2025\nCurrency: usd";
        let meta = extract_header_metadata(text);
        assert_eq!(meta.order_number.as_deref(), Some("4711-A"));
        assert_eq!(meta.order_date.as_deref(), Some("04.01.2025"));
        assert_eq!(meta.currency.as_deref(), Some("USD"));
    }
}
