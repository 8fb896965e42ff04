//! Rule-based extraction from structured files (CSV and XLSX).
//!
//! Both formats reduce to rows of cells: rows before the detected header are
//! swept for order metadata, rows after it become line items via the column
//! alias map.

use anyhow::{anyhow, Context, Result};
use calamine::{Data, Reader, Xlsx};
use std::io::Cursor;

use super::columns::{self, ColumnField};
use super::numeric;
use super::{warning_codes, CanonicalOutput, LineItem, OrderHeader, CSV_RULE_V1, XLSX_RULE_V1};
use crate::models::canonical_uom;

pub fn extract_from_csv(bytes: &[u8]) -> Result<CanonicalOutput> {
    let text = String::from_utf8_lossy(bytes);
    let delimiter = sniff_delimiter(&text);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows: Vec<Vec<String>> = Vec::new();
    for record in reader.records() {
        let record = record.context("read csv record")?;
        rows.push(record.iter().map(|cell| cell.trim().to_string()).collect());
    }
    Ok(build_output_from_rows(rows, CSV_RULE_V1))
}

pub fn extract_from_xlsx(bytes: &[u8]) -> Result<CanonicalOutput> {
    let mut workbook: Xlsx<_> =
        Xlsx::new(Cursor::new(bytes.to_vec())).context("open xlsx workbook")?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| anyhow!("workbook has no sheets"))?
        .context("read first worksheet")?;

    let mut rows: Vec<Vec<String>> = Vec::new();
    for row in range.rows() {
        rows.push(row.iter().map(cell_to_string).collect());
    }
    Ok(build_output_from_rows(rows, XLSX_RULE_V1))
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => format!("{f}"),
        Data::Int(i) => format!("{i}"),
        Data::Bool(b) => format!("{b}"),
        other => other.to_string().trim().to_string(),
    }
}

/// Pick the delimiter with the most occurrences in the first non-empty line.
fn sniff_delimiter(text: &str) -> u8 {
    let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let candidates = [(b';', line.matches(';').count()),
        (b',', line.matches(',').count()),
        (b'\t', line.matches('\t').count())];
    candidates
        .iter()
        .max_by_key(|(_, count)| *count)
        .map(|(delim, count)| if *count > 0 { *delim } else { b';' })
        .unwrap_or(b';')
}

fn build_output_from_rows(rows: Vec<Vec<String>>, version: &str) -> CanonicalOutput {
    let mut output = CanonicalOutput::empty(version);

    let header_idx = rows.iter().position(|row| columns::looks_like_header(row));

    // Metadata sweep over everything before the table (first 20 rows max).
    let meta_rows: Vec<&Vec<String>> = match header_idx {
        Some(idx) => rows[..idx.min(20)].iter().collect(),
        None => rows.iter().take(20).collect(),
    };
    let meta_text: String = meta_rows
        .iter()
        .map(|row| row.join(" "))
        .collect::<Vec<_>>()
        .join("\n");
    let metadata = columns::extract_header_metadata(&meta_text);
    output.order = OrderHeader {
        external_order_number: metadata.order_number,
        order_date: metadata.order_date.as_deref().and_then(numeric::parse_date),
        currency: metadata.currency,
        requested_delivery_date: metadata.delivery_date.as_deref().and_then(numeric::parse_date),
        ..Default::default()
    };

    let Some(header_idx) = header_idx else {
        output.push_warning(warning_codes::NO_LINES, "no table header row detected");
        return output;
    };

    let col_map = columns::map_columns(&rows[header_idx]);
    for row in rows.iter().skip(header_idx + 1) {
        if row.iter().all(|cell| cell.is_empty()) {
            continue;
        }
        let get = |field: ColumnField| -> Option<&str> {
            col_map
                .get(&field)
                .and_then(|idx| row.get(*idx))
                .map(|s| s.as_str())
                .filter(|s| !s.is_empty())
        };

        let customer_sku_raw = get(ColumnField::CustomerSku).map(str::to_string);
        let description = get(ColumnField::Description).map(str::to_string);
        if customer_sku_raw.is_none() && description.is_none() {
            continue;
        }

        let uom = match get(ColumnField::Uom) {
            Some(raw) => match canonical_uom(raw) {
                Some(code) => Some(code.to_string()),
                None => {
                    output.push_warning(
                        warning_codes::UNKNOWN_UOM,
                        format!("unmapped unit '{raw}'"),
                    );
                    None
                }
            },
            None => None,
        };

        output.lines.push(LineItem {
            line_no: 0,
            customer_sku_raw,
            product_description: description,
            qty: get(ColumnField::Qty).and_then(numeric::parse_decimal),
            uom,
            unit_price: get(ColumnField::UnitPrice).and_then(numeric::parse_decimal),
            currency: get(ColumnField::Currency).map(|c| c.to_uppercase()),
            requested_delivery_date: get(ColumnField::DeliveryDate)
                .and_then(numeric::parse_date),
        });
    }

    output.renumber_lines();
    if output.lines.is_empty() {
        output.push_warning(warning_codes::NO_LINES, "table header found but no data rows");
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV_DOC: &str = "\
Bestellnummer: PO-2025-001;;;;
Datum: 2025-01-04;;;;
Währung: EUR;;;;
Pos;Artikelnummer;Bezeichnung;Menge;Einheit;E-Preis
1;ABC-123;Kabel NYM-J 3x1,5;10;M;1,23
2;DEF-456;Schalter weiß;5;Stk;4,50
3;GHI-789;Dose;20;ST;0,80
";

    #[test]
    fn csv_happy_path() {
        let output = extract_from_csv(CSV_DOC.as_bytes()).unwrap();
        assert_eq!(output.extractor_version, CSV_RULE_V1);
        assert_eq!(output.order.external_order_number.as_deref(), Some("PO-2025-001"));
        assert_eq!(output.order.currency.as_deref(), Some("EUR"));
        assert_eq!(output.lines.len(), 3);

        let first = &output.lines[0];
        assert_eq!(first.line_no, 1);
        assert_eq!(first.customer_sku_raw.as_deref(), Some("ABC-123"));
        assert_eq!(first.qty, Some(10.0));
        assert_eq!(first.uom.as_deref(), Some("M"));
        assert_eq!(first.unit_price, Some(1.23));

        let second = &output.lines[1];
        assert_eq!(second.uom.as_deref(), Some("ST"));
        assert!(output.validate().is_ok());
    }

    #[test]
    fn comma_delimited_with_english_headers() {
        let doc = "\
Order No: 4711,,,,
Line,SKU,Description,Qty,Unit,Unit Price
1,X-1,Widget large,2,pcs,10.50
";
        let output = extract_from_csv(doc.as_bytes()).unwrap();
        assert_eq!(output.order.external_order_number.as_deref(), Some("4711"));
        assert_eq!(output.lines.len(), 1);
        assert_eq!(output.lines[0].uom.as_deref(), Some("ST"));
        assert_eq!(output.lines[0].unit_price, Some(10.5));
    }

    #[test]
    fn unknown_uom_becomes_warning() {
        let doc = "Pos;Artikelnummer;Bezeichnung;Menge;Einheit\n1;A-1;Teil;3;Furlong\n";
        let output = extract_from_csv(doc.as_bytes()).unwrap();
        assert_eq!(output.lines[0].uom, None);
        assert!(output
            .warnings
            .iter()
            .any(|w| w.code == warning_codes::UNKNOWN_UOM));
    }

    #[test]
    fn headerless_file_reports_no_lines() {
        let doc = "just some text\nwithout any table\n";
        let output = extract_from_csv(doc.as_bytes()).unwrap();
        assert!(output.lines.is_empty());
        assert!(output
            .warnings
            .iter()
            .any(|w| w.code == warning_codes::NO_LINES));
    }

    #[test]
    fn rows_without_sku_or_description_are_skipped() {
        let doc = "Pos;Artikelnummer;Bezeichnung;Menge\n1;A-1;Teil;3\n;;;\n2;;;5\n";
        let output = extract_from_csv(doc.as_bytes()).unwrap();
        assert_eq!(output.lines.len(), 1);
    }
}
