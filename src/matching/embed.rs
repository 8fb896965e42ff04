//! Canonical embedding texts and vector math.
//!
//! Texts are deterministic so the same product state always hashes to the
//! same `text_hash`, which is what makes re-embedding idempotent.

use sha2::{Digest, Sha256};

use crate::store::catalog::ProductRow;

/// Canonical product text: SKU / NAME / DESC / ATTR / UOM lines, compact and
/// key-sorted so formatting never shifts the hash.
pub fn product_embedding_text(product: &ProductRow) -> String {
    let manufacturer = product.attributes.get("manufacturer").cloned().unwrap_or_default();
    let ean = product.attributes.get("ean").cloned().unwrap_or_default();
    let category = product.attributes.get("category").cloned().unwrap_or_default();

    let mut conversions: Vec<(&String, &f64)> = product.uom_conversions.iter().collect();
    conversions.sort_by(|a, b| a.0.cmp(b.0));
    let conv_compact = conversions
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "SKU: {}\nNAME: {}\nDESC: {}\nATTR: {};{};{}\nUOM: base={}; conv={{{}}}\n",
        product.internal_sku,
        product.name,
        product.description.as_deref().unwrap_or(""),
        manufacturer,
        ean,
        category,
        product.base_uom,
        conv_compact,
    )
}

/// Canonical query text for matching a draft line against the catalog.
pub fn query_embedding_text(
    customer_sku_raw: Option<&str>,
    description: Option<&str>,
    uom: Option<&str>,
) -> String {
    format!(
        "CUSTOMER_SKU: {}\nDESC: {}\nUOM: {}\n",
        customer_sku_raw.unwrap_or(""),
        description.unwrap_or(""),
        uom.unwrap_or(""),
    )
}

pub fn text_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Cosine similarity; zero vectors score zero.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::new_id;
    use std::collections::HashMap;

    #[test]
    fn product_text_is_deterministic() {
        let mut attributes = HashMap::new();
        attributes.insert("manufacturer".to_string(), "ACME".to_string());
        let mut conversions = HashMap::new();
        conversions.insert("ROLL".to_string(), 100.0);
        conversions.insert("KM".to_string(), 1000.0);
        let product = ProductRow {
            id: new_id(),
            tenant_id: "t1".into(),
            internal_sku: "ABC-123".into(),
            name: "Kabel NYM-J".into(),
            description: Some("Installationskabel".into()),
            base_uom: "M".into(),
            uom_conversions: conversions,
            attributes,
            active: true,
        };
        let a = product_embedding_text(&product);
        let b = product_embedding_text(&product);
        assert_eq!(a, b);
        assert!(a.starts_with("SKU: ABC-123\n"));
        assert!(a.contains("conv={KM:1000,ROLL:100}"));
        assert_eq!(text_hash(&a), text_hash(&b));
    }

    #[test]
    fn query_text_tolerates_missing_fields() {
        let text = query_embedding_text(Some("XYZ-99"), None, Some("M"));
        assert_eq!(text, "CUSTOMER_SKU: XYZ-99\nDESC: \nUOM: M\n");
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!((cosine(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-9);
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-9);
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[0.0], &[0.0]), 0.0);
    }
}
