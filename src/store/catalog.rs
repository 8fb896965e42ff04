//! Catalog storage: customers, contacts, products, embeddings, prices and
//! learned SKU mappings.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{new_id, now_rfc3339, Db};
use crate::models::MappingStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerRow {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub erp_customer_number: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerContactRow {
    pub id: String,
    pub tenant_id: String,
    pub customer_id: String,
    pub email: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRow {
    pub id: String,
    pub tenant_id: String,
    pub internal_sku: String,
    pub name: String,
    pub description: Option<String>,
    pub base_uom: String,
    /// UoM code -> multiplier to the base UoM.
    pub uom_conversions: HashMap<String, f64>,
    pub attributes: HashMap<String, String>,
    pub active: bool,
}

impl ProductRow {
    pub fn uom_compatible(&self, line_uom: &str) -> bool {
        line_uom == self.base_uom || self.uom_conversions.contains_key(line_uom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerPriceRow {
    pub id: String,
    pub tenant_id: String,
    pub customer_id: String,
    pub internal_sku: String,
    pub currency: String,
    pub uom: String,
    pub min_qty: f64,
    pub unit_price_micros: i64,
    pub valid_from: Option<String>,
    pub valid_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkuMappingRow {
    pub id: String,
    pub tenant_id: String,
    pub customer_id: String,
    pub customer_sku_norm: String,
    pub internal_sku: String,
    pub status: MappingStatus,
    pub support_count: i64,
    pub reject_count: i64,
    pub uom_factor: Option<f64>,
    pub last_used_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProductEmbeddingRow {
    pub id: String,
    pub tenant_id: String,
    pub product_id: String,
    pub model: String,
    pub vector: Vec<f32>,
    pub text_hash: String,
}

fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

impl Db {
    pub async fn insert_customer(
        &self,
        tenant_id: &str,
        name: &str,
        erp_customer_number: Option<&str>,
    ) -> Result<String> {
        let id = new_id();
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO customer (id, tenant_id, name, erp_customer_number, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
            params![id, tenant_id, name, erp_customer_number, now],
        )
        .context("insert customer")?;
        Ok(id)
    }

    pub async fn get_customer(&self, tenant_id: &str, customer_id: &str) -> Result<Option<CustomerRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, name, erp_customer_number, active
             FROM customer WHERE tenant_id = ?1 AND id = ?2",
        )?;
        let row = stmt
            .query_row(params![tenant_id, customer_id], |row| {
                Ok(CustomerRow {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    name: row.get(2)?,
                    erp_customer_number: row.get(3)?,
                    active: row.get::<_, i64>(4)? != 0,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub async fn find_customer_by_erp_number(
        &self,
        tenant_id: &str,
        erp_number: &str,
    ) -> Result<Option<CustomerRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, name, erp_customer_number, active
             FROM customer WHERE tenant_id = ?1 AND erp_customer_number = ?2 AND active = 1",
        )?;
        let row = stmt
            .query_row(params![tenant_id, erp_number], |row| {
                Ok(CustomerRow {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    name: row.get(2)?,
                    erp_customer_number: row.get(3)?,
                    active: row.get::<_, i64>(4)? != 0,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub async fn list_active_customers(&self, tenant_id: &str) -> Result<Vec<CustomerRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, name, erp_customer_number, active
             FROM customer WHERE tenant_id = ?1 AND active = 1 ORDER BY name",
        )?;
        let mut rows = stmt.query(params![tenant_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(CustomerRow {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                name: row.get(2)?,
                erp_customer_number: row.get(3)?,
                active: row.get::<_, i64>(4)? != 0,
            });
        }
        Ok(out)
    }

    pub async fn insert_contact(
        &self,
        tenant_id: &str,
        customer_id: &str,
        email: &str,
        is_primary: bool,
    ) -> Result<String> {
        let id = new_id();
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO customer_contact (id, tenant_id, customer_id, email, is_primary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, tenant_id, customer_id, email.to_lowercase(), is_primary as i64, now],
        )
        .context("insert contact")?;
        Ok(id)
    }

    pub async fn contacts_by_email(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> Result<Vec<CustomerContactRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT c.id, c.tenant_id, c.customer_id, c.email, c.is_primary
             FROM customer_contact c
             JOIN customer cu ON cu.id = c.customer_id
             WHERE c.tenant_id = ?1 AND c.email = ?2 AND cu.active = 1",
        )?;
        let mut rows = stmt.query(params![tenant_id, email.to_lowercase()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(CustomerContactRow {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                customer_id: row.get(2)?,
                email: row.get(3)?,
                is_primary: row.get::<_, i64>(4)? != 0,
            });
        }
        Ok(out)
    }

    pub async fn contacts_by_domain(
        &self,
        tenant_id: &str,
        domain: &str,
    ) -> Result<Vec<CustomerContactRow>> {
        let pattern = format!("%@{}", domain.to_lowercase());
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT c.id, c.tenant_id, c.customer_id, c.email, c.is_primary
             FROM customer_contact c
             JOIN customer cu ON cu.id = c.customer_id
             WHERE c.tenant_id = ?1 AND c.email LIKE ?2 AND cu.active = 1",
        )?;
        let mut rows = stmt.query(params![tenant_id, pattern])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(CustomerContactRow {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                customer_id: row.get(2)?,
                email: row.get(3)?,
                is_primary: row.get::<_, i64>(4)? != 0,
            });
        }
        Ok(out)
    }

    pub async fn insert_product(&self, product: &ProductRow) -> Result<()> {
        let now = now_rfc3339();
        let conversions = serde_json::to_string(&product.uom_conversions)?;
        let attributes = serde_json::to_string(&product.attributes)?;
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO product (id, tenant_id, internal_sku, name, description, base_uom,
                                  uom_conversions_json, attributes_json, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                product.id,
                product.tenant_id,
                product.internal_sku,
                product.name,
                product.description,
                product.base_uom,
                conversions,
                attributes,
                product.active as i64,
                now
            ],
        )
        .context("insert product")?;
        Ok(())
    }

    fn product_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProductRow> {
        let conversions_json: String = row.get(6)?;
        let attributes_json: String = row.get(7)?;
        Ok(ProductRow {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            internal_sku: row.get(2)?,
            name: row.get(3)?,
            description: row.get(4)?,
            base_uom: row.get(5)?,
            uom_conversions: serde_json::from_str(&conversions_json).unwrap_or_default(),
            attributes: serde_json::from_str(&attributes_json).unwrap_or_default(),
            active: row.get::<_, i64>(8)? != 0,
        })
    }

    pub async fn get_product_by_sku(
        &self,
        tenant_id: &str,
        internal_sku: &str,
    ) -> Result<Option<ProductRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, internal_sku, name, description, base_uom,
                    uom_conversions_json, attributes_json, active
             FROM product WHERE tenant_id = ?1 AND internal_sku = ?2",
        )?;
        let row = stmt
            .query_row(params![tenant_id, internal_sku], Self::product_from_row)
            .optional()?;
        Ok(row)
    }

    pub async fn get_product(&self, tenant_id: &str, product_id: &str) -> Result<Option<ProductRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, internal_sku, name, description, base_uom,
                    uom_conversions_json, attributes_json, active
             FROM product WHERE tenant_id = ?1 AND id = ?2",
        )?;
        let row = stmt
            .query_row(params![tenant_id, product_id], Self::product_from_row)
            .optional()?;
        Ok(row)
    }

    pub async fn list_active_products(&self, tenant_id: &str) -> Result<Vec<ProductRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, internal_sku, name, description, base_uom,
                    uom_conversions_json, attributes_json, active
             FROM product WHERE tenant_id = ?1 AND active = 1",
        )?;
        let mut rows = stmt.query(params![tenant_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::product_from_row(row)?);
        }
        Ok(out)
    }

    /// Products keyed by internal SKU, used as a per-run cache by validation.
    pub async fn products_by_sku(&self, tenant_id: &str) -> Result<HashMap<String, ProductRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, internal_sku, name, description, base_uom,
                    uom_conversions_json, attributes_json, active
             FROM product WHERE tenant_id = ?1",
        )?;
        let mut rows = stmt.query(params![tenant_id])?;
        let mut out = HashMap::new();
        while let Some(row) = rows.next()? {
            let product = Self::product_from_row(row)?;
            out.insert(product.internal_sku.clone(), product);
        }
        Ok(out)
    }

    pub async fn upsert_embedding(&self, embedding: &ProductEmbeddingRow) -> Result<()> {
        let now = now_rfc3339();
        let blob = vector_to_blob(&embedding.vector);
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO product_embedding (id, tenant_id, product_id, model, vector, text_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT (tenant_id, product_id, model)
             DO UPDATE SET vector = ?5, text_hash = ?6, updated_at = ?7",
            params![
                embedding.id,
                embedding.tenant_id,
                embedding.product_id,
                embedding.model,
                blob,
                embedding.text_hash,
                now
            ],
        )
        .context("upsert embedding")?;
        Ok(())
    }

    pub async fn get_embedding(
        &self,
        tenant_id: &str,
        product_id: &str,
        model: &str,
    ) -> Result<Option<ProductEmbeddingRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, product_id, model, vector, text_hash
             FROM product_embedding WHERE tenant_id = ?1 AND product_id = ?2 AND model = ?3",
        )?;
        let row = stmt
            .query_row(params![tenant_id, product_id, model], |row| {
                let blob: Vec<u8> = row.get(4)?;
                Ok(ProductEmbeddingRow {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    product_id: row.get(2)?,
                    model: row.get(3)?,
                    vector: blob_to_vector(&blob),
                    text_hash: row.get(5)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    /// All embeddings for (tenant, model), joined to active products.
    pub async fn embeddings_for_model(
        &self,
        tenant_id: &str,
        model: &str,
    ) -> Result<Vec<(String, Vec<f32>)>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT e.product_id, e.vector
             FROM product_embedding e
             JOIN product p ON p.id = e.product_id
             WHERE e.tenant_id = ?1 AND e.model = ?2 AND p.active = 1",
        )?;
        let mut rows = stmt.query(params![tenant_id, model])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(1)?;
            out.push((row.get(0)?, blob_to_vector(&blob)));
        }
        Ok(out)
    }

    pub async fn insert_customer_price(&self, price: &CustomerPriceRow) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO customer_price (id, tenant_id, customer_id, internal_sku, currency, uom,
                                         min_qty, unit_price_micros, valid_from, valid_to, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                price.id,
                price.tenant_id,
                price.customer_id,
                price.internal_sku,
                price.currency,
                price.uom,
                price.min_qty,
                price.unit_price_micros,
                price.valid_from,
                price.valid_to,
                now
            ],
        )
        .context("insert customer price")?;
        Ok(())
    }

    pub async fn customer_prices(
        &self,
        tenant_id: &str,
        customer_id: &str,
    ) -> Result<Vec<CustomerPriceRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, customer_id, internal_sku, currency, uom, min_qty,
                    unit_price_micros, valid_from, valid_to
             FROM customer_price WHERE tenant_id = ?1 AND customer_id = ?2",
        )?;
        let mut rows = stmt.query(params![tenant_id, customer_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(CustomerPriceRow {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                customer_id: row.get(2)?,
                internal_sku: row.get(3)?,
                currency: row.get(4)?,
                uom: row.get(5)?,
                min_qty: row.get(6)?,
                unit_price_micros: row.get(7)?,
                valid_from: row.get(8)?,
                valid_to: row.get(9)?,
            });
        }
        Ok(out)
    }

    fn mapping_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SkuMappingRow> {
        let status: String = row.get(5)?;
        Ok(SkuMappingRow {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            customer_id: row.get(2)?,
            customer_sku_norm: row.get(3)?,
            internal_sku: row.get(4)?,
            status: MappingStatus::parse(&status).unwrap_or(MappingStatus::Deprecated),
            support_count: row.get(6)?,
            reject_count: row.get(7)?,
            uom_factor: row.get(8)?,
            last_used_at: row.get(9)?,
        })
    }

    pub async fn insert_mapping(&self, mapping: &SkuMappingRow) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO sku_mapping (id, tenant_id, customer_id, customer_sku_norm, internal_sku,
                                      status, support_count, reject_count, uom_factor, last_used_at,
                                      created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                mapping.id,
                mapping.tenant_id,
                mapping.customer_id,
                mapping.customer_sku_norm,
                mapping.internal_sku,
                mapping.status.as_str(),
                mapping.support_count,
                mapping.reject_count,
                mapping.uom_factor,
                mapping.last_used_at,
                now
            ],
        )
        .context("insert sku mapping")?;
        Ok(())
    }

    pub async fn find_confirmed_mapping(
        &self,
        tenant_id: &str,
        customer_id: &str,
        customer_sku_norm: &str,
    ) -> Result<Option<SkuMappingRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, customer_id, customer_sku_norm, internal_sku, status,
                    support_count, reject_count, uom_factor, last_used_at
             FROM sku_mapping
             WHERE tenant_id = ?1 AND customer_id = ?2 AND customer_sku_norm = ?3
               AND status = 'CONFIRMED'",
        )?;
        let row = stmt
            .query_row(
                params![tenant_id, customer_id, customer_sku_norm],
                Self::mapping_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub async fn get_mapping(&self, tenant_id: &str, mapping_id: &str) -> Result<Option<SkuMappingRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, customer_id, customer_sku_norm, internal_sku, status,
                    support_count, reject_count, uom_factor, last_used_at
             FROM sku_mapping WHERE tenant_id = ?1 AND id = ?2",
        )?;
        let row = stmt
            .query_row(params![tenant_id, mapping_id], Self::mapping_from_row)
            .optional()?;
        Ok(row)
    }

    pub async fn set_mapping_status(
        &self,
        tenant_id: &str,
        mapping_id: &str,
        status: MappingStatus,
    ) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "UPDATE sku_mapping SET status = ?3, updated_at = ?4
             WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, mapping_id, status.as_str(), now],
        )
        .context("set mapping status")?;
        Ok(())
    }

    pub async fn bump_mapping_support(&self, tenant_id: &str, mapping_id: &str) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "UPDATE sku_mapping
             SET support_count = support_count + 1, last_used_at = ?3, updated_at = ?3
             WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, mapping_id, now],
        )?;
        Ok(())
    }

    pub async fn bump_mapping_reject(&self, tenant_id: &str, mapping_id: &str) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "UPDATE sku_mapping
             SET reject_count = reject_count + 1, updated_at = ?3
             WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, mapping_id, now],
        )?;
        Ok(())
    }

    pub async fn touch_mapping_used(&self, tenant_id: &str, mapping_id: &str) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "UPDATE sku_mapping SET last_used_at = ?3 WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, mapping_id, now],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(tenant: &str, sku: &str, base_uom: &str) -> ProductRow {
        ProductRow {
            id: new_id(),
            tenant_id: tenant.to_string(),
            internal_sku: sku.to_string(),
            name: format!("Product {sku}"),
            description: None,
            base_uom: base_uom.to_string(),
            uom_conversions: HashMap::new(),
            attributes: HashMap::new(),
            active: true,
        }
    }

    #[tokio::test]
    async fn product_lookup_is_tenant_scoped() {
        let db = Db::open_in_memory().unwrap();
        db.insert_product(&product("t1", "INT-1", "ST")).await.unwrap();
        assert!(db.get_product_by_sku("t1", "INT-1").await.unwrap().is_some());
        assert!(db.get_product_by_sku("t2", "INT-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn embedding_upsert_is_unique_per_model() {
        let db = Db::open_in_memory().unwrap();
        let p = product("t1", "INT-1", "ST");
        db.insert_product(&p).await.unwrap();
        for hash in ["h1", "h2"] {
            db.upsert_embedding(&ProductEmbeddingRow {
                id: new_id(),
                tenant_id: "t1".into(),
                product_id: p.id.clone(),
                model: "text-embedding-3-small".into(),
                vector: vec![0.1, 0.2, 0.3],
                text_hash: hash.into(),
            })
            .await
            .unwrap();
        }
        let stored = db
            .get_embedding("t1", &p.id, "text-embedding-3-small")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.text_hash, "h2");
        assert_eq!(stored.vector.len(), 3);
        let all = db
            .embeddings_for_model("t1", "text-embedding-3-small")
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn confirmed_mapping_lookup() {
        let db = Db::open_in_memory().unwrap();
        let mapping = SkuMappingRow {
            id: new_id(),
            tenant_id: "t1".into(),
            customer_id: "c1".into(),
            customer_sku_norm: "XYZ99".into(),
            internal_sku: "INT-777".into(),
            status: MappingStatus::Confirmed,
            support_count: 1,
            reject_count: 0,
            uom_factor: None,
            last_used_at: None,
        };
        db.insert_mapping(&mapping).await.unwrap();
        let found = db
            .find_confirmed_mapping("t1", "c1", "XYZ99")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.internal_sku, "INT-777");
        assert!(db
            .find_confirmed_mapping("t1", "c1", "OTHER")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn vector_blob_round_trip() {
        let v = vec![0.25_f32, -1.5, 3.75];
        assert_eq!(blob_to_vector(&vector_to_blob(&v)), v);
    }
}
