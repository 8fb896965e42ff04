//! SQLite-backed persistence.
//!
//! One database handle shared across the process; WAL mode for concurrent
//! reads during writes, prepared statement caching for hot paths. Every
//! tenant-scoped table carries `tenant_id` and every query filters on it, so
//! a foreign tenant id in a payload simply finds nothing.

pub mod catalog;
pub mod ops;
pub mod orders;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::IssueSeverity;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tenant (
    id TEXT PRIMARY KEY,
    slug TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    settings_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS inbound_message (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    from_email TEXT,
    to_email TEXT,
    subject TEXT,
    status TEXT NOT NULL,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_inbound_message_tenant
    ON inbound_message(tenant_id, created_at DESC);

CREATE TABLE IF NOT EXISTS document (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    message_id TEXT,
    sha256 TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    storage_key TEXT NOT NULL,
    file_name TEXT NOT NULL,
    source TEXT NOT NULL,
    sender_email TEXT,
    status TEXT NOT NULL,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_document_tenant_hash ON document(tenant_id, sha256);
CREATE INDEX IF NOT EXISTS idx_document_tenant_status ON document(tenant_id, status);

CREATE TABLE IF NOT EXISTS extraction_run (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    document_id TEXT NOT NULL,
    method TEXT NOT NULL,
    extractor_version TEXT NOT NULL,
    input_hash TEXT NOT NULL,
    output_json TEXT,
    confidence REAL NOT NULL DEFAULT 0,
    runtime_ms INTEGER NOT NULL DEFAULT 0,
    text_coverage REAL,
    status TEXT NOT NULL,
    error_code TEXT,
    error_message TEXT,
    warnings_json TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_extraction_run_document
    ON extraction_run(tenant_id, document_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_extraction_run_hash
    ON extraction_run(tenant_id, input_hash, extractor_version);

CREATE TABLE IF NOT EXISTS customer (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    erp_customer_number TEXT,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_customer_tenant ON customer(tenant_id, active);
CREATE INDEX IF NOT EXISTS idx_customer_erp_number ON customer(tenant_id, erp_customer_number);

CREATE TABLE IF NOT EXISTS customer_contact (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    customer_id TEXT NOT NULL,
    email TEXT NOT NULL,
    is_primary INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_contact_unique ON customer_contact(customer_id, email);
CREATE INDEX IF NOT EXISTS idx_contact_email ON customer_contact(tenant_id, email);

CREATE TABLE IF NOT EXISTS product (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    internal_sku TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    base_uom TEXT NOT NULL,
    uom_conversions_json TEXT NOT NULL DEFAULT '{}',
    attributes_json TEXT NOT NULL DEFAULT '{}',
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_product_sku ON product(tenant_id, internal_sku);

CREATE TABLE IF NOT EXISTS product_embedding (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    product_id TEXT NOT NULL,
    model TEXT NOT NULL,
    vector BLOB NOT NULL,
    text_hash TEXT NOT NULL,
    source_updated_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_embedding_unique
    ON product_embedding(tenant_id, product_id, model);

CREATE TABLE IF NOT EXISTS customer_price (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    customer_id TEXT NOT NULL,
    internal_sku TEXT NOT NULL,
    currency TEXT NOT NULL,
    uom TEXT NOT NULL,
    min_qty REAL NOT NULL DEFAULT 1,
    unit_price_micros INTEGER NOT NULL,
    valid_from TEXT,
    valid_to TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_customer_price_lookup
    ON customer_price(tenant_id, customer_id, internal_sku);

CREATE TABLE IF NOT EXISTS sku_mapping (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    customer_id TEXT NOT NULL,
    customer_sku_norm TEXT NOT NULL,
    internal_sku TEXT NOT NULL,
    status TEXT NOT NULL,
    support_count INTEGER NOT NULL DEFAULT 0,
    reject_count INTEGER NOT NULL DEFAULT 0,
    uom_factor REAL,
    last_used_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_sku_mapping_active
    ON sku_mapping(tenant_id, customer_id, customer_sku_norm)
    WHERE status IN ('SUGGESTED', 'CONFIRMED');

CREATE TABLE IF NOT EXISTS draft_order (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    customer_id TEXT,
    document_id TEXT,
    extraction_run_id TEXT,
    external_order_number TEXT,
    order_date TEXT,
    requested_delivery_date TEXT,
    currency TEXT,
    ship_to_json TEXT,
    bill_to_json TEXT,
    notes TEXT,
    status TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    approved_by TEXT,
    approved_at TEXT,
    erp_order_ref TEXT,
    pushed_at TEXT,
    deleted_at TEXT,
    ready_json TEXT,
    overall_confidence REAL,
    extraction_confidence REAL,
    customer_confidence REAL,
    matching_confidence REAL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_draft_tenant_status ON draft_order(tenant_id, status);
CREATE INDEX IF NOT EXISTS idx_draft_document ON draft_order(tenant_id, document_id);

CREATE TABLE IF NOT EXISTS draft_order_line (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    draft_id TEXT NOT NULL,
    line_no INTEGER NOT NULL,
    customer_sku_raw TEXT,
    customer_sku_norm TEXT,
    internal_sku TEXT,
    description TEXT,
    qty REAL,
    uom TEXT,
    unit_price_micros INTEGER,
    currency TEXT,
    requested_delivery_date TEXT,
    match_method TEXT,
    match_confidence REAL,
    candidates_json TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_draft_line_draft ON draft_order_line(draft_id, line_no);

CREATE TABLE IF NOT EXISTS validation_issue (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    draft_id TEXT NOT NULL,
    line_id TEXT,
    line_no INTEGER,
    issue_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    status TEXT NOT NULL,
    message TEXT NOT NULL,
    details_json TEXT NOT NULL DEFAULT '{}',
    resolved_at TEXT,
    resolved_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_issue_draft ON validation_issue(tenant_id, draft_id, status);

CREATE TABLE IF NOT EXISTS erp_connection (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    connector_type TEXT NOT NULL,
    config_encrypted TEXT NOT NULL,
    status TEXT NOT NULL,
    last_test_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_connection_active
    ON erp_connection(tenant_id, connector_type)
    WHERE status = 'ACTIVE';

CREATE TABLE IF NOT EXISTS erp_export (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    draft_id TEXT NOT NULL,
    connection_id TEXT NOT NULL,
    draft_version INTEGER NOT NULL,
    idempotency_key TEXT NOT NULL UNIQUE,
    storage_key TEXT,
    dropzone_path TEXT,
    file_name TEXT,
    status TEXT NOT NULL,
    erp_order_id TEXT,
    error_json TEXT,
    attempt INTEGER NOT NULL DEFAULT 1,
    latency_ms INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_export_draft ON erp_export(tenant_id, draft_id, created_at DESC);

CREATE TABLE IF NOT EXISTS ai_call_log (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    call_type TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    input_hash TEXT NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    latency_ms INTEGER NOT NULL DEFAULT 0,
    cost_micros INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    error_json TEXT,
    result_json TEXT,
    document_id TEXT,
    draft_id TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ai_call_hash ON ai_call_log(tenant_id, call_type, input_hash, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_ai_call_day ON ai_call_log(tenant_id, created_at);

CREATE TABLE IF NOT EXISTS feedback_event (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    entity_id TEXT,
    actor TEXT,
    payload_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_feedback_tenant ON feedback_event(tenant_id, created_at DESC);
"#;

/// Shared database handle. Cheap to clone; callers hold the lock only for
/// the duration of one unit of work.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open orderflow db")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory db")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        conn.execute_batch(SCHEMA_SQL).context("init schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

/// Per-tenant settings stored as JSON on the tenant row. Unknown keys are
/// ignored, missing keys fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantSettings {
    #[serde(default = "default_currency")]
    pub default_currency: String,
    #[serde(default)]
    pub daily_budget_micros: i64,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_llm_trigger_confidence")]
    pub llm_trigger_confidence: f64,
    #[serde(default = "default_max_pages_for_llm")]
    pub max_pages_for_llm: u32,
    #[serde(default = "default_max_qty")]
    pub max_qty: f64,
    #[serde(default = "default_header_weight")]
    pub header_weight: f64,
    #[serde(default = "default_lines_weight")]
    pub lines_weight: f64,
    #[serde(default = "default_auto_select_threshold")]
    pub auto_select_threshold: f64,
    #[serde(default = "default_min_gap")]
    pub min_gap: f64,
    #[serde(default = "default_auto_apply_threshold")]
    pub auto_apply_threshold: f64,
    #[serde(default = "default_auto_apply_gap")]
    pub auto_apply_gap: f64,
    #[serde(default = "default_price_tolerance_percent")]
    pub price_tolerance_percent: f64,
    #[serde(default = "default_price_mismatch_severity")]
    pub price_mismatch_severity: IssueSeverity,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_currency() -> String {
    "EUR".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_llm_trigger_confidence() -> f64 {
    0.60
}
fn default_max_pages_for_llm() -> u32 {
    20
}
fn default_max_qty() -> f64 {
    1_000_000.0
}
fn default_header_weight() -> f64 {
    0.4
}
fn default_lines_weight() -> f64 {
    0.6
}
fn default_auto_select_threshold() -> f64 {
    0.90
}
fn default_min_gap() -> f64 {
    0.07
}
fn default_auto_apply_threshold() -> f64 {
    0.92
}
fn default_auto_apply_gap() -> f64 {
    0.10
}
fn default_price_tolerance_percent() -> f64 {
    5.0
}
fn default_price_mismatch_severity() -> IssueSeverity {
    IssueSeverity::Warning
}
fn default_max_file_bytes() -> u64 {
    25 * 1024 * 1024
}
fn default_retention_days() -> u32 {
    365
}

impl Default for TenantSettings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("settings defaults")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRow {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub settings: TenantSettings,
    pub created_at: String,
    pub updated_at: String,
}

impl Db {
    pub async fn insert_tenant(&self, id: &str, slug: &str, name: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO tenant (id, slug, name, settings_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, '{}', ?4, ?4)",
            params![id, slug, name, now],
        )
        .context("insert tenant")?;
        Ok(())
    }

    pub async fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, slug, name, settings_json, created_at, updated_at
             FROM tenant WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![tenant_id])?;
        if let Some(row) = rows.next()? {
            let settings_json: String = row.get(3)?;
            let settings: TenantSettings =
                serde_json::from_str(&settings_json).unwrap_or_default();
            Ok(Some(TenantRow {
                id: row.get(0)?,
                slug: row.get(1)?,
                name: row.get(2)?,
                settings,
                created_at: row.get(4)?,
                updated_at: row.get(5)?,
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn tenant_settings(&self, tenant_id: &str) -> Result<TenantSettings> {
        Ok(self
            .get_tenant(tenant_id)
            .await?
            .map(|t| t.settings)
            .unwrap_or_default())
    }

    pub async fn update_tenant_settings(
        &self,
        tenant_id: &str,
        settings: &TenantSettings,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let json = serde_json::to_string(settings)?;
        let conn = self.lock().await;
        conn.execute(
            "UPDATE tenant SET settings_json = ?2, updated_at = ?3 WHERE id = ?1",
            params![tenant_id, json, now],
        )
        .context("update tenant settings")?;
        Ok(())
    }

    pub async fn list_tenants(&self) -> Result<Vec<TenantRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, slug, name, settings_json, created_at, updated_at FROM tenant ORDER BY slug",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let settings_json: String = row.get(3)?;
            out.push(TenantRow {
                id: row.get(0)?,
                slug: row.get(1)?,
                name: row.get(2)?,
                settings: serde_json::from_str(&settings_json).unwrap_or_default(),
                created_at: row.get(4)?,
                updated_at: row.get(5)?,
            });
        }
        Ok(out)
    }
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settings_fall_back_to_defaults() {
        let db = Db::open_in_memory().unwrap();
        db.insert_tenant("t1", "acme", "Acme GmbH").await.unwrap();
        let settings = db.tenant_settings("t1").await.unwrap();
        assert_eq!(settings.default_currency, "EUR");
        assert_eq!(settings.daily_budget_micros, 0);
        assert!((settings.auto_apply_threshold - 0.92).abs() < 1e-9);
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let db = Db::open_in_memory().unwrap();
        db.insert_tenant("t1", "acme", "Acme GmbH").await.unwrap();
        let mut settings = db.tenant_settings("t1").await.unwrap();
        settings.daily_budget_micros = 5_000_000;
        settings.price_mismatch_severity = IssueSeverity::Error;
        db.update_tenant_settings("t1", &settings).await.unwrap();
        let loaded = db.tenant_settings("t1").await.unwrap();
        assert_eq!(loaded.daily_budget_micros, 5_000_000);
        assert_eq!(loaded.price_mismatch_severity, IssueSeverity::Error);
    }

    #[tokio::test]
    async fn unknown_tenant_yields_defaults() {
        let db = Db::open_in_memory().unwrap();
        let settings = db.tenant_settings("missing").await.unwrap();
        assert_eq!(settings.default_currency, "EUR");
    }
}
