//! ERP export connector (`DROPZONE_JSON_V1`): renders the canonical export
//! document, archives it, drops it atomically into the dropzone and records
//! the export.

pub mod ack;
pub mod crypto;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::error::{ExportError, StateError};
use crate::models::{DraftStatus, ExportStatus};
use crate::objectstore::ObjectStore;
use crate::store::ops::{ErpConnectionRow, ErpExportRow};
use crate::store::orders::{DraftLineRow, DraftOrderRow};
use crate::store::{new_id, Db};

pub const CONNECTOR_DROPZONE_JSON_V1: &str = "DROPZONE_JSON_V1";
pub const EXPORT_FORMAT_VERSION: &str = "orderflow_export_json_v1";

/// Decrypted connection configuration for the dropzone connector. SFTP is a
/// second transport behind the same shape; only `filesystem` ships in-tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    pub export_path: String,
    #[serde(default)]
    pub ack_path: Option<String>,
    #[serde(default = "default_true")]
    pub atomic_write: bool,
}

fn default_mode() -> String {
    "filesystem".to_string()
}
fn default_true() -> bool {
    true
}

/// File operations against a dropzone directory tree.
pub trait DropzoneTransport: Send + Sync {
    fn ensure_dir(&self, dir: &Path) -> Result<()>;
    /// Write `{dir}/{name}` via `{name}.tmp` + rename.
    fn write_atomic(&self, dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf>;
    fn list_files(&self, dir: &Path) -> Result<Vec<String>>;
    fn read_file(&self, dir: &Path, name: &str) -> Result<Vec<u8>>;
    /// Move `{dir}/{name}` into `{dir}/{subdir}/{name}`, creating the subdir.
    fn move_to_subdir(&self, dir: &Path, name: &str, subdir: &str) -> Result<PathBuf>;
}

pub struct FsDropzone;

impl DropzoneTransport for FsDropzone {
    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))
    }

    fn write_atomic(&self, dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        self.ensure_dir(dir)?;
        let target = dir.join(name);
        let tmp = dir.join(format!("{name}.tmp"));
        std::fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &target)
            .with_context(|| format!("rename to {}", target.display()))?;
        Ok(target)
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<String>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
            let entry = entry?;
            if entry.path().is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn read_file(&self, dir: &Path, name: &str) -> Result<Vec<u8>> {
        let path = dir.join(name);
        std::fs::read(&path).with_context(|| format!("read {}", path.display()))
    }

    fn move_to_subdir(&self, dir: &Path, name: &str, subdir: &str) -> Result<PathBuf> {
        let target_dir = dir.join(subdir);
        self.ensure_dir(&target_dir)?;
        let from = dir.join(name);
        let to = target_dir.join(name);
        std::fs::rename(&from, &to)
            .with_context(|| format!("move {} to {}", from.display(), to.display()))?;
        Ok(to)
    }
}

/// Deterministic idempotency key over (tenant, draft, version).
pub fn idempotency_key(tenant_id: &str, draft_id: &str, draft_version: i64) -> String {
    hex::encode(Sha256::digest(
        format!("{tenant_id}:{draft_id}:{draft_version}").as_bytes(),
    ))
}

pub fn draft_prefix(draft_id: &str) -> &str {
    draft_id.split('-').next().unwrap_or(draft_id)
}

fn export_filename(draft_id: &str) -> String {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let random8: String = hex::encode(rand::random::<[u8; 4]>());
    format!(
        "sales_order_{}_{}_{}.json",
        draft_prefix(draft_id),
        timestamp,
        random8
    )
}

/// Render the canonical export document.
pub fn render_export(
    draft: &DraftOrderRow,
    lines: &[DraftLineRow],
    tenant_slug: &str,
    customer: Option<(&str, Option<&str>)>,
) -> serde_json::Value {
    let customer_block = customer.map(|(name, erp_number)| {
        json!({ "erp_customer_number": erp_number, "name": name })
    });
    let ship_to: Option<serde_json::Value> = draft
        .ship_to_json
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok());
    let bill_to: Option<serde_json::Value> = draft
        .bill_to_json
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok());

    json!({
        "format_version": EXPORT_FORMAT_VERSION,
        "export_timestamp": Utc::now().to_rfc3339(),
        "org": { "id": draft.tenant_id, "slug": tenant_slug },
        "order": {
            "draft_order_id": draft.id,
            "external_order_number": draft.external_order_number,
            "order_date": draft.order_date,
            "currency": draft.currency,
            "requested_delivery_date": draft.requested_delivery_date,
            "notes": draft.notes,
            "ship_to": ship_to,
            "bill_to": bill_to,
            "approved_at": draft.approved_at,
            "customer": customer_block,
        },
        "lines": lines.iter().map(|line| json!({
            "line_no": line.line_no,
            "internal_sku": line.internal_sku,
            "customer_sku": line.customer_sku_raw,
            "description": line.description,
            "qty": line.qty.unwrap_or(0.0),
            "uom": line.uom.clone().unwrap_or_default(),
            "unit_price": line.unit_price_micros.map(crate::models::micros_to_f64),
            "currency": line.currency.clone().or(draft.currency.clone()),
            "requested_delivery_date": line.requested_delivery_date,
            "line_notes": serde_json::Value::Null,
        })).collect::<Vec<_>>(),
    })
}

pub struct Exporter {
    db: Db,
    store: Arc<dyn ObjectStore>,
    transport: Arc<dyn DropzoneTransport>,
    crypto: crypto::ConfigCrypto,
}

impl Exporter {
    pub fn new(
        db: Db,
        store: Arc<dyn ObjectStore>,
        transport: Arc<dyn DropzoneTransport>,
        crypto: crypto::ConfigCrypto,
    ) -> Self {
        Self {
            db,
            store,
            transport,
            crypto,
        }
    }

    /// Export an approved draft through the tenant's active dropzone
    /// connection. Idempotent: an already-pushed draft returns its existing
    /// export, and a FAILED record is only retried through this explicit
    /// call (the row is updated in place, the idempotency key stays unique).
    pub async fn export_draft(&self, tenant_id: &str, draft_id: &str) -> Result<ErpExportRow> {
        let started = Instant::now();
        let draft = self
            .db
            .get_draft(tenant_id, draft_id)
            .await?
            .ok_or(StateError::NotFound)?;
        if !matches!(draft.status, DraftStatus::Approved | DraftStatus::Pushed) {
            return Err(StateError::IllegalTransition {
                from: draft.status.as_str().to_string(),
                to: DraftStatus::Pushed.as_str().to_string(),
            }
            .into());
        }

        let mut retry_of: Option<ErpExportRow> = None;
        if let Some(existing) = self.db.latest_export_for_draft(tenant_id, draft_id).await? {
            if existing.status != ExportStatus::Failed {
                info!(tenant_id, draft_id, export_id = %existing.id, "export already recorded, skipping");
                return Ok(existing);
            }
            retry_of = Some(existing);
        }

        let connection = self
            .db
            .active_connection(tenant_id, CONNECTOR_DROPZONE_JSON_V1)
            .await?
            .ok_or_else(|| ExportError::NoActiveConnection(CONNECTOR_DROPZONE_JSON_V1.into()))?;
        let config: ConnectionConfig =
            serde_json::from_value(self.crypto.decrypt(&connection.config_encrypted)?)
                .context("parse connection config")?;
        if config.mode != "filesystem" {
            return Err(ExportError::DropzoneWriteFailed(format!(
                "unsupported dropzone mode '{}'",
                config.mode
            ))
            .into());
        }

        let lines = self.db.lines_for_draft(tenant_id, draft_id).await?;
        let tenant = self.db.get_tenant(tenant_id).await?;
        let tenant_slug = tenant.as_ref().map(|t| t.slug.as_str()).unwrap_or(tenant_id);
        let customer = match draft.customer_id.as_deref() {
            Some(customer_id) => self.db.get_customer(tenant_id, customer_id).await?,
            None => None,
        };
        let customer_ref = customer
            .as_ref()
            .map(|c| (c.name.as_str(), c.erp_customer_number.as_deref()));

        let document = render_export(&draft, &lines, tenant_slug, customer_ref);
        let payload = serde_json::to_vec_pretty(&document)?;
        let file_name = export_filename(draft_id);

        // Archive copy first; the archive is cheap and the dropzone write is
        // the risky part.
        let storage_key = format!("exports/{tenant_id}/{file_name}");
        self.store
            .put_raw(&storage_key, &payload)
            .await
            .map_err(|e| anyhow::anyhow!("archive export: {e}"))?;

        let export_dir = PathBuf::from(&config.export_path);
        let write_result = self.transport.write_atomic(&export_dir, &file_name, &payload);
        let latency_ms = started.elapsed().as_millis() as i64;

        let (status, dropzone_path, error_json) = match &write_result {
            Ok(path) => (ExportStatus::Sent, Some(path.display().to_string()), None),
            Err(e) => {
                error!(tenant_id, draft_id, error = %e, "dropzone write failed");
                (
                    ExportStatus::Failed,
                    None,
                    Some(json!({ "error": e.to_string() }).to_string()),
                )
            }
        };

        let export = match retry_of {
            Some(previous) => {
                self.db
                    .update_export_attempt(
                        tenant_id,
                        &previous.id,
                        status,
                        dropzone_path.as_deref(),
                        Some(&storage_key),
                        Some(&file_name),
                        error_json.as_deref(),
                        Some(latency_ms),
                    )
                    .await?;
                self.db
                    .get_export(tenant_id, &previous.id)
                    .await?
                    .ok_or(StateError::NotFound)?
            }
            None => {
                let export = ErpExportRow {
                    id: new_id(),
                    tenant_id: tenant_id.to_string(),
                    draft_id: draft_id.to_string(),
                    connection_id: connection.id.clone(),
                    draft_version: draft.version,
                    idempotency_key: idempotency_key(tenant_id, draft_id, draft.version),
                    storage_key: Some(storage_key),
                    dropzone_path,
                    file_name: Some(file_name),
                    status,
                    erp_order_id: None,
                    error_json,
                    attempt: 1,
                    latency_ms: Some(latency_ms),
                };
                self.db.insert_export(&export).await?;
                export
            }
        };

        if export.status == ExportStatus::Sent && draft.status == DraftStatus::Approved {
            let pushed_at = Utc::now().to_rfc3339();
            self.db
                .update_draft(tenant_id, draft_id, draft.version, move |d| {
                    d.status = DraftStatus::Pushed;
                    d.pushed_at = Some(pushed_at);
                })
                .await?;
        }
        if export.status == ExportStatus::Sent {
            info!(tenant_id, draft_id, export_id = %export.id, "draft exported to dropzone");
        }
        Ok(export)
    }
}

/// Create an ACTIVE dropzone connection with an encrypted config.
pub async fn create_dropzone_connection(
    db: &Db,
    crypto: &crypto::ConfigCrypto,
    tenant_id: &str,
    config: &ConnectionConfig,
) -> Result<ErpConnectionRow> {
    let id = new_id();
    let encrypted = crypto.encrypt(
        &serde_json::to_value(config)?,
        Some(&format!("erp_connection:{id}")),
    )?;
    let row = ErpConnectionRow {
        id,
        tenant_id: tenant_id.to_string(),
        connector_type: CONNECTOR_DROPZONE_JSON_V1.to_string(),
        config_encrypted: encrypted,
        status: "ACTIVE".to_string(),
        last_test_at: None,
    };
    db.insert_connection(&row).await?;
    Ok(row)
}
