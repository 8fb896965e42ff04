//! Acknowledgment poller.
//!
//! Periodically scans the `ack_path` of every active dropzone connection for
//! `ack_*.json` / `error_*.json` files, resolves the matching SENT export,
//! applies the terminal transition and moves the file to `processed/`.
//! Unparsable files land in `error/`. Re-processing a file whose export is
//! already terminal is a no-op.

use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{ConnectionConfig, DropzoneTransport, CONNECTOR_DROPZONE_JSON_V1};
use crate::models::{DraftStatus, ExportStatus};
use crate::store::Db;

lazy_static! {
    static ref ACK_FILENAME: Regex =
        Regex::new(r"^(ack|error)_sales_order_([0-9a-f-]+)_\d+_[0-9a-f]+\.json$").unwrap();
}

/// Ack document written by the ERP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    pub status: String,
    #[serde(default)]
    pub erp_order_id: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub processed_at: Option<String>,
}

/// Draft-id prefix from an ack filename, or `None` when the name does not
/// follow the contract.
pub fn draft_prefix_from_filename(name: &str) -> Option<String> {
    ACK_FILENAME
        .captures(name)
        .map(|caps| caps[2].to_string())
}

fn is_ack_file(name: &str) -> bool {
    (name.starts_with("ack_") || name.starts_with("error_")) && name.ends_with(".json")
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PollStats {
    pub connections_checked: usize,
    pub acks_processed: usize,
    pub errors: usize,
}

pub struct AckPoller {
    db: Db,
    transport: Arc<dyn DropzoneTransport>,
    crypto: super::crypto::ConfigCrypto,
}

impl AckPoller {
    pub fn new(
        db: Db,
        transport: Arc<dyn DropzoneTransport>,
        crypto: super::crypto::ConfigCrypto,
    ) -> Self {
        Self {
            db,
            transport,
            crypto,
        }
    }

    /// One poll cycle over every active dropzone connection.
    pub async fn poll_all(&self) -> Result<PollStats> {
        let mut stats = PollStats::default();
        let connections = self
            .db
            .active_connections_of_type(CONNECTOR_DROPZONE_JSON_V1)
            .await?;
        for connection in connections {
            stats.connections_checked += 1;
            let config: ConnectionConfig = match self
                .crypto
                .decrypt(&connection.config_encrypted)
                .and_then(|v| Ok(serde_json::from_value(v)?))
            {
                Ok(config) => config,
                Err(e) => {
                    warn!(connection_id = %connection.id, error = %e, "cannot decrypt connection config");
                    stats.errors += 1;
                    continue;
                }
            };
            let Some(ack_path) = config.ack_path.as_deref() else {
                debug!(connection_id = %connection.id, "no ack_path configured, skipping");
                continue;
            };
            match self
                .poll_connection(&connection.tenant_id, Path::new(ack_path))
                .await
            {
                Ok(count) => stats.acks_processed += count,
                Err(e) => {
                    warn!(connection_id = %connection.id, error = %e, "ack polling failed");
                    stats.errors += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn poll_connection(&self, tenant_id: &str, ack_dir: &Path) -> Result<usize> {
        let mut processed = 0usize;
        let files = self.transport.list_files(ack_dir)?;
        for name in files.into_iter().filter(|n| is_ack_file(n)) {
            match self.process_ack_file(tenant_id, ack_dir, &name).await {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) => warn!(file = %name, error = %e, "failed to process ack file"),
            }
        }
        Ok(processed)
    }

    async fn process_ack_file(&self, tenant_id: &str, ack_dir: &Path, name: &str) -> Result<bool> {
        let bytes = self.transport.read_file(ack_dir, name)?;
        let payload: AckPayload = match serde_json::from_slice(&bytes) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(file = %name, error = %e, "unparsable ack file, moving to error/");
                self.transport.move_to_subdir(ack_dir, name, "error")?;
                return Ok(false);
            }
        };

        let Some(prefix) = draft_prefix_from_filename(name) else {
            warn!(file = %name, "ack filename does not match the contract, moving to error/");
            self.transport.move_to_subdir(ack_dir, name, "error")?;
            return Ok(false);
        };

        let Some(draft_id) = self.db.find_draft_id_by_prefix(tenant_id, &prefix).await? else {
            warn!(file = %name, prefix = %prefix, "no draft for ack, archiving");
            self.transport.move_to_subdir(ack_dir, name, "processed")?;
            return Ok(false);
        };

        let Some(export) = self.db.latest_sent_export(tenant_id, &draft_id).await? else {
            // Late ack after a retry already resolved the export, or a
            // duplicate delivery. Archive without state change.
            warn!(file = %name, draft_id = %draft_id, "no SENT export for ack, archiving");
            self.transport.move_to_subdir(ack_dir, name, "processed")?;
            return Ok(false);
        };

        match payload.status.as_str() {
            "ACKED" => {
                self.db
                    .resolve_export(
                        tenant_id,
                        &export.id,
                        ExportStatus::Acked,
                        payload.erp_order_id.as_deref(),
                        None,
                    )
                    .await?;
                self.transition_draft(tenant_id, &draft_id, DraftStatus::Acked, payload.erp_order_id.clone())
                    .await?;
                info!(
                    tenant_id,
                    draft_id = %draft_id,
                    export_id = %export.id,
                    erp_order_id = ?payload.erp_order_id,
                    "export acknowledged"
                );
            }
            "FAILED" => {
                let error = json!({
                    "error_code": payload.error_code,
                    "message": payload.message,
                    "processed_at": payload.processed_at,
                });
                self.db
                    .resolve_export(
                        tenant_id,
                        &export.id,
                        ExportStatus::Failed,
                        None,
                        Some(&error.to_string()),
                    )
                    .await?;
                self.transition_draft(tenant_id, &draft_id, DraftStatus::Failed, None)
                    .await?;
                warn!(tenant_id, draft_id = %draft_id, export_id = %export.id, "export rejected by erp");
            }
            other => {
                warn!(file = %name, status = %other, "unknown ack status, moving to error/");
                self.transport.move_to_subdir(ack_dir, name, "error")?;
                return Ok(false);
            }
        }

        self.transport.move_to_subdir(ack_dir, name, "processed")?;
        Ok(true)
    }

    async fn transition_draft(
        &self,
        tenant_id: &str,
        draft_id: &str,
        to: DraftStatus,
        erp_order_ref: Option<String>,
    ) -> Result<()> {
        let Some(draft) = self.db.get_draft(tenant_id, draft_id).await? else {
            return Ok(());
        };
        if draft.status != DraftStatus::Pushed {
            debug!(draft_id, status = draft.status.as_str(), "draft not in PUSHED, leaving as-is");
            return Ok(());
        }
        self.db
            .update_draft(tenant_id, draft_id, draft.version, move |d| {
                d.status = to;
                if let Some(reference) = erp_order_ref {
                    d.erp_order_ref = Some(reference);
                }
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_contract() {
        assert_eq!(
            draft_prefix_from_filename("ack_sales_order_9f1c2d3e_20250104120000_a1b2c3d4.json"),
            Some("9f1c2d3e".to_string())
        );
        assert_eq!(
            draft_prefix_from_filename("error_sales_order_9f1c2d3e_20250104120000_a1b2c3d4.json"),
            Some("9f1c2d3e".to_string())
        );
        assert_eq!(draft_prefix_from_filename("ack_something_else.json"), None);
        assert_eq!(
            draft_prefix_from_filename("ack_sales_order_XYZ_1_2.json"),
            None
        );
    }

    #[test]
    fn ack_payload_parses_optional_fields() {
        let payload: AckPayload =
            serde_json::from_str(r#"{"status":"ACKED","erp_order_id":"SO-1"}"#).unwrap();
        assert_eq!(payload.status, "ACKED");
        assert_eq!(payload.erp_order_id.as_deref(), Some("SO-1"));
        assert!(payload.error_code.is_none());
    }
}
