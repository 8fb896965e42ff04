//! Operational storage: the AI call ledger, feedback events, ERP connections
//! and export records.
//!
//! Ledger rows are committed independently of any draft transaction so they
//! survive rollbacks; the table is append-only.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{new_id, now_rfc3339, Db};
use crate::error::ExportError;
use crate::models::ExportStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiCallRow {
    pub id: String,
    pub tenant_id: String,
    pub call_type: String,
    pub provider: String,
    pub model: String,
    pub input_hash: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub latency_ms: i64,
    pub cost_micros: i64,
    pub status: String,
    pub error_json: Option<String>,
    pub result_json: Option<String>,
    pub document_id: Option<String>,
    pub draft_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErpConnectionRow {
    pub id: String,
    pub tenant_id: String,
    pub connector_type: String,
    pub config_encrypted: String,
    pub status: String,
    pub last_test_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErpExportRow {
    pub id: String,
    pub tenant_id: String,
    pub draft_id: String,
    pub connection_id: String,
    pub draft_version: i64,
    pub idempotency_key: String,
    pub storage_key: Option<String>,
    pub dropzone_path: Option<String>,
    pub file_name: Option<String>,
    pub status: ExportStatus,
    pub erp_order_id: Option<String>,
    pub error_json: Option<String>,
    pub attempt: i64,
    pub latency_ms: Option<i64>,
}

impl Db {
    pub async fn insert_ai_call(&self, call: &AiCallRow) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO ai_call_log (id, tenant_id, call_type, provider, model, input_hash,
                                      input_tokens, output_tokens, latency_ms, cost_micros, status,
                                      error_json, result_json, document_id, draft_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                call.id,
                call.tenant_id,
                call.call_type,
                call.provider,
                call.model,
                call.input_hash,
                call.input_tokens,
                call.output_tokens,
                call.latency_ms,
                call.cost_micros,
                call.status,
                call.error_json,
                call.result_json,
                call.document_id,
                call.draft_id,
                now
            ],
        )
        .context("insert ai call log")?;
        Ok(())
    }

    fn ai_call_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AiCallRow> {
        Ok(AiCallRow {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            call_type: row.get(2)?,
            provider: row.get(3)?,
            model: row.get(4)?,
            input_hash: row.get(5)?,
            input_tokens: row.get(6)?,
            output_tokens: row.get(7)?,
            latency_ms: row.get(8)?,
            cost_micros: row.get(9)?,
            status: row.get(10)?,
            error_json: row.get(11)?,
            result_json: row.get(12)?,
            document_id: row.get(13)?,
            draft_id: row.get(14)?,
        })
    }

    /// Most recent successful ledger entry for the same input hash newer than
    /// `since`, used to serve repeated calls without a provider request.
    pub async fn find_recent_ai_call(
        &self,
        tenant_id: &str,
        call_type: &str,
        input_hash: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<AiCallRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, call_type, provider, model, input_hash, input_tokens,
                    output_tokens, latency_ms, cost_micros, status, error_json, result_json,
                    document_id, draft_id
             FROM ai_call_log
             WHERE tenant_id = ?1 AND call_type = ?2 AND input_hash = ?3
               AND status = 'SUCCEEDED' AND created_at >= ?4
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let row = stmt
            .query_row(
                params![tenant_id, call_type, input_hash, since.to_rfc3339()],
                Self::ai_call_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub async fn sum_cost_since(&self, tenant_id: &str, since: DateTime<Utc>) -> Result<i64> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT COALESCE(SUM(cost_micros), 0) FROM ai_call_log
             WHERE tenant_id = ?1 AND created_at >= ?2",
        )?;
        let sum: i64 = stmt.query_row(params![tenant_id, since.to_rfc3339()], |row| row.get(0))?;
        Ok(sum)
    }

    pub async fn count_ai_calls(&self, tenant_id: &str) -> Result<i64> {
        let conn = self.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ai_call_log WHERE tenant_id = ?1",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub async fn insert_feedback(
        &self,
        tenant_id: &str,
        event_type: &str,
        entity_id: Option<&str>,
        actor: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO feedback_event (id, tenant_id, event_type, entity_id, actor, payload_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![new_id(), tenant_id, event_type, entity_id, actor, payload.to_string(), now],
        )?;
        Ok(())
    }

    pub async fn insert_connection(&self, connection: &ErpConnectionRow) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO erp_connection (id, tenant_id, connector_type, config_encrypted, status,
                                         last_test_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                connection.id,
                connection.tenant_id,
                connection.connector_type,
                connection.config_encrypted,
                connection.status,
                connection.last_test_at,
                now
            ],
        )
        .context("insert erp connection")?;
        Ok(())
    }

    fn connection_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ErpConnectionRow> {
        Ok(ErpConnectionRow {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            connector_type: row.get(2)?,
            config_encrypted: row.get(3)?,
            status: row.get(4)?,
            last_test_at: row.get(5)?,
        })
    }

    pub async fn active_connection(
        &self,
        tenant_id: &str,
        connector_type: &str,
    ) -> Result<Option<ErpConnectionRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, connector_type, config_encrypted, status, last_test_at
             FROM erp_connection
             WHERE tenant_id = ?1 AND connector_type = ?2 AND status = 'ACTIVE'",
        )?;
        let row = stmt
            .query_row(params![tenant_id, connector_type], Self::connection_from_row)
            .optional()?;
        Ok(row)
    }

    /// All ACTIVE connections of a given type across tenants, for the poller.
    pub async fn active_connections_of_type(
        &self,
        connector_type: &str,
    ) -> Result<Vec<ErpConnectionRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, connector_type, config_encrypted, status, last_test_at
             FROM erp_connection WHERE connector_type = ?1 AND status = 'ACTIVE'",
        )?;
        let mut rows = stmt.query(params![connector_type])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::connection_from_row(row)?);
        }
        Ok(out)
    }

    pub async fn touch_connection_test(&self, tenant_id: &str, connection_id: &str) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "UPDATE erp_connection SET last_test_at = ?3, updated_at = ?3
             WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, connection_id, now],
        )?;
        Ok(())
    }

    /// Insert an export record. The unique idempotency key refuses a second
    /// export of the same (tenant, draft, version).
    pub async fn insert_export(&self, export: &ErpExportRow) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        let result = conn.execute(
            "INSERT INTO erp_export (id, tenant_id, draft_id, connection_id, draft_version,
                                     idempotency_key, storage_key, dropzone_path, file_name, status,
                                     erp_order_id, error_json, attempt, latency_ms, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
            params![
                export.id,
                export.tenant_id,
                export.draft_id,
                export.connection_id,
                export.draft_version,
                export.idempotency_key,
                export.storage_key,
                export.dropzone_path,
                export.file_name,
                export.status.as_str(),
                export.erp_order_id,
                export.error_json,
                export.attempt,
                export.latency_ms,
                now
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(ExportError::DuplicateExport(export.idempotency_key.clone()).into())
            }
            Err(e) => Err(e).context("insert erp export"),
        }
    }

    fn export_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ErpExportRow> {
        let status: String = row.get(9)?;
        Ok(ErpExportRow {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            draft_id: row.get(2)?,
            connection_id: row.get(3)?,
            draft_version: row.get(4)?,
            idempotency_key: row.get(5)?,
            storage_key: row.get(6)?,
            dropzone_path: row.get(7)?,
            file_name: row.get(8)?,
            status: ExportStatus::parse(&status).unwrap_or(ExportStatus::Failed),
            erp_order_id: row.get(10)?,
            error_json: row.get(11)?,
            attempt: row.get(12)?,
            latency_ms: row.get(13)?,
        })
    }

    const EXPORT_COLUMNS: &'static str =
        "id, tenant_id, draft_id, connection_id, draft_version, idempotency_key, storage_key,
         dropzone_path, file_name, status, erp_order_id, error_json, attempt, latency_ms";

    pub async fn find_export_by_key(&self, idempotency_key: &str) -> Result<Option<ErpExportRow>> {
        let sql = format!(
            "SELECT {} FROM erp_export WHERE idempotency_key = ?1",
            Self::EXPORT_COLUMNS
        );
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&sql)?;
        let row = stmt
            .query_row(params![idempotency_key], Self::export_from_row)
            .optional()?;
        Ok(row)
    }

    pub async fn get_export(&self, tenant_id: &str, export_id: &str) -> Result<Option<ErpExportRow>> {
        let sql = format!(
            "SELECT {} FROM erp_export WHERE tenant_id = ?1 AND id = ?2",
            Self::EXPORT_COLUMNS
        );
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&sql)?;
        let row = stmt
            .query_row(params![tenant_id, export_id], Self::export_from_row)
            .optional()?;
        Ok(row)
    }

    /// Latest SENT export for a draft, the row an ack resolves against.
    pub async fn latest_sent_export(
        &self,
        tenant_id: &str,
        draft_id: &str,
    ) -> Result<Option<ErpExportRow>> {
        let sql = format!(
            "SELECT {} FROM erp_export
             WHERE tenant_id = ?1 AND draft_id = ?2 AND status = 'SENT'
             ORDER BY created_at DESC LIMIT 1",
            Self::EXPORT_COLUMNS
        );
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&sql)?;
        let row = stmt
            .query_row(params![tenant_id, draft_id], Self::export_from_row)
            .optional()?;
        Ok(row)
    }

    pub async fn latest_export_for_draft(
        &self,
        tenant_id: &str,
        draft_id: &str,
    ) -> Result<Option<ErpExportRow>> {
        let sql = format!(
            "SELECT {} FROM erp_export
             WHERE tenant_id = ?1 AND draft_id = ?2
             ORDER BY created_at DESC LIMIT 1",
            Self::EXPORT_COLUMNS
        );
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&sql)?;
        let row = stmt
            .query_row(params![tenant_id, draft_id], Self::export_from_row)
            .optional()?;
        Ok(row)
    }

    /// Rewrite a FAILED export row for an explicit retry; bumps the attempt
    /// counter and replaces the write artifacts.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_export_attempt(
        &self,
        tenant_id: &str,
        export_id: &str,
        status: ExportStatus,
        dropzone_path: Option<&str>,
        storage_key: Option<&str>,
        file_name: Option<&str>,
        error_json: Option<&str>,
        latency_ms: Option<i64>,
    ) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "UPDATE erp_export
             SET status = ?3, dropzone_path = ?4, storage_key = ?5, file_name = ?6,
                 error_json = ?7, latency_ms = ?8, attempt = attempt + 1, updated_at = ?9
             WHERE tenant_id = ?1 AND id = ?2",
            params![
                tenant_id,
                export_id,
                status.as_str(),
                dropzone_path,
                storage_key,
                file_name,
                error_json,
                latency_ms,
                now
            ],
        )?;
        Ok(())
    }

    pub async fn resolve_export(
        &self,
        tenant_id: &str,
        export_id: &str,
        status: ExportStatus,
        erp_order_id: Option<&str>,
        error_json: Option<&str>,
    ) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "UPDATE erp_export
             SET status = ?3, erp_order_id = COALESCE(?4, erp_order_id), error_json = ?5, updated_at = ?6
             WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, export_id, status.as_str(), erp_order_id, error_json, now],
        )?;
        Ok(())
    }
}
