//! Order-side storage: inbound messages, documents, extraction runs, draft
//! orders with lines, and validation issues.
//!
//! Draft mutations go through the optimistic version lock; document status
//! changes are checked against the state machine inside the transaction.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use super::{new_id, now_rfc3339, Db};
use crate::error::StateError;
use crate::models::{DocumentStatus, DraftStatus, IssueSeverity, IssueStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessageRow {
    pub id: String,
    pub tenant_id: String,
    pub from_email: Option<String>,
    pub to_email: Option<String>,
    pub subject: Option<String>,
    pub status: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRow {
    pub id: String,
    pub tenant_id: String,
    pub message_id: Option<String>,
    pub sha256: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub storage_key: String,
    pub file_name: String,
    pub source: String,
    pub sender_email: Option<String>,
    pub status: DocumentStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRunRow {
    pub id: String,
    pub tenant_id: String,
    pub document_id: String,
    pub method: String,
    pub extractor_version: String,
    pub input_hash: String,
    pub output_json: Option<String>,
    pub confidence: f64,
    pub runtime_ms: i64,
    pub text_coverage: Option<f64>,
    pub status: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub warnings_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftOrderRow {
    pub id: String,
    pub tenant_id: String,
    pub customer_id: Option<String>,
    pub document_id: Option<String>,
    pub extraction_run_id: Option<String>,
    pub external_order_number: Option<String>,
    pub order_date: Option<String>,
    pub requested_delivery_date: Option<String>,
    pub currency: Option<String>,
    pub ship_to_json: Option<String>,
    pub bill_to_json: Option<String>,
    pub notes: Option<String>,
    pub status: DraftStatus,
    pub version: i64,
    pub approved_by: Option<String>,
    pub approved_at: Option<String>,
    pub erp_order_ref: Option<String>,
    pub pushed_at: Option<String>,
    pub deleted_at: Option<String>,
    pub ready_json: Option<String>,
    pub overall_confidence: Option<f64>,
    pub extraction_confidence: Option<f64>,
    pub customer_confidence: Option<f64>,
    pub matching_confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftLineRow {
    pub id: String,
    pub tenant_id: String,
    pub draft_id: String,
    pub line_no: i64,
    pub customer_sku_raw: Option<String>,
    pub customer_sku_norm: Option<String>,
    pub internal_sku: Option<String>,
    pub description: Option<String>,
    pub qty: Option<f64>,
    pub uom: Option<String>,
    pub unit_price_micros: Option<i64>,
    pub currency: Option<String>,
    pub requested_delivery_date: Option<String>,
    pub match_method: Option<String>,
    pub match_confidence: Option<f64>,
    pub candidates_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssueRow {
    pub id: String,
    pub tenant_id: String,
    pub draft_id: String,
    pub line_id: Option<String>,
    pub line_no: Option<i64>,
    pub issue_type: String,
    pub severity: IssueSeverity,
    pub status: IssueStatus,
    pub message: String,
    pub details_json: String,
}

impl Db {
    pub async fn insert_inbound_message(&self, message: &InboundMessageRow) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO inbound_message (id, tenant_id, from_email, to_email, subject, status, error,
                                          created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                message.id,
                message.tenant_id,
                message.from_email,
                message.to_email,
                message.subject,
                message.status,
                message.error,
                now
            ],
        )
        .context("insert inbound message")?;
        Ok(())
    }

    pub async fn set_message_status(
        &self,
        tenant_id: &str,
        message_id: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "UPDATE inbound_message SET status = ?3, error = ?4, updated_at = ?5
             WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, message_id, status, error, now],
        )?;
        Ok(())
    }

    pub async fn get_inbound_message(
        &self,
        tenant_id: &str,
        message_id: &str,
    ) -> Result<Option<InboundMessageRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, from_email, to_email, subject, status, error
             FROM inbound_message WHERE tenant_id = ?1 AND id = ?2",
        )?;
        let row = stmt
            .query_row(params![tenant_id, message_id], |row| {
                Ok(InboundMessageRow {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    from_email: row.get(2)?,
                    to_email: row.get(3)?,
                    subject: row.get(4)?,
                    status: row.get(5)?,
                    error: row.get(6)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub async fn insert_document(&self, document: &DocumentRow) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO document (id, tenant_id, message_id, sha256, mime_type, size_bytes,
                                   storage_key, file_name, source, sender_email, status, error,
                                   created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                document.id,
                document.tenant_id,
                document.message_id,
                document.sha256,
                document.mime_type,
                document.size_bytes,
                document.storage_key,
                document.file_name,
                document.source,
                document.sender_email,
                document.status.as_str(),
                document.error,
                now
            ],
        )
        .context("insert document")?;
        Ok(())
    }

    fn document_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentRow> {
        let status: String = row.get(10)?;
        Ok(DocumentRow {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            message_id: row.get(2)?,
            sha256: row.get(3)?,
            mime_type: row.get(4)?,
            size_bytes: row.get(5)?,
            storage_key: row.get(6)?,
            file_name: row.get(7)?,
            source: row.get(8)?,
            sender_email: row.get(9)?,
            status: DocumentStatus::parse(&status).unwrap_or(DocumentStatus::Failed),
            error: row.get(11)?,
        })
    }

    pub async fn get_document(&self, tenant_id: &str, document_id: &str) -> Result<Option<DocumentRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, message_id, sha256, mime_type, size_bytes, storage_key,
                    file_name, source, sender_email, status, error
             FROM document WHERE tenant_id = ?1 AND id = ?2",
        )?;
        let row = stmt
            .query_row(params![tenant_id, document_id], Self::document_from_row)
            .optional()?;
        Ok(row)
    }

    pub async fn find_document_by_hash(
        &self,
        tenant_id: &str,
        sha256: &str,
    ) -> Result<Option<DocumentRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, message_id, sha256, mime_type, size_bytes, storage_key,
                    file_name, source, sender_email, status, error
             FROM document WHERE tenant_id = ?1 AND sha256 = ?2
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![tenant_id, sha256], Self::document_from_row)
            .optional()?;
        Ok(row)
    }

    /// Transition a document's status. The current status is re-read inside
    /// the transaction and the transition is checked against the state
    /// machine, so concurrent transitions from the same prior state are safe.
    pub async fn transition_document(
        &self,
        tenant_id: &str,
        document_id: &str,
        to: DocumentStatus,
        error: Option<&str>,
    ) -> Result<(), anyhow::Error> {
        let now = now_rfc3339();
        let mut conn = self.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM document WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id, document_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.ok_or(StateError::NotFound)?;
        let from = DocumentStatus::parse(&current).ok_or(StateError::NotFound)?;
        if !DocumentStatus::can_transition(from, to) {
            return Err(StateError::IllegalTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            }
            .into());
        }
        tx.execute(
            "UPDATE document SET status = ?3, error = ?4, updated_at = ?5
             WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, document_id, to.as_str(), error, now],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn insert_extraction_run(&self, run: &ExtractionRunRow) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO extraction_run (id, tenant_id, document_id, method, extractor_version,
                                         input_hash, output_json, confidence, runtime_ms,
                                         text_coverage, status, error_code, error_message,
                                         warnings_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                run.id,
                run.tenant_id,
                run.document_id,
                run.method,
                run.extractor_version,
                run.input_hash,
                run.output_json,
                run.confidence,
                run.runtime_ms,
                run.text_coverage,
                run.status,
                run.error_code,
                run.error_message,
                run.warnings_json,
                now
            ],
        )
        .context("insert extraction run")?;
        Ok(())
    }

    fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExtractionRunRow> {
        Ok(ExtractionRunRow {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            document_id: row.get(2)?,
            method: row.get(3)?,
            extractor_version: row.get(4)?,
            input_hash: row.get(5)?,
            output_json: row.get(6)?,
            confidence: row.get(7)?,
            runtime_ms: row.get(8)?,
            text_coverage: row.get(9)?,
            status: row.get(10)?,
            error_code: row.get(11)?,
            error_message: row.get(12)?,
            warnings_json: row.get(13)?,
        })
    }

    pub async fn latest_extraction_run(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Option<ExtractionRunRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, document_id, method, extractor_version, input_hash, output_json,
                    confidence, runtime_ms, text_coverage, status, error_code, error_message, warnings_json
             FROM extraction_run WHERE tenant_id = ?1 AND document_id = ?2
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![tenant_id, document_id], Self::run_from_row)
            .optional()?;
        Ok(row)
    }

    /// A prior successful run for the same input hash short-circuits
    /// re-extraction of unchanged content, regardless of which extractor
    /// produced it.
    pub async fn find_succeeded_run_by_hash(
        &self,
        tenant_id: &str,
        input_hash: &str,
    ) -> Result<Option<ExtractionRunRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, document_id, method, extractor_version, input_hash, output_json,
                    confidence, runtime_ms, text_coverage, status, error_code, error_message, warnings_json
             FROM extraction_run
             WHERE tenant_id = ?1 AND input_hash = ?2 AND status = 'SUCCEEDED'
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![tenant_id, input_hash], Self::run_from_row)
            .optional()?;
        Ok(row)
    }

    /// A prior successful run for the same input hash and extractor version
    /// short-circuits re-extraction of unchanged content.
    pub async fn find_succeeded_run(
        &self,
        tenant_id: &str,
        input_hash: &str,
        extractor_version: &str,
    ) -> Result<Option<ExtractionRunRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, document_id, method, extractor_version, input_hash, output_json,
                    confidence, runtime_ms, text_coverage, status, error_code, error_message, warnings_json
             FROM extraction_run
             WHERE tenant_id = ?1 AND input_hash = ?2 AND extractor_version = ?3 AND status = 'SUCCEEDED'
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let row = stmt
            .query_row(
                params![tenant_id, input_hash, extractor_version],
                Self::run_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Insert a draft together with its lines in one transaction so readers
    /// never observe a draft without lines.
    pub async fn insert_draft(&self, draft: &DraftOrderRow, lines: &[DraftLineRow]) -> Result<()> {
        let now = now_rfc3339();
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO draft_order (id, tenant_id, customer_id, document_id, extraction_run_id,
                                      external_order_number, order_date, requested_delivery_date,
                                      currency, ship_to_json, bill_to_json, notes, status, version,
                                      approved_by, approved_at, erp_order_ref, pushed_at, deleted_at,
                                      ready_json, overall_confidence, extraction_confidence,
                                      customer_confidence, matching_confidence, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                     ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?25)",
            params![
                draft.id,
                draft.tenant_id,
                draft.customer_id,
                draft.document_id,
                draft.extraction_run_id,
                draft.external_order_number,
                draft.order_date,
                draft.requested_delivery_date,
                draft.currency,
                draft.ship_to_json,
                draft.bill_to_json,
                draft.notes,
                draft.status.as_str(),
                draft.version,
                draft.approved_by,
                draft.approved_at,
                draft.erp_order_ref,
                draft.pushed_at,
                draft.deleted_at,
                draft.ready_json,
                draft.overall_confidence,
                draft.extraction_confidence,
                draft.customer_confidence,
                draft.matching_confidence,
                now
            ],
        )?;
        for line in lines {
            tx.execute(
                "INSERT INTO draft_order_line (id, tenant_id, draft_id, line_no, customer_sku_raw,
                                               customer_sku_norm, internal_sku, description, qty, uom,
                                               unit_price_micros, currency, requested_delivery_date,
                                               match_method, match_confidence, candidates_json,
                                               created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)",
                params![
                    line.id,
                    line.tenant_id,
                    line.draft_id,
                    line.line_no,
                    line.customer_sku_raw,
                    line.customer_sku_norm,
                    line.internal_sku,
                    line.description,
                    line.qty,
                    line.uom,
                    line.unit_price_micros,
                    line.currency,
                    line.requested_delivery_date,
                    line.match_method,
                    line.match_confidence,
                    line.candidates_json,
                    now
                ],
            )?;
        }
        tx.commit().context("insert draft with lines")?;
        Ok(())
    }

    fn draft_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DraftOrderRow> {
        let status: String = row.get(12)?;
        Ok(DraftOrderRow {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            customer_id: row.get(2)?,
            document_id: row.get(3)?,
            extraction_run_id: row.get(4)?,
            external_order_number: row.get(5)?,
            order_date: row.get(6)?,
            requested_delivery_date: row.get(7)?,
            currency: row.get(8)?,
            ship_to_json: row.get(9)?,
            bill_to_json: row.get(10)?,
            notes: row.get(11)?,
            status: DraftStatus::parse(&status).unwrap_or(DraftStatus::New),
            version: row.get(13)?,
            approved_by: row.get(14)?,
            approved_at: row.get(15)?,
            erp_order_ref: row.get(16)?,
            pushed_at: row.get(17)?,
            deleted_at: row.get(18)?,
            ready_json: row.get(19)?,
            overall_confidence: row.get(20)?,
            extraction_confidence: row.get(21)?,
            customer_confidence: row.get(22)?,
            matching_confidence: row.get(23)?,
        })
    }

    const DRAFT_COLUMNS: &'static str =
        "id, tenant_id, customer_id, document_id, extraction_run_id, external_order_number,
         order_date, requested_delivery_date, currency, ship_to_json, bill_to_json, notes, status,
         version, approved_by, approved_at, erp_order_ref, pushed_at, deleted_at, ready_json,
         overall_confidence, extraction_confidence, customer_confidence, matching_confidence";

    /// Soft-deleted drafts are hidden from default reads.
    pub async fn get_draft(&self, tenant_id: &str, draft_id: &str) -> Result<Option<DraftOrderRow>> {
        let sql = format!(
            "SELECT {} FROM draft_order WHERE tenant_id = ?1 AND id = ?2 AND deleted_at IS NULL",
            Self::DRAFT_COLUMNS
        );
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&sql)?;
        let row = stmt
            .query_row(params![tenant_id, draft_id], Self::draft_from_row)
            .optional()?;
        Ok(row)
    }

    /// Latest draft created from a document, if any.
    pub async fn find_draft_by_document(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Option<DraftOrderRow>> {
        let sql = format!(
            "SELECT {} FROM draft_order
             WHERE tenant_id = ?1 AND document_id = ?2 AND deleted_at IS NULL
             ORDER BY created_at DESC LIMIT 1",
            Self::DRAFT_COLUMNS
        );
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(&sql)?;
        let row = stmt
            .query_row(params![tenant_id, document_id], Self::draft_from_row)
            .optional()?;
        Ok(row)
    }

    /// Resolve a draft id from its uuid prefix (the portion carried in
    /// export and ack filenames). Most recent draft wins on collision.
    pub async fn find_draft_id_by_prefix(
        &self,
        tenant_id: &str,
        prefix: &str,
    ) -> Result<Option<String>> {
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Ok(None);
        }
        let pattern = format!("{prefix}%");
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM draft_order WHERE tenant_id = ?1 AND id LIKE ?2
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let id: Option<String> = stmt
            .query_row(params![tenant_id, pattern], |row| row.get(0))
            .optional()?;
        Ok(id)
    }

    pub async fn lines_for_draft(&self, tenant_id: &str, draft_id: &str) -> Result<Vec<DraftLineRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, draft_id, line_no, customer_sku_raw, customer_sku_norm,
                    internal_sku, description, qty, uom, unit_price_micros, currency,
                    requested_delivery_date, match_method, match_confidence, candidates_json
             FROM draft_order_line WHERE tenant_id = ?1 AND draft_id = ?2 ORDER BY line_no",
        )?;
        let mut rows = stmt.query(params![tenant_id, draft_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(DraftLineRow {
                id: row.get(0)?,
                tenant_id: row.get(1)?,
                draft_id: row.get(2)?,
                line_no: row.get(3)?,
                customer_sku_raw: row.get(4)?,
                customer_sku_norm: row.get(5)?,
                internal_sku: row.get(6)?,
                description: row.get(7)?,
                qty: row.get(8)?,
                uom: row.get(9)?,
                unit_price_micros: row.get(10)?,
                currency: row.get(11)?,
                requested_delivery_date: row.get(12)?,
                match_method: row.get(13)?,
                match_confidence: row.get(14)?,
                candidates_json: row.get(15)?,
            });
        }
        Ok(out)
    }

    /// Apply a mutation to a draft under the optimistic version lock. The
    /// closure receives the current row and returns the mutated row; the
    /// stored version must equal `expected_version` or the update fails with
    /// `VersionConflict`. On success the version is bumped by exactly one.
    pub async fn update_draft<F>(
        &self,
        tenant_id: &str,
        draft_id: &str,
        expected_version: i64,
        mutate: F,
    ) -> Result<DraftOrderRow>
    where
        F: FnOnce(&mut DraftOrderRow),
    {
        let now = now_rfc3339();
        let mut conn = self.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sql = format!(
            "SELECT {} FROM draft_order WHERE tenant_id = ?1 AND id = ?2 AND deleted_at IS NULL",
            Self::DRAFT_COLUMNS
        );
        let current = tx
            .query_row(&sql, params![tenant_id, draft_id], Self::draft_from_row)
            .optional()?;
        let mut draft = current.ok_or(StateError::NotFound)?;
        if draft.version != expected_version {
            return Err(StateError::VersionConflict {
                expected: expected_version,
                stored: draft.version,
            }
            .into());
        }
        let from = draft.status;
        mutate(&mut draft);
        if draft.status != from && !DraftStatus::can_transition(from, draft.status) {
            return Err(StateError::IllegalTransition {
                from: from.as_str().to_string(),
                to: draft.status.as_str().to_string(),
            }
            .into());
        }
        draft.version = expected_version + 1;
        tx.execute(
            "UPDATE draft_order
             SET customer_id = ?3, external_order_number = ?4, order_date = ?5,
                 requested_delivery_date = ?6, currency = ?7, ship_to_json = ?8, bill_to_json = ?9,
                 notes = ?10, status = ?11, version = ?12, approved_by = ?13, approved_at = ?14,
                 erp_order_ref = ?15, pushed_at = ?16, deleted_at = ?17, ready_json = ?18,
                 overall_confidence = ?19, extraction_confidence = ?20, customer_confidence = ?21,
                 matching_confidence = ?22, updated_at = ?23
             WHERE tenant_id = ?1 AND id = ?2",
            params![
                tenant_id,
                draft_id,
                draft.customer_id,
                draft.external_order_number,
                draft.order_date,
                draft.requested_delivery_date,
                draft.currency,
                draft.ship_to_json,
                draft.bill_to_json,
                draft.notes,
                draft.status.as_str(),
                draft.version,
                draft.approved_by,
                draft.approved_at,
                draft.erp_order_ref,
                draft.pushed_at,
                draft.deleted_at,
                draft.ready_json,
                draft.overall_confidence,
                draft.extraction_confidence,
                draft.customer_confidence,
                draft.matching_confidence,
                now
            ],
        )?;
        tx.commit()?;
        Ok(draft)
    }

    pub async fn update_line_match(
        &self,
        tenant_id: &str,
        line_id: &str,
        internal_sku: Option<&str>,
        match_method: Option<&str>,
        match_confidence: Option<f64>,
        candidates_json: &str,
    ) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "UPDATE draft_order_line
             SET internal_sku = ?3, match_method = ?4, match_confidence = ?5, candidates_json = ?6,
                 updated_at = ?7
             WHERE tenant_id = ?1 AND id = ?2",
            params![
                tenant_id,
                line_id,
                internal_sku,
                match_method,
                match_confidence,
                candidates_json,
                now
            ],
        )?;
        Ok(())
    }

    pub async fn set_line_internal_sku(
        &self,
        tenant_id: &str,
        line_id: &str,
        internal_sku: Option<&str>,
    ) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "UPDATE draft_order_line SET internal_sku = ?3, updated_at = ?4
             WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, line_id, internal_sku, now],
        )?;
        Ok(())
    }

    fn issue_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ValidationIssueRow> {
        let severity: String = row.get(6)?;
        let status: String = row.get(7)?;
        Ok(ValidationIssueRow {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            draft_id: row.get(2)?,
            line_id: row.get(3)?,
            line_no: row.get(4)?,
            issue_type: row.get(5)?,
            severity: IssueSeverity::parse(&severity).unwrap_or(IssueSeverity::Warning),
            status: IssueStatus::parse(&status).unwrap_or(IssueStatus::Open),
            message: row.get(8)?,
            details_json: row.get(9)?,
        })
    }

    pub async fn insert_issue(&self, issue: &ValidationIssueRow) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO validation_issue (id, tenant_id, draft_id, line_id, line_no, issue_type,
                                           severity, status, message, details_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                issue.id,
                issue.tenant_id,
                issue.draft_id,
                issue.line_id,
                issue.line_no,
                issue.issue_type,
                issue.severity.as_str(),
                issue.status.as_str(),
                issue.message,
                issue.details_json,
                now
            ],
        )?;
        Ok(())
    }

    pub async fn issues_for_draft(
        &self,
        tenant_id: &str,
        draft_id: &str,
    ) -> Result<Vec<ValidationIssueRow>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, tenant_id, draft_id, line_id, line_no, issue_type, severity, status,
                    message, details_json
             FROM validation_issue WHERE tenant_id = ?1 AND draft_id = ?2
             ORDER BY created_at",
        )?;
        let mut rows = stmt.query(params![tenant_id, draft_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(Self::issue_from_row(row)?);
        }
        Ok(out)
    }

    pub async fn delete_open_issues(&self, tenant_id: &str, draft_id: &str) -> Result<usize> {
        let conn = self.lock().await;
        let count = conn.execute(
            "DELETE FROM validation_issue
             WHERE tenant_id = ?1 AND draft_id = ?2 AND status = 'OPEN'",
            params![tenant_id, draft_id],
        )?;
        Ok(count)
    }

    pub async fn set_issue_status(
        &self,
        tenant_id: &str,
        issue_id: &str,
        status: IssueStatus,
        actor: Option<&str>,
    ) -> Result<()> {
        let now = now_rfc3339();
        let resolved_at = matches!(status, IssueStatus::Resolved | IssueStatus::Overridden)
            .then(|| now.clone());
        let conn = self.lock().await;
        conn.execute(
            "UPDATE validation_issue
             SET status = ?3, resolved_at = ?4, resolved_by = ?5, updated_at = ?6
             WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, issue_id, status.as_str(), resolved_at, actor, now],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(tenant: &str) -> DraftOrderRow {
        DraftOrderRow {
            id: new_id(),
            tenant_id: tenant.to_string(),
            customer_id: None,
            document_id: None,
            extraction_run_id: None,
            external_order_number: Some("PO-1".into()),
            order_date: None,
            requested_delivery_date: None,
            currency: Some("EUR".into()),
            ship_to_json: None,
            bill_to_json: None,
            notes: None,
            status: DraftStatus::New,
            version: 1,
            approved_by: None,
            approved_at: None,
            erp_order_ref: None,
            pushed_at: None,
            deleted_at: None,
            ready_json: None,
            overall_confidence: None,
            extraction_confidence: None,
            customer_confidence: None,
            matching_confidence: None,
        }
    }

    #[tokio::test]
    async fn version_lock_rejects_stale_updates() {
        let db = Db::open_in_memory().unwrap();
        let d = draft("t1");
        db.insert_draft(&d, &[]).await.unwrap();

        let updated = db
            .update_draft("t1", &d.id, 1, |draft| {
                draft.notes = Some("first".into());
            })
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        let err = db
            .update_draft("t1", &d.id, 1, |draft| {
                draft.notes = Some("stale".into());
            })
            .await
            .unwrap_err();
        let state = err.downcast_ref::<StateError>().unwrap();
        assert!(matches!(
            state,
            StateError::VersionConflict { expected: 1, stored: 2 }
        ));
    }

    #[tokio::test]
    async fn illegal_draft_transition_is_rejected() {
        let db = Db::open_in_memory().unwrap();
        let d = draft("t1");
        db.insert_draft(&d, &[]).await.unwrap();
        let err = db
            .update_draft("t1", &d.id, 1, |draft| {
                draft.status = DraftStatus::Approved;
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StateError>(),
            Some(StateError::IllegalTransition { .. })
        ));
    }

    #[tokio::test]
    async fn soft_deleted_drafts_are_hidden() {
        let db = Db::open_in_memory().unwrap();
        let d = draft("t1");
        db.insert_draft(&d, &[]).await.unwrap();
        db.update_draft("t1", &d.id, 1, |draft| {
            draft.deleted_at = Some(now_rfc3339());
        })
        .await
        .unwrap();
        assert!(db.get_draft("t1", &d.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn document_state_machine_enforced_in_store() {
        let db = Db::open_in_memory().unwrap();
        let doc = DocumentRow {
            id: new_id(),
            tenant_id: "t1".into(),
            message_id: None,
            sha256: "abc".into(),
            mime_type: "text/csv".into(),
            size_bytes: 10,
            storage_key: "k".into(),
            file_name: "order.csv".into(),
            source: "upload".into(),
            sender_email: None,
            status: DocumentStatus::Uploaded,
            error: None,
        };
        db.insert_document(&doc).await.unwrap();
        db.transition_document("t1", &doc.id, DocumentStatus::Stored, None)
            .await
            .unwrap();
        db.transition_document("t1", &doc.id, DocumentStatus::Processing, None)
            .await
            .unwrap();
        db.transition_document("t1", &doc.id, DocumentStatus::Extracted, None)
            .await
            .unwrap();
        let err = db
            .transition_document("t1", &doc.id, DocumentStatus::Processing, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StateError>(),
            Some(StateError::IllegalTransition { .. })
        ));
    }

    #[tokio::test]
    async fn cross_tenant_draft_read_finds_nothing() {
        let db = Db::open_in_memory().unwrap();
        let d = draft("t1");
        db.insert_draft(&d, &[]).await.unwrap();
        assert!(db.get_draft("t2", &d.id).await.unwrap().is_none());
    }
}
