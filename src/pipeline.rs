//! Document-to-draft pipeline: extraction, customer detection, line
//! matching and validation, driving the document and draft state machines.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::ai::prompts::PromptContext;
use crate::ai::{EmbeddingPort, LlmPort};
use crate::detect::CustomerDetector;
use crate::error::StateError;
use crate::extraction::router::ExtractionRouter;
use crate::extraction::CanonicalOutput;
use crate::matching::{MatchInput, Matcher, MatcherConfig};
use crate::models::{normalize_sku, DocumentStatus, DraftStatus, MatchStatus};
use crate::objectstore::ObjectStore;
use crate::store::orders::{DraftLineRow, DraftOrderRow};
use crate::store::{new_id, Db};
use crate::validation::ValidationEngine;

pub struct Pipeline {
    db: Db,
    store: Arc<dyn ObjectStore>,
    llm: Arc<dyn LlmPort>,
    embedder: Option<Arc<dyn EmbeddingPort>>,
}

#[derive(Debug)]
pub struct PipelineResult {
    pub draft_id: Option<String>,
    pub extraction_run_id: String,
    pub is_ready: bool,
}

impl Pipeline {
    pub fn new(
        db: Db,
        store: Arc<dyn ObjectStore>,
        llm: Arc<dyn LlmPort>,
        embedder: Option<Arc<dyn EmbeddingPort>>,
    ) -> Self {
        Self {
            db,
            store,
            llm,
            embedder,
        }
    }

    /// Process one stored document end to end. Returns the draft id when a
    /// draft was created; a failed extraction moves the document to FAILED
    /// and returns no draft.
    pub async fn process_document(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<PipelineResult> {
        let document = self
            .db
            .get_document(tenant_id, document_id)
            .await?
            .ok_or(StateError::NotFound)?;
        let settings = self.db.tenant_settings(tenant_id).await?;

        // An already-extracted document is a processed duplicate: hand back
        // the existing draft instead of re-running the pipeline.
        if document.status == DocumentStatus::Extracted {
            let run = self
                .db
                .latest_extraction_run(tenant_id, document_id)
                .await?
                .ok_or(StateError::NotFound)?;
            let draft = self.db.find_draft_by_document(tenant_id, document_id).await?;
            return Ok(PipelineResult {
                draft_id: draft.as_ref().map(|d| d.id.clone()),
                extraction_run_id: run.id,
                is_ready: draft
                    .and_then(|d| d.ready_json)
                    .and_then(|raw| serde_json::from_str::<crate::validation::ReadyCheck>(&raw).ok())
                    .map(|check| check.is_ready)
                    .unwrap_or(false),
            });
        }

        self.db
            .transition_document(tenant_id, document_id, DocumentStatus::Processing, None)
            .await?;

        let subject = match document.message_id.as_deref() {
            Some(message_id) => self
                .db
                .get_inbound_message(tenant_id, message_id)
                .await?
                .and_then(|m| m.subject),
            None => None,
        };

        let known_customer_numbers: Vec<String> = self
            .db
            .list_active_customers(tenant_id)
            .await?
            .into_iter()
            .filter_map(|c| c.erp_customer_number)
            .collect();
        let ctx = PromptContext {
            from_email: document.sender_email.clone(),
            subject,
            default_currency: settings.default_currency.clone(),
            known_customer_numbers,
            hint_examples: None,
        };

        let router = ExtractionRouter::new(self.db.clone(), self.store.clone(), self.llm.clone());
        let outcome = router.extract_document(tenant_id, &document, &ctx).await?;

        let Some(output) = outcome.output else {
            self.db
                .transition_document(
                    tenant_id,
                    document_id,
                    DocumentStatus::Failed,
                    outcome.run.error_message.as_deref(),
                )
                .await?;
            return Ok(PipelineResult {
                draft_id: None,
                extraction_run_id: outcome.run.id,
                is_ready: false,
            });
        };

        self.db
            .transition_document(tenant_id, document_id, DocumentStatus::Extracted, None)
            .await?;

        // Customer detection over sender metadata and document text.
        let document_text = self.document_text(tenant_id, &document).await;
        let detector = CustomerDetector::new(
            self.db.clone(),
            settings.auto_select_threshold,
            settings.min_gap,
        );
        let detection = detector
            .detect(
                tenant_id,
                document.sender_email.as_deref(),
                document_text.as_deref(),
                output.order.customer_hint.as_ref(),
            )
            .await?;
        if detection.ambiguous {
            info!(
                tenant_id,
                document_id,
                reason = detection.reason.as_deref().unwrap_or(""),
                "customer detection ambiguous, draft needs manual assignment"
            );
        }

        // Draft creation.
        let draft_id = self
            .create_draft(tenant_id, &document.id, &outcome.run.id, &output, &settings.default_currency, &detection)
            .await?;
        let created = self
            .db
            .get_draft(tenant_id, &draft_id)
            .await?
            .ok_or(StateError::NotFound)?;
        self.db
            .update_draft(tenant_id, &draft_id, created.version, |d| {
                d.status = DraftStatus::Extracted;
            })
            .await?;

        // Matching.
        let matching_confidence = self
            .match_lines(tenant_id, &draft_id, &detection.selected_customer_id)
            .await?;
        let current = self
            .db
            .get_draft(tenant_id, &draft_id)
            .await?
            .ok_or(StateError::NotFound)?;
        let extraction_confidence = output.confidence.overall;
        let customer_confidence = detection.confidence;
        let overall = overall_confidence(
            extraction_confidence,
            detection.selected_customer_id.is_some().then_some(customer_confidence),
            matching_confidence,
        );
        self.db
            .update_draft(tenant_id, &draft_id, current.version, move |d| {
                d.status = DraftStatus::Matched;
                d.matching_confidence = matching_confidence;
                d.overall_confidence = Some(overall);
            })
            .await?;

        // Validation and ready gate.
        let engine = ValidationEngine::new(self.db.clone());
        let run = engine.run(tenant_id, &draft_id).await?;
        if run.ready.is_ready {
            let current = self
                .db
                .get_draft(tenant_id, &draft_id)
                .await?
                .ok_or(StateError::NotFound)?;
            self.db
                .update_draft(tenant_id, &draft_id, current.version, |d| {
                    d.status = DraftStatus::Ready;
                })
                .await?;
        }

        info!(
            tenant_id,
            document_id,
            draft_id = %draft_id,
            is_ready = run.ready.is_ready,
            "document processed into draft"
        );
        Ok(PipelineResult {
            draft_id: Some(draft_id),
            extraction_run_id: outcome.run.id,
            is_ready: run.ready.is_ready,
        })
    }

    /// Text used for customer detection: the archived extracted text for
    /// PDFs, the raw bytes for text-based formats.
    async fn document_text(
        &self,
        tenant_id: &str,
        document: &crate::store::orders::DocumentRow,
    ) -> Option<String> {
        let text_key = format!("{tenant_id}/documents/{}/extracted_text.txt", document.id);
        if let Ok(bytes) = self.store.retrieve(&text_key).await {
            return Some(String::from_utf8_lossy(&bytes).to_string());
        }
        match self.store.retrieve(&document.storage_key).await {
            Ok(bytes) if document.mime_type != "application/pdf" => {
                Some(String::from_utf8_lossy(&bytes).to_string())
            }
            _ => None,
        }
    }

    async fn create_draft(
        &self,
        tenant_id: &str,
        document_id: &str,
        extraction_run_id: &str,
        output: &CanonicalOutput,
        default_currency: &str,
        detection: &crate::detect::DetectionResult,
    ) -> Result<String> {
        let draft_id = new_id();
        let order = &output.order;
        let draft = DraftOrderRow {
            id: draft_id.clone(),
            tenant_id: tenant_id.to_string(),
            customer_id: detection.selected_customer_id.clone(),
            document_id: Some(document_id.to_string()),
            extraction_run_id: Some(extraction_run_id.to_string()),
            external_order_number: order.external_order_number.clone(),
            order_date: order.order_date.map(|d| d.to_string()),
            requested_delivery_date: order.requested_delivery_date.map(|d| d.to_string()),
            currency: order
                .currency
                .clone()
                .or_else(|| Some(default_currency.to_string())),
            ship_to_json: order
                .ship_to
                .as_ref()
                .and_then(|a| serde_json::to_string(a).ok()),
            bill_to_json: None,
            notes: order.notes.clone(),
            status: DraftStatus::New,
            version: 1,
            approved_by: None,
            approved_at: None,
            erp_order_ref: None,
            pushed_at: None,
            deleted_at: None,
            ready_json: None,
            overall_confidence: None,
            extraction_confidence: Some(output.confidence.overall),
            customer_confidence: detection
                .selected_customer_id
                .is_some()
                .then_some(detection.confidence),
            matching_confidence: None,
        };

        let lines: Vec<DraftLineRow> = output
            .lines
            .iter()
            .map(|line| DraftLineRow {
                id: new_id(),
                tenant_id: tenant_id.to_string(),
                draft_id: draft_id.clone(),
                line_no: line.line_no as i64,
                customer_sku_raw: line.customer_sku_raw.clone(),
                customer_sku_norm: line.customer_sku_raw.as_deref().map(normalize_sku),
                internal_sku: None,
                description: line.product_description.clone(),
                qty: line.qty,
                uom: line.uom.clone(),
                unit_price_micros: line.unit_price.map(crate::models::micros_from_f64),
                currency: line.currency.clone(),
                requested_delivery_date: line.requested_delivery_date.map(|d| d.to_string()),
                match_method: None,
                match_confidence: None,
                candidates_json: "[]".to_string(),
            })
            .collect();

        self.db.insert_draft(&draft, &lines).await?;
        Ok(draft_id)
    }

    /// Match every line; single-line failures are recorded and skipped.
    /// Returns the mean confidence over lines that produced one.
    async fn match_lines(
        &self,
        tenant_id: &str,
        draft_id: &str,
        customer_id: &Option<String>,
    ) -> Result<Option<f64>> {
        let settings = self.db.tenant_settings(tenant_id).await?;
        let matcher = Matcher::new(
            self.db.clone(),
            self.embedder.clone(),
            MatcherConfig {
                embedding_model: settings.embedding_model.clone(),
                auto_apply_threshold: settings.auto_apply_threshold,
                auto_apply_gap: settings.auto_apply_gap,
                price_tolerance_percent: settings.price_tolerance_percent,
            },
        );

        let draft = self
            .db
            .get_draft(tenant_id, draft_id)
            .await?
            .ok_or(StateError::NotFound)?;
        let lines = self.db.lines_for_draft(tenant_id, draft_id).await?;
        let order_date = draft
            .order_date
            .as_deref()
            .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());

        let mut confidences = Vec::new();
        for line in &lines {
            let input = MatchInput {
                tenant_id: tenant_id.to_string(),
                customer_id: customer_id.clone(),
                customer_sku_raw: line.customer_sku_raw.clone(),
                customer_sku_norm: line.customer_sku_norm.clone(),
                description: line.description.clone(),
                uom: line.uom.clone(),
                qty: line.qty,
                unit_price_micros: line.unit_price_micros,
                currency: line.currency.clone().or(draft.currency.clone()),
                order_date,
            };
            match matcher.match_line(&input).await {
                Ok(outcome) => {
                    let applied_sku = match outcome.status {
                        MatchStatus::Matched | MatchStatus::Suggested => {
                            outcome.internal_sku.as_deref()
                        }
                        MatchStatus::Unmatched => None,
                    };
                    let candidates_json = serde_json::to_string(&outcome.candidates)?;
                    self.db
                        .update_line_match(
                            tenant_id,
                            &line.id,
                            applied_sku,
                            outcome.method.as_deref(),
                            Some(outcome.confidence),
                            &candidates_json,
                        )
                        .await?;
                    confidences.push(outcome.confidence);
                }
                Err(e) => {
                    // A failing line never fails the draft.
                    warn!(
                        tenant_id,
                        draft_id,
                        line_id = %line.id,
                        error = %e,
                        "line matching failed, leaving line unmatched"
                    );
                }
            }
        }

        if confidences.is_empty() {
            Ok(None)
        } else {
            Ok(Some(confidences.iter().sum::<f64>() / confidences.len() as f64))
        }
    }
}

/// Weighted blend of stage confidences. Missing stages drop out of the
/// weighting instead of dragging the score to zero.
fn overall_confidence(
    extraction: f64,
    customer: Option<f64>,
    matching: Option<f64>,
) -> f64 {
    let mut weighted = 0.4 * extraction;
    let mut weights = 0.4;
    if let Some(customer) = customer {
        weighted += 0.3 * customer;
        weights += 0.3;
    }
    if let Some(matching) = matching {
        weighted += 0.3 * matching;
        weights += 0.3;
    }
    (weighted / weights).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_confidence_blends_available_stages() {
        assert!((overall_confidence(0.8, None, None) - 0.8).abs() < 1e-9);
        let all = overall_confidence(0.8, Some(1.0), Some(0.6));
        let expected = (0.4 * 0.8 + 0.3 * 1.0 + 0.3 * 0.6) / 1.0;
        assert!((all - expected).abs() < 1e-9);
        let partial = overall_confidence(0.8, Some(0.9), None);
        let expected = (0.4 * 0.8 + 0.3 * 0.9) / 0.7;
        assert!((partial - expected).abs() < 1e-9);
    }
}
