//! Extraction router: picks the extractor per MIME type, runs the rule-based
//! path, falls back to the LLM behind the budget gate and the call ledger,
//! repairs malformed output once, and applies hallucination guards.

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use super::confidence::score_output;
use super::guards::apply_guards;
use super::{
    parse_canonical, pdf, table, warning_codes, CanonicalOutput, CSV_RULE_V1, LLM_V1, PDF_RULE_V1,
    TEXT_RULE_V1, XLSX_RULE_V1,
};
use crate::ai::budget::BudgetGate;
use crate::ai::cost::{calculate_cost_micros, estimate_text_tokens, estimate_vision_tokens};
use crate::ai::ledger::{
    input_hash, CallLedger, CALL_LLM_EXTRACT_TEXT, CALL_LLM_EXTRACT_VISION, CALL_LLM_REPAIR,
};
use crate::ai::prompts::{self, PromptContext};
use crate::ai::{LlmPort, LlmResponse};
use crate::error::LlmError;
use crate::models::ExtractionMethod;
use crate::objectstore::ObjectStore;
use crate::store::orders::{DocumentRow, ExtractionRunRow};
use crate::store::{new_id, Db, TenantSettings};

/// Closed set of extractor kinds, dispatched by MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorKind {
    RuleCsv,
    RuleXlsx,
    RulePdf,
    RuleText,
}

/// MIME dispatch table, in priority order.
const MIME_DISPATCH: &[(&str, ExtractorKind)] = &[
    ("text/csv", ExtractorKind::RuleCsv),
    ("application/csv", ExtractorKind::RuleCsv),
    (
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        ExtractorKind::RuleXlsx,
    ),
    ("application/vnd.ms-excel", ExtractorKind::RuleXlsx),
    ("application/pdf", ExtractorKind::RulePdf),
    ("text/plain", ExtractorKind::RuleText),
];

pub fn extractor_for_mime(mime: &str) -> Option<ExtractorKind> {
    let mime = mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase();
    MIME_DISPATCH
        .iter()
        .find(|(m, _)| *m == mime)
        .map(|(_, kind)| *kind)
}

#[derive(Debug)]
pub struct RouterOutcome {
    pub run: ExtractionRunRow,
    pub output: Option<CanonicalOutput>,
}

pub struct ExtractionRouter {
    db: Db,
    store: Arc<dyn ObjectStore>,
    llm: Arc<dyn LlmPort>,
    ledger: CallLedger,
}

impl ExtractionRouter {
    pub fn new(db: Db, store: Arc<dyn ObjectStore>, llm: Arc<dyn LlmPort>) -> Self {
        let ledger = CallLedger::new(db.clone());
        Self {
            db,
            store,
            llm,
            ledger,
        }
    }

    /// Run extraction for a stored document and persist the extraction run.
    pub async fn extract_document(
        &self,
        tenant_id: &str,
        document: &DocumentRow,
        ctx: &PromptContext,
    ) -> Result<RouterOutcome> {
        let started = Instant::now();
        let settings = self.db.tenant_settings(tenant_id).await?;

        // Idempotency: unchanged content and context reuses the prior run.
        let run_hash = input_hash(
            tenant_id,
            "extraction",
            &json!({
                "sha256": document.sha256,
                "from_email": ctx.from_email,
                "subject": ctx.subject,
                "default_currency": ctx.default_currency,
            }),
        );
        if let Some(previous) = self.db.find_succeeded_run_by_hash(tenant_id, &run_hash).await? {
            info!(tenant_id, document_id = %document.id, run_id = %previous.id, "reusing prior extraction run");
            let output = previous
                .output_json
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok());
            return Ok(RouterOutcome {
                run: previous,
                output,
            });
        }

        let Some(kind) = extractor_for_mime(&document.mime_type) else {
            let run = self
                .record_run(
                    tenant_id,
                    document,
                    ExtractionMethod::Rule,
                    "none",
                    &run_hash,
                    None,
                    0.0,
                    started,
                    None,
                    "FAILED",
                    Some(("UNSUPPORTED_MIME_TYPE", document.mime_type.as_str())),
                    &[],
                )
                .await?;
            return Ok(RouterOutcome { run, output: None });
        };

        let bytes = self
            .store
            .retrieve(&document.storage_key)
            .await
            .map_err(anyhow::Error::from)?;

        match kind {
            ExtractorKind::RuleCsv | ExtractorKind::RuleXlsx | ExtractorKind::RuleText => {
                let source_text = String::from_utf8_lossy(&bytes).to_string();
                let (rule_output, version) = match kind {
                    ExtractorKind::RuleCsv => (table::extract_from_csv(&bytes), CSV_RULE_V1),
                    ExtractorKind::RuleXlsx => (table::extract_from_xlsx(&bytes), XLSX_RULE_V1),
                    _ => (Ok(pdf::parse_pdf_text(&source_text)), TEXT_RULE_V1),
                };
                let mut rule_output = match rule_output {
                    Ok(output) => output,
                    Err(e) => {
                        let run = self
                            .record_run(
                                tenant_id,
                                document,
                                ExtractionMethod::Rule,
                                version,
                                &run_hash,
                                None,
                                0.0,
                                started,
                                None,
                                "FAILED",
                                Some(("INVALID_FILE", &e.to_string())),
                                &[],
                            )
                            .await?;
                        return Ok(RouterOutcome { run, output: None });
                    }
                };
                rule_output.extractor_version = version.to_string();
                let overall = score_output(
                    &mut rule_output,
                    settings.header_weight,
                    settings.lines_weight,
                    None,
                );

                if overall < settings.llm_trigger_confidence || rule_output.lines.is_empty() {
                    self.llm_fallback(
                        tenant_id,
                        document,
                        ctx,
                        &settings,
                        &run_hash,
                        Some(rule_output),
                        &source_text,
                        None,
                        started,
                        ExtractionMethod::LlmText,
                        None,
                    )
                    .await
                } else {
                    let run = self
                        .record_success(
                            tenant_id,
                            document,
                            ExtractionMethod::Rule,
                            version,
                            &run_hash,
                            &rule_output,
                            started,
                            None,
                        )
                        .await?;
                    Ok(RouterOutcome {
                        run,
                        output: Some(rule_output),
                    })
                }
            }
            ExtractorKind::RulePdf => {
                self.extract_pdf(tenant_id, document, ctx, &settings, &run_hash, &bytes, started)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn extract_pdf(
        &self,
        tenant_id: &str,
        document: &DocumentRow,
        ctx: &PromptContext,
        settings: &TenantSettings,
        run_hash: &str,
        bytes: &[u8],
        started: Instant,
    ) -> Result<RouterOutcome> {
        let content = match pdf::read_pdf(bytes) {
            Ok(content) => content,
            Err(e) => {
                let run = self
                    .record_run(
                        tenant_id,
                        document,
                        ExtractionMethod::Rule,
                        PDF_RULE_V1,
                        run_hash,
                        None,
                        0.0,
                        started,
                        None,
                        "FAILED",
                        Some(("INVALID_FILE", &e.to_string())),
                        &[],
                    )
                    .await?;
                return Ok(RouterOutcome { run, output: None });
            }
        };

        // Archive the extracted text next to the document for debugging and
        // anchor checks on later LLM output.
        let text_key = format!("{tenant_id}/documents/{}/extracted_text.txt", document.id);
        if let Err(e) = self.store.put_raw(&text_key, content.text.as_bytes()).await {
            warn!(error = %e, "failed to archive extracted pdf text");
        }

        let force_rule_only = content.page_count > settings.max_pages_for_llm as usize;
        let scanned = pdf::is_scanned(&content);

        if scanned && !force_rule_only {
            // Scanned artifact: straight to vision.
            return self
                .llm_fallback(
                    tenant_id,
                    document,
                    ctx,
                    settings,
                    run_hash,
                    None,
                    &content.text,
                    Some(bytes.to_vec()),
                    started,
                    ExtractionMethod::LlmVision,
                    Some(content.coverage),
                )
                .await;
        }

        let mut rule_output = pdf::extract_from_pdf(&content);
        let overall = score_output(
            &mut rule_output,
            settings.header_weight,
            settings.lines_weight,
            Some(content.coverage),
        );

        let needs_llm = overall < settings.llm_trigger_confidence || rule_output.lines.is_empty();
        if needs_llm && !force_rule_only {
            self.llm_fallback(
                tenant_id,
                document,
                ctx,
                settings,
                run_hash,
                Some(rule_output),
                &content.text,
                None,
                started,
                ExtractionMethod::LlmText,
                Some(content.coverage),
            )
            .await
        } else {
            if needs_llm && force_rule_only {
                rule_output.push_warning(
                    warning_codes::LOW_TEXT_COVERAGE,
                    format!(
                        "{} pages exceed the LLM page limit, rule-based result kept",
                        content.page_count
                    ),
                );
            }
            let run = self
                .record_success(
                    tenant_id,
                    document,
                    ExtractionMethod::Rule,
                    PDF_RULE_V1,
                    run_hash,
                    &rule_output,
                    started,
                    Some(content.coverage),
                )
                .await?;
            Ok(RouterOutcome {
                run,
                output: Some(rule_output),
            })
        }
    }

    /// LLM fallback path: budget gate, ledger dedup, one call, one repair,
    /// hallucination guards. When the budget blocks the call the rule-based
    /// result is returned with a warning instead.
    #[allow(clippy::too_many_arguments)]
    async fn llm_fallback(
        &self,
        tenant_id: &str,
        document: &DocumentRow,
        ctx: &PromptContext,
        settings: &TenantSettings,
        run_hash: &str,
        rule_output: Option<CanonicalOutput>,
        source_text: &str,
        page_images: Option<Vec<u8>>,
        started: Instant,
        method: ExtractionMethod,
        coverage: Option<f64>,
    ) -> Result<RouterOutcome> {
        let budget = BudgetGate::check(&self.db, tenant_id, settings).await?;
        if !budget.allowed {
            let mut output = rule_output.unwrap_or_else(|| CanonicalOutput::empty(LLM_V1));
            output.push_warning(
                warning_codes::BUDGET_EXCEEDED,
                format!(
                    "daily LLM budget exhausted ({} of {} micros), rule-based result kept",
                    budget.used_micros, budget.budget_micros
                ),
            );
            let version = output.extractor_version.clone();
            let run = self
                .record_success(
                    tenant_id,
                    document,
                    ExtractionMethod::Rule,
                    &version,
                    run_hash,
                    &output,
                    started,
                    coverage,
                )
                .await?;
            return Ok(RouterOutcome {
                run,
                output: Some(output),
            });
        }

        let call_type = match method {
            ExtractionMethod::LlmVision => CALL_LLM_EXTRACT_VISION,
            _ => CALL_LLM_EXTRACT_TEXT,
        };
        let estimated_tokens = match method {
            ExtractionMethod::LlmVision => {
                estimate_vision_tokens(estimate_pages(source_text, coverage).unwrap_or(1))
            }
            _ => estimate_text_tokens(source_text),
        };
        tracing::debug!(
            tenant_id,
            document_id = %document.id,
            call_type,
            estimated_tokens,
            "llm fallback authorized by budget gate"
        );
        let llm_hash = input_hash(
            tenant_id,
            call_type,
            &json!({
                "sha256": document.sha256,
                "from_email": ctx.from_email,
                "subject": ctx.subject,
                "default_currency": ctx.default_currency,
            }),
        );

        // Ledger dedup: an identical call within the window reuses the
        // stored result and makes no provider request.
        if let Some(prior) = self.ledger.find_reusable(tenant_id, call_type, &llm_hash).await? {
            if let Some(parsed) = prior
                .result_json
                .as_deref()
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            {
                if let Ok(mut output) = parse_canonical(&parsed) {
                    info!(tenant_id, document_id = %document.id, "reusing ledgered llm result");
                    output.extractor_version = LLM_V1.to_string();
                    apply_guards(
                        &mut output,
                        source_text,
                        estimate_pages(source_text, coverage),
                        settings.max_qty,
                    );
                    let run = self
                        .record_success(
                            tenant_id, document, method, LLM_V1, run_hash, &output, started,
                            coverage,
                        )
                        .await?;
                    return Ok(RouterOutcome {
                        run,
                        output: Some(output),
                    });
                }
            }
        }

        let response = match method {
            ExtractionMethod::LlmVision => {
                let (system, user) = prompts::build_vision_prompt(ctx);
                let images = vec![page_images.unwrap_or_default()];
                self.llm.extract_from_images(&system, &user, &images).await
            }
            _ => {
                let (system, user) = prompts::build_text_prompt(source_text, ctx);
                self.llm.extract_from_text(&system, &user).await
            }
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.ledger
                    .record_failure(
                        tenant_id,
                        call_type,
                        &llm_hash,
                        "unknown",
                        "unknown",
                        e.code(),
                        &e.to_string(),
                        Some(&document.id),
                    )
                    .await?;
                return self
                    .llm_failed(
                        tenant_id, document, method, run_hash, rule_output, started, coverage,
                        e.code(), &e.to_string(),
                    )
                    .await;
            }
        };

        self.record_llm_cost(tenant_id, call_type, &llm_hash, &response, &document.id)
            .await?;

        // Parse; on malformed output issue exactly one repair call.
        let parsed = match self.parse_with_repair(tenant_id, document, &response).await? {
            Ok(output) => output,
            Err((code, message)) => {
                return self
                    .llm_failed(
                        tenant_id, document, method, run_hash, rule_output, started, coverage,
                        code, &message,
                    )
                    .await;
            }
        };

        let mut output = parsed;
        output.extractor_version = LLM_V1.to_string();
        let page_count = match method {
            ExtractionMethod::LlmVision => Some(estimate_pages(source_text, coverage)),
            _ => coverage.map(|c| estimate_pages(source_text, Some(c))),
        }
        .flatten();
        apply_guards(&mut output, source_text, page_count, settings.max_qty);

        let run = self
            .record_success(
                tenant_id, document, method, LLM_V1, run_hash, &output, started, coverage,
            )
            .await?;
        Ok(RouterOutcome {
            run,
            output: Some(output),
        })
    }

    /// Parse the provider response against the canonical schema. Malformed
    /// output gets exactly one repair call; further failures are terminal.
    async fn parse_with_repair(
        &self,
        tenant_id: &str,
        document: &DocumentRow,
        response: &LlmResponse,
    ) -> Result<std::result::Result<CanonicalOutput, (&'static str, String)>> {
        let (value, first_error): (Option<serde_json::Value>, Option<String>) =
            match response.parsed.clone() {
                Some(value) => (Some(value), None),
                None => match serde_json::from_str::<serde_json::Value>(response.raw_output.trim())
                {
                    Ok(value) => (Some(value), None),
                    Err(e) => (None, Some(e.to_string())),
                },
            };

        let schema_error = match value {
            Some(value) => match parse_canonical(&value) {
                Ok(output) => return Ok(Ok(output)),
                Err(e) => Some(e.to_string()),
            },
            None => None,
        };

        let validation_error = schema_error
            .clone()
            .or(first_error.clone())
            .unwrap_or_else(|| "unparsable output".to_string());
        let (system, user) = prompts::build_repair_prompt(&response.raw_output, &validation_error);

        let repair_hash = input_hash(
            tenant_id,
            CALL_LLM_REPAIR,
            &json!({ "raw": response.raw_output, "error": validation_error }),
        );
        let repaired = match self.llm.repair_structured_output(&system, &user).await {
            Ok(repaired) => repaired,
            Err(e) => {
                self.ledger
                    .record_failure(
                        tenant_id,
                        CALL_LLM_REPAIR,
                        &repair_hash,
                        &response.provider,
                        &response.model,
                        e.code(),
                        &e.to_string(),
                        Some(&document.id),
                    )
                    .await?;
                let code = if schema_error.is_some() {
                    warning_codes::LLM_SCHEMA_MISMATCH
                } else {
                    warning_codes::LLM_INVALID_JSON
                };
                return Ok(Err((code, format!("repair call failed: {e}"))));
            }
        };
        self.record_llm_cost(tenant_id, CALL_LLM_REPAIR, &repair_hash, &repaired, &document.id)
            .await?;

        let repaired_value = match repaired.parsed.clone() {
            Some(value) => Some(value),
            None => serde_json::from_str::<serde_json::Value>(repaired.raw_output.trim()).ok(),
        };
        match repaired_value {
            Some(value) => match parse_canonical(&value) {
                Ok(output) => Ok(Ok(output)),
                Err(e) => Ok(Err((
                    warning_codes::LLM_SCHEMA_MISMATCH,
                    format!("repaired output still invalid: {e}"),
                ))),
            },
            None => Ok(Err((
                warning_codes::LLM_INVALID_JSON,
                "repaired output is not valid structured data".to_string(),
            ))),
        }
    }

    async fn record_llm_cost(
        &self,
        tenant_id: &str,
        call_type: &str,
        hash: &str,
        response: &LlmResponse,
        document_id: &str,
    ) -> Result<()> {
        let cost = if response.cost_micros > 0 {
            response.cost_micros
        } else {
            calculate_cost_micros(
                &response.provider,
                &response.model,
                response.input_tokens,
                response.output_tokens,
            )
        };
        self.ledger
            .record_success(
                tenant_id,
                call_type,
                hash,
                &response.provider,
                &response.model,
                response.input_tokens,
                response.output_tokens,
                response.latency_ms,
                cost,
                response.parsed.as_ref(),
                Some(document_id),
            )
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn llm_failed(
        &self,
        tenant_id: &str,
        document: &DocumentRow,
        method: ExtractionMethod,
        run_hash: &str,
        rule_output: Option<CanonicalOutput>,
        started: Instant,
        coverage: Option<f64>,
        error_code: &str,
        error_message: &str,
    ) -> Result<RouterOutcome> {
        // The rule-based result, if any, is still recorded on the failed run.
        let run = self
            .record_run(
                tenant_id,
                document,
                method,
                LLM_V1,
                run_hash,
                rule_output.as_ref(),
                rule_output
                    .as_ref()
                    .map(|o| o.confidence.overall)
                    .unwrap_or(0.0),
                started,
                coverage,
                "FAILED",
                Some((error_code, error_message)),
                &[],
            )
            .await?;
        Ok(RouterOutcome {
            run,
            output: rule_output,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_success(
        &self,
        tenant_id: &str,
        document: &DocumentRow,
        method: ExtractionMethod,
        extractor_version: &str,
        run_hash: &str,
        output: &CanonicalOutput,
        started: Instant,
        coverage: Option<f64>,
    ) -> Result<ExtractionRunRow> {
        self.record_run(
            tenant_id,
            document,
            method,
            extractor_version,
            run_hash,
            Some(output),
            output.confidence.overall,
            started,
            coverage,
            "SUCCEEDED",
            None,
            &output.warnings,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_run(
        &self,
        tenant_id: &str,
        document: &DocumentRow,
        method: ExtractionMethod,
        extractor_version: &str,
        run_hash: &str,
        output: Option<&CanonicalOutput>,
        confidence: f64,
        started: Instant,
        coverage: Option<f64>,
        status: &str,
        error: Option<(&str, &str)>,
        warnings: &[super::Warning],
    ) -> Result<ExtractionRunRow> {
        let run = ExtractionRunRow {
            id: new_id(),
            tenant_id: tenant_id.to_string(),
            document_id: document.id.clone(),
            method: method.as_str().to_string(),
            extractor_version: extractor_version.to_string(),
            input_hash: run_hash.to_string(),
            output_json: output.map(|o| serde_json::to_string(o)).transpose()?,
            confidence,
            runtime_ms: started.elapsed().as_millis() as i64,
            text_coverage: coverage,
            status: status.to_string(),
            error_code: error.map(|(code, _)| code.to_string()),
            error_message: error.map(|(_, message)| message.to_string()),
            warnings_json: serde_json::to_string(warnings)?,
        };
        self.db.insert_extraction_run(&run).await?;
        Ok(run)
    }
}

/// Rough page estimate from coverage and text length; used only to feed the
/// lines-count guard when the true page count is unavailable.
fn estimate_pages(source_text: &str, coverage: Option<f64>) -> Option<usize> {
    match coverage {
        Some(coverage) if coverage > 0.0 => {
            let chars = source_text.len() as f64;
            Some(((chars / 2500.0 / coverage).ceil() as usize).max(1))
        }
        _ => {
            let pages = source_text.len() / 2500 + 1;
            Some(pages)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{scripted_json_response, ScriptedLlm};
    use crate::models::DocumentStatus;
    use crate::objectstore::{sha256_hex, FsObjectStore};
    use crate::store::orders::DocumentRow;

    fn prompt_ctx() -> PromptContext {
        PromptContext {
            from_email: Some("buyer@acme.de".into()),
            subject: Some("Bestellung".into()),
            default_currency: "EUR".into(),
            known_customer_numbers: vec![],
            hint_examples: None,
        }
    }

    async fn store_document(
        db: &Db,
        store: &FsObjectStore,
        name: &str,
        mime: &str,
        bytes: &[u8],
    ) -> DocumentRow {
        use crate::objectstore::ObjectStore as _;
        let stored = store.store("t1", name, mime, bytes).await.unwrap();
        let doc = DocumentRow {
            id: new_id(),
            tenant_id: "t1".into(),
            message_id: None,
            sha256: sha256_hex(bytes),
            mime_type: mime.into(),
            size_bytes: bytes.len() as i64,
            storage_key: stored.key,
            file_name: name.into(),
            source: "upload".into(),
            sender_email: None,
            status: DocumentStatus::Stored,
            error: None,
        };
        db.insert_document(&doc).await.unwrap();
        doc
    }

    fn llm_payload() -> serde_json::Value {
        serde_json::json!({
            "order": {
                "external_order_number": "PO-77",
                "order_date": "2025-01-04",
                "currency": "EUR",
                "requested_delivery_date": null,
                "customer_hint": { "name": null, "email": null, "erp_customer_number": "K-100" },
                "notes": null,
                "ship_to": null
            },
            "lines": [{
                "line_no": 1,
                "customer_sku_raw": "ABC-123",
                "product_description": "Kabel NYM-J dreifach",
                "qty": 10.0,
                "uom": "M",
                "unit_price": 1.23,
                "currency": "EUR",
                "requested_delivery_date": null
            }],
            "confidence": {
                "order": { "external_order_number": 0.95, "order_date": 0.9, "currency": 0.9 },
                "lines": [{ "customer_sku_raw": 0.95, "qty": 0.9, "uom": 0.9, "unit_price": 0.9 }],
                "overall": 0.9
            },
            "warnings": [],
            "extractor_version": "llm_v1"
        })
    }

    const GOOD_CSV: &str = "\
Bestellnummer: PO-2025-001;;;;
Datum: 2025-01-04;;;;
Währung: EUR;;;;
Pos;Artikelnummer;Bezeichnung;Menge;Einheit;E-Preis
1;ABC-123;Kabel NYM-J 3x1,5;10;M;1,23
2;DEF-456;Schalter weiss;5;Stk;4,50
3;GHI-789;Dose;20;ST;0,80
";

    #[tokio::test]
    async fn good_csv_stays_rule_based() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_in_memory().unwrap();
        db.insert_tenant("t1", "acme", "Acme").await.unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path()));
        let llm = Arc::new(ScriptedLlm::new());
        let router = ExtractionRouter::new(db.clone(), store.clone(), llm.clone());

        let doc = store_document(&db, &store, "order.csv", "text/csv", GOOD_CSV.as_bytes()).await;
        let outcome = router
            .extract_document("t1", &doc, &prompt_ctx())
            .await
            .unwrap();

        assert_eq!(outcome.run.status, "SUCCEEDED");
        assert_eq!(outcome.run.method, "rule");
        assert_eq!(outcome.run.extractor_version, CSV_RULE_V1);
        let output = outcome.output.unwrap();
        assert_eq!(output.lines.len(), 3);
        assert!(output.confidence.overall >= 0.8);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn zero_lines_triggers_llm_fallback_with_guards() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_in_memory().unwrap();
        db.insert_tenant("t1", "acme", "Acme").await.unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path()));
        let llm = Arc::new(ScriptedLlm::new());
        llm.push_ok(scripted_json_response(llm_payload()));
        let router = ExtractionRouter::new(db.clone(), store.clone(), llm.clone());

        // Free text mentioning the SKU so the anchor check passes.
        let text = "Hallo, wir bestellen ABC-123 Kabel, zehn 10 Meter wie gehabt. Danke!";
        let doc = store_document(&db, &store, "mail.txt", "text/plain", text.as_bytes()).await;
        let outcome = router
            .extract_document("t1", &doc, &prompt_ctx())
            .await
            .unwrap();

        assert_eq!(llm.call_count(), 1);
        assert_eq!(outcome.run.method, "llm_text");
        assert_eq!(outcome.run.extractor_version, LLM_V1);
        let output = outcome.output.unwrap();
        assert_eq!(output.lines.len(), 1);
        assert!(!output
            .warnings
            .iter()
            .any(|w| w.code == warning_codes::ANCHOR_CHECK_FAILED));
        assert_eq!(db.count_ai_calls("t1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn identical_rerun_reuses_run_and_makes_no_calls() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_in_memory().unwrap();
        db.insert_tenant("t1", "acme", "Acme").await.unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path()));
        let llm = Arc::new(ScriptedLlm::new());
        llm.push_ok(scripted_json_response(llm_payload()));
        let router = ExtractionRouter::new(db.clone(), store.clone(), llm.clone());

        let text = "Bestellung ABC-123 bitte 10 Stueck";
        let doc = store_document(&db, &store, "mail.txt", "text/plain", text.as_bytes()).await;
        let first = router.extract_document("t1", &doc, &prompt_ctx()).await.unwrap();
        assert_eq!(llm.call_count(), 1);

        let second = router.extract_document("t1", &doc, &prompt_ctx()).await.unwrap();
        assert_eq!(llm.call_count(), 1);
        assert_eq!(second.run.id, first.run.id);
        assert_eq!(db.count_ai_calls("t1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn repair_is_attempted_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_in_memory().unwrap();
        db.insert_tenant("t1", "acme", "Acme").await.unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path()));
        let llm = Arc::new(ScriptedLlm::new());
        // First response: broken JSON. Second (repair): valid payload.
        llm.push_ok(LlmResponse {
            raw_output: "{broken".into(),
            parsed: None,
            provider: "scripted".into(),
            model: "scripted-v1".into(),
            input_tokens: 10,
            output_tokens: 5,
            latency_ms: 5,
            cost_micros: 1,
            warnings: vec![],
        });
        llm.push_ok(scripted_json_response(llm_payload()));
        let router = ExtractionRouter::new(db.clone(), store.clone(), llm.clone());

        let text = "Bestellung ABC-123 bitte 10 Stueck";
        let doc = store_document(&db, &store, "mail.txt", "text/plain", text.as_bytes()).await;
        let outcome = router.extract_document("t1", &doc, &prompt_ctx()).await.unwrap();

        assert_eq!(llm.call_count(), 2);
        assert_eq!(outcome.run.status, "SUCCEEDED");
        assert!(outcome.output.is_some());
    }

    #[tokio::test]
    async fn failed_repair_is_terminal_with_error_code() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_in_memory().unwrap();
        db.insert_tenant("t1", "acme", "Acme").await.unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path()));
        let llm = Arc::new(ScriptedLlm::new());
        llm.push_ok(LlmResponse {
            raw_output: "{broken".into(),
            parsed: None,
            provider: "scripted".into(),
            model: "scripted-v1".into(),
            input_tokens: 10,
            output_tokens: 5,
            latency_ms: 5,
            cost_micros: 1,
            warnings: vec![],
        });
        llm.push_ok(LlmResponse {
            raw_output: "still {broken".into(),
            parsed: None,
            provider: "scripted".into(),
            model: "scripted-v1".into(),
            input_tokens: 10,
            output_tokens: 5,
            latency_ms: 5,
            cost_micros: 1,
            warnings: vec![],
        });
        let router = ExtractionRouter::new(db.clone(), store.clone(), llm.clone());

        let text = "unstrukturierter text ohne bestellzeilen";
        let doc = store_document(&db, &store, "mail.txt", "text/plain", text.as_bytes()).await;
        let outcome = router.extract_document("t1", &doc, &prompt_ctx()).await.unwrap();

        assert_eq!(llm.call_count(), 2);
        assert_eq!(outcome.run.status, "FAILED");
        assert_eq!(
            outcome.run.error_code.as_deref(),
            Some(warning_codes::LLM_INVALID_JSON)
        );
    }

    #[tokio::test]
    async fn budget_block_returns_rule_result_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_in_memory().unwrap();
        db.insert_tenant("t1", "acme", "Acme").await.unwrap();
        let mut settings = db.tenant_settings("t1").await.unwrap();
        settings.daily_budget_micros = 1;
        db.update_tenant_settings("t1", &settings).await.unwrap();
        // Burn the budget.
        let ledger = CallLedger::new(db.clone());
        ledger
            .record_success(
                "t1",
                CALL_LLM_EXTRACT_TEXT,
                "h",
                "openai",
                "gpt-4o-mini",
                10,
                10,
                10,
                10,
                None,
                None,
            )
            .await
            .unwrap();

        let store = Arc::new(FsObjectStore::new(dir.path()));
        let llm = Arc::new(ScriptedLlm::new());
        let router = ExtractionRouter::new(db.clone(), store.clone(), llm.clone());

        let text = "unstrukturierter text ohne bestellzeilen";
        let doc = store_document(&db, &store, "mail.txt", "text/plain", text.as_bytes()).await;
        let outcome = router.extract_document("t1", &doc, &prompt_ctx()).await.unwrap();

        assert_eq!(llm.call_count(), 0);
        assert_eq!(outcome.run.status, "SUCCEEDED");
        let output = outcome.output.unwrap();
        assert!(output
            .warnings
            .iter()
            .any(|w| w.code == warning_codes::BUDGET_EXCEEDED));
    }

    #[tokio::test]
    async fn provider_timeout_records_failed_run_with_rule_output() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_in_memory().unwrap();
        db.insert_tenant("t1", "acme", "Acme").await.unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path()));
        let llm = Arc::new(ScriptedLlm::new());
        llm.push_err(LlmError::Timeout(40));
        let router = ExtractionRouter::new(db.clone(), store.clone(), llm.clone());

        let text = "unstrukturierter text ohne bestellzeilen";
        let doc = store_document(&db, &store, "mail.txt", "text/plain", text.as_bytes()).await;
        let outcome = router.extract_document("t1", &doc, &prompt_ctx()).await.unwrap();

        assert_eq!(outcome.run.status, "FAILED");
        assert_eq!(outcome.run.error_code.as_deref(), Some("LLM_TIMEOUT"));
        // rule output (zero lines) still attached
        assert!(outcome.output.is_some());
    }

    #[test]
    fn mime_dispatch_table() {
        assert_eq!(extractor_for_mime("text/csv"), Some(ExtractorKind::RuleCsv));
        assert_eq!(
            extractor_for_mime("application/pdf; charset=binary"),
            Some(ExtractorKind::RulePdf)
        );
        assert_eq!(
            extractor_for_mime(
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            ),
            Some(ExtractorKind::RuleXlsx)
        );
        assert_eq!(extractor_for_mime("image/png"), None);
    }
}
