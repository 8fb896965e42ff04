//! Background worker orchestration: typed tasks, tenant scoping, retry with
//! exponential backoff and jitter, idempotency via content hashes and unique
//! keys, and poison handling after terminal failure.

use anyhow::Result;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::ai::cost::calculate_cost_micros;
use crate::ai::ledger::{input_hash, CallLedger, CALL_EMBED};
use crate::ai::{EmbeddingPort, LlmPort};
use crate::error::{StateError, TaskError};
use crate::export::ack::AckPoller;
use crate::export::crypto::ConfigCrypto;
use crate::export::{DropzoneTransport, Exporter};
use crate::inbound::{InboundMessage, InboundProcessor};
use crate::matching::embed::{product_embedding_text, text_hash};
use crate::models::DocumentStatus;
use crate::objectstore::ObjectStore;
use crate::pipeline::Pipeline;
use crate::store::catalog::ProductEmbeddingRow;
use crate::store::{new_id, Db};

/// Background work, one variant per task type.
#[derive(Debug)]
pub enum Task {
    EmbedProduct {
        tenant_id: String,
        product_id: String,
        force_recompute: bool,
    },
    RebuildEmbeddingsForTenant {
        tenant_id: String,
    },
    ExtractDocument {
        tenant_id: String,
        document_id: String,
    },
    ProcessInboundMessage {
        tenant_id: String,
        message: InboundMessage,
    },
    ExportDraft {
        tenant_id: String,
        draft_id: String,
    },
    /// System task: scans every active connection; per-connection work is
    /// scoped to that connection's tenant.
    PollAcks,
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Task::EmbedProduct { .. } => "embed_product",
            Task::RebuildEmbeddingsForTenant { .. } => "rebuild_embeddings_for_tenant",
            Task::ExtractDocument { .. } => "extract_document",
            Task::ProcessInboundMessage { .. } => "process_inbound_message",
            Task::ExportDraft { .. } => "export_draft",
            Task::PollAcks => "poll_acks",
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            Task::EmbedProduct { tenant_id, .. }
            | Task::RebuildEmbeddingsForTenant { tenant_id }
            | Task::ExtractDocument { tenant_id, .. }
            | Task::ProcessInboundMessage { tenant_id, .. }
            | Task::ExportDraft { tenant_id, .. } => Some(tenant_id),
            Task::PollAcks => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: String,
    pub detail: serde_json::Value,
}

impl TaskOutcome {
    pub fn new(status: &str, detail: serde_json::Value) -> Self {
        Self {
            status: status.to_string(),
            detail,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
        }
    }
}

/// Exponential backoff with up to 25% jitter, capped.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt.saturating_sub(1));
    let capped = exp.min(policy.max_delay.as_millis() as u64);
    let jitter = rand::thread_rng().gen_range(0..=capped / 4);
    Duration::from_millis(capped + jitter)
}

pub struct Executor {
    pub db: Db,
    pub store: Arc<dyn ObjectStore>,
    pub llm: Arc<dyn LlmPort>,
    pub embedder: Arc<dyn EmbeddingPort>,
    pub transport: Arc<dyn DropzoneTransport>,
    pub config_pepper: String,
}

impl Executor {
    pub async fn execute(&self, task: &Task) -> Result<TaskOutcome, TaskError> {
        match task {
            Task::EmbedProduct {
                tenant_id,
                product_id,
                force_recompute,
            } => self.embed_product(tenant_id, product_id, *force_recompute).await,
            Task::RebuildEmbeddingsForTenant { tenant_id } => {
                self.rebuild_embeddings(tenant_id).await
            }
            Task::ExtractDocument {
                tenant_id,
                document_id,
            } => self.extract_document(tenant_id, document_id).await,
            Task::ProcessInboundMessage { tenant_id, message } => {
                self.process_inbound(tenant_id, message).await
            }
            Task::ExportDraft {
                tenant_id,
                draft_id,
            } => self.export_draft(tenant_id, draft_id).await,
            Task::PollAcks => self.poll_acks().await,
        }
    }

    /// Idempotent: unchanged canonical text short-circuits with `skipped`.
    async fn embed_product(
        &self,
        tenant_id: &str,
        product_id: &str,
        force_recompute: bool,
    ) -> Result<TaskOutcome, TaskError> {
        let settings = self
            .db
            .tenant_settings(tenant_id)
            .await
            .map_err(TaskError::recoverable)?;
        let product = self
            .db
            .get_product(tenant_id, product_id)
            .await
            .map_err(TaskError::recoverable)?
            .ok_or_else(|| TaskError::terminal(StateError::NotFound))?;

        let text = product_embedding_text(&product);
        let hash = text_hash(&text);
        let model = settings.embedding_model.clone();

        if !force_recompute {
            if let Some(existing) = self
                .db
                .get_embedding(tenant_id, product_id, &model)
                .await
                .map_err(TaskError::recoverable)?
            {
                if existing.text_hash == hash {
                    return Ok(TaskOutcome::new(
                        "skipped",
                        json!({ "product_id": product_id, "text_hash": hash }),
                    ));
                }
            }
        }

        let response = self
            .embedder
            .embed_text(&model, &text)
            .await
            .map_err(TaskError::from_embedding)?;

        let ledger = CallLedger::new(self.db.clone());
        let call_hash = input_hash(tenant_id, CALL_EMBED, &json!({ "model": model, "text": text }));
        let cost = calculate_cost_micros(&response.provider, &response.model, response.input_tokens, 0);
        ledger
            .record_success(
                tenant_id,
                CALL_EMBED,
                &call_hash,
                &response.provider,
                &response.model,
                response.input_tokens,
                0,
                response.latency_ms,
                cost,
                None,
                None,
            )
            .await
            .map_err(TaskError::recoverable)?;

        self.db
            .upsert_embedding(&ProductEmbeddingRow {
                id: new_id(),
                tenant_id: tenant_id.to_string(),
                product_id: product_id.to_string(),
                model,
                vector: response.vector,
                text_hash: hash.clone(),
            })
            .await
            .map_err(TaskError::recoverable)?;

        Ok(TaskOutcome::new(
            "created",
            json!({ "product_id": product_id, "text_hash": hash, "cost_micros": cost }),
        ))
    }

    async fn rebuild_embeddings(&self, tenant_id: &str) -> Result<TaskOutcome, TaskError> {
        let products = self
            .db
            .list_active_products(tenant_id)
            .await
            .map_err(TaskError::recoverable)?;
        let mut created = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;
        for product in &products {
            match self.embed_product(tenant_id, &product.id, false).await {
                Ok(outcome) if outcome.status == "skipped" => skipped += 1,
                Ok(_) => created += 1,
                Err(e) => {
                    warn!(tenant_id, product_id = %product.id, error = %e, "embedding failed");
                    failed += 1;
                }
            }
        }
        Ok(TaskOutcome::new(
            "completed",
            json!({ "created": created, "skipped": skipped, "failed": failed }),
        ))
    }

    async fn extract_document(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<TaskOutcome, TaskError> {
        let pipeline = Pipeline::new(
            self.db.clone(),
            self.store.clone(),
            self.llm.clone(),
            Some(self.embedder.clone()),
        );
        let result = pipeline
            .process_document(tenant_id, document_id)
            .await
            .map_err(classify_pipeline_error)?;
        Ok(TaskOutcome::new(
            if result.draft_id.is_some() { "completed" } else { "extraction_failed" },
            json!({
                "draft_id": result.draft_id,
                "extraction_run_id": result.extraction_run_id,
                "is_ready": result.is_ready,
            }),
        ))
    }

    async fn process_inbound(
        &self,
        tenant_id: &str,
        message: &InboundMessage,
    ) -> Result<TaskOutcome, TaskError> {
        let processor = InboundProcessor::new(self.db.clone(), self.store.clone());
        let result = processor
            .process_message(tenant_id, message)
            .await
            .map_err(TaskError::recoverable)?;

        // Chain extraction for every stored document.
        let mut completed = Vec::new();
        for document_id in &result.document_ids {
            match self.extract_document(tenant_id, document_id).await {
                Ok(outcome) => completed.push(outcome.detail),
                Err(e) => {
                    warn!(tenant_id, document_id, error = %e, "chained extraction failed");
                }
            }
        }
        Ok(TaskOutcome::new(
            "completed",
            json!({
                "message_id": result.message_id,
                "documents": result.document_ids,
                "skipped": result.skipped.len(),
                "drafts": completed,
            }),
        ))
    }

    async fn export_draft(&self, tenant_id: &str, draft_id: &str) -> Result<TaskOutcome, TaskError> {
        let exporter = Exporter::new(
            self.db.clone(),
            self.store.clone(),
            self.transport.clone(),
            ConfigCrypto::new(&self.config_pepper),
        );
        let export = exporter
            .export_draft(tenant_id, draft_id)
            .await
            .map_err(classify_pipeline_error)?;
        Ok(TaskOutcome::new(
            export.status.as_str(),
            json!({ "export_id": export.id, "dropzone_path": export.dropzone_path }),
        ))
    }

    async fn poll_acks(&self) -> Result<TaskOutcome, TaskError> {
        let poller = AckPoller::new(
            self.db.clone(),
            self.transport.clone(),
            ConfigCrypto::new(&self.config_pepper),
        );
        let stats = poller.poll_all().await.map_err(TaskError::recoverable)?;
        Ok(TaskOutcome::new(
            "completed",
            json!({
                "connections_checked": stats.connections_checked,
                "acks_processed": stats.acks_processed,
                "errors": stats.errors,
            }),
        ))
    }

    /// Terminal failure: mark the underlying record FAILED so the poison is
    /// visible; no further automatic retries.
    async fn poison(&self, task: &Task, error: &TaskError) {
        error!(task = task.kind(), error = %error, "task failed terminally");
        if let Task::ExtractDocument {
            tenant_id,
            document_id,
        } = task
        {
            if let Err(e) = self
                .db
                .transition_document(
                    tenant_id,
                    document_id,
                    DocumentStatus::Failed,
                    Some(&error.to_string()),
                )
                .await
            {
                warn!(error = %e, "could not mark document FAILED");
            }
        }
    }
}

/// Recoverable unless the error is a state or input problem.
fn classify_pipeline_error(e: anyhow::Error) -> TaskError {
    if e.downcast_ref::<StateError>().is_some()
        || e.downcast_ref::<crate::error::InputError>().is_some()
        || e.downcast_ref::<crate::error::ExportError>().is_some()
    {
        TaskError::Terminal(e)
    } else if let Some(llm) = e.downcast_ref::<crate::error::LlmError>() {
        if llm.is_retryable() {
            TaskError::Recoverable(e)
        } else {
            TaskError::Terminal(e)
        }
    } else {
        TaskError::Recoverable(e)
    }
}

/// Run one task under the retry policy. Recoverable failures back off and
/// retry up to the attempt cap; terminal failures poison immediately.
pub async fn run_with_retry(
    executor: &Executor,
    task: &Task,
    policy: &RetryPolicy,
) -> Result<TaskOutcome, TaskError> {
    let mut attempt = 1u32;
    loop {
        match executor.execute(task).await {
            Ok(outcome) => {
                info!(task = task.kind(), status = %outcome.status, attempt, "task complete");
                return Ok(outcome);
            }
            Err(TaskError::Recoverable(e)) if attempt < policy.max_attempts => {
                let delay = backoff_delay(policy, attempt);
                warn!(
                    task = task.kind(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "recoverable task failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                executor.poison(task, &e).await;
                return Err(e);
            }
        }
    }
}

/// Handle for enqueueing tasks into the worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    tx: mpsc::Sender<Task>,
}

impl WorkerPool {
    pub async fn enqueue(&self, task: Task) -> Result<()> {
        self.tx
            .send(task)
            .await
            .map_err(|_| anyhow::anyhow!("worker pool is shut down"))
    }
}

/// Spawn `worker_count` workers draining a shared queue.
pub fn spawn_workers(executor: Arc<Executor>, worker_count: usize) -> WorkerPool {
    let (tx, rx) = mpsc::channel::<Task>(1024);
    let rx = Arc::new(Mutex::new(rx));
    for worker_id in 0..worker_count.max(1) {
        let rx = rx.clone();
        let executor = executor.clone();
        tokio::spawn(async move {
            loop {
                let task = { rx.lock().await.recv().await };
                let Some(task) = task else {
                    break;
                };
                let policy = RetryPolicy::default();
                if let Err(e) = run_with_retry(&executor, &task, &policy).await {
                    error!(worker_id, task = task.kind(), error = %e, "task ended in failure");
                }
            }
        });
    }
    WorkerPool { tx }
}

/// Periodic ack polling loop.
pub fn spawn_ack_poll_loop(pool: WorkerPool, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            ticker.tick().await;
            if pool.enqueue(Task::PollAcks).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ScriptedEmbedder, ScriptedLlm};
    use crate::export::FsDropzone;
    use crate::objectstore::FsObjectStore;
    use crate::store::catalog::ProductRow;
    use std::collections::HashMap;

    fn executor(db: Db, dir: &std::path::Path) -> Executor {
        Executor {
            db,
            store: Arc::new(FsObjectStore::new(dir.join("objects"))),
            llm: Arc::new(ScriptedLlm::new()),
            embedder: Arc::new(ScriptedEmbedder::new(16)),
            transport: Arc::new(FsDropzone),
            config_pepper: "pepper".into(),
        }
    }

    async fn seed_product(db: &Db) -> String {
        db.insert_tenant("t1", "acme", "Acme").await.unwrap();
        let product = ProductRow {
            id: new_id(),
            tenant_id: "t1".into(),
            internal_sku: "INT-1".into(),
            name: "Kabel".into(),
            description: None,
            base_uom: "M".into(),
            uom_conversions: HashMap::new(),
            attributes: HashMap::new(),
            active: true,
        };
        db.insert_product(&product).await.unwrap();
        product.id
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
        };
        let d1 = backoff_delay(&policy, 1);
        let d2 = backoff_delay(&policy, 2);
        assert!(d1 >= Duration::from_secs(5));
        assert!(d1 <= Duration::from_millis(5000 + 1250));
        assert!(d2 >= Duration::from_secs(10));
        let d_big = backoff_delay(&policy, 20);
        assert!(d_big <= Duration::from_millis(600_000 + 150_000));
    }

    #[tokio::test]
    async fn embed_product_is_idempotent_by_text_hash() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_in_memory().unwrap();
        let product_id = seed_product(&db).await;
        let executor = executor(db.clone(), dir.path());

        let first = executor
            .execute(&Task::EmbedProduct {
                tenant_id: "t1".into(),
                product_id: product_id.clone(),
                force_recompute: false,
            })
            .await
            .unwrap();
        assert_eq!(first.status, "created");

        for _ in 0..3 {
            let again = executor
                .execute(&Task::EmbedProduct {
                    tenant_id: "t1".into(),
                    product_id: product_id.clone(),
                    force_recompute: false,
                })
                .await
                .unwrap();
            assert_eq!(again.status, "skipped");
        }

        let forced = executor
            .execute(&Task::EmbedProduct {
                tenant_id: "t1".into(),
                product_id,
                force_recompute: true,
            })
            .await
            .unwrap();
        assert_eq!(forced.status, "created");
    }

    #[tokio::test]
    async fn missing_product_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_in_memory().unwrap();
        db.insert_tenant("t1", "acme", "Acme").await.unwrap();
        let executor = executor(db, dir.path());
        let err = executor
            .execute(&Task::EmbedProduct {
                tenant_id: "t1".into(),
                product_id: "missing".into(),
                force_recompute: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Terminal(_)));
    }

    #[tokio::test]
    async fn rebuild_embeds_all_active_products() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_in_memory().unwrap();
        seed_product(&db).await;
        let executor = executor(db.clone(), dir.path());

        let outcome = executor
            .execute(&Task::RebuildEmbeddingsForTenant { tenant_id: "t1".into() })
            .await
            .unwrap();
        assert_eq!(outcome.detail["created"], 1);

        let again = executor
            .execute(&Task::RebuildEmbeddingsForTenant { tenant_id: "t1".into() })
            .await
            .unwrap();
        assert_eq!(again.detail["skipped"], 1);
    }
}
