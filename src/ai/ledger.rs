//! AI call ledger: immutable per-call records and hash-based deduplication.
//!
//! Ledger writes are independent commits so records survive any surrounding
//! transaction rollback. A successful record with the same input hash that is
//! at most seven days old serves repeat calls without a provider request.

use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::store::ops::AiCallRow;
use crate::store::{new_id, Db};

pub const DEDUP_WINDOW_DAYS: i64 = 7;

/// Call types recorded in the ledger.
pub const CALL_LLM_EXTRACT_TEXT: &str = "llm_extract_text";
pub const CALL_LLM_EXTRACT_VISION: &str = "llm_extract_vision";
pub const CALL_LLM_REPAIR: &str = "llm_repair";
pub const CALL_EMBED: &str = "embed";

/// Input hash over (tenant, call type, canonical input). The canonical input
/// is serialized with sorted keys so semantically equal inputs hash equally.
pub fn input_hash(tenant_id: &str, call_type: &str, canonical_input: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update(b":");
    hasher.update(call_type.as_bytes());
    hasher.update(b":");
    hasher.update(canonical_value(canonical_input).as_bytes());
    hex::encode(hasher.finalize())
}

fn canonical_value(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_value(&map[k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_value).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

#[derive(Clone)]
pub struct CallLedger {
    db: Db,
}

impl CallLedger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Reusable result for the input hash, if one exists within the window.
    pub async fn find_reusable(
        &self,
        tenant_id: &str,
        call_type: &str,
        hash: &str,
    ) -> Result<Option<AiCallRow>> {
        let since = Utc::now() - Duration::days(DEDUP_WINDOW_DAYS);
        self.db
            .find_recent_ai_call(tenant_id, call_type, hash, since)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_success(
        &self,
        tenant_id: &str,
        call_type: &str,
        hash: &str,
        provider: &str,
        model: &str,
        input_tokens: i64,
        output_tokens: i64,
        latency_ms: i64,
        cost_micros: i64,
        result: Option<&Value>,
        document_id: Option<&str>,
    ) -> Result<()> {
        self.db
            .insert_ai_call(&AiCallRow {
                id: new_id(),
                tenant_id: tenant_id.to_string(),
                call_type: call_type.to_string(),
                provider: provider.to_string(),
                model: model.to_string(),
                input_hash: hash.to_string(),
                input_tokens,
                output_tokens,
                latency_ms,
                cost_micros,
                status: "SUCCEEDED".to_string(),
                error_json: None,
                result_json: result.map(|v| v.to_string()),
                document_id: document_id.map(str::to_string),
                draft_id: None,
            })
            .await
    }

    pub async fn record_failure(
        &self,
        tenant_id: &str,
        call_type: &str,
        hash: &str,
        provider: &str,
        model: &str,
        error_code: &str,
        error_message: &str,
        document_id: Option<&str>,
    ) -> Result<()> {
        let error = serde_json::json!({ "code": error_code, "message": error_message });
        self.db
            .insert_ai_call(&AiCallRow {
                id: new_id(),
                tenant_id: tenant_id.to_string(),
                call_type: call_type.to_string(),
                provider: provider.to_string(),
                model: model.to_string(),
                input_hash: hash.to_string(),
                input_tokens: 0,
                output_tokens: 0,
                latency_ms: 0,
                cost_micros: 0,
                status: "FAILED".to_string(),
                error_json: Some(error.to_string()),
                result_json: None,
                document_id: document_id.map(str::to_string),
                draft_id: None,
            })
            .await
    }
}
