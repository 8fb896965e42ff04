//! Hybrid matching engine: confirmed mappings, trigram search, vector search
//! and combined scoring with UoM and price penalties.

pub mod embed;
pub mod scorer;
pub mod trigram;

use anyhow::Result;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::ai::cost::calculate_cost_micros;
use crate::ai::ledger::{input_hash, CallLedger, CALL_EMBED};
use crate::ai::EmbeddingPort;
use crate::models::MatchStatus;
use crate::store::catalog::{CustomerPriceRow, ProductRow};
use crate::store::Db;
use scorer::{hybrid_confidence, price_penalty, uom_penalty, MatchFeatures};

const SEARCH_TOP_K: usize = 30;
const TRIGRAM_THRESHOLD: f64 = 0.3;
const CANDIDATES_RETURNED: usize = 5;
pub const CONFIRMED_MAPPING_CONFIDENCE: f64 = 0.99;

pub const METHOD_EXACT_MAPPING: &str = "exact_mapping";
pub const METHOD_HYBRID: &str = "hybrid";

#[derive(Debug, Clone, Default)]
pub struct MatchInput {
    pub tenant_id: String,
    pub customer_id: Option<String>,
    pub customer_sku_raw: Option<String>,
    pub customer_sku_norm: Option<String>,
    pub description: Option<String>,
    pub uom: Option<String>,
    pub qty: Option<f64>,
    pub unit_price_micros: Option<i64>,
    pub currency: Option<String>,
    pub order_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub internal_sku: String,
    pub product_id: String,
    pub product_name: String,
    pub confidence: f64,
    pub method: String,
    pub features: MatchFeatures,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub status: MatchStatus,
    pub internal_sku: Option<String>,
    pub confidence: f64,
    pub method: Option<String>,
    pub candidates: Vec<MatchCandidate>,
}

impl MatchOutcome {
    fn unmatched(candidates: Vec<MatchCandidate>) -> Self {
        let confidence = candidates.first().map(|c| c.confidence).unwrap_or(0.0);
        Self {
            status: MatchStatus::Unmatched,
            internal_sku: None,
            confidence,
            method: None,
            candidates,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub embedding_model: String,
    pub auto_apply_threshold: f64,
    pub auto_apply_gap: f64,
    pub price_tolerance_percent: f64,
}

pub struct Matcher {
    db: Db,
    ledger: CallLedger,
    embedder: Option<Arc<dyn EmbeddingPort>>,
    config: MatcherConfig,
}

impl Matcher {
    pub fn new(db: Db, embedder: Option<Arc<dyn EmbeddingPort>>, config: MatcherConfig) -> Self {
        let ledger = CallLedger::new(db.clone());
        Self {
            db,
            ledger,
            embedder,
            config,
        }
    }

    /// Match one line. Never fails the draft: callers treat an `Err` as an
    /// unmatched line with a recorded failure.
    pub async fn match_line(&self, input: &MatchInput) -> Result<MatchOutcome> {
        // Step 1: confirmed mapping short-circuits everything else.
        if let (Some(customer_id), Some(sku_norm)) =
            (input.customer_id.as_deref(), input.customer_sku_norm.as_deref())
        {
            if !sku_norm.is_empty() {
                if let Some(mapping) = self
                    .db
                    .find_confirmed_mapping(&input.tenant_id, customer_id, sku_norm)
                    .await?
                {
                    if let Some(product) = self
                        .db
                        .get_product_by_sku(&input.tenant_id, &mapping.internal_sku)
                        .await?
                    {
                        if product.active {
                            self.db
                                .touch_mapping_used(&input.tenant_id, &mapping.id)
                                .await?;
                            let candidate = MatchCandidate {
                                internal_sku: product.internal_sku.clone(),
                                product_id: product.id.clone(),
                                product_name: product.name.clone(),
                                confidence: CONFIRMED_MAPPING_CONFIDENCE,
                                method: METHOD_EXACT_MAPPING.to_string(),
                                features: MatchFeatures {
                                    s_map: 1.0,
                                    p_uom: 1.0,
                                    p_price: 1.0,
                                    s_hybrid_raw: CONFIRMED_MAPPING_CONFIDENCE,
                                    ..Default::default()
                                },
                            };
                            return Ok(MatchOutcome {
                                status: MatchStatus::Matched,
                                internal_sku: Some(product.internal_sku),
                                confidence: CONFIRMED_MAPPING_CONFIDENCE,
                                method: Some(METHOD_EXACT_MAPPING.to_string()),
                                candidates: vec![candidate],
                            });
                        }
                        debug!(
                            mapping_id = %mapping.id,
                            "confirmed mapping points at inactive product, falling through"
                        );
                    }
                }
            }
        }

        let products = self.db.list_active_products(&input.tenant_id).await?;
        if products.is_empty() {
            return Ok(MatchOutcome::unmatched(Vec::new()));
        }

        // Step 2: lexical candidates by SKU and by name/description.
        let mut candidate_ids: HashMap<String, &ProductRow> = HashMap::new();
        let sku_norm = input.customer_sku_norm.as_deref().unwrap_or("");
        if !sku_norm.is_empty() {
            for product in top_by(&products, SEARCH_TOP_K, |p| {
                trigram::similarity(sku_norm, &p.internal_sku)
            }) {
                candidate_ids.insert(product.id.clone(), product);
            }
        }
        if let Some(description) = input.description.as_deref() {
            for product in top_by(&products, SEARCH_TOP_K, |p| {
                trigram::similarity(description, &product_text(p))
            }) {
                candidate_ids.insert(product.id.clone(), product);
            }
        }

        // Step 3: vector candidates, when embeddings exist for the model.
        let cosine_by_product = self.vector_candidates(input).await?;
        if !cosine_by_product.is_empty() {
            let by_id: HashMap<&str, &ProductRow> =
                products.iter().map(|p| (p.id.as_str(), p)).collect();
            let mut ranked: Vec<(&String, &f64)> = cosine_by_product.iter().collect();
            ranked.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
            for (product_id, _) in ranked.into_iter().take(SEARCH_TOP_K) {
                if let Some(product) = by_id.get(product_id.as_str()).copied() {
                    candidate_ids.insert(product.id.clone(), product);
                }
            }
        }

        if candidate_ids.is_empty() {
            return Ok(MatchOutcome::unmatched(Vec::new()));
        }

        // Step 4: score.
        let prices: Vec<CustomerPriceRow> = match input.customer_id.as_deref() {
            Some(customer_id) => self.db.customer_prices(&input.tenant_id, customer_id).await?,
            None => Vec::new(),
        };

        let mut scored: Vec<MatchCandidate> = Vec::with_capacity(candidate_ids.len());
        for product in candidate_ids.values().copied() {
            let s_tri_sku = if sku_norm.is_empty() {
                0.0
            } else {
                trigram::similarity(sku_norm, &product.internal_sku)
            };
            let s_tri_desc = input
                .description
                .as_deref()
                .map(|d| trigram::similarity(d, &product_text(product)))
                .unwrap_or(0.0);
            let s_emb = cosine_by_product
                .get(&product.id)
                .map(|cos| scorer::embedding_score(*cos))
                .unwrap_or(0.0);

            let p_uom = uom_penalty(product, input.uom.as_deref());
            let p_price = price_penalty(
                &prices,
                &product.internal_sku,
                input.currency.as_deref(),
                input.uom.as_deref(),
                input.qty,
                input.unit_price_micros,
                input.order_date,
                self.config.price_tolerance_percent,
            );

            let (confidence, features) =
                hybrid_confidence(s_tri_sku, s_tri_desc, s_emb, 0.0, p_uom, p_price);
            if features.s_tri < TRIGRAM_THRESHOLD && s_emb == 0.0 {
                continue;
            }
            scored.push(MatchCandidate {
                internal_sku: product.internal_sku.clone(),
                product_id: product.id.clone(),
                product_name: product.name.clone(),
                confidence,
                method: METHOD_HYBRID.to_string(),
                features,
            });
        }

        scored.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(SEARCH_TOP_K);

        // Step 5: auto-apply.
        let top1_confidence = scored.first().map(|c| c.confidence).unwrap_or(0.0);
        let top2_confidence = scored.get(1).map(|c| c.confidence).unwrap_or(0.0);
        if top1_confidence >= self.config.auto_apply_threshold
            && top1_confidence - top2_confidence >= self.config.auto_apply_gap
        {
            let top = scored[0].clone();
            let mut candidates = scored;
            candidates.truncate(CANDIDATES_RETURNED);
            return Ok(MatchOutcome {
                status: MatchStatus::Suggested,
                internal_sku: Some(top.internal_sku.clone()),
                confidence: top.confidence,
                method: Some(METHOD_HYBRID.to_string()),
                candidates,
            });
        }

        let mut candidates = scored;
        candidates.truncate(CANDIDATES_RETURNED);
        Ok(MatchOutcome::unmatched(candidates))
    }

    /// Cosine similarity per product id via the embedding port, empty when no
    /// embedder is wired or the tenant has no embeddings for the model.
    async fn vector_candidates(&self, input: &MatchInput) -> Result<HashMap<String, f64>> {
        let Some(embedder) = self.embedder.as_ref() else {
            return Ok(HashMap::new());
        };
        let stored = self
            .db
            .embeddings_for_model(&input.tenant_id, &self.config.embedding_model)
            .await?;
        if stored.is_empty() {
            return Ok(HashMap::new());
        }

        let query_text = embed::query_embedding_text(
            input.customer_sku_raw.as_deref(),
            input.description.as_deref(),
            input.uom.as_deref(),
        );
        let hash = input_hash(
            &input.tenant_id,
            CALL_EMBED,
            &json!({ "model": self.config.embedding_model, "text": query_text }),
        );

        let query_vector: Vec<f32> = match self
            .ledger
            .find_reusable(&input.tenant_id, CALL_EMBED, &hash)
            .await?
            .and_then(|row| row.result_json)
            .and_then(|raw| serde_json::from_str::<Vec<f32>>(&raw).ok())
        {
            Some(vector) => vector,
            None => {
                let response = match embedder
                    .embed_text(&self.config.embedding_model, &query_text)
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "query embedding failed, continuing without vector search");
                        return Ok(HashMap::new());
                    }
                };
                let cost = calculate_cost_micros(
                    &response.provider,
                    &response.model,
                    response.input_tokens,
                    0,
                );
                self.ledger
                    .record_success(
                        &input.tenant_id,
                        CALL_EMBED,
                        &hash,
                        &response.provider,
                        &response.model,
                        response.input_tokens,
                        0,
                        response.latency_ms,
                        cost,
                        Some(&serde_json::to_value(&response.vector)?),
                        None,
                    )
                    .await?;
                response.vector
            }
        };

        let mut out = HashMap::new();
        for (product_id, vector) in stored {
            out.insert(product_id, embed::cosine(&query_vector, &vector));
        }
        Ok(out)
    }
}

fn product_text(product: &ProductRow) -> String {
    match product.description.as_deref() {
        Some(desc) => format!("{} {}", product.name, desc),
        None => product.name.clone(),
    }
}

fn top_by<'a, F>(products: &'a [ProductRow], k: usize, score: F) -> Vec<&'a ProductRow>
where
    F: Fn(&ProductRow) -> f64,
{
    let mut scored: Vec<(f64, &ProductRow)> = products
        .iter()
        .map(|p| (score(p), p))
        .filter(|(s, _)| *s > TRIGRAM_THRESHOLD)
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(k).map(|(_, p)| p).collect()
}
