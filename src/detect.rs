//! Multi-signal customer detection.
//!
//! Signals from the sender address and document content are aggregated per
//! candidate with a probabilistic OR; the top candidate is auto-selected only
//! when it clears the threshold with enough distance to the runner-up.

use anyhow::Result;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::extraction::CustomerHint;
use crate::matching::trigram;
use crate::store::Db;

pub const SCORE_EMAIL_EXACT: f64 = 0.95;
pub const SCORE_DOMAIN: f64 = 0.75;
pub const SCORE_CUSTOMER_NUMBER: f64 = 0.98;
pub const AGGREGATE_CAP: f64 = 0.999;
pub const NAME_SIMILARITY_THRESHOLD: f64 = 0.40;

/// Providers whose domain says nothing about the company.
const GENERIC_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "outlook.com",
    "hotmail.com",
    "yahoo.com",
    "web.de",
    "gmx.de",
    "gmx.net",
    "live.com",
    "icloud.com",
    "me.com",
    "aol.com",
];

lazy_static! {
    static ref CUSTOMER_NUMBER_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)Kundennr[.:]?\s*([A-Z0-9-]{3,20})").unwrap(),
        Regex::new(r"(?i)Kunden-Nr[.:]?\s*([A-Z0-9-]{3,20})").unwrap(),
        Regex::new(r"(?i)Customer\s+No[.:]?\s*([A-Z0-9-]{3,20})").unwrap(),
        Regex::new(r"(?i)Debitor[.:]?\s*([A-Z0-9-]{3,20})").unwrap(),
        Regex::new(r"(?i)Client\s+ID[.:]?\s*([A-Z0-9-]{3,20})").unwrap(),
    ];
    static ref DATE_LINE: Regex = Regex::new(r"^\d{1,2}[./-]\d{1,2}[./-]\d{2,4}").unwrap();
    static ref PHONE_LINE: Regex = Regex::new(r"^[+\d\s()\-]{7,}$").unwrap();
    static ref STARTS_WITH_DIGIT: Regex = Regex::new(r"^\d").unwrap();
}

const COMPANY_KEYWORDS: &[&str] = &[
    "GmbH", "Ltd", "Inc", "Corp", "AG", "KG", "OHG", "SE", "e.V.", "mbH",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionSignal {
    pub signal_type: String,
    pub value: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub customer_id: String,
    pub customer_name: String,
    pub signals: Vec<DetectionSignal>,
    pub aggregate_score: f64,
}

impl Candidate {
    fn add_signal(&mut self, signal: DetectionSignal) {
        // Probabilistic OR over independent signals.
        self.signals.push(signal);
        let miss: f64 = self.signals.iter().map(|s| 1.0 - s.score).product();
        self.aggregate_score = (1.0 - miss).min(AGGREGATE_CAP);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DetectionResult {
    pub candidates: Vec<Candidate>,
    pub selected_customer_id: Option<String>,
    pub confidence: f64,
    pub auto_selected: bool,
    pub ambiguous: bool,
    pub reason: Option<String>,
}

/// Sender domain, unless it is a generic provider.
pub fn company_domain(from_email: &str) -> Option<String> {
    let domain = from_email.rsplit('@').next()?.to_lowercase();
    if domain.is_empty() || !from_email.contains('@') {
        return None;
    }
    if GENERIC_DOMAINS.contains(&domain.as_str()) {
        return None;
    }
    Some(domain)
}

/// Customer-number pattern sweep over the first 2000 characters.
pub fn extract_customer_number(document_text: &str) -> Option<String> {
    let head: String = document_text.chars().take(2000).collect();
    for pattern in CUSTOMER_NUMBER_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(&head) {
            return Some(caps[1].trim().to_string());
        }
    }
    None
}

/// Heuristic company-name line from the document header: prefers lines with a
/// legal-form keyword, skips dates, phone numbers and addresses.
pub fn extract_company_name(document_text: &str) -> Option<String> {
    let head: String = document_text.chars().take(500).collect();
    let lines: Vec<&str> = head.lines().map(str::trim).collect();

    let plausible = |line: &&&str| -> bool {
        let line: &&str = *line;
        let len = line.chars().count();
        (10..=100).contains(&len)
            && !line.contains('@')
            && !DATE_LINE.is_match(line)
            && !PHONE_LINE.is_match(line)
    };

    lines
        .iter()
        .filter(plausible)
        .find(|line| COMPANY_KEYWORDS.iter().any(|kw| line.contains(kw)))
        .map(|line| line.to_string())
        .or_else(|| {
            lines
                .iter()
                .filter(plausible)
                .find(|line| !STARTS_WITH_DIGIT.is_match(line))
                .map(|line| line.to_string())
        })
}

/// Score for a fuzzy name hit: 0.40 + 0.60 × similarity, capped at 0.85.
pub fn fuzzy_name_score(similarity: f64) -> Option<f64> {
    if similarity < NAME_SIMILARITY_THRESHOLD {
        return None;
    }
    Some((0.40 + 0.60 * similarity).min(0.85))
}

pub struct CustomerDetector {
    db: Db,
    pub auto_select_threshold: f64,
    pub min_gap: f64,
}

impl CustomerDetector {
    pub fn new(db: Db, auto_select_threshold: f64, min_gap: f64) -> Self {
        Self {
            db,
            auto_select_threshold,
            min_gap,
        }
    }

    pub async fn detect(
        &self,
        tenant_id: &str,
        from_email: Option<&str>,
        document_text: Option<&str>,
        llm_hint: Option<&CustomerHint>,
    ) -> Result<DetectionResult> {
        let mut candidates: HashMap<String, Candidate> = HashMap::new();

        if let Some(email) = from_email {
            self.apply_email_signal(tenant_id, email, "from_email_exact", &mut candidates)
                .await?;
            if let Some(domain) = company_domain(email) {
                self.apply_domain_signal(tenant_id, &domain, &mut candidates)
                    .await?;
            }
        }

        if let Some(text) = document_text {
            if let Some(number) = extract_customer_number(text) {
                self.apply_customer_number_signal(
                    tenant_id,
                    &number,
                    "doc_customer_number",
                    &mut candidates,
                )
                .await?;
            }
            if let Some(name) = extract_company_name(text) {
                self.apply_fuzzy_name_signal(tenant_id, &name, &mut candidates)
                    .await?;
            }
        }

        if let Some(hint) = llm_hint {
            if let Some(number) = hint.erp_customer_number.as_deref() {
                self.apply_customer_number_signal(tenant_id, number, "llm_hint", &mut candidates)
                    .await?;
            }
            if let Some(email) = hint.email.as_deref() {
                self.apply_email_signal(tenant_id, email, "llm_hint", &mut candidates)
                    .await?;
            }
            if let Some(name) = hint.name.as_deref() {
                self.apply_fuzzy_name_signal(tenant_id, name, &mut candidates)
                    .await?;
            }
        }

        let mut ranked: Vec<Candidate> = candidates.into_values().collect();
        ranked.sort_by(|a, b| {
            b.aggregate_score
                .partial_cmp(&a.aggregate_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut result = DetectionResult {
            candidates: ranked.iter().take(5).cloned().collect(),
            ..Default::default()
        };

        let Some(top1) = ranked.first() else {
            result.ambiguous = true;
            result.reason = Some("no customer matches found".to_string());
            return Ok(result);
        };
        let top2_score = ranked.get(1).map(|c| c.aggregate_score).unwrap_or(0.0);
        let gap = top1.aggregate_score - top2_score;

        if top1.aggregate_score >= self.auto_select_threshold {
            if gap >= self.min_gap {
                info!(
                    tenant_id,
                    customer_id = %top1.customer_id,
                    score = top1.aggregate_score,
                    gap,
                    "customer auto-selected"
                );
                result.selected_customer_id = Some(top1.customer_id.clone());
                result.confidence = top1.aggregate_score;
                result.auto_selected = true;
                result.reason = Some(format!(
                    "auto-selected with score {:.3}",
                    top1.aggregate_score
                ));
            } else {
                result.ambiguous = true;
                result.reason = Some(format!(
                    "top score {:.3} meets threshold but gap {:.3} is below {:.3}",
                    top1.aggregate_score, gap, self.min_gap
                ));
            }
        } else {
            result.ambiguous = true;
            result.reason = Some(format!(
                "top score {:.3} below auto-select threshold {:.3}",
                top1.aggregate_score, self.auto_select_threshold
            ));
        }
        Ok(result)
    }

    async fn apply_email_signal(
        &self,
        tenant_id: &str,
        email: &str,
        signal_type: &str,
        candidates: &mut HashMap<String, Candidate>,
    ) -> Result<()> {
        let contacts = self.db.contacts_by_email(tenant_id, email).await?;
        debug!(tenant_id, email, hits = contacts.len(), "email signal");
        for contact in contacts {
            let Some(customer) = self.db.get_customer(tenant_id, &contact.customer_id).await? else {
                continue;
            };
            entry(candidates, &customer.id, &customer.name).add_signal(DetectionSignal {
                signal_type: signal_type.to_string(),
                value: email.to_lowercase(),
                score: SCORE_EMAIL_EXACT,
            });
        }
        Ok(())
    }

    async fn apply_domain_signal(
        &self,
        tenant_id: &str,
        domain: &str,
        candidates: &mut HashMap<String, Candidate>,
    ) -> Result<()> {
        let contacts = self.db.contacts_by_domain(tenant_id, domain).await?;
        debug!(tenant_id, domain, hits = contacts.len(), "domain signal");
        let mut seen_customers = std::collections::HashSet::new();
        for contact in contacts {
            if !seen_customers.insert(contact.customer_id.clone()) {
                continue;
            }
            let Some(customer) = self.db.get_customer(tenant_id, &contact.customer_id).await? else {
                continue;
            };
            entry(candidates, &customer.id, &customer.name).add_signal(DetectionSignal {
                signal_type: "from_domain".to_string(),
                value: domain.to_string(),
                score: SCORE_DOMAIN,
            });
        }
        Ok(())
    }

    async fn apply_customer_number_signal(
        &self,
        tenant_id: &str,
        number: &str,
        signal_type: &str,
        candidates: &mut HashMap<String, Candidate>,
    ) -> Result<()> {
        let Some(customer) = self.db.find_customer_by_erp_number(tenant_id, number).await? else {
            debug!(tenant_id, number, "customer number not found");
            return Ok(());
        };
        entry(candidates, &customer.id, &customer.name).add_signal(DetectionSignal {
            signal_type: signal_type.to_string(),
            value: number.to_string(),
            score: SCORE_CUSTOMER_NUMBER,
        });
        Ok(())
    }

    async fn apply_fuzzy_name_signal(
        &self,
        tenant_id: &str,
        extracted_name: &str,
        candidates: &mut HashMap<String, Candidate>,
    ) -> Result<()> {
        let customers = self.db.list_active_customers(tenant_id).await?;
        let mut scored: Vec<(f64, crate::store::catalog::CustomerRow)> = customers
            .into_iter()
            .filter_map(|customer| {
                let sim = trigram::similarity(extracted_name, &customer.name);
                (sim >= NAME_SIMILARITY_THRESHOLD).then_some((sim, customer))
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        for (sim, customer) in scored.into_iter().take(5) {
            if let Some(score) = fuzzy_name_score(sim) {
                entry(candidates, &customer.id, &customer.name).add_signal(DetectionSignal {
                    signal_type: "doc_company_name".to_string(),
                    value: extracted_name.to_string(),
                    score,
                });
            }
        }
        Ok(())
    }
}

fn entry<'a>(
    candidates: &'a mut HashMap<String, Candidate>,
    customer_id: &str,
    customer_name: &str,
) -> &'a mut Candidate {
    candidates
        .entry(customer_id.to_string())
        .or_insert_with(|| Candidate {
            customer_id: customer_id.to_string(),
            customer_name: customer_name.to_string(),
            signals: Vec::new(),
            aggregate_score: 0.0,
        })
}
