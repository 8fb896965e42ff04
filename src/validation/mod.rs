//! Validation engine: runs the rule set, reconciles persisted issues and
//! computes the ready-check.
//!
//! Rules fail open: a rule that errors contributes a single WARNING issue
//! naming the rule and the pipeline continues.

pub mod rules;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::models::{IssueSeverity, IssueStatus};
use crate::store::orders::ValidationIssueRow;
use crate::store::{new_id, Db};
use rules::{issue_types, IssueDraft, ValidationContext, RULES};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyCheck {
    pub is_ready: bool,
    pub blocking_reasons: Vec<String>,
    pub checked_at: String,
}

pub struct ValidationEngine {
    db: Db,
}

#[derive(Debug)]
pub struct ValidationRun {
    pub issues: Vec<ValidationIssueRow>,
    pub ready: ReadyCheck,
}

impl ValidationEngine {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Run all rules for a draft, reconcile the issue table and return the
    /// ready-check. OPEN issues are replaced wholesale; ACKNOWLEDGED issues
    /// whose condition cleared flip to RESOLVED with no actor.
    pub async fn run(&self, tenant_id: &str, draft_id: &str) -> Result<ValidationRun> {
        let draft = self
            .db
            .get_draft(tenant_id, draft_id)
            .await?
            .ok_or(crate::error::StateError::NotFound)?;
        let lines = self.db.lines_for_draft(tenant_id, draft_id).await?;

        let ctx = ValidationContext {
            settings: self.db.tenant_settings(tenant_id).await?,
            products_by_sku: self.db.products_by_sku(tenant_id).await?,
            customer_prices: match draft.customer_id.as_deref() {
                Some(customer_id) => self.db.customer_prices(tenant_id, customer_id).await?,
                None => Vec::new(),
            },
        };

        let mut produced: Vec<IssueDraft> = Vec::new();
        for (rule_name, rule) in RULES {
            match rule(&draft, &lines, &ctx) {
                Ok(mut issues) => produced.append(&mut issues),
                Err(e) => {
                    error!(rule = rule_name, error = %e, "validation rule failed, continuing");
                    produced.push(IssueDraft {
                        issue_type: issue_types::RULE_FAILED.to_string(),
                        severity: IssueSeverity::Warning,
                        line_id: None,
                        line_no: None,
                        message: format!("validation rule '{rule_name}' failed to execute"),
                        details: json!({ "rule": rule_name, "error": e.to_string() }),
                    });
                }
            }
        }

        // Reconcile: drop all OPEN issues, keep manually-touched ones, then
        // re-insert the current findings that are not already represented.
        self.db.delete_open_issues(tenant_id, draft_id).await?;
        let existing = self.db.issues_for_draft(tenant_id, draft_id).await?;

        let produced_keys: std::collections::HashSet<(String, Option<i64>)> = produced
            .iter()
            .map(|i| (i.issue_type.clone(), i.line_no))
            .collect();

        for issue in &existing {
            let still_present =
                produced_keys.contains(&(issue.issue_type.clone(), issue.line_no));
            if matches!(issue.status, IssueStatus::Acknowledged) && !still_present {
                self.db
                    .set_issue_status(tenant_id, &issue.id, IssueStatus::Resolved, None)
                    .await?;
            }
        }

        let acknowledged_keys: std::collections::HashSet<(String, Option<i64>)> = existing
            .iter()
            .filter(|i| matches!(i.status, IssueStatus::Acknowledged))
            .map(|i| (i.issue_type.clone(), i.line_no))
            .collect();

        for issue in &produced {
            if acknowledged_keys.contains(&(issue.issue_type.clone(), issue.line_no)) {
                continue;
            }
            self.db
                .insert_issue(&ValidationIssueRow {
                    id: new_id(),
                    tenant_id: tenant_id.to_string(),
                    draft_id: draft_id.to_string(),
                    line_id: issue.line_id.clone(),
                    line_no: issue.line_no,
                    issue_type: issue.issue_type.clone(),
                    severity: issue.severity,
                    status: IssueStatus::Open,
                    message: issue.message.clone(),
                    details_json: issue.details.to_string(),
                })
                .await?;
        }

        let all = self.db.issues_for_draft(tenant_id, draft_id).await?;
        let ready = ready_check(&all);
        info!(
            tenant_id,
            draft_id,
            issues = all.len(),
            is_ready = ready.is_ready,
            "validation run complete"
        );

        // Snapshot the ready-check on the draft.
        let current = self
            .db
            .get_draft(tenant_id, draft_id)
            .await?
            .ok_or(crate::error::StateError::NotFound)?;
        let ready_json = serde_json::to_string(&ready)?;
        self.db
            .update_draft(tenant_id, draft_id, current.version, |d| {
                d.ready_json = Some(ready_json);
            })
            .await?;

        Ok(ValidationRun { issues: all, ready })
    }
}

/// `is_ready` iff no unresolved ERROR issues exist. Acknowledging an issue
/// annotates it but does not clear the gate; only RESOLVED and OVERRIDDEN
/// do. Blocking reasons are the distinct offending types, sorted for
/// stability.
pub fn ready_check(issues: &[ValidationIssueRow]) -> ReadyCheck {
    let mut blocking: Vec<String> = issues
        .iter()
        .filter(|i| {
            i.severity == IssueSeverity::Error
                && matches!(i.status, IssueStatus::Open | IssueStatus::Acknowledged)
        })
        .map(|i| i.issue_type.clone())
        .collect();
    blocking.sort();
    blocking.dedup();
    ReadyCheck {
        is_ready: blocking.is_empty(),
        blocking_reasons: blocking,
        checked_at: Utc::now().to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DraftStatus;
    use crate::store::catalog::ProductRow;
    use crate::store::orders::{DraftLineRow, DraftOrderRow};
    use std::collections::HashMap;

    async fn seed_draft(db: &Db, internal_sku: Option<&str>) -> (String, String) {
        db.insert_tenant("t1", "acme", "Acme").await.unwrap();
        let customer_id = db.insert_customer("t1", "Acme GmbH", None).await.unwrap();
        db.insert_product(&ProductRow {
            id: new_id(),
            tenant_id: "t1".into(),
            internal_sku: "INT-1".into(),
            name: "Kabel".into(),
            description: None,
            base_uom: "M".into(),
            uom_conversions: HashMap::new(),
            attributes: HashMap::new(),
            active: true,
        })
        .await
        .unwrap();

        let draft_id = new_id();
        let line_id = new_id();
        let draft = DraftOrderRow {
            id: draft_id.clone(),
            tenant_id: "t1".into(),
            customer_id: Some(customer_id),
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
        };
        let line = DraftLineRow {
            id: line_id.clone(),
            tenant_id: "t1".into(),
            draft_id: draft_id.clone(),
            line_no: 1,
            customer_sku_raw: Some("ABC-123".into()),
            customer_sku_norm: Some("ABC123".into()),
            internal_sku: internal_sku.map(str::to_string),
            description: Some("Kabel".into()),
            qty: Some(10.0),
            uom: Some("M".into()),
            unit_price_micros: Some(1_230_000),
            currency: Some("EUR".into()),
            requested_delivery_date: None,
            match_method: None,
            match_confidence: None,
            candidates_json: "[]".into(),
        };
        db.insert_draft(&draft, &[line]).await.unwrap();
        (draft_id, line_id)
    }

    #[tokio::test]
    async fn missing_sku_blocks_then_autoresolves() {
        let db = Db::open_in_memory().unwrap();
        let (draft_id, line_id) = seed_draft(&db, None).await;
        let engine = ValidationEngine::new(db.clone());

        let run = engine.run("t1", &draft_id).await.unwrap();
        assert!(!run.ready.is_ready);
        assert_eq!(run.ready.blocking_reasons, vec!["MISSING_SKU".to_string()]);

        db.set_line_internal_sku("t1", &line_id, Some("INT-1"))
            .await
            .unwrap();
        let run = engine.run("t1", &draft_id).await.unwrap();
        assert!(run.ready.is_ready);
        assert!(run.ready.blocking_reasons.is_empty());
    }

    #[tokio::test]
    async fn ready_check_is_stable_across_reruns() {
        let db = Db::open_in_memory().unwrap();
        let (draft_id, _) = seed_draft(&db, Some("INT-1")).await;
        let engine = ValidationEngine::new(db);

        let first = engine.run("t1", &draft_id).await.unwrap();
        let second = engine.run("t1", &draft_id).await.unwrap();
        assert_eq!(first.ready.is_ready, second.ready.is_ready);
        assert_eq!(first.ready.blocking_reasons, second.ready.blocking_reasons);
    }

    #[tokio::test]
    async fn acknowledged_issue_resolves_when_condition_clears() {
        let db = Db::open_in_memory().unwrap();
        let (draft_id, line_id) = seed_draft(&db, None).await;
        let engine = ValidationEngine::new(db.clone());

        let run = engine.run("t1", &draft_id).await.unwrap();
        let issue = run
            .issues
            .iter()
            .find(|i| i.issue_type == "MISSING_SKU")
            .unwrap();
        db.set_issue_status("t1", &issue.id, IssueStatus::Acknowledged, Some("user@acme"))
            .await
            .unwrap();

        // Acknowledged does not clear the ready-gate.
        let issues = db.issues_for_draft("t1", &draft_id).await.unwrap();
        assert!(!ready_check(&issues).is_ready);
        // Re-run keeps the acknowledged issue, no duplicate OPEN copy.
        let run = engine.run("t1", &draft_id).await.unwrap();
        let missing: Vec<_> = run
            .issues
            .iter()
            .filter(|i| i.issue_type == "MISSING_SKU")
            .collect();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].status, IssueStatus::Acknowledged);

        db.set_line_internal_sku("t1", &line_id, Some("INT-1"))
            .await
            .unwrap();
        let run = engine.run("t1", &draft_id).await.unwrap();
        let resolved = run
            .issues
            .iter()
            .find(|i| i.issue_type == "MISSING_SKU")
            .unwrap();
        assert_eq!(resolved.status, IssueStatus::Resolved);
        assert!(run.ready.is_ready);
    }

    #[tokio::test]
    async fn ready_snapshot_is_stored_on_draft() {
        let db = Db::open_in_memory().unwrap();
        let (draft_id, _) = seed_draft(&db, Some("INT-1")).await;
        let engine = ValidationEngine::new(db.clone());
        engine.run("t1", &draft_id).await.unwrap();
        let draft = db.get_draft("t1", &draft_id).await.unwrap().unwrap();
        let snapshot: ReadyCheck = serde_json::from_str(draft.ready_json.as_deref().unwrap()).unwrap();
        assert!(snapshot.is_ready);
    }
}
