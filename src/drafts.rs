//! Draft order operations above raw storage: approval, soft delete, line
//! confirmation and the mapping learning loop.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::error::StateError;
use crate::models::{normalize_sku, DraftStatus, MappingStatus};
use crate::store::catalog::SkuMappingRow;
use crate::store::orders::DraftOrderRow;
use crate::store::{new_id, now_rfc3339, Db};
use crate::validation::ReadyCheck;

pub struct DraftService {
    db: Db,
}

impl DraftService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Approve a READY draft. The stored ready-check snapshot must be green;
    /// the version lock guards against concurrent edits.
    pub async fn approve(
        &self,
        tenant_id: &str,
        draft_id: &str,
        expected_version: i64,
        actor: &str,
    ) -> Result<DraftOrderRow> {
        let draft = self
            .db
            .get_draft(tenant_id, draft_id)
            .await?
            .ok_or(StateError::NotFound)?;

        let ready: Option<ReadyCheck> = draft
            .ready_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());
        match ready {
            Some(check) if check.is_ready => {}
            Some(check) => return Err(StateError::NotReady(check.blocking_reasons).into()),
            None => return Err(StateError::NotReady(vec!["NOT_VALIDATED".into()]).into()),
        }

        let approved_at = Utc::now().to_rfc3339();
        let actor = actor.to_string();
        let updated = self
            .db
            .update_draft(tenant_id, draft_id, expected_version, move |d| {
                d.status = DraftStatus::Approved;
                d.approved_by = Some(actor);
                d.approved_at = Some(approved_at);
            })
            .await?;
        info!(tenant_id, draft_id, version = updated.version, "draft approved");
        Ok(updated)
    }

    pub async fn soft_delete(
        &self,
        tenant_id: &str,
        draft_id: &str,
        expected_version: i64,
    ) -> Result<()> {
        self.db
            .update_draft(tenant_id, draft_id, expected_version, |d| {
                d.deleted_at = Some(now_rfc3339());
            })
            .await?;
        Ok(())
    }

    /// A user confirming a line's product teaches the mapping table: the
    /// (customer, normalized SKU) pair gains a CONFIRMED mapping, or support
    /// on the existing one. Every confirmation is a feedback event.
    pub async fn confirm_line_match(
        &self,
        tenant_id: &str,
        draft_id: &str,
        line_id: &str,
        internal_sku: &str,
        actor: &str,
    ) -> Result<()> {
        let draft = self
            .db
            .get_draft(tenant_id, draft_id)
            .await?
            .ok_or(StateError::NotFound)?;
        let lines = self.db.lines_for_draft(tenant_id, draft_id).await?;
        let line = lines
            .iter()
            .find(|l| l.id == line_id)
            .ok_or(StateError::NotFound)?;

        self.db
            .set_line_internal_sku(tenant_id, line_id, Some(internal_sku))
            .await?;

        if let (Some(customer_id), Some(sku_raw)) =
            (draft.customer_id.as_deref(), line.customer_sku_raw.as_deref())
        {
            let sku_norm = line
                .customer_sku_norm
                .clone()
                .unwrap_or_else(|| normalize_sku(sku_raw));
            match self
                .db
                .find_confirmed_mapping(tenant_id, customer_id, &sku_norm)
                .await?
            {
                Some(mapping) if mapping.internal_sku == internal_sku => {
                    self.db.bump_mapping_support(tenant_id, &mapping.id).await?;
                }
                Some(mapping) => {
                    // The user picked a different product: deprecate the old
                    // link and learn the new one.
                    self.db
                        .set_mapping_status(tenant_id, &mapping.id, MappingStatus::Deprecated)
                        .await?;
                    self.insert_confirmed(tenant_id, customer_id, &sku_norm, internal_sku)
                        .await?;
                }
                None => {
                    self.insert_confirmed(tenant_id, customer_id, &sku_norm, internal_sku)
                        .await?;
                }
            }

            self.db
                .insert_feedback(
                    tenant_id,
                    "mapping_confirmed",
                    Some(line_id),
                    Some(actor),
                    &json!({
                        "draft_id": draft_id,
                        "customer_id": customer_id,
                        "customer_sku_norm": sku_norm,
                        "internal_sku": internal_sku,
                    }),
                )
                .await?;
        }
        Ok(())
    }

    /// Rejecting a suggestion bumps the reject counter and clears the line.
    pub async fn reject_line_match(
        &self,
        tenant_id: &str,
        draft_id: &str,
        line_id: &str,
        actor: &str,
    ) -> Result<()> {
        let draft = self
            .db
            .get_draft(tenant_id, draft_id)
            .await?
            .ok_or(StateError::NotFound)?;
        let lines = self.db.lines_for_draft(tenant_id, draft_id).await?;
        let line = lines
            .iter()
            .find(|l| l.id == line_id)
            .ok_or(StateError::NotFound)?;

        if let (Some(customer_id), Some(sku_norm)) =
            (draft.customer_id.as_deref(), line.customer_sku_norm.as_deref())
        {
            if let Some(mapping) = self
                .db
                .find_confirmed_mapping(tenant_id, customer_id, sku_norm)
                .await?
            {
                self.db.bump_mapping_reject(tenant_id, &mapping.id).await?;
            }
        }

        self.db.set_line_internal_sku(tenant_id, line_id, None).await?;
        self.db
            .insert_feedback(
                tenant_id,
                "mapping_rejected",
                Some(line_id),
                Some(actor),
                &json!({ "draft_id": draft_id }),
            )
            .await?;
        Ok(())
    }

    async fn insert_confirmed(
        &self,
        tenant_id: &str,
        customer_id: &str,
        sku_norm: &str,
        internal_sku: &str,
    ) -> Result<()> {
        self.db
            .insert_mapping(&SkuMappingRow {
                id: new_id(),
                tenant_id: tenant_id.to_string(),
                customer_id: customer_id.to_string(),
                customer_sku_norm: sku_norm.to_string(),
                internal_sku: internal_sku.to_string(),
                status: MappingStatus::Confirmed,
                support_count: 1,
                reject_count: 0,
                uom_factor: None,
                last_used_at: None,
            })
            .await
    }
}
