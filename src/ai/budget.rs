//! Daily budget gate for LLM spend.
//!
//! The gate sums the tenant's ledger since UTC midnight and blocks when the
//! sum has reached the configured daily budget. It is advisory, not a
//! distributed lock: a brief single-call overshoot is acceptable and the
//! ledger stays the source of truth.

use anyhow::Result;
use chrono::Utc;
use tracing::warn;

use crate::error::BudgetExceeded;
use crate::store::{Db, TenantSettings};

#[derive(Debug, Clone, Copy)]
pub struct BudgetStatus {
    pub allowed: bool,
    pub used_micros: i64,
    pub budget_micros: i64,
}

pub struct BudgetGate;

impl BudgetGate {
    /// Check the tenant's remaining budget for today. A budget of zero means
    /// unlimited.
    pub async fn check(db: &Db, tenant_id: &str, settings: &TenantSettings) -> Result<BudgetStatus> {
        let budget_micros = settings.daily_budget_micros;
        if budget_micros == 0 {
            return Ok(BudgetStatus {
                allowed: true,
                used_micros: 0,
                budget_micros: 0,
            });
        }

        let today_start = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight exists")
            .and_utc();
        let used_micros = db.sum_cost_since(tenant_id, today_start).await?;
        let allowed = used_micros < budget_micros;
        if !allowed {
            warn!(
                tenant_id,
                used_micros, budget_micros, "daily LLM budget exhausted, blocking call"
            );
        }
        Ok(BudgetStatus {
            allowed,
            used_micros,
            budget_micros,
        })
    }

    /// Like [`check`], but fails with `BudgetExceeded` when blocked.
    pub async fn enforce(db: &Db, tenant_id: &str, settings: &TenantSettings) -> Result<()> {
        let status = Self::check(db, tenant_id, settings).await?;
        if !status.allowed {
            return Err(BudgetExceeded {
                used_micros: status.used_micros,
                budget_micros: status.budget_micros,
            }
            .into());
        }
        Ok(())
    }
}
