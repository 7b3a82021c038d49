//! Token-budget engine.
//!
//! Budgets are checked and debited along a scope chain from broadest to
//! narrowest (global, then project, then runner). Every mutating path takes
//! the (scope, scope_id) advisory lock first, so concurrent admissions and
//! heartbeat debits serialize per scope. A scope with no budget rows is
//! unlimited, and an exceeded budget is a typed rejection, not an error.

use chrono::{DateTime, Utc};
use event_schema::{entity, routing, AlertSeverity, EventEnvelope};
use sqlx::{Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{self, budget_repo, event_repo, Db};
use crate::error::Result;
use crate::model::{BudgetScope, Granularity, TokenBudget};

pub mod period;

/// Warning thresholds, in percent of a scope's limit.
const WARN_THRESHOLDS: [i64; 2] = [75, 90];

/// Scopes a token request is charged against, broadest first.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeChain {
    pub project_id: Option<Uuid>,
    pub runner_id: Option<Uuid>,
}

impl ScopeChain {
    pub fn for_project(project_id: Uuid) -> Self {
        Self {
            project_id: Some(project_id),
            runner_id: None,
        }
    }

    pub fn for_runner(project_id: Uuid, runner_id: Uuid) -> Self {
        Self {
            project_id: Some(project_id),
            runner_id: Some(runner_id),
        }
    }

    /// (scope, scope_id) pairs in check order.
    pub fn scopes(&self) -> Vec<(BudgetScope, String)> {
        let mut scopes = vec![(BudgetScope::Global, String::new())];
        if let Some(project_id) = self.project_id {
            scopes.push((BudgetScope::Project, project_id.to_string()));
        }
        if let Some(runner_id) = self.runner_id {
            scopes.push((BudgetScope::Runner, runner_id.to_string()));
        }
        scopes
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetDecision {
    Ok,
    Exceeded {
        scope: BudgetScope,
        used: i64,
        limit: i64,
    },
}

/// A threshold crossing detected while recording consumption.
#[derive(Debug, Clone)]
pub struct BudgetWarning {
    pub scope: BudgetScope,
    pub scope_id: String,
    pub granularity: Granularity,
    pub percent: i64,
    pub used: i64,
    pub limit: i64,
}

pub struct BudgetEngine {
    db: Db,
}

impl BudgetEngine {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Verify `used + estimated <= limit` for every budget along the chain,
    /// inside the caller's transaction. Rolls expired windows forward first
    /// so a stale window can't block (or wrongly admit) a launch.
    pub async fn check_and_reserve(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        chain: &ScopeChain,
        estimated: i64,
    ) -> Result<BudgetDecision> {
        let now = Utc::now();
        for (scope, scope_id) in chain.scopes() {
            self.lock_and_roll(tx, scope, &scope_id, now).await?;

            for budget in budget_repo::current_for_scope(tx, scope, &scope_id, now).await? {
                if budget.tokens_used + estimated > budget.token_limit {
                    debug!(
                        scope = scope.as_str(),
                        scope_id = %scope_id,
                        used = budget.tokens_used,
                        limit = budget.token_limit,
                        estimated,
                        "budget admission rejected"
                    );
                    return Ok(BudgetDecision::Exceeded {
                        scope,
                        used: budget.tokens_used,
                        limit: budget.token_limit,
                    });
                }
            }
        }
        Ok(BudgetDecision::Ok)
    }

    /// Debit actual consumption across the chain in one transaction and emit
    /// warning events for any thresholds crossed.
    pub async fn record(&self, chain: &ScopeChain, actual: i64) -> Result<Vec<BudgetWarning>> {
        if actual <= 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        let mut warnings = Vec::new();

        for (scope, scope_id) in chain.scopes() {
            self.lock_and_roll(&mut tx, scope, &scope_id, now).await?;

            for budget in budget_repo::current_for_scope(&mut tx, scope, &scope_id, now).await? {
                let before = budget.tokens_used;
                let after = budget_repo::add_used(&mut tx, budget.id, actual).await?;

                for percent in WARN_THRESHOLDS {
                    if period::crossed_threshold(before, after, budget.token_limit, percent) {
                        warnings.push(BudgetWarning {
                            scope,
                            scope_id: scope_id.clone(),
                            granularity: budget.granularity,
                            percent,
                            used: after,
                            limit: budget.token_limit,
                        });
                    }
                }
            }
        }

        for warning in &warnings {
            self.append_warning_events(&mut tx, warning).await?;
        }

        tx.commit().await?;
        Ok(warnings)
    }

    /// Close expired windows and open successors with `used = 0` for every
    /// budget key in the store. Idempotent: the unique constraint makes a
    /// concurrent roller's insert a no-op, and closed rows are never touched.
    pub async fn roll_period(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut tx = self.db.begin().await?;
        let mut rolled = 0usize;

        for budget in budget_repo::latest_all(&mut tx).await? {
            db::advisory_lock(
                &mut tx,
                "budget",
                &scope_key(budget.scope, &budget.scope_id),
            )
            .await?;
            if budget.period_end <= now {
                self.open_successor(&mut tx, &budget, now).await?;
                rolled += 1;
            }
        }

        tx.commit().await?;

        if rolled > 0 {
            info!(rolled, "budget periods rolled forward");
        }
        Ok(rolled)
    }

    /// Current consumption per scope for status queries.
    pub async fn status(
        &self,
        scope: Option<BudgetScope>,
        scope_id: Option<&str>,
    ) -> Result<Vec<TokenBudget>> {
        budget_repo::status(self.db.pool(), scope, scope_id, Utc::now()).await
    }

    /// Define (or re-window) a budget at a scope. Used by the operator API.
    pub async fn define(
        &self,
        scope: BudgetScope,
        scope_id: &str,
        granularity: Granularity,
        token_limit: i64,
    ) -> Result<()> {
        let now = Utc::now();
        let (start, end) = period::window(granularity, now);

        let mut tx = self.db.begin().await?;
        db::advisory_lock(&mut tx, "budget", &scope_key(scope, scope_id)).await?;
        budget_repo::insert_window(&mut tx, scope, scope_id, granularity, token_limit, 0, start, end)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Take the scope's advisory lock, then open successors for any of its
    /// expired windows so subsequent reads in this transaction see current
    /// rows only.
    async fn lock_and_roll(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        scope: BudgetScope,
        scope_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        db::advisory_lock(tx, "budget", &scope_key(scope, scope_id)).await?;

        for budget in budget_repo::latest_for_scope(tx, scope, scope_id).await? {
            if budget.period_end <= now {
                self.open_successor(tx, &budget, now).await?;
            }
        }
        Ok(())
    }

    async fn open_successor(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        expired: &TokenBudget,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (start, end) = period::window(expired.granularity, now);
        budget_repo::insert_window(
            tx,
            expired.scope,
            &expired.scope_id,
            expired.granularity,
            expired.token_limit,
            0,
            start,
            end,
        )
        .await?;

        debug!(
            scope = expired.scope.as_str(),
            scope_id = %expired.scope_id,
            granularity = ?expired.granularity,
            period_start = %start,
            period_end = %end,
            "opened successor budget window"
        );
        Ok(())
    }

    async fn append_warning_events(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        warning: &BudgetWarning,
    ) -> Result<()> {
        let scope_label = if warning.scope_id.is_empty() {
            warning.scope.as_str().to_string()
        } else {
            format!("{}:{}", warning.scope.as_str(), warning.scope_id)
        };

        let alert = EventEnvelope::new(
            "budget.threshold",
            entity::BUDGET,
            scope_label.clone(),
            serde_json::json!({
                "scope": warning.scope.as_str(),
                "scope_id": warning.scope_id,
                "granularity": warning.granularity,
                "percent": warning.percent,
                "used": warning.used,
                "limit": warning.limit,
            }),
        );
        event_repo::append(tx, &alert, &routing::system_alert(AlertSeverity::Warning)).await?;

        let usage = EventEnvelope::new(
            "tokens.consumed",
            entity::BUDGET,
            scope_label.clone(),
            serde_json::json!({
                "used": warning.used,
                "limit": warning.limit,
            }),
        );
        event_repo::append(tx, &usage, &routing::metrics_tokens(&scope_label)).await?;

        Ok(())
    }
}

fn scope_key(scope: BudgetScope, scope_id: &str) -> String {
    format!("{}:{}", scope.as_str(), scope_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_orders_broadest_first() {
        let project = Uuid::new_v4();
        let runner = Uuid::new_v4();

        let scopes = ScopeChain::for_runner(project, runner).scopes();
        assert_eq!(scopes.len(), 3);
        assert_eq!(scopes[0].0, BudgetScope::Global);
        assert_eq!(scopes[0].1, "");
        assert_eq!(scopes[1].0, BudgetScope::Project);
        assert_eq!(scopes[1].1, project.to_string());
        assert_eq!(scopes[2].0, BudgetScope::Runner);
        assert_eq!(scopes[2].1, runner.to_string());
    }

    #[test]
    fn project_chain_has_no_runner_scope() {
        let scopes = ScopeChain::for_project(Uuid::new_v4()).scopes();
        assert_eq!(scopes.len(), 2);
        assert!(scopes.iter().all(|(s, _)| *s != BudgetScope::Runner));
    }
}
