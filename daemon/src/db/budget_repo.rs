//! Token-budget rows.
//!
//! Exactly one row per (scope, scope_id, granularity) covers the current
//! instant; rollover inserts the successor window and never touches closed
//! rows. All mutating access happens under the (scope, scope_id) advisory
//! lock taken by the budget engine.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{BudgetScope, Granularity, TokenBudget};

const BUDGET_COLUMNS: &str = r#"
    id, scope, scope_id, granularity, token_limit, tokens_used,
    period_start, period_end, created_at
"#;

/// Budget rows of every granularity whose window contains `now` for one
/// scope, locked for the duration of the transaction.
pub async fn current_for_scope(
    tx: &mut Transaction<'_, Postgres>,
    scope: BudgetScope,
    scope_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<TokenBudget>> {
    Ok(sqlx::query_as::<_, TokenBudget>(&format!(
        r#"
        SELECT {BUDGET_COLUMNS}
        FROM token_budgets
        WHERE scope = $1 AND scope_id = $2
          AND period_start <= $3 AND period_end > $3
        FOR UPDATE
        "#,
    ))
    .bind(scope)
    .bind(scope_id)
    .bind(now)
    .fetch_all(&mut **tx)
    .await?)
}

/// The newest window per granularity for one scope, regardless of expiry;
/// the rollover source.
pub async fn latest_for_scope(
    tx: &mut Transaction<'_, Postgres>,
    scope: BudgetScope,
    scope_id: &str,
) -> Result<Vec<TokenBudget>> {
    Ok(sqlx::query_as::<_, TokenBudget>(&format!(
        r#"
        SELECT DISTINCT ON (granularity) {BUDGET_COLUMNS}
        FROM token_budgets
        WHERE scope = $1 AND scope_id = $2
        ORDER BY granularity, period_start DESC
        "#,
    ))
    .bind(scope)
    .bind(scope_id)
    .fetch_all(&mut **tx)
    .await?)
}

/// The newest window for every (scope, scope_id, granularity) key in the
/// table; used by the global rollover sweep.
pub async fn latest_all(tx: &mut Transaction<'_, Postgres>) -> Result<Vec<TokenBudget>> {
    Ok(sqlx::query_as::<_, TokenBudget>(&format!(
        r#"
        SELECT DISTINCT ON (scope, scope_id, granularity) {BUDGET_COLUMNS}
        FROM token_budgets
        ORDER BY scope, scope_id, granularity, period_start DESC
        "#,
    ))
    .fetch_all(&mut **tx)
    .await?)
}

/// Open a new budget window. The unique constraint on
/// (scope, scope_id, granularity, period_start) makes concurrent rollovers
/// idempotent: the loser's insert is a no-op.
#[allow(clippy::too_many_arguments)]
pub async fn insert_window(
    tx: &mut Transaction<'_, Postgres>,
    scope: BudgetScope,
    scope_id: &str,
    granularity: Granularity,
    token_limit: i64,
    tokens_used: i64,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO token_budgets
            (id, scope, scope_id, granularity, token_limit, tokens_used, period_start, period_end)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (scope, scope_id, granularity, period_start) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(scope)
    .bind(scope_id)
    .bind(granularity)
    .bind(token_limit)
    .bind(tokens_used)
    .bind(period_start)
    .bind(period_end)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Debit and return the new consumption for threshold detection.
pub async fn add_used(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    amount: i64,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        UPDATE token_budgets
        SET tokens_used = tokens_used + $2
        WHERE id = $1
        RETURNING tokens_used
        "#,
    )
    .bind(id)
    .bind(amount)
    .fetch_one(&mut **tx)
    .await?;

    Ok(row.0)
}

/// Current windows for status queries (no locks).
pub async fn status(
    pool: &PgPool,
    scope: Option<BudgetScope>,
    scope_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Vec<TokenBudget>> {
    let mut sql = format!(
        "SELECT {BUDGET_COLUMNS} FROM token_budgets WHERE period_start <= $1 AND period_end > $1"
    );
    if scope.is_some() {
        sql.push_str(" AND scope = $2");
    }
    if scope_id.is_some() {
        sql.push_str(if scope.is_some() {
            " AND scope_id = $3"
        } else {
            " AND scope_id = $2"
        });
    }
    sql.push_str(" ORDER BY scope, scope_id, granularity");

    let mut query = sqlx::query_as::<_, TokenBudget>(&sql).bind(now);
    if let Some(scope) = scope {
        query = query.bind(scope);
    }
    if let Some(scope_id) = scope_id {
        query = query.bind(scope_id);
    }

    Ok(query.fetch_all(pool).await?)
}
