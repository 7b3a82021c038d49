//! Token-budget definition and status.

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::Result;
use crate::model::{BudgetScope, Granularity, TokenBudget};

use super::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct DefineBudgetRequest {
    pub scope: BudgetScope,
    /// Empty for the global scope; a project or runner id otherwise.
    #[serde(default)]
    #[validate(length(max = 64))]
    pub scope_id: String,
    pub granularity: Granularity,
    #[validate(range(min = 1))]
    pub token_limit: i64,
}

pub async fn define_budget(
    state: web::Data<AppState>,
    request: web::Json<DefineBudgetRequest>,
) -> Result<HttpResponse> {
    request.validate()?;

    state
        .budget
        .define(
            request.scope,
            &request.scope_id,
            request.granularity,
            request.token_limit,
        )
        .await?;

    Ok(HttpResponse::Created().json(serde_json::json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
pub struct BudgetStatusQuery {
    pub scope: Option<BudgetScope>,
    pub scope_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BudgetStatusView {
    pub scope: BudgetScope,
    pub scope_id: String,
    pub granularity: Granularity,
    pub used: i64,
    pub limit: i64,
    pub remaining: i64,
    pub percent: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl From<TokenBudget> for BudgetStatusView {
    fn from(budget: TokenBudget) -> Self {
        Self {
            remaining: budget.remaining(),
            percent: budget.percent_used(),
            scope: budget.scope,
            scope_id: budget.scope_id,
            granularity: budget.granularity,
            used: budget.tokens_used,
            limit: budget.token_limit,
            period_start: budget.period_start,
            period_end: budget.period_end,
        }
    }
}

pub async fn budget_status(
    state: web::Data<AppState>,
    query: web::Query<BudgetStatusQuery>,
) -> Result<HttpResponse> {
    let budgets = state
        .budget
        .status(query.scope, query.scope_id.as_deref())
        .await?;

    let views: Vec<BudgetStatusView> = budgets.into_iter().map(Into::into).collect();
    Ok(HttpResponse::Ok().json(views))
}
