//! Error taxonomy for the command API.
//!
//! Every failure surfaced to a caller is one of these categories; the HTTP
//! body is always `{code, category, message, details}` so clients can branch
//! on `category` without parsing messages.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;

use crate::model::BudgetScope;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("missing or invalid credential")]
    Unauthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("project quota exceeded: {active} active of {max_concurrent} allowed")]
    QuotaExceeded { active: i64, max_concurrent: i32 },

    #[error("token budget exceeded at {scope:?} scope: {used} used of {limit}")]
    BudgetExceeded {
        scope: BudgetScope,
        used: i64,
        limit: i64,
    },

    #[error("dependency unavailable: {0}")]
    Unavailable(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    category: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_FAILED",
            AppError::Unauthenticated => "UNAUTHENTICATED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            AppError::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            AppError::Unavailable(_) => "UNAVAILABLE",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::Cancelled => "CANCELLED",
            AppError::Internal(_) => "INTERNAL",
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::Unauthenticated => "unauthenticated",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::QuotaExceeded { .. } => "quota_exceeded",
            AppError::BudgetExceeded { .. } => "budget_exceeded",
            AppError::Unavailable(_) => "unavailable",
            AppError::Timeout(_) => "timeout",
            AppError::Cancelled => "cancelled",
            AppError::Internal(_) => "internal",
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::QuotaExceeded {
                active,
                max_concurrent,
            } => Some(serde_json::json!({
                "active": active,
                "max_concurrent": max_concurrent,
            })),
            AppError::BudgetExceeded { scope, used, limit } => Some(serde_json::json!({
                "scope": scope.as_str(),
                "used": used,
                "limit": limit,
            })),
            _ => None,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::QuotaExceeded { .. } | AppError::BudgetExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AppError::Unavailable(_) | AppError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if matches!(self, AppError::Internal(_)) {
            tracing::error!(error = %self, "internal error surfaced to caller");
        }
        HttpResponse::build(self.status_code()).json(ErrorBody {
            code: self.code(),
            category: self.category(),
            message: self.to_string(),
            details: self.details(),
        })
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => AppError::NotFound("row".to_string()),
            sqlx::Error::PoolTimedOut => AppError::Unavailable("database pool".to_string()),
            sqlx::Error::Database(db) => {
                // 23505 = unique_violation, 23503 = foreign_key_violation
                match db.code().as_deref() {
                    Some("23505") => AppError::Conflict(db.message().to_string()),
                    Some("23503") => AppError::NotFound("referenced entity".to_string()),
                    _ => AppError::Internal(err.to_string()),
                }
            }
            _ => AppError::Internal(err.to_string()),
        }
    }
}

impl From<broker_client::BrokerError> for AppError {
    fn from(err: broker_client::BrokerError) -> Self {
        match err {
            broker_client::BrokerError::ConfirmTimeout => {
                AppError::Timeout("broker confirm".to_string())
            }
            other => AppError::Unavailable(other.to_string()),
        }
    }
}

impl From<transactional_outbox::OutboxError> for AppError {
    fn from(err: transactional_outbox::OutboxError) -> Self {
        match err {
            transactional_outbox::OutboxError::Database(e) => e.into(),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(
            AppError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Unauthenticated.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::NotFound("runner".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::QuotaExceeded {
                active: 3,
                max_concurrent: 3
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::BudgetExceeded {
                scope: BudgetScope::Global,
                used: 950,
                limit: 1000
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::Timeout("db".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            AppError::Unavailable("broker".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn budget_details_carry_scope_and_numbers() {
        let err = AppError::BudgetExceeded {
            scope: BudgetScope::Global,
            used: 950,
            limit: 1000,
        };
        let details = err.details().unwrap();
        assert_eq!(details["scope"], "global");
        assert_eq!(details["used"], 950);
        assert_eq!(details["limit"], 1000);
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: AppError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.category(), "not_found");
    }
}
