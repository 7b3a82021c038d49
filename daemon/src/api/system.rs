//! Health probes, daemon status, sessions, audit events, and the manual
//! reconcile trigger.

use std::collections::HashMap;
use std::time::Instant;

use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::db::{event_repo, session_repo};
use crate::error::Result;

use super::AppState;

#[derive(Serialize, Clone)]
#[serde(rename_all = "lowercase")]
enum ComponentStatus {
    Healthy,
    Unhealthy,
}

#[derive(Serialize)]
struct ComponentCheck {
    status: ComponentStatus,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<u64>,
}

pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    match state.db.check().await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({
            "status": "ok",
            "service": "stratavored",
            "version": env!("CARGO_PKG_VERSION"),
        })),
        Err(e) => HttpResponse::ServiceUnavailable().json(serde_json::json!({
            "status": "unhealthy",
            "error": format!("database check failed: {e}"),
            "service": "stratavored",
        })),
    }
}

pub async fn liveness() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "alive": true }))
}

pub async fn readiness(state: web::Data<AppState>) -> HttpResponse {
    let mut checks = HashMap::new();
    let mut ready = true;

    let start = Instant::now();
    let db_result = state.db.check().await;
    let db_latency = Some(start.elapsed().as_millis() as u64);
    checks.insert(
        "postgresql".to_string(),
        match db_result {
            Ok(()) => ComponentCheck {
                status: ComponentStatus::Healthy,
                message: "database round-trip successful".to_string(),
                latency_ms: db_latency,
            },
            Err(e) => {
                ready = false;
                ComponentCheck {
                    status: ComponentStatus::Unhealthy,
                    message: format!("database round-trip failed: {e}"),
                    latency_ms: db_latency,
                }
            }
        },
    );

    let start = Instant::now();
    let broker_result = state.broker.check().await;
    let broker_latency = Some(start.elapsed().as_millis() as u64);
    checks.insert(
        "broker".to_string(),
        match broker_result {
            Ok(()) => ComponentCheck {
                status: ComponentStatus::Healthy,
                message: "broker channel opened".to_string(),
                latency_ms: broker_latency,
            },
            Err(e) => {
                ready = false;
                ComponentCheck {
                    status: ComponentStatus::Unhealthy,
                    message: format!("broker unreachable: {e}"),
                    latency_ms: broker_latency,
                }
            }
        },
    );

    let body = serde_json::json!({
        "ready": ready,
        "checks": checks,
        "timestamp": Utc::now(),
    });

    if ready {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

pub async fn daemon_status(state: web::Data<AppState>) -> Result<HttpResponse> {
    let active = state.manager.active().await;
    let (outbox_pending, outbox_oldest_age) = state.outbox.pending_stats().await?;
    let outbox_dead = state
        .outbox
        .dead_count(state.config.daemon.outbox_max_attempts)
        .await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "service": "stratavored",
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": state.started_at,
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
        "supervised_runners": active.len(),
        "active": active,
        "outbox": {
            "pending": outbox_pending,
            "oldest_pending_age_seconds": outbox_oldest_age,
            "dead": outbox_dead,
        },
    })))
}

pub async fn reconcile_now(state: web::Data<AppState>) -> Result<HttpResponse> {
    let reaped = state.reconciler.reconcile_once().await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "reaped": reaped })))
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    pub project_id: Option<Uuid>,
}

pub async fn list_sessions(
    state: web::Data<AppState>,
    query: web::Query<ListSessionsQuery>,
) -> Result<HttpResponse> {
    let sessions = session_repo::list(state.db.pool(), query.project_id).await?;
    Ok(HttpResponse::Ok().json(sessions))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ListEventsQuery {
    #[validate(length(min = 1, max = 64))]
    pub entity_type: String,
    #[validate(length(min = 1, max = 64))]
    pub entity_id: String,
    #[validate(range(min = 1, max = 1000))]
    pub limit: Option<i64>,
}

pub async fn list_events(
    state: web::Data<AppState>,
    query: web::Query<ListEventsQuery>,
) -> Result<HttpResponse> {
    query.validate()?;

    let events = event_repo::list_for_entity(
        state.db.pool(),
        &query.entity_type,
        &query.entity_id,
        query.limit.unwrap_or(100),
    )
    .await?;

    Ok(HttpResponse::Ok().json(events))
}
