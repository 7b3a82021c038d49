//! Runner lifecycle operations and heartbeat submission.

use std::time::Duration;

use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::db::runner_repo;
use crate::error::{AppError, Result};
use crate::heartbeat::HeartbeatSample;
use crate::model::{RestartPolicy, RunnerStatus};
use crate::runner::LaunchRequest;

use super::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct LaunchRunnerRequest {
    pub project_id: Uuid,
    #[serde(default)]
    #[validate(length(max = 64))]
    pub flags: Vec<String>,
    /// Attach the child's stdio to the daemon's output.
    #[serde(default)]
    pub attach_stdio: bool,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub estimated_tokens: Option<i64>,
    #[serde(default)]
    pub restart_policy: Option<RestartPolicy>,
}

pub async fn launch_runner(
    state: web::Data<AppState>,
    request: web::Json<LaunchRunnerRequest>,
) -> Result<HttpResponse> {
    request.validate()?;

    let runner = state
        .manager
        .launch(LaunchRequest {
            project_id: request.project_id,
            flags: request.flags.clone(),
            attach_stdio: request.attach_stdio,
            estimated_tokens: request.estimated_tokens,
            restart_policy: request.restart_policy.unwrap_or(RestartPolicy::Never),
        })
        .await?;

    Ok(HttpResponse::Created().json(runner))
}

#[derive(Debug, Deserialize)]
pub struct ListRunnersQuery {
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub active: bool,
}

pub async fn list_runners(
    state: web::Data<AppState>,
    query: web::Query<ListRunnersQuery>,
) -> Result<HttpResponse> {
    let runners = runner_repo::list(state.db.pool(), query.project_id, query.active).await?;
    Ok(HttpResponse::Ok().json(runners))
}

pub async fn get_runner(state: web::Data<AppState>, path: web::Path<Uuid>) -> Result<HttpResponse> {
    let runner = runner_repo::get(state.db.pool(), path.into_inner())
        .await?
        .ok_or_else(|| AppError::NotFound("runner".to_string()))?;
    Ok(HttpResponse::Ok().json(runner))
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct StopRunnerRequest {
    #[validate(range(min = 0, max = 3600))]
    pub grace_seconds: Option<u64>,
}

pub async fn stop_runner(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    request: Option<web::Json<StopRunnerRequest>>,
) -> Result<HttpResponse> {
    let request = request.map(|r| r.into_inner()).unwrap_or_default();
    request.validate()?;

    let grace = request.grace_seconds.map(Duration::from_secs);
    state.manager.stop(path.into_inner(), grace).await?;

    Ok(HttpResponse::Accepted().json(serde_json::json!({ "status": "stopping" })))
}

pub async fn kill_runner(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse> {
    state.manager.kill(path.into_inner()).await?;
    Ok(HttpResponse::Accepted().json(serde_json::json!({ "status": "stopping" })))
}

#[derive(Debug, Deserialize, Validate)]
pub struct HeartbeatRequest {
    pub status: Option<RunnerStatus>,
    #[validate(range(min = 0.0, max = 6400.0))]
    #[serde(default)]
    pub cpu_percent: f64,
    #[validate(range(min = 0.0))]
    #[serde(default)]
    pub memory_mb: f64,
    #[validate(range(min = 0))]
    #[serde(default)]
    pub tokens_delta: i64,
    #[serde(default)]
    pub agent_version: Option<String>,
    /// Agent-side timestamp; accepted but not trusted. TTL arithmetic uses
    /// server receipt time only.
    #[serde(default)]
    pub timestamp: Option<chrono::DateTime<Utc>>,
}

/// A misbehaving agent must not cascade: validation problems are logged and
/// counted, and the call still succeeds.
pub async fn submit_heartbeat(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    request: web::Json<HeartbeatRequest>,
) -> Result<HttpResponse> {
    let runner_id = path.into_inner();

    if let Err(e) = request.validate() {
        tracing::warn!(runner_id = %runner_id, error = %e, "invalid heartbeat dropped");
        state.metrics.heartbeats_dropped.inc();
        return Ok(HttpResponse::Ok().json(serde_json::json!({ "accepted": false })));
    }

    let sample = HeartbeatSample {
        runner_id,
        status: request.status,
        cpu_percent: request.cpu_percent,
        memory_mb: request.memory_mb,
        tokens_delta: request.tokens_delta,
        agent_version: request.agent_version.clone(),
        received_at: Utc::now(),
    };

    match state.manager.on_heartbeat(sample).await {
        Ok(()) => Ok(HttpResponse::Ok().json(serde_json::json!({ "accepted": true }))),
        Err(err @ AppError::NotFound(_)) => Err(err),
        Err(e) => {
            tracing::warn!(runner_id = %runner_id, error = %e, "heartbeat fold failed");
            state.metrics.heartbeats_dropped.inc();
            Ok(HttpResponse::Ok().json(serde_json::json!({ "accepted": false })))
        }
    }
}
