//! Project CRUD.

use actix_web::{web, HttpResponse};
use event_schema::{entity, routing, EventEnvelope};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use crate::db::{event_repo, project_repo};
use crate::error::{AppError, Result};

use super::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateProjectRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[validate(length(min = 1, max = 1024))]
    pub path: String,
    #[serde(default)]
    #[validate(length(max = 2048))]
    pub description: String,
    #[serde(default = "default_max_concurrent")]
    #[validate(range(min = 1, max = 256))]
    pub max_concurrent_runners: i32,
    #[serde(default = "default_max_memory_mb")]
    #[validate(range(min = 128))]
    pub max_memory_mb: i64,
    /// 0 means unlimited.
    #[serde(default)]
    #[validate(range(min = 0))]
    pub max_tokens_per_day: i64,
}

fn default_max_concurrent() -> i32 {
    4
}

fn default_max_memory_mb() -> i64 {
    16384
}

pub async fn create_project(
    state: web::Data<AppState>,
    request: web::Json<CreateProjectRequest>,
) -> Result<HttpResponse> {
    request.validate()?;

    let new = project_repo::NewProject {
        name: request.name.clone(),
        path: request.path.clone(),
        description: request.description.clone(),
        max_concurrent_runners: request.max_concurrent_runners,
        max_memory_mb: request.max_memory_mb,
        max_tokens_per_day: request.max_tokens_per_day,
    };

    let mut tx = state.db.begin().await?;
    let project = project_repo::create(&mut tx, &new).await?;

    let envelope = EventEnvelope::new(
        "project.created",
        entity::PROJECT,
        project.id.to_string(),
        serde_json::json!({ "name": project.name, "path": project.path }),
    );
    event_repo::append(&mut tx, &envelope, &routing::project_created(&project.name)).await?;
    tx.commit().await?;

    Ok(HttpResponse::Created().json(project))
}

pub async fn list_projects(state: web::Data<AppState>) -> Result<HttpResponse> {
    let projects = project_repo::list(state.db.pool()).await?;
    Ok(HttpResponse::Ok().json(projects))
}

pub async fn get_project(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let project = project_repo::get(state.db.pool(), path.into_inner())
        .await?
        .ok_or_else(|| AppError::NotFound("project".to_string()))?;
    Ok(HttpResponse::Ok().json(project))
}

pub async fn archive_project(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse> {
    let project_id = path.into_inner();

    let mut tx = state.db.begin().await?;
    crate::db::advisory_lock(&mut tx, "project", &project_id.to_string()).await?;
    let project = project_repo::archive(&mut tx, project_id).await?;

    let envelope = EventEnvelope::new(
        "project.archived",
        entity::PROJECT,
        project.id.to_string(),
        serde_json::json!({ "name": project.name }),
    );
    event_repo::append(&mut tx, &envelope, &routing::project_archived(&project.name)).await?;
    tx.commit().await?;

    Ok(HttpResponse::Ok().json(project))
}
