//! Command API: shared request state and route table.

use std::sync::Arc;

use actix_web::web;
use chrono::{DateTime, Utc};
use transactional_outbox::SqlxOutboxRepository;

use crate::budget::BudgetEngine;
use crate::config::Config;
use crate::db::Db;
use crate::heartbeat::Reconciler;
use crate::metrics::Metrics;
use crate::runner::RunnerManager;

pub mod budgets;
pub mod projects;
pub mod runners;
pub mod system;

pub struct AppState {
    pub db: Db,
    pub manager: Arc<RunnerManager>,
    pub budget: Arc<BudgetEngine>,
    pub reconciler: Arc<Reconciler>,
    pub metrics: Arc<Metrics>,
    pub broker: Arc<broker_client::BrokerClient>,
    pub outbox: Arc<SqlxOutboxRepository>,
    pub config: Arc<Config>,
    pub started_at: DateTime<Utc>,
}

/// Authenticated routes, mounted under `/api/v1` behind the auth and
/// rate-limit middleware.
pub fn authenticated_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/projects")
            .route("", web::post().to(projects::create_project))
            .route("", web::get().to(projects::list_projects))
            .route("/{project_id}", web::get().to(projects::get_project))
            .route(
                "/{project_id}/archive",
                web::post().to(projects::archive_project),
            ),
    )
    .service(
        web::scope("/runners")
            .route("", web::post().to(runners::launch_runner))
            .route("", web::get().to(runners::list_runners))
            .route("/{runner_id}", web::get().to(runners::get_runner))
            .route("/{runner_id}/stop", web::post().to(runners::stop_runner))
            .route("/{runner_id}/kill", web::post().to(runners::kill_runner))
            .route(
                "/{runner_id}/heartbeat",
                web::post().to(runners::submit_heartbeat),
            ),
    )
    .service(
        web::scope("/budgets")
            .route("", web::put().to(budgets::define_budget))
            .route("", web::get().to(budgets::budget_status)),
    )
    .route("/sessions", web::get().to(system::list_sessions))
    .route("/events", web::get().to(system::list_events))
    .route("/reconcile", web::post().to(system::reconcile_now));
}

/// Routes served without credentials: health probes and daemon status.
pub fn public_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/v1/health", web::get().to(system::health))
        .route("/api/v1/health/live", web::get().to(system::liveness))
        .route("/api/v1/health/ready", web::get().to(system::readiness))
        .route("/api/v1/status", web::get().to(system::daemon_status));
}
