//! Heartbeat receipt and the stale-runner reconciler.
//!
//! Heartbeats carry no authoritative timestamp; `received_at` is stamped at
//! the API boundary and all TTL arithmetic is server-side. One bad heartbeat
//! never fails a runner: validation problems are logged, counted, and
//! swallowed at the API layer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use event_schema::AlertSeverity;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::budget::{BudgetEngine, ScopeChain};
use crate::db::{runner_repo, session_repo, Db};
use crate::db::project_repo;
use crate::error::{AppError, Result};
use crate::metrics::Metrics;
use crate::model::RunnerStatus;
use crate::notify::Notifier;
use crate::runner::RunnerManager;

/// One heartbeat sample as received from an agent.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSample {
    pub runner_id: Uuid,
    /// Status the agent reports for itself; only `running`/`paused` are
    /// honored, everything else is the daemon's call.
    pub status: Option<RunnerStatus>,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub tokens_delta: i64,
    pub agent_version: Option<String>,
    /// Server-side receipt time, stamped at the API boundary.
    #[serde(skip, default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

/// Fold a sample into the runner row, project and session aggregates, and
/// the budget ledger. Idempotent in the sense that a duplicate sample only
/// re-applies its (already counted) deltas of zero.
pub async fn apply(
    db: &Db,
    budget: &BudgetEngine,
    metrics: &Metrics,
    notifier: &Notifier,
    sample: &HeartbeatSample,
) -> Result<()> {
    let mut tx = db.begin().await?;

    let Some(runner) = runner_repo::get_for_update(&mut tx, sample.runner_id).await? else {
        return Err(AppError::NotFound("runner".to_string()));
    };

    if runner.status.is_terminal() {
        // Late sample racing a terminal transition; nothing to fold.
        return Ok(());
    }

    let next_status = next_status(runner.status, sample.status);

    runner_repo::apply_heartbeat(
        &mut tx,
        runner.id,
        next_status,
        sample.cpu_percent,
        sample.memory_mb,
        sample.tokens_delta.max(0),
        sample.agent_version.as_deref(),
    )
    .await?;

    if sample.tokens_delta > 0 {
        project_repo::add_tokens(&mut tx, runner.project_id, sample.tokens_delta).await?;
        session_repo::add_tokens(&mut tx, runner.id, sample.tokens_delta).await?;
    }

    tx.commit().await?;

    metrics.heartbeats_received.inc();
    if next_status != runner.status {
        metrics.runner_transition(Some(runner.status), Some(next_status));
    }
    let latency = (Utc::now() - sample.received_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    metrics.heartbeat_latency.observe(latency.as_secs_f64());

    if sample.tokens_delta > 0 {
        let chain = ScopeChain::for_runner(runner.project_id, runner.id);
        for (scope, _) in chain.scopes() {
            metrics
                .tokens_consumed
                .with_label_values(&[scope.as_str()])
                .inc_by(sample.tokens_delta as u64);
        }

        let warnings = budget.record(&chain, sample.tokens_delta).await?;
        for warning in warnings {
            warn!(
                scope = warning.scope.as_str(),
                scope_id = %warning.scope_id,
                percent = warning.percent,
                used = warning.used,
                limit = warning.limit,
                "budget threshold crossed"
            );
            notifier
                .alert(
                    AlertSeverity::Warning,
                    "token budget threshold crossed",
                    serde_json::json!({
                        "scope": warning.scope.as_str(),
                        "scope_id": warning.scope_id,
                        "percent": warning.percent,
                        "used": warning.used,
                        "limit": warning.limit,
                    }),
                )
                .await;
        }
    }

    Ok(())
}

/// First heartbeat promotes `starting` to `running`; after that the agent may
/// toggle `running`/`paused` and nothing else.
fn next_status(current: RunnerStatus, reported: Option<RunnerStatus>) -> RunnerStatus {
    if current == RunnerStatus::Starting {
        return RunnerStatus::Running;
    }
    match reported {
        Some(reported @ (RunnerStatus::Running | RunnerStatus::Paused))
            if current.can_transition_to(reported) =>
        {
            reported
        }
        _ => current,
    }
}

/// Periodically fails runners whose heartbeats expired and clears their
/// supervisory entries. The `runner.failed.*` outbox rows are written by the
/// reap query's transaction, so notification needs no extra step here.
pub struct Reconciler {
    db: Db,
    manager: Arc<RunnerManager>,
    interval: Duration,
    ttl: Duration,
    metrics: Arc<Metrics>,
    notifier: Arc<Notifier>,
}

impl Reconciler {
    pub fn new(
        db: Db,
        manager: Arc<RunnerManager>,
        interval: Duration,
        ttl: Duration,
        metrics: Arc<Metrics>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            db,
            manager,
            interval,
            ttl,
            metrics,
            notifier,
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            ttl_secs = self.ttl.as_secs(),
            "reconciler starting"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; skip it so a
        // freshly started daemon doesn't reap before runners can heartbeat.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("reconciler stopping");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match self.reconcile_once().await {
                Ok(0) => {}
                Ok(reaped) => info!(reaped, "reconciler failed stale runners"),
                Err(e) => error!(error = %e, "reconcile pass failed"),
            }
        }
    }

    /// One reap pass; also invoked by the `ReconcileNow` API operation.
    pub async fn reconcile_once(&self) -> Result<usize> {
        let mut tx = self.db.begin().await?;
        let reaped = runner_repo::reap_stale(&mut tx, self.ttl.as_secs() as i64).await?;
        tx.commit().await?;

        for victim in &reaped {
            self.manager.forget(victim.runner_id).await;
            self.metrics.runners_reaped.inc();
            self.metrics
                .runner_transition(Some(victim.previous_status), Some(RunnerStatus::Failed));
        }

        if !reaped.is_empty() {
            self.notifier
                .alert(
                    AlertSeverity::Warning,
                    "stale runners reaped",
                    serde_json::json!({
                        "count": reaped.len(),
                        "runner_ids": reaped.iter().map(|r| r.runner_id).collect::<Vec<_>>(),
                    }),
                )
                .await;
        }

        Ok(reaped.len())
    }
}
