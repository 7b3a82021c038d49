//! Runner lifecycle management.
//!
//! The manager owns the in-memory supervisory map exclusively: an entry is
//! created before spawn and removed on terminal transition, so every durable
//! runner row in a live status has exactly one entry here. Admission is
//! serialized per project by an advisory lock, and every state transition
//! commits its outbox event in the same transaction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use event_schema::{entity, routing, AlertSeverity, EventEnvelope};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::budget::{BudgetDecision, BudgetEngine, ScopeChain};
use crate::config::DaemonConfig;
use crate::db::{self, event_repo, project_repo, runner_repo, session_repo, Db};
use crate::error::{AppError, Result};
use crate::heartbeat::{self, HeartbeatSample};
use crate::metrics::Metrics;
use crate::model::{ProjectStatus, RestartPolicy, Runner, RunnerStatus};
use crate::notify::Notifier;

pub mod runtime;

use runtime::{
    ExitStatusInfo, LaunchSpec, Runtime, RuntimeError, RuntimeHandle, StopSignal,
    ENV_API_ENDPOINT, ENV_RUNNER_ID,
};

/// Parameters of one launch request after validation.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub project_id: Uuid,
    pub flags: Vec<String>,
    pub attach_stdio: bool,
    pub estimated_tokens: Option<i64>,
    pub restart_policy: RestartPolicy,
}

/// Supervisory view of one live runner.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRunner {
    pub runner_id: Uuid,
    pub project_id: Uuid,
    pub project_name: String,
}

enum ControlMsg {
    Stop { grace: Duration },
    Kill,
}

struct Supervised {
    project_id: Uuid,
    project_name: String,
    hb_tx: mpsc::Sender<HeartbeatSample>,
    control_tx: mpsc::Sender<ControlMsg>,
    task: JoinHandle<()>,
}

pub struct RunnerManager {
    db: Db,
    budget: Arc<BudgetEngine>,
    runtime: Arc<dyn Runtime>,
    config: Arc<DaemonConfig>,
    metrics: Arc<Metrics>,
    notifier: Arc<Notifier>,
    supervised: Arc<RwLock<HashMap<Uuid, Supervised>>>,
}

impl RunnerManager {
    pub fn new(
        db: Db,
        budget: Arc<BudgetEngine>,
        runtime: Arc<dyn Runtime>,
        config: Arc<DaemonConfig>,
        metrics: Arc<Metrics>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            db,
            budget,
            runtime,
            config,
            metrics,
            notifier,
            supervised: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Admit and start one runner.
    ///
    /// The admission transaction holds the project advisory lock across the
    /// quota count, the budget check, and the runner/outbox inserts, so
    /// concurrent launches on one project cannot overshoot the quota. The
    /// child is spawned after commit; a spawn failure is recorded in a
    /// follow-up transaction and the launch still returns the identifier.
    pub async fn launch(&self, request: LaunchRequest) -> Result<Runner> {
        let estimated = request
            .estimated_tokens
            .unwrap_or(self.config.default_estimated_tokens);

        let mut tx = self.db.begin().await?;
        db::advisory_lock(&mut tx, "project", &request.project_id.to_string()).await?;

        let (project, quota) = project_repo::get_for_admission(&mut tx, request.project_id)
            .await?
            .ok_or_else(|| AppError::NotFound("project".to_string()))?;

        if project.status == ProjectStatus::Archived {
            return Err(AppError::Conflict("project is archived".to_string()));
        }

        let active = runner_repo::count_active(&mut tx, project.id).await?;
        if active + 1 > quota.max_concurrent_runners as i64 {
            return Err(AppError::QuotaExceeded {
                active,
                max_concurrent: quota.max_concurrent_runners,
            });
        }

        let chain = ScopeChain::for_project(project.id);
        if let BudgetDecision::Exceeded { scope, used, limit } =
            self.budget.check_and_reserve(&mut tx, &chain, estimated).await?
        {
            return Err(AppError::BudgetExceeded { scope, used, limit });
        }

        let runner_id = Uuid::new_v4();
        let runner =
            runner_repo::insert(&mut tx, runner_id, project.id, request.restart_policy).await?;
        project_repo::adjust_runner_count(&mut tx, project.id, 1).await?;
        let session = session_repo::create(&mut tx, project.id, runner_id).await?;

        let started = EventEnvelope::new(
            "runner.started",
            entity::RUNNER,
            runner_id.to_string(),
            serde_json::json!({
                "project_id": project.id,
                "project_name": project.name,
                "estimated_tokens": estimated,
            }),
        );
        event_repo::append(&mut tx, &started, &routing::runner_started(&project.name)).await?;

        let session_created = EventEnvelope::new(
            "session.created",
            entity::SESSION,
            session.id.to_string(),
            serde_json::json!({ "runner_id": runner_id, "project_id": project.id }),
        );
        event_repo::append(
            &mut tx,
            &session_created,
            &routing::session_created(&project.name),
        )
        .await?;

        tx.commit().await?;

        self.metrics.launches_total.inc();
        self.metrics
            .runner_transition(None, Some(RunnerStatus::Starting));
        self.metrics
            .runners_by_project
            .with_label_values(&[project.name.as_str()])
            .inc();

        info!(
            runner_id = %runner_id,
            project = %project.name,
            active = active + 1,
            "runner admitted"
        );

        let spec = self.launch_spec(&request, runner_id, &project.path);
        match self.runtime.spawn(&spec).await {
            Ok(handle) => {
                if let Some(pid) = handle.pid() {
                    if let Err(e) = runner_repo::set_pid(self.db.pool(), runner_id, pid as i64).await
                    {
                        warn!(runner_id = %runner_id, error = %e, "failed to record pid");
                    }
                }
                self.supervise(runner_id, project.id, project.name.clone(), handle)
                    .await;
            }
            Err(e) => {
                warn!(runner_id = %runner_id, error = %e, "spawn failed after admission");
                self.fail_spawn(runner_id, project.id, &project.name, &e).await;
            }
        }

        Ok(runner)
    }

    fn launch_spec(&self, request: &LaunchRequest, runner_id: Uuid, project_path: &str) -> LaunchSpec {
        let mut command = self.config.agent_command.clone();
        command.extend(request.flags.iter().cloned());

        let endpoint = self.config.advertised_endpoint.clone().unwrap_or_else(|| {
            format!(
                "http://{}:{}",
                self.config.listen_host, self.config.listen_port
            )
        });

        let mut env = HashMap::new();
        env.insert(ENV_RUNNER_ID.to_string(), runner_id.to_string());
        env.insert(ENV_API_ENDPOINT.to_string(), endpoint);

        LaunchSpec {
            runner_id,
            workdir: PathBuf::from(project_path),
            command,
            env,
            attach_stdio: request.attach_stdio,
        }
    }

    /// Create the supervisory entry and start the per-runner task that owns
    /// the process handle, drains the runner's bounded heartbeat channel, and
    /// persists the terminal transition.
    async fn supervise(
        &self,
        runner_id: Uuid,
        project_id: Uuid,
        project_name: String,
        handle: Box<dyn RuntimeHandle>,
    ) {
        let (hb_tx, hb_rx) = mpsc::channel(self.config.heartbeat_queue_depth);
        let (control_tx, control_rx) = mpsc::channel(4);

        let ctx = SupervisorCtx {
            db: self.db.clone(),
            budget: self.budget.clone(),
            metrics: self.metrics.clone(),
            notifier: self.notifier.clone(),
            supervised: self.supervised.clone(),
            runner_id,
            project_id,
            project_name: project_name.clone(),
            spawn_confirm_timeout: self.config.spawn_confirm_timeout(),
        };

        // Hold the map lock across spawn + insert: the supervisor's final
        // self-removal takes this same lock, so even an instantly-exiting
        // child cannot remove its entry before it exists.
        let mut map = self.supervised.write().await;
        let task = tokio::spawn(run_supervisor(ctx, handle, hb_rx, control_rx));
        map.insert(
            runner_id,
            Supervised {
                project_id,
                project_name,
                hb_tx,
                control_tx,
                task,
            },
        );
    }

    /// Record a post-commit spawn failure: terminal `failed` plus the
    /// matching outbox event, in their own transaction.
    async fn fail_spawn(
        &self,
        runner_id: Uuid,
        project_id: Uuid,
        project_name: &str,
        cause: &RuntimeError,
    ) {
        let result: Result<()> = async {
            let mut tx = self.db.begin().await?;
            db::advisory_lock(&mut tx, "project", &project_id.to_string()).await?;

            if runner_repo::mark_terminal(&mut tx, runner_id, RunnerStatus::Failed, None)
                .await?
                .is_none()
            {
                return Ok(());
            }
            project_repo::adjust_runner_count(&mut tx, project_id, -1).await?;
            session_repo::end_for_runner(&mut tx, runner_id).await?;

            let envelope = EventEnvelope::new(
                "runner.failed",
                entity::RUNNER,
                runner_id.to_string(),
                serde_json::json!({
                    "project_id": project_id,
                    "reason": "spawn failed",
                    "error": cause.to_string(),
                }),
            );
            event_repo::append(&mut tx, &envelope, &routing::runner_failed(project_name)).await?;
            tx.commit().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.metrics
                    .runner_transition(Some(RunnerStatus::Starting), Some(RunnerStatus::Failed));
                self.metrics
                    .runners_by_project
                    .with_label_values(&[project_name])
                    .dec();
            }
            Err(e) => {
                error!(runner_id = %runner_id, error = %e, "failed to record spawn failure");
            }
        }

        self.notifier
            .alert(
                AlertSeverity::Warning,
                "runner spawn failed",
                serde_json::json!({
                    "runner_id": runner_id,
                    "project_id": project_id,
                    "error": cause.to_string(),
                }),
            )
            .await;
    }

    /// Polite stop: SIGTERM, then SIGKILL once the grace period expires.
    pub async fn stop(&self, runner_id: Uuid, grace: Option<Duration>) -> Result<()> {
        let grace = grace.unwrap_or_else(|| self.config.stop_grace());
        self.send_control(runner_id, ControlMsg::Stop { grace })
            .await
    }

    /// Forcible termination without a grace period.
    pub async fn kill(&self, runner_id: Uuid) -> Result<()> {
        self.send_control(runner_id, ControlMsg::Kill).await
    }

    async fn send_control(&self, runner_id: Uuid, msg: ControlMsg) -> Result<()> {
        let control_tx = {
            let map = self.supervised.read().await;
            map.get(&runner_id).map(|entry| entry.control_tx.clone())
        };

        if let Some(control_tx) = control_tx {
            control_tx
                .send(msg)
                .await
                .map_err(|_| AppError::Internal("supervisor channel closed".to_string()))?;
            return Ok(());
        }

        match runner_repo::get(self.db.pool(), runner_id).await? {
            None => Err(AppError::NotFound("runner".to_string())),
            Some(runner) if runner.status.is_terminal() => Err(AppError::Conflict(
                "runner already reached a terminal status".to_string(),
            )),
            Some(_) => Err(AppError::Conflict(
                "runner is not supervised by this daemon".to_string(),
            )),
        }
    }

    /// Route a heartbeat to the runner's supervisor. Overflowed channels drop
    /// the sample (with a counter); a missing or finished supervisor falls
    /// back to folding directly, so heartbeats survive daemon restarts.
    pub async fn on_heartbeat(&self, sample: HeartbeatSample) -> Result<()> {
        let hb_tx = {
            let map = self.supervised.read().await;
            map.get(&sample.runner_id).map(|entry| entry.hb_tx.clone())
        };

        let sample = match hb_tx {
            Some(hb_tx) => match hb_tx.try_send(sample) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.heartbeats_dropped.inc();
                    return Ok(());
                }
                Err(mpsc::error::TrySendError::Closed(sample)) => sample,
            },
            None => sample,
        };

        heartbeat::apply(&self.db, &self.budget, &self.metrics, &self.notifier, &sample).await
    }

    /// The in-memory supervised set.
    pub async fn active(&self) -> Vec<ActiveRunner> {
        let map = self.supervised.read().await;
        map.iter()
            .map(|(runner_id, entry)| ActiveRunner {
                runner_id: *runner_id,
                project_id: entry.project_id,
                project_name: entry.project_name.clone(),
            })
            .collect()
    }

    pub async fn supervised_count(&self) -> usize {
        self.supervised.read().await.len()
    }

    /// Drop the supervisory entry for a runner someone else (the reaper)
    /// already failed, and make sure its process dies.
    pub async fn forget(&self, runner_id: Uuid) {
        let entry = { self.supervised.write().await.remove(&runner_id) };
        if let Some(entry) = entry {
            let _ = entry.control_tx.try_send(ControlMsg::Kill);
            self.metrics
                .runners_by_project
                .with_label_values(&[entry.project_name.as_str()])
                .dec();
        }
    }

    /// Stop every supervised runner and wait for terminal statuses to land in
    /// the store. After return the supervisory map is empty.
    pub async fn shutdown(&self, timeout: Duration) {
        let mut entries: Vec<(Uuid, Supervised)> =
            { self.supervised.write().await.drain().collect() };
        if entries.is_empty() {
            return;
        }

        info!(count = entries.len(), "stopping supervised runners");
        let grace = timeout / 2;
        for (_, entry) in &entries {
            let _ = entry.control_tx.send(ControlMsg::Stop { grace }).await;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        for (runner_id, entry) in &mut entries {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, &mut entry.task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(runner_id = %runner_id, error = %e, "supervisor task failed during shutdown");
                }
                Err(_) => {
                    warn!(runner_id = %runner_id, "shutdown deadline expired, aborting supervisor");
                    entry.task.abort();
                    // Aborting drops the process handle, which kills the
                    // child; the terminal row is ours to write now.
                    if let Err(e) = self
                        .persist_forced_terminal(*runner_id, entry.project_id, &entry.project_name)
                        .await
                    {
                        error!(runner_id = %runner_id, error = %e, "failed to persist forced terminal status");
                    }
                }
            }
            self.metrics
                .runners_by_project
                .with_label_values(&[entry.project_name.as_str()])
                .dec();
        }

        info!("all supervised runners stopped");
    }

    async fn persist_forced_terminal(
        &self,
        runner_id: Uuid,
        project_id: Uuid,
        project_name: &str,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;
        db::advisory_lock(&mut tx, "project", &project_id.to_string()).await?;

        let Some((_, prev)) =
            runner_repo::mark_terminal(&mut tx, runner_id, RunnerStatus::Terminated, None).await?
        else {
            return Ok(());
        };
        project_repo::adjust_runner_count(&mut tx, project_id, -1).await?;
        session_repo::end_for_runner(&mut tx, runner_id).await?;

        let envelope = EventEnvelope::new(
            "runner.stopped",
            entity::RUNNER,
            runner_id.to_string(),
            serde_json::json!({
                "project_id": project_id,
                "reason": "daemon shutdown deadline expired",
            }),
        );
        event_repo::append(&mut tx, &envelope, &routing::runner_stopped(project_name)).await?;
        tx.commit().await?;

        self.metrics
            .runner_transition(Some(prev), Some(RunnerStatus::Terminated));
        Ok(())
    }
}

struct SupervisorCtx {
    db: Db,
    budget: Arc<BudgetEngine>,
    metrics: Arc<Metrics>,
    notifier: Arc<Notifier>,
    supervised: Arc<RwLock<HashMap<Uuid, Supervised>>>,
    runner_id: Uuid,
    project_id: Uuid,
    project_name: String,
    spawn_confirm_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopKind {
    None,
    Polite,
    Forced,
}

/// Per-runner supervision loop: waits on the child, folds heartbeats (one
/// runner's heartbeats are therefore serialized), promotes `starting` on the
/// spawn-confirm timer, and escalates polite stops after the grace period.
async fn run_supervisor(
    ctx: SupervisorCtx,
    mut handle: Box<dyn RuntimeHandle>,
    mut hb_rx: mpsc::Receiver<HeartbeatSample>,
    mut control_rx: mpsc::Receiver<ControlMsg>,
) {
    const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 30);

    let confirm = tokio::time::sleep(ctx.spawn_confirm_timeout);
    tokio::pin!(confirm);
    let mut confirm_armed = true;

    let escalate = tokio::time::sleep(FAR_FUTURE);
    tokio::pin!(escalate);
    let mut escalate_armed = false;

    let mut stop_kind = StopKind::None;

    let outcome = loop {
        tokio::select! {
            exit = handle.wait() => break exit,

            Some(msg) = control_rx.recv() => match msg {
                ControlMsg::Stop { grace } => {
                    if stop_kind == StopKind::None {
                        stop_kind = StopKind::Polite;
                        let _ = runner_repo::mark_stopping(ctx.db.pool(), ctx.runner_id).await;
                        match handle.signal(StopSignal::Graceful) {
                            Ok(()) => {
                                escalate
                                    .as_mut()
                                    .reset(tokio::time::Instant::now() + grace);
                                escalate_armed = true;
                            }
                            Err(e) => {
                                warn!(
                                    runner_id = %ctx.runner_id,
                                    error = %e,
                                    "graceful signal failed, escalating"
                                );
                                stop_kind = StopKind::Forced;
                                let _ = handle.signal(StopSignal::Forcible);
                            }
                        }
                    }
                }
                ControlMsg::Kill => {
                    stop_kind = StopKind::Forced;
                    escalate_armed = false;
                    let _ = runner_repo::mark_stopping(ctx.db.pool(), ctx.runner_id).await;
                    if let Err(e) = handle.signal(StopSignal::Forcible) {
                        warn!(runner_id = %ctx.runner_id, error = %e, "forcible signal failed");
                    }
                }
            },

            Some(sample) = hb_rx.recv() => {
                confirm_armed = false;
                if let Err(e) =
                    heartbeat::apply(&ctx.db, &ctx.budget, &ctx.metrics, &ctx.notifier, &sample).await
                {
                    warn!(runner_id = %ctx.runner_id, error = %e, "heartbeat fold failed");
                }
            }

            _ = &mut confirm, if confirm_armed => {
                confirm_armed = false;
                match runner_repo::mark_running(ctx.db.pool(), ctx.runner_id).await {
                    Ok(true) => {
                        info!(
                            runner_id = %ctx.runner_id,
                            "no heartbeat within confirm window, promoting to running"
                        );
                        ctx.metrics.runner_transition(
                            Some(RunnerStatus::Starting),
                            Some(RunnerStatus::Running),
                        );
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(runner_id = %ctx.runner_id, error = %e, "spawn-confirm promote failed");
                    }
                }
            }

            _ = &mut escalate, if escalate_armed => {
                escalate_armed = false;
                warn!(runner_id = %ctx.runner_id, "grace period expired, killing runner");
                stop_kind = StopKind::Forced;
                let _ = handle.signal(StopSignal::Forcible);
            }
        }
    };

    finalize(&ctx, outcome, stop_kind).await;

    // Last: drop our own supervisory entry. Whoever removes the entry owns
    // the per-project gauge decrement, so a reaper or shutdown removal that
    // beat us to it already counted.
    let removed = ctx.supervised.write().await.remove(&ctx.runner_id);
    if removed.is_some() {
        ctx.metrics
            .runners_by_project
            .with_label_values(&[ctx.project_name.as_str()])
            .dec();
    }
}

async fn finalize(
    ctx: &SupervisorCtx,
    outcome: std::result::Result<ExitStatusInfo, RuntimeError>,
    stop_kind: StopKind,
) {
    let (status, exit_code) = match &outcome {
        Ok(exit) => {
            let status = match stop_kind {
                StopKind::Forced => RunnerStatus::Terminated,
                StopKind::Polite => RunnerStatus::Stopped,
                StopKind::None => {
                    if exit.success {
                        RunnerStatus::Stopped
                    } else {
                        RunnerStatus::Failed
                    }
                }
            };
            (status, exit.code)
        }
        Err(e) => {
            error!(runner_id = %ctx.runner_id, error = %e, "wait on runner process failed");
            (RunnerStatus::Failed, None)
        }
    };

    if let Err(e) = persist_terminal(ctx, status, exit_code).await {
        error!(
            runner_id = %ctx.runner_id,
            error = %e,
            "failed to persist terminal transition"
        );
    }
}

async fn persist_terminal(
    ctx: &SupervisorCtx,
    status: RunnerStatus,
    exit_code: Option<i32>,
) -> Result<()> {
    let mut tx = ctx.db.begin().await?;
    db::advisory_lock(&mut tx, "project", &ctx.project_id.to_string()).await?;

    let Some((project_id, prev)) =
        runner_repo::mark_terminal(&mut tx, ctx.runner_id, status, exit_code).await?
    else {
        // The reaper's transaction already failed this runner and emitted
        // the event; nothing more to record.
        return Ok(());
    };
    project_repo::adjust_runner_count(&mut tx, project_id, -1).await?;
    let session_ids = session_repo::end_for_runner(&mut tx, ctx.runner_id).await?;

    let (kind, routing_key) = if status == RunnerStatus::Failed {
        ("runner.failed", routing::runner_failed(&ctx.project_name))
    } else {
        ("runner.stopped", routing::runner_stopped(&ctx.project_name))
    };
    let envelope = EventEnvelope::new(
        kind,
        entity::RUNNER,
        ctx.runner_id.to_string(),
        serde_json::json!({
            "project_id": ctx.project_id,
            "status": status,
            "exit_code": exit_code,
        }),
    );
    event_repo::append(&mut tx, &envelope, &routing_key).await?;

    for session_id in session_ids {
        let ended = EventEnvelope::new(
            "session.ended",
            entity::SESSION,
            session_id.to_string(),
            serde_json::json!({ "runner_id": ctx.runner_id }),
        );
        event_repo::append(&mut tx, &ended, &routing::session_ended(&ctx.project_name)).await?;
    }

    tx.commit().await?;

    ctx.metrics.runner_transition(Some(prev), Some(status));
    info!(
        runner_id = %ctx.runner_id,
        status = status.as_str(),
        exit_code = ?exit_code,
        "runner reached terminal status"
    );

    Ok(())
}
