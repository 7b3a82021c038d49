//! Component wiring and lifecycle.
//!
//! Start order: store, broker, observability hooks, outbox processor,
//! reconciler, then the HTTP surfaces. Stop order is the reverse, each stage
//! with a bounded deadline; supervised children are stopped before the pool
//! closes. All shared state hangs off this one value, there are no
//! process-wide singletons.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use transactional_outbox::{
    AmqpEventPublisher, OutboxMetrics, OutboxProcessor, ProcessorConfig, SqlxOutboxRepository,
};

use crate::api::{self, AppState};
use crate::budget::BudgetEngine;
use crate::config::Config;
use crate::db::Db;
use crate::heartbeat::Reconciler;
use crate::metrics::{self, Metrics};
use crate::middleware::{AuthMiddleware, RateLimitConfig, RateLimitMiddleware};
use crate::notify::Notifier;
use crate::runner::runtime::LocalProcessRuntime;
use crate::runner::RunnerManager;

pub struct Orchestrator {
    config: Arc<Config>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let config = self.config.clone();

        if config.daemon.api_tokens.is_empty() {
            warn!("no api_tokens configured; every authenticated operation will be rejected");
        }

        // Store
        let db = Db::connect(&config.database)
            .await
            .context("database connect")?;
        db.migrate().await.context("database migrations")?;

        // Broker
        let broker = Arc::new(
            broker_client::BrokerClient::connect(config.broker.clone())
                .await
                .context("broker connect")?,
        );

        // Observability hooks
        let metrics = Arc::new(Metrics::new());
        let notifier = Arc::new(Notifier::new(config.notification.clone()));
        if notifier.enabled() {
            info!("webhook notification sink enabled");
        }

        // Outbox publisher
        let publisher = Arc::new(AmqpEventPublisher::new(
            broker.clone(),
            Duration::from_secs(10),
        ));
        let processor = OutboxProcessor::new(
            db.pool().clone(),
            publisher,
            ProcessorConfig {
                batch_size: config.daemon.outbox_batch_size,
                poll_interval: config.daemon.outbox_poll_interval(),
                max_attempts: config.daemon.outbox_max_attempts,
                ..ProcessorConfig::default()
            },
        )
        .with_metrics(OutboxMetrics::new("stratavored"));

        // Core components
        let budget = Arc::new(BudgetEngine::new(db.clone()));
        let runtime = Arc::new(LocalProcessRuntime::new());
        let manager = Arc::new(RunnerManager::new(
            db.clone(),
            budget.clone(),
            runtime,
            Arc::new(config.daemon.clone()),
            metrics.clone(),
            notifier.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            db.clone(),
            manager.clone(),
            config.daemon.reconcile_interval(),
            config.daemon.ttl(),
            metrics.clone(),
            notifier.clone(),
        ));

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

        // Background loops
        let processor_shutdown = shutdown_tx.subscribe();
        tasks.spawn(async move {
            processor.run(processor_shutdown).await;
            Ok(())
        });

        let reconciler_loop = reconciler.clone();
        let reconciler_shutdown = shutdown_tx.subscribe();
        tasks.spawn(async move {
            reconciler_loop.run(reconciler_shutdown).await;
            Ok(())
        });

        // HTTP surfaces
        let state = web::Data::new(AppState {
            db: db.clone(),
            manager: manager.clone(),
            budget: budget.clone(),
            reconciler: reconciler.clone(),
            metrics: metrics.clone(),
            broker: broker.clone(),
            outbox: Arc::new(SqlxOutboxRepository::new(db.pool().clone())),
            config: config.clone(),
            started_at: Utc::now(),
        });

        let auth = AuthMiddleware::new(&config.daemon.api_tokens);
        let rate_limit = RateLimitMiddleware::new(RateLimitConfig {
            req_per_second: config.daemon.rate_limit_per_second,
            burst_size: config.daemon.rate_limit_burst,
        });

        let api_state = state.clone();
        let api_server = HttpServer::new(move || {
            App::new()
                .app_data(api_state.clone())
                .wrap(TracingLogger::default())
                .configure(api::public_routes)
                .service(
                    web::scope("/api/v1")
                        .wrap(auth.clone())
                        .wrap(rate_limit.clone())
                        .configure(api::authenticated_routes),
                )
        })
        .bind((config.daemon.listen_host.as_str(), config.daemon.listen_port))
        .context("bind command api port")?
        .disable_signals()
        .run();

        let metrics_data = web::Data::new(metrics.clone());
        let metrics_server = HttpServer::new(move || {
            App::new()
                .app_data(metrics_data.clone())
                .route("/metrics", web::get().to(metrics::serve_metrics))
        })
        .bind((
            config.daemon.listen_host.as_str(),
            config.observability.metrics_port,
        ))
        .context("bind metrics port")?
        .disable_signals()
        .run();

        let api_handle = api_server.handle();
        let metrics_handle = metrics_server.handle();
        tasks.spawn(async move { api_server.await.context("command api server") });
        tasks.spawn(async move { metrics_server.await.context("metrics server") });

        info!(
            port = config.daemon.listen_port,
            metrics_port = config.observability.metrics_port,
            "stratavored started"
        );

        // Run until a signal arrives or a task dies.
        let mut first_error: Option<anyhow::Error> = None;
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = tasks.join_next() => match result {
                    Some(Ok(Ok(()))) => {
                        info!("background task completed");
                    }
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "task failed, shutting down");
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                        break;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "task join error, shutting down");
                        if first_error.is_none() {
                            first_error = Some(e.into());
                        }
                        break;
                    }
                    None => break,
                },
                _ = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        // Stop order: API surfaces, background loops, supervised children,
        // then the store.
        api_handle.stop(true).await;
        metrics_handle.stop(true).await;
        let _ = shutdown_tx.send(());
        manager.shutdown(config.daemon.shutdown_timeout()).await;

        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("background tasks did not drain in time, aborting");
            tasks.shutdown().await;
        }

        db.close().await;
        info!("stratavored stopped");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    }
}
