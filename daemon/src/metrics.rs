//! Prometheus instrumentation and the text exposition endpoint.

use std::sync::Arc;
use std::time::Instant;

use actix_web::{web, HttpResponse};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    TextEncoder,
};
use tracing::warn;

use crate::model::RunnerStatus;

pub struct Metrics {
    pub runners_by_status: IntGaugeVec,
    pub runners_by_project: IntGaugeVec,
    pub tokens_consumed: IntCounterVec,
    pub heartbeat_latency: Histogram,
    pub heartbeats_received: IntCounter,
    pub heartbeats_dropped: IntCounter,
    pub runners_reaped: IntCounter,
    pub launches_total: IntCounter,
    pub uptime_seconds: IntGauge,
    started: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = prometheus::default_registry();

        let runners_by_status = IntGaugeVec::new(
            Opts::new("runners_by_status", "Supervised runners by status"),
            &["status"],
        )
        .expect("valid metric opts for runners_by_status");

        let runners_by_project = IntGaugeVec::new(
            Opts::new("runners_by_project", "Live runners per project"),
            &["project"],
        )
        .expect("valid metric opts for runners_by_project");

        let tokens_consumed = IntCounterVec::new(
            Opts::new("tokens_consumed_total", "Tokens consumed by scope"),
            &["scope"],
        )
        .expect("valid metric opts for tokens_consumed_total");

        let heartbeat_latency = Histogram::with_opts(HistogramOpts::new(
            "heartbeat_apply_latency_seconds",
            "Latency from heartbeat receipt to persisted fold",
        ))
        .expect("valid metric opts for heartbeat_apply_latency_seconds");

        let heartbeats_received = IntCounter::new(
            "heartbeats_received_total",
            "Heartbeat samples accepted by the API",
        )
        .expect("valid metric opts for heartbeats_received_total");

        let heartbeats_dropped = IntCounter::new(
            "heartbeats_dropped_total",
            "Heartbeat samples dropped on channel overflow",
        )
        .expect("valid metric opts for heartbeats_dropped_total");

        let runners_reaped = IntCounter::new(
            "runners_reaped_total",
            "Runners failed by the reconciler for heartbeat expiry",
        )
        .expect("valid metric opts for runners_reaped_total");

        let launches_total = IntCounter::new(
            "runner_launches_total",
            "Runner launches admitted",
        )
        .expect("valid metric opts for runner_launches_total");

        let uptime_seconds = IntGauge::new("daemon_uptime_seconds", "Daemon uptime")
            .expect("valid metric opts for daemon_uptime_seconds");

        for metric in [
            Box::new(runners_by_status.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(runners_by_project.clone()),
            Box::new(tokens_consumed.clone()),
            Box::new(heartbeat_latency.clone()),
            Box::new(heartbeats_received.clone()),
            Box::new(heartbeats_dropped.clone()),
            Box::new(runners_reaped.clone()),
            Box::new(launches_total.clone()),
            Box::new(uptime_seconds.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("failed to register daemon metric: {}", e);
            }
        }

        Self {
            runners_by_status,
            runners_by_project,
            tokens_consumed,
            heartbeat_latency,
            heartbeats_received,
            heartbeats_dropped,
            runners_reaped,
            launches_total,
            uptime_seconds,
            started: Instant::now(),
        }
    }

    /// Keep the by-status gauges consistent across a state transition.
    pub fn runner_transition(&self, from: Option<RunnerStatus>, to: Option<RunnerStatus>) {
        if let Some(from) = from {
            self.runners_by_status
                .with_label_values(&[from.as_str()])
                .dec();
        }
        if let Some(to) = to {
            self.runners_by_status
                .with_label_values(&[to.as_str()])
                .inc();
        }
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        self.uptime_seconds
            .set(self.started.elapsed().as_secs() as i64);
        let metric_families = prometheus::default_registry().gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Text-format snapshot, served unauthenticated on the metrics port.
pub async fn serve_metrics(metrics: web::Data<Arc<Metrics>>) -> HttpResponse {
    match metrics.render() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => {
            warn!("metrics encoding failed: {}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_moves_gauge_between_statuses() {
        let metrics = Metrics::new();
        metrics.runner_transition(None, Some(RunnerStatus::Starting));
        metrics.runner_transition(Some(RunnerStatus::Starting), Some(RunnerStatus::Running));

        assert_eq!(
            metrics
                .runners_by_status
                .with_label_values(&["starting"])
                .get(),
            0
        );
        assert_eq!(
            metrics
                .runners_by_status
                .with_label_values(&["running"])
                .get(),
            1
        );

        metrics.runner_transition(Some(RunnerStatus::Running), None);
        assert_eq!(
            metrics
                .runners_by_status
                .with_label_values(&["running"])
                .get(),
            0
        );
    }

    #[test]
    fn render_includes_uptime() {
        let metrics = Metrics::new();
        let body = metrics.render().unwrap();
        assert!(body.contains("daemon_uptime_seconds"));
    }
}
