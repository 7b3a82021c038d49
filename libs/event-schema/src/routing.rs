//! Routing-key grammar for the topic exchange.
//!
//! Keys follow `<domain>.<verb>.<qualifier>`:
//!
//! - `runner.{started|stopped|failed|heartbeat}.<project>`
//! - `session.{created|resumed|ended}.<project>`
//! - `system.alert.{info|warning|critical}`
//! - `metrics.tokens.<scope>`
//!
//! The qualifier segment is sanitized so project names with dots do not
//! produce extra topic segments.

use crate::AlertSeverity;

/// Replace separator characters so a user-supplied name occupies exactly one
/// routing-key segment.
fn segment(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '.' | '#' | '*' | ' ' => '-',
            _ => c,
        })
        .collect()
}

pub fn runner_started(project: &str) -> String {
    format!("runner.started.{}", segment(project))
}

pub fn runner_stopped(project: &str) -> String {
    format!("runner.stopped.{}", segment(project))
}

pub fn runner_failed(project: &str) -> String {
    format!("runner.failed.{}", segment(project))
}

pub fn runner_heartbeat(project: &str) -> String {
    format!("runner.heartbeat.{}", segment(project))
}

pub fn session_created(project: &str) -> String {
    format!("session.created.{}", segment(project))
}

pub fn session_resumed(project: &str) -> String {
    format!("session.resumed.{}", segment(project))
}

pub fn session_ended(project: &str) -> String {
    format!("session.ended.{}", segment(project))
}

pub fn system_alert(severity: AlertSeverity) -> String {
    format!("system.alert.{}", severity.as_str())
}

// Internal observability keys; not part of the consumer contract.

pub fn project_created(project: &str) -> String {
    format!("project.created.{}", segment(project))
}

pub fn project_archived(project: &str) -> String {
    format!("project.archived.{}", segment(project))
}

pub fn metrics_tokens(scope: &str) -> String {
    format!("metrics.tokens.{}", segment(scope))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_keys_follow_grammar() {
        assert_eq!(runner_started("api"), "runner.started.api");
        assert_eq!(runner_failed("api"), "runner.failed.api");
        assert_eq!(runner_stopped("api"), "runner.stopped.api");
        assert_eq!(runner_heartbeat("api"), "runner.heartbeat.api");
    }

    #[test]
    fn qualifier_is_single_segment() {
        assert_eq!(runner_started("my.project"), "runner.started.my-project");
        assert_eq!(session_ended("a b#c"), "session.ended.a-b-c");
    }

    #[test]
    fn alert_keys_carry_severity() {
        assert_eq!(
            system_alert(AlertSeverity::Critical),
            "system.alert.critical"
        );
        assert_eq!(system_alert(AlertSeverity::Warning), "system.alert.warning");
    }

    #[test]
    fn token_metrics_key() {
        assert_eq!(metrics_tokens("global"), "metrics.tokens.global");
        assert_eq!(metrics_tokens("project:p1"), "metrics.tokens.project:p1");
    }
}
