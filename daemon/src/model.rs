//! Domain entities and their status enums.
//!
//! Row structs mirror the migration schema one-to-one; handlers convert them
//! into response DTOs rather than exposing them directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ProjectStatus {
    Active,
    Idle,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RunnerStatus {
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
    Terminated,
}

impl RunnerStatus {
    /// A live runner has (or is about to have) a supervised child process.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            RunnerStatus::Starting
                | RunnerStatus::Running
                | RunnerStatus::Paused
                | RunnerStatus::Stopping
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunnerStatus::Stopped | RunnerStatus::Failed | RunnerStatus::Terminated
        )
    }

    /// Legal transitions of the supervision state machine.
    pub fn can_transition_to(&self, next: RunnerStatus) -> bool {
        use RunnerStatus::*;
        match (self, next) {
            (Starting, Running) | (Starting, Failed) | (Starting, Stopping) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Stopping) | (Running, Failed) => true,
            (Paused, Stopping) | (Paused, Failed) => true,
            (Stopping, Stopped) | (Stopping, Terminated) | (Stopping, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerStatus::Starting => "starting",
            RunnerStatus::Running => "running",
            RunnerStatus::Paused => "paused",
            RunnerStatus::Stopping => "stopping",
            RunnerStatus::Stopped => "stopped",
            RunnerStatus::Failed => "failed",
            RunnerStatus::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Never,
    OnFailure,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum BudgetScope {
    Global,
    Project,
    Runner,
}

impl BudgetScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetScope::Global => "global",
            BudgetScope::Project => "project",
            BudgetScope::Runner => "runner",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Granularity {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub path: String,
    pub description: String,
    pub status: ProjectStatus,
    pub runner_count: i64,
    pub tokens_total: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ResourceQuota {
    pub project_id: Uuid,
    pub max_concurrent_runners: i32,
    pub max_memory_mb: i64,
    pub max_tokens_per_day: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Runner {
    pub id: Uuid,
    pub project_id: Uuid,
    pub status: RunnerStatus,
    pub pid: Option<i64>,
    pub launched_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub tokens_used: i64,
    pub exit_code: Option<i32>,
    pub restart_policy: RestartPolicy,
    pub agent_version: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: Uuid,
    pub project_id: Uuid,
    pub runner_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message_count: i64,
    pub tokens_total: i64,
    pub transcript_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TokenBudget {
    pub id: Uuid,
    pub scope: BudgetScope,
    pub scope_id: String,
    pub granularity: Granularity,
    pub token_limit: i64,
    pub tokens_used: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TokenBudget {
    pub fn remaining(&self) -> i64 {
        (self.token_limit - self.tokens_used).max(0)
    }

    pub fn percent_used(&self) -> f64 {
        if self.token_limit <= 0 {
            return 0.0;
        }
        (self.tokens_used as f64 / self.token_limit as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_and_terminal_are_disjoint() {
        for status in [
            RunnerStatus::Starting,
            RunnerStatus::Running,
            RunnerStatus::Paused,
            RunnerStatus::Stopping,
            RunnerStatus::Stopped,
            RunnerStatus::Failed,
            RunnerStatus::Terminated,
        ] {
            assert!(
                status.is_live() != status.is_terminal(),
                "{status:?} must be exactly one of live/terminal"
            );
        }
    }

    #[test]
    fn terminal_states_admit_no_transitions() {
        use RunnerStatus::*;
        for terminal in [Stopped, Failed, Terminated] {
            for next in [Starting, Running, Paused, Stopping, Stopped, Failed, Terminated] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn launch_paths_are_legal() {
        use RunnerStatus::*;
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Failed));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopping.can_transition_to(Terminated));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Running));
    }

    #[test]
    fn budget_percent_handles_zero_limit() {
        let budget = TokenBudget {
            id: Uuid::new_v4(),
            scope: BudgetScope::Global,
            scope_id: String::new(),
            granularity: Granularity::Daily,
            token_limit: 0,
            tokens_used: 10,
            period_start: Utc::now(),
            period_end: Utc::now(),
            created_at: Utc::now(),
        };
        assert_eq!(budget.percent_used(), 0.0);
        assert_eq!(budget.remaining(), 0);
    }
}
