//! clawgate-cron: Scheduled task management.
//!
//! Provides a persistent scheduler for recurring agent tasks, driven either
//! by a fixed interval ("every") or a cron expression, plus the `cron` tool
//! that lets the agent manage jobs itself.

pub mod clock;
pub mod error;
pub mod schedule;
pub mod service;
pub mod store;
pub mod tool;

use serde::{Deserialize, Serialize};

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CronError;
pub use service::{CronService, JobHandler};
pub use store::JobStore;
pub use tool::CronTool;

/// How a job's run times are derived.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Fixed interval, measured from the previous run's start.
    Every,
    /// Cron expression.
    Cron,
}

/// A job schedule. Exactly one of `every_ms` / `expr` is set, matching `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CronSchedule {
    pub kind: ScheduleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expr: Option<String>,
}

impl CronSchedule {
    pub fn every(every_ms: u64) -> Self {
        Self {
            kind: ScheduleKind::Every,
            every_ms: Some(every_ms),
            expr: None,
        }
    }

    pub fn cron(expr: impl Into<String>) -> Self {
        Self {
            kind: ScheduleKind::Cron,
            every_ms: None,
            expr: Some(expr.into()),
        }
    }

    /// Short human-readable form ("every 900s", "0 7 * * *").
    pub fn describe(&self) -> String {
        match (self.kind, self.every_ms, self.expr.as_deref()) {
            (ScheduleKind::Every, Some(ms), _) if ms % 1000 == 0 => format!("every {}s", ms / 1000),
            (ScheduleKind::Every, Some(ms), _) => format!("every {ms}ms"),
            (ScheduleKind::Cron, _, Some(expr)) => expr.to_string(),
            _ => "invalid".to_string(),
        }
    }
}

/// Mutable run-time state of a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    /// Next due time (unix millis). `None` while the job is disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    /// Start time of the most recent run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub run_count: u64,
}

/// A scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    /// Unique job ID (UUID v4), stable across restarts.
    pub id: String,
    /// Human-readable name. Not required to be unique.
    pub name: String,
    pub schedule: CronSchedule,
    /// Message handed to the agent when the job fires.
    pub message: String,
    /// Publish the handler's result to `channel`/`to` after a successful run.
    #[serde(default)]
    pub deliver: bool,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub to: String,
    pub enabled: bool,
    #[serde(default)]
    pub state: JobState,
    pub created_at_ms: i64,
}

impl CronJob {
    /// Whether the job should run at `now_ms`.
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.enabled && self.state.next_run_at_ms.is_some_and(|next| next <= now_ms)
    }

    /// Session key used when the job runs through the agent.
    pub fn session_key(&self) -> String {
        format!("cron:{}", self.id)
    }
}
