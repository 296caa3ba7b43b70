//! `cron` tool: manage scheduled jobs from inside a conversation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use clawgate_tools::{Tool, ToolContext, ToolError, parse_args};

use crate::error::CronError;
use crate::service::CronService;
use crate::CronSchedule;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum CronAction {
    List {
        #[serde(default)]
        include_disabled: bool,
    },
    Add {
        name: String,
        message: String,
        #[serde(default)]
        every_seconds: Option<u64>,
        #[serde(default)]
        cron_expr: Option<String>,
        #[serde(default)]
        deliver: bool,
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        to: Option<String>,
    },
    Remove {
        job_id: String,
    },
    Enable {
        job_id: String,
    },
    Disable {
        job_id: String,
    },
    Run {
        job_id: String,
    },
}

pub struct CronTool {
    service: Arc<CronService>,
}

impl CronTool {
    pub fn new(service: Arc<CronService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl Tool for CronTool {
    fn name(&self) -> &str {
        "cron"
    }

    fn description(&self) -> &str {
        "Manage scheduled jobs. Actions: list, add, remove, enable, disable, run. \
         A job sends its message to the agent on schedule; with deliver=true the \
         answer is forwarded to the given channel and recipient."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["list", "add", "remove", "enable", "disable", "run"],
                    "description": "The action to perform."
                },
                "include_disabled": {
                    "type": "boolean",
                    "description": "Include disabled jobs (for list)."
                },
                "name": {
                    "type": "string",
                    "description": "Job name (for add)."
                },
                "message": {
                    "type": "string",
                    "description": "Instruction sent to the agent when the job fires (for add)."
                },
                "every_seconds": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Run every N seconds (for add; exclusive with cron_expr)."
                },
                "cron_expr": {
                    "type": "string",
                    "description": "Cron expression, e.g. '0 7 * * *' (for add; exclusive with every_seconds)."
                },
                "deliver": {
                    "type": "boolean",
                    "description": "Forward the job's answer to a channel (for add)."
                },
                "channel": {
                    "type": "string",
                    "description": "Delivery channel (for add; defaults to the current one)."
                },
                "to": {
                    "type": "string",
                    "description": "Delivery recipient (for add; defaults to the current sender)."
                },
                "job_id": {
                    "type": "string",
                    "description": "Job ID (for remove/enable/disable/run)."
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(
        &self,
        ctx: &ToolContext,
        args: Map<String, Value>,
    ) -> Result<String, ToolError> {
        match parse_args::<CronAction>(args)? {
            CronAction::List { include_disabled } => {
                let jobs = self.service.list_jobs(include_disabled).await;
                to_json(&jobs)
            }
            CronAction::Add {
                name,
                message,
                every_seconds,
                cron_expr,
                deliver,
                channel,
                to,
            } => {
                let schedule = match (every_seconds, cron_expr) {
                    (Some(secs), None) => CronSchedule::every(secs.saturating_mul(1000)),
                    (None, Some(expr)) => CronSchedule::cron(expr),
                    _ => {
                        return Err(ToolError::InvalidArguments(
                            "exactly one of every_seconds or cron_expr is required".into(),
                        ));
                    }
                };
                let channel = channel.unwrap_or_else(|| ctx.channel.clone());
                let to = to.unwrap_or_else(|| ctx.sender.clone());
                let job = self
                    .service
                    .add_job(&name, schedule, &message, deliver, &channel, &to)
                    .await
                    .map_err(tool_error)?;
                to_json(&job)
            }
            CronAction::Remove { job_id } => {
                if self.service.remove_job(&job_id).await {
                    Ok(format!("Removed job {job_id}"))
                } else {
                    Err(tool_error(CronError::NotFound(job_id)))
                }
            }
            CronAction::Enable { job_id } => self.set_enabled(job_id, true).await,
            CronAction::Disable { job_id } => self.set_enabled(job_id, false).await,
            CronAction::Run { job_id } => {
                let job = self
                    .service
                    .run_job_now(&job_id)
                    .await
                    .map_err(tool_error)?;
                to_json(&job)
            }
        }
    }
}

impl CronTool {
    async fn set_enabled(&self, job_id: String, enabled: bool) -> Result<String, ToolError> {
        match self.service.enable_job(&job_id, enabled).await {
            Some(job) => to_json(&job),
            None => Err(tool_error(CronError::NotFound(job_id))),
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, ToolError> {
    serde_json::to_string_pretty(value).map_err(|e| ToolError::Execution(e.to_string()))
}

fn tool_error(e: CronError) -> ToolError {
    match e {
        CronError::Validation(_) | CronError::InvalidSchedule { .. } => {
            ToolError::InvalidArguments(e.to_string())
        }
        other => ToolError::Execution(other.to_string()),
    }
}
