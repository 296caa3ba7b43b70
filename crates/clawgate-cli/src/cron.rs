//! `clawgate cron`: inspect and edit the job store without a running gateway.

use chrono::{DateTime, Local};
use clap::{Args, Subcommand};

use clawgate_config::ClawgateConfig;
use clawgate_cron::{CronJob, CronSchedule, CronService};

#[derive(Subcommand)]
pub enum CronCommand {
    /// List scheduled jobs
    List {
        /// Include disabled jobs
        #[arg(short, long)]
        all: bool,
    },
    /// Add a scheduled job
    Add(AddArgs),
    /// Remove a job
    Remove { id: String },
    /// Enable a job
    Enable { id: String },
    /// Disable a job
    Disable { id: String },
}

#[derive(Args)]
pub struct AddArgs {
    /// Job name
    #[arg(short, long)]
    pub name: String,

    /// Message sent to the agent when the job fires
    #[arg(short, long)]
    pub message: String,

    /// Run every N seconds
    #[arg(short, long, conflicts_with = "cron", required_unless_present = "cron")]
    pub every: Option<u64>,

    /// Cron expression, e.g. "0 7 * * *"
    #[arg(short, long)]
    pub cron: Option<String>,

    /// Deliver the answer to a channel
    #[arg(short, long)]
    pub deliver: bool,

    /// Delivery channel
    #[arg(long, default_value = "")]
    pub channel: String,

    /// Delivery recipient
    #[arg(long, default_value = "")]
    pub to: String,
}

impl AddArgs {
    fn schedule(&self) -> CronSchedule {
        match (&self.cron, self.every) {
            (Some(expr), _) => CronSchedule::cron(expr.clone()),
            (None, secs) => CronSchedule::every(secs.unwrap_or_default().saturating_mul(1000)),
        }
    }
}

pub async fn run(command: CronCommand, config: &ClawgateConfig) -> anyhow::Result<()> {
    let store_path = config.cron_store_path()?;
    let service = CronService::open(store_path.clone(), &config.cron)?;
    tracing::debug!(path = %store_path.display(), "Opened cron store");

    match command {
        CronCommand::List { all } => {
            let jobs = service.list_jobs(all).await;
            print!("{}", format_jobs(&jobs));
        }
        CronCommand::Add(args) => {
            let job = service
                .add_job(
                    &args.name,
                    args.schedule(),
                    &args.message,
                    args.deliver,
                    &args.channel,
                    &args.to,
                )
                .await?;
            println!("✓ Added job '{}' ({})", job.name, job.id);
        }
        CronCommand::Remove { id } => {
            if service.remove_job(&id).await {
                println!("✓ Removed job {id}");
            } else {
                println!("✗ Job {id} not found");
            }
        }
        CronCommand::Enable { id } => set_enabled(&service, &id, true).await,
        CronCommand::Disable { id } => set_enabled(&service, &id, false).await,
    }

    Ok(())
}

async fn set_enabled(service: &CronService, id: &str, enabled: bool) {
    match service.enable_job(id, enabled).await {
        Some(job) => {
            let verb = if enabled { "Enabled" } else { "Disabled" };
            println!("✓ {verb} job '{}' ({})", job.name, job.id);
        }
        None => println!("✗ Job {id} not found"),
    }
}

fn format_jobs(jobs: &[CronJob]) -> String {
    if jobs.is_empty() {
        return "No scheduled jobs.\n".to_string();
    }

    let mut out = String::from("\nScheduled Jobs:\n----------------\n");
    for job in jobs {
        out.push_str(&format!("  {} ({})\n", job.name, job.id));
        out.push_str(&format!("    Schedule: {}\n", job.schedule.describe()));
        let status = if job.enabled { "enabled" } else { "disabled" };
        out.push_str(&format!("    Status: {status}\n"));
        if let Some(next) = job.state.next_run_at_ms.and_then(format_local) {
            out.push_str(&format!("    Next run: {next}\n"));
        }
        if let Some(error) = &job.state.last_error {
            out.push_str(&format!("    Last error: {error}\n"));
        }
    }
    out
}

pub(crate) fn format_local(ms: i64) -> Option<String> {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawgate_cron::JobState;

    fn job(enabled: bool, state: JobState) -> CronJob {
        CronJob {
            id: "abc".into(),
            name: "econ:scan_markets".into(),
            schedule: CronSchedule::every(900_000),
            message: "scan markets".into(),
            deliver: false,
            channel: String::new(),
            to: String::new(),
            enabled,
            state,
            created_at_ms: 0,
        }
    }

    #[test]
    fn test_format_empty() {
        assert_eq!(format_jobs(&[]), "No scheduled jobs.\n");
    }

    #[test]
    fn test_format_job_lines() {
        let out = format_jobs(&[job(
            false,
            JobState {
                last_error: Some("feed down".into()),
                ..Default::default()
            },
        )]);
        assert!(out.contains("  econ:scan_markets (abc)\n"));
        assert!(out.contains("    Schedule: every 900s\n"));
        assert!(out.contains("    Status: disabled\n"));
        assert!(out.contains("    Last error: feed down\n"));
        assert!(!out.contains("Next run"));
    }

    #[test]
    fn test_format_next_run() {
        let out = format_jobs(&[job(
            true,
            JobState {
                next_run_at_ms: Some(1_700_000_000_000),
                ..Default::default()
            },
        )]);
        let expected = format_local(1_700_000_000_000).unwrap();
        assert!(out.contains(&format!("    Next run: {expected}\n")));
    }

    #[tokio::test]
    async fn test_add_then_list_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ClawgateConfig::default();
        config.cron.store_path = Some(dir.path().join("jobs.json"));

        let args = AddArgs {
            name: "morning".into(),
            message: "brief me".into(),
            every: None,
            cron: Some("0 7 * * *".into()),
            deliver: true,
            channel: "telegram".into(),
            to: "42".into(),
        };
        assert_eq!(args.schedule(), CronSchedule::cron("0 7 * * *"));
        run(CronCommand::Add(args), &config).await.unwrap();

        let service = CronService::open(config.cron_store_path().unwrap(), &config.cron).unwrap();
        let jobs = service.list_jobs(true).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "morning");
        assert!(jobs[0].deliver);
        assert!(jobs[0].state.next_run_at_ms.is_some());
    }
}
