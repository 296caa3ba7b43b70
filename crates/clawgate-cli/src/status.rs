use std::path::Path;

use clawgate_config::ClawgateConfig;
use clawgate_cron::CronService;

use crate::cron::format_local;

pub async fn run(config: &ClawgateConfig, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config_path = match config_path {
        Some(path) => path.to_path_buf(),
        None => clawgate_config::config_file_path()?,
    };
    let store_path = config.cron_store_path()?;
    let service = CronService::open(store_path.clone(), &config.cron)?;
    let jobs = service.list_jobs(true).await;
    let enabled = jobs.iter().filter(|j| j.enabled).count();
    let next = jobs
        .iter()
        .filter_map(|j| j.state.next_run_at_ms.map(|at| (at, j)))
        .min_by_key(|(at, _)| *at);

    println!("clawgate status");
    println!("===============");
    let found = if config_path.exists() { "" } else { " (not found, using defaults)" };
    println!("Config: {}{found}", config_path.display());
    println!("Workspace: {}", config.workspace_path()?.display());
    println!();
    println!("Agent:");
    println!("  Model: {}", config.agent.model);
    println!("  Max tool iterations: {}", config.agent.max_tool_iterations);
    println!("  Tool timeout: {}s", config.agent.tool_timeout_secs);
    println!("  Provider timeout: {}s", config.agent.provider_timeout_secs);
    println!("Bus queue capacity: {}", config.bus.queue_capacity);
    println!();
    println!("Cron:");
    println!("  Store: {}", store_path.display());
    println!("  Jobs: {} ({enabled} enabled)", jobs.len());
    println!("  Seed jobs in config: {}", config.cron.jobs.len());
    if let Some((at, job)) = next {
        let when = format_local(at).unwrap_or_else(|| at.to_string());
        println!("  Next: {} at {when}", job.name);
    }

    Ok(())
}
