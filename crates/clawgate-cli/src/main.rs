mod cron;
mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use clawgate_config::ClawgateConfig;

#[derive(Parser)]
#[command(name = "clawgate", about = "Agent gateway with scheduled jobs")]
struct Cli {
    /// Config file (defaults to ~/.clawgate/config.json5)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage scheduled jobs
    Cron {
        #[command(subcommand)]
        command: cron::CronCommand,
    },
    /// Show configuration and job store status
    Status,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ClawgateConfig> {
    let config = match path {
        Some(path) => clawgate_config::load_config_from(path)?,
        None => clawgate_config::load_config()?,
    };
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Cron { command } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cron::run(command, &config))?;
        }
        Commands::Status => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(status::run(&config, cli.config.as_deref()))?;
        }
    }

    Ok(())
}
