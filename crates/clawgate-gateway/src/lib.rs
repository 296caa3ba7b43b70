//! clawgate-gateway: wires the bus, tools, agent loop, scheduler and channels.
//!
//! Provides:
//! - `Gateway`: explicit construction of every component from a config and a provider
//! - Scheduler job handler routing due jobs through the agent loop
//! - `ensure_jobs` upsert-by-name seeding of job sets
//! - Channel adapter framework (`ChannelAdapter`, `ChannelManager`, `InboundSink`)
//! - Ordered startup and shutdown in `Gateway::run`

pub mod channel;

use std::sync::Arc;

use anyhow::anyhow;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use clawgate_agent::{AgentLoop, Provider, StartupInfo};
use clawgate_bus::{BusStats, MessageBus};
use clawgate_config::{ClawgateConfig, SeedJob};
use clawgate_cron::{CronError, CronJob, CronSchedule, CronService, CronTool};
use clawgate_tools::ToolRegistry;
use clawgate_tools::builtin::MessageTool;

use channel::{ChannelAdapter, ChannelInfo, ChannelManager};

/// A job to create or replace by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub schedule: CronSchedule,
    pub message: String,
    pub deliver: bool,
    pub channel: String,
    pub to: String,
}

impl TryFrom<&SeedJob> for JobSpec {
    type Error = CronError;

    fn try_from(seed: &SeedJob) -> Result<Self, Self::Error> {
        let schedule = match (seed.every_seconds, seed.cron_expr.as_deref()) {
            (Some(secs), None) => CronSchedule::every(secs.saturating_mul(1000)),
            (None, Some(expr)) => CronSchedule::cron(expr),
            _ => {
                return Err(CronError::Validation(format!(
                    "job '{}' needs exactly one of every_seconds or cron_expr",
                    seed.name
                )));
            }
        };
        Ok(Self {
            name: seed.name.clone(),
            schedule,
            message: seed.message.clone(),
            deliver: seed.deliver,
            channel: seed.channel.clone(),
            to: seed.to.clone(),
        })
    }
}

/// Runtime overview of a gateway.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub agent: StartupInfo,
    pub channels: Vec<ChannelInfo>,
    pub jobs_total: usize,
    pub jobs_enabled: usize,
    pub bus: BusStats,
}

/// The assembled application.
pub struct Gateway {
    config: ClawgateConfig,
    bus: MessageBus,
    agent: Arc<AgentLoop>,
    cron: Arc<CronService>,
    channels: Arc<ChannelManager>,
    /// Cancels agent calls made on behalf of scheduled jobs.
    job_cancel: CancellationToken,
}

impl Gateway {
    /// Build every component and register the built-in tools.
    pub fn new(config: ClawgateConfig, provider: Arc<dyn Provider>) -> anyhow::Result<Self> {
        let bus = MessageBus::new(config.bus.queue_capacity);
        let tools = Arc::new(ToolRegistry::new());
        let agent = Arc::new(AgentLoop::new(
            provider,
            tools,
            bus.clone(),
            config.agent.clone(),
        ));

        let store_path = config.cron_store_path()?;
        let cron = Arc::new(CronService::open(store_path, &config.cron)?.with_bus(bus.clone()));

        agent.register_tool(Arc::new(MessageTool::new(bus.clone())))?;
        agent.register_tool(Arc::new(CronTool::new(cron.clone())))?;

        let job_cancel = CancellationToken::new();
        let weak_agent = Arc::downgrade(&agent);
        let token = job_cancel.clone();
        cron.set_on_job(move |job: CronJob| {
            let agent = weak_agent.upgrade();
            let cancel = token.clone();
            async move {
                let agent = agent.ok_or_else(|| anyhow!("agent loop has shut down"))?;
                let answer = agent
                    .process_direct(&cancel, &job.message, &job.session_key())
                    .await?;
                Ok::<_, anyhow::Error>(answer)
            }
        });

        let channels = Arc::new(ChannelManager::new(bus.clone()));

        info!(
            tools = ?agent.startup_info().tools.names,
            "Gateway assembled"
        );
        Ok(Self {
            config,
            bus,
            agent,
            cron,
            channels,
            job_cancel,
        })
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn agent(&self) -> &Arc<AgentLoop> {
        &self.agent
    }

    pub fn cron(&self) -> &Arc<CronService> {
        &self.cron
    }

    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    pub async fn register_channel(&self, channel: Arc<dyn ChannelAdapter>) {
        self.channels.register(channel).await;
    }

    /// Create each job, first removing any existing jobs with the same name.
    pub async fn ensure_jobs(&self, specs: &[JobSpec]) -> Result<Vec<CronJob>, CronError> {
        let existing = self.cron.list_jobs(true).await;
        let mut replaced = 0;
        let mut jobs = Vec::with_capacity(specs.len());

        for spec in specs {
            for stale in existing.iter().filter(|j| j.name == spec.name) {
                if self.cron.remove_job(&stale.id).await {
                    replaced += 1;
                }
            }
            let job = self
                .cron
                .add_job(
                    &spec.name,
                    spec.schedule.clone(),
                    &spec.message,
                    spec.deliver,
                    &spec.channel,
                    &spec.to,
                )
                .await?;
            jobs.push(job);
        }

        info!(registered = jobs.len(), replaced, "Ensured cron jobs");
        Ok(jobs)
    }

    pub async fn status(&self) -> GatewayStatus {
        let jobs = self.cron.list_jobs(true).await;
        GatewayStatus {
            agent: self.agent.startup_info(),
            channels: self.channels.list_channels().await,
            jobs_total: jobs.len(),
            jobs_enabled: jobs.iter().filter(|j| j.enabled).count(),
            bus: self.bus.stats(),
        }
    }

    /// Run until `cancel` fires.
    ///
    /// Startup: seed jobs, delivery loops, channels, agent loop, scheduler.
    /// Shutdown: scheduler, agent loop, then channels, so answers still in
    /// flight reach their adapter.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let seeds = self
            .config
            .cron
            .jobs
            .iter()
            .map(JobSpec::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        if !seeds.is_empty() {
            self.ensure_jobs(&seeds).await?;
        }

        let delivery_cancel = CancellationToken::new();
        let mut deliveries = self.channels.spawn_delivery_loops(&delivery_cancel).await;
        self.channels.start_all().await;

        let agent = self.agent.clone();
        let agent_task = tokio::spawn(async move { agent.run(CancellationToken::new()).await });
        self.cron.start().await?;
        info!("Gateway running");

        cancel.cancelled().await;
        info!("Gateway shutting down");

        self.job_cancel.cancel();
        self.cron.stop().await;

        self.agent.stop().await;
        if let Err(e) = agent_task.await {
            warn!("Agent loop task ended abnormally: {e}");
        }

        delivery_cancel.cancel();
        while let Some(joined) = deliveries.join_next().await {
            if let Err(e) = joined {
                warn!("Delivery loop ended abnormally: {e}");
            }
        }
        self.channels.stop_all().await;

        info!("Gateway stopped");
        Ok(())
    }
}
