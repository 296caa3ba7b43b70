//! The agent loop: tool-calling conversation state machine plus the bus consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use clawgate_bus::{MessageBus, TopicFilter, delivery_topic};
use clawgate_config::AgentSettings;
use clawgate_tools::{RegistryError, Tool, ToolContext, ToolError, ToolRegistry};
use clawgate_types::{Envelope, ToolCall, Turn};

use crate::error::AgentError;
use crate::lane::{CloseOnExit, Lane, Pushed};
use crate::provider::{Completion, CompletionRequest, Provider, ProviderError};
use crate::session::{Session, SessionManager};

/// How long cancelled lanes get to unwind before they are aborted.
const CANCEL_SETTLE: Duration = Duration::from_millis(200);

/// Diagnostic snapshot returned by [`AgentLoop::startup_info`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StartupInfo {
    pub tools: ToolsInfo,
    pub skills: SkillsInfo,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ToolsInfo {
    pub count: usize,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SkillsInfo {
    pub total: usize,
    pub available: usize,
}

/// Where a processing call came from.
#[derive(Debug, Clone, Copy, Default)]
struct Origin<'a> {
    channel: &'a str,
    sender: &'a str,
}

/// Drives tool-augmented conversations against a [`Provider`].
///
/// Each session key is processed by at most one call at a time; direct calls
/// and bus-driven calls share the same per-session lock.
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    bus: MessageBus,
    sessions: SessionManager,
    settings: AgentSettings,
    skills_total: AtomicUsize,
    skills_available: AtomicUsize,
    /// Replaced by each `run`, cancelled by `stop`.
    shutdown: StdMutex<CancellationToken>,
    running: watch::Sender<bool>,
    dropped_inbound: AtomicU64,
    active_lanes: AtomicUsize,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        bus: MessageBus,
        settings: AgentSettings,
    ) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            provider,
            tools,
            bus,
            sessions: SessionManager::new(),
            settings,
            skills_total: AtomicUsize::new(0),
            skills_available: AtomicUsize::new(0),
            shutdown: StdMutex::new(CancellationToken::new()),
            running,
            dropped_inbound: AtomicU64::new(0),
            active_lanes: AtomicUsize::new(0),
        }
    }

    /// Register a tool. Intended for startup wiring, before `run`.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        if *self.running.borrow() {
            warn!(tool = tool.name(), "Registering tool while the agent loop is running");
        }
        self.tools.register(tool).map_err(|e| match e {
            RegistryError::Duplicate(name) => AgentError::DuplicateTool(name),
        })
    }

    /// Record skill availability for startup diagnostics.
    pub fn set_skill_counts(&self, total: usize, available: usize) {
        self.skills_total.store(total, Ordering::Relaxed);
        self.skills_available.store(available, Ordering::Relaxed);
    }

    /// Read-only diagnostic snapshot.
    pub fn startup_info(&self) -> StartupInfo {
        let names = self.tools.names();
        StartupInfo {
            tools: ToolsInfo {
                count: names.len(),
                names,
            },
            skills: SkillsInfo {
                total: self.skills_total.load(Ordering::Relaxed),
                available: self.skills_available.load(Ordering::Relaxed),
            },
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Inbound envelopes discarded because their session lane was full.
    pub fn dropped_inbound(&self) -> u64 {
        self.dropped_inbound.load(Ordering::Relaxed)
    }

    /// Session lanes currently open in [`run`](Self::run).
    pub fn active_lanes(&self) -> usize {
        self.active_lanes.load(Ordering::Relaxed)
    }

    /// Process one message synchronously for `session_key`.
    ///
    /// Waits for the session's lock, runs the conversation until a final answer,
    /// a call-fatal error, or the iteration cap, then releases the lock.
    pub async fn process_direct(
        &self,
        cancel: &CancellationToken,
        message: &str,
        session_key: &str,
    ) -> Result<String, AgentError> {
        self.process(cancel, message, session_key, Origin::default())
            .await
    }

    async fn process(
        &self,
        cancel: &CancellationToken,
        message: &str,
        session_key: &str,
        origin: Origin<'_>,
    ) -> Result<String, AgentError> {
        let handle = self.sessions.get_or_create(session_key).await;
        let mut session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            guard = handle.lock_owned() => guard,
        };

        let checkpoint = session.history.len();
        session.history.push(Turn::user(message));
        session.touch();

        let ctx = ToolContext::new(session_key, cancel.clone()).with_origin(origin.channel, origin.sender);
        let outcome = self.converse(cancel, &mut session, &ctx).await;

        // Call-fatal outcomes leave no trace, so the history stays a sequence of whole calls.
        if matches!(outcome, Err(AgentError::Provider(_) | AgentError::Cancelled)) {
            session.history.truncate(checkpoint);
        }
        session.touch();
        outcome
    }

    async fn converse(
        &self,
        cancel: &CancellationToken,
        session: &mut Session,
        ctx: &ToolContext,
    ) -> Result<String, AgentError> {
        let schemas = self.tools.schemas();
        let max_iterations = self.settings.max_tool_iterations.max(1);
        let mut last_content: Option<String> = None;

        for iteration in 1..=max_iterations {
            debug!(
                session = %session.key,
                iteration,
                max_iterations,
                "Awaiting provider"
            );
            let request = CompletionRequest {
                model: &self.settings.model,
                system_prompt: self.settings.system_prompt.as_deref(),
                turns: &session.history,
                tools: &schemas,
            };
            let completion = self.call_provider(cancel, request).await?;

            let (content, calls) = match completion {
                Completion::ToolCalls { content, calls } if !calls.is_empty() => (content, calls),
                Completion::ToolCalls { content: text, .. } | Completion::Final(text) => {
                    session.history.push(Turn::assistant(text.clone()));
                    info!(session = %session.key, iteration, "Final answer");
                    return Ok(text);
                }
            };

            if !content.trim().is_empty() {
                last_content = Some(content.clone());
            }
            session
                .history
                .push(Turn::assistant_with_calls(content, calls.clone()));

            for call in &calls {
                let turn = self.execute_tool(cancel, call, ctx).await?;
                session.history.push(turn);
            }
        }

        warn!(
            session = %session.key,
            max_iterations,
            "Tool iteration limit reached without a final answer"
        );
        Err(AgentError::IterationLimitExceeded {
            iterations: max_iterations,
            last_content,
        })
    }

    async fn call_provider(
        &self,
        cancel: &CancellationToken,
        request: CompletionRequest<'_>,
    ) -> Result<Completion, AgentError> {
        let timeout = self.settings.provider_timeout();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            result = tokio::time::timeout(timeout, self.provider.complete(request, cancel.child_token())) => result,
        };
        match result {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(ProviderError::Cancelled)) => Err(AgentError::Cancelled),
            Ok(Err(e)) => {
                warn!(provider = self.provider.name(), "Provider call failed: {e}");
                Err(AgentError::Provider(e))
            }
            Err(_) => {
                warn!(provider = self.provider.name(), ?timeout, "Provider call timed out");
                Err(AgentError::Provider(ProviderError::Timeout(timeout)))
            }
        }
    }

    /// Run one tool call. Only cancellation is an error; every tool failure
    /// becomes an observed tool turn.
    async fn execute_tool(
        &self,
        cancel: &CancellationToken,
        call: &ToolCall,
        ctx: &ToolContext,
    ) -> Result<Turn, AgentError> {
        let Some(tool) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, "Provider requested an unknown tool");
            return Ok(error_turn(call, ToolError::NotFound(call.name.clone())));
        };

        let args = match &call.arguments {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Ok(error_turn(
                    call,
                    ToolError::InvalidArguments(format!("expected a JSON object, got {other}")),
                ));
            }
        };

        let timeout = self.settings.tool_timeout();
        let call_ctx = ToolContext {
            cancel: cancel.child_token(),
            ..ctx.clone()
        };
        debug!(tool = %call.name, session = %ctx.session_key, "Executing tool");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            result = tokio::time::timeout(timeout, tool.execute(&call_ctx, args)) => {
                result.unwrap_or(Err(ToolError::Timeout(timeout)))
            }
        };
        call_ctx.cancel.cancel();

        match result {
            Ok(output) => Ok(Turn::tool(call, output, false)),
            Err(ToolError::Cancelled) if cancel.is_cancelled() => Err(AgentError::Cancelled),
            Err(e) => {
                warn!(tool = %call.name, session = %ctx.session_key, "Tool failed: {e}");
                Ok(error_turn(call, e))
            }
        }
    }

    /// Consume inbound envelopes from the bus until `cancel` fires or [`stop`](Self::stop)
    /// is called.
    ///
    /// Envelopes for one session are handled in arrival order by a per-session lane;
    /// different sessions proceed concurrently. A lane holds at most the bus queue
    /// capacity and drops its oldest envelope when full; it closes once drained.
    /// On shutdown, in-flight work gets the configured grace period before it is
    /// cancelled. The loop can be started again after it stops.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) {
        let mut inbound = self.bus.subscribe(TopicFilter::Inbound);
        let shutdown = {
            let mut slot = self.shutdown.lock().unwrap_or_else(|e| e.into_inner());
            if self.running.send_replace(true) {
                warn!("Agent loop already running");
                return;
            }
            *slot = CancellationToken::new();
            slot.clone()
        };

        let work = CancellationToken::new();
        let stopping = CancellationToken::new();
        let mut lanes: HashMap<String, Arc<Lane>> = HashMap::new();
        let mut tasks = JoinSet::new();

        info!("Agent loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = shutdown.cancelled() => break,
                envelope = inbound.recv() => {
                    let Some(envelope) = envelope else {
                        info!("Bus closed, agent loop exiting");
                        break;
                    };
                    self.route(envelope, &mut lanes, &mut tasks, &work, &stopping);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Session lane ended abnormally: {e}");
                    }
                    self.prune_lanes(&mut lanes);
                }
            }
        }

        drop(inbound);
        stopping.cancel();
        drop(lanes);

        let grace = self.settings.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(?grace, "In-flight sessions did not finish in time, cancelling");
            work.cancel();
            // Cancelled calls roll back their history; abort only what ignores the token.
            let unwound = tokio::time::timeout(CANCEL_SETTLE, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if unwound.is_err() {
                tasks.shutdown().await;
            }
        }
        self.active_lanes.store(0, Ordering::Relaxed);

        self.running.send_replace(false);
        info!("Agent loop stopped");
    }

    /// Request shutdown and wait until `run` has exited or the grace period elapsed.
    pub async fn stop(&self) {
        info!("Stopping agent loop");
        self.shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        let mut running = self.running.subscribe();
        let wait = self.settings.shutdown_grace() + Duration::from_secs(1);
        if tokio::time::timeout(wait, running.wait_for(|r| !*r))
            .await
            .is_err()
        {
            warn!("Agent loop did not stop within the grace period");
        }
    }

    fn route(
        self: &Arc<Self>,
        envelope: Envelope,
        lanes: &mut HashMap<String, Arc<Lane>>,
        tasks: &mut JoinSet<()>,
        work: &CancellationToken,
        stopping: &CancellationToken,
    ) {
        let key = envelope.session_key.clone();
        let envelope = match lanes.get(&key) {
            Some(lane) => match lane.push(envelope) {
                Pushed::Queued => return,
                Pushed::Displaced(lost) => {
                    self.dropped_inbound.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        session = %key,
                        lost_envelope = %lost.id,
                        "Session lane full, dropped oldest envelope"
                    );
                    return;
                }
                Pushed::Closed(envelope) => envelope,
            },
            None => envelope,
        };

        let lane = Arc::new(Lane::new(self.bus.capacity(), envelope));
        lanes.insert(key.clone(), lane.clone());
        self.active_lanes.store(lanes.len(), Ordering::Relaxed);

        let agent = self.clone();
        let work = work.clone();
        let stopping = stopping.clone();
        tasks.spawn(async move { agent.drain_lane(key, lane, work, stopping).await });
    }

    fn prune_lanes(&self, lanes: &mut HashMap<String, Arc<Lane>>) {
        lanes.retain(|_, lane| !lane.is_closed());
        self.active_lanes.store(lanes.len(), Ordering::Relaxed);
    }

    async fn drain_lane(
        self: Arc<Self>,
        session_key: String,
        lane: Arc<Lane>,
        work: CancellationToken,
        stopping: CancellationToken,
    ) {
        let _close = CloseOnExit(lane.clone());
        debug!(session = %session_key, "Session lane opened");
        while let Some(envelope) = lane.pop() {
            if stopping.is_cancelled() {
                debug!(session = %session_key, envelope_id = %envelope.id, "Shutting down, skipping queued envelope");
                continue;
            }
            self.handle_inbound(envelope, &work).await;
        }
        debug!(session = %session_key, "Session lane drained");
    }

    async fn handle_inbound(&self, envelope: Envelope, work: &CancellationToken) {
        info!(
            channel = %envelope.channel,
            sender = %envelope.sender,
            session = %envelope.session_key,
            "Processing inbound message"
        );

        let origin = Origin {
            channel: &envelope.channel,
            sender: &envelope.sender,
        };
        let cancel = work.child_token();
        let text = match self
            .process(&cancel, &envelope.text, &envelope.session_key, origin)
            .await
        {
            Ok(text) => text,
            Err(AgentError::Cancelled) => {
                debug!(session = %envelope.session_key, "Processing cancelled");
                return;
            }
            Err(e) => {
                warn!(session = %envelope.session_key, "Agent error: {e}");
                e.user_message()
            }
        };

        if text.trim().is_empty() {
            debug!(session = %envelope.session_key, "Empty answer, nothing to deliver");
            return;
        }

        let reply = envelope.reply(text);
        if self.bus.publish(&delivery_topic(&envelope.channel), reply) == 0 {
            warn!(channel = %envelope.channel, "No adapter subscribed for reply delivery");
        }
    }
}

fn error_turn(call: &ToolCall, error: ToolError) -> Turn {
    Turn::tool(call, format!("Error: {error}"), true)
}
