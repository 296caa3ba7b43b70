//! Channel adapter framework for external platform integrations.
//!
//! # Architecture
//!
//! ```text
//! External Platform
//!     ↓ (platform-specific protocol)
//! ChannelAdapter::start() spawns listener
//!     ↓ InboundSink::publish (topic = session key)
//! MessageBus → AgentLoop
//!     ↓ (answer on deliver:<channel>)
//! ChannelManager delivery loop
//!     ↓ ChannelAdapter::send(envelope)
//! External Platform
//! ```
//!
//! # Implementing a Channel
//!
//! ```rust,ignore
//! use clawgate_gateway::channel::{ChannelAdapter, ChannelStatus, InboundSink};
//!
//! struct TelegramChannel { /* ... */ }
//!
//! #[async_trait::async_trait]
//! impl ChannelAdapter for TelegramChannel {
//!     fn channel_type(&self) -> &str { "telegram" }
//!     async fn start(&self, sink: InboundSink) -> anyhow::Result<()> { /* ... */ }
//!     async fn stop(&self) -> anyhow::Result<()> { /* ... */ }
//!     async fn send(&self, envelope: &Envelope) -> anyhow::Result<()> { /* ... */ }
//!     fn status(&self) -> ChannelStatus { /* ... */ }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use clawgate_bus::{MessageBus, TopicFilter};
use clawgate_types::{Envelope, session_key_for};

/// Lifecycle state of a channel adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Stopped,
    Starting,
    Running,
    Error(String),
}

/// A registered channel and its status.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub channel_type: String,
    pub status: ChannelStatus,
}

/// Handed to an adapter on start; publishes what users send to the agent.
#[derive(Clone)]
pub struct InboundSink {
    channel: String,
    bus: MessageBus,
}

impl InboundSink {
    pub fn new(channel: impl Into<String>, bus: MessageBus) -> Self {
        Self {
            channel: channel.into(),
            bus,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publish `text` from `sender` in conversation `chat_id`.
    ///
    /// The session key, and therefore the topic, is `<channel>:<chat_id>`.
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, sender: &str, chat_id: &str, text: &str) -> usize {
        let session_key = session_key_for(&self.channel, chat_id);
        let envelope = Envelope::inbound(self.channel.clone(), sender, session_key.clone(), text);
        let routed = self.bus.publish(&session_key, envelope);
        if routed == 0 {
            warn!(channel = %self.channel, session = %session_key, "Inbound message not consumed");
        }
        routed
    }
}

/// Trait for adapters that bridge an external platform to the bus.
///
/// Use `&self` for all methods; implementations keep mutable state behind
/// interior mutability.
#[async_trait::async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel type identifier (e.g. "telegram", "discord"). Unique per manager.
    fn channel_type(&self) -> &str;

    /// Connect to the platform. Incoming messages go to `sink`.
    async fn start(&self, sink: InboundSink) -> anyhow::Result<()>;

    /// Disconnect from the platform.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Deliver an outbound envelope to `envelope.recipient`.
    async fn send(&self, envelope: &Envelope) -> anyhow::Result<()>;

    fn status(&self) -> ChannelStatus;
}

/// Owns the channel adapters and pumps delivery topics into them.
pub struct ChannelManager {
    bus: MessageBus,
    channels: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
}

impl ChannelManager {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            bus,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Register an adapter. Replaces any existing adapter of the same type.
    pub async fn register(&self, channel: Arc<dyn ChannelAdapter>) {
        let channel_type = channel.channel_type().to_string();
        info!(channel = %channel_type, "Registering channel adapter");
        self.channels.write().await.insert(channel_type, channel);
    }

    /// Unregister an adapter, stopping it if running.
    pub async fn unregister(&self, channel_type: &str) -> bool {
        let Some(channel) = self.channels.write().await.remove(channel_type) else {
            return false;
        };
        if channel.status() == ChannelStatus::Running {
            if let Err(e) = channel.stop().await {
                warn!(channel = %channel_type, "Failed to stop channel during unregister: {e}");
            }
        }
        true
    }

    pub async fn start_channel(&self, channel_type: &str) -> anyhow::Result<()> {
        let channel = self.get(channel_type).await?;
        channel
            .start(InboundSink::new(channel_type, self.bus.clone()))
            .await
    }

    pub async fn stop_channel(&self, channel_type: &str) -> anyhow::Result<()> {
        self.get(channel_type).await?.stop().await
    }

    /// Start all registered channels. Failures are logged per channel.
    pub async fn start_all(&self) {
        let channels = self.channels.read().await;
        for (channel_type, channel) in channels.iter() {
            let sink = InboundSink::new(channel_type.clone(), self.bus.clone());
            if let Err(e) = channel.start(sink).await {
                warn!(channel = %channel_type, "Failed to start channel: {e}");
            }
        }
    }

    pub async fn stop_all(&self) {
        let channels = self.channels.read().await;
        for (channel_type, channel) in channels.iter() {
            if let Err(e) = channel.stop().await {
                warn!(channel = %channel_type, "Failed to stop channel: {e}");
            }
        }
    }

    /// Send an envelope through the adapter named by `envelope.channel`.
    pub async fn send(&self, envelope: &Envelope) -> anyhow::Result<()> {
        self.get(&envelope.channel).await?.send(envelope).await
    }

    /// Registered channels sorted by type.
    pub async fn list_channels(&self) -> Vec<ChannelInfo> {
        let channels = self.channels.read().await;
        let mut list: Vec<ChannelInfo> = channels
            .iter()
            .map(|(channel_type, ch)| ChannelInfo {
                channel_type: channel_type.clone(),
                status: ch.status(),
            })
            .collect();
        list.sort_by(|a, b| a.channel_type.cmp(&b.channel_type));
        list
    }

    pub async fn channel_status(&self, channel_type: &str) -> Option<ChannelStatus> {
        self.channels
            .read()
            .await
            .get(channel_type)
            .map(|ch| ch.status())
    }

    async fn get(&self, channel_type: &str) -> anyhow::Result<Arc<dyn ChannelAdapter>> {
        self.channels
            .read()
            .await
            .get(channel_type)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Channel not found: {channel_type}"))
    }

    /// Subscribe to every registered channel's delivery topic and spawn one
    /// delivery loop per channel. Subscriptions exist when this returns.
    pub async fn spawn_delivery_loops(&self, cancel: &CancellationToken) -> JoinSet<()> {
        let channels = self.channels.read().await;
        let mut loops = JoinSet::new();
        for (channel_type, channel) in channels.iter() {
            let subscription = self
                .bus
                .subscribe(TopicFilter::Delivery(channel_type.clone()));
            let channel = channel.clone();
            let channel_type = channel_type.clone();
            let cancel = cancel.clone();

            loops.spawn(async move {
                let mut subscription = subscription;
                debug!(channel = %channel_type, "Delivery loop started");
                loop {
                    let envelope = tokio::select! {
                        _ = cancel.cancelled() => break,
                        envelope = subscription.recv() => match envelope {
                            Some(envelope) => envelope,
                            None => break,
                        },
                    };
                    if let Err(e) = channel.send(&envelope).await {
                        warn!(
                            channel = %channel_type,
                            recipient = %envelope.recipient,
                            "Failed to deliver message: {e}"
                        );
                    }
                }
                debug!(channel = %channel_type, "Delivery loop stopped");
            });
        }
        loops
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use clawgate_bus::delivery_topic;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// A mock channel adapter for testing.
    pub(crate) struct MockChannel {
        channel_type: String,
        state: AtomicU8, // 0=stopped, 1=starting, 2=running
        pub(crate) sink: StdMutex<Option<InboundSink>>,
        pub(crate) sent: tokio::sync::Mutex<Vec<Envelope>>,
        pub(crate) sent_notify: Notify,
    }

    impl MockChannel {
        pub(crate) fn new(channel_type: &str) -> Self {
            Self {
                channel_type: channel_type.to_string(),
                state: AtomicU8::new(0),
                sink: StdMutex::new(None),
                sent: tokio::sync::Mutex::new(Vec::new()),
                sent_notify: Notify::new(),
            }
        }

        pub(crate) fn sink(&self) -> InboundSink {
            self.sink.lock().unwrap().clone().unwrap()
        }

        /// Wait until at least `n` envelopes were sent.
        pub(crate) async fn wait_sent(&self, n: usize) -> Vec<Envelope> {
            tokio::time::timeout(Duration::from_secs(2), async {
                loop {
                    let notified = self.sent_notify.notified();
                    {
                        let sent = self.sent.lock().await;
                        if sent.len() >= n {
                            return sent.clone();
                        }
                    }
                    notified.await;
                }
            })
            .await
            .unwrap()
        }
    }

    #[async_trait::async_trait]
    impl ChannelAdapter for MockChannel {
        fn channel_type(&self) -> &str {
            &self.channel_type
        }

        async fn start(&self, sink: InboundSink) -> anyhow::Result<()> {
            *self.sink.lock().unwrap() = Some(sink);
            self.state.store(2, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            self.state.store(0, Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, envelope: &Envelope) -> anyhow::Result<()> {
            self.sent.lock().await.push(envelope.clone());
            self.sent_notify.notify_waiters();
            Ok(())
        }

        fn status(&self) -> ChannelStatus {
            match self.state.load(Ordering::SeqCst) {
                0 => ChannelStatus::Stopped,
                1 => ChannelStatus::Starting,
                2 => ChannelStatus::Running,
                _ => ChannelStatus::Error("unknown".into()),
            }
        }
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let mgr = ChannelManager::new(MessageBus::new(16));
        assert!(mgr.list_channels().await.is_empty());

        mgr.register(Arc::new(MockChannel::new("telegram"))).await;
        mgr.register(Arc::new(MockChannel::new("discord"))).await;

        let list = mgr.list_channels().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].channel_type, "discord");
        assert_eq!(list[1].status, ChannelStatus::Stopped);
    }

    #[tokio::test]
    async fn test_start_stop_channel() {
        let mgr = ChannelManager::new(MessageBus::new(16));
        let ch = Arc::new(MockChannel::new("telegram"));
        mgr.register(ch.clone()).await;

        mgr.start_channel("telegram").await.unwrap();
        assert_eq!(
            mgr.channel_status("telegram").await,
            Some(ChannelStatus::Running)
        );
        assert_eq!(ch.sink().channel(), "telegram");

        mgr.stop_channel("telegram").await.unwrap();
        assert_eq!(
            mgr.channel_status("telegram").await,
            Some(ChannelStatus::Stopped)
        );
        assert!(mgr.start_channel("nonexistent").await.is_err());
    }

    #[tokio::test]
    async fn test_unregister() {
        let mgr = ChannelManager::new(MessageBus::new(16));
        mgr.register(Arc::new(MockChannel::new("telegram"))).await;
        mgr.start_all().await;

        assert!(mgr.unregister("telegram").await);
        assert!(!mgr.unregister("telegram").await);
        assert!(mgr.list_channels().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_routes_by_channel() {
        let mgr = ChannelManager::new(MessageBus::new(16));
        let ch = Arc::new(MockChannel::new("telegram"));
        mgr.register(ch.clone()).await;

        mgr.send(&Envelope::outbound("telegram", "user-1", "telegram:user-1", "Hello!"))
            .await
            .unwrap();
        assert_eq!(ch.sent.lock().await[0].text, "Hello!");

        let err = mgr
            .send(&Envelope::outbound("slack", "user-1", "slack:user-1", "Hello!"))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_inbound_sink_uses_session_topic() {
        let bus = MessageBus::new(16);
        let mut inbound = bus.subscribe(TopicFilter::Topic("telegram:chat-9".into()));
        let sink = InboundSink::new("telegram", bus);

        assert_eq!(sink.publish("user-1", "chat-9", "hi"), 1);
        let envelope = inbound.try_recv().unwrap();
        assert_eq!(envelope.sender, "user-1");
        assert_eq!(envelope.session_key, "telegram:chat-9");
    }

    #[tokio::test]
    async fn test_delivery_loop_routes_only_own_channel() {
        let bus = MessageBus::new(16);
        let mgr = Arc::new(ChannelManager::new(bus.clone()));
        let telegram = Arc::new(MockChannel::new("telegram"));
        let discord = Arc::new(MockChannel::new("discord"));
        mgr.register(telegram.clone()).await;
        mgr.register(discord.clone()).await;

        let cancel = CancellationToken::new();
        let mut loops = mgr.spawn_delivery_loops(&cancel).await;

        bus.publish(
            &delivery_topic("telegram"),
            Envelope::outbound("telegram", "42", "cron:abc", "daily outlook"),
        );
        let sent = telegram.wait_sent(1).await;
        assert_eq!(sent[0].recipient, "42");
        assert!(discord.sent.lock().await.is_empty());

        cancel.cancel();
        while loops.join_next().await.is_some() {}
    }
}
