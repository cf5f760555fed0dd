//! In-process message bus (§6.2).
//!
//! The core only needs `send`; this module also ships a default in-process
//! fan-out implementation, built the way the reference workspace's
//! `websocket::broadcast::BroadcastManager` builds its topic -> subscriber
//! registry, so the crate is usable standalone. Out-of-process adapters
//! (Redis, a real broker) implement the same trait.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

/// A message delivered on the bus, carrying the routing envelope alongside
/// the caller's JSON payload.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: serde_json::Value,
    pub sender_id: String,
    pub target: Option<String>,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BusError(pub String);

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message bus error: {}", self.0)
    }
}

impl std::error::Error for BusError {}

/// Abstract message bus contract (§6.2). `target` is retained for interface
/// completeness (§9 Open Questions) but the Progress Monitor always passes
/// `None` and relies on `broadcast = true`.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Send `payload` on `channel`. Returns the number of subscribers the
    /// message was delivered to.
    async fn send(
        &self,
        channel: &str,
        payload: serde_json::Value,
        sender_id: &str,
        target: Option<&str>,
        correlation_id: Option<&str>,
        broadcast: bool,
    ) -> Result<usize, BusError>;

    /// Subscribe to a channel. Only messages sent after this call are
    /// delivered — there is no replay of prior events.
    fn subscribe(&self, channel: &str) -> Subscription;
}

/// Serialize `event` and send it in one step.
pub async fn send_event<T: Serialize>(
    bus: &dyn MessageBus,
    channel: &str,
    event: &T,
    sender_id: &str,
) -> Result<usize, BusError> {
    let payload = serde_json::to_value(event).map_err(|e| BusError(e.to_string()))?;
    bus.send(channel, payload, sender_id, None, None, true).await
}

/// Default in-process implementation: a per-channel fan-out registry, the
/// same shape as `websocket::broadcast::BroadcastManager` but keyed by
/// channel name instead of connection id.
#[derive(Default)]
pub struct LocalMessageBus {
    subscribers: DashMap<String, Vec<(Uuid, UnboundedSender<BusMessage>)>>,
}

impl LocalMessageBus {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }
}

#[async_trait]
impl MessageBus for LocalMessageBus {
    async fn send(
        &self,
        channel: &str,
        payload: serde_json::Value,
        sender_id: &str,
        target: Option<&str>,
        correlation_id: Option<&str>,
        broadcast: bool,
    ) -> Result<usize, BusError> {
        let message = BusMessage {
            channel: channel.to_string(),
            payload,
            sender_id: sender_id.to_string(),
            target: target.map(|t| t.to_string()),
            correlation_id: correlation_id.map(|c| c.to_string()),
        };

        let mut delivered = 0usize;
        if let Some(mut subs) = self.subscribers.get_mut(channel) {
            subs.retain(|(_, tx)| tx.send(message.clone()).is_ok());
            delivered = subs.len();
            if !broadcast && delivered > 1 {
                // Non-broadcast sends still fan out in this in-process
                // implementation; there is only one channel of subscribers
                // to choose from, so `target` filtering (if any) happened
                // upstream. `broadcast` is kept for interface parity.
            }
        }

        debug!(channel, sender_id, delivered, "bus message sent");
        Ok(delivered)
    }

    fn subscribe(&self, channel: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.subscribers
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));

        Subscription {
            id,
            channel: channel.to_string(),
            receiver: rx,
        }
    }
}

/// A handle returned by `subscribe`. Dropping it does not proactively
/// unregister the sender half; dead senders are pruned lazily on the next
/// `send` to that channel.
pub struct Subscription {
    #[allow(dead_code)]
    id: Uuid,
    channel: String,
    receiver: UnboundedReceiver<BusMessage>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.receiver.try_recv().ok()
    }
}

/// Construct a bus shared between the worker pool, progress monitor, and any
/// external subscribers.
pub fn shared_local_bus() -> Arc<dyn MessageBus> {
    Arc::new(LocalMessageBus::new())
}
