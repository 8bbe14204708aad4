//! Publish/subscribe channel for captured commands.
//!
//! The capture side and the tutor side share nothing but a channel name.
//! [`CommandPublisher`] serializes each [`CapturedCommand`] to JSON and
//! publishes it; [`CommandStream`] decodes them on the other end and keeps
//! only the events for its own session.
//!
//! Delivery is at-most-once. An event published while nobody is subscribed
//! is gone.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use prism_capture::CapturedCommand;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc, Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::store::connection_url;
use crate::{Result, StoreError, METADATA_DB};

/// Channel name used when none is configured.
pub const DEFAULT_CHANNEL: &str = "prism:commands";

/// Buffered messages per subscription before old ones are dropped.
const SUBSCRIPTION_CAPACITY: usize = 256;

/// A named pub/sub transport carrying raw string payloads.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Publishes `payload` on `channel`, returning how many subscribers
    /// received it. Zero means the event was dropped.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    /// Subscribes to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Payloads received on one channel subscription.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::Receiver<String>,
}

impl Subscription {
    /// Wraps a receiver fed by a transport-specific forwarding task.
    #[must_use]
    pub fn new(channel: impl Into<String>, rx: mpsc::Receiver<String>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    /// Name of the subscribed channel.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next payload. `None` once the transport has shut down.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

// ============================================================================
// Redis transport
// ============================================================================

/// [`CommandChannel`] over Redis `PUBLISH`/`SUBSCRIBE`.
#[derive(Debug)]
pub struct RedisChannel {
    client: redis::Client,
    publisher: OnceCell<MultiplexedConnection>,
}

impl RedisChannel {
    /// Creates a channel transport for the server at `host:port`.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(connection_url(host, port, METADATA_DB))?,
            publisher: OnceCell::new(),
        })
    }
}

#[async_trait]
impl CommandChannel for RedisChannel {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let conn = self
            .publisher
            .get_or_try_init(|| self.client.get_multiplexed_async_connection())
            .await?;
        let mut conn = conn.clone();
        Ok(conn.publish::<_, _, usize>(channel, payload).await?)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        info!(channel, "Subscribed to command channel");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let name = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload = match msg.get_payload::<String>() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %name, "Dropping undecodable payload: {}", e);
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            debug!(channel = %name, "Redis subscription ended");
        });

        Ok(Subscription::new(channel, rx))
    }
}

// ============================================================================
// In-process transport
// ============================================================================

/// [`CommandChannel`] backed by in-process broadcast channels.
///
/// Used when both sides run in one process without a backing server, and in
/// tests.
#[derive(Debug, Default)]
pub struct LocalChannel {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl LocalChannel {
    /// Creates a transport with no channels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .await
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl CommandChannel for LocalChannel {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        // send() only fails when nobody is subscribed
        Ok(self
            .sender(channel)
            .await
            .send(payload.to_string())
            .unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut source = self.sender(channel).await.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let name = channel.to_string();

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(channel = %name, "Subscriber lagged, missed {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(channel, rx))
    }
}

// ============================================================================
// Typed ends
// ============================================================================

/// Publishes captured commands on one named channel.
#[derive(Clone)]
pub struct CommandPublisher {
    transport: Arc<dyn CommandChannel>,
    channel: String,
}

impl std::fmt::Debug for CommandPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPublisher")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl CommandPublisher {
    /// Creates a publisher for `channel` on `transport`.
    pub fn new(transport: Arc<dyn CommandChannel>, channel: impl Into<String>) -> Self {
        Self {
            transport,
            channel: channel.into(),
        }
    }

    /// Name of the channel events are published on.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Publishes one captured command, returning the receiver count.
    pub async fn publish(&self, command: &CapturedCommand) -> Result<usize> {
        let payload = serde_json::to_string(command)?;
        self.transport
            .publish(&self.channel, &payload)
            .await
            .map_err(|e| StoreError::publish(&self.channel, e.to_string()))
    }

    /// Publishes one captured command without reporting failure.
    ///
    /// Errors are logged and the event is dropped.
    pub async fn emit(&self, command: &CapturedCommand) {
        match self.publish(command).await {
            Ok(0) => debug!(
                channel = %self.channel,
                command = %command.command,
                "No subscriber, captured command dropped"
            ),
            Ok(receivers) => debug!(
                channel = %self.channel,
                command = %command.command,
                receivers,
                "Published captured command"
            ),
            Err(e) => warn!(command = %command.command, "{}", e),
        }
    }
}

/// Captured commands for one session, decoded from a [`Subscription`].
#[derive(Debug)]
pub struct CommandStream {
    subscription: Subscription,
    session_id: String,
}

impl CommandStream {
    /// Subscribes to `channel` and filters for `session_id`.
    pub async fn subscribe(
        transport: &dyn CommandChannel,
        channel: &str,
        session_id: impl Into<String>,
    ) -> Result<Self> {
        let subscription = transport.subscribe(channel).await?;
        Ok(Self::new(subscription, session_id))
    }

    /// Wraps an existing subscription.
    pub fn new(subscription: Subscription, session_id: impl Into<String>) -> Self {
        Self {
            subscription,
            session_id: session_id.into(),
        }
    }

    /// Session this stream is filtered to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Waits for the next command belonging to this session.
    ///
    /// Malformed payloads and other sessions' events are skipped. Returns
    /// `None` once the subscription closes.
    pub async fn next(&mut self) -> Option<CapturedCommand> {
        while let Some(payload) = self.subscription.recv().await {
            let command: CapturedCommand = match serde_json::from_str(&payload) {
                Ok(command) => command,
                Err(e) => {
                    warn!(channel = self.subscription.channel(), "Ignoring malformed event: {}", e);
                    continue;
                }
            };
            if command.session_id != self.session_id {
                debug!(session_id = %command.session_id, "Ignoring event for another session");
                continue;
            }
            return Some(command);
        }
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;

    fn captured(session: &str, command: &str) -> CapturedCommand {
        CapturedCommand {
            command: command.to_string(),
            terminal_output: "OK".to_string(),
            csv_output: "OK".to_string(),
            timestamp: Utc::now(),
            session_id: session.to_string(),
        }
    }

    #[tokio::test]
    async fn test_local_publish_without_subscriber_is_dropped() {
        let transport = LocalChannel::new();
        assert_eq!(transport.publish(DEFAULT_CHANNEL, "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_local_round_trip() {
        let transport = LocalChannel::new();
        let mut sub = transport.subscribe("a").await.unwrap();
        assert_eq!(transport.publish("a", "hello").await.unwrap(), 1);
        assert_eq!(transport.publish("b", "elsewhere").await.unwrap(), 0);
        assert_eq!(sub.recv().await.as_deref(), Some("hello"));
        assert_eq!(sub.channel(), "a");
    }

    #[tokio::test]
    async fn test_stream_filters_session_and_garbage() {
        let transport: Arc<dyn CommandChannel> = Arc::new(LocalChannel::new());
        let mut stream = CommandStream::subscribe(transport.as_ref(), DEFAULT_CHANNEL, "mine")
            .await
            .unwrap();
        let publisher = CommandPublisher::new(transport.clone(), DEFAULT_CHANNEL);

        transport.publish(DEFAULT_CHANNEL, "{not json").await.unwrap();
        publisher.emit(&captured("theirs", "GET a")).await;
        publisher.emit(&captured("mine", "PING")).await;

        let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.command, "PING");
        assert_eq!(next.session_id, "mine");
    }

    #[tokio::test]
    async fn test_publisher_reports_receivers() {
        let transport: Arc<dyn CommandChannel> = Arc::new(LocalChannel::new());
        let publisher = CommandPublisher::new(transport.clone(), "c");
        assert_eq!(publisher.publish(&captured("s", "PING")).await.unwrap(), 0);

        let _sub = transport.subscribe("c").await.unwrap();
        assert_eq!(publisher.publish(&captured("s", "PING")).await.unwrap(), 1);
    }
}
