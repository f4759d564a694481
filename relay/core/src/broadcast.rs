//! Broadcaster - Fan-out to Connected Subscribers
//!
//! Every connected subscriber receives every stream message; channel
//! filtering happens on the subscriber side.
//!
//! # Architecture
//!
//! ```text
//!                         Broadcaster
//!                 ┌────────────────────────────────────┐
//!                 │ HashMap<ConnectionId, Handle>      │
//!                 │   - wrapped in Arc<RwLock<>>       │
//!                 └──────────────┬─────────────────────┘
//!                                │ bounded mailbox per connection
//!            ┌───────────────────┼───────────────────┐
//!     ┌──────▼──────┐     ┌──────▼──────┐     ┌──────▼──────┐
//!     │ writer task │     │ writer task │     │ writer task │
//!     │   conn-1    │     │   conn-2    │     │   conn-3    │
//!     └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! Each connection is written by exactly one task, so writes to one
//! connection never interleave and arrive in broadcast order. A broadcast
//! serializes the message once, enqueues it in every mailbox and waits for
//! each writer to acknowledge. Connections whose mailbox is full or closed,
//! whose write failed, or that did not acknowledge within the write timeout
//! are removed before `broadcast` returns.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{RelayError, StructuredError};
use crate::messages::{ChannelId, StreamMessage};

/// Default number of messages queued per connection
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// Default bound on a single write
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Unique identifier for a subscriber connection
///
/// Each connection is assigned a unique ID when it registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a delivery to one connection failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The connection (or its writer) is gone
    #[error("connection closed")]
    Closed,

    /// Too many undelivered messages
    #[error("mailbox full")]
    MailboxFull,

    /// The write did not complete in time
    #[error("write timed out after {0:?}")]
    TimedOut(Duration),

    /// The transport rejected the write
    #[error("write failed: {0}")]
    Write(String),
}

/// A subscriber's outbound side
///
/// Implemented by the transport (e.g. a websocket sink). Only the connection's
/// writer task ever calls these methods.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Write one text frame
    async fn write_text(&mut self, text: &str) -> Result<(), ConnectionError>;

    /// Close the transport after the last write
    async fn close(&mut self) {}
}

type Ack = oneshot::Sender<Result<(), ConnectionError>>;

/// Handle to a registered connection
struct ConnectionHandle {
    mailbox: mpsc::Sender<(Arc<str>, Ack)>,
    writer: JoinHandle<()>,
    connected_at: Instant,
}

/// Result of a broadcast operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastResult {
    /// Number of connections that acknowledged the message
    pub successful: usize,
    /// Number of connections that failed (and were removed)
    pub failed: usize,
    /// IDs of connections that failed
    pub failed_ids: Vec<ConnectionId>,
}

impl BroadcastResult {
    /// Check if all recipients received the message
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Broadcaster tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcasterConfig {
    /// Messages queued per connection before it counts as failed
    pub mailbox_capacity: usize,
    /// Bound on one write (enqueue to acknowledgement)
    pub write_timeout: Duration,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Registry of subscriber connections with fan-out
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<RwLock<HashMap<ConnectionId, ConnectionHandle>>>,
    config: BroadcasterConfig,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(BroadcasterConfig::default())
    }
}

impl Broadcaster {
    /// Create an empty broadcaster
    #[must_use]
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Register a connection and start its writer
    ///
    /// Must be called from within a tokio runtime.
    pub fn register<C: Connection>(&self, connection: C) -> ConnectionId {
        let id = ConnectionId::new();
        let (mailbox, rx) = mpsc::channel(self.config.mailbox_capacity.max(1));
        let writer = tokio::spawn(run_writer(id, connection, rx));

        self.inner.write().insert(
            id,
            ConnectionHandle {
                mailbox,
                writer,
                connected_at: Instant::now(),
            },
        );
        tracing::info!(connection_id = %id, "Connection registered");
        id
    }

    /// Unregister a connection
    ///
    /// Queued messages are still written before the writer closes the
    /// connection. Returns whether the connection was registered.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let handle = self.inner.write().remove(id);
        match handle {
            Some(handle) => {
                tracing::info!(
                    connection_id = %id,
                    uptime_secs = handle.connected_at.elapsed().as_secs(),
                    "Connection unregistered"
                );
                true
            }
            None => false,
        }
    }

    /// Get the number of registered connections
    #[must_use]
    pub fn count(&self) -> usize {
        self.inner.read().len()
    }

    /// Check if a connection is registered
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.read().contains_key(id)
    }

    /// Get the IDs of all registered connections
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.read().keys().copied().collect()
    }

    /// Deliver a message to every registered connection
    ///
    /// Failed connections are removed before this returns.
    ///
    /// # Errors
    ///
    /// Only fails when the message cannot be serialized.
    pub async fn broadcast(&self, message: &StreamMessage) -> Result<BroadcastResult, RelayError> {
        let text: Arc<str> = serde_json::to_string(message)?.into();

        // Collect senders to avoid holding the lock across awaits
        let targets: Vec<(ConnectionId, mpsc::Sender<(Arc<str>, Ack)>)> = {
            let inner = self.inner.read();
            inner.iter().map(|(id, h)| (*id, h.mailbox.clone())).collect()
        };

        let timeout = self.config.write_timeout;
        let outcomes = join_all(targets.into_iter().map(|(id, mailbox)| {
            let text = Arc::clone(&text);
            async move { (id, deliver(&mailbox, text, timeout).await) }
        }))
        .await;

        let mut result = BroadcastResult::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => result.successful += 1,
                Err(e) => {
                    self.prune(&id, &e);
                    result.failed += 1;
                    result.failed_ids.push(id);
                }
            }
        }

        tracing::trace!(
            channel_id = %message.channel_id,
            successful = result.successful,
            failed = result.failed,
            "Broadcast delivered"
        );
        Ok(result)
    }

    /// Deliver raw text to one connection
    ///
    /// A failed connection is removed.
    ///
    /// # Errors
    ///
    /// Returns why delivery failed; `Closed` for unknown connections.
    pub async fn send_to(
        &self,
        id: &ConnectionId,
        text: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        let mailbox = self.inner.read().get(id).map(|h| h.mailbox.clone());
        let Some(mailbox) = mailbox else {
            tracing::warn!(connection_id = %id, "Attempted to send to unknown connection");
            return Err(ConnectionError::Closed);
        };

        let text: Arc<str> = text.into().into();
        let outcome = deliver(&mailbox, text, self.config.write_timeout).await;
        if let Err(e) = &outcome {
            self.prune(id, e);
        }
        outcome
    }

    /// Broadcast a whole text on a channel
    ///
    /// # Errors
    ///
    /// See [`Broadcaster::broadcast`].
    pub async fn send_message_full(
        &self,
        channel_id: &ChannelId,
        content: &str,
    ) -> Result<BroadcastResult, RelayError> {
        self.broadcast(&StreamMessage::full(channel_id.clone(), content))
            .await
    }

    /// Broadcast one fragment on a channel
    ///
    /// # Errors
    ///
    /// See [`Broadcaster::broadcast`].
    pub async fn send_message_fragment(
        &self,
        channel_id: &ChannelId,
        fragment: &str,
    ) -> Result<BroadcastResult, RelayError> {
        self.broadcast(&StreamMessage::fragment(channel_id.clone(), fragment))
            .await
    }

    /// Broadcast an error on a channel
    ///
    /// # Errors
    ///
    /// See [`Broadcaster::broadcast`].
    pub async fn send_error_message(
        &self,
        channel_id: &ChannelId,
        error: StructuredError,
    ) -> Result<BroadcastResult, RelayError> {
        self.broadcast(&StreamMessage::error(channel_id.clone(), error))
            .await
    }

    fn prune(&self, id: &ConnectionId, reason: &ConnectionError) {
        if let Some(handle) = self.inner.write().remove(id) {
            // A stuck write would otherwise keep the writer alive forever
            handle.writer.abort();
            tracing::warn!(
                connection_id = %id,
                reason = %reason,
                "Removed failed connection"
            );
        }
    }
}

/// Enqueue one message and wait for the writer's acknowledgement
async fn deliver(
    mailbox: &mpsc::Sender<(Arc<str>, Ack)>,
    text: Arc<str>,
    timeout: Duration,
) -> Result<(), ConnectionError> {
    let (ack_tx, ack_rx) = oneshot::channel();
    mailbox.try_send((text, ack_tx)).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => ConnectionError::MailboxFull,
        mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
    })?;

    match tokio::time::timeout(timeout, ack_rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err(ConnectionError::Closed),
        Err(_) => Err(ConnectionError::TimedOut(timeout)),
    }
}

/// Sole writer of one connection
async fn run_writer<C: Connection>(
    id: ConnectionId,
    mut connection: C,
    mut mailbox: mpsc::Receiver<(Arc<str>, Ack)>,
) {
    while let Some((text, ack)) = mailbox.recv().await {
        let outcome = connection.write_text(&text).await;
        let failed = outcome.is_err();
        let _ = ack.send(outcome);
        if failed {
            break;
        }
    }
    connection.close().await;
    tracing::debug!(connection_id = %id, "Connection writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Connection that forwards frames to a channel
    struct ChannelConnection(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl Connection for ChannelConnection {
        async fn write_text(&mut self, text: &str) -> Result<(), ConnectionError> {
            self.0
                .send(text.to_string())
                .map_err(|_| ConnectionError::Closed)
        }
    }

    /// Connection whose writes never finish
    struct StuckConnection;

    #[async_trait]
    impl Connection for StuckConnection {
        async fn write_text(&mut self, _text: &str) -> Result<(), ConnectionError> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Connection whose writes always fail
    struct BrokenConnection;

    #[async_trait]
    impl Connection for BrokenConnection {
        async fn write_text(&mut self, _text: &str) -> Result<(), ConnectionError> {
            Err(ConnectionError::Write("broken pipe".to_string()))
        }
    }

    fn channel_connection() -> (ChannelConnection, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelConnection(tx), rx)
    }

    fn fast_config() -> BroadcasterConfig {
        BroadcasterConfig {
            mailbox_capacity: 8,
            write_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId(42);
        assert_eq!(id.to_string(), "conn-42");
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let broadcaster = Broadcaster::default();
        let (conn, _rx) = channel_connection();

        let id = broadcaster.register(conn);
        assert!(broadcaster.contains(&id));
        assert_eq!(broadcaster.count(), 1);
        assert_eq!(broadcaster.connection_ids(), vec![id]);

        assert!(broadcaster.unregister(&id));
        assert!(!broadcaster.unregister(&id));
        assert_eq!(broadcaster.count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_in_order() {
        let broadcaster = Broadcaster::default();
        let (a, mut rx_a) = channel_connection();
        let (b, mut rx_b) = channel_connection();
        broadcaster.register(a);
        broadcaster.register(b);

        let channel = ChannelId::for_interaction("c1", "i1");
        for fragment in ["one", "two", "three"] {
            let result = broadcaster
                .send_message_fragment(&channel, fragment)
                .await
                .unwrap();
            assert_eq!(result.successful, 2);
            assert!(result.all_succeeded());
        }

        for rx in [&mut rx_a, &mut rx_b] {
            let mut got = Vec::new();
            for _ in 0..3 {
                let frame: StreamMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
                got.push(frame.message_fragment.unwrap());
            }
            assert_eq!(got, vec!["one", "two", "three"]);
        }
    }

    #[tokio::test]
    async fn test_broadcast_with_no_connections() {
        let broadcaster = Broadcaster::default();
        let result = broadcaster
            .send_message_full(&ChannelId::title("c1"), "Title")
            .await
            .unwrap();
        assert_eq!(result, BroadcastResult::default());
    }

    #[tokio::test]
    async fn test_failed_connections_are_pruned() {
        let broadcaster = Broadcaster::new(fast_config());
        let (healthy, mut rx) = channel_connection();
        let healthy = broadcaster.register(healthy);
        let stuck = broadcaster.register(StuckConnection);
        let broken = broadcaster.register(BrokenConnection);

        let result = broadcaster
            .send_message_fragment(&ChannelId::for_interaction("c1", "i1"), "x")
            .await
            .unwrap();

        assert_eq!(result.successful, 1);
        assert_eq!(result.failed, 2);
        let mut failed = result.failed_ids.clone();
        failed.sort();
        let mut expected = vec![stuck, broken];
        expected.sort();
        assert_eq!(failed, expected);

        assert!(broadcaster.contains(&healthy));
        assert!(!broadcaster.contains(&stuck));
        assert!(!broadcaster.contains(&broken));
        assert!(rx.recv().await.is_some());

        // Pruned connections receive nothing further
        let result = broadcaster
            .send_message_fragment(&ChannelId::for_interaction("c1", "i1"), "y")
            .await
            .unwrap();
        assert_eq!(result.successful, 1);
        assert_eq!(result.failed, 0);
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_pruned() {
        let broadcaster = Broadcaster::default();
        let (conn, rx) = channel_connection();
        let id = broadcaster.register(conn);
        drop(rx);

        let result = broadcaster
            .send_message_full(&ChannelId::title("c1"), "t")
            .await
            .unwrap();
        assert_eq!(result.failed_ids, vec![id]);
        assert_eq!(broadcaster.count(), 0);
    }

    #[tokio::test]
    async fn test_send_to_single_connection() {
        let broadcaster = Broadcaster::default();
        let (a, mut rx_a) = channel_connection();
        let (b, mut rx_b) = channel_connection();
        let a = broadcaster.register(a);
        broadcaster.register(b);

        broadcaster.send_to(&a, "{\"id\":1}").await.unwrap();
        assert_eq!(rx_a.recv().await.unwrap(), "{\"id\":1}");
        assert!(rx_b.try_recv().is_err());

        let unknown = ConnectionId::new();
        assert_eq!(
            broadcaster.send_to(&unknown, "x").await,
            Err(ConnectionError::Closed)
        );
    }
}
