//! WebSocket Connection Hub
//!
//! A single task owns the live-connection registry and the subscription
//! index. Every mutation and every fan-out arrives as a [`Command`] on one
//! bounded intake queue and is applied in arrival order, so the registry and
//! the index are never touched outside this loop and need no locks.
//!
//! Fan-out never waits on a slow consumer. A subscriber whose mailbox is full
//! is evicted on the spot (mailbox closed, dropped from the channel), and a
//! connection whose direct queue is full is unregistered; the rest of the
//! fan-out continues.
//!
//! Initial snapshots are fetched off-loop but enqueued by the loop itself, so
//! nothing but the hub ever holds a connection's mailbox.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::connection::{ConnectionHandle, ConnectionId, Enqueue, Frame};
use super::messages::Envelope;
use super::subscriptions::SubscriptionIndex;
use crate::auth::Identity;
use crate::snapshot::{fetch_with_timeout, SnapshotProvider};

/// Configuration for the connection hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Per-connection capacity of the mailbox and of the direct path
    pub mailbox_capacity: usize,
    /// Capacity of the hub's request queue
    pub intake_capacity: usize,
    /// Deadline for the initial snapshot fetch
    pub snapshot_timeout: Duration,
    /// How long to wait for mailbox room when delivering the initial snapshot
    pub snapshot_delivery_timeout: Duration,
    /// Channel prefixes whose remainder names a snapshot subject
    pub snapshot_prefixes: Vec<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            intake_capacity: 1024,
            snapshot_timeout: Duration::from_secs(5),
            snapshot_delivery_timeout: Duration::from_secs(2),
            snapshot_prefixes: vec!["stats:".to_string(), "estadisticas:".to_string()],
        }
    }
}

impl HubConfig {
    /// Subject named by a snapshot channel, e.g. `biz1` for `stats:biz1`
    pub fn snapshot_subject<'a>(&self, channel: &'a str) -> Option<&'a str> {
        self.snapshot_prefixes
            .iter()
            .find_map(|prefix| channel.strip_prefix(prefix.as_str()))
            .filter(|subject| !subject.is_empty())
    }
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub channels: usize,
    pub subscriptions: usize,
}

/// Errors that can occur talking to the hub
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Hub is not running")]
    Closed,
}

enum Command {
    Register(ConnectionHandle),
    Unregister {
        identity: Identity,
        id: ConnectionId,
    },
    Subscribe {
        identity: Identity,
        id: ConnectionId,
        channel: String,
    },
    Unsubscribe {
        identity: Identity,
        id: ConnectionId,
        channel: String,
    },
    BroadcastAll(Envelope),
    BroadcastRaw(Frame),
    BroadcastToChannel {
        channel: String,
        payload: Frame,
    },
    Stats(oneshot::Sender<HubStats>),
    Subscribers {
        channel: String,
        reply: oneshot::Sender<Vec<Identity>>,
    },
    SubscribedSubjects(oneshot::Sender<Vec<String>>),
    DeliverSnapshot {
        identity: Identity,
        id: ConnectionId,
        channel: String,
        frame: Frame,
        reply: oneshot::Sender<Enqueue>,
    },
}

/// Pause between attempts to place a snapshot in a full mailbox
const SNAPSHOT_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Cloneable entry point to the hub loop
#[derive(Clone)]
pub struct HubHandle {
    intake: mpsc::Sender<Command>,
    config: Arc<HubConfig>,
}

impl HubHandle {
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    async fn send(&self, command: Command) -> Result<(), HubError> {
        self.intake.send(command).await.map_err(|_| HubError::Closed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Add a connection. An existing connection with the same identity is
    /// evicted and replaced.
    pub async fn register(&self, handle: ConnectionHandle) -> Result<(), HubError> {
        self.send(Command::Register(handle)).await
    }

    /// Remove a connection and purge it from every channel. Ignored if `id`
    /// is not the identity's current connection.
    pub async fn unregister(&self, identity: Identity, id: ConnectionId) -> Result<(), HubError> {
        self.send(Command::Unregister { identity, id }).await
    }

    pub async fn subscribe(
        &self,
        identity: Identity,
        id: ConnectionId,
        channel: impl Into<String>,
    ) -> Result<(), HubError> {
        self.send(Command::Subscribe {
            identity,
            id,
            channel: channel.into(),
        })
        .await
    }

    pub async fn unsubscribe(
        &self,
        identity: Identity,
        id: ConnectionId,
        channel: impl Into<String>,
    ) -> Result<(), HubError> {
        self.send(Command::Unsubscribe {
            identity,
            id,
            channel: channel.into(),
        })
        .await
    }

    /// Deliver to every connection through its direct path
    pub async fn broadcast_all(&self, message: Envelope) -> Result<(), HubError> {
        self.send(Command::BroadcastAll(message)).await
    }

    /// Deliver a pre-encoded frame to every connection, dropping any whose
    /// writer is gone
    pub async fn broadcast_raw(&self, frame: Frame) -> Result<(), HubError> {
        self.send(Command::BroadcastRaw(frame)).await
    }

    /// Deliver to every subscriber of `channel` through its mailbox
    pub async fn broadcast_to_channel(
        &self,
        channel: impl Into<String>,
        payload: Frame,
    ) -> Result<(), HubError> {
        self.send(Command::BroadcastToChannel {
            channel: channel.into(),
            payload,
        })
        .await
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.request(Command::Stats).await
    }

    pub async fn subscribers(&self, channel: impl Into<String>) -> Result<Vec<Identity>, HubError> {
        let channel = channel.into();
        self.request(|reply| Command::Subscribers { channel, reply })
            .await
    }

    /// Subjects with at least one subscriber on a snapshot channel, sorted
    pub async fn subscribed_subjects(&self) -> Result<Vec<String>, HubError> {
        self.request(Command::SubscribedSubjects).await
    }
}

/// The hub loop's state
pub struct Hub {
    config: Arc<HubConfig>,
    connections: HashMap<Identity, ConnectionHandle>,
    subscriptions: SubscriptionIndex,
    snapshots: Option<Arc<dyn SnapshotProvider>>,
    intake: mpsc::Receiver<Command>,
    // snapshot tasks report back here without keeping the hub alive
    loopback: mpsc::WeakSender<Command>,
}

impl Hub {
    pub fn new(
        config: HubConfig,
        snapshots: Option<Arc<dyn SnapshotProvider>>,
    ) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(config.intake_capacity.max(1));
        let config = Arc::new(config);
        let hub = Self {
            config: Arc::clone(&config),
            connections: HashMap::new(),
            subscriptions: SubscriptionIndex::new(),
            snapshots,
            intake: rx,
            loopback: tx.downgrade(),
        };
        (hub, HubHandle { intake: tx, config })
    }

    /// Start the loop on the runtime and return its handle
    pub fn spawn(config: HubConfig, snapshots: Option<Arc<dyn SnapshotProvider>>) -> HubHandle {
        let (hub, handle) = Self::new(config, snapshots);
        tokio::spawn(hub.run());
        handle
    }

    /// Process requests until every [`HubHandle`] is dropped
    pub async fn run(mut self) {
        tracing::info!(
            mailbox_capacity = self.config.mailbox_capacity,
            snapshots = self.snapshots.is_some(),
            "Hub started"
        );
        while let Some(command) = self.intake.recv().await {
            self.apply(command);
        }
        tracing::info!(connections = self.connections.len(), "Hub stopped");
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Register(handle) => self.register(handle),
            Command::Unregister { identity, id } => self.unregister(&identity, id),
            Command::Subscribe {
                identity,
                id,
                channel,
            } => self.subscribe(&identity, id, &channel),
            Command::Unsubscribe {
                identity,
                id,
                channel,
            } => self.unsubscribe(&identity, id, &channel),
            Command::BroadcastAll(message) => self.broadcast_all(&message),
            Command::BroadcastRaw(frame) => self.broadcast_raw(&frame),
            Command::BroadcastToChannel { channel, payload } => {
                self.broadcast_to_channel(&channel, &payload)
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Subscribers { channel, reply } => {
                let _ = reply.send(self.subscriptions.subscribers(&channel));
            }
            Command::SubscribedSubjects(reply) => {
                let _ = reply.send(self.subscribed_subjects());
            }
            Command::DeliverSnapshot {
                identity,
                id,
                channel,
                frame,
                reply,
            } => {
                let _ = reply.send(self.enqueue_snapshot(&identity, id, &channel, frame));
            }
        }
    }

    fn register(&mut self, handle: ConnectionHandle) {
        let identity = handle.identity().clone();
        if let Some(previous) = self.connections.remove(&identity) {
            tracing::warn!(
                identity = %identity,
                previous = %previous.id(),
                current = %handle.id(),
                "Identity reconnected, replacing previous connection"
            );
            self.retire(previous);
        }
        self.connections.insert(identity.clone(), handle);
        tracing::info!(
            identity = %identity,
            total = self.connections.len(),
            "Connection registered"
        );
    }

    fn unregister(&mut self, identity: &Identity, id: ConnectionId) {
        let current = self
            .connections
            .get(identity)
            .is_some_and(|handle| handle.id() == id);
        if !current {
            tracing::debug!(identity = %identity, id = %id, "Unregister for unknown or replaced connection ignored");
            return;
        }
        if let Some(handle) = self.connections.remove(identity) {
            let channels = self.retire(handle);
            tracing::info!(
                identity = %identity,
                channels,
                total = self.connections.len(),
                "Connection unregistered"
            );
        }
    }

    /// Close a removed connection's mailbox and purge it from every channel
    fn retire(&mut self, mut handle: ConnectionHandle) -> usize {
        handle.close_mailbox();
        self.subscriptions.remove_everywhere(handle.identity())
    }

    /// The identity's current connection, if `id` matches and it was not evicted
    fn live(&self, identity: &Identity, id: ConnectionId) -> Option<&ConnectionHandle> {
        self.connections
            .get(identity)
            .filter(|handle| handle.id() == id && !handle.is_mailbox_closed())
    }

    fn subscribe(&mut self, identity: &Identity, id: ConnectionId, channel: &str) {
        if channel.is_empty() {
            tracing::warn!(identity = %identity, "Subscribe without channel ignored");
            return;
        }
        if self.live(identity, id).is_none() {
            tracing::debug!(identity = %identity, channel = %channel, "Subscribe from inactive connection ignored");
            return;
        }

        self.subscriptions.subscribe(channel, identity);
        tracing::info!(identity = %identity, channel = %channel, "Subscribed to channel");

        let (Some(provider), Some(subject)) =
            (&self.snapshots, self.config.snapshot_subject(channel))
        else {
            return;
        };
        tokio::spawn(deliver_snapshot(
            Arc::clone(provider),
            self.loopback.clone(),
            identity.clone(),
            id,
            channel.to_string(),
            subject.to_string(),
            Arc::clone(&self.config),
        ));
    }

    /// Place a fetched snapshot, provided the connection is still live and
    /// still subscribed to the channel it asked for
    fn enqueue_snapshot(
        &self,
        identity: &Identity,
        id: ConnectionId,
        channel: &str,
        frame: Frame,
    ) -> Enqueue {
        if !self.subscriptions.is_subscribed(channel, identity) {
            return Enqueue::Closed;
        }
        match self.live(identity, id) {
            Some(handle) => handle.try_enqueue(frame),
            None => Enqueue::Closed,
        }
    }

    fn unsubscribe(&mut self, identity: &Identity, id: ConnectionId, channel: &str) {
        if channel.is_empty() {
            tracing::warn!(identity = %identity, "Unsubscribe without channel ignored");
            return;
        }
        if self.live(identity, id).is_none() {
            tracing::debug!(identity = %identity, channel = %channel, "Unsubscribe from inactive connection ignored");
            return;
        }
        if self.subscriptions.unsubscribe(channel, identity) {
            tracing::info!(identity = %identity, channel = %channel, "Unsubscribed from channel");
        }
    }

    fn broadcast_all(&mut self, message: &Envelope) {
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(error = %e, kind = %message.kind, "Failed to encode broadcast");
                return;
            }
        };

        let total = self.connections.len();
        let delivered = self.send_direct_all(&frame);
        tracing::debug!(kind = %message.kind, delivered, total, "Broadcast to all connections");
    }

    fn broadcast_raw(&mut self, frame: &Frame) {
        let total = self.connections.len();
        let delivered = self.send_direct_all(frame);
        tracing::debug!(delivered, total, "Raw broadcast to all connections");
    }

    /// Direct-path fan-out. Connections that cannot take the frame, because
    /// their queue is full or their writer is gone, are unregistered.
    fn send_direct_all(&mut self, frame: &Frame) -> usize {
        let mut delivered = 0;
        let mut dropped = Vec::new();
        for handle in self.connections.values() {
            match handle.send_direct(Frame::clone(frame)) {
                Enqueue::Queued => delivered += 1,
                Enqueue::Full => {
                    tracing::warn!(identity = %handle.identity(), "Direct queue full, evicting connection");
                    dropped.push(handle.identity().clone());
                }
                Enqueue::Closed => {
                    tracing::warn!(identity = %handle.identity(), "Write to connection failed, dropping it");
                    dropped.push(handle.identity().clone());
                }
            }
        }

        for identity in dropped {
            if let Some(handle) = self.connections.remove(&identity) {
                self.retire(handle);
            }
        }
        delivered
    }

    fn broadcast_to_channel(&mut self, channel: &str, payload: &Frame) {
        let subscribers = self.subscriptions.subscribers(channel);
        if subscribers.is_empty() {
            tracing::debug!(channel = %channel, "No subscribers on channel");
            return;
        }

        let total = subscribers.len();
        let mut sent = 0;
        for identity in subscribers {
            let outcome = self
                .connections
                .get_mut(&identity)
                .map(|handle| (handle.try_enqueue(Frame::clone(payload)), handle));

            match outcome {
                Some((Enqueue::Queued, _)) => {
                    sent += 1;
                    continue;
                }
                Some((Enqueue::Full, handle)) => {
                    handle.close_mailbox();
                    tracing::warn!(
                        identity = %identity,
                        channel = %channel,
                        "Mailbox full, evicting connection"
                    );
                }
                Some((Enqueue::Closed, _)) | None => {
                    tracing::debug!(identity = %identity, channel = %channel, "Dropping closed subscriber");
                }
            }
            self.subscriptions.unsubscribe(channel, &identity);
        }

        tracing::debug!(channel = %channel, sent, total, "Channel fan-out complete");
    }

    fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connections.len(),
            channels: self.subscriptions.channel_count(),
            subscriptions: self.subscriptions.subscription_count(),
        }
    }

    fn subscribed_subjects(&self) -> Vec<String> {
        self.subscriptions
            .channels()
            .filter_map(|channel| self.config.snapshot_subject(channel))
            .map(str::to_string)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Fetch a snapshot and hand it to the hub for one subscriber. While the
/// mailbox is full the hand-off is retried until the delivery deadline.
/// Failures are logged and dropped.
async fn deliver_snapshot(
    provider: Arc<dyn SnapshotProvider>,
    loopback: mpsc::WeakSender<Command>,
    identity: Identity,
    id: ConnectionId,
    channel: String,
    subject: String,
    config: Arc<HubConfig>,
) {
    let snapshot = match fetch_with_timeout(provider.as_ref(), &subject, config.snapshot_timeout).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!(identity = %identity, subject = %subject, error = %e, "Initial snapshot fetch failed");
            return;
        }
    };

    let frame = match Envelope::stats(&channel, &subject, snapshot).to_frame() {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(subject = %subject, error = %e, "Failed to encode snapshot");
            return;
        }
    };

    let deadline = tokio::time::Instant::now() + config.snapshot_delivery_timeout;
    loop {
        let Some(intake) = loopback.upgrade() else {
            tracing::debug!(identity = %identity, "Hub stopped before snapshot delivery");
            return;
        };
        let (reply, outcome) = oneshot::channel();
        let command = Command::DeliverSnapshot {
            identity: identity.clone(),
            id,
            channel: channel.clone(),
            frame: Frame::clone(&frame),
            reply,
        };
        if intake.send(command).await.is_err() {
            return;
        }
        drop(intake);

        match outcome.await {
            Ok(Enqueue::Queued) => {
                tracing::debug!(identity = %identity, subject = %subject, "Initial snapshot delivered");
                return;
            }
            Ok(Enqueue::Closed) | Err(_) => {
                tracing::debug!(identity = %identity, channel = %channel, "Connection gone before snapshot delivery");
                return;
            }
            Ok(Enqueue::Full) => {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    tracing::warn!(identity = %identity, subject = %subject, "Mailbox full, initial snapshot dropped");
                    return;
                }
                tokio::time::sleep(SNAPSHOT_RETRY_INTERVAL.min(deadline - now)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{Snapshot, SnapshotError};
    use crate::websocket::connection::{self, Outbox};
    use crate::websocket::messages::MessageKind;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingProvider {
        calls: AtomicUsize,
        subjects: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingProvider {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                subjects: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl SnapshotProvider for RecordingProvider {
        async fn fetch_snapshot(&self, subject_id: &str) -> Result<Snapshot, SnapshotError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.subjects.lock().unwrap().push(subject_id.to_string());
            if self.fail {
                return Err(SnapshotError::Provider("database down".into()));
            }
            match json!({"totalCitas": 10, "citasHoy": 2}) {
                Value::Object(map) => Ok(map),
                _ => unreachable!(),
            }
        }
    }

    struct SlowProvider(Duration);

    #[async_trait]
    impl SnapshotProvider for SlowProvider {
        async fn fetch_snapshot(&self, _subject_id: &str) -> Result<Snapshot, SnapshotError> {
            tokio::time::sleep(self.0).await;
            Ok(Snapshot::new())
        }
    }

    async fn connect(hub: &HubHandle, name: &str, capacity: usize) -> (ConnectionId, Outbox) {
        let (handle, outbox) = connection::channel(Identity::from(name), capacity);
        let id = handle.id();
        hub.register(handle).await.unwrap();
        (id, outbox)
    }

    fn frame(s: &str) -> Frame {
        Frame::from(s)
    }

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();
        assert_eq!(config.mailbox_capacity, 256);
        assert_eq!(config.snapshot_timeout, Duration::from_secs(5));
        assert_eq!(config.snapshot_delivery_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_snapshot_subject() {
        let config = HubConfig::default();
        assert_eq!(config.snapshot_subject("stats:biz1"), Some("biz1"));
        assert_eq!(config.snapshot_subject("estadisticas:42"), Some("42"));
        assert_eq!(config.snapshot_subject("stats:"), None);
        assert_eq!(config.snapshot_subject("orders:42"), None);
        assert_eq!(config.snapshot_subject("Stats:biz1"), None);
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let hub = Hub::spawn(HubConfig::default(), None);
        let (id, mut outbox) = connect(&hub, "a", 8).await;
        assert_eq!(hub.stats().await.unwrap().connections, 1);

        hub.unregister(Identity::from("a"), id).await.unwrap();
        assert_eq!(hub.stats().await.unwrap().connections, 0);
        assert!(outbox.next_frame().await.is_none());

        // duplicate unregister is tolerated
        hub.unregister(Identity::from("a"), id).await.unwrap();
        assert_eq!(hub.stats().await.unwrap(), HubStats::default());
    }

    #[tokio::test]
    async fn test_broadcast_all_reaches_everyone_once() {
        let hub = Hub::spawn(HubConfig::default(), None);
        let mut outboxes = Vec::new();
        for name in ["a", "b", "c"] {
            outboxes.push(connect(&hub, name, 8).await.1);
        }

        let message = Envelope::new(MessageKind::Chat, json!("hola"));
        hub.broadcast_all(message).await.unwrap();
        hub.stats().await.unwrap();

        for outbox in outboxes.iter_mut() {
            let got: Value = serde_json::from_str(&outbox.try_next_frame().unwrap()).unwrap();
            assert_eq!(got["type"], "chat");
            assert_eq!(got["data"], "hola");
            assert!(outbox.try_next_frame().is_none());
        }
    }

    #[tokio::test]
    async fn test_channel_fanout_is_isolated() {
        let hub = Hub::spawn(HubConfig::default(), None);
        let (a_id, mut a) = connect(&hub, "a", 8).await;
        let (b_id, mut b) = connect(&hub, "b", 8).await;
        hub.subscribe(Identity::from("a"), a_id, "orders:42").await.unwrap();
        hub.subscribe(Identity::from("b"), b_id, "orders:99").await.unwrap();

        hub.broadcast_to_channel("orders:42", frame(r#"{"type":"chat"}"#))
            .await
            .unwrap();
        hub.stats().await.unwrap();

        assert_eq!(a.try_next_frame().as_deref(), Some(r#"{"type":"chat"}"#));
        assert!(a.try_next_frame().is_none());
        assert!(b.try_next_frame().is_none());
    }

    #[tokio::test]
    async fn test_unregister_purges_every_channel() {
        let hub = Hub::spawn(HubConfig::default(), None);
        let (c_id, _c) = connect(&hub, "c", 8).await;
        let (d_id, mut d) = connect(&hub, "d", 8).await;
        for channel in ["orders:1", "orders:2", "stats:biz1"] {
            hub.subscribe(Identity::from("c"), c_id, channel).await.unwrap();
        }
        hub.subscribe(Identity::from("d"), d_id, "orders:2").await.unwrap();

        hub.unregister(Identity::from("c"), c_id).await.unwrap();

        for channel in ["orders:1", "orders:2", "stats:biz1"] {
            let subscribers = hub.subscribers(channel).await.unwrap();
            assert!(!subscribers.contains(&Identity::from("c")));
        }
        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.channels, 1);
        assert_eq!(stats.subscriptions, 1);

        hub.broadcast_to_channel("orders:2", frame("x")).await.unwrap();
        hub.stats().await.unwrap();
        assert_eq!(d.try_next_frame().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_full_mailbox_evicts_subscriber() {
        let hub = Hub::spawn(HubConfig::default(), None);
        let (slow_id, mut slow) = connect(&hub, "slow", 2).await;
        let (fast_id, mut fast) = connect(&hub, "fast", 8).await;
        hub.subscribe(Identity::from("slow"), slow_id, "orders:42").await.unwrap();
        hub.subscribe(Identity::from("slow"), slow_id, "orders:99").await.unwrap();
        hub.subscribe(Identity::from("fast"), fast_id, "orders:42").await.unwrap();

        for n in 0..3 {
            hub.broadcast_to_channel("orders:42", frame(&n.to_string()))
                .await
                .unwrap();
        }

        assert_eq!(
            hub.subscribers("orders:42").await.unwrap(),
            vec![Identity::from("fast")]
        );
        // still registered until its loops notice and unregister
        assert_eq!(hub.stats().await.unwrap().connections, 2);

        assert_eq!(slow.next_frame().await.as_deref(), Some("0"));
        assert_eq!(slow.next_frame().await.as_deref(), Some("1"));
        assert!(slow.next_frame().await.is_none());

        for n in 0..3 {
            assert_eq!(fast.try_next_frame().as_deref(), Some(n.to_string().as_str()));
        }

        // a later fan-out on another channel drops the closed subscriber too
        hub.broadcast_to_channel("orders:99", frame("late")).await.unwrap();
        assert!(hub.subscribers("orders:99").await.unwrap().is_empty());

        hub.unregister(Identity::from("slow"), slow_id).await.unwrap();
        assert_eq!(hub.stats().await.unwrap().connections, 1);
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_channel_is_noop() {
        let hub = Hub::spawn(HubConfig::default(), None);
        let (_, mut a) = connect(&hub, "a", 8).await;
        let before = hub.stats().await.unwrap();

        hub.broadcast_to_channel("stats:unknown", frame("{}"))
            .await
            .unwrap();

        assert_eq!(hub.stats().await.unwrap(), before);
        assert!(a.try_next_frame().is_none());
    }

    #[tokio::test]
    async fn test_empty_channel_subscribe_ignored() {
        let hub = Hub::spawn(HubConfig::default(), None);
        let (id, _a) = connect(&hub, "a", 8).await;
        hub.subscribe(Identity::from("a"), id, "").await.unwrap();
        assert_eq!(hub.stats().await.unwrap().channels, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let hub = Hub::spawn(HubConfig::default(), None);
        let (id, mut a) = connect(&hub, "a", 8).await;
        hub.subscribe(Identity::from("a"), id, "orders:42").await.unwrap();
        hub.subscribe(Identity::from("a"), id, "orders:99").await.unwrap();
        hub.unsubscribe(Identity::from("a"), id, "orders:42").await.unwrap();

        hub.broadcast_to_channel("orders:42", frame("gone")).await.unwrap();
        hub.broadcast_to_channel("orders:99", frame("kept")).await.unwrap();
        hub.stats().await.unwrap();

        assert_eq!(a.try_next_frame().as_deref(), Some("kept"));
        assert!(a.try_next_frame().is_none());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_connection() {
        let hub = Hub::spawn(HubConfig::default(), None);
        let (old_id, mut old) = connect(&hub, "a", 8).await;
        hub.subscribe(Identity::from("a"), old_id, "orders:42").await.unwrap();

        let (new_id, mut new) = connect(&hub, "a", 8).await;
        assert_ne!(old_id, new_id);
        assert!(old.next_frame().await.is_none());
        assert!(hub.subscribers("orders:42").await.unwrap().is_empty());

        // late traffic from the replaced connection is ignored
        hub.subscribe(Identity::from("a"), old_id, "orders:7").await.unwrap();
        hub.unregister(Identity::from("a"), old_id).await.unwrap();
        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.channels, 0);

        hub.subscribe(Identity::from("a"), new_id, "orders:42").await.unwrap();
        hub.broadcast_to_channel("orders:42", frame("fresh")).await.unwrap();
        hub.stats().await.unwrap();
        assert_eq!(new.try_next_frame().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_broadcast_raw_drops_dead_writers() {
        let hub = Hub::spawn(HubConfig::default(), None);
        let (alive_id, mut alive) = connect(&hub, "alive", 8).await;
        let (dead_id, dead) = connect(&hub, "dead", 8).await;
        hub.subscribe(Identity::from("alive"), alive_id, "orders:1").await.unwrap();
        hub.subscribe(Identity::from("dead"), dead_id, "orders:1").await.unwrap();
        drop(dead);

        hub.broadcast_raw(frame("raw")).await.unwrap();

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
        assert_eq!(
            hub.subscribers("orders:1").await.unwrap(),
            vec![Identity::from("alive")]
        );
        assert_eq!(alive.try_next_frame().as_deref(), Some("raw"));
    }

    #[tokio::test]
    async fn test_subscribe_delivers_initial_snapshot() {
        let provider = RecordingProvider::new(false);
        let hub = Hub::spawn(HubConfig::default(), Some(provider.clone()));
        let (id, mut a) = connect(&hub, "a", 8).await;

        hub.subscribe(Identity::from("a"), id, "stats:biz1").await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), a.next_frame())
            .await
            .unwrap()
            .unwrap();
        let got: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(got["type"], "stats");
        assert_eq!(got["data"], json!({"totalCitas": 10, "citasHoy": 2}));

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*provider.subjects.lock().unwrap(), vec!["biz1".to_string()]);
        assert!(a.try_next_frame().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_failure_keeps_subscription() {
        let provider = RecordingProvider::new(true);
        let hub = Hub::spawn(HubConfig::default(), Some(provider.clone()));
        let (id, mut a) = connect(&hub, "a", 8).await;

        hub.subscribe(Identity::from("a"), id, "stats:biz1").await.unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(200), a.next_frame()).await;
        assert!(waited.is_err(), "no message expected after a failed fetch");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            hub.subscribers("stats:biz1").await.unwrap(),
            vec![Identity::from("a")]
        );
    }

    #[tokio::test]
    async fn test_plain_channel_skips_snapshot() {
        let provider = RecordingProvider::new(false);
        let hub = Hub::spawn(HubConfig::default(), Some(provider.clone()));
        let (id, _a) = connect(&hub, "a", 8).await;

        hub.subscribe(Identity::from("a"), id, "orders:42").await.unwrap();
        hub.stats().await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subscribed_subjects() {
        let hub = Hub::spawn(HubConfig::default(), None);
        let (a_id, _a) = connect(&hub, "a", 8).await;
        let (b_id, _b) = connect(&hub, "b", 8).await;
        hub.subscribe(Identity::from("a"), a_id, "estadisticas:42").await.unwrap();
        hub.subscribe(Identity::from("b"), b_id, "stats:42").await.unwrap();
        hub.subscribe(Identity::from("b"), b_id, "stats:7").await.unwrap();
        hub.subscribe(Identity::from("b"), b_id, "orders:1").await.unwrap();

        assert_eq!(
            hub.subscribed_subjects().await.unwrap(),
            vec!["42".to_string(), "7".to_string()]
        );
    }

    #[tokio::test]
    async fn test_undrained_direct_queue_evicts_connection() {
        let hub = Hub::spawn(HubConfig::default(), None);
        let (stalled_id, mut stalled) = connect(&hub, "stalled", 4).await;
        let (_, mut reader) = connect(&hub, "reader", 64).await;
        hub.subscribe(Identity::from("stalled"), stalled_id, "fila:1").await.unwrap();

        for n in 0..10 {
            hub.broadcast_all(Envelope::new(MessageKind::Chat, json!(n)))
                .await
                .unwrap();
        }

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.connections, 1);
        assert!(hub.subscribers("fila:1").await.unwrap().is_empty());

        // only what fit before the eviction, then the writer is told to stop
        for n in 0..4 {
            let got: Value = serde_json::from_str(&stalled.next_frame().await.unwrap()).unwrap();
            assert_eq!(got["data"], n);
        }
        assert!(stalled.next_frame().await.is_none());

        for n in 0..10 {
            let got: Value = serde_json::from_str(&reader.try_next_frame().unwrap()).unwrap();
            assert_eq!(got["data"], n);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_not_delivered_after_eviction() {
        let provider = RecordingProvider::new(false);
        let config = HubConfig::default();
        let delivery_timeout = config.snapshot_delivery_timeout;
        let hub = Hub::spawn(config, Some(provider.clone()));
        let (id, mut a) = connect(&hub, "a", 1).await;
        hub.subscribe(Identity::from("a"), id, "orders:1").await.unwrap();
        hub.broadcast_to_channel("orders:1", frame("fill")).await.unwrap();

        hub.subscribe(Identity::from("a"), id, "stats:biz1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        hub.broadcast_to_channel("orders:1", frame("overflow")).await.unwrap();
        tokio::time::sleep(delivery_timeout * 2).await;

        assert_eq!(a.next_frame().await.as_deref(), Some("fill"));
        assert!(a.next_frame().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_dropped_when_mailbox_stays_full() {
        let provider = RecordingProvider::new(false);
        let config = HubConfig::default();
        let delivery_timeout = config.snapshot_delivery_timeout;
        let hub = Hub::spawn(config, Some(provider.clone()));
        let (id, mut a) = connect(&hub, "a", 1).await;
        hub.subscribe(Identity::from("a"), id, "orders:1").await.unwrap();
        hub.broadcast_to_channel("orders:1", frame("fill")).await.unwrap();

        hub.subscribe(Identity::from("a"), id, "stats:biz1").await.unwrap();
        tokio::time::sleep(delivery_timeout + Duration::from_secs(1)).await;

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            hub.subscribers("stats:biz1").await.unwrap(),
            vec![Identity::from("a")]
        );
        assert_eq!(hub.stats().await.unwrap().connections, 1);

        assert_eq!(a.try_next_frame().as_deref(), Some("fill"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(a.try_next_frame().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_retries_until_mailbox_has_room() {
        let provider = RecordingProvider::new(false);
        let hub = Hub::spawn(HubConfig::default(), Some(provider.clone()));
        let (id, mut a) = connect(&hub, "a", 1).await;
        hub.subscribe(Identity::from("a"), id, "orders:1").await.unwrap();
        hub.broadcast_to_channel("orders:1", frame("fill")).await.unwrap();

        hub.subscribe(Identity::from("a"), id, "stats:biz1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(a.try_next_frame().as_deref(), Some("fill"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let got: Value = serde_json::from_str(&a.try_next_frame().unwrap()).unwrap();
        assert_eq!(got["type"], "stats");
        assert_eq!(got["channel"], "stats:biz1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_snapshot_fetch_gives_up() {
        let config = HubConfig::default();
        let fetch_timeout = config.snapshot_timeout;
        let hub = Hub::spawn(config, Some(Arc::new(SlowProvider(Duration::from_secs(30)))));
        let (id, mut a) = connect(&hub, "a", 8).await;

        hub.subscribe(Identity::from("a"), id, "stats:biz1").await.unwrap();
        tokio::time::sleep(fetch_timeout + Duration::from_secs(1)).await;
        assert!(a.try_next_frame().is_none());
        assert_eq!(
            hub.subscribers("stats:biz1").await.unwrap(),
            vec![Identity::from("a")]
        );

        // the abandoned fetch never produces a late frame
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(a.try_next_frame().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_skipped_after_unsubscribe() {
        let hub = Hub::spawn(
            HubConfig::default(),
            Some(Arc::new(SlowProvider(Duration::from_millis(50)))),
        );
        let (id, mut a) = connect(&hub, "a", 8).await;

        hub.subscribe(Identity::from("a"), id, "stats:biz1").await.unwrap();
        hub.unsubscribe(Identity::from("a"), id, "stats:biz1").await.unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(300), a.next_frame()).await;
        assert!(waited.is_err(), "no snapshot expected after unsubscribe");
    }
}
