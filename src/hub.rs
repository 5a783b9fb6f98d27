//! Connection registry.
//!
//! A single task owns the map of live connections. Sessions and command
//! senders talk to it through [`Hub`], which posts a [`HubCommand`] and waits
//! for the reply. Only getting the command into the queue is bounded by
//! `send_timeout`: once the loop has accepted a command its effect happens,
//! so the caller always learns the real outcome. Nothing outside the loop
//! touches the map.
//!
//! A connection whose outbound buffer is full is treated as dead: the loop
//! cancels its close token, drops it from the map, and reports the failure to
//! the caller. The loop itself never waits on a connection or on the status
//! cache; cache writes are queued to a separate worker and dropped when that
//! queue is full.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{ConnectionStatus, StatusCache};
use crate::config::{DuplicatePolicy, HubConfig};
use crate::protocol::OutboundMessage;

/// A serialized frame ready for the socket.
pub type Frame = Arc<str>;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("device {0} is not connected")]
    NotConnected(String),
    #[error("outbound buffer full for device {0}, connection evicted")]
    BufferFull(String),
    #[error("device {0} already has a live connection")]
    DeviceAlreadyConnected(String),
    #[error("connection already authenticated as {0}")]
    AlreadyAuthenticated(String),
    #[error("unknown connection {0}")]
    UnknownConnection(Uuid),
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The command was never queued; it had no effect.
    #[error("hub did not accept the command within {0:?}")]
    Timeout(Duration),
    #[error("hub is shut down")]
    Closed,
}

/// The hub's view of one live connection: an identity, a bounded outbound
/// buffer, and a close signal shared with the session's pumps.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: Uuid,
    outbound: mpsc::Sender<Frame>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: Uuid::new_v4(),
                outbound,
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cancelled when the hub closes or evicts this connection.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Enqueue a frame without waiting.
    pub fn try_enqueue(&self, frame: Frame) -> Result<(), TrySendError<Frame>> {
        self.outbound.try_send(frame)
    }
}

/// Snapshot of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Live connections, authenticated or not.
    pub connected_clients: usize,
    /// Distinct device ids bound to at least one connection.
    pub active_devices: usize,
    /// Bound connections per device id.
    pub per_device: BTreeMap<String, usize>,
}

enum HubCommand {
    Register {
        conn: ConnectionHandle,
        reply: oneshot::Sender<()>,
    },
    Bind {
        conn_id: Uuid,
        device_id: String,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Unregister {
        conn_id: Uuid,
        reply: Option<oneshot::Sender<bool>>,
    },
    SendToDevice {
        device_id: String,
        frame: Frame,
        reply: oneshot::Sender<Result<Uuid, HubError>>,
    },
    Broadcast {
        frame: Frame,
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable handle to the registry task.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::Sender<HubCommand>,
    stats: watch::Receiver<HubStats>,
    send_timeout: Duration,
}

impl Hub {
    /// Start the registry loop. It runs until `shutdown` fires, then closes
    /// every connection it still holds. The returned task also waits for the
    /// status cache worker to apply the writes queued before shutdown.
    pub fn spawn(
        config: &HubConfig,
        cache: Arc<dyn StatusCache>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        let (stats_tx, stats_rx) = watch::channel(HubStats::default());
        let (status, status_task) = StatusSync::spawn(cache, config.command_buffer);
        let registry = Registry {
            entries: HashMap::new(),
            next_seq: 0,
            policy: config.duplicate_policy,
            status,
            stats: stats_tx,
        };
        let handle = tokio::spawn(async move {
            registry.run(rx, shutdown).await;
            let _ = status_task.await;
        });
        (
            Self {
                tx,
                stats: stats_rx,
                send_timeout: config.send_timeout(),
            },
            handle,
        )
    }

    pub async fn register(&self, conn: ConnectionHandle) -> Result<(), HubError> {
        self.request(|reply| HubCommand::Register { conn, reply })
            .await
    }

    /// Bind an authenticated device id to a registered connection, applying
    /// the duplicate-device policy.
    pub async fn bind(&self, conn_id: Uuid, device_id: &str) -> Result<(), HubError> {
        let device_id = device_id.to_string();
        self.request(|reply| HubCommand::Bind {
            conn_id,
            device_id,
            reply,
        })
        .await?
    }

    /// Remove a connection. Returns `false` if it was already gone.
    pub async fn unregister(&self, conn_id: Uuid) -> Result<bool, HubError> {
        self.request(|reply| HubCommand::Unregister {
            conn_id,
            reply: Some(reply),
        })
        .await
    }

    /// Fire-and-forget unregistration for cleanup paths that cannot await.
    pub fn unregister_detached(&self, conn_id: Uuid) {
        let cmd = HubCommand::Unregister {
            conn_id,
            reply: None,
        };
        match self.tx.try_send(cmd) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(cmd)) => {
                let tx = self.tx.clone();
                if let Ok(rt) = tokio::runtime::Handle::try_current() {
                    rt.spawn(async move {
                        let _ = tx.send(cmd).await;
                    });
                }
            }
        }
    }

    /// Serialize `msg` and hand it to the device's connection. `Ok` means the
    /// frame is in the outbound buffer, not that the device received it.
    pub async fn send_to_device(
        &self,
        device_id: &str,
        msg: &OutboundMessage,
    ) -> Result<Uuid, HubError> {
        let frame: Frame = msg.to_json()?.into();
        self.send_frame_to_device(device_id, frame).await
    }

    pub async fn send_frame_to_device(
        &self,
        device_id: &str,
        frame: Frame,
    ) -> Result<Uuid, HubError> {
        let device_id = device_id.to_string();
        self.request(|reply| HubCommand::SendToDevice {
            device_id,
            frame,
            reply,
        })
        .await?
    }

    /// Enqueue `msg` on every live connection. Returns how many accepted it.
    pub async fn broadcast(&self, msg: &OutboundMessage) -> Result<usize, HubError> {
        let frame: Frame = msg.to_json()?.into();
        self.request(|reply| HubCommand::Broadcast { frame, reply })
            .await
    }

    /// Latest published snapshot. Never waits on the registry loop.
    pub fn stats(&self) -> HubStats {
        self.stats.borrow().clone()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send_timeout(build(reply), self.send_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => HubError::Timeout(self.send_timeout),
                SendTimeoutError::Closed(_) => HubError::Closed,
            })?;
        // Accepted: the loop replies without waiting on anything external.
        rx.await.map_err(|_| HubError::Closed)
    }

    /// A hub whose loop never drains its full queue, so every call times out.
    #[cfg(test)]
    pub(crate) fn stalled(send_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let (reply, _) = oneshot::channel();
        let _ = tx.try_send(HubCommand::Broadcast {
            frame: Frame::from(""),
            reply,
        });
        tokio::spawn(async move {
            let _rx = rx;
            std::future::pending::<()>().await;
        });
        let (_, stats) = watch::channel(HubStats::default());
        Self {
            tx,
            stats,
            send_timeout,
        }
    }
}

enum StatusUpdate {
    Online {
        device_id: String,
        conn_id: Uuid,
    },
    Released {
        device_id: String,
        conn_id: Uuid,
        /// No other live connection holds the device.
        offline: bool,
    },
}

impl StatusUpdate {
    fn device_id(&self) -> &str {
        match self {
            Self::Online { device_id, .. } | Self::Released { device_id, .. } => device_id,
        }
    }
}

/// Queue of status cache writes owned by the registry.
struct StatusSync {
    tx: mpsc::Sender<StatusUpdate>,
}

impl StatusSync {
    /// The worker exits once the registry drops its sender.
    fn spawn(cache: Arc<dyn StatusCache>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<StatusUpdate>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                apply_status(cache.as_ref(), update).await;
            }
            debug!("Status cache worker stopped");
        });
        (Self { tx }, handle)
    }

    fn push(&self, update: StatusUpdate) {
        match self.tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(update)) => {
                warn!(
                    device_id = update.device_id(),
                    "Status cache queue full, dropping update"
                );
            }
            Err(TrySendError::Closed(update)) => {
                warn!(
                    device_id = update.device_id(),
                    "Status cache worker gone, dropping update"
                );
            }
        }
    }
}

async fn apply_status(cache: &dyn StatusCache, update: StatusUpdate) {
    match update {
        StatusUpdate::Online { device_id, conn_id } => {
            if let Err(e) = cache.set_status(&device_id, ConnectionStatus::Online).await {
                warn!(device_id = %device_id, error = %e, "Failed to mark device online");
            }
            if let Err(e) = cache.set_connection(&device_id, conn_id).await {
                warn!(device_id = %device_id, error = %e, "Failed to record connection mapping");
            }
        }
        StatusUpdate::Released {
            device_id,
            conn_id,
            offline,
        } => {
            if let Err(e) = cache.remove_connection(&device_id, conn_id).await {
                warn!(device_id = %device_id, error = %e, "Failed to clear connection mapping");
            }
            if offline {
                if let Err(e) = cache.set_status(&device_id, ConnectionStatus::Offline).await {
                    warn!(device_id = %device_id, error = %e, "Failed to mark device offline");
                }
            }
        }
    }
}

struct Entry {
    handle: ConnectionHandle,
    device_id: Option<String>,
    /// Registration order; the lowest wins when several connections share a
    /// device id.
    seq: u64,
}

struct Registry {
    entries: HashMap<Uuid, Entry>,
    next_seq: u64,
    policy: DuplicatePolicy,
    status: StatusSync,
    stats: watch::Sender<HubStats>,
}

impl Registry {
    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>, shutdown: CancellationToken) {
        loop {
            let cmd = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            self.handle(cmd);
        }

        let ids: Vec<Uuid> = self.entries.keys().copied().collect();
        info!(connections = ids.len(), "Hub shutting down, closing connections");
        for id in ids {
            self.remove(id, "hub shutting down");
        }
        self.publish_stats();
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register { conn, reply } => {
                let id = conn.id();
                self.next_seq += 1;
                self.entries.insert(
                    id,
                    Entry {
                        handle: conn,
                        device_id: None,
                        seq: self.next_seq,
                    },
                );
                debug!(conn = %id, "Connection registered");
                self.publish_stats();
                let _ = reply.send(());
            }
            HubCommand::Bind {
                conn_id,
                device_id,
                reply,
            } => {
                let result = self.bind(conn_id, device_id);
                self.publish_stats();
                let _ = reply.send(result);
            }
            HubCommand::Unregister { conn_id, reply } => {
                let removed = self.remove(conn_id, "unregistered");
                self.publish_stats();
                if let Some(reply) = reply {
                    let _ = reply.send(removed);
                }
            }
            HubCommand::SendToDevice {
                device_id,
                frame,
                reply,
            } => {
                let result = self.send_to_device(&device_id, frame);
                self.publish_stats();
                let _ = reply.send(result);
            }
            HubCommand::Broadcast { frame, reply } => {
                let delivered = self.broadcast(&frame);
                self.publish_stats();
                let _ = reply.send(delivered);
            }
        }
    }

    fn bind(&mut self, conn_id: Uuid, device_id: String) -> Result<(), HubError> {
        match self.entries.get(&conn_id) {
            None => return Err(HubError::UnknownConnection(conn_id)),
            Some(Entry {
                device_id: Some(bound),
                ..
            }) => return Err(HubError::AlreadyAuthenticated(bound.clone())),
            Some(_) => {}
        }

        let prior: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(id, e)| **id != conn_id && e.device_id.as_deref() == Some(&device_id))
            .map(|(id, _)| *id)
            .collect();

        if !prior.is_empty() {
            match self.policy {
                DuplicatePolicy::EvictPrior => {
                    warn!(
                        device_id = %device_id,
                        stale = prior.len(),
                        "Device re-authenticating while stale connection exists, evicting old"
                    );
                    for id in prior {
                        if let Some(entry) = self.entries.remove(&id) {
                            entry.handle.closed.cancel();
                        }
                    }
                }
                DuplicatePolicy::RejectNew => {
                    warn!(device_id = %device_id, "Rejecting auth, device already connected");
                    return Err(HubError::DeviceAlreadyConnected(device_id));
                }
                DuplicatePolicy::Allow => {
                    warn!(
                        device_id = %device_id,
                        live = prior.len() + 1,
                        "Device now has multiple live connections"
                    );
                }
            }
        }

        if let Some(entry) = self.entries.get_mut(&conn_id) {
            entry.device_id = Some(device_id.clone());
        }
        info!(device_id = %device_id, conn = %conn_id, "Device bound to connection");
        self.status.push(StatusUpdate::Online { device_id, conn_id });
        Ok(())
    }

    /// Drop a connection and close it. Returns `false` if it was not present.
    fn remove(&mut self, conn_id: Uuid, reason: &str) -> bool {
        let Some(entry) = self.entries.remove(&conn_id) else {
            return false;
        };
        entry.handle.closed.cancel();

        if let Some(device_id) = entry.device_id {
            let still_live = self
                .entries
                .values()
                .any(|e| e.device_id.as_deref() == Some(device_id.as_str()));
            info!(device_id = %device_id, conn = %conn_id, reason, "Device connection removed");
            self.status.push(StatusUpdate::Released {
                device_id,
                conn_id,
                offline: !still_live,
            });
        } else {
            debug!(conn = %conn_id, reason, "Connection removed");
        }
        true
    }

    fn send_to_device(&mut self, device_id: &str, frame: Frame) -> Result<Uuid, HubError> {
        let target = self
            .entries
            .iter()
            .filter(|(_, e)| e.device_id.as_deref() == Some(device_id))
            .min_by_key(|(_, e)| e.seq)
            .map(|(id, e)| (*id, e.handle.try_enqueue(frame)));

        match target {
            None => Err(HubError::NotConnected(device_id.to_string())),
            Some((id, Ok(()))) => Ok(id),
            Some((id, Err(TrySendError::Full(_)))) => {
                warn!(device_id, conn = %id, "Outbound buffer full, evicting connection");
                self.remove(id, "outbound buffer full");
                Err(HubError::BufferFull(device_id.to_string()))
            }
            Some((id, Err(TrySendError::Closed(_)))) => {
                self.remove(id, "outbound buffer closed");
                Err(HubError::NotConnected(device_id.to_string()))
            }
        }
    }

    fn broadcast(&mut self, frame: &Frame) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, entry) in &self.entries {
            match entry.handle.try_enqueue(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => dead.push(*id),
            }
        }
        for id in dead {
            warn!(conn = %id, "Failed to broadcast to connection, evicting");
            self.remove(id, "broadcast send failed");
        }
        delivered
    }

    /// Called before every reply so a caller that saw the reply also sees
    /// the matching snapshot.
    fn publish_stats(&self) {
        let mut per_device = BTreeMap::new();
        for device_id in self.entries.values().filter_map(|e| e.device_id.as_ref()) {
            *per_device.entry(device_id.clone()).or_insert(0) += 1;
        }
        let snapshot = HubStats {
            connected_clients: self.entries.len(),
            active_devices: per_device.len(),
            per_device,
        };
        self.stats.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, MemoryStatusCache};

    fn config(policy: DuplicatePolicy) -> HubConfig {
        HubConfig {
            outbound_buffer: 4,
            duplicate_policy: policy,
            ..HubConfig::default()
        }
    }

    fn cache() -> Arc<MemoryStatusCache> {
        Arc::new(MemoryStatusCache::new(
            Duration::from_secs(300),
            Duration::from_secs(86_400),
        ))
    }

    fn sms(n: u64) -> OutboundMessage {
        OutboundMessage::SendSms {
            target: "+905551112233".into(),
            message: format!("m{n}"),
            sim_slot: 0,
            internal_log_id: n,
        }
    }

    async fn connect(hub: &Hub, device_id: &str) -> (ConnectionHandle, mpsc::Receiver<Frame>) {
        let (conn, rx) = ConnectionHandle::new(4);
        hub.register(conn.clone()).await.unwrap();
        hub.bind(conn.id(), device_id).await.unwrap();
        (conn, rx)
    }

    /// Cache writes land after the hub replies; poll until the worker
    /// catches up. Updates apply in order, so once `device_id` shows `want`
    /// every earlier write is visible too.
    async fn wait_for_status(cache: &MemoryStatusCache, device_id: &str, want: ConnectionStatus) {
        for _ in 0..200 {
            if cache.status(device_id).await.unwrap() == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{device_id} never became {want:?}");
    }

    /// Bind a throwaway device and wait for it, flushing every earlier write.
    async fn settle(
        hub: &Hub,
        cache: &MemoryStatusCache,
    ) -> (ConnectionHandle, mpsc::Receiver<Frame>) {
        let marker = connect(hub, "SETTLE").await;
        wait_for_status(cache, "SETTLE", ConnectionStatus::Online).await;
        marker
    }

    /// Fails every call.
    struct DownCache;

    #[async_trait::async_trait]
    impl StatusCache for DownCache {
        async fn set_status(&self, _: &str, _: ConnectionStatus) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn status(&self, _: &str) -> Result<Option<ConnectionStatus>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn set_connection(&self, _: &str, _: Uuid) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn connection(&self, _: &str) -> Result<Option<Uuid>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn remove_connection(&self, _: &str, _: Uuid) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    /// Hangs for a minute on every write for `slow`, delegates otherwise.
    struct SlowCache {
        slow: &'static str,
        inner: MemoryStatusCache,
    }

    #[async_trait::async_trait]
    impl StatusCache for SlowCache {
        async fn set_status(
            &self,
            device_id: &str,
            status: ConnectionStatus,
        ) -> Result<(), CacheError> {
            if device_id == self.slow {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            self.inner.set_status(device_id, status).await
        }
        async fn status(&self, device_id: &str) -> Result<Option<ConnectionStatus>, CacheError> {
            self.inner.status(device_id).await
        }
        async fn set_connection(&self, device_id: &str, conn: Uuid) -> Result<(), CacheError> {
            self.inner.set_connection(device_id, conn).await
        }
        async fn connection(&self, device_id: &str) -> Result<Option<Uuid>, CacheError> {
            self.inner.connection(device_id).await
        }
        async fn remove_connection(&self, device_id: &str, conn: Uuid) -> Result<(), CacheError> {
            self.inner.remove_connection(device_id, conn).await
        }
    }

    #[tokio::test]
    async fn test_register_unregister_marks_offline() {
        let cache = cache();
        let (hub, _task) = Hub::spawn(
            &config(DuplicatePolicy::EvictPrior),
            cache.clone(),
            CancellationToken::new(),
        );
        let (conn, _rx) = connect(&hub, "DEV1").await;
        assert_eq!(hub.stats().connected_clients, 1);
        wait_for_status(&cache, "DEV1", ConnectionStatus::Online).await;
        assert_eq!(cache.connection("DEV1").await.unwrap(), Some(conn.id()));

        assert!(hub.unregister(conn.id()).await.unwrap());
        assert_eq!(hub.stats(), HubStats::default());
        wait_for_status(&cache, "DEV1", ConnectionStatus::Offline).await;
        assert_eq!(cache.connection("DEV1").await.unwrap(), None);
        assert!(conn.closed().is_cancelled());

        // Second unregister of the same identity is a no-op.
        assert!(!hub.unregister(conn.id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_send_to_unknown_device_fails_promptly() {
        let (hub, _task) = Hub::spawn(
            &config(DuplicatePolicy::EvictPrior),
            cache(),
            CancellationToken::new(),
        );
        let result =
            tokio::time::timeout(Duration::from_secs(1), hub.send_to_device("nope", &sms(1)))
                .await
                .expect("send must not block");
        assert!(matches!(result, Err(HubError::NotConnected(id)) if id == "nope"));
    }

    #[tokio::test]
    async fn test_unauthenticated_connection_is_not_routable() {
        let (hub, _task) = Hub::spawn(
            &config(DuplicatePolicy::EvictPrior),
            cache(),
            CancellationToken::new(),
        );
        let (conn, _rx) = ConnectionHandle::new(4);
        hub.register(conn).await.unwrap();
        assert!(matches!(
            hub.send_to_device("", &sms(1)).await,
            Err(HubError::NotConnected(_))
        ));
        let stats = hub.stats();
        assert_eq!(stats.connected_clients, 1);
        assert_eq!(stats.active_devices, 0);
    }

    #[tokio::test]
    async fn test_sends_arrive_in_call_order() {
        let (hub, _task) = Hub::spawn(
            &HubConfig {
                outbound_buffer: 64,
                ..HubConfig::default()
            },
            cache(),
            CancellationToken::new(),
        );
        let (conn, mut rx) = ConnectionHandle::new(64);
        hub.register(conn.clone()).await.unwrap();
        hub.bind(conn.id(), "DEV1").await.unwrap();
        for n in 0..50 {
            hub.send_to_device("DEV1", &sms(n)).await.unwrap();
        }
        for n in 0..50 {
            let frame = rx.recv().await.unwrap();
            let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(v["internalLogId"], n);
        }
    }

    #[tokio::test]
    async fn test_full_buffer_evicts_connection() {
        let cache = cache();
        let (hub, _task) = Hub::spawn(
            &config(DuplicatePolicy::EvictPrior),
            cache.clone(),
            CancellationToken::new(),
        );
        let (conn, _rx) = connect(&hub, "DEV1").await;
        for n in 0..4 {
            hub.send_to_device("DEV1", &sms(n)).await.unwrap();
        }
        let err = hub.send_to_device("DEV1", &sms(4)).await.unwrap_err();
        assert!(matches!(err, HubError::BufferFull(_)));
        assert!(conn.closed().is_cancelled());
        assert_eq!(hub.stats().connected_clients, 0);
        wait_for_status(&cache, "DEV1", ConnectionStatus::Offline).await;
        // Evicted, so the next attempt is a plain not-connected.
        assert!(matches!(
            hub.send_to_device("DEV1", &sms(5)).await,
            Err(HubError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_and_evicts_full() {
        let (hub, _task) = Hub::spawn(
            &config(DuplicatePolicy::EvictPrior),
            cache(),
            CancellationToken::new(),
        );
        let (_a, mut rx_a) = connect(&hub, "DEV1").await;
        let (b, _rx_b) = ConnectionHandle::new(1);
        hub.register(b.clone()).await.unwrap();
        hub.bind(b.id(), "DEV2").await.unwrap();
        let (c, mut rx_c) = ConnectionHandle::new(4);
        hub.register(c).await.unwrap();

        let alarm = OutboundMessage::Alarm {
            title: "t".into(),
            message: "m".into(),
        };
        assert_eq!(hub.broadcast(&alarm).await.unwrap(), 3);
        // b has capacity 1 and is now full.
        assert_eq!(hub.broadcast(&alarm).await.unwrap(), 2);
        assert!(b.closed().is_cancelled());
        assert_eq!(hub.stats().connected_clients, 2);
        assert!(rx_a.recv().await.is_some());
        assert!(rx_c.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_policy_evict_prior() {
        let cache = cache();
        let (hub, _task) = Hub::spawn(
            &config(DuplicatePolicy::EvictPrior),
            cache.clone(),
            CancellationToken::new(),
        );
        let (old, _old_rx) = connect(&hub, "DEV1").await;
        let (new, mut new_rx) = connect(&hub, "DEV1").await;
        assert!(old.closed().is_cancelled());
        assert!(!new.closed().is_cancelled());
        assert_eq!(hub.stats().per_device.get("DEV1"), Some(&1));

        let routed = hub.send_to_device("DEV1", &sms(1)).await.unwrap();
        assert_eq!(routed, new.id());
        assert!(new_rx.recv().await.is_some());

        // The stale session's cleanup must not knock the new one offline.
        assert!(!hub.unregister(old.id()).await.unwrap());
        let _marker = settle(&hub, &cache).await;
        assert_eq!(
            cache.status("DEV1").await.unwrap(),
            Some(ConnectionStatus::Online)
        );
        assert_eq!(cache.connection("DEV1").await.unwrap(), Some(new.id()));
    }

    #[tokio::test]
    async fn test_duplicate_policy_reject_new() {
        let (hub, _task) = Hub::spawn(
            &config(DuplicatePolicy::RejectNew),
            cache(),
            CancellationToken::new(),
        );
        let (old, _old_rx) = connect(&hub, "DEV1").await;
        let (new, _new_rx) = ConnectionHandle::new(4);
        hub.register(new.clone()).await.unwrap();
        let err = hub.bind(new.id(), "DEV1").await.unwrap_err();
        assert!(matches!(err, HubError::DeviceAlreadyConnected(_)));
        assert!(!old.closed().is_cancelled());
        let stats = hub.stats();
        assert_eq!(stats.connected_clients, 2);
        assert_eq!(stats.per_device.get("DEV1"), Some(&1));

        // Once the prior connection is gone the device can bind again.
        hub.unregister(old.id()).await.unwrap();
        hub.bind(new.id(), "DEV1").await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_policy_allow_routes_to_first_registered() {
        let cache = cache();
        let (hub, _task) = Hub::spawn(
            &config(DuplicatePolicy::Allow),
            cache.clone(),
            CancellationToken::new(),
        );
        let (first, mut first_rx) = connect(&hub, "DEV1").await;
        let (second, _second_rx) = connect(&hub, "DEV1").await;
        let stats = hub.stats();
        assert_eq!(stats.connected_clients, 2);
        assert_eq!(stats.active_devices, 1);
        assert_eq!(stats.per_device.get("DEV1"), Some(&2));

        assert_eq!(hub.send_to_device("DEV1", &sms(1)).await.unwrap(), first.id());
        assert!(first_rx.recv().await.is_some());

        // Dropping one of the two keeps the device online.
        hub.unregister(first.id()).await.unwrap();
        let _marker = settle(&hub, &cache).await;
        assert_eq!(
            cache.status("DEV1").await.unwrap(),
            Some(ConnectionStatus::Online)
        );
        assert_eq!(hub.send_to_device("DEV1", &sms(2)).await.unwrap(), second.id());
    }

    #[tokio::test]
    async fn test_rebind_is_rejected() {
        let (hub, _task) = Hub::spawn(
            &config(DuplicatePolicy::EvictPrior),
            cache(),
            CancellationToken::new(),
        );
        let (conn, _rx) = connect(&hub, "DEV1").await;
        assert!(matches!(
            hub.bind(conn.id(), "DEV2").await,
            Err(HubError::AlreadyAuthenticated(d)) if d == "DEV1"
        ));
        assert!(matches!(
            hub.bind(Uuid::new_v4(), "DEV2").await,
            Err(HubError::UnknownConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_connection() {
        let shutdown = CancellationToken::new();
        let cache = cache();
        let (hub, task) = Hub::spawn(
            &config(DuplicatePolicy::EvictPrior),
            cache.clone(),
            shutdown.clone(),
        );
        let (a, _ra) = connect(&hub, "DEV1").await;
        let (b, _rb) = connect(&hub, "DEV2").await;
        shutdown.cancel();
        task.await.unwrap();
        assert!(a.closed().is_cancelled() && b.closed().is_cancelled());
        assert_eq!(
            cache.status("DEV2").await.unwrap(),
            Some(ConnectionStatus::Offline)
        );
        assert!(matches!(
            hub.send_to_device("DEV1", &sms(1)).await,
            Err(HubError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_failing_cache_does_not_affect_routing() {
        let (hub, _task) = Hub::spawn(
            &config(DuplicatePolicy::EvictPrior),
            Arc::new(DownCache),
            CancellationToken::new(),
        );
        let (conn, mut rx) = connect(&hub, "DEV1").await;
        assert_eq!(hub.send_to_device("DEV1", &sms(1)).await.unwrap(), conn.id());
        assert!(rx.recv().await.is_some());
        assert!(hub.unregister(conn.id()).await.unwrap());
        assert_eq!(hub.stats(), HubStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cache_does_not_stall_other_devices() {
        let cache = Arc::new(SlowCache {
            slow: "SLOW",
            inner: MemoryStatusCache::new(Duration::from_secs(300), Duration::from_secs(300)),
        });
        let (hub, _task) = Hub::spawn(
            &config(DuplicatePolicy::EvictPrior),
            cache.clone(),
            CancellationToken::new(),
        );
        let started = tokio::time::Instant::now();
        let (_slow, _slow_rx) = connect(&hub, "SLOW").await;
        let (conn, mut rx) = connect(&hub, "DEV1").await;
        assert_eq!(hub.send_to_device("DEV1", &sms(1)).await.unwrap(), conn.id());
        assert!(rx.recv().await.is_some());
        // Virtual time only moves when every task is idle waiting on a timer.
        assert!(started.elapsed() < Duration::from_secs(1));

        // The queued write for DEV1 lands once the slow one finishes.
        tokio::time::sleep(Duration::from_secs(61)).await;
        wait_for_status(&cache.inner, "DEV1", ConnectionStatus::Online).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_queue_times_out_without_effect() {
        let hub = Hub::stalled(Duration::from_millis(200));
        let started = tokio::time::Instant::now();
        let err = hub.send_to_device("DEV1", &sms(1)).await.unwrap_err();
        assert!(matches!(err, HubError::Timeout(d) if d == Duration::from_millis(200)));
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    /// Deterministic xorshift so the fuzz trace is reproducible.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fuzz_leaves_consistent_state() {
        let (hub, _task) = Hub::spawn(
            &HubConfig {
                outbound_buffer: 64,
                duplicate_policy: DuplicatePolicy::Allow,
                ..HubConfig::default()
            },
            cache(),
            CancellationToken::new(),
        );

        let mut workers = Vec::new();
        for w in 0..8u64 {
            let hub = hub.clone();
            workers.push(tokio::spawn(async move {
                let mut rng = Rng(0x9E37_79B9_7F4A_7C15 ^ (w + 1));
                let mut live: Vec<(ConnectionHandle, mpsc::Receiver<Frame>)> = Vec::new();
                for _ in 0..200 {
                    match rng.next() % 5 {
                        0 | 1 => {
                            let (conn, rx) = ConnectionHandle::new(64);
                            hub.register(conn.clone()).await.unwrap();
                            let device = format!("DEV{}", rng.next() % 6);
                            // May already be evicted by another worker's broadcast.
                            let _ = hub.bind(conn.id(), &device).await;
                            live.push((conn, rx));
                        }
                        2 if !live.is_empty() => {
                            let i = usize::try_from(rng.next()).unwrap() % live.len();
                            let (conn, _rx) = live.swap_remove(i);
                            hub.unregister(conn.id()).await.unwrap();
                        }
                        3 => {
                            let device = format!("DEV{}", rng.next() % 6);
                            let _ = hub.send_to_device(&device, &sms(1)).await;
                        }
                        _ => {
                            let _ = hub
                                .broadcast(&OutboundMessage::Alarm {
                                    title: "t".into(),
                                    message: "m".into(),
                                })
                                .await;
                        }
                    }
                    for (_, rx) in &mut live {
                        while rx.try_recv().is_ok() {}
                    }
                }
                for (conn, _rx) in live {
                    hub.unregister(conn.id()).await.unwrap();
                }
            }));
        }
        for w in workers {
            w.await.unwrap();
        }

        assert_eq!(hub.stats(), HubStats::default());
    }

    #[tokio::test]
    async fn test_sequential_trace_matches_model() {
        let (hub, _task) = Hub::spawn(
            &HubConfig {
                outbound_buffer: 1024,
                duplicate_policy: DuplicatePolicy::Allow,
                ..HubConfig::default()
            },
            cache(),
            CancellationToken::new(),
        );
        let mut rng = Rng(42);
        // Model: connection -> bound device, in registration order.
        let mut model: Vec<(Uuid, String)> = Vec::new();
        let mut receivers: HashMap<Uuid, mpsc::Receiver<Frame>> = HashMap::new();

        for _ in 0..500 {
            match rng.next() % 3 {
                0 => {
                    let (conn, rx) = ConnectionHandle::new(1024);
                    let device = format!("DEV{}", rng.next() % 4);
                    hub.register(conn.clone()).await.unwrap();
                    hub.bind(conn.id(), &device).await.unwrap();
                    model.push((conn.id(), device));
                    receivers.insert(conn.id(), rx);
                }
                1 if !model.is_empty() => {
                    let i = usize::try_from(rng.next()).unwrap() % model.len();
                    let (id, _) = model.remove(i);
                    receivers.remove(&id);
                    assert!(hub.unregister(id).await.unwrap());
                }
                _ => {
                    let device = format!("DEV{}", rng.next() % 4);
                    let expected = model.iter().find(|(_, d)| *d == device).map(|(id, _)| *id);
                    match (hub.send_to_device(&device, &sms(7)).await, expected) {
                        (Ok(got), Some(want)) => assert_eq!(got, want),
                        (Err(HubError::NotConnected(_)), None) => {}
                        (got, want) => panic!("hub returned {got:?}, model expected {want:?}"),
                    }
                }
            }
            let stats = hub.stats();
            assert_eq!(stats.connected_clients, model.len());
        }
    }
}
