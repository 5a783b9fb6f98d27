//! Device WebSocket sessions.
//!
//! ## Connection lifecycle
//!
//! 1. Device connects to `GET /ws`. The connection is registered with the hub
//!    unauthenticated.
//! 2. Device sends `auth` with its connect key. On a match the hub binds the
//!    device id and the session replies `auth_response {success: true, ...}`.
//!    On no match the reply is `{success: false}` and the socket stays open.
//! 3. Every other frame is decoded and handed to the
//!    [`MessageRouter`](crate::router::MessageRouter).
//! 4. The session ends on transport error, client close, read-deadline expiry,
//!    too many consecutive malformed frames, or when the hub closes it.
//!    Unregistration always runs, including on panic.
//!
//! The write pump drains the connection's outbound buffer and sends a ping
//! every keepalive interval. Any inbound frame, pongs included, renews the
//! read deadline.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};

use crate::hub::{ConnectionHandle, Frame, Hub};
use crate::models::DeviceUpdate;
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::router::MessageRouter;
use crate::store::Store;
use crate::util::now_ms;
use crate::AppState;

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    ClientClosed,
    TransportError,
    DeadlineExceeded,
    TooManyMalformed,
    /// Closed by the hub (eviction, shutdown) or by a failed write.
    Closed,
}

impl SessionEnd {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::TooManyMalformed => "too_many_malformed",
            Self::Closed => "closed",
        }
    }
}

/// `GET /ws`: upgrade a device connection.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let max_frame = state.config.hub.max_frame_bytes;
    ws.max_message_size(max_frame).on_upgrade(move |socket| {
        let (conn, outbound) = ConnectionHandle::new(state.config.hub.outbound_buffer);
        let span = info_span!("device_session", conn = %conn.id(), device_id = field::Empty);
        run_session(socket, state, conn, outbound).instrument(span)
    })
}

/// Unregisters the connection if the session future is dropped or panics
/// before the normal cleanup runs.
struct UnregisterGuard {
    hub: Hub,
    conn: ConnectionHandle,
    armed: bool,
}

impl Drop for UnregisterGuard {
    fn drop(&mut self) {
        if self.armed {
            self.conn.closed().cancel();
            self.hub.unregister_detached(self.conn.id());
        }
    }
}

async fn run_session(
    socket: WebSocket,
    state: AppState,
    conn: ConnectionHandle,
    outbound: mpsc::Receiver<Frame>,
) {
    let hub_cfg = &state.config.hub;
    if let Err(e) = state.hub.register(conn.clone()).await {
        error!(error = %e, "Failed to register connection");
        return;
    }
    let mut guard = UnregisterGuard {
        hub: state.hub.clone(),
        conn: conn.clone(),
        armed: true,
    };
    info!("Device connected");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(
        write_pump(
            sink,
            outbound,
            conn.closed().clone(),
            hub_cfg.keepalive_interval(),
            hub_cfg.write_timeout(),
        )
        .in_current_span(),
    );

    let mut session = Session::new(
        conn.clone(),
        state.hub.clone(),
        state.store.clone(),
        state.router.clone(),
        hub_cfg.read_deadline(),
        hub_cfg.max_malformed_frames,
    );
    let end = session.read_pump(stream).await;

    conn.closed().cancel();
    if let Err(e) = state.hub.unregister(conn.id()).await {
        warn!(error = %e, "Unregister failed, falling back to detached cleanup");
    } else {
        guard.armed = false;
    }
    let _ = writer.await;
    info!(
        reason = end.as_str(),
        device_id = session.device_id().unwrap_or(""),
        "Device disconnected"
    );
}

/// Drains the outbound buffer into the socket and emits keepalive pings.
/// Sends a close frame on the way out. A failed or timed-out write cancels
/// `closed` so the read side stops too.
pub(crate) async fn write_pump<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Frame>,
    closed: CancellationToken,
    keepalive: Duration,
    write_timeout: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let msg = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => Message::Text(frame.as_ref().into()),
                None => break,
            },
            _ = ticker.tick() => Message::Ping(Bytes::new()),
        };
        match tokio::time::timeout(write_timeout, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "WebSocket write failed");
                closed.cancel();
                return;
            }
            Err(_) => {
                warn!(timeout = ?write_timeout, "WebSocket write timed out");
                closed.cancel();
                return;
            }
        }
    }

    let _ = tokio::time::timeout(write_timeout, sink.send(Message::Close(None))).await;
}

/// Read-side state of one connection.
pub struct Session {
    conn: ConnectionHandle,
    hub: Hub,
    store: Arc<dyn Store>,
    router: Arc<MessageRouter>,
    device_id: Option<String>,
    last_activity: Instant,
    read_deadline: Duration,
    max_malformed: u32,
}

impl Session {
    pub fn new(
        conn: ConnectionHandle,
        hub: Hub,
        store: Arc<dyn Store>,
        router: Arc<MessageRouter>,
        read_deadline: Duration,
        max_malformed: u32,
    ) -> Self {
        Self {
            conn,
            hub,
            store,
            router,
            device_id: None,
            last_activity: Instant::now(),
            read_deadline,
            max_malformed: max_malformed.max(1),
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Read frames until the session has to end.
    pub async fn read_pump<St>(&mut self, mut stream: St) -> SessionEnd
    where
        St: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let closed = self.conn.closed().clone();
        let mut malformed = 0u32;

        loop {
            let next = tokio::select! {
                biased;
                () = closed.cancelled() => return SessionEnd::Closed,
                next = tokio::time::timeout(self.read_deadline, stream.next()) => next,
            };
            let msg = match next {
                Err(_) => {
                    warn!(deadline = ?self.read_deadline, "No inbound activity, closing");
                    return SessionEnd::DeadlineExceeded;
                }
                Ok(None) => return SessionEnd::ClientClosed,
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "WebSocket read failed");
                    return SessionEnd::TransportError;
                }
                Ok(Some(Ok(msg))) => msg,
            };
            self.last_activity = Instant::now();

            match msg {
                Message::Text(text) => match InboundMessage::decode(text.as_str()) {
                    Ok(inbound) => {
                        malformed = 0;
                        self.dispatch(inbound).await;
                    }
                    Err(e) if e.is_envelope() => {
                        malformed += 1;
                        warn!(error = %e, consecutive = malformed, "Discarding malformed frame");
                        if malformed >= self.max_malformed {
                            return SessionEnd::TooManyMalformed;
                        }
                    }
                    Err(e) => {
                        malformed = 0;
                        warn!(error = %e, "Ignoring frame with malformed payload");
                    }
                },
                Message::Binary(data) => debug!(len = data.len(), "Ignoring binary frame"),
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(_) => return SessionEnd::ClientClosed,
            }
        }
    }

    async fn dispatch(&mut self, msg: InboundMessage) {
        match msg {
            InboundMessage::Auth(req) => self.authenticate(&req.connectkey).await,
            other => {
                let device_id = self.device_id.as_deref().unwrap_or("");
                self.router.route(device_id, other).await;
            }
        }
    }

    async fn authenticate(&mut self, connect_key: &str) {
        if let Some(bound) = &self.device_id {
            warn!(device_id = %bound, "Auth on already-authenticated connection, keeping binding");
            self.reply(&OutboundMessage::auth_failure());
            return;
        }

        let device = match self.store.device_by_connect_key(connect_key).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                warn!("Authentication failed: unknown connect key");
                self.reply(&OutboundMessage::auth_failure());
                return;
            }
            Err(e) => {
                error!(error = %e, "Device lookup failed during auth");
                self.reply(&OutboundMessage::auth_failure());
                return;
            }
        };

        if let Err(e) = self.hub.bind(self.conn.id(), &device.device_id).await {
            warn!(device_id = %device.device_id, error = %e, "Authentication refused by hub");
            self.reply(&OutboundMessage::auth_failure());
            return;
        }
        self.device_id = Some(device.device_id.clone());
        Span::current().record("device_id", device.device_id.as_str());

        let touch = DeviceUpdate {
            last_seen: Some(now_ms()),
            ..DeviceUpdate::default()
        };
        if let Err(e) = self.store.update_device(&device.device_id, touch).await {
            warn!(device_id = %device.device_id, error = %e, "Failed to update last_seen");
        }

        self.reply(&OutboundMessage::AuthResponse {
            success: true,
            sitename: device.site_name().to_string(),
            groupname: device.group_name().to_string(),
            devicename: device.device_name.clone(),
        });
        info!(device_id = %device.device_id, "Device authenticated");
    }

    /// Queue a reply on this connection's own buffer without waiting.
    fn reply(&self, msg: &OutboundMessage) {
        let frame = match msg.to_json() {
            Ok(json) => Frame::from(json),
            Err(e) => {
                error!(error = %e, kind = msg.kind(), "Failed to serialize reply");
                return;
            }
        };
        if let Err(e) = self.conn.try_enqueue(frame) {
            warn!(error = %e, kind = msg.kind(), "Failed to queue reply");
        }
    }
}
