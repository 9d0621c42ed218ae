//! Buttplug WebSocket session.
//!
//! [`ButtplugConnector`] dials an Intiface / Buttplug server (by default
//! `ws://127.0.0.1:12345`), performs the `RequestServerInfo` handshake and
//! hands back a [`ButtplugSession`]:
//!
//! * **Outbound** – each request gets a fresh non-zero `Id`, is written as a
//!   one-message frame, and waits for the reply carrying the same `Id`.
//!   A reply that does not arrive within the request timeout is a
//!   [`StrokeError::Timeout`]; an `Error` reply is a [`StrokeError::Protocol`].
//!
//! * **Inbound** – a reader task owns the socket's read half. Replies are
//!   routed to their waiting request; `Id: 0` events are published on the
//!   session's [`SessionBus`]. When the socket ends every pending request
//!   fails and [`SessionEvent::Closed`] is published.
//!
//! * **Keepalive** – when the server advertises a non-zero `MaxPingTime`, a
//!   pinger task sends `Ping` every half of that interval so the server does
//!   not drop the connection and halt the device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use strokegpt_types::{Actuator, ActuatorOutput, DeviceDescriptor, StrokeError};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{DeviceSession, SessionConnector, SessionEvent};
use crate::bus::SessionBus;
use crate::protocol::{self, ClientMessage, EVENT_ID, MESSAGE_VERSION, ServerMessage};

/// How long a single request waits for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<Mutex<HashMap<u32, oneshot::Sender<ServerMessage>>>>;

fn lock_pending(
    pending: &Mutex<HashMap<u32, oneshot::Sender<ServerMessage>>>,
) -> MutexGuard<'_, HashMap<u32, oneshot::Sender<ServerMessage>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─────────────────────────────────────────────────────────────────────────────
// Connector
// ─────────────────────────────────────────────────────────────────────────────

/// Opens [`ButtplugSession`]s.
#[derive(Debug, Clone)]
pub struct ButtplugConnector {
    client_name: String,
    request_timeout: Duration,
}

impl ButtplugConnector {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the per-request reply timeout (builder-style).
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl SessionConnector for ButtplugConnector {
    async fn open(&self, server_uri: &str) -> Result<Arc<dyn DeviceSession>, StrokeError> {
        let (ws, _response) = connect_async(server_uri)
            .await
            .map_err(|e| StrokeError::Transport(format!("connect to {server_uri}: {e}")))?;

        let session = ButtplugSession::start(ws, self.request_timeout);
        let max_ping_time = session.handshake(&self.client_name).await?;
        info!(
            session = %session.id,
            server = %session.server_name(),
            uri = %server_uri,
            max_ping_ms = max_ping_time.as_millis() as u64,
            "buttplug handshake complete"
        );
        let session = Arc::new(session);
        if !max_ping_time.is_zero() {
            session.spawn_pinger(max_ping_time);
        }
        Ok(session)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// A handshaken WebSocket session. Dropping it stops the reader task.
pub struct ButtplugSession {
    id: Uuid,
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    pending: Pending,
    next_id: AtomicU32,
    bus: SessionBus,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    pinger: Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
    server_name: OnceLock<String>,
}

impl ButtplugSession {
    fn start(ws: WsStream, request_timeout: Duration) -> Self {
        let (sink, stream) = ws.split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let bus = SessionBus::default();
        let closed = Arc::new(AtomicBool::new(false));
        let id = Uuid::new_v4();

        let reader = tokio::spawn(read_loop(
            id,
            stream,
            Arc::clone(&pending),
            bus.clone(),
            Arc::clone(&closed),
        ));

        Self {
            id,
            sink: tokio::sync::Mutex::new(sink),
            pending,
            next_id: AtomicU32::new(1),
            bus,
            closed,
            reader,
            pinger: Mutex::new(None),
            request_timeout,
            server_name: OnceLock::new(),
        }
    }

    /// Exchange `RequestServerInfo`/`ServerInfo`. Returns the server's
    /// `MaxPingTime` (zero when the server does not require pings).
    async fn handshake(&self, client_name: &str) -> Result<Duration, StrokeError> {
        let reply = self
            .request("RequestServerInfo", |id| {
                Ok(ClientMessage::RequestServerInfo {
                    id,
                    client_name: client_name.to_string(),
                    message_version: MESSAGE_VERSION,
                })
            })
            .await?;
        match reply {
            ServerMessage::ServerInfo {
                server_name,
                message_version,
                max_ping_time,
                ..
            } => {
                if message_version < MESSAGE_VERSION {
                    warn!(
                        server = %server_name,
                        message_version,
                        "server speaks an older protocol version"
                    );
                }
                let _ = self.server_name.set(server_name);
                Ok(Duration::from_millis(max_ping_time))
            }
            other => Err(unexpected("RequestServerInfo", &other)),
        }
    }

    /// Ping at half the server's deadline until the session closes or drops.
    fn spawn_pinger(self: &Arc<Self>, max_ping_time: Duration) {
        let period = (max_ping_time / 2).max(Duration::from_millis(1));
        let session: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(live) = session.upgrade() else { break };
                if live.closed.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = live
                    .request_ok("Ping", |id| Ok(ClientMessage::Ping { id }))
                    .await
                {
                    warn!(session = %live.id, error = %e, "keepalive ping failed");
                }
            }
        });
        debug!(session = %self.id, period_ms = period.as_millis() as u64, "keepalive pinger started");
        *lock_pinger(&self.pinger) = Some(handle);
    }

    fn stop_pinger(&self) {
        if let Some(pinger) = lock_pinger(&self.pinger).take() {
            pinger.abort();
        }
    }

    /// Send one request and wait for its reply.
    async fn request(
        &self,
        operation: &str,
        build: impl FnOnce(u32) -> Result<ClientMessage, StrokeError>,
    ) -> Result<ServerMessage, StrokeError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StrokeError::Transport("session is closed".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = protocol::encode_frame(&[build(id)?])?;
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);

        let sent = self.sink.lock().await.send(Message::Text(frame.into())).await;
        if let Err(e) = sent {
            lock_pending(&self.pending).remove(&id);
            return Err(StrokeError::Transport(format!("{operation}: {e}")));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(ServerMessage::Error {
                error_message,
                error_code,
                ..
            })) => Err(StrokeError::Protocol {
                code: error_code,
                message: error_message,
            }),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(StrokeError::Transport(format!(
                "connection closed before reply to {operation}"
            ))),
            Err(_) => {
                lock_pending(&self.pending).remove(&id);
                Err(StrokeError::timeout(operation, self.request_timeout))
            }
        }
    }

    async fn request_ok(
        &self,
        operation: &str,
        build: impl FnOnce(u32) -> Result<ClientMessage, StrokeError>,
    ) -> Result<(), StrokeError> {
        match self.request(operation, build).await? {
            ServerMessage::Ok { .. } => Ok(()),
            other => Err(unexpected(operation, &other)),
        }
    }
}

impl Drop for ButtplugSession {
    fn drop(&mut self) {
        self.stop_pinger();
        self.reader.abort();
    }
}

fn lock_pinger(pinger: &Mutex<Option<JoinHandle<()>>>) -> MutexGuard<'_, Option<JoinHandle<()>>> {
    pinger.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unexpected(operation: &str, reply: &ServerMessage) -> StrokeError {
    StrokeError::Protocol {
        code: -1,
        message: format!("unexpected reply to {operation}: {reply:?}"),
    }
}

#[async_trait]
impl DeviceSession for ButtplugSession {
    fn server_name(&self) -> &str {
        self.server_name.get().map(String::as_str).unwrap_or("")
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    async fn device_list(&self) -> Result<Vec<DeviceDescriptor>, StrokeError> {
        match self
            .request("RequestDeviceList", |id| Ok(ClientMessage::RequestDeviceList { id }))
            .await?
        {
            ServerMessage::DeviceList { devices, .. } => {
                Ok(devices.iter().map(|d| d.to_descriptor()).collect())
            }
            other => Err(unexpected("RequestDeviceList", &other)),
        }
    }

    async fn start_scanning(&self) -> Result<(), StrokeError> {
        self.request_ok("StartScanning", |id| Ok(ClientMessage::StartScanning { id }))
            .await
    }

    async fn stop_scanning(&self) -> Result<(), StrokeError> {
        self.request_ok("StopScanning", |id| Ok(ClientMessage::StopScanning { id }))
            .await
    }

    async fn send_output(
        &self,
        device_index: u32,
        actuator: &Actuator,
        output: ActuatorOutput,
    ) -> Result<(), StrokeError> {
        self.request_ok("actuator command", |id| {
            protocol::output_message(id, device_index, actuator, output)
        })
        .await
    }

    async fn stop_device(&self, device_index: u32) -> Result<(), StrokeError> {
        self.request_ok("StopDeviceCmd", |id| {
            Ok(ClientMessage::StopDeviceCmd { id, device_index })
        })
        .await
    }

    async fn close(&self) -> Result<(), StrokeError> {
        self.stop_pinger();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(session = %self.id, "closing buttplug session");
        self.sink
            .lock()
            .await
            .close()
            .await
            .map_err(|e| StrokeError::Transport(format!("close: {e}")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader task
// ─────────────────────────────────────────────────────────────────────────────

async fn read_loop(
    session: Uuid,
    mut stream: SplitStream<WsStream>,
    pending: Pending,
    bus: SessionBus,
    closed: Arc<AtomicBool>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match protocol::decode_frame(text.as_str()) {
                Ok(messages) => {
                    for message in messages {
                        route_message(message, &pending, &bus);
                    }
                }
                Err(e) => warn!(session = %session, error = %e, "undecodable frame from server"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(session = %session, error = %e, "websocket read failed");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every waiting request.
    lock_pending(&pending).clear();
    info!(session = %session, "buttplug session closed");
    bus.publish(SessionEvent::Closed);
}

fn route_message(message: ServerMessage, pending: &Pending, bus: &SessionBus) {
    let id = message.id();
    if id != EVENT_ID {
        match lock_pending(pending).remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(message);
            }
            None => debug!(id, "reply for a request nobody is waiting on"),
        }
        return;
    }

    match message {
        ServerMessage::DeviceAdded {
            device_name,
            device_index,
            device_display_name,
            device_messages,
            ..
        } => {
            let descriptor = protocol::to_descriptor(
                device_index,
                &device_name,
                device_display_name.as_deref(),
                &device_messages,
            );
            debug!(device = %descriptor.name, index = device_index, "device added");
            bus.publish(SessionEvent::DeviceAdded(descriptor));
        }
        ServerMessage::DeviceRemoved { device_index, .. } => {
            debug!(index = device_index, "device removed");
            bus.publish(SessionEvent::DeviceRemoved(device_index));
        }
        ServerMessage::ScanningFinished { .. } => {
            bus.publish(SessionEvent::ScanningFinished);
        }
        ServerMessage::Error {
            error_message,
            error_code,
            ..
        } => warn!(code = error_code, message = %error_message, "server reported an error"),
        other => debug!(message = ?other, "ignoring unsolicited server message"),
    }
}
