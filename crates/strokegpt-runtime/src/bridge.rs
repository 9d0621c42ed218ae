//! [`DeviceBridge`] – the thread-safe facade over the device event loop.
//!
//! The bridge owns one dedicated OS thread running a single-threaded Tokio
//! runtime. That thread hosts the [`ConnectionManager`], the session and the
//! [`DriveLoop`]. Callers on any other thread reach it two ways:
//!
//! * **Shared state** – [`move_to`](DeviceBridge::move_to) and the status
//!   getters only touch the mutex-guarded [`SharedState`][crate::state::SharedState].
//!   They never wait on the event loop and never block on device I/O.
//! * **Requests** – `connect`, `stop` and `disconnect` are sent to the event
//!   thread as messages carrying a reply channel. The caller blocks on the
//!   reply under a bounded timeout; on timeout the failure is logged and the
//!   caller carries on.
//!
//! No error crosses the thread boundary. A flaky device shows up only as
//! `is_connected() == false` and a warning in the log.

use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use strokegpt_middleware::SessionConnector;
use strokegpt_types::{Actuator, CapabilityClass, ConnectionState, MotionIntent, StrokeError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::connection::{ConnectionConfig, ConnectionManager, actuator_counts};
use crate::drive_loop::{DriveConfig, DriveLoop, IoLock};
use crate::state::{Shared, SharedState, lock};

/// Default Intiface / Buttplug server address.
pub const DEFAULT_SERVER_URI: &str = "ws://127.0.0.1:12345";

/// Extra time a caller waits beyond the event loop's own bound, so the loop's
/// answer wins over the caller's timeout.
const REPLY_GRACE: Duration = Duration::from_millis(500);

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub discovery_window: Duration,
    pub connect_timeout: Duration,
    pub stop_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub command_timeout: Duration,
    pub idle_interval: Duration,
    pub error_backoff: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            discovery_window: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(3),
            disconnect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
            idle_interval: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl BridgeConfig {
    fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            discovery_window: self.discovery_window,
            connect_timeout: self.connect_timeout,
            command_timeout: self.command_timeout,
        }
    }

    fn drive(&self) -> DriveConfig {
        DriveConfig {
            idle_interval: self.idle_interval,
            error_backoff: self.error_backoff,
            command_timeout: self.command_timeout,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Point-in-time view of the bridge for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeStatus {
    pub state: ConnectionState,
    pub server: Option<String>,
    pub device: Option<String>,
    pub linear: usize,
    pub vibrating: usize,
    pub rotating: usize,
    /// Bound actuators, linear first, then vibrating, then rotating.
    pub actuators: Vec<Actuator>,
    pub active: bool,
    pub last_speed: f64,
    pub last_depth: f64,
    pub last_range: f64,
    pub last_move_at: Option<DateTime<Utc>>,
}

impl BridgeStatus {
    fn capture(state: &SharedState) -> Self {
        let [linear, vibrating, rotating] = state
            .device
            .as_ref()
            .map_or([0; 3], |d| actuator_counts(d).map(|(_, n)| n));
        Self {
            state: state.connection,
            server: state.server_name.clone(),
            device: state.device.as_ref().map(|d| d.name.clone()),
            linear,
            vibrating,
            rotating,
            actuators: state.device.as_ref().map_or_else(Vec::new, |d| {
                CapabilityClass::ALL
                    .iter()
                    .flat_map(|class| d.actuators.bucket(*class).iter().cloned())
                    .collect()
            }),
            active: state.target.active,
            last_speed: state.last_speed,
            last_depth: state.last_depth,
            last_range: state.last_range,
            last_move_at: state.last_move_at,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event-loop requests
// ─────────────────────────────────────────────────────────────────────────────

enum Request {
    Connect {
        uri: String,
        /// Fixed when the caller submits, so time spent queued behind other
        /// requests counts against the connect timeout.
        deadline: Instant,
        reply: SyncSender<ConnectionState>,
    },
    Stop {
        reply: Option<SyncSender<()>>,
    },
    Disconnect {
        reply: SyncSender<()>,
    },
    Shutdown,
}

async fn serve(
    mut requests: mpsc::UnboundedReceiver<Request>,
    connector: Arc<dyn SessionConnector>,
    shared: Shared,
    config: BridgeConfig,
) {
    let io = IoLock::default();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let drive = tokio::spawn(
        DriveLoop::new(Arc::clone(&shared), Arc::clone(&io), config.drive(), shutdown_rx).run(),
    );
    let mut manager = ConnectionManager::new(connector, shared, io, config.connection());

    while let Some(request) = requests.recv().await {
        match request {
            Request::Connect {
                uri,
                deadline,
                reply,
            } => {
                let budget = deadline.saturating_duration_since(Instant::now());
                let state = manager.connect_within(&uri, budget).await;
                let _ = reply.send(state);
            }
            Request::Stop { reply } => {
                manager.stop_all().await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            Request::Disconnect { reply } => {
                manager.disconnect_within(config.disconnect_timeout).await;
                let _ = reply.send(());
            }
            Request::Shutdown => break,
        }
    }

    manager.disconnect_within(config.disconnect_timeout).await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = drive.await {
        warn!(error = %e, "drive loop ended abnormally");
    }
    info!("device bridge event loop stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// DeviceBridge
// ─────────────────────────────────────────────────────────────────────────────

/// Facade callable from any thread. See the module docs for the threading
/// model.
pub struct DeviceBridge {
    shared: Shared,
    requests: mpsc::UnboundedSender<Request>,
    thread: Mutex<Option<JoinHandle<()>>>,
    config: BridgeConfig,
}

impl DeviceBridge {
    /// Start the event-loop thread and its drive loop.
    ///
    /// # Errors
    ///
    /// [`StrokeError::Runtime`] if the runtime or the thread cannot be created.
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        config: BridgeConfig,
    ) -> Result<Self, StrokeError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StrokeError::Runtime(format!("build event loop: {e}")))?;

        let shared: Shared = Arc::new(Mutex::new(SharedState::default()));
        let (tx, rx) = mpsc::unbounded_channel();

        let loop_shared = Arc::clone(&shared);
        let loop_config = config.clone();
        let thread = std::thread::Builder::new()
            .name("strokegpt-bridge".to_string())
            .spawn(move || runtime.block_on(serve(rx, connector, loop_shared, loop_config)))
            .map_err(|e| StrokeError::Runtime(format!("spawn event loop thread: {e}")))?;

        debug!("device bridge started");
        Ok(Self {
            shared,
            requests: tx,
            thread: Mutex::new(Some(thread)),
            config,
        })
    }

    fn submit(&self, request: Request) -> bool {
        if self.requests.send(request).is_err() {
            warn!("device bridge is shut down; request dropped");
            return false;
        }
        true
    }

    fn wait<T>(&self, reply: Receiver<T>, timeout: Duration, operation: &str) -> Option<T> {
        match reply.recv_timeout(timeout) {
            Ok(value) => Some(value),
            Err(RecvTimeoutError::Timeout) => {
                warn!(operation, timeout_ms = timeout.as_millis() as u64, "bridge operation timed out");
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!(operation, "device bridge event loop exited");
                None
            }
        }
    }

    /// Connect to `server_uri` and bind the first compatible device. Blocks
    /// up to the connect timeout. Returns whether a device is now bound.
    pub fn connect(&self, server_uri: &str) -> bool {
        let (reply, rx) = sync_channel(1);
        if !self.submit(Request::Connect {
            uri: server_uri.to_string(),
            deadline: Instant::now() + self.config.connect_timeout,
            reply,
        }) {
            return false;
        }
        match self.wait(rx, self.config.connect_timeout + REPLY_GRACE, "connect") {
            Some(ConnectionState::Connected) => self.is_connected(),
            _ => false,
        }
    }

    /// Set the drive target. Never blocks on device I/O.
    ///
    /// Values are clamped to `[0, 100]`. A zero speed deactivates the target
    /// and queues a stop without waiting for it. Ignored, with a warning,
    /// when no device is bound.
    pub fn move_to(&self, speed: f64, depth: f64, range: f64) {
        let intent = MotionIntent::new(speed, depth, range).clamped();
        let stop = {
            let mut state = lock(&self.shared);
            if !state.is_connected() {
                warn!("move ignored: no device bound");
                return;
            }
            state.last_speed = intent.speed;
            state.last_depth = intent.depth;
            state.last_range = intent.range;
            state.last_move_at = Some(Utc::now());
            state.target.intent = intent;
            if intent.is_stop() {
                state.halt();
                true
            } else {
                state.target.active = true;
                false
            }
        };
        if stop {
            self.submit(Request::Stop { reply: None });
        }
    }

    /// Halt motion and send stop outputs to every actuator, waiting up to the
    /// stop timeout. A no-op when no device is bound.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.shared);
            state.halt();
            state.last_speed = 0.0;
            if !state.is_connected() {
                warn!("stop ignored: no device bound");
                return;
            }
        }
        let (reply, rx) = sync_channel(1);
        if self.submit(Request::Stop { reply: Some(reply) }) {
            self.wait(rx, self.config.stop_timeout + REPLY_GRACE, "stop");
        }
    }

    /// Stop the device and close the session. The event loop stays up, so
    /// [`connect`](Self::connect) may be called again. Safe to repeat.
    pub fn disconnect(&self) {
        let (reply, rx) = sync_channel(1);
        if self.submit(Request::Disconnect { reply }) {
            self.wait(rx, self.config.disconnect_timeout + REPLY_GRACE, "disconnect");
        }
    }

    /// Disconnect and stop the event-loop thread. The thread is detached if
    /// it does not finish within the disconnect timeout. Later calls on the
    /// bridge are no-ops.
    pub fn shutdown(&self) {
        let Some(handle) = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let _ = self.requests.send(Request::Shutdown);
        let deadline = Instant::now() + self.config.disconnect_timeout + REPLY_GRACE;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("device bridge thread did not stop in time; detaching it");
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if handle.join().is_err() {
            error!("device bridge thread panicked");
        }
        info!("device bridge shut down");
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared).is_connected()
    }

    pub fn last_speed(&self) -> f64 {
        lock(&self.shared).last_speed
    }

    pub fn last_depth(&self) -> f64 {
        lock(&self.shared).last_depth
    }

    pub fn status(&self) -> BridgeStatus {
        BridgeStatus::capture(&lock(&self.shared))
    }
}

impl Drop for DeviceBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strokegpt_middleware::SimConnector;
    use strokegpt_types::{ActuatorDescriptor, ActuatorOutput, CommandRoute, DeviceDescriptor};

    fn fast_config() -> BridgeConfig {
        BridgeConfig {
            discovery_window: Duration::from_millis(30),
            connect_timeout: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(1),
            disconnect_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_millis(200),
            idle_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(20),
        }
    }

    fn bridge(sim: &SimConnector) -> DeviceBridge {
        DeviceBridge::new(Arc::new(sim.clone()), fast_config()).unwrap()
    }

    fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn stroker(index: u32) -> DeviceDescriptor {
        DeviceDescriptor {
            index,
            name: "Stroker".into(),
            linear: vec![ActuatorDescriptor {
                index: 0,
                description: "Linear - Position".into(),
                route: CommandRoute::Linear,
            }],
            ..Default::default()
        }
    }

    fn vibrator(index: u32, motors: u32) -> DeviceDescriptor {
        DeviceDescriptor {
            index,
            name: "Wand".into(),
            actuators: (0..motors)
                .map(|i| ActuatorDescriptor {
                    index: i,
                    description: format!("Vibrate - Level {}", i + 1),
                    route: CommandRoute::Scalar {
                        actuator_type: "Vibrate".into(),
                    },
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn move_and_stop_before_connect_are_noops() {
        let sim = SimConnector::new().with_device(stroker(0));
        let bridge = bridge(&sim);

        bridge.move_to(50.0, 50.0, 50.0);
        bridge.stop();

        assert!(!bridge.is_connected());
        assert_eq!(bridge.last_speed(), 0.0);
        assert!(!bridge.status().active);
        assert!(sim.sent().is_empty());
    }

    #[test]
    fn empty_server_leaves_bridge_disconnected() {
        let sim = SimConnector::new();
        let bridge = bridge(&sim);

        assert!(!bridge.connect("sim://"));
        assert!(!bridge.is_connected());
        assert_eq!(bridge.status().state, ConnectionState::Disconnected);
    }

    #[test]
    fn refused_connection_is_reported_as_not_connected() {
        let sim = SimConnector::new().refusing_connections();
        let bridge = bridge(&sim);
        assert!(!bridge.connect(DEFAULT_SERVER_URI));
        assert_eq!(bridge.status().state, ConnectionState::Disconnected);
    }

    #[test]
    fn linear_device_strokes_then_holds_on_stop() {
        let sim = SimConnector::new()
            .with_device(vibrator(0, 0))
            .with_device(stroker(1));
        let bridge = bridge(&sim);

        assert!(bridge.connect("sim://"));
        let status = bridge.status();
        assert_eq!(status.device.as_deref(), Some("Stroker"));
        assert_eq!((status.linear, status.vibrating, status.rotating), (1, 0, 0));

        bridge.move_to(100.0, 50.0, 50.0);
        assert_eq!(bridge.last_speed(), 100.0);
        assert!(bridge.status().last_move_at.is_some());
        wait_until("two stroke legs", || sim.sent().len() >= 2);

        bridge.stop();
        assert_eq!(
            sim.sent().last().map(|s| s.output),
            Some(ActuatorOutput::Position {
                position: 0.5,
                duration_ms: 200
            })
        );
        assert_eq!(bridge.last_speed(), 0.0);
        assert!(!bridge.status().active);

        let settled = sim.sent().len();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(sim.sent().len(), settled);
    }

    #[test]
    fn zero_speed_on_vibrator_sends_intensity_zero() {
        let sim = SimConnector::new().with_device(vibrator(0, 1));
        let bridge = bridge(&sim);
        assert!(bridge.connect("sim://"));

        bridge.move_to(60.0, 50.0, 50.0);
        wait_until("vibration level", || {
            sim.sent()
                .iter()
                .any(|s| s.output == ActuatorOutput::Scalar { level: 0.6 })
        });

        bridge.move_to(0.0, 50.0, 50.0);
        assert!(!bridge.status().active);
        assert_eq!(bridge.last_speed(), 0.0);
        wait_until("intensity zero", || {
            sim.sent().last().map(|s| s.output) == Some(ActuatorOutput::Scalar { level: 0.0 })
        });
        assert!(
            sim.sent()
                .iter()
                .all(|s| matches!(s.output, ActuatorOutput::Scalar { .. }))
        );
    }

    #[test]
    fn disconnect_twice_is_harmless() {
        let sim = SimConnector::new().with_device(stroker(0));
        let bridge = bridge(&sim);
        bridge.disconnect();
        assert_eq!(bridge.status().state, ConnectionState::Disconnected);

        assert!(bridge.connect("sim://"));
        bridge.disconnect();
        assert_eq!(bridge.status().state, ConnectionState::Disconnected);
        bridge.disconnect();
        assert_eq!(bridge.status().state, ConnectionState::Disconnected);
        assert!(!bridge.is_connected());
        assert_eq!(sim.sessions_closed(), 1);

        assert!(bridge.connect("sim://"), "reconnect after disconnect");
        assert_eq!(sim.sessions_opened(), 2);
    }

    #[test]
    fn removed_device_turns_moves_into_noops() {
        let sim = SimConnector::new().with_device(vibrator(3, 1));
        let bridge = bridge(&sim);
        assert!(bridge.connect("sim://"));

        sim.remove_device(3);
        wait_until("binding cleared", || !bridge.is_connected());
        assert_eq!(bridge.status().state, ConnectionState::Connected);

        sim.clear_sent();
        bridge.move_to(80.0, 50.0, 50.0);
        std::thread::sleep(Duration::from_millis(50));
        assert!(sim.sent().is_empty());
    }

    #[test]
    fn lost_connection_falls_back_to_disconnected() {
        let sim = SimConnector::new().with_device(stroker(0));
        let bridge = bridge(&sim);
        assert!(bridge.connect("sim://"));

        sim.drop_connection();
        wait_until("disconnected", || {
            bridge.status().state == ConnectionState::Disconnected
        });
        assert!(!bridge.is_connected());
    }

    #[test]
    fn command_timeout_triggers_stop() {
        let sim = SimConnector::new()
            .with_device(vibrator(0, 1))
            .timing_out_outputs(Duration::from_millis(20));
        let bridge = bridge(&sim);
        assert!(bridge.connect("sim://"));

        bridge.move_to(70.0, 50.0, 50.0);
        wait_until("automatic stop", || !bridge.status().active);
        assert_eq!(bridge.last_speed(), 0.0);
        assert!(bridge.is_connected());
    }

    #[test]
    fn one_failing_motor_does_not_stop_the_others() {
        let sim = SimConnector::new()
            .with_device(vibrator(0, 2))
            .failing_actuator(0, 0);
        let bridge = bridge(&sim);
        assert!(bridge.connect("sim://"));

        bridge.move_to(40.0, 50.0, 50.0);
        wait_until("second motor driven", || {
            sim.sent().iter().any(|s| s.actuator_index == 1)
        });
        assert!(bridge.status().active);
    }

    #[test]
    fn shutdown_stops_the_device_and_rejects_later_requests() {
        let sim = SimConnector::new().with_device(vibrator(0, 1));
        let bridge = bridge(&sim);
        assert!(bridge.connect("sim://"));
        bridge.move_to(50.0, 50.0, 50.0);

        bridge.shutdown();
        assert_eq!(sim.sessions_closed(), 1);
        assert_eq!(
            sim.sent().last().map(|s| s.output),
            Some(ActuatorOutput::Scalar { level: 0.0 })
        );
        assert!(!bridge.connect("sim://"));
        bridge.shutdown();
    }

    #[test]
    fn mixed_device_is_driven_through_its_linear_rail_only() {
        let mut device = stroker(0);
        device.actuators = vibrator(0, 1).actuators;
        let sim = SimConnector::new().with_device(device);
        let bridge = bridge(&sim);
        assert!(bridge.connect("sim://"));
        assert_eq!((bridge.status().linear, bridge.status().vibrating), (1, 1));

        bridge.move_to(80.0, 50.0, 100.0);
        wait_until("two stroke legs", || sim.sent().len() >= 2);
        let driven = sim.sent();
        assert!(
            driven.iter().all(|s| s.class == CapabilityClass::Linear
                && matches!(s.output, ActuatorOutput::Position { .. })),
            "only the linear rail may move: {driven:?}"
        );

        bridge.stop();
        let stopped = sim.sent();
        assert!(
            stopped[driven.len()..]
                .iter()
                .any(|s| s.output == ActuatorOutput::Scalar { level: 0.0 }),
            "stop must still zero the vibrator"
        );
    }

    #[test]
    fn rotating_device_spins_and_stops() {
        let sim = SimConnector::new().with_device(DeviceDescriptor {
            index: 5,
            name: "Spinner".into(),
            rotary: vec![ActuatorDescriptor {
                index: 0,
                description: "Rotate - Head".into(),
                route: CommandRoute::Rotate,
            }],
            ..Default::default()
        });
        let bridge = bridge(&sim);
        assert!(bridge.connect("sim://"));
        assert_eq!(bridge.status().rotating, 1);

        bridge.move_to(40.0, 50.0, 50.0);
        wait_until("rotation", || {
            sim.sent().iter().any(|s| {
                s.output
                    == ActuatorOutput::Rotation {
                        speed: 0.4,
                        clockwise: true,
                    }
            })
        });

        bridge.stop();
        let sent = sim.sent();
        assert!(sent.iter().all(|s| s.device_index == 5 && s.class == CapabilityClass::Rotating));
        assert_eq!(
            sent.last().map(|s| s.output),
            Some(ActuatorOutput::Rotation {
                speed: 0.0,
                clockwise: true
            })
        );
    }

    #[test]
    fn status_lists_bound_actuators_in_class_order() {
        let mut device = vibrator(0, 2);
        device.linear = stroker(0).linear;
        let sim = SimConnector::new().with_device(device);
        let bridge = bridge(&sim);
        assert!(bridge.status().actuators.is_empty());
        assert!(bridge.connect("sim://"));

        let listed: Vec<(CapabilityClass, String)> = bridge
            .status()
            .actuators
            .into_iter()
            .map(|a| (a.class, a.description))
            .collect();
        assert_eq!(
            listed,
            vec![
                (CapabilityClass::Linear, "Linear - Position".to_string()),
                (CapabilityClass::Vibrating, "Vibrate - Level 1".to_string()),
                (CapabilityClass::Vibrating, "Vibrate - Level 2".to_string()),
            ]
        );
    }

    #[test]
    fn connect_deadline_includes_time_spent_queued() {
        let sim = SimConnector::new().with_device(vibrator(0, 2));
        let bridge = DeviceBridge::new(
            Arc::new(sim.clone()),
            BridgeConfig {
                connect_timeout: Duration::from_millis(100),
                ..fast_config()
            },
        )
        .unwrap();
        assert!(bridge.connect("sim://"));

        // Each stop output now stalls 150 ms, so the queued stop keeps the
        // event loop busy past the next connect's deadline.
        let _ = sim.clone().timing_out_outputs(Duration::from_millis(150));
        bridge.move_to(0.0, 50.0, 50.0);
        assert!(!bridge.connect("sim://"));

        wait_until("reconnect abandoned", || {
            bridge.status().state == ConnectionState::Disconnected
        });
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(sim.sessions_opened(), 1, "an expired connect must not open a session");
    }

    #[test]
    fn status_serialises_for_display() {
        let sim = SimConnector::new();
        let bridge = bridge(&sim);
        let json = serde_json::to_value(bridge.status()).unwrap();
        assert_eq!(json["state"], "Disconnected");
        assert_eq!(json["active"], false);
    }
}
