//! Connection manager.
//!
//! Owns the lifetime of the link to the device server and walks
//! [`ConnectionState`] one legal step at a time:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──bound──▶ Connected
//!      ▲                        │                     │
//!      └──────── no device / error                disconnect / link lost
//!      │                                              ▼
//!      └───────────────────────────────────────── ShuttingDown
//! ```
//!
//! Nothing here returns an error to its caller. Transport failures, timeouts
//! and empty discovery windows are logged and resolve to `Disconnected`.

use std::sync::Arc;
use std::time::Duration;

use strokegpt_hal::bind_first_compatible;
use strokegpt_middleware::{DeviceSession, SessionConnector, SessionEvent};
use strokegpt_types::{CapabilityClass, ConnectionState, Device, DeviceDescriptor, StrokeError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::drive_loop::{IoLock, send_to_actuators, stop_outputs};
use crate::state::{Shared, lock};

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long to collect device announcements after scanning starts.
    pub discovery_window: Duration,
    /// Upper bound on the whole connect sequence, discovery included.
    pub connect_timeout: Duration,
    /// Upper bound on each stop output and on closing the session.
    pub command_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            discovery_window: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(1),
        }
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn SessionConnector>,
    shared: Shared,
    io: IoLock,
    config: ConnectionConfig,
    watcher: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        shared: Shared,
        io: IoLock,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            connector,
            shared,
            io,
            config,
            watcher: None,
        }
    }

    /// Connect to `server_uri`, discover devices and bind the first
    /// compatible one. Returns the resulting state: `Connected` or
    /// `Disconnected`.
    ///
    /// An existing connection is torn down first.
    pub async fn connect(&mut self, server_uri: &str) -> ConnectionState {
        self.connect_within(server_uri, self.config.connect_timeout).await
    }

    /// [`connect`](Self::connect) bounded by `budget` instead of the
    /// configured connect timeout. Tearing down an existing connection
    /// counts against the budget; an exhausted budget ends `Disconnected`
    /// without opening a session.
    #[instrument(
        name = "connect",
        skip(self, server_uri, budget),
        fields(uri = %server_uri, budget_ms = budget.as_millis() as u64)
    )]
    pub async fn connect_within(&mut self, server_uri: &str, budget: Duration) -> ConnectionState {
        let started = Instant::now();
        if lock(&self.shared).connection != ConnectionState::Disconnected {
            info!("already connected; reconnecting");
            self.disconnect().await;
        }
        let remaining = budget.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            warn!(uri = %server_uri, "connect deadline passed before the attempt started");
            return lock(&self.shared).connection;
        }
        if !lock(&self.shared).transition(ConnectionState::Connecting) {
            return lock(&self.shared).connection;
        }

        info!(uri = %server_uri, "connecting to device server");
        let attempt = tokio::time::timeout(remaining, self.open_and_bind(server_uri))
            .await
            .unwrap_or_else(|_| Err(StrokeError::timeout("connect", remaining)));

        match attempt {
            Ok((session, device, events)) => {
                info!(
                    device = %device.name,
                    index = device.index,
                    server = %session.server_name(),
                    linear = device.actuators.linear.len(),
                    vibrating = device.actuators.vibrating.len(),
                    rotating = device.actuators.rotating.len(),
                    "device bound"
                );
                {
                    let mut state = lock(&self.shared);
                    state.server_name = Some(session.server_name().to_string());
                    state.session = Some(session);
                    state.device = Some(device);
                    state.generation = state.generation.wrapping_add(1);
                    state.transition(ConnectionState::Connected);
                }
                self.watcher = Some(tokio::spawn(watch_session(Arc::clone(&self.shared), events)));
                ConnectionState::Connected
            }
            Err(StrokeError::NoDevice) => {
                warn!(uri = %server_uri, "no compatible device found during discovery");
                lock(&self.shared).transition(ConnectionState::Disconnected);
                ConnectionState::Disconnected
            }
            Err(e) => {
                warn!(uri = %server_uri, error = %e, "connect failed");
                lock(&self.shared).transition(ConnectionState::Disconnected);
                ConnectionState::Disconnected
            }
        }
    }

    async fn open_and_bind(
        &self,
        server_uri: &str,
    ) -> Result<(Arc<dyn DeviceSession>, Device, broadcast::Receiver<SessionEvent>), StrokeError>
    {
        let session = self.connector.open(server_uri).await?;
        let mut events = session.subscribe();

        let devices = match discover(session.as_ref(), &mut events, self.config.discovery_window).await
        {
            Ok(devices) => devices,
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    debug!(error = %close_err, "close after failed discovery failed");
                }
                return Err(e);
            }
        };

        match bind_first_compatible(&devices) {
            Some(device) => Ok((session, device, events)),
            None => {
                debug!(reported = devices.len(), "no reported device has a usable actuator");
                if let Err(e) = session.close().await {
                    debug!(error = %e, "close after empty discovery failed");
                }
                Err(StrokeError::NoDevice)
            }
        }
    }

    /// Stop the device, close the session and clear the binding. Calling it
    /// when already disconnected does nothing.
    #[instrument(skip(self))]
    pub async fn disconnect(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }

        let session = {
            let mut state = lock(&self.shared);
            if state.connection == ConnectionState::Disconnected && state.session.is_none() {
                debug!("disconnect: already disconnected");
                return;
            }
            state.transition(ConnectionState::ShuttingDown);
            state.session.clone()
        };

        self.stop_all().await;

        if let Some(session) = session {
            match tokio::time::timeout(self.config.command_timeout, session.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "closing session failed"),
                Err(_) => warn!("closing session timed out"),
            }
        }

        self.clear();
        info!("disconnected from device server");
    }

    /// [`disconnect`](Self::disconnect), forcing the state clear if it does
    /// not finish within `limit`.
    pub async fn disconnect_within(&mut self, limit: Duration) {
        if tokio::time::timeout(limit, self.disconnect()).await.is_err() {
            warn!(limit_ms = limit.as_millis() as u64, "disconnect timed out; forcing cleanup");
            if let Some(watcher) = self.watcher.take() {
                watcher.abort();
            }
            self.clear();
        }
    }

    fn clear(&self) {
        let mut state = lock(&self.shared);
        if state.connection == ConnectionState::Connected {
            state.transition(ConnectionState::ShuttingDown);
        }
        state.unbind();
        state.session = None;
        state.server_name = None;
        state.transition(ConnectionState::Disconnected);
    }

    /// Halt the drive target and send a stop output to every actuator of the
    /// bound device. Returns how many actuators acknowledged.
    ///
    /// When the per-actuator stop fails, a device-wide `StopDeviceCmd` is sent
    /// instead; if the server accepts it every actuator counts as stopped.
    #[instrument(skip(self))]
    pub async fn stop_all(&self) -> usize {
        let (session, device, depth) = {
            let mut state = lock(&self.shared);
            state.halt();
            state.last_speed = 0.0;
            (
                state.session.clone(),
                state.device.clone(),
                state.target.intent.depth,
            )
        };
        let (Some(session), Some(device)) = (session, device) else {
            debug!("stop: no device bound");
            return 0;
        };

        let targets = stop_outputs(&device, depth);
        let _io = self.io.lock().await;
        match send_to_actuators(
            session.as_ref(),
            device.index,
            &targets,
            self.config.command_timeout,
        )
        .await
        {
            Ok(stopped) => {
                info!(device = %device.name, actuators = stopped, "device stopped");
                stopped
            }
            Err(e) => {
                warn!(device = %device.name, error = %e, "stop command failed; stopping whole device");
                match tokio::time::timeout(
                    self.config.command_timeout,
                    session.stop_device(device.index),
                )
                .await
                .unwrap_or_else(|_| Err(StrokeError::timeout("StopDeviceCmd", self.config.command_timeout)))
                {
                    Ok(()) => {
                        info!(device = %device.name, "device stopped with device-wide stop");
                        targets.len()
                    }
                    Err(e) => {
                        warn!(device = %device.name, error = %e, "device-wide stop failed");
                        0
                    }
                }
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Run the discovery window and return every device known at its end, in
/// report order.
///
/// Devices already known to the server come first, then devices announced
/// while scanning. A device removed during the window is dropped. The window
/// always runs to its end.
#[instrument(skip(session, events, window), fields(window_ms = window.as_millis() as u64))]
pub async fn discover(
    session: &dyn DeviceSession,
    events: &mut broadcast::Receiver<SessionEvent>,
    window: Duration,
) -> Result<Vec<DeviceDescriptor>, StrokeError> {
    let mut devices = session.device_list().await?;
    debug!(known = devices.len(), "server device list");

    match session.start_scanning().await {
        Ok(()) => {}
        Err(StrokeError::Protocol { code, message }) => {
            warn!(code, message = %message, "server refused to scan; using known devices");
        }
        Err(e) => return Err(e),
    }

    let deadline = Instant::now() + window;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            event = events.recv() => match event {
                Ok(SessionEvent::DeviceAdded(device)) => {
                    debug!(device = %device.name, index = device.index, "discovered device");
                    devices.retain(|d| d.index != device.index);
                    devices.push(device);
                }
                Ok(SessionEvent::DeviceRemoved(index)) => devices.retain(|d| d.index != index),
                Ok(SessionEvent::ScanningFinished) => debug!("server finished scanning early"),
                Ok(SessionEvent::Closed) | Err(RecvError::Closed) => {
                    return Err(StrokeError::Transport(
                        "connection closed during discovery".to_string(),
                    ));
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "discovery events dropped"),
            },
        }
    }

    if let Err(e) = session.stop_scanning().await {
        warn!(error = %e, "stop scanning failed");
    }
    Ok(devices)
}

/// Follow server events after a device is bound: drop the binding when the
/// device goes away, and fall back to `Disconnected` when the link does.
async fn watch_session(shared: Shared, mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::DeviceRemoved(index)) => {
                let mut state = lock(&shared);
                if state.device.as_ref().is_some_and(|d| d.index == index) {
                    warn!(index, "bound device removed");
                    state.unbind();
                }
            }
            Ok(SessionEvent::Closed) | Err(RecvError::Closed) => {
                let mut state = lock(&shared);
                if state.connection == ConnectionState::Connected {
                    warn!("lost connection to device server");
                    state.transition(ConnectionState::ShuttingDown);
                    state.unbind();
                    state.session = None;
                    state.server_name = None;
                    state.transition(ConnectionState::Disconnected);
                }
                break;
            }
            Ok(SessionEvent::DeviceAdded(device)) => {
                debug!(device = %device.name, "device added after binding");
            }
            Ok(SessionEvent::ScanningFinished) => {}
            Err(RecvError::Lagged(missed)) => warn!(missed, "session events dropped"),
        }
    }
}

/// Per-class actuator counts of a bound device.
pub fn actuator_counts(device: &Device) -> [(CapabilityClass, usize); 3] {
    CapabilityClass::ALL.map(|class| (class, device.actuators.bucket(class).len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SharedState;
    use std::sync::Mutex;
    use strokegpt_middleware::SimConnector;
    use strokegpt_types::{ActuatorDescriptor, CommandRoute};

    fn scalar_device(index: u32, name: &str, actuator_type: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            index,
            name: name.into(),
            actuators: vec![ActuatorDescriptor {
                index: 0,
                description: format!("{actuator_type} - Level 1"),
                route: CommandRoute::Scalar {
                    actuator_type: actuator_type.into(),
                },
            }],
            ..Default::default()
        }
    }

    fn manager(sim: &SimConnector) -> (ConnectionManager, Shared) {
        let shared: Shared = Arc::new(Mutex::new(SharedState::default()));
        let config = ConnectionConfig {
            discovery_window: Duration::from_millis(30),
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_millis(200),
        };
        let manager = ConnectionManager::new(
            Arc::new(sim.clone()),
            Arc::clone(&shared),
            IoLock::default(),
            config,
        );
        (manager, shared)
    }

    #[tokio::test]
    async fn discovery_merges_known_and_announced_devices() {
        let sim = SimConnector::new()
            .with_device(scalar_device(0, "Pump", "Inflate"))
            .with_advertised_device(scalar_device(1, "Wand", "Vibrate"));
        let session = sim.open("sim://").await.unwrap();
        let mut events = session.subscribe();

        let devices = discover(session.as_ref(), &mut events, Duration::from_millis(20))
            .await
            .unwrap();
        let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["Pump", "Wand"]);
    }

    #[tokio::test]
    async fn connect_skips_incompatible_device_and_binds_next() {
        let sim = SimConnector::new()
            .with_device(scalar_device(0, "Pump", "Inflate"))
            .with_advertised_device(scalar_device(1, "Wand", "Vibrate"));
        let (mut manager, shared) = manager(&sim);

        assert_eq!(manager.connect("sim://").await, ConnectionState::Connected);
        let state = lock(&shared);
        assert!(state.is_connected());
        assert_eq!(state.device.as_ref().unwrap().name, "Wand");
        assert_eq!(state.server_name.as_deref(), Some("StrokeGPT simulator"));
    }

    #[tokio::test]
    async fn empty_server_ends_disconnected_and_closes_session() {
        let sim = SimConnector::new();
        let (mut manager, shared) = manager(&sim);

        assert_eq!(manager.connect("sim://").await, ConnectionState::Disconnected);
        assert_eq!(lock(&shared).connection, ConnectionState::Disconnected);
        assert_eq!(sim.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn refused_connection_ends_disconnected() {
        let sim = SimConnector::new().refusing_connections();
        let (mut manager, shared) = manager(&sim);
        assert_eq!(manager.connect("sim://").await, ConnectionState::Disconnected);
        assert!(lock(&shared).session.is_none());
    }

    #[tokio::test]
    async fn disconnect_stops_then_clears_and_is_idempotent() {
        let sim = SimConnector::new().with_device(scalar_device(0, "Wand", "Vibrate"));
        let (mut manager, shared) = manager(&sim);
        manager.connect("sim://").await;

        manager.disconnect().await;
        assert_eq!(
            sim.sent().last().map(|s| s.output),
            Some(strokegpt_types::ActuatorOutput::Scalar { level: 0.0 })
        );
        assert_eq!(lock(&shared).connection, ConnectionState::Disconnected);
        assert!(lock(&shared).device.is_none());

        manager.disconnect().await;
        assert_eq!(lock(&shared).connection, ConnectionState::Disconnected);
        assert_eq!(sim.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn removal_and_link_loss_are_tracked() {
        let sim = SimConnector::new().with_device(scalar_device(4, "Wand", "Vibrate"));
        let (mut manager, shared) = manager(&sim);
        manager.connect("sim://").await;

        sim.remove_device(4);
        tokio::time::sleep(Duration::from_millis(20)).await;
        {
            let state = lock(&shared);
            assert!(state.device.is_none());
            assert_eq!(state.connection, ConnectionState::Connected);
        }

        sim.drop_connection();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lock(&shared).connection, ConnectionState::Disconnected);
        assert!(lock(&shared).session.is_none());
    }

    #[tokio::test]
    async fn failed_actuator_stop_falls_back_to_device_stop() {
        let sim = SimConnector::new()
            .with_device(scalar_device(2, "Wand", "Vibrate"))
            .failing_actuator(2, 0);
        let (mut manager, _shared) = manager(&sim);
        manager.connect("sim://").await;

        assert_eq!(manager.stop_all().await, 1);
        assert_eq!(sim.stopped_devices(), vec![2]);
    }

    #[tokio::test]
    async fn successful_actuator_stop_skips_device_stop() {
        let sim = SimConnector::new().with_device(scalar_device(2, "Wand", "Vibrate"));
        let (mut manager, _shared) = manager(&sim);
        manager.connect("sim://").await;

        assert_eq!(manager.stop_all().await, 1);
        assert!(sim.stopped_devices().is_empty());
    }

    #[tokio::test]
    async fn spent_budget_connects_nothing() {
        let sim = SimConnector::new().with_device(scalar_device(0, "Wand", "Vibrate"));
        let (mut manager, shared) = manager(&sim);

        assert_eq!(
            manager.connect_within("sim://", Duration::ZERO).await,
            ConnectionState::Disconnected
        );
        assert_eq!(sim.sessions_opened(), 0);
        assert_eq!(lock(&shared).connection, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn budget_shorter_than_discovery_times_out() {
        let sim = SimConnector::new().with_device(scalar_device(0, "Wand", "Vibrate"));
        let (mut manager, shared) = manager(&sim);

        assert_eq!(
            manager.connect_within("sim://", Duration::from_millis(10)).await,
            ConnectionState::Disconnected
        );
        assert_eq!(sim.sessions_opened(), 1);
        assert!(!lock(&shared).is_connected());
    }

    #[test]
    fn connection_operations_open_spans() {
        use tracing::span::{Attributes, Id};
        use tracing::Subscriber;
        use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

        struct SpanNames(Arc<Mutex<Vec<&'static str>>>);

        impl<S: Subscriber> Layer<S> for SpanNames {
            fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
                self.0.lock().unwrap().push(attrs.metadata().name());
            }
        }

        let names = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(SpanNames(Arc::clone(&names)));
        tracing::subscriber::with_default(subscriber, || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let sim = SimConnector::new().with_device(scalar_device(0, "Wand", "Vibrate"));
                let (mut manager, _shared) = manager(&sim);
                manager.connect("sim://").await;
                manager.stop_all().await;
                manager.disconnect().await;
            });
        });

        let names = names.lock().unwrap();
        for expected in ["connect", "discover", "stop_all", "disconnect"] {
            assert!(names.contains(&expected), "no {expected} span in {names:?}");
        }
    }

    #[test]
    fn counts_follow_class_order() {
        let device = Device {
            index: 0,
            name: "x".into(),
            actuators: Default::default(),
        };
        let counts = actuator_counts(&device);
        assert_eq!(counts[0], (CapabilityClass::Linear, 0));
        assert_eq!(counts[2], (CapabilityClass::Rotating, 0));
    }
}
