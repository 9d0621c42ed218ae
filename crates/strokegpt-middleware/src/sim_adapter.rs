//! In-process simulated device server.
//!
//! [`SimConnector`] stands in for an Intiface server so the connection
//! manager, the drive loop and the CLI can run headless. It records every
//! actuator output it accepts and can be told to misbehave: refuse
//! connections, fail one actuator, time out every output, drop a device or
//! drop the whole connection.
//!
//! Outputs go through the same route validation as the WebSocket session, so
//! a command that the real server would never receive is rejected here too.
//!
//! ```rust
//! use strokegpt_middleware::SimConnector;
//! use strokegpt_types::{ActuatorDescriptor, CommandRoute, DeviceDescriptor};
//!
//! let sim = SimConnector::new().with_device(DeviceDescriptor {
//!     index: 0,
//!     name: "Sim stroker".into(),
//!     linear: vec![ActuatorDescriptor {
//!         index: 0,
//!         description: "Linear - Position".into(),
//!         route: CommandRoute::Linear,
//!     }],
//!     ..Default::default()
//! });
//! assert!(sim.sent().is_empty());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use strokegpt_types::{
    Actuator, ActuatorOutput, CapabilityClass, DeviceDescriptor, StrokeError,
};
use tokio::sync::broadcast;
use tracing::debug;

use crate::adapter::{DeviceSession, SessionConnector, SessionEvent};
use crate::bus::SessionBus;
use crate::protocol;

/// Server name reported by simulated sessions.
const SIM_SERVER_NAME: &str = "StrokeGPT simulator";

/// One actuator output accepted by the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct SentOutput {
    pub device_index: u32,
    pub actuator_index: u32,
    pub class: CapabilityClass,
    pub output: ActuatorOutput,
}

#[derive(Default)]
struct SimState {
    /// Devices returned by `device_list`.
    known: Vec<DeviceDescriptor>,
    /// Devices announced with `DeviceAdded` once scanning starts.
    advertised: Vec<DeviceDescriptor>,
    refuse_connections: bool,
    failing: Option<(u32, u32)>,
    output_timeout: Option<Duration>,
    sent: Vec<SentOutput>,
    stopped_devices: Vec<u32>,
    sessions_opened: usize,
    sessions_closed: usize,
    live: Vec<(SessionBus, Arc<AtomicBool>)>,
}

/// Connector for the simulated server. Clones share state, so a test can
/// keep one handle for inspection while the runtime owns another.
#[derive(Clone, Default)]
pub struct SimConnector {
    state: Arc<Mutex<SimState>>,
}

impl SimConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Builder ──────────────────────────────────────────────────────────────

    /// A device the server already knows when the client connects.
    pub fn with_device(self, device: DeviceDescriptor) -> Self {
        self.lock().known.push(device);
        self
    }

    /// A device that only shows up once scanning starts.
    pub fn with_advertised_device(self, device: DeviceDescriptor) -> Self {
        self.lock().advertised.push(device);
        self
    }

    /// Make every `open` fail with a transport error.
    pub fn refusing_connections(self) -> Self {
        self.lock().refuse_connections = true;
        self
    }

    /// Reject outputs addressed to one actuator index of one device.
    pub fn failing_actuator(self, device_index: u32, actuator_index: u32) -> Self {
        self.lock().failing = Some((device_index, actuator_index));
        self
    }

    /// Let every output time out after `after`, the way an unresponsive
    /// server does.
    pub fn timing_out_outputs(self, after: Duration) -> Self {
        self.lock().output_timeout = Some(after);
        self
    }

    // ── Inspection ───────────────────────────────────────────────────────────

    pub fn sent(&self) -> Vec<SentOutput> {
        self.lock().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.lock().sent.clear();
    }

    /// Device indices that received `StopDeviceCmd`, in order.
    pub fn stopped_devices(&self) -> Vec<u32> {
        self.lock().stopped_devices.clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.lock().sessions_opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.lock().sessions_closed
    }

    // ── Fault injection ──────────────────────────────────────────────────────

    /// Unplug a device: it leaves the device list and every live session
    /// receives `DeviceRemoved`.
    pub fn remove_device(&self, device_index: u32) {
        let buses: Vec<SessionBus> = {
            let mut state = self.lock();
            state.known.retain(|d| d.index != device_index);
            state.advertised.retain(|d| d.index != device_index);
            state.live.iter().map(|(bus, _)| bus.clone()).collect()
        };
        for bus in buses {
            bus.publish(SessionEvent::DeviceRemoved(device_index));
        }
    }

    /// Kill the connection under every live session.
    pub fn drop_connection(&self) {
        let live = std::mem::take(&mut self.lock().live);
        for (bus, closed) in live {
            closed.store(true, Ordering::SeqCst);
            bus.publish(SessionEvent::Closed);
        }
    }
}

#[async_trait]
impl SessionConnector for SimConnector {
    async fn open(&self, server_uri: &str) -> Result<Arc<dyn DeviceSession>, StrokeError> {
        let mut state = self.lock();
        if state.refuse_connections {
            return Err(StrokeError::Transport(format!(
                "connection to {server_uri} refused"
            )));
        }

        let bus = SessionBus::default();
        let closed = Arc::new(AtomicBool::new(false));
        state.live.push((bus.clone(), Arc::clone(&closed)));
        state.sessions_opened += 1;
        debug!(uri = %server_uri, "simulated session opened");

        Ok(Arc::new(SimSession {
            state: Arc::clone(&self.state),
            bus,
            closed,
        }))
    }
}

struct SimSession {
    state: Arc<Mutex<SimState>>,
    bus: SessionBus,
    closed: Arc<AtomicBool>,
}

impl SimSession {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), StrokeError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StrokeError::Transport("session is closed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DeviceSession for SimSession {
    fn server_name(&self) -> &str {
        SIM_SERVER_NAME
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    async fn device_list(&self) -> Result<Vec<DeviceDescriptor>, StrokeError> {
        self.ensure_open()?;
        Ok(self.lock().known.clone())
    }

    async fn start_scanning(&self) -> Result<(), StrokeError> {
        self.ensure_open()?;
        let found = {
            let mut state = self.lock();
            let found = std::mem::take(&mut state.advertised);
            state.known.extend(found.iter().cloned());
            found
        };
        for device in found {
            self.bus.publish(SessionEvent::DeviceAdded(device));
        }
        Ok(())
    }

    async fn stop_scanning(&self) -> Result<(), StrokeError> {
        self.ensure_open()?;
        self.bus.publish(SessionEvent::ScanningFinished);
        Ok(())
    }

    async fn send_output(
        &self,
        device_index: u32,
        actuator: &Actuator,
        output: ActuatorOutput,
    ) -> Result<(), StrokeError> {
        self.ensure_open()?;
        protocol::output_message(1, device_index, actuator, output)?;

        let timeout = {
            let state = self.lock();
            if !state.known.iter().any(|d| d.index == device_index) {
                return Err(StrokeError::Protocol {
                    code: 3,
                    message: format!("device index {device_index} does not exist"),
                });
            }
            if state.failing == Some((device_index, actuator.index)) {
                return Err(StrokeError::Protocol {
                    code: 4,
                    message: format!("actuator {} failed", actuator.index),
                });
            }
            state.output_timeout
        };
        if let Some(after) = timeout {
            tokio::time::sleep(after).await;
            return Err(StrokeError::timeout("actuator command", after));
        }

        self.lock().sent.push(SentOutput {
            device_index,
            actuator_index: actuator.index,
            class: actuator.class,
            output,
        });
        Ok(())
    }

    async fn stop_device(&self, device_index: u32) -> Result<(), StrokeError> {
        self.ensure_open()?;
        self.lock().stopped_devices.push(device_index);
        Ok(())
    }

    async fn close(&self) -> Result<(), StrokeError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.lock();
        state.sessions_closed += 1;
        state.live.retain(|(_, flag)| !Arc::ptr_eq(flag, &self.closed));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strokegpt_types::{ActuatorDescriptor, CommandRoute};

    fn stroker(index: u32) -> DeviceDescriptor {
        DeviceDescriptor {
            index,
            name: "Sim stroker".into(),
            linear: vec![ActuatorDescriptor {
                index: 0,
                description: "Linear - Position".into(),
                route: CommandRoute::Linear,
            }],
            ..Default::default()
        }
    }

    fn rail() -> Actuator {
        Actuator {
            index: 0,
            class: CapabilityClass::Linear,
            description: "Linear - Position".into(),
            route: CommandRoute::Linear,
        }
    }

    const HOLD: ActuatorOutput = ActuatorOutput::Position {
        position: 0.5,
        duration_ms: 200,
    };

    #[tokio::test]
    async fn records_outputs_and_counts_sessions() {
        let sim = SimConnector::new().with_device(stroker(0));
        let session = sim.open("sim://").await.unwrap();
        assert_eq!(session.server_name(), SIM_SERVER_NAME);
        assert_eq!(session.device_list().await.unwrap().len(), 1);

        session.send_output(0, &rail(), HOLD).await.unwrap();
        assert_eq!(
            sim.sent(),
            vec![SentOutput {
                device_index: 0,
                actuator_index: 0,
                class: CapabilityClass::Linear,
                output: HOLD,
            }]
        );

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(sim.sessions_opened(), 1);
        assert_eq!(sim.sessions_closed(), 1);
        assert!(session.send_output(0, &rail(), HOLD).await.is_err());
    }

    #[tokio::test]
    async fn scanning_announces_advertised_devices() {
        let sim = SimConnector::new().with_advertised_device(stroker(7));
        let session = sim.open("sim://").await.unwrap();
        assert!(session.device_list().await.unwrap().is_empty());

        let mut events = session.subscribe();
        session.start_scanning().await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::DeviceAdded(stroker(7))
        );
        session.stop_scanning().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::ScanningFinished);
        assert_eq!(session.device_list().await.unwrap()[0].index, 7);
    }

    #[tokio::test]
    async fn refused_connection_fails_open() {
        let sim = SimConnector::new().refusing_connections();
        assert!(matches!(
            sim.open("ws://127.0.0.1:12345").await,
            Err(StrokeError::Transport(_))
        ));
        assert_eq!(sim.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn failing_actuator_and_unknown_device_are_rejected() {
        let sim = SimConnector::new()
            .with_device(stroker(0))
            .failing_actuator(0, 0);
        let session = sim.open("sim://").await.unwrap();

        assert!(matches!(
            session.send_output(0, &rail(), HOLD).await,
            Err(StrokeError::Protocol { code: 4, .. })
        ));
        assert!(matches!(
            session.send_output(9, &rail(), HOLD).await,
            Err(StrokeError::Protocol { code: 3, .. })
        ));
        assert!(sim.sent().is_empty());
    }

    #[tokio::test]
    async fn timing_out_outputs_report_timeout() {
        let sim = SimConnector::new()
            .with_device(stroker(0))
            .timing_out_outputs(Duration::from_millis(20));
        let session = sim.open("sim://").await.unwrap();
        let err = session.send_output(0, &rail(), HOLD).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn removal_and_connection_loss_reach_subscribers() {
        let sim = SimConnector::new().with_device(stroker(0));
        let session = sim.open("sim://").await.unwrap();
        let mut events = session.subscribe();

        sim.remove_device(0);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::DeviceRemoved(0));
        assert!(session.device_list().await.unwrap().is_empty());

        sim.drop_connection();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Closed);
        assert!(matches!(
            session.stop_device(0).await,
            Err(StrokeError::Transport(_))
        ));
    }
}
