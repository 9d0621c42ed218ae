//! The session seam.
//!
//! The runtime only ever talks to these traits, so the Buttplug WebSocket
//! client can be swapped for the in-process simulator without touching the
//! connection manager or the drive loop.
//!
//! - [`SessionConnector`] – opens a [`DeviceSession`] to a server URI.
//! - [`DeviceSession`] – one live, handshaken session: discovery, actuator
//!   output and teardown.

use std::sync::Arc;

use async_trait::async_trait;
use strokegpt_types::{Actuator, ActuatorOutput, DeviceDescriptor, StrokeError};
use tokio::sync::broadcast;

/// Server-initiated notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    DeviceAdded(DeviceDescriptor),
    DeviceRemoved(u32),
    ScanningFinished,
    /// The connection to the server is gone; every later request fails.
    Closed,
}

/// A live session with an actuator-control server.
///
/// # Contract
///
/// * Every request either resolves or fails within the session's own request
///   timeout; none of these methods hang forever on a healthy socket.
/// * [`subscribe`](DeviceSession::subscribe) only sees events published after
///   the call, so subscribe before starting a scan.
#[async_trait]
pub trait DeviceSession: Send + Sync {
    /// Name the server reported during the handshake.
    fn server_name(&self) -> &str;

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    /// Devices the server already knows about.
    async fn device_list(&self) -> Result<Vec<DeviceDescriptor>, StrokeError>;

    async fn start_scanning(&self) -> Result<(), StrokeError>;

    async fn stop_scanning(&self) -> Result<(), StrokeError>;

    /// Send one output to one actuator of device `device_index`.
    ///
    /// # Errors
    ///
    /// [`StrokeError::IncompatibleCommand`] when the actuator's route cannot
    /// carry `output`; transport, protocol or timeout errors otherwise.
    async fn send_output(
        &self,
        device_index: u32,
        actuator: &Actuator,
        output: ActuatorOutput,
    ) -> Result<(), StrokeError>;

    /// Halt every actuator of a device.
    async fn stop_device(&self, device_index: u32) -> Result<(), StrokeError>;

    /// Close the session. Calling it twice is harmless.
    async fn close(&self) -> Result<(), StrokeError>;
}

/// Factory for [`DeviceSession`]s.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Connect to `server_uri` and complete the protocol handshake.
    async fn open(&self, server_uri: &str) -> Result<Arc<dyn DeviceSession>, StrokeError>;
}
