//! `strokegpt-middleware` – the wire between the runtime and the device server.
//!
//! The runtime never speaks WebSocket or Buttplug JSON itself. It holds a
//! [`DeviceSession`] obtained from a [`SessionConnector`] and listens to its
//! [`SessionEvent`]s.
//!
//! # Modules
//!
//! - [`adapter`] – the [`DeviceSession`] / [`SessionConnector`] traits.
//! - [`bus`] – broadcast channel carrying server-initiated [`SessionEvent`]s.
//! - [`protocol`] – Buttplug v3 message types and the frame codec.
//! - [`buttplug_adapter`] – [`ButtplugConnector`], a WebSocket session to an
//!   Intiface / Buttplug server.
//! - [`sim_adapter`] – [`SimConnector`], an in-process server for tests and
//!   dry runs without hardware.

pub mod adapter;
pub mod bus;
pub mod buttplug_adapter;
pub mod protocol;
pub mod sim_adapter;

pub use adapter::{DeviceSession, SessionConnector, SessionEvent};
pub use bus::SessionBus;
pub use buttplug_adapter::{ButtplugConnector, DEFAULT_REQUEST_TIMEOUT};
pub use sim_adapter::{SentOutput, SimConnector};
