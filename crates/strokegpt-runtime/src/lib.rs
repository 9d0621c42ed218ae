//! `strokegpt-runtime` – the device bridge.
//!
//! Owns the live connection to the device server and keeps the bound device
//! moving while callers on ordinary threads steer it.
//!
//! # Modules
//!
//! - [`bridge`] – [`DeviceBridge`]: the thread-safe facade. Runs a dedicated
//!   event-loop thread and marshals `connect` / `stop` / `disconnect` onto it
//!   with bounded waits; `move_to` only updates the shared drive target.
//! - [`connection`] – [`ConnectionManager`]: connect, timed discovery window,
//!   first-compatible binding, removal tracking and graceful teardown.
//! - [`drive_loop`] – [`DriveLoop`]: the perpetual task that strokes linear
//!   actuators and refreshes vibration or rotation levels while active.
//! - [`state`] – the single mutex-guarded [`SharedState`].
//! - [`modes`] – [`ModeSupervisor`]: one background pattern-playback thread at
//!   a time, through a [`MotionSink`].
//! - [`telemetry`] – [`init_tracing`]: the global `tracing` subscriber with an
//!   optional OTLP span exporter.

pub mod bridge;
pub mod connection;
pub mod drive_loop;
pub mod modes;
pub mod state;
pub mod telemetry;

pub use bridge::{BridgeConfig, BridgeStatus, DEFAULT_SERVER_URI, DeviceBridge};
pub use connection::{ConnectionConfig, ConnectionManager};
pub use drive_loop::{DriveConfig, DriveLoop};
pub use modes::{MotionLimits, MotionSink, ModeSupervisor, PatternStep, demo_pattern};
pub use state::{DriveTarget, SharedState};
pub use telemetry::{TracerProviderGuard, init_tracing};
