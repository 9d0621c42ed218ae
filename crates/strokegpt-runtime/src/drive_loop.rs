//! The continuous drive loop.
//!
//! One [`DriveLoop`] task runs on the bridge's event loop from construction
//! until shutdown. Each tick it snapshots the shared state and, if motion is
//! active on a bound device, drives the device's primary capability class:
//!
//! * **Linear** – one full stroke cycle: move to one endpoint, wait the leg
//!   duration, move to the other, wait again. The cycle starts at the
//!   endpoint farther from the last commanded position. A completed cycle
//!   ends at `pos_high`, so the next one starts at `pos_low` again and the
//!   rail keeps travelling low, high, low, high with no idle gap. Only a
//!   cycle cut short by a target change (ending at `pos_low`) starts high.
//! * **Vibrating / rotating** – set the level once, then wait the idle
//!   interval before looking at the target again.
//!
//! Errors never end the loop. A timed-out command halts motion and sends
//! stop outputs; any other failure waits out the error backoff.
//!
//! Device I/O is serialised with the connection manager through an
//! [`IoLock`], and the target is re-checked after the lock is taken, so a
//! stop can never be overtaken by a stroke leg that was already queued.

use std::sync::Arc;
use std::time::Duration;

use strokegpt_hal::{immediate_output, stop_command, translate};
use strokegpt_middleware::DeviceSession;
use strokegpt_types::{
    Actuator, ActuatorCommand, ActuatorOutput, CapabilityClass, Device, LinearCommand,
    MotionIntent, StrokeError,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::state::{Shared, lock};

/// Serialises device I/O between the drive loop and one-shot operations.
pub type IoLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Clone)]
pub struct DriveConfig {
    /// Pause between ticks when idle, and after a vibration/rotation update.
    pub idle_interval: Duration,
    /// Pause after a failed command.
    pub error_backoff: Duration,
    /// Upper bound on a single actuator command.
    pub command_timeout: Duration,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
            command_timeout: Duration::from_secs(1),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Stop output for every actuator of `device`, linear ones holding at the
/// centre derived from `depth`.
pub fn stop_outputs(device: &Device, depth: f64) -> Vec<(Actuator, ActuatorOutput)> {
    CapabilityClass::ALL
        .into_iter()
        .flat_map(|class| {
            let output = immediate_output(&stop_command(class, depth));
            device
                .actuators
                .bucket(class)
                .iter()
                .filter_map(move |actuator| output.map(|o| (actuator.clone(), o)))
        })
        .collect()
}

/// Send each output to its actuator, every command bounded by
/// `command_timeout`.
///
/// A failing actuator is logged and skipped. Returns the number of
/// actuators that accepted their output, a timeout error if any command
/// timed out, or the last error if every command failed.
pub async fn send_to_actuators(
    session: &dyn DeviceSession,
    device_index: u32,
    targets: &[(Actuator, ActuatorOutput)],
    command_timeout: Duration,
) -> Result<usize, StrokeError> {
    let mut sent = 0;
    let mut timed_out = None;
    let mut last_error = None;

    for (actuator, output) in targets {
        let result = tokio::time::timeout(
            command_timeout,
            session.send_output(device_index, actuator, *output),
        )
        .await
        .unwrap_or_else(|_| Err(StrokeError::timeout("actuator command", command_timeout)));

        match result {
            Ok(()) => sent += 1,
            Err(e) => {
                warn!(
                    device = device_index,
                    actuator = actuator.index,
                    class = %actuator.class,
                    error = %e,
                    "actuator command failed"
                );
                if e.is_timeout() {
                    timed_out = Some(e);
                } else {
                    last_error = Some(e);
                }
            }
        }
    }

    if let Some(e) = timed_out {
        return Err(e);
    }
    match last_error {
        Some(e) if sent == 0 => Err(e),
        _ => Ok(sent),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Drive loop
// ─────────────────────────────────────────────────────────────────────────────

/// What one tick works from, copied out of the shared state.
struct Tick {
    session: Arc<dyn DeviceSession>,
    device: Device,
    class: CapabilityClass,
    intent: MotionIntent,
    generation: u64,
}

pub struct DriveLoop {
    shared: Shared,
    io: IoLock,
    config: DriveConfig,
    shutdown: watch::Receiver<bool>,
    last_position: Option<f64>,
}

impl DriveLoop {
    pub fn new(
        shared: Shared,
        io: IoLock,
        config: DriveConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            shared,
            io,
            config,
            shutdown,
            last_position: None,
        }
    }

    /// Run until the shutdown flag is raised or its sender is dropped.
    pub async fn run(mut self) {
        debug!("drive loop started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let pause = match self.snapshot() {
                None => {
                    self.last_position = None;
                    self.config.idle_interval
                }
                Some(tick) => match self.drive(&tick).await {
                    Ok(pause) => pause,
                    Err(e) if e.is_timeout() => {
                        warn!(device = %tick.device.name, error = %e, "command timed out; stopping device");
                        self.emergency_stop(&tick).await;
                        self.config.error_backoff
                    }
                    Err(e) => {
                        warn!(device = %tick.device.name, error = %e, "drive tick failed");
                        self.config.error_backoff
                    }
                },
            };

            if !self.pause(pause).await {
                break;
            }
        }
        info!("drive loop stopped");
    }

    fn snapshot(&self) -> Option<Tick> {
        let state = lock(&self.shared);
        if !state.target.active || !state.is_connected() {
            return None;
        }
        let device = state.device.clone()?;
        let session = state.session.clone()?;
        let class = device.actuators.primary_class()?;
        Some(Tick {
            session,
            device,
            class,
            intent: state.target.intent,
            generation: state.generation,
        })
    }

    fn still_current(&self, generation: u64) -> bool {
        let state = lock(&self.shared);
        state.target.active && state.generation == generation
    }

    /// Sleep for `duration`. Returns `false` if shutdown was requested.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.shutdown.changed() => false,
        }
    }

    async fn send(&self, tick: &Tick, output: ActuatorOutput) -> Result<usize, StrokeError> {
        let targets: Vec<(Actuator, ActuatorOutput)> = tick
            .device
            .actuators
            .bucket(tick.class)
            .iter()
            .map(|a| (a.clone(), output))
            .collect();

        let _io = self.io.lock().await;
        if !self.still_current(tick.generation) {
            return Ok(0);
        }
        send_to_actuators(
            tick.session.as_ref(),
            tick.device.index,
            &targets,
            self.config.command_timeout,
        )
        .await
    }

    /// Drive one tick and return how long to wait before the next.
    async fn drive(&mut self, tick: &Tick) -> Result<Duration, StrokeError> {
        let command = translate(&tick.intent, tick.class);
        if let Some(output) = immediate_output(&command) {
            self.send(tick, output).await?;
            return Ok(self.config.idle_interval);
        }

        let ActuatorCommand::Linear(LinearCommand::Stroke(stroke)) = command else {
            return Ok(self.config.idle_interval);
        };

        let start_low = match self.last_position {
            Some(p) => (p - stroke.pos_low).abs() >= (p - stroke.pos_high).abs(),
            None => true,
        };
        for leg in stroke.legs(start_low) {
            if !self.still_current(tick.generation) {
                break;
            }
            self.send(tick, leg).await?;
            if let ActuatorOutput::Position { position, .. } = leg {
                self.last_position = Some(position);
            }
            if !self.pause(Duration::from_millis(u64::from(stroke.duration_ms))).await {
                break;
            }
        }
        Ok(Duration::ZERO)
    }

    /// Halt the target and send stop outputs, after a command timed out.
    async fn emergency_stop(&mut self, tick: &Tick) {
        let depth = {
            let mut state = lock(&self.shared);
            state.halt();
            state.last_speed = 0.0;
            state.target.intent.depth
        };
        self.last_position = None;

        let targets = stop_outputs(&tick.device, depth);
        let _io = self.io.lock().await;
        if let Err(e) = send_to_actuators(
            tick.session.as_ref(),
            tick.device.index,
            &targets,
            self.config.command_timeout,
        )
        .await
        {
            warn!(device = %tick.device.name, error = %e, "emergency stop failed");
        }
    }
}
