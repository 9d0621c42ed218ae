//! Shared vocabulary for the StrokeGPT device-control stack.
//!
//! Every other crate in the workspace speaks in these types: the normalized
//! [`MotionIntent`] callers submit, the classified [`Actuator`]s of a bound
//! [`Device`], the per-class [`ActuatorCommand`]s the translator produces and
//! the wire-level [`ActuatorOutput`]s a session sends to the server.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Motion intent
// ─────────────────────────────────────────────────────────────────────────────

/// Normalized control signal: speed, depth (stroke centre) and stroke range,
/// each on a 0–100 scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionIntent {
    pub speed: f64,
    pub depth: f64,
    pub range: f64,
}

impl MotionIntent {
    pub fn new(speed: f64, depth: f64, range: f64) -> Self {
        Self { speed, depth, range }
    }

    /// Return a copy with every field clamped to `[0, 100]`.
    ///
    /// `NaN` collapses to `0`, so a malformed intent degrades to a stop.
    pub fn clamped(self) -> Self {
        Self {
            speed: clamp_percent(self.speed),
            depth: clamp_percent(self.depth),
            range: clamp_percent(self.range),
        }
    }

    /// A zero (or negative) speed means "stop", whatever depth and range say.
    pub fn is_stop(&self) -> bool {
        self.speed.is_nan() || self.speed <= 0.0
    }
}

impl Default for MotionIntent {
    fn default() -> Self {
        Self {
            speed: 0.0,
            depth: 50.0,
            range: 50.0,
        }
    }
}

/// Clamp `value` into `[0, 100]`, mapping `NaN` to `0`.
pub fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Actuators and devices
// ─────────────────────────────────────────────────────────────────────────────

/// Behavioural category of an actuator. Declaration order is the drive
/// priority: a device with several classes is driven through the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityClass {
    Linear,
    Vibrating,
    Rotating,
}

impl CapabilityClass {
    pub const ALL: [CapabilityClass; 3] = [
        CapabilityClass::Linear,
        CapabilityClass::Vibrating,
        CapabilityClass::Rotating,
    ];
}

impl std::fmt::Display for CapabilityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityClass::Linear => write!(f, "linear"),
            CapabilityClass::Vibrating => write!(f, "vibrating"),
            CapabilityClass::Rotating => write!(f, "rotating"),
        }
    }
}

/// Protocol message an actuator is addressed through.
///
/// Feature indices are scoped per route, so `(route, index)` is the identity
/// of an actuator within a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandRoute {
    /// `ScalarCmd` feature of the given actuator type (`"Vibrate"`, `"Rotate"`, …).
    Scalar { actuator_type: String },
    /// `LinearCmd` feature.
    Linear,
    /// `RotateCmd` feature.
    Rotate,
}

/// Unclassified actuator as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorDescriptor {
    pub index: u32,
    pub description: String,
    pub route: CommandRoute,
}

/// Unclassified device as reported by the server during discovery.
///
/// `actuators` is the generic descriptor list; `linear` and `rotary` are the
/// typed lists the protocol provides for position and rotation features.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub index: u32,
    pub name: String,
    pub actuators: Vec<ActuatorDescriptor>,
    pub linear: Vec<ActuatorDescriptor>,
    pub rotary: Vec<ActuatorDescriptor>,
}

/// One classified output unit on a bound device. Immutable once classified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actuator {
    pub index: u32,
    pub class: CapabilityClass,
    pub description: String,
    pub route: CommandRoute,
}

impl Actuator {
    pub fn same_identity(&self, route: &CommandRoute, index: u32) -> bool {
        self.index == index && &self.route == route
    }
}

/// Actuators of a device partitioned by [`CapabilityClass`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActuatorBuckets {
    pub linear: Vec<Actuator>,
    pub vibrating: Vec<Actuator>,
    pub rotating: Vec<Actuator>,
}

impl ActuatorBuckets {
    pub fn bucket(&self, class: CapabilityClass) -> &[Actuator] {
        match class {
            CapabilityClass::Linear => &self.linear,
            CapabilityClass::Vibrating => &self.vibrating,
            CapabilityClass::Rotating => &self.rotating,
        }
    }

    pub fn bucket_mut(&mut self, class: CapabilityClass) -> &mut Vec<Actuator> {
        match class {
            CapabilityClass::Linear => &mut self.linear,
            CapabilityClass::Vibrating => &mut self.vibrating,
            CapabilityClass::Rotating => &mut self.rotating,
        }
    }

    pub fn len(&self) -> usize {
        self.linear.len() + self.vibrating.len() + self.rotating.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The class the drive loop uses: linear, then vibrating, then rotating.
    pub fn primary_class(&self) -> Option<CapabilityClass> {
        CapabilityClass::ALL
            .into_iter()
            .find(|class| !self.bucket(*class).is_empty())
    }
}

/// The device currently bound by the connection manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub index: u32,
    pub name: String,
    pub actuators: ActuatorBuckets,
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

/// One full linear stroke cycle between two normalized positions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearStroke {
    pub pos_low: f64,
    pub pos_high: f64,
    /// Travel time of each half of the cycle.
    pub duration_ms: u32,
}

impl LinearStroke {
    /// The two legs of the cycle, starting at the low end when `start_low`.
    pub fn legs(&self, start_low: bool) -> [ActuatorOutput; 2] {
        let (first, second) = if start_low {
            (self.pos_low, self.pos_high)
        } else {
            (self.pos_high, self.pos_low)
        };
        [
            ActuatorOutput::Position {
                position: first,
                duration_ms: self.duration_ms,
            },
            ActuatorOutput::Position {
                position: second,
                duration_ms: self.duration_ms,
            },
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LinearCommand {
    Stroke(LinearStroke),
    /// Move to `position` and stay there.
    Hold { position: f64, duration_ms: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VibrateCommand {
    pub level: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotateCommand {
    pub speed: f64,
    pub clockwise: bool,
}

/// Translated command for one capability class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ActuatorCommand {
    Linear(LinearCommand),
    Vibrate(VibrateCommand),
    Rotate(RotateCommand),
}

impl ActuatorCommand {
    pub fn class(&self) -> CapabilityClass {
        match self {
            ActuatorCommand::Linear(_) => CapabilityClass::Linear,
            ActuatorCommand::Vibrate(_) => CapabilityClass::Vibrating,
            ActuatorCommand::Rotate(_) => CapabilityClass::Rotating,
        }
    }

    /// `true` when this command brings its actuator to rest.
    pub fn is_stop(&self) -> bool {
        match self {
            ActuatorCommand::Linear(LinearCommand::Hold { .. }) => true,
            ActuatorCommand::Linear(LinearCommand::Stroke(_)) => false,
            ActuatorCommand::Vibrate(v) => v.level == 0.0,
            ActuatorCommand::Rotate(r) => r.speed == 0.0,
        }
    }
}

/// A single wire-level instruction for one actuator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ActuatorOutput {
    Position { position: f64, duration_ms: u32 },
    Scalar { level: f64 },
    Rotation { speed: f64, clockwise: bool },
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection state
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of the link to the actuator-control server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

impl ConnectionState {
    /// Whether `self → next` is one of the permitted single-step transitions.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, ShuttingDown)
                | (ShuttingDown, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Error type spanning transport failures, server rejections and timeouts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StrokeError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server rejected request (code {code}): {message}")]
    Protocol { code: i64, message: String },

    #[error("Timed out after {after_ms} ms waiting for {operation}")]
    Timeout { operation: String, after_ms: u64 },

    #[error("No device bound")]
    NoDevice,

    #[error("Actuator {index} cannot accept this command: {details}")]
    IncompatibleCommand { index: u32, details: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl StrokeError {
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        StrokeError::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StrokeError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamped_intent_stays_in_percent_range() {
        let intent = MotionIntent::new(-5.0, 140.0, f64::NAN).clamped();
        assert_eq!(intent.speed, 0.0);
        assert_eq!(intent.depth, 100.0);
        assert_eq!(intent.range, 0.0);
    }

    #[test]
    fn zero_and_negative_speed_are_stops() {
        assert!(MotionIntent::new(0.0, 50.0, 50.0).is_stop());
        assert!(MotionIntent::new(-1.0, 50.0, 50.0).is_stop());
        assert!(MotionIntent::new(f64::NAN, 50.0, 50.0).is_stop());
        assert!(!MotionIntent::new(0.5, 50.0, 50.0).is_stop());
    }

    #[test]
    fn primary_class_prefers_linear_then_vibrating() {
        let vib = Actuator {
            index: 0,
            class: CapabilityClass::Vibrating,
            description: "Vibrate - Level 1".into(),
            route: CommandRoute::Scalar {
                actuator_type: "Vibrate".into(),
            },
        };
        let lin = Actuator {
            index: 0,
            class: CapabilityClass::Linear,
            description: "Linear - Position".into(),
            route: CommandRoute::Linear,
        };
        let mut buckets = ActuatorBuckets::default();
        assert_eq!(buckets.primary_class(), None);

        buckets.vibrating.push(vib);
        assert_eq!(buckets.primary_class(), Some(CapabilityClass::Vibrating));

        buckets.linear.push(lin);
        assert_eq!(buckets.primary_class(), Some(CapabilityClass::Linear));
        assert_eq!(buckets.len(), 2);
    }

    #[test]
    fn stroke_legs_follow_start_end() {
        let stroke = LinearStroke {
            pos_low: 0.25,
            pos_high: 0.75,
            duration_ms: 1100,
        };
        let [a, b] = stroke.legs(false);
        assert_eq!(
            a,
            ActuatorOutput::Position {
                position: 0.75,
                duration_ms: 1100
            }
        );
        assert_eq!(
            b,
            ActuatorOutput::Position {
                position: 0.25,
                duration_ms: 1100
            }
        );
    }

    #[test]
    fn connection_state_transitions_never_skip() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(ShuttingDown));
        assert!(ShuttingDown.can_transition_to(Disconnected));

        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Disconnected));
        assert!(!ShuttingDown.can_transition_to(Connected));
    }

    #[test]
    fn command_roundtrip() {
        let cmd = ActuatorCommand::Rotate(RotateCommand {
            speed: 0.4,
            clockwise: true,
        });
        let json = serde_json::to_string(&cmd).unwrap();
        let back: ActuatorCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(cmd, back);
        assert_eq!(back.class(), CapabilityClass::Rotating);
    }

    #[test]
    fn stroke_error_display() {
        let err = StrokeError::timeout("StartScanning", std::time::Duration::from_millis(2000));
        assert!(err.to_string().contains("2000 ms"));
        assert!(err.is_timeout());

        let err = StrokeError::Protocol {
            code: 3,
            message: "device not found".into(),
        };
        assert!(err.to_string().contains("device not found"));
    }
}
