//! Motion translation.
//!
//! Maps a normalized [`MotionIntent`] onto the command shape of one
//! [`CapabilityClass`]:
//!
//! | Class | Command |
//! |---|---|
//! | Linear | two-position stroke around `depth`, spanning `range`, each leg taking `duration_ms` |
//! | Vibrating | intensity `speed / 100` |
//! | Rotating | speed `speed / 100`, clockwise |
//!
//! Inputs are clamped, never rejected. A non-positive speed always yields the
//! class's stop command.

use strokegpt_types::{
    ActuatorCommand, ActuatorOutput, CapabilityClass, LinearCommand, LinearStroke, MotionIntent,
    RotateCommand, VibrateCommand, clamp_percent,
};

/// Leg duration at full speed.
pub const MIN_DURATION_MS: u32 = 200;
/// Leg duration at the slowest non-zero speed.
pub const MAX_DURATION_MS: u32 = 2000;

/// Leg duration for `speed`: linear from [`MAX_DURATION_MS`] at 0 down to
/// [`MIN_DURATION_MS`] at 100.
pub fn stroke_duration_ms(speed: f64) -> u32 {
    let fraction = clamp_percent(speed) / 100.0;
    let span = f64::from(MAX_DURATION_MS - MIN_DURATION_MS);
    (f64::from(MAX_DURATION_MS) - span * fraction).round() as u32
}

/// Normalized `(pos_low, pos_high)` endpoints for a stroke centred on `depth`
/// spanning `range`. Always `0 <= pos_low <= pos_high <= 1`.
pub fn stroke_endpoints(depth: f64, range: f64) -> (f64, f64) {
    let center = (clamp_percent(depth) / 100.0).clamp(0.0, 1.0);
    let half_span = (clamp_percent(range) / 100.0 / 2.0).clamp(0.0, 0.5);
    let pos_low = (center - half_span).max(0.0);
    let pos_high = (center + half_span).min(1.0);
    (pos_low, pos_high)
}

/// Translate `intent` into the command for `class`.
pub fn translate(intent: &MotionIntent, class: CapabilityClass) -> ActuatorCommand {
    let intent = intent.clamped();
    if intent.is_stop() {
        return stop_command(class, intent.depth);
    }

    let level = intent.speed / 100.0;
    match class {
        CapabilityClass::Linear => {
            let (pos_low, pos_high) = stroke_endpoints(intent.depth, intent.range);
            ActuatorCommand::Linear(LinearCommand::Stroke(LinearStroke {
                pos_low,
                pos_high,
                duration_ms: stroke_duration_ms(intent.speed),
            }))
        }
        CapabilityClass::Vibrating => ActuatorCommand::Vibrate(VibrateCommand { level }),
        CapabilityClass::Rotating => ActuatorCommand::Rotate(RotateCommand {
            speed: level,
            clockwise: true,
        }),
    }
}

/// The command that brings a `class` actuator to rest.
///
/// Linear actuators hold at the centre derived from `depth` rather than
/// snapping to an end stop.
pub fn stop_command(class: CapabilityClass, depth: f64) -> ActuatorCommand {
    match class {
        CapabilityClass::Linear => ActuatorCommand::Linear(LinearCommand::Hold {
            position: clamp_percent(depth) / 100.0,
            duration_ms: MIN_DURATION_MS,
        }),
        CapabilityClass::Vibrating => ActuatorCommand::Vibrate(VibrateCommand { level: 0.0 }),
        CapabilityClass::Rotating => ActuatorCommand::Rotate(RotateCommand {
            speed: 0.0,
            clockwise: true,
        }),
    }
}

/// The single output for commands that take effect at once, or `None` for a
/// stroke, whose legs the caller must pace itself.
pub fn immediate_output(command: &ActuatorCommand) -> Option<ActuatorOutput> {
    match *command {
        ActuatorCommand::Linear(LinearCommand::Stroke(_)) => None,
        ActuatorCommand::Linear(LinearCommand::Hold {
            position,
            duration_ms,
        }) => Some(ActuatorOutput::Position {
            position,
            duration_ms,
        }),
        ActuatorCommand::Vibrate(VibrateCommand { level }) => {
            Some(ActuatorOutput::Scalar { level })
        }
        ActuatorCommand::Rotate(RotateCommand { speed, clockwise }) => {
            Some(ActuatorOutput::Rotation { speed, clockwise })
        }
    }
}
