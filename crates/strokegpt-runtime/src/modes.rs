//! Background mode threads.
//!
//! A mode plays a sequence of [`PatternStep`]s from the pattern library
//! through a [`MotionSink`], one step after another, on its own OS thread.
//! [`ModeSupervisor`] guarantees at most one mode runs at a time: starting a
//! mode stops and joins the previous one first.
//!
//! A mode thread sleeps in short slices so a stop request takes effect
//! within one slice, and it always stops the sink on its way out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use strokegpt_types::StrokeError;
use tracing::{debug, info, warn};

use crate::bridge::DeviceBridge;

/// Granularity at which a playing mode notices a stop request.
const STOP_POLL_SLICE: Duration = Duration::from_millis(50);

/// Where mode threads send their motion.
pub trait MotionSink: Send + Sync {
    fn move_to(&self, speed: f64, depth: f64, range: f64);
    fn stop(&self);
}

impl MotionSink for DeviceBridge {
    fn move_to(&self, speed: f64, depth: f64, range: f64) {
        DeviceBridge::move_to(self, speed, depth, range);
    }

    fn stop(&self) {
        DeviceBridge::stop(self);
    }
}

/// One step of a stroke pattern.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatternStep {
    pub speed: f64,
    pub depth: f64,
    pub range: f64,
    pub duration_ms: u64,
}

impl PatternStep {
    pub fn new(speed: f64, depth: f64, range: f64, duration_ms: u64) -> Self {
        Self {
            speed,
            depth,
            range,
            duration_ms,
        }
    }
}

/// User-configured motion bounds, applied by callers before motion reaches
/// the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionLimits {
    pub min_speed: f64,
    pub max_speed: f64,
    pub min_depth: f64,
    pub max_depth: f64,
}

impl Default for MotionLimits {
    fn default() -> Self {
        Self {
            min_speed: 0.0,
            max_speed: 100.0,
            min_depth: 0.0,
            max_depth: 100.0,
        }
    }
}

impl MotionLimits {
    /// Bounds clamped to `[0, 100]` with each minimum at or below its maximum.
    pub fn normalized(self) -> Self {
        let pct = |v: f64| if v.is_nan() { 0.0 } else { v.clamp(0.0, 100.0) };
        let (min_speed, max_speed) = (pct(self.min_speed), pct(self.max_speed));
        let (min_depth, max_depth) = (pct(self.min_depth), pct(self.max_depth));
        Self {
            min_speed: min_speed.min(max_speed),
            max_speed: min_speed.max(max_speed),
            min_depth: min_depth.min(max_depth),
            max_depth: min_depth.max(max_depth),
        }
    }

    /// Fit `step` inside these bounds. A zero speed stays zero so a pause in
    /// a pattern is still a pause.
    pub fn apply(&self, step: PatternStep) -> PatternStep {
        let limits = self.normalized();
        let speed = if step.speed <= 0.0 || step.speed.is_nan() {
            0.0
        } else {
            step.speed.clamp(limits.min_speed, limits.max_speed)
        };
        let depth = if step.depth.is_nan() {
            limits.min_depth
        } else {
            step.depth.clamp(limits.min_depth, limits.max_depth)
        };
        let range = if step.range.is_nan() {
            0.0
        } else {
            step.range.clamp(0.0, limits.max_depth - limits.min_depth)
        };
        PatternStep {
            speed,
            depth,
            range,
            ..step
        }
    }
}

/// Short built-in pattern for exercising a device by hand.
pub fn demo_pattern() -> Vec<PatternStep> {
    vec![
        PatternStep::new(20.0, 50.0, 30.0, 4_000),
        PatternStep::new(40.0, 40.0, 50.0, 4_000),
        PatternStep::new(60.0, 60.0, 40.0, 4_000),
        PatternStep::new(80.0, 50.0, 70.0, 4_000),
        PatternStep::new(30.0, 30.0, 20.0, 4_000),
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor
// ─────────────────────────────────────────────────────────────────────────────

struct RunningMode {
    name: String,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct ModeSupervisor {
    sink: Arc<dyn MotionSink>,
    limits: MotionLimits,
    current: Option<RunningMode>,
}

impl ModeSupervisor {
    pub fn new(sink: Arc<dyn MotionSink>, limits: MotionLimits) -> Self {
        Self {
            sink,
            limits,
            current: None,
        }
    }

    /// Start playing `steps` as mode `name`, replacing any running mode.
    /// With `looping` the pattern repeats until stopped.
    ///
    /// An empty pattern stops the current mode and starts nothing.
    ///
    /// # Errors
    ///
    /// [`StrokeError::Runtime`] if the mode thread cannot be spawned.
    pub fn start(
        &mut self,
        name: &str,
        steps: Vec<PatternStep>,
        looping: bool,
    ) -> Result<(), StrokeError> {
        self.stop();
        if steps.is_empty() {
            warn!(mode = %name, "pattern has no steps; nothing to play");
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let steps: Vec<PatternStep> = steps.into_iter().map(|s| self.limits.apply(s)).collect();
        let sink = Arc::clone(&self.sink);
        let thread_stop = Arc::clone(&stop);
        let mode = name.to_string();

        let handle = std::thread::Builder::new()
            .name(format!("strokegpt-mode-{name}"))
            .spawn(move || play(&mode, &steps, looping, sink.as_ref(), &thread_stop))
            .map_err(|e| StrokeError::Runtime(format!("spawn mode thread: {e}")))?;

        info!(mode = %name, looping, "mode started");
        self.current = Some(RunningMode {
            name: name.to_string(),
            stop,
            handle,
        });
        Ok(())
    }

    /// Stop the running mode, if any, and wait for its thread to exit.
    pub fn stop(&mut self) {
        let Some(mode) = self.current.take() else {
            return;
        };
        mode.stop.store(true, Ordering::SeqCst);
        if mode.handle.join().is_err() {
            warn!(mode = %mode.name, "mode thread panicked");
        }
        info!(mode = %mode.name, "mode stopped");
    }

    pub fn is_running(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|mode| !mode.handle.is_finished())
    }

    pub fn current_mode(&self) -> Option<&str> {
        self.current
            .as_ref()
            .filter(|mode| !mode.handle.is_finished())
            .map(|mode| mode.name.as_str())
    }
}

impl Drop for ModeSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn play(name: &str, steps: &[PatternStep], looping: bool, sink: &dyn MotionSink, stop: &AtomicBool) {
    'playback: loop {
        for step in steps {
            if stop.load(Ordering::SeqCst) {
                break 'playback;
            }
            debug!(mode = %name, speed = step.speed, depth = step.depth, range = step.range, "pattern step");
            sink.move_to(step.speed, step.depth, step.range);
            if !sleep_unless_stopped(Duration::from_millis(step.duration_ms), stop) {
                break 'playback;
            }
        }
        if !looping {
            break;
        }
    }
    sink.stop();
    debug!(mode = %name, "mode thread exiting");
}

/// Sleep for `duration` in slices. Returns `false` if `stop` was raised.
fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(STOP_POLL_SLICE.min(deadline - now));
    }
}
