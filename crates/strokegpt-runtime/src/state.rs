//! The one piece of state shared between caller threads and the event loop.
//!
//! Connection state, the device binding, the live session, the drive target
//! and the last-known UI values all live in a single [`SharedState`] behind a
//! single mutex. There is no second lock to order against.
//!
//! The lock is never held across an `.await`: readers copy what they need
//! and release it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use strokegpt_middleware::DeviceSession;
use strokegpt_types::{ConnectionState, Device, MotionIntent};
use tracing::{debug, warn};

/// Latest requested motion plus whether the drive loop should act on it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DriveTarget {
    pub intent: MotionIntent,
    pub active: bool,
}

#[derive(Default)]
pub struct SharedState {
    pub connection: ConnectionState,
    pub device: Option<Device>,
    pub session: Option<Arc<dyn DeviceSession>>,
    pub server_name: Option<String>,
    pub target: DriveTarget,
    pub last_speed: f64,
    pub last_depth: f64,
    pub last_range: f64,
    pub last_move_at: Option<DateTime<Utc>>,
    /// Bumped whenever the binding changes or motion is halted, so the drive
    /// loop can tell that a snapshot it took has gone stale.
    pub generation: u64,
}

impl SharedState {
    /// Connected with a bound device: the only state in which moves apply.
    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected && self.device.is_some()
    }

    /// Move to `next` if that is a legal single step. Illegal transitions are
    /// logged and refused.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if self.connection == next {
            return true;
        }
        if !self.connection.can_transition_to(next) {
            warn!(from = %self.connection, to = %next, "refusing illegal connection transition");
            return false;
        }
        debug!(from = %self.connection, to = %next, "connection state change");
        self.connection = next;
        true
    }

    /// Deactivate the drive target and invalidate in-flight drive snapshots.
    pub fn halt(&mut self) {
        self.target.active = false;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Drop the device binding and halt motion.
    pub fn unbind(&mut self) {
        self.device = None;
        self.halt();
    }
}

pub type Shared = Arc<Mutex<SharedState>>;

/// Lock the shared state, recovering from poisoning: a panicked holder
/// cannot leave it half-written in a way later readers cannot cope with.
pub fn lock(shared: &Mutex<SharedState>) -> MutexGuard<'_, SharedState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strokegpt_types::ActuatorBuckets;

    fn device() -> Device {
        Device {
            index: 0,
            name: "Sim".into(),
            actuators: ActuatorBuckets::default(),
        }
    }

    #[test]
    fn connected_requires_a_bound_device() {
        let mut state = SharedState::default();
        assert!(!state.is_connected());
        assert!(state.transition(ConnectionState::Connecting));
        assert!(state.transition(ConnectionState::Connected));
        assert!(!state.is_connected());
        state.device = Some(device());
        assert!(state.is_connected());
    }

    #[test]
    fn illegal_transition_is_refused() {
        let mut state = SharedState::default();
        assert!(!state.transition(ConnectionState::Connected));
        assert_eq!(state.connection, ConnectionState::Disconnected);
        assert!(!state.transition(ConnectionState::ShuttingDown));
    }

    #[test]
    fn unbind_halts_and_bumps_generation() {
        let mut state = SharedState {
            device: Some(device()),
            ..Default::default()
        };
        state.target.active = true;
        let before = state.generation;
        state.unbind();
        assert!(state.device.is_none());
        assert!(!state.target.active);
        assert_ne!(state.generation, before);
    }
}
