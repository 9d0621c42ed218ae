//! `strokegpt-hal` – device logic with no I/O.
//!
//! # Modules
//!
//! - [`classifier`] – partitions the actuators a server reports for a device
//!   into linear, vibrating and rotating buckets, and picks the first device
//!   worth binding.
//! - [`translator`] – maps a [`MotionIntent`][strokegpt_types::MotionIntent]
//!   onto the command shape of each
//!   [`CapabilityClass`][strokegpt_types::CapabilityClass].

pub mod classifier;
pub mod translator;

pub use classifier::{bind_first_compatible, class_from_description, classify, classify_device};
pub use translator::{
    MAX_DURATION_MS, MIN_DURATION_MS, immediate_output, stop_command, stroke_duration_ms,
    stroke_endpoints, translate,
};
