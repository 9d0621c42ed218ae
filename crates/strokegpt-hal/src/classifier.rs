//! Actuator classification.
//!
//! Servers describe each output unit with a free-text description. The
//! classifier sniffs that text once, at bind time, and files the actuator
//! into an [`ActuatorBuckets`] slot. Everything downstream dispatches on the
//! resulting [`CapabilityClass`] and never looks at the description again.
//!
//! Matching is case-insensitive and first-match-wins in the order
//! vibrating, linear, rotating, so `"Vibrate - Linear motor"` is a vibrator.

use strokegpt_types::{
    Actuator, ActuatorBuckets, ActuatorDescriptor, CapabilityClass, Device, DeviceDescriptor,
};
use tracing::debug;

/// Keyword fragments checked against the lower-cased description, in
/// priority order.
const KEYWORDS: [(&str, CapabilityClass); 3] = [
    ("vibrat", CapabilityClass::Vibrating),
    ("linear", CapabilityClass::Linear),
    ("rotat", CapabilityClass::Rotating),
];

/// Classify a single description, or `None` when no keyword matches.
pub fn class_from_description(description: &str) -> Option<CapabilityClass> {
    let lowered = description.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(keyword, _)| lowered.contains(keyword))
        .map(|(_, class)| *class)
}

/// Partition raw actuator descriptors into capability buckets.
///
/// `generic` entries are classified by description; unmatched ones are
/// dropped. `linear` and `rotary` are typed lists the protocol may report in
/// addition; they are merged into their bucket without sniffing, skipping any
/// actuator already present with the same route and index.
pub fn classify(
    generic: &[ActuatorDescriptor],
    linear: &[ActuatorDescriptor],
    rotary: &[ActuatorDescriptor],
) -> ActuatorBuckets {
    let mut buckets = ActuatorBuckets::default();

    for raw in generic {
        match class_from_description(&raw.description) {
            Some(class) => push_unique(&mut buckets, class, raw),
            None => debug!(
                index = raw.index,
                description = %raw.description,
                "dropping unclassified actuator"
            ),
        }
    }
    for raw in linear {
        push_unique(&mut buckets, CapabilityClass::Linear, raw);
    }
    for raw in rotary {
        push_unique(&mut buckets, CapabilityClass::Rotating, raw);
    }

    buckets
}

fn push_unique(buckets: &mut ActuatorBuckets, class: CapabilityClass, raw: &ActuatorDescriptor) {
    let bucket = buckets.bucket_mut(class);
    if bucket
        .iter()
        .any(|existing| existing.same_identity(&raw.route, raw.index))
    {
        return;
    }
    bucket.push(Actuator {
        index: raw.index,
        class,
        description: raw.description.clone(),
        route: raw.route.clone(),
    });
}

/// Classify every actuator of `descriptor`.
///
/// Returns `None` for an incompatible device (no classified actuator in any
/// bucket); such a device must never be bound.
pub fn classify_device(descriptor: &DeviceDescriptor) -> Option<Device> {
    let actuators = classify(
        &descriptor.actuators,
        &descriptor.linear,
        &descriptor.rotary,
    );
    if actuators.is_empty() {
        debug!(device = %descriptor.name, "device has no usable actuators");
        return None;
    }
    Some(Device {
        index: descriptor.index,
        name: descriptor.name.clone(),
        actuators,
    })
}

/// Return the first device, in report order, with at least one classified
/// actuator. No scoring between candidates.
pub fn bind_first_compatible(devices: &[DeviceDescriptor]) -> Option<Device> {
    devices.iter().find_map(classify_device)
}
