//! Buttplug v3 message types and frame codec.
//!
//! A frame is a JSON array of messages. Each message is an object with a
//! single key naming the message type, whose value holds `Id` and the
//! message fields in PascalCase:
//!
//! ```json
//! [{"LinearCmd": {"Id": 7, "DeviceIndex": 0,
//!                 "Vectors": [{"Index": 0, "Duration": 1100, "Position": 0.25}]}}]
//! ```
//!
//! That is serde's externally tagged enum layout, so [`ClientMessage`] and
//! [`ServerMessage`] map one-to-one onto the wire.
//!
//! Requests carry a client-chosen non-zero `Id` that the reply echoes;
//! server-initiated events (`DeviceAdded`, `DeviceRemoved`,
//! `ScanningFinished`) carry `Id: 0`.

use serde::{Deserialize, Serialize};
use strokegpt_types::{
    Actuator, ActuatorDescriptor, ActuatorOutput, CommandRoute, DeviceDescriptor, StrokeError,
};
use tracing::warn;

/// Protocol message version requested in the handshake.
pub const MESSAGE_VERSION: u32 = 3;

/// `Id` used by server-initiated events.
pub const EVENT_ID: u32 = 0;

// ─────────────────────────────────────────────────────────────────────────────
// Client → server
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScalarSubcommand {
    pub index: u32,
    pub scalar: f64,
    pub actuator_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VectorSubcommand {
    pub index: u32,
    pub duration: u32,
    pub position: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RotationSubcommand {
    pub index: u32,
    pub speed: f64,
    pub clockwise: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all_fields = "PascalCase")]
pub enum ClientMessage {
    RequestServerInfo {
        id: u32,
        client_name: String,
        message_version: u32,
    },
    Ping {
        id: u32,
    },
    StartScanning {
        id: u32,
    },
    StopScanning {
        id: u32,
    },
    RequestDeviceList {
        id: u32,
    },
    StopDeviceCmd {
        id: u32,
        device_index: u32,
    },
    ScalarCmd {
        id: u32,
        device_index: u32,
        scalars: Vec<ScalarSubcommand>,
    },
    LinearCmd {
        id: u32,
        device_index: u32,
        vectors: Vec<VectorSubcommand>,
    },
    RotateCmd {
        id: u32,
        device_index: u32,
        rotations: Vec<RotationSubcommand>,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Server → client
// ─────────────────────────────────────────────────────────────────────────────

/// One actuator feature of a device message type.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FeatureAttributes {
    #[serde(default)]
    pub feature_descriptor: String,
    #[serde(default)]
    pub step_count: u32,
    #[serde(default)]
    pub actuator_type: String,
}

/// Command types a device accepts, with their features. Other keys
/// (`StopDeviceCmd`, sensor messages, …) are ignored.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct DeviceMessages {
    #[serde(rename = "ScalarCmd", default)]
    pub scalar_cmd: Vec<FeatureAttributes>,
    #[serde(rename = "LinearCmd", default)]
    pub linear_cmd: Vec<FeatureAttributes>,
    #[serde(rename = "RotateCmd", default)]
    pub rotate_cmd: Vec<FeatureAttributes>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceInfo {
    pub device_name: String,
    pub device_index: u32,
    #[serde(default)]
    pub device_display_name: Option<String>,
    #[serde(default)]
    pub device_messages: DeviceMessages,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all_fields = "PascalCase")]
pub enum ServerMessage {
    Ok {
        id: u32,
    },
    Error {
        id: u32,
        error_message: String,
        #[serde(default)]
        error_code: i64,
    },
    ServerInfo {
        id: u32,
        server_name: String,
        message_version: u32,
        #[serde(default)]
        max_ping_time: u64,
    },
    DeviceList {
        id: u32,
        devices: Vec<DeviceInfo>,
    },
    DeviceAdded {
        id: u32,
        device_name: String,
        device_index: u32,
        #[serde(default)]
        device_display_name: Option<String>,
        #[serde(default)]
        device_messages: DeviceMessages,
    },
    DeviceRemoved {
        id: u32,
        device_index: u32,
    },
    ScanningFinished {
        id: u32,
    },
}

impl ServerMessage {
    pub fn id(&self) -> u32 {
        match self {
            ServerMessage::Ok { id }
            | ServerMessage::Error { id, .. }
            | ServerMessage::ServerInfo { id, .. }
            | ServerMessage::DeviceList { id, .. }
            | ServerMessage::DeviceAdded { id, .. }
            | ServerMessage::DeviceRemoved { id, .. }
            | ServerMessage::ScanningFinished { id } => *id,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Codec
// ─────────────────────────────────────────────────────────────────────────────

pub fn encode_frame(messages: &[ClientMessage]) -> Result<String, StrokeError> {
    serde_json::to_string(messages).map_err(|e| StrokeError::Serialization(e.to_string()))
}

/// Decode a server frame. Messages of unknown type are logged and skipped so
/// a newer server cannot break an older client.
pub fn decode_frame(text: &str) -> Result<Vec<ServerMessage>, StrokeError> {
    let raw: Vec<serde_json::Value> =
        serde_json::from_str(text).map_err(|e| StrokeError::Serialization(e.to_string()))?;

    let mut messages = Vec::with_capacity(raw.len());
    for value in raw {
        match serde_json::from_value::<ServerMessage>(value.clone()) {
            Ok(message) => messages.push(message),
            Err(e) => warn!(error = %e, message = %value, "skipping unrecognised server message"),
        }
    }
    Ok(messages)
}

// ─────────────────────────────────────────────────────────────────────────────
// Descriptor conversion
// ─────────────────────────────────────────────────────────────────────────────

fn feature_label(feature: &FeatureAttributes, position: usize) -> String {
    if feature.feature_descriptor.trim().is_empty() {
        format!("Level {}", position + 1)
    } else {
        feature.feature_descriptor.clone()
    }
}

/// Build the unclassified [`DeviceDescriptor`] for a reported device.
///
/// Scalar features form the generic list, described as
/// `"<ActuatorType> - <label>"`. Linear and rotate features form the typed
/// lists. A feature's index is its position within its message type.
pub fn to_descriptor(
    device_index: u32,
    device_name: &str,
    display_name: Option<&str>,
    messages: &DeviceMessages,
) -> DeviceDescriptor {
    let name = display_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(device_name)
        .to_string();

    let actuators = messages
        .scalar_cmd
        .iter()
        .enumerate()
        .map(|(i, f)| ActuatorDescriptor {
            index: i as u32,
            description: format!("{} - {}", f.actuator_type, feature_label(f, i)),
            route: CommandRoute::Scalar {
                actuator_type: f.actuator_type.clone(),
            },
        })
        .collect();

    let linear = messages
        .linear_cmd
        .iter()
        .enumerate()
        .map(|(i, f)| {
            let label = if f.feature_descriptor.trim().is_empty() && !f.actuator_type.is_empty() {
                f.actuator_type.clone()
            } else {
                feature_label(f, i)
            };
            ActuatorDescriptor {
                index: i as u32,
                description: format!("Linear - {label}"),
                route: CommandRoute::Linear,
            }
        })
        .collect();

    let rotary = messages
        .rotate_cmd
        .iter()
        .enumerate()
        .map(|(i, f)| ActuatorDescriptor {
            index: i as u32,
            description: format!("Rotate - {}", feature_label(f, i)),
            route: CommandRoute::Rotate,
        })
        .collect();

    DeviceDescriptor {
        index: device_index,
        name,
        actuators,
        linear,
        rotary,
    }
}

impl DeviceInfo {
    pub fn to_descriptor(&self) -> DeviceDescriptor {
        to_descriptor(
            self.device_index,
            &self.device_name,
            self.device_display_name.as_deref(),
            &self.device_messages,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output encoding
// ─────────────────────────────────────────────────────────────────────────────

fn unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

/// Encode one actuator output as a request with `id`.
///
/// Values are clamped to the protocol's `[0, 1]` range. A rotating actuator
/// exposed as a scalar feature receives its speed as the scalar.
pub fn output_message(
    id: u32,
    device_index: u32,
    actuator: &Actuator,
    output: ActuatorOutput,
) -> Result<ClientMessage, StrokeError> {
    match (&actuator.route, output) {
        (
            CommandRoute::Linear,
            ActuatorOutput::Position {
                position,
                duration_ms,
            },
        ) => Ok(ClientMessage::LinearCmd {
            id,
            device_index,
            vectors: vec![VectorSubcommand {
                index: actuator.index,
                duration: duration_ms,
                position: unit(position),
            }],
        }),
        (CommandRoute::Rotate, ActuatorOutput::Rotation { speed, clockwise }) => {
            Ok(ClientMessage::RotateCmd {
                id,
                device_index,
                rotations: vec![RotationSubcommand {
                    index: actuator.index,
                    speed: unit(speed),
                    clockwise,
                }],
            })
        }
        (CommandRoute::Scalar { actuator_type }, ActuatorOutput::Scalar { level })
        | (CommandRoute::Scalar { actuator_type }, ActuatorOutput::Rotation { speed: level, .. }) => {
            Ok(ClientMessage::ScalarCmd {
                id,
                device_index,
                scalars: vec![ScalarSubcommand {
                    index: actuator.index,
                    scalar: unit(level),
                    actuator_type: actuator_type.clone(),
                }],
            })
        }
        (route, output) => Err(StrokeError::IncompatibleCommand {
            index: actuator.index,
            details: format!("{route:?} cannot carry {output:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strokegpt_types::CapabilityClass;

    fn actuator(class: CapabilityClass, route: CommandRoute) -> Actuator {
        Actuator {
            index: 1,
            class,
            description: String::new(),
            route,
        }
    }

    #[test]
    fn handshake_request_matches_wire_layout() {
        let frame = encode_frame(&[ClientMessage::RequestServerInfo {
            id: 1,
            client_name: "StrokeGPT".into(),
            message_version: MESSAGE_VERSION,
        }])
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            serde_json::json!([{"RequestServerInfo": {
                "Id": 1, "ClientName": "StrokeGPT", "MessageVersion": 3
            }}])
        );
    }

    #[test]
    fn linear_output_encodes_vectors() {
        let msg = output_message(
            9,
            2,
            &actuator(CapabilityClass::Linear, CommandRoute::Linear),
            ActuatorOutput::Position {
                position: 0.25,
                duration_ms: 1100,
            },
        )
        .unwrap();
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"LinearCmd": {
                "Id": 9, "DeviceIndex": 2,
                "Vectors": [{"Index": 1, "Duration": 1100, "Position": 0.25}]
            }})
        );
    }

    #[test]
    fn scalar_rotation_is_sent_as_scalar_and_clamped() {
        let msg = output_message(
            3,
            0,
            &actuator(
                CapabilityClass::Rotating,
                CommandRoute::Scalar {
                    actuator_type: "Rotate".into(),
                },
            ),
            ActuatorOutput::Rotation {
                speed: 1.7,
                clockwise: true,
            },
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::ScalarCmd {
                id: 3,
                device_index: 0,
                scalars: vec![ScalarSubcommand {
                    index: 1,
                    scalar: 1.0,
                    actuator_type: "Rotate".into()
                }]
            }
        );
    }

    #[test]
    fn position_on_scalar_route_is_incompatible() {
        let err = output_message(
            3,
            0,
            &actuator(
                CapabilityClass::Linear,
                CommandRoute::Scalar {
                    actuator_type: "Oscillate".into(),
                },
            ),
            ActuatorOutput::Position {
                position: 0.5,
                duration_ms: 200,
            },
        )
        .unwrap_err();
        assert!(matches!(err, StrokeError::IncompatibleCommand { index: 1, .. }));
    }

    #[test]
    fn decode_device_list_and_build_descriptors() {
        let text = r#"[{"DeviceList": {"Id": 4, "Devices": [{
            "DeviceName": "Kiiroo Keon",
            "DeviceIndex": 0,
            "DeviceMessages": {
                "ScalarCmd": [{"StepCount": 20, "FeatureDescriptor": "", "ActuatorType": "Vibrate"}],
                "LinearCmd": [{"StepCount": 100, "FeatureDescriptor": "", "ActuatorType": "Position"}],
                "StopDeviceCmd": {}
            }
        }]}}]"#;
        let messages = decode_frame(text).unwrap();
        assert_eq!(messages.len(), 1);
        let ServerMessage::DeviceList { id, devices } = &messages[0] else {
            panic!("expected DeviceList, got {:?}", messages[0]);
        };
        assert_eq!(*id, 4);

        let descriptor = devices[0].to_descriptor();
        assert_eq!(descriptor.name, "Kiiroo Keon");
        assert_eq!(descriptor.actuators[0].description, "Vibrate - Level 1");
        assert_eq!(descriptor.linear[0].description, "Linear - Position");
        assert_eq!(descriptor.linear[0].route, CommandRoute::Linear);
        assert!(descriptor.rotary.is_empty());
    }

    #[test]
    fn decode_events_and_skip_unknown_types() {
        let text = r#"[
            {"DeviceRemoved": {"Id": 0, "DeviceIndex": 3}},
            {"SensorReading": {"Id": 0, "DeviceIndex": 3, "Data": [1]}},
            {"ScanningFinished": {"Id": 0}},
            {"Error": {"Id": 5, "ErrorMessage": "bad index", "ErrorCode": 3}}
        ]"#;
        let messages = decode_frame(text).unwrap();
        assert_eq!(
            messages,
            vec![
                ServerMessage::DeviceRemoved {
                    id: 0,
                    device_index: 3
                },
                ServerMessage::ScanningFinished { id: 0 },
                ServerMessage::Error {
                    id: 5,
                    error_message: "bad index".into(),
                    error_code: 3
                },
            ]
        );
        assert_eq!(messages[2].id(), 5);
    }

    #[test]
    fn display_name_wins_when_present() {
        let descriptor = to_descriptor(
            1,
            "Lovense Hush",
            Some("Evening toy"),
            &DeviceMessages {
                rotate_cmd: vec![FeatureAttributes::default()],
                ..Default::default()
            },
        );
        assert_eq!(descriptor.name, "Evening toy");
        assert_eq!(descriptor.rotary[0].description, "Rotate - Level 1");
    }

    #[test]
    fn malformed_frame_is_a_serialization_error() {
        assert!(matches!(
            decode_frame("not json"),
            Err(StrokeError::Serialization(_))
        ));
    }
}
