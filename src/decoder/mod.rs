//! Message Decoder
//!
//! Parses JSON event envelopes into typed messages. Required fields are
//! enforced strictly; unknown fields are ignored so producers can evolve
//! their schema. Errors carry the offending field path for logging and
//! never abort a subscription.

mod timestamp;

pub use timestamp::parse_iso8601_ms;

use crate::types::{ObjectType, StatusFlags, Value, ValueKind};
use serde_json::Value as Json;

pub const MAX_OBJECT_NAME_BYTES: usize = 255;
pub const MAX_DESCRIPTION_BYTES: usize = 511;
pub const MAX_STATE_TEXTS: usize = 16;

/// Decode error with the offending field path
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("missing required field '{path}'")]
    MissingField { path: String },

    #[error("field '{path}' has the wrong type")]
    InvalidType { path: String },

    #[error("field '{path}' is invalid: {reason}")]
    InvalidValue { path: String, reason: String },

    #[error("unknown message type '{value}'")]
    UnknownMessageType { value: String },
}

impl DecodeError {
    fn missing(path: &str) -> Self {
        DecodeError::MissingField {
            path: path.to_string(),
        }
    }

    fn bad_type(path: &str) -> Self {
        DecodeError::InvalidType {
            path: path.to_string(),
        }
    }

    fn bad_value(path: &str, reason: impl Into<String>) -> Self {
        DecodeError::InvalidValue {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

/// Decoded event envelope
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEnvelope {
    pub message: Message,
    pub source_id: String,
    /// UTC milliseconds since epoch, when a timestamp was present.
    pub timestamp_ms: Option<i64>,
    pub correlation_id: Option<String>,
    /// Position claimed by the payload itself (the transport position is
    /// authoritative; this one is informational).
    pub stream_position: Option<u64>,
}

/// One of the four supported message kinds
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ObjectDefinition(ObjectDefinition),
    ValueUpdate(ValueUpdate),
    ObjectDelete(ObjectDelete),
    DeviceConfig(DeviceConfigMsg),
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::ObjectDefinition(_) => "ObjectDefinition",
            Message::ValueUpdate(_) => "ValueUpdate",
            Message::ObjectDelete(_) => "ObjectDelete",
            Message::DeviceConfig(_) => "DeviceConfig",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDefinition {
    pub object_type: ObjectType,
    pub object_instance: u32,
    pub object_name: String,
    pub description: String,
    pub value_kind: ValueKind,
    pub units: u16,
    pub units_text: String,
    pub cov_increment: f32,
    pub min_value: Option<f32>,
    pub max_value: Option<f32>,
    pub state_texts: Vec<String>,
    pub inactive_text: String,
    pub active_text: String,
    pub supports_priority_array: bool,
    pub initial_value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueUpdate {
    pub object_type: ObjectType,
    pub object_instance: u32,
    pub present_value: Value,
    pub quality: String,
    pub status_flags: Option<StatusFlags>,
    pub priority: Option<u8>,
    pub reliability: Option<u8>,
    pub event_state: Option<u8>,
    pub source_timestamp_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDelete {
    pub object_type: ObjectType,
    pub object_instance: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceConfigMsg {
    pub device_name: Option<String>,
    pub device_description: Option<String>,
    pub location: Option<String>,
    pub model_name: Option<String>,
    pub vendor_name: Option<String>,
    pub application_software_version: Option<String>,
}

// ---------------------------------------------------------------------------
// Field access helpers
// ---------------------------------------------------------------------------

fn require_str<'a>(obj: &'a Json, path: &str, key: &str) -> Result<&'a str, DecodeError> {
    match obj.get(key) {
        None | Some(Json::Null) => Err(DecodeError::missing(&format!("{path}.{key}"))),
        Some(Json::String(s)) => Ok(s),
        Some(_) => Err(DecodeError::bad_type(&format!("{path}.{key}"))),
    }
}

fn optional_str<'a>(obj: &'a Json, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Json::as_str)
}

fn require_u32(obj: &Json, path: &str, key: &str) -> Result<u32, DecodeError> {
    let full = format!("{path}.{key}");
    match obj.get(key) {
        None | Some(Json::Null) => Err(DecodeError::missing(&full)),
        Some(Json::Number(n)) => {
            let v = n
                .as_f64()
                .ok_or_else(|| DecodeError::bad_value(&full, "not a finite number"))?;
            if v < 0.0 || v > f64::from(u32::MAX) || v.fract() != 0.0 {
                return Err(DecodeError::bad_value(&full, "not an unsigned 32-bit integer"));
            }
            Ok(v as u32)
        }
        Some(_) => Err(DecodeError::bad_type(&full)),
    }
}

fn optional_f32(obj: &Json, key: &str) -> Option<f32> {
    obj.get(key).and_then(Json::as_f64).map(|v| v as f32)
}

fn optional_bool(obj: &Json, key: &str) -> Option<bool> {
    obj.get(key).and_then(Json::as_bool)
}

fn optional_u8(obj: &Json, path: &str, key: &str) -> Result<Option<u8>, DecodeError> {
    match obj.get(key) {
        None | Some(Json::Null) => Ok(None),
        Some(Json::Number(n)) => {
            let v = n.as_u64().filter(|v| *v <= u64::from(u8::MAX));
            match v {
                Some(v) => Ok(Some(v as u8)),
                None => Err(DecodeError::bad_value(
                    &format!("{path}.{key}"),
                    "out of range for an 8-bit value",
                )),
            }
        }
        Some(_) => Err(DecodeError::bad_type(&format!("{path}.{key}"))),
    }
}

fn parse_object_type(obj: &Json, path: &str) -> Result<ObjectType, DecodeError> {
    let raw = require_str(obj, path, "objectType")?;
    ObjectType::from_wire(raw).ok_or_else(|| {
        DecodeError::bad_value(
            &format!("{path}.objectType"),
            format!("unknown object type '{raw}'"),
        )
    })
}

/// Truncates on a char boundary, the limit being in bytes.
fn truncate_text(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// ValueUpdate value kind is dictated by the object type.
fn update_kind_for(object_type: ObjectType) -> ValueKind {
    if object_type.is_binary() {
        ValueKind::Boolean
    } else if object_type.is_multi_state() {
        ValueKind::Unsigned
    } else {
        ValueKind::Real
    }
}

fn parse_typed_value(raw: &Json, kind: ValueKind, path: &str) -> Result<Value, DecodeError> {
    match kind {
        ValueKind::Boolean => match raw {
            Json::Bool(b) => Ok(Value::Boolean(*b)),
            // Producers emitting 0/1 for binary points are accepted.
            Json::Number(n) => Ok(Value::Boolean(n.as_f64().unwrap_or(0.0) != 0.0)),
            _ => Err(DecodeError::bad_type(path)),
        },
        ValueKind::Real => match raw.as_f64() {
            Some(v) => Ok(Value::Real(v as f32)),
            None => Err(DecodeError::bad_type(path)),
        },
        ValueKind::Unsigned | ValueKind::Enumerated => match raw.as_f64() {
            Some(v) if v >= 0.0 && v.fract() == 0.0 && v <= f64::from(u32::MAX) => {
                if kind == ValueKind::Unsigned {
                    Ok(Value::Unsigned(v as u32))
                } else {
                    Ok(Value::Enumerated(v as u32))
                }
            }
            Some(_) => Err(DecodeError::bad_value(path, "not an unsigned integer")),
            None => Err(DecodeError::bad_type(path)),
        },
        ValueKind::Signed => match raw.as_f64() {
            Some(v) if v.fract() == 0.0 && v >= f64::from(i32::MIN) && v <= f64::from(i32::MAX) => {
                Ok(Value::Signed(v as i32))
            }
            Some(_) => Err(DecodeError::bad_value(path, "not a signed integer")),
            None => Err(DecodeError::bad_type(path)),
        },
    }
}

// ---------------------------------------------------------------------------
// Per-message parsers
// ---------------------------------------------------------------------------

fn parse_object_definition(payload: &Json) -> Result<ObjectDefinition, DecodeError> {
    const P: &str = "payload";

    let object_type = parse_object_type(payload, P)?;
    let object_instance = require_u32(payload, P, "objectInstance")?;
    let object_name = truncate_text(
        require_str(payload, P, "objectName")?,
        MAX_OBJECT_NAME_BYTES,
    );

    let raw_kind = require_str(payload, P, "presentValueType")?;
    // Binary and multi-state objects carry a fixed kind; the declared one
    // only matters for the analog family.
    let value_kind = if object_type.is_binary() {
        ValueKind::Boolean
    } else if object_type.is_multi_state() {
        ValueKind::Unsigned
    } else {
        ValueKind::from_wire(raw_kind).ok_or_else(|| {
            DecodeError::bad_value(
                "payload.presentValueType",
                format!("unknown value type '{raw_kind}'"),
            )
        })?
    };

    let description = truncate_text(
        optional_str(payload, "description").unwrap_or(""),
        MAX_DESCRIPTION_BYTES,
    );

    let units = match payload.get("units") {
        None | Some(Json::Null) => 95,
        Some(Json::Number(n)) => n
            .as_u64()
            .filter(|v| *v <= u64::from(u16::MAX))
            .map(|v| v as u16)
            .ok_or_else(|| DecodeError::bad_value("payload.units", "not a 16-bit unit code"))?,
        Some(_) => return Err(DecodeError::bad_type("payload.units")),
    };

    let cov_increment = optional_f32(payload, "covIncrement").unwrap_or(0.0);
    if cov_increment < 0.0 {
        return Err(DecodeError::bad_value(
            "payload.covIncrement",
            "must be non-negative",
        ));
    }

    let mut state_texts = Vec::new();
    if let Some(raw) = payload.get("stateTexts") {
        let Json::Array(items) = raw else {
            return Err(DecodeError::bad_type("payload.stateTexts"));
        };
        for (i, item) in items.iter().take(MAX_STATE_TEXTS).enumerate() {
            match item.as_str() {
                Some(text) => state_texts.push(text.to_string()),
                None => {
                    return Err(DecodeError::bad_type(&format!("payload.stateTexts[{i}]")));
                }
            }
        }
    }

    let initial_value = match payload.get("initialValue") {
        None | Some(Json::Null) => None,
        Some(raw) => {
            let value = parse_typed_value(raw, value_kind, "payload.initialValue")?;
            if object_type.is_multi_state() {
                if let Value::Unsigned(v) = value {
                    if v < 1 {
                        return Err(DecodeError::bad_value(
                            "payload.initialValue",
                            "multi-state values start at 1",
                        ));
                    }
                }
            }
            Some(value)
        }
    };

    Ok(ObjectDefinition {
        object_type,
        object_instance,
        object_name,
        description,
        value_kind,
        units,
        units_text: optional_str(payload, "unitsText").unwrap_or("").to_string(),
        cov_increment,
        min_value: optional_f32(payload, "minPresentValue"),
        max_value: optional_f32(payload, "maxPresentValue"),
        state_texts,
        inactive_text: optional_str(payload, "inactiveText")
            .unwrap_or("Inactive")
            .to_string(),
        active_text: optional_str(payload, "activeText")
            .unwrap_or("Active")
            .to_string(),
        supports_priority_array: optional_bool(payload, "priorityArray").unwrap_or(false),
        initial_value,
    })
}

fn parse_value_update(payload: &Json) -> Result<ValueUpdate, DecodeError> {
    const P: &str = "payload";

    let object_type = parse_object_type(payload, P)?;
    let object_instance = require_u32(payload, P, "objectInstance")?;

    let raw_value = payload
        .get("presentValue")
        .ok_or_else(|| DecodeError::missing("payload.presentValue"))?;
    let kind = update_kind_for(object_type);
    let present_value = parse_typed_value(raw_value, kind, "payload.presentValue")?;

    if object_type.is_multi_state() {
        if let Value::Unsigned(v) = present_value {
            if v < 1 {
                return Err(DecodeError::bad_value(
                    "payload.presentValue",
                    "multi-state values start at 1",
                ));
            }
        }
    }

    let status_flags = match payload.get("statusFlags") {
        None | Some(Json::Null) => None,
        Some(raw @ Json::Object(_)) => Some(StatusFlags {
            in_alarm: optional_bool(raw, "inAlarm").unwrap_or(false),
            fault: optional_bool(raw, "fault").unwrap_or(false),
            overridden: optional_bool(raw, "overridden").unwrap_or(false),
            out_of_service: optional_bool(raw, "outOfService").unwrap_or(false),
        }),
        Some(_) => return Err(DecodeError::bad_type("payload.statusFlags")),
    };

    let priority = optional_u8(payload, P, "priority")?;
    if let Some(p) = priority {
        if p > 16 {
            return Err(DecodeError::bad_value(
                "payload.priority",
                "priority is 0..=16",
            ));
        }
    }

    let source_timestamp_ms = match optional_str(payload, "sourceTimestamp") {
        None => None,
        Some(raw) => Some(parse_iso8601_ms(raw).map_err(|reason| {
            DecodeError::bad_value("payload.sourceTimestamp", reason)
        })?),
    };

    Ok(ValueUpdate {
        object_type,
        object_instance,
        present_value,
        quality: optional_str(payload, "quality").unwrap_or("good").to_string(),
        status_flags,
        priority,
        reliability: optional_u8(payload, P, "reliability")?,
        event_state: optional_u8(payload, P, "eventState")?,
        source_timestamp_ms,
    })
}

fn parse_object_delete(payload: &Json) -> Result<ObjectDelete, DecodeError> {
    const P: &str = "payload";
    Ok(ObjectDelete {
        object_type: parse_object_type(payload, P)?,
        object_instance: require_u32(payload, P, "objectInstance")?,
        reason: optional_str(payload, "reason").unwrap_or("").to_string(),
    })
}

fn parse_device_config(payload: &Json) -> Result<DeviceConfigMsg, DecodeError> {
    Ok(DeviceConfigMsg {
        device_name: optional_str(payload, "deviceName").map(str::to_string),
        device_description: optional_str(payload, "deviceDescription").map(str::to_string),
        location: optional_str(payload, "location").map(str::to_string),
        model_name: optional_str(payload, "modelName").map(str::to_string),
        vendor_name: optional_str(payload, "vendorName").map(str::to_string),
        application_software_version: optional_str(payload, "applicationSoftwareVersion")
            .map(str::to_string),
    })
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Decodes a raw event payload into a typed envelope.
pub fn decode(raw: &[u8]) -> Result<DecodedEnvelope, DecodeError> {
    let root: Json =
        serde_json::from_slice(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    if !root.is_object() {
        return Err(DecodeError::InvalidJson(
            "envelope is not a JSON object".to_string(),
        ));
    }

    let message_type = require_str(&root, "$", "messageType")?;
    let source_id = require_str(&root, "$", "sourceId")?.to_string();

    let timestamp_ms = match optional_str(&root, "timestamp") {
        None => None,
        Some(raw) => Some(
            parse_iso8601_ms(raw)
                .map_err(|reason| DecodeError::bad_value("timestamp", reason))?,
        ),
    };

    let stream_position = match root.get("streamPosition") {
        None | Some(Json::Null) => None,
        Some(Json::Number(n)) => n.as_u64(),
        Some(_) => return Err(DecodeError::bad_type("streamPosition")),
    };

    let payload = match root.get("payload") {
        Some(p @ Json::Object(_)) => p,
        Some(_) => return Err(DecodeError::bad_type("payload")),
        None => return Err(DecodeError::missing("payload")),
    };

    let message = match message_type {
        "ObjectDefinition" => Message::ObjectDefinition(parse_object_definition(payload)?),
        "ValueUpdate" => Message::ValueUpdate(parse_value_update(payload)?),
        "ObjectDelete" => Message::ObjectDelete(parse_object_delete(payload)?),
        "DeviceConfig" => Message::DeviceConfig(parse_device_config(payload)?),
        other => {
            return Err(DecodeError::UnknownMessageType {
                value: other.to_string(),
            });
        }
    };

    Ok(DecodedEnvelope {
        message,
        source_id,
        timestamp_ms,
        correlation_id: optional_str(&root, "correlationId").map(str::to_string),
        stream_position,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(message_type: &str, payload: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "messageType": message_type,
            "sourceId": "s1",
            "payload": payload,
        }))
        .unwrap()
    }

    #[test]
    fn decodes_object_definition_with_defaults() {
        let raw = envelope(
            "ObjectDefinition",
            serde_json::json!({
                "objectType": "analog-input",
                "objectInstance": 1,
                "objectName": "T",
                "presentValueType": "real",
                "covIncrement": 0.5,
                "initialValue": 20.0
            }),
        );
        let env = decode(&raw).unwrap();
        let Message::ObjectDefinition(def) = env.message else {
            panic!("wrong message kind");
        };
        assert_eq!(def.object_type, ObjectType::AnalogInput);
        assert_eq!(def.object_instance, 1);
        assert_eq!(def.value_kind, ValueKind::Real);
        assert_eq!(def.units, 95);
        assert_eq!(def.inactive_text, "Inactive");
        assert_eq!(def.active_text, "Active");
        assert_eq!(def.initial_value, Some(Value::Real(20.0)));
        assert_eq!(env.source_id, "s1");
    }

    #[test]
    fn binary_definition_forces_boolean_kind() {
        let raw = envelope(
            "ObjectDefinition",
            serde_json::json!({
                "objectType": "binary-input",
                "objectInstance": 3,
                "objectName": "Fan",
                "presentValueType": "real",
                "initialValue": true
            }),
        );
        let env = decode(&raw).unwrap();
        let Message::ObjectDefinition(def) = env.message else {
            panic!("wrong message kind");
        };
        assert_eq!(def.value_kind, ValueKind::Boolean);
        assert_eq!(def.initial_value, Some(Value::Boolean(true)));
    }

    #[test]
    fn missing_required_field_names_path() {
        let raw = envelope(
            "ObjectDefinition",
            serde_json::json!({
                "objectType": "analog-input",
                "objectInstance": 1,
                "presentValueType": "real"
            }),
        );
        assert_eq!(
            decode(&raw),
            Err(DecodeError::MissingField {
                path: "payload.objectName".to_string()
            })
        );
    }

    #[test]
    fn unknown_message_type() {
        let raw = envelope("ObjectRename", serde_json::json!({}));
        assert_eq!(
            decode(&raw),
            Err(DecodeError::UnknownMessageType {
                value: "ObjectRename".to_string()
            })
        );
    }

    #[test]
    fn invalid_json_is_reported() {
        assert!(matches!(
            decode(b"{not json"),
            Err(DecodeError::InvalidJson(_))
        ));
    }

    #[test]
    fn value_update_kinds_follow_object_type() {
        let raw = envelope(
            "ValueUpdate",
            serde_json::json!({
                "objectType": "binary-value",
                "objectInstance": 2,
                "presentValue": 1
            }),
        );
        let env = decode(&raw).unwrap();
        let Message::ValueUpdate(upd) = env.message else {
            panic!("wrong message kind");
        };
        assert_eq!(upd.present_value, Value::Boolean(true));
        assert_eq!(upd.quality, "good");

        let raw = envelope(
            "ValueUpdate",
            serde_json::json!({
                "objectType": "multi-state-value",
                "objectInstance": 2,
                "presentValue": 3
            }),
        );
        let Message::ValueUpdate(upd) = decode(&raw).unwrap().message else {
            panic!("wrong message kind");
        };
        assert_eq!(upd.present_value, Value::Unsigned(3));
    }

    #[test]
    fn multi_state_zero_is_rejected() {
        let raw = envelope(
            "ValueUpdate",
            serde_json::json!({
                "objectType": "multi-state-input",
                "objectInstance": 2,
                "presentValue": 0
            }),
        );
        assert!(matches!(
            decode(&raw),
            Err(DecodeError::InvalidValue { .. })
        ));
    }

    #[test]
    fn priority_out_of_range_is_rejected() {
        let raw = envelope(
            "ValueUpdate",
            serde_json::json!({
                "objectType": "analog-input",
                "objectInstance": 2,
                "presentValue": 1.0,
                "priority": 17
            }),
        );
        assert!(matches!(
            decode(&raw),
            Err(DecodeError::InvalidValue { .. })
        ));
    }

    #[test]
    fn status_flags_are_parsed() {
        let raw = envelope(
            "ValueUpdate",
            serde_json::json!({
                "objectType": "analog-input",
                "objectInstance": 2,
                "presentValue": 1.0,
                "statusFlags": { "inAlarm": true, "fault": false }
            }),
        );
        let Message::ValueUpdate(upd) = decode(&raw).unwrap().message else {
            panic!("wrong message kind");
        };
        let flags = upd.status_flags.unwrap();
        assert!(flags.in_alarm);
        assert!(!flags.fault);
    }

    #[test]
    fn device_config_patches_fields_individually() {
        let raw = envelope(
            "DeviceConfig",
            serde_json::json!({ "deviceName": "Gateway North", "location": "Hall 3" }),
        );
        let Message::DeviceConfig(cfg) = decode(&raw).unwrap().message else {
            panic!("wrong message kind");
        };
        assert_eq!(cfg.device_name.as_deref(), Some("Gateway North"));
        assert_eq!(cfg.location.as_deref(), Some("Hall 3"));
        assert_eq!(cfg.vendor_name, None);
    }

    #[test]
    fn long_names_are_truncated_on_char_boundary() {
        let name = "ü".repeat(200); // 400 bytes
        let raw = envelope(
            "ObjectDefinition",
            serde_json::json!({
                "objectType": "analog-input",
                "objectInstance": 1,
                "objectName": name,
                "presentValueType": "real"
            }),
        );
        let Message::ObjectDefinition(def) = decode(&raw).unwrap().message else {
            panic!("wrong message kind");
        };
        assert!(def.object_name.len() <= MAX_OBJECT_NAME_BYTES);
        assert!(def.object_name.chars().all(|c| c == 'ü'));
    }

    #[test]
    fn state_texts_are_capped() {
        let texts: Vec<String> = (0..20).map(|i| format!("S{i}")).collect();
        let raw = envelope(
            "ObjectDefinition",
            serde_json::json!({
                "objectType": "multi-state-value",
                "objectInstance": 1,
                "objectName": "Mode",
                "presentValueType": "unsigned",
                "stateTexts": texts
            }),
        );
        let Message::ObjectDefinition(def) = decode(&raw).unwrap().message else {
            panic!("wrong message kind");
        };
        assert_eq!(def.state_texts.len(), MAX_STATE_TEXTS);
    }
}
