use chrono::Utc;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// BACnet object identifier
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ObjectId {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectId {
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    /// Index-set member / cache key fragment: numeric type code and instance.
    pub fn key(&self) -> String {
        format!("{}:{}", self.object_type.code(), self.instance)
    }

    /// Parses the `"{type_code}:{instance}"` form used in the cache index.
    pub fn parse_key(s: &str) -> Option<Self> {
        let (type_str, instance_str) = s.split_once(':')?;
        let code: u16 = type_str.parse().ok()?;
        let instance: u32 = instance_str.parse().ok()?;
        Some(Self {
            object_type: ObjectType::from_code(code)?,
            instance,
        })
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

/// BACnet object types exposed by the gateway
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u16)]
pub enum ObjectType {
    AnalogInput = 0,
    AnalogOutput = 1,
    AnalogValue = 2,
    BinaryInput = 3,
    BinaryOutput = 4,
    BinaryValue = 5,
    MultiStateInput = 13,
    MultiStateOutput = 14,
    MultiStateValue = 19,
}

impl ObjectType {
    pub const ALL: [ObjectType; 9] = [
        ObjectType::AnalogInput,
        ObjectType::AnalogOutput,
        ObjectType::AnalogValue,
        ObjectType::BinaryInput,
        ObjectType::BinaryOutput,
        ObjectType::BinaryValue,
        ObjectType::MultiStateInput,
        ObjectType::MultiStateOutput,
        ObjectType::MultiStateValue,
    ];

    /// Standard BACnet object type number.
    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(ObjectType::AnalogInput),
            1 => Some(ObjectType::AnalogOutput),
            2 => Some(ObjectType::AnalogValue),
            3 => Some(ObjectType::BinaryInput),
            4 => Some(ObjectType::BinaryOutput),
            5 => Some(ObjectType::BinaryValue),
            13 => Some(ObjectType::MultiStateInput),
            14 => Some(ObjectType::MultiStateOutput),
            19 => Some(ObjectType::MultiStateValue),
            _ => None,
        }
    }

    /// Parses the wire spelling used in event payloads (e.g. "analog-input").
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "analog-input" => Some(ObjectType::AnalogInput),
            "analog-output" => Some(ObjectType::AnalogOutput),
            "analog-value" => Some(ObjectType::AnalogValue),
            "binary-input" => Some(ObjectType::BinaryInput),
            "binary-output" => Some(ObjectType::BinaryOutput),
            "binary-value" => Some(ObjectType::BinaryValue),
            "multi-state-input" => Some(ObjectType::MultiStateInput),
            "multi-state-output" => Some(ObjectType::MultiStateOutput),
            "multi-state-value" => Some(ObjectType::MultiStateValue),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            ObjectType::AnalogInput => "analog-input",
            ObjectType::AnalogOutput => "analog-output",
            ObjectType::AnalogValue => "analog-value",
            ObjectType::BinaryInput => "binary-input",
            ObjectType::BinaryOutput => "binary-output",
            ObjectType::BinaryValue => "binary-value",
            ObjectType::MultiStateInput => "multi-state-input",
            ObjectType::MultiStateOutput => "multi-state-output",
            ObjectType::MultiStateValue => "multi-state-value",
        }
    }

    pub fn is_analog(&self) -> bool {
        matches!(
            self,
            ObjectType::AnalogInput | ObjectType::AnalogOutput | ObjectType::AnalogValue
        )
    }

    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            ObjectType::BinaryInput | ObjectType::BinaryOutput | ObjectType::BinaryValue
        )
    }

    pub fn is_multi_state(&self) -> bool {
        matches!(
            self,
            ObjectType::MultiStateInput
                | ObjectType::MultiStateOutput
                | ObjectType::MultiStateValue
        )
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectType::AnalogInput => write!(f, "AI"),
            ObjectType::AnalogOutput => write!(f, "AO"),
            ObjectType::AnalogValue => write!(f, "AV"),
            ObjectType::BinaryInput => write!(f, "BI"),
            ObjectType::BinaryOutput => write!(f, "BO"),
            ObjectType::BinaryValue => write!(f, "BV"),
            ObjectType::MultiStateInput => write!(f, "MSI"),
            ObjectType::MultiStateOutput => write!(f, "MSO"),
            ObjectType::MultiStateValue => write!(f, "MSV"),
        }
    }
}

// Serialized as the numeric BACnet type code so cached blobs stay stable
// across renames of the Rust variants.
impl Serialize for ObjectType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.code())
    }
}

impl<'de> Deserialize<'de> for ObjectType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = u16::deserialize(deserializer)?;
        ObjectType::from_code(code)
            .ok_or_else(|| D::Error::custom(format!("unknown object type code {code}")))
    }
}

/// Discriminator for the present-value variant of an object.
///
/// Fixed at object creation; later updates must carry a matching variant.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Real,
    Unsigned,
    Signed,
    Boolean,
    Enumerated,
}

impl ValueKind {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "real" => Some(ValueKind::Real),
            "unsigned" => Some(ValueKind::Unsigned),
            "signed" => Some(ValueKind::Signed),
            "boolean" => Some(ValueKind::Boolean),
            "enumerated" => Some(ValueKind::Enumerated),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            ValueKind::Real => "real",
            ValueKind::Unsigned => "unsigned",
            ValueKind::Signed => "signed",
            ValueKind::Boolean => "boolean",
            ValueKind::Enumerated => "enumerated",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// Present value of a BACnet object
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Value {
    Real(f32),
    Unsigned(u32),
    Signed(i32),
    Boolean(bool),
    Enumerated(u32),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Real(_) => ValueKind::Real,
            Value::Unsigned(_) => ValueKind::Unsigned,
            Value::Signed(_) => ValueKind::Signed,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Enumerated(_) => ValueKind::Enumerated,
        }
    }

    /// Zero value for a kind, used when an object is defined without an
    /// initial value.
    pub fn zero(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Real => Value::Real(0.0),
            ValueKind::Unsigned => Value::Unsigned(0),
            ValueKind::Signed => Value::Signed(0),
            ValueKind::Boolean => Value::Boolean(false),
            ValueKind::Enumerated => Value::Enumerated(0),
        }
    }

    /// Numeric view used by the COV increment comparison.
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Real(v) => f64::from(*v),
            Value::Unsigned(v) => f64::from(*v),
            Value::Signed(v) => f64::from(*v),
            Value::Boolean(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Enumerated(v) => f64::from(*v),
        }
    }

    /// Converts to the target kind when the conversion is lossless.
    ///
    /// Event producers that emit plain numbers for unsigned, signed, or
    /// enumerated points are accepted as long as the number fits; everything
    /// else is a kind mismatch.
    pub fn coerce(&self, kind: ValueKind) -> Option<Value> {
        if self.kind() == kind {
            return Some(*self);
        }
        match (self, kind) {
            (Value::Real(v), ValueKind::Unsigned) if v.fract() == 0.0 && *v >= 0.0 => {
                Some(Value::Unsigned(*v as u32))
            }
            (Value::Real(v), ValueKind::Signed) if v.fract() == 0.0 => {
                Some(Value::Signed(*v as i32))
            }
            (Value::Real(v), ValueKind::Enumerated) if v.fract() == 0.0 && *v >= 0.0 => {
                Some(Value::Enumerated(*v as u32))
            }
            (Value::Unsigned(v), ValueKind::Real) => Some(Value::Real(*v as f32)),
            (Value::Unsigned(v), ValueKind::Enumerated) => Some(Value::Enumerated(*v)),
            (Value::Unsigned(v), ValueKind::Signed) if *v <= i32::MAX as u32 => {
                Some(Value::Signed(*v as i32))
            }
            (Value::Enumerated(v), ValueKind::Unsigned) => Some(Value::Unsigned(*v)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Real(v) => write!(f, "{:.2}", v),
            Value::Unsigned(v) => write!(f, "{}", v),
            Value::Signed(v) => write!(f, "{}", v),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Enumerated(v) => write!(f, "enum({})", v),
        }
    }
}

/// The four BACnet status flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFlags {
    #[serde(default)]
    pub in_alarm: bool,
    #[serde(default)]
    pub fault: bool,
    #[serde(default)]
    pub overridden: bool,
    #[serde(default)]
    pub out_of_service: bool,
}

/// BACnet MAC address of a COV subscriber
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

fn default_units() -> u16 {
    // BACnet engineering unit 95 = no-units
    95
}

/// Authoritative state of one gateway object.
///
/// The registry owns the live copy; the cache mirror stores the JSON
/// serialization of this struct, so every optional field needs a default
/// that round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub object_type: ObjectType,
    pub object_instance: u32,
    pub object_name: String,
    #[serde(default)]
    pub description: String,
    pub value_kind: ValueKind,
    #[serde(default = "default_units")]
    pub units: u16,
    #[serde(default)]
    pub units_text: String,
    /// 0.0 means "any change notifies".
    #[serde(default)]
    pub cov_increment: f32,
    #[serde(default)]
    pub min_value: Option<f32>,
    #[serde(default)]
    pub max_value: Option<f32>,
    #[serde(default)]
    pub state_texts: Vec<String>,
    #[serde(default)]
    pub state_count: u32,
    #[serde(default)]
    pub inactive_text: String,
    #[serde(default)]
    pub active_text: String,
    #[serde(default)]
    pub supports_priority_array: bool,
    pub present_value: Value,
    #[serde(default)]
    pub status_flags: StatusFlags,
    #[serde(default)]
    pub reliability: u8,
    #[serde(default)]
    pub event_state: u8,
    /// Wall-clock seconds of the last applied update.
    #[serde(default)]
    pub last_update: i64,
    #[serde(default)]
    pub source_id: String,
    /// Event-store cursor at which this state was produced. `None` until
    /// the first stream-applied write; 0 is a real position.
    #[serde(default)]
    pub stream_position: Option<u64>,
    /// Value at which the most recent COV notification went out.
    pub last_notified_value: Value,
}

impl ObjectRecord {
    pub fn id(&self) -> ObjectId {
        ObjectId::new(self.object_type, self.object_instance)
    }
}

/// Device object state, patched by DeviceConfig messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub instance: u32,
    pub name: String,
    pub description: String,
    pub location: String,
    pub vendor_id: u16,
    pub vendor_name: String,
    pub model_name: String,
    pub application_software_version: String,
}

/// Per-field device update; `None` leaves the attribute unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DevicePatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub model_name: Option<String>,
    pub vendor_name: Option<String>,
    pub application_software_version: Option<String>,
}

impl DevicePatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.location.is_none()
            && self.model_name.is_none()
            && self.vendor_name.is_none()
            && self.application_software_version.is_none()
    }
}

/// Current wall-clock time in seconds, the resolution stored on records.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("cache error: {0}")]
    Cache(#[from] crate::cache::CacheError),

    #[error("transport error: {0}")]
    Transport(#[from] crate::consumer::TransportError),

    #[error("decode error: {0}")]
    Decode(#[from] crate::decoder::DecodeError),

    #[error("registry error: {0}")]
    Registry(#[from] crate::registry::RegistryError),

    #[error("COV error: {0}")]
    Cov(#[from] crate::cov::CovError),

    #[error("BACnet error: {0}")]
    Bacnet(#[from] crate::bacnet::BacnetError),

    #[error("{0}")]
    Other(String),
}
