//! Wire protocol types for supervisor-worker communication.
//!
//! Control messages share the channel with application traffic. A record is a
//! control message when it is a map whose `$type` entry names a known control
//! type; every other record is relayed verbatim as an application message.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Self-describing payload carried by application messages.
pub use ciborium::Value;

/// Key of the discriminator field on control messages.
pub const TYPE_KEY: &str = "$type";

/// Every record exchanged between supervisor and worker.
#[derive(Debug, Clone, PartialEq)]
pub enum HostMessage {
    /// Supervisor asks the worker to clean up within `timeout_ms` and exit.
    TerminateRequest { timeout_ms: u64 },

    /// Worker acknowledges a terminate request; it exits right after.
    TerminatedEvent,

    /// Anything else, relayed untouched.
    Application(Value),
}

impl HostMessage {
    pub fn is_control(&self) -> bool {
        !matches!(self, Self::Application(_))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "$type")]
enum ControlMessage {
    TerminateRequest {
        #[serde(rename = "timeoutMs")]
        timeout_ms: u64,
    },
    TerminatedEvent,
}

const CONTROL_TYPES: &[&str] = &["TerminateRequest", "TerminatedEvent"];

/// Returns the control type named by a record's `$type` entry, if any.
fn control_type(value: &Value) -> Option<&str> {
    let entries = value.as_map()?;
    let tag = entries
        .iter()
        .find(|(key, _)| key.as_text() == Some(TYPE_KEY))
        .and_then(|(_, tag)| tag.as_text())?;
    CONTROL_TYPES.iter().copied().find(|known| *known == tag)
}

impl Serialize for HostMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::TerminateRequest { timeout_ms } => ControlMessage::TerminateRequest {
                timeout_ms: *timeout_ms,
            }
            .serialize(serializer),
            Self::TerminatedEvent => ControlMessage::TerminatedEvent.serialize(serializer),
            Self::Application(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for HostMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if control_type(&value).is_none() {
            return Ok(Self::Application(value));
        }
        let control: ControlMessage = value
            .deserialized()
            .map_err(|e| D::Error::custom(format!("malformed control message: {e}")))?;
        Ok(match control {
            ControlMessage::TerminateRequest { timeout_ms } => Self::TerminateRequest { timeout_ms },
            ControlMessage::TerminatedEvent => Self::TerminatedEvent,
        })
    }
}
