/*!
 * Wire protocol.
 *
 * Records are JSON objects tagged by `type`, one per line. A driver emits
 * `defineProperty`, `updateProperty`, `deleteProperty` and `message`;
 * clients send `newProperty` and `getProperties`. Peers exchange the same
 * records when snooping.
 */
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};
use crate::property::{Property, PropertyState, PropertyValues};

/// New values and state of one property, as published by its device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyUpdate {
    /// Owning device
    pub device: String,
    /// Property name
    pub name: String,
    /// New state
    pub state: PropertyState,
    /// Revision after the change, absent when the sender does not track one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    /// Element values
    pub values: PropertyValues,
    /// Optional human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the update was produced
    pub timestamp: DateTime<Utc>,
}

impl PropertyUpdate {
    /// Build an update carrying all current values of `property`
    pub fn from_property(property: &Property, message: Option<String>) -> Self {
        Self {
            device: property.device().to_string(),
            name: property.name().to_string(),
            state: property.state(),
            revision: Some(property.revision()),
            values: property.values(),
            message,
            timestamp: Utc::now(),
        }
    }
}

/// A wire record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    /// Full definition of a property
    DefineProperty {
        /// The property
        property: Property,
        /// Optional human-readable message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// When the definition was sent
        timestamp: DateTime<Utc>,
    },
    /// New values and/or state of a defined property
    UpdateProperty(PropertyUpdate),
    /// Client request to change element values
    NewProperty {
        /// Target device
        device: String,
        /// Target property
        name: String,
        /// Requested values, possibly partial
        values: PropertyValues,
    },
    /// A property, or with no name every property, of a device went away
    DeleteProperty {
        /// Owning device
        device: String,
        /// Property name, `None` for the whole device
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Optional human-readable message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// When the deletion was sent
        timestamp: DateTime<Utc>,
    },
    /// Request for definitions
    ///
    /// With `snoop` set, the record comes from a driver announcing interest
    /// in a peer's property.
    GetProperties {
        /// Device filter
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device: Option<String>,
        /// Property filter
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Sent by a snooping driver
        #[serde(default)]
        snoop: bool,
    },
    /// Session message from a device
    Message {
        /// Originating device
        device: String,
        /// Text
        message: String,
        /// When the message was produced
        timestamp: DateTime<Utc>,
    },
}

impl Message {
    /// Definition record for `property`
    pub fn define(property: &Property) -> Self {
        Message::DefineProperty {
            property: property.clone(),
            message: None,
            timestamp: Utc::now(),
        }
    }

    /// Update record for `property` with all its current values
    pub fn update(property: &Property, message: Option<String>) -> Self {
        Message::UpdateProperty(PropertyUpdate::from_property(property, message))
    }

    /// Deletion record
    pub fn delete<S: Into<String>>(device: S, name: Option<String>, message: Option<String>) -> Self {
        Message::DeleteProperty {
            device: device.into(),
            name,
            message,
            timestamp: Utc::now(),
        }
    }

    /// Session message record
    pub fn session<D: Into<String>, M: Into<String>>(device: D, message: M) -> Self {
        Message::Message {
            device: device.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Device the record is addressed to or comes from
    pub fn device(&self) -> Option<&str> {
        match self {
            Message::DefineProperty { property, .. } => Some(property.device()),
            Message::UpdateProperty(update) => Some(&update.device),
            Message::NewProperty { device, .. } => Some(device),
            Message::DeleteProperty { device, .. } => Some(device),
            Message::GetProperties { device, .. } => device.as_deref(),
            Message::Message { device, .. } => Some(device),
        }
    }

    /// Property the record concerns, if any
    pub fn property_name(&self) -> Option<&str> {
        match self {
            Message::DefineProperty { property, .. } => Some(property.name()),
            Message::UpdateProperty(update) => Some(&update.name),
            Message::NewProperty { name, .. } => Some(name),
            Message::DeleteProperty { name, .. } => name.as_deref(),
            Message::GetProperties { name, .. } => name.as_deref(),
            Message::Message { .. } => None,
        }
    }
}

/// Encode a record as a single line, without the trailing newline
pub fn encode(message: &Message) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode one line into a record
///
/// # Errors
///
/// Returns `MalformedMessage` when the line is not a valid record.
pub fn decode(line: &str) -> Result<Message> {
    serde_json::from_str(line.trim()).map_err(|e| DeviceError::malformed(format!("{}: {}", e, line.trim())))
}
