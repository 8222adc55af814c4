//! Device presence reporting: enumeration notifications, identities and the
//! closed set of supported device kinds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why the transport reported a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnumerationCause {
    /// Answer to an explicit enumeration request.
    Available,
    /// The device (re)appeared on its own, e.g. after a power cycle.
    Connected,
    /// The device went away.
    Disconnected,
}

impl EnumerationCause {
    /// Decode the enumeration-type byte carried by the enumerate callback.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Available),
            1 => Some(Self::Connected),
            2 => Some(Self::Disconnected),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Available => 0,
            Self::Connected => 1,
            Self::Disconnected => 2,
        }
    }
}

/// Device kinds this workspace knows how to drive.
///
/// The numeric identifier reported by the hardware is resolved through the
/// device catalog in `tinkerbus-hal`; anything outside this set is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    AmbientLight,
    Temperature,
}

impl DeviceKind {
    /// Numeric device identifier used on the wire.
    pub fn device_identifier(self) -> u16 {
        match self {
            Self::AmbientLight => 21,
            Self::Temperature => 216,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AmbientLight => "ambient_light",
            Self::Temperature => "temperature",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device's answer to the identity query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: String,
    /// UID of the brick or bricklet this device is plugged into.
    pub connected_uid: String,
    /// Port letter (`'a'`..`'d'`) or stack position (`'0'`..`'8'`).
    pub position: char,
    pub hardware_version: [u8; 3],
    pub firmware_version: [u8; 3],
    pub device_identifier: u16,
}

/// One presence report delivered by the transport. Consumed once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumerationNotification {
    pub uid: String,
    pub connected_uid: String,
    pub position: char,
    pub hardware_version: [u8; 3],
    pub firmware_version: [u8; 3],
    pub device_identifier: u16,
    pub cause: EnumerationCause,
}

impl EnumerationNotification {
    /// Build a notification that reports `identity` with the given cause.
    pub fn from_identity(identity: Identity, cause: EnumerationCause) -> Self {
        Self {
            uid: identity.uid,
            connected_uid: identity.connected_uid,
            position: identity.position,
            hardware_version: identity.hardware_version,
            firmware_version: identity.firmware_version,
            device_identifier: identity.device_identifier,
            cause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_wire_values() {
        for cause in [
            EnumerationCause::Available,
            EnumerationCause::Connected,
            EnumerationCause::Disconnected,
        ] {
            assert_eq!(EnumerationCause::from_wire(cause.to_wire()), Some(cause));
        }
        assert_eq!(EnumerationCause::from_wire(3), None);
    }

    #[test]
    fn device_kind_identifiers_are_distinct() {
        assert_eq!(DeviceKind::AmbientLight.device_identifier(), 21);
        assert_eq!(DeviceKind::Temperature.device_identifier(), 216);
    }

    #[test]
    fn device_kind_serializes_snake_case() {
        let json = serde_json::to_string(&DeviceKind::AmbientLight).unwrap();
        assert_eq!(json, "\"ambient_light\"");
    }
}
