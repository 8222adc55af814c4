//! Closed device catalog: `device_identifier → (kind, constructor)`.
//!
//! Supporting a new bricklet means one more row in [`CATALOG`] plus a
//! [`DeviceHandle`] variant.

use std::sync::Arc;

use tinkerbus_types::DeviceKind;

use crate::ambient_light::AmbientLight;
use crate::connection::StackConnection;
use crate::device::DeviceHandle;
use crate::temperature::Temperature;

type Constructor = fn(&str, Arc<dyn StackConnection>) -> Option<DeviceHandle>;

#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub device_identifier: u16,
    pub kind: DeviceKind,
    construct: Constructor,
}

pub static CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        device_identifier: AmbientLight::DEVICE_IDENTIFIER,
        kind: DeviceKind::AmbientLight,
        construct: ambient_light,
    },
    CatalogEntry {
        device_identifier: Temperature::DEVICE_IDENTIFIER,
        kind: DeviceKind::Temperature,
        construct: temperature,
    },
];

fn ambient_light(uid: &str, connection: Arc<dyn StackConnection>) -> Option<DeviceHandle> {
    AmbientLight::new(uid, connection).map(|d| DeviceHandle::AmbientLight(Arc::new(d)))
}

fn temperature(uid: &str, connection: Arc<dyn StackConnection>) -> Option<DeviceHandle> {
    Temperature::new(uid, connection).map(|d| DeviceHandle::Temperature(Arc::new(d)))
}

/// Find the catalog row for a hardware identifier.
pub fn lookup(device_identifier: u16) -> Option<&'static CatalogEntry> {
    CATALOG
        .iter()
        .find(|entry| entry.device_identifier == device_identifier)
}

/// Build a handle for `uid`; `None` for identifiers outside the catalog or
/// malformed UIDs.
pub fn create_device(
    device_identifier: u16,
    uid: &str,
    connection: Arc<dyn StackConnection>,
) -> Option<DeviceHandle> {
    let entry = lookup(device_identifier)?;
    (entry.construct)(uid, connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimStack;

    #[test]
    fn catalog_identifiers_match_kinds() {
        for entry in CATALOG {
            assert_eq!(entry.kind.device_identifier(), entry.device_identifier);
        }
    }

    #[test]
    fn create_known_kinds() {
        let sim = SimStack::new();
        let light = create_device(21, "ab1", sim.connection()).unwrap();
        assert_eq!(light.kind(), DeviceKind::AmbientLight);
        assert_eq!(light.uid(), "ab1");

        let temp = create_device(216, "t1", sim.connection()).unwrap();
        assert_eq!(temp.kind(), DeviceKind::Temperature);
    }

    #[test]
    fn unknown_identifier_creates_nothing() {
        let sim = SimStack::new();
        assert!(lookup(13).is_none());
        assert!(create_device(13, "ab1", sim.connection()).is_none());
    }
}
