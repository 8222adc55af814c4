//! `tinkerbus-hal` – hardware abstraction for a stack of bricklets.
//!
//! | Module | Contents |
//! |---|---|
//! | [`connection`] | [`StackConnection`] trait and the notification types it delivers |
//! | [`packet`] | wire codec: header, payload helpers, base58 UIDs |
//! | [`ip_connection`] | TCP transport to a brick daemon |
//! | [`device`] | [`DeviceCore`], [`Device`] and the tagged [`DeviceHandle`] |
//! | [`ambient_light`] / [`temperature`] | typed handles for the supported bricklets |
//! | [`catalog`] | closed `device_identifier → constructor` table |
//! | [`sim`] | scriptable in-process stack |

pub mod ambient_light;
pub mod catalog;
pub mod connection;
pub mod device;
pub mod ip_connection;
pub mod packet;
pub mod sim;
pub mod temperature;

pub use ambient_light::{AmbientLight, AmbientLightCallback, AmbientLightCallbacks};
pub use catalog::{CATALOG, CatalogEntry, create_device, lookup};
pub use connection::{
    CallbackFrame, ConnectReason, DisconnectReason, Request, StackConnection,
    TransportNotification,
};
pub use device::{CallbackSubscription, Device, DeviceCore, DeviceHandle};
pub use ip_connection::{DEFAULT_TIMEOUT, IpConnection};
pub use sim::SimStack;
pub use temperature::{Temperature, TemperatureCallback, TemperatureCallbacks};
