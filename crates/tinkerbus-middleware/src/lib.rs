//! `tinkerbus-middleware` – bus and device services.
//!
//! - [`bus`] – topic-based [`EventBus`] carrying intents and events.
//! - [`service`] – the generic [`DeviceService`] adapter and the
//!   [`ManagedDevice`] contract each kind fulfils.
//! - [`ambient_light`] / [`temperature`] – the concrete kinds.
//! - [`service_manager`] – [`ServiceManager`], the stack listener that
//!   creates, rebinds and stops services as devices come and go.

pub mod ambient_light;
pub mod bus;
pub mod service;
pub mod service_manager;
pub mod temperature;

pub use ambient_light::AmbientLightService;
pub use bus::{EventBus, EventSubscriber, Topic, TopicReceiver};
pub use service::{CallbackStream, DeviceService, ManagedDevice, service_id};
pub use service_manager::ServiceManager;
pub use temperature::TemperatureService;
