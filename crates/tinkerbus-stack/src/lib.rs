//! `tinkerbus-stack` – connection lifecycle and device enumeration.
//!
//! - [`connection_manager`] – connect/disconnect, settle delay, connection
//!   state transitions, device liveness check.
//! - [`registry`] – the uid → [`DeviceRecord`] map with snapshot reads.
//! - [`enumeration`] – the per-uid presence state machine.
//! - [`manager`] – [`StackManager`], the composition root, and the
//!   [`StackListener`] hooks applications implement.

pub mod connection_manager;
pub mod enumeration;
pub mod manager;
pub mod registry;

pub use connection_manager::{ConnectionManager, SETTLE_DELAY, Transition};
pub use enumeration::{EnumerationHandler, EnumerationOutcome};
pub use manager::{StackListener, StackManager};
pub use registry::{DeviceRecord, DeviceRegistry, DeviceSnapshot};
