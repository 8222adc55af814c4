//! `tinkerbus-types` – shared vocabulary of the workspace.
//!
//! Pure data, no IO:
//!
//! - [`address`] – [`StackAddress`] and [`ConnectionState`].
//! - [`enumeration`] – presence notifications, device identities and the
//!   closed set of [`DeviceKind`]s.
//! - [`content`] – content classes, values, settings batches and the
//!   per-device [`DeviceContent`] snapshot.
//! - [`message`] – the [`Intent`] / [`Event`] bus envelopes.
//! - [`error`] – the error taxonomy.

pub mod address;
pub mod content;
pub mod enumeration;
pub mod error;
pub mod message;

pub use address::{ConnectionState, StackAddress};
pub use content::{
    CallbackThreshold, ContentClass, ContentValue, DeviceContent, Settings, ThresholdOption,
};
pub use enumeration::{DeviceKind, EnumerationCause, EnumerationNotification, Identity};
pub use error::{DeviceError, TinkerError, TransportError};
pub use message::{Event, Intent};
