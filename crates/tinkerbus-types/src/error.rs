//! Error taxonomy shared by every tinkerbus crate.
//!
//! | Error | Raised by | Handling |
//! |---|---|---|
//! | [`TransportError`] | the physical connection | `AlreadyConnected` / `NotConnected` on connect/disconnect are absorbed |
//! | [`DeviceError`] | a single device call | logged and swallowed at the settings boundary |
//! | [`TinkerError`] | construction, configuration, bootstrap | surfaced to the caller |

use thiserror::Error;

/// Failure of a single call addressed to one device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device did not answer within the transport timeout.
    #[error("device {uid} did not answer function {function_id} in time")]
    Timeout { uid: String, function_id: u8 },

    /// The transport dropped (or was never up) while the call was in flight.
    #[error("not connected to the stack")]
    NotConnected,

    /// The device rejected the parameters of the call.
    #[error("device {uid} rejected the parameters of function {function_id}")]
    InvalidParameter { uid: String, function_id: u8 },

    /// The device does not implement the requested function.
    #[error("device {uid} does not support function {function_id}")]
    FunctionNotSupported { uid: String, function_id: u8 },

    /// The response could not be decoded.
    #[error("malformed response from {uid}: {details}")]
    MalformedResponse { uid: String, details: String },
}

impl DeviceError {
    /// `true` for the two conditions a caller is expected to ride out:
    /// a timeout and a dropped transport.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::NotConnected)
    }
}

/// Failure reported by the physical connection itself.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error for construction, configuration and bootstrap paths.
#[derive(Error, Debug)]
pub enum TinkerError {
    #[error("invalid stack address {host:?}:{port}: {reason}")]
    InvalidStackAddress {
        host: String,
        port: u16,
        reason: &'static str,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("message bus error: {0}")]
    Bus(String),
}
