//! Connection endpoint and connection state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TinkerError;

/// Host and port of a brick daemon (or of a WIFI/Ethernet master extension).
///
/// Immutable once built; two addresses are equal when host and port are.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StackAddress {
    host: String,
    port: u16,
}

impl StackAddress {
    /// Default brick daemon port.
    pub const DEFAULT_PORT: u16 = 4223;

    /// Validate and build an address.
    ///
    /// # Errors
    ///
    /// Returns [`TinkerError::InvalidStackAddress`] when `host` is blank or
    /// `port` is `0`.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, TinkerError> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(TinkerError::InvalidStackAddress {
                host,
                port,
                reason: "host must not be empty",
            });
        }
        if port == 0 {
            return Err(TinkerError::InvalidStackAddress {
                host,
                port,
                reason: "port must be non-zero",
            });
        }
        Ok(Self { host, port })
    }

    /// `localhost:4223`, the default brick daemon endpoint.
    pub fn localhost() -> Self {
        Self {
            host: "localhost".to_string(),
            port: Self::DEFAULT_PORT,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for StackAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Live state of the physical connection to a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_address_displays_host_and_port() {
        let addr = StackAddress::new("localhost", 4223).unwrap();
        assert_eq!(addr.to_string(), "localhost:4223");
        assert_eq!(addr, StackAddress::localhost());
    }

    #[test]
    fn blank_host_is_rejected() {
        let result = StackAddress::new("   ", 4223);
        assert!(matches!(
            result,
            Err(TinkerError::InvalidStackAddress { .. })
        ));
    }

    #[test]
    fn zero_port_is_rejected() {
        let result = StackAddress::new("stack.local", 0);
        assert!(matches!(
            result,
            Err(TinkerError::InvalidStackAddress { port: 0, .. })
        ));
    }

    #[test]
    fn default_connection_state_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
