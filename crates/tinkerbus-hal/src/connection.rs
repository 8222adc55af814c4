//! [`StackConnection`] – the transport boundary.
//!
//! Everything above the HAL talks to the physical stack through this trait.
//! Two implementations ship with the crate:
//!
//! | Implementation | Use |
//! |---|---|
//! | [`IpConnection`][crate::ip_connection::IpConnection] | TCP to a brick daemon or master extension |
//! | [`SimStack`][crate::sim::SimStack] | in-process stack for tests and `--simulate` |
//!
//! Notifications travel on two lanes.  Connection and enumeration
//! notifications go through one unbounded `mpsc` channel that a single
//! consumer takes once via [`StackConnection::take_notifications`].  Device
//! callbacks fan out through a `broadcast` channel so every device service
//! can subscribe independently.

use std::sync::Arc;

use async_trait::async_trait;
use tinkerbus_types::{
    ConnectionState, DeviceError, EnumerationNotification, StackAddress, TransportError,
};
use tokio::sync::{broadcast, mpsc};

/// Why the transport came up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReason {
    /// An explicit `connect()` call.
    Request,
    /// The transport re-established a dropped link on its own.
    AutoReconnect,
}

/// Why the transport went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// An explicit `disconnect()` call.
    Request,
    /// Read or write failure on the socket.
    Error,
    /// The peer closed the connection.
    Shutdown,
}

/// Notification delivered on the ordered transport lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportNotification {
    Connected { reason: ConnectReason },
    Disconnected { reason: DisconnectReason },
    Enumerate(EnumerationNotification),
}

/// One device-originated callback packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackFrame {
    /// Numeric UID of the emitting device.
    pub uid: u32,
    pub function_id: u8,
    pub payload: Arc<[u8]>,
}

/// One function call addressed to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub uid: u32,
    pub function_id: u8,
    pub payload: Vec<u8>,
    /// When `false` the call completes as soon as the packet is written.
    pub response_expected: bool,
}

impl Request {
    /// A call whose answer (or error code) the caller waits for.
    pub fn expecting_response(uid: u32, function_id: u8, payload: Vec<u8>) -> Self {
        Self {
            uid,
            function_id,
            payload,
            response_expected: true,
        }
    }
}

/// Physical connection to a stack of devices.
#[async_trait]
pub trait StackConnection: Send + Sync {
    /// Open the link to `address`.
    ///
    /// # Errors
    ///
    /// [`TransportError::AlreadyConnected`] when the link is already up,
    /// [`TransportError::Io`] when the endpoint cannot be reached.
    async fn connect(&self, address: &StackAddress) -> Result<(), TransportError>;

    /// Close the link.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotConnected`] when there is nothing to close.
    async fn disconnect(&self) -> Result<(), TransportError>;

    fn state(&self) -> ConnectionState;

    /// Broadcast an enumeration request; answers arrive as
    /// [`TransportNotification::Enumerate`].
    async fn enumerate(&self) -> Result<(), DeviceError>;

    /// Send one request and return the response payload (empty when no
    /// response is expected).
    async fn request(&self, request: Request) -> Result<Vec<u8>, DeviceError>;

    /// Hand out the notification receiver.  Returns `Some` exactly once.
    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<TransportNotification>>;

    fn subscribe_callbacks(&self) -> broadcast::Receiver<CallbackFrame>;
}
