//! Device handles.
//!
//! A handle is a thin proxy bound to one UID and one [`StackConnection`].  It
//! carries no state of its own; dropping it is free and a fresh handle for
//! the same UID is interchangeable with the old one once the device answers.
//!
//! [`DeviceHandle`] is the closed, tagged union over all supported kinds that
//! the stack manager stores and hands to listeners.

use std::sync::Arc;

use async_trait::async_trait;
use tinkerbus_types::{DeviceError, DeviceKind, Identity};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::ambient_light::AmbientLight;
use crate::connection::{CallbackFrame, Request, StackConnection};
use crate::packet::{self, FUNCTION_GET_IDENTITY};
use crate::temperature::Temperature;

/// UID plus connection, shared by every concrete device type.
#[derive(Clone)]
pub struct DeviceCore {
    uid: String,
    uid_number: u32,
    connection: Arc<dyn StackConnection>,
}

impl std::fmt::Debug for DeviceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCore")
            .field("uid", &self.uid)
            .field("uid_number", &self.uid_number)
            .finish_non_exhaustive()
    }
}

impl DeviceCore {
    /// Bind `uid` to `connection`. `None` when `uid` is not valid base58.
    pub fn new(uid: &str, connection: Arc<dyn StackConnection>) -> Option<Self> {
        let uid_number = packet::base58_decode(uid)?;
        Some(Self {
            uid: uid.to_string(),
            uid_number,
            connection,
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn uid_number(&self) -> u32 {
        self.uid_number
    }

    /// Call `function_id` and return the response payload.
    pub async fn call(&self, function_id: u8, payload: Vec<u8>) -> Result<Vec<u8>, DeviceError> {
        self.connection
            .request(Request::expecting_response(
                self.uid_number,
                function_id,
                payload,
            ))
            .await
    }

    /// Call a setter. The response is awaited so that error codes surface.
    pub async fn set(&self, function_id: u8, payload: Vec<u8>) -> Result<(), DeviceError> {
        self.call(function_id, payload).await.map(|_| ())
    }

    /// Call a getter returning a single `u16`.
    pub async fn get_u16(&self, function_id: u8) -> Result<u16, DeviceError> {
        let response = self.call(function_id, Vec::new()).await?;
        packet::PayloadReader::new(&response)
            .u16()
            .ok_or_else(|| self.malformed(function_id, response.len()))
    }

    /// Call a getter returning a single `i16`.
    pub async fn get_i16(&self, function_id: u8) -> Result<i16, DeviceError> {
        let response = self.call(function_id, Vec::new()).await?;
        packet::PayloadReader::new(&response)
            .i16()
            .ok_or_else(|| self.malformed(function_id, response.len()))
    }

    pub async fn identity(&self) -> Result<Identity, DeviceError> {
        let response = self.call(FUNCTION_GET_IDENTITY, Vec::new()).await?;
        packet::decode_identity(&self.uid, &response)
    }

    /// Subscribe to the callbacks of this device only.
    pub fn subscribe(&self) -> CallbackSubscription {
        CallbackSubscription {
            uid: self.uid.clone(),
            uid_number: self.uid_number,
            rx: self.connection.subscribe_callbacks(),
        }
    }

    fn malformed(&self, function_id: u8, len: usize) -> DeviceError {
        DeviceError::MalformedResponse {
            uid: self.uid.clone(),
            details: format!("function {function_id} answered with {len} bytes"),
        }
    }
}

/// Callback stream filtered to one device.
#[derive(Debug)]
pub struct CallbackSubscription {
    uid: String,
    uid_number: u32,
    rx: broadcast::Receiver<CallbackFrame>,
}

impl CallbackSubscription {
    /// Next callback of this device; `None` once the transport is gone.
    ///
    /// Lagging behind the broadcast buffer drops the oldest frames with a
    /// warning and keeps going.
    pub async fn recv(&mut self) -> Option<CallbackFrame> {
        loop {
            match self.rx.recv().await {
                Ok(frame) if frame.uid == self.uid_number => return Some(frame),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    warn!(uid = %self.uid, dropped = n, "callback subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Behaviour shared by every concrete device type.
#[async_trait]
pub trait Device: Send + Sync {
    fn core(&self) -> &DeviceCore;

    fn kind(&self) -> DeviceKind;

    fn uid(&self) -> &str {
        self.core().uid()
    }

    /// Identity query; also serves as liveness check.
    async fn identity(&self) -> Result<Identity, DeviceError> {
        self.core().identity().await
    }
}

/// Live handle to one supported device.
#[derive(Debug, Clone)]
pub enum DeviceHandle {
    AmbientLight(Arc<AmbientLight>),
    Temperature(Arc<Temperature>),
}

impl DeviceHandle {
    fn device(&self) -> &dyn Device {
        match self {
            Self::AmbientLight(d) => d.as_ref(),
            Self::Temperature(d) => d.as_ref(),
        }
    }

    pub fn uid(&self) -> &str {
        self.device().uid()
    }

    pub fn kind(&self) -> DeviceKind {
        self.device().kind()
    }

    pub async fn identity(&self) -> Result<Identity, DeviceError> {
        self.device().identity().await
    }

    pub fn subscribe(&self) -> CallbackSubscription {
        self.device().core().subscribe()
    }

    /// `true` when both handles are the same allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::AmbientLight(a), Self::AmbientLight(b)) => Arc::ptr_eq(a, b),
            (Self::Temperature(a), Self::Temperature(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
