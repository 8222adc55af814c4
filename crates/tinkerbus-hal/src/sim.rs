//! In-process simulated stack for tests and the `--simulate` mode.
//!
//! [`SimStack`] implements [`StackConnection`] without any socket.  Tests
//! script it from the outside: add devices, make them unreachable, inject
//! enumeration notifications and callbacks, drop the link.  Every request a
//! device receives is recorded for later inspection.
//!
//! Requests reach devices regardless of the link state; use
//! [`SimStack::set_reachable`] to make a single device stop answering.  An
//! unreachable or unknown device fails with [`DeviceError::Timeout`]
//! immediately instead of waiting out a real timeout.
//!
//! # Example
//!
//! ```rust
//! use tinkerbus_hal::sim::SimStack;
//! use tinkerbus_types::{DeviceKind, EnumerationCause};
//!
//! let sim = SimStack::new();
//! sim.add_device("ab1", DeviceKind::AmbientLight);
//! sim.announce("ab1", EnumerationCause::Connected);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tinkerbus_types::{
    ConnectionState, DeviceError, DeviceKind, EnumerationCause, EnumerationNotification,
    Identity, StackAddress, TransportError,
};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::connection::{
    CallbackFrame, ConnectReason, DisconnectReason, Request, StackConnection,
    TransportNotification,
};
use crate::packet::{self, FUNCTION_GET_IDENTITY};

const CALLBACK_BUFFER: usize = 256;
const SIM_PARENT_UID: &str = "6qzRzc";

// ────────────────────────────────────────────────────────────────────────────
// Simulated device
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SimDevice {
    identity: Identity,
    reachable: bool,
    responses: HashMap<u8, Vec<u8>>,
    failures: HashMap<u8, DeviceError>,
    calls: Vec<Request>,
}

impl SimDevice {
    fn new(uid: &str, device_identifier: u16) -> Self {
        Self {
            identity: Identity {
                uid: uid.to_string(),
                connected_uid: SIM_PARENT_UID.to_string(),
                position: 'a',
                hardware_version: [1, 0, 0],
                firmware_version: [2, 0, 3],
                device_identifier,
            },
            reachable: true,
            responses: HashMap::new(),
            failures: HashMap::new(),
            calls: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    connection: ConnectionState,
    refuse_connections: bool,
    fail_enumerate: bool,
    enumerate_requests: usize,
    devices: HashMap<String, SimDevice>,
}

struct SimInner {
    state: Mutex<SimState>,
    notify_tx: mpsc::UnboundedSender<TransportNotification>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportNotification>>>,
    callbacks: broadcast::Sender<CallbackFrame>,
}

// ────────────────────────────────────────────────────────────────────────────
// SimStack
// ────────────────────────────────────────────────────────────────────────────

/// Scriptable in-process stack. Clones share the same simulated hardware.
#[derive(Clone)]
pub struct SimStack {
    inner: Arc<SimInner>,
}

impl Default for SimStack {
    fn default() -> Self {
        Self::new()
    }
}

impl SimStack {
    pub fn new() -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (callbacks, _) = broadcast::channel(CALLBACK_BUFFER);
        Self {
            inner: Arc::new(SimInner {
                state: Mutex::new(SimState::default()),
                notify_tx,
                notify_rx: Mutex::new(Some(notify_rx)),
                callbacks,
            }),
        }
    }

    /// This stack as a shareable transport.
    pub fn connection(&self) -> Arc<dyn StackConnection> {
        Arc::new(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not wedge the others.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, notification: TransportNotification) {
        // The receiver may not have been taken yet, or already dropped.
        let _ = self.inner.notify_tx.send(notification);
    }

    /// Plug in a device of a supported kind.
    pub fn add_device(&self, uid: &str, kind: DeviceKind) {
        self.add_device_with_identifier(uid, kind.device_identifier());
    }

    /// Plug in a device reporting an arbitrary hardware identifier.
    pub fn add_device_with_identifier(&self, uid: &str, device_identifier: u16) {
        self.lock()
            .devices
            .insert(uid.to_string(), SimDevice::new(uid, device_identifier));
    }

    pub fn remove_device(&self, uid: &str) {
        self.lock().devices.remove(uid);
    }

    /// Make a device stop (or resume) answering requests.
    pub fn set_reachable(&self, uid: &str, reachable: bool) {
        if let Some(device) = self.lock().devices.get_mut(uid) {
            device.reachable = reachable;
        }
    }

    /// Make every call to `function_id` on `uid` fail with `error`.
    pub fn fail_function(&self, uid: &str, function_id: u8, error: DeviceError) {
        if let Some(device) = self.lock().devices.get_mut(uid) {
            device.failures.insert(function_id, error);
        }
    }

    /// Payload returned by `function_id` on `uid`. Unset functions answer
    /// with an empty payload.
    pub fn set_response(&self, uid: &str, function_id: u8, payload: Vec<u8>) {
        if let Some(device) = self.lock().devices.get_mut(uid) {
            device.responses.insert(function_id, payload);
        }
    }

    /// Requests received by `uid`, identity queries excluded, oldest first.
    pub fn calls(&self, uid: &str) -> Vec<Request> {
        self.lock()
            .devices
            .get(uid)
            .map(|device| {
                device
                    .calls
                    .iter()
                    .filter(|r| r.function_id != FUNCTION_GET_IDENTITY)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of identity queries `uid` answered or refused.
    pub fn identity_queries(&self, uid: &str) -> usize {
        self.lock()
            .devices
            .get(uid)
            .map(|device| {
                device
                    .calls
                    .iter()
                    .filter(|r| r.function_id == FUNCTION_GET_IDENTITY)
                    .count()
            })
            .unwrap_or_default()
    }

    /// Number of enumeration requests received so far.
    pub fn enumerate_requests(&self) -> usize {
        self.lock().enumerate_requests
    }

    pub fn fail_enumerate(&self, fail: bool) {
        self.lock().fail_enumerate = fail;
    }

    /// Make `connect()` fail with an I/O error.
    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Report a known device with `cause`. Unknown UIDs are reported with
    /// an identity whose device identifier is `0`.
    pub fn announce(&self, uid: &str, cause: EnumerationCause) {
        let identity = self
            .lock()
            .devices
            .get(uid)
            .map(|device| device.identity.clone())
            .unwrap_or_else(|| SimDevice::new(uid, 0).identity);
        self.announce_raw(EnumerationNotification::from_identity(identity, cause));
    }

    /// Deliver an arbitrary enumeration notification.
    pub fn announce_raw(&self, notification: EnumerationNotification) {
        self.notify(TransportNotification::Enumerate(notification));
    }

    /// Emit a callback packet from `uid`. Ignored for malformed UIDs.
    pub fn emit_callback(&self, uid: &str, function_id: u8, payload: Vec<u8>) {
        let Some(uid_number) = packet::base58_decode(uid) else {
            return;
        };
        let _ = self.inner.callbacks.send(CallbackFrame {
            uid: uid_number,
            function_id,
            payload: payload.into(),
        });
    }

    /// Simulate the link dropping underneath the host.
    pub fn drop_connection(&self) {
        self.lock().connection = ConnectionState::Disconnected;
        self.notify(TransportNotification::Disconnected {
            reason: DisconnectReason::Error,
        });
    }

    /// Simulate the transport reconnecting on its own.
    pub fn restore_connection(&self) {
        self.lock().connection = ConnectionState::Connected;
        self.notify(TransportNotification::Connected {
            reason: ConnectReason::AutoReconnect,
        });
    }
}

#[async_trait]
impl StackConnection for SimStack {
    async fn connect(&self, address: &StackAddress) -> Result<(), TransportError> {
        {
            let mut state = self.lock();
            if state.connection == ConnectionState::Connected {
                return Err(TransportError::AlreadyConnected);
            }
            if state.refuse_connections {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("simulated stack refused {address}"),
                )));
            }
            state.connection = ConnectionState::Connected;
        }
        debug!(%address, "simulated stack connected");
        self.notify(TransportNotification::Connected {
            reason: ConnectReason::Request,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        {
            let mut state = self.lock();
            if state.connection == ConnectionState::Disconnected {
                return Err(TransportError::NotConnected);
            }
            state.connection = ConnectionState::Disconnected;
        }
        self.notify(TransportNotification::Disconnected {
            reason: DisconnectReason::Request,
        });
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.lock().connection
    }

    async fn enumerate(&self) -> Result<(), DeviceError> {
        let mut identities: Vec<Identity> = {
            let mut state = self.lock();
            state.enumerate_requests += 1;
            if state.fail_enumerate {
                return Err(DeviceError::NotConnected);
            }
            state
                .devices
                .values()
                .filter(|device| device.reachable)
                .map(|device| device.identity.clone())
                .collect()
        };
        identities.sort_by(|a, b| a.uid.cmp(&b.uid));
        for identity in identities {
            self.announce_raw(EnumerationNotification::from_identity(
                identity,
                EnumerationCause::Available,
            ));
        }
        Ok(())
    }

    async fn request(&self, request: Request) -> Result<Vec<u8>, DeviceError> {
        let uid = packet::base58_encode(request.uid);
        let mut state = self.lock();
        let Some(device) = state.devices.get_mut(&uid) else {
            return Err(DeviceError::Timeout {
                uid,
                function_id: request.function_id,
            });
        };
        let function_id = request.function_id;
        device.calls.push(request);
        if !device.reachable {
            return Err(DeviceError::Timeout { uid, function_id });
        }
        if let Some(error) = device.failures.get(&function_id) {
            return Err(error.clone());
        }
        if function_id == FUNCTION_GET_IDENTITY {
            return Ok(packet::encode_identity(&device.identity));
        }
        Ok(device
            .responses
            .get(&function_id)
            .cloned()
            .unwrap_or_default())
    }

    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<TransportNotification>> {
        self.inner
            .notify_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn subscribe_callbacks(&self) -> broadcast::Receiver<CallbackFrame> {
        self.inner.callbacks.subscribe()
    }
}
