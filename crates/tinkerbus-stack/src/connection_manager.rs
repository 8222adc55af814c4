//! [`ConnectionManager`] – lifecycle of the one physical connection.
//!
//! The manager's own [`ConnectionState`] is driven by transport
//! notifications, not by the return value of `connect()`, so that a link
//! which drops and comes back on its own produces the same transitions as
//! an explicit connect.

use std::sync::Arc;
use std::time::Duration;

use tinkerbus_hal::{DeviceHandle, StackConnection};
use tinkerbus_types::{ConnectionState, StackAddress, TransportError};
use tokio::sync::watch;
use tracing::{debug, info};

/// Pause after the transport reports ready, giving the stack time to
/// finish its own enumeration before callers start issuing requests.
pub const SETTLE_DELAY: Duration = Duration::from_secs(3);

/// A change of the connection state that listeners must hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Connected,
    Disconnected,
}

pub struct ConnectionManager {
    address: StackAddress,
    connection: Arc<dyn StackConnection>,
    state: watch::Sender<ConnectionState>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("address", &self.address)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Manager for `address`, starting `Disconnected`.
    pub fn new(address: StackAddress, connection: Arc<dyn StackConnection>) -> Self {
        Self {
            address,
            connection,
            state: watch::Sender::new(ConnectionState::Disconnected),
        }
    }

    /// Address this manager connects to.
    pub fn address(&self) -> &StackAddress {
        &self.address
    }

    /// Underlying transport.
    pub fn connection(&self) -> &Arc<dyn StackConnection> {
        &self.connection
    }

    /// Open the connection and wait [`SETTLE_DELAY`].
    ///
    /// An already open connection is success and returns at once.
    ///
    /// # Errors
    ///
    /// [`TransportError::Io`] when the endpoint cannot be reached.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });

        match self.connection.connect(&self.address).await {
            Ok(()) => {
                debug!(address = %self.address, "waiting for the stack to settle");
                tokio::time::sleep(SETTLE_DELAY).await;
                Ok(())
            }
            Err(TransportError::AlreadyConnected) => {
                debug!(address = %self.address, "already connected");
                Ok(())
            }
            Err(err) => {
                self.state.send_if_modified(|state| {
                    if *state == ConnectionState::Connecting {
                        *state = ConnectionState::Disconnected;
                        true
                    } else {
                        false
                    }
                });
                Err(err)
            }
        }
    }

    /// Close the connection. An already closed connection is success.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        match self.connection.disconnect().await {
            Ok(()) => Ok(()),
            Err(TransportError::NotConnected) => {
                debug!(address = %self.address, "already disconnected");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// `true` while the state is `Connected`.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Liveness check through the identity query. Communication failures
    /// read as "not connected".
    pub async fn is_device_connected(&self, device: &DeviceHandle) -> bool {
        match device.identity().await {
            Ok(_) => true,
            Err(err) => {
                debug!(uid = %device.uid(), error = %err, "device liveness check failed");
                false
            }
        }
    }

    /// Record the state reported by the transport. Returns the transition
    /// to announce, or `None` when nothing listeners care about changed.
    pub(crate) fn apply(&self, reported: ConnectionState) -> Option<Transition> {
        let mut transition = None;
        self.state.send_if_modified(|state| {
            let previous = *state;
            if previous == reported {
                return false;
            }
            *state = reported;
            transition = match reported {
                ConnectionState::Connected => Some(Transition::Connected),
                ConnectionState::Disconnected if previous == ConnectionState::Connected => {
                    Some(Transition::Disconnected)
                }
                _ => None,
            };
            true
        });
        if let Some(transition) = transition {
            info!(address = %self.address, ?transition, "stack connection state changed");
        }
        transition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tinkerbus_hal::{SimStack, catalog};
    use tinkerbus_types::DeviceKind;

    fn manager(sim: &SimStack) -> ConnectionManager {
        ConnectionManager::new(StackAddress::localhost(), sim.connection())
    }

    #[tokio::test(start_paused = true)]
    async fn connect_waits_for_the_settle_delay() {
        let sim = SimStack::new();
        let manager = manager(&sim);
        let started = tokio::time::Instant::now();

        manager.connect().await.unwrap();

        assert!(started.elapsed() >= SETTLE_DELAY);
        // No notification loop here, so the Connected report is never applied.
        assert_eq!(manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_is_success_without_delay() {
        let sim = SimStack::new();
        let manager = manager(&sim);
        manager.connect().await.unwrap();
        let started = tokio::time::Instant::now();

        manager.connect().await.unwrap();

        assert!(started.elapsed() < SETTLE_DELAY);
    }

    #[tokio::test]
    async fn disconnect_when_idle_is_success() {
        let sim = SimStack::new();
        manager(&sim).disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn refused_connect_surfaces_and_resets_state() {
        let sim = SimStack::new();
        sim.refuse_connections(true);
        let manager = manager(&sim);

        assert!(matches!(
            manager.connect().await,
            Err(TransportError::Io(_))
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn repeated_reports_yield_one_transition() {
        let sim = SimStack::new();
        let manager = manager(&sim);

        assert_eq!(
            manager.apply(ConnectionState::Connected),
            Some(Transition::Connected)
        );
        assert_eq!(manager.apply(ConnectionState::Connected), None);
        assert!(manager.is_connected());
        assert_eq!(
            manager.apply(ConnectionState::Disconnected),
            Some(Transition::Disconnected)
        );
        assert_eq!(manager.apply(ConnectionState::Disconnected), None);
    }

    #[test]
    fn connecting_to_disconnected_is_silent() {
        let sim = SimStack::new();
        let manager = manager(&sim);
        manager.apply(ConnectionState::Connecting);
        assert_eq!(manager.apply(ConnectionState::Disconnected), None);
    }

    #[tokio::test]
    async fn liveness_check_swallows_errors() {
        let sim = SimStack::new();
        sim.add_device("ab1", DeviceKind::AmbientLight);
        let manager = manager(&sim);
        let device = catalog::create_device(21, "ab1", sim.connection()).unwrap();

        assert!(manager.is_device_connected(&device).await);
        sim.set_reachable("ab1", false);
        assert!(!manager.is_device_connected(&device).await);
    }
}
