//! [`StackManager`] – composition root of connection, enumeration and
//! registry, plus the [`StackListener`] hook interface.
//!
//! # Task layout
//!
//! ```text
//!  transport ──mpsc──▶ notification loop ──┬──▶ stack worker      ──▶ connected / disconnected
//!                                          ├──▶ worker "ab1"      ──▶ device_* hooks for ab1
//!                                          └──▶ worker "ab2"      ──▶ device_* hooks for ab2
//! ```
//!
//! The loop itself never runs a hook.  Each uid gets its own worker, created
//! on first sight, so notifications of one device stay ordered while a slow
//! device cannot hold up the others.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tinkerbus_hal::{DeviceHandle, StackConnection, TransportNotification};
use tinkerbus_types::{
    ConnectionState, EnumerationNotification, StackAddress, TinkerError,
};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection_manager::{ConnectionManager, Transition};
use crate::enumeration::{EnumerationHandler, EnumerationOutcome};
use crate::registry::{DeviceRegistry, DeviceSnapshot};

type Notifications = mpsc::UnboundedReceiver<TransportNotification>;

/// Lifecycle hooks supplied by the application.
///
/// Each hook runs at most once per logical transition and never
/// concurrently with another hook for the same uid.  On
/// `device_reconnected` the handle is new: anything bound to the old one
/// must be rebound.
#[async_trait]
pub trait StackListener: Send + Sync {
    async fn connected(&self) {}

    async fn disconnected(&self) {}

    async fn device_connected(&self, _device: &DeviceHandle) {}

    async fn device_reconnected(&self, _device: &DeviceHandle) {}

    async fn device_disconnected(&self, _device: &DeviceHandle) {}
}

struct Shared {
    connection_manager: ConnectionManager,
    registry: Arc<DeviceRegistry>,
    handler: EnumerationHandler,
    listener: Arc<dyn StackListener>,
    /// Per-uid workers currently alive.
    device_workers: AtomicUsize,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<Notifications>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct StackManager {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
    /// Notification receiver handed back by a stopped loop.
    parked: Mutex<Option<Notifications>>,
}

impl StackManager {
    /// Build a manager for `address`. Nothing runs until [`Self::start`] or
    /// [`Self::connect`].
    pub fn new(
        address: StackAddress,
        connection: Arc<dyn StackConnection>,
        listener: Arc<dyn StackListener>,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let handler = EnumerationHandler::new(Arc::clone(&registry), Arc::clone(&connection));
        Self {
            shared: Arc::new(Shared {
                connection_manager: ConnectionManager::new(address, connection),
                registry,
                handler,
                listener,
                device_workers: AtomicUsize::new(0),
            }),
            running: Mutex::new(None),
            parked: Mutex::new(None),
        }
    }

    /// Validate `host:port` and build a manager for it.
    ///
    /// # Errors
    ///
    /// [`TinkerError::InvalidStackAddress`] for a blank host or port `0`.
    pub fn for_endpoint(
        host: impl Into<String>,
        port: u16,
        connection: Arc<dyn StackConnection>,
        listener: Arc<dyn StackListener>,
    ) -> Result<Self, TinkerError> {
        Ok(Self::new(StackAddress::new(host, port)?, connection, listener))
    }

    /// Endpoint this manager connects to.
    pub fn address(&self) -> &StackAddress {
        self.shared.connection_manager.address()
    }

    /// Spawn the notification loop. Calling it again while running is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// [`TinkerError::Config`] when another consumer already took the
    /// transport's notification channel.
    pub fn start(&self) -> Result<(), TinkerError> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return Ok(());
        }
        let notifications = lock(&self.parked)
            .take()
            .or_else(|| self.shared.connection_manager.connection().take_notifications())
            .ok_or_else(|| {
                TinkerError::Config(
                    "transport notifications are already consumed elsewhere".to_string(),
                )
            })?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_notifications(
            Arc::clone(&self.shared),
            notifications,
            cancel.clone(),
        ));
        *running = Some(Running { cancel, task });
        debug!(address = %self.address(), "stack manager started");
        Ok(())
    }

    /// Stop the notification loop and every worker. Hooks in flight are
    /// aborted. The manager can be started again afterwards.
    pub async fn shutdown(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };
        running.cancel.cancel();
        match running.task.await {
            Ok(notifications) => *lock(&self.parked) = Some(notifications),
            Err(err) => warn!(error = %err, "notification loop ended abnormally"),
        }
        debug!(address = %self.address(), "stack manager stopped");
    }

    /// Start if needed, open the connection and wait for it to settle.
    ///
    /// # Errors
    ///
    /// Transport failures other than "already connected".
    pub async fn connect(&self) -> Result<(), TinkerError> {
        self.start()?;
        self.shared.connection_manager.connect().await?;
        Ok(())
    }

    /// Close the connection. Closing an idle connection is success.
    ///
    /// # Errors
    ///
    /// Transport failures other than "not connected".
    pub async fn disconnect(&self) -> Result<(), TinkerError> {
        self.shared.connection_manager.disconnect().await?;
        Ok(())
    }

    /// `true` while the connection state is `Connected`.
    pub fn is_connected(&self) -> bool {
        self.shared.connection_manager.is_connected()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.connection_manager.state()
    }

    /// Receiver that observes every connection state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.connection_manager.subscribe_state()
    }

    /// Liveness check through an identity query. Communication errors
    /// read as `false`.
    pub async fn is_device_connected(&self, device: &DeviceHandle) -> bool {
        self.shared.connection_manager.is_device_connected(device).await
    }

    /// Point-in-time copy of the registry.
    pub fn connected_devices(&self) -> DeviceSnapshot {
        self.shared.registry.snapshot()
    }

    /// Receiver that observes every registry change as a full snapshot.
    pub fn subscribe_devices(&self) -> watch::Receiver<DeviceSnapshot> {
        self.shared.registry.subscribe()
    }
}

impl StackManager {
    #[cfg(test)]
    fn device_worker_count(&self) -> usize {
        self.shared.device_workers.load(Ordering::Relaxed)
    }
}

impl Drop for StackManager {
    fn drop(&mut self) {
        if let Some(running) = lock(&self.running).take() {
            running.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for StackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackManager")
            .field("address", self.address())
            .finish()
    }
}

impl PartialEq for StackManager {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for StackManager {}

impl Hash for StackManager {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tasks
// ────────────────────────────────────────────────────────────────────────────

async fn run_notifications(
    shared: Arc<Shared>,
    mut notifications: Notifications,
    cancel: CancellationToken,
) -> Notifications {
    let mut workers = JoinSet::new();
    let (stack_tx, stack_rx) = mpsc::unbounded_channel();
    workers.spawn(run_stack_worker(Arc::clone(&shared), stack_rx));
    let (retire_tx, mut retired) = mpsc::unbounded_channel::<(String, u64)>();
    let mut device_workers: HashMap<String, DeviceWorker> = HashMap::new();
    let mut next_worker_id = 0u64;

    loop {
        let notification = tokio::select! {
            () = cancel.cancelled() => break,
            Some((uid, id)) = retired.recv() => {
                retire_device_worker(&shared, &mut device_workers, &uid, id);
                continue;
            }
            Some(result) = workers.join_next() => {
                if let Err(err) = result {
                    warn!(error = %err, "worker task ended abnormally");
                }
                continue;
            }
            notification = notifications.recv() => match notification {
                Some(notification) => notification,
                None => break,
            },
        };

        match notification {
            TransportNotification::Connected { reason } => {
                let Some(transition) = shared.connection_manager.apply(ConnectionState::Connected)
                else {
                    debug!(?reason, "duplicate connected notification");
                    continue;
                };
                if let Err(err) = shared.connection_manager.connection().enumerate().await {
                    warn!(error = %err, "enumeration request failed");
                }
                let _ = stack_tx.send(transition);
            }
            TransportNotification::Disconnected { reason } => {
                match shared
                    .connection_manager
                    .apply(ConnectionState::Disconnected)
                {
                    Some(transition) => {
                        let _ = stack_tx.send(transition);
                    }
                    None => debug!(?reason, "duplicate disconnected notification"),
                }
            }
            TransportNotification::Enumerate(notification) => {
                let uid = notification.uid.clone();
                let worker = device_workers.entry(uid.clone()).or_insert_with(|| {
                    next_worker_id += 1;
                    spawn_device_worker(&mut workers, &shared, &uid, next_worker_id, &retire_tx)
                });
                if let Err(mpsc::error::SendError(notification)) = worker.dispatch(notification) {
                    warn!(uid = %uid, "device worker vanished, respawning");
                    next_worker_id += 1;
                    let worker = spawn_device_worker(
                        &mut workers,
                        &shared,
                        &uid,
                        next_worker_id,
                        &retire_tx,
                    );
                    let _ = worker.dispatch(notification);
                    device_workers.insert(uid, worker);
                }
                shared.device_workers.store(device_workers.len(), Ordering::Relaxed);
            }
        }
    }

    workers.shutdown().await;
    shared.device_workers.store(0, Ordering::Relaxed);
    notifications
}

/// Sending side of one per-uid worker.
///
/// `in_flight` counts notifications handed to the worker and not yet fully
/// handled, hooks included.  Only the notification loop sends, so a zero
/// count seen from the loop means the worker sits idle on an empty queue.
struct DeviceWorker {
    id: u64,
    sender: mpsc::UnboundedSender<EnumerationNotification>,
    in_flight: Arc<AtomicUsize>,
}

impl DeviceWorker {
    fn dispatch(
        &self,
        notification: EnumerationNotification,
    ) -> Result<(), mpsc::error::SendError<EnumerationNotification>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.sender.send(notification).inspect_err(|_| {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        })
    }

    fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
    }
}

fn spawn_device_worker(
    workers: &mut JoinSet<()>,
    shared: &Arc<Shared>,
    uid: &str,
    id: u64,
    retire: &mpsc::UnboundedSender<(String, u64)>,
) -> DeviceWorker {
    debug!(uid, id, "spawning device worker");
    let (sender, rx) = mpsc::unbounded_channel();
    let in_flight = Arc::new(AtomicUsize::new(0));
    workers.spawn(run_device_worker(
        Arc::clone(shared),
        uid.to_string(),
        id,
        rx,
        Arc::clone(&in_flight),
        retire.clone(),
    ));
    DeviceWorker {
        id,
        sender,
        in_flight,
    }
}

/// Drop the worker of a departed device unless more work was queued for it
/// in the meantime.  Dropping the sender ends the worker task.
fn retire_device_worker(
    shared: &Shared,
    device_workers: &mut HashMap<String, DeviceWorker>,
    uid: &str,
    id: u64,
) {
    let retire = device_workers
        .get(uid)
        .is_some_and(|worker| worker.id == id && worker.is_idle());
    if retire {
        device_workers.remove(uid);
        shared.device_workers.store(device_workers.len(), Ordering::Relaxed);
        debug!(uid, id, "device worker retired");
    }
}

async fn run_stack_worker(shared: Arc<Shared>, mut transitions: mpsc::UnboundedReceiver<Transition>) {
    while let Some(transition) = transitions.recv().await {
        match transition {
            Transition::Connected => shared.listener.connected().await,
            Transition::Disconnected => shared.listener.disconnected().await,
        }
    }
}

async fn run_device_worker(
    shared: Arc<Shared>,
    uid: String,
    id: u64,
    mut notifications: mpsc::UnboundedReceiver<EnumerationNotification>,
    in_flight: Arc<AtomicUsize>,
    retire: mpsc::UnboundedSender<(String, u64)>,
) {
    while let Some(notification) = notifications.recv().await {
        let departed = match shared.handler.handle(notification).await {
            EnumerationOutcome::Connected(device) => {
                shared.listener.device_connected(&device).await;
                false
            }
            EnumerationOutcome::Reconnected(device) => {
                shared.listener.device_reconnected(&device).await;
                false
            }
            EnumerationOutcome::Disconnected(device) => {
                shared.listener.device_disconnected(&device).await;
                true
            }
            EnumerationOutcome::Ignored => false,
        };
        in_flight.fetch_sub(1, Ordering::SeqCst);
        if departed {
            let _ = retire.send((uid.clone(), id));
        }
    }
    debug!(uid = %uid, id, "device worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tinkerbus_hal::SimStack;
    use tinkerbus_types::{DeviceKind, EnumerationCause};
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Hook {
        Connected { enumerate_requests: usize },
        Disconnected,
        DeviceConnected(String),
        DeviceReconnected(String),
        DeviceDisconnected(String),
    }

    struct Recorder {
        sim: SimStack,
        hooks: mpsc::UnboundedSender<Hook>,
        gate: Option<(String, Arc<Notify>)>,
    }

    #[async_trait]
    impl StackListener for Recorder {
        async fn connected(&self) {
            let enumerate_requests = self.sim.enumerate_requests();
            let _ = self.hooks.send(Hook::Connected { enumerate_requests });
        }

        async fn disconnected(&self) {
            let _ = self.hooks.send(Hook::Disconnected);
        }

        async fn device_connected(&self, device: &DeviceHandle) {
            if let Some((uid, gate)) = &self.gate {
                if uid == device.uid() {
                    gate.notified().await;
                }
            }
            let _ = self.hooks.send(Hook::DeviceConnected(device.uid().to_string()));
        }

        async fn device_reconnected(&self, device: &DeviceHandle) {
            let _ = self.hooks.send(Hook::DeviceReconnected(device.uid().to_string()));
        }

        async fn device_disconnected(&self, device: &DeviceHandle) {
            let _ = self.hooks.send(Hook::DeviceDisconnected(device.uid().to_string()));
        }
    }

    fn setup_with_gate(
        gate: Option<(String, Arc<Notify>)>,
    ) -> (SimStack, StackManager, mpsc::UnboundedReceiver<Hook>) {
        let sim = SimStack::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Arc::new(Recorder {
            sim: sim.clone(),
            hooks: tx,
            gate,
        });
        let manager = StackManager::for_endpoint("localhost", 4223, sim.connection(), listener)
            .unwrap();
        (sim, manager, rx)
    }

    fn setup() -> (SimStack, StackManager, mpsc::UnboundedReceiver<Hook>) {
        setup_with_gate(None)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Hook>) -> Hook {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("hook within timeout")
            .expect("listener alive")
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Hook>) {
        let extra = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert!(extra.is_err(), "unexpected hook: {extra:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn ab1_lifecycle() {
        let (sim, manager, mut hooks) = setup();
        sim.add_device("ab1", DeviceKind::AmbientLight);
        manager.start().unwrap();

        sim.announce("ab1", EnumerationCause::Available);
        assert_eq!(next(&mut hooks).await, Hook::DeviceConnected("ab1".into()));
        assert!(manager.connected_devices().contains_key("ab1"));

        sim.announce("ab1", EnumerationCause::Connected);
        assert_eq!(next(&mut hooks).await, Hook::DeviceReconnected("ab1".into()));
        assert_eq!(manager.connected_devices().len(), 1);

        sim.announce("ab1", EnumerationCause::Disconnected);
        assert_eq!(next(&mut hooks).await, Hook::DeviceDisconnected("ab1".into()));
        assert!(manager.connected_devices().is_empty());
        assert_quiet(&mut hooks).await;
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_available_fires_once() {
        let (sim, manager, mut hooks) = setup();
        sim.add_device("ab1", DeviceKind::AmbientLight);
        manager.start().unwrap();

        sim.announce("ab1", EnumerationCause::Available);
        sim.announce("ab1", EnumerationCause::Available);

        assert_eq!(next(&mut hooks).await, Hook::DeviceConnected("ab1".into()));
        assert_quiet(&mut hooks).await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_enumerates_before_the_connected_hook() {
        let (sim, manager, mut hooks) = setup();
        sim.add_device("ab1", DeviceKind::AmbientLight);

        manager.connect().await.unwrap();

        // Stack and device hooks run on different workers; only the set is fixed.
        let seen = [next(&mut hooks).await, next(&mut hooks).await];
        assert!(seen.contains(&Hook::Connected {
            enumerate_requests: 1
        }));
        assert!(seen.contains(&Hook::DeviceConnected("ab1".into())));
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_connected_notifications_fire_once() {
        let (sim, manager, mut hooks) = setup();
        manager.connect().await.unwrap();
        assert!(matches!(next(&mut hooks).await, Hook::Connected { .. }));

        sim.restore_connection();
        sim.restore_connection();
        sim.drop_connection();

        assert_eq!(next(&mut hooks).await, Hook::Disconnected);
        assert!(!manager.is_connected());
        assert_eq!(sim.enumerate_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_enumeration_still_runs_the_hook() {
        let (sim, manager, mut hooks) = setup();
        sim.fail_enumerate(true);

        manager.connect().await.unwrap();

        assert!(matches!(next(&mut hooks).await, Hook::Connected { .. }));
    }

    async fn wait_for_workers(manager: &StackManager, expected: usize) {
        for _ in 0..100 {
            if manager.device_worker_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "device workers stayed at {}, expected {expected}",
            manager.device_worker_count()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn departed_device_releases_its_worker() {
        let (sim, manager, mut hooks) = setup();
        sim.add_device("ab1", DeviceKind::AmbientLight);
        sim.add_device("ab2", DeviceKind::Temperature);
        manager.start().unwrap();

        sim.announce("ab1", EnumerationCause::Available);
        sim.announce("ab2", EnumerationCause::Available);
        next(&mut hooks).await;
        next(&mut hooks).await;
        assert_eq!(manager.device_worker_count(), 2);

        sim.announce("ab1", EnumerationCause::Disconnected);
        assert_eq!(next(&mut hooks).await, Hook::DeviceDisconnected("ab1".into()));
        wait_for_workers(&manager, 1).await;

        sim.announce("ab1", EnumerationCause::Available);
        assert_eq!(next(&mut hooks).await, Hook::DeviceConnected("ab1".into()));
        assert_eq!(manager.device_worker_count(), 2);
        assert_quiet(&mut hooks).await;
    }

    #[tokio::test(start_paused = true)]
    async fn known_device_reconnects_even_when_it_does_not_answer() {
        let (sim, manager, mut hooks) = setup();
        sim.add_device("ab1", DeviceKind::AmbientLight);
        manager.start().unwrap();
        sim.announce("ab1", EnumerationCause::Available);
        assert_eq!(next(&mut hooks).await, Hook::DeviceConnected("ab1".into()));

        sim.set_reachable("ab1", false);
        sim.announce("ab1", EnumerationCause::Connected);

        assert_eq!(next(&mut hooks).await, Hook::DeviceReconnected("ab1".into()));
        assert!(manager.connected_devices().contains_key("ab1"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_device_does_not_block_others() {
        let gate = Arc::new(Notify::new());
        let (sim, manager, mut hooks) = setup_with_gate(Some(("ab1".into(), Arc::clone(&gate))));
        sim.add_device("ab1", DeviceKind::AmbientLight);
        sim.add_device("ab2", DeviceKind::Temperature);
        manager.start().unwrap();

        sim.announce("ab1", EnumerationCause::Available);
        sim.announce("ab2", EnumerationCause::Available);

        assert_eq!(next(&mut hooks).await, Hook::DeviceConnected("ab2".into()));
        gate.notify_one();
        assert_eq!(next(&mut hooks).await, Hook::DeviceConnected("ab1".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_hooks_and_allows_restart() {
        let (sim, manager, mut hooks) = setup();
        sim.add_device("ab1", DeviceKind::AmbientLight);
        manager.start().unwrap();
        manager.shutdown().await;

        sim.announce("ab1", EnumerationCause::Available);
        assert_quiet(&mut hooks).await;

        manager.start().unwrap();
        assert_eq!(next(&mut hooks).await, Hook::DeviceConnected("ab1".into()));
    }

    #[tokio::test]
    async fn start_is_idempotent_but_needs_the_notifications() {
        let (sim, manager, _hooks) = setup();
        manager.start().unwrap();
        manager.start().unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let other = StackManager::new(
            StackAddress::localhost(),
            sim.connection(),
            Arc::new(Recorder {
                sim: sim.clone(),
                hooks: tx,
                gate: None,
            }),
        );
        assert!(matches!(other.start(), Err(TinkerError::Config(_))));
    }

    #[test]
    fn invalid_endpoint_aborts_construction() {
        let sim = SimStack::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let listener = Arc::new(Recorder {
            sim: sim.clone(),
            hooks: tx,
            gate: None,
        });
        let result = StackManager::for_endpoint(" ", 4223, sim.connection(), listener);
        assert!(matches!(
            result,
            Err(TinkerError::InvalidStackAddress { .. })
        ));
    }

    #[test]
    fn managers_compare_by_address() {
        let (sim, a, _) = setup();
        let (tx, _rx) = mpsc::unbounded_channel();
        let b = StackManager::new(
            StackAddress::new("localhost", 4223).unwrap(),
            sim.connection(),
            Arc::new(Recorder {
                sim: sim.clone(),
                hooks: tx,
                gate: None,
            }),
        );
        assert_eq!(a, b);
        assert_eq!(
            format!("{a:?}"),
            "StackManager { address: StackAddress { host: \"localhost\", port: 4223 } }"
        );
    }
}
