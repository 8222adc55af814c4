//! [`ServiceManager`] – the [`StackListener`] that keeps one running
//! [`DeviceService`] per registered device.
//!
//! | Hook | Effect |
//! |---|---|
//! | `device_connected` | spawn a service for the handle's kind |
//! | `device_reconnected` | hand the new handle to the running service (spawn one if none runs) |
//! | `device_disconnected` | stop and drop the service |
//! | `connected` / `disconnected` | logged only; services outlive link drops |

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tinkerbus_hal::{AmbientLight, DeviceHandle, Temperature};
use tinkerbus_stack::StackListener;
use tinkerbus_types::DeviceKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::service::{DeviceService, ManagedDevice};

struct ServiceEntry {
    id: String,
    rebind: mpsc::UnboundedSender<DeviceHandle>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ServiceEntry {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(service = %self.id, error = %err, "service task ended abnormally");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ServiceManager {
    bus: EventBus,
    cancel: CancellationToken,
    services: Mutex<HashMap<String, ServiceEntry>>,
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("services", &self.service_ids())
            .finish_non_exhaustive()
    }
}

impl ServiceManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            cancel: CancellationToken::new(),
            services: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Ids of the running services, sorted.
    pub fn service_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.services)
            .values()
            .map(|entry| entry.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Stop every service.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let entries: Vec<ServiceEntry> = lock(&self.services).drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.stop().await;
        }
    }

    fn spawn_for(&self, handle: &DeviceHandle) -> Option<ServiceEntry> {
        match handle.kind() {
            DeviceKind::AmbientLight => self.spawn::<AmbientLight>(handle),
            DeviceKind::Temperature => self.spawn::<Temperature>(handle),
        }
    }

    fn spawn<D: ManagedDevice>(&self, handle: &DeviceHandle) -> Option<ServiceEntry> {
        let device = D::from_handle(handle)?;
        let service = DeviceService::new(device, self.bus.clone());
        let id = service.id().to_string();
        let (rebind, rebinds) = mpsc::unbounded_channel();
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(service.run(self.bus.subscribe_intents(), rebinds, cancel.clone()));
        Some(ServiceEntry {
            id,
            rebind,
            cancel,
            task,
        })
    }

    fn start_service(&self, handle: &DeviceHandle) -> Option<ServiceEntry> {
        let Some(entry) = self.spawn_for(handle) else {
            warn!(uid = %handle.uid(), kind = %handle.kind(), "no service for device");
            return None;
        };
        info!(service = %entry.id, "service created");
        lock(&self.services).insert(handle.uid().to_string(), entry)
    }
}

#[async_trait]
impl StackListener for ServiceManager {
    async fn connected(&self) {
        info!("stack connected");
    }

    async fn disconnected(&self) {
        info!(services = lock(&self.services).len(), "stack disconnected, services kept");
    }

    async fn device_connected(&self, device: &DeviceHandle) {
        if let Some(stale) = self.start_service(device) {
            stale.stop().await;
        }
    }

    async fn device_reconnected(&self, device: &DeviceHandle) {
        let delivered = lock(&self.services)
            .get(device.uid())
            .is_some_and(|entry| entry.rebind.send(device.clone()).is_ok());
        if !delivered {
            if let Some(stale) = self.start_service(device) {
                stale.stop().await;
            }
        }
    }

    async fn device_disconnected(&self, device: &DeviceHandle) {
        let entry = lock(&self.services).remove(device.uid());
        if let Some(entry) = entry {
            info!(service = %entry.id, "service removed");
            entry.stop().await;
        }
    }
}
