//! The device-service adapter.
//!
//! A [`DeviceService`] wraps one managed device, owns its last known
//! [`DeviceContent`] and talks to the bus in both directions:
//!
//! ```text
//!   Intent ──▶ update_settings_on_device ──▶ device setters ──▶ content.settings ──▶ Event
//!   device callback ──▶ content.emissions ──────────────────────────────────────────▶ Event
//! ```
//!
//! Everything kind-specific lives behind [`ManagedDevice`]: which settings a
//! device understands, how its callbacks map to emission classes and what an
//! intent may trigger beyond plain settings.  Unknown content classes are
//! never looked at.
//!
//! Device errors stop at this boundary.  Each failed call is logged and
//! skipped; the rest of the batch still runs and nothing is published as a
//! failure.

use std::sync::Arc;

use async_trait::async_trait;
use tinkerbus_hal::{Device, DeviceHandle};
use tinkerbus_types::{
    CallbackThreshold, ContentClass, ContentValue, DeviceContent, DeviceError, DeviceKind,
    Event, Intent, Settings,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, TopicReceiver};

/// Prefix of every service id.
pub const SERVICE_PREFIX: &str = "tinkerbus";

/// Id under which the service for `uid` publishes, e.g.
/// `tinkerbus/ambient_light/ab1`.
pub fn service_id(kind: DeviceKind, uid: &str) -> String {
    format!("{SERVICE_PREFIX}/{kind}/{uid}")
}

/// Typed callback stream of one device.
#[async_trait]
pub trait CallbackStream: Send + 'static {
    type Item: Send + std::fmt::Debug;

    /// Next callback; `None` once the transport is gone.
    async fn next_callback(&mut self) -> Option<Self::Item>;
}

/// Kind-specific half of a device service.
#[async_trait]
pub trait ManagedDevice: Device + Sized + 'static {
    type Callbacks: CallbackStream;

    /// Extract this kind from a tagged handle.
    fn from_handle(handle: &DeviceHandle) -> Option<Arc<Self>>;

    fn callbacks(&self) -> Self::Callbacks;

    /// Apply every present, non-null setting this kind understands and
    /// record the accepted ones in `content`. Returns how many calls
    /// succeeded.
    async fn apply_settings(&self, settings: &Settings, content: &mut DeviceContent) -> usize;

    /// Emission class and value carried by `callback`.
    fn emission(callback: &<Self::Callbacks as CallbackStream>::Item) -> (ContentClass, ContentValue);

    /// Extra per-kind reaction to an intent. Returns `true` when `content`
    /// changed.
    async fn handle_intent(&self, _intent: &Intent, _content: &mut DeviceContent) -> bool {
        false
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings helpers
// ─────────────────────────────────────────────────────────────────────────────

fn shape_mismatch(settings: &Settings, class: &ContentClass) {
    if let Some(value) = settings.value(class) {
        debug!(%class, ?value, "ignoring setting of unexpected shape");
    }
}

/// Period setting for `class`, if present and well-formed.
pub fn period_setting(settings: &Settings, class: &ContentClass) -> Option<u32> {
    let period = settings.period(class);
    if period.is_none() {
        shape_mismatch(settings, class);
    }
    period
}

/// Threshold setting for `class`, if present and well-formed.
pub fn threshold_setting(settings: &Settings, class: &ContentClass) -> Option<CallbackThreshold> {
    let threshold = settings.threshold(class);
    if threshold.is_none() {
        shape_mismatch(settings, class);
    }
    threshold
}

/// Record the outcome of one settings call. Returns `true` on success.
pub fn record_setting(
    content: &mut DeviceContent,
    class: &ContentClass,
    value: ContentValue,
    result: Result<(), DeviceError>,
) -> bool {
    match result {
        Ok(()) => {
            content.update_setting(class.clone(), value);
            true
        }
        Err(err) => {
            warn!(
                uid = %content.uid,
                %class,
                recoverable = err.is_recoverable(),
                error = %err,
                "settings call failed"
            );
            false
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DeviceService
// ─────────────────────────────────────────────────────────────────────────────

pub struct DeviceService<D: ManagedDevice> {
    id: String,
    device: Arc<D>,
    content: DeviceContent,
    bus: EventBus,
}

impl<D: ManagedDevice> std::fmt::Debug for DeviceService<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceService")
            .field("id", &self.id)
            .field("content", &self.content)
            .finish_non_exhaustive()
    }
}

impl<D: ManagedDevice> DeviceService<D> {
    pub fn new(device: Arc<D>, bus: EventBus) -> Self {
        let kind = device.kind();
        let uid = device.uid().to_string();
        Self {
            id: service_id(kind, &uid),
            content: DeviceContent::new(uid, kind),
            device,
            bus,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn content(&self) -> &DeviceContent {
        &self.content
    }

    /// Snapshot event of the current content.
    pub fn create_event(&self) -> Event {
        Event::new(self.content.clone(), self.id.clone())
    }

    /// Intent carrying the settings of `content`, sent by `agent`.
    pub fn create_intent(content: &DeviceContent, agent: &str) -> Intent {
        Intent::new(content, agent)
    }

    fn publish(&self) {
        let delivered = self.bus.publish_event(self.create_event());
        debug!(service = %self.id, delivered, "event published");
    }

    /// Apply a settings batch. Returns how many calls succeeded.
    pub async fn update_settings_on_device(&mut self, settings: &Settings) -> usize {
        if settings.is_empty() {
            return 0;
        }
        self.device.apply_settings(settings, &mut self.content).await
    }

    /// Route an intent. Publishes one event when it changed anything.
    pub async fn handle_intent(&mut self, intent: &Intent) {
        if intent.kind != self.content.kind || !intent.is_addressed_to(&self.content.uid, &self.id)
        {
            return;
        }
        debug!(service = %self.id, intent = %intent.id, sender = %intent.sender, "intent received");

        let applied = self.update_settings_on_device(&intent.settings).await;
        let changed = self.device.handle_intent(intent, &mut self.content).await;
        if applied > 0 || changed {
            self.publish();
        }
    }

    /// Fold one callback into the content and publish the snapshot.
    pub fn handle_callback(&mut self, callback: &<D::Callbacks as CallbackStream>::Item) {
        let (class, value) = D::emission(callback);
        self.content.update_emission(class, value);
        self.publish();
    }

    /// Switch to a fresh handle after the device reappeared and replay the
    /// accepted settings on it.
    pub async fn rebind(&mut self, device: Arc<D>) {
        self.device = device;
        let replay = self.content.settings_batch();
        let applied = self.update_settings_on_device(&replay).await;
        info!(service = %self.id, replayed = applied, of = replay.len(), "service rebound");
    }

    /// Service loop: callbacks, intents and rebinds until cancelled.
    pub async fn run(
        mut self,
        mut intents: TopicReceiver<Intent>,
        mut rebinds: mpsc::UnboundedReceiver<DeviceHandle>,
        cancel: CancellationToken,
    ) {
        let mut callbacks = self.device.callbacks();
        info!(service = %self.id, "service started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                callback = callbacks.next_callback() => match callback {
                    Some(callback) => self.handle_callback(&callback),
                    None => {
                        debug!(service = %self.id, "callback stream closed");
                        break;
                    }
                },
                intent = intents.recv() => match intent {
                    Some(intent) => self.handle_intent(&intent).await,
                    None => break,
                },
                handle = rebinds.recv() => match handle {
                    Some(handle) => match D::from_handle(&handle) {
                        Some(device) => {
                            callbacks = device.callbacks();
                            self.rebind(device).await;
                        }
                        None => warn!(
                            service = %self.id,
                            kind = %handle.kind(),
                            "rebind with a handle of another kind"
                        ),
                    },
                    None => break,
                },
            }
        }
        info!(service = %self.id, "service stopped");
    }
}
