//! [`EnumerationHandler`] – per-uid presence state machine.
//!
//! | cause | uid registered? | action | outcome |
//! |---|---|---|---|
//! | Available | no | validate, create, register | [`EnumerationOutcome::Connected`] |
//! | Available | yes | nothing | [`EnumerationOutcome::Ignored`] |
//! | Connected | no | validate, create, register | [`EnumerationOutcome::Connected`] |
//! | Connected | yes | keep record, treat as reconnection | [`EnumerationOutcome::Reconnected`] |
//! | Disconnected | no | log the anomaly | [`EnumerationOutcome::Ignored`] |
//! | Disconnected | yes | remove record | [`EnumerationOutcome::Disconnected`] |
//!
//! Validation is an identity query through the freshly built handle.  For
//! an unknown uid a failed validation drops the notification: no registry
//! change, no hook.  A known uid that reports `Connected` is always a
//! reconnection; the record's handle is swapped for the fresh one only when
//! the fresh one answers, otherwise the previous handle is handed out again.

use std::sync::Arc;

use tinkerbus_hal::{DeviceHandle, StackConnection, catalog};
use tinkerbus_types::{EnumerationCause, EnumerationNotification};
use tracing::{debug, info, warn};

use crate::registry::{DeviceRecord, DeviceRegistry};

/// What a notification did to the registry, i.e. which hook to fire.
#[derive(Debug, Clone)]
pub enum EnumerationOutcome {
    Connected(DeviceHandle),
    Reconnected(DeviceHandle),
    Disconnected(DeviceHandle),
    Ignored,
}

pub struct EnumerationHandler {
    registry: Arc<DeviceRegistry>,
    connection: Arc<dyn StackConnection>,
}

impl EnumerationHandler {
    /// Handler recording devices in `registry`, validating them over
    /// `connection`.
    pub fn new(registry: Arc<DeviceRegistry>, connection: Arc<dyn StackConnection>) -> Self {
        Self {
            registry,
            connection,
        }
    }

    /// Apply one notification. Callers must serialise notifications of the
    /// same uid.
    pub async fn handle(&self, notification: EnumerationNotification) -> EnumerationOutcome {
        let uid = notification.uid.as_str();
        let known = self.registry.contains(uid);
        match (notification.cause, known) {
            (EnumerationCause::Available, true) => {
                debug!(uid, "device already registered");
                EnumerationOutcome::Ignored
            }
            (EnumerationCause::Available | EnumerationCause::Connected, false) => {
                match self.validated_handle(&notification).await {
                    Some(handle) => {
                        self.registry.insert(DeviceRecord::new(handle.clone()));
                        info!(uid, kind = %handle.kind(), "device connected");
                        EnumerationOutcome::Connected(handle)
                    }
                    None => EnumerationOutcome::Ignored,
                }
            }
            (EnumerationCause::Connected, true) => {
                match self.validated_handle(&notification).await {
                    Some(handle) => {
                        self.registry.insert(DeviceRecord::new(handle.clone()));
                        info!(uid, kind = %handle.kind(), "device reconnected");
                        EnumerationOutcome::Reconnected(handle)
                    }
                    None => match self.registry.get(uid) {
                        Some(record) => {
                            info!(
                                uid,
                                kind = %record.kind,
                                "device reconnected, keeping the previous handle"
                            );
                            EnumerationOutcome::Reconnected(record.handle)
                        }
                        None => EnumerationOutcome::Ignored,
                    },
                }
            }
            (EnumerationCause::Disconnected, _) => match self.registry.remove(uid) {
                Some(record) => {
                    info!(uid, kind = %record.kind, "device disconnected");
                    EnumerationOutcome::Disconnected(record.handle)
                }
                None => {
                    warn!(uid, "disconnect reported for a device that was never registered");
                    EnumerationOutcome::Ignored
                }
            },
        }
    }

    /// Build a handle through the catalog and confirm it answers.
    async fn validated_handle(&self, notification: &EnumerationNotification) -> Option<DeviceHandle> {
        let uid = notification.uid.as_str();
        let Some(handle) = catalog::create_device(
            notification.device_identifier,
            uid,
            Arc::clone(&self.connection),
        ) else {
            debug!(
                uid,
                device_identifier = notification.device_identifier,
                "unsupported device kind"
            );
            return None;
        };

        match handle.identity().await {
            Ok(identity) if identity.device_identifier == notification.device_identifier => {
                Some(handle)
            }
            Ok(identity) => {
                warn!(
                    uid,
                    announced = notification.device_identifier,
                    reported = identity.device_identifier,
                    "identity does not match the enumeration"
                );
                None
            }
            Err(err) => {
                warn!(uid, error = %err, "identity validation failed");
                None
            }
        }
    }
}
