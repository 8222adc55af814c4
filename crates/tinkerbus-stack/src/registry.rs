//! [`DeviceRegistry`] – uid → live device record.
//!
//! Backed by a `watch` channel holding the whole map: the enumeration
//! workers are the only writers (each uid owned by exactly one worker) and
//! readers always clone a consistent snapshot.  A present uid always
//! denotes a device whose identity has been confirmed.

use std::collections::BTreeMap;

use tinkerbus_hal::DeviceHandle;
use tinkerbus_types::DeviceKind;
use tokio::sync::watch;

/// One registered device. `handle` is swapped on reconnection; `uid` and
/// `kind` never change.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub uid: String,
    pub kind: DeviceKind,
    pub handle: DeviceHandle,
}

impl DeviceRecord {
    /// Record for `handle`, taking uid and kind from it.
    pub fn new(handle: DeviceHandle) -> Self {
        Self {
            uid: handle.uid().to_string(),
            kind: handle.kind(),
            handle,
        }
    }
}

/// Registry contents keyed by uid.
pub type DeviceSnapshot = BTreeMap<String, DeviceRecord>;

/// Live mapping uid → [`DeviceRecord`].
#[derive(Debug)]
pub struct DeviceRegistry {
    records: watch::Sender<DeviceSnapshot>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            records: watch::Sender::new(DeviceSnapshot::new()),
        }
    }

    /// Point-in-time copy of every record.
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.records.borrow().clone()
    }

    /// Receiver that wakes on every registry change.
    pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.records.subscribe()
    }

    /// Copy of the record for `uid`, if registered.
    pub fn get(&self, uid: &str) -> Option<DeviceRecord> {
        self.records.borrow().get(uid).cloned()
    }

    /// `true` when `uid` is registered.
    pub fn contains(&self, uid: &str) -> bool {
        self.records.borrow().contains_key(uid)
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.borrow().is_empty()
    }

    /// Insert or replace the record for `record.uid`; returns the previous one.
    pub(crate) fn insert(&self, record: DeviceRecord) -> Option<DeviceRecord> {
        let mut previous = None;
        self.records.send_modify(|records| {
            previous = records.insert(record.uid.clone(), record);
        });
        previous
    }

    /// Remove the record for `uid`. Observers are only woken when something
    /// was removed.
    pub(crate) fn remove(&self, uid: &str) -> Option<DeviceRecord> {
        let mut removed = None;
        self.records.send_if_modified(|records| {
            removed = records.remove(uid);
            removed.is_some()
        });
        removed
    }
}
