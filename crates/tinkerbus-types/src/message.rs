//! Bus envelopes: inbound [`Intent`]s and outbound [`Event`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::content::{DeviceContent, Settings};
use crate::enumeration::DeviceKind;

/// Command addressed to one device's settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub kind: DeviceKind,
    /// UID of the target device.
    pub uid: String,
    /// Identifier of the agent that sent the intent.
    pub sender: String,
    /// Service ids the intent is meant for; empty means "whoever owns `uid`".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub settings: Settings,
}

impl Intent {
    /// Build an intent carrying the settings of `content`.
    pub fn new(content: &DeviceContent, sender: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind: content.kind,
            uid: content.uid.clone(),
            sender: sender.into(),
            recipients: Vec::new(),
            settings: content.settings_batch(),
        }
    }

    /// Replace the settings batch.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Restrict delivery to the given service ids.
    pub fn with_recipients<I, S>(mut self, recipients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recipients = recipients.into_iter().map(Into::into).collect();
        self
    }

    /// `true` when this intent should be handled by `service_id` owning `uid`.
    pub fn is_addressed_to(&self, uid: &str, service_id: &str) -> bool {
        self.uid == uid
            && (self.recipients.is_empty() || self.recipients.iter().any(|r| r == service_id))
    }
}

/// Full snapshot of one device's state, published after every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: DeviceKind,
    /// Id of the emitting service, e.g. `"tinkerbus/ambient_light/ab1"`.
    pub sender: String,
    pub content: DeviceContent,
}

impl Event {
    pub fn new(content: DeviceContent, sender: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind: content.kind,
            sender: sender.into(),
            content,
        }
    }
}
