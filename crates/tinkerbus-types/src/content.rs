//! Content classes, content values and the per-device content snapshot.
//!
//! A *content class* names one category of settings or telemetry for a
//! device (`illuminance_threshold`, `temperature_value`, …).  The set is
//! open: a class nobody understands deserializes fine and is then ignored,
//! which keeps older services compatible with newer senders.
//!
//! Values are open too. A settings entry whose value has a shape this crate
//! does not know (`{"type": "rgb", ...}`) is dropped while the rest of the
//! batch deserializes normally.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};

use crate::enumeration::DeviceKind;

/// Name of a settings or telemetry category.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentClass(Cow<'static, str>);

impl ContentClass {
    /// Build a class from a static name; usable in `const` items.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Condition under which a threshold callback fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOption {
    Off,
    Outside,
    Inside,
    Smaller,
    Greater,
}

impl ThresholdOption {
    /// Character sent to the device.
    pub fn as_char(self) -> char {
        match self {
            Self::Off => 'x',
            Self::Outside => 'o',
            Self::Inside => 'i',
            Self::Smaller => '<',
            Self::Greater => '>',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'x' => Some(Self::Off),
            'o' => Some(Self::Outside),
            'i' => Some(Self::Inside),
            '<' => Some(Self::Smaller),
            '>' => Some(Self::Greater),
            _ => None,
        }
    }
}

/// Threshold configuration for a "value reached" callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackThreshold {
    pub option: ThresholdOption,
    pub min: i32,
    pub max: i32,
}

/// Value carried by one content class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ContentValue {
    /// A period in milliseconds (callback periods, debounce period).
    Period(u32),
    Threshold(CallbackThreshold),
    /// A raw reading in the device's native unit.
    Reading(i32),
}

/// A batch of requested settings keyed by content class.
///
/// An entry may be present with no value (`null` on the wire); such entries
/// are carried along but never applied to a device. Entries whose value is
/// not a known [`ContentValue`] are dropped on deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Settings(BTreeMap<ContentClass, Option<ContentValue>>);

/// Wire form of one settings value, accepting shapes we cannot interpret.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireValue {
    Known(ContentValue),
    Unknown(IgnoredAny),
}

impl<'de> Deserialize<'de> for Settings {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = BTreeMap::<ContentClass, Option<WireValue>>::deserialize(deserializer)?;
        Ok(wire
            .into_iter()
            .filter_map(|(class, value)| match value {
                None => Some((class, None)),
                Some(WireValue::Known(value)) => Some((class, Some(value))),
                Some(WireValue::Unknown(_)) => None,
            })
            .collect())
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, class: ContentClass, value: Option<ContentValue>) -> Self {
        self.insert(class, value);
        self
    }

    pub fn insert(&mut self, class: ContentClass, value: Option<ContentValue>) {
        self.0.insert(class, value);
    }

    /// `true` when the class is present, even with a `null` value.
    pub fn contains(&self, class: &ContentClass) -> bool {
        self.0.contains_key(class)
    }

    /// Value for `class`; `None` when absent or present-but-null.
    pub fn value(&self, class: &ContentClass) -> Option<&ContentValue> {
        self.0.get(class).and_then(Option::as_ref)
    }

    /// Period value for `class`, if present, non-null and of the right shape.
    pub fn period(&self, class: &ContentClass) -> Option<u32> {
        match self.value(class) {
            Some(ContentValue::Period(ms)) => Some(*ms),
            _ => None,
        }
    }

    /// Threshold value for `class`, if present, non-null and of the right shape.
    pub fn threshold(&self, class: &ContentClass) -> Option<CallbackThreshold> {
        match self.value(class) {
            Some(ContentValue::Threshold(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ContentClass, Option<&ContentValue>)> {
        self.0.iter().map(|(class, value)| (class, value.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(ContentClass, Option<ContentValue>)> for Settings {
    fn from_iter<I: IntoIterator<Item = (ContentClass, Option<ContentValue>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Last known state of one device: applied settings and received emissions.
///
/// Owned by the device's service; copied whole into every outbound event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceContent {
    pub uid: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub settings: BTreeMap<ContentClass, ContentValue>,
    #[serde(default)]
    pub emissions: BTreeMap<ContentClass, ContentValue>,
}

impl DeviceContent {
    pub fn new(uid: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            uid: uid.into(),
            kind,
            settings: BTreeMap::new(),
            emissions: BTreeMap::new(),
        }
    }

    /// Record a setting that the device accepted.
    pub fn update_setting(&mut self, class: ContentClass, value: ContentValue) {
        self.settings.insert(class, value);
    }

    /// Record a value the device emitted.
    pub fn update_emission(&mut self, class: ContentClass, value: ContentValue) {
        self.emissions.insert(class, value);
    }

    pub fn setting(&self, class: &ContentClass) -> Option<&ContentValue> {
        self.settings.get(class)
    }

    pub fn emission(&self, class: &ContentClass) -> Option<&ContentValue> {
        self.emissions.get(class)
    }

    /// All accepted settings as a batch, e.g. to replay them on a fresh handle.
    pub fn settings_batch(&self) -> Settings {
        self.settings
            .iter()
            .map(|(class, value)| (class.clone(), Some(*value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: ContentClass = ContentClass::from_static("illuminance_threshold");
    const PERIOD: ContentClass = ContentClass::from_static("illuminance_callback_period");

    #[test]
    fn null_entry_is_present_but_has_no_value() {
        let settings = Settings::new().with(THRESHOLD, None);
        assert!(settings.contains(&THRESHOLD));
        assert!(settings.value(&THRESHOLD).is_none());
        assert!(settings.threshold(&THRESHOLD).is_none());
    }

    #[test]
    fn typed_accessors_reject_mismatched_shapes() {
        let settings = Settings::new().with(PERIOD, Some(ContentValue::Reading(3)));
        assert!(settings.period(&PERIOD).is_none());

        let settings = Settings::new().with(PERIOD, Some(ContentValue::Period(250)));
        assert_eq!(settings.period(&PERIOD), Some(250));
    }

    #[test]
    fn unknown_classes_deserialize() {
        let json = r#"{
            "illuminance_callback_period": {"type": "period", "value": 1000},
            "illuminance_threshold": null,
            "some_future_class": {"type": "reading", "value": 7}
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.len(), 3);
        assert_eq!(settings.period(&PERIOD), Some(1000));
        assert!(settings.contains(&THRESHOLD));
        assert!(settings.contains(&ContentClass::new("some_future_class")));
    }

    #[test]
    fn unknown_value_shape_is_dropped_without_losing_the_batch() {
        let json = r#"{
            "colour": {"type": "rgb", "value": {"r": 1, "g": 2, "b": 3}},
            "debounce_period": {"type": "period", "value": 200},
            "illuminance_callback_period": "fast"
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.len(), 1);
        assert!(!settings.contains(&ContentClass::new("colour")));
        assert!(!settings.contains(&PERIOD));
        assert_eq!(
            settings.period(&ContentClass::from_static("debounce_period")),
            Some(200)
        );
    }

    #[test]
    fn threshold_value_json_shape() {
        let value = ContentValue::Threshold(CallbackThreshold {
            option: ThresholdOption::Outside,
            min: 10,
            max: 200,
        });
        let json = serde_json::to_value(value).unwrap();
        assert_eq!(json["type"], "threshold");
        assert_eq!(json["value"]["option"], "outside");
        assert_eq!(json["value"]["max"], 200);
    }

    #[test]
    fn threshold_option_chars() {
        for option in [
            ThresholdOption::Off,
            ThresholdOption::Outside,
            ThresholdOption::Inside,
            ThresholdOption::Smaller,
            ThresholdOption::Greater,
        ] {
            assert_eq!(ThresholdOption::from_char(option.as_char()), Some(option));
        }
        assert_eq!(ThresholdOption::from_char('?'), None);
    }

    #[test]
    fn settings_batch_replays_accepted_settings() {
        let mut content = DeviceContent::new("ab1", DeviceKind::AmbientLight);
        content.update_setting(PERIOD, ContentValue::Period(500));
        content.update_emission(
            ContentClass::from_static("illuminance_value"),
            ContentValue::Reading(1200),
        );

        let batch = content.settings_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.period(&PERIOD), Some(500));
    }
}
