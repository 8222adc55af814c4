//! Ambient light service.
//!
//! | Content class | Direction | Value |
//! |---|---|---|
//! | `illuminance_callback_period` | setting | period |
//! | `analog_value_callback_period` | setting | period |
//! | `illuminance_threshold` | setting | threshold |
//! | `analog_value_threshold` | setting | threshold |
//! | `debounce_period` | setting | period |
//! | `illuminance_value` | emission | reading, 1/10 lux |
//! | `analog_value` | emission | reading, raw ADC |
//!
//! An intent that lists `illuminance_value` or `analog_value` (with a `null`
//! value) asks for a one-shot read: the service queries the device once and
//! publishes the result.

use std::sync::Arc;

use async_trait::async_trait;
use tinkerbus_hal::{AmbientLight, AmbientLightCallback, AmbientLightCallbacks, DeviceHandle};
use tinkerbus_types::{ContentClass, ContentValue, DeviceContent, Intent, Settings};
use tracing::warn;

use crate::service::{
    CallbackStream, DeviceService, ManagedDevice, period_setting, record_setting,
    threshold_setting,
};

pub const ILLUMINANCE_CALLBACK_PERIOD: ContentClass =
    ContentClass::from_static("illuminance_callback_period");
pub const ANALOG_VALUE_CALLBACK_PERIOD: ContentClass =
    ContentClass::from_static("analog_value_callback_period");
pub const ILLUMINANCE_THRESHOLD: ContentClass = ContentClass::from_static("illuminance_threshold");
pub const ANALOG_VALUE_THRESHOLD: ContentClass = ContentClass::from_static("analog_value_threshold");
pub const DEBOUNCE_PERIOD: ContentClass = ContentClass::from_static("debounce_period");
pub const ILLUMINANCE_VALUE: ContentClass = ContentClass::from_static("illuminance_value");
pub const ANALOG_VALUE: ContentClass = ContentClass::from_static("analog_value");

pub type AmbientLightService = DeviceService<AmbientLight>;

#[async_trait]
impl CallbackStream for AmbientLightCallbacks {
    type Item = AmbientLightCallback;

    async fn next_callback(&mut self) -> Option<AmbientLightCallback> {
        self.recv().await
    }
}

#[async_trait]
impl ManagedDevice for AmbientLight {
    type Callbacks = AmbientLightCallbacks;

    fn from_handle(handle: &DeviceHandle) -> Option<Arc<Self>> {
        match handle {
            DeviceHandle::AmbientLight(device) => Some(Arc::clone(device)),
            _ => None,
        }
    }

    fn callbacks(&self) -> AmbientLightCallbacks {
        self.subscribe()
    }

    async fn apply_settings(&self, settings: &Settings, content: &mut DeviceContent) -> usize {
        let mut applied = 0;

        if let Some(period) = period_setting(settings, &ANALOG_VALUE_CALLBACK_PERIOD) {
            let result = self.set_analog_value_callback_period(period).await;
            applied += usize::from(record_setting(
                content,
                &ANALOG_VALUE_CALLBACK_PERIOD,
                ContentValue::Period(period),
                result,
            ));
        }
        if let Some(threshold) = threshold_setting(settings, &ANALOG_VALUE_THRESHOLD) {
            let result = self.set_analog_value_callback_threshold(threshold).await;
            applied += usize::from(record_setting(
                content,
                &ANALOG_VALUE_THRESHOLD,
                ContentValue::Threshold(threshold),
                result,
            ));
        }
        if let Some(period) = period_setting(settings, &DEBOUNCE_PERIOD) {
            let result = self.set_debounce_period(period).await;
            applied += usize::from(record_setting(
                content,
                &DEBOUNCE_PERIOD,
                ContentValue::Period(period),
                result,
            ));
        }
        if let Some(threshold) = threshold_setting(settings, &ILLUMINANCE_THRESHOLD) {
            let result = self.set_illuminance_callback_threshold(threshold).await;
            applied += usize::from(record_setting(
                content,
                &ILLUMINANCE_THRESHOLD,
                ContentValue::Threshold(threshold),
                result,
            ));
        }
        if let Some(period) = period_setting(settings, &ILLUMINANCE_CALLBACK_PERIOD) {
            let result = self.set_illuminance_callback_period(period).await;
            applied += usize::from(record_setting(
                content,
                &ILLUMINANCE_CALLBACK_PERIOD,
                ContentValue::Period(period),
                result,
            ));
        }

        applied
    }

    fn emission(callback: &AmbientLightCallback) -> (ContentClass, ContentValue) {
        match *callback {
            AmbientLightCallback::Illuminance(value)
            | AmbientLightCallback::IlluminanceReached(value) => {
                (ILLUMINANCE_VALUE, ContentValue::Reading(i32::from(value)))
            }
            AmbientLightCallback::AnalogValue(value)
            | AmbientLightCallback::AnalogValueReached(value) => {
                (ANALOG_VALUE, ContentValue::Reading(i32::from(value)))
            }
        }
    }

    async fn handle_intent(&self, intent: &Intent, content: &mut DeviceContent) -> bool {
        let mut changed = false;
        if intent.settings.contains(&ILLUMINANCE_VALUE) {
            match self.illuminance().await {
                Ok(value) => {
                    content.update_emission(ILLUMINANCE_VALUE, ContentValue::Reading(i32::from(value)));
                    changed = true;
                }
                Err(err) => warn!(uid = %content.uid, error = %err, "illuminance read failed"),
            }
        }
        if intent.settings.contains(&ANALOG_VALUE) {
            match self.analog_value().await {
                Ok(value) => {
                    content.update_emission(ANALOG_VALUE, ContentValue::Reading(i32::from(value)));
                    changed = true;
                }
                Err(err) => warn!(uid = %content.uid, error = %err, "analog value read failed"),
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use std::time::Duration;
    use tinkerbus_hal::SimStack;
    use tinkerbus_types::{
        CallbackThreshold, DeviceError, DeviceKind, ThresholdOption,
    };
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    const SET_ILLUMINANCE_CALLBACK_PERIOD: u8 = 3;
    const SET_ANALOG_VALUE_CALLBACK_PERIOD: u8 = 5;
    const SET_ILLUMINANCE_CALLBACK_THRESHOLD: u8 = 7;
    const SET_DEBOUNCE_PERIOD: u8 = 11;

    fn service(sim: &SimStack, bus: &EventBus) -> AmbientLightService {
        sim.add_device("ab1", DeviceKind::AmbientLight);
        let device = Arc::new(AmbientLight::new("ab1", sim.connection()).unwrap());
        DeviceService::new(device, bus.clone())
    }

    fn function_ids(sim: &SimStack) -> Vec<u8> {
        sim.calls("ab1").iter().map(|r| r.function_id).collect()
    }

    #[tokio::test]
    async fn null_threshold_issues_no_call() {
        let sim = SimStack::new();
        let bus = EventBus::default();
        let mut service = service(&sim, &bus);

        let applied = service
            .update_settings_on_device(&Settings::new().with(ILLUMINANCE_THRESHOLD, None))
            .await;

        assert_eq!(applied, 0);
        assert!(sim.calls("ab1").is_empty());
        assert!(service.content().settings.is_empty());
    }

    #[tokio::test]
    async fn partial_batch_touches_only_present_classes() {
        let sim = SimStack::new();
        let bus = EventBus::default();
        let mut service = service(&sim, &bus);

        service
            .update_settings_on_device(
                &Settings::new().with(DEBOUNCE_PERIOD, Some(ContentValue::Period(100))),
            )
            .await;

        assert_eq!(function_ids(&sim), vec![SET_DEBOUNCE_PERIOD]);
        assert_eq!(service.content().settings.len(), 1);
    }

    #[tokio::test]
    async fn failure_does_not_stop_the_batch() {
        let sim = SimStack::new();
        let bus = EventBus::default();
        let mut service = service(&sim, &bus);
        sim.fail_function(
            "ab1",
            SET_ANALOG_VALUE_CALLBACK_PERIOD,
            DeviceError::Timeout {
                uid: "ab1".into(),
                function_id: SET_ANALOG_VALUE_CALLBACK_PERIOD,
            },
        );
        let threshold = CallbackThreshold {
            option: ThresholdOption::Greater,
            min: 500,
            max: 0,
        };

        let applied = service
            .update_settings_on_device(
                &Settings::new()
                    .with(ANALOG_VALUE_CALLBACK_PERIOD, Some(ContentValue::Period(1000)))
                    .with(ILLUMINANCE_THRESHOLD, Some(ContentValue::Threshold(threshold)))
                    .with(ILLUMINANCE_CALLBACK_PERIOD, Some(ContentValue::Period(250))),
            )
            .await;

        assert_eq!(applied, 2);
        assert_eq!(
            function_ids(&sim),
            vec![
                SET_ANALOG_VALUE_CALLBACK_PERIOD,
                SET_ILLUMINANCE_CALLBACK_THRESHOLD,
                SET_ILLUMINANCE_CALLBACK_PERIOD
            ]
        );
        let content = service.content();
        assert!(content.setting(&ANALOG_VALUE_CALLBACK_PERIOD).is_none());
        assert_eq!(
            content.setting(&ILLUMINANCE_THRESHOLD),
            Some(&ContentValue::Threshold(threshold))
        );
    }

    #[tokio::test]
    async fn lost_connection_mid_batch_skips_only_that_setting() {
        let sim = SimStack::new();
        let bus = EventBus::default();
        let mut service = service(&sim, &bus);
        sim.fail_function("ab1", SET_DEBOUNCE_PERIOD, DeviceError::NotConnected);

        let applied = service
            .update_settings_on_device(
                &Settings::new()
                    .with(ANALOG_VALUE_CALLBACK_PERIOD, Some(ContentValue::Period(1000)))
                    .with(DEBOUNCE_PERIOD, Some(ContentValue::Period(100)))
                    .with(ILLUMINANCE_CALLBACK_PERIOD, Some(ContentValue::Period(250))),
            )
            .await;

        assert_eq!(applied, 2);
        assert_eq!(
            function_ids(&sim),
            vec![
                SET_ANALOG_VALUE_CALLBACK_PERIOD,
                SET_DEBOUNCE_PERIOD,
                SET_ILLUMINANCE_CALLBACK_PERIOD
            ]
        );
        let content = service.content();
        assert!(content.setting(&DEBOUNCE_PERIOD).is_none());
        assert_eq!(
            content.setting(&ILLUMINANCE_CALLBACK_PERIOD),
            Some(&ContentValue::Period(250))
        );
    }

    #[tokio::test]
    async fn unknown_classes_in_json_intent_are_ignored() {
        let sim = SimStack::new();
        let bus = EventBus::default();
        let mut service = service(&sim, &bus);
        let intent: Intent = serde_json::from_str(
            r#"{
                "kind": "ambient_light",
                "uid": "ab1",
                "sender": "test",
                "settings": {
                    "colour": {"type": "rgb", "value": {"r": 255, "g": 128, "b": 0}},
                    "debounce_period": {"type": "period", "value": 50}
                }
            }"#,
        )
        .unwrap();
        let mut events = bus.subscribe_events();

        service.handle_intent(&intent).await;

        assert_eq!(function_ids(&sim), vec![SET_DEBOUNCE_PERIOD]);
        let event = events.recv().await.unwrap();
        assert_eq!(event.sender, "tinkerbus/ambient_light/ab1");
        assert_eq!(
            event.content.setting(&DEBOUNCE_PERIOD),
            Some(&ContentValue::Period(50))
        );
    }

    #[tokio::test]
    async fn intent_for_another_uid_is_ignored() {
        let sim = SimStack::new();
        let bus = EventBus::default();
        let mut service = service(&sim, &bus);
        let mut other = DeviceContent::new("zz9", DeviceKind::AmbientLight);
        other.update_setting(DEBOUNCE_PERIOD, ContentValue::Period(10));

        service
            .handle_intent(&AmbientLightService::create_intent(&other, "test"))
            .await;

        assert!(sim.calls("ab1").is_empty());
    }

    #[tokio::test]
    async fn every_callback_publishes_one_full_snapshot() {
        let sim = SimStack::new();
        let bus = EventBus::default();
        let mut service = service(&sim, &bus);
        let mut events = bus.subscribe_events();

        service.handle_callback(&AmbientLightCallback::Illuminance(900));
        service.handle_callback(&AmbientLightCallback::AnalogValueReached(1200));

        let first = events.recv().await.unwrap();
        assert_eq!(first.content.emission(&ILLUMINANCE_VALUE), Some(&ContentValue::Reading(900)));
        assert!(first.content.emission(&ANALOG_VALUE).is_none());

        let second = events.recv().await.unwrap();
        assert_eq!(second.content.emission(&ILLUMINANCE_VALUE), Some(&ContentValue::Reading(900)));
        assert_eq!(second.content.emission(&ANALOG_VALUE), Some(&ContentValue::Reading(1200)));

        let extra = tokio::time::timeout(Duration::from_millis(20), events.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn one_shot_read_publishes_the_value() {
        let sim = SimStack::new();
        let bus = EventBus::default();
        let mut service = service(&sim, &bus);
        sim.set_response("ab1", 1, 4321u16.to_le_bytes().to_vec());
        let mut events = bus.subscribe_events();
        let content = DeviceContent::new("ab1", DeviceKind::AmbientLight);
        let intent = AmbientLightService::create_intent(&content, "test")
            .with_settings(Settings::new().with(ILLUMINANCE_VALUE, None));

        service.handle_intent(&intent).await;

        let event = events.recv().await.unwrap();
        assert_eq!(
            event.content.emission(&ILLUMINANCE_VALUE),
            Some(&ContentValue::Reading(4321))
        );
    }

    #[tokio::test]
    async fn intent_without_effect_publishes_nothing() {
        let sim = SimStack::new();
        let bus = EventBus::default();
        let mut service = service(&sim, &bus);
        let mut events = bus.subscribe_events();
        let content = DeviceContent::new("ab1", DeviceKind::AmbientLight);
        let intent = AmbientLightService::create_intent(&content, "test")
            .with_settings(Settings::new().with(ILLUMINANCE_THRESHOLD, None));

        service.handle_intent(&intent).await;

        let result = tokio::time::timeout(Duration::from_millis(20), events.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn run_loop_rebinds_and_replays_settings() {
        let sim = SimStack::new();
        let bus = EventBus::default();
        let service = service(&sim, &bus);
        let (rebind_tx, rebind_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let mut events = bus.subscribe_events();
        let task = tokio::spawn(service.run(bus.subscribe_intents(), rebind_rx, cancel.clone()));

        let mut content = DeviceContent::new("ab1", DeviceKind::AmbientLight);
        content.update_setting(ILLUMINANCE_CALLBACK_PERIOD, ContentValue::Period(500));
        bus.publish_intent(AmbientLightService::create_intent(&content, "test"));
        events.recv().await.unwrap();
        assert_eq!(function_ids(&sim), vec![SET_ILLUMINANCE_CALLBACK_PERIOD]);

        let fresh = DeviceHandle::AmbientLight(Arc::new(
            AmbientLight::new("ab1", sim.connection()).unwrap(),
        ));
        rebind_tx.send(fresh).unwrap();
        // The callback arrives through the new subscription.
        tokio::time::sleep(Duration::from_millis(20)).await;
        sim.emit_callback("ab1", tinkerbus_hal::ambient_light::CALLBACK_ILLUMINANCE, vec![10, 0]);

        let event = events.recv().await.unwrap();
        assert_eq!(event.content.emission(&ILLUMINANCE_VALUE), Some(&ContentValue::Reading(10)));
        assert_eq!(
            function_ids(&sim),
            vec![SET_ILLUMINANCE_CALLBACK_PERIOD, SET_ILLUMINANCE_CALLBACK_PERIOD]
        );

        cancel.cancel();
        task.await.unwrap();
    }
}
