//! Temperature service.
//!
//! Settings `temperature_callback_period`, `temperature_threshold` and
//! `debounce_period`; emission `temperature_value` in 1/100 °C.

use std::sync::Arc;

use async_trait::async_trait;
use tinkerbus_hal::{DeviceHandle, Temperature, TemperatureCallback, TemperatureCallbacks};
use tinkerbus_types::{ContentClass, ContentValue, DeviceContent, Settings};

use crate::service::{
    CallbackStream, DeviceService, ManagedDevice, period_setting, record_setting,
    threshold_setting,
};

pub const TEMPERATURE_CALLBACK_PERIOD: ContentClass =
    ContentClass::from_static("temperature_callback_period");
pub const TEMPERATURE_THRESHOLD: ContentClass = ContentClass::from_static("temperature_threshold");
pub const DEBOUNCE_PERIOD: ContentClass = ContentClass::from_static("debounce_period");
pub const TEMPERATURE_VALUE: ContentClass = ContentClass::from_static("temperature_value");

pub type TemperatureService = DeviceService<Temperature>;

#[async_trait]
impl CallbackStream for TemperatureCallbacks {
    type Item = TemperatureCallback;

    async fn next_callback(&mut self) -> Option<TemperatureCallback> {
        self.recv().await
    }
}

#[async_trait]
impl ManagedDevice for Temperature {
    type Callbacks = TemperatureCallbacks;

    fn from_handle(handle: &DeviceHandle) -> Option<Arc<Self>> {
        match handle {
            DeviceHandle::Temperature(device) => Some(Arc::clone(device)),
            _ => None,
        }
    }

    fn callbacks(&self) -> TemperatureCallbacks {
        self.subscribe()
    }

    async fn apply_settings(&self, settings: &Settings, content: &mut DeviceContent) -> usize {
        let mut applied = 0;
        if let Some(threshold) = threshold_setting(settings, &TEMPERATURE_THRESHOLD) {
            let result = self.set_temperature_callback_threshold(threshold).await;
            applied += usize::from(record_setting(
                content,
                &TEMPERATURE_THRESHOLD,
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
        if let Some(period) = period_setting(settings, &TEMPERATURE_CALLBACK_PERIOD) {
            let result = self.set_temperature_callback_period(period).await;
            applied += usize::from(record_setting(
                content,
                &TEMPERATURE_CALLBACK_PERIOD,
                ContentValue::Period(period),
                result,
            ));
        }
        applied
    }

    fn emission(callback: &TemperatureCallback) -> (ContentClass, ContentValue) {
        let value = match *callback {
            TemperatureCallback::Temperature(value)
            | TemperatureCallback::TemperatureReached(value) => value,
        };
        (TEMPERATURE_VALUE, ContentValue::Reading(i32::from(value)))
    }
}
