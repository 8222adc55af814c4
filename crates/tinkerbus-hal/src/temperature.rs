//! Temperature bricklet (device identifier 216).
//!
//! Temperatures are signed and reported in 1/100 °C.

use std::sync::Arc;

use tinkerbus_types::{CallbackThreshold, DeviceError, DeviceKind};

use crate::connection::StackConnection;
use crate::device::{CallbackSubscription, Device, DeviceCore};
use crate::packet::{PayloadReader, PayloadWriter};

const FUNCTION_GET_TEMPERATURE: u8 = 1;
const FUNCTION_SET_TEMPERATURE_CALLBACK_PERIOD: u8 = 2;
const FUNCTION_SET_TEMPERATURE_CALLBACK_THRESHOLD: u8 = 4;
const FUNCTION_SET_DEBOUNCE_PERIOD: u8 = 6;

pub const CALLBACK_TEMPERATURE: u8 = 8;
pub const CALLBACK_TEMPERATURE_REACHED: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureCallback {
    Temperature(i16),
    TemperatureReached(i16),
}

impl TemperatureCallback {
    pub fn decode(function_id: u8, payload: &[u8]) -> Option<Self> {
        let value = PayloadReader::new(payload).i16()?;
        match function_id {
            CALLBACK_TEMPERATURE => Some(Self::Temperature(value)),
            CALLBACK_TEMPERATURE_REACHED => Some(Self::TemperatureReached(value)),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Temperature {
    core: DeviceCore,
}

impl Temperature {
    pub const DEVICE_IDENTIFIER: u16 = 216;

    pub fn new(uid: &str, connection: Arc<dyn StackConnection>) -> Option<Self> {
        DeviceCore::new(uid, connection).map(|core| Self { core })
    }

    pub async fn temperature(&self) -> Result<i16, DeviceError> {
        self.core.get_i16(FUNCTION_GET_TEMPERATURE).await
    }

    pub async fn set_temperature_callback_period(&self, period_ms: u32) -> Result<(), DeviceError> {
        self.core
            .set(
                FUNCTION_SET_TEMPERATURE_CALLBACK_PERIOD,
                PayloadWriter::new().u32(period_ms).finish(),
            )
            .await
    }

    pub async fn set_temperature_callback_threshold(
        &self,
        threshold: CallbackThreshold,
    ) -> Result<(), DeviceError> {
        let invalid = || DeviceError::InvalidParameter {
            uid: self.core.uid().to_string(),
            function_id: FUNCTION_SET_TEMPERATURE_CALLBACK_THRESHOLD,
        };
        let min = i16::try_from(threshold.min).map_err(|_| invalid())?;
        let max = i16::try_from(threshold.max).map_err(|_| invalid())?;
        let payload = PayloadWriter::new()
            .char(threshold.option.as_char())
            .i16(min)
            .i16(max)
            .finish();
        self.core
            .set(FUNCTION_SET_TEMPERATURE_CALLBACK_THRESHOLD, payload)
            .await
    }

    pub async fn set_debounce_period(&self, period_ms: u32) -> Result<(), DeviceError> {
        self.core
            .set(
                FUNCTION_SET_DEBOUNCE_PERIOD,
                PayloadWriter::new().u32(period_ms).finish(),
            )
            .await
    }

    pub fn subscribe(&self) -> TemperatureCallbacks {
        TemperatureCallbacks(self.core.subscribe())
    }
}

impl Device for Temperature {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Temperature
    }
}

#[derive(Debug)]
pub struct TemperatureCallbacks(CallbackSubscription);

impl TemperatureCallbacks {
    pub async fn recv(&mut self) -> Option<TemperatureCallback> {
        loop {
            let frame = self.0.recv().await?;
            if let Some(callback) = TemperatureCallback::decode(frame.function_id, &frame.payload) {
                return Some(callback);
            }
        }
    }
}
