//! Ambient light bricklet (device identifier 21).
//!
//! Illuminance is reported in 1/10 lux, the analog value is the raw 12-bit
//! ADC reading.  Both can be streamed periodically or on threshold crossings.

use std::sync::Arc;

use tinkerbus_types::{CallbackThreshold, DeviceError, DeviceKind};

use crate::connection::StackConnection;
use crate::device::{CallbackSubscription, Device, DeviceCore};
use crate::packet::{PayloadReader, PayloadWriter};

const FUNCTION_GET_ILLUMINANCE: u8 = 1;
const FUNCTION_GET_ANALOG_VALUE: u8 = 2;
const FUNCTION_SET_ILLUMINANCE_CALLBACK_PERIOD: u8 = 3;
const FUNCTION_SET_ANALOG_VALUE_CALLBACK_PERIOD: u8 = 5;
const FUNCTION_SET_ILLUMINANCE_CALLBACK_THRESHOLD: u8 = 7;
const FUNCTION_SET_ANALOG_VALUE_CALLBACK_THRESHOLD: u8 = 9;
const FUNCTION_SET_DEBOUNCE_PERIOD: u8 = 11;

pub const CALLBACK_ILLUMINANCE: u8 = 13;
pub const CALLBACK_ANALOG_VALUE: u8 = 14;
pub const CALLBACK_ILLUMINANCE_REACHED: u8 = 15;
pub const CALLBACK_ANALOG_VALUE_REACHED: u8 = 16;

/// Callback emitted by an ambient light bricklet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmbientLightCallback {
    Illuminance(u16),
    AnalogValue(u16),
    IlluminanceReached(u16),
    AnalogValueReached(u16),
}

impl AmbientLightCallback {
    /// Decode a raw callback frame; `None` for foreign function ids.
    pub fn decode(function_id: u8, payload: &[u8]) -> Option<Self> {
        let value = PayloadReader::new(payload).u16()?;
        match function_id {
            CALLBACK_ILLUMINANCE => Some(Self::Illuminance(value)),
            CALLBACK_ANALOG_VALUE => Some(Self::AnalogValue(value)),
            CALLBACK_ILLUMINANCE_REACHED => Some(Self::IlluminanceReached(value)),
            CALLBACK_ANALOG_VALUE_REACHED => Some(Self::AnalogValueReached(value)),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct AmbientLight {
    core: DeviceCore,
}

impl AmbientLight {
    pub const DEVICE_IDENTIFIER: u16 = 21;

    pub fn new(uid: &str, connection: Arc<dyn StackConnection>) -> Option<Self> {
        DeviceCore::new(uid, connection).map(|core| Self { core })
    }

    pub async fn illuminance(&self) -> Result<u16, DeviceError> {
        self.core.get_u16(FUNCTION_GET_ILLUMINANCE).await
    }

    pub async fn analog_value(&self) -> Result<u16, DeviceError> {
        self.core.get_u16(FUNCTION_GET_ANALOG_VALUE).await
    }

    pub async fn set_illuminance_callback_period(&self, period_ms: u32) -> Result<(), DeviceError> {
        self.core
            .set(
                FUNCTION_SET_ILLUMINANCE_CALLBACK_PERIOD,
                PayloadWriter::new().u32(period_ms).finish(),
            )
            .await
    }

    pub async fn set_analog_value_callback_period(&self, period_ms: u32) -> Result<(), DeviceError> {
        self.core
            .set(
                FUNCTION_SET_ANALOG_VALUE_CALLBACK_PERIOD,
                PayloadWriter::new().u32(period_ms).finish(),
            )
            .await
    }

    pub async fn set_illuminance_callback_threshold(
        &self,
        threshold: CallbackThreshold,
    ) -> Result<(), DeviceError> {
        self.set_threshold(FUNCTION_SET_ILLUMINANCE_CALLBACK_THRESHOLD, threshold)
            .await
    }

    pub async fn set_analog_value_callback_threshold(
        &self,
        threshold: CallbackThreshold,
    ) -> Result<(), DeviceError> {
        self.set_threshold(FUNCTION_SET_ANALOG_VALUE_CALLBACK_THRESHOLD, threshold)
            .await
    }

    /// Minimum time between two "reached" callbacks.
    pub async fn set_debounce_period(&self, period_ms: u32) -> Result<(), DeviceError> {
        self.core
            .set(
                FUNCTION_SET_DEBOUNCE_PERIOD,
                PayloadWriter::new().u32(period_ms).finish(),
            )
            .await
    }

    pub fn subscribe(&self) -> AmbientLightCallbacks {
        AmbientLightCallbacks(self.core.subscribe())
    }

    async fn set_threshold(
        &self,
        function_id: u8,
        threshold: CallbackThreshold,
    ) -> Result<(), DeviceError> {
        let invalid = || DeviceError::InvalidParameter {
            uid: self.core.uid().to_string(),
            function_id,
        };
        let min = u16::try_from(threshold.min).map_err(|_| invalid())?;
        let max = u16::try_from(threshold.max).map_err(|_| invalid())?;
        let payload = PayloadWriter::new()
            .char(threshold.option.as_char())
            .u16(min)
            .u16(max)
            .finish();
        self.core.set(function_id, payload).await
    }
}

impl Device for AmbientLight {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::AmbientLight
    }
}

/// Typed callback stream of one ambient light bricklet.
#[derive(Debug)]
pub struct AmbientLightCallbacks(CallbackSubscription);

impl AmbientLightCallbacks {
    /// Next decodable callback; `None` once the transport is gone.
    pub async fn recv(&mut self) -> Option<AmbientLightCallback> {
        loop {
            let frame = self.0.recv().await?;
            if let Some(callback) = AmbientLightCallback::decode(frame.function_id, &frame.payload)
            {
                return Some(callback);
            }
        }
    }
}
