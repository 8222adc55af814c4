//! Demo stack for `--simulate`: one ambient light and one temperature
//! device on a [`SimStack`], fed with a slow synthetic signal.

use std::time::Duration;

use tinkerbus_hal::SimStack;
use tinkerbus_hal::ambient_light::CALLBACK_ILLUMINANCE;
use tinkerbus_hal::temperature::CALLBACK_TEMPERATURE;
use tinkerbus_types::DeviceKind;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const AMBIENT_LIGHT_UID: &str = "ab1";
pub const TEMPERATURE_UID: &str = "t1";

/// Interval between two synthetic readings.
pub const TICK: Duration = Duration::from_secs(1);

pub fn populate(sim: &SimStack) {
    sim.add_device(AMBIENT_LIGHT_UID, DeviceKind::AmbientLight);
    sim.add_device(TEMPERATURE_UID, DeviceKind::Temperature);
}

/// Illuminance (lux/10) and temperature (°C/100) at `tick`. Both follow a
/// triangle wave so consecutive readings differ.
pub fn reading(tick: u32) -> (u16, i16) {
    let phase = tick % 20;
    let ramp = if phase < 10 { phase } else { 20 - phase };
    let illuminance = 3_000 + 150 * u16::try_from(ramp).unwrap_or(0);
    let temperature = 2_150 + 25 * i16::try_from(ramp).unwrap_or(0);
    (illuminance, temperature)
}

/// Emit one reading per device every [`TICK`] until cancelled.
pub async fn drive(sim: SimStack, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(TICK);
    let mut tick = 0u32;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let (illuminance, temperature) = reading(tick);
        sim.emit_callback(
            AMBIENT_LIGHT_UID,
            CALLBACK_ILLUMINANCE,
            illuminance.to_le_bytes().to_vec(),
        );
        sim.emit_callback(
            TEMPERATURE_UID,
            CALLBACK_TEMPERATURE,
            temperature.to_le_bytes().to_vec(),
        );
        debug!(tick, illuminance, temperature, "demo readings emitted");
        tick = tick.wrapping_add(1);
    }
}
