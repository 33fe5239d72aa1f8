// measure.rs

use std::fmt;

use crate::*;

/// A device that produces one temperature reading in °C per call.
pub trait TemperatureProbe {
    type Error: fmt::Debug;

    fn read_celsius(&mut self) -> Result<f32, Self::Error>;
}

// Log the first failure of a burst and every Nth one after it.
const FAILURE_LOG_EVERY: u32 = 500;

/// Polls a probe and turns bus errors and out-of-range values into `None`.
pub struct SensorReader<P> {
    probe: P,
    errors: u32,
    failing: u32,
    reported: u32,
}

impl<P: TemperatureProbe> SensorReader<P> {
    pub fn new(probe: P) -> Self {
        SensorReader {
            probe,
            errors: 0,
            failing: 0,
            reported: 0,
        }
    }

    pub fn poll(&mut self) -> Option<f32> {
        match self.probe.read_celsius() {
            Ok(t) if t.is_nan() || t < MIN_VALID_TEMP => {
                if self.fail() {
                    warn!("Sensor returned out-of-range value {t} ({} in a row)", self.failing);
                }
                None
            }
            Ok(t) => {
                if self.failing > 0 {
                    info!("Sensor back after {} failed reads: {t}", self.failing);
                    self.failing = 0;
                }
                Some(t)
            }
            Err(e) => {
                if self.fail() {
                    error!("Sensor read failed ({} in a row): {e:?}", self.failing);
                }
                None
            }
        }
    }

    /// Count a failure, true when it should be logged.
    fn fail(&mut self) -> bool {
        self.errors = self.errors.wrapping_add(1);
        self.failing = self.failing.saturating_add(1);
        let report = (self.failing - 1) % FAILURE_LOG_EVERY == 0;
        if report {
            self.reported = self.reported.wrapping_add(1);
        }
        report
    }

    /// Failed polls since startup.
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Failures written to the log since startup.
    pub fn reported(&self) -> u32 {
        self.reported
    }
}

// When performing a measurement it can happen that no device was found on the one-wire-bus
// in addition to the bus errors. Therefore we extend the error cases for proper error handling.
#[derive(Debug)]
pub enum MeasurementError<E> {
    OneWireError(E),
    NoDeviceFound,
}

#[cfg(target_os = "espidf")]
pub use ds18b20_probe::*;

#[cfg(target_os = "espidf")]
mod ds18b20_probe {
    use super::*;

    use anyhow::anyhow;
    use ds18b20::{Ds18b20, Resolution};
    use esp_idf_hal::{
        delay::{Ets, FreeRtos},
        gpio::{AnyIOPin, InputOutput, PinDriver, Pull},
    };
    use esp_idf_sys::EspError;
    use one_wire_bus::{Address, OneWire, OneWireError};

    const RESOLUTION: Resolution = Resolution::Bits10;

    impl From<OneWireError<EspError>> for MeasurementError<OneWireError<EspError>> {
        fn from(value: OneWireError<EspError>) -> Self {
            MeasurementError::OneWireError(value)
        }
    }

    /// The first DS18B20 found on a one-wire bus.
    pub struct Ds18b20Probe {
        bus: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
        address: Option<Address>,
        delay: Ets,
    }

    impl Ds18b20Probe {
        pub fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
            let mut drv = PinDriver::input_output_od(pin)?;
            drv.set_pull(Pull::Up)?;
            let bus = OneWire::new(drv)
                .map_err(|e| anyhow!("failed to initialize one-wire bus: {e:?}"))?;

            let mut probe = Ds18b20Probe {
                bus,
                address: None,
                delay: Ets,
            };
            probe.scan();
            Ok(probe)
        }

        fn scan(&mut self) -> Option<Address> {
            let mut found = None;
            for addr in self.bus.devices(false, &mut self.delay) {
                match addr {
                    Ok(a) if a.family_code() == ds18b20::FAMILY_CODE => {
                        found = Some(a);
                        break;
                    }
                    Ok(a) => info!("Ignoring one-wire device {a:?}"),
                    Err(e) => {
                        warn!("One-wire device scan failed: {e:?}");
                        break;
                    }
                }
            }

            let address = found?;
            match Ds18b20::new::<EspError>(address) {
                Ok(sensor) => {
                    if let Err(e) = sensor.set_config(
                        i8::MIN,
                        i8::MAX,
                        RESOLUTION,
                        &mut self.bus,
                        &mut self.delay,
                    ) {
                        warn!("Cannot set DS18B20 resolution: {e:?}");
                    }
                    info!("Using DS18B20 {address:?}");
                    self.address = Some(address);
                }
                Err(e) => warn!("Invalid DS18B20 address {address:?}: {e:?}"),
            }
            self.address
        }
    }

    impl TemperatureProbe for Ds18b20Probe {
        type Error = MeasurementError<OneWireError<EspError>>;

        fn read_celsius(&mut self) -> Result<f32, Self::Error> {
            let address = match self.address {
                Some(a) => a,
                None => self.scan().ok_or(MeasurementError::NoDeviceFound)?,
            };
            let sensor = Ds18b20::new::<EspError>(address)?;

            ds18b20::start_simultaneous_temp_measurement(&mut self.bus, &mut self.delay)?;
            RESOLUTION.delay_for_measurement_time(&mut FreeRtos);

            match sensor.read_data(&mut self.bus, &mut self.delay) {
                Ok(data) => Ok(data.temperature),
                Err(e) => {
                    // rescan on the next poll, the probe may have been replugged
                    self.address = None;
                    Err(e.into())
                }
            }
        }
    }
}


// EOF
