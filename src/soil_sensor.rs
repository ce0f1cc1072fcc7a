//! RS485 soil probe on top of a [`ModbusClient`].
//!
//! All eight measurements are fetched with a single Read Holding Registers
//! request. Scaling, calibration and plausibility checks happen here, on top
//! of the raw register values.
//!
//! ```no_run
//! # #[cfg(feature = "serial")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use irrigator_lib::serial::{serial_port_builder, SerialPortChannel};
//! use irrigator_lib::sensor::{Sensor, SoilSensor};
//! use irrigator_lib::soil_sensor::ModbusSoilSensor;
//! use irrigator_lib::transport::{AutoDirection, ModbusTransport};
//!
//! let port = serial_port_builder("/dev/ttyUSB0", 9600).open()?;
//! let transport = ModbusTransport::new(SerialPortChannel::new(port), AutoDirection);
//! let mut sensor = ModbusSoilSensor::new(transport, 0x01);
//! sensor.read()?;
//! if let Some(reading) = sensor.reading() {
//!     println!("{reading}");
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "serial"))]
//! # fn main() {}
//! ```

use crate::protocol::{self as proto, SoilParameter};
use crate::sensor::{Sensor, SoilReading, SoilSensor, ValidRange};
use crate::transport::ModbusClient;
use crate::{Error, Result};
use log::*;
use std::time::{Instant, SystemTime};

/// Below this magnitude a value is not usable as calibration base.
const MIN_CALIBRATION_BASE: f32 = 0.01;

const PARAMETER_COUNT: usize = proto::SOIL_BLOCK_REG_QUAN as usize;

/// Soil probe adapter.
#[derive(Debug)]
pub struct ModbusSoilSensor<C> {
    client: C,
    address: u8,
    name: String,
    initialized: bool,
    last_error: Option<Error>,
    reading: Option<SoilReading>,
    calibration: [f32; PARAMETER_COUNT],
    ranges: [ValidRange; PARAMETER_COUNT],
}

impl<C: ModbusClient> ModbusSoilSensor<C> {
    pub fn new(client: C, address: u8) -> Self {
        Self {
            client,
            address,
            name: String::from("ModbusSoil"),
            initialized: false,
            last_error: None,
            reading: None,
            calibration: [1.0; PARAMETER_COUNT],
            ranges: SoilParameter::ALL.map(ValidRange::from),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn fail<T>(&mut self, err: Error) -> Result<T> {
        self.last_error = Some(err);
        Err(err)
    }

    fn ensure_initialized(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.initialize()
    }

    /// Reads the calibration factors stored on the probe.
    ///
    /// Probes without calibration registers answer with an exception, in that
    /// case the factors stay at `1.0`.
    fn load_calibration(&mut self) {
        let mut registers = [0u16; PARAMETER_COUNT];
        match self.client.read_holding_registers(
            self.address,
            proto::SOIL_CALIBRATION_REG_ADDR,
            &mut registers,
        ) {
            Ok(()) => {
                for (factor, raw) in self.calibration.iter_mut().zip(registers) {
                    if raw != 0 {
                        *factor = raw as f32 / proto::SOIL_CALIBRATION_SCALE;
                    }
                }
                debug!("{}: calibration factors {:?}", self.name, self.calibration);
            }
            Err(err) => debug!("{}: no stored calibration ({err})", self.name),
        }
    }

    fn read_single(&mut self, parameter: SoilParameter) -> Result<u16> {
        let mut register = [0u16; 1];
        self.client
            .read_holding_registers(self.address, parameter.register(), &mut register)?;
        Ok(register[0])
    }
}

impl<C: ModbusClient> Sensor for ModbusSoilSensor<C> {
    fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        if let Err(err) = self.client.initialize() {
            return self.fail(err);
        }
        // A single register proves the probe answers on this address.
        if let Err(err) = self.read_single(SoilParameter::Moisture) {
            return self.fail(err);
        }
        self.load_calibration();
        self.initialized = true;
        self.last_error = None;
        info!("{}: soil probe found at address {}", self.name, self.address);
        Ok(())
    }

    fn read(&mut self) -> Result<()> {
        if let Err(err) = self.ensure_initialized() {
            self.reading = None;
            return Err(err);
        }

        let mut registers = [0u16; PARAMETER_COUNT];
        if let Err(err) = self.client.read_holding_registers(
            self.address,
            proto::SOIL_BLOCK_REG_ADDR,
            &mut registers,
        ) {
            self.reading = None;
            return self.fail(err);
        }

        let mut values = [0f32; PARAMETER_COUNT];
        for parameter in SoilParameter::ALL {
            let index = parameter.index();
            values[index] = parameter.decode(registers[index]) * self.calibration[index];
        }

        let mut plausible = true;
        for parameter in SoilParameter::ALL {
            let value = values[parameter.index()];
            if self.is_within_valid_range(parameter, value) {
                continue;
            }
            if parameter.is_critical() {
                warn!("{}: implausible {parameter} value {value}", self.name);
                plausible = false;
            } else {
                debug!("{}: {parameter} value {value} outside valid range", self.name);
            }
        }
        if !plausible {
            self.reading = None;
            return self.fail(Error::InvalidReadingValues);
        }

        let reading = SoilReading::from_values(values, Instant::now(), SystemTime::now());
        trace!("{}: {reading}", self.name);
        self.reading = Some(reading);
        self.last_error = None;
        Ok(())
    }

    fn is_available(&mut self) -> bool {
        if !self.initialized {
            return self.initialize().is_ok();
        }
        self.read_single(SoilParameter::Moisture).is_ok()
    }

    fn last_error(&self) -> Option<Error> {
        self.last_error
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<C: ModbusClient> SoilSensor for ModbusSoilSensor<C> {
    fn reading(&self) -> Option<SoilReading> {
        self.reading
    }

    fn calibrate(&mut self, parameter: SoilParameter, reference: f32) -> Result<f32> {
        if !reference.is_finite() {
            return self.fail(Error::InvalidArgument);
        }
        self.ensure_initialized()?;

        let raw = match self.read_single(parameter) {
            Ok(raw) => raw,
            Err(err) => return self.fail(err),
        };
        let current = parameter.decode(raw);
        if current.abs() < MIN_CALIBRATION_BASE {
            return self.fail(Error::CalibrationReferenceTooSmall);
        }

        let factor = reference / current;
        self.calibration[parameter.index()] = factor;
        info!(
            "{}: {parameter} calibrated, {current} reads as {reference} (factor {factor})",
            self.name
        );

        // The local factor stays in effect even if the probe cannot keep it.
        match proto::calibration_factor_encode(factor).and_then(|encoded| {
            self.client
                .write_single_register(self.address, parameter.calibration_register(), encoded)
        }) {
            Ok(()) => debug!("{}: {parameter} factor stored on probe", self.name),
            Err(err) => warn!("{}: cannot store {parameter} factor: {err}", self.name),
        }
        self.last_error = None;
        Ok(factor)
    }

    fn calibration_factor(&self, parameter: SoilParameter) -> f32 {
        self.calibration[parameter.index()]
    }

    fn set_valid_range(&mut self, parameter: SoilParameter, range: ValidRange) -> Result<()> {
        ValidRange::new(range.min, range.max)?;
        self.ranges[parameter.index()] = range;
        Ok(())
    }

    fn valid_range(&self, parameter: SoilParameter) -> ValidRange {
        self.ranges[parameter.index()]
    }
}
