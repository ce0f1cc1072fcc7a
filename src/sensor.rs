//! Capability traits of the sensors and the reading snapshots they produce.

use crate::protocol::SoilParameter;
use crate::{Error, Result};
use std::fmt;
use std::time::{Instant, SystemTime};

/// Common behaviour of every sensor.
pub trait Sensor {
    /// Brings the sensor up. Calling it again after a success is a no-op.
    fn initialize(&mut self) -> Result<()>;

    /// Triggers a fresh acquisition.
    ///
    /// On failure the previous snapshot is discarded as well.
    fn read(&mut self) -> Result<()>;

    /// Checks liveness without updating the snapshot.
    fn is_available(&mut self) -> bool;

    fn last_error(&self) -> Option<Error>;

    fn name(&self) -> &str;
}

/// A soil probe measuring moisture, temperature, pH, EC and NPK.
pub trait SoilSensor: Sensor {
    /// The snapshot of the last successful [`Sensor::read`].
    fn reading(&self) -> Option<SoilReading>;

    /// Learns a calibration factor so that the current value reads as `reference`.
    fn calibrate(&mut self, parameter: SoilParameter, reference: f32) -> Result<f32>;

    /// The calibration factor currently applied to `parameter`.
    fn calibration_factor(&self, parameter: SoilParameter) -> f32;

    /// Overrides the plausibility range of one parameter.
    fn set_valid_range(&mut self, parameter: SoilParameter, range: ValidRange) -> Result<()>;

    fn valid_range(&self, parameter: SoilParameter) -> ValidRange;

    fn is_within_valid_range(&self, parameter: SoilParameter, value: f32) -> bool {
        self.valid_range(parameter).contains(value)
    }

    fn calibrate_moisture(&mut self, reference: f32) -> Result<f32> {
        self.calibrate(SoilParameter::Moisture, reference)
    }

    fn calibrate_ph(&mut self, reference: f32) -> Result<f32> {
        self.calibrate(SoilParameter::Ph, reference)
    }

    fn calibrate_ec(&mut self, reference: f32) -> Result<f32> {
        self.calibrate(SoilParameter::Ec, reference)
    }
}

/// An air temperature / humidity / pressure sensor.
pub trait EnvironmentalSensor: Sensor {
    fn reading(&self) -> Option<EnvironmentReading>;
}

/// Inclusive plausibility range of a measured value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidRange {
    pub min: f32,
    pub max: f32,
}

impl ValidRange {
    pub fn new(min: f32, max: f32) -> Result<Self> {
        if min.is_finite() && max.is_finite() && min <= max {
            Ok(Self { min, max })
        } else {
            Err(Error::InvalidArgument)
        }
    }

    /// `NAN` is never within range.
    pub fn contains(&self, value: f32) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

impl From<SoilParameter> for ValidRange {
    fn from(parameter: SoilParameter) -> Self {
        let (min, max) = parameter.default_range();
        Self { min, max }
    }
}

/// One complete acquisition of the soil probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoilReading {
    /// Volumetric moisture in %.
    pub moisture: f32,
    /// Soil temperature in °C.
    pub temperature: f32,
    /// Relative humidity in %.
    pub humidity: f32,
    pub ph: f32,
    /// Electrical conductivity in µS/cm.
    pub ec: f32,
    /// Nitrogen in mg/kg.
    pub nitrogen: f32,
    /// Phosphorus in mg/kg.
    pub phosphorus: f32,
    /// Potassium in mg/kg.
    pub potassium: f32,
    /// Monotonic acquisition instant, used for staleness checks.
    pub acquired_at: Instant,
    /// Wall clock acquisition time, used for the history.
    pub timestamp: SystemTime,
}

impl SoilReading {
    /// Builds a snapshot from calibrated values indexed by [`SoilParameter::index`].
    pub fn from_values(values: [f32; 8], acquired_at: Instant, timestamp: SystemTime) -> Self {
        Self {
            moisture: values[SoilParameter::Moisture.index()],
            temperature: values[SoilParameter::Temperature.index()],
            humidity: values[SoilParameter::Humidity.index()],
            ph: values[SoilParameter::Ph.index()],
            ec: values[SoilParameter::Ec.index()],
            nitrogen: values[SoilParameter::Nitrogen.index()],
            phosphorus: values[SoilParameter::Phosphorus.index()],
            potassium: values[SoilParameter::Potassium.index()],
            acquired_at,
            timestamp,
        }
    }

    pub fn value(&self, parameter: SoilParameter) -> f32 {
        match parameter {
            SoilParameter::Moisture => self.moisture,
            SoilParameter::Temperature => self.temperature,
            SoilParameter::Humidity => self.humidity,
            SoilParameter::Ph => self.ph,
            SoilParameter::Ec => self.ec,
            SoilParameter::Nitrogen => self.nitrogen,
            SoilParameter::Phosphorus => self.phosphorus,
            SoilParameter::Potassium => self.potassium,
        }
    }
}

impl fmt::Display for SoilReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, parameter) in SoilParameter::ALL.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(
                f,
                "{}: {:.1} {}",
                parameter,
                self.value(*parameter),
                parameter.unit()
            )?;
        }
        Ok(())
    }
}

/// One acquisition of the environmental sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentReading {
    /// Air temperature in °C.
    pub temperature: f32,
    /// Relative humidity in %.
    pub humidity: f32,
    /// Air pressure in hPa.
    pub pressure: f32,
    pub timestamp: SystemTime,
}
