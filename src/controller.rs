//! The watering decision core.
//!
//! [`WateringController`] owns the pump and the storage, hands the sensors to
//! a background [`Acquisition`] and decides from the published readings when
//! the pump runs. Safety stops:
//!
//! - a failed soil read stops a running pump immediately,
//! - a moisture value outside `0..=100` % is never acted upon and stops the pump,
//! - a pump never keeps running on readings older than [`STALENESS_WINDOW`],
//!   even when the background task died.
//!
//! The last two apply while the automatic path is operational. Without a
//! working soil sensor the controller runs degraded and only obeys manual
//! commands.

use crate::acquisition::{Acquisition, AcquisitionHandle, PollResult, SharedReadings};
use crate::protocol::SoilParameter;
use crate::pump::{Actuator, Pump};
use crate::sensor::{EnvironmentReading, EnvironmentalSensor, Sensor, SoilReading, SoilSensor};
use crate::storage::DataStorage;
use crate::{Error, Result};
use log::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Maximum age of the last valid soil reading while the pump runs.
pub const STALENESS_WINDOW: Duration = Duration::from_secs(30);
/// Bounded wait of the decision pass for the shared region.
pub const DECISION_LOCK_TIMEOUT: Duration = Duration::from_millis(50);
/// Hard ceiling of an automatic watering run, in seconds.
pub const MAX_WATERING_DURATION: u32 = 300;
/// Storage key of the persisted [`WateringConfig`].
pub const CONFIG_KEY: &str = "watering_config";

pub const SOIL_SERIES: &str = "soil";
pub const ENVIRONMENT_SERIES: &str = "environment";

const MIN_SENSOR_READ_INTERVAL_MS: u64 = 100;

/// The persisted tunables of the controller.
///
/// Stored as one JSON object under [`CONFIG_KEY`] and rewritten as a whole on
/// every change.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WateringConfig {
    /// Acquisition period in milliseconds.
    pub sensor_read_interval: u64,
    /// History logging period in milliseconds.
    pub data_log_interval: u64,
    /// Seconds. Kept and settable, not enforced by the automatic path.
    pub min_watering_interval: u64,
    /// Start watering at or below this moisture (%).
    pub moisture_threshold_low: f32,
    /// Stop watering at or above this moisture (%).
    pub moisture_threshold_high: f32,
    /// Seconds of one automatic run.
    pub watering_duration: u32,
    pub watering_enabled: bool,
}

impl Default for WateringConfig {
    fn default() -> Self {
        Self {
            sensor_read_interval: 60_000,
            data_log_interval: 300_000,
            min_watering_interval: 21_600,
            moisture_threshold_low: 30.0,
            moisture_threshold_high: 55.0,
            watering_duration: 20,
            watering_enabled: true,
        }
    }
}

fn is_percent(value: f32) -> bool {
    (0.0..=100.0).contains(&value)
}

impl WateringConfig {
    /// Parses a persisted blob. Missing fields take their default, an
    /// unparsable blob yields the defaults.
    pub fn from_json(json: &str) -> Self {
        match serde_json::from_str::<Self>(json) {
            Ok(config) => config.sanitized(),
            Err(err) => {
                warn!("Ignoring unparsable watering config: {err}");
                Self::default()
            }
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|err| {
            warn!("Cannot serialize watering config: {err}");
            Error::Storage
        })
    }

    /// Replaces every out of range value by its default.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if !is_percent(self.moisture_threshold_low)
            || !is_percent(self.moisture_threshold_high)
            || self.moisture_threshold_low >= self.moisture_threshold_high
        {
            warn!(
                "Invalid moisture thresholds {}..{}, using {}..{}",
                self.moisture_threshold_low,
                self.moisture_threshold_high,
                defaults.moisture_threshold_low,
                defaults.moisture_threshold_high
            );
            self.moisture_threshold_low = defaults.moisture_threshold_low;
            self.moisture_threshold_high = defaults.moisture_threshold_high;
        }
        if self.watering_duration == 0 || self.watering_duration > MAX_WATERING_DURATION {
            self.watering_duration = defaults.watering_duration;
        }
        if self.sensor_read_interval < MIN_SENSOR_READ_INTERVAL_MS {
            self.sensor_read_interval = defaults.sensor_read_interval;
        }
        if self.data_log_interval == 0 {
            self.data_log_interval = defaults.data_log_interval;
        }
        if self.min_watering_interval == 0 {
            self.min_watering_interval = defaults.min_watering_interval;
        }
        self
    }

    pub fn read_interval(&self) -> Duration {
        Duration::from_millis(self.sensor_read_interval)
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_millis(self.data_log_interval)
    }

    pub fn run_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.watering_duration))
    }
}

/// Outcome of one decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Soil too dry, an automatic run started.
    Started,
    /// Soil wet enough, the running pump stopped before its duration elapsed.
    StoppedEarly,
    NoOp,
    /// The soil read failed.
    SensorFailure,
    /// The moisture value was implausible.
    RejectedInvalid,
    /// The last valid reading was too old.
    Stale,
}

/// The collaborators of a [`WateringController`].
///
/// Pump and storage are required, the sensors are optional.
#[derive(Default)]
pub struct Components {
    pub soil: Option<Box<dyn SoilSensor + Send>>,
    pub environment: Option<Box<dyn EnvironmentalSensor + Send>>,
    pub pump: Option<Box<dyn Pump + Send>>,
    pub storage: Option<Box<dyn DataStorage + Send>>,
}

enum Runner {
    Idle,
    /// Polled from the foreground via [`WateringController::poll_sensors_now`].
    Inline(Acquisition),
    Background(AcquisitionHandle),
}

pub struct WateringController {
    soil: Option<Box<dyn SoilSensor + Send>>,
    environment: Option<Box<dyn EnvironmentalSensor + Send>>,
    pump: Option<Box<dyn Pump + Send>>,
    storage: Option<Box<dyn DataStorage + Send>>,
    shared: Arc<SharedReadings>,
    runner: Runner,
    background: bool,
    initialized: bool,
    automatic: bool,
    config: WateringConfig,
    last_error: Option<Error>,
    last_decision: Option<Decision>,
    last_watering: Option<Instant>,
    last_valid_reading: Option<Instant>,
    last_data_log: Option<Instant>,
    soil_reading: Option<SoilReading>,
    environment_reading: Option<EnvironmentReading>,
}

impl std::fmt::Debug for WateringController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WateringController")
            .field("initialized", &self.initialized)
            .field("automatic", &self.automatic)
            .field("config", &self.config)
            .field("last_error", &self.last_error)
            .field("last_decision", &self.last_decision)
            .finish_non_exhaustive()
    }
}

impl WateringController {
    pub fn new(components: Components) -> Self {
        Self {
            soil: components.soil,
            environment: components.environment,
            pump: components.pump,
            storage: components.storage,
            shared: Arc::new(SharedReadings::new()),
            runner: Runner::Idle,
            background: true,
            initialized: false,
            automatic: false,
            config: WateringConfig::default(),
            last_error: None,
            last_decision: None,
            last_watering: None,
            last_valid_reading: None,
            last_data_log: None,
            soil_reading: None,
            environment_reading: None,
        }
    }

    /// With `false` no acquisition thread is spawned; the sensors are then
    /// polled by [`WateringController::poll_sensors_now`].
    pub fn with_background_acquisition(mut self, enabled: bool) -> Self {
        self.background = enabled;
        self
    }

    fn fail<T>(&mut self, err: Error) -> Result<T> {
        self.last_error = Some(err);
        Err(err)
    }

    /// Brings the controller up.
    ///
    /// Pump and storage must initialize. Sensors that are missing or fail to
    /// initialize leave the controller usable for manual watering; in that
    /// case `Ok` is returned and [`WateringController::last_error`] reports
    /// [`Error::SensorInitFailed`].
    pub fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        if self.pump.is_none() || self.storage.is_none() {
            error!("Controller: pump and storage are required");
            return self.fail(Error::MissingCriticalComponent);
        }
        if let Some(storage) = self.storage.as_mut() {
            if let Err(err) = storage.initialize() {
                error!("Controller: storage initialization failed: {err}");
                return self.fail(Error::StorageInitFailed);
            }
        }
        if let Some(pump) = self.pump.as_mut() {
            if let Err(err) = pump.initialize() {
                error!("Controller: pump {} initialization failed: {err}", pump.name());
                return self.fail(Error::PumpInitFailed);
            }
        }
        self.load_configuration();

        let mut sensor_error = None;
        let soil = match self.soil.take() {
            Some(mut sensor) => match sensor.initialize() {
                Ok(()) => Some(sensor),
                Err(err) => {
                    warn!(
                        "Controller: soil sensor {} unavailable ({err}), automatic watering disabled",
                        sensor.name()
                    );
                    sensor_error = Some(Error::SensorInitFailed);
                    None
                }
            },
            None => {
                info!("Controller: no soil sensor, automatic watering disabled");
                None
            }
        };
        let environment = match self.environment.take() {
            Some(mut sensor) => match sensor.initialize() {
                Ok(()) => Some(sensor),
                Err(err) => {
                    warn!("Controller: environmental sensor {} unavailable ({err})", sensor.name());
                    sensor_error = Some(Error::SensorInitFailed);
                    None
                }
            },
            None => None,
        };

        self.automatic = soil.is_some();
        self.runner = if soil.is_none() && environment.is_none() {
            Runner::Idle
        } else {
            let acquisition = Acquisition::new(soil, environment, Arc::clone(&self.shared));
            if self.background {
                match acquisition.spawn(self.config.read_interval()) {
                    Ok(handle) => Runner::Background(handle),
                    Err(err) => {
                        error!("Controller: cannot spawn acquisition: {err}");
                        self.automatic = false;
                        sensor_error = Some(Error::SensorInitFailed);
                        Runner::Idle
                    }
                }
            } else {
                Runner::Inline(acquisition)
            }
        };

        self.last_valid_reading = None;
        self.last_data_log = None;
        self.initialized = true;
        self.last_error = sensor_error;
        info!(
            "Controller initialized ({} mode), thresholds {}..{} %, run {} s, watering {}",
            if self.automatic { "automatic" } else { "manual only" },
            self.config.moisture_threshold_low,
            self.config.moisture_threshold_high,
            self.config.watering_duration,
            if self.config.watering_enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    fn ensure_initialized(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.initialize()
    }

    fn load_configuration(&mut self) {
        let Some(storage) = self.storage.as_ref() else {
            return;
        };
        let blob = storage.get_config(CONFIG_KEY, "");
        self.config = if blob.trim().is_empty() {
            debug!("No stored watering config, using defaults");
            WateringConfig::default()
        } else {
            WateringConfig::from_json(&blob)
        };
    }

    fn save_configuration(&mut self) -> Result<()> {
        let json = self.config.to_json()?;
        let Some(storage) = self.storage.as_mut() else {
            return self.fail(Error::MissingCriticalComponent);
        };
        match storage.store_config(CONFIG_KEY, &json) {
            Ok(()) => {
                debug!("Stored watering config {json}");
                Ok(())
            }
            Err(err) => self.fail(err),
        }
    }

    /// Drives one acquisition cycle in the foreground.
    ///
    /// Returns `None` when the acquisition runs in the background or there
    /// is nothing to poll.
    pub fn poll_sensors_now(&mut self) -> Option<PollResult> {
        match &mut self.runner {
            Runner::Inline(acquisition) => Some(acquisition.poll_once()),
            Runner::Idle | Runner::Background(_) => None,
        }
    }

    /// One iteration of the main control loop.
    pub fn update(&mut self) {
        self.update_at(Instant::now())
    }

    /// [`WateringController::update`] at `now`.
    ///
    /// Ends elapsed pump runs, consumes freshly published readings, applies
    /// the staleness watchdog and logs the history when due.
    pub fn update_at(&mut self, now: Instant) {
        if let Err(err) = self.ensure_initialized() {
            debug!("Controller not initialized: {err}");
            return;
        }
        if let Some(pump) = self.pump.as_mut() {
            pump.update();
        }
        self.decision_pass(now);
        self.staleness_watchdog(now);
        self.log_data_if_due(now);
    }

    fn decision_pass(&mut self, now: Instant) {
        let shared = Arc::clone(&self.shared);
        let Some(mut state) = shared.try_lock_for(DECISION_LOCK_TIMEOUT) else {
            debug!("Shared readings busy, skipping decision pass");
            return;
        };
        if !state.new_data {
            return;
        }
        self.environment_reading = state.environment.filter(|_| state.environment_ok);

        if self.automatic {
            match state.soil.filter(|_| state.soil_ok) {
                None => {
                    self.emergency_stop("soil sensor unavailable");
                    self.soil_reading = None;
                    self.last_valid_reading = None;
                    self.last_error = Some(Error::SensorReadFailed);
                    self.last_decision = Some(Decision::SensorFailure);
                }
                Some(reading) => {
                    let previous = self.last_valid_reading.replace(reading.acquired_at);
                    self.soil_reading = Some(reading);
                    if self.process_readings(now) == Decision::RejectedInvalid {
                        self.last_valid_reading = previous;
                    }
                }
            }
        }
        state.new_data = false;
    }

    fn has_fresh_data(&self, now: Instant) -> bool {
        self.last_valid_reading
            .is_some_and(|at| now.saturating_duration_since(at) <= STALENESS_WINDOW)
    }

    /// Stops the pump if it runs. Returns whether it was running.
    fn emergency_stop(&mut self, reason: &str) -> bool {
        let Some(pump) = self.pump.as_mut() else {
            return false;
        };
        if !pump.is_running() {
            return false;
        }
        warn!("Emergency pump stop: {reason}");
        if let Err(err) = pump.stop() {
            error!("Emergency stop of pump {} failed: {err}", pump.name());
            self.last_error = Some(err);
        }
        true
    }

    fn process_readings(&mut self, now: Instant) -> Decision {
        let decision = self.evaluate(now);
        match decision {
            Decision::Started | Decision::StoppedEarly => info!(
                "Decision {decision:?} at moisture {:?} %",
                self.soil_reading.map(|reading| reading.moisture)
            ),
            _ => debug!("Decision {decision:?}"),
        }
        self.last_decision = Some(decision);
        decision
    }

    fn evaluate(&mut self, now: Instant) -> Decision {
        let moisture = match self.soil_reading {
            Some(reading) if self.has_fresh_data(now) => reading.moisture,
            _ => {
                self.emergency_stop("sensor data stale");
                return Decision::Stale;
            }
        };
        if !is_percent(moisture) {
            self.emergency_stop("implausible moisture reading");
            warn!("Rejecting moisture reading {moisture} %");
            self.last_error = Some(Error::InvalidReadingValues);
            return Decision::RejectedInvalid;
        }

        let config = self.config;
        let Some(pump) = self.pump.as_mut() else {
            return Decision::NoOp;
        };
        let running = pump.is_running();
        if config.watering_enabled && !running && moisture <= config.moisture_threshold_low {
            match pump.run_for(config.run_duration()) {
                Ok(()) => {
                    self.last_watering = Some(now);
                    Decision::Started
                }
                Err(err) => {
                    self.last_error = Some(err);
                    Decision::NoOp
                }
            }
        } else if running && moisture >= config.moisture_threshold_high {
            match pump.stop() {
                Ok(()) => Decision::StoppedEarly,
                Err(err) => {
                    self.last_error = Some(err);
                    Decision::NoOp
                }
            }
        } else {
            Decision::NoOp
        }
    }

    fn staleness_watchdog(&mut self, now: Instant) {
        if !self.automatic || self.has_fresh_data(now) {
            return;
        }
        if self.emergency_stop("no valid soil reading within the staleness window") {
            self.last_error = Some(Error::SensorReadFailed);
            self.last_decision = Some(Decision::Stale);
        }
    }

    fn log_data_if_due(&mut self, now: Instant) {
        if self
            .last_data_log
            .is_some_and(|at| now.saturating_duration_since(at) < self.config.log_interval())
        {
            return;
        }

        let mut samples: Vec<(&str, &str, f32, SystemTime)> = Vec::new();
        if let Some(env) = self.environment_reading {
            samples.push((ENVIRONMENT_SERIES, "temperature", env.temperature, env.timestamp));
            samples.push((ENVIRONMENT_SERIES, "humidity", env.humidity, env.timestamp));
            samples.push((ENVIRONMENT_SERIES, "pressure", env.pressure, env.timestamp));
        }
        if let Some(soil) = self.soil_reading.filter(|_| self.has_fresh_data(now)) {
            for parameter in [
                SoilParameter::Moisture,
                SoilParameter::Temperature,
                SoilParameter::Ph,
                SoilParameter::Ec,
            ] {
                samples.push((SOIL_SERIES, parameter.name(), soil.value(parameter), soil.timestamp));
            }
            for parameter in [
                SoilParameter::Nitrogen,
                SoilParameter::Phosphorus,
                SoilParameter::Potassium,
            ] {
                let value = soil.value(parameter);
                if value >= 0.0 {
                    samples.push((SOIL_SERIES, parameter.name(), value, soil.timestamp));
                }
            }
        }
        if samples.is_empty() {
            return;
        }

        let Some(storage) = self.storage.as_mut() else {
            return;
        };
        for (sensor, parameter, value, timestamp) in samples {
            if let Err(err) = storage.store_sensor_reading(sensor, parameter, value, timestamp) {
                warn!("Cannot log {sensor} {parameter}: {err}");
            }
        }
        self.last_data_log = Some(now);
    }

    /// Starts the pump regardless of the thresholds; a zero `duration` runs
    /// until [`WateringController::stop_watering`].
    pub fn manual_watering(&mut self, duration: Duration) -> Result<()> {
        self.ensure_initialized()?;
        let Some(pump) = self.pump.as_mut() else {
            return self.fail(Error::PumpInvalid);
        };
        let result = if duration.is_zero() {
            pump.start()
        } else {
            pump.run_for(duration)
        };
        match result {
            Ok(()) => {
                pump.set_manual_mode(true);
                info!("Manual watering started for {duration:?}");
                self.last_watering = Some(Instant::now());
                Ok(())
            }
            Err(err) => self.fail(err),
        }
    }

    pub fn stop_watering(&mut self) -> Result<()> {
        if !self.initialized {
            return self.fail(Error::NotInitialized);
        }
        let Some(pump) = self.pump.as_mut() else {
            return self.fail(Error::PumpInvalid);
        };
        match pump.stop() {
            Ok(()) => {
                info!("Watering stopped by operator");
                Ok(())
            }
            Err(err) => self.fail(err),
        }
    }

    pub fn set_moisture_threshold_low(&mut self, value: f32) -> Result<()> {
        if !is_percent(value) {
            return Err(Error::InvalidArgument);
        }
        self.ensure_initialized()?;
        if value >= self.config.moisture_threshold_high {
            return Err(Error::InvalidThresholdOrder);
        }
        self.config.moisture_threshold_low = value;
        self.save_configuration()
    }

    pub fn set_moisture_threshold_high(&mut self, value: f32) -> Result<()> {
        if !is_percent(value) {
            return Err(Error::InvalidArgument);
        }
        self.ensure_initialized()?;
        if value <= self.config.moisture_threshold_low {
            return Err(Error::InvalidThresholdOrder);
        }
        self.config.moisture_threshold_high = value;
        self.save_configuration()
    }

    /// Duration of an automatic run, `1..=300` seconds.
    pub fn set_watering_duration(&mut self, seconds: u32) -> Result<()> {
        if seconds == 0 || seconds > MAX_WATERING_DURATION {
            return Err(Error::InvalidArgument);
        }
        self.ensure_initialized()?;
        self.config.watering_duration = seconds;
        self.save_configuration()
    }

    pub fn set_min_watering_interval(&mut self, seconds: u64) -> Result<()> {
        if seconds == 0 {
            return Err(Error::InvalidArgument);
        }
        self.ensure_initialized()?;
        self.config.min_watering_interval = seconds;
        self.save_configuration()
    }

    /// Enables or disables automatic starts. Running pumps are not stopped.
    pub fn enable_watering(&mut self, enabled: bool) -> Result<()> {
        self.ensure_initialized()?;
        self.config.watering_enabled = enabled;
        self.save_configuration()
    }

    pub fn is_watering_enabled(&self) -> bool {
        self.config.watering_enabled
    }

    pub fn config(&self) -> &WateringConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Whether a working soil sensor feeds the automatic path.
    pub fn is_automatic(&self) -> bool {
        self.automatic
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last_error
    }

    pub fn last_decision(&self) -> Option<Decision> {
        self.last_decision
    }

    /// Moisture of the last valid soil reading.
    pub fn current_moisture(&self) -> Option<f32> {
        self.soil_reading.map(|reading| reading.moisture)
    }

    pub fn soil_reading(&self) -> Option<SoilReading> {
        self.soil_reading
    }

    pub fn environment_reading(&self) -> Option<EnvironmentReading> {
        self.environment_reading
    }

    pub fn time_since_last_watering(&self) -> Option<Duration> {
        self.time_since_last_watering_at(Instant::now())
    }

    pub fn time_since_last_watering_at(&self, now: Instant) -> Option<Duration> {
        self.last_watering
            .map(|at| now.saturating_duration_since(at))
    }

    pub fn is_pump_running(&mut self) -> bool {
        self.pump.as_mut().is_some_and(|pump| pump.is_running())
    }

    pub fn shared(&self) -> &Arc<SharedReadings> {
        &self.shared
    }

    /// Storage, e.g. for history queries.
    pub fn storage(&self) -> Option<&(dyn DataStorage + Send)> {
        self.storage.as_deref()
    }
}

impl Drop for WateringController {
    fn drop(&mut self) {
        // Join the acquisition thread first so nothing publishes anymore.
        self.runner = Runner::Idle;
        if let Some(pump) = self.pump.as_mut() {
            if pump.is_running() {
                if let Err(err) = pump.stop() {
                    error!("Cannot stop pump {} on shutdown: {err}", pump.name());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::{PumpOutput, TimedPump};
    use crate::sensor::ValidRange;
    use crate::storage::MemoryStorage;
    use assert_matches::assert_matches;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy)]
    struct Probe {
        moisture: f32,
        fail: bool,
        init_fails: bool,
    }

    struct FakeSoil {
        probe: Arc<Mutex<Probe>>,
        reading: Option<SoilReading>,
    }

    impl Sensor for FakeSoil {
        fn initialize(&mut self) -> Result<()> {
            if self.probe.lock().unwrap().init_fails {
                return Err(Error::WrongDeviceAddress);
            }
            Ok(())
        }

        fn read(&mut self) -> Result<()> {
            let probe = *self.probe.lock().unwrap();
            if probe.fail {
                self.reading = None;
                return Err(Error::CrcError {
                    expected: 0x1234,
                    actual: 0x4321,
                });
            }
            let values = [probe.moisture, 21.0, 6.5, 900.0, 12.0, 8.0, 40.0, 55.0];
            self.reading = Some(SoilReading::from_values(
                values,
                Instant::now(),
                SystemTime::now(),
            ));
            Ok(())
        }

        fn is_available(&mut self) -> bool {
            !self.probe.lock().unwrap().fail
        }

        fn last_error(&self) -> Option<Error> {
            None
        }

        fn name(&self) -> &str {
            "fake-soil"
        }
    }

    impl SoilSensor for FakeSoil {
        fn reading(&self) -> Option<SoilReading> {
            self.reading
        }

        fn calibrate(&mut self, _parameter: SoilParameter, _reference: f32) -> Result<f32> {
            Ok(1.0)
        }

        fn calibration_factor(&self, _parameter: SoilParameter) -> f32 {
            1.0
        }

        fn set_valid_range(&mut self, _parameter: SoilParameter, _range: ValidRange) -> Result<()> {
            Ok(())
        }

        fn valid_range(&self, parameter: SoilParameter) -> ValidRange {
            ValidRange::from(parameter)
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Relay(Arc<Mutex<Vec<bool>>>);

    impl PumpOutput for Relay {
        fn set(&mut self, on: bool) -> Result<()> {
            self.0.lock().unwrap().push(on);
            Ok(())
        }
    }

    fn probe(moisture: f32) -> Probe {
        Probe {
            moisture,
            fail: false,
            init_fails: false,
        }
    }

    fn controller(probe: Probe) -> (WateringController, Arc<Mutex<Probe>>, Relay) {
        let probe = Arc::new(Mutex::new(probe));
        let relay = Relay::default();
        let components = Components {
            soil: Some(Box::new(FakeSoil {
                probe: probe.clone(),
                reading: None,
            })),
            environment: None,
            pump: Some(Box::new(TimedPump::new(relay.clone(), "test-pump"))),
            storage: Some(Box::new(MemoryStorage::new())),
        };
        let mut controller = WateringController::new(components).with_background_acquisition(false);
        controller.initialize().unwrap();
        (controller, probe, relay)
    }

    fn cycle(controller: &mut WateringController) -> Instant {
        controller.poll_sensors_now();
        let now = Instant::now();
        controller.update_at(now);
        now
    }

    #[test]
    fn dry_soil_starts_pump() {
        let (mut controller, _, relay) = controller(probe(25.0));
        assert!(controller.is_automatic());
        assert_eq!(controller.time_since_last_watering(), None);
        let now = cycle(&mut controller);
        assert!(controller.is_pump_running());
        assert_eq!(controller.last_decision(), Some(Decision::Started));
        assert_eq!(controller.time_since_last_watering_at(now), Some(Duration::ZERO));
        assert_eq!(controller.current_moisture(), Some(25.0));
        assert_eq!(*relay.0.lock().unwrap(), vec![false, true]);
    }

    #[test]
    fn wet_soil_stops_pump_early() {
        let (mut controller, probe, _) = controller(probe(25.0));
        cycle(&mut controller);
        assert!(controller.is_pump_running());
        probe.lock().unwrap().moisture = 60.0;
        cycle(&mut controller);
        assert!(!controller.is_pump_running());
        assert_eq!(controller.last_decision(), Some(Decision::StoppedEarly));
    }

    #[test]
    fn moisture_between_thresholds_is_no_op() {
        let (mut controller, _, _) = controller(probe(40.0));
        cycle(&mut controller);
        assert!(!controller.is_pump_running());
        assert_eq!(controller.last_decision(), Some(Decision::NoOp));
    }

    #[test]
    fn min_interval_does_not_gate_restart() {
        let (mut controller, probe, _) = controller(probe(25.0));
        cycle(&mut controller);
        probe.lock().unwrap().moisture = 60.0;
        cycle(&mut controller);
        probe.lock().unwrap().moisture = 20.0;
        cycle(&mut controller);
        assert!(controller.is_pump_running());
        assert_eq!(controller.last_decision(), Some(Decision::Started));
    }

    #[test]
    fn implausible_moisture_is_rejected() {
        let (mut controller, probe, _) = controller(probe(25.0));
        cycle(&mut controller);
        assert!(controller.is_pump_running());

        probe.lock().unwrap().moisture = 150.0;
        cycle(&mut controller);
        assert!(!controller.is_pump_running());
        assert_eq!(controller.last_decision(), Some(Decision::RejectedInvalid));
        assert_eq!(controller.last_error(), Some(Error::InvalidReadingValues));

        cycle(&mut controller);
        assert!(!controller.is_pump_running());
    }

    #[test]
    fn sensor_failure_stops_pump() {
        let (mut controller, probe, _) = controller(probe(25.0));
        cycle(&mut controller);
        probe.lock().unwrap().fail = true;
        cycle(&mut controller);
        assert!(!controller.is_pump_running());
        assert_eq!(controller.last_decision(), Some(Decision::SensorFailure));
        assert_eq!(controller.last_error(), Some(Error::SensorReadFailed));
        assert_eq!(controller.current_moisture(), None);
    }

    #[test]
    fn watchdog_stops_pump_without_new_data() {
        let (mut controller, _, _) = controller(probe(25.0));
        let start = cycle(&mut controller);
        assert!(controller.is_pump_running());

        controller.update_at(start + Duration::from_secs(29));
        assert!(controller.is_pump_running());

        controller.update_at(start + Duration::from_secs(31));
        assert!(!controller.is_pump_running());
        assert_eq!(controller.last_decision(), Some(Decision::Stale));
        assert_eq!(controller.last_error(), Some(Error::SensorReadFailed));
    }

    #[test]
    fn busy_shared_region_skips_decision() {
        let (mut controller, _, _) = controller(probe(25.0));
        controller.poll_sensors_now();
        let shared = Arc::clone(controller.shared());
        let guard = shared.try_lock_for(Duration::from_millis(10)).unwrap();
        controller.update_at(Instant::now());
        assert!(!controller.is_pump_running());
        assert_eq!(controller.last_decision(), None);
        drop(guard);

        controller.update_at(Instant::now());
        assert!(controller.is_pump_running());
    }

    #[test]
    fn disabled_watering_never_starts() {
        let (mut controller, _, _) = controller(probe(10.0));
        controller.enable_watering(false).unwrap();
        assert!(!controller.is_watering_enabled());
        cycle(&mut controller);
        assert!(!controller.is_pump_running());
        let blob = controller.storage().unwrap().get_config(CONFIG_KEY, "");
        assert!(blob.contains("\"wateringEnabled\":false"), "{blob}");
    }

    #[test]
    fn initialize_is_idempotent() {
        let (mut controller, _, relay) = controller(probe(40.0));
        controller.initialize().unwrap();
        controller.initialize().unwrap();
        assert_eq!(*relay.0.lock().unwrap(), vec![false]);
        assert!(controller.poll_sensors_now().is_some());
    }

    #[test]
    fn missing_pump_is_fatal() {
        let mut controller = WateringController::new(Components {
            storage: Some(Box::new(MemoryStorage::new())),
            ..Default::default()
        });
        assert_matches!(controller.initialize(), Err(Error::MissingCriticalComponent));
        assert_eq!(controller.last_error(), Some(Error::MissingCriticalComponent));
        assert!(!controller.is_initialized());
        assert_matches!(
            controller.manual_watering(Duration::from_secs(5)),
            Err(Error::MissingCriticalComponent)
        );
    }

    #[test]
    fn degraded_mode_allows_manual_watering() {
        let mut degraded = probe(25.0);
        degraded.init_fails = true;
        let (mut controller, _, _) = controller(degraded);
        assert!(controller.is_initialized());
        assert!(!controller.is_automatic());
        assert_eq!(controller.last_error(), Some(Error::SensorInitFailed));
        assert!(controller.poll_sensors_now().is_none());

        controller.manual_watering(Duration::from_secs(10)).unwrap();
        assert!(controller.is_pump_running());
        controller.update_at(Instant::now() + Duration::from_secs(60));
        assert!(controller.is_pump_running());

        controller.stop_watering().unwrap();
        assert!(!controller.is_pump_running());
    }

    #[test]
    fn manual_watering_without_duration_runs_until_stopped() {
        let mut controller = WateringController::new(Components {
            pump: Some(Box::new(TimedPump::new(Relay::default(), "test-pump"))),
            storage: Some(Box::new(MemoryStorage::new())),
            ..Default::default()
        });
        assert_matches!(controller.stop_watering(), Err(Error::NotInitialized));
        controller.manual_watering(Duration::ZERO).unwrap();
        assert!(controller.is_initialized());
        assert!(controller.is_pump_running());
        controller.stop_watering().unwrap();
        assert!(!controller.is_pump_running());
    }

    #[test]
    fn setters_validate_and_persist() {
        let (mut controller, _, _) = controller(probe(40.0));
        assert_matches!(controller.set_moisture_threshold_low(150.0), Err(Error::InvalidArgument));
        assert_matches!(controller.set_moisture_threshold_low(f32::NAN), Err(Error::InvalidArgument));
        assert_matches!(controller.set_moisture_threshold_low(60.0), Err(Error::InvalidThresholdOrder));
        assert_matches!(controller.set_moisture_threshold_high(30.0), Err(Error::InvalidThresholdOrder));
        controller.set_moisture_threshold_high(70.0).unwrap();
        controller.set_moisture_threshold_low(60.0).unwrap();

        assert_matches!(controller.set_watering_duration(0), Err(Error::InvalidArgument));
        assert_matches!(controller.set_watering_duration(301), Err(Error::InvalidArgument));
        controller.set_watering_duration(300).unwrap();
        assert_matches!(controller.set_min_watering_interval(0), Err(Error::InvalidArgument));
        controller.set_min_watering_interval(3600).unwrap();

        let blob = controller.storage().unwrap().get_config(CONFIG_KEY, "");
        let stored = WateringConfig::from_json(&blob);
        assert_eq!(stored, *controller.config());
        assert_eq!(stored.moisture_threshold_low, 60.0);
        assert_eq!(stored.moisture_threshold_high, 70.0);
        assert_eq!(stored.watering_duration, 300);
        assert_eq!(stored.min_watering_interval, 3600);
    }

    #[test]
    fn stored_config_is_loaded() {
        let mut storage = MemoryStorage::new();
        storage
            .store_config(CONFIG_KEY, r#"{"moistureThresholdLow":20,"wateringDuration":45}"#)
            .unwrap();
        let mut controller = WateringController::new(Components {
            pump: Some(Box::new(TimedPump::new(Relay::default(), "test-pump"))),
            storage: Some(Box::new(storage)),
            ..Default::default()
        });
        controller.initialize().unwrap();
        assert_eq!(controller.config().moisture_threshold_low, 20.0);
        assert_eq!(controller.config().moisture_threshold_high, 55.0);
        assert_eq!(controller.config().run_duration(), Duration::from_secs(45));
    }

    #[test]
    fn config_blob_fallbacks() {
        assert_eq!(WateringConfig::from_json("not json"), WateringConfig::default());
        let inverted = WateringConfig::from_json(
            r#"{"moistureThresholdLow":70,"moistureThresholdHigh":40,"wateringDuration":900}"#,
        );
        assert_eq!(inverted.moisture_threshold_low, 30.0);
        assert_eq!(inverted.moisture_threshold_high, 55.0);
        assert_eq!(inverted.watering_duration, 20);

        let json = WateringConfig::default().to_json().unwrap();
        for key in [
            "sensorReadInterval",
            "dataLogInterval",
            "minWateringInterval",
            "moistureThresholdLow",
            "moistureThresholdHigh",
            "wateringDuration",
            "wateringEnabled",
        ] {
            assert!(json.contains(key), "{key} missing in {json}");
        }
    }

    #[test]
    fn readings_are_logged_once_per_interval() {
        let (mut controller, _, _) = controller(probe(40.0));
        let now = cycle(&mut controller);
        controller.update_at(now + Duration::from_secs(10));

        let storage = controller.storage().unwrap();
        let history = |parameter: &str| {
            storage
                .sensor_readings(
                    SOIL_SERIES,
                    parameter,
                    SystemTime::UNIX_EPOCH,
                    SystemTime::now() + Duration::from_secs(60),
                )
                .unwrap()
        };
        let moisture = history("moisture");
        assert_eq!(moisture.len(), 1);
        assert_eq!(moisture[0].value, 40.0);
        assert_eq!(history("potassium").len(), 1);
        assert!(history("humidity").is_empty());
    }
}
