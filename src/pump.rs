//! Water pump actuator.
//!
//! A [`TimedPump`] switches a [`PumpOutput`] on and off and stops itself once
//! a timed run has elapsed. The check is poll driven: [`Pump::update`] must be
//! called regularly from the control loop.

use crate::{Error, Result};
use log::*;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Common behaviour of every actuator.
pub trait Actuator {
    fn initialize(&mut self) -> Result<()>;
    fn is_available(&self) -> bool;
    fn last_error(&self) -> Option<Error>;
    fn name(&self) -> &str;
}

/// A pump that can run indefinitely or for a fixed duration.
pub trait Pump: Actuator {
    /// Starts an indefinite run.
    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Runs for `duration`; a zero duration stops the pump.
    fn run_for(&mut self, duration: Duration) -> Result<()>;

    /// Also ends a timed run whose duration has elapsed.
    fn is_running(&mut self) -> bool;

    /// Elapsed time of the current run, zero when stopped.
    fn run_time(&self) -> Duration;

    /// Configured duration of the current run, zero for an indefinite run.
    fn run_duration(&self) -> Duration;

    /// Must be polled regularly to end timed runs.
    fn update(&mut self);

    /// Informational flag, `true` while an operator-commanded run is active.
    fn is_manual_mode(&self) -> bool;

    fn set_manual_mode(&mut self, manual: bool);
}

/// The switched output driving the pump relay or MOSFET.
pub trait PumpOutput {
    fn set(&mut self, on: bool) -> Result<()>;
}

/// A GPIO line exported through the Linux sysfs interface.
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    pin: u32,
    active_low: bool,
    root: PathBuf,
}

impl SysfsGpio {
    pub fn new(pin: u32) -> Self {
        Self {
            pin,
            active_low: false,
            root: PathBuf::from("/sys/class/gpio"),
        }
    }

    /// Drives the line low to switch the pump on.
    pub fn active_low(mut self, active_low: bool) -> Self {
        self.active_low = active_low;
        self
    }

    /// Uses a different sysfs root, e.g. for tests.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    fn pin_dir(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.pin))
    }

    /// Exports the pin and configures it as output.
    pub fn export(&self) -> Result<()> {
        if !self.pin_dir().exists() {
            fs::write(self.root.join("export"), self.pin.to_string())?;
        }
        fs::write(self.pin_dir().join("direction"), "out")?;
        Ok(())
    }
}

impl PumpOutput for SysfsGpio {
    fn set(&mut self, on: bool) -> Result<()> {
        let level = if on != self.active_low { "1" } else { "0" };
        fs::write(self.pin_dir().join("value"), level)?;
        Ok(())
    }
}

/// Pump with a poll-driven timed run.
#[derive(Debug)]
pub struct TimedPump<O: PumpOutput> {
    output: O,
    name: String,
    initialized: bool,
    last_error: Option<Error>,
    started_at: Option<Instant>,
    run_duration: Duration,
    manual_mode: bool,
}

impl<O: PumpOutput> TimedPump<O> {
    pub fn new(output: O, name: impl Into<String>) -> Self {
        Self {
            output,
            name: name.into(),
            initialized: false,
            last_error: None,
            started_at: None,
            run_duration: Duration::ZERO,
            manual_mode: false,
        }
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    fn switch(&mut self, on: bool) -> Result<()> {
        match self.output.set(on) {
            Ok(()) => Ok(()),
            Err(err) => {
                error!("Pump {}: cannot switch output: {err}", self.name);
                self.last_error = Some(err);
                Err(err)
            }
        }
    }

    /// Starts an indefinite run at `now`.
    pub fn start_at(&mut self, now: Instant) -> Result<()> {
        if !self.initialized {
            self.initialize()?;
        }
        self.switch(true)?;
        self.started_at = Some(now);
        self.run_duration = Duration::ZERO;
        self.manual_mode = false;
        info!("Pump {} started", self.name);
        Ok(())
    }

    /// Starts a run of `duration` at `now`.
    pub fn run_for_at(&mut self, duration: Duration, now: Instant) -> Result<()> {
        if duration.is_zero() {
            return self.stop();
        }
        self.start_at(now)?;
        self.run_duration = duration;
        info!("Pump {} runs for {duration:?}", self.name);
        Ok(())
    }

    /// Ends a timed run once its duration has elapsed at `now`.
    pub fn update_at(&mut self, now: Instant) {
        let Some(started_at) = self.started_at else {
            return;
        };
        if self.run_duration.is_zero() {
            return;
        }
        let elapsed = now.saturating_duration_since(started_at);
        if elapsed >= self.run_duration {
            debug!(
                "Pump {}: timed run of {:?} elapsed after {elapsed:?}",
                self.name, self.run_duration
            );
            if let Err(err) = self.stop() {
                warn!("Pump {}: timed stop failed: {err}", self.name);
            }
        }
    }

    pub fn is_running_at(&mut self, now: Instant) -> bool {
        self.update_at(now);
        self.started_at.is_some()
    }
}

impl<O: PumpOutput> Actuator for TimedPump<O> {
    fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.switch(false)?;
        self.initialized = true;
        self.last_error = None;
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.initialized
    }

    fn last_error(&self) -> Option<Error> {
        self.last_error
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<O: PumpOutput> Pump for TimedPump<O> {
    fn start(&mut self) -> Result<()> {
        self.start_at(Instant::now())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.initialized {
            self.last_error = Some(Error::NotInitialized);
            return Err(Error::NotInitialized);
        }
        self.switch(false)?;
        if let Some(started_at) = self.started_at.take() {
            info!(
                "Pump {} stopped after {:?} ({} mode)",
                self.name,
                started_at.elapsed(),
                if self.manual_mode { "manual" } else { "automatic" }
            );
        }
        self.manual_mode = false;
        Ok(())
    }

    fn run_for(&mut self, duration: Duration) -> Result<()> {
        self.run_for_at(duration, Instant::now())
    }

    fn is_running(&mut self) -> bool {
        self.is_running_at(Instant::now())
    }

    fn run_time(&self) -> Duration {
        self.started_at
            .map(|started_at| started_at.elapsed())
            .unwrap_or_default()
    }

    fn run_duration(&self) -> Duration {
        self.run_duration
    }

    fn update(&mut self) {
        self.update_at(Instant::now())
    }

    fn is_manual_mode(&self) -> bool {
        self.manual_mode
    }

    fn set_manual_mode(&mut self, manual: bool) {
        self.manual_mode = manual;
    }
}

impl<O: PumpOutput> Drop for TimedPump<O> {
    fn drop(&mut self) {
        if self.started_at.is_some() {
            let _ = self.output.set(false);
        }
    }
}
