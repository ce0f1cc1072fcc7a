//! Background sensor acquisition and the region it shares with the control loop.
//!
//! The acquisition task is the only user of the sensors (and therefore of the
//! Modbus transport). It performs all bus I/O first and then publishes the
//! result under the lock of [`SharedReadings`], so the lock is only ever held
//! for copying already materialized values.

use crate::sensor::{EnvironmentReading, EnvironmentalSensor, Sensor, SoilReading, SoilSensor};
use log::*;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Upper bound for the publisher to wait for the shared region.
pub const PUBLISH_LOCK_TIMEOUT: Duration = Duration::from_millis(500);
/// Lower bound of the acquisition period.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Longest single sleep, so a stop request is noticed quickly.
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Content of the shared region.
#[derive(Debug, Default, Clone, Copy)]
pub struct SharedState {
    /// Latest soil snapshot, `None` after a failed read.
    pub soil: Option<SoilReading>,
    /// Whether the last soil read succeeded.
    pub soil_ok: bool,
    pub environment: Option<EnvironmentReading>,
    pub environment_ok: bool,
    /// Set by every publish, cleared by the consumer.
    pub new_data: bool,
}

/// Outcome of one poll cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollResult {
    pub soil: Option<SoilReading>,
    pub soil_ok: bool,
    pub environment: Option<EnvironmentReading>,
    pub environment_ok: bool,
}

/// The mutex guarded region between the acquisition task and the control loop.
#[derive(Debug, Default)]
pub struct SharedReadings {
    state: Mutex<SharedState>,
}

impl SharedReadings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the region, giving up after `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<MutexGuard<'_, SharedState>> {
        self.state.try_lock_for(timeout)
    }

    /// Publishes a poll result and raises the new data flag.
    ///
    /// Returns `false` when the region could not be locked in time; the
    /// result is dropped and the next cycle publishes again.
    pub fn publish(&self, result: PollResult) -> bool {
        let Some(mut state) = self.state.try_lock_for(PUBLISH_LOCK_TIMEOUT) else {
            warn!("Shared readings busy, dropping poll result");
            return false;
        };
        state.soil = result.soil;
        state.soil_ok = result.soil_ok;
        state.environment = result.environment;
        state.environment_ok = result.environment_ok;
        state.new_data = true;
        true
    }
}

/// Polls the sensors and publishes into [`SharedReadings`].
pub struct Acquisition {
    soil: Option<Box<dyn SoilSensor + Send>>,
    environment: Option<Box<dyn EnvironmentalSensor + Send>>,
    shared: Arc<SharedReadings>,
}

impl std::fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquisition")
            .field("soil", &self.soil.as_ref().map(|sensor| sensor.name().to_string()))
            .field(
                "environment",
                &self.environment.as_ref().map(|sensor| sensor.name().to_string()),
            )
            .finish()
    }
}

impl Acquisition {
    pub fn new(
        soil: Option<Box<dyn SoilSensor + Send>>,
        environment: Option<Box<dyn EnvironmentalSensor + Send>>,
        shared: Arc<SharedReadings>,
    ) -> Self {
        Self {
            soil,
            environment,
            shared,
        }
    }

    pub fn shared(&self) -> &Arc<SharedReadings> {
        &self.shared
    }

    /// Reads every present sensor once and publishes the outcome.
    ///
    /// A failure of one sensor does not keep the other from updating.
    pub fn poll_once(&mut self) -> PollResult {
        let mut result = PollResult::default();

        if let Some(soil) = self.soil.as_mut() {
            match soil.read() {
                Ok(()) => {
                    result.soil = soil.reading();
                    result.soil_ok = result.soil.is_some();
                }
                Err(err) => warn!("{}: read failed: {err}", soil.name()),
            }
        }

        if let Some(environment) = self.environment.as_mut() {
            match environment.read() {
                Ok(()) => {
                    result.environment = environment.reading();
                    result.environment_ok = result.environment.is_some();
                }
                Err(err) => warn!("{}: read failed: {err}", environment.name()),
            }
        }

        self.shared.publish(result);
        result
    }

    /// Runs [`Acquisition::poll_once`] on a strict periodic schedule in a
    /// background thread.
    ///
    /// Ticks that were missed because a poll overran are skipped, not caught up.
    pub fn spawn(mut self, interval: Duration) -> std::io::Result<AcquisitionHandle> {
        let interval = interval.max(MIN_POLL_INTERVAL);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name(String::from("acquisition"))
            .spawn(move || {
                debug!("Acquisition started, interval {interval:?}");
                let mut next_tick = Instant::now();
                while !thread_stop.load(Ordering::Acquire) {
                    self.poll_once();
                    next_tick = next_tick_after(next_tick, interval, Instant::now());
                    loop {
                        let now = Instant::now();
                        if now >= next_tick || thread_stop.load(Ordering::Acquire) {
                            break;
                        }
                        thread::sleep((next_tick - now).min(MAX_SLEEP_SLICE));
                    }
                }
                debug!("Acquisition stopped");
                self
            })?;
        Ok(AcquisitionHandle {
            stop,
            thread: Some(thread),
        })
    }
}

/// The tick following `tick`, skipping every tick already in the past at `now`.
fn next_tick_after(tick: Instant, interval: Duration, now: Instant) -> Instant {
    let next = tick + interval;
    if next > now {
        return next;
    }
    let behind = now - next;
    let missed = (behind.as_nanos() / interval.as_nanos()) as u32 + 1;
    next + interval * missed
}

/// Handle of the background acquisition thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct AcquisitionHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Acquisition>>,
}

impl AcquisitionHandle {
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Stops the thread and hands the sensors back.
    pub fn shutdown(mut self) -> Option<Acquisition> {
        self.stop_and_join()
    }

    fn stop_and_join(&mut self) -> Option<Acquisition> {
        self.stop.store(true, Ordering::Release);
        let thread = self.thread.take()?;
        match thread.join() {
            Ok(acquisition) => Some(acquisition),
            Err(_) => {
                error!("Acquisition thread panicked");
                None
            }
        }
    }
}

impl Drop for AcquisitionHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SoilParameter;
    use crate::sensor::ValidRange;
    use crate::{Error, Result};
    use std::sync::atomic::AtomicUsize;
    use std::time::SystemTime;

    struct CountingSoil {
        reads: Arc<AtomicUsize>,
        fail: bool,
        reading: Option<SoilReading>,
    }

    impl Sensor for CountingSoil {
        fn initialize(&mut self) -> Result<()> {
            Ok(())
        }

        fn read(&mut self) -> Result<()> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                self.reading = None;
                return Err(Error::CrcError {
                    expected: 0,
                    actual: 1,
                });
            }
            let values = [40.0, 20.0, 6.5, 900.0, 10.0, 10.0, 10.0, 50.0];
            self.reading = Some(SoilReading::from_values(
                values,
                Instant::now(),
                SystemTime::now(),
            ));
            Ok(())
        }

        fn is_available(&mut self) -> bool {
            !self.fail
        }

        fn last_error(&self) -> Option<Error> {
            None
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    impl SoilSensor for CountingSoil {
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

    struct BrokenEnvironment;

    impl Sensor for BrokenEnvironment {
        fn initialize(&mut self) -> Result<()> {
            Ok(())
        }

        fn read(&mut self) -> Result<()> {
            Err(Error::SensorReadFailed)
        }

        fn is_available(&mut self) -> bool {
            false
        }

        fn last_error(&self) -> Option<Error> {
            Some(Error::SensorReadFailed)
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    impl EnvironmentalSensor for BrokenEnvironment {
        fn reading(&self) -> Option<EnvironmentReading> {
            None
        }
    }

    fn soil(fail: bool) -> (Box<dyn SoilSensor + Send>, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let sensor = CountingSoil {
            reads: reads.clone(),
            fail,
            reading: None,
        };
        (Box::new(sensor), reads)
    }

    #[test]
    fn poll_publishes_soil_despite_environment_failure() {
        let shared = Arc::new(SharedReadings::new());
        let (soil, _) = soil(false);
        let mut acquisition =
            Acquisition::new(Some(soil), Some(Box::new(BrokenEnvironment)), shared.clone());
        let result = acquisition.poll_once();
        assert!(result.soil_ok);
        assert!(!result.environment_ok);

        let state = shared.try_lock_for(Duration::from_millis(10)).unwrap();
        assert!(state.new_data);
        assert!(state.soil_ok);
        assert_eq!(state.soil.map(|reading| reading.moisture), Some(40.0));
        assert!(state.environment.is_none());
    }

    #[test]
    fn failed_read_publishes_failure() {
        let shared = Arc::new(SharedReadings::new());
        let (soil, _) = soil(true);
        let mut acquisition = Acquisition::new(Some(soil), None, shared.clone());
        acquisition.poll_once();
        let state = shared.try_lock_for(Duration::from_millis(10)).unwrap();
        assert!(state.new_data);
        assert!(!state.soil_ok);
        assert!(state.soil.is_none());
    }

    #[test]
    fn publish_gives_up_when_locked() {
        let shared = SharedReadings::new();
        let guard = shared.try_lock_for(Duration::from_millis(10)).unwrap();
        thread::scope(|scope| {
            let published = scope.spawn(|| shared.publish(PollResult::default()));
            assert!(!published.join().unwrap());
        });
        drop(guard);
        assert!(shared.publish(PollResult::default()));
    }

    #[test]
    fn background_thread_polls_periodically() {
        let shared = Arc::new(SharedReadings::new());
        let (soil, reads) = soil(false);
        let handle = Acquisition::new(Some(soil), None, shared.clone())
            .spawn(Duration::from_millis(100))
            .unwrap();
        assert!(handle.is_running());
        thread::sleep(Duration::from_millis(350));
        let acquisition = handle.shutdown().unwrap();
        let polls = reads.load(Ordering::SeqCst);
        assert!((3..=5).contains(&polls), "polled {polls} times");
        assert!(acquisition.soil.is_some());
    }

    #[test]
    fn missed_ticks_are_skipped() {
        let start = Instant::now();
        let interval = Duration::from_secs(1);
        assert_eq!(
            next_tick_after(start, interval, start + Duration::from_millis(200)),
            start + interval
        );
        assert_eq!(
            next_tick_after(start, interval, start + Duration::from_millis(3500)),
            start + Duration::from_secs(4)
        );
        assert_eq!(
            next_tick_after(start, interval, start + interval),
            start + Duration::from_secs(2)
        );
    }
}
