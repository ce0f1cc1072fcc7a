//! Soil Irrigator CLI
//!
//! A command-line interface (CLI) application that waters plants based on the
//! readings of an RS485 Modbus soil probe.
//!
//! This tool allows users to:
//! - Run the controller, which polls the probe in the background and switches
//!   the pump between the configured moisture thresholds.
//! - Read a soil snapshot and the transport statistics.
//! - Calibrate moisture, pH and EC against reference values.
//! - Water manually and change the persisted controller settings.
//! - Display the logged reading history.
//!
//! The CLI leverages the `irrigator_lib` crate for the protocol, the devices
//! and the decision logic.

use anyhow::{Context, Result, bail};
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use irrigator_lib::controller::{
    CONFIG_KEY, Components, SOIL_SERIES, WateringConfig, WateringController,
};
use irrigator_lib::protocol::SoilParameter;
use irrigator_lib::pump::{SysfsGpio, TimedPump};
use irrigator_lib::sensor::{Sensor, SoilSensor};
use irrigator_lib::serial::{RtsDirection, SerialPortChannel, serial_port_builder};
use irrigator_lib::soil_sensor::ModbusSoilSensor;
use irrigator_lib::storage::{DataStorage, FileStorage};
use irrigator_lib::transport::{AutoDirection, DirectionControl, ModbusTransport};
use log::*;
use std::time::{Duration, SystemTime};
use std::{panic, thread};

mod commandline;
mod config;

type Bus = ModbusTransport<SerialPortChannel, Box<dyn DirectionControl + Send>>;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

fn open_bus(modbus: &config::ModbusConfig) -> Result<Bus> {
    info!(
        "Opening {} at {} baud (RTS direction control: {})",
        modbus.device, modbus.baud_rate, modbus.rts_direction
    );
    let port = serial_port_builder(&modbus.device, modbus.baud_rate)
        .open()
        .with_context(|| format!("Cannot open serial port {}", modbus.device))?;
    let direction: Box<dyn DirectionControl + Send> = if modbus.rts_direction {
        let rts = RtsDirection::new(
            port.try_clone()
                .with_context(|| format!("Cannot clone serial port {}", modbus.device))?,
        );
        Box::new(if modbus.rts_inverted { rts.inverted() } else { rts })
    } else {
        Box::new(AutoDirection)
    };
    let mut bus = ModbusTransport::new(SerialPortChannel::new(port), direction);
    bus.set_timeout(modbus.timeout);
    bus.set_settle_delay(modbus.settle_delay);
    Ok(bus)
}

fn open_soil_sensor(modbus: &config::ModbusConfig) -> Result<ModbusSoilSensor<Bus>> {
    Ok(ModbusSoilSensor::new(open_bus(modbus)?, modbus.address))
}

fn open_pump(pump: &config::PumpConfig) -> Result<TimedPump<SysfsGpio>> {
    let gpio = SysfsGpio::new(pump.gpio).active_low(pump.active_low);
    gpio.export()
        .with_context(|| format!("Cannot export GPIO {}", pump.gpio))?;
    Ok(TimedPump::new(gpio, pump.name.clone()))
}

/// Creates the controller. Without `with_sensors` it only serves manual
/// commands and setting changes.
fn create_controller(config: &config::Config, with_sensors: bool) -> Result<WateringController> {
    let soil = if with_sensors {
        let sensor: Box<dyn SoilSensor + Send> = Box::new(open_soil_sensor(&config.modbus)?);
        Some(sensor)
    } else {
        None
    };
    let mut controller = WateringController::new(Components {
        soil,
        environment: None,
        pump: Some(Box::new(open_pump(&config.pump)?)),
        storage: Some(Box::new(FileStorage::new(&config.storage.data_dir))),
    });
    controller
        .initialize()
        .with_context(|| "Cannot initialize controller")?;
    Ok(controller)
}

fn open_storage(config: &config::Config) -> Result<FileStorage> {
    let mut storage = FileStorage::new(&config.storage.data_dir);
    storage
        .initialize()
        .with_context(|| format!("Cannot open data directory {:?}", config.storage.data_dir))?;
    Ok(storage)
}

fn run(config: &config::Config) -> Result<()> {
    let mut controller = create_controller(config, true)?;
    if let Some(err) = controller.last_error() {
        warn!("Controller runs degraded: {err}");
    }
    info!("Starting main loop, period {:?}", config.controller.loop_period);
    let mut last_decision = None;
    loop {
        controller.update();
        if controller.last_decision() != last_decision {
            last_decision = controller.last_decision();
            if let Some(decision) = last_decision {
                info!(
                    "Decision: {decision:?} (moisture {:?} %)",
                    controller.current_moisture()
                );
            }
        }
        thread::sleep(config.controller.loop_period);
    }
}

fn print_status(config: &config::Config) -> Result<()> {
    let mut sensor = open_soil_sensor(&config.modbus)?;
    let available = sensor.initialize().is_ok() && sensor.read().is_ok();
    println!(
        "Soil probe '{}' at address {}: {}",
        sensor.name(),
        sensor.address(),
        if available { "available" } else { "unavailable" }
    );
    if let Some(err) = sensor.last_error() {
        println!("  Last error: {err} (code {})", err.code());
    }
    let statistics = sensor.client().statistics();
    println!(
        "  Transport: {} successful, {} failed exchanges",
        statistics.success_count, statistics.error_count
    );
    for parameter in [SoilParameter::Moisture, SoilParameter::Ph, SoilParameter::Ec] {
        println!(
            "  Calibration factor {parameter}: {:.3}",
            sensor.calibration_factor(parameter)
        );
    }
    Ok(())
}

fn calibrate(config: &config::Config, parameter: SoilParameter, reference: f32) -> Result<()> {
    println!(
        "The probe must sit in a medium with a known {parameter} of {reference} {}.",
        parameter.unit()
    );
    if !Confirm::new()
        .with_prompt("Do you want to calibrate now?")
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")?
    {
        info!("Calibration aborted by user.");
        return Ok(());
    }
    let mut sensor = open_soil_sensor(&config.modbus)?;
    sensor
        .initialize()
        .with_context(|| "Cannot reach soil probe")?;
    let factor = sensor
        .calibrate(parameter, reference)
        .with_context(|| format!("Cannot calibrate {parameter}"))?;
    println!("Calibration factor for {parameter} set to {factor:.3}.");
    Ok(())
}

fn water(config: &config::Config, duration: Duration) -> Result<()> {
    if duration.is_zero() {
        bail!("The watering duration must be greater than zero");
    }
    let mut controller = create_controller(config, false)?;
    controller
        .manual_watering(duration)
        .with_context(|| "Cannot start watering")?;
    println!("Watering for {} ...", humantime::format_duration(duration));
    while controller.is_pump_running() {
        controller.update();
        thread::sleep(config.controller.loop_period);
    }
    println!("Watering finished.");
    Ok(())
}

fn apply_setting(config: &config::Config, setting: &commandline::Setting) -> Result<()> {
    let mut controller = create_controller(config, false)?;
    match setting {
        commandline::Setting::ThresholdLow { value } => controller
            .set_moisture_threshold_low(*value)
            .with_context(|| format!("Cannot set low moisture threshold to {value} %"))?,
        commandline::Setting::ThresholdHigh { value } => controller
            .set_moisture_threshold_high(*value)
            .with_context(|| format!("Cannot set high moisture threshold to {value} %"))?,
        commandline::Setting::RunDuration { value } => {
            let seconds = u32::try_from(value.as_secs()).unwrap_or(u32::MAX);
            controller
                .set_watering_duration(seconds)
                .with_context(|| {
                    format!("Cannot set watering duration to {}", humantime::format_duration(*value))
                })?
        }
        commandline::Setting::Interval { value } => controller
            .set_min_watering_interval(value.as_secs())
            .with_context(|| {
                format!("Cannot set watering interval to {}", humantime::format_duration(*value))
            })?,
        commandline::Setting::Enabled { value } => controller
            .enable_watering(*value)
            .with_context(|| "Cannot change automatic watering")?,
    }
    print_config(controller.config());
    Ok(())
}

fn print_config(config: &WateringConfig) {
    println!(
        "Moisture thresholds: start at {} %, stop at {} %",
        config.moisture_threshold_low, config.moisture_threshold_high
    );
    println!(
        "Watering duration: {}",
        humantime::format_duration(config.run_duration())
    );
    println!(
        "Minimum watering interval: {}",
        humantime::format_duration(Duration::from_secs(config.min_watering_interval))
    );
    println!(
        "Sensor read interval: {}",
        humantime::format_duration(config.read_interval())
    );
    println!(
        "Data log interval: {}",
        humantime::format_duration(config.log_interval())
    );
    println!(
        "Automatic watering: {}",
        if config.watering_enabled { "enabled" } else { "disabled" }
    );
}

fn print_history(config: &config::Config, parameter: SoilParameter, since: Duration) -> Result<()> {
    let storage = open_storage(config)?;
    let to = SystemTime::now();
    let from = to.checked_sub(since).unwrap_or(SystemTime::UNIX_EPOCH);
    let entries = storage
        .sensor_readings(SOIL_SERIES, parameter.name(), from, to)
        .with_context(|| format!("Cannot read {parameter} history"))?;
    if entries.is_empty() {
        println!("No {parameter} readings logged in the last {}", humantime::format_duration(since));
    }
    for entry in entries {
        println!(
            "{}  {:.1} {}",
            humantime::format_rfc3339_seconds(entry.timestamp),
            entry.value,
            parameter.unit()
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "Irrigator CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    let mut config = config::load_config(&args.config)?;
    if let Some(device) = &args.device {
        config.modbus.device = device.clone();
    }
    if let Some(address) = args.address {
        config.modbus.address = address;
    }

    match &args.command {
        commandline::CliCommands::Run => run(&config)?,
        commandline::CliCommands::Read => {
            info!("Executing: Read soil probe");
            let mut sensor = open_soil_sensor(&config.modbus)?;
            sensor.read().with_context(|| "Cannot read soil probe")?;
            if let Some(reading) = sensor.reading() {
                println!("Soil: {reading}");
            }
        }
        commandline::CliCommands::Status => print_status(&config)?,
        commandline::CliCommands::Calibrate {
            parameter,
            reference,
        } => calibrate(&config, (*parameter).into(), *reference)?,
        commandline::CliCommands::Water { duration } => water(&config, *duration)?,
        commandline::CliCommands::Set { setting } => apply_setting(&config, setting)?,
        commandline::CliCommands::ShowConfig => {
            let storage = open_storage(&config)?;
            print_config(&WateringConfig::from_json(
                &storage.get_config(CONFIG_KEY, "{}"),
            ));
        }
        commandline::CliCommands::History { parameter, since } => {
            print_history(&config, *parameter, *since)?
        }
    }

    Ok(())
}
