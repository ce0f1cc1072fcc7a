use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use irrigator_lib::protocol::{self as proto, SoilParameter};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "irrigator.yml";

fn parse_address(s: &str) -> Result<u8, String> {
    clap_num::maybe_hex_range::<u8>(s, proto::ADDRESS_MIN, proto::ADDRESS_MAX)
}

fn parse_percent(s: &str) -> Result<f32, String> {
    let value = s
        .parse::<f32>()
        .map_err(|e| format!("Invalid moisture value format: {e}"))?;
    if (0.0..=100.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("Moisture {value} % is outside 0..100 %"))
    }
}

fn parse_parameter(s: &str) -> Result<SoilParameter, String> {
    s.parse::<SoilParameter>()
        .map_err(|_| format!("Unknown soil parameter '{s}'"))
}

/// Soil parameters that support a calibration.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum CalibrationTarget {
    Moisture,
    Ph,
    Ec,
}

impl From<CalibrationTarget> for SoilParameter {
    fn from(target: CalibrationTarget) -> Self {
        match target {
            CalibrationTarget::Moisture => SoilParameter::Moisture,
            CalibrationTarget::Ph => SoilParameter::Ph,
            CalibrationTarget::Ec => SoilParameter::Ec,
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Setting {
    /// Start watering at or below this soil moisture (%).
    ThresholdLow {
        #[arg(value_parser = parse_percent)]
        value: f32,
    },
    /// Stop watering at or above this soil moisture (%).
    ThresholdHigh {
        #[arg(value_parser = parse_percent)]
        value: f32,
    },
    /// Duration of one automatic watering run (e.g. "20s", "2m").
    /// At most 5 minutes.
    #[command(name = "duration", verbatim_doc_comment)]
    RunDuration {
        #[arg(value_parser = humantime::parse_duration)]
        value: Duration,
    },
    /// Minimum interval between two watering runs (e.g. "6h").
    Interval {
        #[arg(value_parser = humantime::parse_duration)]
        value: Duration,
    },
    /// Enable or disable automatic watering ("true"/"false", "on"/"off").
    Enabled {
        #[arg(action = ArgAction::Set, value_parser = clap::builder::BoolishValueParser::new())]
        value: bool,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run the controller: poll the soil probe in the background and water
    /// automatically between the configured moisture thresholds.
    #[clap(verbatim_doc_comment)]
    Run,

    /// Read and display one complete soil probe snapshot.
    Read,

    /// Probe the soil sensor and display the transport statistics.
    Status,

    /// Calibrate a soil parameter against a reference value.
    /// The probe must sit in a medium with the known reference value.
    /// The learned factor is also stored in the probe.
    #[clap(verbatim_doc_comment)]
    Calibrate {
        #[arg(value_enum)]
        parameter: CalibrationTarget,
        /// The true value of the reference medium.
        reference: f32,
    },

    /// Water manually for the given duration (e.g. "30s"), ignoring the thresholds.
    Water {
        #[arg(value_parser = humantime::parse_duration)]
        duration: Duration,
    },

    /// Change a persisted controller setting.
    Set {
        #[command(subcommand)]
        setting: Setting,
    },

    /// Display the persisted controller settings.
    ShowConfig,

    /// Display the logged history of a soil parameter.
    History {
        /// moisture, temperature, ph, ec, nitrogen, phosphorus, potassium
        #[arg(value_parser = parse_parameter)]
        parameter: SoilParameter,
        /// How far back to look (e.g. "12h", "7days").
        #[arg(long, default_value = "1day", value_parser = humantime::parse_duration)]
        since: Duration,
    },
}

const fn about_text() -> &'static str {
    "Soil Irrigator CLI - Water plants based on an RS485 Modbus soil probe."
}

#[derive(Parser, Debug)]
#[command(name="irrigator", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// The YAML configuration file. Defaults are used when it does not exist.
    #[arg(global = true, short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Serial port device, overrides the configuration.
    /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
    #[arg(global = true, short, long, verbatim_doc_comment)]
    pub device: Option<String>,

    /// Modbus address of the soil probe (1 to 247), overrides the configuration.
    /// Can be specified in decimal or hexadecimal (e.g., "0x01").
    #[arg(global = true, short, long, value_parser = parse_address, verbatim_doc_comment)]
    pub address: Option<u8>,

    #[command(subcommand)]
    pub command: CliCommands,
}
