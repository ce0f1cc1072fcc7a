use anyhow::{Context, Result};
use irrigator_lib::{protocol as proto, serial, transport};
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ModbusConfig {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_address")]
    pub address: u8,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Settling time after switching the transceiver direction.
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Drive DE/RE through RTS. Disable for adapters with automatic direction control.
    #[serde(default = "default_true")]
    pub rts_direction: bool,
    #[serde(default)]
    pub rts_inverted: bool,
}

fn default_device() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn default_baud_rate() -> u32 {
    serial::DEFAULT_BAUD_RATE
}

fn default_address() -> u8 {
    proto::FACTORY_DEFAULT_ADDRESS
}

fn default_timeout() -> Duration {
    transport::DEFAULT_TIMEOUT
}

fn default_settle_delay() -> Duration {
    transport::DEFAULT_SETTLE_DELAY
}

fn default_true() -> bool {
    true
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud_rate: default_baud_rate(),
            address: default_address(),
            timeout: default_timeout(),
            settle_delay: default_settle_delay(),
            rts_direction: default_true(),
            rts_inverted: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PumpConfig {
    /// Sysfs GPIO number of the pump relay.
    #[serde(default = "default_gpio")]
    pub gpio: u32,
    #[serde(default)]
    pub active_low: bool,
    #[serde(default = "default_pump_name")]
    pub name: String,
}

fn default_gpio() -> u32 {
    17
}

fn default_pump_name() -> String {
    String::from("pump")
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            gpio: default_gpio(),
            active_low: false,
            name: default_pump_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("irrigator-data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Period of the main control loop.
    #[serde(default = "default_loop_period", with = "humantime_serde")]
    pub loop_period: Duration,
}

fn default_loop_period() -> Duration {
    Duration::from_millis(100)
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            loop_period: default_loop_period(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub modbus: ModbusConfig,
    #[serde(default)]
    pub pump: PumpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
}

/// Loads the configuration, falling back to the defaults when `path` does not exist.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        log::debug!("No config file {path:?}, using defaults");
        return Ok(Config::default());
    }
    log::debug!("Loading config file from {path:?}");
    let config_file =
        File::open(path).with_context(|| format!("Cannot open config file {path:?}"))?;
    let config: Config = serde_yaml::from_reader(&config_file)
        .with_context(|| format!("Cannot parse config file {path:?}"))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let config: Config = serde_yaml::from_str(
            "modbus:\n  address: 3\n  timeout: 500ms\npump:\n  gpio: 27\n  active_low: true\n",
        )
        .unwrap();
        assert_eq!(config.modbus.address, 3);
        assert_eq!(config.modbus.timeout, Duration::from_millis(500));
        assert_eq!(config.modbus.baud_rate, 9600);
        assert!(config.modbus.rts_direction);
        assert_eq!(config.pump.gpio, 27);
        assert!(config.pump.active_low);
        assert_eq!(config.storage.data_dir, PathBuf::from("irrigator-data"));
        assert_eq!(config.controller.loop_period, Duration::from_millis(100));
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.yml")).unwrap();
        assert_eq!(config.modbus.address, 1);
        assert_eq!(config.pump.name, "pump");
    }

    #[test]
    fn broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yml");
        std::fs::write(&path, "modbus: [").unwrap();
        assert!(load_config(&path).is_err());
    }
}
