//! Persistent storage of configuration blobs and reading history.

use crate::{Error, Result};
use log::*;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One stored sample of the reading history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryEntry {
    pub timestamp: SystemTime,
    pub value: f32,
}

/// Key/value configuration plus an append-only reading history.
pub trait DataStorage {
    fn initialize(&mut self) -> Result<()>;

    /// Returns the blob stored under `key`, or `default` when there is none.
    fn get_config(&self, key: &str, default: &str) -> String;

    /// Replaces the blob stored under `key`.
    fn store_config(&mut self, key: &str, value: &str) -> Result<()>;

    fn store_sensor_reading(
        &mut self,
        sensor: &str,
        parameter: &str,
        value: f32,
        timestamp: SystemTime,
    ) -> Result<()>;

    /// Samples of `sensor`/`parameter` with `from <= timestamp <= to`, oldest first.
    fn sensor_readings(
        &self,
        sensor: &str,
        parameter: &str,
        from: SystemTime,
        to: SystemTime,
    ) -> Result<Vec<HistoryEntry>>;
}

/// Storage kept in memory only.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    config: BTreeMap<String, String>,
    history: Vec<(String, String, HistoryEntry)>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataStorage for MemoryStorage {
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn get_config(&self, key: &str, default: &str) -> String {
        self.config
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn store_config(&mut self, key: &str, value: &str) -> Result<()> {
        self.config.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn store_sensor_reading(
        &mut self,
        sensor: &str,
        parameter: &str,
        value: f32,
        timestamp: SystemTime,
    ) -> Result<()> {
        self.history.push((
            sensor.to_string(),
            parameter.to_string(),
            HistoryEntry { timestamp, value },
        ));
        Ok(())
    }

    fn sensor_readings(
        &self,
        sensor: &str,
        parameter: &str,
        from: SystemTime,
        to: SystemTime,
    ) -> Result<Vec<HistoryEntry>> {
        Ok(self
            .history
            .iter()
            .filter(|(s, p, entry)| {
                s == sensor && p == parameter && entry.timestamp >= from && entry.timestamp <= to
            })
            .map(|(_, _, entry)| *entry)
            .collect())
    }
}

const CONFIG_FILE: &str = "config.yml";
const HISTORY_DIR: &str = "history";

/// Storage in a data directory.
///
/// Configuration blobs live in one YAML map (`config.yml`), the history in
/// one `<sensor>_<parameter>.csv` file per series with `unix_millis,value`
/// lines.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    config: BTreeMap<String, String>,
    initialized: bool,
}

fn storage_error(context: &str, err: impl std::fmt::Display) -> Error {
    warn!("Storage: {context}: {err}");
    Error::Storage
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            config: BTreeMap::new(),
            initialized: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    fn series_path(&self, sensor: &str, parameter: &str) -> PathBuf {
        self.dir
            .join(HISTORY_DIR)
            .join(format!("{sensor}_{parameter}.csv"))
    }

    fn write_config(&self) -> Result<()> {
        let yaml = serde_yaml::to_string(&self.config)
            .map_err(|err| storage_error("cannot serialize config", err))?;
        // Write to a sibling file first so a crash never leaves half a config.
        let tmp = self.config_path().with_extension("yml.tmp");
        fs::write(&tmp, yaml).map_err(|err| storage_error("cannot write config", err))?;
        fs::rename(&tmp, self.config_path())
            .map_err(|err| storage_error("cannot replace config", err))
    }
}

impl DataStorage for FileStorage {
    fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        fs::create_dir_all(self.dir.join(HISTORY_DIR)).map_err(|err| {
            storage_error(&format!("cannot create {}", self.dir.display()), err);
            Error::StorageInitFailed
        })?;
        let path = self.config_path();
        if path.exists() {
            let file = File::open(&path).map_err(|err| {
                storage_error("cannot open config", err);
                Error::StorageInitFailed
            })?;
            self.config = serde_yaml::from_reader(file).map_err(|err| {
                storage_error("cannot parse config", err);
                Error::StorageInitFailed
            })?;
        }
        debug!("Storage initialized in {}", self.dir.display());
        self.initialized = true;
        Ok(())
    }

    fn get_config(&self, key: &str, default: &str) -> String {
        self.config
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn store_config(&mut self, key: &str, value: &str) -> Result<()> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        self.config.insert(key.to_string(), value.to_string());
        self.write_config()
    }

    fn store_sensor_reading(
        &mut self,
        sensor: &str,
        parameter: &str,
        value: f32,
        timestamp: SystemTime,
    ) -> Result<()> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        let millis = timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.series_path(sensor, parameter))
            .map_err(|err| storage_error("cannot open history", err))?;
        writeln!(file, "{millis},{value}").map_err(|err| storage_error("cannot append history", err))
    }

    fn sensor_readings(
        &self,
        sensor: &str,
        parameter: &str,
        from: SystemTime,
        to: SystemTime,
    ) -> Result<Vec<HistoryEntry>> {
        let path = self.series_path(sensor, parameter);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).map_err(|err| storage_error("cannot open history", err))?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|err| storage_error("cannot read history", err))?;
            let Some((millis, value)) = line.split_once(',') else {
                continue;
            };
            let (Ok(millis), Ok(value)) = (millis.trim().parse::<u64>(), value.trim().parse::<f32>()) else {
                debug!("Storage: skipping malformed history line {line:?}");
                continue;
            };
            let timestamp = UNIX_EPOCH + Duration::from_millis(millis);
            if timestamp >= from && timestamp <= to {
                entries.push(HistoryEntry { timestamp, value });
            }
        }
        Ok(entries)
    }
}
