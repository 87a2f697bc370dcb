//! Station configuration
//!
//! TOML-backed configuration for one acquisition station. Every section
//! falls back to the constants in [`super::defaults`], so an empty file (or
//! no file at all) yields a working six-channel setup.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::defaults::*;
use crate::acquisition::{
    FrameParser, SerialPortConnector, SerialSettings, SimulatedConnector, TransportConnector,
};
use crate::storage::StoragePaths;
use crate::types::{ChannelSet, PhaseKind, PhaseProfile};

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "ENOSE_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "enose_config.toml";

// ============================================================================
// Root Config
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StationConfig {
    pub serial: SerialConfig,
    pub channels: ChannelsConfig,
    pub phases: PhasesConfig,
    pub timing: TimingConfig,
    pub storage: StorageConfig,
}

impl StationConfig {
    /// Load configuration using the standard search order:
    ///
    /// 1. `$ENOSE_CONFIG`
    /// 2. `./enose_config.toml`
    /// 3. Built-in defaults
    pub fn load() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), port = %config.serial.port, "Loaded station config from ENOSE_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from ENOSE_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "ENOSE_CONFIG points to non-existent file, falling back");
            }
        }

        // 2. Check ./enose_config.toml
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(port = %config.serial.port, "Loaded station config from ./enose_config.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./enose_config.toml, using defaults");
                }
            }
        }

        // 3. Defaults
        info!("No enose_config.toml found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate the whole config, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        // Serial
        let s = &self.serial;
        if s.port.trim().is_empty() && s.transport == TransportKind::Serial {
            errors.push("serial.port must not be empty".to_string());
        }
        if s.baud_rate == 0 {
            errors.push("serial.baud_rate must be > 0".to_string());
        }
        if s.open_attempts == 0 {
            errors.push("serial.open_attempts must be >= 1".to_string());
        }
        if s.read_timeout_ms == 0 {
            errors.push("serial.read_timeout_ms must be > 0".to_string());
        }
        if s.read_timeout_ms > self.timing.join_timeout_ms {
            errors.push(format!(
                "serial.read_timeout_ms ({}) must be <= timing.join_timeout_ms ({})",
                s.read_timeout_ms, self.timing.join_timeout_ms
            ));
        }
        if s.transport == TransportKind::Simulated && s.simulated_interval_ms == 0 {
            errors.push("serial.simulated_interval_ms must be > 0".to_string());
        }

        // Channels
        let names = &self.channels.names;
        if names.is_empty() || names.len() > MAX_CHANNELS {
            errors.push(format!(
                "channels.names must list 1..={MAX_CHANNELS} channels (found {})",
                names.len()
            ));
        }
        let mut seen = HashSet::new();
        for name in names {
            let trimmed = name.trim();
            if trimmed.is_empty() {
                errors.push("channels.names contains an empty name".to_string());
            } else if trimmed.contains(self.channels.delimiter) || trimmed.contains(',') {
                errors.push(format!("channel name {trimmed:?} contains a delimiter"));
            } else if !seen.insert(trimmed) {
                errors.push(format!("channel name {trimmed:?} is listed twice"));
            }
        }
        if self.channels.delimiter.is_whitespace() || self.channels.delimiter.is_ascii_digit() {
            errors.push(format!(
                "channels.delimiter {:?} cannot separate numeric tokens",
                self.channels.delimiter
            ));
        }

        // Phases
        for (name, phase) in self.phases.entries() {
            if !(phase.duration_secs.is_finite() && phase.duration_secs > 0.0)
                || Duration::try_from_secs_f64(phase.duration_secs).is_err()
            {
                errors.push(format!(
                    "phases.{name}.duration_secs must be a positive number of seconds (found {})",
                    phase.duration_secs
                ));
            }
        }

        // Timing
        if self.timing.tick_ms == 0 {
            errors.push("timing.tick_ms must be > 0".to_string());
        }
        if self.timing.display_ms == 0 {
            errors.push("timing.display_ms must be > 0".to_string());
        }
        if self.timing.join_timeout_ms == 0 {
            errors.push("timing.join_timeout_ms must be > 0".to_string());
        }

        // Storage
        let st = &self.storage;
        let files = [
            ("raw_log", &st.raw_log),
            ("mean_record", &st.mean_record),
            ("mean_log", &st.mean_log),
            ("trial_log", &st.trial_log),
        ];
        let mut seen_files = HashSet::new();
        for (key, file) in files {
            if file.trim().is_empty() {
                errors.push(format!("storage.{key} must not be empty"));
            } else if !seen_files.insert(file.as_str()) {
                errors.push(format!("storage.{key} ({file}) is used by another output"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    // ========================================================================
    // Derived Values
    // ========================================================================

    pub fn channel_set(&self) -> ChannelSet {
        ChannelSet::new(self.channels.names.iter().map(|n| n.trim()))
    }

    pub fn parser(&self) -> FrameParser {
        FrameParser::new(self.channel_set(), self.channels.delimiter)
    }

    pub fn serial_settings(&self) -> SerialSettings {
        let s = &self.serial;
        SerialSettings {
            port: s.port.clone(),
            baud_rate: s.baud_rate,
            open_attempts: s.open_attempts,
            retry_backoff: Duration::from_millis(s.retry_backoff_ms),
            settle: Duration::from_millis(s.settle_ms),
            read_timeout: Duration::from_millis(s.read_timeout_ms),
        }
    }

    /// Connector matching `serial.transport`.
    pub fn connector(&self) -> Arc<dyn TransportConnector> {
        match self.serial.transport {
            TransportKind::Serial => Arc::new(SerialPortConnector),
            TransportKind::Simulated => Arc::new(SimulatedConnector::new(
                self.channels.names.len(),
                self.channels.delimiter,
                Duration::from_millis(self.serial.simulated_interval_ms),
            )),
        }
    }

    pub fn storage_paths(&self) -> StoragePaths {
        let dir = PathBuf::from(&self.storage.data_dir);
        StoragePaths {
            raw_log: dir.join(&self.storage.raw_log),
            mean_record: dir.join(&self.storage.mean_record),
            mean_log: dir.join(&self.storage.mean_log),
            trial_log: dir.join(&self.storage.trial_log),
            data_dir: dir,
        }
    }

    /// Duration and persistence behaviour for one phase kind.
    pub fn profile(&self, kind: PhaseKind) -> PhaseProfile {
        let phase = match kind {
            PhaseKind::Baseline => &self.phases.baseline,
            PhaseKind::Trial(_) => &self.phases.trial,
            PhaseKind::Classification => &self.phases.classification,
            PhaseKind::Exhaust => &self.phases.exhaust,
        };
        // Durations are checked by validate(); an invalid one ends the phase at once
        let duration = Duration::try_from_secs_f64(phase.duration_secs).unwrap_or(Duration::ZERO);
        let capture = kind != PhaseKind::Exhaust;
        PhaseProfile {
            duration,
            persists_mean: capture,
            records_raw: capture,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.timing.tick_ms)
    }

    pub fn display_interval(&self) -> Duration {
        Duration::from_millis(self.timing.display_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.timing.join_timeout_ms)
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Serial
// ============================================================================

/// Which transport backs the serial channel.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Serial,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub open_attempts: u32,
    pub retry_backoff_ms: u64,
    pub settle_ms: u64,
    pub read_timeout_ms: u64,
    pub transport: TransportKind,
    /// Line cadence when `transport = "simulated"`
    pub simulated_interval_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud_rate: DEFAULT_BAUD,
            open_attempts: DEFAULT_OPEN_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            settle_ms: DEFAULT_SETTLE_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            transport: TransportKind::Serial,
            simulated_interval_ms: DEFAULT_SIMULATED_INTERVAL_MS,
        }
    }
}

// ============================================================================
// Channels
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Channel names in wire order
    pub names: Vec<String>,
    pub delimiter: char,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            names: DEFAULT_CHANNELS.iter().map(|s| s.to_string()).collect(),
            delimiter: DEFAULT_DELIMITER,
        }
    }
}

// ============================================================================
// Phases
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PhaseConfig {
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PhasesConfig {
    pub baseline: PhaseConfig,
    pub trial: PhaseConfig,
    pub classification: PhaseConfig,
    pub exhaust: PhaseConfig,
}

impl PhasesConfig {
    fn entries(&self) -> [(&'static str, &PhaseConfig); 4] {
        [
            ("baseline", &self.baseline),
            ("trial", &self.trial),
            ("classification", &self.classification),
            ("exhaust", &self.exhaust),
        ]
    }
}

impl Default for PhasesConfig {
    fn default() -> Self {
        Self {
            baseline: PhaseConfig { duration_secs: DEFAULT_BASELINE_SECS },
            trial: PhaseConfig { duration_secs: DEFAULT_TRIAL_SECS },
            classification: PhaseConfig { duration_secs: DEFAULT_CLASSIFICATION_SECS },
            exhaust: PhaseConfig { duration_secs: DEFAULT_EXHAUST_SECS },
        }
    }
}

// ============================================================================
// Timing
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Countdown publication period
    pub tick_ms: u64,
    /// Live display refresh period
    pub display_ms: u64,
    /// Bounded wait for the worker at finalization
    pub join_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            display_ms: DEFAULT_DISPLAY_MS,
            join_timeout_ms: DEFAULT_JOIN_TIMEOUT_MS,
        }
    }
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub raw_log: String,
    pub mean_record: String,
    pub mean_log: String,
    pub trial_log: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: DEFAULT_DATA_DIR.to_string(),
            raw_log: DEFAULT_RAW_LOG_FILE.to_string(),
            mean_record: DEFAULT_MEAN_RECORD_FILE.to_string(),
            mean_log: DEFAULT_MEAN_LOG_FILE.to_string(),
            trial_log: DEFAULT_TRIAL_LOG_FILE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.channel_set().len(), 6);
        assert_eq!(config.profile(PhaseKind::Exhaust).duration, Duration::from_secs(900));
        assert!(!config.profile(PhaseKind::Exhaust).persists_mean);
        assert!(config.profile(PhaseKind::Trial(3)).records_raw);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: StationConfig = toml::from_str(
            r#"
            [serial]
            port = "/dev/ttyUSB1"

            [channels]
            names = ["MQ2", "MQ3", "MQ135", "MQ136"]

            [phases.trial]
            duration_secs = 1.5
            "#,
        )
        .unwrap();

        assert_eq!(config.serial.port, "/dev/ttyUSB1");
        assert_eq!(config.serial.baud_rate, DEFAULT_BAUD);
        assert_eq!(config.channels.names.len(), 4);
        assert_eq!(config.profile(PhaseKind::Trial(1)).duration, Duration::from_millis(1500));
        assert_eq!(config.profile(PhaseKind::Baseline).duration, Duration::from_secs(600));
        config.validate().unwrap();
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let mut config = StationConfig::default();
        config.serial.transport = TransportKind::Simulated;
        let text = config.to_toml().unwrap();
        let back: StationConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_storage_paths_join_data_dir() {
        let mut config = StationConfig::default();
        config.storage.data_dir = "/tmp/enose".to_string();
        let paths = config.storage_paths();
        assert_eq!(paths.mean_record, PathBuf::from("/tmp/enose/gathered_data_mean.csv"));
    }
}
