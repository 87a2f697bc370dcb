//! Config Validation Tests
//!
//! Exercise TOML loading and the collected-error validation of
//! `StationConfig` independently from the session machinery.

use std::fs;
use std::time::Duration;

use enose_station::config::{ConfigError, StationConfig, TransportKind};
use enose_station::PhaseKind;
use tempfile::tempdir;

fn validation_errors(config: &StationConfig) -> Vec<String> {
    match config.validate() {
        Err(ConfigError::Validation(errors)) => errors,
        Err(other) => panic!("unexpected error: {other}"),
        Ok(()) => Vec::new(),
    }
}

// ============================================================================
// Loading
// ============================================================================

#[test]
fn all_defaults_pass_validation() {
    assert!(validation_errors(&StationConfig::default()).is_empty());
}

#[test]
fn empty_file_loads_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("enose_config.toml");
    fs::write(&path, "").unwrap();

    let config = StationConfig::load_from_file(&path).unwrap();
    assert_eq!(config, StationConfig::default());
}

#[test]
fn full_file_overrides_every_section() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("station.toml");
    fs::write(
        &path,
        r#"
[serial]
port = "COM4"
baud_rate = 115200
open_attempts = 3
transport = "simulated"

[channels]
names = ["MQ2", "MQ3", "MQ135", "MQ138"]
delimiter = ";"

[phases.exhaust]
duration_secs = 120.0

[timing]
tick_ms = 250

[storage]
data_dir = "/var/lib/enose"
trial_log = "trials.csv"
"#,
    )
    .unwrap();

    let config = StationConfig::load_from_file(&path).unwrap();
    assert_eq!(config.serial.baud_rate, 115_200);
    assert_eq!(config.serial.transport, TransportKind::Simulated);
    assert_eq!(config.channel_set().csv_header(), "Label,MQ2,MQ3,MQ135,MQ138");
    assert_eq!(config.profile(PhaseKind::Exhaust).duration, Duration::from_secs(120));
    assert_eq!(config.tick_interval(), Duration::from_millis(250));
    assert!(config.storage_paths().trial_log.ends_with("trials.csv"));

    let frame = config.parser().parse("1; 2 ;3;4").unwrap();
    assert_eq!(frame.values(), &[1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn malformed_toml_is_parse_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(&path, "[serial\nport = 1").unwrap();

    let err = StationConfig::load_from_file(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(..)));
    assert!(err.to_string().contains("bad.toml"));
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempdir().unwrap();
    let err = StationConfig::load_from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(..)));
}

#[test]
fn invalid_file_is_rejected_on_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("invalid.toml");
    fs::write(&path, "[serial]\nbaud_rate = 0\n").unwrap();

    let err = StationConfig::load_from_file(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

// ============================================================================
// Validation Rules
// ============================================================================

#[test]
fn duplicate_and_empty_channel_names_rejected() {
    let mut config = StationConfig::default();
    config.channels.names = vec!["MQ2".into(), "MQ2".into(), " ".into()];

    let errors = validation_errors(&config);
    assert!(errors.iter().any(|e| e.contains("listed twice")));
    assert!(errors.iter().any(|e| e.contains("empty name")));
}

#[test]
fn channel_count_bounds() {
    let mut config = StationConfig::default();
    config.channels.names.clear();
    assert!(validation_errors(&config).iter().any(|e| e.contains("1..=16")));

    config.channels.names = (0..17).map(|i| format!("CH{i}")).collect();
    assert!(validation_errors(&config).iter().any(|e| e.contains("1..=16")));
}

#[test]
fn non_positive_durations_rejected() {
    let mut config = StationConfig::default();
    config.phases.trial.duration_secs = 0.0;
    config.phases.exhaust.duration_secs = f64::NAN;

    let errors = validation_errors(&config);
    assert!(errors.iter().any(|e| e.starts_with("phases.trial")));
    assert!(errors.iter().any(|e| e.starts_with("phases.exhaust")));
}

#[test]
fn read_timeout_must_fit_join_window() {
    let mut config = StationConfig::default();
    config.serial.read_timeout_ms = 5_000;
    config.timing.join_timeout_ms = 2_000;

    let errors = validation_errors(&config);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("join_timeout_ms"));
}

#[test]
fn output_files_must_be_distinct() {
    let mut config = StationConfig::default();
    config.storage.mean_log = config.storage.mean_record.clone();

    let errors = validation_errors(&config);
    assert!(errors.iter().any(|e| e.contains("storage.mean_log")));
}

#[test]
fn zero_attempts_and_baud_all_reported() {
    let mut config = StationConfig::default();
    config.serial.open_attempts = 0;
    config.serial.baud_rate = 0;
    config.timing.tick_ms = 0;

    let errors = validation_errors(&config);
    assert_eq!(errors.len(), 3);

    let rendered = ConfigError::Validation(errors).to_string();
    assert!(rendered.starts_with("Config validation failed:"));
    assert_eq!(rendered.lines().count(), 4);
}
