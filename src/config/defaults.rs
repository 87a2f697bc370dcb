//! Station-wide default constants.
//!
//! Every `[section]` of `enose_config.toml` falls back to these values.
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Serial Link
// ============================================================================

/// Device path of the sensor board.
pub const DEFAULT_PORT: &str = "/dev/ttyACM0";

/// Baud rate the board firmware is flashed with.
pub const DEFAULT_BAUD: u32 = 9600;

/// Open attempts before the phase fails with a connection error.
pub const DEFAULT_OPEN_ATTEMPTS: u32 = 5;

/// Pause between failed open attempts (ms).
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// Pause after a successful open while the board resets (ms).
///
/// Opening the port toggles DTR, which reboots most microcontroller boards.
pub const DEFAULT_SETTLE_MS: u64 = 2_000;

/// Upper bound of a single blocking read (ms).
///
/// Also the worst-case latency between a stop signal and the worker noticing it.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1_000;

/// Line cadence of the simulated board (ms).
pub const DEFAULT_SIMULATED_INTERVAL_MS: u64 = 1_000;

// ============================================================================
// Channels
// ============================================================================

/// Sensor array of the six-channel board, in wire order.
pub const DEFAULT_CHANNELS: [&str; 6] = ["MQ2", "MQ3", "MQ135", "MQ136", "MQ137", "MQ138"];

/// Field separator on the wire.
pub const DEFAULT_DELIMITER: char = ',';

/// Largest supported sensor array.
pub const MAX_CHANNELS: usize = 16;

/// Longest line accepted from the board; longer runs without a newline are dropped.
pub const MAX_LINE_BYTES: usize = 1_024;

// ============================================================================
// Phase Durations
// ============================================================================

/// Baseline capture length (seconds).
pub const DEFAULT_BASELINE_SECS: f64 = 600.0;

/// Trial capture length (seconds).
pub const DEFAULT_TRIAL_SECS: f64 = 600.0;

/// Classification capture length (seconds).
pub const DEFAULT_CLASSIFICATION_SECS: f64 = 600.0;

/// Exhaust purge length (seconds).
pub const DEFAULT_EXHAUST_SECS: f64 = 900.0;

// ============================================================================
// Timing
// ============================================================================

/// Countdown publication period (ms).
pub const DEFAULT_TICK_MS: u64 = 1_000;

/// Live-value refresh period used by display loops (ms).
pub const DEFAULT_DISPLAY_MS: u64 = 500;

/// How long finalization waits for the worker to hand back its mean (ms).
pub const DEFAULT_JOIN_TIMEOUT_MS: u64 = 2_000;

/// Capacity of the controller command queue.
pub const COMMAND_QUEUE_CAPACITY: usize = 16;

// ============================================================================
// Storage
// ============================================================================

/// Directory holding every CSV the station writes.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Raw frames of the active phase.
pub const DEFAULT_RAW_LOG_FILE: &str = "gathered_data.csv";

/// Latest finalized mean, read by the classifier.
pub const DEFAULT_MEAN_RECORD_FILE: &str = "gathered_data_mean.csv";

/// Append-only history of finalized means.
pub const DEFAULT_MEAN_LOG_FILE: &str = "gathered_data_mean_log.csv";

/// Baseline/trial means keyed by label.
pub const DEFAULT_TRIAL_LOG_FILE: &str = "trial_log.csv";

/// PID lock guarding the data directory.
pub const LOCK_FILE_NAME: &str = ".enose.lock";
