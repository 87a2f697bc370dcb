//! Station Configuration Module
//!
//! Serial link, channel set, phase durations, timing and output files,
//! loaded from TOML.
//!
//! ## Loading Order
//!
//! 1. `ENOSE_CONFIG` environment variable (path to TOML file)
//! 2. `enose_config.toml` in the current working directory
//! 3. Built-in defaults (see [`defaults`])
//!
//! The loaded [`StationConfig`] is passed by value to the session controller;
//! nothing reads configuration from global state.

mod station_config;
pub mod defaults;

pub use station_config::*;
