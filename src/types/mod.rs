//! Shared data structures for the acquisition engine
//!
//! - Frames: ChannelSet, SensorFrame, FeatureVector
//! - Phases: PhaseKind, PhaseProfile, PhaseState, PhaseReport, LiveReading

mod frame;
mod phase;

pub use frame::*;
pub use phase::*;
