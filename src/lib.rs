//! E-Nose Station: gas sensor acquisition engine
//!
//! Reads streamed readings from a gas sensor array over a serial link,
//! aggregates them into a per-channel mean feature vector and drives a timed,
//! cancellable measurement session whose results are persisted durably.
//!
//! ## Architecture
//!
//! - **FrameParser**: raw line → validated [`SensorFrame`] or rejection
//! - **SerialChannel**: bounded-retry open, timed reads, idempotent close
//! - **MeanAggregator**: O(1) running mean, snapshot without stopping
//! - **SessionController**: Idle → Gathering → Finalizing → Done | Failed
//! - **PersistenceStore**: raw log, atomic mean record, mean log, trial log

pub mod acquisition;
pub mod aggregation;
pub mod classifier;
pub mod config;
pub mod session;
pub mod storage;
pub mod types;

// Re-export station configuration
pub use config::{ConfigError, StationConfig};

// Re-export commonly used types
pub use types::{
    ChannelSet, FailureKind, FeatureVector, LiveReading, PhaseFailure, PhaseKind, PhaseOutcome,
    PhaseReport, PhaseState, Prediction, SensorFrame, StopReason,
};

// Re-export session surface
pub use session::{PhaseCompletion, SessionController, SessionError, SessionHandle};

// Re-export acquisition and storage components
pub use acquisition::{FrameError, FrameParser, SerialChannel, SerialSettings, TransportConnector};
pub use aggregation::{AggregationError, MeanAggregator};
pub use classifier::{Classifier, ClassifierError};
pub use storage::{PersistenceError, PersistenceStore, ProcessLock};
