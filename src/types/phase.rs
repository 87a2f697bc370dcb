//! Phase types: PhaseKind, PhaseState, PhaseReport, LiveReading

use super::FeatureVector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Phase Kind
// ============================================================================

/// Which measurement cycle is being run.
///
/// All kinds share one state machine; what differs is the
/// [`PhaseProfile`] they are configured with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PhaseKind {
    /// Clean-air reference capture, stored in the trial log as `Baseline`.
    Baseline,
    /// Numbered sample capture, stored in the trial log as `Trial <n>`.
    Trial(u32),
    /// Live capture of an unknown sample for the classifier.
    Classification,
    /// Post-measurement purge. Nothing is persisted.
    Exhaust,
}

impl PhaseKind {
    /// Label written in the first column of every persisted row.
    pub fn label(&self) -> String {
        match self {
            PhaseKind::Baseline => "Baseline".to_string(),
            PhaseKind::Trial(n) => format!("Trial {n}"),
            PhaseKind::Classification => "Unknown".to_string(),
            PhaseKind::Exhaust => "Exhaust".to_string(),
        }
    }

    /// Whether the finalized mean is also kept in the trial-keyed history.
    pub fn is_trial_keyed(&self) -> bool {
        matches!(self, PhaseKind::Baseline | PhaseKind::Trial(_))
    }
}

impl std::fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseKind::Baseline => write!(f, "Baseline"),
            PhaseKind::Trial(n) => write!(f, "Trial {n}"),
            PhaseKind::Classification => write!(f, "Classification"),
            PhaseKind::Exhaust => write!(f, "Exhaust"),
        }
    }
}

/// Per-kind parameters of the generic phase machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseProfile {
    pub duration: Duration,
    pub persists_mean: bool,
    pub records_raw: bool,
}

// ============================================================================
// Stop Reasons & Failures
// ============================================================================

/// What ended the Gathering state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopReason {
    /// Countdown reached zero.
    Deadline,
    /// Operator skipped ahead; the partial mean is kept.
    Skipped,
    /// Operator aborted; no mean is persisted.
    Cancelled,
    /// The acquisition worker lost its transport before the deadline.
    TransportLost,
    /// A raw row could not be written; the phase fails with a persistence error.
    RawLogFailed,
}

/// Distinguishable terminal failure classes surfaced to the UI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    Connection,
    EmptyAggregation,
    Persistence,
    Worker,
    Shutdown,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Connection => write!(f, "ConnectionError"),
            FailureKind::EmptyAggregation => write!(f, "EmptyAggregation"),
            FailureKind::Persistence => write!(f, "PersistenceError"),
            FailureKind::Worker => write!(f, "WorkerError"),
            FailureKind::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Terminal failure of one phase run.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PhaseFailure {
    pub run_id: u64,
    pub phase: PhaseKind,
    pub kind: FailureKind,
    pub message: String,
}

impl std::fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed ({}): {}", self.phase, self.kind, self.message)
    }
}

impl std::error::Error for PhaseFailure {}

// ============================================================================
// Phase Report
// ============================================================================

/// Classifier verdict attached to a finalized classification phase.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum Prediction {
    Label(String),
    Error(String),
}

/// Successful completion of one phase run.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub run_id: u64,
    pub phase: PhaseKind,
    pub stop: StopReason,
    /// Frames folded into the mean.
    pub frames: u64,
    /// Lines dropped by the frame parser.
    pub rejected: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `None` for exhaust and cancelled runs.
    pub features: Option<FeatureVector>,
    /// Mean was recomputed from the raw log because the worker missed its join window.
    pub recovered_from_raw_log: bool,
    pub prediction: Option<Prediction>,
}

/// Outcome delivered to whoever started the phase.
pub type PhaseOutcome = Result<PhaseReport, PhaseFailure>;

// ============================================================================
// Observable State
// ============================================================================

/// Controller state as seen by the UI.
#[derive(Debug, Clone, Default)]
pub enum PhaseState {
    #[default]
    Idle,
    Gathering {
        phase: PhaseKind,
        remaining: Duration,
    },
    Finalizing {
        phase: PhaseKind,
        reason: StopReason,
    },
    Done(Box<PhaseReport>),
    Failed(PhaseFailure),
}

impl PhaseState {
    /// Countdown value while gathering.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            PhaseState::Gathering { remaining, .. } => Some(*remaining),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseState::Done(_) | PhaseState::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            PhaseState::Idle => "Idle",
            PhaseState::Gathering { .. } => "Gathering",
            PhaseState::Finalizing { .. } => "Finalizing",
            PhaseState::Done(_) => "Done",
            PhaseState::Failed(_) => "Failed",
        }
    }
}

/// Latest raw values published by the acquisition worker for live display.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LiveReading {
    /// Run the reading belongs to (0 before the first phase).
    pub run_id: u64,
    pub phase: Option<PhaseKind>,
    pub frames: u64,
    pub rejected: u64,
    /// Last accepted frame, `None` until one arrives.
    pub values: Option<Vec<f64>>,
}

/// Format a countdown as `M:SS`.
pub fn format_countdown(remaining: Duration) -> String {
    let secs = remaining.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        assert_eq!(PhaseKind::Baseline.label(), "Baseline");
        assert_eq!(PhaseKind::Trial(2).label(), "Trial 2");
        assert_eq!(PhaseKind::Classification.label(), "Unknown");
        assert!(PhaseKind::Trial(7).is_trial_keyed());
        assert!(!PhaseKind::Exhaust.is_trial_keyed());
    }

    #[test]
    fn test_countdown_format() {
        assert_eq!(format_countdown(Duration::from_secs(600)), "10:00");
        assert_eq!(format_countdown(Duration::from_secs(61)), "1:01");
        assert_eq!(format_countdown(Duration::from_millis(900)), "0:00");
    }

    #[test]
    fn test_state_helpers() {
        let gathering = PhaseState::Gathering {
            phase: PhaseKind::Exhaust,
            remaining: Duration::from_secs(5),
        };
        assert_eq!(gathering.remaining(), Some(Duration::from_secs(5)));
        assert!(!gathering.is_terminal());
        assert_eq!(PhaseState::Idle.name(), "Idle");
    }
}
