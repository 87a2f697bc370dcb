//! Acquisition worker
//!
//! Runs on a blocking thread for the length of one phase. Owns the open
//! [`SerialChannel`], the phase's [`MeanAggregator`] and the raw log writer;
//! hands the aggregator back through its join handle when it exits.
//!
//! The stop token is checked between reads, so the worst-case stop latency
//! is one read timeout. A frame that was already on the wire when the token
//! fired is still recorded.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acquisition::{FrameError, FrameParser, SerialChannel};
use crate::aggregation::MeanAggregator;
use crate::storage::{PersistenceError, RawLogWriter};
use crate::types::{LiveReading, PhaseKind, StopReason};

/// Everything one worker owns for the duration of its phase.
pub(crate) struct WorkerContext {
    pub run_id: u64,
    pub phase: PhaseKind,
    pub channel: SerialChannel,
    pub parser: FrameParser,
    pub aggregator: MeanAggregator,
    pub raw_log: Option<RawLogWriter>,
    pub stop: CancellationToken,
    pub live: Arc<watch::Sender<LiveReading>>,
}

/// Why the worker loop ended.
#[derive(Debug)]
pub(crate) enum WorkerExit {
    /// Stop token observed.
    Stopped,
    /// Transport read failed; the channel is unusable.
    TransportLost(String),
    /// A raw row could not be written. Rows already written are kept.
    Persistence(PersistenceError),
}

impl WorkerExit {
    /// Stop reason when the worker ends on its own, before any stop request.
    pub fn early_stop_reason(&self) -> StopReason {
        match self {
            WorkerExit::Persistence(_) => StopReason::RawLogFailed,
            WorkerExit::Stopped | WorkerExit::TransportLost(_) => StopReason::TransportLost,
        }
    }
}

/// Handed back to the controller through the join handle.
#[derive(Debug)]
pub(crate) struct WorkerReport {
    pub aggregator: MeanAggregator,
    pub frames: u64,
    pub rejected: u64,
    pub exit: WorkerExit,
}

/// Read, validate, record and aggregate until stopped.
pub(crate) fn run(ctx: WorkerContext) -> WorkerReport {
    let WorkerContext {
        run_id,
        phase,
        mut channel,
        parser,
        mut aggregator,
        mut raw_log,
        stop,
        live,
    } = ctx;

    let mut frames = 0u64;
    let mut rejected = 0u64;

    debug!(run_id = run_id, phase = %phase, port = %channel.port(), "Acquisition worker running");

    let mut exit = loop {
        if stop.is_cancelled() {
            break WorkerExit::Stopped;
        }

        let line = match channel.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => continue,
            Err(e) => {
                error!(run_id = run_id, phase = %phase, error = %e, "Transport lost during acquisition");
                break WorkerExit::TransportLost(e.to_string());
            }
        };

        let frame = match parser.parse_bytes(&line) {
            Ok(frame) => frame,
            Err(FrameError::Empty) => continue,
            Err(e) => {
                rejected += 1;
                warn!(run_id = run_id, error = %e, "Dropping malformed frame");
                live.send_if_modified(|l| {
                    if l.run_id != run_id {
                        return false;
                    }
                    l.rejected = rejected;
                    true
                });
                continue;
            }
        };

        // Raw row first: the on-disk log must never be behind the mean
        if let Some(raw) = raw_log.as_mut() {
            if let Err(e) = raw.write_raw(&frame) {
                error!(run_id = run_id, error = %e, "Raw log write failed");
                break WorkerExit::Persistence(e);
            }
        }

        if let Err(e) = aggregator.update(&frame) {
            rejected += 1;
            warn!(run_id = run_id, error = %e, "Frame rejected by aggregator");
            continue;
        }
        frames += 1;

        let values = frame.into_values();
        live.send_if_modified(|l| {
            if l.run_id != run_id {
                return false;
            }
            l.frames = frames;
            l.values = Some(values);
            true
        });
    };

    if let Some(raw) = raw_log.take() {
        if let Err(e) = raw.finish() {
            error!(run_id = run_id, error = %e, "Raw log sync failed");
            if !matches!(exit, WorkerExit::Persistence(_)) {
                exit = WorkerExit::Persistence(e);
            }
        }
    }
    channel.close();

    info!(
        run_id = run_id,
        phase = %phase,
        frames = frames,
        rejected = rejected,
        "Acquisition worker exited"
    );

    WorkerReport {
        aggregator,
        frames,
        rejected,
        exit,
    }
}
