//! Session Controller
//!
//! One generic phase machine drives every phase kind:
//!
//! ```text
//! Idle ──start──▶ Gathering ──deadline / skip / cancel / transport lost──▶ Finalizing
//!                     │                                                       │
//!                     └── open failed ──▶ Failed          snapshot + persist ─┴─▶ Done | Failed
//! ```
//!
//! The controller runs as a single tokio task that owns all session state.
//! The UI talks to it through a [`SessionHandle`] (commands in, watch
//! channels out). During Gathering exactly one acquisition worker runs on a
//! blocking thread; stop requests reach it through a `CancellationToken`
//! and its accumulator comes back through its join handle. The controller
//! holds at most one worker handle at a time (active or straggling), which
//! keeps a second worker from ever touching the port.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handle::{PhaseCompletion, SessionHandle};
use super::worker::{self, WorkerContext, WorkerExit, WorkerReport};
use crate::acquisition::{ChannelError, FrameParser, SerialChannel, SerialSettings, TransportConnector};
use crate::aggregation::{AggregationError, MeanAggregator};
use crate::classifier::Classifier;
use crate::config::defaults::COMMAND_QUEUE_CAPACITY;
use crate::config::{ConfigError, StationConfig};
use crate::storage::{PersistedRow, PersistenceError, PersistenceStore};
use crate::types::{
    ChannelSet, FailureKind, FeatureVector, LiveReading, PhaseFailure, PhaseKind, PhaseOutcome,
    PhaseProfile, PhaseReport, PhaseState, Prediction, StopReason,
};

// ============================================================================
// Errors & Commands
// ============================================================================

/// Controller-level error taxonomy.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ChannelError),

    #[error("no frames were aggregated")]
    NoData,

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("phase {0} is already active")]
    PhaseActive(PhaseKind),

    #[error("session controller has stopped")]
    ControllerStopped,

    #[error("acquisition worker failed: {0}")]
    Worker(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SessionError {
    /// Failure class reported when this error ends a phase.
    pub fn kind(&self) -> FailureKind {
        match self {
            SessionError::Connection(_) => FailureKind::Connection,
            SessionError::NoData => FailureKind::EmptyAggregation,
            SessionError::Persistence(_) => FailureKind::Persistence,
            SessionError::ControllerStopped => FailureKind::Shutdown,
            SessionError::PhaseActive(_) | SessionError::Worker(_) | SessionError::Config(_) => {
                FailureKind::Worker
            }
        }
    }
}

impl From<AggregationError> for SessionError {
    fn from(e: AggregationError) -> Self {
        match e {
            AggregationError::EmptyAggregation => SessionError::NoData,
            other => SessionError::Worker(other.to_string()),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    Start {
        phase: PhaseKind,
        reply: oneshot::Sender<Result<PhaseCompletion, SessionError>>,
    },
    Skip {
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

// ============================================================================
// Controller Builder
// ============================================================================

/// Builds and spawns the controller task.
///
/// ```ignore
/// let (session, task) = SessionController::new(StationConfig::load()).spawn()?;
/// let run = session.start(PhaseKind::Trial(1)).await?;
/// let report = run.wait().await?;
/// ```
pub struct SessionController {
    config: StationConfig,
    connector: Arc<dyn TransportConnector>,
    classifier: Option<Arc<dyn Classifier>>,
}

impl SessionController {
    /// Controller using the transport selected in `config.serial.transport`.
    pub fn new(config: StationConfig) -> Self {
        let connector = config.connector();
        Self {
            config,
            connector,
            classifier: None,
        }
    }

    /// Replace the transport connector (alternate hardware, scripted tests).
    pub fn with_connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Classifier consulted when a classification phase finalizes.
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Validate the configuration, prepare storage and spawn the task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> Result<(SessionHandle, JoinHandle<()>), SessionError> {
        self.config.validate()?;
        let channels = self.config.channel_set();
        let store = PersistenceStore::open(self.config.storage_paths(), channels.clone())?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(PhaseState::Idle);
        let (live_tx, live_rx) = watch::channel(LiveReading::default());

        let task = ControllerTask {
            settings: self.config.serial_settings(),
            parser: self.config.parser(),
            tick: self.config.tick_interval(),
            join_timeout: self.config.join_timeout(),
            channels,
            store: Arc::new(store),
            connector: self.connector,
            classifier: self.classifier,
            config: self.config,
            commands: cmd_rx,
            state: state_tx,
            live: Arc::new(live_tx),
            straggler: None,
            last_run_id: 0,
            shutting_down: false,
        };

        info!(
            channels = task.channels.len(),
            port = %task.settings.port,
            transport = task.connector.name(),
            "Session controller starting"
        );
        let join = tokio::spawn(task.run());
        Ok((SessionHandle::new(cmd_tx, state_rx, live_rx), join))
    }
}

// ============================================================================
// Controller Task
// ============================================================================

struct ControllerTask {
    config: StationConfig,
    settings: SerialSettings,
    parser: FrameParser,
    channels: ChannelSet,
    tick: Duration,
    join_timeout: Duration,
    store: Arc<PersistenceStore>,
    connector: Arc<dyn TransportConnector>,
    classifier: Option<Arc<dyn Classifier>>,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<PhaseState>,
    live: Arc<watch::Sender<LiveReading>>,
    /// Worker that missed its join window and has not exited yet.
    straggler: Option<JoinHandle<WorkerReport>>,
    last_run_id: u64,
    shutting_down: bool,
}

/// Per-run bookkeeping shared by the finalization steps.
struct RunContext {
    run_id: u64,
    phase: PhaseKind,
    profile: PhaseProfile,
    started_at: chrono::DateTime<Utc>,
}

impl RunContext {
    fn fail(&self, kind: FailureKind, message: impl Into<String>) -> PhaseFailure {
        PhaseFailure {
            run_id: self.run_id,
            phase: self.phase,
            kind,
            message: message.into(),
        }
    }

    fn fail_with(&self, err: &SessionError) -> PhaseFailure {
        self.fail(err.kind(), err.to_string())
    }
}

impl ControllerTask {
    async fn run(mut self) {
        while !self.shutting_down {
            let Some(cmd) = self.commands.recv().await else {
                debug!("All session handles dropped");
                break;
            };

            match cmd {
                Command::Start { phase, reply } => {
                    self.last_run_id += 1;
                    let run_id = self.last_run_id;
                    let (done_tx, done_rx) = oneshot::channel();
                    if reply
                        .send(Ok(PhaseCompletion::new(run_id, phase, done_rx)))
                        .is_err()
                    {
                        debug!(run_id = run_id, "Start requester went away, phase not run");
                        continue;
                    }

                    let outcome = self.run_phase(run_id, phase).await;
                    self.publish_outcome(&outcome);
                    let _ = done_tx.send(outcome);
                }
                // Nothing is gathering
                Command::Skip { reply } | Command::Cancel { reply } => {
                    let _ = reply.send(false);
                }
                Command::Shutdown => self.shutting_down = true,
            }
        }

        if let Some(straggler) = self.straggler.take() {
            info!("Waiting for straggling acquisition worker before exit");
            let _ = straggler.await;
        }
        info!("Session controller stopped");
    }

    fn publish_outcome(&self, outcome: &PhaseOutcome) {
        let state = match outcome {
            Ok(report) => {
                info!(
                    run_id = report.run_id,
                    phase = %report.phase,
                    stop = ?report.stop,
                    frames = report.frames,
                    rejected = report.rejected,
                    "Phase done"
                );
                PhaseState::Done(Box::new(report.clone()))
            }
            Err(failure) => {
                error!(
                    run_id = failure.run_id,
                    phase = %failure.phase,
                    kind = %failure.kind,
                    error = %failure.message,
                    "Phase failed"
                );
                PhaseState::Failed(failure.clone())
            }
        };
        self.state.send_replace(state);
    }

    /// Answer a command that arrives while a phase is active.
    ///
    /// The first skip/cancel wins; later ones are no-ops.
    fn handle_while_active(
        &mut self,
        cmd: Option<Command>,
        phase: PhaseKind,
        pending: &mut Option<StopReason>,
    ) {
        match cmd {
            Some(Command::Start { reply, .. }) => {
                let _ = reply.send(Err(SessionError::PhaseActive(phase)));
            }
            Some(Command::Skip { reply }) => {
                let _ = reply.send(request_stop(pending, StopReason::Skipped));
            }
            Some(Command::Cancel { reply }) => {
                let _ = reply.send(request_stop(pending, StopReason::Cancelled));
            }
            Some(Command::Shutdown) | None => {
                self.shutting_down = true;
                request_stop(pending, StopReason::Cancelled);
            }
        }
    }

    // ========================================================================
    // Phase Lifecycle
    // ========================================================================

    async fn run_phase(&mut self, run_id: u64, phase: PhaseKind) -> PhaseOutcome {
        let run = RunContext {
            run_id,
            phase,
            profile: self.config.profile(phase),
            started_at: Utc::now(),
        };

        // One worker at a time, even if the last one overstayed its join window
        if let Some(straggler) = self.straggler.take() {
            info!(run_id = run_id, "Waiting for previous acquisition worker to exit");
            if let Err(e) = straggler.await {
                warn!(error = %e, "Previous acquisition worker ended abnormally");
            }
        }

        self.live.send_replace(LiveReading {
            run_id,
            phase: Some(phase),
            ..LiveReading::default()
        });
        self.state.send_replace(PhaseState::Gathering {
            phase,
            remaining: run.profile.duration,
        });
        info!(
            run_id = run_id,
            phase = %phase,
            duration_secs = run.profile.duration.as_secs_f64(),
            "Phase started"
        );

        let mut pending: Option<StopReason> = None;

        // --- Open the channel without blocking the runtime ---
        let connector = Arc::clone(&self.connector);
        let settings = self.settings.clone();
        let mut open =
            tokio::task::spawn_blocking(move || SerialChannel::open(connector.as_ref(), &settings));
        let opened = loop {
            tokio::select! {
                res = &mut open => break res,
                cmd = self.commands.recv(), if !self.shutting_down => {
                    self.handle_while_active(cmd, phase, &mut pending);
                }
            }
        };
        let channel = match opened {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => return Err(run.fail_with(&SessionError::Connection(e))),
            Err(e) => return Err(run.fail(FailureKind::Worker, e.to_string())),
        };

        let raw_log = if run.profile.records_raw {
            match self.store.begin_raw(&phase.label()) {
                Ok(writer) => Some(writer),
                Err(e) => return Err(run.fail_with(&SessionError::Persistence(e))),
            }
        } else {
            None
        };

        // --- Gathering ---
        let stop = CancellationToken::new();
        if pending.is_some() {
            stop.cancel();
        }
        let ctx = WorkerContext {
            run_id,
            phase,
            channel,
            parser: self.parser.clone(),
            aggregator: MeanAggregator::new(self.channels.len()),
            raw_log,
            stop: stop.clone(),
            live: Arc::clone(&self.live),
        };
        let mut worker = tokio::task::spawn_blocking(move || worker::run(ctx));

        let deadline = Instant::now() + run.profile.duration;
        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut early_exit = None;
        let reason = match pending {
            Some(reason) => reason,
            None => loop {
                tokio::select! {
                    () = &mut expiry => break StopReason::Deadline,
                    _ = ticker.tick() => {
                        self.state.send_replace(PhaseState::Gathering {
                            phase,
                            remaining: deadline.saturating_duration_since(Instant::now()),
                        });
                    }
                    cmd = self.commands.recv() => {
                        self.handle_while_active(cmd, phase, &mut pending);
                        if let Some(reason) = pending {
                            break reason;
                        }
                    }
                    res = &mut worker => {
                        let reason = match &res {
                            Ok(report) => report.exit.early_stop_reason(),
                            Err(_) => StopReason::TransportLost,
                        };
                        early_exit = Some(res);
                        break reason;
                    }
                }
            },
        };

        // --- Finalizing ---
        self.state
            .send_replace(PhaseState::Finalizing { phase, reason });
        info!(run_id = run_id, phase = %phase, reason = ?reason, "Phase stopping");
        stop.cancel();

        let joined = match early_exit {
            Some(res) => Some(res),
            None => match tokio::time::timeout(self.join_timeout, &mut worker).await {
                Ok(res) => Some(res),
                Err(_) => {
                    warn!(
                        run_id = run_id,
                        join_timeout_ms = self.join_timeout.as_millis() as u64,
                        "Acquisition worker missed its join window, channel closes when it exits"
                    );
                    self.straggler = Some(worker);
                    None
                }
            },
        };

        self.finalize(&run, reason, joined).await
    }

    async fn finalize(
        &self,
        run: &RunContext,
        reason: StopReason,
        joined: Option<Result<WorkerReport, tokio::task::JoinError>>,
    ) -> PhaseOutcome {
        let mut recovered = false;
        let (aggregator, frames, rejected) = match joined {
            Some(Ok(report)) => {
                match report.exit {
                    WorkerExit::Persistence(e) => {
                        return Err(run.fail_with(&SessionError::Persistence(e)));
                    }
                    WorkerExit::TransportLost(ref msg) => {
                        warn!(run_id = run.run_id, error = %msg, "Finalizing after transport loss");
                    }
                    WorkerExit::Stopped => {}
                }
                (Some(report.aggregator), report.frames, report.rejected)
            }
            Some(Err(e)) => {
                return Err(run.fail(FailureKind::Worker, format!("acquisition worker crashed: {e}")));
            }
            None => {
                let rejected = self.live.borrow().rejected;
                (None, 0, rejected)
            }
        };

        if reason == StopReason::Cancelled || !run.profile.persists_mean {
            return Ok(self.report(run, reason, frames, rejected, None, recovered, None));
        }

        let (aggregator, frames) = match aggregator {
            Some(agg) => (agg, frames),
            None => match self.recover_from_raw_log(run).await {
                Ok(agg) => {
                    recovered = true;
                    let count = agg.count();
                    (agg, count)
                }
                Err(e) => return Err(run.fail_with(&e)),
            },
        };

        let means = match aggregator.snapshot() {
            Ok(means) => means,
            Err(e) => return Err(run.fail_with(&SessionError::from(e))),
        };
        let Some(features) = FeatureVector::new(self.channels.clone(), means.clone()) else {
            return Err(run.fail(FailureKind::Worker, "mean width does not match channel set"));
        };

        if let Err(e) = self.persist_mean(run.phase, means).await {
            return Err(run.fail_with(&e));
        }

        let prediction = match (run.phase, &self.classifier) {
            (PhaseKind::Classification, Some(classifier)) => {
                Some(self.classify(Arc::clone(classifier), features.clone()).await)
            }
            _ => None,
        };

        Ok(self.report(
            run,
            reason,
            frames,
            rejected,
            Some(features),
            recovered,
            prediction,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        run: &RunContext,
        stop: StopReason,
        frames: u64,
        rejected: u64,
        features: Option<FeatureVector>,
        recovered_from_raw_log: bool,
        prediction: Option<Prediction>,
    ) -> PhaseReport {
        PhaseReport {
            run_id: run.run_id,
            phase: run.phase,
            stop,
            frames,
            rejected,
            started_at: run.started_at,
            finished_at: Utc::now(),
            features,
            recovered_from_raw_log,
            prediction,
        }
    }

    /// Write the mean record, update the trial log, append the mean log.
    async fn persist_mean(&self, phase: PhaseKind, means: Vec<f64>) -> Result<(), SessionError> {
        let store = Arc::clone(&self.store);
        let row = PersistedRow::new(phase.label(), means);
        let trial_keyed = phase.is_trial_keyed();

        tokio::task::spawn_blocking(move || store.commit_mean(&row, trial_keyed))
            .await
            .map_err(|e| SessionError::Worker(e.to_string()))??;
        Ok(())
    }

    /// Rebuild the mean from rows the straggling worker already flushed.
    async fn recover_from_raw_log(&self, run: &RunContext) -> Result<MeanAggregator, SessionError> {
        if !run.profile.records_raw {
            return Err(SessionError::Worker(
                "worker did not hand back its mean and no raw log was recorded".to_string(),
            ));
        }
        let store = Arc::clone(&self.store);
        let width = self.channels.len();

        let frames = tokio::task::spawn_blocking(move || store.read_raw_frames())
            .await
            .map_err(|e| SessionError::Worker(e.to_string()))??;

        let mut aggregator = MeanAggregator::new(width);
        for frame in &frames {
            aggregator.update(frame)?;
        }
        info!(
            run_id = run.run_id,
            frames = aggregator.count(),
            "Mean recovered from raw log"
        );
        Ok(aggregator)
    }

    async fn classify(&self, classifier: Arc<dyn Classifier>, features: FeatureVector) -> Prediction {
        match tokio::task::spawn_blocking(move || classifier.predict(&features)).await {
            Ok(Ok(label)) => {
                info!(label = %label, "Sample classified");
                Prediction::Label(label)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Classifier rejected the sample");
                Prediction::Error(e.to_string())
            }
            Err(e) => {
                warn!(error = %e, "Classifier panicked");
                Prediction::Error(e.to_string())
            }
        }
    }
}

/// Record the first stop request. Returns whether this call took effect.
fn request_stop(pending: &mut Option<StopReason>, reason: StopReason) -> bool {
    if pending.is_some() {
        return false;
    }
    *pending = Some(reason);
    true
}
