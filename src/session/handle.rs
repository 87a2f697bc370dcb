//! UI-facing handle to a running session controller.

use tokio::sync::{mpsc, oneshot, watch};

use super::controller::{Command, SessionError};
use crate::types::{FailureKind, LiveReading, PhaseFailure, PhaseKind, PhaseOutcome, PhaseState};

/// Cloneable front end of the controller task.
///
/// Commands are answered by the controller in arrival order. Status is
/// published on two watch channels: the phase state (with countdown) and the
/// latest live reading.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<PhaseState>,
    live: watch::Receiver<LiveReading>,
}

impl SessionHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        state: watch::Receiver<PhaseState>,
        live: watch::Receiver<LiveReading>,
    ) -> Self {
        Self {
            commands,
            state,
            live,
        }
    }

    /// Begin a phase.
    ///
    /// Returns as soon as the controller accepts the request. Await
    /// [`PhaseCompletion::wait`] for the outcome.
    pub async fn start(&self, phase: PhaseKind) -> Result<PhaseCompletion, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Start { phase, reply })
            .await
            .map_err(|_| SessionError::ControllerStopped)?;
        rx.await.map_err(|_| SessionError::ControllerStopped)?
    }

    /// End the active phase early and keep its partial mean.
    ///
    /// Returns `true` if this call stopped a phase. Repeated calls, calls
    /// after `cancel()`, and calls with no phase running return `false`.
    pub async fn skip(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Skip { reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Abort the active phase without persisting a mean.
    ///
    /// Same idempotence as [`skip`](Self::skip).
    pub async fn cancel(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Cancel { reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Ask the controller to stop. An active phase is cancelled first.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    /// Current state snapshot.
    pub fn state(&self) -> PhaseState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<PhaseState> {
        self.state.clone()
    }

    /// Latest raw values of the active (or last) phase.
    pub fn live(&self) -> LiveReading {
        self.live.borrow().clone()
    }

    pub fn watch_live(&self) -> watch::Receiver<LiveReading> {
        self.live.clone()
    }
}

/// Completion event of one accepted phase run.
#[derive(Debug)]
pub struct PhaseCompletion {
    run_id: u64,
    phase: PhaseKind,
    rx: oneshot::Receiver<PhaseOutcome>,
}

impl PhaseCompletion {
    pub(crate) fn new(run_id: u64, phase: PhaseKind, rx: oneshot::Receiver<PhaseOutcome>) -> Self {
        Self { run_id, phase, rx }
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn phase(&self) -> PhaseKind {
        self.phase
    }

    /// Wait for the phase to reach `Done` or `Failed`.
    pub async fn wait(self) -> PhaseOutcome {
        let (run_id, phase) = (self.run_id, self.phase);
        self.rx.await.unwrap_or_else(|_| {
            Err(PhaseFailure {
                run_id,
                phase,
                kind: FailureKind::Shutdown,
                message: "controller stopped before the phase completed".to_string(),
            })
        })
    }
}
