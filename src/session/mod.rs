//! Measurement session: controller task, UI handle and acquisition worker.

mod controller;
mod handle;
mod worker;

pub use controller::{SessionController, SessionError};
pub use handle::{PhaseCompletion, SessionHandle};
