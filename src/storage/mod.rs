//! Durable Storage
//!
//! CSV outputs consumed by the classifier and the operator, plus the process
//! lock that keeps a data directory single-writer.

pub mod lockfile;
pub mod persistence;

pub use lockfile::ProcessLock;
pub use persistence::{PersistedRow, PersistenceError, PersistenceStore, RawLogWriter, StoragePaths};
