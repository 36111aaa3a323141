//! Error types for the scan sequencer.
//!
//! All coordinator entry points return [`ScanResult`], with [`SequencerError`]
//! as the single error type. Using the `thiserror` crate keeps the taxonomy in
//! one place:
//!
//! - **Configuration errors** (`MissingTarget`, `DuplicateName`,
//!   `UnknownScannable`, `Vetoed`) are raised before any device is commanded;
//!   no partial state exists when they surface.
//! - **`Device`** wraps a failure raised by a device's own move or acquisition
//!   while a `run()` was in flight. The role field says which phase failed.
//! - **`AbortFailed`** aggregates the abort handlers that themselves failed.
//!   It is only raised after every member of the active set has had its
//!   `abort()` invoked.
//! - **`Worker`** covers a panicked worker task, which should not happen with
//!   well-behaved device implementations.
//!
//! Device implementations report their own failures as `anyhow::Error`, the
//! same convention the instrument drivers in the wider system use, and the
//! coordinators wrap those with the device name and phase.

use thiserror::Error;

use crate::core::LevelRole;

/// Convenience alias for results using the sequencer error type.
pub type ScanResult<T> = std::result::Result<T, SequencerError>;

/// Error raised by the per-point coordinators.
#[derive(Error, Debug)]
pub enum SequencerError {
    /// A registered scannable has no target value at the current scan point.
    #[error("no target for scannable '{0}' at this scan point")]
    MissingTarget(String),

    /// Two devices in one coordinator pool share a name.
    #[error("duplicate device name '{0}' registered with coordinator")]
    DuplicateName(String),

    /// A name-registered scannable could not be resolved to a device.
    #[error("no scannable named '{0}' could be resolved")]
    UnknownScannable(String),

    /// A position listener vetoed the point before any command was issued.
    #[error("move of '{0}' vetoed by a position listener")]
    Vetoed(String),

    /// A device's own move or acquisition failed during `run()`.
    #[error("device '{device}' failed during {role} phase")]
    Device {
        /// Name of the failing device.
        device: String,
        /// Which phase the coordinator was executing.
        role: LevelRole,
        /// The device's own error.
        #[source]
        source: anyhow::Error,
    },

    /// One or more abort handlers failed; every active device was still attempted.
    #[error("abort failed for {} of {attempted} device(s)", .failures.len())]
    AbortFailed {
        /// How many devices were in the active set.
        attempted: usize,
        /// The devices whose abort handler raised, with their errors.
        failures: Vec<(String, anyhow::Error)>,
    },

    /// A worker task driving a device panicked.
    #[error("worker task for '{device}' panicked")]
    Worker {
        /// Name of the device the task was driving.
        device: String,
        /// The join error from the runtime.
        #[source]
        source: tokio::task::JoinError,
    },
}
