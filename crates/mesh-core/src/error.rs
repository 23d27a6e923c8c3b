//! Error taxonomy. One variant per named failure mode; each
//! carries the context needed to log and retry it usefully.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    /// `getState` found no fields for the requested job (§4.3 `getState`).
    #[error("no state for job {job_id} in app {app_id}")]
    NotFound { app_id: String, job_id: String },

    /// Attempt to interrupt a job whose status is already <= 0.
    #[error("job {job_id} already completed, cannot interrupt")]
    InterruptConflict { job_id: String },

    /// `startIndex > maxIndex` while binding or reserving a symbol range.
    #[error("symbol range exhausted for scope {scope} (start={start}, max={max})")]
    SymbolRangeExhausted { scope: String, start: u32, max: u32 },

    /// Repeated `?:?` pending-marker observations during range reservation.
    #[error("symbol range reservation contended for scope {scope} after {attempts} attempts")]
    SymbolContention { scope: String, attempts: u32 },

    /// A one-time pubsub wait or quorum round exceeded its deadline.
    #[error("timed out waiting for {what}")]
    Timeout { what: String },

    /// Manifest failed compile-time validation.
    #[error("manifest validation failed: {0}")]
    ValidationError(String),

    /// Backend (store/stream/sub) transport or server-reported failure.
    #[error("storage error: {0}")]
    StorageError(String),

    /// Quorum disagreement persisted beyond the activation retry budget.
    #[error("activation of {app_id} v{version} failed after {attempts} attempts")]
    ActivationError {
        app_id: String,
        version: String,
        attempts: u32,
    },
}

/// HTTP-flavored status codes carried on `RESULT`/completion messages.
pub mod codes {
    pub const SUCCESS: i32 = 200;
    pub const PENDING: i32 = 202;
    pub const TIMEOUT: i32 = 504;
    pub const INTERRUPT: i32 = 410;
}

pub type MeshResult<T> = Result<T, MeshError>;
