use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the link engine and the module tracker.
///
/// Explicit denials from the authorization service are not errors; they come
/// back as `Ok(false)` or as a denied outcome.
#[derive(Debug, Error)]
pub enum GateError {
    /// The authorization service could not be reached or answered garbage.
    #[error("authorization service unreachable: {0}")]
    Transport(String),

    /// A boot-time blocking check exceeded its bounded wait.
    #[error("blocking check timed out after {0:?}")]
    Timeout(Duration),

    /// The blocking adapter could not build its runtime.
    #[error("failed to start blocking runtime: {0}")]
    Runtime(#[from] std::io::Error),

    /// The persisted link state could not be read or written.
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    /// A module package could not be read or hashed.
    #[error("module integrity check failed: {0}")]
    Integrity(String),
}

pub type GateResult<T> = Result<T, GateError>;
