use thiserror::Error;

/// Errors surfaced by the task and session stores. Background components
/// (watcher, event bus) never propagate these to callers; they log and
/// keep running.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Reserved for callers layering stricter collision handling on top of
    /// the stores. `SessionStore::rename_session` itself reports a taken
    /// target id as `Ok(false)` rather than an error.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid task status '{0}'")]
    InvalidStatus(String),

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
