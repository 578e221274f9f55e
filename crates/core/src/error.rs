//! Error types for the bridge core

use thiserror::Error;

/// Result type alias for bridge core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for bridge core operations
///
/// Engine-level failures (a command that ran and reported an error) are not
/// errors at this level; they come back as a normal [`crate::RunResult`]
/// with a non-success status. This enum covers everything else.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed parameters; no side effects
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unknown session id
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A request is already in flight on this session
    #[error("session {id} is {state}")]
    SessionBusy {
        /// Session id
        id: String,
        /// Observed session state at rejection time
        state: String,
    },

    /// The configured session limit has been reached
    #[error("session limit reached ({0} active)")]
    Capacity(usize),

    /// The worker has not initialized the Engine
    #[error("engine unavailable: {0}")]
    EngineUnavailable(String),

    /// The worker crashed or was killed; the session must be recreated
    #[error("worker dead: {0}")]
    WorkerDead(String),

    /// Unexpected failure inside the server
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable error kind, carried in HTTP responses.
    pub fn code(&self) -> &'static str {
        match self {
            Error::BadRequest(_) => "bad_request",
            Error::SessionNotFound(_) => "session_not_found",
            Error::SessionBusy { .. } => "session_busy",
            Error::Capacity(_) => "capacity",
            Error::EngineUnavailable(_) => "engine_unavailable",
            Error::WorkerDead(_) => "worker_dead",
            Error::Internal(_) => "internal",
            Error::Io(_) | Error::Json(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::BadRequest("x".into()).code(), "bad_request");
        assert_eq!(Error::SessionNotFound("s".into()).code(), "session_not_found");
        assert_eq!(
            Error::SessionBusy {
                id: "s".into(),
                state: "busy".into()
            }
            .code(),
            "session_busy"
        );
        assert_eq!(Error::Capacity(8).code(), "capacity");
        assert_eq!(Error::WorkerDead("gone".into()).code(), "worker_dead");
    }

    #[test]
    fn test_io_errors_map_to_internal() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert_eq!(err.code(), "internal");
    }
}
