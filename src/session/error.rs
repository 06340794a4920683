use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session has not started.")]
    NotStarted,

    #[error("Session is closed.")]
    Closed,

    #[error(
        "timed out: shell has not returned in {} seconds and must be restarted",
        .0.as_secs_f64()
    )]
    TimedOut(Duration),

    #[error("session timed out earlier and must be restarted before running more commands")]
    Unusable,

    #[error("shell has exited with returncode {}; tool must be restarted", .0.map_or_else(|| "unknown".to_string(), |c| c.to_string()))]
    Exited(Option<i32>),

    #[error("Command contains potentially dangerous operation ({pattern}): {reason}")]
    Rejected {
        pattern: &'static str,
        reason: &'static str,
    },

    #[error("failed to launch shell: {0}")]
    Launch(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl SessionError {
    /// True for errors after which the session object must be replaced.
    pub fn requires_restart(&self) -> bool {
        matches!(
            self,
            Self::TimedOut(_) | Self::Unusable | Self::Exited(_) | Self::Closed
        )
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
