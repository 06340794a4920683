use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of an agent run.
///
/// A run starts only from `Idle`. Exhausting the step budget returns to `Idle`,
/// a special tool (or a token limit) leaves the agent `Finished`, and a failed
/// step leaves it in `Error` until [`Agent::reset`](super::Agent::reset).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    #[default]
    Idle,
    Running,
    Finished,
    Error,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}
