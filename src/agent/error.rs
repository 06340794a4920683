use thiserror::Error;

use super::AgentState;
use crate::llm::LlmError;
use crate::memory::MemoryError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Cannot run agent from state: {state}")]
    NotRunnable { state: AgentState },

    #[error("Tool calls required but none provided")]
    ToolCallRequired,

    #[error("LLM request failed: {0}")]
    Model(#[from] LlmError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// A step failed and aborted the run. `partial_log` holds the results of
    /// the steps completed before it.
    #[error("Step {step} failed: {source}")]
    StepFailed {
        step: u32,
        partial_log: String,
        source: Box<AgentError>,
    },
}

impl AgentError {
    /// The error behind a [`AgentError::StepFailed`], or `self`.
    pub fn root(&self) -> &AgentError {
        match self {
            Self::StepFailed { source, .. } => source.root(),
            other => other,
        }
    }
}
