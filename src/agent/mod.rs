//! Step-bounded think/act control loop.
//!
//! Each step asks the model what to do next (`think`), then runs the tool calls
//! it chose in order (`act`). The loop stops when the step budget runs out or a
//! special tool such as `terminate` is called.

mod controller;
mod error;
mod state;


pub use controller::{Agent, CleanupHook, STUCK_PROMPT};
pub use error::AgentError;
pub use state::AgentState;
