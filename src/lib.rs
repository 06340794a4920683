//! # Stepwise
//!
//! A step-bounded, tool-calling LLM agent with persistent interactive shells.
//!
//! This library provides:
//! - A think/act control loop with a step budget, stuck-loop steering and
//!   special-tool termination
//! - A uniform tool contract and dispatcher
//! - Long-lived shell sessions, local or inside a container, with sentinel
//!   framing and per-command timeouts
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │              Agent               │
//!        │   think ─► act ─► stuck check    │
//!        └──────┬─────────────────┬─────────┘
//!               │                 │
//!               ▼                 ▼
//!        ┌────────────┐   ┌────────────────┐
//!        │ LlmClient  │   │ ToolCollection │
//!        │ (external) │   │ bash, sandbox, │
//!        └────────────┘   │ terminate      │
//!                         └───────┬────────┘
//!                                 ▼
//!                       ┌───────────────────┐
//!                       │   ShellSession    │
//!                       │ local │ container │
//!                       └───────────────────┘
//! ```
//!
//! ## Modules
//! - `agent`: control loop and lifecycle state
//! - `llm`: message model, client trait, retries and client registry
//! - `memory`: append-only message history
//! - `tools`: tool contract and built-in tools
//! - `session`: interactive shell sessions and transports
//! - `config`: agent and shell settings
//! - `logging`: tracing setup

pub mod agent;
pub mod config;
pub mod llm;
pub mod logging;
pub mod memory;
pub mod session;
pub mod tools;

pub use agent::{Agent, AgentError, AgentState, CleanupHook};
pub use config::Config;
pub use llm::{ClientRegistry, LlmClient, LlmError, RetryingClient};
pub use memory::{Memory, MemoryError};
pub use session::{SessionError, ShellOptions, ShellSession};
pub use tools::{Tool, ToolCollection, ToolResult};
