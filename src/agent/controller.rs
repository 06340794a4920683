use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{AgentError, AgentState};
use crate::config::AgentSettings;
use crate::llm::{LlmClient, Message, Role, ToolCall, ToolChoice, ToolRequest};
use crate::memory::{Memory, MemoryError};
use crate::tools::{unknown_tool, ToolCollection};

/// Steering text prepended to the next prompt when the agent repeats itself.
pub const STUCK_PROMPT: &str = "Observed duplicate responses. Consider new strategies \
and avoid repeating ineffective paths already attempted.";

const NO_ACTION: &str = "Thinking complete - no action needed";

/// Process-wide resources released after every run, e.g. a shared sandbox.
#[async_trait]
pub trait CleanupHook: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;
}

/// A tool-calling agent.
///
/// The agent owns its memory and state; the LLM client and cleanup hook are
/// handed in by whoever assembles it.
pub struct Agent {
    settings: AgentSettings,
    llm: Arc<dyn LlmClient>,
    tools: ToolCollection,
    memory: Memory,
    state: AgentState,
    current_step: u32,
    /// Tool calls from the last `think`, consumed by `act`.
    tool_calls: Vec<ToolCall>,
    /// One-off steering text for the next `think`.
    steer: Option<String>,
    cleanup_hook: Option<Arc<dyn CleanupHook>>,
}

impl Agent {
    pub fn new(settings: AgentSettings, llm: Arc<dyn LlmClient>, tools: ToolCollection) -> Self {
        Self {
            settings,
            llm,
            tools,
            memory: Memory::new(),
            state: AgentState::Idle,
            current_step: 0,
            tool_calls: Vec::new(),
            steer: None,
            cleanup_hook: None,
        }
    }

    pub fn with_cleanup_hook(mut self, hook: Arc<dyn CleanupHook>) -> Self {
        self.cleanup_hook = Some(hook);
        self
    }

    pub fn with_memory(mut self, memory: Memory) -> Self {
        self.memory = memory;
        self
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn current_step(&self) -> u32 {
        self.current_step
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn tools(&self) -> &ToolCollection {
        &self.tools
    }

    /// Append a message to memory before or between runs.
    pub fn add_message(&mut self, message: Message) -> Result<(), MemoryError> {
        self.memory.add_message(message)
    }

    /// Return a finished or failed agent to `Idle`. Memory is kept.
    pub fn reset(&mut self) {
        if self.state != AgentState::Idle {
            tracing::info!("Resetting agent '{}' from {}", self.settings.name, self.state);
        }
        self.state = AgentState::Idle;
        self.current_step = 0;
        self.tool_calls.clear();
        self.steer = None;
    }

    /// Run the loop until the step budget is spent or a special tool finishes
    /// the task. Returns the per-step log.
    ///
    /// Tool cleanup and the cleanup hook run on every exit path. If the
    /// returned future is dropped early or a tool panics, the agent is left in
    /// `Error` and cleanup is spawned onto the runtime instead.
    pub async fn run(&mut self, request: Option<&str>) -> Result<String, AgentError> {
        if self.state != AgentState::Idle {
            return Err(AgentError::NotRunnable { state: self.state });
        }
        if let Some(request) = request {
            self.memory.add_message(Message::user(request))?;
        }

        let mut scope = RunScope {
            agent: self,
            released: false,
        };
        let outcome = scope.agent.run_steps().await;
        scope.agent.cleanup().await;
        scope.released = true;
        outcome
    }

    async fn run_steps(&mut self) -> Result<String, AgentError> {
        let max_steps = self.settings.max_steps;
        let mut results = Vec::new();
        self.state = AgentState::Running;

        while self.current_step < max_steps && self.state != AgentState::Finished {
            self.current_step += 1;
            tracing::info!("Executing step {}/{}", self.current_step, max_steps);

            let step_result = match self.step().await {
                Ok(result) => result,
                Err(e) => {
                    self.state = AgentState::Error;
                    tracing::error!(
                        "Agent '{}' failed at step {}: {}",
                        self.settings.name,
                        self.current_step,
                        e
                    );
                    return Err(AgentError::StepFailed {
                        step: self.current_step,
                        partial_log: results.join("\n"),
                        source: Box::new(e),
                    });
                }
            };

            if self.is_stuck() {
                self.handle_stuck_state();
            }
            results.push(format!("Step {}: {}", self.current_step, step_result));
        }

        if self.state != AgentState::Finished {
            if self.current_step >= max_steps {
                self.current_step = 0;
                results.push(format!("Terminated: Reached max steps ({})", max_steps));
            }
            self.state = AgentState::Idle;
        }

        if results.is_empty() {
            Ok("No steps executed".to_string())
        } else {
            Ok(results.join("\n"))
        }
    }

    /// One think/act step.
    pub async fn step(&mut self) -> Result<String, AgentError> {
        if !self.think().await? {
            return Ok(NO_ACTION.to_string());
        }
        self.act().await
    }

    /// Ask the model for the next action. Returns whether `act` should run.
    pub async fn think(&mut self) -> Result<bool, AgentError> {
        if let Some(prompt) = self.next_prompt() {
            self.memory.add_message(Message::user(prompt))?;
        }

        let tool_choice = self.settings.tool_choice;
        let system = self
            .settings
            .system_prompt
            .as_ref()
            .map(|p| vec![Message::system(p.clone())]);
        let tools = self.tools.to_params();
        let request = ToolRequest {
            messages: self.memory.messages(),
            system_messages: system.as_deref(),
            tools: &tools,
            tool_choice,
        };

        let reply = self.llm.ask_tool(request).await;
        let response = match reply {
            Ok(response) => response,
            Err(e) if e.is_limit_exceeded() => {
                tracing::error!("Token limit error: {}", e);
                self.memory.add_message(Message::assistant(format!(
                    "Maximum token limit reached, cannot continue execution: {}",
                    e
                )))?;
                self.state = AgentState::Finished;
                return Ok(false);
            }
            Err(e) => return Err(AgentError::Model(e)),
        };

        let content = response.content.unwrap_or_default();
        self.tool_calls = response.tool_calls;

        let name = &self.settings.name;
        tracing::info!("{}'s thoughts: {}", name, content);
        tracing::info!("{} selected {} tools to use", name, self.tool_calls.len());
        if let Some(first) = self.tool_calls.first() {
            let names: Vec<&str> = self
                .tool_calls
                .iter()
                .map(|c| c.function.name.as_str())
                .collect();
            tracing::info!("Tools being prepared: {:?}", names);
            tracing::debug!("Tool arguments: {}", first.function.arguments);
        }

        if tool_choice == ToolChoice::None {
            if !self.tool_calls.is_empty() {
                tracing::warn!("{} tried to use tools when they weren't available!", name);
                self.tool_calls.clear();
            }
            if content.is_empty() {
                return Ok(false);
            }
            self.memory.add_message(Message::assistant(content))?;
            return Ok(true);
        }

        let has_calls = !self.tool_calls.is_empty();
        let message = if has_calls {
            Message::from_tool_calls(content.clone(), self.tool_calls.clone())
        } else {
            Message::assistant(content.clone())
        };
        self.memory.add_message(message)?;

        Ok(match tool_choice {
            // Missing calls are reported by `act`.
            ToolChoice::Required if !has_calls => true,
            ToolChoice::Auto if !has_calls => !content.is_empty(),
            _ => has_calls,
        })
    }

    /// Execute the pending tool calls in order, recording each result.
    pub async fn act(&mut self) -> Result<String, AgentError> {
        if self.tool_calls.is_empty() {
            if self.settings.tool_choice == ToolChoice::Required {
                return Err(AgentError::ToolCallRequired);
            }
            return Ok(self
                .memory
                .last()
                .and_then(|m| m.content.clone())
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| "No content or commands to execute".to_string()));
        }

        let calls = std::mem::take(&mut self.tool_calls);
        let mut results = Vec::with_capacity(calls.len());
        for call in &calls {
            let (observation, image) = self.execute_tool(call).await;
            let observation = match self.settings.max_observe {
                Some(max) => truncate_chars(observation, max),
                None => observation,
            };
            tracing::info!(
                "Tool '{}' completed its mission! Result: {}",
                call.function.name,
                observation
            );

            self.memory.add_message(
                Message::tool(observation.clone(), call.id.clone(), call.function.name.clone())
                    .with_image(image),
            )?;
            results.push(observation);
        }

        Ok(results.join("\n\n"))
    }

    /// Run one tool call. Never fails: every problem becomes an observation.
    async fn execute_tool(&mut self, call: &ToolCall) -> (String, Option<String>) {
        let name = call.function.name.as_str();
        if name.is_empty() {
            return ("Error: Invalid command format".to_string(), None);
        }
        let Some(tool) = self.tools.get(name).cloned() else {
            return (format!("Error: {}", unknown_tool(name)), None);
        };

        let raw = call.function.arguments.trim();
        let args = if raw.is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str::<Value>(raw) {
                Ok(args) => args,
                Err(_) => {
                    tracing::error!(
                        "The arguments for '{}' are invalid JSON: {}",
                        name,
                        call.function.arguments
                    );
                    return (
                        format!("Error: Error parsing arguments for {}: Invalid JSON format", name),
                        None,
                    );
                }
            }
        };

        tracing::info!("Activating tool: '{}'...", name);
        tracing::debug!("Tool arguments: {}", args);
        let result = match tool.execute(args).await {
            Ok(result) => result,
            Err(e) => {
                let message = format!("Tool '{}' encountered a problem: {}", name, e);
                tracing::error!("{}", message);
                return (format!("Error: {}", message), None);
            }
        };

        self.handle_special_tool(name);

        if let Some(error) = &result.error {
            tracing::error!("Tool '{}' failed: {}", name, error);
        }
        if let Some(image) = &result.base64_image {
            tracing::info!(
                "Tool '{}' returned an image: {:.2} KB",
                name,
                image.len() as f64 * 3.0 / 4.0 / 1024.0
            );
        }

        let observation = if result.is_empty() {
            format!("Cmd `{}` completed with no output", name)
        } else {
            format!("Observed output of cmd `{}` executed:\n{}", name, result)
        };
        (observation, result.base64_image)
    }

    fn is_special_tool(&self, name: &str) -> bool {
        self.settings
            .special_tools
            .iter()
            .any(|special| special.eq_ignore_ascii_case(name))
    }

    fn handle_special_tool(&mut self, name: &str) {
        if self.is_special_tool(name) {
            tracing::info!("Special tool '{}' has completed the task!", name);
            self.state = AgentState::Finished;
        }
    }

    /// Whether the latest assistant reply repeats earlier ones at least
    /// `duplicate_threshold` times.
    pub fn is_stuck(&self) -> bool {
        let messages = self.memory.messages();
        let Some(last) = messages.iter().rposition(|m| m.role == Role::Assistant) else {
            return false;
        };
        let Some(content) = messages[last].content.as_deref().filter(|c| !c.is_empty()) else {
            return false;
        };

        let duplicates = messages[..last]
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant && m.content.as_deref() == Some(content))
            .count();
        duplicates >= self.settings.duplicate_threshold
    }

    fn handle_stuck_state(&mut self) {
        tracing::warn!("Agent detected stuck state. Added prompt: {}", STUCK_PROMPT);
        self.steer = Some(STUCK_PROMPT.to_string());
    }

    fn next_prompt(&mut self) -> Option<String> {
        match (self.steer.take(), self.settings.next_step_prompt.as_deref()) {
            (Some(steer), Some(next)) => Some(format!("{}\n{}", steer, next)),
            (Some(steer), None) => Some(steer),
            (None, Some(next)) => Some(next.to_string()),
            (None, None) => None,
        }
    }

    async fn cleanup(&mut self) {
        release(&self.settings.name, &self.tools, self.cleanup_hook.as_ref()).await;
    }
}

/// Holds the agent for the length of one `run`. Dropped without `released`
/// set, it marks the run failed and releases resources in the background.
struct RunScope<'a> {
    agent: &'a mut Agent,
    released: bool,
}

impl Drop for RunScope<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let agent = &mut *self.agent;
        if agent.state == AgentState::Running {
            agent.state = AgentState::Error;
        }
        agent.tool_calls.clear();
        tracing::warn!(
            "Agent '{}' run was abandoned at step {}",
            agent.settings.name,
            agent.current_step
        );

        let name = agent.settings.name.clone();
        let tools = agent.tools.clone();
        let hook = agent.cleanup_hook.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    release(&name, &tools, hook.as_ref()).await;
                });
            }
            Err(_) => tracing::error!("No runtime to clean up agent '{}'", name),
        }
    }
}

/// Release tool resources, then the process-wide hook. Failures are logged.
async fn release(name: &str, tools: &ToolCollection, hook: Option<&Arc<dyn CleanupHook>>) {
    tracing::info!("Cleaning up resources for agent '{}'...", name);
    tools.cleanup_all().await;
    if let Some(hook) = hook {
        if let Err(e) = hook.cleanup().await {
            tracing::error!("Cleanup hook failed: {}", e);
        }
    }
    tracing::info!("Cleanup complete for agent '{}'.", name);
}

fn truncate_chars(mut text: String, max: usize) -> String {
    if let Some((idx, _)) = text.char_indices().nth(max) {
        text.truncate(idx);
    }
    text
}
