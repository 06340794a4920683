//! Tools the agent can call, and the collection that dispatches to them.
//!
//! Every tool implements [`Tool`]. The agent only sees names, descriptions and
//! JSON schemas; dispatch goes through [`ToolCollection::execute`], which never
//! fails: unknown tools and tool errors come back as failure [`ToolResult`]s.

mod bash;
mod sandbox_shell;
mod terminate;

pub use bash::BashTool;
pub use sandbox_shell::SandboxShellTool;
pub use terminate::Terminate;

use std::fmt;
use std::ops::Add;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::{FunctionDefinition, ToolDefinition};
use crate::session::{CommandOutput, SessionError};

/// Error text for a call naming a tool that isn't registered.
pub fn unknown_tool(name: &str) -> String {
    format!("Unknown tool '{}'", name)
}

/// A tool the model can call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name used in function calls. Unique within a collection.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult>;

    /// Release resources held by the tool. Called once at the end of a run.
    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Function-call definition advertised to the model.
    fn to_param(&self) -> ToolDefinition {
        ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: self.name().to_string(),
                description: self.description().to_string(),
                parameters: self.parameters_schema(),
            },
        }
    }
}

/// Outcome of one tool call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: Option<String>,
    pub error: Option<String>,
    pub base64_image: Option<String>,
    /// Out-of-band note for the model (e.g. "tool must be restarted").
    pub system: Option<String>,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Whether there is anything at all to report.
    pub fn is_empty(&self) -> bool {
        [&self.output, &self.error, &self.base64_image, &self.system]
            .iter()
            .all(|f| f.as_deref().map_or(true, str::is_empty))
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_image(mut self, base64_image: impl Into<String>) -> Self {
        self.base64_image = Some(base64_image.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Build a result from a finished shell command: stdout as output, stderr as
    /// error (only when non-empty).
    pub fn from_command(output: CommandOutput) -> Self {
        let CommandOutput { stdout, stderr, .. } = output;
        Self {
            output: Some(stdout),
            error: (!stderr.is_empty()).then_some(stderr),
            ..Self::default()
        }
    }

    /// Build a result from a failed shell call. Errors that leave the session
    /// unusable carry a restart hint in `system`.
    pub fn from_session_error(err: &SessionError) -> Self {
        let result = Self::failure(err.to_string());
        if err.requires_restart() {
            result.with_system("tool must be restarted")
        } else {
            result
        }
    }

    /// Combine two results. Text fields are concatenated; two images cannot be
    /// merged.
    pub fn combine(self, other: ToolResult) -> anyhow::Result<ToolResult> {
        fn join(a: Option<String>, b: Option<String>) -> Option<String> {
            match (a, b) {
                (Some(a), Some(b)) => Some(a + &b),
                (a, b) => a.or(b),
            }
        }

        let base64_image = match (self.base64_image, other.base64_image) {
            (Some(_), Some(_)) => anyhow::bail!("Cannot combine tool results"),
            (a, b) => a.or(b),
        };
        Ok(ToolResult {
            output: join(self.output, other.output),
            error: join(self.error, other.error),
            base64_image,
            system: join(self.system, other.system),
        })
    }
}

impl Add for ToolResult {
    type Output = anyhow::Result<ToolResult>;

    fn add(self, other: ToolResult) -> Self::Output {
        self.combine(other)
    }
}

impl fmt::Display for ToolResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.error, &self.output) {
            (Some(error), _) => write!(f, "Error: {}", error),
            (None, Some(output)) => f.write_str(output),
            (None, None) => Ok(()),
        }
    }
}

/// Ordered set of tools, looked up by name.
#[derive(Default, Clone)]
pub struct ToolCollection {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. A tool whose name is already taken is skipped.
    pub fn add_tool(&mut self, tool: Arc<dyn Tool>) -> &mut Self {
        if self.get(tool.name()).is_some() {
            tracing::warn!("Tool {} already exists in collection, skipping", tool.name());
        } else {
            self.tools.push(tool);
        }
        self
    }

    pub fn add_tools(&mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> &mut Self {
        for tool in tools {
            self.add_tool(tool);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Tool>> {
        self.tools.iter()
    }

    /// Definitions of every tool, in registration order.
    pub fn to_params(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.to_param()).collect()
    }

    /// Run a tool by name. Never fails: problems become failure results.
    pub async fn execute(&self, name: &str, args: Value) -> ToolResult {
        let Some(tool) = self.get(name) else {
            return ToolResult::failure(unknown_tool(name));
        };
        match tool.execute(args).await {
            Ok(result) => result,
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }

    /// Run every tool's cleanup, logging failures.
    pub async fn cleanup_all(&self) {
        for tool in &self.tools {
            if let Err(e) = tool.cleanup().await {
                tracing::error!("Error cleaning up tool '{}': {}", tool.name(), e);
            }
        }
    }
}

impl fmt::Debug for ToolCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCollection")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo(&'static str);

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "Echo the text argument"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            })
        }

        async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
            let text = args["text"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("Missing 'text' argument"))?;
            Ok(ToolResult::success(text))
        }
    }

    #[test]
    fn test_result_display_and_success() {
        let ok = ToolResult::success("done");
        assert!(ok.is_success());
        assert_eq!(ok.to_string(), "done");

        let err = ToolResult::failure("boom").with_output("partial");
        assert!(!err.is_success());
        assert_eq!(err.to_string(), "Error: boom");

        assert!(ToolResult::default().is_empty());
        assert!(!ok.is_empty());
    }

    #[test]
    fn test_result_combine() {
        let a = ToolResult::success("one ").with_image("img");
        let b = ToolResult::success("two").with_system("note");
        let combined = (a.clone() + b).unwrap();
        assert_eq!(combined.output.as_deref(), Some("one two"));
        assert_eq!(combined.base64_image.as_deref(), Some("img"));
        assert_eq!(combined.system.as_deref(), Some("note"));

        assert!((a.clone() + a).is_err());
    }

    #[test]
    fn test_result_from_session_error() {
        let rejected = ToolResult::from_session_error(&SessionError::Rejected {
            pattern: "rm -rf /",
            reason: "nope",
        });
        assert!(rejected.system.is_none());

        let timed_out = ToolResult::from_session_error(&SessionError::Unusable);
        assert_eq!(timed_out.system.as_deref(), Some("tool must be restarted"));
    }

    #[tokio::test]
    async fn test_collection_order_and_duplicates() {
        let mut tools = ToolCollection::new();
        tools
            .add_tool(Arc::new(Echo("b")))
            .add_tool(Arc::new(Echo("a")))
            .add_tool(Arc::new(Echo("b")));
        assert_eq!(tools.names(), vec!["b", "a"]);

        let params = tools.to_params();
        assert_eq!(params[0].function.name, "b");
        assert_eq!(params[0].tool_type, "function");
    }

    #[tokio::test]
    async fn test_collection_execute_never_fails() {
        let mut tools = ToolCollection::new();
        tools.add_tool(Arc::new(Echo("echo")));

        let ok = tools.execute("echo", json!({ "text": "hi" })).await;
        assert_eq!(ok.output.as_deref(), Some("hi"));

        let missing_arg = tools.execute("echo", json!({})).await;
        assert_eq!(missing_arg.error.as_deref(), Some("Missing 'text' argument"));

        let unknown = tools.execute("nope", json!({})).await;
        assert_eq!(unknown.error.as_deref(), Some("Unknown tool 'nope'"));
        assert_eq!(unknown.to_string(), "Error: Unknown tool 'nope'");
    }
}
