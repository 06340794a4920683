use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolResult};

/// Ends the run. Listed among the agent's special tools by default.
pub struct Terminate;

impl Terminate {
    pub const NAME: &'static str = "terminate";
}

#[async_trait]
impl Tool for Terminate {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Terminate the interaction when the request is met OR if the assistant cannot proceed further with the task. \
        When you have finished all the tasks, call this tool to end the work."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "description": "The finish status of the interaction.",
                    "enum": ["success", "failure"]
                }
            },
            "required": ["status"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let status = args["status"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Missing 'status' argument"))?;
        Ok(ToolResult::success(format!(
            "The interaction has been completed with status: {}",
            status
        )))
    }
}
