//! Append-only conversation memory owned by the agent loop.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::{Message, Role};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Tool message {tool_call_id:?} does not answer any assistant tool call")]
    UnansweredToolMessage { tool_call_id: Option<String> },
}

/// Role-tagged message history.
///
/// Messages are only ever appended; nothing is edited in place. A `tool`
/// message is only accepted after an assistant message that issued its call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Memory {
    messages: Vec<Message>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message(&mut self, message: Message) -> Result<(), MemoryError> {
        if message.role == Role::Tool {
            let answered = message.tool_call_id.as_deref().is_some_and(|id| {
                self.messages
                    .iter()
                    .any(|m| m.role == Role::Assistant && m.tool_calls.iter().any(|c| c.id == id))
            });
            if !answered {
                tracing::warn!(
                    "Rejected tool message {:?}: no matching assistant tool call",
                    message.tool_call_id
                );
                return Err(MemoryError::UnansweredToolMessage {
                    tool_call_id: message.tool_call_id,
                });
            }
        }
        self.messages.push(message);
        Ok(())
    }

    /// Append in order, stopping at the first rejected message.
    pub fn add_messages(
        &mut self,
        messages: impl IntoIterator<Item = Message>,
    ) -> Result<(), MemoryError> {
        for message in messages {
            self.add_message(message)?;
        }
        Ok(())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The last `n` messages, oldest first.
    pub fn recent(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Most recent assistant message, if any.
    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }
}
