use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Core message structure exchanged between the orchestrator, the model, and tools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    pub role: MessageRole,
    pub content: MessageContent,
    /// Tool calls requested by an agent message. Empty for every other role.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Agent,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum MessageContent {
    Text(String),
    Json(Value),
}

impl MessageContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(text) => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            MessageContent::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// A structured tool request emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            args,
        }
    }
}

/// Correlates a tool-result message with the call it answers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl AgentMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(MessageRole::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::text(MessageRole::User, text)
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self::text(MessageRole::Agent, text)
    }

    /// Agent message that requests one or more tool calls.
    pub fn agent_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolInvocation>) -> Self {
        Self {
            role: MessageRole::Agent,
            content: MessageContent::Text(text.into()),
            tool_calls,
            metadata: None,
        }
    }

    /// Tool-result message answering `invocation`.
    pub fn tool_result(invocation: &ToolInvocation, text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: MessageContent::Text(text.into()),
            tool_calls: Vec::new(),
            metadata: Some(MessageMetadata {
                tool_call_id: Some(invocation.id.clone()),
                tool_name: Some(invocation.tool_name.clone()),
            }),
        }
    }

    fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
            tool_calls: Vec::new(),
            metadata: None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn tool_call_id(&self) -> Option<&str> {
        self.metadata.as_ref()?.tool_call_id.as_deref()
    }

    pub fn tool_name(&self) -> Option<&str> {
        self.metadata.as_ref()?.tool_name.as_deref()
    }
}

/// Append-only message log owned by a single triage run.
///
/// Tool results are only accepted as a batch answering the tool calls of the
/// last agent message, so a result always sits right after the request it
/// answers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    messages: Vec<AgentMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a conversation with a system instruction and the human request.
    pub fn seeded(system: impl Into<String>, human: impl Into<String>) -> Self {
        Self {
            messages: vec![AgentMessage::system(system), AgentMessage::user(human)],
        }
    }

    pub fn push(&mut self, message: AgentMessage) {
        self.messages.push(message);
    }

    /// Appends tool results for the pending calls of the last agent message.
    ///
    /// Results must be given in call order, one per call.
    pub fn push_tool_results(&mut self, results: Vec<AgentMessage>) -> Result<(), ConversationError> {
        let pending = self.pending_tool_calls();
        if pending.len() != results.len() {
            return Err(ConversationError::ResultCountMismatch {
                expected: pending.len(),
                actual: results.len(),
            });
        }
        for (call, result) in pending.iter().zip(&results) {
            if result.tool_call_id() != Some(call.id.as_str()) {
                return Err(ConversationError::ResultOutOfOrder {
                    expected: call.id.clone(),
                    actual: result.tool_call_id().map(str::to_string),
                });
            }
        }
        self.messages.extend(results);
        Ok(())
    }

    /// Tool calls of the last message when it is an agent message.
    pub fn pending_tool_calls(&self) -> &[ToolInvocation] {
        match self.messages.last() {
            Some(message) if message.role == MessageRole::Agent => &message.tool_calls,
            _ => &[],
        }
    }

    pub fn messages(&self) -> &[AgentMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&AgentMessage> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<AgentMessage> {
        self.messages
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConversationError {
    #[error("expected {expected} tool results, got {actual}")]
    ResultCountMismatch { expected: usize, actual: usize },

    #[error("tool result out of order: expected call {expected}, got {actual:?}")]
    ResultOutOfOrder {
        expected: String,
        actual: Option<String>,
    },
}
