//! Core traits and shared data models for the issue triage agent.
//! This crate keeps the domain primitives lightweight and free of network code
//! so the runtime, the tracker integration, and the server can compose them.

pub mod issue;
pub mod llm;
pub mod messaging;
pub mod tools;

pub use issue::{Issue, IssueRef, IssueState};
pub use llm::{LanguageModel, LlmRequest, LlmResponse};
pub use messaging::{
    AgentMessage, Conversation, ConversationError, MessageContent, MessageMetadata, MessageRole,
    ToolInvocation,
};
pub use tools::{
    FunctionTool, RegistryError, Tool, ToolBox, ToolBuilder, ToolParameterSchema, ToolRegistry,
    ToolSchema,
};
