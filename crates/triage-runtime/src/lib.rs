//! Runtime that drives a triage conversation: the bounded agent
//! loop, the prompts that seed it, and the language-model providers it talks to.

pub mod orchestrator;
pub mod prompts;
pub mod providers;

pub use orchestrator::{
    LoopLimits, OrchestratorError, TriageOrchestrator, TriageOutcome, DEFAULT_MAX_MESSAGES,
    DEFAULT_MAX_STEPS,
};
pub use prompts::{issue_prompt, triage_system_prompt};
pub use providers::{
    GeminiChatModel, GeminiConfig, DEFAULT_GEMINI_MODEL, DEFAULT_MODEL_TIMEOUT, DEFAULT_TEMPERATURE,
};
