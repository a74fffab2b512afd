//! Bounded agent loop.
//!
//! A run alternates between asking the model for its next message and
//! executing the tool calls that message requests. Two independent counters
//! bound the loop: the number of messages in the conversation and the number
//! of tool rounds executed.

use futures::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use triage_core::{
    AgentMessage, Conversation, ConversationError, IssueRef, LanguageModel, LlmRequest,
    RegistryError, ToolRegistry,
};

use crate::prompts::{issue_prompt, triage_system_prompt};

pub const DEFAULT_MAX_MESSAGES: usize = 10;
pub const DEFAULT_MAX_STEPS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    /// The run stops asking for tools once the conversation holds more messages than this.
    pub max_messages: usize,
    /// Tool rounds allowed before the run is declared exhausted.
    pub max_steps: usize,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Agent,
    Tools,
    End,
}

/// Successful end of a run.
#[derive(Debug, Clone)]
pub struct TriageOutcome {
    pub response: String,
    pub history: Vec<AgentMessage>,
    pub steps: usize,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("language model call failed: {0}")]
    Model(#[source] anyhow::Error),

    #[error("agent failed to produce a valid response")]
    InvalidAgentResponse { history: Vec<AgentMessage> },

    #[error("agent loop exhausted after {steps} tool rounds and {messages} messages")]
    LoopExhausted {
        steps: usize,
        messages: usize,
        history: Vec<AgentMessage>,
    },

    #[error("model requested unknown tool '{0}'")]
    UnknownTool(String),

    #[error(transparent)]
    Registry(RegistryError),

    #[error(transparent)]
    Conversation(#[from] ConversationError),
}

impl From<RegistryError> for OrchestratorError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownTool(name) => OrchestratorError::UnknownTool(name),
            other => OrchestratorError::Registry(other),
        }
    }
}

impl OrchestratorError {
    pub fn is_loop_exhausted(&self) -> bool {
        matches!(self, OrchestratorError::LoopExhausted { .. })
    }

    pub fn is_invalid_response(&self) -> bool {
        matches!(self, OrchestratorError::InvalidAgentResponse { .. })
    }

    /// Short machine-friendly label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Model(_) => "model",
            OrchestratorError::InvalidAgentResponse { .. } => "invalid_agent_response",
            OrchestratorError::LoopExhausted { .. } => "loop_exhausted",
            OrchestratorError::UnknownTool(_) => "unknown_tool",
            OrchestratorError::Registry(_) => "registry",
            OrchestratorError::Conversation(_) => "conversation",
        }
    }

    /// Conversation as it stood when the run failed, when the error carries it.
    pub fn history(&self) -> Option<&[AgentMessage]> {
        match self {
            OrchestratorError::InvalidAgentResponse { history }
            | OrchestratorError::LoopExhausted { history, .. } => Some(history),
            _ => None,
        }
    }
}

/// Drives one conversation between a model and a tool registry.
pub struct TriageOrchestrator {
    model: Arc<dyn LanguageModel>,
    registry: Arc<ToolRegistry>,
    limits: LoopLimits,
}

impl TriageOrchestrator {
    pub fn new(model: Arc<dyn LanguageModel>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            model,
            registry,
            limits: LoopLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: LoopLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> LoopLimits {
        self.limits
    }

    /// Seed a conversation for `target` and run it to completion.
    pub async fn triage(
        &self,
        target: &IssueRef,
        title: Option<&str>,
    ) -> Result<TriageOutcome, OrchestratorError> {
        let conversation = Conversation::seeded(triage_system_prompt(), issue_prompt(target, title));
        self.run(conversation).await
    }

    pub async fn run(&self, mut conversation: Conversation) -> Result<TriageOutcome, OrchestratorError> {
        let tools = self.registry.schemas();
        let mut steps = 0usize;
        let mut state = LoopState::Agent;

        loop {
            state = match state {
                LoopState::Agent => {
                    let request = LlmRequest::new(conversation.messages().to_vec())
                        .with_tools(tools.clone());
                    let response = self
                        .model
                        .generate(request)
                        .await
                        .map_err(OrchestratorError::Model)?;
                    let wants_tools = response.message.has_tool_calls();
                    conversation.push(response.message);

                    if wants_tools && conversation.len() <= self.limits.max_messages {
                        LoopState::Tools
                    } else {
                        LoopState::End
                    }
                }
                LoopState::Tools => {
                    if steps >= self.limits.max_steps {
                        warn!(steps, messages = conversation.len(), "step cap reached");
                        return Err(OrchestratorError::LoopExhausted {
                            steps,
                            messages: conversation.len(),
                            history: conversation.into_messages(),
                        });
                    }
                    steps += 1;
                    self.run_tools(&mut conversation, steps).await?;
                    LoopState::Agent
                }
                LoopState::End => return self.finish(conversation, steps),
            };
        }
    }

    async fn run_tools(&self, conversation: &mut Conversation, step: usize) -> Result<(), OrchestratorError> {
        let calls = conversation.pending_tool_calls().to_vec();

        // Resolve the whole batch before anything runs.
        if let Some(unknown) = calls.iter().find(|call| !self.registry.has(&call.tool_name)) {
            return Err(OrchestratorError::UnknownTool(unknown.tool_name.clone()));
        }

        debug!(step, calls = calls.len(), "dispatching tool calls");
        let results = join_all(calls.iter().map(|call| {
            debug!(step, tool = %call.tool_name, id = %call.id, "invoking tool");
            self.registry.invoke(call)
        }))
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

        conversation.push_tool_results(results)?;
        Ok(())
    }

    fn finish(&self, conversation: Conversation, steps: usize) -> Result<TriageOutcome, OrchestratorError> {
        if conversation.last().is_some_and(AgentMessage::has_tool_calls) {
            warn!(steps, messages = conversation.len(), "message cap reached with tool calls pending");
            return Err(OrchestratorError::LoopExhausted {
                steps,
                messages: conversation.len(),
                history: conversation.into_messages(),
            });
        }

        let text = conversation
            .last()
            .and_then(|message| message.content.as_text())
            .map(str::to_string);
        let Some(response) = text else {
            return Err(OrchestratorError::InvalidAgentResponse {
                history: conversation.into_messages(),
            });
        };

        info!(steps, messages = conversation.len(), "agent run completed");
        Ok(TriageOutcome {
            response,
            history: conversation.into_messages(),
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use triage_core::{
        LlmResponse, MessageContent, MessageRole, ToolBuilder, ToolInvocation, ToolParameterSchema,
    };

    /// Replays queued messages, then repeats the fallback forever.
    struct ScriptedModel {
        script: Mutex<VecDeque<AgentMessage>>,
        fallback: Option<AgentMessage>,
        calls: AtomicUsize,
        seen: Mutex<Vec<Vec<AgentMessage>>>,
    }

    impl ScriptedModel {
        fn new(script: Vec<AgentMessage>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback: None,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn repeating(message: AgentMessage) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                fallback: Some(message),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn generate(&self, request: LlmRequest) -> anyhow::Result<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.messages);
            let next = self.script.lock().unwrap().pop_front();
            let message = next
                .or_else(|| self.fallback.clone())
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))?;
            Ok(LlmResponse { message })
        }
    }

    fn echo_registry() -> Arc<ToolRegistry> {
        let mut properties = BTreeMap::new();
        properties.insert("text".to_string(), ToolParameterSchema::string("Text to echo"));
        properties.insert(
            "delay_ms".to_string(),
            ToolParameterSchema::integer("Delay before answering"),
        );
        let echo = ToolBuilder::new("echo", "Echo text back")
            .with_parameters(ToolParameterSchema::object(
                "Echo input",
                properties,
                vec!["text".to_string()],
            ))
            .build_async(|args: Value| async move {
                let delay = args.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
                if text == "fail" {
                    return "Error echoing: upstream unavailable".to_string();
                }
                format!("echo: {text}")
            });

        let mut registry = ToolRegistry::new();
        registry.register(echo).unwrap();
        Arc::new(registry)
    }

    fn echo_call(id: &str, text: &str) -> ToolInvocation {
        ToolInvocation::new(id, "echo", json!({ "text": text }))
    }

    fn seeded() -> Conversation {
        Conversation::seeded("system", "triage octo/widgets#1")
    }

    #[tokio::test]
    async fn plain_answer_ends_after_one_model_call() {
        let model = ScriptedModel::new(vec![AgentMessage::agent("Nothing to do.")]);
        let orchestrator = TriageOrchestrator::new(model.clone(), echo_registry());

        let outcome = orchestrator.run(seeded()).await.unwrap();

        assert_eq!(model.calls(), 1);
        assert_eq!(outcome.response, "Nothing to do.");
        assert_eq!(outcome.steps, 0);
        assert_eq!(outcome.history.len(), 3);
    }

    #[tokio::test]
    async fn tool_results_feed_the_next_model_call() {
        let model = ScriptedModel::new(vec![
            AgentMessage::agent_tool_calls("", vec![echo_call("c1", "hello")]),
            AgentMessage::agent("Done."),
        ]);
        let orchestrator = TriageOrchestrator::new(model.clone(), echo_registry());

        let outcome = orchestrator.run(seeded()).await.unwrap();

        assert_eq!(outcome.steps, 1);
        assert_eq!(outcome.response, "Done.");
        let seen = model.seen.lock().unwrap();
        let second = &seen[1];
        let result = second.last().unwrap();
        assert_eq!(result.role, MessageRole::Tool);
        assert_eq!(result.tool_call_id(), Some("c1"));
        assert_eq!(result.content.as_text(), Some("echo: hello"));
    }

    #[tokio::test]
    async fn tool_that_always_runs_hits_message_cap() {
        let model =
            ScriptedModel::repeating(AgentMessage::agent_tool_calls("", vec![echo_call("c", "again")]));
        let orchestrator = TriageOrchestrator::new(model.clone(), echo_registry());

        let err = orchestrator.run(seeded()).await.unwrap_err();

        match err {
            OrchestratorError::LoopExhausted { steps, messages, history } => {
                // 2 seed messages, then agent/tool pairs until the count passes 10
                assert_eq!(steps, 4);
                assert_eq!(messages, 11);
                assert_eq!(history.len(), 11);
                assert!(steps <= DEFAULT_MAX_STEPS);
            }
            other => panic!("expected LoopExhausted, got {other:?}"),
        }
        assert_eq!(model.calls(), 5);
    }

    #[tokio::test]
    async fn step_cap_is_enforced_independently() {
        let model =
            ScriptedModel::repeating(AgentMessage::agent_tool_calls("", vec![echo_call("c", "again")]));
        let orchestrator = TriageOrchestrator::new(model.clone(), echo_registry()).with_limits(
            LoopLimits {
                max_messages: 1_000,
                max_steps: 3,
            },
        );

        let err = orchestrator.run(seeded()).await.unwrap_err();

        assert!(err.is_loop_exhausted());
        match err {
            OrchestratorError::LoopExhausted { steps, .. } => assert_eq!(steps, 3),
            other => panic!("expected LoopExhausted, got {other:?}"),
        }
        assert_eq!(model.calls(), 4);
    }

    #[tokio::test]
    async fn non_text_terminal_message_is_invalid() {
        let mut message = AgentMessage::agent("");
        message.content = MessageContent::Json(json!({ "finishReason": "MALFORMED_FUNCTION_CALL" }));
        let model = ScriptedModel::new(vec![message]);
        let orchestrator = TriageOrchestrator::new(model, echo_registry());

        let err = orchestrator.run(seeded()).await.unwrap_err();

        assert!(err.is_invalid_response());
        assert_eq!(err.history().map(<[AgentMessage]>::len), Some(3));
    }

    #[tokio::test]
    async fn tool_error_text_keeps_the_run_going() {
        let model = ScriptedModel::new(vec![
            AgentMessage::agent_tool_calls("", vec![echo_call("c1", "fail")]),
            AgentMessage::agent("The tracker was unavailable."),
        ]);
        let orchestrator = TriageOrchestrator::new(model.clone(), echo_registry());

        let outcome = orchestrator.run(seeded()).await.unwrap();

        assert_eq!(model.calls(), 2);
        assert_eq!(
            outcome.history[3].content.as_text(),
            Some("Error echoing: upstream unavailable")
        );
    }

    #[tokio::test]
    async fn invalid_arguments_reach_the_model_as_text() {
        let model = ScriptedModel::new(vec![
            AgentMessage::agent_tool_calls(
                "",
                vec![ToolInvocation::new("c1", "echo", json!({ "wrong": true }))],
            ),
            AgentMessage::agent("Gave up."),
        ]);
        let orchestrator = TriageOrchestrator::new(model, echo_registry());

        let outcome = orchestrator.run(seeded()).await.unwrap();

        let result = outcome.history[3].content.as_text().unwrap();
        assert!(result.starts_with("Invalid arguments for tool 'echo'"));
    }

    #[tokio::test]
    async fn unknown_tool_is_fatal_before_dispatch() {
        let model = ScriptedModel::new(vec![AgentMessage::agent_tool_calls(
            "",
            vec![
                echo_call("c1", "never runs"),
                ToolInvocation::new("c2", "delete_repo", json!({})),
            ],
        )]);
        let orchestrator = TriageOrchestrator::new(model, echo_registry());

        let err = orchestrator.run(seeded()).await.unwrap_err();

        assert!(matches!(err, OrchestratorError::UnknownTool(ref name) if name == "delete_repo"));
        assert_eq!(err.kind(), "unknown_tool");
    }

    #[tokio::test]
    async fn results_keep_call_order_when_completion_is_reversed() {
        let calls = vec![
            ToolInvocation::new("slow", "echo", json!({ "text": "first", "delay_ms": 60 })),
            ToolInvocation::new("medium", "echo", json!({ "text": "second", "delay_ms": 30 })),
            ToolInvocation::new("fast", "echo", json!({ "text": "third", "delay_ms": 0 })),
        ];
        let model = ScriptedModel::new(vec![
            AgentMessage::agent_tool_calls("", calls),
            AgentMessage::agent("All echoed."),
        ]);
        let orchestrator = TriageOrchestrator::new(model, echo_registry());

        let outcome = orchestrator.run(seeded()).await.unwrap();

        let results: Vec<(&str, &str)> = outcome.history[3..6]
            .iter()
            .map(|m| (m.tool_call_id().unwrap(), m.content.as_text().unwrap()))
            .collect();
        assert_eq!(
            results,
            vec![
                ("slow", "echo: first"),
                ("medium", "echo: second"),
                ("fast", "echo: third"),
            ]
        );
    }

    #[tokio::test]
    async fn model_failure_is_reported() {
        let model = ScriptedModel::new(Vec::new());
        let orchestrator = TriageOrchestrator::new(model, echo_registry());

        let err = orchestrator.run(seeded()).await.unwrap_err();
        assert_eq!(err.kind(), "model");
    }

    #[tokio::test]
    async fn triage_seeds_system_and_issue_messages() {
        let model = ScriptedModel::new(vec![AgentMessage::agent("ok")]);
        let orchestrator = TriageOrchestrator::new(model.clone(), echo_registry());

        orchestrator
            .triage(&IssueRef::new("octo", "widgets", 9), Some("Crash"))
            .await
            .unwrap();

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen[0].len(), 2);
        assert_eq!(seen[0][0].role, MessageRole::System);
        assert_eq!(seen[0][1].role, MessageRole::User);
        assert!(seen[0][1].content.as_text().unwrap().contains("octo/widgets"));
    }
}
