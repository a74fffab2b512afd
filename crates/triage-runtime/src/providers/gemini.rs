use anyhow::{anyhow, Context};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use triage_core::{
    AgentMessage, LanguageModel, LlmRequest, LlmResponse, MessageContent, MessageRole,
    ToolInvocation, ToolParameterSchema,
};

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_TEMPERATURE: f32 = 0.2;
pub const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct GeminiConfig {
    pub api_key: SecretString,
    pub model: String,
    pub temperature: f32,
    pub api_url: Option<String>,
    /// Upper bound for one `generateContent` call, connection included.
    pub request_timeout: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::from(api_key.into()),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            api_url: None,
            request_timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_api_url(mut self, api_url: Option<String>) -> Self {
        self.api_url = api_url;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

/// Gemini `generateContent` chat model with native function calling.
pub struct GeminiChatModel {
    client: Client,
    config: GeminiConfig,
}

impl GeminiChatModel {
    pub fn new(config: GeminiConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: Client::builder()
                .user_agent(concat!("issue-triage-agent/", env!("CARGO_PKG_VERSION")))
                .timeout(config.request_timeout)
                .build()?,
            config,
        })
    }

    fn endpoint(&self) -> String {
        let base_url = self
            .config
            .api_url
            .as_deref()
            .unwrap_or(GEMINI_API_URL)
            .trim_end_matches('/');
        format!("{}/models/{}:generateContent", base_url, self.config.model)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<GeminiTools>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTools {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: ToolParameterSchema,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

fn text_part(text: impl Into<String>) -> GeminiPart {
    GeminiPart {
        text: Some(text.into()),
        ..Default::default()
    }
}

fn content_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Json(value) => value.to_string(),
    }
}

fn to_gemini_request(request: &LlmRequest, temperature: f32) -> GeminiRequest {
    let mut system = Vec::new();
    let mut contents: Vec<GeminiContent> = Vec::new();

    for message in &request.messages {
        match message.role {
            MessageRole::System => system.push(content_text(&message.content)),
            MessageRole::User => contents.push(GeminiContent {
                role: Some("user".into()),
                parts: vec![text_part(content_text(&message.content))],
            }),
            MessageRole::Agent => {
                let mut parts = Vec::new();
                let text = content_text(&message.content);
                if !text.is_empty() {
                    parts.push(text_part(text));
                }
                parts.extend(message.tool_calls.iter().map(|call| GeminiPart {
                    function_call: Some(FunctionCall {
                        id: None,
                        name: call.tool_name.clone(),
                        args: call.args.clone(),
                    }),
                    ..Default::default()
                }));
                if parts.is_empty() {
                    parts.push(text_part(""));
                }
                contents.push(GeminiContent {
                    role: Some("model".into()),
                    parts,
                });
            }
            MessageRole::Tool => {
                let part = GeminiPart {
                    function_response: Some(FunctionResponse {
                        name: message.tool_name().unwrap_or_default().to_string(),
                        response: json!({ "content": content_text(&message.content) }),
                    }),
                    ..Default::default()
                };
                // Results answering one model turn travel together.
                match contents.last_mut() {
                    Some(last)
                        if last.role.as_deref() == Some("user")
                            && last.parts.iter().all(|p| p.function_response.is_some()) =>
                    {
                        last.parts.push(part)
                    }
                    _ => contents.push(GeminiContent {
                        role: Some("user".into()),
                        parts: vec![part],
                    }),
                }
            }
        }
    }

    let system_instruction = (!system.is_empty()).then(|| GeminiContent {
        role: None,
        parts: vec![text_part(system.join("\n\n"))],
    });

    let tools = if request.tools.is_empty() {
        Vec::new()
    } else {
        vec![GeminiTools {
            function_declarations: request
                .tools
                .iter()
                .map(|tool| FunctionDeclaration {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                })
                .collect(),
        }]
    };

    GeminiRequest {
        contents,
        system_instruction,
        tools,
        generation_config: GenerationConfig { temperature },
    }
}

fn from_gemini_response(response: GeminiResponse) -> anyhow::Result<AgentMessage> {
    let Some(candidate) = response.candidates.into_iter().next() else {
        let feedback = response.prompt_feedback.unwrap_or(Value::Null);
        return Err(anyhow!("gemini returned no candidates (prompt feedback: {feedback})"));
    };

    let parts = candidate.content.map(|content| content.parts).unwrap_or_default();
    let mut text = String::new();
    let mut calls = Vec::new();
    for part in parts {
        if let Some(chunk) = part.text {
            text.push_str(&chunk);
        }
        if let Some(call) = part.function_call {
            let id = call
                .id
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
            let args = if call.args.is_null() { json!({}) } else { call.args };
            calls.push(ToolInvocation::new(id, call.name, args));
        }
    }

    if !calls.is_empty() {
        return Ok(AgentMessage::agent_tool_calls(text, calls));
    }
    if !text.is_empty() {
        return Ok(AgentMessage::agent(text));
    }

    // Neither text nor calls, typically a malformed function call.
    let mut message = AgentMessage::agent("");
    message.content = MessageContent::Json(json!({
        "finishReason": candidate.finish_reason,
    }));
    Ok(message)
}

#[async_trait]
impl LanguageModel for GeminiChatModel {
    async fn generate(&self, request: LlmRequest) -> anyhow::Result<LlmResponse> {
        let body = to_gemini_request(&request, self.config.temperature);
        tracing::debug!(
            model = %self.config.model,
            contents = body.contents.len(),
            tools = request.tools.len(),
            "calling gemini"
        );

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    anyhow!(
                        "gemini request timed out after {}ms",
                        self.config.request_timeout.as_millis()
                    )
                } else {
                    anyhow::Error::new(err).context("gemini request failed")
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("gemini returned {status}: {text}"));
        }

        let data: GeminiResponse = response.json().await.context("malformed gemini response")?;
        Ok(LlmResponse {
            message: from_gemini_response(data)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::collections::BTreeMap;
    use triage_core::ToolSchema;

    fn issue_tool() -> ToolSchema {
        let mut properties = BTreeMap::new();
        properties.insert(
            "issueNumber".to_string(),
            ToolParameterSchema::integer("Issue number"),
        );
        ToolSchema::new(
            "get_issue_by_number",
            "Fetch an issue",
            ToolParameterSchema::object("Args", properties, vec!["issueNumber".into()]),
        )
    }

    #[test]
    fn system_messages_become_system_instruction() {
        let request = LlmRequest::new(vec![
            AgentMessage::system("You triage issues"),
            AgentMessage::user("Triage #1"),
        ])
        .with_tools(vec![issue_tool()]);

        let body = serde_json::to_value(to_gemini_request(&request, 0.2)).unwrap();

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "You triage issues");
        assert_eq!(body["contents"].as_array().unwrap().len(), 1);
        assert_eq!(body["contents"][0]["role"], "user");
        let declaration = &body["tools"][0]["functionDeclarations"][0];
        assert_eq!(declaration["name"], "get_issue_by_number");
        assert_eq!(declaration["parameters"]["required"][0], "issueNumber");
        assert!((body["generationConfig"]["temperature"].as_f64().unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn tool_round_trip_maps_to_function_parts() {
        let first = ToolInvocation::new("a", "get_issue_by_number", json!({"issueNumber": 1}));
        let second = ToolInvocation::new("b", "add_labels", json!({"labels": ["bug"]}));
        let request = LlmRequest::new(vec![
            AgentMessage::user("Triage #1"),
            AgentMessage::agent_tool_calls("", vec![first.clone(), second.clone()]),
            AgentMessage::tool_result(&first, "{\"title\":\"Crash\"}"),
            AgentMessage::tool_result(&second, "Labels applied successfully: bug"),
        ]);

        let body = serde_json::to_value(to_gemini_request(&request, 0.2)).unwrap();
        let contents = body["contents"].as_array().unwrap();

        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "get_issue_by_number");
        assert!(contents[1]["parts"][0]["functionCall"].get("id").is_none());
        assert_eq!(contents[2]["role"], "user");
        assert_eq!(contents[2]["parts"].as_array().unwrap().len(), 2);
        assert_eq!(
            contents[2]["parts"][1]["functionResponse"]["response"]["content"],
            "Labels applied successfully: bug"
        );
    }

    #[test]
    fn function_calls_get_ids() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        { "functionCall": { "name": "get_issue_by_number", "args": { "issueNumber": 3 } } },
                        { "functionCall": { "id": "given", "name": "post_comment", "args": { "body": "hi" } } }
                    ]
                },
                "finishReason": "STOP"
            }]
        }))
        .unwrap();

        let message = from_gemini_response(response).unwrap();

        assert_eq!(message.tool_calls.len(), 2);
        assert!(message.tool_calls[0].id.starts_with("call_"));
        assert_eq!(message.tool_calls[0].args["issueNumber"], 3);
        assert_eq!(message.tool_calls[1].id, "given");
    }

    #[test]
    fn empty_candidate_is_not_text() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{ "finishReason": "MALFORMED_FUNCTION_CALL" }]
        }))
        .unwrap();

        let message = from_gemini_response(response).unwrap();

        assert!(message.content.as_text().is_none());
        assert_eq!(
            message.content.as_json().unwrap()["finishReason"],
            "MALFORMED_FUNCTION_CALL"
        );
    }

    #[test]
    fn missing_candidates_is_an_error() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "promptFeedback": { "blockReason": "SAFETY" }
        }))
        .unwrap();
        assert!(from_gemini_response(response).is_err());
    }

    #[tokio::test]
    async fn generate_posts_to_model_endpoint() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/models/gemini-2.5-flash:generateContent")
                .header("x-goog-api-key", "test-key");
            then.status(200).json_body(json!({
                "candidates": [{
                    "content": { "role": "model", "parts": [{ "text": "Triaged." }] },
                    "finishReason": "STOP"
                }]
            }));
        });

        let model = GeminiChatModel::new(
            GeminiConfig::new("test-key").with_api_url(Some(server.base_url())),
        )
        .unwrap();
        let response = model
            .generate(LlmRequest::new(vec![AgentMessage::user("hello")]))
            .await
            .unwrap();

        mock.assert_calls(1);
        assert_eq!(response.message.content.as_text(), Some("Triaged."));
    }

    #[tokio::test]
    async fn http_errors_surface() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/models/gemini-2.5-flash:generateContent");
            then.status(429).body("quota");
        });

        let model = GeminiChatModel::new(
            GeminiConfig::new("test-key").with_api_url(Some(server.base_url())),
        )
        .unwrap();
        let err = model
            .generate(LlmRequest::new(vec![AgentMessage::user("hello")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn stalled_model_call_times_out() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/models/gemini-2.5-flash:generateContent");
            then.status(200)
                .delay(Duration::from_secs(5))
                .json_body(json!({ "candidates": [] }));
        });

        let model = GeminiChatModel::new(
            GeminiConfig::new("test-key")
                .with_api_url(Some(server.base_url()))
                .with_request_timeout(Duration::from_millis(200)),
        )
        .unwrap();
        let started = std::time::Instant::now();
        let err = model
            .generate(LlmRequest::new(vec![AgentMessage::user("hello")]))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn default_timeout_is_bounded() {
        let config = GeminiConfig::new("k");
        assert_eq!(config.request_timeout, DEFAULT_MODEL_TIMEOUT);
    }
}
