//! Schema-driven tool system
//!
//! Tools describe their input with a JSON Schema subset, are registered under a
//! unique name, and always answer with text. Arguments are validated against
//! the schema before a handler runs; validation failures become text too, so
//! the caller only ever sees "the tool produced this text".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::messaging::{AgentMessage, ToolInvocation};

/// JSON Schema definition for tool parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolParameterSchema {
    /// JSON Schema type (object, string, number, integer, boolean, array)
    #[serde(rename = "type")]
    pub schema_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Properties for object types
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<BTreeMap<String, ToolParameterSchema>>,

    /// Required property names for object types
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,

    /// Items schema for array types
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ToolParameterSchema>>,

    /// Additional schema keywords (minimum, minItems, pattern, ...)
    #[serde(flatten)]
    pub additional: BTreeMap<String, Value>,
}

impl ToolParameterSchema {
    fn typed(schema_type: &str, description: impl Into<String>) -> Self {
        Self {
            schema_type: schema_type.to_string(),
            description: Some(description.into()),
            properties: None,
            required: None,
            items: None,
            additional: BTreeMap::new(),
        }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::typed("string", description)
    }

    pub fn integer(description: impl Into<String>) -> Self {
        Self::typed("integer", description)
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self::typed("boolean", description)
    }

    /// Create an object parameter with properties
    pub fn object(
        description: impl Into<String>,
        properties: BTreeMap<String, ToolParameterSchema>,
        required: Vec<String>,
    ) -> Self {
        Self {
            properties: Some(properties),
            required: Some(required),
            ..Self::typed("object", description)
        }
    }

    pub fn array(description: impl Into<String>, items: ToolParameterSchema) -> Self {
        Self {
            items: Some(Box::new(items)),
            ..Self::typed("array", description)
        }
    }

    /// Attach an extra schema keyword such as `minimum` or `minItems`.
    pub fn with_keyword(mut self, keyword: impl Into<String>, value: Value) -> Self {
        self.additional.insert(keyword.into(), value);
        self
    }
}

/// Complete schema definition for a tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    /// Unique, stable name the model uses to call the tool
    pub name: String,

    /// Human-readable description of what the tool does
    pub description: String,

    /// Input parameter schema (an object with properties)
    pub parameters: ToolParameterSchema,
}

impl ToolSchema {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ToolParameterSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Core trait for tool implementations.
///
/// `execute` receives arguments that already passed schema validation and
/// returns text. Failures are reported as text as well.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    async fn execute(&self, args: Value) -> String;
}

pub type ToolBox = Arc<dyn Tool>;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Boxed async handler backing a [`FunctionTool`].
pub type AsyncToolFn = Arc<dyn Fn(Value) -> BoxFuture<'static, String> + Send + Sync>;

/// A tool implementation backed by a closure
pub struct FunctionTool {
    schema: ToolSchema,
    handler: AsyncToolFn,
}

#[async_trait]
impl Tool for FunctionTool {
    fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }

    async fn execute(&self, args: Value) -> String {
        (self.handler)(args).await
    }
}

/// Builder for creating tools from async closures
pub struct ToolBuilder {
    name: String,
    description: String,
    parameters: Option<ToolParameterSchema>,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: None,
        }
    }

    pub fn with_parameters(mut self, parameters: ToolParameterSchema) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn build_async<F, Fut>(self, handler: F) -> ToolBox
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = String> + Send + 'static,
    {
        let schema = ToolSchema::new(
            self.name,
            self.description,
            self.parameters.unwrap_or_else(|| {
                ToolParameterSchema::object("No parameters", BTreeMap::new(), Vec::new())
            }),
        );
        let handler: AsyncToolFn = Arc::new(move |args| Box::pin(handler(args)));
        Arc::new(FunctionTool { schema, handler })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),

    #[error("invalid input schema for tool '{name}': {reason}")]
    InvalidSchema { name: String, reason: String },

    #[error("tool '{0}' is not registered")]
    UnknownTool(String),
}

struct RegisteredTool {
    tool: ToolBox,
    schema: ToolSchema,
    validator: jsonschema::Validator,
}

impl RegisteredTool {
    /// First schema violation, rendered for the model.
    fn check_args(&self, args: &Value) -> Result<(), String> {
        match self.validator.iter_errors(args).next() {
            Some(error) => Err(format!(
                "Invalid arguments for tool '{}': {error}",
                self.schema.name
            )),
            None => Ok(()),
        }
    }
}

/// Name-indexed set of tools with compiled argument validators.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<RegisteredTool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names are unique and schemas must compile.
    pub fn register(&mut self, tool: ToolBox) -> Result<&mut Self, RegistryError> {
        let schema = tool.schema();
        if self.by_name.contains_key(&schema.name) {
            return Err(RegistryError::DuplicateTool(schema.name));
        }
        let raw = serde_json::to_value(&schema.parameters).map_err(|e| {
            RegistryError::InvalidSchema {
                name: schema.name.clone(),
                reason: e.to_string(),
            }
        })?;
        let validator =
            jsonschema::validator_for(&raw).map_err(|e| RegistryError::InvalidSchema {
                name: schema.name.clone(),
                reason: e.to_string(),
            })?;

        self.by_name.insert(schema.name.clone(), self.tools.len());
        self.tools.push(Arc::new(RegisteredTool {
            tool,
            schema,
            validator,
        }));
        Ok(self)
    }

    pub fn register_all<I>(&mut self, tools: I) -> Result<&mut Self, RegistryError>
    where
        I: IntoIterator<Item = ToolBox>,
    {
        for tool in tools {
            self.register(tool)?;
        }
        Ok(self)
    }

    pub fn has(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Schemas in registration order.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema.clone()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.schema.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate and execute one call, producing the tool-result message.
    ///
    /// Only an unregistered tool name is an error; everything a tool can get
    /// wrong is carried in the returned message text.
    pub async fn invoke(&self, invocation: &ToolInvocation) -> Result<AgentMessage, RegistryError> {
        let entry = self.entry(&invocation.tool_name)?;
        let text = match entry.check_args(&invocation.args) {
            Ok(()) => entry.tool.execute(invocation.args.clone()).await,
            Err(reason) => {
                tracing::warn!(tool = %invocation.tool_name, %reason, "rejected tool arguments");
                reason
            }
        };
        Ok(AgentMessage::tool_result(invocation, text))
    }

    fn entry(&self, name: &str) -> Result<&Arc<RegisteredTool>, RegistryError> {
        self.by_name
            .get(name)
            .and_then(|index| self.tools.get(*index))
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MessageRole;
    use serde_json::json;

    fn echo_tool() -> ToolBox {
        ToolBuilder::new("echo", "Echoes input")
            .with_parameters(ToolParameterSchema::object(
                "Echo parameters",
                [
                    ("message".to_string(), ToolParameterSchema::string("Message to echo")),
                    (
                        "times".to_string(),
                        ToolParameterSchema::integer("Repeat count").with_keyword("minimum", json!(1)),
                    ),
                ]
                .into_iter()
                .collect(),
                vec!["message".to_string()],
            ))
            .build_async(|args| async move {
                let msg = args["message"].as_str().unwrap_or_default().to_string();
                let times = args["times"].as_u64().unwrap_or(1) as usize;
                format!("Echo: {}", msg.repeat(times))
            })
    }

    #[tokio::test]
    async fn invoke_runs_handler_with_valid_arguments() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool()).unwrap();

        let call = ToolInvocation::new("call-1", "echo", json!({"message": "hi", "times": 2}));
        let message = registry.invoke(&call).await.unwrap();

        assert_eq!(message.role, MessageRole::Tool);
        assert_eq!(message.content.as_text(), Some("Echo: hihi"));
        assert_eq!(message.tool_call_id(), Some("call-1"));
        assert_eq!(message.tool_name(), Some("echo"));
    }

    #[tokio::test]
    async fn invalid_arguments_become_tool_text() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool()).unwrap();

        let missing = ToolInvocation::new("c1", "echo", json!({}));
        let text = registry.invoke(&missing).await.unwrap();
        assert!(text
            .content
            .as_text()
            .unwrap()
            .starts_with("Invalid arguments for tool 'echo'"));

        let wrong_type = ToolInvocation::new("c2", "echo", json!({"message": 7}));
        let text = registry.invoke(&wrong_type).await.unwrap();
        assert!(text.content.as_text().unwrap().contains("Invalid arguments"));

        let below_minimum = ToolInvocation::new("c3", "echo", json!({"message": "x", "times": 0}));
        let text = registry.invoke(&below_minimum).await.unwrap();
        assert!(text.content.as_text().unwrap().contains("Invalid arguments"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        let call = ToolInvocation::new("c1", "missing", json!({}));
        let err = registry.invoke(&call).await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownTool(name) if name == "missing"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool()).unwrap();
        let err = registry.register(echo_tool()).err().unwrap();
        assert!(matches!(err, RegistryError::DuplicateTool(name) if name == "echo"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn schemas_keep_registration_order() {
        let mut registry = ToolRegistry::new();
        let second = ToolBuilder::new("alpha", "Registered second")
            .build_async(|_| async { String::new() });
        registry.register_all([echo_tool(), second]).unwrap();
        assert_eq!(registry.names(), vec!["echo".to_string(), "alpha".to_string()]);

        let schema = serde_json::to_value(&registry.schemas()[0].parameters).unwrap();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["times"]["minimum"], 1);
        assert_eq!(schema["required"], json!(["message"]));
    }
}
