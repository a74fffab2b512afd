//! Tracker operations exposed to the model as tools.
//!
//! Every handler answers with text. Tracker failures are rendered into that
//! text so the model can decide how to continue.

use serde::{Deserialize, Deserializer};
use serde_json::{json, Number, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use triage_core::{IssueRef, RegistryError, ToolBox, ToolBuilder, ToolParameterSchema, ToolRegistry};

use crate::client::IssueTracker;

pub const GET_ISSUE_TOOL: &str = "get_issue_by_number";
pub const POST_COMMENT_TOOL: &str = "post_comment";
pub const ADD_LABELS_TOOL: &str = "add_labels";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueArgs {
    owner: String,
    repo: String,
    #[serde(deserialize_with = "whole_number")]
    issue_number: u64,
}

// Models sometimes send integral arguments as `7.0`.
fn whole_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let number = Number::deserialize(deserializer)?;
    number
        .as_u64()
        .or_else(|| {
            number
                .as_f64()
                .filter(|value| value.fract() == 0.0 && *value >= 0.0 && *value < u64::MAX as f64)
                .map(|value| value as u64)
        })
        .ok_or_else(|| serde::de::Error::custom(format!("expected a whole number, got {number}")))
}

impl IssueArgs {
    fn target(&self) -> IssueRef {
        IssueRef::new(&self.owner, &self.repo, self.issue_number)
    }
}

#[derive(Debug, Deserialize)]
struct CommentArgs {
    #[serde(flatten)]
    issue: IssueArgs,
    body: String,
}

#[derive(Debug, Deserialize)]
struct LabelArgs {
    #[serde(flatten)]
    issue: IssueArgs,
    labels: Vec<String>,
}

fn issue_properties() -> BTreeMap<String, ToolParameterSchema> {
    let mut properties = BTreeMap::new();
    properties.insert(
        "owner".to_string(),
        ToolParameterSchema::string("Account that owns the repository")
            .with_keyword("minLength", json!(1)),
    );
    properties.insert(
        "repo".to_string(),
        ToolParameterSchema::string("Repository name").with_keyword("minLength", json!(1)),
    );
    properties.insert(
        "issueNumber".to_string(),
        ToolParameterSchema::integer("Issue number within the repository")
            .with_keyword("minimum", json!(1)),
    );
    properties
}

fn required(extra: &[&str]) -> Vec<String> {
    ["owner", "repo", "issueNumber"]
        .iter()
        .chain(extra)
        .map(|name| name.to_string())
        .collect()
}

fn parse<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|err| format!("invalid arguments: {err}"))
}

pub fn get_issue_tool(tracker: Arc<dyn IssueTracker>) -> ToolBox {
    ToolBuilder::new(
        GET_ISSUE_TOOL,
        "Fetch a single issue (title, body, author, state) by its number.",
    )
    .with_parameters(ToolParameterSchema::object(
        "Issue coordinates",
        issue_properties(),
        required(&[]),
    ))
    .build_async(move |args| {
        let tracker = tracker.clone();
        async move {
            let args: IssueArgs = match parse(args) {
                Ok(args) => args,
                Err(reason) => return format!("Error fetching issue: {reason}"),
            };
            match tracker.fetch_issue(&args.target()).await {
                Ok(issue) => serde_json::to_string(&issue)
                    .unwrap_or_else(|err| format!("Error fetching issue: {err}")),
                Err(err) => format!("Error fetching issue: {err}"),
            }
        }
    })
}

pub fn post_comment_tool(tracker: Arc<dyn IssueTracker>) -> ToolBox {
    let mut properties = issue_properties();
    properties.insert(
        "body".to_string(),
        ToolParameterSchema::string("Markdown text of the comment").with_keyword("minLength", json!(1)),
    );

    ToolBuilder::new(POST_COMMENT_TOOL, "Post a comment on an issue.")
        .with_parameters(ToolParameterSchema::object(
            "Issue coordinates and comment body",
            properties,
            required(&["body"]),
        ))
        .build_async(move |args| {
            let tracker = tracker.clone();
            async move {
                let args: CommentArgs = match parse(args) {
                    Ok(args) => args,
                    Err(reason) => return format!("Error posting comment: {reason}"),
                };
                match tracker.post_comment(&args.issue.target(), &args.body).await {
                    Ok(url) => format!("Comment posted successfully: {url}"),
                    Err(err) => format!("Error posting comment: {err}"),
                }
            }
        })
}

pub fn add_labels_tool(tracker: Arc<dyn IssueTracker>) -> ToolBox {
    let mut properties = issue_properties();
    properties.insert(
        "labels".to_string(),
        ToolParameterSchema::array(
            "Label names to apply",
            ToolParameterSchema::string("Label name").with_keyword("minLength", json!(1)),
        )
        .with_keyword("minItems", json!(1)),
    );

    ToolBuilder::new(
        ADD_LABELS_TOOL,
        "Apply labels to an issue. Labels that do not exist yet are created.",
    )
    .with_parameters(ToolParameterSchema::object(
        "Issue coordinates and labels",
        properties,
        required(&["labels"]),
    ))
    .build_async(move |args| {
        let tracker = tracker.clone();
        async move {
            let args: LabelArgs = match parse(args) {
                Ok(args) => args,
                Err(reason) => return format!("Error adding labels: {reason}"),
            };
            let mut labels: Vec<String> = Vec::with_capacity(args.labels.len());
            for label in args.labels {
                if !labels.contains(&label) {
                    labels.push(label);
                }
            }
            match tracker.add_labels(&args.issue.target(), &labels).await {
                Ok(applied) => format!("Labels applied successfully: {}", applied.join(", ")),
                Err(err) => format!("Error adding labels: {err}"),
            }
        }
    })
}

/// The three tracker tools, in the order they are offered to the model.
pub fn tracker_tools(tracker: Arc<dyn IssueTracker>) -> Vec<ToolBox> {
    vec![
        get_issue_tool(tracker.clone()),
        post_comment_tool(tracker.clone()),
        add_labels_tool(tracker),
    ]
}

pub fn tracker_tool_registry(tracker: Arc<dyn IssueTracker>) -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    registry.register_all(tracker_tools(tracker))?;
    Ok(registry)
}
