//! Issue tracker integration for the triage agent.
//!
//! This crate provides:
//! - Webhook signature verification
//! - App credential exchange with a cached installation token
//! - A REST client for issues, comments, and labels
//! - The tracker tools offered to the model

pub mod client;
pub mod credentials;
pub mod error;
pub mod signature;
pub mod tools;

pub use client::{build_http_client, IssueTracker, IssueTrackerClient, GITHUB_API_URL};
pub use credentials::{
    AppCredentials, Clock, CredentialCache, GithubAppTokenExchange, InstallationToken,
    SystemClock, TokenExchange, TokenSource,
};
pub use error::{AuthError, TrackerError, TrackerResult};
pub use signature::{verify, SIGNATURE_HEADER};
pub use tools::{
    add_labels_tool, get_issue_tool, post_comment_tool, tracker_tool_registry, tracker_tools,
    ADD_LABELS_TOOL, GET_ISSUE_TOOL, POST_COMMENT_TOOL,
};
