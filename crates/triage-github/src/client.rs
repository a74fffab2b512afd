//! REST client for the issue tracker.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT as USER_AGENT_HEADER};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use triage_core::{Issue, IssueRef, IssueState};

use crate::credentials::TokenSource;
use crate::error::{TrackerError, TrackerResult};

pub const GITHUB_API_URL: &str = "https://api.github.com";
pub const ACCEPT_HEADER: &str = "application/vnd.github.v3+json";
pub const USER_AGENT: &str = concat!("issue-triage-agent/", env!("CARGO_PKG_VERSION"));
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_REDIRECTS: usize = 5;

/// HTTP client shared by every outbound tracker call.
pub fn build_http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .build()
}

/// Operations the triage tools perform against the tracker.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn fetch_issue(&self, target: &IssueRef) -> TrackerResult<Issue>;

    /// Returns the comment's URL, or an empty string when none was reported.
    async fn post_comment(&self, target: &IssueRef, body: &str) -> TrackerResult<String>;

    /// Returns the issue's full label set after the addition.
    async fn add_labels(&self, target: &IssueRef, labels: &[String]) -> TrackerResult<Vec<String>>;
}

#[derive(Debug, Deserialize)]
struct IssuePayload {
    id: u64,
    number: u64,
    title: String,
    body: Option<String>,
    user: Option<UserPayload>,
    state: IssueState,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    login: String,
}

#[derive(Debug, Deserialize)]
struct CommentPayload {
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LabelPayload {
    name: String,
}

impl From<IssuePayload> for Issue {
    fn from(raw: IssuePayload) -> Self {
        Issue {
            id: raw.id,
            number: raw.number,
            title: raw.title,
            body: raw.body,
            author: raw.user.map(|user| user.login).unwrap_or_default(),
            state: raw.state,
        }
    }
}

pub struct IssueTrackerClient {
    http: reqwest::Client,
    api_base: String,
    tokens: Arc<dyn TokenSource>,
}

impl IssueTrackerClient {
    pub fn new(api_base: impl Into<String>, tokens: Arc<dyn TokenSource>) -> TrackerResult<Self> {
        let http = build_http_client()
            .map_err(|err| TrackerError::upstream(format!("Could not build http client: {err}")))?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn issue_url(&self, target: &IssueRef) -> String {
        format!(
            "{}/repos/{}/{}/issues/{}",
            self.api_base, target.owner, target.repo, target.issue_number
        )
    }

    async fn send<T: DeserializeOwned>(
        &self,
        action: &str,
        target: &IssueRef,
        request: RequestBuilder,
    ) -> TrackerResult<T> {
        let token = self.tokens.token().await?;
        let response = request
            .bearer_auth(token)
            .header(ACCEPT, ACCEPT_HEADER)
            .header(USER_AGENT_HEADER, USER_AGENT)
            .send()
            .await
            .map_err(|err| TrackerError::upstream(format!("Could not {action} on {target}: {err}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(TrackerError::NotFound(format!(
                "Issue #{} not found in {}/{}",
                target.issue_number, target.owner, target.repo
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(%status, %body, "tracker request failed");
            return Err(TrackerError::upstream(format!(
                "Could not {action} on {target}: status {status}"
            )));
        }

        response.json::<T>().await.map_err(|err| {
            TrackerError::upstream(format!("Could not {action} on {target}: malformed response: {err}"))
        })
    }
}

#[async_trait]
impl IssueTracker for IssueTrackerClient {
    #[instrument(skip(self, target), fields(issue = %target))]
    async fn fetch_issue(&self, target: &IssueRef) -> TrackerResult<Issue> {
        let request = self.http.get(self.issue_url(target));
        let raw: IssuePayload = self.send("fetch issue", target, request).await?;
        Ok(raw.into())
    }

    #[instrument(skip(self, target, body), fields(issue = %target))]
    async fn post_comment(&self, target: &IssueRef, body: &str) -> TrackerResult<String> {
        let request = self
            .http
            .post(format!("{}/comments", self.issue_url(target)))
            .json(&json!({ "body": body }));
        let raw: CommentPayload = self.send("post comment", target, request).await?;
        Ok(raw.html_url.unwrap_or_default())
    }

    #[instrument(skip(self, target), fields(issue = %target))]
    async fn add_labels(&self, target: &IssueRef, labels: &[String]) -> TrackerResult<Vec<String>> {
        let request = self
            .http
            .post(format!("{}/labels", self.issue_url(target)))
            .json(&json!({ "labels": labels }));
        let raw: Vec<LabelPayload> = self.send("add labels", target, request).await?;
        Ok(raw.into_iter().map(|label| label.name).collect())
    }
}
