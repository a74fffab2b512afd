//! Webhook intake: authenticate the delivery, decide whether it starts a run,
//! acknowledge, and leave the run to the worker.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use triage_core::IssueRef;
use triage_github::{signature, TokenSource, SIGNATURE_HEADER};

use crate::worker::{TriageJob, TriageLauncher};

pub const WEBHOOK_PATH: &str = "/github/webhook";
pub const HEALTH_PATH: &str = "/health";

const TRIGGER_ACTION: &str = "opened";

#[derive(Clone)]
pub struct AppState {
    webhook_secret: Arc<SecretString>,
    tokens: Arc<dyn TokenSource>,
    launcher: Arc<dyn TriageLauncher>,
}

impl AppState {
    pub fn new(
        webhook_secret: SecretString,
        tokens: Arc<dyn TokenSource>,
        launcher: Arc<dyn TriageLauncher>,
    ) -> Self {
        Self {
            webhook_secret: Arc::new(webhook_secret),
            tokens,
            launcher,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub action: Option<String>,
    pub issue: Option<IssuePayload>,
    pub repository: Option<RepositoryPayload>,
    pub installation: Option<InstallationPayload>,
}

#[derive(Debug, Deserialize)]
pub struct IssuePayload {
    pub number: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RepositoryPayload {
    pub name: String,
    pub owner: OwnerPayload,
}

#[derive(Debug, Deserialize)]
pub struct OwnerPayload {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct InstallationPayload {
    pub id: u64,
}

impl WebhookPayload {
    /// The run this delivery asks for, when it names an issue in a repository.
    pub fn triage_job(&self) -> Option<TriageJob> {
        let issue = self.issue.as_ref()?;
        let repository = self.repository.as_ref()?;
        Some(TriageJob {
            target: IssueRef::new(&repository.owner.login, &repository.name, issue.number),
            title: issue.title.clone(),
            installation_id: self.installation.as_ref().map(|installation| installation.id),
        })
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WebhookResponse {
    pub fn ignored(action: &str) -> Self {
        Self {
            status: "ignored",
            reason: Some(format!("Action was {action}, not '{TRIGGER_ACTION}'")),
        }
    }

    pub fn processing() -> Self {
        Self {
            status: "processing",
            reason: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        status: "error",
        message: message.into(),
    };
    (status, Json(body)).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(handle_webhook))
        .route(HEALTH_PATH, get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let presented = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    if let Err(err) = signature::verify(
        presented,
        Some(&body),
        state.webhook_secret.expose_secret().as_bytes(),
    ) {
        warn!(error = %err, "rejected webhook delivery");
        return error_response(StatusCode::BAD_REQUEST, err.to_string());
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "malformed webhook payload");
            return error_response(StatusCode::BAD_REQUEST, format!("Malformed payload: {err}"));
        }
    };

    let action = payload.action.as_deref().unwrap_or("undefined");
    if action != TRIGGER_ACTION {
        info!(action, "Ignoring action");
        return Json(WebhookResponse::ignored(action)).into_response();
    }

    let Some(job) = payload.triage_job() else {
        warn!("opened event without issue or repository");
        return error_response(
            StatusCode::BAD_REQUEST,
            "Malformed payload: missing issue or repository",
        );
    };

    // Credential failures surface here instead of inside the run.
    if let Err(err) = state.tokens.token().await {
        error!(issue = %job.target, error = %err, "credential pre-flight failed");
        return error_response(StatusCode::BAD_GATEWAY, err.to_string());
    }

    info!(issue = %job.target, "Webhook processed, starting triage");
    state.launcher.launch(job);
    Json(WebhookResponse::processing()).into_response()
}
