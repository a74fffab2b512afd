//! HTTP surface of the issue triage agent: configuration, webhook intake and
//! the background worker that runs triage conversations.

pub mod config;
pub mod run_trace;
pub mod telemetry;
pub mod webhook;
pub mod worker;

use anyhow::Context;
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::info;
use triage_github::{
    tracker_tool_registry, CredentialCache, GithubAppTokenExchange, IssueTrackerClient,
    TokenSource,
};
use triage_runtime::{GeminiChatModel, GeminiConfig, TriageOrchestrator};

pub use config::{ConfigError, TriageConfig};
pub use run_trace::{LangfuseConfig, RunTraceExporter};
pub use telemetry::init_tracing;
pub use webhook::{router, AppState, WebhookPayload, WebhookResponse, HEALTH_PATH, WEBHOOK_PATH};
pub use worker::{TriageJob, TriageLauncher, TriageWorker};

/// Wire the credential cache, tracker client, tools, model and worker into a router.
pub fn build_app(config: TriageConfig) -> anyhow::Result<axum::Router> {
    let exchange = GithubAppTokenExchange::new(config.github_api_url.clone(), config.app)
        .context("failed to initialise the installation token exchange")?;
    let tokens: Arc<dyn TokenSource> = Arc::new(CredentialCache::new(Arc::new(exchange)));

    let tracker = IssueTrackerClient::new(config.github_api_url, tokens.clone())
        .context("failed to build the issue tracker client")?;
    let registry = tracker_tool_registry(Arc::new(tracker))?;

    let model = GeminiChatModel::new(
        GeminiConfig::new(config.gemini_api_key.expose_secret())
            .with_model(config.llm_model)
            .with_temperature(config.llm_temperature)
            .with_api_url(config.gemini_api_url)
            .with_request_timeout(config.llm_timeout),
    )?;

    let orchestrator = TriageOrchestrator::new(Arc::new(model), Arc::new(registry))
        .with_limits(config.limits);
    let mut worker = TriageWorker::new(Arc::new(orchestrator));
    if let Some(langfuse) = config.langfuse {
        info!(host = %langfuse.host, "exporting run traces");
        worker = worker.with_trace_exporter(Arc::new(RunTraceExporter::new(langfuse)?));
    }

    let state = AppState::new(config.webhook_secret, tokens, Arc::new(worker));
    Ok(router(state))
}
