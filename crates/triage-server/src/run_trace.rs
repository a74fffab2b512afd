//! Optional export of finished runs to a Langfuse ingestion endpoint.

use anyhow::{anyhow, Context};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::time::Duration;
use triage_runtime::{OrchestratorError, TriageOutcome};
use uuid::Uuid;

use crate::worker::TriageJob;

pub const DEFAULT_LANGFUSE_HOST: &str = "https://cloud.langfuse.com";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);
const TRACE_NAME: &str = "issue-triage";

pub struct LangfuseConfig {
    pub public_key: String,
    pub secret_key: SecretString,
    pub host: String,
}

impl std::fmt::Debug for LangfuseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LangfuseConfig")
            .field("public_key", &self.public_key)
            .field("secret_key", &"[REDACTED]")
            .field("host", &self.host)
            .finish()
    }
}

/// Posts one `trace-create` event per finished run.
pub struct RunTraceExporter {
    http: reqwest::Client,
    config: LangfuseConfig,
}

impl RunTraceExporter {
    pub fn new(config: LangfuseConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(EXPORT_TIMEOUT)
            .build()
            .context("failed to build trace export client")?;
        Ok(Self { http, config })
    }

    pub async fn export(
        &self,
        job: &TriageJob,
        result: &Result<TriageOutcome, OrchestratorError>,
    ) -> anyhow::Result<()> {
        let url = format!(
            "{}/api/public/ingestion",
            self.config.host.trim_end_matches('/')
        );
        let batch = json!({ "batch": [trace_event(job, result)] });

        let response = self
            .http
            .post(&url)
            .basic_auth(
                &self.config.public_key,
                Some(self.config.secret_key.expose_secret()),
            )
            .json(&batch)
            .send()
            .await
            .context("trace export request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("trace export returned {status}: {body}"));
        }
        Ok(())
    }
}

fn trace_event(job: &TriageJob, result: &Result<TriageOutcome, OrchestratorError>) -> Value {
    let now = Utc::now().to_rfc3339();
    let (output, metadata) = match result {
        Ok(outcome) => (
            json!(outcome.response),
            json!({
                "status": "completed",
                "steps": outcome.steps,
                "messages": outcome.history.len(),
                "history": outcome.history,
            }),
        ),
        Err(err) => (
            json!(err.to_string()),
            json!({
                "status": "failed",
                "errorKind": err.kind(),
                "history": err.history().unwrap_or_default(),
            }),
        ),
    };

    json!({
        "id": Uuid::new_v4().to_string(),
        "timestamp": now,
        "type": "trace-create",
        "body": {
            "id": Uuid::new_v4().to_string(),
            "timestamp": now,
            "name": TRACE_NAME,
            "input": {
                "issue": job.target.to_string(),
                "title": job.title,
                "installationId": job.installation_id,
            },
            "output": output,
            "metadata": metadata,
            "tags": ["triage"],
        }
    })
}
