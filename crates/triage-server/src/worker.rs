//! Runs triage conversations in the background, one tokio task per issue.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use triage_core::{AgentMessage, IssueRef};
use triage_runtime::{OrchestratorError, TriageOrchestrator, TriageOutcome};

use crate::run_trace::RunTraceExporter;

/// Everything a run needs to know about the issue that triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriageJob {
    pub target: IssueRef,
    pub title: Option<String>,
    pub installation_id: Option<u64>,
}

/// Hands accepted jobs to whatever executes them. Must not block.
pub trait TriageLauncher: Send + Sync {
    fn launch(&self, job: TriageJob);
}

#[derive(Clone)]
pub struct TriageWorker {
    orchestrator: Arc<TriageOrchestrator>,
    exporter: Option<Arc<RunTraceExporter>>,
}

impl TriageWorker {
    pub fn new(orchestrator: Arc<TriageOrchestrator>) -> Self {
        Self {
            orchestrator,
            exporter: None,
        }
    }

    /// Also send every finished run to a trace backend.
    pub fn with_trace_exporter(mut self, exporter: Arc<RunTraceExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    /// Start a run and return its handle. The run logs its own outcome.
    pub fn spawn(&self, job: TriageJob) -> JoinHandle<Result<TriageOutcome, OrchestratorError>> {
        let orchestrator = self.orchestrator.clone();
        let exporter = self.exporter.clone();
        let span = info_span!(
            "triage_run",
            owner = %job.target.owner,
            repo = %job.target.repo,
            issue_number = job.target.issue_number,
            installation_id = ?job.installation_id,
        );

        tokio::spawn(
            async move {
                info!("triage run started");
                let result = orchestrator.triage(&job.target, job.title.as_deref()).await;
                report(&job.target, &result);
                if let Some(exporter) = exporter {
                    if let Err(err) = exporter.export(&job, &result).await {
                        warn!(error = %err, "run trace export failed");
                    }
                }
                result
            }
            .instrument(span),
        )
    }
}

impl TriageLauncher for TriageWorker {
    fn launch(&self, job: TriageJob) {
        let target = job.target.clone();
        let run = self.spawn(job);
        tokio::spawn(async move {
            if let Err(err) = run.await {
                error!(issue = %target, error = %err, "triage run aborted");
            }
        });
    }
}

fn report(target: &IssueRef, result: &Result<TriageOutcome, OrchestratorError>) {
    match result {
        Ok(outcome) => info!(
            steps = outcome.steps,
            messages = outcome.history.len(),
            response = %outcome.response,
            "triage run completed"
        ),
        Err(err) => error!(
            owner = %target.owner,
            repo = %target.repo,
            issue_number = target.issue_number,
            kind = err.kind(),
            error = %err,
            history = %render_history(err.history()),
            "triage run failed"
        ),
    }
}

fn render_history(history: Option<&[AgentMessage]>) -> String {
    history
        .and_then(|messages| serde_json::to_string(messages).ok())
        .unwrap_or_else(|| "[]".to_string())
}
