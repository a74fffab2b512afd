use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use triage_server::{build_app, init_tracing, TriageConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = TriageConfig::from_env()?;
    let listen_addr = config.listen_addr;
    let app = build_app(config)?;

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(address = %listen_addr, "Server is running");

    axum::serve(listener, app).await?;
    Ok(())
}
