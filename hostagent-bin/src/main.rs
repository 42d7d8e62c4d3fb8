use color_eyre::eyre::{self, WrapErr};
use hostagent_lib::api_server::{serve, ApiServerConfig, ApiState};
use hostagent_lib::{telemetry_sink, Agent, AgentConfig};
use hostagent_runtime::DockerRuntime;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hostagent_lib=debug")),
        )
        .init();

    info!("Starting host agent...");
    let config = AgentConfig::from_env()?;

    let runtime = DockerRuntime::connect_local()
        .wrap_err("Failed to connect to the Docker daemon")?
        .with_storage_quota(config.enforce_storage_quota);
    runtime
        .ping()
        .await
        .wrap_err("Docker daemon is not responding")?;
    info!("Connected to Docker");

    let sink = telemetry_sink(&config)?;
    match &config.telemetry_url {
        Some(url) => info!("Telemetry reports go to {}", url),
        None => info!("No telemetry collector configured, reports are only logged"),
    }

    let agent = Agent::new(config.clone(), Arc::new(runtime), sink);
    let report = agent.bootstrap().await?;
    info!(
        restored = report.restored,
        adopted = report.adopted,
        "Recovered {} instances",
        agent.context().registry.len()
    );

    let shutdown = CancellationToken::new();
    let background = agent.start_background(shutdown.clone());

    let state = ApiState {
        controller: agent.controller().clone(),
        keys: agent.keys().clone(),
    };
    let mut server = tokio::spawn(serve(
        ApiServerConfig::from(&config),
        state,
        shutdown.clone(),
    ));

    let served = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.wrap_err("Failed to listen for ctrl-c")?;
            info!("Shutdown requested");
            shutdown.cancel();
            server.await
        }
        finished = &mut server => finished,
    };
    shutdown.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            error!("Background task failed: {}", e);
        }
    }
    agent.context().persist().await;

    served
        .wrap_err("API server task panicked")?
        .wrap_err("API server failed")?;
    info!("Host agent stopped");
    Ok(())
}
