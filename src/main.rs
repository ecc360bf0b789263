use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use unified_gateway::config::{config_search_paths, LoggingConfig};
use unified_gateway::{logging, Gateway, GatewayConfig};

#[derive(Parser)]
#[command(
    name = "unified-gateway",
    about = "LLM API gateway: one chat-completions API in front of many providers",
    version
)]
struct Cli {
    /// Path to config file (YAML, or TOML with a .toml extension)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return ExitCode::SUCCESS;
    }

    let loaded = GatewayConfig::locate(cli.config.as_deref())
        .and_then(|path| GatewayConfig::load(&path).map(|config| (path, config)));
    let (path, mut config) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            logging::init(&LoggingConfig::default());
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    if let Some(port) = cli.port {
        config.server.port = port;
    }

    logging::init(&config.logging);
    info!(path = %path.display(), "Loaded config");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Gateway stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let gateway = Arc::new(Gateway::from_config(&config)?);

    info!(version = env!("CARGO_PKG_VERSION"), "unified-gateway starting");
    for provider in gateway.routes().providers() {
        info!(
            provider = %provider.name,
            base_url = %provider.base_url,
            dialect = %provider.dialect,
            timeout_secs = provider.timeout.as_secs(),
            "Provider configured"
        );
    }
    info!(
        routes = gateway.routes().routes().len(),
        max_attempts = config.retry.max_attempts,
        "Routing table loaded"
    );

    let bind_addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, gateway.router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
