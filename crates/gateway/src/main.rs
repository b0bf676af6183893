use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use freemonitor_gateway::{build_app, Gateway, GatewayConfig, IdentityVerifier, MemoryDirectory};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "freemonitor-gateway", about = "Real-time telemetry and alert gateway")]
struct Cli {
    /// Listen host, overrides FREEMONITOR_HOST.
    #[arg(long)]
    host: Option<String>,
    /// Listen port, overrides FREEMONITOR_PORT.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::from_env().with_listen_override(cli.host.as_deref(), cli.port);
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set FREEMONITOR_JWT_SECRET in production");
    }
    let verifier = Arc::new(
        IdentityVerifier::new(&config.jwt_secret).context("invalid gateway JWT secret")?,
    );

    let directory = match &config.directory_file {
        Some(path) => MemoryDirectory::from_file(path)?,
        None => {
            warn!("no directory file configured; every device lookup will deny");
            MemoryDirectory::default()
        }
    };
    let directory = Arc::new(directory);
    let gateway = Gateway::new(config.gateway_settings(), directory.clone(), directory);
    let background = gateway.spawn_background();

    let app = build_app(gateway, verifier, &config.cors_origins);
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind gateway listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting freemonitor gateway");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited unexpectedly")?;

    background.wait().await;
    info!("gateway stopped");
    Ok(())
}

fn init_tracing(config: &GatewayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(?error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(?error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
