// SPDX-License-Identifier: MIT
//! Process bootstrap: CLI args, logging, component assembly, background
//! timers (key rotation, health probes), graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

use hushrouter::config::Config;
use hushrouter::RouterContext;

#[derive(Parser, Debug)]
#[command(name = "hushrouter", about = "HPKE reverse proxy for local LLM inference")]
struct Cli {
    /// Override the listen port (otherwise taken from configuration).
    #[arg(long)]
    port: Option<u16>,
}

fn setup_logging(log_level: &str, log_dir: Option<&std::path::Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(dir) = log_dir {
        let appender = tracing_appender::rolling::daily(dir, "hushrouter.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .json()
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    if let Some(port) = cli.port {
        config.port = port;
    }

    let _log_guard = setup_logging(&config.log_level, config.log_dir.as_deref());
    info!(environment = ?config.environment, port = config.port, "starting hushrouter");

    let ctx = match RouterContext::build(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "failed to assemble router");
            std::process::exit(1);
        }
    };

    let rotation_task = spawn_rotation_timer(Arc::clone(&ctx));
    let health_task = spawn_health_timer(Arc::clone(&ctx));

    let addr: SocketAddr = match format!("{}:{}", ctx.config.host, ctx.config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "invalid listen address");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, %addr, "failed to bind listener");
            std::process::exit(1);
        }
    };
    info!(%addr, "listening");

    let router = hushrouter::rest::build_router(Arc::clone(&ctx));
    let serve_result = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    rotation_task.abort();
    health_task.abort();

    if let Err(e) = serve_result {
        error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
    info!("shutdown complete");
}

fn spawn_rotation_timer(ctx: Arc<RouterContext>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            if ctx.envelope.should_rotate().await {
                match ctx.envelope.rotate_keys().await {
                    Ok(()) => info!("router key pair rotated"),
                    Err(e) => error!(error = %e, "key rotation failed"),
                }
            }
        }
    })
}

fn spawn_health_timer(ctx: Arc<RouterContext>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        let mut interval = tokio::time::interval(ctx.config.health_probe_interval);
        loop {
            interval.tick().await;
            ctx.health
                .probe_all(&client, ctx.config.health_probe_timeout)
                .await;
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining in-flight streams");
}
