mod app_state;
mod config;

use anyhow::Context;
use app_state::AppState;
use clap::Parser;
use config::ServiceConfig;
use fleet_api::create_app;
use fleet_engine::shutdown::ShutdownSignal;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Command line arguments for the evfleet controller
#[derive(Parser, Debug)]
#[command(name = "evfleet")]
#[command(about = "EV charging fleet controller")]
struct Args {
    /// Path to the service configuration JSON file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log as JSON lines instead of human readable text
    #[arg(long)]
    log_json: bool,

    /// Print the default configuration and exit
    #[arg(long)]
    print_default_config: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Trigger `shutdown` on Ctrl-C or SIGTERM.
async fn wait_for_signal(shutdown: ShutdownSignal) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Could not listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Could not listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = shutdown.wait() => return,
    }
    shutdown.trigger();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_default_config {
        println!("{}", serde_json::to_string_pretty(&ServiceConfig::default())?);
        return Ok(());
    }

    init_tracing(args.log_json);

    let config = match &args.config {
        Some(path) => {
            let config = ServiceConfig::load(path).await?;
            tracing::info!("Loaded service config from {}", path.display());
            config
        }
        None => {
            tracing::info!("No config file given, running with defaults");
            ServiceConfig::default()
        }
    };

    let state = AppState::new(config)?;
    let engine = state.engine.clone();

    let station_server = engine
        .bind_station_server(state.config.station_listen_addr)
        .await
        .with_context(|| {
            format!(
                "Failed to bind station listener to {}",
                state.config.station_listen_addr
            )
        })?;
    let http_listener = tokio::net::TcpListener::bind(state.config.http_listen_addr)
        .await
        .with_context(|| {
            format!(
                "Failed to bind HTTP listener to {}",
                state.config.http_listen_addr
            )
        })?;

    let shutdown = ShutdownSignal::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));
    let scheduler = engine.spawn_scheduler(shutdown.clone());
    let stations = tokio::spawn(station_server.run(shutdown.clone()));

    // Event streams never end by themselves, so close them for the HTTP
    // server to drain.
    let http_shutdown = {
        let shutdown = shutdown.clone();
        let engine = engine.clone();
        async move {
            shutdown.wait().await;
            engine.close_listeners();
        }
    };

    tracing::info!("Serving HTTP on {}", state.config.http_listen_addr);
    let served = axum::serve(http_listener, create_app(engine.clone()))
        .with_graceful_shutdown(http_shutdown)
        .await
        .context("HTTP server failed");

    // Also stops the other tasks when the HTTP server failed on its own
    shutdown.trigger();
    if let Err(e) = scheduler.await {
        tracing::warn!("Scheduler task ended abnormally: {}", e);
    }
    if let Err(e) = stations.await {
        tracing::warn!("Station server task ended abnormally: {}", e);
    }
    engine.close_sessions();
    tracing::info!("Shut down");

    served
}
