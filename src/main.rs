use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vdev_webrtc::config::AppConfig;
use vdev_webrtc::observer::LoggingObserverFactory;
use vdev_webrtc::state::AppState;
use vdev_webrtc::web;
use vdev_webrtc::webrtc::{RtcPeerConnectionBuilder, WebRtcSessionManager};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// vdev-webrtc command line arguments
#[derive(Parser, Debug)]
#[command(name = "vdev-webrtc")]
#[command(version, about = "WebRTC signaling and session server for virtual devices", long_about = None)]
struct CliArgs {
    /// Configuration file (JSON)
    #[arg(short = 'c', long, value_name = "FILE", default_value = "vdev-webrtc.json")]
    config: PathBuf,

    /// Listen address (overrides config file)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config file)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_json);

    tracing::info!("Starting vdev-webrtc v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load(&args.config).await?;
    if let Some(address) = args.address {
        config.web.bind_address = address;
    }
    if let Some(port) = args.http_port {
        config.web.http_port = port;
    }
    config.validate()?;

    let bind_ip: IpAddr = config
        .web
        .bind_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", config.web.bind_address, e))?;
    let addr = SocketAddr::new(bind_ip, config.web.http_port);

    let sessions = WebRtcSessionManager::new(
        config.webrtc.clone(),
        Arc::new(RtcPeerConnectionBuilder::new()),
        Arc::new(LoggingObserverFactory),
    );
    let state = AppState::new(config, sessions);
    let app = web::create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    };

    tokio::select! {
        _ = shutdown_signal => {}
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
    }

    state.sessions.close_all().await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "vdev_webrtc=error,tower_http=error,webrtc=error",
        LogLevel::Warn => "vdev_webrtc=warn,tower_http=warn,webrtc=warn",
        LogLevel::Info => "vdev_webrtc=info,tower_http=info,webrtc=warn",
        LogLevel::Verbose => "vdev_webrtc=debug,tower_http=info,webrtc=warn",
        LogLevel::Debug => "vdev_webrtc=debug,tower_http=debug,webrtc=info",
        LogLevel::Trace => "vdev_webrtc=trace,tower_http=debug,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
