//! tabula - Workspace Sync Server
//!
//! This is the composition root that wires the room registry to the
//! HTTP/WebSocket surface. Usage: `tabula serve --port N` (falls back to
//! `PORT`, then the default).

use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::fmt::format::FmtSpan;

use tabula::config::{load_config, Config};
use tabula::server::{router, RoomConfig, RoomPolicy, RoomRegistry};

enum StartupError {
    /// Unrecoverable configuration problem; exit code 1.
    Config(anyhow::Error),
    /// I/O failure at startup; exit code 2.
    Io(anyhow::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(StartupError::Config(e)) => {
            eprintln!("configuration error: {e:#}");
            ExitCode::from(1)
        }
        Err(StartupError::Io(e)) => {
            eprintln!("startup error: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run() -> Result<(), StartupError> {
    let mut cfg = load_config().map_err(StartupError::Config)?;
    apply_args(&mut cfg, std::env::args().skip(1)).map_err(StartupError::Config)?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let policy = if cfg.open_rooms {
        tracing::info!("rooms are open (ad-hoc workspace ids accepted)");
        RoomPolicy::Open
    } else {
        tracing::info!("rooms restricted to {} registered workspaces", cfg.workspaces.len());
        RoomPolicy::Registered(cfg.workspaces.iter().cloned().collect())
    };

    let registry = Arc::new(RoomRegistry::new(
        policy,
        RoomConfig {
            ping_interval: cfg.ping_interval(),
            eviction_delay: cfg.eviction_delay(),
        },
        cfg.auth_token.clone(),
    ));

    let app = router(registry);
    let addr = cfg.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| StartupError::Io(anyhow::anyhow!("failed to bind {addr}: {e}")))?;

    tracing::info!("starting tabula sync server listen={addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| StartupError::Io(e.into()))?;

    tracing::info!("server stopped");
    Ok(())
}

/// `serve --port N`; the flag wins over `PORT`.
fn apply_args(cfg: &mut Config, args: impl Iterator<Item = String>) -> anyhow::Result<()> {
    let mut args = args.peekable();
    if args.peek().map(String::as_str) == Some("serve") {
        args.next();
    }
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--port requires a value"))?;
                cfg.port = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("--port must be a number, got `{value}`"))?;
            }
            other => anyhow::bail!("unknown argument `{other}`"),
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
