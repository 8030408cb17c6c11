//! Binary entry-point for the tunnel Server.

mod config;
mod connect_relay;
mod http_executor;
mod registry;
mod session;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};
use tunnel_proto::{tls, ControlPlane, NoopControlPlane};

use session::SessionLimits;

/// Exit codes per spec §6: 0 normal shutdown, 1 fatal config error,
/// 2 fatal I/O (e.g. the listen port is already bound).
const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_IO_ERROR: i32 = 2;

#[tokio::main]
async fn main() {
    let (cli, cfg) = match config::load_config() {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("fatal configuration error: {e:?}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    if let Err(e) = run(cli, cfg).await {
        error!("fatal I/O error: {e:?}");
        std::process::exit(EXIT_IO_ERROR);
    }
}

async fn run(cli: config::Cli, cfg: config::Config) -> Result<()> {
    let log_level = cli
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    info!("Configuration loaded from {:?}", cli.config);
    info!("Listening on {}:{}", cfg.listen_addr, cfg.listen_port);

    let server_config = Arc::new(tls::build_server_config(&cfg.cert_file, &cfg.key_file, &cfg.ca_file)?);
    let http_client = http_executor::build_client()?;

    let limits = Arc::new(SessionLimits {
        request_timeout: cfg.request_timeout,
        connect_dial_timeout: cfg.connect_dial_timeout,
        max_response_body: cfg.max_response_body,
    });

    let active_sessions = Arc::new(AtomicUsize::new(0));
    let addr: SocketAddr = format!("{}:{}", cfg.listen_addr, cfg.listen_port).parse()?;

    let control_plane: Arc<dyn ControlPlane> = Arc::new(NoopControlPlane);
    if cfg.metrics_enabled {
        tokio::spawn(emit_activity_loop(
            Arc::clone(&control_plane),
            Arc::clone(&active_sessions),
            cfg.metrics_interval,
        ));
    }

    let accept_loop = session::run_accept_loop(
        addr,
        server_config,
        http_client,
        limits,
        cfg.max_sessions,
        active_sessions,
    );

    tokio::select! {
        res = accept_loop => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received (Ctrl-C)");
            control_plane.on_shutdown().await;
        }
    }

    Ok(())
}

/// Spec §4.8: the Server calls `emit_activity` periodically while
/// running, best-effort, never blocking tunnel operation.
async fn emit_activity_loop(
    control_plane: Arc<dyn ControlPlane>,
    active_sessions: Arc<AtomicUsize>,
    interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        control_plane
            .emit_activity(active_sessions.load(Ordering::SeqCst), now)
            .await;
    }
}
