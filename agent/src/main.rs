//! Binary entry-point for the tunnel Agent.

mod config;
mod error;
mod proxy;
mod registry;
mod tunnel;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};
use tunnel_proto::NoopControlPlane;

use proxy::ProxyListener;
use tunnel::TunnelClient;

/// Exit codes per spec §6: 0 normal shutdown, 1 fatal config error,
/// 2 fatal I/O (e.g. the local proxy port is already bound).
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
    // ── 2. Init structured logging (env overrides flag) ─────────────────
    // e.g. RUST_LOG=debug cargo run
    let log_level = cli
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    info!("Configuration loaded from {:?}", cli.config);
    info!("Tunnel server : {}:{}", cfg.server_host, cfg.server_port);
    info!("Local proxy   : 127.0.0.1:{}", cfg.local_proxy_port);

    // ── 3. Start the tunnel client + reconnect supervisor ────────────────
    let local_proxy_port = cfg.local_proxy_port;
    let request_timeout = cfg.request_timeout;
    let connect_timeout = cfg.connect_timeout;
    let tunnel = TunnelClient::spawn(cfg, Arc::new(NoopControlPlane));

    // ── 4. Run the local proxy listener ──────────────────────────────────
    let addr: SocketAddr = ([127, 0, 0, 1], local_proxy_port).into();
    let listener = ProxyListener::new(addr, tunnel.clone(), request_timeout, connect_timeout);

    tokio::select! {
        res = listener.run() => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received (Ctrl-C)");
            tunnel.shutdown();
        }
    }

    Ok(())
}
