// relay: consumes producer events from the bus and broadcasts alerts to
// connected browsers.
//
// Exit codes: 0 clean shutdown, 1 initialization failure, 2 fatal
// runtime error.

use relay::config;
use relay::http;
use relay::service::RelayService;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

fn parse_config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "relay starting");

    let config = match parse_config_path()
        .map_or_else(config::load_config, |path| {
            config::load_config_from_path(&path)
        }) {
        Ok(cfg) => {
            info!(
                bus_host = %cfg.bus.host,
                bus_port = cfg.bus.port,
                edge = %cfg.edge_bind,
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            return ExitCode::from(1);
        }
    };

    // The watchlist source is wired by the surrounding deployment; without
    // one the filter fails open and pattern alerts broadcast.
    let service = match RelayService::start(config.clone(), None).await {
        Ok(service) => service,
        Err(e) => {
            eprintln!("FATAL: failed to start relay service: {}", e);
            return ExitCode::from(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(&config.edge_bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind edge {}: {}", config.edge_bind, e);
            service.shutdown().await;
            return ExitCode::from(1);
        }
    };

    let edge_result = http::serve(listener, service.clone(), async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await;

    service.shutdown().await;

    match edge_result {
        Ok(()) => {
            info!("relay stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "edge server failed");
            ExitCode::from(2)
        }
    }
}
