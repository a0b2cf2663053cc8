// proxystore-relay: CLI entry point for the relay server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use relay::RelayState;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Run a relay server instance.
///
/// The relay server is used by endpoints to establish peer-to-peer WebRTC
/// connections.
#[derive(Debug, Parser)]
#[command(name = "proxystore-relay")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0", value_name = "ADDR")]
    host: String,
    /// Port to listen on.
    #[arg(long, default_value_t = 8765, value_name = "PORT")]
    port: u16,
    /// Certificate file (PEM format) for serving with TLS.
    #[arg(long, value_name = "PATH")]
    certfile: Option<PathBuf>,
    /// Private key file; defaults to the certfile if unset.
    #[arg(long, value_name = "PATH")]
    keyfile: Option<PathBuf>,
    /// Write server logs to this directory instead of stdout.
    #[arg(long, value_name = "PATH")]
    log_dir: Option<PathBuf>,
    /// Minimum logging level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", value_name = "LEVEL")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = match EnvFilter::try_new(&cli.log_level) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("FATAL: invalid log level '{}': {}", cli.log_level, e);
            std::process::exit(1);
        }
    };
    if let Some(dir) = &cli.log_dir {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("FATAL: failed to create log dir {}: {}", dir.display(), e);
            std::process::exit(1);
        }
        let file = match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("relay.log"))
        {
            Ok(file) => file,
            Err(e) => {
                eprintln!("FATAL: failed to open log file: {e}");
                std::process::exit(1);
            }
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let addr: SocketAddr = match format!("{}:{}", cli.host, cli.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("FATAL: invalid listen address: {e}");
            std::process::exit(1);
        }
    };

    let state = RelayState::new();
    let census = relay::spawn_client_logger(state.clone(), relay::DEFAULT_CLIENT_LOG_INTERVAL);
    let router = relay::build_router(state);
    let service = router.into_make_service_with_connect_info::<SocketAddr>();

    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone()));

    info!(addr = %addr, tls = cli.certfile.is_some(), "serving relay server");
    let result = match &cli.certfile {
        Some(certfile) => {
            let keyfile = cli.keyfile.as_ref().unwrap_or(certfile);
            let tls = match RustlsConfig::from_pem_file(certfile, keyfile).await {
                Ok(tls) => tls,
                Err(e) => {
                    eprintln!("FATAL: failed to load TLS certificate/key: {e}");
                    std::process::exit(1);
                }
            };
            axum_server::bind_rustls(addr, tls).handle(handle).serve(service).await
        }
        None => axum_server::bind(addr).handle(handle).serve(service).await,
    };
    census.abort();

    if let Err(e) = result {
        eprintln!("FATAL: server error: {e}");
        std::process::exit(1);
    }
    info!("server shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and triggers graceful shutdown.
async fn shutdown_signal(handle: Handle) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        () = terminate => { info!("received SIGTERM, shutting down"); },
    }
    handle.graceful_shutdown(Some(Duration::from_secs(5)));
}
