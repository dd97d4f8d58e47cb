use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use droidcast::adb::bridge::BridgeDriver;
use droidcast::adb::client::AdbClient;
use droidcast::adb::tracker::DeviceTracker;
use droidcast::config::Config;
use droidcast::registry::SessionRegistry;
use droidcast::server::{self, App};

#[derive(Debug, Parser)]
#[command(name = "droidcast", about = "Live Android screen broadcasting service")]
struct Args {
    /// Address the HTTP/WebSocket server binds.
    #[arg(long, default_value = "0.0.0.0:8000")]
    listen: std::net::SocketAddr,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = Arc::new(Config::from_env());

    let client = match &settings.adb_path {
        Some(path) => AdbClient::with_path(path),
        None => AdbClient::new(),
    };
    match client.check_available().await {
        Ok(version) => info!(adb = %client.adb_path().display(), "{version}"),
        Err(e) => warn!(error = %e, "adb not responding yet; device tracking will keep retrying"),
    }

    let bridge = BridgeDriver::new(client);
    let tracker = DeviceTracker::new(bridge.clone());
    tracker.start();

    let registry = SessionRegistry::new(bridge, Arc::clone(&settings));

    let app: server::AppState = Arc::new(App {
        registry: Arc::clone(&registry),
        tracker,
        settings: Arc::clone(&settings),
    });

    let listener = match tokio::net::TcpListener::bind(args.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %args.listen, error = %e, "failed to bind listen address");
            std::process::exit(1);
        }
    };
    info!(addr = %args.listen, "droidcast listening");

    let serve = axum::serve(listener, server::router(app))
        .with_graceful_shutdown(shutdown_signal());
    if let Err(e) = serve.await {
        error!(error = %e, "server error");
    }

    // Terminate subprocesses and remove port-forwards within the
    // configured deadline.
    registry.stop_all().await;
    info!("shutdown complete");
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
