//! vusb-server: a TCP host that exposes virtual USB devices to attached clients.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use server::{BusAdapter, DeviceRegistry, LoopbackBusAdapter, ServerConfig, TcpServer, UrbEngine, MAX_DEVICES};
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "vusb-server")]
#[command(about = "Expose virtual USB devices to clients over TCP", long_about = None)]
struct Args {
    /// Load configuration from this path instead of the default search location.
    #[arg(long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Listen on this TCP port instead of the configured one.
    #[arg(long, value_name = "PORT")]
    port: Option<String>,

    /// Accept at most this many simultaneous client sessions.
    #[arg(long, value_name = "N")]
    max_clients: Option<String>,

    /// Override the configured log level (also overridable via `RUST_LOG`).
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Write the resolved configuration (defaults plus any overrides) to the default path
    /// and exit without starting the server.
    #[arg(long)]
    save_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if let Some(ref path) = args.config {
        ServerConfig::load(Some(path.clone())).context("failed to load configuration")?
    } else {
        ServerConfig::load_or_default()
    };

    if let Some(port) = &args.port {
        config.port = port
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid --port value '{port}': must be 0-65535"))?;
    }
    if let Some(max_clients) = &args.max_clients {
        config.max_clients = max_clients
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid --max-clients value '{max_clients}': must be a positive integer"))?;
    }
    if let Some(ref level) = args.log_level {
        config.log_level = level.clone();
    }
    config.validate().context("invalid configuration")?;

    if args.save_config {
        let path = ServerConfig::default_path();
        config.save(&path).context("failed to save configuration")?;
        println!("configuration saved to: {}", path.display());
        return Ok(());
    }

    setup_logging(&config.log_level).context("failed to initialize logging")?;
    info!(version = env!("CARGO_PKG_VERSION"), "vusb-server starting");
    info!(bind_addr = %config.bind_addr, port = config.port, max_clients = config.max_clients, "configuration loaded");

    let registry = Arc::new(DeviceRegistry::new(MAX_DEVICES));
    let adapter = build_bus_adapter()?;
    let (engine, adapter_thread) = UrbEngine::spawn(adapter, Arc::clone(&registry));

    let event_loop_handle = tokio::spawn(Arc::clone(&engine).run_event_loop());
    let timeout_sweep_handle = tokio::spawn(Arc::clone(&engine).run_timeout_sweep());

    let tcp_server = match TcpServer::bind(&config, Arc::clone(&registry), Arc::clone(&engine)).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to bind listener");
            std::process::exit(2);
        }
    };
    info!(local_addr = %tcp_server.local_addr().context("failed to read bound address")?, "ready to accept connections");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = tcp_server.run().await {
            error!(error = %e, "accept loop ended with error");
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("received ctrl+c, shutting down"),
        Err(e) => error!(error = %e, "error waiting for ctrl+c"),
    }

    server_handle.abort();
    event_loop_handle.abort();
    timeout_sweep_handle.abort();
    engine.shutdown().await;
    let _ = adapter_thread.join();

    info!("shutdown complete");
    Ok(())
}

fn build_bus_adapter() -> Result<Arc<dyn BusAdapter>> {
    #[cfg(feature = "vhci")]
    {
        let adapter = server::VhciBusAdapter::new().context("failed to initialize vhci bus adapter")?;
        Ok(Arc::new(adapter))
    }
    #[cfg(not(feature = "vhci"))]
    {
        Ok(Arc::new(LoopbackBusAdapter::new()))
    }
}
