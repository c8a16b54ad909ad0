//! vusb-client: captures local USB hardware and exposes it to a vusb-server over TCP.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use client::{ClientConfig, ClientSession, DeviceTable, LoopbackTransferExecutor, TransferExecutor};
use common::setup_logging;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "vusb-client")]
#[command(about = "Attach local USB devices to a remote vusb-server", long_about = None)]
struct Args {
    /// Load configuration from this path instead of the default search location.
    #[arg(long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Server address to connect to.
    #[arg(long, value_name = "ADDR")]
    server: Option<String>,

    /// Server TCP port.
    #[arg(long, value_name = "PORT")]
    port: Option<String>,

    /// Name this client advertises during the handshake.
    #[arg(long, value_name = "NAME")]
    name: Option<String>,

    /// Override the configured log level (also overridable via `RUST_LOG`).
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Write the resolved configuration to the default path and exit without connecting.
    #[arg(long)]
    save_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if let Some(ref path) = args.config {
        ClientConfig::load(Some(path.clone())).context("failed to load configuration")?
    } else {
        ClientConfig::load_or_default()
    };

    if let Some(server) = &args.server {
        config.server_addr = server.clone();
    }
    if let Some(port) = &args.port {
        config.port = port
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid --port value '{port}': must be 0-65535"))?;
    }
    if let Some(name) = &args.name {
        config.name = name.clone();
    }
    if let Some(ref level) = args.log_level {
        config.log_level = level.clone();
    }
    config.validate().context("invalid configuration")?;

    if args.save_config {
        let path = ClientConfig::default_path();
        config.save(&path).context("failed to save configuration")?;
        println!("configuration saved to: {}", path.display());
        return Ok(());
    }

    setup_logging(&config.log_level).context("failed to initialize logging")?;
    info!(version = env!("CARGO_PKG_VERSION"), "vusb-client starting");

    let addr: std::net::SocketAddr = format!("{}:{}", config.server_addr, config.port)
        .parse()
        .context("invalid server address")?;

    let devices = Arc::new(DeviceTable::new());

    #[cfg(feature = "rusb-backend")]
    let rusb_executor = Arc::new(client::RusbTransferExecutor::new());
    #[cfg(feature = "rusb-backend")]
    let executor: Arc<dyn TransferExecutor> = Arc::clone(&rusb_executor) as Arc<dyn TransferExecutor>;
    #[cfg(not(feature = "rusb-backend"))]
    let executor: Arc<dyn TransferExecutor> = Arc::new(LoopbackTransferExecutor::new());

    let session = ClientSession::connect(addr, &config.name, Arc::clone(&executor), Arc::clone(&devices))
        .await
        .context("failed to connect to server")?;
    info!(%addr, session = session.session_id().0, "connected");

    #[cfg(feature = "rusb-backend")]
    attach_local_hardware(&session, &devices, &rusb_executor).await;
    #[cfg(not(feature = "rusb-backend"))]
    info!("rusb-backend feature disabled, no local hardware will be attached");

    match signal::ctrl_c().await {
        Ok(()) => info!("received ctrl+c, detaching devices and disconnecting"),
        Err(e) => error!(error = %e, "error waiting for ctrl+c"),
    }

    for device_id in devices.local_handles() {
        if let Err(e) = session.detach_device(device_id).await {
            warn!(device = device_id.0, error = %e, "failed to detach device during shutdown");
        }
        #[cfg(feature = "rusb-backend")]
        if let Some(local) = devices.remove(device_id) {
            rusb_executor.unregister(local.local_handle);
        }
    }
    session.close().await;

    info!("shutdown complete");
    Ok(())
}

#[cfg(feature = "rusb-backend")]
async fn attach_local_hardware(
    session: &ClientSession,
    devices: &DeviceTable,
    executor: &client::RusbTransferExecutor,
) {
    use client::{enumerate_local_devices, LocalDevice};

    let discovered = match tokio::task::spawn_blocking(enumerate_local_devices).await {
        Ok(Ok(devices)) => devices,
        Ok(Err(e)) => {
            warn!(error = %e, "failed to enumerate local USB devices");
            return;
        }
        Err(e) => {
            warn!(error = %e, "device enumeration task panicked");
            return;
        }
    };

    for device in discovered {
        match session.attach_device(device.info.clone(), device.descriptors).await {
            Ok(response) if response.status.is_success() => {
                info!(
                    device_id = response.device_id.0,
                    vendor_id = device.info.vendor_id,
                    product_id = device.info.product_id,
                    "attached local device"
                );
                executor.register(device.local_handle, device.handle);
                devices.insert(LocalDevice {
                    device_id: response.device_id,
                    local_handle: device.local_handle,
                    vendor_id: device.info.vendor_id,
                    product_id: device.info.product_id,
                });
            }
            Ok(response) => {
                warn!(status = ?response.status, vendor_id = device.info.vendor_id, "server rejected device attach");
            }
            Err(e) => {
                error!(error = %e, "device attach request failed");
            }
        }
    }
}
