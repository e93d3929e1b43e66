use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

use igs_dataplane::exec::SystemRunner;
use igs_dataplane::service::Dataplane;
use igs_tcp_control_socket_server::TcpControlSocket;

#[derive(Parser, Debug, Clone)]
#[command(name = "igs-dataplane", version, about = "IGS single-host VM dataplane")]
struct DataplaneArgs {
    /// Path to the TOML configuration file [default: igs.toml, if present]
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Override the control socket listen address
    #[arg(long)]
    bind_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = DataplaneArgs::parse();

    let mut config = igs_rs::config::load_config(args.config.as_deref())
        .context("Loading dataplane configuration")?;
    if let Some(bind_addr) = args.bind_addr {
        config.server.bind_addr = bind_addr;
    }
    let bind_addr = config.server.bind_addr;

    event!(Level::INFO, ?bind_addr, vm_root = ?config.compute.vm_root, "Starting IGS dataplane");

    let dataplane = Arc::new(
        Dataplane::new(config, Arc::new(SystemRunner))
            .await
            .context("Initializing the dataplane")?,
    );

    let control_socket = TcpControlSocket::new(bind_addr, dataplane.clone())
        .await
        .with_context(|| format!("Opening control socket on {bind_addr}"))?;
    event!(Level::INFO, local_addr = ?control_socket.local_addr(), "Control socket listening");

    let mut sighup = signal(SignalKind::hangup()).context("Installing SIGHUP handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Installing SIGTERM handler")?;

    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("Waiting for Ctrl-C")?;
                break;
            }
            _ = sigterm.recv() => break,
            _ = sighup.recv() => {
                let changed = dataplane.vm_manager().reconcile().await;
                event!(Level::INFO, changed, "Reconciled VM table");
            }
        }
    }

    event!(Level::INFO, "Shutting down control socket");
    control_socket
        .shutdown()
        .await
        .context("Shutting down the control socket")?;

    // VMs keep running across dataplane restarts and are recovered on the
    // next start. Soft-shut-down hypervisors are worth a mention though:
    for (vm_name, pid) in dataplane.vm_manager().lingering_vms().await {
        event!(Level::WARN, %vm_name, ?pid, "Hypervisor of a shut down VM is still running");
    }

    Ok(())
}
