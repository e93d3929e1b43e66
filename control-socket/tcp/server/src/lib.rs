use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use igs_rs::api::control::{ClientMsg, Request, Response, ServerMsg};
use igs_rs::control_socket::ControlPlane;
use igs_rs::error::{ControlError, ErrorKind};

#[derive(Debug, Clone)]
enum ControlSocketTaskCommand {
    Shutdown,
}

type Transport = Framed<TcpStream, LengthDelimitedCodec>;

/// What a connection does after a request has been answered.
enum AfterResponse {
    Continue,
    BridgeSerialConsole(tokio::fs::File),
}

pub struct TcpControlSocket<C: ControlPlane> {
    local_addr: SocketAddr,
    task_handle: JoinHandle<()>,
    task_cmd_chan: mpsc::Sender<ControlSocketTaskCommand>,
    _control_plane: Arc<C>,
}

impl<C: ControlPlane> TcpControlSocket<C> {
    async fn handle_request(
        request_id: u64,
        req: Request,
        control_plane: &C,
    ) -> (Result<Response, ControlError>, AfterResponse) {
        debug!("Handling request {}: {:?}", request_id, req);

        let vm_name = |vm_name: String| Response::VmName { vm_name };
        let disks = |disks| Response::Disks { disks };

        let resp = match req {
            Request::ListVms { filter } => control_plane
                .list_vms(filter)
                .await
                .map(|vm_names| Response::VmNames { vm_names }),
            Request::CreateVm => control_plane.create_vm().await.map(vm_name),
            Request::DeleteVm { vm_name: name } => control_plane.delete_vm(&name).await.map(vm_name),
            Request::StartVm { vm_name: name } => control_plane.start_vm(&name).await.map(vm_name),
            Request::ShutdownVm { vm_name: name } => {
                control_plane.shutdown_vm(&name).await.map(vm_name)
            }
            Request::ResumeVm { vm_name: name } => control_plane.resume_vm(&name).await.map(vm_name),
            Request::StopVm { vm_name: name } => control_plane.stop_vm(&name).await.map(vm_name),
            Request::GetVmStatus { vm_name } => control_plane
                .vm_status(&vm_name)
                .await
                .map(|status| Response::VmStatus { status }),

            Request::OpenSerialConsole { vm_name } => {
                let pty = match control_plane.serial_console_path(&vm_name).await {
                    Ok(pty) => pty,
                    Err(e) => return (Err(e), AfterResponse::Continue),
                };

                return match tokio::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&pty)
                    .await
                {
                    Ok(file) => (
                        Ok(Response::SerialConsoleReady { vm_name }),
                        AfterResponse::BridgeSerialConsole(file),
                    ),
                    Err(e) => (
                        Err(ControlError::new(
                            ErrorKind::StateInconsistent,
                            format!("cannot open serial console {:?} of VM {}: {}", pty, vm_name, e),
                        )),
                        AfterResponse::Continue,
                    ),
                };
            }

            Request::GetVmIp { vm_name } => control_plane
                .vm_ip(&vm_name)
                .await
                .map(|ip_address| Response::VmIp { ip_address }),
            Request::GetGuestIp { vm_name } => control_plane
                .guest_ip(&vm_name)
                .await
                .map(|ip_address| Response::VmIp { ip_address }),

            Request::ListDisks => control_plane.list_disks().await.map(disks),
            Request::ListFreeDisks => control_plane.list_free_disks().await.map(disks),
            Request::ListPoolDisks => control_plane.list_pool_disks().await.map(disks),
            Request::AddDisk {
                disk_index,
                partition_size_gb,
            } => control_plane
                .add_disk(disk_index, partition_size_gb)
                .await
                .map(|partitions| Response::Partitions { partitions }),
            Request::RemoveDisk { disk_index } => control_plane
                .remove_disk(disk_index)
                .await
                .map(|()| Response::Done),
            Request::ListVmDisks { vm_name } => control_plane
                .list_vm_disks(&vm_name)
                .await
                .map(|partitions| Response::Partitions { partitions }),
            Request::AttachDiskToVm { vm_name } => control_plane
                .attach_disk_to_vm(&vm_name)
                .await
                .map(|partition| Response::Partition { partition }),
            Request::DetachDiskFromVm {
                vm_name,
                partition_name,
            } => control_plane
                .detach_disk_from_vm(&vm_name, &partition_name)
                .await
                .map(|()| Response::Done),

            other => Err(ControlError::new(
                ErrorKind::Internal,
                format!("unsupported request: {:?}", other),
            )),
        };

        (resp, AfterResponse::Continue)
    }

    async fn send_msg(transport: &mut Transport, msg: &ServerMsg) -> std::io::Result<()> {
        use bytes::BufMut;
        use futures::SinkExt;

        let mut bytes = bytes::BytesMut::new().writer();
        serde_json::to_writer(&mut bytes, msg)?;
        transport.send(bytes.into_inner().freeze()).await
    }

    /// Copy bytes between the client and the serial console until either
    /// side closes or the server shuts down.
    async fn bridge_serial_console(
        transport: Transport,
        mut pty: tokio::fs::File,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let parts = transport.into_parts();
        let mut socket = parts.io;

        // Bytes the client sent right behind the request frame belong to the
        // console already:
        if !parts.read_buf.is_empty() {
            if let Err(e) = pty.write_all(&parts.read_buf).await {
                warn!("Failed to forward buffered input to serial console: {:?}", e);
                return;
            }
        }

        tokio::select! {
            res = tokio::io::copy_bidirectional(&mut socket, &mut pty) => match res {
                Ok((to_console, from_console)) => info!(
                    "Serial console session closed ({} bytes in, {} bytes out)",
                    to_console, from_console
                ),
                Err(e) => info!("Serial console session ended: {:?}", e),
            },
            _ = shutdown_rx.wait_for(|shutdown| *shutdown) => {
                info!("Closing serial console session for shutdown");
            }
        }
    }

    async fn handle_connection(
        socket: TcpStream,
        client_addr: SocketAddr,
        control_plane: Arc<C>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        use tokio_stream::StreamExt;

        let mut transport = Framed::new(socket, LengthDelimitedCodec::new());

        loop {
            #[rustfmt::skip]
            let bytes = tokio::select! {
                recv_res = transport.next() => match recv_res {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        warn!("Error receiving from control socket client {}: {:?}", client_addr, e);
                        break;
                    }
                    None => break,
                },

                _ = shutdown_rx.wait_for(|shutdown| *shutdown) => break,
            };

            // Attempt to decode the frame. If this fails, send an Error
            // message containing the decoder error. Otherwise, pass the
            // request onto the handle function:
            let (msg, after) = match serde_json::from_slice::<ClientMsg>(&bytes) {
                Ok(ClientMsg {
                    request_id,
                    request,
                }) => {
                    let (response, after) =
                        Self::handle_request(request_id, request, &control_plane).await;
                    (
                        ServerMsg::Response {
                            request_id,
                            response,
                        },
                        after,
                    )
                }
                Err(e) => (
                    ServerMsg::Error {
                        message: format!("{:?}", e),
                    },
                    AfterResponse::Continue,
                ),
            };

            if let Err(e) = Self::send_msg(&mut transport, &msg).await {
                match e.kind() {
                    std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                        warn!("Client {} closed connection.", client_addr);
                        break;
                    }
                    _ => {
                        warn!(
                            "Unknown error while sending answer to control socket request, ignoring: {:?}",
                            e
                        );
                    }
                }
            }

            if let AfterResponse::BridgeSerialConsole(pty) = after {
                Self::bridge_serial_console(transport, pty, shutdown_rx).await;
                return;
            }
        }

        debug!("Control socket client {} disconnected", client_addr);
    }

    pub async fn new(bind_addr: SocketAddr, control_plane: Arc<C>) -> Result<Self> {
        let server_socket: TcpListener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Binding to TCP socket at {:?}", bind_addr))?;
        let local_addr = server_socket
            .local_addr()
            .context("Querying control socket address")?;

        info!("Opened control socket TCP listener on {:?}", local_addr);

        let (task_cmd_chan_tx, mut task_cmd_chan_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task_control_plane = control_plane.clone();

        let task_handle = tokio::spawn(async move {
            let control_plane = task_control_plane;
            let mut connections = tokio::task::JoinSet::new();

            loop {
                // Accept new connections. Each connection is served by its
                // own task, such that long-running requests and serial
                // console sessions do not block other clients:
                #[rustfmt::skip]
                let accept_res = tokio::select! {
                    accept_res = server_socket.accept() => accept_res,

                    // A dropped command channel means the handle is gone:
                    cmd_res = task_cmd_chan_rx.recv() => match cmd_res {
                        Some(ControlSocketTaskCommand::Shutdown) | None => break,
                    },

                    // Reap finished connection tasks:
                    _ = connections.join_next(), if !connections.is_empty() => continue,
                };

                match accept_res {
                    Ok((socket, client_addr)) => {
                        debug!("Accepted control socket connection from {}", client_addr);
                        connections.spawn(Self::handle_connection(
                            socket,
                            client_addr,
                            control_plane.clone(),
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!("Accepting new control socket connection failed: {:?}", e);
                    }
                }
            }

            let _ = shutdown_tx.send(true);
            while connections.join_next().await.is_some() {}
        });

        Ok(TcpControlSocket {
            local_addr,
            task_handle,
            task_cmd_chan: task_cmd_chan_tx,
            _control_plane: control_plane,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) -> Result<()> {
        info!("Requesting shutdown.");
        // First, request shutdown of the task:
        self.task_cmd_chan
            .send(ControlSocketTaskCommand::Shutdown)
            .await
            .context("Requesting shutdown of the control socket request handler")?;

        // Then, try to join it:
        self.task_handle
            .await
            .context("Joining the control socket task")?;

        // The remainding cleanup happens when self is dropped.
        Ok(())
    }
}
