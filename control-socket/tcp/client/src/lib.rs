use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use igs_rs::api::control::{ClientMsg, Request, Response, ServerMsg};
use igs_rs::error::ControlError;

type Transport = Framed<TcpStream, LengthDelimitedCodec>;

enum TcpControlSocketClientTaskCmd {
    SendMessage(Bytes),
    /// Stop the task and hand back the transport.
    Detach(oneshot::Sender<Transport>),
    Shutdown,
}

#[derive(Default)]
struct RequestResponses {
    next_request_id: u64,
    responses: HashMap<u64, Option<Result<Response, ControlError>>>,
    /// Set once the connection is gone. No further responses will arrive.
    closed: bool,
}

/// A connection switched over to the serial console of a VM.
pub struct SerialConsole {
    pub vm_name: String,

    /// Console output received together with the confirmation.
    pub pending: Bytes,

    pub stream: TcpStream,
}

pub struct TcpControlSocketClient {
    request_responses: Arc<Mutex<RequestResponses>>,
    task_cmd_tx: tokio::sync::mpsc::Sender<TcpControlSocketClientTaskCmd>,
    task_notify: Arc<Notify>,
    task_join_handle: tokio::task::JoinHandle<()>,
}

fn encode(request_id: u64, request: Request) -> Result<Bytes> {
    let mut bytes = BytesMut::new().writer();
    serde_json::to_writer(
        &mut bytes,
        &ClientMsg {
            request_id,
            request,
        },
    )
    .context("Encoding the control socket request as JSON")?;
    Ok(bytes.into_inner().freeze())
}

impl TcpControlSocketClient {
    pub async fn new(addr: std::net::SocketAddr) -> Result<TcpControlSocketClient> {
        let socket = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Opening TCP control socket connection at {:?}", addr))?;

        let request_responses = Arc::new(Mutex::new(RequestResponses::default()));

        let task_request_responses = request_responses.clone();
        let task_notify = Arc::new(Notify::new());
        let task_notify_task = task_notify.clone();
        let (task_cmd_tx, task_cmd_rx) = tokio::sync::mpsc::channel(1);

        let task_join_handle = tokio::spawn(async move {
            Self::task(socket, task_request_responses, task_cmd_rx, task_notify_task).await
        });

        Ok(TcpControlSocketClient {
            request_responses,
            task_cmd_tx,
            task_notify,
            task_join_handle,
        })
    }

    pub async fn shutdown(self) -> Result<()> {
        info!("Requesting control socket client to shut down...");

        self.task_cmd_tx
            .send(TcpControlSocketClientTaskCmd::Shutdown)
            .await
            .map_err(|_| anyhow!("Control socket client task has quit before shutdown"))?;
        self.task_join_handle
            .await
            .context("Joining the control socket client task")?;

        Ok(())
    }

    async fn task(
        socket: TcpStream,
        request_responses: Arc<Mutex<RequestResponses>>,
        mut cmd_rx: tokio::sync::mpsc::Receiver<TcpControlSocketClientTaskCmd>,
        notify: Arc<Notify>,
    ) {
        use futures::SinkExt;
        use tokio_stream::StreamExt;

        let mut transport = Framed::new(socket, LengthDelimitedCodec::new());

        loop {
            #[rustfmt::skip]
            tokio::select! {
                cmd_res = cmd_rx.recv() => {
                    match cmd_res {
                        None | Some(TcpControlSocketClientTaskCmd::Shutdown) => {
                            debug!("Shutting down control socket client");
                            break;
                        },

                        Some(TcpControlSocketClientTaskCmd::Detach(transport_tx)) => {
                            debug!("Detaching control socket transport");
                            let _ = transport_tx.send(transport);
                            // The transport is gone, responses can no longer
                            // arrive through this task:
                            request_responses.lock().await.closed = true;
                            notify.notify_waiters();
                            return;
                        },

                        Some(TcpControlSocketClientTaskCmd::SendMessage(bytes)) => {
                            if let Err(e) = transport.send(bytes).await {
                                error!("Error sending message to dataplane: {:?}", e);
                            }
                        },
                    }
                }

                recv_res = transport.next() => {
                    let bytes = match recv_res {
                        Some(Err(e)) => {
                            error!("Failed to receive dataplane message: {:?}", e);
                            break;
                        }
                        Some(Ok(b)) => b,
                        None => {
                            info!("Dataplane closed the control socket connection");
                            break;
                        }
                    };

                    match serde_json::from_slice(&bytes) {
                        Ok(ServerMsg::Response {
                            request_id,
                            response,
                        }) => {
                            let resp_map = &mut request_responses.lock().await.responses;
                            if let Some(entry) = resp_map.get_mut(&request_id) {
                                if entry.is_some() {
                                    error!("Received spurious response for request ID {}: {:?}",
                                           request_id, response);
                                }
                                *entry = Some(response);
                                notify.notify_waiters();
                            } else {
                                error!("Received response for unexpected request ID {}: {:?}",
                                       request_id, response);
                            }
                        },

                        Ok(ServerMsg::Error {
                            message,
                        }) => {
                            warn!("Received error message from dataplane: {:?}", message);
                        }

                        Err(e) => {
                            error!("Couldn't parse dataplane message: {:?}", e);
                        }
                    }
                }
            }
        }

        request_responses.lock().await.closed = true;
        notify.notify_waiters();
    }

    /// Issue a request and wait for its response. The outer error reports
    /// transport failures, the inner one errors returned by the dataplane.
    pub async fn request(&self, req: Request) -> Result<Result<Response, ControlError>> {
        let request_id = {
            // Acquire request ID:
            let mut request_responses_lg = self.request_responses.lock().await;
            if request_responses_lg.closed {
                bail!("Control socket connection is closed");
            }

            let request_id = request_responses_lg.next_request_id;
            request_responses_lg.next_request_id = request_id.wrapping_add(1);

            // Insert a placeholder, to indicate that we're actually waiting on
            // this request. This helps debug cases where the dataplane sends a
            // response to an invalid request ID or a request that is no longer
            // current:
            request_responses_lg.responses.insert(request_id, None);

            request_id
        };

        // Ask the async task to send the request:
        self.task_cmd_tx
            .send(TcpControlSocketClientTaskCmd::SendMessage(encode(
                request_id, req,
            )?))
            .await
            .map_err(|_| {
                anyhow!("Failed to send control socket message: client task is no longer alive!")
            })?;

        // Re-acquire the lock:
        let mut request_responses_lg = self.request_responses.lock().await;

        // Now, while we're hold the lock guard, request a notification, but
        // only await it after releasing the lock to avoid a deadlock:
        loop {
            match request_responses_lg.responses.get(&request_id) {
                Some(Some(_)) => break,
                Some(None) if !request_responses_lg.closed => (),
                _ => {
                    request_responses_lg.responses.remove(&request_id);
                    bail!("Control socket connection closed before request {} was answered", request_id);
                }
            }

            let fut = self.task_notify.notified();
            std::mem::drop(request_responses_lg);
            fut.await;
            request_responses_lg = self.request_responses.lock().await;
        }

        request_responses_lg
            .responses
            .remove(&request_id)
            .flatten()
            .ok_or_else(|| anyhow!("Response to request {} vanished", request_id))
    }

    /// Switch this connection over to the serial console of `vm_name`.
    /// Consumes the client, as no further requests can be made afterwards.
    pub async fn open_serial_console(
        self,
        vm_name: &str,
    ) -> Result<Result<SerialConsole, ControlError>> {
        use futures::SinkExt;
        use tokio_stream::StreamExt;

        let (transport_tx, transport_rx) = oneshot::channel();
        self.task_cmd_tx
            .send(TcpControlSocketClientTaskCmd::Detach(transport_tx))
            .await
            .map_err(|_| anyhow!("Control socket client task is no longer alive"))?;
        let mut transport = transport_rx
            .await
            .context("Control socket client task quit before handing over the connection")?;
        self.task_join_handle
            .await
            .context("Joining the control socket client task")?;

        let request_id = self.request_responses.lock().await.next_request_id;
        transport
            .send(encode(
                request_id,
                Request::OpenSerialConsole {
                    vm_name: vm_name.to_string(),
                },
            )?)
            .await
            .context("Sending serial console request")?;

        let frame = transport
            .next()
            .await
            .ok_or_else(|| anyhow!("Dataplane closed the connection"))?
            .context("Receiving serial console response")?;

        match serde_json::from_slice(&frame).context("Decoding serial console response")? {
            ServerMsg::Response {
                response: Ok(Response::SerialConsoleReady { vm_name }),
                ..
            } => {
                let parts = transport.into_parts();
                Ok(Ok(SerialConsole {
                    vm_name,
                    pending: parts.read_buf.freeze(),
                    stream: parts.io,
                }))
            }
            ServerMsg::Response {
                response: Err(e), ..
            } => Ok(Err(e)),
            ServerMsg::Response {
                response: Ok(other),
                ..
            } => bail!("Unexpected response to serial console request: {:?}", other),
            ServerMsg::Error { message } => bail!("Dataplane rejected request: {}", message),
        }
    }
}
