//! Clients of the hypervisor's human monitor and of the in-guest agent.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::{event, instrument, Level};

use igs_rs::config::MonitorReadStrategy;

use crate::error::MonitorError;

const PROMPT: &str = "(qemu) ";
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 4096;

/// A connection to the line-oriented monitor of one hypervisor process.
#[derive(Debug)]
pub struct MonitorConnection {
    stream: UnixStream,
    path: PathBuf,
    delay: Duration,
    strategy: MonitorReadStrategy,
}

impl MonitorConnection {
    /// Connect to the monitor socket at `path`, retrying until `timeout`
    /// elapses. A zero timeout makes a single attempt.
    #[instrument(skip(delay, strategy), err(Debug, level = Level::DEBUG))]
    pub async fn connect(
        path: &Path,
        timeout: Duration,
        delay: Duration,
        strategy: MonitorReadStrategy,
    ) -> Result<Self, MonitorError> {
        let deadline = Instant::now() + timeout;

        let stream = loop {
            match UnixStream::connect(path).await {
                Ok(stream) => break stream,
                Err(source) if Instant::now() >= deadline => {
                    return Err(if timeout.is_zero() {
                        MonitorError::Connect {
                            path: path.to_path_buf(),
                            source,
                        }
                    } else {
                        event!(Level::DEBUG, ?source, "Last monitor connection attempt failed");
                        MonitorError::ConnectTimeout {
                            path: path.to_path_buf(),
                            timeout,
                        }
                    });
                }
                Err(_) => tokio::time::sleep(CONNECT_RETRY_INTERVAL).await,
            }
        };

        let mut conn = MonitorConnection {
            stream,
            path: path.to_path_buf(),
            delay,
            strategy,
        };

        // Consume the greeting banner, such that it does not prefix the
        // response to the first command:
        let banner = conn.read_response().await?;
        event!(Level::DEBUG, banner = %banner.trim(), "Connected to monitor");

        Ok(conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_response(&mut self) -> Result<String, MonitorError> {
        let mut response = Vec::new();
        let mut buf = [0u8; READ_CHUNK];

        match self.strategy {
            MonitorReadStrategy::FixedDelay => {
                tokio::time::sleep(self.delay).await;
                // A single read. When the monitor has nothing to say within
                // the delay, the response is empty.
                match tokio::time::timeout(self.delay, self.stream.read(&mut buf)).await {
                    Ok(Ok(0)) => return Err(MonitorError::Closed),
                    Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => (),
                }
            }
            MonitorReadStrategy::Prompt => loop {
                let n = tokio::time::timeout(self.delay, self.stream.read(&mut buf))
                    .await
                    .map_err(|_| {
                        MonitorError::UnexpectedResponse(
                            String::from_utf8_lossy(&response).into_owned(),
                        )
                    })??;
                if n == 0 {
                    return Err(MonitorError::Closed);
                }
                response.extend_from_slice(&buf[..n]);
                if response.ends_with(PROMPT.as_bytes()) {
                    break;
                }
            },
        }

        Ok(String::from_utf8_lossy(&response).into_owned())
    }

    /// Send a single monitor command and return its raw response.
    #[instrument(skip(self), fields(path = ?self.path), err(Debug, level = Level::DEBUG))]
    pub async fn command(&mut self, command: &str) -> Result<String, MonitorError> {
        if self.strategy == MonitorReadStrategy::FixedDelay {
            tokio::time::sleep(self.delay).await;
        }

        self.stream
            .write_all(format!("{command}\r\n").as_bytes())
            .await?;
        self.stream.flush().await?;

        self.read_response().await
    }

    /// Query the run state, e.g. `running` or `paused`.
    pub async fn status(&mut self) -> Result<String, MonitorError> {
        let response = self.command("info status").await?;
        parse_status(&response).ok_or(MonitorError::UnexpectedResponse(response))
    }

    /// Query the host path of the guest's serial console PTY.
    pub async fn serial_pty(&mut self) -> Result<Option<PathBuf>, MonitorError> {
        let response = self.command("info chardev").await?;
        Ok(parse_chardev_pty(&response))
    }

    /// Wait for the hypervisor to close the monitor, which it does when
    /// exiting. Returns whether it closed within `timeout`.
    pub async fn wait_closed(&mut self, timeout: Duration) -> bool {
        let mut buf = [0u8; READ_CHUNK];
        let closed = async {
            loop {
                match self.stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => (),
                }
            }
        };
        tokio::time::timeout(timeout, closed).await.is_ok()
    }
}

/// Extract the run state from an `info status` response.
pub fn parse_status(response: &str) -> Option<String> {
    let (_, rest) = response.split_once("VM status: ")?;
    let status: String = rest
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    (!status.is_empty()).then_some(status)
}

fn take_path(s: &str) -> Option<PathBuf> {
    let path: String = s
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '.'))
        .collect();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

/// Extract the serial console PTY from an `info chardev` response, which
/// lists lines such as `serial0: filename=pty:/dev/pts/3`.
pub fn parse_chardev_pty(response: &str) -> Option<PathBuf> {
    response
        .lines()
        .filter(|line| line.contains("serial"))
        .find_map(|line| take_path(line.split_once("filename=pty:")?.1))
}

/// Extract the PTY from the hypervisor's startup announcement,
/// `char device redirected to /dev/pts/3 (label serial0)`.
pub fn parse_serial_announcement(line: &str) -> Option<PathBuf> {
    take_path(line.split_once("char device redirected to ")?.1)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestInterface {
    pub name: String,
    pub hardware_address: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<GuestIpAddress>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestIpAddress {
    pub ip_address_type: String,
    pub ip_address: String,
    pub prefix: u8,
}

#[derive(Deserialize)]
struct AgentReturn<T> {
    #[serde(rename = "return")]
    ret: T,
}

/// Ask the guest agent behind `socket` for the guest's network interfaces.
#[instrument(err(Debug, level = Level::DEBUG))]
pub async fn query_guest_interfaces(
    socket: &Path,
    timeout: Duration,
) -> Result<Vec<GuestInterface>, MonitorError> {
    let exchange = async {
        let stream = UnixStream::connect(socket)
            .await
            .map_err(|source| MonitorError::Connect {
                path: socket.to_path_buf(),
                source,
            })?;
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        // The agent may hold stale responses of an earlier client. Sync on a
        // fresh token first and skip everything before its echo:
        let token: u32 = rand::random::<u32>() >> 1;
        writer
            .write_all(
                format!("{{\"execute\":\"guest-sync\",\"arguments\":{{\"id\":{token}}}}}\n")
                    .as_bytes(),
            )
            .await?;
        loop {
            let line = lines.next_line().await?.ok_or(MonitorError::Closed)?;
            if let Ok(AgentReturn { ret }) = serde_json::from_str::<AgentReturn<u32>>(&line) {
                if ret == token {
                    break;
                }
            }
        }

        writer
            .write_all(b"{\"execute\":\"guest-network-get-interfaces\"}\n")
            .await?;
        let line = lines.next_line().await?.ok_or(MonitorError::Closed)?;
        let AgentReturn { ret } = serde_json::from_str::<AgentReturn<Vec<GuestInterface>>>(&line)
            .map_err(MonitorError::AgentResponse)?;

        Ok::<_, MonitorError>(ret)
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| MonitorError::AgentTimeout(timeout))?
}

/// The first non-loopback IPv4 address accepted by `in_subnet`.
pub fn select_guest_ipv4(
    interfaces: &[GuestInterface],
    in_subnet: impl Fn(Ipv4Addr) -> bool,
) -> Option<Ipv4Addr> {
    interfaces
        .iter()
        .flat_map(|intf| intf.ip_addresses.iter())
        .filter(|addr| addr.ip_address_type == "ipv4")
        .filter_map(|addr| addr.ip_address.parse::<Ipv4Addr>().ok())
        .find(|addr| !addr.is_loopback() && in_subnet(*addr))
}
