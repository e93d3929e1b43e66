use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{event, instrument, Level};

use crate::error::VmError;

use super::monitor::parse_serial_announcement;

/// Observable life cycle of a hypervisor process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited { code: Option<i32> },
}

/// Handle to a spawned hypervisor process.
///
/// The child is owned by a watcher task, which reaps it and publishes its
/// exit. Dropping the handle leaves the process running.
#[derive(Debug)]
pub struct HypervisorProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    state_rx: watch::Receiver<ProcessState>,
}

impl HypervisorProcess {
    /// Spawn the hypervisor and wait for it to announce the serial console
    /// PTY on its output. On failure the process is killed again.
    #[instrument(skip(args), err(Debug, level = Level::WARN))]
    pub async fn spawn(
        binary: &Path,
        args: &[OsString],
        handshake_timeout: Duration,
    ) -> Result<(HypervisorProcess, PathBuf), VmError> {
        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(VmError::io(format!("spawning hypervisor {binary:?}")))?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    if let Err(e) = child.start_kill() {
                        event!(Level::WARN, ?pid, ?e, "Failed to kill hypervisor process");
                    }
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    event!(Level::WARN, ?pid, ?e, "Failed to reap hypervisor process");
                    None
                }
            };
            event!(Level::INFO, ?pid, ?code, "Hypervisor process exited");
            let _ = state_tx.send(ProcessState::Exited { code });
        });

        let mut process = HypervisorProcess {
            pid,
            kill_tx: Some(kill_tx),
            state_rx,
        };

        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            process.kill().await;
            return Err(VmError::HandshakeFailed(
                "hypervisor output not captured".to_string(),
            ));
        };

        match await_serial_handshake(stdout, stderr, handshake_timeout).await {
            Ok(pty) => {
                event!(Level::INFO, ?pid, ?pty, "Hypervisor announced serial console");
                Ok((process, pty))
            }
            Err(e) => {
                process.kill().await;
                Err(e)
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state_rx.clone()
    }

    /// Wait up to `timeout` for the process to exit on its own.
    pub async fn wait_exit(&mut self, timeout: Duration) -> bool {
        let exited = self
            .state_rx
            .wait_for(|state| *state != ProcessState::Running);
        matches!(tokio::time::timeout(timeout, exited).await, Ok(Ok(_)))
    }

    /// Send SIGTERM and give the process `timeout` to exit, killing it
    /// afterwards if it is still around.
    pub async fn terminate(&mut self, timeout: Duration) -> ProcessState {
        if !self.is_running() {
            return self.state();
        }

        if let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) {
            event!(Level::INFO, pid, "Sending SIGTERM to hypervisor process");
            if let Err(e) = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGTERM,
            ) {
                event!(Level::WARN, pid, ?e, "Failed to send SIGTERM");
            }
        }

        if self.wait_exit(timeout).await {
            self.state()
        } else {
            event!(Level::WARN, pid = ?self.pid, ?timeout, "Hypervisor ignored SIGTERM, killing it");
            self.kill().await
        }
    }

    /// Kill the process and wait until it has been reaped.
    pub async fn kill(&mut self) -> ProcessState {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        // The watcher publishes the exit before dropping its sender:
        let _ = self
            .state_rx
            .wait_for(|state| *state != ProcessState::Running)
            .await;
        self.state()
    }
}

/// Drain a line stream to the log until it ends.
fn drain<R>(mut lines: Lines<BufReader<R>>, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            event!(Level::DEBUG, stream, %line, "Hypervisor output");
        }
    });
}

/// Read the hypervisor's stdout and stderr until it announces where it
/// redirected the guest's serial console.
///
/// Fails when `timeout` elapses or both streams end first. Once the
/// announcement is seen, the remaining output keeps being drained in the
/// background, such that the hypervisor never blocks on a full pipe.
pub async fn await_serial_handshake<O, E>(
    stdout: O,
    stderr: E,
    timeout: Duration,
) -> Result<PathBuf, VmError>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_done = false;
    let mut err_done = false;
    let mut transcript = Vec::new();

    let handshake = async {
        loop {
            let (line, from_stdout) = tokio::select! {
                line = out_lines.next_line(), if !out_done => (line, true),
                line = err_lines.next_line(), if !err_done => (line, false),
                else => return None,
            };

            match line {
                Ok(Some(line)) => {
                    if let Some(pty) = parse_serial_announcement(&line) {
                        return Some(pty);
                    }
                    transcript.push(line);
                }
                // The stream ended or failed, stop polling it:
                _ if from_stdout => out_done = true,
                _ => err_done = true,
            }
        }
    };

    let result = tokio::time::timeout(timeout, handshake).await;

    match result {
        Ok(Some(pty)) => {
            drain(out_lines, "stdout");
            drain(err_lines, "stderr");
            Ok(pty)
        }
        Ok(None) => Err(VmError::HandshakeFailed(transcript.join("\n"))),
        Err(_) => Err(VmError::HandshakeTimeout(timeout)),
    }
}
