//! Invocation of external host tools.
//!
//! Every tool the dataplane drives (`qemu-img`, `ovs-vsctl`, `parted`, ...)
//! is run through a [`CommandRunner`], such that tests can substitute a
//! scripted implementation. The hypervisor process itself is long-lived and
//! spawned directly by the compute module instead.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tracing::{event, Level};

use igs_rs::error::ErrorKind;

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Cmd {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn is(&self, program: &str) -> bool {
        self.program == OsStr::new(program)
    }

    /// Whether the argument list (not including the program) starts with
    /// the given words.
    pub fn starts_with(&self, words: &[&str]) -> bool {
        self.args.len() >= words.len()
            && self
                .args
                .iter()
                .zip(words.iter())
                .all(|(arg, word)| arg == OsStr::new(word))
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    /// Run the command to completion, capturing stdout and stderr. A
    /// non-zero exit status is not an error at this layer.
    async fn output(&self, cmd: &Cmd) -> std::io::Result<Output>;
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, cmd: &Cmd) -> std::io::Result<Output> {
        tokio::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .output()
            .await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to run `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed with exit code {code:?}: {stderr}")]
    ExitStatus {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ExternalToolFailed
    }
}

/// Run a command and fail unless it exits successfully.
pub async fn run_checked(runner: &dyn CommandRunner, cmd: &Cmd) -> Result<Output, ExecError> {
    event!(Level::DEBUG, command = %cmd, "Running external command");

    let output = runner.output(cmd).await.map_err(|source| {
        event!(Level::WARN, command = %cmd, ?source, "Failed to spawn external command");
        ExecError::Spawn {
            command: cmd.to_string(),
            source,
        }
    })?;

    // Ideally we'd want to use the nightly `exit_ok()` here:
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        event!(
            Level::WARN,
            command = %cmd,
            code = ?output.status.code(),
            %stderr,
            "External command failed",
        );
        return Err(ExecError::ExitStatus {
            command: cmd.to_string(),
            code: output.status.code(),
            stderr,
        });
    }

    Ok(output)
}

#[cfg(test)]
pub(crate) mod fake {
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{Cmd, CommandRunner};

    type Handler = Box<dyn Fn(&Cmd) -> Output + Send + Sync>;

    /// Records every command and answers with a scripted handler.
    pub struct ScriptedRunner {
        handler: Handler,
        pub log: Mutex<Vec<Cmd>>,
    }

    impl ScriptedRunner {
        pub fn new(handler: impl Fn(&Cmd) -> Output + Send + Sync + 'static) -> Self {
            ScriptedRunner {
                handler: Box::new(handler),
                log: Mutex::new(Vec::new()),
            }
        }

        /// Succeeds on every command with empty output.
        pub fn succeeding() -> Self {
            Self::new(|_| ok(""))
        }

        pub fn commands(&self) -> Vec<String> {
            self.log.lock().unwrap().iter().map(|c| c.to_string()).collect()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn output(&self, cmd: &Cmd) -> std::io::Result<Output> {
            self.log.lock().unwrap().push(cmd.clone());
            Ok((self.handler)(cmd))
        }
    }

    pub fn ok(stdout: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(0),
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        }
    }

    pub fn fail(code: i32, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }
}
