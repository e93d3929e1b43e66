//! Error types of the dataplane components.
//!
//! Each component reports its own error enum. Every enum maps onto the coarse
//! [`ErrorKind`] carried over the control socket through its `kind()` method.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use igs_rs::api::compute::VmStatus;
use igs_rs::error::{ControlError, ErrorKind};

use crate::exec::ExecError;

#[derive(Debug, thiserror::Error)]
pub enum IpError {
    #[error("IP address pool exhausted")]
    PoolExhausted,

    #[error("VM {0} does not hold an IP lease")]
    NotLeased(String),

    #[error("address {addr} is outside of the managed pool")]
    OutOfPool { addr: Ipv4Addr },

    #[error("address {addr} is already leased to VM {holder}")]
    AlreadyLeased { addr: Ipv4Addr, holder: String },
}

impl IpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IpError::PoolExhausted => ErrorKind::ResourceExhausted,
            IpError::NotLeased(_) => ErrorKind::NotFound,
            IpError::OutOfPool { .. } => ErrorKind::PreconditionFailed,
            IpError::AlreadyLeased { .. } => ErrorKind::StateInconsistent,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error(transparent)]
    Ip(#[from] IpError),

    #[error("failed to set up tap device {tap}")]
    Tap {
        tap: String,
        #[source]
        source: ExecError,
    },
}

impl NetworkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::Ip(e) => e.kind(),
            NetworkError::Tap { source, .. } => source.kind(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    #[error("disk index {index} out of range, {len} disks available")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("invalid partition size {size_gb} GiB for a disk of {capacity_gb} GiB")]
    InvalidSize { size_gb: u64, capacity_gb: u64 },

    #[error("no pool partitions available")]
    NoPartitionsAvailable,

    #[error("partition {partition} is not attached to VM {vm_name}")]
    NotAttached { vm_name: String, partition: String },

    #[error("cannot parse block device listing")]
    Inventory(#[source] serde_json::Error),

    #[error("malformed storage state file {path:?}")]
    StateFormat {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("cannot encode storage state")]
    StateEncode(#[source] toml::ser::Error),

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl DiskError {
    pub fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> DiskError {
        let context = context.into();
        move |source| DiskError::Io { context, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DiskError::IndexOutOfRange { .. } => ErrorKind::NotFound,
            DiskError::InvalidSize { .. } => ErrorKind::PreconditionFailed,
            DiskError::NoPartitionsAvailable => ErrorKind::ResourceExhausted,
            DiskError::NotAttached { .. } => ErrorKind::NotFound,
            DiskError::Inventory(_) => ErrorKind::ExternalToolFailed,
            DiskError::StateFormat { .. } => ErrorKind::StateInconsistent,
            DiskError::StateEncode(_) => ErrorKind::Internal,
            DiskError::Io { .. } => ErrorKind::Internal,
            DiskError::Exec(e) => e.kind(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BaseImageError {
    #[error("base image {path:?} unavailable: {reason}")]
    BaseImageMissing { path: PathBuf, reason: String },

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl BaseImageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BaseImageError::BaseImageMissing { .. } => ErrorKind::PreconditionFailed,
            BaseImageError::Exec(e) => e.kind(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("cannot connect to monitor socket {path:?}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("monitor socket {path:?} did not accept a connection within {timeout:?}")]
    ConnectTimeout { path: PathBuf, timeout: Duration },

    #[error("monitor connection closed")]
    Closed,

    #[error("unexpected monitor response: {0:?}")]
    UnexpectedResponse(String),

    #[error("guest agent did not answer within {0:?}")]
    AgentTimeout(Duration),

    #[error("malformed guest agent response")]
    AgentResponse(#[source] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MonitorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MonitorError::ConnectTimeout { .. } | MonitorError::AgentTimeout(_) => {
                ErrorKind::Timeout
            }
            MonitorError::Closed => ErrorKind::StateInconsistent,
            _ => ErrorKind::ExternalToolFailed,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("VM {0} not found")]
    NotFound(String),

    #[error("cannot {operation} VM {vm_name} in state {status}")]
    InvalidState {
        vm_name: String,
        status: VmStatus,
        operation: &'static str,
    },

    #[error("VM {vm_name} still has a hypervisor process (pid {pid:?}) from an earlier shutdown")]
    Lingering { vm_name: String, pid: Option<u32> },

    #[error("VM {0} is not running")]
    NotRunning(String),

    #[error("failed to create VM {vm_name}")]
    CreateFailed {
        vm_name: String,
        #[source]
        cause: Box<VmError>,
    },

    #[error("failed to start VM {vm_name}")]
    StartFailed {
        vm_name: String,
        #[source]
        cause: Box<VmError>,
    },

    #[error("hypervisor did not announce its serial console within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("hypervisor exited before announcing its serial console: {0}")]
    HandshakeFailed(String),

    #[error("guest agent of VM {vm_name} unreachable")]
    AgentUnreachable {
        vm_name: String,
        #[source]
        source: MonitorError,
    },

    #[error("guest of VM {0} reports no address in the managed subnet")]
    NoGuestAddress(String),

    #[error("invalid hypervisor argument template")]
    Template(#[source] strfmt::FmtError),

    #[error("cannot generate SSH keypair")]
    SshKey(#[from] ssh_key::Error),

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    BaseImage(#[from] BaseImageError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl VmError {
    pub fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> VmError {
        let context = context.into();
        move |source| VmError::Io { context, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VmError::NotFound(_) => ErrorKind::NotFound,
            VmError::InvalidState { .. } => ErrorKind::PreconditionFailed,
            VmError::Lingering { .. } => ErrorKind::PreconditionFailed,
            VmError::NotRunning(_) => ErrorKind::PreconditionFailed,
            VmError::CreateFailed { cause, .. } => cause.kind(),
            VmError::StartFailed { cause, .. } => cause.kind(),
            VmError::HandshakeTimeout(_) => ErrorKind::Timeout,
            VmError::HandshakeFailed(_) => ErrorKind::ExternalToolFailed,
            VmError::AgentUnreachable { source, .. } => match source.kind() {
                ErrorKind::Timeout => ErrorKind::Timeout,
                _ => ErrorKind::ExternalToolFailed,
            },
            VmError::NoGuestAddress(_) => ErrorKind::NotFound,
            VmError::Template(_) => ErrorKind::Internal,
            VmError::SshKey(_) => ErrorKind::Internal,
            VmError::Io { .. } => ErrorKind::Internal,
            VmError::BaseImage(e) => e.kind(),
            VmError::Monitor(e) => e.kind(),
            VmError::Network(e) => e.kind(),
            VmError::Disk(e) => e.kind(),
            VmError::Exec(e) => e.kind(),
        }
    }
}

/// Render an error and its chain of sources on one line.
pub fn describe(err: &dyn std::error::Error) -> String {
    let mut description = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_str = cause.to_string();
        // Transparent wrappers repeat their inner message:
        if !description.ends_with(&cause_str) {
            description.push_str(": ");
            description.push_str(&cause_str);
        }
        source = cause.source();
    }
    description
}

macro_rules! into_control_error {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ControlError {
                fn from(err: $ty) -> Self {
                    ControlError::new(err.kind(), describe(&err))
                }
            }
        )*
    };
}

into_control_error!(IpError, NetworkError, DiskError, BaseImageError, VmError);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_errors_keep_their_kind_and_chain() {
        let err = VmError::CreateFailed {
            vm_name: "f00".to_string(),
            cause: Box::new(VmError::Network(NetworkError::Ip(IpError::PoolExhausted))),
        };
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        let control = ControlError::from(err);
        assert_eq!(control.kind, ErrorKind::ResourceExhausted);
        assert_eq!(
            control.description,
            "failed to create VM f00: IP address pool exhausted"
        );
    }

    #[test]
    fn start_timeout_maps_to_timeout() {
        let err = VmError::StartFailed {
            vm_name: "f00".to_string(),
            cause: Box::new(VmError::HandshakeTimeout(Duration::from_secs(5))),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
