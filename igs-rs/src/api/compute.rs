use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a virtual machine.
///
/// Every VM known to the dataplane carries exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    /// No hypervisor process is running for this VM.
    Down,

    /// The hypervisor process is running and the guest is executing.
    Running,

    /// The hypervisor process is running, but the guest has been paused
    /// through the monitor.
    Stopped,
}

impl VmStatus {
    /// Whether a hypervisor process (and monitor connection) is expected for
    /// this status.
    pub fn is_live(&self) -> bool {
        matches!(self, VmStatus::Running | VmStatus::Stopped)
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmStatus::Down => write!(f, "down"),
            VmStatus::Running => write!(f, "running"),
            VmStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Selects a view of the VM table by status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatusFilter {
    #[default]
    All,
    Down,
    /// Running or stopped.
    Live,
    Stopped,
    Running,
}

impl VmStatusFilter {
    pub fn matches(&self, status: VmStatus) -> bool {
        match self {
            VmStatusFilter::All => true,
            VmStatusFilter::Down => status == VmStatus::Down,
            VmStatusFilter::Live => status.is_live(),
            VmStatusFilter::Stopped => status == VmStatus::Stopped,
            VmStatusFilter::Running => status == VmStatus::Running,
        }
    }
}

impl std::str::FromStr for VmStatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(VmStatusFilter::All),
            "down" => Ok(VmStatusFilter::Down),
            "live" => Ok(VmStatusFilter::Live),
            "stopped" => Ok(VmStatusFilter::Stopped),
            "running" => Ok(VmStatusFilter::Running),
            other => Err(format!(
                "unknown status filter {other:?}, expected one of all, down, live, stopped, running"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_filter_covers_running_and_stopped() {
        assert!(VmStatusFilter::Live.matches(VmStatus::Running));
        assert!(VmStatusFilter::Live.matches(VmStatus::Stopped));
        assert!(!VmStatusFilter::Live.matches(VmStatus::Down));
        assert!(VmStatusFilter::All.matches(VmStatus::Down));
        assert!(!VmStatusFilter::Running.matches(VmStatus::Stopped));
    }

    #[test]
    fn filter_parses_from_shell_words() {
        assert_eq!("live".parse::<VmStatusFilter>(), Ok(VmStatusFilter::Live));
        assert!("paused".parse::<VmStatusFilter>().is_err());
    }
}
