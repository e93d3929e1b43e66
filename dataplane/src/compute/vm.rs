use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use igs_rs::api::compute::VmStatus;
use igs_rs::api::network::MacAddr;

use super::cloud_init::SEED_ISO_FILE;
use super::hypervisor::HypervisorProcess;
use super::monitor::MonitorConnection;

/// Everything the dataplane knows about one VM besides its status.
///
/// The VM directory `<vm_root>/<name>/` holds the disk `<name>.qcow2`, the
/// boot config `<name>.conf`, the SSH keypair and the cloud-init seed.
#[derive(Debug)]
pub struct VmRecord {
    pub name: Uuid,
    pub vm_dir: PathBuf,
    pub disk_location: PathBuf,
    pub boot_config: PathBuf,
    pub mac_address: MacAddr,
    pub ip_address: Option<Ipv4Addr>,
    pub tap_intf: Option<String>,
    pub hv_conn: Option<MonitorConnection>,
    pub serial_conn: Option<PathBuf>,
}

impl VmRecord {
    pub fn new(name: Uuid, vm_root: &Path, mac_address: MacAddr) -> Self {
        let vm_dir = vm_root.join(name.to_string());
        VmRecord {
            disk_location: vm_dir.join(format!("{name}.qcow2")),
            boot_config: vm_dir.join(format!("{name}.conf")),
            vm_dir,
            name,
            mac_address,
            ip_address: None,
            tap_intf: None,
            hv_conn: None,
            serial_conn: None,
        }
    }

    pub fn seed_iso(&self) -> PathBuf {
        self.vm_dir.join(SEED_ISO_FILE)
    }
}

/// A row of the VM table.
#[derive(Debug)]
pub struct VmEntry {
    pub record: VmRecord,
    pub status: VmStatus,

    /// Hypervisor process spawned by this dataplane instance. Set while the
    /// VM is live, and kept after a shutdown until the process exits.
    pub process: Option<HypervisorProcess>,

    /// Incremented on every start and on deletion. Exit watchers only act on
    /// the generation they were spawned for.
    pub generation: u64,

    /// Set once deleted. Holders of a stale handle must treat the VM as gone.
    pub removed: bool,
}

impl VmEntry {
    pub fn new(record: VmRecord, status: VmStatus) -> Self {
        VmEntry {
            record,
            status,
            process: None,
            generation: 0,
            removed: false,
        }
    }

    pub fn name(&self) -> String {
        self.record.name.to_string()
    }

    /// A hypervisor process that outlived the shutdown of its VM.
    pub fn lingering_process(&self) -> Option<&HypervisorProcess> {
        self.process
            .as_ref()
            .filter(|process| self.status == VmStatus::Down && process.is_running())
    }
}
