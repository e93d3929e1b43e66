use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::api::compute::VmStatusFilter;
use crate::api::storage::{DiskInfo, PartitionInfo};
use crate::error::ControlError;

/// Dataplane interface for control socket servers.
///
/// Clients (such as the `igs` shell) connect to the dataplane through a
/// control socket. The control socket server decodes their requests and
/// delivers them to an implementation of this trait. Every lifecycle call
/// returns the name of the VM it acted on.
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    async fn list_vms(&self, filter: VmStatusFilter) -> Result<Vec<String>, ControlError>;

    /// Create a new VM in the `down` state.
    ///
    /// Fails with a `PreconditionFailed` error if the golden base image is
    /// not available, before any resources are allocated.
    async fn create_vm(&self) -> Result<String, ControlError>;
    async fn delete_vm(&self, vm_name: &str) -> Result<String, ControlError>;
    async fn start_vm(&self, vm_name: &str) -> Result<String, ControlError>;
    async fn shutdown_vm(&self, vm_name: &str) -> Result<String, ControlError>;
    async fn resume_vm(&self, vm_name: &str) -> Result<String, ControlError>;
    async fn stop_vm(&self, vm_name: &str) -> Result<String, ControlError>;

    /// State token reported by the hypervisor monitor, e.g. `running` or
    /// `paused`.
    async fn vm_status(&self, vm_name: &str) -> Result<String, ControlError>;

    /// Path of the pseudo-terminal exposing the VM's serial console.
    ///
    /// The control socket server uses this to bridge a client connection to
    /// the console; it never performs console I/O through this trait.
    async fn serial_console_path(&self, vm_name: &str) -> Result<PathBuf, ControlError>;

    /// Address leased to the VM by the dataplane.
    async fn vm_ip(&self, vm_name: &str) -> Result<Ipv4Addr, ControlError>;

    /// Address the guest reports through its guest agent.
    async fn guest_ip(&self, vm_name: &str) -> Result<Ipv4Addr, ControlError>;

    async fn list_disks(&self) -> Result<Vec<DiskInfo>, ControlError>;
    async fn list_free_disks(&self) -> Result<Vec<DiskInfo>, ControlError>;
    async fn list_pool_disks(&self) -> Result<Vec<DiskInfo>, ControlError>;
    async fn add_disk(
        &self,
        disk_index: usize,
        partition_size_gb: u64,
    ) -> Result<Vec<PartitionInfo>, ControlError>;
    async fn remove_disk(&self, disk_index: usize) -> Result<(), ControlError>;
    async fn list_vm_disks(&self, vm_name: &str) -> Result<Vec<PartitionInfo>, ControlError>;
    async fn attach_disk_to_vm(&self, vm_name: &str) -> Result<PartitionInfo, ControlError>;
    async fn detach_disk_from_vm(
        &self,
        vm_name: &str,
        partition_name: &str,
    ) -> Result<(), ControlError>;
}
