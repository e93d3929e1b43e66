use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{event, Level};

use igs_rs::api::compute::VmStatusFilter;
use igs_rs::api::storage::{DiskInfo, PartitionInfo};
use igs_rs::config::DataplaneConfig;
use igs_rs::control_socket::ControlPlane;
use igs_rs::error::ControlError;

use crate::compute::{BaseImage, DistroManager, VmManager};
use crate::error::VmError;
use crate::exec::CommandRunner;
use crate::network::NetworkManager;
use crate::storage::{DiskManager, StorageManager};

/// The dataplane service: every manager of one host behind the control
/// plane interface.
#[derive(Debug)]
pub struct Dataplane {
    vms: Arc<VmManager>,
    network: Arc<NetworkManager>,
    storage: StorageManager,
}

impl Dataplane {
    /// Construct all managers from the configuration and recover the state
    /// left behind by an earlier instance.
    pub async fn new(
        config: DataplaneConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, VmError> {
        let network = Arc::new(NetworkManager::new(config.network, runner.clone()));
        network.setup_bridge().await;

        let disks = Arc::new(DiskManager::new(
            config.storage,
            config.compute.vm_root.clone(),
            runner.clone(),
        ));
        let storage = StorageManager::new(disks.clone());
        storage.recover().await;

        let distro: Arc<dyn DistroManager> = Arc::new(BaseImage::new(
            config.compute.base_image.clone(),
            config.compute.base_image_build_script.clone(),
            config.compute.qemu_img_binary.clone(),
            runner.clone(),
        ));
        if let Err(e) = distro.verify().await {
            // Not fatal, VM creation retries and reports the problem:
            event!(Level::WARN, ?e, "Base image currently unusable");
        }

        let vms = Arc::new(
            VmManager::new(config.compute, runner, network.clone(), disks, distro).await?,
        );

        Ok(Dataplane {
            vms,
            network,
            storage,
        })
    }

    pub fn vm_manager(&self) -> &Arc<VmManager> {
        &self.vms
    }

    pub fn network_manager(&self) -> &Arc<NetworkManager> {
        &self.network
    }

    pub fn storage_manager(&self) -> &StorageManager {
        &self.storage
    }

    async fn ensure_vm(&self, vm_name: &str) -> Result<(), ControlError> {
        self.vms.status_of(vm_name).await?;
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for Dataplane {
    async fn list_vms(&self, filter: VmStatusFilter) -> Result<Vec<String>, ControlError> {
        Ok(self.vms.list_vms(filter).await)
    }

    async fn create_vm(&self) -> Result<String, ControlError> {
        Ok(self.vms.create_vm().await?)
    }

    async fn delete_vm(&self, vm_name: &str) -> Result<String, ControlError> {
        Ok(self.vms.delete_vm(vm_name).await?)
    }

    async fn start_vm(&self, vm_name: &str) -> Result<String, ControlError> {
        Ok(self.vms.start_vm(vm_name).await?)
    }

    async fn shutdown_vm(&self, vm_name: &str) -> Result<String, ControlError> {
        Ok(self.vms.shutdown_vm(vm_name).await?)
    }

    async fn resume_vm(&self, vm_name: &str) -> Result<String, ControlError> {
        Ok(self.vms.resume_vm(vm_name).await?)
    }

    async fn stop_vm(&self, vm_name: &str) -> Result<String, ControlError> {
        Ok(self.vms.stop_vm(vm_name).await?)
    }

    async fn vm_status(&self, vm_name: &str) -> Result<String, ControlError> {
        Ok(self.vms.vm_status(vm_name).await?)
    }

    async fn serial_console_path(&self, vm_name: &str) -> Result<PathBuf, ControlError> {
        Ok(self.vms.serial_console_path(vm_name).await?)
    }

    async fn vm_ip(&self, vm_name: &str) -> Result<Ipv4Addr, ControlError> {
        Ok(self.vms.vm_ip(vm_name).await?)
    }

    async fn guest_ip(&self, vm_name: &str) -> Result<Ipv4Addr, ControlError> {
        Ok(self.vms.guest_ip(vm_name).await?)
    }

    async fn list_disks(&self) -> Result<Vec<DiskInfo>, ControlError> {
        Ok(self.storage.list_disks().await?)
    }

    async fn list_free_disks(&self) -> Result<Vec<DiskInfo>, ControlError> {
        Ok(self.storage.list_free_disks().await?)
    }

    async fn list_pool_disks(&self) -> Result<Vec<DiskInfo>, ControlError> {
        Ok(self.storage.list_pool_disks().await?)
    }

    async fn add_disk(
        &self,
        disk_index: usize,
        partition_size_gb: u64,
    ) -> Result<Vec<PartitionInfo>, ControlError> {
        Ok(self.storage.add_disk(disk_index, partition_size_gb).await?)
    }

    async fn remove_disk(&self, disk_index: usize) -> Result<(), ControlError> {
        Ok(self.storage.remove_disk(disk_index).await?)
    }

    async fn list_vm_disks(&self, vm_name: &str) -> Result<Vec<PartitionInfo>, ControlError> {
        self.ensure_vm(vm_name).await?;
        Ok(self.storage.list_vm_disks(vm_name).await?)
    }

    async fn attach_disk_to_vm(&self, vm_name: &str) -> Result<PartitionInfo, ControlError> {
        self.ensure_vm(vm_name).await?;
        Ok(self.storage.attach_disk_to_vm(vm_name).await?)
    }

    async fn detach_disk_from_vm(
        &self,
        vm_name: &str,
        partition_name: &str,
    ) -> Result<(), ControlError> {
        self.ensure_vm(vm_name).await?;
        Ok(self
            .storage
            .detach_disk_from_vm(vm_name, partition_name)
            .await?)
    }
}
