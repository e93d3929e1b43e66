use std::sync::Arc;

use tracing::{event, Level};

use igs_rs::api::storage::{DiskInfo, PartitionInfo};

use crate::error::DiskError;

use super::disk_manager::DiskManager;

/// Storage operations exposed over the control socket.
#[derive(Debug, Clone)]
pub struct StorageManager {
    disks: Arc<DiskManager>,
}

impl StorageManager {
    pub fn new(disks: Arc<DiskManager>) -> Self {
        StorageManager { disks }
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disks
    }

    /// Scan the host and repair VM configs after an unclean shutdown.
    /// Failures are logged; storage requests re-scan on their own.
    pub async fn recover(&self) {
        match self.disks.set_state().await {
            Ok(inventory) => event!(
                Level::INFO,
                root_disk = ?inventory.root_disk,
                free = inventory.free_disks.len(),
                pool = inventory.pool_disks.len(),
                partitions = inventory.pool_partitions.len(),
                "Scanned host disks",
            ),
            Err(e) => event!(Level::WARN, ?e, "Initial disk scan failed"),
        }

        match self.disks.reconcile_vm_configs().await {
            Ok(0) => (),
            Ok(repaired) => event!(Level::WARN, repaired, "Repaired VM drive stanzas"),
            Err(e) => event!(Level::WARN, ?e, "Failed to reconcile VM drive stanzas"),
        }
    }

    pub async fn list_disks(&self) -> Result<Vec<DiskInfo>, DiskError> {
        self.disks.list_disks().await
    }

    pub async fn list_free_disks(&self) -> Result<Vec<DiskInfo>, DiskError> {
        self.disks.list_free_disks().await
    }

    pub async fn list_pool_disks(&self) -> Result<Vec<DiskInfo>, DiskError> {
        self.disks.list_pool_disks().await
    }

    pub async fn add_disk(
        &self,
        disk_index: usize,
        partition_size_gb: u64,
    ) -> Result<Vec<PartitionInfo>, DiskError> {
        self.disks.add_disk(disk_index, partition_size_gb).await
    }

    pub async fn remove_disk(&self, disk_index: usize) -> Result<(), DiskError> {
        self.disks.remove_disk(disk_index).await
    }

    pub async fn list_vm_disks(&self, vm_name: &str) -> Result<Vec<PartitionInfo>, DiskError> {
        self.disks.list_vm_disks(vm_name).await
    }

    pub async fn attach_disk_to_vm(&self, vm_name: &str) -> Result<PartitionInfo, DiskError> {
        self.disks.attach_disk_to_vm(vm_name).await
    }

    pub async fn detach_disk_from_vm(
        &self,
        vm_name: &str,
        partition: &str,
    ) -> Result<(), DiskError> {
        self.disks.detach_disk_from_vm(vm_name, partition).await
    }
}
