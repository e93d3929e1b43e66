//! Host disks partitioned into a pool, and their attachment to VMs.

pub mod disk_manager;
pub mod storage_manager;

pub use disk_manager::{DiskInventory, DiskManager};
pub use storage_manager::StorageManager;
