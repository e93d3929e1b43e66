use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A host block device as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    /// Device path, e.g. `/dev/sdb`.
    pub name: PathBuf,
    pub size_bytes: u64,
    /// Capacity not yet covered by partitions, rounded down to whole GiB.
    pub free_space_gb: u64,
    pub num_partitions: usize,
}

/// A pool partition, either available or attached to a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// Device path, e.g. `/dev/sdb1`.
    pub name: PathBuf,
    /// GPT partition label, always carrying the pool prefix.
    pub label: String,
    pub size_bytes: u64,
    /// Device path of the disk holding this partition.
    pub disk: PathBuf,
}
