//! Messages exchanged over the dataplane control socket.
//!
//! Every frame carries one JSON document. Clients send [`ClientMsg`]s and
//! receive [`ServerMsg`]s. Each request is answered by exactly one response
//! carrying the same `request_id`.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use super::compute::VmStatusFilter;
use super::storage::{DiskInfo, PartitionInfo};
use crate::error::ControlError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
#[non_exhaustive]
pub enum Request {
    // Compute:
    ListVms { filter: VmStatusFilter },
    CreateVm,
    DeleteVm { vm_name: String },
    StartVm { vm_name: String },
    ShutdownVm { vm_name: String },
    ResumeVm { vm_name: String },
    StopVm { vm_name: String },
    GetVmStatus { vm_name: String },

    /// Switch this connection into a raw byte stream bridged to the VM's
    /// serial console. No further framed messages are exchanged after a
    /// successful response.
    OpenSerialConsole { vm_name: String },

    // Network:
    GetVmIp { vm_name: String },
    GetGuestIp { vm_name: String },

    // Storage:
    ListDisks,
    ListFreeDisks,
    ListPoolDisks,
    AddDisk { disk_index: usize, partition_size_gb: u64 },
    RemoveDisk { disk_index: usize },
    ListVmDisks { vm_name: String },
    AttachDiskToVm { vm_name: String },
    DetachDiskFromVm { vm_name: String, partition_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
#[non_exhaustive]
pub enum Response {
    VmNames { vm_names: Vec<String> },
    VmName { vm_name: String },
    VmStatus { status: String },
    VmIp { ip_address: Ipv4Addr },
    SerialConsoleReady { vm_name: String },
    Disks { disks: Vec<DiskInfo> },
    Partitions { partitions: Vec<PartitionInfo> },
    Partition { partition: PartitionInfo },
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMsg {
    pub request_id: u64,
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum ServerMsg {
    Response {
        request_id: u64,
        response: Result<Response, ControlError>,
    },

    /// The server could not decode a client frame.
    Error { message: String },
}
