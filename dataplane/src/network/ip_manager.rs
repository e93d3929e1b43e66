use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Mutex, PoisonError};

use tracing::{event, Level};

use crate::error::IpError;

/// Lowest host number handed out to a VM. Lower numbers are reserved for the
/// gateway and other infrastructure.
pub const HOST_MIN: u8 = 5;

/// Highest host number handed out to a VM.
pub const HOST_MAX: u8 = 252;

#[derive(Debug)]
struct LeaseTable {
    free: BTreeSet<u8>,
    leased: HashMap<String, u8>,
}

/// Leases IPv4 host numbers of a single /24 subnet to VMs.
///
/// Every host number in `[HOST_MIN, HOST_MAX]` is either free or leased to
/// exactly one VM.
#[derive(Debug)]
pub struct IpManager {
    subnet: Ipv4Addr,
    leases: Mutex<LeaseTable>,
}

impl IpManager {
    pub fn new(subnet: Ipv4Addr) -> Self {
        IpManager {
            subnet,
            leases: Mutex::new(LeaseTable {
                free: (HOST_MIN..=HOST_MAX).collect(),
                leased: HashMap::new(),
            }),
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, LeaseTable> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease the lowest free host number to `vm_name`. A VM which already
    /// holds a lease gets its existing host number back.
    pub fn acquire_ip(&self, vm_name: &str) -> Result<u8, IpError> {
        let mut table = self.table();

        if let Some(host) = table.leased.get(vm_name) {
            return Ok(*host);
        }

        let host = table.free.pop_first().ok_or(IpError::PoolExhausted)?;
        table.leased.insert(vm_name.to_string(), host);
        event!(Level::DEBUG, vm_name, host, "Leased IP host number");

        Ok(host)
    }

    pub fn release_ip(&self, vm_name: &str) -> Result<u8, IpError> {
        let mut table = self.table();

        let host = table
            .leased
            .remove(vm_name)
            .ok_or_else(|| IpError::NotLeased(vm_name.to_string()))?;
        table.free.insert(host);
        event!(Level::DEBUG, vm_name, host, "Released IP host number");

        Ok(host)
    }

    pub fn get_ip(&self, vm_name: &str) -> Result<Ipv4Addr, IpError> {
        self.table()
            .leased
            .get(vm_name)
            .map(|host| self.host_addr(*host))
            .ok_or_else(|| IpError::NotLeased(vm_name.to_string()))
    }

    /// Re-establish a lease found on disk during startup recovery.
    pub fn recover(&self, vm_name: &str, addr: Ipv4Addr) -> Result<u8, IpError> {
        let host = addr.octets()[3];
        if !self.contains(addr) || !(HOST_MIN..=HOST_MAX).contains(&host) {
            return Err(IpError::OutOfPool { addr });
        }

        let mut table = self.table();

        if let Some(holder) = table
            .leased
            .iter()
            .find(|(_, leased_host)| **leased_host == host)
            .map(|(holder, _)| holder.clone())
        {
            if holder == vm_name {
                return Ok(host);
            }
            return Err(IpError::AlreadyLeased { addr, holder });
        }

        if let Some(previous) = table.leased.insert(vm_name.to_string(), host) {
            // The VM held a different lease, which becomes free again:
            table.free.insert(previous);
        }
        table.free.remove(&host);

        Ok(host)
    }

    /// Whether `addr` lies within the managed /24 subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        addr.octets()[..3] == self.subnet.octets()[..3]
    }

    pub fn host_addr(&self, host: u8) -> Ipv4Addr {
        let [a, b, c, _] = self.subnet.octets();
        Ipv4Addr::new(a, b, c, host)
    }

    pub fn free_count(&self) -> usize {
        self.table().free.len()
    }
}
