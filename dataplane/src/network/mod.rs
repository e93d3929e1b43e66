//! Host networking for VMs: IP leases, MAC addresses, tap devices on the OVS
//! bridge.

pub mod ip_manager;
pub mod network_manager;

pub use ip_manager::IpManager;
pub use network_manager::{GuestNetworkConfig, NetworkManager};
