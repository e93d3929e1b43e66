use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{event, instrument, Level};

use igs_rs::api::network::MacAddr;
use igs_rs::config::NetworkConfig;

use crate::error::NetworkError;
use crate::exec::{run_checked, Cmd, CommandRunner};

use super::ip_manager::IpManager;

/// Linux limits interface names to 15 bytes (IFNAMSIZ minus the NUL byte).
const MAX_INTF_NAME_LEN: usize = 15;

/// Guest interface configured through cloud-init.
const GUEST_INTF: &str = "eth0";

/// Cloud-init network configuration (version 2) of a VM.
///
/// Cloud-init accepts YAML, of which JSON is a subset, so the document is
/// persisted as JSON. It is the on-disk record of a VM's network identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestNetworkConfig {
    pub version: u8,
    pub ethernets: BTreeMap<String, GuestEthernet>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestEthernet {
    #[serde(rename = "match")]
    pub match_: GuestMatch,
    pub set_name: String,
    pub addresses: Vec<String>,
    pub gateway4: Ipv4Addr,
    pub nameservers: GuestNameservers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestMatch {
    pub macaddress: MacAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestNameservers {
    pub addresses: Vec<Ipv4Addr>,
}

impl GuestNetworkConfig {
    pub fn new(mac: MacAddr, ip: Ipv4Addr, gateway: Ipv4Addr, nameservers: &[Ipv4Addr]) -> Self {
        let mut ethernets = BTreeMap::new();
        ethernets.insert(
            GUEST_INTF.to_string(),
            GuestEthernet {
                match_: GuestMatch { macaddress: mac },
                set_name: GUEST_INTF.to_string(),
                addresses: vec![format!("{ip}/24")],
                gateway4: gateway,
                nameservers: GuestNameservers {
                    addresses: nameservers.to_vec(),
                },
            },
        );

        GuestNetworkConfig {
            version: 2,
            ethernets,
        }
    }

    fn primary(&self) -> Option<&GuestEthernet> {
        self.ethernets.values().next()
    }

    pub fn mac(&self) -> Option<MacAddr> {
        self.primary().map(|eth| eth.match_.macaddress)
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.primary()?
            .addresses
            .iter()
            .find_map(|addr| addr.split('/').next()?.parse().ok())
    }

    /// Read a persisted network configuration. Missing or malformed files
    /// yield `None`.
    pub async fn load(path: &Path) -> Option<Self> {
        let contents = match tokio::fs::read(path).await {
            Ok(contents) => contents,
            Err(e) => {
                event!(Level::DEBUG, ?path, ?e, "Cannot read network-config");
                return None;
            }
        };

        match serde_json::from_slice(&contents) {
            Ok(config) => Some(config),
            Err(e) => {
                event!(Level::WARN, ?path, ?e, "Malformed network-config");
                None
            }
        }
    }
}

/// Owns the host-side network attachment of VMs: the OVS bridge, one tap
/// device per VM, MAC addresses and IP leases.
pub struct NetworkManager {
    config: NetworkConfig,
    runner: Arc<dyn CommandRunner>,
    ip_manager: IpManager,

    /// Every MAC address issued or recovered during this process' lifetime.
    issued_macs: Mutex<HashSet<MacAddr>>,

    /// VM name to tap device name, for taps currently set up.
    taps: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("bridge", &self.config.bridge)
            .field("ip_manager", &self.ip_manager)
            .finish_non_exhaustive()
    }
}

impl NetworkManager {
    pub fn new(config: NetworkConfig, runner: Arc<dyn CommandRunner>) -> Self {
        NetworkManager {
            ip_manager: IpManager::new(config.subnet),
            config,
            runner,
            issued_macs: Mutex::new(HashSet::new()),
            taps: Mutex::new(HashMap::new()),
        }
    }

    pub fn ip_manager(&self) -> &IpManager {
        &self.ip_manager
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn ovs_vsctl(&self) -> Cmd {
        Cmd::new(&self.config.ovs_vsctl_binary)
    }

    fn ip(&self) -> Cmd {
        Cmd::new(&self.config.ip_binary)
    }

    /// Create the OVS bridge and bring it up. Failures are logged, as the
    /// bridge may be managed outside of the dataplane.
    #[instrument(skip(self), fields(bridge = %self.config.bridge))]
    pub async fn setup_bridge(&self) {
        let add_br = self
            .ovs_vsctl()
            .args(["--may-exist", "add-br", self.config.bridge.as_str()]);
        if let Err(e) = run_checked(&*self.runner, &add_br).await {
            event!(Level::WARN, ?e, "Failed to create OVS bridge, continuing");
        }

        let link_up = self.ip().args(["link", "set", self.config.bridge.as_str(), "up"]);
        if let Err(e) = run_checked(&*self.runner, &link_up).await {
            event!(Level::WARN, ?e, "Failed to bring up OVS bridge, continuing");
        }
    }

    pub fn tap_name(vm_name: &str) -> String {
        let mut tap = format!("tap_{vm_name}");
        // VM names are ASCII (UUIDs), truncating on a byte index is safe:
        if tap.len() > MAX_INTF_NAME_LEN && tap.is_char_boundary(MAX_INTF_NAME_LEN) {
            tap.truncate(MAX_INTF_NAME_LEN);
        }
        tap
    }

    /// Ensure a tap device for the VM exists and is attached to the bridge.
    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    pub async fn allocate_tap(&self, vm_name: &str) -> Result<String, NetworkError> {
        let tap = Self::tap_name(vm_name);

        let probe = self.ip().args(["link", "show", "dev", tap.as_str()]);
        let exists = matches!(self.runner.output(&probe).await, Ok(output) if output.status.success());

        if exists {
            event!(Level::DEBUG, %tap, "Tap device already exists, skipping creation");
        } else {
            let steps = [
                self.ip().args(["tuntap", "add", "dev", tap.as_str(), "mode", "tap"]),
                self.ovs_vsctl()
                    .args(["--may-exist", "add-port", self.config.bridge.as_str(), tap.as_str()]),
                self.ip().args(["link", "set", tap.as_str(), "up"]),
            ];

            for step in &steps {
                run_checked(&*self.runner, step)
                    .await
                    .map_err(|source| NetworkError::Tap {
                        tap: tap.clone(),
                        source,
                    })?;
            }

            event!(Level::INFO, %tap, bridge = %self.config.bridge, "Created tap device");
        }

        self.taps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(vm_name.to_string(), tap.clone());

        Ok(tap)
    }

    /// Remove the VM's tap device. Never fails; errors are logged.
    #[instrument(skip(self))]
    pub async fn deallocate_tap(&self, vm_name: &str) {
        let tap = self
            .taps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(vm_name)
            .unwrap_or_else(|| Self::tap_name(vm_name));

        let del_port = self
            .ovs_vsctl()
            .args(["--if-exists", "del-port", self.config.bridge.as_str(), tap.as_str()]);
        if let Err(e) = run_checked(&*self.runner, &del_port).await {
            event!(Level::WARN, %tap, ?e, "Failed to detach tap device from bridge");
        }

        let del_tap = self.ip().args(["tuntap", "del", "dev", tap.as_str(), "mode", "tap"]);
        if let Err(e) = run_checked(&*self.runner, &del_tap).await {
            event!(Level::WARN, %tap, ?e, "Failed to delete tap device");
        }
    }

    pub fn tap_of(&self, vm_name: &str) -> Option<String> {
        self.taps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(vm_name)
            .cloned()
    }

    /// Generate a locally administered unicast MAC address which has not been
    /// issued before.
    pub fn generate_mac(&self) -> MacAddr {
        let mut issued = self.issued_macs.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let tail: [u8; 5] = rand::random();
            let mac = MacAddr([0x02, tail[0], tail[1], tail[2], tail[3], tail[4]]);
            if issued.insert(mac) {
                return mac;
            }
        }
    }

    /// Register a MAC address recovered from disk. Returns `false` if it was
    /// already issued.
    pub fn register_mac(&self, mac: MacAddr) -> bool {
        self.issued_macs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(mac)
    }

    pub fn forget_mac(&self, mac: MacAddr) {
        self.issued_macs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&mac);
    }

    /// Address recorded in a VM's persisted network configuration.
    pub async fn get_vm_ip(&self, network_config: &Path) -> Option<Ipv4Addr> {
        GuestNetworkConfig::load(network_config).await?.ip()
    }

    /// MAC address recorded in a VM's persisted network configuration.
    pub async fn get_vm_mac(&self, network_config: &Path) -> Option<MacAddr> {
        GuestNetworkConfig::load(network_config).await?.mac()
    }

    /// Address currently leased to the VM.
    pub fn get_ip(&self, vm_name: &str) -> Result<Ipv4Addr, NetworkError> {
        Ok(self.ip_manager.get_ip(vm_name)?)
    }

    /// Render the guest network configuration for a VM holding a lease.
    pub fn guest_network_config(
        &self,
        vm_name: &str,
        mac: MacAddr,
    ) -> Result<GuestNetworkConfig, NetworkError> {
        Ok(GuestNetworkConfig::new(
            mac,
            self.ip_manager.get_ip(vm_name)?,
            self.config.gateway,
            &self.config.nameservers,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::{fail, ok, ScriptedRunner};

    fn manager(runner: Arc<ScriptedRunner>) -> NetworkManager {
        NetworkManager::new(NetworkConfig::default(), runner)
    }

    #[test]
    fn tap_names_fit_interface_limit() {
        let tap = NetworkManager::tap_name("0b6f2a0e-8d8c-4c1e-9a59-3d0f7d9d7a11");
        assert_eq!(tap, "tap_0b6f2a0e-8d");
        assert_eq!(tap.len(), MAX_INTF_NAME_LEN);
        assert_eq!(NetworkManager::tap_name("vm1"), "tap_vm1");
    }

    #[test]
    fn macs_are_unique_local_unicast() {
        let nm = manager(Arc::new(ScriptedRunner::succeeding()));
        let mut seen = HashSet::new();
        for _ in 0..2000 {
            let mac = nm.generate_mac();
            assert!(mac.is_local() && mac.is_unicast());
            assert_eq!(mac.0[0], 0x02);
            assert!(seen.insert(mac));
        }

        let recovered = MacAddr([0x02, 1, 2, 3, 4, 5]);
        assert!(nm.register_mac(recovered));
        assert!(!nm.register_mac(recovered));
    }

    #[tokio::test]
    async fn allocate_tap_creates_and_attaches() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| {
            if cmd.starts_with(&["link", "show"]) {
                fail(1, "Device \"tap_vm1\" does not exist.")
            } else {
                ok("")
            }
        }));
        let nm = manager(runner.clone());

        assert_eq!(nm.allocate_tap("vm1").await.unwrap(), "tap_vm1");
        assert_eq!(
            runner.commands(),
            vec![
                "ip link show dev tap_vm1",
                "ip tuntap add dev tap_vm1 mode tap",
                "ovs-vsctl --may-exist add-port ovs-vm-bridge tap_vm1",
                "ip link set tap_vm1 up",
            ]
        );
        assert_eq!(nm.tap_of("vm1").as_deref(), Some("tap_vm1"));
    }

    #[tokio::test]
    async fn allocate_tap_twice_skips_existing_device() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let nm = manager(runner.clone());

        nm.allocate_tap("vm1").await.unwrap();
        nm.allocate_tap("vm1").await.unwrap();
        assert_eq!(
            runner.commands(),
            vec!["ip link show dev tap_vm1", "ip link show dev tap_vm1"]
        );
    }

    #[tokio::test]
    async fn allocate_tap_surfaces_failures() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| {
            if cmd.starts_with(&["link", "show"]) || cmd.starts_with(&["tuntap"]) {
                fail(1, "Operation not permitted")
            } else {
                ok("")
            }
        }));
        let nm = manager(runner);

        let err = nm.allocate_tap("vm1").await.unwrap_err();
        assert!(matches!(err, NetworkError::Tap { .. }));
        assert_eq!(nm.tap_of("vm1"), None);
    }

    #[tokio::test]
    async fn deallocate_tap_never_fails() {
        let runner = Arc::new(ScriptedRunner::new(|_| fail(1, "no such device")));
        let nm = manager(runner.clone());

        nm.deallocate_tap("vm1").await;
        assert_eq!(
            runner.commands(),
            vec![
                "ovs-vsctl --if-exists del-port ovs-vm-bridge tap_vm1",
                "ip tuntap del dev tap_vm1 mode tap",
            ]
        );
    }

    #[tokio::test]
    async fn network_identity_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("network-config");
        let nm = manager(Arc::new(ScriptedRunner::succeeding()));

        nm.ip_manager().acquire_ip("vm1").unwrap();
        let mac = nm.generate_mac();
        let doc = nm.guest_network_config("vm1", mac).unwrap();
        tokio::fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap())
            .await
            .unwrap();

        assert_eq!(nm.get_vm_mac(&path).await, Some(mac));
        assert_eq!(
            nm.get_vm_ip(&path).await,
            Some(Ipv4Addr::new(192, 168, 100, 5))
        );

        tokio::fs::write(&path, b"{ not json").await.unwrap();
        assert_eq!(nm.get_vm_ip(&path).await, None);
        assert_eq!(nm.get_vm_mac(&dir.path().join("missing")).await, None);
    }
}
