//! Dataplane configuration.
//!
//! Configuration is layered: built-in defaults, then a TOML file, then
//! environment variables prefixed with `IGS_` (sections separated by `__`,
//! e.g. `IGS_NETWORK__BRIDGE=br0`).
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:50051"
//!
//! [compute]
//! vm_root = "/IGS/compute/vms"
//! serial_handshake_timeout = "5s"
//!
//! [network]
//! bridge = "ovs-vm-bridge"
//! subnet = "192.168.100.0"
//!
//! [storage]
//! config_file = "/IGS/storage/storage.toml"
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "igs.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataplaneConfig {
    pub server: ServerConfig,
    pub compute: ComputeConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the control socket listens on.
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 50051)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshKeyAlgorithm {
    Rsa,
    Ed25519,
}

/// How responses are read from the line-oriented hypervisor monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorReadStrategy {
    /// Sleep for `monitor_command_delay` before writing a command and
    /// before reading, then perform a single read.
    FixedDelay,

    /// Read until the monitor prints its `(qemu) ` prompt, bounded by
    /// `monitor_command_delay` per read.
    Prompt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Directory holding one subdirectory per VM, named by its UUID.
    pub vm_root: PathBuf,

    /// Directory for the monitor and guest agent Unix sockets.
    pub run_dir: PathBuf,

    /// Golden qcow2 image every VM disk is cloned from.
    pub base_image: PathBuf,

    /// Optional script producing `base_image` when it is missing.
    pub base_image_build_script: Option<PathBuf>,

    /// Hypervisor boot configuration template (QEMU `-readconfig` format).
    pub boot_config_template: PathBuf,

    /// Literal token in the template replaced by the VM name.
    pub template_name_token: String,

    /// Literal token in the template replaced by the VM disk path.
    pub template_disk_token: String,

    pub qemu_binary: PathBuf,
    pub qemu_img_binary: PathBuf,
    pub genisoimage_binary: PathBuf,

    /// Arguments passed to the QEMU binary.
    ///
    /// These arguments support template strings using the
    /// [`strfmt`](https://docs.rs/strfmt/latest/strfmt/) crate. The available
    /// template strings are `vm_name`, `vm_dir`, `boot_config`,
    /// `disk_image`, `monitor_socket`, `agent_socket`, `tap_intf`,
    /// `mac_address` and `cloud_init_iso`.
    pub qemu_args: Vec<String>,

    /// Virtual size of a VM's copy-on-write disk, in `qemu-img` notation.
    pub disk_size: String,

    pub ssh_key_algorithm: SshKeyAlgorithm,

    /// Account created in the guest by cloud-init.
    pub guest_user: String,

    #[serde(with = "humantime_serde")]
    pub serial_handshake_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub monitor_connect_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub monitor_command_delay: Duration,

    pub monitor_read_strategy: MonitorReadStrategy,

    #[serde(with = "humantime_serde")]
    pub agent_timeout: Duration,

    /// Time granted to a guest to power down on delete before its
    /// hypervisor process is killed.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Return a deleted VM's partitions to the storage pool.
    pub release_disks_on_delete: bool,
}

pub fn default_qemu_args() -> Vec<String> {
    [
        "-nographic",
        "-readconfig",
        "{boot_config}",
        "-monitor",
        "unix:{monitor_socket},server,nowait",
        "-chardev",
        "socket,path={agent_socket},server=on,wait=off,id=qga0",
        "-device",
        "virtio-serial",
        "-device",
        "virtserialport,chardev=qga0,name=org.qemu.guest_agent.0",
        "-serial",
        "pty",
        "-netdev",
        "tap,id=net0,ifname={tap_intf},script=no,downscript=no",
        "-device",
        "virtio-net-pci,netdev=net0,mac={mac_address}",
        "-drive",
        "file={cloud_init_iso},media=cdrom,readonly=on",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for ComputeConfig {
    fn default() -> Self {
        ComputeConfig {
            vm_root: PathBuf::from("/IGS/compute/vms"),
            run_dir: PathBuf::from("/run/igs"),
            base_image: PathBuf::from("/IGS/compute/images/ubuntu22.04.qcow2"),
            base_image_build_script: None,
            boot_config_template: PathBuf::from("/etc/igs/instances/micro.conf"),
            template_name_token: "GNAME".to_string(),
            template_disk_token: "FPATH".to_string(),
            qemu_binary: PathBuf::from("qemu-system-x86_64"),
            qemu_img_binary: PathBuf::from("qemu-img"),
            genisoimage_binary: PathBuf::from("genisoimage"),
            qemu_args: default_qemu_args(),
            disk_size: "10G".to_string(),
            ssh_key_algorithm: SshKeyAlgorithm::Rsa,
            guest_user: "igs".to_string(),
            serial_handshake_timeout: Duration::from_secs(5),
            monitor_connect_timeout: Duration::from_secs(5),
            monitor_command_delay: Duration::from_millis(300),
            monitor_read_strategy: MonitorReadStrategy::FixedDelay,
            agent_timeout: Duration::from_secs(3),
            shutdown_grace: Duration::from_secs(10),
            release_disks_on_delete: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// OVS bridge every VM tap device is attached to.
    pub bridge: String,

    /// Network address of the managed /24 subnet.
    pub subnet: Ipv4Addr,

    pub gateway: Ipv4Addr,
    pub nameservers: Vec<Ipv4Addr>,

    pub ovs_vsctl_binary: PathBuf,
    pub ip_binary: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            bridge: "ovs-vm-bridge".to_string(),
            subnet: Ipv4Addr::new(192, 168, 100, 0),
            gateway: Ipv4Addr::new(192, 168, 100, 1),
            nameservers: vec![Ipv4Addr::new(1, 1, 1, 1)],
            ovs_vsctl_binary: PathBuf::from("ovs-vsctl"),
            ip_binary: PathBuf::from("ip"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// TOML document recording which partitions are attached to which VM.
    pub config_file: PathBuf,

    /// Label prefix marking partitions owned by the storage pool.
    pub partition_label_prefix: String,

    pub lsblk_binary: PathBuf,
    pub findmnt_binary: PathBuf,
    pub parted_binary: PathBuf,
    pub wipefs_binary: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            config_file: PathBuf::from("/IGS/storage/storage.toml"),
            partition_label_prefix: "igs_".to_string(),
            lsblk_binary: PathBuf::from("lsblk"),
            findmnt_binary: PathBuf::from("findmnt"),
            parted_binary: PathBuf::from("parted"),
            wipefs_binary: PathBuf::from("wipefs"),
        }
    }
}

/// Load the dataplane configuration.
///
/// When `path` is `None`, `igs.toml` in the current working directory is
/// used if it exists.
pub fn load_config(path: Option<&Path>) -> Result<DataplaneConfig, figment::Error> {
    let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

    Figment::from(Serialized::defaults(DataplaneConfig::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed("IGS_").split("__"))
        .extract()
}
