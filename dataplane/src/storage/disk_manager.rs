use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::Mutex;
use tracing::{event, instrument, Level};

use igs_rs::api::storage::{DiskInfo, PartitionInfo};
use igs_rs::config::StorageConfig;

use crate::error::DiskError;
use crate::exec::{run_checked, Cmd, CommandRunner};

pub const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<BlockDevice>,
}

/// One entry of `lsblk --json --paths --bytes`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockDevice {
    pub name: PathBuf,

    #[serde(deserialize_with = "deserialize_size")]
    pub size: u64,

    #[serde(rename = "type")]
    pub dev_type: String,

    #[serde(default)]
    pub mountpoint: Option<String>,

    #[serde(default)]
    pub fstype: Option<String>,

    #[serde(default)]
    pub partlabel: Option<String>,

    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

// Older util-linux releases print sizes as strings even with `--bytes`.
fn deserialize_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Number(u64),
        String(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Number(n) => Ok(n),
        Size::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl BlockDevice {
    fn is_free(&self) -> bool {
        self.dev_type == "disk"
            && self.mountpoint.is_none()
            && self.fstype.is_none()
            && self.children.is_empty()
    }

    fn pool_children<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a BlockDevice> {
        self.children.iter().filter(move |child| {
            child
                .partlabel
                .as_deref()
                .map_or(false, |label| label.starts_with(prefix))
        })
    }

    fn disk_info(&self) -> DiskInfo {
        let used: u64 = self.children.iter().map(|c| c.size).sum();
        DiskInfo {
            name: self.name.clone(),
            size_bytes: self.size,
            free_space_gb: self.size.saturating_sub(used) / GIB,
            num_partitions: self.children.len(),
        }
    }
}

/// Classified view of the host's block devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskInventory {
    pub root_disk: Option<PathBuf>,

    /// Every whole disk except the root disk.
    pub all_disks: Vec<DiskInfo>,

    /// Disks without partitions, filesystem or mountpoint.
    pub free_disks: Vec<DiskInfo>,

    /// Disks carrying at least one partition with the pool label prefix.
    pub pool_disks: Vec<DiskInfo>,

    /// Every pool-labelled partition, attached or not.
    pub pool_partitions: Vec<PartitionInfo>,
}

impl DiskInventory {
    pub fn classify(devices: &[BlockDevice], root_disk: Option<&Path>, prefix: &str) -> Self {
        let mut inventory = DiskInventory {
            root_disk: root_disk.map(Path::to_path_buf),
            ..Default::default()
        };

        for device in devices {
            if device.dev_type != "disk" || Some(device.name.as_path()) == root_disk {
                continue;
            }

            inventory.all_disks.push(device.disk_info());

            if device.is_free() {
                inventory.free_disks.push(device.disk_info());
                continue;
            }

            let mut pool_children = device.pool_children(prefix).peekable();
            if pool_children.peek().is_some() {
                inventory.pool_disks.push(device.disk_info());
                inventory
                    .pool_partitions
                    .extend(pool_children.map(|child| PartitionInfo {
                        name: child.name.clone(),
                        label: child.partlabel.clone().unwrap_or_default(),
                        size_bytes: child.size,
                        disk: device.name.clone(),
                    }));
            }
        }

        inventory
    }
}

/// Persisted attachment of pool partitions to VMs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageState {
    #[serde(default)]
    pub vm_disks: BTreeMap<String, Vec<PartitionInfo>>,
}

impl StorageState {
    fn is_attached(&self, partition: &Path) -> bool {
        self.vm_disks
            .values()
            .flatten()
            .any(|attached| attached.name == partition)
    }
}

/// The storage state TOML document, guarded by an advisory lock on a
/// sibling `.lock` file shared with other processes on the host. Locking and
/// file I/O run on the blocking thread pool.
#[derive(Debug, Clone)]
struct StateFile {
    path: PathBuf,
}

impl StateFile {
    fn lock_path(&self) -> PathBuf {
        let mut lock_path = self.path.clone().into_os_string();
        lock_path.push(".lock");
        PathBuf::from(lock_path)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, DiskError>
    where
        T: Send + 'static,
        F: FnOnce(&StateFile) -> Result<T, DiskError> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(&this))
            .await
            .map_err(|e| DiskError::Io {
                context: format!("Storage state task for {:?} failed", self.path),
                source: std::io::Error::other(e),
            })?
    }

    /// Take the advisory lock. It is released when the returned file is
    /// dropped.
    async fn lock(&self, exclusive: bool) -> Result<File, DiskError> {
        self.blocking(move |state_file| state_file.lock_blocking(exclusive))
            .await
    }

    async fn read(&self) -> Result<StorageState, DiskError> {
        self.blocking(StateFile::read_blocking).await
    }

    async fn write(&self, state: &StorageState) -> Result<(), DiskError> {
        let state = state.clone();
        self.blocking(move |state_file| state_file.write_blocking(&state))
            .await
    }

    fn lock_blocking(&self, exclusive: bool) -> Result<File, DiskError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(DiskError::io(format!(
                "Failed to create storage state directory {parent:?}"
            )))?;
        }

        let lock_path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(DiskError::io(format!("Failed to open lock file {lock_path:?}")))?;

        if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        }
        .map_err(DiskError::io(format!("Failed to lock {lock_path:?}")))?;

        Ok(file)
    }

    fn read_blocking(&self) -> Result<StorageState, DiskError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StorageState::default())
            }
            Err(e) => {
                return Err(DiskError::Io {
                    context: format!("Failed to read storage state {:?}", self.path),
                    source: e,
                })
            }
        };

        toml::from_str(&contents).map_err(|source| DiskError::StateFormat {
            path: self.path.clone(),
            source,
        })
    }

    fn write_blocking(&self, state: &StorageState) -> Result<(), DiskError> {
        let contents = toml::to_string(state).map_err(DiskError::StateEncode)?;

        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut tmp = File::create(&tmp_path)
            .map_err(DiskError::io(format!("Failed to create {tmp_path:?}")))?;
        tmp.write_all(contents.as_bytes())
            .and_then(|()| tmp.sync_all())
            .map_err(DiskError::io(format!("Failed to write {tmp_path:?}")))?;

        std::fs::rename(&tmp_path, &self.path).map_err(DiskError::io(format!(
            "Failed to replace storage state {:?}",
            self.path
        )))
    }
}

/// QEMU `-readconfig` stanza attaching a partition as a virtio drive.
pub fn drive_stanza(partition: &PartitionInfo) -> String {
    format!(
        "\n[drive \"{}\"]\n  file = \"{}\"\n  format = \"raw\"\n  if = \"virtio\"\n",
        partition.label,
        partition.name.display(),
    )
}

/// Manages host block devices making up the storage pool, and the attachment
/// of pool partitions to VMs.
pub struct DiskManager {
    config: StorageConfig,
    vm_root: PathBuf,
    runner: Arc<dyn CommandRunner>,
    state_file: StateFile,

    /// Last inventory. Held across every mutation, serializing them within
    /// this process.
    inventory: Mutex<DiskInventory>,
}

impl std::fmt::Debug for DiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskManager")
            .field("state_file", &self.state_file.path)
            .field("vm_root", &self.vm_root)
            .finish_non_exhaustive()
    }
}

impl DiskManager {
    pub fn new(config: StorageConfig, vm_root: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        DiskManager {
            state_file: StateFile {
                path: config.config_file.clone(),
            },
            config,
            vm_root,
            runner,
            inventory: Mutex::new(DiskInventory::default()),
        }
    }

    fn vm_config_path(&self, vm_name: &str) -> PathBuf {
        self.vm_root.join(vm_name).join(format!("{vm_name}.conf"))
    }

    async fn root_disk(&self) -> Option<PathBuf> {
        let findmnt = Cmd::new(&self.config.findmnt_binary).args([
            "--noheadings",
            "--output",
            "SOURCE",
            "/",
        ]);
        let source = match run_checked(&*self.runner, &findmnt).await {
            Ok(output) => String::from_utf8_lossy(&output.stdout).trim().to_string(),
            Err(e) => {
                event!(Level::WARN, ?e, "Cannot determine root filesystem source");
                return None;
            }
        };

        let pkname = Cmd::new(&self.config.lsblk_binary)
            .args(["--noheadings", "--output", "PKNAME"])
            .arg(&source);
        match run_checked(&*self.runner, &pkname).await {
            Ok(output) => {
                let parent = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if parent.is_empty() {
                    Some(PathBuf::from(source))
                } else {
                    Some(Path::new("/dev").join(parent))
                }
            }
            Err(e) => {
                event!(Level::WARN, ?e, %source, "Cannot determine root disk");
                None
            }
        }
    }

    async fn scan(&self) -> Result<DiskInventory, DiskError> {
        let root_disk = self.root_disk().await;

        let lsblk = Cmd::new(&self.config.lsblk_binary).args([
            "--json",
            "--paths",
            "--bytes",
            "--output",
            "NAME,SIZE,TYPE,MOUNTPOINT,FSTYPE,PARTLABEL",
        ]);
        let output = run_checked(&*self.runner, &lsblk).await?;
        let listing: LsblkOutput =
            serde_json::from_slice(&output.stdout).map_err(DiskError::Inventory)?;

        Ok(DiskInventory::classify(
            &listing.blockdevices,
            root_disk.as_deref(),
            &self.config.partition_label_prefix,
        ))
    }

    /// Re-derive the inventory from the host.
    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    pub async fn set_state(&self) -> Result<DiskInventory, DiskError> {
        let mut cached = self.inventory.lock().await;
        *cached = self.scan().await?;
        Ok(cached.clone())
    }

    pub async fn list_disks(&self) -> Result<Vec<DiskInfo>, DiskError> {
        Ok(self.set_state().await?.all_disks)
    }

    pub async fn list_free_disks(&self) -> Result<Vec<DiskInfo>, DiskError> {
        Ok(self.set_state().await?.free_disks)
    }

    pub async fn list_pool_disks(&self) -> Result<Vec<DiskInfo>, DiskError> {
        Ok(self.set_state().await?.pool_disks)
    }

    /// Partition the free disk at `disk_index` into equally sized pool
    /// partitions of (at least) `partition_size_gb` GiB.
    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    pub async fn add_disk(
        &self,
        disk_index: usize,
        partition_size_gb: u64,
    ) -> Result<Vec<PartitionInfo>, DiskError> {
        let mut cached = self.inventory.lock().await;
        *cached = self.scan().await?;

        let disk = cached
            .free_disks
            .get(disk_index)
            .cloned()
            .ok_or(DiskError::IndexOutOfRange {
                index: disk_index,
                len: cached.free_disks.len(),
            })?;

        let capacity_gb = disk.size_bytes / GIB;
        if partition_size_gb == 0 || partition_size_gb > capacity_gb {
            return Err(DiskError::InvalidSize {
                size_gb: partition_size_gb,
                capacity_gb,
            });
        }

        let count = std::cmp::max(1, capacity_gb / partition_size_gb);
        let disk_base = disk
            .name
            .file_name()
            .map(|base| base.to_string_lossy().into_owned())
            .unwrap_or_default();

        event!(Level::INFO, disk = ?disk.name, count, partition_size_gb, "Partitioning disk for the storage pool");

        let parted = || Cmd::new(&self.config.parted_binary).arg("-s").arg(&disk.name);
        run_checked(&*self.runner, &parted().args(["mklabel", "gpt"])).await?;

        for i in 0..count {
            let label = format!("{}{}_{}", self.config.partition_label_prefix, disk_base, i);
            let start = i as f64 * 100.0 / count as f64;
            let end = (i + 1) as f64 * 100.0 / count as f64;
            let mkpart = parted().args([
                "mkpart".to_string(),
                label,
                format!("{start:.2}%"),
                format!("{end:.2}%"),
            ]);
            run_checked(&*self.runner, &mkpart).await?;
        }

        *cached = self.scan().await?;
        Ok(cached
            .pool_partitions
            .iter()
            .filter(|p| p.disk == disk.name)
            .cloned()
            .collect())
    }

    /// Wipe the pool disk at `disk_index`, detaching its partitions from any
    /// VM first.
    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    pub async fn remove_disk(&self, disk_index: usize) -> Result<(), DiskError> {
        let mut cached = self.inventory.lock().await;
        *cached = self.scan().await?;

        let disk = cached
            .pool_disks
            .get(disk_index)
            .cloned()
            .ok_or(DiskError::IndexOutOfRange {
                index: disk_index,
                len: cached.pool_disks.len(),
            })?;

        {
            let _lock = self.state_file.lock(true).await?;
            let mut state = self.state_file.read().await?;

            let mut detached = Vec::new();
            for (vm_name, partitions) in state.vm_disks.iter_mut() {
                partitions.retain(|p| {
                    if p.disk == disk.name {
                        detached.push((vm_name.clone(), p.clone()));
                        false
                    } else {
                        true
                    }
                });
            }
            state.vm_disks.retain(|_, partitions| !partitions.is_empty());

            if !detached.is_empty() {
                self.state_file.write(&state).await?;
            }

            for (vm_name, partition) in detached {
                event!(Level::INFO, %vm_name, partition = ?partition.name, "Detaching partition of removed disk");
                if let Err(e) = self.remove_stanza(&vm_name, &partition).await {
                    event!(Level::WARN, %vm_name, ?e, "Failed to remove drive from VM config");
                }
            }
        }

        let wipefs = Cmd::new(&self.config.wipefs_binary)
            .arg("-a")
            .arg(&disk.name);
        run_checked(&*self.runner, &wipefs).await?;

        *cached = self.scan().await?;
        Ok(())
    }

    pub async fn list_vm_disks(&self, vm_name: &str) -> Result<Vec<PartitionInfo>, DiskError> {
        let _lock = self.state_file.lock(false).await?;
        let state = self.state_file.read().await?;
        Ok(state.vm_disks.get(vm_name).cloned().unwrap_or_default())
    }

    pub async fn vm_disks(&self) -> Result<BTreeMap<String, Vec<PartitionInfo>>, DiskError> {
        let _lock = self.state_file.lock(false).await?;
        Ok(self.state_file.read().await?.vm_disks)
    }

    /// Attach the first available pool partition to the VM.
    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    pub async fn attach_disk_to_vm(&self, vm_name: &str) -> Result<PartitionInfo, DiskError> {
        let mut cached = self.inventory.lock().await;
        *cached = self.scan().await?;

        let _lock = self.state_file.lock(true).await?;
        let mut state = self.state_file.read().await?;

        let partition = cached
            .pool_partitions
            .iter()
            .find(|p| !state.is_attached(&p.name))
            .cloned()
            .ok_or(DiskError::NoPartitionsAvailable)?;

        state
            .vm_disks
            .entry(vm_name.to_string())
            .or_default()
            .push(partition.clone());
        self.state_file.write(&state).await?;

        if let Err(e) = self.append_stanza(vm_name, &partition).await {
            // Roll back the persisted mapping:
            if let Some(partitions) = state.vm_disks.get_mut(vm_name) {
                partitions.retain(|p| p.name != partition.name);
            }
            state.vm_disks.retain(|_, partitions| !partitions.is_empty());
            if let Err(rollback_err) = self.state_file.write(&state).await {
                event!(Level::ERROR, ?rollback_err, "Failed to roll back partition attachment");
            }
            return Err(e);
        }

        event!(Level::INFO, vm_name, partition = ?partition.name, "Attached partition");
        Ok(partition)
    }

    /// Detach a partition, given by device path or label, from the VM.
    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    pub async fn detach_disk_from_vm(&self, vm_name: &str, partition: &str) -> Result<(), DiskError> {
        let _cached = self.inventory.lock().await;

        let _lock = self.state_file.lock(true).await?;
        let mut state = self.state_file.read().await?;

        let not_attached = || DiskError::NotAttached {
            vm_name: vm_name.to_string(),
            partition: partition.to_string(),
        };

        let partitions = state.vm_disks.get_mut(vm_name).ok_or_else(not_attached)?;
        let pos = partitions
            .iter()
            .position(|p| p.name == Path::new(partition) || p.label == partition)
            .ok_or_else(not_attached)?;
        let detached = partitions.remove(pos);
        if partitions.is_empty() {
            state.vm_disks.remove(vm_name);
        }
        self.state_file.write(&state).await?;

        if let Err(e) = self.remove_stanza(vm_name, &detached).await {
            // Roll back the persisted mapping:
            let partitions = state.vm_disks.entry(vm_name.to_string()).or_default();
            let pos = pos.min(partitions.len());
            partitions.insert(pos, detached);
            if let Err(rollback_err) = self.state_file.write(&state).await {
                event!(Level::ERROR, ?rollback_err, "Failed to roll back partition detachment");
            }
            return Err(e);
        }

        event!(Level::INFO, vm_name, partition, "Detached partition");
        Ok(())
    }

    /// Forget every attachment of a deleted VM, returning its partitions to
    /// the pool.
    pub async fn release_vm_disks(&self, vm_name: &str) -> Result<Vec<PartitionInfo>, DiskError> {
        let _cached = self.inventory.lock().await;
        let _lock = self.state_file.lock(true).await?;
        let mut state = self.state_file.read().await?;

        let released = state.vm_disks.remove(vm_name).unwrap_or_default();
        if !released.is_empty() {
            self.state_file.write(&state).await?;
        }
        Ok(released)
    }

    /// Re-append drive stanzas missing from VM configs for persisted
    /// attachments. Returns the number of repaired stanzas.
    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    pub async fn reconcile_vm_configs(&self) -> Result<usize, DiskError> {
        let _cached = self.inventory.lock().await;
        let _lock = self.state_file.lock(false).await?;
        let state = self.state_file.read().await?;

        let mut repaired = 0;
        for (vm_name, partitions) in &state.vm_disks {
            let conf_path = self.vm_config_path(vm_name);
            let mut conf = match tokio::fs::read_to_string(&conf_path).await {
                Ok(conf) => conf,
                Err(e) => {
                    event!(Level::WARN, %vm_name, ?e, "Attached partitions reference a VM without config");
                    continue;
                }
            };

            let mut seen = HashSet::new();
            let mut changed = false;
            for partition in partitions {
                let stanza = drive_stanza(partition);
                if seen.insert(partition.name.clone()) && !conf.contains(&stanza) {
                    conf.push_str(&stanza);
                    changed = true;
                    repaired += 1;
                }
            }

            if changed {
                event!(Level::INFO, %vm_name, "Restoring missing drive stanzas");
                tokio::fs::write(&conf_path, conf)
                    .await
                    .map_err(DiskError::io(format!("Failed to write {conf_path:?}")))?;
            }
        }

        Ok(repaired)
    }

    async fn append_stanza(&self, vm_name: &str, partition: &PartitionInfo) -> Result<(), DiskError> {
        let conf_path = self.vm_config_path(vm_name);
        let mut conf = tokio::fs::read_to_string(&conf_path)
            .await
            .map_err(DiskError::io(format!("Failed to read VM config {conf_path:?}")))?;
        conf.push_str(&drive_stanza(partition));
        tokio::fs::write(&conf_path, conf)
            .await
            .map_err(DiskError::io(format!("Failed to write VM config {conf_path:?}")))
    }

    async fn remove_stanza(&self, vm_name: &str, partition: &PartitionInfo) -> Result<(), DiskError> {
        let conf_path = self.vm_config_path(vm_name);
        let conf = match tokio::fs::read_to_string(&conf_path).await {
            Ok(conf) => conf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                event!(Level::WARN, ?conf_path, "VM config vanished, nothing to detach from");
                return Ok(());
            }
            Err(e) => {
                return Err(DiskError::Io {
                    context: format!("Failed to read VM config {conf_path:?}"),
                    source: e,
                })
            }
        };

        let stanza = drive_stanza(partition);
        if !conf.contains(&stanza) {
            event!(Level::WARN, ?conf_path, partition = ?partition.name, "Drive stanza missing from VM config");
            return Ok(());
        }

        tokio::fs::write(&conf_path, conf.replacen(&stanza, "", 1))
            .await
            .map_err(DiskError::io(format!("Failed to write VM config {conf_path:?}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::exec::fake::{ok, ScriptedRunner};

    const DISK_25G: u64 = 25 * GIB;

    fn lsblk_json(partitioned_sdb: bool) -> String {
        let sdb_children = if partitioned_sdb {
            let parts: Vec<String> = (0..5)
                .map(|i| {
                    format!(
                        r#"{{"name":"/dev/sdb{}","size":{},"type":"part","mountpoint":null,"fstype":null,"partlabel":"igs_sdb_{}"}}"#,
                        i + 1,
                        5 * GIB,
                        i
                    )
                })
                .collect();
            format!(r#","children":[{}]"#, parts.join(","))
        } else {
            String::new()
        };

        format!(
            r#"{{"blockdevices":[
              {{"name":"/dev/sda","size":"{root}","type":"disk","mountpoint":null,"fstype":null,"partlabel":null,
                "children":[{{"name":"/dev/sda2","size":"{root}","type":"part","mountpoint":"/","fstype":"ext4","partlabel":null}}]}},
              {{"name":"/dev/sdb","size":{sdb},"type":"disk","mountpoint":null,"fstype":null,"partlabel":null{sdb_children}}},
              {{"name":"/dev/sdc","size":{sdc},"type":"disk","mountpoint":null,"fstype":"xfs","partlabel":null}},
              {{"name":"/dev/sr0","size":1024,"type":"rom","mountpoint":null,"fstype":null,"partlabel":null}}
            ]}}"#,
            root = 100 * GIB,
            sdb = DISK_25G,
            sdc = 10 * GIB,
        )
    }

    /// A host with a root disk, a 25 GiB disk `/dev/sdb` which becomes
    /// partitioned once `mkpart` ran, and a formatted disk `/dev/sdc`.
    fn host_runner() -> Arc<ScriptedRunner> {
        let partitioned = AtomicBool::new(false);
        Arc::new(ScriptedRunner::new(move |cmd| {
            if cmd.is("findmnt") {
                ok("/dev/sda2\n")
            } else if cmd.is("lsblk") && cmd.starts_with(&["--noheadings"]) {
                ok("sda\n")
            } else if cmd.is("lsblk") {
                ok(&lsblk_json(partitioned.load(Ordering::SeqCst)))
            } else if cmd.is("parted") && cmd.get_args().iter().any(|a| a == "mkpart") {
                partitioned.store(true, Ordering::SeqCst);
                ok("")
            } else if cmd.is("wipefs") {
                partitioned.store(false, Ordering::SeqCst);
                ok("")
            } else {
                ok("")
            }
        }))
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        vm_root: PathBuf,
        runner: Arc<ScriptedRunner>,
        disks: DiskManager,
    }

    fn fixture(runner: Arc<ScriptedRunner>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let vm_root = dir.path().join("vms");
        let config = StorageConfig {
            config_file: dir.path().join("storage").join("storage.toml"),
            ..Default::default()
        };
        let disks = DiskManager::new(config, vm_root.clone(), runner.clone());
        Fixture {
            _dir: dir,
            vm_root,
            runner,
            disks,
        }
    }

    async fn make_vm(fx: &Fixture, vm_name: &str) -> PathBuf {
        let vm_dir = fx.vm_root.join(vm_name);
        tokio::fs::create_dir_all(&vm_dir).await.unwrap();
        let conf = vm_dir.join(format!("{vm_name}.conf"));
        tokio::fs::write(&conf, "[machine]\n  type = \"q35\"\n")
            .await
            .unwrap();
        conf
    }

    #[test]
    fn classify_disks() {
        let listing: LsblkOutput = serde_json::from_str(&lsblk_json(true)).unwrap();
        let inventory =
            DiskInventory::classify(&listing.blockdevices, Some(Path::new("/dev/sda")), "igs_");

        let names = |disks: &[DiskInfo]| -> Vec<PathBuf> {
            disks.iter().map(|d| d.name.clone()).collect()
        };
        assert_eq!(inventory.root_disk.as_deref(), Some(Path::new("/dev/sda")));
        assert_eq!(
            names(&inventory.all_disks),
            vec![PathBuf::from("/dev/sdb"), PathBuf::from("/dev/sdc")]
        );
        assert!(inventory.free_disks.is_empty());
        assert_eq!(names(&inventory.pool_disks), vec![PathBuf::from("/dev/sdb")]);
        assert_eq!(inventory.pool_disks[0].num_partitions, 5);
        assert_eq!(inventory.pool_disks[0].free_space_gb, 0);
        assert_eq!(inventory.pool_partitions.len(), 5);
        assert_eq!(inventory.pool_partitions[0].label, "igs_sdb_0");
        assert_eq!(inventory.pool_partitions[0].disk, PathBuf::from("/dev/sdb"));
    }

    #[tokio::test]
    async fn add_disk_splits_into_equal_partitions() {
        let fx = fixture(host_runner());

        let free = fx.disks.list_free_disks().await.unwrap();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].name, PathBuf::from("/dev/sdb"));
        assert_eq!(free[0].free_space_gb, 25);

        let partitions = fx.disks.add_disk(0, 5).await.unwrap();
        assert_eq!(partitions.len(), 5);

        let mkparts: Vec<String> = fx
            .runner
            .commands()
            .into_iter()
            .filter(|c| c.contains("mkpart") || c.contains("mklabel"))
            .collect();
        assert_eq!(
            mkparts,
            vec![
                "parted -s /dev/sdb mklabel gpt",
                "parted -s /dev/sdb mkpart igs_sdb_0 0.00% 20.00%",
                "parted -s /dev/sdb mkpart igs_sdb_1 20.00% 40.00%",
                "parted -s /dev/sdb mkpart igs_sdb_2 40.00% 60.00%",
                "parted -s /dev/sdb mkpart igs_sdb_3 60.00% 80.00%",
                "parted -s /dev/sdb mkpart igs_sdb_4 80.00% 100.00%",
            ]
        );

        let pool = fx.disks.list_pool_disks().await.unwrap();
        assert_eq!(pool.len(), 1);
        assert!(fx.disks.list_free_disks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_disk_validates_arguments() {
        let fx = fixture(host_runner());

        assert!(matches!(
            fx.disks.add_disk(1, 5).await,
            Err(DiskError::IndexOutOfRange { index: 1, len: 1 })
        ));
        assert!(matches!(
            fx.disks.add_disk(0, 0).await,
            Err(DiskError::InvalidSize { .. })
        ));
        assert!(matches!(
            fx.disks.add_disk(0, 26).await,
            Err(DiskError::InvalidSize { capacity_gb: 25, .. })
        ));
        assert!(!fx.runner.commands().iter().any(|c| c.starts_with("parted")));
    }

    #[tokio::test]
    async fn attach_on_empty_pool_leaves_state_untouched() {
        let fx = fixture(host_runner());
        let conf = make_vm(&fx, "vm1").await;
        let before = tokio::fs::read(&conf).await.unwrap();

        assert!(matches!(
            fx.disks.attach_disk_to_vm("vm1").await,
            Err(DiskError::NoPartitionsAvailable)
        ));
        assert!(fx.disks.vm_disks().await.unwrap().is_empty());
        assert_eq!(tokio::fs::read(&conf).await.unwrap(), before);
    }

    #[tokio::test]
    async fn attach_then_detach_restores_config() {
        let fx = fixture(host_runner());
        let conf = make_vm(&fx, "vm1").await;
        let before = tokio::fs::read(&conf).await.unwrap();

        fx.disks.add_disk(0, 5).await.unwrap();

        let first = fx.disks.attach_disk_to_vm("vm1").await.unwrap();
        let second = fx.disks.attach_disk_to_vm("vm1").await.unwrap();
        assert_ne!(first.name, second.name);
        assert_eq!(
            fx.disks.list_vm_disks("vm1").await.unwrap(),
            vec![first.clone(), second.clone()]
        );

        let with_drives = tokio::fs::read_to_string(&conf).await.unwrap();
        assert!(with_drives.contains(&drive_stanza(&first)));
        assert!(with_drives.contains(&drive_stanza(&second)));

        // By label and by device path:
        fx.disks
            .detach_disk_from_vm("vm1", &second.label)
            .await
            .unwrap();
        fx.disks
            .detach_disk_from_vm("vm1", &first.name.display().to_string())
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(&conf).await.unwrap(), before);
        assert!(fx.disks.vm_disks().await.unwrap().is_empty());

        assert!(matches!(
            fx.disks.detach_disk_from_vm("vm1", &first.label).await,
            Err(DiskError::NotAttached { .. })
        ));
    }

    #[tokio::test]
    async fn attach_rolls_back_when_vm_config_is_missing() {
        let fx = fixture(host_runner());
        fx.disks.add_disk(0, 5).await.unwrap();

        assert!(matches!(
            fx.disks.attach_disk_to_vm("no-such-vm").await,
            Err(DiskError::Io { .. })
        ));
        assert!(fx.disks.vm_disks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_disk_cascades_detach() {
        let fx = fixture(host_runner());
        let conf = make_vm(&fx, "vm1").await;
        let before = tokio::fs::read(&conf).await.unwrap();

        fx.disks.add_disk(0, 5).await.unwrap();
        fx.disks.attach_disk_to_vm("vm1").await.unwrap();

        fx.disks.remove_disk(0).await.unwrap();

        assert!(fx.disks.vm_disks().await.unwrap().is_empty());
        assert_eq!(tokio::fs::read(&conf).await.unwrap(), before);
        assert!(fx
            .runner
            .commands()
            .contains(&"wipefs -a /dev/sdb".to_string()));
        assert_eq!(fx.disks.list_free_disks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn waiting_for_the_state_lock_keeps_the_runtime_going() {
        let fx = fixture(host_runner());

        // Another holder of the lock, as a second process would be:
        let lock_path = fx.disks.state_file.lock_path();
        std::fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
        let holder = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .unwrap();
        holder.lock_exclusive().unwrap();

        // On the single-threaded test runtime, the timer only fires if the
        // listing waits off the runtime thread:
        let listing = fx.disks.list_vm_disks("vm1");
        tokio::pin!(listing);
        tokio::select! {
            _ = &mut listing => panic!("listing completed while the lock was held"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => (),
        }

        drop(holder);
        assert!(listing.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconcile_restores_missing_stanzas() {
        let fx = fixture(host_runner());
        let conf = make_vm(&fx, "vm1").await;

        fx.disks.add_disk(0, 5).await.unwrap();
        let partition = fx.disks.attach_disk_to_vm("vm1").await.unwrap();

        // Simulate a crash between persisting the mapping and the config:
        tokio::fs::write(&conf, "[machine]\n").await.unwrap();

        assert_eq!(fx.disks.reconcile_vm_configs().await.unwrap(), 1);
        let repaired = tokio::fs::read_to_string(&conf).await.unwrap();
        assert!(repaired.contains(&drive_stanza(&partition)));

        assert_eq!(fx.disks.reconcile_vm_configs().await.unwrap(), 0);
    }
}
