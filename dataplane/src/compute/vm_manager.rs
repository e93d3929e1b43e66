use std::collections::HashMap;
use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{event, instrument, Level};
use uuid::Uuid;

use igs_rs::api::compute::{VmStatus, VmStatusFilter};
use igs_rs::api::network::MacAddr;
use igs_rs::config::ComputeConfig;

use crate::error::{IpError, MonitorError, NetworkError, VmError};
use crate::exec::{run_checked, Cmd, CommandRunner};
use crate::network::NetworkManager;
use crate::storage::DiskManager;

use super::cloud_init;
use super::distro::DistroManager;
use super::hypervisor::{HypervisorProcess, ProcessState};
use super::monitor::{query_guest_interfaces, select_guest_ipv4, MonitorConnection};
use super::vm::{VmEntry, VmRecord};

/// Map a monitor run state onto the VM status. Anything but `running`
/// means the guest does not execute.
fn status_from_monitor(state: &str) -> VmStatus {
    match state {
        "running" => VmStatus::Running,
        _ => VmStatus::Stopped,
    }
}

/// Substitute the VM's name and disk path into a boot config template.
pub fn render_boot_config(
    template: &str,
    name_token: &str,
    disk_token: &str,
    vm_name: &str,
    disk: &Path,
) -> String {
    template
        .replace(disk_token, &disk.to_string_lossy())
        .replace(name_token, vm_name)
}

/// Owns the VM table and drives every VM through its life cycle.
///
/// The table lock is only held to look up or insert entries. Each entry has
/// its own lock, held for the full duration of a transition, so operations on
/// one VM are serialized while different VMs proceed concurrently.
pub struct VmManager {
    config: ComputeConfig,
    runner: Arc<dyn CommandRunner>,
    network: Arc<NetworkManager>,
    disks: Arc<DiskManager>,
    distro: Arc<dyn DistroManager>,
    vms: Mutex<HashMap<Uuid, Arc<Mutex<VmEntry>>>>,
}

impl std::fmt::Debug for VmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmManager")
            .field("vm_root", &self.config.vm_root)
            .field("run_dir", &self.config.run_dir)
            .finish_non_exhaustive()
    }
}

impl VmManager {
    /// Create the manager and re-register every VM found under the VM root.
    pub async fn new(
        config: ComputeConfig,
        runner: Arc<dyn CommandRunner>,
        network: Arc<NetworkManager>,
        disks: Arc<DiskManager>,
        distro: Arc<dyn DistroManager>,
    ) -> Result<Self, VmError> {
        for dir in [&config.vm_root, &config.run_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(VmError::io(format!("creating {dir:?}")))?;
        }

        let manager = VmManager {
            config,
            runner,
            network,
            disks,
            distro,
            vms: Mutex::new(HashMap::new()),
        };

        let recovered = manager.recover().await?;
        event!(Level::INFO, recovered, vm_root = ?manager.config.vm_root, "Recovered VMs");

        Ok(manager)
    }

    pub fn monitor_socket(&self, name: Uuid) -> PathBuf {
        self.config.run_dir.join(format!("{name}.monitor.sock"))
    }

    pub fn agent_socket(&self, name: Uuid) -> PathBuf {
        self.config.run_dir.join(format!("{name}.agent.sock"))
    }

    async fn lookup(&self, vm_name: &str) -> Result<(Uuid, Arc<Mutex<VmEntry>>), VmError> {
        let name =
            Uuid::parse_str(vm_name).map_err(|_| VmError::NotFound(vm_name.to_string()))?;
        let entry = self
            .vms
            .lock()
            .await
            .get(&name)
            .cloned()
            .ok_or_else(|| VmError::NotFound(vm_name.to_string()))?;
        Ok((name, entry))
    }

    async fn snapshot(&self) -> Vec<Arc<Mutex<VmEntry>>> {
        self.vms.lock().await.values().cloned().collect()
    }

    async fn release_tap(&self, vm_name: &str) {
        if self.network.tap_of(vm_name).is_some() {
            self.network.deallocate_tap(vm_name).await;
        }
    }

    fn release_ip(&self, vm_name: &str) {
        match self.network.ip_manager().release_ip(vm_name) {
            Ok(_) | Err(IpError::NotLeased(_)) => (),
            Err(e) => event!(Level::WARN, vm_name, ?e, "Failed to release IP lease"),
        }
    }

    async fn remove_runtime_files(&self, name: Uuid) {
        for socket in [self.monitor_socket(name), self.agent_socket(name)] {
            match tokio::fs::remove_file(&socket).await {
                Ok(()) => (),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => event!(Level::WARN, ?socket, ?e, "Failed to remove socket"),
            }
        }
    }

    // ---------------------------------------------------------------------
    // Creation

    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    pub async fn create_vm(&self) -> Result<String, VmError> {
        self.distro.ensure().await?;

        let name = Uuid::new_v4();
        let vm_name = name.to_string();
        let vm_dir = self.config.vm_root.join(&vm_name);

        tokio::fs::create_dir(&vm_dir)
            .await
            .map_err(VmError::io(format!("creating VM directory {vm_dir:?}")))
            .map_err(|cause| VmError::CreateFailed {
                vm_name: vm_name.clone(),
                cause: Box::new(cause),
            })?;

        let mac = self.network.generate_mac();
        let record = match self.provision(name, mac).await {
            Ok(record) => record,
            Err(cause) => {
                self.discard(name, &vm_dir, mac).await;
                return Err(VmError::CreateFailed {
                    vm_name,
                    cause: Box::new(cause),
                });
            }
        };

        event!(
            Level::INFO,
            %vm_name,
            ip_address = ?record.ip_address,
            mac_address = %record.mac_address,
            "Created VM",
        );
        self.vms
            .lock()
            .await
            .insert(name, Arc::new(Mutex::new(VmEntry::new(record, VmStatus::Down))));

        Ok(vm_name)
    }

    async fn provision(&self, name: Uuid, mac: MacAddr) -> Result<VmRecord, VmError> {
        let vm_name = name.to_string();
        let mut record = VmRecord::new(name, &self.config.vm_root, mac);

        let create_disk = Cmd::new(&self.config.qemu_img_binary)
            .args(["create", "-f", "qcow2", "-F", "qcow2", "-b"])
            .arg(self.distro.image_path())
            .arg(&record.disk_location)
            .arg(&self.config.disk_size);
        run_checked(&*self.runner, &create_disk).await?;

        let template_path = &self.config.boot_config_template;
        let template = tokio::fs::read_to_string(template_path)
            .await
            .map_err(VmError::io(format!("reading boot config template {template_path:?}")))?;
        let boot_config = render_boot_config(
            &template,
            &self.config.template_name_token,
            &self.config.template_disk_token,
            &vm_name,
            &record.disk_location,
        );
        tokio::fs::write(&record.boot_config, boot_config)
            .await
            .map_err(VmError::io(format!("writing {:?}", record.boot_config)))?;

        let public_key =
            cloud_init::generate_ssh_keypair(&record.vm_dir, self.config.ssh_key_algorithm).await?;

        self.network
            .ip_manager()
            .acquire_ip(&vm_name)
            .map_err(NetworkError::from)?;
        let network_config = self.network.guest_network_config(&vm_name, mac)?;
        record.ip_address = network_config.ip();

        cloud_init::write_seed(
            &record.vm_dir,
            &vm_name,
            &self.config.guest_user,
            &public_key,
            &network_config,
        )
        .await?;
        cloud_init::build_seed_iso(&*self.runner, &self.config.genisoimage_binary, &record.vm_dir)
            .await?;

        record.tap_intf = Some(self.network.allocate_tap(&vm_name).await?);

        Ok(record)
    }

    /// Undo a partial creation. Failures are logged.
    async fn discard(&self, name: Uuid, vm_dir: &Path, mac: MacAddr) {
        let vm_name = name.to_string();
        self.release_tap(&vm_name).await;
        self.release_ip(&vm_name);
        self.network.forget_mac(mac);

        if let Err(e) = tokio::fs::remove_dir_all(vm_dir).await {
            event!(Level::WARN, ?vm_dir, ?e, "Failed to remove partially created VM");
        }
    }

    // ---------------------------------------------------------------------
    // Power state transitions

    fn hypervisor_args(&self, record: &VmRecord, tap: &str) -> Result<Vec<OsString>, VmError> {
        let mut vars = HashMap::new();
        vars.insert("vm_name".to_string(), record.name.to_string());
        vars.insert("vm_dir".to_string(), record.vm_dir.display().to_string());
        vars.insert("boot_config".to_string(), record.boot_config.display().to_string());
        vars.insert("disk_image".to_string(), record.disk_location.display().to_string());
        vars.insert(
            "monitor_socket".to_string(),
            self.monitor_socket(record.name).display().to_string(),
        );
        vars.insert(
            "agent_socket".to_string(),
            self.agent_socket(record.name).display().to_string(),
        );
        vars.insert("tap_intf".to_string(), tap.to_string());
        vars.insert("mac_address".to_string(), record.mac_address.to_string());
        vars.insert("cloud_init_iso".to_string(), record.seed_iso().display().to_string());

        self.config
            .qemu_args
            .iter()
            .map(|arg| {
                strfmt::strfmt(arg, &vars)
                    .map(OsString::from)
                    .map_err(VmError::Template)
            })
            .collect()
    }

    /// Bring up the tap device and the hypervisor. The tap is released again
    /// if the hypervisor does not come up.
    async fn launch(
        &self,
        record: &mut VmRecord,
    ) -> Result<(HypervisorProcess, PathBuf, MonitorConnection), VmError> {
        let vm_name = record.name.to_string();
        let tap = self.network.allocate_tap(&vm_name).await?;
        record.tap_intf = Some(tap.clone());

        match self.launch_hypervisor(record, &tap).await {
            Ok(launched) => Ok(launched),
            Err(e) => {
                record.tap_intf = None;
                self.release_tap(&vm_name).await;
                Err(e)
            }
        }
    }

    async fn launch_hypervisor(
        &self,
        record: &VmRecord,
        tap: &str,
    ) -> Result<(HypervisorProcess, PathBuf, MonitorConnection), VmError> {
        let args = self.hypervisor_args(record, tap)?;
        let (mut process, pty) = HypervisorProcess::spawn(
            &self.config.qemu_binary,
            &args,
            self.config.serial_handshake_timeout,
        )
        .await?;

        match MonitorConnection::connect(
            &self.monitor_socket(record.name),
            self.config.monitor_connect_timeout,
            self.config.monitor_command_delay,
            self.config.monitor_read_strategy,
        )
        .await
        {
            Ok(conn) => Ok((process, pty, conn)),
            Err(e) => {
                process.kill().await;
                Err(e.into())
            }
        }
    }

    /// Mark the VM down once its hypervisor process exits, unless the entry
    /// has moved on to another generation in the meantime.
    fn watch_exit(
        &self,
        entry: &Arc<Mutex<VmEntry>>,
        generation: u64,
        mut exits: watch::Receiver<ProcessState>,
    ) {
        let entry: Weak<Mutex<VmEntry>> = Arc::downgrade(entry);
        let network = self.network.clone();

        tokio::spawn(async move {
            if exits
                .wait_for(|state| *state != ProcessState::Running)
                .await
                .is_err()
            {
                return;
            }
            let state = *exits.borrow();

            let Some(entry) = entry.upgrade() else {
                return;
            };
            let mut guard = entry.lock().await;
            let entry = &mut *guard;
            if entry.removed || entry.generation != generation {
                return;
            }

            entry.process = None;
            let vm_name = entry.name();

            if entry.status.is_live() {
                event!(
                    Level::WARN,
                    %vm_name,
                    ?state,
                    "Hypervisor exited while the VM was live, marking it down",
                );
                entry.status = VmStatus::Down;
                entry.record.hv_conn = None;
                entry.record.serial_conn = None;
                if entry.record.tap_intf.take().is_some() && network.tap_of(&vm_name).is_some() {
                    network.deallocate_tap(&vm_name).await;
                }
            } else {
                event!(Level::INFO, %vm_name, ?state, "Lingering hypervisor process exited");
            }
        });
    }

    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    pub async fn start_vm(&self, vm_name: &str) -> Result<String, VmError> {
        let (_, entry_arc) = self.lookup(vm_name).await?;
        let mut guard = entry_arc.lock().await;
        let entry = &mut *guard;

        if entry.removed {
            return Err(VmError::NotFound(vm_name.to_string()));
        }
        if entry.status != VmStatus::Down {
            return Err(VmError::InvalidState {
                vm_name: vm_name.to_string(),
                status: entry.status,
                operation: "start",
            });
        }
        if let Some(process) = entry.lingering_process() {
            return Err(VmError::Lingering {
                vm_name: vm_name.to_string(),
                pid: process.pid(),
            });
        }

        let (process, pty, conn) = self
            .launch(&mut entry.record)
            .await
            .map_err(|cause| VmError::StartFailed {
                vm_name: vm_name.to_string(),
                cause: Box::new(cause),
            })?;

        entry.generation += 1;
        self.watch_exit(&entry_arc, entry.generation, process.subscribe());

        event!(Level::INFO, vm_name, pid = ?process.pid(), ?pty, "Started VM");
        entry.status = VmStatus::Running;
        entry.record.hv_conn = Some(conn);
        entry.record.serial_conn = Some(pty);
        entry.process = Some(process);

        Ok(vm_name.to_string())
    }

    /// Press the guest's power button. The VM is marked down and its tap
    /// device released right away. Its IP lease is kept until the VM is
    /// deleted, so a later start hands out the same address. The hypervisor
    /// process may linger until the guest has powered off.
    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    pub async fn shutdown_vm(&self, vm_name: &str) -> Result<String, VmError> {
        let (_, entry_arc) = self.lookup(vm_name).await?;
        let mut guard = entry_arc.lock().await;
        let entry = &mut *guard;

        if entry.removed {
            return Err(VmError::NotFound(vm_name.to_string()));
        }
        if !entry.status.is_live() {
            return Err(VmError::InvalidState {
                vm_name: vm_name.to_string(),
                status: entry.status,
                operation: "shut down",
            });
        }

        let conn = entry
            .record
            .hv_conn
            .as_mut()
            .ok_or_else(|| VmError::NotRunning(vm_name.to_string()))?;
        // A paused guest cannot react to the ACPI power button:
        if entry.status == VmStatus::Stopped {
            conn.command("cont").await?;
        }
        conn.command("system_powerdown").await?;

        entry.status = VmStatus::Down;
        entry.record.hv_conn = None;
        entry.record.serial_conn = None;
        entry.record.tap_intf = None;
        self.release_tap(vm_name).await;

        match entry.lingering_process() {
            Some(process) => event!(
                Level::INFO,
                vm_name,
                pid = ?process.pid(),
                "Guest powering down, hypervisor process lingers until it exits",
            ),
            None => event!(Level::INFO, vm_name, "Shut down VM"),
        }

        Ok(vm_name.to_string())
    }

    /// Pause the guest.
    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    pub async fn stop_vm(&self, vm_name: &str) -> Result<String, VmError> {
        self.pause_transition(vm_name, VmStatus::Running, VmStatus::Stopped, "stop", "stop")
            .await
    }

    /// Continue a paused guest.
    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    pub async fn resume_vm(&self, vm_name: &str) -> Result<String, VmError> {
        self.pause_transition(vm_name, VmStatus::Stopped, VmStatus::Running, "cont", "resume")
            .await
    }

    async fn pause_transition(
        &self,
        vm_name: &str,
        from: VmStatus,
        to: VmStatus,
        command: &str,
        operation: &'static str,
    ) -> Result<String, VmError> {
        let (_, entry_arc) = self.lookup(vm_name).await?;
        let mut guard = entry_arc.lock().await;
        let entry = &mut *guard;

        if entry.removed {
            return Err(VmError::NotFound(vm_name.to_string()));
        }
        if entry.status != from {
            return Err(VmError::InvalidState {
                vm_name: vm_name.to_string(),
                status: entry.status,
                operation,
            });
        }

        entry
            .record
            .hv_conn
            .as_mut()
            .ok_or_else(|| VmError::NotRunning(vm_name.to_string()))?
            .command(command)
            .await?;
        entry.status = to;

        event!(Level::INFO, vm_name, status = %to, "VM status changed");
        Ok(vm_name.to_string())
    }

    // ---------------------------------------------------------------------
    // Deletion

    /// Tear down a VM in any state and forget it. Teardown steps after the
    /// hypervisor is gone never fail the deletion; their errors are logged.
    #[instrument(skip(self), err(Debug, level = Level::WARN))]
    pub async fn delete_vm(&self, vm_name: &str) -> Result<String, VmError> {
        let (name, entry_arc) = self.lookup(vm_name).await?;
        let mut guard = entry_arc.lock().await;
        let entry = &mut *guard;

        if entry.removed {
            return Err(VmError::NotFound(vm_name.to_string()));
        }

        let grace = self.config.shutdown_grace;

        if entry.status.is_live() {
            if let Some(conn) = entry.record.hv_conn.as_mut() {
                if entry.status == VmStatus::Stopped {
                    if let Err(e) = conn.command("cont").await {
                        event!(Level::WARN, vm_name, ?e, "Failed to resume VM before powerdown");
                    }
                }
                if let Err(e) = conn.command("system_powerdown").await {
                    event!(Level::WARN, vm_name, ?e, "Failed to request guest powerdown");
                }
            }
        }

        if let Some(mut process) = entry.process.take() {
            if process.is_running() && !process.wait_exit(grace).await {
                event!(
                    Level::WARN,
                    vm_name,
                    pid = ?process.pid(),
                    ?grace,
                    "Guest did not power off in time, terminating hypervisor",
                );
                process.terminate(grace).await;
            }
        } else if let Some(conn) = entry.record.hv_conn.as_mut() {
            // Recovered VM without a process handle. The hypervisor closes
            // the monitor when it exits:
            if !conn.wait_closed(grace).await {
                event!(Level::WARN, vm_name, ?grace, "Guest did not power off in time, quitting hypervisor");
                if let Err(e) = conn.command("quit").await {
                    event!(Level::DEBUG, vm_name, ?e, "Monitor gone after quit");
                }
            }
        }

        entry.status = VmStatus::Down;
        entry.record.hv_conn = None;
        entry.record.serial_conn = None;
        entry.record.tap_intf = None;

        self.release_tap(vm_name).await;
        self.release_ip(vm_name);
        self.network.forget_mac(entry.record.mac_address);

        if self.config.release_disks_on_delete {
            match self.disks.release_vm_disks(vm_name).await {
                Ok(released) if !released.is_empty() => {
                    event!(Level::INFO, vm_name, released = released.len(), "Released VM partitions")
                }
                Ok(_) => (),
                Err(e) => event!(Level::WARN, vm_name, ?e, "Failed to release VM partitions"),
            }
        }

        if let Err(e) = tokio::fs::remove_dir_all(&entry.record.vm_dir).await {
            event!(Level::WARN, vm_dir = ?entry.record.vm_dir, ?e, "Failed to remove VM directory");
        }
        self.remove_runtime_files(name).await;

        entry.removed = true;
        entry.generation += 1;
        drop(guard);

        self.vms.lock().await.remove(&name);
        event!(Level::INFO, vm_name, "Deleted VM");

        Ok(vm_name.to_string())
    }

    // ---------------------------------------------------------------------
    // Queries

    pub async fn list_vms(&self, filter: VmStatusFilter) -> Vec<String> {
        let mut names = Vec::new();
        for entry in self.snapshot().await {
            let entry = entry.lock().await;
            if !entry.removed && filter.matches(entry.status) {
                names.push(entry.name());
            }
        }
        names.sort();
        names
    }

    pub async fn status_of(&self, vm_name: &str) -> Result<VmStatus, VmError> {
        let (_, entry) = self.lookup(vm_name).await?;
        let entry = entry.lock().await;
        if entry.removed {
            return Err(VmError::NotFound(vm_name.to_string()));
        }
        Ok(entry.status)
    }

    /// Ask the hypervisor for the guest's run state.
    pub async fn vm_status(&self, vm_name: &str) -> Result<String, VmError> {
        let (_, entry) = self.lookup(vm_name).await?;
        let mut entry = entry.lock().await;
        if entry.removed {
            return Err(VmError::NotFound(vm_name.to_string()));
        }

        let conn = entry
            .record
            .hv_conn
            .as_mut()
            .ok_or_else(|| VmError::NotRunning(vm_name.to_string()))?;
        Ok(conn.status().await?)
    }

    pub async fn serial_console_path(&self, vm_name: &str) -> Result<PathBuf, VmError> {
        let (_, entry) = self.lookup(vm_name).await?;
        let entry = entry.lock().await;
        if entry.removed {
            return Err(VmError::NotFound(vm_name.to_string()));
        }

        match (&entry.record.serial_conn, entry.status.is_live()) {
            (Some(pty), true) => Ok(pty.clone()),
            _ => Err(VmError::NotRunning(vm_name.to_string())),
        }
    }

    /// The address leased to the VM.
    pub async fn vm_ip(&self, vm_name: &str) -> Result<Ipv4Addr, VmError> {
        self.status_of(vm_name).await?;
        Ok(self.network.get_ip(vm_name)?)
    }

    /// The address the guest reports through its agent.
    #[instrument(skip(self), err(Debug, level = Level::DEBUG))]
    pub async fn guest_ip(&self, vm_name: &str) -> Result<Ipv4Addr, VmError> {
        let (name, entry) = self.lookup(vm_name).await?;
        {
            let entry = entry.lock().await;
            if entry.removed {
                return Err(VmError::NotFound(vm_name.to_string()));
            }
            if !entry.status.is_live() {
                return Err(VmError::NotRunning(vm_name.to_string()));
            }
        }

        let interfaces = query_guest_interfaces(&self.agent_socket(name), self.config.agent_timeout)
            .await
            .map_err(|source| VmError::AgentUnreachable {
                vm_name: vm_name.to_string(),
                source,
            })?;

        let ip_manager = self.network.ip_manager();
        select_guest_ipv4(&interfaces, |addr| ip_manager.contains(addr))
            .ok_or_else(|| VmError::NoGuestAddress(vm_name.to_string()))
    }

    pub async fn hypervisor_pid(&self, vm_name: &str) -> Option<u32> {
        let (_, entry) = self.lookup(vm_name).await.ok()?;
        let entry = entry.lock().await;
        let pid = entry.process.as_ref().and_then(|process| process.pid());
        pid
    }

    /// VMs which were shut down but whose hypervisor process has not exited.
    pub async fn lingering_vms(&self) -> Vec<(String, Option<u32>)> {
        let mut lingering = Vec::new();
        for entry in self.snapshot().await {
            let entry = entry.lock().await;
            if let Some(process) = entry.lingering_process() {
                lingering.push((entry.name(), process.pid()));
            }
        }
        lingering.sort();
        lingering
    }

    // ---------------------------------------------------------------------
    // Recovery

    /// Compare the status of every live VM with what its hypervisor reports,
    /// and mark VMs whose monitor is gone as down. Returns the number of VMs
    /// whose status changed.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> usize {
        let mut changed = 0;

        for entry_arc in self.snapshot().await {
            let mut guard = entry_arc.lock().await;
            let entry = &mut *guard;
            if entry.removed || !entry.status.is_live() {
                continue;
            }
            let vm_name = entry.name();

            let reported = match entry.record.hv_conn.as_mut() {
                Some(conn) => conn.status().await.map(|state| status_from_monitor(&state)),
                None => Err(MonitorError::Closed),
            };

            match reported {
                Ok(status) if status == entry.status => (),
                Ok(status) => {
                    event!(Level::WARN, %vm_name, recorded = %entry.status, reported = %status, "Correcting VM status");
                    entry.status = status;
                    changed += 1;
                }
                Err(e) => {
                    event!(Level::WARN, %vm_name, ?e, "Monitor unreachable, marking VM down");
                    entry.status = VmStatus::Down;
                    entry.record.hv_conn = None;
                    entry.record.serial_conn = None;
                    entry.record.tap_intf = None;
                    self.release_tap(&vm_name).await;
                    changed += 1;
                }
            }
        }

        changed
    }

    async fn recover(&self) -> Result<usize, VmError> {
        let vm_root = &self.config.vm_root;
        let mut dir = tokio::fs::read_dir(vm_root)
            .await
            .map_err(VmError::io(format!("reading {vm_root:?}")))?;

        let mut recovered = 0;
        while let Some(dirent) = dir
            .next_entry()
            .await
            .map_err(VmError::io(format!("reading {vm_root:?}")))?
        {
            let Some(name) = dirent
                .file_name()
                .to_str()
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                event!(Level::WARN, path = ?dirent.path(), "Ignoring foreign entry in VM root");
                continue;
            };
            if !dirent.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }

            let entry = self.recover_vm(name).await;
            event!(
                Level::INFO,
                vm_name = %name,
                status = %entry.status,
                ip_address = ?entry.record.ip_address,
                "Recovered VM",
            );
            self.vms
                .lock()
                .await
                .insert(name, Arc::new(Mutex::new(entry)));
            recovered += 1;
        }

        Ok(recovered)
    }

    async fn recover_vm(&self, name: Uuid) -> VmEntry {
        let vm_name = name.to_string();
        let network_config = self.config.vm_root.join(&vm_name).join(cloud_init::NETWORK_CONFIG_FILE);

        let mac = match self.network.get_vm_mac(&network_config).await {
            Some(mac) => {
                if !self.network.register_mac(mac) {
                    event!(Level::WARN, %vm_name, %mac, "MAC address recorded for more than one VM");
                }
                mac
            }
            None => {
                event!(Level::WARN, %vm_name, "No network-config, assigning a fresh MAC address");
                self.network.generate_mac()
            }
        };

        let mut record = VmRecord::new(name, &self.config.vm_root, mac);

        if let Some(ip) = self.network.get_vm_ip(&network_config).await {
            match self.network.ip_manager().recover(&vm_name, ip) {
                Ok(_) => record.ip_address = Some(ip),
                Err(e) => event!(Level::WARN, %vm_name, %ip, ?e, "Cannot re-establish IP lease"),
            }
        }

        let mut status = VmStatus::Down;
        let monitor_socket = self.monitor_socket(name);

        if tokio::fs::try_exists(&monitor_socket).await.unwrap_or(false) {
            let conn = MonitorConnection::connect(
                &monitor_socket,
                Duration::ZERO,
                self.config.monitor_command_delay,
                self.config.monitor_read_strategy,
            )
            .await;

            match conn {
                Ok(mut conn) => match conn.status().await {
                    Ok(state) => {
                        status = status_from_monitor(&state);
                        record.serial_conn = conn.serial_pty().await.ok().flatten();
                        match self.network.allocate_tap(&vm_name).await {
                            Ok(tap) => record.tap_intf = Some(tap),
                            Err(e) => event!(Level::WARN, %vm_name, ?e, "Cannot re-register tap device"),
                        }
                        record.hv_conn = Some(conn);
                    }
                    Err(e) => event!(Level::WARN, %vm_name, ?e, "Monitor did not report a status"),
                },
                Err(e) => {
                    event!(Level::DEBUG, %vm_name, ?e, "Stale monitor socket");
                    self.remove_runtime_files(name).await;
                }
            }
        }

        VmEntry::new(record, status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_config_tokens_are_substituted() {
        let template = "[machine]\n  type = \"q35\"\n  accel = \"kvm\"\n\n\
                        [name]\n  guest = \"GNAME\"\n\n\
                        [drive \"disk0\"]\n  file = \"FPATH\"\n  format = \"qcow2\"\n  if = \"virtio\"\n";
        let rendered = render_boot_config(
            template,
            "GNAME",
            "FPATH",
            "0b6f2a0e-8d8c-4c1e-9a59-3d0f7d9d7a11",
            Path::new("/IGS/compute/vms/0b6f2a0e-8d8c-4c1e-9a59-3d0f7d9d7a11/disk.qcow2"),
        );

        assert!(rendered.contains("guest = \"0b6f2a0e-8d8c-4c1e-9a59-3d0f7d9d7a11\""));
        assert!(rendered
            .contains("file = \"/IGS/compute/vms/0b6f2a0e-8d8c-4c1e-9a59-3d0f7d9d7a11/disk.qcow2\""));
        assert!(!rendered.contains("GNAME"));
        assert!(!rendered.contains("FPATH"));
    }

    #[test]
    fn monitor_states() {
        assert_eq!(status_from_monitor("running"), VmStatus::Running);
        assert_eq!(status_from_monitor("paused"), VmStatus::Stopped);
        assert_eq!(status_from_monitor("suspended"), VmStatus::Stopped);
    }
}
