use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use uuid::Uuid;

use igs_dataplane::compute::{BaseImage, DistroManager, VmManager};
use igs_dataplane::error::VmError;
use igs_dataplane::exec::{Cmd, CommandRunner};
use igs_dataplane::network::NetworkManager;
use igs_dataplane::storage::DiskManager;
use igs_rs::api::compute::{VmStatus, VmStatusFilter};
use igs_rs::config::{
    ComputeConfig, MonitorReadStrategy, NetworkConfig, SshKeyAlgorithm, StorageConfig,
};
use igs_rs::error::ErrorKind;

const FAKE_QEMU: &str = "\
echo 'QEMU emulator version 8.2.2'
echo 'char device redirected to /dev/pts/99 (label serial0)' >&2
while :; do sleep 0.1; done
";

const BOOT_TEMPLATE: &str = "\
[name]
  guest = \"GNAME\"

[drive \"disk0\"]
  file = \"FPATH\"
  format = \"qcow2\"
";

fn ok(stdout: &str) -> Output {
    Output {
        status: ExitStatus::from_raw(0),
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

fn fail(code: i32, stderr: &str) -> Output {
    Output {
        status: ExitStatus::from_raw(code << 8),
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// Stands in for the host tools: `qemu-img` and `genisoimage` produce their
/// output files, network commands succeed. The `broken` tool exits with an
/// error instead.
#[derive(Default)]
struct FakeTools {
    log: Mutex<Vec<String>>,
    broken: Option<&'static str>,
}

impl FakeTools {
    fn ran(&self, prefix: &str) -> bool {
        self.log.lock().unwrap().iter().any(|c| c.starts_with(prefix))
    }
}

#[async_trait]
impl CommandRunner for FakeTools {
    async fn output(&self, cmd: &Cmd) -> std::io::Result<Output> {
        self.log.lock().unwrap().push(cmd.to_string());
        let args = cmd.get_args();

        if self.broken.is_some_and(|tool| cmd.is(tool)) {
            return Ok(fail(2, "I/O error"));
        }

        if cmd.is("qemu-img") && cmd.starts_with(&["info"]) {
            let image = args[args.len() - 1].to_string_lossy();
            return Ok(ok(&format!(
                r#"{{"filename": "{image}", "format": "qcow2", "virtual-size": 2361393152, "dirty-flag": false}}"#
            )));
        }

        if cmd.is("qemu-img") && cmd.starts_with(&["create"]) {
            std::fs::write(&args[args.len() - 2], b"QFI\xfb")?;
            return Ok(ok(""));
        }

        if cmd.is("genisoimage") {
            if let Some(pos) = args.iter().position(|a| a == "-output") {
                std::fs::write(&args[pos + 1], b"CD001")?;
            }
            return Ok(ok(""));
        }

        if cmd.is("ip") && cmd.starts_with(&["link", "show"]) {
            return Ok(fail(1, "Device does not exist."));
        }

        Ok(ok(""))
    }
}

/// Serve a minimal human monitor on `path`, tracking the pause state per
/// connection.
fn fake_monitor(path: &Path) -> JoinHandle<()> {
    let listener = UnixListener::bind(path).unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };

            tokio::spawn(async move {
                let (rx, mut tx) = stream.into_split();
                let mut lines = BufReader::new(rx).lines();
                let mut paused = false;

                let banner = "QEMU 8.2.2 monitor - type 'help' for more information\r\n(qemu) ";
                if tx.write_all(banner.as_bytes()).await.is_err() {
                    return;
                }

                while let Ok(Some(line)) = lines.next_line().await {
                    let command = line.trim();
                    let mut reply = format!("{command}\r\n");
                    match command {
                        "info status" if paused => reply.push_str("VM status: paused\r\n"),
                        "info status" => reply.push_str("VM status: running\r\n"),
                        "info chardev" => reply.push_str(
                            "parallel0: filename=null\r\nserial0: filename=pty:/dev/pts/99\r\n",
                        ),
                        "stop" => paused = true,
                        "cont" => paused = false,
                        "quit" => return,
                        _ => (),
                    }
                    reply.push_str("(qemu) ");
                    if tx.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    })
}

struct Harness {
    root: TempDir,
    tools: Arc<FakeTools>,
    monitor_reads: MonitorReadStrategy,
    network: Arc<NetworkManager>,
    vms: VmManager,
}

impl Harness {
    async fn new(with_base_image: bool) -> Harness {
        Self::with(with_base_image, FakeTools::default(), MonitorReadStrategy::Prompt).await
    }

    async fn with(
        with_base_image: bool,
        tools: FakeTools,
        monitor_reads: MonitorReadStrategy,
    ) -> Harness {
        let root = tempfile::tempdir().unwrap();

        let base_image = root.path().join("base.qcow2");
        if with_base_image {
            std::fs::write(&base_image, b"QFI\xfb").unwrap();
        }
        std::fs::write(root.path().join("micro.conf"), BOOT_TEMPLATE).unwrap();
        std::fs::write(root.path().join("fake-qemu.sh"), FAKE_QEMU).unwrap();

        let tools = Arc::new(tools);
        let (network, vms) = Self::managers(root.path(), tools.clone(), monitor_reads).await;

        Harness {
            root,
            tools,
            monitor_reads,
            network,
            vms,
        }
    }

    /// Construct a fresh set of managers over the harness' directories, as a
    /// restarted dataplane would.
    async fn managers(
        root: &Path,
        tools: Arc<FakeTools>,
        monitor_reads: MonitorReadStrategy,
    ) -> (Arc<NetworkManager>, VmManager) {
        // A fixed delay per command is slow, keep it short:
        let monitor_command_delay = match monitor_reads {
            MonitorReadStrategy::FixedDelay => Duration::from_millis(100),
            MonitorReadStrategy::Prompt => Duration::from_secs(2),
        };
        let config = ComputeConfig {
            vm_root: root.join("vms"),
            run_dir: root.join("run"),
            base_image: root.join("base.qcow2"),
            boot_config_template: root.join("micro.conf"),
            // Running the script through the shell avoids executing a file
            // that was just written:
            qemu_binary: PathBuf::from("/bin/sh"),
            qemu_args: [
                root.join("fake-qemu.sh").display().to_string().as_str(),
                "-name",
                "{vm_name}",
                "-readconfig",
                "{boot_config}",
                "-monitor",
                "unix:{monitor_socket},server,nowait",
                "-netdev",
                "tap,id=net0,ifname={tap_intf},script=no,downscript=no",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            ssh_key_algorithm: SshKeyAlgorithm::Ed25519,
            monitor_read_strategy: monitor_reads,
            monitor_command_delay,
            monitor_connect_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_millis(200),
            ..ComputeConfig::default()
        };

        let runner: Arc<dyn CommandRunner> = tools;
        let network = Arc::new(NetworkManager::new(NetworkConfig::default(), runner.clone()));
        let disks = Arc::new(DiskManager::new(
            StorageConfig {
                config_file: root.join("storage.toml"),
                ..StorageConfig::default()
            },
            config.vm_root.clone(),
            runner.clone(),
        ));
        let distro: Arc<dyn DistroManager> = Arc::new(BaseImage::new(
            config.base_image.clone(),
            None,
            config.qemu_img_binary.clone(),
            runner.clone(),
        ));

        let vms = VmManager::new(config, runner, network.clone(), disks, distro)
            .await
            .unwrap();
        (network, vms)
    }

    fn vm_root(&self) -> PathBuf {
        self.root.path().join("vms")
    }

    fn monitor(&self, vm_name: &str) -> JoinHandle<()> {
        fake_monitor(&self.vms.monitor_socket(Uuid::parse_str(vm_name).unwrap()))
    }

    fn vm_root_entries(&self) -> usize {
        std::fs::read_dir(self.vm_root()).unwrap().count()
    }
}

async fn wait_for_status(vms: &VmManager, vm_name: &str, status: VmStatus) {
    for _ in 0..100 {
        if matches!(vms.status_of(vm_name).await, Ok(s) if s == status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("VM {vm_name} never reached {status}");
}

fn kill_9(pid: u32) {
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_start_kill_delete() {
    let h = Harness::new(true).await;
    let free_before = h.network.ip_manager().free_count();

    let vm = h.vms.create_vm().await.unwrap();
    let vm_dir = h.vm_root().join(&vm);
    for file in [
        format!("{vm}.qcow2"),
        format!("{vm}.conf"),
        "id_rsa".to_string(),
        "id_rsa.pub".to_string(),
        "user-data".to_string(),
        "meta-data".to_string(),
        "network-config".to_string(),
        "cloud-init.iso".to_string(),
    ] {
        assert!(vm_dir.join(&file).is_file(), "{file} missing");
    }
    let key_mode = std::fs::metadata(vm_dir.join("id_rsa")).unwrap().permissions().mode();
    assert_eq!(key_mode & 0o777, 0o600);

    let boot_config = std::fs::read_to_string(vm_dir.join(format!("{vm}.conf"))).unwrap();
    assert!(boot_config.contains(&format!("guest = \"{vm}\"")));
    assert!(boot_config.contains(&format!("{vm}.qcow2")));

    assert!(h.tools.ran("qemu-img create -f qcow2 -F qcow2 -b"));
    assert_eq!(h.network.ip_manager().free_count(), free_before - 1);
    assert_eq!(h.vms.list_vms(VmStatusFilter::Down).await, vec![vm.clone()]);
    assert_eq!(
        h.vms.vm_status(&vm).await.unwrap_err().kind(),
        ErrorKind::PreconditionFailed
    );

    let monitor = h.monitor(&vm);
    h.vms.start_vm(&vm).await.unwrap();
    assert_eq!(h.vms.status_of(&vm).await.unwrap(), VmStatus::Running);
    assert_eq!(h.vms.vm_status(&vm).await.unwrap(), "running");
    assert_eq!(
        h.vms.serial_console_path(&vm).await.unwrap(),
        PathBuf::from("/dev/pts/99")
    );
    assert_eq!(h.vms.list_vms(VmStatusFilter::Live).await, vec![vm.clone()]);
    assert!(h.vms.list_vms(VmStatusFilter::Down).await.is_empty());
    assert!(matches!(
        h.vms.start_vm(&vm).await,
        Err(VmError::InvalidState { .. })
    ));

    h.vms.stop_vm(&vm).await.unwrap();
    assert_eq!(h.vms.status_of(&vm).await.unwrap(), VmStatus::Stopped);
    assert_eq!(h.vms.vm_status(&vm).await.unwrap(), "paused");
    assert_eq!(h.vms.list_vms(VmStatusFilter::Stopped).await, vec![vm.clone()]);
    h.vms.resume_vm(&vm).await.unwrap();
    assert_eq!(h.vms.status_of(&vm).await.unwrap(), VmStatus::Running);

    // Kill the hypervisor behind the dataplane's back:
    let pid = h.vms.hypervisor_pid(&vm).await.unwrap();
    let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).unwrap();
    assert!(String::from_utf8_lossy(&cmdline).contains(&vm));
    kill_9(pid);

    wait_for_status(&h.vms, &vm, VmStatus::Down).await;
    assert!(matches!(
        h.vms.serial_console_path(&vm).await,
        Err(VmError::NotRunning(_))
    ));
    assert_eq!(h.network.tap_of(&vm), None);

    h.vms.delete_vm(&vm).await.unwrap();
    assert_eq!(h.vm_root_entries(), 0);
    assert_eq!(h.network.ip_manager().free_count(), free_before);
    assert!(h.vms.list_vms(VmStatusFilter::All).await.is_empty());
    assert_eq!(
        h.vms.status_of(&vm).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert!(matches!(
        h.vms.delete_vm(&vm).await,
        Err(VmError::NotFound(_))
    ));

    monitor.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_base_image_leaves_nothing_behind() {
    let h = Harness::new(false).await;
    let free_before = h.network.ip_manager().free_count();

    let err = h.vms.create_vm().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    assert_eq!(h.vm_root_entries(), 0);
    assert!(h.vms.list_vms(VmStatusFilter::All).await.is_empty());
    assert_eq!(h.network.ip_manager().free_count(), free_before);
    assert!(!h.tools.ran("qemu-img create"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_leaves_a_lingering_process_until_delete() {
    let h = Harness::new(true).await;

    let vm = h.vms.create_vm().await.unwrap();
    let monitor = h.monitor(&vm);
    h.vms.start_vm(&vm).await.unwrap();
    let pid = h.vms.hypervisor_pid(&vm).await.unwrap();

    // The fake guest ignores the power button:
    h.vms.shutdown_vm(&vm).await.unwrap();
    assert_eq!(h.vms.status_of(&vm).await.unwrap(), VmStatus::Down);
    assert_eq!(h.vms.lingering_vms().await, vec![(vm.clone(), Some(pid))]);
    assert!(matches!(
        h.vms.start_vm(&vm).await,
        Err(VmError::Lingering { .. })
    ));
    assert!(matches!(
        h.vms.shutdown_vm(&vm).await,
        Err(VmError::InvalidState { .. })
    ));

    h.vms.delete_vm(&vm).await.unwrap();
    assert!(!Path::new(&format!("/proc/{pid}")).exists());
    assert!(h.vms.lingering_vms().await.is_empty());
    assert_eq!(h.vm_root_entries(), 0);

    monitor.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restarted_manager_recovers_running_vms() {
    let h = Harness::new(true).await;

    let idle = h.vms.create_vm().await.unwrap();
    let live = h.vms.create_vm().await.unwrap();
    let monitor = h.monitor(&live);
    h.vms.start_vm(&live).await.unwrap();
    let pid = h.vms.hypervisor_pid(&live).await.unwrap();
    let live_ip = h.vms.vm_ip(&live).await.unwrap();

    let (network, recovered) = Harness::managers(h.root.path(), h.tools.clone(), h.monitor_reads).await;

    let mut all = vec![idle.clone(), live.clone()];
    all.sort();
    assert_eq!(recovered.list_vms(VmStatusFilter::All).await, all);
    assert_eq!(recovered.status_of(&idle).await.unwrap(), VmStatus::Down);
    assert_eq!(recovered.status_of(&live).await.unwrap(), VmStatus::Running);
    assert_eq!(
        recovered.serial_console_path(&live).await.unwrap(),
        PathBuf::from("/dev/pts/99")
    );
    assert_eq!(recovered.vm_ip(&live).await.unwrap(), live_ip);
    assert_eq!(
        network.ip_manager().free_count(),
        h.network.ip_manager().free_count()
    );

    // Without a process handle, deletion quits the hypervisor through its
    // monitor. The fake one only closes the connection:
    recovered.delete_vm(&live).await.unwrap();
    assert!(matches!(
        recovered.status_of(&live).await,
        Err(VmError::NotFound(_))
    ));
    assert!(!h.vm_root().join(&live).exists());

    kill_9(pid);
    monitor.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_seed_image_rolls_back_create() {
    let tools = FakeTools {
        broken: Some("genisoimage"),
        ..FakeTools::default()
    };
    let h = Harness::with(true, tools, MonitorReadStrategy::Prompt).await;
    let free_before = h.network.ip_manager().free_count();

    let err = h.vms.create_vm().await.unwrap_err();
    assert!(matches!(err, VmError::CreateFailed { .. }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::ExternalToolFailed);

    // The overlay was created before the seed image failed:
    assert!(h.tools.ran("qemu-img create"));
    assert_eq!(h.vm_root_entries(), 0);
    assert_eq!(h.network.ip_manager().free_count(), free_before);
    assert!(h.vms.list_vms(VmStatusFilter::All).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_starts_launch_one_hypervisor() {
    let h = Harness::new(true).await;

    let vm = h.vms.create_vm().await.unwrap();
    let monitor = h.monitor(&vm);

    let (a, b) = tokio::join!(h.vms.start_vm(&vm), h.vms.start_vm(&vm));
    let (started, refused) = match (a, b) {
        (Ok(started), Err(refused)) | (Err(refused), Ok(started)) => (started, refused),
        other => panic!("expected exactly one start to succeed, got {other:?}"),
    };
    assert_eq!(started, vm);
    assert!(
        matches!(
            refused,
            VmError::InvalidState {
                status: VmStatus::Running,
                ..
            }
        ),
        "{refused:?}"
    );
    assert_eq!(h.vms.status_of(&vm).await.unwrap(), VmStatus::Running);

    h.vms.delete_vm(&vm).await.unwrap();
    assert_eq!(h.vm_root_entries(), 0);

    monitor.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_without_monitor_releases_tap() {
    let h = Harness::new(true).await;

    let vm = h.vms.create_vm().await.unwrap();

    // Nothing listens on the monitor socket, so the hypervisor never
    // becomes reachable:
    let err = h.vms.start_vm(&vm).await.unwrap_err();
    assert!(matches!(err, VmError::StartFailed { .. }), "{err:?}");
    assert_eq!(h.network.tap_of(&vm), None);
    assert!(h.tools.ran("ovs-vsctl --if-exists del-port"));
    assert_eq!(h.vms.status_of(&vm).await.unwrap(), VmStatus::Down);
    assert!(h.vms.lingering_vms().await.is_empty());

    // A second attempt with a monitor in place succeeds:
    let monitor = h.monitor(&vm);
    h.vms.start_vm(&vm).await.unwrap();
    assert!(h.network.tap_of(&vm).is_some());

    h.vms.delete_vm(&vm).await.unwrap();
    monitor.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lifecycle_with_fixed_delay_monitor_reads() {
    let h = Harness::with(true, FakeTools::default(), MonitorReadStrategy::FixedDelay).await;
    assert_eq!(
        ComputeConfig::default().monitor_read_strategy,
        MonitorReadStrategy::FixedDelay
    );

    let vm = h.vms.create_vm().await.unwrap();
    let monitor = h.monitor(&vm);

    h.vms.start_vm(&vm).await.unwrap();
    assert_eq!(h.vms.vm_status(&vm).await.unwrap(), "running");
    assert_eq!(
        h.vms.serial_console_path(&vm).await.unwrap(),
        PathBuf::from("/dev/pts/99")
    );

    h.vms.stop_vm(&vm).await.unwrap();
    assert_eq!(h.vms.vm_status(&vm).await.unwrap(), "paused");
    h.vms.resume_vm(&vm).await.unwrap();
    assert_eq!(h.vms.vm_status(&vm).await.unwrap(), "running");

    h.vms.delete_vm(&vm).await.unwrap();
    assert_eq!(h.vm_root_entries(), 0);

    monitor.abort();
}
