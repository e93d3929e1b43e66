//! Per-VM SSH credentials and the cloud-init NoCloud seed.
//!
//! The seed consists of `user-data`, `meta-data` and `network-config`, packed
//! into an ISO9660 image labeled `cidata`. All documents are emitted as JSON,
//! which cloud-init parses as YAML.

use std::path::{Path, PathBuf};

use serde_json::json;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use tokio::io::AsyncWriteExt;
use tracing::{event, instrument, Level};

use igs_rs::config::SshKeyAlgorithm;

use crate::error::VmError;
use crate::exec::{run_checked, Cmd, CommandRunner};
use crate::network::GuestNetworkConfig;

pub const PRIVATE_KEY_FILE: &str = "id_rsa";
pub const PUBLIC_KEY_FILE: &str = "id_rsa.pub";
pub const USER_DATA_FILE: &str = "user-data";
pub const META_DATA_FILE: &str = "meta-data";
pub const NETWORK_CONFIG_FILE: &str = "network-config";
pub const SEED_ISO_FILE: &str = "cloud-init.iso";

/// Volume label cloud-init's NoCloud datasource looks for.
const SEED_VOLUME_ID: &str = "cidata";

/// Generate a fresh keypair in `vm_dir` and return the public key in OpenSSH
/// format. The private key is only readable by its owner.
#[instrument(skip(vm_dir), err(Debug, level = Level::WARN))]
pub async fn generate_ssh_keypair(
    vm_dir: &Path,
    algorithm: SshKeyAlgorithm,
) -> Result<String, VmError> {
    let algorithm = match algorithm {
        SshKeyAlgorithm::Rsa => Algorithm::Rsa { hash: None },
        SshKeyAlgorithm::Ed25519 => Algorithm::Ed25519,
    };

    // RSA key generation takes a while, keep it off the async workers:
    let private_key = tokio::task::spawn_blocking(move || {
        PrivateKey::random(&mut rand_core::OsRng, algorithm)
    })
    .await
    .map_err(|e| VmError::io("SSH key generation task failed")(std::io::Error::other(e)))??;

    let private_openssh = private_key.to_openssh(LineEnding::LF)?;
    let public_openssh = private_key.public_key().to_openssh()?;

    let private_path = vm_dir.join(PRIVATE_KEY_FILE);
    let mut private_file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&private_path)
        .await
        .map_err(VmError::io(format!("creating {private_path:?}")))?;
    private_file
        .write_all(private_openssh.as_bytes())
        .await
        .map_err(VmError::io(format!("writing {private_path:?}")))?;
    private_file
        .sync_all()
        .await
        .map_err(VmError::io(format!("writing {private_path:?}")))?;

    let public_path = vm_dir.join(PUBLIC_KEY_FILE);
    tokio::fs::write(&public_path, format!("{public_openssh}\n"))
        .await
        .map_err(VmError::io(format!("writing {public_path:?}")))?;

    Ok(public_openssh)
}

pub fn hostname(vm_name: &str) -> String {
    format!("igs-{}", vm_name.split('-').next().unwrap_or(vm_name))
}

pub fn user_data(guest_user: &str, vm_name: &str, public_key: &str) -> String {
    let doc = json!({
        "hostname": hostname(vm_name),
        "users": [{
            "name": guest_user,
            "sudo": "ALL=(ALL) NOPASSWD:ALL",
            "shell": "/bin/bash",
            "lock_passwd": true,
            "ssh_authorized_keys": [public_key.trim()],
        }],
        "ssh_pwauth": false,
        "packages": ["qemu-guest-agent"],
        "runcmd": [["systemctl", "enable", "--now", "qemu-guest-agent"]],
    });

    // cloud-init only treats user-data as cloud-config given this header:
    format!("#cloud-config\n{doc:#}\n")
}

pub fn meta_data(vm_name: &str) -> String {
    let doc = json!({
        "instance-id": vm_name,
        "local-hostname": hostname(vm_name),
    });
    format!("{doc:#}\n")
}

/// Write the three seed documents into `vm_dir`.
pub async fn write_seed(
    vm_dir: &Path,
    vm_name: &str,
    guest_user: &str,
    public_key: &str,
    network_config: &GuestNetworkConfig,
) -> Result<(), VmError> {
    let network_config = serde_json::to_string_pretty(network_config)
        .map_err(|e| VmError::io("encoding network-config")(e.into()))?;

    for (file, contents) in [
        (USER_DATA_FILE, user_data(guest_user, vm_name, public_key)),
        (META_DATA_FILE, meta_data(vm_name)),
        (NETWORK_CONFIG_FILE, format!("{network_config}\n")),
    ] {
        let path = vm_dir.join(file);
        tokio::fs::write(&path, contents)
            .await
            .map_err(VmError::io(format!("writing {path:?}")))?;
    }

    Ok(())
}

/// Pack the seed documents of `vm_dir` into its seed ISO.
#[instrument(skip(runner), err(Debug, level = Level::WARN))]
pub async fn build_seed_iso(
    runner: &dyn CommandRunner,
    genisoimage_binary: &Path,
    vm_dir: &Path,
) -> Result<PathBuf, VmError> {
    let iso = vm_dir.join(SEED_ISO_FILE);

    let cmd = Cmd::new(genisoimage_binary)
        .arg("-output")
        .arg(&iso)
        .args(["-volid", SEED_VOLUME_ID, "-joliet", "-rock"])
        .arg(vm_dir.join(USER_DATA_FILE))
        .arg(vm_dir.join(META_DATA_FILE))
        .arg(vm_dir.join(NETWORK_CONFIG_FILE));
    run_checked(runner, &cmd).await?;

    event!(Level::DEBUG, ?iso, "Built cloud-init seed image");
    Ok(iso)
}
