use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{event, instrument, Level};

use crate::error::BaseImageError;
use crate::exec::{run_checked, Cmd, CommandRunner};

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct QemuImgMetadata {
    pub filename: PathBuf,
    pub format: String,
    pub virtual_size: u64,
    pub encrypted: Option<bool>,
    // According to [1], these attributes are described as
    // - backing-filename: name of the backing file
    // - full-backing-filename: full path of the backing file
    //
    // [1]: https://www.qemu.org/docs/master/interop/qemu-storage-daemon-qmp-ref.html
    pub backing_filename: Option<PathBuf>,
    pub full_backing_filename: Option<PathBuf>,
}

/// Provider of the golden image every VM disk is layered on.
#[async_trait]
pub trait DistroManager: Send + Sync + 'static {
    fn image_path(&self) -> &Path;

    /// Check that the image exists and is usable as a backing file.
    async fn verify(&self) -> Result<QemuImgMetadata, BaseImageError>;

    /// Like [`verify`](DistroManager::verify), but attempt to build the image
    /// first if it is unusable and a builder is available.
    async fn ensure(&self) -> Result<QemuImgMetadata, BaseImageError>;
}

/// A qcow2 base image on the local filesystem, optionally produced by an
/// external build script.
pub struct BaseImage {
    path: PathBuf,
    build_script: Option<PathBuf>,
    qemu_img_binary: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for BaseImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseImage")
            .field("path", &self.path)
            .field("build_script", &self.build_script)
            .finish_non_exhaustive()
    }
}

impl BaseImage {
    pub fn new(
        path: PathBuf,
        build_script: Option<PathBuf>,
        qemu_img_binary: PathBuf,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        BaseImage {
            path,
            build_script,
            qemu_img_binary,
            runner,
        }
    }

    fn missing(&self, reason: impl Into<String>) -> BaseImageError {
        BaseImageError::BaseImageMissing {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl DistroManager for BaseImage {
    fn image_path(&self) -> &Path {
        &self.path
    }

    #[instrument(skip(self), fields(path = ?self.path), err(Debug, level = Level::DEBUG))]
    async fn verify(&self) -> Result<QemuImgMetadata, BaseImageError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.is_file() => (),
            Ok(_) => return Err(self.missing("not a regular file")),
            Err(e) => return Err(self.missing(e.to_string())),
        }

        let info = Cmd::new(&self.qemu_img_binary)
            .args(["info", "--output=json", "--"])
            .arg(&self.path);
        let output = run_checked(&*self.runner, &info).await?;

        let metadata: QemuImgMetadata = serde_json::from_slice(&output.stdout).map_err(|e| {
            self.missing(format!(
                "cannot parse `qemu-img info` output ({e}): {:?}",
                String::from_utf8_lossy(&output.stdout)
            ))
        })?;

        if metadata.format != "qcow2" {
            return Err(self.missing(format!("format is {}, expected qcow2", metadata.format)));
        }

        // The image must not be encrypted:
        if metadata.encrypted.unwrap_or(false) {
            return Err(self.missing("image is encrypted"));
        }

        Ok(metadata)
    }

    #[instrument(skip(self), fields(path = ?self.path), err(Debug, level = Level::WARN))]
    async fn ensure(&self) -> Result<QemuImgMetadata, BaseImageError> {
        let err = match self.verify().await {
            Ok(metadata) => return Ok(metadata),
            Err(e) => e,
        };

        let Some(build_script) = &self.build_script else {
            return Err(err);
        };

        event!(Level::INFO, ?build_script, reason = %err, "Base image unusable, running build script");
        run_checked(&*self.runner, &Cmd::new(build_script).arg(&self.path)).await?;

        self.verify().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::exec::fake::{ok, ScriptedRunner};

    fn qemu_img_info(format: &str, encrypted: bool) -> String {
        format!(
            r#"{{"virtual-size": 10737418240, "filename": "base.qcow2", "cluster-size": 65536,
                "format": "{format}", "actual-size": 2147483648, "encrypted": {encrypted},
                "dirty-flag": false}}"#
        )
    }

    #[tokio::test]
    async fn verify_accepts_plain_qcow2() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.qcow2");
        tokio::fs::write(&path, b"QFI\xfb").await.unwrap();

        let runner = Arc::new(ScriptedRunner::new(|_| ok(&qemu_img_info("qcow2", false))));
        let image = BaseImage::new(path.clone(), None, "qemu-img".into(), runner.clone());

        let metadata = image.verify().await.unwrap();
        assert_eq!(metadata.virtual_size, 10 * 1024 * 1024 * 1024);
        assert_eq!(
            runner.commands(),
            vec![format!("qemu-img info --output=json -- {}", path.display())]
        );
    }

    #[tokio::test]
    async fn verify_rejects_missing_raw_and_encrypted_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.qcow2");

        let runner = Arc::new(ScriptedRunner::new(|_| ok(&qemu_img_info("raw", false))));
        let image = BaseImage::new(path.clone(), None, "qemu-img".into(), runner.clone());
        assert!(matches!(
            image.ensure().await,
            Err(BaseImageError::BaseImageMissing { .. })
        ));
        // Nothing to inspect without a file:
        assert!(runner.commands().is_empty());

        tokio::fs::write(&path, b"").await.unwrap();
        assert!(matches!(
            image.verify().await,
            Err(BaseImageError::BaseImageMissing { .. })
        ));

        let runner = Arc::new(ScriptedRunner::new(|_| ok(&qemu_img_info("qcow2", true))));
        let image = BaseImage::new(path, None, "qemu-img".into(), runner);
        let err = image.verify().await.unwrap_err();
        assert_eq!(err.kind(), igs_rs::error::ErrorKind::PreconditionFailed);
    }

    #[tokio::test]
    async fn ensure_runs_build_script_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.qcow2");

        let built = Arc::new(AtomicBool::new(false));
        let runner = {
            let built = built.clone();
            let path = path.clone();
            Arc::new(ScriptedRunner::new(move |cmd| {
                if cmd.is("/usr/local/bin/build-base-image") {
                    std::fs::write(&path, b"QFI\xfb").unwrap();
                    built.store(true, Ordering::SeqCst);
                    ok("")
                } else {
                    ok(&qemu_img_info("qcow2", false))
                }
            }))
        };

        let image = BaseImage::new(
            path.clone(),
            Some("/usr/local/bin/build-base-image".into()),
            "qemu-img".into(),
            runner.clone(),
        );
        image.ensure().await.unwrap();
        assert!(built.load(Ordering::SeqCst));

        // Already present, no rebuild:
        image.ensure().await.unwrap();
        let builds = runner
            .commands()
            .iter()
            .filter(|c| c.starts_with("/usr/local/bin/build-base-image"))
            .count();
        assert_eq!(builds, 1);
    }
}
