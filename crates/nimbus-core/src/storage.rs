//! Storage collaborators: image lookup, volume provisioning and keypairs.
//!
//! The registry only depends on the [`ImageStore`] and [`KeyStore`] traits.
//! The directory-backed implementations keep images as
//! `{images_dir}/{uuid}:{name}.{arch}.{format}`, volumes as
//! `{volumes_dir}/{instance_id}.qcow2` and public keys as one file per key
//! name.

use crate::error::{CoreError, Result};
use crate::instance::InstanceId;
use async_trait::async_trait;
use nimbus_vm::Arch;
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// A bootable disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Image id
    pub id: String,
    /// Display name
    pub name: String,
    /// Path on the host
    pub path: PathBuf,
    /// Guest architecture
    pub arch: Arch,
    /// Disk format (e.g. `qcow2`, `raw`)
    pub format: String,
}

/// The disk an instance boots from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Volume {
    /// The source image itself; never deleted by the instance.
    Shared(PathBuf),
    /// A copy-on-write clone created for, and owned by, the instance.
    Owned(PathBuf),
}

impl Volume {
    /// Path on the host.
    pub fn path(&self) -> &Path {
        match self {
            Volume::Shared(path) | Volume::Owned(path) => path,
        }
    }

    /// Whether the instance owns (and must eventually delete) this volume.
    pub fn is_owned(&self) -> bool {
        matches!(self, Volume::Owned(_))
    }
}

/// Image lookup and volume provisioning.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Find an image by id.
    async fn find_image(&self, id: &str) -> Result<Option<Image>>;

    /// Create a writable copy-on-write volume of `size_gb` backed by `image`.
    ///
    /// # Errors
    /// Returns [`CoreError::Provision`] if the clone fails.
    async fn clone_to_volume(
        &self,
        image: &Image,
        size_gb: u32,
        instance: &InstanceId,
    ) -> Result<PathBuf>;

    /// Delete a volume previously returned by `clone_to_volume`.
    async fn remove_volume(&self, path: &Path) -> Result<()>;
}

/// Public key lookup.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Public key stored under `name`, if any.
    async fn read_public_key(&self, name: &str) -> Option<String>;
}

/// Split `{uuid}:{name}.{arch}.{format}` into its parts.
fn parse_image_file_name(file_name: &str) -> Option<(&str, &str, &str, &str)> {
    let (id, rest) = file_name.split_once(':')?;
    let (rest, format) = rest.rsplit_once('.')?;
    let (name, arch) = rest.rsplit_once('.')?;
    Some((id, name, arch, format))
}

/// Images and volumes kept in plain directories.
#[derive(Debug, Clone)]
pub struct DirImageStore {
    images_dir: PathBuf,
    volumes_dir: PathBuf,
    qemu_img: PathBuf,
}

impl DirImageStore {
    /// Create a store over the given directories.
    pub fn new(images_dir: impl Into<PathBuf>, volumes_dir: impl Into<PathBuf>) -> Self {
        Self {
            images_dir: images_dir.into(),
            volumes_dir: volumes_dir.into(),
            qemu_img: PathBuf::from("qemu-img"),
        }
    }

    /// Use a specific `qemu-img` binary.
    pub fn with_qemu_img(mut self, path: impl Into<PathBuf>) -> Self {
        self.qemu_img = path.into();
        self
    }

    /// Path of the volume cloned for `instance`.
    pub fn volume_path(&self, instance: &InstanceId) -> PathBuf {
        self.volumes_dir.join(format!("{instance}.qcow2"))
    }
}

#[async_trait]
impl ImageStore for DirImageStore {
    async fn find_image(&self, id: &str) -> Result<Option<Image>> {
        let prefix = format!("{id}:");
        let mut entries = match tokio::fs::read_dir(&self.images_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(dir = %self.images_dir.display(), "Images directory missing");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !file_name.starts_with(&prefix) {
                continue;
            }
            let Some((_, name, arch, format)) = parse_image_file_name(file_name) else {
                tracing::warn!(file = file_name, "Skipping malformed image file name");
                continue;
            };
            let arch = arch.parse().map_err(|_| {
                CoreError::InvalidRequest(format!(
                    "image {id} has unsupported architecture {arch}"
                ))
            })?;
            return Ok(Some(Image {
                id: id.to_string(),
                name: name.to_string(),
                path: entry.path(),
                arch,
                format: format.to_string(),
            }));
        }
        Ok(None)
    }

    async fn clone_to_volume(
        &self,
        image: &Image,
        size_gb: u32,
        instance: &InstanceId,
    ) -> Result<PathBuf> {
        let start = std::time::Instant::now();
        tokio::fs::create_dir_all(&self.volumes_dir)
            .await
            .map_err(|e| CoreError::Provision(format!("failed to create volumes directory: {e}")))?;

        let backing = tokio::fs::canonicalize(&image.path)
            .await
            .map_err(|e| CoreError::Provision(format!("image {} unreadable: {e}", image.id)))?;
        let volume = self.volume_path(instance);
        tracing::debug!(
            instance_id = %instance,
            image = %backing.display(),
            volume = %volume.display(),
            size_gb,
            "Cloning image to volume"
        );

        let output = tokio::process::Command::new(&self.qemu_img)
            .arg("create")
            .args(["-f", "qcow2", "-F", &image.format, "-b"])
            .arg(&backing)
            .arg(&volume)
            .arg(format!("{size_gb}G"))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                CoreError::Provision(format!("failed to run {}: {e}", self.qemu_img.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(instance_id = %instance, status = %output.status, stderr = %stderr.trim(), "Volume clone failed");
            return Err(CoreError::Provision(format!(
                "volume clone failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }

        tracing::info!(
            instance_id = %instance,
            volume = %volume.display(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Volume cloned"
        );
        Ok(volume)
    }

    async fn remove_volume(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Public keys kept one-per-file in a directory.
#[derive(Debug, Clone)]
pub struct DirKeyStore {
    dir: PathBuf,
}

impl DirKeyStore {
    /// Create a store over `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File holding the key `name`; path separators are neutralised.
    fn key_path(&self, name: &str) -> PathBuf {
        self.dir.join(name.trim().replace('/', "_"))
    }

    /// Store `public_key` under `name`, replacing any previous key.
    pub async fn import(&self, name: &str, public_key: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(CoreError::InvalidRequest("keypair name is required".into()));
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.key_path(name), public_key).await?;
        tracing::info!(key_name = name, "Keypair imported");
        Ok(())
    }

    /// Delete the key `name`.
    ///
    /// # Errors
    /// Returns [`CoreError::NotFound`] if no such key exists.
    pub async fn delete(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.key_path(name)).await {
            Ok(()) => {
                tracing::info!(key_name = name, "Keypair deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CoreError::NotFound(format!("keypair {name}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl KeyStore for DirKeyStore {
    async fn read_public_key(&self, name: &str) -> Option<String> {
        match tokio::fs::read_to_string(self.key_path(name)).await {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::debug!(key_name = name, error = %e, "Public key not readable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_parse_image_file_name() {
        assert_eq!(
            parse_image_file_name("1234:ubuntu.22.04.x86_64.qcow2"),
            Some(("1234", "ubuntu.22.04", "x86_64", "qcow2"))
        );
        assert_eq!(parse_image_file_name("1234-no-colon.qcow2"), None);
        assert_eq!(parse_image_file_name("1234:noarch"), None);
    }

    #[test]
    fn test_volume_ownership() {
        let shared = Volume::Shared(PathBuf::from("/images/a"));
        let owned = Volume::Owned(PathBuf::from("/volumes/b"));
        assert!(!shared.is_owned());
        assert!(owned.is_owned());
        assert_eq!(owned.path(), Path::new("/volumes/b"));
    }

    #[tokio::test]
    async fn test_find_image() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc:cirros.aarch64.qcow2"), b"").unwrap();
        std::fs::write(dir.path().join("abcd:other.x86_64.raw"), b"").unwrap();
        let store = DirImageStore::new(dir.path(), dir.path().join("volumes"));

        let image = store.find_image("abc").await.unwrap().unwrap();
        assert_eq!(image.name, "cirros");
        assert_eq!(image.arch, Arch::Aarch64);
        assert_eq!(image.format, "qcow2");
        assert_eq!(image.path, dir.path().join("abc:cirros.aarch64.qcow2"));

        assert!(store.find_image("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_image_unsupported_arch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc:solaris.sparc64.qcow2"), b"").unwrap();
        let store = DirImageStore::new(dir.path(), dir.path().join("volumes"));
        assert!(matches!(
            store.find_image("abc").await,
            Err(CoreError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_find_image_missing_dir() {
        let store = DirImageStore::new("/nonexistent/images", "/nonexistent/volumes");
        assert!(store.find_image("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clone_and_remove_volume() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc:cirros.x86_64.qcow2"), b"").unwrap();
        // creates the second-to-last argument, like qemu-img create
        let qemu_img = script(
            dir.path(),
            "qemu-img",
            r#"out=""; prev=""; for a in "$@"; do out="$prev"; prev="$a"; done; : > "$out""#,
        );
        let store =
            DirImageStore::new(dir.path(), dir.path().join("volumes")).with_qemu_img(qemu_img);
        let image = store.find_image("abc").await.unwrap().unwrap();
        let instance = InstanceId::new();

        let volume = store.clone_to_volume(&image, 10, &instance).await.unwrap();
        assert_eq!(volume, store.volume_path(&instance));
        assert!(volume.exists());

        store.remove_volume(&volume).await.unwrap();
        assert!(!volume.exists());
        // removing twice is fine
        store.remove_volume(&volume).await.unwrap();
    }

    #[tokio::test]
    async fn test_clone_failure_is_provision_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc:cirros.x86_64.qcow2"), b"").unwrap();
        let qemu_img = script(dir.path(), "qemu-img", "echo 'no space left' >&2; exit 1");
        let store =
            DirImageStore::new(dir.path(), dir.path().join("volumes")).with_qemu_img(qemu_img);
        let image = store.find_image("abc").await.unwrap().unwrap();

        let err = store
            .clone_to_volume(&image, 10, &InstanceId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Provision(ref msg) if msg.contains("no space left")));
    }

    #[tokio::test]
    async fn test_keypair_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let keys = DirKeyStore::new(dir.path().join("keypairs"));

        assert!(keys.read_public_key("deploy").await.is_none());
        keys.import("deploy", "ssh-ed25519 AAAA deploy").await.unwrap();
        assert_eq!(
            keys.read_public_key(" deploy ").await.as_deref(),
            Some("ssh-ed25519 AAAA deploy")
        );

        keys.delete("deploy").await.unwrap();
        assert!(keys.delete("deploy").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_keypair_names_cannot_escape() {
        let dir = tempfile::tempdir().unwrap();
        let keys = DirKeyStore::new(dir.path().join("keypairs"));
        keys.import("../evil", "key").await.unwrap();
        assert!(dir.path().join("keypairs").join(".._evil").exists());
    }
}
