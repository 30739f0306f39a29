//! Integration tests for the instance registry.
//!
//! A shell script named `qemu-system-x86_64` stands in for the emulator: it
//! records its argv under `argv/` and then sleeps (or exits), so the full
//! create/observe/delete lifecycle runs anywhere with `/bin/sh`.

#![cfg(unix)]

use nimbus_core::{
    Catalog, CoreError, CreateRequest, DirImageStore, DirKeyStore, Flavor, HostCapabilities,
    InstanceId, InstanceRegistry, InstanceStatus, RegistryConfig,
};
use nimbus_vm::Arch;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const IMAGE_ID: &str = "6c1d3e0a-8f5b-4d2e-9a7c-1b2c3d4e5f60";
const ARP_HEADER: &str =
    "IP address       HW type     Flags       HW address            Mask     Device\n";

fn script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

struct Harness {
    dir: TempDir,
    registry: InstanceRegistry,
}

impl Harness {
    /// Registry whose emulator records its argv and then runs `tail`.
    fn new(tail: &str, tweak: impl FnOnce(&mut RegistryConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for sub in ["images", "qemu", "consoles", "volumes", "keypairs", "argv"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }
        std::fs::write(image_path(root), b"base image").unwrap();
        std::fs::write(root.join("arp"), ARP_HEADER).unwrap();

        let argv = root.join("argv");
        script(
            &root.join("qemu").join("qemu-system-x86_64"),
            &format!(
                "printf '%s\\n' \"$@\" > {argv}/.$$\nmv {argv}/.$$ {argv}/$$\n{tail}",
                argv = argv.display()
            ),
        );
        // creates the second-to-last argument, like qemu-img create
        script(
            &root.join("qemu-img"),
            r#"out=""; prev=""; for a in "$@"; do out="$prev"; prev="$a"; done; : > "$out""#,
        );

        let mut catalog = Catalog::default();
        catalog.flavors.insert(
            "m1.tiny".into(),
            Flavor {
                vcpus: 1,
                ram_mb: 256,
                disk_gb: 1,
            },
        );
        catalog.flavors.insert(
            "m1.small".into(),
            Flavor {
                vcpus: 2,
                ram_mb: 512,
                disk_gb: 10,
            },
        );
        catalog.net_bridges.insert("lan".into(), "br0".into());

        let mut config = RegistryConfig::new(catalog, root.join("consoles"));
        config.qemu_dir = Some(root.join("qemu"));
        config.arp_table = root.join("arp");
        config.arp_ttl = Duration::ZERO;
        config.setup_timeout = Duration::from_secs(10);
        tweak(&mut config);

        let images = DirImageStore::new(root.join("images"), root.join("volumes"))
            .with_qemu_img(root.join("qemu-img"));
        let keys = DirKeyStore::new(root.join("keypairs"));
        let registry = InstanceRegistry::new(config, Arc::new(images), Arc::new(keys));
        Self { dir, registry }
    }

    fn running() -> Self {
        Self::new("exec sleep 30", |_| {})
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn console_path(&self, id: InstanceId) -> PathBuf {
        self.root().join("consoles").join(id.to_string())
    }

    /// Arguments the emulator of `id` was started with.
    async fn argv(&self, id: InstanceId) -> Vec<String> {
        let needle = id.to_string();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            for entry in std::fs::read_dir(self.root().join("argv")).unwrap() {
                let entry = entry.unwrap();
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let text = std::fs::read_to_string(entry.path()).unwrap();
                if text.contains(&needle) {
                    return text.lines().map(String::from).collect();
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "emulator for {id} never started"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn metadata_port(&self, id: InstanceId) -> u16 {
        let argv = self.argv(id).await;
        let nic = argv
            .iter()
            .find(|a| a.contains("guestfwd="))
            .expect("metadata forward rule");
        nic.rsplit(' ').next().unwrap().parse().unwrap()
    }

    fn argv_files(&self) -> usize {
        std::fs::read_dir(self.root().join("argv")).unwrap().count()
    }
}

fn image_path(root: &Path) -> PathBuf {
    root.join("images")
        .join(format!("{IMAGE_ID}:cirros.x86_64.qcow2"))
}

fn request(name: &str) -> CreateRequest {
    CreateRequest::new(name, IMAGE_ID, "m1.tiny")
}

/// Minimal HTTP/1.1 GET against the loopback metadata service.
async fn http_get(port: u16, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port))
        .await
        .unwrap();
    stream
        .write_all(
            format!("GET {path} HTTP/1.1\r\nHost: 169.254.169.254\r\nConnection: close\r\n\r\n")
                .as_bytes(),
        )
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn wait_for_status(
    registry: &InstanceRegistry,
    id: InstanceId,
    status: InstanceStatus,
) -> nimbus_core::InstanceInfo {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let info = registry.get(id).await.unwrap();
        if info.status == status {
            return info;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "instance {id} stuck in {}",
            info.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_create_then_delete_releases_everything() {
    let h = Harness::running();
    tokio::fs::write(h.root().join("keypairs").join("deploy"), "ssh-ed25519 AAAA deploy")
        .await
        .unwrap();

    let mut req = request("web-1");
    req.key_name = Some("deploy".into());
    req.user_data = bytes::Bytes::from_static(b"#cloud-config\n");
    let id = h.registry.create(req).await.unwrap();

    let info = h.registry.get(id).await.unwrap();
    assert_eq!(info.name, "web-1");
    assert_eq!(info.hostname, "web-1");
    assert_eq!(info.status, InstanceStatus::Build);
    assert_eq!(info.key_name.as_deref(), Some("deploy"));

    // the guest's view through the forward rule
    let port = h.metadata_port(id).await;
    let meta = http_get(port, "/openstack/latest/meta_data.json").await;
    assert!(meta.starts_with("HTTP/1.1 200"), "{meta}");
    assert!(meta.contains(&id.to_string()));
    assert!(meta.contains("ssh-ed25519 AAAA deploy"));
    let user_data = http_get(port, "/openstack/latest/user_data").await;
    assert!(user_data.ends_with("#cloud-config\n"), "{user_data}");
    assert!(std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_err());

    tokio::fs::write(h.console_path(id), "cirros login:").await.unwrap();
    assert_eq!(h.registry.console(id).await.unwrap(), "cirros login:");

    h.registry.delete(id).await.unwrap();

    std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .expect("metadata port should be free after delete");
    assert!(!h.console_path(id).exists());
    assert!(h.registry.get(id).await.unwrap_err().is_not_found());
    assert_eq!(h.registry.count().await, 0);
}

#[tokio::test]
async fn test_concurrent_creates_get_distinct_addresses() {
    let h = Harness::running();

    let creates = (0..8).map(|i| h.registry.create(request(&format!("vm-{i}"))));
    let ids: Vec<InstanceId> = futures::future::join_all(creates)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let infos = h.registry.list().await;
    assert_eq!(infos.len(), 8);
    let addresses: HashSet<_> = infos.iter().map(|i| i.hw_address).collect();
    assert_eq!(addresses.len(), 8);
    assert!(addresses
        .iter()
        .all(|mac| mac.octets()[..3] == [0x52, 0x54, 0x00]));

    let listed: HashSet<_> = h.registry.ids().await.into_iter().collect();
    let created: HashSet<_> = ids.into_iter().collect();
    assert_eq!(listed, created);

    h.registry.teardown_all().await;
    assert_eq!(h.registry.count().await, 0);
}

#[tokio::test]
async fn test_delete_unknown_leaves_registry_unchanged() {
    let h = Harness::running();
    let id = h.registry.create(request("keep-me")).await.unwrap();

    let err = h.registry.delete(InstanceId::new()).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(h.registry.ids().await, vec![id]);
    assert_eq!(h.registry.get(id).await.unwrap().status, InstanceStatus::Build);

    h.registry.delete(id).await.unwrap();
}

#[tokio::test]
async fn test_shared_image_survives_create_delete_cycles() {
    let h = Harness::running();
    for i in 0..3 {
        let id = h.registry.create(request(&format!("cycle-{i}"))).await.unwrap();
        let argv = h.argv(id).await;
        assert!(argv.contains(&"-snapshot".to_string()));
        h.registry.delete(id).await.unwrap();
        assert_eq!(std::fs::read(image_path(h.root())).unwrap(), b"base image");
    }
}

#[tokio::test]
async fn test_fresh_console_is_empty() {
    let h = Harness::running();
    let id = h.registry.create(request("quiet")).await.unwrap();
    assert_eq!(h.registry.console(id).await.unwrap(), "");
    h.registry.delete(id).await.unwrap();
}

#[tokio::test]
async fn test_accelerated_launch_arguments() {
    let h = Harness::new("exec sleep 30", |config| {
        config.host = HostCapabilities {
            arch: Some(Arch::X86_64),
            kvm: true,
        };
    });
    let mut req = CreateRequest::new("big", IMAGE_ID, "m1.small");
    req.network = Some("lan".into());
    let id = h.registry.create(req).await.unwrap();
    let info = h.registry.get(id).await.unwrap();

    let argv = h.argv(id).await;
    let joined = argv.join(" ");
    assert!(joined.contains("-smp 2"), "{joined}");
    assert!(joined.contains("-m 512M"), "{joined}");
    assert!(joined.contains("-accel kvm -cpu host"), "{joined}");
    assert!(joined.contains(&format!(
        "bridge,model=virtio-net-pci,br=br0,mac={}",
        info.hw_address
    )));
    assert!(joined.contains(&format!("file:{}", h.console_path(id).display())));

    h.registry.delete(id).await.unwrap();
}

#[tokio::test]
async fn test_build_until_address_observed() {
    let h = Harness::running();
    let id = h.registry.create(request("dhcp")).await.unwrap();

    let info = h.registry.get(id).await.unwrap();
    assert_eq!(info.status, InstanceStatus::Build);
    assert!(info.access_ipv4.is_none());

    tokio::fs::write(
        h.root().join("arp"),
        format!(
            "{ARP_HEADER}192.168.1.57     0x1         0x2         {}     *        br0\n",
            info.hw_address.to_string().to_uppercase()
        ),
    )
    .await
    .unwrap();

    let info = h.registry.get(id).await.unwrap();
    assert_eq!(info.status, InstanceStatus::Active);
    assert_eq!(info.access_ipv4, Some(Ipv4Addr::new(192, 168, 1, 57)));
    assert_eq!(
        info.addresses.unwrap()["private"][0].addr,
        Ipv4Addr::new(192, 168, 1, 57)
    );

    h.registry.delete(id).await.unwrap();
}

#[tokio::test]
async fn test_unknown_image_registers_nothing() {
    let h = Harness::running();
    let err = h
        .registry
        .create(CreateRequest::new("ghost", "no-such-image", "m1.tiny"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(h.registry.count().await, 0);
    assert_eq!(h.argv_files(), 0);
}

#[tokio::test]
async fn test_unknown_network_is_not_found() {
    let h = Harness::running();
    let mut req = request("lost");
    req.network = Some("wan".into());
    assert!(h.registry.create(req).await.unwrap_err().is_not_found());
    assert_eq!(h.registry.count().await, 0);
    assert_eq!(h.argv_files(), 0);
}

#[tokio::test]
async fn test_launch_failure_is_registered_as_error() {
    let h = Harness::new("exec sleep 30", |config| {
        config.qemu_dir = Some(PathBuf::from("/nonexistent/qemu"));
    });
    let id = h.registry.create(request("broken")).await.unwrap();

    let info = h.registry.get(id).await.unwrap();
    assert_eq!(info.status, InstanceStatus::Error);
    assert!(info.fault.unwrap().contains("failed to launch"));

    h.registry.delete(id).await.unwrap();
    assert_eq!(h.registry.count().await, 0);
}

#[tokio::test]
async fn test_process_exit_turns_error_and_frees_port() {
    let h = Harness::new("exit 1", |_| {});
    let id = h.registry.create(request("crashy")).await.unwrap();
    let port = h.metadata_port(id).await;

    let info = wait_for_status(&h.registry, id, InstanceStatus::Error).await;
    assert_eq!(info.fault.as_deref(), Some("hypervisor exited with code 1"));

    assert_eq!(h.registry.reap_exited().await, 1);
    std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .expect("metadata port should be free once the process exited");
    // still registered until deleted
    assert!(h.registry.exists(id).await);

    h.registry.delete(id).await.unwrap();
}

#[tokio::test]
async fn test_build_timeout_turns_error() {
    let h = Harness::new("exec sleep 30", |config| {
        config.build_timeout = Some(Duration::from_millis(50));
    });
    let id = h.registry.create(request("slow")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let info = h.registry.get(id).await.unwrap();
    assert_eq!(info.status, InstanceStatus::Error);
    assert!(info.fault.unwrap().contains("no network address"));

    h.registry.delete(id).await.unwrap();
}

#[tokio::test]
async fn test_owned_volume_is_removed_on_delete() {
    let h = Harness::running();
    let mut req = request("persistent");
    req.volume_size_gb = Some(5);
    let id = h.registry.create(req).await.unwrap();

    let volume = h.root().join("volumes").join(format!("{id}.qcow2"));
    assert!(volume.exists());
    let argv = h.argv(id).await;
    assert!(!argv.contains(&"-snapshot".to_string()));
    assert!(argv.contains(&format!("file={},if=virtio", volume.display())));

    h.registry.delete(id).await.unwrap();
    assert!(!volume.exists());
    assert!(image_path(h.root()).exists());
}

#[tokio::test]
async fn test_volume_clone_failure_registers_nothing() {
    let h = Harness::running();
    script(&h.root().join("qemu-img"), "echo 'backing file missing' >&2; exit 1");

    let mut req = request("no-disk");
    req.volume_size_gb = Some(5);
    let err = h.registry.create(req).await.unwrap_err();
    assert!(matches!(err, CoreError::Provision(_)));
    assert_eq!(h.registry.count().await, 0);
    assert_eq!(h.argv_files(), 0);
}

#[tokio::test]
async fn test_setup_failure_removes_cloned_volume() {
    // the ARP table is a regular file, so no directory can be created below it
    let h = Harness::new("exec sleep 30", |config| {
        config.consoles_dir = config.arp_table.join("consoles");
    });

    let mut req = request("no-console");
    req.volume_size_gb = Some(5);
    let err = h.registry.create(req).await.unwrap_err();
    assert!(matches!(err, CoreError::Provision(_)), "{err}");
    assert_eq!(h.registry.count().await, 0);
    assert_eq!(h.argv_files(), 0);

    // returns at once only if no reservation is left
    tokio::time::timeout(Duration::from_secs(1), h.registry.teardown_all())
        .await
        .unwrap();
    let volumes: Vec<_> = std::fs::read_dir(h.root().join("volumes"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert!(volumes.is_empty(), "volume left behind: {volumes:?}");
}
