//! Container manager behaviour: on-disk layout, image materialisation,
//! create/reuse/delete.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::LoopbackProvider;
use silo::vmm::VirtualMachineProvider;
use silo::{
    ContainerManager, CreateOptions, Ext4Reader, ImageSource, ProcessIo, ProcessSpec, SiloError,
};

fn provider() -> Arc<dyn VirtualMachineProvider> {
    Arc::new(LoopbackProvider)
}

fn layer_tarball(dir: &Path, name: &str) -> std::path::PathBuf {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_path("etc/").unwrap();
    header.set_entry_type(tar::EntryType::Directory);
    header.set_mode(0o755);
    header.set_size(0);
    header.set_cksum();
    builder.append(&header, &[][..]).unwrap();

    let mut header = tar::Header::new_gnu();
    header.set_path("etc/os-release").unwrap();
    header.set_mode(0o644);
    header.set_size(12);
    header.set_cksum();
    builder.append(&header, &b"NAME=minimal"[..]).unwrap();

    let path = dir.join(name);
    std::fs::write(&path, builder.into_inner().unwrap()).unwrap();
    path
}

#[tokio::test]
async fn test_create_from_layers_builds_ext4_image() {
    let tmp = tempfile::tempdir().unwrap();
    let layer = layer_tarball(tmp.path(), "layer0.tar");
    let root = tmp.path().join("manager");

    let manager = ContainerManager::new(&root, provider()).unwrap();
    let container = manager
        .create(
            "imaged",
            ImageSource::Layers(vec![layer]),
            CreateOptions {
                rootfs_size: Some(16 * 1024 * 1024),
                writable_layer_size: Some(16 * 1024 * 1024),
            },
            |config| {
                config.process = ProcessSpec::new(["/bin/true"]);
            },
        )
        .await
        .unwrap();
    assert_eq!(container.id(), "imaged");

    // The layout holds the formatted image, the writable layer, and the
    // persisted metadata.
    let container_dir = root.join("imaged");
    let image = container_dir.join("rootfs/image.ext4");
    assert!(image.is_file());
    assert!(container_dir.join("writable.ext4").is_file());
    assert!(container_dir.join("config.json").is_file());
    assert!(container_dir.join("state.json").is_file());

    // The image is a readable filesystem with the layer contents.
    let reader = Ext4Reader::open(&image).unwrap();
    assert!(reader.exists(Path::new("/etc/os-release")).unwrap());

    manager.delete("imaged").await.unwrap();
    assert!(!container_dir.exists());
}

#[tokio::test]
async fn test_directory_source_runs_and_deletes() {
    let tmp = tempfile::tempdir().unwrap();
    let rootfs_dir = tmp.path().join("rootfs-src");
    std::fs::create_dir(&rootfs_dir).unwrap();
    let root = tmp.path().join("manager");

    let manager = ContainerManager::new(&root, provider()).unwrap();
    let container = manager
        .create(
            "shared",
            ImageSource::Directory(rootfs_dir),
            CreateOptions::default(),
            |config| {
                config.process = ProcessSpec::new(["/bin/true"]);
            },
        )
        .await
        .unwrap();

    container.create(ProcessIo::null()).await.unwrap();
    container.start().await.unwrap();
    assert_eq!(container.wait(None).await.unwrap().code(), 0);

    // Manager delete stops the container and removes the tree.
    manager.delete("shared").await.unwrap();
    assert!(manager.get("shared").is_none());
    manager.delete("shared").await.unwrap(); // idempotent
}

#[tokio::test]
async fn test_duplicate_active_id_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let rootfs_dir = tmp.path().join("rootfs-src");
    std::fs::create_dir(&rootfs_dir).unwrap();
    let root = tmp.path().join("manager");

    let manager = ContainerManager::new(&root, provider()).unwrap();
    manager
        .create(
            "only",
            ImageSource::Directory(rootfs_dir.clone()),
            CreateOptions::default(),
            |_| {},
        )
        .await
        .unwrap();

    let err = manager
        .create(
            "only",
            ImageSource::Directory(rootfs_dir),
            CreateOptions::default(),
            |_| {},
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SiloError::InvalidState(_)));

    // The existing controller is shared through get().
    assert!(manager.get("only").is_some());
}

#[tokio::test]
async fn test_list_reflects_disk_state() {
    let tmp = tempfile::tempdir().unwrap();
    let rootfs_dir = tmp.path().join("rootfs-src");
    std::fs::create_dir(&rootfs_dir).unwrap();
    let root = tmp.path().join("manager");

    let manager = ContainerManager::new(&root, provider()).unwrap();
    assert!(manager.list().unwrap().is_empty());

    for id in ["a-container", "b-container"] {
        manager
            .create(
                id,
                ImageSource::Directory(rootfs_dir.clone()),
                CreateOptions::default(),
                |_| {},
            )
            .await
            .unwrap();
    }
    assert_eq!(manager.list().unwrap(), vec!["a-container", "b-container"]);

    manager.delete("a-container").await.unwrap();
    assert_eq!(manager.list().unwrap(), vec!["b-container"]);
}

#[tokio::test]
async fn test_restore_after_manager_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let rootfs_dir = tmp.path().join("rootfs-src");
    std::fs::create_dir(&rootfs_dir).unwrap();
    let root = tmp.path().join("manager");

    {
        let manager = ContainerManager::new(&root, provider()).unwrap();
        manager
            .create(
                "persistent",
                ImageSource::Directory(rootfs_dir.clone()),
                CreateOptions::default(),
                |config| {
                    config.process = ProcessSpec::new(["/bin/true"]);
                    config.cpus = 3;
                },
            )
            .await
            .unwrap();
        // Manager (and its lock) goes away here.
    }

    let manager = ContainerManager::new(&root, provider()).unwrap();
    assert!(manager.get("persistent").is_none());
    let state = manager.persisted_state("persistent").unwrap().unwrap();
    assert_eq!(state.status, "created");

    let container = manager.restore("persistent").unwrap();
    assert_eq!(container.config().cpus, 3);

    // The restored controller drives a full lifecycle.
    container.create(ProcessIo::null()).await.unwrap();
    container.start().await.unwrap();
    assert_eq!(container.wait(None).await.unwrap().code(), 0);
    container.stop().await.unwrap();

    // Restoring an id with an active controller is refused.
    assert!(matches!(
        manager.restore("persistent").unwrap_err(),
        SiloError::InvalidState(_)
    ));
}

#[tokio::test]
async fn test_empty_id_and_missing_directory_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = ContainerManager::new(tmp.path().join("m"), provider()).unwrap();

    let err = manager
        .create(
            "",
            ImageSource::Directory(tmp.path().to_path_buf()),
            CreateOptions::default(),
            |_| {},
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SiloError::InvalidArgument(_)));

    let err = manager
        .create(
            "ghost",
            ImageSource::Directory(tmp.path().join("nope")),
            CreateOptions::default(),
            |_| {},
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SiloError::NotFound(_)));
}
