use std::sync::Arc;

use crate::digest::{ChainId, DiffId, Digest};
use crate::error::ImageError;
use crate::layer::{CreateRwLayerOpts, DirectoryDriver, LayerStore};
use crate::state::StateManager;
use crate::test_helpers::{tar_with_files, TempFolder};

fn create_store(folder: &TempFolder) -> LayerStore {
    let driver = DirectoryDriver::new(folder.join("layers"), folder.join("mounts")).unwrap();
    LayerStore::new(Arc::new(driver), Arc::new(StateManager::in_memory().unwrap())).unwrap()
}

#[test]
fn test_register_root() {
    let folder = TempFolder::new();
    let store = create_store(&folder);

    let diff = tar_with_files(&[("file1.txt", b"hello")]);
    let layer = store.register(&diff[..], None).unwrap();

    assert_eq!(&DiffId::new(Digest::of_bytes(&diff)), layer.diff_id());
    assert_eq!(layer.diff_id().digest(), layer.chain_id().digest());
    assert_eq!(None, layer.parent());
    assert_eq!(diff.len() as u64, layer.diff_size());
    assert_eq!(Some(1), store.references(layer.chain_id()));
}

#[test]
fn test_register_dedup() {
    let folder = TempFolder::new();
    let store = create_store(&folder);

    let diff = tar_with_files(&[("file1.txt", b"hello")]);
    let layer1 = store.register(&diff[..], None).unwrap();
    let layer2 = store.register(&diff[..], None).unwrap();

    assert_eq!(layer1.chain_id(), layer2.chain_id());
    assert_eq!(1, store.len());
    assert_eq!(Some(2), store.references(layer1.chain_id()));
    assert_eq!(1, std::fs::read_dir(folder.join("layers")).unwrap().count());

    assert!(store.release(&layer1).unwrap().is_empty());
    let removed = store.release(&layer2).unwrap();
    assert_eq!(1, removed.len());
    assert!(store.is_empty());
    assert_eq!(0, std::fs::read_dir(folder.join("layers")).unwrap().count());
}

#[test]
fn test_register_child_chain() {
    let folder = TempFolder::new();
    let store = create_store(&folder);

    let base = store.register(&tar_with_files(&[("a", b"1")])[..], None).unwrap();
    let child = store.register(&tar_with_files(&[("b", b"2")])[..], Some(base.chain_id())).unwrap();

    assert_eq!(Some(base.chain_id()), child.parent());
    assert_eq!(ChainId::extend(Some(base.chain_id()), child.diff_id()), *child.chain_id());
    assert_eq!(base.size() + child.diff_size(), child.size());
    assert_eq!(Some(2), store.references(base.chain_id()));

    store.release(&base).unwrap();
    let removed = store.release(&child).unwrap();
    assert_eq!(
        vec![child.chain_id().clone(), base.chain_id().clone()],
        removed.iter().map(|layer| layer.chain_id.clone()).collect::<Vec<_>>()
    );
    assert!(store.is_empty());
}

#[test]
fn test_register_unknown_parent() {
    let folder = TempFolder::new();
    let store = create_store(&folder);

    let parent = ChainId::new(Digest::of_bytes(b"unknown"));
    let err = store.register(&tar_with_files(&[("a", b"1")])[..], Some(&parent)).unwrap_err();
    assert!(matches!(err, ImageError::LayerNotFound { .. }));
    assert!(store.is_empty());
}

#[test]
fn test_map_is_snapshot() {
    let folder = TempFolder::new();
    let store = create_store(&folder);

    let layer = store.register(&tar_with_files(&[("a", b"1")])[..], None).unwrap();
    let snapshot = store.map();
    store.release(&layer).unwrap();

    assert_eq!(1, snapshot.len());
    assert!(store.map().is_empty());
}

#[test]
fn test_reload_from_state() {
    let folder = TempFolder::new();
    folder.create().unwrap();
    let state_manager = Arc::new(StateManager::new(&folder.join("state")).unwrap());
    let driver = Arc::new(DirectoryDriver::new(folder.join("layers"), folder.join("mounts")).unwrap());

    let layer = {
        let store = LayerStore::new(driver.clone(), state_manager.clone()).unwrap();
        let layer = store.register(&tar_with_files(&[("a", b"1")])[..], None).unwrap();
        store.create_rw_layer("container1", Some(layer.chain_id()), CreateRwLayerOpts::default()).unwrap();
        layer
    };

    let store = LayerStore::new(driver, state_manager).unwrap();
    assert_eq!(Some(2), store.references(layer.chain_id()));
    assert!(store.get_mount_id("container1").is_ok());
}

#[test]
fn test_create_rw_layer_conflict() {
    let folder = TempFolder::new();
    let store = create_store(&folder);

    store.create_rw_layer("container1", None, CreateRwLayerOpts::default()).unwrap();
    let err = store.create_rw_layer("container1", None, CreateRwLayerOpts::default()).unwrap_err();
    assert!(err.is_conflict());
}

#[test]
fn test_create_rw_layer_init_func() {
    let folder = TempFolder::new();
    let store = create_store(&folder);

    let opts = CreateRwLayerOpts {
        init_func: Some(Box::new(|path| std::fs::write(path.join(".init"), b""))),
        ..Default::default()
    };

    let rw_layer = store.create_rw_layer("container1", None, opts).unwrap();
    let path = rw_layer.mount("").unwrap();
    assert!(path.join(".init").exists());
    rw_layer.unmount().unwrap();
}

#[test]
fn test_create_rw_layer_failure_releases_parent() {
    let folder = TempFolder::new();
    let store = create_store(&folder);

    let layer = store.register(&tar_with_files(&[("a", b"1")])[..], None).unwrap();
    let opts = CreateRwLayerOpts {
        init_func: Some(Box::new(|_| Err(std::io::Error::other("failed")))),
        ..Default::default()
    };

    assert!(store.create_rw_layer("container1", Some(layer.chain_id()), opts).is_err());
    assert_eq!(Some(1), store.references(layer.chain_id()));
    assert!(store.get_rw_layer("container1").unwrap_err().is_not_found());
}

#[test]
fn test_release_rw_layer_twice() {
    let folder = TempFolder::new();
    let store = create_store(&folder);

    let layer = store.register(&tar_with_files(&[("a", b"1")])[..], None).unwrap();
    let rw_layer = store.create_rw_layer("container1", Some(layer.chain_id()), CreateRwLayerOpts::default()).unwrap();
    rw_layer.mount("").unwrap();

    assert!(store.release_rw_layer(&rw_layer).unwrap().is_empty());
    assert!(store.release_rw_layer(&rw_layer).unwrap().is_empty());
    assert_eq!(Some(1), store.references(layer.chain_id()));
    assert!(store.get_rw_layer("container1").unwrap_err().is_not_found());
}

#[test]
fn test_release_rw_layer_keeps_other_references() {
    let folder = TempFolder::new();
    let store = create_store(&folder);

    let rw_layer = store.create_rw_layer("container1", None, CreateRwLayerOpts::default()).unwrap();
    let other = store.get_rw_layer("container1").unwrap();

    store.release_rw_layer(&other).unwrap();
    assert!(store.get_rw_layer("container1").is_ok());

    store.release_rw_layer(&rw_layer).unwrap();
    assert!(store.get_rw_layer("container1").is_err());
}

#[test]
fn test_dropped_rw_layer_handle_gives_up_reference() {
    let folder = TempFolder::new();
    let store = create_store(&folder);

    let layer = store.register(&tar_with_files(&[("a", b"1")])[..], None).unwrap();
    let rw_layer = store.create_rw_layer("container1", Some(layer.chain_id()), CreateRwLayerOpts::default()).unwrap();

    let other = store.get_rw_layer("container1").unwrap();
    other.mount("").unwrap();
    drop(other);

    store.release(&layer).unwrap();
    assert_eq!(Some(1), store.references(layer.chain_id()));

    let removed = store.release_rw_layer(&rw_layer).unwrap();
    assert_eq!(1, removed.len());
    assert!(store.get_rw_layer("container1").unwrap_err().is_not_found());
    assert_eq!(None, store.references(layer.chain_id()));
    assert!(store.is_empty());
}

#[test]
fn test_release_rw_layer_missing_on_disk() {
    let folder = TempFolder::new();
    let store = create_store(&folder);

    let layer = store.register(&tar_with_files(&[("a", b"1")])[..], None).unwrap();
    let rw_layer = store.create_rw_layer("container1", Some(layer.chain_id()), CreateRwLayerOpts::default()).unwrap();
    rw_layer.mount("").unwrap();

    let mount_id = store.get_mount_id("container1").unwrap();
    std::fs::remove_dir_all(folder.join("mounts").join(mount_id)).unwrap();

    let removed = store.release_rw_layer(&rw_layer).unwrap();
    assert!(removed.is_empty());
    store.release(&layer).unwrap();
    assert!(store.is_empty());
}

#[test]
fn test_release_rw_layer_cascades_to_parent() {
    let folder = TempFolder::new();
    let store = create_store(&folder);

    let layer = store.register(&tar_with_files(&[("a", b"1")])[..], None).unwrap();
    let rw_layer = store.create_rw_layer("container1", Some(layer.chain_id()), CreateRwLayerOpts::default()).unwrap();
    store.release(&layer).unwrap();
    assert!(store.contains(layer.chain_id()));

    let removed = store.release_rw_layer(&rw_layer).unwrap();
    assert_eq!(1, removed.len());
    assert!(!store.contains(layer.chain_id()));
}

#[test]
fn test_tar_stream() {
    use std::io::Read;

    let folder = TempFolder::new();
    let store = create_store(&folder);

    let diff = tar_with_files(&[("a", b"1")]);
    let layer = store.register(&diff[..], None).unwrap();

    let mut content = Vec::new();
    store.tar_stream(layer.chain_id()).unwrap().read_to_end(&mut content).unwrap();
    assert_eq!(diff, content);
}

#[test]
fn test_cleanup_unmounts() {
    let folder = TempFolder::new();
    let store = create_store(&folder);

    let rw_layer = store.create_rw_layer("container1", None, CreateRwLayerOpts::default()).unwrap();
    rw_layer.mount("").unwrap();
    store.cleanup().unwrap();
    assert!(rw_layer.size().is_ok());
}
