use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::digest::ImageId;
use crate::image::ContainerConfig;

/// The parts of a container record the image service needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image_id: Option<ImageId>,
    pub mount_label: String,
    pub os: String,
    pub config: ContainerConfig,
    pub running: bool
}

impl Container {
    pub fn new(id: &str, image_id: Option<ImageId>) -> Container {
        Container {
            id: id.to_owned(),
            name: id.to_owned(),
            image_id,
            mount_label: String::new(),
            os: std::env::consts::OS.to_owned(),
            config: ContainerConfig::default(),
            running: false
        }
    }
}

/// Index of known containers. A missing container is `None`, never an empty record.
pub trait ContainerStore: Send + Sync {
    fn first(&self, filter: &dyn Fn(&Container) -> bool) -> Option<Container>;
    fn list(&self) -> Vec<Container>;
    fn get(&self, id: &str) -> Option<Container>;
}

#[derive(Default)]
pub struct MemoryContainerStore {
    containers: RwLock<BTreeMap<String, Container>>
}

impl MemoryContainerStore {
    pub fn new() -> MemoryContainerStore {
        MemoryContainerStore::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Container>> {
        self.containers.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Container>> {
        self.containers.write().unwrap_or_else(|err| err.into_inner())
    }

    pub fn add(&self, container: Container) {
        self.write().insert(container.id.clone(), container);
    }

    pub fn remove(&self, id: &str) -> Option<Container> {
        self.write().remove(id)
    }
}

impl ContainerStore for MemoryContainerStore {
    fn first(&self, filter: &dyn Fn(&Container) -> bool) -> Option<Container> {
        self.read().values().find(|container| filter(container)).cloned()
    }

    fn list(&self) -> Vec<Container> {
        self.read().values().cloned().collect()
    }

    fn get(&self, id: &str) -> Option<Container> {
        self.read().get(id).cloned()
    }
}

#[test]
fn test_memory_container_store() {
    let store = MemoryContainerStore::new();
    store.add(Container::new("c1", None));
    store.add(Container { running: true, ..Container::new("c2", None) });

    assert_eq!(2, store.list().len());
    assert_eq!(Some("c2".to_owned()), store.first(&|container| container.running).map(|container| container.id));
    assert!(store.get("c3").is_none());
    assert!(store.remove("c1").is_some());
    assert!(store.get("c1").is_none());
}
