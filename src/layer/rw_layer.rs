use std::collections::HashSet;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use log::warn;

use crate::digest::ChainId;
use crate::error::{ImageError, ImageResult};
use crate::helpers::directory_size;
use crate::layer::MountRecord;
use crate::layer::driver::StorageDriver;

/// A writable layer shared by every handle that refers to it by name.
pub(crate) struct Mount {
    pub(crate) record: MountRecord,
    driver: Arc<dyn StorageDriver>,
    state: Mutex<MountState>
}

struct MountState {
    references: HashSet<u64>,
    active_mounts: usize
}

impl Mount {
    pub(crate) fn new(record: MountRecord, driver: Arc<dyn StorageDriver>) -> Mount {
        Mount {
            record,
            driver,
            state: Mutex::new(MountState { references: HashSet::new(), active_mounts: 0 })
        }
    }

    fn state(&self) -> MutexGuard<'_, MountState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub(crate) fn add_reference(&self, reference: u64) {
        self.state().references.insert(reference);
    }

    pub(crate) fn has_reference(&self, reference: u64) -> bool {
        self.state().references.contains(&reference)
    }

    pub(crate) fn remove_reference(&self, reference: u64) -> bool {
        self.state().references.remove(&reference)
    }

    pub(crate) fn has_references(&self) -> bool {
        !self.state().references.is_empty()
    }

    fn mount(&self, mount_label: &str) -> ImageResult<PathBuf> {
        let mut state = self.state();
        let path = self.driver.get(&self.record.mount_id, mount_label)
            .map_err(|err| ImageError::driver("mount", &self.record.name, err))?;
        state.active_mounts += 1;
        Ok(path)
    }

    fn unmount(&self) -> ImageResult<()> {
        let mut state = self.state();
        if state.active_mounts == 0 {
            return Ok(());
        }

        self.driver.put(&self.record.mount_id)
            .map_err(|err| ImageError::driver("unmount", &self.record.name, err))?;
        state.active_mounts -= 1;
        Ok(())
    }

    /// Drops every active mount regardless of which handle made it.
    pub(crate) fn unmount_all(&self) -> ImageResult<()> {
        let mut state = self.state();
        while state.active_mounts > 0 {
            self.driver.put(&self.record.mount_id)
                .map_err(|err| ImageError::driver("unmount", &self.record.name, err))?;
            state.active_mounts -= 1;
        }

        Ok(())
    }
}

/// One reference to a writable layer. Released through `LayerStore::release_rw_layer`.
///
/// Dropping a handle gives up its reference, but only `release_rw_layer` removes the layer itself.
pub struct RwLayer {
    pub(crate) mount: Arc<Mount>,
    pub(crate) reference: u64,
    mounted_path: Mutex<Option<PathBuf>>
}

impl RwLayer {
    pub(crate) fn new(mount: Arc<Mount>, reference: u64) -> RwLayer {
        mount.add_reference(reference);

        RwLayer {
            mount,
            reference,
            mounted_path: Mutex::new(None)
        }
    }

    fn mounted_path(&self) -> MutexGuard<'_, Option<PathBuf>> {
        self.mounted_path.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.mount.record.name
    }

    pub fn parent(&self) -> Option<&ChainId> {
        self.mount.record.parent.as_ref()
    }

    pub fn mount_label(&self) -> &str {
        &self.mount.record.mount_label
    }

    /// Mounts the layer for this handle. Mounting an already mounted handle returns the existing path.
    pub fn mount(&self, mount_label: &str) -> ImageResult<PathBuf> {
        let mut mounted_path = self.mounted_path();
        if let Some(path) = mounted_path.as_ref() {
            return Ok(path.clone());
        }

        let path = self.mount.mount(mount_label)?;
        *mounted_path = Some(path.clone());
        Ok(path)
    }

    pub fn unmount(&self) -> ImageResult<()> {
        let mut mounted_path = self.mounted_path();
        if mounted_path.is_none() {
            return Ok(());
        }

        self.mount.unmount()?;
        *mounted_path = None;
        Ok(())
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted_path().is_some()
    }

    /// Tar archive of every change made in the layer.
    pub fn tar_stream(&self) -> ImageResult<Box<dyn Read + Send>> {
        self.mount.driver.diff_rw(&self.mount.record.mount_id)
            .map_err(|err| ImageError::driver("export", self.name(), err))
    }

    pub fn size(&self) -> ImageResult<u64> {
        let path = self.mount.driver.get(&self.mount.record.mount_id, self.mount_label())
            .map_err(|err| ImageError::driver("stat", self.name(), err))?;
        directory_size(&path).map_err(|err| ImageError::driver("stat", self.name(), err))
    }
}

impl Drop for RwLayer {
    fn drop(&mut self) {
        if let Err(err) = self.unmount() {
            warn!("Failed to unmount dropped handle of {}: {}", self.name(), err);
        }

        self.mount.remove_reference(self.reference);
    }
}

impl std::fmt::Debug for RwLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLayer")
            .field("name", &self.name())
            .field("reference", &self.reference)
            .finish()
    }
}
