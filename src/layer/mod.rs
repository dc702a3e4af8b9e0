use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use serde::{Deserialize, Serialize};

use crate::digest::{ChainId, DiffId, DigestingReader};
use crate::error::{ImageError, ImageResult};
use crate::state::StateManager;

pub mod driver;
mod rw_layer;

pub use driver::{DirectoryDriver, StorageDriver};
pub use rw_layer::RwLayer;
use rw_layer::Mount;

/// Snapshot of a registered read-only layer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Layer {
    chain_id: ChainId,
    diff_id: DiffId,
    parent: Option<ChainId>,
    cache_id: String,
    diff_size: u64,
    size: u64,
    created: DateTime<Utc>
}

impl Layer {
    pub fn chain_id(&self) -> &ChainId {
        &self.chain_id
    }

    pub fn diff_id(&self) -> &DiffId {
        &self.diff_id
    }

    pub fn parent(&self) -> Option<&ChainId> {
        self.parent.as_ref()
    }

    /// Size of this layer's own diff.
    pub fn diff_size(&self) -> u64 {
        self.diff_size
    }

    /// Size of the whole chain up to and including this layer.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }
}

/// Describes a layer that was removed from the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerMetadata {
    pub chain_id: ChainId,
    pub diff_id: DiffId,
    pub diff_size: u64,
    pub size: u64
}

impl From<&Layer> for LayerMetadata {
    fn from(layer: &Layer) -> Self {
        LayerMetadata {
            chain_id: layer.chain_id.clone(),
            diff_id: layer.diff_id.clone(),
            diff_size: layer.diff_size,
            size: layer.size
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerRecord {
    #[serde(flatten)]
    pub layer: Layer,
    pub references: usize
}

impl LayerRecord {
    pub fn chain_id(&self) -> &ChainId {
        &self.layer.chain_id
    }
}

impl FromSql for LayerRecord {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let value = serde_json::Value::column_result(value)?;
        serde_json::from_value::<LayerRecord>(value).map_err(|_| FromSqlError::InvalidType)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MountRecord {
    pub name: String,
    pub mount_id: String,
    pub parent: Option<ChainId>,
    pub mount_label: String,
    pub created: DateTime<Utc>
}

impl FromSql for MountRecord {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let value = serde_json::Value::column_result(value)?;
        serde_json::from_value::<MountRecord>(value).map_err(|_| FromSqlError::InvalidType)
    }
}

/// Prepares the content of a new writable layer before it is handed out.
pub type MountInit = Box<dyn FnOnce(&Path) -> std::io::Result<()> + Send>;

#[derive(Default)]
pub struct CreateRwLayerOpts {
    pub mount_label: String,
    pub init_func: Option<MountInit>,
    pub storage_opt: HashMap<String, String>
}

/// Content-addressed store of read-only layer chains and the writable layers created on top of them.
///
/// Lock order is `mounts` before `layers`.
pub struct LayerStore {
    driver: Arc<dyn StorageDriver>,
    state_manager: Arc<StateManager>,
    layers: Mutex<HashMap<ChainId, LayerRecord>>,
    mounts: Mutex<HashMap<String, Arc<Mount>>>,
    next_reference: AtomicU64
}

impl LayerStore {
    pub fn new(driver: Arc<dyn StorageDriver>, state_manager: Arc<StateManager>) -> ImageResult<LayerStore> {
        let mut layers = HashMap::new();
        for record in state_manager.all_layers()? {
            layers.insert(record.chain_id().clone(), record);
        }

        let mut mounts = HashMap::new();
        for record in state_manager.all_mounts()? {
            mounts.insert(record.name.clone(), Arc::new(Mount::new(record, driver.clone())));
        }

        debug!("Loaded {} layers and {} mounts", layers.len(), mounts.len());

        Ok(
            LayerStore {
                driver,
                state_manager,
                layers: Mutex::new(layers),
                mounts: Mutex::new(mounts),
                next_reference: AtomicU64::new(1)
            }
        )
    }

    fn layers(&self) -> MutexGuard<'_, HashMap<ChainId, LayerRecord>> {
        self.layers.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn mounts(&self) -> MutexGuard<'_, HashMap<String, Arc<Mount>>> {
        self.mounts.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    pub fn driver_status(&self) -> Vec<(String, String)> {
        self.driver.status()
    }

    /// Registers the uncompressed tar diff on top of `parent`.
    ///
    /// If the resulting chain already exists, its reference count is incremented and the new copy is discarded.
    /// The returned layer holds one reference that must be given back with [`LayerStore::release`].
    pub fn register<R: Read>(&self, diff: R, parent: Option<&ChainId>) -> ImageResult<Layer> {
        let parent_layer = match parent {
            Some(parent) => Some(self.get(parent)?),
            None => None
        };

        match self.register_on_parent(diff, parent_layer.as_ref()) {
            Ok((layer, created)) => {
                if !created {
                    // The existing layer already holds its own reference on the parent
                    if let Some(parent_layer) = parent_layer.as_ref() {
                        self.release(parent_layer)?;
                    }
                }

                Ok(layer)
            }
            Err(err) => {
                if let Some(parent_layer) = parent_layer.as_ref() {
                    if let Err(release_err) = self.release(parent_layer) {
                        warn!("Failed to release parent layer {}: {}", parent_layer.chain_id, release_err);
                    }
                }

                Err(err)
            }
        }
    }

    fn register_on_parent<R: Read>(&self, diff: R, parent: Option<&Layer>) -> ImageResult<(Layer, bool)> {
        let cache_id = uuid::Uuid::new_v4().to_string();

        let mut reader = DigestingReader::new(diff);
        let diff_size = match self.driver.apply_diff(&cache_id, &mut reader) {
            Ok(diff_size) => diff_size,
            Err(err) => {
                self.remove_storage(&cache_id);
                return Err(ImageError::driver("apply diff", &cache_id, err));
            }
        };

        let (digest, _) = reader.finish();
        let diff_id = DiffId::new(digest);
        let chain_id = ChainId::extend(parent.map(|parent| &parent.chain_id), &diff_id);

        let mut layers = self.layers();
        if let Some(existing) = layers.get(&chain_id) {
            let mut record = existing.clone();
            record.references += 1;
            self.state_manager.upsert_layer(&record)?;
            let layer = record.layer.clone();
            layers.insert(chain_id, record);
            drop(layers);

            debug!("Layer {} already registered", layer.chain_id);
            self.remove_storage(&cache_id);
            return Ok((layer, false));
        }

        let record = LayerRecord {
            layer: Layer {
                chain_id: chain_id.clone(),
                diff_id,
                parent: parent.map(|parent| parent.chain_id.clone()),
                cache_id: cache_id.clone(),
                diff_size,
                size: parent.map(|parent| parent.size).unwrap_or(0) + diff_size,
                created: Utc::now()
            },
            references: 1
        };

        if let Err(err) = self.state_manager.upsert_layer(&record) {
            drop(layers);
            self.remove_storage(&cache_id);
            return Err(err.into());
        }

        let layer = record.layer.clone();
        layers.insert(chain_id, record);
        info!("Registered layer {} (diff {})", layer.chain_id, layer.diff_id);
        Ok((layer, true))
    }

    /// Gets a layer and takes a reference on it.
    pub fn get(&self, chain_id: &ChainId) -> ImageResult<Layer> {
        let mut layers = self.layers();
        let record = layers.get(chain_id).ok_or_else(|| ImageError::LayerNotFound { chain_id: chain_id.clone() })?;

        let mut record = record.clone();
        record.references += 1;
        self.state_manager.upsert_layer(&record)?;

        let layer = record.layer.clone();
        layers.insert(chain_id.clone(), record);
        Ok(layer)
    }

    pub fn contains(&self, chain_id: &ChainId) -> bool {
        self.layers().contains_key(chain_id)
    }

    pub fn len(&self) -> usize {
        self.layers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers().is_empty()
    }

    pub fn references(&self, chain_id: &ChainId) -> Option<usize> {
        self.layers().get(chain_id).map(|record| record.references)
    }

    /// Point-in-time copy of every registered layer.
    pub fn map(&self) -> HashMap<ChainId, Layer> {
        self.layers()
            .iter()
            .map(|(chain_id, record)| (chain_id.clone(), record.layer.clone()))
            .collect()
    }

    /// Gives back a reference. Layers reaching zero references are deleted together with any parent that also reaches zero.
    pub fn release(&self, layer: &Layer) -> ImageResult<Vec<LayerMetadata>> {
        self.release_chain(&layer.chain_id)
    }

    fn release_chain(&self, chain_id: &ChainId) -> ImageResult<Vec<LayerMetadata>> {
        let mut removed = Vec::new();

        {
            let mut layers = self.layers();
            if !layers.contains_key(chain_id) {
                return Err(ImageError::LayerNotFound { chain_id: chain_id.clone() });
            }

            let mut current = Some(chain_id.clone());
            while let Some(chain_id) = current.take() {
                let Some(existing) = layers.get(&chain_id) else {
                    warn!("Parent layer {} missing from the store", chain_id);
                    break;
                };

                let mut record = existing.clone();
                record.references = record.references.saturating_sub(1);
                if record.references > 0 {
                    self.state_manager.upsert_layer(&record)?;
                    layers.insert(chain_id, record);
                    break;
                }

                self.state_manager.remove_layer(&chain_id)?;
                if let Some(record) = layers.remove(&chain_id) {
                    current = record.layer.parent.clone();
                    removed.push(record.layer);
                }
            }
        }

        for layer in &removed {
            self.remove_storage(&layer.cache_id);
            info!("Deleted layer {}", layer.chain_id);
        }

        Ok(removed.iter().map(LayerMetadata::from).collect())
    }

    fn remove_storage(&self, cache_id: &str) {
        if let Err(err) = self.driver.remove(cache_id) {
            warn!("Failed to remove layer storage {}: {}", cache_id, err);
        }
    }

    /// Opens the stored diff of a registered layer.
    pub fn tar_stream(&self, chain_id: &ChainId) -> ImageResult<Box<dyn Read + Send>> {
        let cache_id = self.layers()
            .get(chain_id)
            .map(|record| record.layer.cache_id.clone())
            .ok_or_else(|| ImageError::LayerNotFound { chain_id: chain_id.clone() })?;

        self.driver.open_diff(&cache_id).map_err(|err| ImageError::driver("open diff", chain_id.as_str(), err))
    }

    pub fn create_rw_layer(&self, name: &str, parent: Option<&ChainId>, opts: CreateRwLayerOpts) -> ImageResult<RwLayer> {
        let mut mounts = self.mounts();
        if mounts.contains_key(name) {
            return Err(ImageError::MountNameConflict { name: name.to_owned() });
        }

        let parent_layer = match parent {
            Some(parent) => Some(self.get(parent)?),
            None => None
        };

        let record = MountRecord {
            name: name.to_owned(),
            mount_id: uuid::Uuid::new_v4().to_string(),
            parent: parent.cloned(),
            mount_label: opts.mount_label.clone(),
            created: Utc::now()
        };

        if let Err(err) = self.initialize_rw_layer(&record, opts) {
            self.remove_storage(&record.mount_id);
            if let Some(parent_layer) = parent_layer.as_ref() {
                if let Err(release_err) = self.release(parent_layer) {
                    warn!("Failed to release parent layer {}: {}", parent_layer.chain_id, release_err);
                }
            }

            return Err(err);
        }

        let mount = Arc::new(Mount::new(record, self.driver.clone()));
        mounts.insert(name.to_owned(), mount.clone());
        info!("Created writable layer {}", name);
        Ok(self.new_handle(mount))
    }

    fn initialize_rw_layer(&self, record: &MountRecord, opts: CreateRwLayerOpts) -> ImageResult<()> {
        self.driver.create_rw(&record.mount_id, &opts.storage_opt)
            .map_err(|err| ImageError::driver("create", &record.name, err))?;

        if let Some(init_func) = opts.init_func {
            let path = self.driver.get(&record.mount_id, &record.mount_label)
                .map_err(|err| ImageError::driver("mount", &record.name, err))?;
            let result = init_func(&path).map_err(|err| ImageError::driver("initialize", &record.name, err));
            self.driver.put(&record.mount_id)
                .map_err(|err| ImageError::driver("unmount", &record.name, err))?;
            result?;
        }

        self.state_manager.insert_mount(record)?;
        Ok(())
    }

    fn new_handle(&self, mount: Arc<Mount>) -> RwLayer {
        RwLayer::new(mount, self.next_reference.fetch_add(1, Ordering::SeqCst))
    }

    /// Returns a new reference to the writable layer `name`.
    pub fn get_rw_layer(&self, name: &str) -> ImageResult<RwLayer> {
        let mount = self.mounts()
            .get(name)
            .cloned()
            .ok_or_else(|| ImageError::MountNotFound { name: name.to_owned() })?;

        Ok(self.new_handle(mount))
    }

    pub fn get_mount_id(&self, name: &str) -> ImageResult<String> {
        self.mounts()
            .get(name)
            .map(|mount| mount.record.mount_id.clone())
            .ok_or_else(|| ImageError::MountNotFound { name: name.to_owned() })
    }

    /// Gives back a reference to a writable layer, deleting it when it was the last one.
    ///
    /// Releasing an already released reference does nothing, and a writable layer already gone from disk counts as removed.
    pub fn release_rw_layer(&self, layer: &RwLayer) -> ImageResult<Vec<LayerMetadata>> {
        let mut mounts = self.mounts();
        let mount = match mounts.get(layer.name()) {
            Some(mount) if Arc::ptr_eq(mount, &layer.mount) => mount.clone(),
            _ => return Ok(Vec::new())
        };

        if !mount.has_reference(layer.reference) {
            return Ok(Vec::new());
        }

        if let Err(err) = layer.unmount() {
            if !err.is_not_found() {
                return Err(err);
            }
        }

        mount.remove_reference(layer.reference);
        if mount.has_references() {
            return Ok(Vec::new());
        }

        if let Err(err) = self.driver.remove(&mount.record.mount_id) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(ImageError::driver("remove", layer.name(), err));
            }
        }

        self.state_manager.remove_mount(&mount.record.name)?;
        mounts.remove(&mount.record.name);
        info!("Removed writable layer {}", mount.record.name);

        match mount.record.parent.as_ref() {
            Some(parent) => self.release_chain(parent),
            None => Ok(Vec::new())
        }
    }

    /// Unmounts every writable layer, used at shutdown.
    pub fn cleanup(&self) -> ImageResult<()> {
        let mounts = self.mounts().values().cloned().collect::<Vec<_>>();

        let mut result = Ok(());
        for mount in mounts {
            if let Err(err) = mount.unmount_all() {
                if !err.is_not_found() {
                    warn!("Failed to unmount {}: {}", mount.record.name, err);
                    result = Err(err);
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests;
