use std::collections::{BTreeSet, HashMap};
use std::ops::Deref;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info, warn};
use rusqlite::Row;
use rusqlite::types::Type;

use crate::digest::{ChainId, ImageId};
use crate::error::{ImageError, ImageResult};
use crate::image::Image;
use crate::layer::{Layer, LayerMetadata, LayerStore};
use crate::state::StateManager;

/// A persisted image row.
pub struct ImageRecord {
    pub id: ImageId,
    pub config: Vec<u8>,
    pub parent: Option<ImageId>,
    pub built_locally: bool
}

impl ImageRecord {
    pub fn from_row(row: &Row) -> rusqlite::Result<ImageRecord> {
        let parent: Option<String> = row.get(2)?;

        Ok(
            ImageRecord {
                id: parse_image_id(0, &row.get::<_, String>(0)?)?,
                config: row.get(1)?,
                parent: parent.map(|parent| parse_image_id(2, &parent)).transpose()?,
                built_locally: row.get::<_, i64>(3)? != 0
            }
        )
    }
}

fn parse_image_id(column: usize, text: &str) -> rusqlite::Result<ImageId> {
    ImageId::from_str(text).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(ImageError::InvalidReference { message: err }))
    })
}

struct StoredImage {
    image: Image,
    config: Vec<u8>,
    parent: Option<ImageId>,
    built_locally: bool,
    layer: Option<Layer>
}

#[derive(Default)]
struct Images {
    images: HashMap<ImageId, StoredImage>,
    children: HashMap<ImageId, BTreeSet<ImageId>>
}

impl Images {
    fn unlink(&mut self, id: &ImageId, parent: &ImageId) {
        if let Some(children) = self.children.get_mut(parent) {
            children.remove(id);
            if children.is_empty() {
                self.children.remove(parent);
            }
        }
    }
}

/// Content-addressed image metadata together with the commit lineage between images.
///
/// Every image holds one reference on the top layer of its root filesystem.
pub struct ImageStore {
    layer_store: Arc<LayerStore>,
    state_manager: Arc<StateManager>,
    images: RwLock<Images>
}

impl ImageStore {
    pub fn new(layer_store: Arc<LayerStore>, state_manager: Arc<StateManager>) -> ImageResult<ImageStore> {
        let layers = layer_store.map();

        let mut images = Images::default();
        for record in state_manager.all_images()? {
            let image = match Image::from_json(&record.config) {
                Ok(image) => image,
                Err(err) => {
                    warn!("Skipping image {}: {}", record.id, err);
                    continue;
                }
            };

            let layer = match image.rootfs.chain_id() {
                Some(chain_id) => {
                    match layers.get(&chain_id) {
                        Some(layer) => Some(layer.clone()),
                        None => {
                            warn!("Skipping image {}: layer {} is not registered", record.id, chain_id);
                            continue;
                        }
                    }
                }
                None => None
            };

            images.images.insert(
                record.id,
                StoredImage {
                    image,
                    config: record.config,
                    parent: record.parent,
                    built_locally: record.built_locally,
                    layer
                }
            );
        }

        let edges = images.images
            .iter()
            .filter_map(|(id, stored)| stored.parent.clone().map(|parent| (id.clone(), parent)))
            .collect::<Vec<_>>();
        for (id, parent) in edges {
            if images.images.contains_key(&parent) {
                images.children.entry(parent).or_default().insert(id);
            } else if let Some(stored) = images.images.get_mut(&id) {
                debug!("Unlinking image {} from missing parent {}", id, parent);
                stored.parent = None;
            }
        }

        debug!("Loaded {} images", images.images.len());

        Ok(
            ImageStore {
                layer_store,
                state_manager,
                images: RwLock::new(images)
            }
        )
    }

    fn read(&self) -> RwLockReadGuard<'_, Images> {
        self.images.read().unwrap_or_else(|err| err.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Images> {
        self.images.write().unwrap_or_else(|err| err.into_inner())
    }

    fn not_found(id: &ImageId) -> ImageError {
        ImageError::ImageNotFound { reference: id.to_string() }
    }

    /// Stores the serialized image config. The same bytes always give the same ID and a single record.
    pub fn create(&self, config: &[u8]) -> ImageResult<ImageId> {
        let image = Image::from_json(config)?;
        let id = Image::compute_id(config);

        let mut images = self.write();
        if images.images.contains_key(&id) {
            return Ok(id);
        }

        let layer = match image.rootfs.chain_id() {
            Some(chain_id) => Some(self.layer_store.get(&chain_id)?),
            None => None
        };

        if let Err(err) = self.state_manager.insert_image(&id, config) {
            if let Some(layer) = layer.as_ref() {
                if let Err(release_err) = self.layer_store.release(layer) {
                    warn!("Failed to release layer {}: {}", layer.chain_id(), release_err);
                }
            }

            return Err(err.into());
        }

        images.images.insert(
            id.clone(),
            StoredImage {
                image,
                config: config.to_vec(),
                parent: None,
                built_locally: false,
                layer
            }
        );

        info!("Created image {}", id);
        Ok(id)
    }

    pub fn get(&self, id: &ImageId) -> ImageResult<Image> {
        self.read().images.get(id).map(|stored| stored.image.clone()).ok_or_else(|| ImageStore::not_found(id))
    }

    /// The exact bytes the image ID was computed from.
    pub fn get_config(&self, id: &ImageId) -> ImageResult<Vec<u8>> {
        self.read().images.get(id).map(|stored| stored.config.clone()).ok_or_else(|| ImageStore::not_found(id))
    }

    pub fn contains(&self, id: &ImageId) -> bool {
        self.read().images.contains_key(id)
    }

    /// Removes the image and gives back its layer reference. Children of the image become parentless.
    pub fn delete(&self, id: &ImageId) -> ImageResult<Vec<LayerMetadata>> {
        let stored = {
            let mut images = self.write();
            if !images.images.contains_key(id) {
                return Err(ImageStore::not_found(id));
            }

            self.state_manager.remove_image(id)?;

            let stored = images.images.remove(id).ok_or_else(|| ImageStore::not_found(id))?;
            if let Some(parent) = stored.parent.as_ref() {
                images.unlink(id, parent);
            }

            if let Some(children) = images.children.remove(id) {
                for child in children {
                    if let Some(child) = images.images.get_mut(&child) {
                        child.parent = None;
                    }
                }
            }

            stored
        };

        info!("Deleted image {}", id);
        match stored.layer.as_ref() {
            Some(layer) => self.layer_store.release(layer),
            None => Ok(Vec::new())
        }
    }

    /// Links `id` to `parent`, replacing any previous link. Readers see either the old or the new edge.
    pub fn set_parent(&self, id: &ImageId, parent: &ImageId) -> ImageResult<()> {
        let mut images = self.write();
        if !images.images.contains_key(parent) {
            return Err(ImageStore::not_found(parent));
        }

        let previous = match images.images.get(id) {
            Some(stored) => stored.parent.clone(),
            None => return Err(ImageStore::not_found(id))
        };

        self.state_manager.set_image_parent(id, Some(parent))?;

        if let Some(previous) = previous.as_ref() {
            images.unlink(id, previous);
        }

        images.children.entry(parent.clone()).or_default().insert(id.clone());
        if let Some(stored) = images.images.get_mut(id) {
            stored.parent = Some(parent.clone());
        }

        Ok(())
    }

    pub fn get_parent(&self, id: &ImageId) -> ImageResult<Option<ImageId>> {
        self.read().images.get(id).map(|stored| stored.parent.clone()).ok_or_else(|| ImageStore::not_found(id))
    }

    pub fn set_built_locally(&self, id: &ImageId) -> ImageResult<()> {
        let mut images = self.write();
        let stored = images.images.get_mut(id).ok_or_else(|| ImageStore::not_found(id))?;
        self.state_manager.set_image_built_locally(id)?;
        stored.built_locally = true;
        Ok(())
    }

    pub fn is_built_locally(&self, id: &ImageId) -> ImageResult<bool> {
        self.read().images.get(id).map(|stored| stored.built_locally).ok_or_else(|| ImageStore::not_found(id))
    }

    pub fn children(&self, id: &ImageId) -> Vec<ImageId> {
        self.read().children
            .get(id)
            .map(|children| children.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_children(&self, id: &ImageId) -> bool {
        self.read().children.contains_key(id)
    }

    /// Point-in-time copy of every image.
    pub fn map(&self) -> HashMap<ImageId, Image> {
        self.read().images
            .iter()
            .map(|(id, stored)| (id.clone(), stored.image.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().images.is_empty()
    }

    /// Resolves a full ID or an unambiguous prefix of its hex part.
    pub fn search(&self, prefix: &str) -> ImageResult<ImageId> {
        let hex_prefix = prefix.strip_prefix("sha256:").unwrap_or(prefix);
        if hex_prefix.is_empty() {
            return Err(ImageError::ImageNotFound { reference: prefix.to_owned() });
        }

        let images = self.read();
        let mut matches = images.images.keys().filter(|id| id.digest().hex().starts_with(hex_prefix));

        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(id.clone()),
            (Some(_), Some(_)) => Err(ImageError::InvalidReference { message: format!("ambiguous image ID prefix '{}'", prefix) }),
            _ => Err(ImageError::ImageNotFound { reference: prefix.to_owned() })
        }
    }

    pub fn top_layer(&self, id: &ImageId) -> ImageResult<Option<ChainId>> {
        self.read().images
            .get(id)
            .map(|stored| stored.layer.as_ref().map(|layer| layer.chain_id().clone()))
            .ok_or_else(|| ImageStore::not_found(id))
    }
}

/// Garbage collection pins held on behalf of image records.
pub trait Leases: Send + Sync {
    fn create(&self, id: &str) -> Result<(), String>;
    fn delete(&self, id: &str) -> Result<(), String>;
}

pub type LeasesRef = Arc<dyn Leases>;

pub struct NoLeases;

impl NoLeases {
    pub fn new() -> Arc<NoLeases> {
        Arc::new(NoLeases)
    }
}

impl Leases for NoLeases {
    fn create(&self, _id: &str) -> Result<(), String> {
        Ok(())
    }

    fn delete(&self, _id: &str) -> Result<(), String> {
        Ok(())
    }
}

pub fn lease_id(id: &ImageId) -> String {
    format!("strata-image-{}", id.digest().hex())
}

/// Image store that holds a lease for every image record it creates.
pub struct LeasedImageStore {
    store: ImageStore,
    leases: LeasesRef
}

impl LeasedImageStore {
    pub fn new(store: ImageStore, leases: LeasesRef) -> LeasedImageStore {
        LeasedImageStore {
            store,
            leases
        }
    }

    pub fn create(&self, config: &[u8]) -> ImageResult<ImageId> {
        let id = Image::compute_id(config);
        let lease = lease_id(&id);
        self.leases.create(&lease).map_err(|message| ImageError::Lease { id: lease.clone(), message })?;

        match self.store.create(config) {
            Ok(id) => Ok(id),
            Err(err) => {
                if !self.store.contains(&id) {
                    if let Err(lease_err) = self.leases.delete(&lease) {
                        warn!("Failed to remove lease {}: {}", lease, lease_err);
                    }
                }

                Err(err)
            }
        }
    }

    pub fn delete(&self, id: &ImageId) -> ImageResult<Vec<LayerMetadata>> {
        let removed = self.store.delete(id)?;

        let lease = lease_id(id);
        if let Err(err) = self.leases.delete(&lease) {
            warn!("Failed to remove lease {}: {}", lease, err);
        }

        Ok(removed)
    }
}

impl Deref for LeasedImageStore {
    type Target = ImageStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}
