use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;

use crate::config::StoreConfig;
use crate::container::{Container, ContainerStore};
use crate::digest::ImageId;
use crate::error::{ImageError, ImageResult};
use crate::events::{emit, EventAction, EventsSinkRef};
use crate::image::Image;
use crate::image_store::{ImageStore, LeasedImageStore, LeasesRef};
use crate::layer::{CreateRwLayerOpts, DirectoryDriver, LayerMetadata, LayerStore, MountInit, RwLayer, StorageDriver};
use crate::reference::{ImageTag, NamedReference, Reference};
use crate::reference_store::ReferenceStore;
use crate::state::StateManager;
use crate::transfer::{BlobMetadataService, LayerDownloadManager, LayerUploadManager};

mod commit;
mod usage;
mod delete;
mod pull;

pub use commit::{BuildCommitConfig, CommitConfig, RwLayerExporter};
pub use delete::{ImageDeleteResponse, PruneReport};
pub use pull::ImageManifest;

/// Everything the image service is wired to.
pub struct ImageServiceConfig {
    pub layer_store: Arc<LayerStore>,
    pub image_store: Arc<LeasedImageStore>,
    pub reference_store: Arc<ReferenceStore>,
    pub containers: Arc<dyn ContainerStore>,
    pub events: EventsSinkRef,
    pub blob_metadata: Arc<BlobMetadataService>,
    pub download_manager: Arc<LayerDownloadManager>,
    pub upload_manager: Arc<LayerUploadManager>
}

#[derive(Debug, Clone)]
pub struct ImageSummary {
    pub id: ImageId,
    pub references: Vec<NamedReference>,
    pub created: Option<DateTime<Utc>>,
    pub size: u64,
    pub children: usize
}

/// Ties the layer, image and reference stores together for the operations that span them.
pub struct ImageService {
    layer_store: Arc<LayerStore>,
    image_store: Arc<LeasedImageStore>,
    reference_store: Arc<ReferenceStore>,
    containers: Arc<dyn ContainerStore>,
    events: EventsSinkRef,
    blob_metadata: Arc<BlobMetadataService>,
    download_manager: Arc<LayerDownloadManager>,
    upload_manager: Arc<LayerUploadManager>
}

impl ImageService {
    pub fn new(config: ImageServiceConfig) -> ImageService {
        ImageService {
            layer_store: config.layer_store,
            image_store: config.image_store,
            reference_store: config.reference_store,
            containers: config.containers,
            events: config.events,
            blob_metadata: config.blob_metadata,
            download_manager: config.download_manager,
            upload_manager: config.upload_manager
        }
    }

    /// Opens the stores persisted below the configured base folder.
    pub fn open(config: &StoreConfig,
                containers: Arc<dyn ContainerStore>,
                events: EventsSinkRef,
                leases: LeasesRef) -> ImageResult<ImageService> {
        let driver = DirectoryDriver::new(config.layers_folder(), config.mounts_folder())?;
        ImageService::open_with_driver(config, Arc::new(driver), containers, events, leases)
    }

    /// Opens the stores persisted below the configured base folder, keeping layers in `driver`.
    pub fn open_with_driver(config: &StoreConfig,
                            driver: Arc<dyn StorageDriver>,
                            containers: Arc<dyn ContainerStore>,
                            events: EventsSinkRef,
                            leases: LeasesRef) -> ImageResult<ImageService> {
        let state_manager = Arc::new(StateManager::new(&config.state_folder())?);
        let layer_store = Arc::new(LayerStore::new(driver, state_manager.clone())?);
        let image_store = ImageStore::new(layer_store.clone(), state_manager.clone())?;

        Ok(
            ImageService::new(
                ImageServiceConfig {
                    layer_store: layer_store.clone(),
                    image_store: Arc::new(LeasedImageStore::new(image_store, leases)),
                    reference_store: Arc::new(ReferenceStore::new(state_manager.clone())?),
                    containers,
                    events,
                    blob_metadata: Arc::new(BlobMetadataService::new(state_manager)),
                    download_manager: Arc::new(
                        LayerDownloadManager::new(
                            layer_store,
                            config.max_concurrent_downloads,
                            config.max_download_attempts,
                            config.download_retry_delay()
                        )
                    ),
                    upload_manager: Arc::new(LayerUploadManager::new(config.max_concurrent_uploads, config.download_retry_delay()))
                }
            )
        )
    }

    pub fn layer_store(&self) -> &Arc<LayerStore> {
        &self.layer_store
    }

    pub fn image_store(&self) -> &Arc<LeasedImageStore> {
        &self.image_store
    }

    pub fn reference_store(&self) -> &Arc<ReferenceStore> {
        &self.reference_store
    }

    /// Resolves a tag, digest reference, full image ID or unambiguous ID prefix.
    pub fn resolve_image(&self, reference: &str) -> ImageResult<ImageId> {
        match Reference::from_str(reference) {
            Ok(Reference::ImageId(id)) => {
                if self.image_store.contains(&id) {
                    return Ok(id);
                }
            }
            Ok(Reference::Named(name)) => {
                if let Ok(id) = self.reference_store.get(&name) {
                    return Ok(id);
                }
            }
            Err(_) => {}
        }

        self.image_store.search(reference).map_err(|err| {
            if err.is_not_found() {
                ImageError::ImageNotFound { reference: reference.to_owned() }
            } else {
                err
            }
        })
    }

    pub fn get_image(&self, reference: &str) -> ImageResult<(ImageId, Image)> {
        let id = self.resolve_image(reference)?;
        let image = self.image_store.get(&id)?;
        Ok((id, image))
    }

    pub fn children(&self, id: &ImageId) -> Vec<ImageId> {
        self.image_store.children(id)
    }

    pub fn count_images(&self) -> usize {
        self.image_store.len()
    }

    /// Creates the writable layer of a container on top of its image.
    pub fn create_layer(&self, container: &Container, init_func: Option<MountInit>) -> ImageResult<RwLayer> {
        let opts = CreateRwLayerOpts {
            mount_label: container.mount_label.clone(),
            init_func,
            ..Default::default()
        };

        self.create_layer_from_image(container.image_id.as_ref(), &container.id, opts)
    }

    pub fn create_layer_from_image(&self, image_id: Option<&ImageId>, name: &str, opts: CreateRwLayerOpts) -> ImageResult<RwLayer> {
        let parent = match image_id {
            Some(image_id) => self.image_store.get(image_id)?.rootfs.chain_id(),
            None => None
        };

        self.layer_store.create_rw_layer(name, parent.as_ref(), opts)
    }

    pub fn get_layer_by_id(&self, container_id: &str) -> ImageResult<RwLayer> {
        self.layer_store.get_rw_layer(container_id)
    }

    pub fn get_layer_mount_id(&self, container_id: &str) -> ImageResult<String> {
        self.layer_store.get_mount_id(container_id)
    }

    /// Gives back a writable layer reference. A writable layer that is already gone is not an error.
    pub fn release_layer(&self, rw_layer: &RwLayer) -> ImageResult<()> {
        match self.layer_store.release_rw_layer(rw_layer) {
            Ok(metadata) => {
                log_release_metadata(&metadata);
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err)
        }
    }

    /// Unmounts everything, used at shutdown.
    pub fn cleanup(&self) -> ImageResult<()> {
        self.layer_store.cleanup()
    }

    /// Changes the transfer bounds. Zero keeps the current bound.
    pub fn update_config(&self, max_downloads: usize, max_uploads: usize) {
        if max_downloads > 0 {
            self.download_manager.set_concurrency(max_downloads);
        }

        if max_uploads > 0 {
            self.upload_manager.set_concurrency(max_uploads);
        }
    }

    pub fn tag_image(&self, reference: &str, tag: &ImageTag) -> ImageResult<ImageId> {
        let id = self.resolve_image(reference)?;
        self.reference_store.add_tag(tag, &id, true)?;
        emit(&self.events, EventAction::Tag, id.as_str(), &tag.to_string());
        Ok(id)
    }

    /// Every image with its names, newest first.
    pub fn list_images(&self) -> Vec<ImageSummary> {
        let layers = self.layer_store.map();

        let mut images = self.image_store.map()
            .into_iter()
            .map(|(id, image)| {
                let size = image.rootfs.chain_id()
                    .and_then(|chain_id| layers.get(&chain_id))
                    .map(|layer| layer.size())
                    .unwrap_or(0);

                ImageSummary {
                    references: self.reference_store.references_to(&id),
                    children: self.image_store.children(&id).len(),
                    created: image.created,
                    size,
                    id
                }
            })
            .collect::<Vec<_>>();

        images.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id)));
        images
    }
}

fn log_release_metadata(metadata: &[LayerMetadata]) {
    for layer in metadata {
        info!("Layer {} cleaned up", layer.chain_id);
    }
}
