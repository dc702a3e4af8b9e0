use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU8, Ordering};

use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::digest::ImageId;
use crate::error::{ImageError, ImageResult};
use crate::events::{emit, EventAction};
use crate::image::{ChildConfig, ContainerConfig, Image};
use crate::layer::{LayerStore, RwLayer};
use crate::service::{log_release_metadata, ImageService};

/// Describes how a container becomes an image.
#[derive(Clone, Debug, Default)]
pub struct CommitConfig {
    pub author: Option<String>,
    pub comment: Option<String>,
    pub config: Option<ContainerConfig>,
    pub container_config: Option<ContainerConfig>,
    pub container_id: String,
    pub container_mount_label: String,
    pub container_os: String,
    pub parent_image_id: Option<ImageId>
}

/// Commit of a build step. The rest is taken from the container record.
#[derive(Clone, Debug, Default)]
pub struct BuildCommitConfig {
    pub author: Option<String>,
    pub comment: Option<String>,
    pub config: Option<ContainerConfig>,
    pub container_config: Option<ContainerConfig>,
    pub container_id: String
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Tar stream of a mounted writable layer.
///
/// The layer is unmounted and its reference given back exactly once: at end of stream, on `close` or on drop,
/// whichever comes first.
pub struct RwLayerExporter {
    archive: Mutex<Option<Box<dyn Read + Send>>>,
    rw_layer: RwLayer,
    layer_store: Arc<LayerStore>,
    state: AtomicU8
}

impl RwLayerExporter {
    fn new(archive: Box<dyn Read + Send>, rw_layer: RwLayer, layer_store: Arc<LayerStore>) -> RwLayerExporter {
        RwLayerExporter {
            archive: Mutex::new(Some(archive)),
            rw_layer,
            layer_store,
            state: AtomicU8::new(OPEN)
        }
    }

    fn archive(&self) -> MutexGuard<'_, Option<Box<dyn Read + Send>>> {
        self.archive.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CLOSED
    }

    pub fn close(&self) -> ImageResult<()> {
        if self.state.compare_exchange(OPEN, CLOSING, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Ok(());
        }

        self.archive().take();

        let unmount_result = match self.rw_layer.unmount() {
            Err(err) if !err.is_not_found() => Err(err),
            _ => Ok(())
        };

        let release_result = self.layer_store.release_rw_layer(&self.rw_layer).map(|metadata| log_release_metadata(&metadata));
        self.state.store(CLOSED, Ordering::SeqCst);
        debug!("Closed export of {}", self.rw_layer.name());

        unmount_result?;
        release_result
    }

    fn read_archive(&self, buffer: &mut [u8]) -> std::io::Result<usize> {
        let count = {
            let mut archive = self.archive();
            match archive.as_mut() {
                Some(archive) => archive.read(buffer)?,
                None => return Ok(0)
            }
        };

        if count == 0 && !buffer.is_empty() {
            self.close().map_err(|err| std::io::Error::other(err.to_string()))?;
        }

        Ok(count)
    }
}

impl Read for RwLayerExporter {
    fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
        self.read_archive(buffer)
    }
}

impl Read for &RwLayerExporter {
    fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
        self.read_archive(buffer)
    }
}

impl Drop for RwLayerExporter {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("Failed to release writable layer {}: {}", self.rw_layer.name(), err);
        }
    }
}

impl ImageService {
    /// Exports the changes of a container's writable layer as a tar stream.
    pub fn export_container_rw(&self, container_id: &str, mount_label: &str) -> ImageResult<RwLayerExporter> {
        let rw_layer = self.layer_store.get_rw_layer(container_id)?;

        if let Err(err) = rw_layer.mount(mount_label) {
            self.release_export_layer(&rw_layer);
            return Err(err);
        }

        match rw_layer.tar_stream() {
            Ok(archive) => Ok(RwLayerExporter::new(archive, rw_layer, self.layer_store.clone())),
            Err(err) => {
                if let Err(unmount_err) = rw_layer.unmount() {
                    warn!("Failed to unmount {}: {}", rw_layer.name(), unmount_err);
                }

                self.release_export_layer(&rw_layer);
                Err(err)
            }
        }
    }

    fn release_export_layer(&self, rw_layer: &RwLayer) {
        if let Err(err) = self.layer_store.release_rw_layer(rw_layer) {
            warn!("Failed to release writable layer {}: {}", rw_layer.name(), err);
        }
    }

    /// Creates a new image from the changes made in a container.
    pub fn commit_image(&self, cancel: &CancellationToken, config: CommitConfig) -> ImageResult<ImageId> {
        if cancel.is_cancelled() {
            return Err(ImageError::Cancelled);
        }

        let exporter = self.export_container_rw(&config.container_id, &config.container_mount_label)?;

        let parent = match config.parent_image_id.as_ref() {
            Some(parent_id) => self.image_store.get(parent_id)?,
            None => {
                let mut image = Image::empty();
                if !config.container_os.is_empty() {
                    image.os = config.container_os.clone();
                }

                image
            }
        };

        let layer = self.layer_store.register(&exporter, parent.rootfs.chain_id().as_ref())?;
        if let Err(err) = exporter.close() {
            if let Err(release_err) = self.layer_store.release(&layer) {
                warn!("Failed to release layer {}: {}", layer.chain_id(), release_err);
            }

            return Err(err);
        }

        let os = if config.container_os.is_empty() { None } else { Some(config.container_os.as_str()) };
        let child = Image::new_child(
            &parent,
            ChildConfig {
                container_id: config.container_id.clone(),
                author: config.author,
                comment: config.comment,
                container_config: config.container_config,
                config: config.config,
                diff_id: layer.diff_id().clone()
            },
            os
        );

        let created = child.to_json().and_then(|content| self.image_store.create(&content));
        if let Err(err) = self.layer_store.release(&layer) {
            warn!("Failed to release layer {}: {}", layer.chain_id(), err);
        }
        let id = created?;

        emit(&self.events, EventAction::Create, id.as_str(), "");

        self.image_store.set_built_locally(&id)?;
        if let Some(parent_id) = config.parent_image_id.as_ref() {
            self.image_store.set_parent(&id, parent_id)?;
        }

        Ok(id)
    }

    /// Creates an image from an uncompressed tar diff stacked on `parent`.
    pub fn import_image<R: Read>(&self, diff: R, parent_id: Option<&ImageId>, comment: Option<String>) -> ImageResult<ImageId> {
        let parent = match parent_id {
            Some(parent_id) => self.image_store.get(parent_id)?,
            None => Image::empty()
        };

        let layer = self.layer_store.register(diff, parent.rootfs.chain_id().as_ref())?;
        let child = Image::new_child(
            &parent,
            ChildConfig {
                container_id: String::new(),
                author: None,
                comment,
                container_config: None,
                config: None,
                diff_id: layer.diff_id().clone()
            },
            None
        );

        let created = child.to_json().and_then(|content| self.image_store.create(&content));
        if let Err(err) = self.layer_store.release(&layer) {
            warn!("Failed to release layer {}: {}", layer.chain_id(), err);
        }
        let id = created?;

        emit(&self.events, EventAction::Create, id.as_str(), "");
        if let Some(parent_id) = parent_id {
            self.image_store.set_parent(&id, parent_id)?;
        }

        Ok(id)
    }

    /// Commits a build step container. Only the in-memory container index is consulted.
    pub fn commit_build_step(&self, cancel: &CancellationToken, config: BuildCommitConfig) -> ImageResult<ImageId> {
        let container = self.containers
            .get(&config.container_id)
            .ok_or_else(|| ImageError::ContainerNotFound { id: config.container_id.clone() })?;

        self.commit_image(
            cancel,
            CommitConfig {
                author: config.author,
                comment: config.comment,
                config: config.config,
                container_config: config.container_config,
                container_id: container.id,
                container_mount_label: container.mount_label,
                container_os: container.os,
                parent_image_id: container.image_id
            }
        )
    }
}
