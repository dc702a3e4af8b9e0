use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::digest::{Digest, ImageId};
use crate::error::{ImageError, ImageResult};
use crate::events::{emit, EventAction};
use crate::image::Image;
use crate::printing::ProgressSinkRef;
use crate::reference::ImageTag;
use crate::service::ImageService;
use crate::transfer::{BlobDownloadDescriptor, BlobPusher, ContentProvider, DownloadDescriptorRef, LayerUploadDescriptor, UploadDescriptorRef};

/// Blobs making up an image: the config blob and the layer blobs, bottom layer first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
    pub config: Digest,
    pub layers: Vec<Digest>
}

impl ImageService {
    /// Downloads an image and optionally tags it.
    pub async fn pull_image(&self,
                            cancel: &CancellationToken,
                            provider: Arc<dyn ContentProvider>,
                            manifest: &ImageManifest,
                            tag: Option<&ImageTag>,
                            progress: ProgressSinkRef) -> ImageResult<ImageId> {
        let config = fetch_config(cancel, provider.as_ref(), &manifest.config).await?;
        let image = Image::from_json(&config)?;

        if image.rootfs.diff_ids.len() != manifest.layers.len() {
            return Err(ImageError::InvalidLayerCount { expected: image.rootfs.diff_ids.len(), actual: manifest.layers.len() });
        }

        let descriptors = manifest.layers
            .iter()
            .zip(image.rootfs.diff_ids.iter())
            .map(|(digest, diff_id)| {
                Arc::new(
                    BlobDownloadDescriptor::new(digest.clone(), Some(diff_id.clone()), provider.clone(), self.blob_metadata.clone())
                ) as DownloadDescriptorRef
            })
            .collect::<Vec<_>>();

        let downloaded = match self.download_manager.download(cancel, &descriptors, progress.clone()).await {
            Ok(downloaded) => downloaded,
            Err(partial) => {
                partial.value.release.release();
                return Err(partial.error);
            }
        };

        if downloaded.root_fs.diff_ids != image.rootfs.diff_ids {
            downloaded.release.release();
            let actual = downloaded.root_fs.diff_ids.last().cloned();
            return match (image.rootfs.diff_ids.last().cloned(), actual) {
                (Some(expected), Some(actual)) => Err(ImageError::DiffIdMismatch { expected, actual }),
                _ => Err(ImageError::InvalidLayerCount { expected: image.rootfs.diff_ids.len(), actual: downloaded.root_fs.diff_ids.len() })
            };
        }

        let created = self.image_store.create(&config);
        downloaded.release.release();
        let id = created?;

        let name = match tag {
            Some(tag) => {
                self.reference_store.add_tag(tag, &id, true)?;
                emit(&self.events, EventAction::Tag, id.as_str(), &tag.to_string());
                tag.to_string()
            }
            None => String::new()
        };

        emit(&self.events, EventAction::Pull, id.as_str(), &name);
        progress.println(&format!("Pulled image {}", id));
        info!("Pulled image {}", id);
        Ok(id)
    }

    /// Uploads the layers and config of an image.
    pub async fn push_image(&self,
                            cancel: &CancellationToken,
                            reference: &str,
                            pusher: Arc<dyn BlobPusher>,
                            progress: ProgressSinkRef) -> ImageResult<ImageManifest> {
        let (id, image) = self.get_image(reference)?;

        let descriptors = image.rootfs.chain_ids()
            .into_iter()
            .zip(image.rootfs.diff_ids.iter())
            .map(|(chain_id, diff_id)| {
                Arc::new(
                    LayerUploadDescriptor::new(
                        self.layer_store.clone(),
                        chain_id,
                        diff_id.clone(),
                        pusher.clone(),
                        self.blob_metadata.clone()
                    )
                ) as UploadDescriptorRef
            })
            .collect::<Vec<_>>();

        let layers = self.upload_manager.upload(cancel, &descriptors, progress.clone()).await?;

        let config = self.image_store.get_config(&id)?;
        let config_digest = id.digest().clone();
        if !pusher.exists(&config_digest).await? {
            let size = config.len() as u64;
            pusher.push_blob(&config_digest, Box::new(std::io::Cursor::new(config)), size).await?;
        }

        emit(&self.events, EventAction::Push, id.as_str(), reference);
        progress.println(&format!("Pushed image {}", id));

        Ok(
            ImageManifest {
                config: config_digest,
                layers
            }
        )
    }
}

async fn fetch_config(cancel: &CancellationToken, provider: &dyn ContentProvider, digest: &Digest) -> ImageResult<Vec<u8>> {
    let (mut stream, _) = tokio::select! {
        result = provider.fetch(digest) => result?,
        _ = cancel.cancelled() => return Err(ImageError::Cancelled)
    };

    let mut config = Vec::new();
    tokio::select! {
        result = stream.read_to_end(&mut config) => { result?; }
        _ = cancel.cancelled() => return Err(ImageError::Cancelled)
    }

    if &Digest::of_bytes(&config) != digest {
        warn!("Config blob {} does not match its digest", digest);
        return Err(ImageError::InvalidImageConfig { message: format!("config blob does not match digest {}", digest) });
    }

    Ok(config)
}
