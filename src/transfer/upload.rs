use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::digest::{ChainId, DiffId, Digest, DigestingWriter};
use crate::error::{ImageError, ImageResult};
use crate::layer::LayerStore;
use crate::printing::ProgressSinkRef;
use crate::transfer::download::BlobStream;
use crate::transfer::limiter::ConcurrencyLimiter;
use crate::transfer::manager::{TransferContext, TransferError, TransferManager, TransferResult};
use crate::transfer::metadata::BlobMetadataService;

pub const MAX_UPLOAD_ATTEMPTS: usize = 5;

/// Destination of blobs, typically a registry.
#[async_trait]
pub trait BlobPusher: Send + Sync {
    async fn exists(&self, digest: &Digest) -> ImageResult<bool>;
    async fn push_blob(&self, digest: &Digest, content: BlobStream, size: u64) -> ImageResult<()>;
}

/// One blob to upload.
#[async_trait]
pub trait UploadDescriptor: Send + Sync {
    fn key(&self) -> String;
    fn id(&self) -> String;

    /// Uploads the blob and returns the digest it was stored under.
    async fn upload(&self, cancel: &CancellationToken, progress: &ProgressSinkRef) -> ImageResult<Digest>;
}

pub type UploadDescriptorRef = Arc<dyn UploadDescriptor>;

/// Uploads the diff of a registered layer as a gzip compressed blob.
pub struct LayerUploadDescriptor {
    layer_store: Arc<LayerStore>,
    chain_id: ChainId,
    diff_id: DiffId,
    pusher: Arc<dyn BlobPusher>,
    metadata: Arc<BlobMetadataService>
}

impl LayerUploadDescriptor {
    pub fn new(layer_store: Arc<LayerStore>,
               chain_id: ChainId,
               diff_id: DiffId,
               pusher: Arc<dyn BlobPusher>,
               metadata: Arc<BlobMetadataService>) -> LayerUploadDescriptor {
        LayerUploadDescriptor {
            layer_store,
            chain_id,
            diff_id,
            pusher,
            metadata
        }
    }

    /// Compresses the diff into an anonymous temporary file, returned rewound together with its digest and size.
    fn compress(layer_store: &LayerStore, chain_id: &ChainId, cancel: &CancellationToken) -> ImageResult<(File, Digest, u64)> {
        let mut diff = layer_store.tar_stream(chain_id)?;
        let mut encoder = GzEncoder::new(DigestingWriter::new(tempfile::tempfile()?), Compression::default());

        let mut buffer = vec![0; 64 * 1024];
        loop {
            if cancel.is_cancelled() {
                return Err(ImageError::Cancelled);
            }

            let count = match diff.read(&mut buffer) {
                Ok(count) => count,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into())
            };

            if count == 0 {
                break;
            }

            encoder.write_all(&buffer[..count])?;
        }

        encoder.flush()?;
        let (mut file, digest, size) = encoder.finish()?.finish();
        file.seek(SeekFrom::Start(0))?;
        Ok((file, digest, size))
    }
}

#[async_trait]
impl UploadDescriptor for LayerUploadDescriptor {
    fn key(&self) -> String {
        format!("layer:{}", self.diff_id)
    }

    fn id(&self) -> String {
        self.diff_id.short().to_owned()
    }

    async fn upload(&self, cancel: &CancellationToken, progress: &ProgressSinkRef) -> ImageResult<Digest> {
        let layer_store = self.layer_store.clone();
        let chain_id = self.chain_id.clone();
        let compress_cancel = cancel.clone();
        let (file, digest, size) = tokio::task::spawn_blocking(move || LayerUploadDescriptor::compress(&layer_store, &chain_id, &compress_cancel))
            .await
            .map_err(|err| ImageError::Other { message: err.to_string() })??;

        if cancel.is_cancelled() {
            return Err(ImageError::Cancelled);
        }

        if self.pusher.exists(&digest).await? {
            progress.progress(&self.id(), "Layer already exists", 0, None);
        } else {
            let content: BlobStream = Box::new(tokio::fs::File::from_std(file));
            tokio::select! {
                result = self.pusher.push_blob(&digest, content, size) => result?,
                _ = cancel.cancelled() => return Err(ImageError::Cancelled)
            }

            progress.progress(&self.id(), "Pushed", size, Some(size));
        }

        self.metadata.set_diff_id(&digest, &self.diff_id)?;
        Ok(digest)
    }
}

/// Uploads blobs with bounded concurrency, sharing uploads of the same blob.
pub struct LayerUploadManager {
    transfers: TransferManager<Digest>,
    max_attempts: usize,
    retry_delay: Duration
}

impl LayerUploadManager {
    pub fn new(max_concurrent: usize, retry_delay: Duration) -> LayerUploadManager {
        LayerUploadManager::with_attempts(max_concurrent, MAX_UPLOAD_ATTEMPTS, retry_delay)
    }

    pub fn with_attempts(max_concurrent: usize, max_attempts: usize, retry_delay: Duration) -> LayerUploadManager {
        LayerUploadManager {
            transfers: TransferManager::new(ConcurrencyLimiter::new(max_concurrent), |_: Digest| {}),
            max_attempts: max_attempts.max(1),
            retry_delay
        }
    }

    pub fn set_concurrency(&self, limit: usize) {
        self.transfers.set_concurrency(limit);
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        self.transfers.limiter()
    }

    /// Uploads every descriptor, returning the digests in the same order.
    pub async fn upload(&self,
                        cancel: &CancellationToken,
                        layers: &[UploadDescriptorRef],
                        progress: ProgressSinkRef) -> ImageResult<Vec<Digest>> {
        if cancel.is_cancelled() {
            return Err(ImageError::Cancelled);
        }

        let watchers = layers
            .iter()
            .map(|descriptor| {
                let descriptor = descriptor.clone();
                let progress = progress.clone();
                let max_attempts = self.max_attempts;
                let retry_delay = self.retry_delay;

                self.transfers.transfer(&descriptor.key(), move |context| {
                    upload_with_retries(context, descriptor, max_attempts, retry_delay, progress)
                })
            })
            .collect::<Vec<_>>();

        let mut digests = Vec::with_capacity(watchers.len());
        for watcher in &watchers {
            let result = tokio::select! {
                result = watcher.wait() => result,
                _ = cancel.cancelled() => Err(TransferError::Cancelled)
            };

            digests.push(result.map_err(|err| err.into_image_error(watcher.key()))?);
        }

        Ok(digests)
    }
}

async fn upload_with_retries(context: TransferContext,
                             descriptor: UploadDescriptorRef,
                             max_attempts: usize,
                             retry_delay: Duration,
                             progress: ProgressSinkRef) -> TransferResult<Digest> {
    let _slot = context.acquire_slot().await?;

    let mut attempt = 1;
    loop {
        match descriptor.upload(&context.cancel, &progress).await {
            Ok(digest) => {
                info!("Uploaded {} as {}", descriptor.id(), digest);
                return Ok(digest);
            }
            Err(err) if err.is_cancelled() => return Err(TransferError::Cancelled),
            Err(err) if attempt >= max_attempts => return Err(err.into()),
            Err(err) => {
                let delay = retry_delay * attempt as u32;
                warn!("Upload of {} failed (attempt {}): {}", descriptor.id(), attempt, err);
                progress.progress(&descriptor.id(), &format!("Retrying in {} seconds", delay.as_secs()), 0, None);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = context.cancel.cancelled() => return Err(TransferError::Cancelled)
                }

                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use flate2::read::GzDecoder;
    use std::io::Read;
    use tokio_util::sync::CancellationToken;

    use super::{LayerUploadDescriptor, LayerUploadManager, UploadDescriptor, UploadDescriptorRef};
    use crate::digest::Digest;
    use crate::layer::{DirectoryDriver, LayerStore};
    use crate::printing::{EmptyProgress, ProgressSinkRef};
    use crate::state::StateManager;
    use crate::test_helpers::{tar_with_files, MemoryBlobPusher, TempFolder};
    use crate::transfer::metadata::BlobMetadataService;

    fn create_layer_store(folder: &TempFolder, state_manager: Arc<StateManager>) -> Arc<LayerStore> {
        let driver = DirectoryDriver::new(folder.join("layers"), folder.join("mounts")).unwrap();
        Arc::new(LayerStore::new(Arc::new(driver), state_manager).unwrap())
    }

    #[tokio::test]
    async fn test_upload_layers() {
        let folder = TempFolder::new();
        let state_manager = Arc::new(StateManager::in_memory().unwrap());
        let layer_store = create_layer_store(&folder, state_manager.clone());
        let metadata = Arc::new(BlobMetadataService::new(state_manager));
        let pusher = MemoryBlobPusher::new();

        let diff = tar_with_files(&[("file", b"content")]);
        let layer = layer_store.register(&diff[..], None).unwrap();

        let descriptor: UploadDescriptorRef = Arc::new(LayerUploadDescriptor::new(
            layer_store.clone(),
            layer.chain_id().clone(),
            layer.diff_id().clone(),
            pusher.clone(),
            metadata.clone()
        ));

        let manager = LayerUploadManager::new(2, Duration::from_secs(0));
        let digests = manager.upload(&CancellationToken::new(), &[descriptor], EmptyProgress::new()).await.unwrap();
        assert_eq!(1, digests.len());

        let blob = pusher.blob(&digests[0]).unwrap();
        let mut uncompressed = Vec::new();
        GzDecoder::new(&blob[..]).read_to_end(&mut uncompressed).unwrap();
        assert_eq!(diff, uncompressed);
        assert_eq!(Digest::of_bytes(&blob), digests[0]);
        assert_eq!(Some(layer.diff_id().clone()), metadata.get_diff_id(&digests[0]).unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_upload_pushes_nothing() {
        let folder = TempFolder::new();
        let state_manager = Arc::new(StateManager::in_memory().unwrap());
        let layer_store = create_layer_store(&folder, state_manager.clone());
        let metadata = Arc::new(BlobMetadataService::new(state_manager));
        let pusher = MemoryBlobPusher::new();

        let layer = layer_store.register(&tar_with_files(&[("file", b"content")])[..], None).unwrap();
        let descriptor = LayerUploadDescriptor::new(
            layer_store.clone(),
            layer.chain_id().clone(),
            layer.diff_id().clone(),
            pusher.clone(),
            metadata
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let progress: ProgressSinkRef = EmptyProgress::new();
        let err = descriptor.upload(&cancel, &progress).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(0, pusher.push_attempts());
        assert_eq!(0, pusher.len());
    }

    #[tokio::test]
    async fn test_upload_retries() {
        let folder = TempFolder::new();
        let state_manager = Arc::new(StateManager::in_memory().unwrap());
        let layer_store = create_layer_store(&folder, state_manager.clone());
        let metadata = Arc::new(BlobMetadataService::new(state_manager));
        let pusher = MemoryBlobPusher::new();
        pusher.fail_next(2);

        let layer = layer_store.register(&tar_with_files(&[("file", b"content")])[..], None).unwrap();
        let descriptor: UploadDescriptorRef = Arc::new(LayerUploadDescriptor::new(
            layer_store.clone(),
            layer.chain_id().clone(),
            layer.diff_id().clone(),
            pusher.clone(),
            metadata
        ));

        let manager = LayerUploadManager::new(2, Duration::from_secs(0));
        let digests = manager.upload(&CancellationToken::new(), &[descriptor], EmptyProgress::new()).await.unwrap();
        assert!(pusher.blob(&digests[0]).is_some());
        assert_eq!(3, pusher.push_attempts());
    }

    #[tokio::test]
    async fn test_upload_gives_up() {
        let folder = TempFolder::new();
        let state_manager = Arc::new(StateManager::in_memory().unwrap());
        let layer_store = create_layer_store(&folder, state_manager.clone());
        let metadata = Arc::new(BlobMetadataService::new(state_manager));
        let pusher = MemoryBlobPusher::new();
        pusher.fail_next(10);

        let layer = layer_store.register(&tar_with_files(&[("file", b"content")])[..], None).unwrap();
        let descriptor: UploadDescriptorRef = Arc::new(LayerUploadDescriptor::new(
            layer_store.clone(),
            layer.chain_id().clone(),
            layer.diff_id().clone(),
            pusher.clone(),
            metadata
        ));

        let manager = LayerUploadManager::with_attempts(2, 3, Duration::from_secs(0));
        let err = manager.upload(&CancellationToken::new(), &[descriptor], EmptyProgress::new()).await.unwrap_err();
        assert!(!err.is_cancelled());
        assert_eq!(3, pusher.push_attempts());
    }
}
