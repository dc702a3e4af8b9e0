use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use log::{info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::digest::{ChainId, DiffId, Digest};
use crate::error::{ImageError, ImageResult, Partial};
use crate::image::RootFs;
use crate::layer::{Layer, LayerStore};
use crate::printing::ProgressSinkRef;
use crate::transfer::limiter::ConcurrencyLimiter;
use crate::transfer::manager::{TransferContext, TransferError, TransferManager, TransferResult, Watcher};
use crate::transfer::metadata::BlobMetadataService;

pub type BlobStream = Box<dyn AsyncRead + Send + Unpin>;

/// Source of blobs, typically a registry.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Opens the blob with the given digest, returning it with its size when known.
    async fn fetch(&self, digest: &Digest) -> ImageResult<(BlobStream, Option<u64>)>;
}

/// One layer to download.
#[async_trait]
pub trait DownloadDescriptor: Send + Sync {
    /// Identifies the blob. Downloads with the same key at the same chain position are shared.
    fn key(&self) -> String;

    /// Short name used in progress output.
    fn id(&self) -> String;

    /// The diff ID of the layer if it is known before downloading.
    fn diff_id(&self) -> Option<DiffId>;

    async fn download(&self, cancel: &CancellationToken) -> ImageResult<(BlobStream, Option<u64>)>;

    /// Called once the blob has been registered as a layer.
    fn registered(&self, _diff_id: &DiffId) {

    }

    fn close(&self) {

    }
}

pub type DownloadDescriptorRef = Arc<dyn DownloadDescriptor>;

/// Downloads a blob from a content provider and remembers the diff it turned into.
pub struct BlobDownloadDescriptor {
    digest: Digest,
    expected_diff_id: Option<DiffId>,
    provider: Arc<dyn ContentProvider>,
    metadata: Arc<BlobMetadataService>
}

impl BlobDownloadDescriptor {
    pub fn new(digest: Digest,
               expected_diff_id: Option<DiffId>,
               provider: Arc<dyn ContentProvider>,
               metadata: Arc<BlobMetadataService>) -> BlobDownloadDescriptor {
        BlobDownloadDescriptor {
            digest,
            expected_diff_id,
            provider,
            metadata
        }
    }
}

#[async_trait]
impl DownloadDescriptor for BlobDownloadDescriptor {
    fn key(&self) -> String {
        format!("blob:{}", self.digest)
    }

    fn id(&self) -> String {
        self.digest.short().to_owned()
    }

    fn diff_id(&self) -> Option<DiffId> {
        if let Some(diff_id) = self.expected_diff_id.as_ref() {
            return Some(diff_id.clone());
        }

        match self.metadata.get_diff_id(&self.digest) {
            Ok(diff_id) => diff_id,
            Err(err) => {
                warn!("Failed to look up diff ID of {}: {}", self.digest, err);
                None
            }
        }
    }

    async fn download(&self, _cancel: &CancellationToken) -> ImageResult<(BlobStream, Option<u64>)> {
        self.provider.fetch(&self.digest).await
    }

    fn registered(&self, diff_id: &DiffId) {
        if let Err(err) = self.metadata.set_diff_id(&self.digest, diff_id) {
            warn!("Failed to store diff ID of {}: {}", self.digest, err);
        }
    }
}

struct ReleaseInner {
    layer_store: Arc<LayerStore>,
    layer: Mutex<Option<Layer>>
}

/// Holds the reference on the top layer of a download. Releasing more than once does nothing.
#[derive(Clone)]
pub struct ReleaseHandle {
    inner: Arc<ReleaseInner>
}

impl ReleaseHandle {
    fn new(layer_store: Arc<LayerStore>, layer: Option<Layer>) -> ReleaseHandle {
        ReleaseHandle {
            inner: Arc::new(ReleaseInner { layer_store, layer: Mutex::new(layer) })
        }
    }

    pub fn layer(&self) -> Option<Layer> {
        self.inner.layer.lock().unwrap_or_else(|err| err.into_inner()).clone()
    }

    pub fn release(&self) {
        let layer = self.inner.layer.lock().unwrap_or_else(|err| err.into_inner()).take();
        if let Some(layer) = layer {
            if let Err(err) = self.inner.layer_store.release(&layer) {
                warn!("Failed to release layer {}: {}", layer.chain_id(), err);
            }
        }
    }
}

impl std::fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("layer", &self.layer().map(|layer| layer.chain_id().clone()))
            .finish()
    }
}

#[derive(Debug)]
pub struct DownloadResult {
    pub root_fs: RootFs,
    pub release: ReleaseHandle
}

enum ParentLayer {
    Root,
    Registered(ChainId),
    Transfer(futures::future::Shared<futures::future::BoxFuture<'static, TransferResult<Layer>>>)
}

/// Downloads layers with bounded concurrency and registers them in chain order.
pub struct LayerDownloadManager {
    layer_store: Arc<LayerStore>,
    transfers: TransferManager<Layer>,
    max_attempts: usize,
    retry_delay: Duration
}

impl LayerDownloadManager {
    pub fn new(layer_store: Arc<LayerStore>,
               max_concurrent: usize,
               max_attempts: usize,
               retry_delay: Duration) -> LayerDownloadManager {
        let release_store = layer_store.clone();

        LayerDownloadManager {
            layer_store,
            transfers: TransferManager::new(
                ConcurrencyLimiter::new(max_concurrent),
                move |layer: Layer| {
                    if let Err(err) = release_store.release(&layer) {
                        warn!("Failed to release layer {}: {}", layer.chain_id(), err);
                    }
                }
            ),
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

    /// Downloads and registers `layers`, bottom layer first.
    ///
    /// On failure, the layers registered before the failing position are returned as a partial result.
    /// Either way, the caller owns the returned release handle.
    pub async fn download(&self,
                          cancel: &CancellationToken,
                          layers: &[DownloadDescriptorRef],
                          progress: ProgressSinkRef) -> Result<DownloadResult, Partial<DownloadResult>> {
        let mut root_fs = RootFs::new();
        let mut handles: Vec<Layer> = Vec::new();

        let mut error = None;
        if cancel.is_cancelled() {
            error = Some(ImageError::Cancelled);
        }

        let mut index = 0;
        while error.is_none() && index < layers.len() {
            let descriptor = &layers[index];
            let Some(diff_id) = descriptor.diff_id() else { break; };

            let chain_id = ChainId::extend(handles.last().map(|layer| layer.chain_id()), &diff_id);
            match self.layer_store.get(&chain_id) {
                Ok(layer) => {
                    progress.progress(&descriptor.id(), "Already exists", 0, None);
                    root_fs.append(diff_id);
                    handles.push(layer);
                    index += 1;
                }
                Err(_) => break
            }
        }

        if error.is_none() && index < layers.len() {
            let watchers = self.start_transfers(&layers[index..], handles.last().map(|layer| layer.chain_id().clone()), &progress);

            for watcher in &watchers {
                let result = tokio::select! {
                    result = watcher.wait() => result,
                    _ = cancel.cancelled() => Err(TransferError::Cancelled)
                };

                match result {
                    Ok(layer) => {
                        match self.layer_store.get(layer.chain_id()) {
                            Ok(layer) => {
                                root_fs.append(layer.diff_id().clone());
                                handles.push(layer);
                            }
                            Err(err) => {
                                error = Some(err);
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        error = Some(err.into_image_error(watcher.key()));
                        break;
                    }
                }
            }
        }

        for descriptor in layers {
            descriptor.close();
        }

        let top = handles.pop();
        while let Some(layer) = handles.pop() {
            if let Err(err) = self.layer_store.release(&layer) {
                warn!("Failed to release layer {}: {}", layer.chain_id(), err);
            }
        }

        let result = DownloadResult {
            root_fs,
            release: ReleaseHandle::new(self.layer_store.clone(), top)
        };

        match error {
            None => Ok(result),
            Some(error) => Err(Partial::new(result, error))
        }
    }

    fn start_transfers(&self,
                       layers: &[DownloadDescriptorRef],
                       parent: Option<ChainId>,
                       progress: &ProgressSinkRef) -> Vec<Watcher<Layer>> {
        let mut chain_key = parent.as_ref().map(|parent| parent.to_string()).unwrap_or_default();
        let mut parent = match parent {
            Some(parent) => ParentLayer::Registered(parent),
            None => ParentLayer::Root
        };

        let mut watchers = Vec::with_capacity(layers.len());
        for descriptor in layers {
            chain_key = format!("{}/{}", chain_key, descriptor.key());

            let layer_store = self.layer_store.clone();
            let descriptor = descriptor.clone();
            let progress = progress.clone();
            let max_attempts = self.max_attempts;
            let retry_delay = self.retry_delay;
            let parent_layer = std::mem::replace(&mut parent, ParentLayer::Root);

            let watcher = self.transfers.transfer(&chain_key, move |context| {
                download_layer(context, layer_store, descriptor, parent_layer, max_attempts, retry_delay, progress)
            });

            parent = ParentLayer::Transfer(watcher.shared());
            watchers.push(watcher);
        }

        watchers
    }
}

async fn download_layer(context: TransferContext,
                        layer_store: Arc<LayerStore>,
                        descriptor: DownloadDescriptorRef,
                        parent: ParentLayer,
                        max_attempts: usize,
                        retry_delay: Duration,
                        progress: ProgressSinkRef) -> TransferResult<Layer> {
    let blob = {
        let _slot = context.acquire_slot().await?;
        fetch_with_retries(&context.cancel, &descriptor, max_attempts, retry_delay, &progress).await?
    };

    let parent = match parent {
        ParentLayer::Root => None,
        ParentLayer::Registered(chain_id) => Some(chain_id),
        ParentLayer::Transfer(future) => {
            tokio::select! {
                result = future => Some(result?.chain_id().clone()),
                _ = context.cancel.cancelled() => return Err(TransferError::Cancelled)
            }
        }
    };

    if context.cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }

    progress.progress(&descriptor.id(), "Extracting", 0, None);
    let register_store = layer_store.clone();
    let layer = tokio::task::spawn_blocking(move || -> ImageResult<Layer> {
        register_store.register(decompress(blob)?, parent.as_ref())
    }).await.map_err(|err| TransferError::Failed(err.to_string()))??;

    if let Some(expected) = descriptor.diff_id() {
        if &expected != layer.diff_id() {
            if let Err(err) = layer_store.release(&layer) {
                warn!("Failed to release layer {}: {}", layer.chain_id(), err);
            }

            return Err(ImageError::DiffIdMismatch { expected, actual: layer.diff_id().clone() }.into());
        }
    }

    descriptor.registered(layer.diff_id());
    progress.progress(&descriptor.id(), "Pull complete", 0, None);
    info!("Downloaded layer {} as {}", descriptor.id(), layer.chain_id());
    Ok(layer)
}

async fn fetch_with_retries(cancel: &CancellationToken,
                            descriptor: &DownloadDescriptorRef,
                            max_attempts: usize,
                            retry_delay: Duration,
                            progress: &ProgressSinkRef) -> TransferResult<File> {
    let mut attempt = 1;
    loop {
        match fetch(cancel, descriptor, progress).await {
            Ok(file) => return Ok(file),
            Err(err) if err.is_cancelled() => return Err(TransferError::Cancelled),
            Err(err) if attempt >= max_attempts => return Err(err.into()),
            Err(err) => {
                let delay = retry_delay * attempt as u32;
                warn!("Download of {} failed (attempt {}): {}", descriptor.id(), attempt, err);
                progress.progress(&descriptor.id(), &format!("Retrying in {} seconds", delay.as_secs()), 0, None);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled)
                }

                attempt += 1;
            }
        }
    }
}

/// Spools the blob to an anonymous temporary file.
async fn fetch(cancel: &CancellationToken, descriptor: &DownloadDescriptorRef, progress: &ProgressSinkRef) -> ImageResult<File> {
    let (mut stream, size) = tokio::select! {
        result = descriptor.download(cancel) => result?,
        _ = cancel.cancelled() => return Err(ImageError::Cancelled)
    };

    let mut writer = tokio::fs::File::from_std(tempfile::tempfile()?);
    let mut buffer = vec![0; 64 * 1024];
    let mut total = 0;
    loop {
        let count = tokio::select! {
            count = stream.read(&mut buffer) => count?,
            _ = cancel.cancelled() => return Err(ImageError::Cancelled)
        };

        if count == 0 {
            break;
        }

        writer.write_all(&buffer[..count]).await?;
        total += count as u64;
    }

    writer.flush().await?;
    progress.progress(&descriptor.id(), "Download complete", total, size);

    let mut file = writer.into_std().await;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

/// Gzip compressed blobs are decompressed, anything else is assumed to be a plain tar archive.
fn decompress(mut file: File) -> ImageResult<Box<dyn Read>> {
    let mut magic = [0; 2];
    let read = read_prefix(&mut file, &mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    if read == 2 && magic == [0x1f, 0x8b] {
        Ok(Box::new(GzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

fn read_prefix(file: &mut File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buffer.len() {
        let count = file.read(&mut buffer[total..])?;
        if count == 0 {
            break;
        }

        total += count;
    }

    Ok(total)
}

#[cfg(test)]
mod tests;
