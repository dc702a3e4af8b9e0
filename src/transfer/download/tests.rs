use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::digest::{ChainId, DiffId, Digest};
use crate::layer::{DirectoryDriver, LayerStore};
use crate::printing::EmptyProgress;
use crate::state::StateManager;
use crate::test_helpers::{gzip, tar_with_files, wait_until, MemoryContentProvider, TempFolder};
use crate::transfer::download::{BlobDownloadDescriptor, DownloadDescriptorRef, LayerDownloadManager};
use crate::transfer::metadata::BlobMetadataService;

struct Fixture {
    _folder: TempFolder,
    layer_store: Arc<LayerStore>,
    metadata: Arc<BlobMetadataService>,
    provider: Arc<MemoryContentProvider>,
    manager: Arc<LayerDownloadManager>
}

impl Fixture {
    fn new(max_concurrent: usize, max_attempts: usize) -> Fixture {
        let folder = TempFolder::new();
        let state_manager = Arc::new(StateManager::in_memory().unwrap());
        let driver = DirectoryDriver::new(folder.join("layers"), folder.join("mounts")).unwrap();
        let layer_store = Arc::new(LayerStore::new(Arc::new(driver), state_manager.clone()).unwrap());

        Fixture {
            _folder: folder,
            layer_store: layer_store.clone(),
            metadata: Arc::new(BlobMetadataService::new(state_manager)),
            provider: MemoryContentProvider::new(),
            manager: Arc::new(LayerDownloadManager::new(layer_store, max_concurrent, max_attempts, Duration::from_secs(0)))
        }
    }

    fn descriptor(&self, digest: &Digest, diff_id: Option<DiffId>) -> DownloadDescriptorRef {
        Arc::new(BlobDownloadDescriptor::new(digest.clone(), diff_id, self.provider.clone(), self.metadata.clone()))
    }

    fn blobs(&self, prefix: &str, count: usize) -> Vec<(Digest, DiffId)> {
        (0..count)
            .map(|index| {
                let diff = tar_with_files(&[(&format!("{}{}", prefix, index), format!("content {}", index).as_bytes())]);
                let diff_id = DiffId::new(Digest::of_bytes(&diff));
                (self.provider.insert(gzip(&diff)), diff_id)
            })
            .collect()
    }
}

#[tokio::test]
async fn test_download_chain() {
    let fixture = Fixture::new(3, 1);
    let blobs = fixture.blobs("file", 3);
    let descriptors = blobs.iter().map(|(digest, _)| fixture.descriptor(digest, None)).collect::<Vec<_>>();

    let result = fixture.manager.download(&CancellationToken::new(), &descriptors, EmptyProgress::new()).await.unwrap();
    let diff_ids = blobs.iter().map(|(_, diff_id)| diff_id.clone()).collect::<Vec<_>>();
    assert_eq!(diff_ids, result.root_fs.diff_ids);

    let top = result.release.layer().unwrap();
    assert_eq!(ChainId::from_diff_ids(&diff_ids).as_ref(), Some(top.chain_id()));
    assert_eq!(3, fixture.layer_store.len());
    assert_eq!(Some(1), fixture.layer_store.references(top.chain_id()));

    for (digest, diff_id) in &blobs {
        assert_eq!(Some(diff_id.clone()), fixture.metadata.get_diff_id(digest).unwrap());
    }

    result.release.release();
    result.release.release();
    assert!(fixture.layer_store.is_empty());
}

#[tokio::test]
async fn test_download_skips_known_layers() {
    let fixture = Fixture::new(3, 1);
    let blobs = fixture.blobs("file", 2);
    let descriptors = blobs.iter().map(|(digest, _)| fixture.descriptor(digest, None)).collect::<Vec<_>>();

    let first = fixture.manager.download(&CancellationToken::new(), &descriptors, EmptyProgress::new()).await.unwrap();
    let second = fixture.manager.download(&CancellationToken::new(), &descriptors, EmptyProgress::new()).await.unwrap();

    assert_eq!(first.root_fs, second.root_fs);
    for (digest, _) in &blobs {
        assert_eq!(1, fixture.provider.fetches(digest));
    }

    first.release.release();
    second.release.release();
    assert!(fixture.layer_store.is_empty());
}

#[tokio::test]
async fn test_download_retries() {
    let fixture = Fixture::new(3, 3);
    let blobs = fixture.blobs("file", 1);
    fixture.provider.fail_next(&blobs[0].0, 2);

    let descriptors = vec![fixture.descriptor(&blobs[0].0, None)];
    let result = fixture.manager.download(&CancellationToken::new(), &descriptors, EmptyProgress::new()).await.unwrap();
    assert_eq!(1, result.root_fs.diff_ids.len());
    assert_eq!(3, fixture.provider.fetches(&blobs[0].0));
    result.release.release();
}

#[tokio::test]
async fn test_download_failure_keeps_prefix() {
    let fixture = Fixture::new(3, 2);
    let blobs = fixture.blobs("file", 3);
    fixture.provider.fail_next(&blobs[1].0, 5);

    let descriptors = blobs.iter().map(|(digest, _)| fixture.descriptor(digest, None)).collect::<Vec<_>>();
    let partial = match fixture.manager.download(&CancellationToken::new(), &descriptors, EmptyProgress::new()).await {
        Ok(_) => panic!("Expected the download to fail"),
        Err(partial) => partial
    };

    assert!(!partial.error.is_cancelled());
    assert_eq!(vec![blobs[0].1.clone()], partial.value.root_fs.diff_ids);
    assert_eq!(2, fixture.provider.fetches(&blobs[1].0));
    assert_eq!(1, fixture.layer_store.len());

    partial.value.release.release();
    assert!(fixture.layer_store.is_empty());
}

#[tokio::test]
async fn test_download_diff_id_mismatch() {
    let fixture = Fixture::new(3, 1);
    let blobs = fixture.blobs("file", 1);
    let wrong = DiffId::new(Digest::of_bytes(b"wrong"));

    let descriptors = vec![fixture.descriptor(&blobs[0].0, Some(wrong))];
    let partial = match fixture.manager.download(&CancellationToken::new(), &descriptors, EmptyProgress::new()).await {
        Ok(_) => panic!("Expected the download to fail"),
        Err(partial) => partial
    };

    assert!(partial.value.root_fs.diff_ids.is_empty());
    assert!(fixture.layer_store.is_empty());
}

#[tokio::test]
async fn test_download_cancelled() {
    let fixture = Fixture::new(3, 1);
    let blobs = fixture.blobs("file", 1);
    fixture.provider.block(&blobs[0].0);

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let manager = fixture.manager.clone();
        let descriptors = vec![fixture.descriptor(&blobs[0].0, None)];
        let cancel = cancel.clone();
        async move {
            manager.download(&cancel, &descriptors, EmptyProgress::new()).await.map(|_| ()).map_err(|partial| partial.error)
        }
    });

    wait_until(|| fixture.provider.waiting() == 1).await;
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());

    fixture.provider.unblock(&blobs[0].0);
    wait_until(|| fixture.manager.limiter().active() == 0).await;
    assert!(fixture.layer_store.is_empty());
}

#[tokio::test]
async fn test_concurrent_downloads_share_transfer() {
    let fixture = Fixture::new(3, 1);
    let blobs = fixture.blobs("file", 1);
    fixture.provider.block(&blobs[0].0);

    let start = |fixture: &Fixture| {
        let manager = fixture.manager.clone();
        let descriptors = vec![fixture.descriptor(&blobs[0].0, None)];
        tokio::spawn(async move {
            manager.download(&CancellationToken::new(), &descriptors, EmptyProgress::new()).await.ok().map(|result| result.release)
        })
    };

    let first = start(&fixture);
    let second = start(&fixture);
    wait_until(|| fixture.provider.waiting() == 1).await;
    fixture.provider.unblock(&blobs[0].0);

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(1, fixture.provider.fetches(&blobs[0].0));

    first.release();
    assert_eq!(1, fixture.layer_store.len());
    second.release();
    assert!(fixture.layer_store.is_empty());
}

#[tokio::test]
async fn test_set_concurrency_while_downloading() {
    let fixture = Fixture::new(5, 1);
    let first_blobs = fixture.blobs("first", 3);
    let second_blobs = fixture.blobs("second", 3);
    for (digest, _) in first_blobs.iter().chain(second_blobs.iter()) {
        fixture.provider.block(digest);
    }

    let start = |fixture: &Fixture, blobs: &[(Digest, DiffId)]| {
        let manager = fixture.manager.clone();
        let descriptors = blobs.iter().map(|(digest, _)| fixture.descriptor(digest, None)).collect::<Vec<_>>();
        tokio::spawn(async move {
            manager.download(&CancellationToken::new(), &descriptors, EmptyProgress::new()).await.ok().map(|result| (result.root_fs, result.release))
        })
    };

    let first = start(&fixture, &first_blobs);
    wait_until(|| fixture.provider.waiting() == 3).await;

    fixture.manager.set_concurrency(2);
    let second = start(&fixture, &second_blobs);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(3, fixture.provider.waiting());
    assert_eq!(3, fixture.manager.limiter().active());

    for (digest, _) in &first_blobs {
        fixture.provider.unblock(digest);
    }

    let (root_fs, release) = first.await.unwrap().unwrap();
    assert_eq!(3, root_fs.diff_ids.len());

    wait_until(|| fixture.provider.waiting() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(2, fixture.provider.waiting());
    assert_eq!(2, fixture.manager.limiter().active());

    for (digest, _) in &second_blobs {
        fixture.provider.unblock(digest);
    }

    let (second_root_fs, second_release) = second.await.unwrap().unwrap();
    assert_eq!(3, second_root_fs.diff_ids.len());

    release.release();
    second_release.release();
    assert!(fixture.layer_store.is_empty());
}
