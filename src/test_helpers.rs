use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;

use crate::digest::Digest;
use crate::error::{ImageError, ImageResult};
use crate::events::{EventAction, EventsSink};
use crate::image_store::Leases;
use crate::transfer::{BlobPusher, BlobStream, ContentProvider};

pub struct TempFolder {
    path: PathBuf
}

impl TempFolder {
    pub fn new() -> TempFolder {
        let named_temp_folder = tempfile::Builder::new()
            .suffix(".strata")
            .tempfile().unwrap();

        TempFolder {
            path: named_temp_folder.path().to_owned()
        }
    }

    pub fn owned(&self) -> PathBuf {
        self.path.clone()
    }

    pub fn create(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.path)
    }
}

impl Deref for TempFolder {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        self.path.as_path()
    }
}

impl Drop for TempFolder {
    fn drop(&mut self) {
        #[allow(unused_must_use)] {
            std::fs::remove_dir_all(&self.path);
        }
    }
}

/// Builds an uncompressed tar archive holding the given files.
pub fn tar_with_files(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, path, *content).unwrap();
    }

    builder.into_inner().unwrap()
}

pub fn gzip(content: &[u8]) -> Vec<u8> {
    use std::io::Write;

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap()
}

/// Polls `condition` until it holds, panicking after a few seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("Condition not reached in time");
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<(EventAction, String, String)>>,
    fail: bool
}

impl RecordingEvents {
    pub fn new() -> Arc<RecordingEvents> {
        Arc::new(RecordingEvents::default())
    }

    pub fn failing() -> Arc<RecordingEvents> {
        Arc::new(RecordingEvents { fail: true, ..Default::default() })
    }

    pub fn events(&self) -> Vec<(EventAction, String, String)> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, action: EventAction) -> usize {
        self.events().iter().filter(|(event_action, _, _)| *event_action == action).count()
    }
}

impl EventsSink for RecordingEvents {
    fn log(&self, action: EventAction, id: &str, name: &str) -> Result<(), String> {
        self.events.lock().unwrap().push((action, id.to_owned(), name.to_owned()));

        if self.fail {
            Err("events unavailable".to_owned())
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
pub struct RecordingLeases {
    active: Mutex<BTreeSet<String>>
}

impl RecordingLeases {
    pub fn new() -> Arc<RecordingLeases> {
        Arc::new(RecordingLeases::default())
    }

    pub fn active(&self) -> Vec<String> {
        self.active.lock().unwrap().iter().cloned().collect()
    }
}

impl Leases for RecordingLeases {
    fn create(&self, id: &str) -> Result<(), String> {
        self.active.lock().unwrap().insert(id.to_owned());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), String> {
        self.active.lock().unwrap().remove(id);
        Ok(())
    }
}

/// Serves blobs from memory. Individual blobs can be held back or made to fail.
#[derive(Default)]
pub struct MemoryContentProvider {
    blobs: Mutex<HashMap<Digest, Vec<u8>>>,
    blocked: Mutex<HashSet<Digest>>,
    failures: Mutex<HashMap<Digest, usize>>,
    fetches: Mutex<HashMap<Digest, usize>>,
    waiting: AtomicUsize,
    unblocked: Notify
}

impl MemoryContentProvider {
    pub fn new() -> Arc<MemoryContentProvider> {
        Arc::new(MemoryContentProvider::default())
    }

    pub fn insert(&self, content: Vec<u8>) -> Digest {
        let digest = Digest::of_bytes(&content);
        self.blobs.lock().unwrap().insert(digest.clone(), content);
        digest
    }

    pub fn block(&self, digest: &Digest) {
        self.blocked.lock().unwrap().insert(digest.clone());
    }

    pub fn unblock(&self, digest: &Digest) {
        self.blocked.lock().unwrap().remove(digest);
        self.unblocked.notify_waiters();
    }

    pub fn fail_next(&self, digest: &Digest, count: usize) {
        self.failures.lock().unwrap().insert(digest.clone(), count);
    }

    /// Number of fetches currently held back.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn fetches(&self, digest: &Digest) -> usize {
        self.fetches.lock().unwrap().get(digest).cloned().unwrap_or(0)
    }

    fn is_blocked(&self, digest: &Digest) -> bool {
        self.blocked.lock().unwrap().contains(digest)
    }
}

#[async_trait]
impl ContentProvider for MemoryContentProvider {
    async fn fetch(&self, digest: &Digest) -> ImageResult<(BlobStream, Option<u64>)> {
        *self.fetches.lock().unwrap().entry(digest.clone()).or_insert(0) += 1;

        if self.is_blocked(digest) {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            loop {
                let notified = self.unblocked.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if !self.is_blocked(digest) {
                    break;
                }

                notified.await;
            }
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(digest) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ImageError::IO(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset")));
                }
            }
        }

        let content = self.blobs.lock().unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| ImageError::Other { message: format!("blob {} not found", digest) })?;

        let size = content.len() as u64;
        Ok((Box::new(std::io::Cursor::new(content)), Some(size)))
    }
}

#[derive(Default)]
pub struct MemoryBlobPusher {
    blobs: Mutex<HashMap<Digest, Vec<u8>>>,
    failures: AtomicUsize,
    push_attempts: AtomicUsize
}

impl MemoryBlobPusher {
    pub fn new() -> Arc<MemoryBlobPusher> {
        Arc::new(MemoryBlobPusher::default())
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn blob(&self, digest: &Digest) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(digest).cloned()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn push_attempts(&self) -> usize {
        self.push_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobPusher for MemoryBlobPusher {
    async fn exists(&self, digest: &Digest) -> ImageResult<bool> {
        Ok(self.blobs.lock().unwrap().contains_key(digest))
    }

    async fn push_blob(&self, digest: &Digest, mut content: BlobStream, size: u64) -> ImageResult<()> {
        self.push_attempts.fetch_add(1, Ordering::SeqCst);

        let failed = self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |failures| failures.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ImageError::IO(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe")));
        }

        let mut blob = Vec::new();
        content.read_to_end(&mut blob).await?;
        assert_eq!(size, blob.len() as u64);

        self.blobs.lock().unwrap().insert(digest.clone(), blob);
        Ok(())
    }
}
