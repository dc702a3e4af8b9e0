use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::error::ImageError;
use crate::transfer::limiter::{ConcurrencyLimiter, ConcurrencySlot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    Cancelled,
    Failed(String)
}

impl TransferError {
    pub fn into_image_error(self, key: &str) -> ImageError {
        match self {
            TransferError::Cancelled => ImageError::Cancelled,
            TransferError::Failed(message) => ImageError::Transfer { key: key.to_owned(), message }
        }
    }
}

impl Display for TransferError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Cancelled => write!(f, "cancelled"),
            TransferError::Failed(message) => write!(f, "{}", message)
        }
    }
}

impl From<ImageError> for TransferError {
    fn from(error: ImageError) -> Self {
        if error.is_cancelled() {
            TransferError::Cancelled
        } else {
            TransferError::Failed(error.to_string())
        }
    }
}

pub type TransferResult<T> = Result<T, TransferError>;

type TransferFuture<T> = Shared<BoxFuture<'static, TransferResult<T>>>;

/// What a running transfer gets to work with.
pub struct TransferContext {
    pub cancel: CancellationToken,
    limiter: Arc<ConcurrencyLimiter>
}

impl TransferContext {
    /// Waits for a concurrency slot, giving up if the transfer is cancelled.
    pub async fn acquire_slot(&self) -> TransferResult<ConcurrencySlot> {
        tokio::select! {
            slot = self.limiter.acquire() => Ok(slot),
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled)
        }
    }
}

struct TransferEntry<T> {
    id: u64,
    future: TransferFuture<T>,
    cancel: CancellationToken,
    watchers: usize,
    result: Option<T>
}

type ReleaseFn<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Transfers<T> {
    entries: Mutex<HashMap<String, TransferEntry<T>>>,
    release: ReleaseFn<T>
}

impl<T> Transfers<T> {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, TransferEntry<T>>> {
        self.entries.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// Runs keyed transfers, letting concurrent requests for the same key share one transfer.
///
/// A transfer is cancelled once every watcher is gone. A completed result is kept until then and
/// handed to the release function afterwards.
pub struct TransferManager<T> {
    limiter: Arc<ConcurrencyLimiter>,
    transfers: Arc<Transfers<T>>,
    next_id: AtomicU64
}

impl<T: Clone + Send + Sync + 'static> TransferManager<T> {
    pub fn new(limiter: Arc<ConcurrencyLimiter>, release: impl Fn(T) + Send + Sync + 'static) -> TransferManager<T> {
        TransferManager {
            limiter,
            transfers: Arc::new(
                Transfers {
                    entries: Mutex::new(HashMap::new()),
                    release: Arc::new(release)
                }
            ),
            next_id: AtomicU64::new(1)
        }
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }

    pub fn set_concurrency(&self, limit: usize) {
        self.limiter.set_concurrency(limit);
    }

    pub fn in_progress(&self) -> usize {
        self.transfers.entries().len()
    }

    /// Watches the transfer for `key`, starting it with `start` if none is in flight.
    pub fn transfer<F, Fut>(&self, key: &str, start: F) -> Watcher<T>
        where F: FnOnce(TransferContext) -> Fut,
              Fut: Future<Output=TransferResult<T>> + Send + 'static {
        let mut entries = self.transfers.entries();
        if let Some(entry) = entries.get_mut(key) {
            entry.watchers += 1;
            debug!("Watching existing transfer {}", key);

            return Watcher {
                key: key.to_owned(),
                id: entry.id,
                future: entry.future.clone(),
                transfers: self.transfers.clone()
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let work = start(
            TransferContext {
                cancel: cancel.clone(),
                limiter: self.limiter.clone()
            }
        );

        let transfers = self.transfers.clone();
        let task_key = key.to_owned();
        let handle = tokio::spawn(async move {
            let result = work.await;

            let mut entries = transfers.entries();
            match entries.get_mut(&task_key) {
                Some(entry) if entry.id == id => {
                    if let Ok(value) = result.as_ref() {
                        entry.result = Some(value.clone());
                    }
                }
                _ => {
                    drop(entries);
                    if let Ok(value) = result.as_ref() {
                        (transfers.release)(value.clone());
                    }
                }
            }

            result
        });

        let future = async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => Err(TransferError::Failed(err.to_string()))
            }
        }.boxed().shared();

        entries.insert(
            key.to_owned(),
            TransferEntry {
                id,
                future: future.clone(),
                cancel,
                watchers: 1,
                result: None
            }
        );

        Watcher {
            key: key.to_owned(),
            id,
            future,
            transfers: self.transfers.clone()
        }
    }
}

/// Interest in a transfer. Dropping the last watcher cancels or releases the transfer.
pub struct Watcher<T> {
    key: String,
    id: u64,
    future: TransferFuture<T>,
    transfers: Arc<Transfers<T>>
}

impl<T: Clone> Watcher<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn wait(&self) -> TransferResult<T> {
        self.future.clone().await
    }

    pub(crate) fn shared(&self) -> TransferFuture<T> {
        self.future.clone()
    }
}

impl<T> Drop for Watcher<T> {
    fn drop(&mut self) {
        let mut entries = self.transfers.entries();
        let finished = match entries.get_mut(&self.key) {
            Some(entry) if entry.id == self.id => {
                entry.watchers -= 1;
                if entry.watchers > 0 {
                    return;
                }

                entries.remove(&self.key)
            }
            _ => None
        };
        drop(entries);

        if let Some(entry) = finished {
            match entry.result {
                Some(result) => (self.transfers.release)(result),
                None => {
                    debug!("Cancelling transfer {}", self.key);
                    entry.cancel.cancel();
                }
            }
        }
    }
}
