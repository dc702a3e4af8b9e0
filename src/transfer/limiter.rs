use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

struct LimiterState {
    limit: usize,
    active: usize
}

/// Bounds the number of concurrent transfers. The bound can be changed while slots are held.
pub struct ConcurrencyLimiter {
    state: Mutex<LimiterState>,
    notify: Notify
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Arc<ConcurrencyLimiter> {
        Arc::new(
            ConcurrencyLimiter {
                state: Mutex::new(LimiterState { limit: limit.max(1), active: 0 }),
                notify: Notify::new()
            }
        )
    }

    fn state(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Waits for a free slot. The slot is given back when the returned guard is dropped.
    pub async fn acquire(self: &Arc<Self>) -> ConcurrencySlot {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.active < state.limit {
                    state.active += 1;
                    return ConcurrencySlot { limiter: self.clone() };
                }
            }

            notified.await;
        }
    }

    /// Changes the bound for new acquisitions. Slots already held are kept. Zero is ignored.
    pub fn set_concurrency(&self, limit: usize) {
        if limit == 0 {
            return;
        }

        self.state().limit = limit;
        self.notify.notify_waiters();
    }

    pub fn limit(&self) -> usize {
        self.state().limit
    }

    pub fn active(&self) -> usize {
        self.state().active
    }

    fn release(&self) {
        {
            let mut state = self.state();
            state.active = state.active.saturating_sub(1);
        }

        self.notify.notify_waiters();
    }
}

pub struct ConcurrencySlot {
    limiter: Arc<ConcurrencyLimiter>
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[tokio::test]
async fn test_acquire_within_limit() {
    let limiter = ConcurrencyLimiter::new(2);
    let slot1 = limiter.acquire().await;
    let _slot2 = limiter.acquire().await;
    assert_eq!(2, limiter.active());

    let waiting = tokio::spawn({
        let limiter = limiter.clone();
        async move {
            let _slot = limiter.acquire().await;
        }
    });

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!waiting.is_finished());

    drop(slot1);
    tokio::time::timeout(std::time::Duration::from_secs(5), waiting).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_lower_concurrency_keeps_held_slots() {
    let limiter = ConcurrencyLimiter::new(5);
    let slots = vec![limiter.acquire().await, limiter.acquire().await, limiter.acquire().await];

    limiter.set_concurrency(2);
    assert_eq!(2, limiter.limit());
    assert_eq!(3, limiter.active());

    let waiting = tokio::spawn({
        let limiter = limiter.clone();
        async move {
            let _slot = limiter.acquire().await;
        }
    });

    let mut slots = slots;
    slots.pop();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!waiting.is_finished());

    slots.pop();
    tokio::time::timeout(std::time::Duration::from_secs(5), waiting).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_zero_concurrency_ignored() {
    let limiter = ConcurrencyLimiter::new(3);
    limiter.set_concurrency(0);
    assert_eq!(3, limiter.limit());
}

#[tokio::test]
async fn test_raise_concurrency_wakes_waiters() {
    let limiter = ConcurrencyLimiter::new(1);
    let _slot = limiter.acquire().await;

    let waiting = tokio::spawn({
        let limiter = limiter.clone();
        async move {
            let _slot = limiter.acquire().await;
        }
    });

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    limiter.set_concurrency(2);
    tokio::time::timeout(std::time::Duration::from_secs(5), waiting).await.unwrap().unwrap();
}
