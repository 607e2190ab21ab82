//! Async mutual exclusion for controller state transitions.
//!
//! A small, fair lock: waiters queue in FIFO order and each unlock hands
//! the lock to the oldest live waiter. There is no task-local ownership
//! tracking and no reentrancy: a holder that locks again deadlocks. The
//! container controller depends on that strictness to serialise its
//! transitions around agent RPC.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

struct LockState {
    locked: bool,
    waiters: VecDeque<oneshot::Sender<LockGuard>>,
}

type SharedState = Arc<Mutex<LockState>>;

/// A fair, non-reentrant async lock.
///
/// Safe to hold across suspension points. Cancellation is handled at
/// both ends: a waiter dropped before its turn is skipped, and a waiter
/// dropped right after being handed the lock releases it again (the
/// guard travels through the handoff channel, so its drop glue runs).
#[derive(Clone)]
pub struct AsyncLock {
    state: SharedState,
}

impl Default for AsyncLock {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncLock {
    pub fn new() -> AsyncLock {
        AsyncLock {
            state: Arc::new(Mutex::new(LockState {
                locked: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Acquire the lock, suspending while another holder runs. The guard
    /// releases on drop, so every exit path of the critical section,
    /// including errors and panics, unlocks.
    pub async fn lock(&self) -> LockGuard {
        loop {
            let receiver = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if !state.locked {
                    state.locked = true;
                    return LockGuard {
                        state: Some(Arc::clone(&self.state)),
                    };
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };
            match receiver.await {
                Ok(guard) => return guard,
                // Sender consumed without delivering: only possible when
                // the handoff raced our own cancellation; queue again.
                Err(_) => continue,
            }
        }
    }

    /// Run `body` with the lock held, releasing on every exit path.
    pub async fn with_lock<F, Fut, T>(&self, body: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.lock().await;
        body().await
    }
}

/// RAII guard returned by [`AsyncLock::lock`].
pub struct LockGuard {
    /// `None` once disarmed (ownership moved elsewhere).
    state: Option<SharedState>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        let mut inner = state.lock().unwrap_or_else(|e| e.into_inner());
        // Hand off to the oldest waiter whose future is still alive.
        loop {
            match inner.waiters.pop_front() {
                Some(waiter) => {
                    let guard = LockGuard {
                        state: Some(Arc::clone(&state)),
                    };
                    match waiter.send(guard) {
                        Ok(()) => return, // lock stays held, new owner
                        Err(mut unsent) => {
                            // Waiter cancelled before delivery; disarm the
                            // guard so dropping it here cannot re-enter
                            // the state mutex we hold.
                            unsent.state = None;
                        }
                    }
                }
                None => {
                    inner.locked = false;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let lock = AsyncLock::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let lock = lock.clone();
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                lock.with_lock(|| async move {
                    let seen = counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(seen, 0, "two holders inside the critical section");
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    counter.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_fifo_wakeup_order() {
        let lock = AsyncLock::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = lock.lock().await;
        let mut handles = Vec::new();
        for i in 0..8 {
            let lock = lock.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _guard = lock.lock().await;
                order.lock().unwrap().push(i);
            }));
            // Let each task reach the queue before spawning the next.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(guard);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_release_on_error_path() {
        let lock = AsyncLock::new();
        let result: Result<(), &str> = lock.with_lock(|| async move { Err("boom") }).await;
        assert!(result.is_err());
        // Lock must be free again.
        let _guard = lock.lock().await;
    }

    #[tokio::test]
    async fn test_cancelled_waiter_skipped() {
        let lock = AsyncLock::new();
        let guard = lock.lock().await;

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _guard = lock.lock().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(guard);
        // The cancelled waiter must not wedge the queue.
        tokio::time::timeout(Duration::from_secs(1), lock.lock())
            .await
            .expect("lock wedged by cancelled waiter");
    }

    #[tokio::test]
    async fn test_held_across_suspension() {
        let lock = AsyncLock::new();
        lock.with_lock(|| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
        })
        .await;
        let _guard = lock.lock().await;
    }
}
