use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::{collections::VecDeque, sync::Arc};
use tokio::{
    sync::{mpsc, Notify},
    time,
};

const BASE_DELAY: time::Duration = time::Duration::from_millis(5);
const MAX_DELAY: time::Duration = time::Duration::from_secs(1000);

/// A queue of keys to reconcile.
///
/// A key is handed to at most one worker at a time. A key added while it is
/// being processed is queued again once the worker calls [`WorkQueue::done`],
/// and a key added several times before it is picked up is processed once.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutdown: bool,
}

// === impl WorkQueue ===

impl WorkQueue {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state.lock();
        if state.shutdown || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Adds the key after a delay that grows exponentially with the number of
    /// times it has been requeued since it was last forgotten.
    pub fn add_rate_limited(self: &Arc<Self>, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(key.clone()).or_default();
            *failures += 1;
            backoff(*failures)
        };
        tracing::debug!(%key, ?delay, "Requeueing");
        let queue = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Clears the key's requeue history.
    pub fn forget(&self, key: &str) {
        self.state.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Registered before the state is checked so a shutdown is not missed.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks a key as no longer being processed.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutdown {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops handing out keys. Workers blocked in [`WorkQueue::next`] return.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.notify.notify_waiters();
    }
}

/// Adds every key received on the channel to the queue.
pub async fn feed(queue: Arc<WorkQueue>, mut keys: mpsc::UnboundedReceiver<String>) {
    while let Some(key) = keys.recv().await {
        queue.add(key);
    }
    tracing::debug!("Key channel closed");
}

fn backoff(failures: u32) -> time::Duration {
    let exp = failures.saturating_sub(1).min(31);
    BASE_DELAY
        .checked_mul(1 << exp)
        .map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY))
}
