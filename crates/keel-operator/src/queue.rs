//! Rate-limited, de-duplicating work queue
//!
//! Producers (informers, handlers re-enqueueing a parent) `add` keys; workers
//! `get` a key, process it and call `done`. The queue guarantees:
//!
//! - a key waiting in the queue is never queued twice
//! - a key is handed to at most one worker at a time; re-adding it while it is
//!   being processed marks it dirty and it is queued again on `done`
//! - failed keys come back after a per-key exponential delay
//!   (`base * 2^failures`, capped) until `forget` resets their history
//!
//! After `shut_down`, `get` returns `None`, further adds are ignored and
//! pending delayed adds are dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default first retry delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default retry delay cap
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Per-key exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemBackoff {
    base: Duration,
    max: Duration,
}

impl Default for ItemBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl ItemBackoff {
    /// Backoff starting at `base` and never exceeding `max`
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the retry that follows `failures` earlier failures
    pub fn delay(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            shutting_down: false,
        }
    }
}

/// Work queue shared between producers and workers
pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    ready: Notify,
    backoff: ItemBackoff,
    shutdown: CancellationToken,
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(ItemBackoff::default())
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a queue using `backoff` for rate-limited adds
    pub fn new(backoff: ItemBackoff) -> Self {
        Self {
            state: Mutex::new(State::default()),
            ready: Notify::new(),
            backoff,
            shutdown: CancellationToken::new(),
        }
    }

    /// Queue `item` unless it is already waiting
    pub fn add(&self, item: T) {
        {
            let mut state = self.state.lock();
            if state.shutting_down || !state.dirty.insert(item.clone()) {
                return;
            }
            if state.processing.contains(&item) {
                // Re-queued by `done`
                return;
            }
            state.queue.push_back(item);
        }
        self.ready.notify_one();
    }

    /// Queue `item` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        if self.is_shutting_down() {
            return;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(item),
                _ = queue.shutdown.cancelled() => {}
            }
        });
    }

    /// Queue `item` after its backoff delay and count the failure
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let failures = {
            let mut state = self.state.lock();
            let count = state.failures.entry(item.clone()).or_insert(0);
            let previous = *count;
            *count = count.saturating_add(1);
            previous
        };
        let delay = self.backoff.delay(failures);
        trace!(failures, delay_ms = delay.as_millis(), "Rate-limited requeue");
        self.add_after(item, delay);
    }

    /// Wait for the next item; `None` once the queue is shut down
    ///
    /// The item is marked as processing until [`WorkQueue::done`] is called.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            // Register before checking so an add between the check and the
            // await is not missed
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Finish processing `item`, re-queueing it if it was added meanwhile
    pub fn done(&self, item: &T) {
        let requeue = {
            let mut state = self.state.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) && !state.shutting_down {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeue {
            self.ready.notify_one();
        }
    }

    /// Reset the failure history of `item`
    pub fn forget(&self, item: &T) {
        self.state.lock().failures.remove(item);
    }

    /// Number of rate-limited requeues since the last `forget`
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.state.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// Number of items waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no item is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out items and wake every waiting worker
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.shutdown.cancel();
        self.ready.notify_waiters();
    }

    /// Whether `shut_down` has been called
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}
