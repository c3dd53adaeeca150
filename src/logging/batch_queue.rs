//! Mutex-guarded batch queue with timer-driven flushing.
//!
//! Producers [`push`](BatchQueue::push) entries; batches leave the queue either
//! when a caller flushes explicitly or when the per-instance batch timer fires.
//! Non-immediate flushes are delivered to subscribers through unbounded
//! channels, so a slow consumer never holds the queue lock.

use std::num::NonZeroUsize;
#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use metrics::{gauge, histogram};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::memory_queue::MemoryQueue;
use super::mutex::{AsyncMutex, mutex_lock};

const SOURCE: &str = "docgen::logging::batch_queue";
const METRIC_QUEUE_LEN: &str = "docgen_clogs_queue_len";
const METRIC_FLUSH_BATCH_SIZE: &str = "docgen_clogs_flush_batch_size";

pub const DEFAULT_MAX_BATCH_SIZE: usize = 50;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct BatchQueueConfig {
    /// Upper bound on entries released by one non-`all` flush.
    pub max_batch_size: NonZeroUsize,
    /// Interval between automatic flushes; `None` disables the timer.
    pub batch_timeout: Option<Duration>,
    /// Delay before the first timer is armed; `None` never arms it.
    pub initial_delay: Option<Duration>,
}

impl Default for BatchQueueConfig {
    fn default() -> Self {
        Self {
            max_batch_size: NonZeroUsize::new(DEFAULT_MAX_BATCH_SIZE).unwrap_or(NonZeroUsize::MIN),
            batch_timeout: None,
            initial_delay: Some(DEFAULT_INITIAL_DELAY),
        }
    }
}

/// How a flush drains and delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOptions {
    /// Return the batch to the caller instead of emitting it to subscribers.
    pub immediate: bool,
    /// Ignore `max_batch_size` and drain everything.
    pub all: bool,
    /// Re-arm the batch timer after a non-immediate flush.
    pub reschedule: bool,
}

impl FlushOptions {
    /// What the batch timer performs.
    pub const SCHEDULED: Self = Self {
        immediate: false,
        all: false,
        reschedule: true,
    };

    /// Synchronous full drain used at shutdown.
    pub const DRAIN_ALL: Self = Self {
        immediate: true,
        all: true,
        reschedule: false,
    };
}

pub struct BatchQueue<T> {
    shared: Arc<Shared<T>>,
    starter: Option<JoinHandle<()>>,
}

struct Shared<T> {
    config: BatchQueueConfig,
    queue: AsyncMutex<MemoryQueue<T>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<T>>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    #[cfg(test)]
    timer_fires: AtomicU64,
}

impl<T> BatchQueue<T>
where
    T: Clone + Send + 'static,
{
    /// Create a queue. When both the batch timeout and the initial delay are
    /// finite, the first timer is armed after the initial delay; this requires
    /// a Tokio runtime.
    pub fn new(config: BatchQueueConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            queue: AsyncMutex::new(MemoryQueue::new()),
            subscribers: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
            #[cfg(test)]
            timer_fires: AtomicU64::new(0),
        });

        let starter = match (shared.config.batch_timeout, shared.config.initial_delay) {
            (Some(_), Some(delay)) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let weak = Arc::downgrade(&shared);
                    Some(handle.spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Some(shared) = weak.upgrade() {
                            Shared::arm_timer(&shared);
                        }
                    }))
                }
                Err(_) => {
                    warn!(
                        target = SOURCE,
                        op = "batch_queue.new",
                        result = "timer_disabled",
                        "No async runtime available; batch timer will not run"
                    );
                    None
                }
            },
            _ => None,
        };

        Self { shared, starter }
    }

    pub fn config(&self) -> &BatchQueueConfig {
        &self.shared.config
    }

    /// Register a consumer for emitted batches.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        mutex_lock(&self.shared.subscribers, SOURCE, "subscribe").push(tx);
        rx
    }

    /// Append an entry. Waits only while a flush is dequeuing.
    pub async fn push(&self, item: T) {
        let mut queue = self.shared.queue.lock().await;
        queue.enqueue(item);
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
    }

    /// Drain a batch. Returns `Some(batch)` only for immediate flushes.
    pub async fn flush(&self, options: FlushOptions) -> Option<Vec<T>> {
        Shared::flush(&self.shared, options).await
    }

    pub async fn len(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether a batch timer is currently pending.
    pub fn is_timer_armed(&self) -> bool {
        mutex_lock(&self.shared.timer, SOURCE, "is_timer_armed")
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl<T> Drop for BatchQueue<T> {
    fn drop(&mut self) {
        if let Some(starter) = self.starter.take() {
            starter.abort();
        }
        if let Some(timer) = mutex_lock(&self.shared.timer, SOURCE, "drop").take() {
            timer.abort();
        }
    }
}

impl<T> Shared<T>
where
    T: Clone + Send + 'static,
{
    async fn flush(this: &Arc<Self>, options: FlushOptions) -> Option<Vec<T>> {
        let batch = {
            let mut queue = this.queue.lock().await;
            let limit = if options.all {
                usize::MAX
            } else {
                this.config.max_batch_size.get()
            };
            let mut items = Vec::with_capacity(limit.min(queue.len()));
            while items.len() < limit {
                match queue.dequeue() {
                    Some(item) => items.push(item),
                    None => break,
                }
            }
            gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
            items
        };

        histogram!(METRIC_FLUSH_BATCH_SIZE).record(batch.len() as f64);

        if options.immediate {
            return Some(batch);
        }

        if !batch.is_empty() {
            this.emit(batch);
        }

        if options.reschedule {
            Self::arm_timer(this);
        }

        None
    }

    fn emit(&self, batch: Vec<T>) {
        let mut subscribers = mutex_lock(&self.subscribers, SOURCE, "emit");
        subscribers.retain(|tx| !tx.is_closed());

        let Some((last, rest)) = subscribers.split_last() else {
            debug!(
                target = SOURCE,
                op = "batch_queue.emit",
                result = "no_subscribers",
                batch_len = batch.len(),
                "Dropping flushed batch"
            );
            return;
        };

        for tx in rest {
            let _ = tx.send(batch.clone());
        }
        let _ = last.send(batch);
    }

    /// Arm the batch timer unless one is already pending.
    fn arm_timer(this: &Arc<Self>) {
        let Some(timeout) = this.config.batch_timeout else {
            return;
        };

        let mut slot = mutex_lock(&this.timer, SOURCE, "arm_timer");
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(this);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            mutex_lock(&shared.timer, SOURCE, "timer_fired").take();
            #[cfg(test)]
            shared.timer_fires.fetch_add(1, Ordering::Relaxed);
            Self::flush(&shared, FlushOptions::SCHEDULED).await;
        }));
    }
}
