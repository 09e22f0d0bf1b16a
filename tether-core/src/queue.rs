//! Sharded, bounded work queue that decouples socket reads from packet
//! processing.
//!
//! Each shard is drained by one worker task. Items wait in a per-shard
//! heap ordered by priority, then push order, so items of equal priority
//! pushed to the same shard run in push order. Each shard holds at most
//! `max_queue_size` waiting items: pushing to a full shard waits for room
//! (`push*`) or fails fast (`try_push`).

use std::collections::BinaryHeap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ItemError, TetherError};

/// How long cancelled workers get to unwind before they are aborted.
const ABORT_GRACE: Duration = Duration::from_millis(500);

pub type Job = BoxFuture<'static, Result<(), TetherError>>;

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Number of shards (and workers).
    pub max_channels: usize,
    /// Capacity of each shard.
    pub max_queue_size: usize,
    /// Delay applied to items pushed without an explicit one.
    pub default_delay: Duration,
    /// Per-item run limit; `None` lets items run to completion.
    pub item_timeout: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_channels: num_cpus::get().max(1),
            max_queue_size: 1024,
            default_delay: Duration::ZERO,
            item_timeout: None,
        }
    }
}

/// Per-item settings for [`QueuePool::push_with`]. Unset fields fall back
/// to the pool configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOptions {
    /// Higher runs first within a shard.
    pub priority: i32,
    pub delay: Option<Duration>,
    pub timeout: Option<Duration>,
}

impl PushOptions {
    pub fn priority(priority: i32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }
}

// ── Outcomes ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed,
    Failed(ItemError),
    Cancelled,
}

/// Passed to failure hooks.
#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub item_id: u64,
    pub shard: usize,
    pub error: ItemError,
}

/// Passed to completion hooks.
#[derive(Debug, Clone)]
pub struct ItemCompletion {
    pub item_id: u64,
    pub shard: usize,
    pub elapsed: Duration,
}

/// Resolves to the outcome of one queued item.
#[derive(Debug)]
pub struct QueueTicket {
    item_id: u64,
    shard: usize,
    rx: oneshot::Receiver<ItemOutcome>,
}

impl QueueTicket {
    pub fn item_id(&self) -> u64 {
        self.item_id
    }

    pub fn shard(&self) -> usize {
        self.shard
    }
}

impl Future for QueueTicket {
    type Output = ItemOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(ItemOutcome::Cancelled))
    }
}

/// Result of [`QueuePool::stop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Items that ran (successfully or not) after stop began.
    pub flushed: u64,
    /// Items that never ran, or were cut off, because the grace period ran out.
    pub abandoned: u64,
}

// ── Item status ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueItemStatus {
    Queued,
    Running,
    /// Cancel requested; the worker has not picked it up yet.
    Cancelled,
}

/// Snapshot of one unfinished item, from [`QueuePool::queue_status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItemInfo {
    pub item_id: u64,
    pub shard: usize,
    pub priority: i32,
    pub status: QueueItemStatus,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

struct TrackedItem {
    shard: usize,
    priority: i32,
    enqueued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    cancel: CancellationToken,
}

impl TrackedItem {
    fn info(&self, item_id: u64) -> QueueItemInfo {
        let status = if self.cancel.is_cancelled() {
            QueueItemStatus::Cancelled
        } else if self.started_at.is_some() {
            QueueItemStatus::Running
        } else {
            QueueItemStatus::Queued
        };
        QueueItemInfo {
            item_id,
            shard: self.shard,
            priority: self.priority,
            status,
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
        }
    }
}

// ── Statistics ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatistics {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub total_processing: Duration,
}

impl QueueStatistics {
    pub fn processed(&self) -> u64 {
        self.completed + self.failed
    }

    pub fn average_processing_time(&self) -> Duration {
        match self.processed() {
            0 => Duration::ZERO,
            n => self.total_processing / n as u32,
        }
    }
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    processing_nanos: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> QueueStatistics {
        QueueStatistics {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            total_processing: Duration::from_nanos(self.processing_nanos.load(Ordering::Relaxed)),
        }
    }
}

// ── Pool ─────────────────────────────────────────────────────────

type FailureHook = Arc<dyn Fn(&ItemFailure) + Send + Sync>;
type CompletionHook = Arc<dyn Fn(&ItemCompletion) + Send + Sync>;

struct QueueItem {
    id: u64,
    priority: i32,
    job: Job,
    enqueued_at: Instant,
    delay: Duration,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    slot: OwnedSemaphorePermit,
    done: oneshot::Sender<ItemOutcome>,
}

/// Heap entry: highest priority first, then lowest id.
struct Ranked(QueueItem);

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.id.cmp(&self.0.id))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Ranked {}

/// State shared with workers. Holds no senders, so dropping the pool
/// closes every shard.
#[derive(Default)]
struct Shared {
    counters: Counters,
    items: DashMap<u64, TrackedItem>,
    on_failed: RwLock<Vec<FailureHook>>,
    on_completed: RwLock<Vec<CompletionHook>>,
}

impl Shared {
    fn fail(&self, shard: usize, id: u64, error: ItemError, done: oneshot::Sender<ItemOutcome>) {
        self.items.remove(&id);
        let outcome = if error == ItemError::Cancelled {
            self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            ItemOutcome::Cancelled
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            ItemOutcome::Failed(error.clone())
        };
        let failure = ItemFailure {
            item_id: id,
            shard,
            error,
        };
        let hooks: Vec<FailureHook> = self.on_failed.read().clone();
        for hook in hooks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| hook(&failure))).is_err() {
                warn!(shard, item = id, "item failure hook panicked");
            }
        }
        let _ = done.send(outcome);
    }

    fn complete(&self, shard: usize, id: u64, elapsed: Duration, done: oneshot::Sender<ItemOutcome>) {
        self.items.remove(&id);
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .processing_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        let completion = ItemCompletion {
            item_id: id,
            shard,
            elapsed,
        };
        let hooks: Vec<CompletionHook> = self.on_completed.read().clone();
        for hook in hooks {
            if std::panic::catch_unwind(AssertUnwindSafe(|| hook(&completion))).is_err() {
                warn!(shard, item = id, "item completion hook panicked");
            }
        }
        let _ = done.send(ItemOutcome::Completed);
    }

    fn abandon(&self, shard: usize, item: QueueItem) {
        self.fail(shard, item.id, ItemError::Cancelled, item.done);
    }

    fn mark_started(&self, id: u64) {
        if let Some(mut tracked) = self.items.get_mut(&id) {
            tracked.started_at = Some(Utc::now());
        }
    }
}

/// Cloneable handle to a set of queue shards and their workers.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct QueuePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: QueueConfig,
    senders: RwLock<Option<Vec<mpsc::UnboundedSender<QueueItem>>>>,
    /// Free slots per shard; a slot is held from push until the worker picks
    /// the item up.
    slots: Vec<Arc<Semaphore>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    next_item: AtomicU64,
    next_shard: AtomicUsize,
}

impl QueuePool {
    pub fn new(config: QueueConfig) -> Self {
        let channels = config.max_channels.max(1);
        let capacity = config.max_queue_size.max(1);
        let shared = Arc::new(Shared::default());
        let cancel = CancellationToken::new();

        let mut senders = Vec::with_capacity(channels);
        let mut slots = Vec::with_capacity(channels);
        let mut workers = Vec::with_capacity(channels);
        for shard in 0..channels {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            slots.push(Arc::new(Semaphore::new(capacity)));
            workers.push(tokio::spawn(run_worker(
                shard,
                rx,
                Arc::clone(&shared),
                cancel.clone(),
            )));
        }
        debug!(channels, capacity, "queue pool started");

        Self {
            inner: Arc::new(PoolInner {
                config: QueueConfig {
                    max_channels: channels,
                    max_queue_size: capacity,
                    ..config
                },
                senders: RwLock::new(Some(senders)),
                slots,
                workers: Mutex::new(workers),
                shared,
                cancel,
                next_item: AtomicU64::new(1),
                next_shard: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn shard_count(&self) -> usize {
        self.inner.config.max_channels
    }

    pub fn is_running(&self) -> bool {
        self.inner.senders.read().is_some()
    }

    /// Items waiting in all shards.
    pub fn queued(&self) -> usize {
        if !self.is_running() {
            return 0;
        }
        let capacity = self.inner.config.max_queue_size;
        self.inner
            .slots
            .iter()
            .map(|slots| capacity - slots.available_permits())
            .sum()
    }

    pub fn statistics(&self) -> QueueStatistics {
        self.inner.shared.counters.snapshot()
    }

    /// Unfinished items, oldest first.
    pub fn queue_status(&self) -> Vec<QueueItemInfo> {
        let mut items: Vec<QueueItemInfo> = self
            .inner
            .shared
            .items
            .iter()
            .map(|entry| entry.value().info(*entry.key()))
            .collect();
        items.sort_by_key(|info| info.item_id);
        items
    }

    pub fn item_status(&self, item_id: u64) -> Option<QueueItemStatus> {
        self.inner
            .shared
            .items
            .get(&item_id)
            .map(|tracked| tracked.info(item_id).status)
    }

    /// Cancel one unfinished item. A queued item is skipped when its turn
    /// comes; a running one is cut off. Its ticket resolves `Cancelled`.
    ///
    /// Returns `false` if the item already finished or never existed.
    pub fn cancel_item(&self, item_id: u64) -> bool {
        match self.inner.shared.items.get(&item_id) {
            Some(tracked) => {
                tracked.cancel.cancel();
                debug!(item = item_id, "queue item cancel requested");
                true
            }
            None => false,
        }
    }

    pub fn on_item_failed<F>(&self, hook: F)
    where
        F: Fn(&ItemFailure) + Send + Sync + 'static,
    {
        self.inner.shared.on_failed.write().push(Arc::new(hook));
    }

    pub fn on_item_completed<F>(&self, hook: F)
    where
        F: Fn(&ItemCompletion) + Send + Sync + 'static,
    {
        self.inner.shared.on_completed.write().push(Arc::new(hook));
    }

    // ── Intake ───────────────────────────────────────────────────

    /// Queue `job` on the least-loaded shard, waiting for room if needed.
    pub async fn push<F>(&self, job: F) -> Result<QueueTicket, TetherError>
    where
        F: Future<Output = Result<(), TetherError>> + Send + 'static,
    {
        self.push_with(job, PushOptions::default()).await
    }

    /// Queue `job` to run no earlier than `delay` from now.
    pub async fn push_delayed<F>(&self, job: F, delay: Duration) -> Result<QueueTicket, TetherError>
    where
        F: Future<Output = Result<(), TetherError>> + Send + 'static,
    {
        let options = PushOptions {
            delay: Some(delay),
            ..PushOptions::default()
        };
        self.push_with(job, options).await
    }

    /// Queue `job` on the least-loaded shard with its own priority, delay
    /// and timeout.
    pub async fn push_with<F>(&self, job: F, options: PushOptions) -> Result<QueueTicket, TetherError>
    where
        F: Future<Output = Result<(), TetherError>> + Send + 'static,
    {
        let shard = self.least_loaded()?;
        self.send(shard, job.boxed(), options).await
    }

    /// Queue `job` on shard `key % shards`; equal keys run in push order.
    pub async fn push_keyed<F>(&self, key: u64, job: F) -> Result<QueueTicket, TetherError>
    where
        F: Future<Output = Result<(), TetherError>> + Send + 'static,
    {
        let shard = (key % self.shard_count() as u64) as usize;
        self.send(shard, job.boxed(), PushOptions::default()).await
    }

    /// Like [`QueuePool::push`], but fails with `Capacity` instead of waiting.
    pub fn try_push<F>(&self, job: F) -> Result<QueueTicket, TetherError>
    where
        F: Future<Output = Result<(), TetherError>> + Send + 'static,
    {
        let shard = self.least_loaded()?;
        let sender = self.sender(shard)?;
        let slot = match Arc::clone(&self.inner.slots[shard]).try_acquire_owned() {
            Ok(slot) => slot,
            Err(TryAcquireError::NoPermits) => {
                return Err(TetherError::Capacity {
                    shard,
                    capacity: self.inner.config.max_queue_size,
                });
            }
            Err(TryAcquireError::Closed) => return Err(TetherError::QueueStopped),
        };
        self.enqueue(&sender, shard, slot, job.boxed(), PushOptions::default())
    }

    async fn send(
        &self,
        shard: usize,
        job: Job,
        options: PushOptions,
    ) -> Result<QueueTicket, TetherError> {
        let sender = self.sender(shard)?;
        let slot = Arc::clone(&self.inner.slots[shard])
            .acquire_owned()
            .await
            .map_err(|_| TetherError::QueueStopped)?;
        self.enqueue(&sender, shard, slot, job, options)
    }

    fn enqueue(
        &self,
        sender: &mpsc::UnboundedSender<QueueItem>,
        shard: usize,
        slot: OwnedSemaphorePermit,
        job: Job,
        options: PushOptions,
    ) -> Result<QueueTicket, TetherError> {
        let id = self.inner.next_item.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.cancel.child_token();
        let (done, rx) = oneshot::channel();
        self.inner.shared.items.insert(
            id,
            TrackedItem {
                shard,
                priority: options.priority,
                enqueued_at: Utc::now(),
                started_at: None,
                cancel: cancel.clone(),
            },
        );
        let item = QueueItem {
            id,
            priority: options.priority,
            job,
            enqueued_at: Instant::now(),
            delay: options.delay.unwrap_or(self.inner.config.default_delay),
            timeout: options.timeout.or(self.inner.config.item_timeout),
            cancel,
            slot,
            done,
        };
        if sender.send(item).is_err() {
            self.inner.shared.items.remove(&id);
            return Err(TetherError::QueueStopped);
        }
        self.inner.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(QueueTicket {
            item_id: id,
            shard,
            rx,
        })
    }

    fn sender(&self, shard: usize) -> Result<mpsc::UnboundedSender<QueueItem>, TetherError> {
        self.inner
            .senders
            .read()
            .as_ref()
            .and_then(|senders| senders.get(shard).cloned())
            .ok_or(TetherError::QueueStopped)
    }

    /// Shard with the most free slots; ties rotate.
    fn least_loaded(&self) -> Result<usize, TetherError> {
        if !self.is_running() {
            return Err(TetherError::QueueStopped);
        }
        let slots = &self.inner.slots;
        let n = slots.len();
        let start = self.inner.next_shard.fetch_add(1, Ordering::Relaxed) % n;
        Ok((0..n)
            .map(|offset| (start + offset) % n)
            .rev()
            .max_by_key(|&shard| slots[shard].available_permits())
            .unwrap_or(start))
    }

    // ── Shutdown ─────────────────────────────────────────────────

    /// Close intake and let workers drain for up to `grace`; anything left
    /// after that is cancelled and reported as abandoned.
    ///
    /// A second call returns an empty report.
    pub async fn stop(&self, grace: Duration) -> StopReport {
        let before = self.statistics();
        let Some(senders) = self.inner.senders.write().take() else {
            return StopReport::default();
        };
        drop(senders);
        for slots in &self.inner.slots {
            slots.close();
        }

        let mut workers = std::mem::take(&mut *self.inner.workers.lock());
        let drained = tokio::time::timeout(grace, join_all(workers.iter_mut()))
            .await
            .is_ok();
        if !drained {
            self.inner.cancel.cancel();
            if tokio::time::timeout(ABORT_GRACE, join_all(workers.iter_mut()))
                .await
                .is_err()
            {
                warn!("queue workers did not unwind, aborting");
                for worker in &workers {
                    worker.abort();
                }
            }
        }

        let after = self.statistics();
        let report = StopReport {
            flushed: after.processed() - before.processed(),
            abandoned: after.abandoned - before.abandoned,
        };
        debug!(flushed = report.flushed, abandoned = report.abandoned, "queue pool stopped");
        report
    }
}

impl std::fmt::Debug for QueuePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePool")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish()
    }
}

// ── Worker ───────────────────────────────────────────────────────

async fn run_worker(
    shard: usize,
    mut rx: mpsc::UnboundedReceiver<QueueItem>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut ready = BinaryHeap::new();
    loop {
        if ready.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => ready.push(Ranked(item)),
                    None => return,
                },
            }
        }
        while let Ok(item) = rx.try_recv() {
            ready.push(Ranked(item));
        }
        let Some(Ranked(item)) = ready.pop() else {
            continue;
        };
        if !process(shard, item, &shared, &cancel).await {
            break;
        }
    }

    rx.close();
    for Ranked(item) in ready.drain() {
        shared.abandon(shard, item);
    }
    while let Ok(item) = rx.try_recv() {
        shared.abandon(shard, item);
    }
}

/// Run one item. Returns `false` if the pool was cancelled meanwhile.
async fn process(shard: usize, item: QueueItem, shared: &Shared, pool: &CancellationToken) -> bool {
    let QueueItem {
        id,
        job,
        enqueued_at,
        delay,
        timeout,
        cancel,
        slot,
        done,
        ..
    } = item;
    drop(slot);

    if cancel.is_cancelled() {
        debug!(shard, item = id, "skipping cancelled queue item");
        shared.fail(shard, id, ItemError::Cancelled, done);
        return !pool.is_cancelled();
    }

    let due = enqueued_at + delay;
    if due > Instant::now() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                shared.fail(shard, id, ItemError::Cancelled, done);
                return !pool.is_cancelled();
            }
            _ = tokio::time::sleep_until(due) => {}
        }
    }

    shared.mark_started(id);
    let started = Instant::now();
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            shared.fail(shard, id, ItemError::Cancelled, done);
            return !pool.is_cancelled();
        }
        result = run_job(job, timeout) => result,
    };

    match result {
        Ok(()) => shared.complete(shard, id, started.elapsed(), done),
        Err(error) => {
            debug!(shard, item = id, %error, "queue item failed");
            shared.fail(shard, id, error, done);
        }
    }
    true
}

async fn run_job(job: Job, timeout: Option<Duration>) -> Result<(), ItemError> {
    let guarded = AssertUnwindSafe(job).catch_unwind();
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(result) => result,
            Err(_) => return Err(ItemError::TimedOut(limit)),
        },
        None => guarded.await,
    };
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ItemError::Failed(e.to_string())),
        Err(_) => Err(ItemError::Panicked),
    }
}
