//! Named recurring tasks with pause, resume and cancellation.
//!
//! A task's action runs once immediately, then every `interval`. Pausing
//! freezes the time left until the next run; resuming restores it.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::TetherError;

type TaskAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Point-in-time view of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub name: String,
    pub interval: Duration,
    pub paused: bool,
    pub runs: u64,
    /// Time left until the next run (frozen while paused).
    pub remaining: Duration,
}

struct TickState {
    paused: bool,
    next_fire: Instant,
    remaining: Duration,
    runs: u64,
}

struct TickTask {
    interval: Duration,
    state: Mutex<TickState>,
    wake: Notify,
    cancel: CancellationToken,
}

impl TickTask {
    fn snapshot(&self, name: &str) -> TaskSnapshot {
        let state = self.state.lock();
        let remaining = if state.paused {
            state.remaining
        } else {
            state.next_fire.saturating_duration_since(Instant::now())
        };
        TaskSnapshot {
            name: name.to_string(),
            interval: self.interval,
            paused: state.paused,
            runs: state.runs,
            remaining,
        }
    }
}

type Registry = Arc<DashMap<String, Arc<TickTask>>>;

#[derive(Default)]
pub struct TaskSystem {
    tasks: Registry,
}

impl TaskSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a recurring task. Fails if `name` is already running.
    pub fn add_task<F, Fut>(
        &self,
        name: &str,
        interval: Duration,
        action: F,
    ) -> Result<String, TetherError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if interval.is_zero() {
            return Err(TetherError::Other(format!(
                "task {name}: interval must be non-zero"
            )));
        }
        let action: TaskAction = Arc::new(move || action().boxed());
        let task = Arc::new(TickTask {
            interval,
            state: Mutex::new(TickState {
                paused: false,
                next_fire: Instant::now(),
                remaining: Duration::ZERO,
                runs: 0,
            }),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        });

        match self.tasks.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(TetherError::TaskExists(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&task));
            }
        }

        tokio::spawn(run_task(
            name.to_string(),
            task,
            action,
            Arc::clone(&self.tasks),
        ));
        debug!(task = name, ?interval, "task added");
        Ok(name.to_string())
    }

    /// Freeze the task; the time left until its next run is kept.
    pub fn pause_task(&self, name: &str) -> bool {
        let Some(task) = self.get(name) else {
            return false;
        };
        let mut state = task.state.lock();
        if !state.paused {
            state.remaining = state.next_fire.saturating_duration_since(Instant::now());
            state.paused = true;
        }
        drop(state);
        task.wake.notify_one();
        true
    }

    pub fn resume_task(&self, name: &str) -> bool {
        let Some(task) = self.get(name) else {
            return false;
        };
        let mut state = task.state.lock();
        if state.paused {
            state.next_fire = Instant::now() + state.remaining;
            state.paused = false;
        }
        drop(state);
        task.wake.notify_one();
        true
    }

    /// Stop the task immediately. Idempotent.
    pub fn cancel_task(&self, name: &str) -> bool {
        match self.tasks.remove(name) {
            Some((_, task)) => {
                task.cancel.cancel();
                debug!(task = name, "task cancelled");
                true
            }
            None => false,
        }
    }

    pub fn task_exists(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn task_state(&self, name: &str) -> Option<TaskSnapshot> {
        self.get(name).map(|task| task.snapshot(name))
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn cancel_all(&self) -> usize {
        let names = self.task_names();
        names.iter().filter(|name| self.cancel_task(name)).count()
    }

    fn get(&self, name: &str) -> Option<Arc<TickTask>> {
        self.tasks.get(name).map(|task| Arc::clone(&task))
    }
}

impl Drop for TaskSystem {
    fn drop(&mut self) {
        for entry in self.tasks.iter() {
            entry.value().cancel.cancel();
        }
    }
}

impl std::fmt::Debug for TaskSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSystem")
            .field("tasks", &self.task_names())
            .finish()
    }
}

// ── Runner ───────────────────────────────────────────────────────

async fn run_task(name: String, task: Arc<TickTask>, action: TaskAction, registry: Registry) {
    loop {
        // Wait until due, paused-aware.
        loop {
            let (paused, next_fire) = {
                let state = task.state.lock();
                (state.paused, state.next_fire)
            };
            let wake = task.wake.notified();
            if paused {
                tokio::select! {
                    _ = task.cancel.cancelled() => return,
                    _ = wake => continue,
                }
            }
            if Instant::now() >= next_fire {
                break;
            }
            tokio::select! {
                _ = task.cancel.cancelled() => return,
                _ = wake => continue,
                _ = tokio::time::sleep_until(next_fire) => {}
            }
        }

        {
            let mut state = task.state.lock();
            if state.paused {
                continue;
            }
            state.runs += 1;
            state.next_fire = Instant::now() + task.interval;
        }

        let run = AssertUnwindSafe(action()).catch_unwind();
        tokio::select! {
            _ = task.cancel.cancelled() => return,
            result = run => {
                if result.is_err() {
                    error!(task = %name, "task action panicked, task stopped");
                    task.cancel.cancel();
                    registry.remove_if(&name, |_, current| Arc::ptr_eq(current, &task));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn counter_action(
        counter: &Arc<AtomicU64>,
    ) -> impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static {
        let counter = counter.clone();
        move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }
    }

    /// Let spawned tasks observe the current (paused) clock.
    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_immediately_then_every_interval() {
        let tasks = TaskSystem::new();
        let hits = Arc::new(AtomicU64::new(0));
        tasks
            .add_task("tick", Duration::from_secs(10), counter_action(&hits))
            .unwrap();
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(25)).await;
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_names_rejected() {
        let tasks = TaskSystem::new();
        let hits = Arc::new(AtomicU64::new(0));
        tasks
            .add_task("tick", Duration::from_secs(1), counter_action(&hits))
            .unwrap();
        assert!(matches!(
            tasks.add_task("tick", Duration::from_secs(1), counter_action(&hits)),
            Err(TetherError::TaskExists(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_freezes_remaining_time() {
        let tasks = TaskSystem::new();
        let hits = Arc::new(AtomicU64::new(0));
        tasks
            .add_task("tick", Duration::from_secs(10), counter_action(&hits))
            .unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(tasks.pause_task("tick"));
        let snapshot = tasks.task_state("tick").unwrap();
        assert!(snapshot.paused);
        assert_eq!(snapshot.remaining, Duration::from_secs(6));

        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(tasks.task_state("tick").unwrap().remaining, Duration::from_secs(6));

        assert!(tasks.resume_task("tick"));
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_immediate_and_idempotent() {
        let tasks = TaskSystem::new();
        let hits = Arc::new(AtomicU64::new(0));
        tasks
            .add_task("tick", Duration::from_secs(1), counter_action(&hits))
            .unwrap();
        settle().await;

        assert!(tasks.cancel_task("tick"));
        assert!(!tasks.cancel_task("tick"));
        assert!(!tasks.task_exists("tick"));
        assert!(!tasks.resume_task("tick"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_action_ends_only_that_task() {
        let tasks = TaskSystem::new();
        let hits = Arc::new(AtomicU64::new(0));
        tasks
            .add_task("bad", Duration::from_secs(1), || async {
                let boom: Option<()> = None;
                boom.expect("task bug");
            })
            .unwrap();
        tasks
            .add_task("good", Duration::from_secs(1), counter_action(&hits))
            .unwrap();
        settle().await;
        assert!(!tasks.task_exists("bad"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_stops_everything() {
        let tasks = TaskSystem::new();
        let hits = Arc::new(AtomicU64::new(0));
        for name in ["a", "b", "c"] {
            tasks
                .add_task(name, Duration::from_secs(1), counter_action(&hits))
                .unwrap();
        }
        assert_eq!(tasks.cancel_all(), 3);
        assert!(tasks.task_names().is_empty());
    }
}
