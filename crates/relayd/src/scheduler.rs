//! Named periodic tasks
//!
//! Each task runs on its own tokio interval. A tick that arrives while the
//! previous run is still in flight is skipped and counted, so slow work never
//! piles up. Cancelling a task, or shutting the scheduler down, waits for the
//! in-flight run to finish.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Default)]
struct TaskCounters {
    runs: AtomicU64,
    skipped: AtomicU64,
}

struct TaskEntry {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
    period: Duration,
    counters: Arc<TaskCounters>,
}

/// Per-task counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStats {
    pub name: String,
    pub period: Duration,
    pub runs: u64,
    /// Ticks dropped because the previous run was still going
    pub skipped: u64,
}

/// Periodic task scheduler
#[derive(Default)]
pub struct Scheduler {
    tasks: Mutex<HashMap<String, TaskEntry>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` every `period`, first after one period. Replaces any task
    /// already registered under `name`.
    pub fn spawn_periodic<F, Fut>(&self, name: &str, period: Duration, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel, mut cancel_rx) = watch::channel(false);
        let counters = Arc::new(TaskCounters::default());
        let loop_counters = counters.clone();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut current: Option<JoinHandle<()>> = None;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if current.as_ref().map_or(false, |run| !run.is_finished()) {
                            loop_counters.skipped.fetch_add(1, Ordering::Relaxed);
                            debug!("Task {} still running, tick skipped", task_name);
                            continue;
                        }
                        loop_counters.runs.fetch_add(1, Ordering::Relaxed);
                        current = Some(tokio::spawn(task()));
                    }
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            if let Some(run) = current {
                if let Err(e) = run.await {
                    warn!("Task {} failed while draining: {}", task_name, e);
                }
            }
            debug!("Task {} stopped", task_name);
        });

        let previous = self.tasks.lock().insert(
            name.to_string(),
            TaskEntry {
                cancel,
                handle,
                period,
                counters,
            },
        );
        if let Some(previous) = previous {
            let _ = previous.cancel.send(true);
        }
    }

    /// Stop a task and wait for its in-flight run. Returns false for an
    /// unknown name.
    pub async fn cancel(&self, name: &str) -> bool {
        let entry = self.tasks.lock().remove(name);
        match entry {
            Some(entry) => {
                let _ = entry.cancel.send(true);
                let _ = entry.handle.await;
                true
            }
            None => false,
        }
    }

    /// Stop every task, draining in-flight runs
    pub async fn shutdown(&self) {
        let entries: Vec<(String, TaskEntry)> = self.tasks.lock().drain().collect();
        for (_, entry) in &entries {
            let _ = entry.cancel.send(true);
        }
        for (name, entry) in entries {
            if let Err(e) = entry.handle.await {
                warn!("Task {} did not stop cleanly: {}", name, e);
            }
        }
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> Vec<TaskStats> {
        let mut stats: Vec<TaskStats> = self
            .tasks
            .lock()
            .iter()
            .map(|(name, entry)| TaskStats {
                name: name.clone(),
                period: entry.period,
                runs: entry.counters.runs.load(Ordering::Relaxed),
                skipped: entry.counters.skipped.load(Ordering::Relaxed),
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[tokio::test]
    async fn test_task_runs_periodically() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler.spawn_periodic("tick", Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);
        assert_eq!(scheduler.task_names(), vec!["tick".to_string()]);
        scheduler.shutdown().await;
        assert!(scheduler.task_names().is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_ticks_skipped() {
        let scheduler = Scheduler::new();
        let running = Arc::new(AtomicUsize::new(0));
        let max_running = Arc::new(AtomicUsize::new(0));
        let (r, m) = (running.clone(), max_running.clone());
        scheduler.spawn_periodic("slow", Duration::from_millis(5), move || {
            let (r, m) = (r.clone(), m.clone());
            async move {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                r.fetch_sub(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        let stats = scheduler.stats();
        scheduler.shutdown().await;
        assert_eq!(max_running.load(Ordering::SeqCst), 1);
        assert!(stats[0].skipped > 0);
        assert!(stats[0].runs >= 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_task() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        scheduler.spawn_periodic("tick", Duration::from_millis(5), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(scheduler.cancel("tick").await);
        assert!(!scheduler.cancel("tick").await);
        let after_cancel = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_run() {
        let scheduler = Scheduler::new();
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (s, f) = (started.clone(), finished.clone());
        scheduler.spawn_periodic("work", Duration::from_millis(5), move || {
            let (s, f) = (s.clone(), f.clone());
            async move {
                s.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                f.store(true, Ordering::SeqCst);
            }
        });

        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        scheduler.shutdown().await;
        assert!(finished.load(Ordering::SeqCst));
    }
}
