use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::util::write_json_atomic;

/// A worker that panicked while holding a lock poisons it; the batch keeps
/// going with whatever state the lock held.
fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_workers: usize,
    pub per_task_timeout: Duration,
    pub checkpoint_every_n: usize,
    pub tasks_per_worker: usize,
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            per_task_timeout: Duration::from_secs(120),
            checkpoint_every_n: 25,
            tasks_per_worker: 50,
            checkpoint_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "timed_out")]
    TimedOut,
}

#[derive(Debug)]
pub struct TaskReport<R> {
    pub item_id: String,
    pub status: TaskStatus,
    pub duration: Duration,
    pub result: Option<R>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkItem<I> {
    pub id: String,
    pub payload: I,
}

#[derive(Debug)]
pub struct PoolOutcome<R> {
    pub reports: Vec<TaskReport<R>>,
    pub skipped_from_checkpoint: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    completed: BTreeMap<String, TaskStatus>,
}

enum Msg<R> {
    Started {
        worker_id: usize,
        item_index: usize,
    },
    Finished {
        item_index: usize,
        outcome: Result<R, String>,
        duration: Duration,
    },
    Retired {
        worker_id: usize,
    },
}

/// Bounded parallel executor with per-task timeouts, periodic checkpointing,
/// and worker recycling.
///
/// A timed-out task is recorded and abandoned, never force-killed: its worker
/// is marked abandoned and exits at the next task boundary, and a replacement
/// worker keeps concurrency constant. Worker-local context is built by the
/// init hook once per worker lifetime and recycled after a bounded number of
/// tasks to bound memory growth.
pub struct WorkerPool {
    options: PoolOptions,
}

impl WorkerPool {
    pub fn new(options: PoolOptions) -> Self {
        Self { options }
    }

    pub fn run<I, R, W, FInit, FTask, FObserve>(
        &self,
        items: Vec<WorkItem<I>>,
        init: FInit,
        task: FTask,
        mut observe: FObserve,
    ) -> Result<PoolOutcome<R>>
    where
        I: Send + Sync + 'static,
        R: Send + 'static,
        W: 'static,
        FInit: Fn() -> W + Send + Sync + 'static,
        FTask: Fn(&mut W, &WorkItem<I>) -> Result<R> + Send + Sync + 'static,
        FObserve: FnMut(&TaskReport<R>),
    {
        let mut completed = self.load_checkpoint()?;

        let mut skipped_from_checkpoint = Vec::new();
        let mut pending_indices = VecDeque::new();
        for (index, item) in items.iter().enumerate() {
            if completed.contains_key(&item.id) {
                skipped_from_checkpoint.push(item.id.clone());
            } else {
                pending_indices.push_back(index);
            }
        }
        if !skipped_from_checkpoint.is_empty() {
            info!(
                skipped = skipped_from_checkpoint.len(),
                "checkpoint covers already-completed items"
            );
        }

        let enqueued = pending_indices.len();
        if enqueued == 0 {
            return Ok(PoolOutcome {
                reports: Vec::new(),
                skipped_from_checkpoint,
            });
        }

        let items = Arc::new(items);
        let queue = Arc::new(Mutex::new(pending_indices));
        let abandoned: Arc<Mutex<HashSet<usize>>> = Arc::new(Mutex::new(HashSet::new()));
        let init = Arc::new(init);
        let task = Arc::new(task);
        let (tx, rx) = mpsc::channel::<Msg<R>>();

        let mut next_worker_id = 0_usize;
        let launch = |worker_id: usize| {
            spawn_worker(
                worker_id,
                Arc::clone(&items),
                Arc::clone(&queue),
                Arc::clone(&abandoned),
                Arc::clone(&init),
                Arc::clone(&task),
                self.options.tasks_per_worker,
                tx.clone(),
            );
        };

        let initial = self.options.max_workers.max(1).min(enqueued);
        for _ in 0..initial {
            launch(next_worker_id);
            next_worker_id += 1;
        }

        let mut reports: Vec<TaskReport<R>> = Vec::with_capacity(enqueued);
        let mut in_flight: HashMap<usize, (usize, Instant)> = HashMap::new();
        let mut recorded: HashSet<usize> = HashSet::new();
        let mut finished = 0_usize;

        while finished < enqueued {
            let now = Instant::now();
            let expired: Vec<usize> = in_flight
                .iter()
                .filter(|(_, (_, deadline))| *deadline <= now)
                .map(|(&item_index, _)| item_index)
                .collect();

            for item_index in expired {
                let Some((worker_id, _)) = in_flight.remove(&item_index) else {
                    continue;
                };
                let item_id = items[item_index].id.clone();
                warn!(item = %item_id, worker = worker_id, "task timed out, abandoning worker");
                lock_or_recover(&abandoned).insert(worker_id);

                if !lock_or_recover(&queue).is_empty() {
                    launch(next_worker_id);
                    next_worker_id += 1;
                }

                recorded.insert(item_index);
                let report = TaskReport {
                    item_id,
                    status: TaskStatus::TimedOut,
                    duration: self.options.per_task_timeout,
                    result: None,
                    error: Some(format!(
                        "timed out after {:?}",
                        self.options.per_task_timeout
                    )),
                };
                completed.insert(report.item_id.clone(), report.status);
                finished += 1;
                self.maybe_checkpoint(finished, &completed)?;
                observe(&report);
                reports.push(report);
            }
            if finished >= enqueued {
                break;
            }

            let message = match in_flight.values().map(|(_, deadline)| *deadline).min() {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        continue;
                    }
                    match rx.recv_timeout(deadline - now) {
                        Ok(message) => message,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };

            match message {
                Msg::Started {
                    worker_id,
                    item_index,
                } => {
                    in_flight.insert(
                        item_index,
                        (worker_id, Instant::now() + self.options.per_task_timeout),
                    );
                }
                Msg::Finished {
                    item_index,
                    outcome,
                    duration,
                } => {
                    if recorded.contains(&item_index) {
                        debug!(
                            item = %items[item_index].id,
                            "discarding late result from abandoned worker"
                        );
                        continue;
                    }
                    in_flight.remove(&item_index);
                    recorded.insert(item_index);

                    let report = match outcome {
                        Ok(result) => TaskReport {
                            item_id: items[item_index].id.clone(),
                            status: TaskStatus::Ok,
                            duration,
                            result: Some(result),
                            error: None,
                        },
                        Err(error) => TaskReport {
                            item_id: items[item_index].id.clone(),
                            status: TaskStatus::Failed,
                            duration,
                            result: None,
                            error: Some(error),
                        },
                    };
                    completed.insert(report.item_id.clone(), report.status);
                    finished += 1;
                    self.maybe_checkpoint(finished, &completed)?;
                    observe(&report);
                    reports.push(report);
                }
                Msg::Retired { worker_id } => {
                    debug!(worker = worker_id, "worker retired");
                    if !lock_or_recover(&queue).is_empty() {
                        launch(next_worker_id);
                        next_worker_id += 1;
                    }
                }
            }
        }

        self.write_checkpoint(&completed)?;

        Ok(PoolOutcome {
            reports,
            skipped_from_checkpoint,
        })
    }

    fn load_checkpoint(&self) -> Result<BTreeMap<String, TaskStatus>> {
        let Some(path) = &self.options.checkpoint_path else {
            return Ok(BTreeMap::new());
        };
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read checkpoint: {}", path.display()))?;
        match serde_json::from_slice::<CheckpointFile>(&raw) {
            Ok(file) => Ok(file.completed),
            Err(error) => {
                warn!(
                    path = %path.display(),
                    error = %error,
                    "unreadable checkpoint, starting batch from scratch"
                );
                Ok(BTreeMap::new())
            }
        }
    }

    fn maybe_checkpoint(
        &self,
        finished: usize,
        completed: &BTreeMap<String, TaskStatus>,
    ) -> Result<()> {
        if self.options.checkpoint_every_n == 0 || finished % self.options.checkpoint_every_n != 0 {
            return Ok(());
        }
        self.write_checkpoint(completed)
    }

    fn write_checkpoint(&self, completed: &BTreeMap<String, TaskStatus>) -> Result<()> {
        let Some(path) = &self.options.checkpoint_path else {
            return Ok(());
        };
        write_json_atomic(
            path,
            &CheckpointFile {
                completed: completed.clone(),
            },
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_worker<I, R, W, FInit, FTask>(
    worker_id: usize,
    items: Arc<Vec<WorkItem<I>>>,
    queue: Arc<Mutex<VecDeque<usize>>>,
    abandoned: Arc<Mutex<HashSet<usize>>>,
    init: Arc<FInit>,
    task: Arc<FTask>,
    tasks_per_worker: usize,
    tx: Sender<Msg<R>>,
) where
    I: Send + Sync + 'static,
    R: Send + 'static,
    W: 'static,
    FInit: Fn() -> W + Send + Sync + 'static,
    FTask: Fn(&mut W, &WorkItem<I>) -> Result<R> + Send + Sync + 'static,
{
    thread::spawn(move || {
        let mut context = init();
        let mut completed = 0_usize;

        loop {
            if lock_or_recover(&abandoned).contains(&worker_id) {
                // The coordinator gave up on this worker; stop quietly at the
                // task boundary.
                return;
            }
            if tasks_per_worker > 0 && completed >= tasks_per_worker {
                let _ = tx.send(Msg::Retired { worker_id });
                return;
            }

            let next = lock_or_recover(&queue).pop_front();
            let Some(item_index) = next else {
                let _ = tx.send(Msg::Retired { worker_id });
                return;
            };

            if tx
                .send(Msg::Started {
                    worker_id,
                    item_index,
                })
                .is_err()
            {
                return;
            }

            let started = Instant::now();
            let outcome = task(&mut context, &items[item_index]).map_err(|error| format!("{error:#}"));
            if tx
                .send(Msg::Finished {
                    item_index,
                    outcome,
                    duration: started.elapsed(),
                })
                .is_err()
            {
                return;
            }
            completed += 1;
        }
    });
}
