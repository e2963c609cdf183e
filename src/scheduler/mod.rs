//! Priority job scheduler
//!
//! A bounded pool of concurrently executing jobs fed from a priority queue.
//! Higher priority always dispatches first; within a priority the queue is
//! FIFO or LIFO per scheduler. A batch counter gates dispatch: 0 suspends the
//! scheduler, a positive value admits exactly that many dispatches, and -1
//! leaves dispatch unlimited. Kill is two-phase: cooperative through the
//! job's own hook, then a hard abort when forced.

use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Job ids start here so they are visually distinct from small counters in
/// logs. Ids are never reused within a scheduler's lifetime.
const FIRST_JOB_ID: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Regular,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Waiting,
    Active,
    Killed,
}

#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: u64,
    pub status: JobStatus,
    pub priority: Priority,
    pub submit_time: u64,
    pub start_time: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("no such job: {0}")]
    NotFound(u64),

    #[error("job {0} is {1:?}, operation not applicable")]
    InvalidState(u64, JobStatus),

    #[error("job refused queueing: {0}")]
    Invocation(String),

    #[error("batch size must be positive")]
    BadBatchSize,

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// A schedulable unit of work.
#[async_trait]
pub trait Work: Send + Sync + 'static {
    async fn execute(&self);

    /// Jobs that want lifecycle hooks and cooperative kill expose them here.
    fn batchable(&self) -> Option<&dyn Batchable> {
        None
    }
}

/// Lifecycle hooks for jobs that track their own queueing state.
pub trait Batchable: Send + Sync {
    /// Called once when the job is accepted; an error aborts the add.
    fn queued(&self, job_id: u64) -> std::result::Result<(), String>;

    /// Called when the job leaves the queue without ever running.
    fn unqueued(&self);

    /// Cooperative kill; return true if the job will stop on its own.
    fn kill(&self) -> bool;

    /// Name of the submitting client, for logs and introspection.
    fn client(&self) -> &str {
        "unknown"
    }

    /// Client-side request id, when the submitter tracks one.
    fn client_id(&self) -> u64 {
        0
    }
}

struct QueuedJob {
    priority: Priority,
    order: i64,
    id: u64,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.order == other.order
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.order.cmp(&other.order))
    }
}

struct Job {
    work: Arc<dyn Work>,
    status: JobStatus,
    priority: Priority,
    submit_time: u64,
    start_time: Option<u64>,
    handle: Option<JoinHandle<()>>,
}

struct State {
    queue: BinaryHeap<QueuedJob>,
    jobs: HashMap<u64, Job>,
    active: usize,
    max_active: usize,
    /// -1 unlimited, 0 suspended, n remaining dispatches.
    batch: i64,
    next_id: u64,
    next_seq: u64,
    shutting_down: bool,
}

struct Inner {
    name: String,
    fifo: bool,
    state: Mutex<State>,
    /// Wakes the dispatcher when capacity or queue contents change.
    notify: Notify,
    /// Wakes shutdown waiters when an active job completes.
    done: Notify,
}

/// Handle to one scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(name: impl Into<String>, max_active: usize, fifo: bool) -> Self {
        let inner = Arc::new(Inner {
            name: name.into(),
            fifo,
            state: Mutex::new(State {
                queue: BinaryHeap::new(),
                jobs: HashMap::new(),
                active: 0,
                max_active,
                batch: -1,
                next_id: FIRST_JOB_ID,
                next_seq: 0,
                shutting_down: false,
            }),
            notify: Notify::new(),
            done: Notify::new(),
        });
        tokio::spawn(dispatch_loop(Arc::clone(&inner)));
        Scheduler { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue a job. The job's `queued` hook runs before the job becomes
    /// visible; a hook error rejects the add and nothing is retained.
    pub fn add(&self, work: Arc<dyn Work>, priority: Priority) -> Result<u64> {
        let (id, seq) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.shutting_down {
                return Err(SchedulerError::ShuttingDown);
            }
            let id = state.next_id;
            state.next_id += 1;
            let seq = state.next_seq;
            state.next_seq += 1;
            (id, seq)
        };

        if let Some(batchable) = work.batchable() {
            batchable
                .queued(id)
                .map_err(SchedulerError::Invocation)?;
            debug!(
                scheduler = %self.inner.name,
                id,
                client = batchable.client(),
                client_id = batchable.client_id(),
                "client notified of queueing"
            );
        }

        let order = if self.inner.fifo {
            -(seq as i64)
        } else {
            seq as i64
        };
        {
            let mut state = self.inner.state.lock().unwrap();
            state.jobs.insert(
                id,
                Job {
                    work,
                    status: JobStatus::Waiting,
                    priority,
                    submit_time: now_ms(),
                    start_time: None,
                    handle: None,
                },
            );
            state.queue.push(QueuedJob {
                priority,
                order,
                id,
            });
        }
        self.inner.notify.notify_one();
        debug!(scheduler = %self.inner.name, id, ?priority, "job queued");
        Ok(id)
    }

    /// Remove a waiting job; active jobs must be killed instead.
    pub fn remove(&self, id: u64) -> Result<()> {
        let work = {
            let mut state = self.inner.state.lock().unwrap();
            let status = state.jobs.get(&id).map(|job| job.status);
            match status {
                None => return Err(SchedulerError::NotFound(id)),
                Some(JobStatus::Waiting) => state.jobs.remove(&id).map(|j| j.work),
                Some(status) => return Err(SchedulerError::InvalidState(id, status)),
            }
        };
        if let Some(work) = work {
            if let Some(batchable) = work.batchable() {
                batchable.unqueued();
            }
        }
        debug!(scheduler = %self.inner.name, id, "job removed");
        Ok(())
    }

    /// Kill a job. A waiting job is dropped before it ever runs. An active
    /// job is first asked to stop through its cooperative hook; when that is
    /// unavailable or refused and `force` is set, its task is aborted.
    pub fn kill(&self, id: u64, force: bool) -> Result<()> {
        enum Action {
            Dropped(Arc<dyn Work>),
            Cooperate(Arc<dyn Work>),
        }

        let action = {
            let mut state = self.inner.state.lock().unwrap();
            let status = state.jobs.get(&id).map(|job| job.status);
            match status {
                None => return Err(SchedulerError::NotFound(id)),
                Some(JobStatus::Waiting) => {
                    Action::Dropped(state.jobs.remove(&id).map(|j| j.work).unwrap())
                }
                Some(JobStatus::Active) => {
                    Action::Cooperate(Arc::clone(&state.jobs[&id].work))
                }
                Some(status) => return Err(SchedulerError::InvalidState(id, status)),
            }
        };

        match action {
            Action::Dropped(work) => {
                if let Some(batchable) = work.batchable() {
                    batchable.unqueued();
                }
                info!(scheduler = %self.inner.name, id, "waiting job killed");
                Ok(())
            }
            Action::Cooperate(work) => {
                let stopped = work
                    .batchable()
                    .map(|b| b.kill())
                    .unwrap_or(false);
                if !stopped && !force {
                    // Refused and not forced: the job stays Active so a later
                    // forced kill can still take it down.
                    debug!(scheduler = %self.inner.name, id, "cooperative kill refused");
                    return Ok(());
                }
                let mut state = self.inner.state.lock().unwrap();
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.status = JobStatus::Killed;
                    if !stopped {
                        if let Some(handle) = &job.handle {
                            handle.abort();
                        }
                        warn!(scheduler = %self.inner.name, id, "active job aborted");
                    }
                }
                Ok(())
            }
        }
    }

    pub fn info(&self, id: u64) -> Result<JobInfo> {
        let state = self.inner.state.lock().unwrap();
        state
            .jobs
            .get(&id)
            .map(|job| JobInfo {
                id,
                status: job.status,
                priority: job.priority,
                submit_time: job.submit_time,
                start_time: job.start_time,
            })
            .ok_or(SchedulerError::NotFound(id))
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        let state = self.inner.state.lock().unwrap();
        let mut infos: Vec<JobInfo> = state
            .jobs
            .iter()
            .map(|(id, job)| JobInfo {
                id: *id,
                status: job.status,
                priority: job.priority,
                submit_time: job.submit_time,
                start_time: job.start_time,
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn queue_len(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.jobs.values().filter(|j| j.status == JobStatus::Waiting).count()
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().unwrap().active
    }

    pub fn max_active(&self) -> usize {
        self.inner.state.lock().unwrap().max_active
    }

    pub fn set_max_active(&self, max_active: usize) {
        self.inner.state.lock().unwrap().max_active = max_active;
        self.inner.notify.notify_one();
    }

    /// Stop dispatching; queued jobs stay queued.
    pub fn suspend(&self) {
        self.inner.state.lock().unwrap().batch = 0;
        info!(scheduler = %self.inner.name, "suspended");
    }

    /// Resume unlimited dispatching.
    pub fn resume(&self) {
        self.inner.state.lock().unwrap().batch = -1;
        self.inner.notify.notify_one();
        info!(scheduler = %self.inner.name, "resumed");
    }

    /// Resume for exactly `n` dispatches, then suspend again.
    pub fn resume_batch(&self, n: i64) -> Result<()> {
        if n <= 0 {
            return Err(SchedulerError::BadBatchSize);
        }
        self.inner.state.lock().unwrap().batch = n;
        self.inner.notify.notify_one();
        info!(scheduler = %self.inner.name, batch = n, "resumed for batch");
        Ok(())
    }

    /// Drain the queue, abort active jobs and wait up to `grace` for them to
    /// unwind. Further adds are rejected.
    pub async fn shutdown(&self, grace: Duration) {
        let dropped: Vec<Arc<dyn Work>> = {
            let mut state = self.inner.state.lock().unwrap();
            state.shutting_down = true;
            state.batch = 0;
            state.queue.clear();
            let waiting: Vec<u64> = state
                .jobs
                .iter()
                .filter(|(_, j)| j.status == JobStatus::Waiting)
                .map(|(id, _)| *id)
                .collect();
            let dropped = waiting
                .iter()
                .filter_map(|id| state.jobs.remove(id).map(|j| j.work))
                .collect();
            for job in state.jobs.values_mut() {
                job.status = JobStatus::Killed;
                if let Some(handle) = &job.handle {
                    handle.abort();
                }
            }
            dropped
        };
        for work in dropped {
            if let Some(batchable) = work.batchable() {
                batchable.unqueued();
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.inner.state.lock().unwrap().active == 0 {
                break;
            }
            let wait = self.inner.done.notified();
            if tokio::time::timeout_at(deadline, wait).await.is_err() {
                let remaining = self.inner.state.lock().unwrap().active;
                warn!(scheduler = %self.inner.name, remaining, "shutdown grace elapsed");
                break;
            }
        }
        info!(scheduler = %self.inner.name, "shut down");
    }
}

/// Removes the job and frees its slot when the task ends, even on abort.
struct CompletionGuard {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.jobs.remove(&self.id);
            state.active = state.active.saturating_sub(1);
        }
        self.inner.notify.notify_one();
        self.inner.done.notify_waiters();
    }
}

fn next_dispatch(state: &mut State) -> Option<(u64, Arc<dyn Work>)> {
    if state.batch == 0 || state.active >= state.max_active {
        return None;
    }
    while let Some(entry) = state.queue.pop() {
        // Entries for jobs killed or removed while queued are stale.
        let Some(job) = state.jobs.get_mut(&entry.id) else {
            continue;
        };
        if job.status != JobStatus::Waiting {
            continue;
        }
        job.status = JobStatus::Active;
        job.start_time = Some(now_ms());
        state.active += 1;
        if state.batch > 0 {
            state.batch -= 1;
        }
        return Some((entry.id, Arc::clone(&job.work)));
    }
    None
}

async fn dispatch_loop(inner: Arc<Inner>) {
    loop {
        let notified = inner.notify.notified();
        loop {
            let dispatch = {
                let mut state = inner.state.lock().unwrap();
                if state.shutting_down {
                    return;
                }
                next_dispatch(&mut state)
            };
            let Some((id, work)) = dispatch else {
                break;
            };
            debug!(scheduler = %inner.name, id, "job started");
            let guard_inner = Arc::clone(&inner);
            let handle = tokio::spawn(async move {
                let _guard = CompletionGuard {
                    inner: guard_inner,
                    id,
                };
                work.execute().await;
            });
            let mut state = inner.state.lock().unwrap();
            if let Some(job) = state.jobs.get_mut(&id) {
                job.handle = Some(handle);
            }
        }
        notified.await;
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
