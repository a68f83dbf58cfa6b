//! Background load queue for large blobs.
//!
//! One worker thread runs submitted jobs in order. Results come back over a
//! channel and are handed out only when the owner drains it, so callbacks
//! always run on the owner's thread.
//!
//! Each task carries a shared cancellation flag, checked by the worker
//! before running the job and by the owner before delivering the result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

/// Identifier of a submitted task
pub type TaskId = u64;

type Job<T> = Box<dyn FnOnce() -> Option<T> + Send + 'static>;

struct QueuedTask<T> {
    id: TaskId,
    cancelled: Arc<AtomicBool>,
    job: Job<T>,
}

/// Finished task; `None` when the job failed
#[derive(Debug)]
pub struct Completion<T> {
    pub id: TaskId,
    pub result: Option<T>,
}

/// Single-worker task queue with cancellation
pub struct TaskQueue<T: Send + 'static> {
    sender: Option<Sender<QueuedTask<T>>>,
    completions: Receiver<Completion<T>>,
    finished: Receiver<()>,
    outstanding: HashMap<TaskId, Arc<AtomicBool>>,
    next_id: TaskId,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> TaskQueue<T> {
    pub fn new() -> Self {
        let (task_tx, task_rx) = channel::unbounded::<QueuedTask<T>>();
        let (done_tx, done_rx) = channel::unbounded();
        let (finished_tx, finished_rx) = channel::bounded(1);

        let worker = std::thread::Builder::new()
            .name("tdata-loader".into())
            .spawn(move || {
                for task in task_rx.iter() {
                    if task.cancelled.load(Ordering::Acquire) {
                        debug!(task = task.id, "skipping cancelled task");
                        continue;
                    }
                    let result = (task.job)();
                    if task.cancelled.load(Ordering::Acquire) {
                        continue;
                    }
                    if done_tx.send(Completion { id: task.id, result }).is_err() {
                        break;
                    }
                }
                let _ = finished_tx.send(());
            });

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "could not spawn loader thread");
                None
            }
        };

        Self {
            sender: Some(task_tx),
            completions: done_rx,
            finished: finished_rx,
            outstanding: HashMap::new(),
            next_id: 1,
            worker,
        }
    }

    /// Queue a job; it runs on the worker thread
    pub fn submit<J>(&mut self, job: J) -> TaskId
    where
        J: FnOnce() -> Option<T> + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;

        let cancelled = Arc::new(AtomicBool::new(false));
        let task = QueuedTask { id, cancelled: cancelled.clone(), job: Box::new(job) };

        let sent = match &self.sender {
            Some(sender) if self.worker.is_some() => sender.send(task).is_ok(),
            _ => false,
        };
        if sent {
            self.outstanding.insert(id, cancelled);
        } else {
            warn!(task = id, "loader is shut down, task dropped");
        }
        id
    }

    /// Cancel a task; its result is never delivered
    pub fn cancel(&mut self, id: TaskId) -> bool {
        match self.outstanding.remove(&id) {
            Some(flag) => {
                flag.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Tasks submitted and neither delivered nor cancelled
    #[must_use]
    pub fn pending(&self) -> usize {
        self.outstanding.len()
    }

    #[must_use]
    pub fn is_pending(&self, id: TaskId) -> bool {
        self.outstanding.contains_key(&id)
    }

    fn accept(&mut self, completion: &Completion<T>) -> bool {
        match self.outstanding.remove(&completion.id) {
            Some(flag) => !flag.load(Ordering::Acquire),
            None => false,
        }
    }

    /// Collect finished tasks without blocking
    pub fn drain_completed(&mut self) -> Vec<Completion<T>> {
        let mut delivered = Vec::new();
        while let Ok(completion) = self.completions.try_recv() {
            if self.accept(&completion) {
                delivered.push(completion);
            }
        }
        delivered
    }

    /// Block until at least one task finished or the timeout passed
    pub fn wait_completed(&mut self, timeout: Duration) -> Vec<Completion<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.completions.recv_timeout(remaining) {
                Ok(completion) => {
                    if self.accept(&completion) {
                        let mut delivered = vec![completion];
                        delivered.extend(self.drain_completed());
                        return delivered;
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return Vec::new(),
            }
        }
    }

    /// Cancel every task and stop the worker
    ///
    /// Returns whether the worker exited within `timeout`; a worker stuck in
    /// a job is detached.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        for (_, flag) in self.outstanding.drain() {
            flag.store(true, Ordering::Release);
        }
        self.sender = None;

        let Some(worker) = self.worker.take() else {
            return true;
        };
        match self.finished.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.join().is_err() {
                    warn!("loader thread panicked");
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "loader did not stop in time");
                false
            }
        }
    }
}

impl<T: Send + 'static> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Drop for TaskQueue<T> {
    fn drop(&mut self) {
        for (_, flag) in self.outstanding.drain() {
            flag.store(true, Ordering::Release);
        }
        // Worker exits once the sender is gone
        self.sender = None;
    }
}

// ============================================================
// TESTS
// ============================================================
