//! Bounded job queue with in-flight deduplication.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{Job, JobKey};

/// Why [`JobQueue::try_submit`] refused a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// A job with the same key is queued or executing.
    Duplicate,
    Full,
    Disconnected,
}

/// Shared queue between submitters and the worker pool.
///
/// The registry holds the key of every job that is queued or executing.
/// A key enters the registry on a successful [`JobQueue::submit`] and leaves
/// it when the worker that ran the job calls [`JobQueue::complete`], so no
/// two jobs with the same key can ever be in flight together.
pub struct JobQueue {
    sender: Sender<Job>,
    receiver: Receiver<Job>,
    registry: Mutex<HashSet<JobKey>>,
    released: Condvar,
    capacity: usize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            registry: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            capacity,
        }
    }

    /// Offer a job without blocking.
    ///
    /// Returns `false` when a job with the same `(target, task type)` is
    /// already queued or executing, or when the queue is full. Callers treat
    /// `false` as "try again later".
    pub fn submit(&self, job: Job) -> bool {
        self.try_submit(job).is_ok()
    }

    /// Like [`JobQueue::submit`], but says why a job was refused.
    pub fn try_submit(&self, job: Job) -> std::result::Result<(), Rejection> {
        let key = job.key();
        let mut registry = self.registry();

        if registry.contains(&key) {
            tracing::debug!(job = %key, "Rejected: already in flight");
            return Err(Rejection::Duplicate);
        }

        match self.sender.try_send(job) {
            Ok(()) => {
                registry.insert(key);
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                tracing::debug!(job = %key, capacity = self.capacity, "Rejected: queue full");
                Err(Rejection::Full)
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::warn!(job = %key, "Rejected: queue disconnected");
                Err(Rejection::Disconnected)
            }
        }
    }

    /// Number of jobs queued or executing.
    pub fn in_flight(&self) -> usize {
        self.registry().len()
    }

    /// Whether a job with this key is queued or executing.
    pub fn contains(&self, key: &JobKey) -> bool {
        self.registry().contains(key)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block until nothing is queued or executing, or the timeout elapses.
    /// Returns `true` if the queue went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut registry = self.registry();

        while !registry.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            registry = match self.released.wait_timeout(registry, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Block until no job with `key` is queued or executing, or the timeout
    /// elapses. Returns `true` if the key was released.
    pub fn wait_released(&self, key: &JobKey, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut registry = self.registry();

        while registry.contains(key) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            registry = match self.released.wait_timeout(registry, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    pub(crate) fn receiver(&self) -> Receiver<Job> {
        self.receiver.clone()
    }

    /// Release a job's key once its worker has written the final status.
    pub(crate) fn complete(&self, key: &JobKey) {
        let mut registry = self.registry();
        if registry.remove(key) {
            self.released.notify_all();
        }
    }

    /// Drop every job still waiting in the channel and release its key.
    /// Statuses of abandoned jobs are left as they are; the re-submission
    /// policy picks them up on the next pass.
    pub(crate) fn abandon_queued(&self) -> usize {
        let mut abandoned = 0;
        while let Ok(job) = self.receiver.try_recv() {
            tracing::debug!(job = %job.key(), "Abandoned queued job");
            self.complete(&job.key());
            abandoned += 1;
        }
        abandoned
    }

    fn registry(&self) -> MutexGuard<'_, HashSet<JobKey>> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
