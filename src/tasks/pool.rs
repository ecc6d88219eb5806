//! Fixed pool of worker threads consuming the shared job queue.

use crossbeam_channel::RecvTimeoutError;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{runner, Job, JobQueue};
use crate::adapters::Adapters;
use crate::db::Database;
use crate::error::Result;

/// How often idle workers check the stop flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared state every worker runs with.
#[derive(Clone)]
pub struct WorkerContext {
    pub db: Arc<Database>,
    pub queue: Arc<JobQueue>,
    pub adapters: Adapters,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    queue: Arc<JobQueue>,
}

impl WorkerPool {
    /// Spawn `workers` threads (at least one).
    pub fn start(workers: usize, ctx: WorkerContext) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let queue = ctx.queue.clone();
        let mut pool = Self {
            handles: Vec::with_capacity(workers.max(1)),
            stop: stop.clone(),
            queue,
        };

        for i in 0..workers.max(1) {
            let ctx = ctx.clone();
            let stop = stop.clone();
            // On a spawn failure `pool` drops here and joins the workers
            // already started.
            let handle = thread::Builder::new()
                .name(format!("galleria-worker-{}", i))
                .spawn(move || worker_loop(ctx, stop))?;
            pool.handles.push(handle);
        }

        tracing::info!(workers = pool.handles.len(), capacity = pool.queue.capacity(), "Worker pool started");
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop accepting work: running jobs finish, queued jobs are abandoned
    /// with their statuses left for the next sync to pick up.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.stop.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Worker thread panicked outside a job");
            }
        }
        let abandoned = self.queue.abandon_queued();
        tracing::info!(abandoned, "Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn worker_loop(ctx: WorkerContext, stop: Arc<AtomicBool>) {
    let receiver = ctx.queue.receiver();
    while !stop.load(Ordering::Acquire) {
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(job) => run_job(&ctx, job),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn run_job(ctx: &WorkerContext, job: Job) {
    let key = job.key();

    match catch_unwind(AssertUnwindSafe(|| runner::execute(ctx, &job))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(job = %key, error = %e, "Job could not record its status"),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(job = %key, panic = %message, "Job panicked");
            runner::record_panic(ctx, &job, &message);
        }
    }

    // Only release the key after the final status is written
    ctx.queue.complete(&key);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
