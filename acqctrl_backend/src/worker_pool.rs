//! Worker pools running trigger-fired cycles.
//!
//! A submitted job comes with a completion callback. The callback is always invoked once the
//! job is over, with `false` ("no longer busy"), whether the job succeeded, failed or panicked.
//! Job failures can not reach the submitter: they are logged here.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error};

use crate::error::AcqResult;

pub type Job = Box<dyn FnOnce() -> AcqResult<()> + Send + 'static>;
pub type Completion = Box<dyn FnOnce(bool) + Send + 'static>;

pub trait WorkerPool: Send + Sync {
    fn submit(&self, name: &str, job: Job, completion: Completion);
}

fn execute(name: &str, job: Job, completion: Completion) {
    debug!(job = name, "cycle started");
    match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok(())) => debug!(job = name, "cycle finished"),
        Ok(Err(err)) => error!(job = name, "acquisition cycle failed: {}", err),
        Err(_) => error!(job = name, "acquisition cycle panicked"),
    }
    completion(false);
}

/// Bounded pool of worker threads.
pub struct RayonWorkerPool {
    pool: ThreadPool,
}
impl RayonWorkerPool {
    pub fn new(size: usize) -> AcqResult<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(size.max(1))
            .thread_name(|i| format!("acq-worker-{}", i))
            .build()?;
        Ok(Self { pool })
    }
}
impl WorkerPool for RayonWorkerPool {
    fn submit(&self, name: &str, job: Job, completion: Completion) {
        let name = name.to_string();
        self.pool.spawn(move || execute(&name, job, completion));
    }
}

/// Pool holding its jobs until [`QueuedWorkerPool::run_pending`] runs them on the calling
/// thread, for deterministic stepping.
#[derive(Default)]
pub struct QueuedWorkerPool {
    queue: Mutex<VecDeque<(String, Job, Completion)>>,
}
impl QueuedWorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs the queued jobs in submission order, returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            // the lock is released before running, jobs may submit again
            let Some((name, job, completion)) = self.queue.lock().pop_front() else {
                return ran;
            };
            execute(&name, job, completion);
            ran += 1;
        }
    }
}
impl WorkerPool for QueuedWorkerPool {
    fn submit(&self, name: &str, job: Job, completion: Completion) {
        self.queue
            .lock()
            .push_back((name.to_string(), job, completion));
    }
}
