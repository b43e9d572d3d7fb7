//! Admission-controlled job queue.
//!
//! Jobs wait in an unbounded priority backlog and are picked up by a fixed
//! set of worker threads. Every job, including those run synchronously on the
//! caller's thread, must hold a permit from a shared semaphore while it
//! performs, so at most `concurrency` jobs execute at once.
//!
//! There is no timeout and no cancellation: if every permit is held by jobs
//! that never finish, everything else waits forever.

use log::{debug, error, info, trace};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, BinaryHeap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use super::group::{GroupMember, JobGroup};
use super::handle::{self, JobError, JobHandle, JobResult};
use super::job::{BlockJob, Job, JobFlags, Priority};
use crate::sync::{Permit, Semaphore, Synchronized};

/// Configuration for the job queue
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    /// Maximum number of jobs performing at once
    pub concurrency: usize,

    /// Name prefix for worker threads
    pub thread_name_prefix: String,

    /// Whether to collect statistics
    pub collect_stats: bool,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            thread_name_prefix: "corral-worker".to_string(),
            collect_stats: true,
        }
    }
}

/// Statistics about the job queue
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JobQueueStats {
    /// Jobs submitted, synchronous ones included
    pub submitted: usize,

    /// Jobs whose `perform` returned `Ok`
    pub completed: usize,

    /// Jobs whose `perform` returned `Err`
    pub failed: usize,

    /// Jobs that panicked
    pub panicked: usize,

    /// Jobs performing right now
    pub in_flight: usize,

    /// Jobs still waiting in the backlog
    pub queued: usize,
}

type Work = Box<dyn FnOnce(&Shared) + Send + 'static>;

/// Backlog entry; higher priority first, then lower sequence number
struct QueuedJob {
    priority: Priority,
    seq: u64,
    enqueued_at: Instant,
    work: Work,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Backlog {
    jobs: BinaryHeap<QueuedJob>,
    shutting_down: bool,
}

/// Submissions that have not resolved yet, by sequence number
#[derive(Default)]
struct Tracker {
    next_seq: u64,
    outstanding: BTreeSet<u64>,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    panicked: AtomicUsize,
    in_flight: AtomicUsize,
}

/// State shared between the queue and its workers
struct Shared {
    backlog: Mutex<Backlog>,
    job_available: Condvar,

    admission: Semaphore,

    tracker: Mutex<Tracker>,
    drained: Condvar,

    counters: Counters,
    collect_stats: bool,
}

/// Marks a submission resolved when dropped
struct Completion<'a> {
    shared: &'a Shared,
    seq: u64,
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        self.shared.complete(self.seq);
    }
}

/// Counts a performing job while alive
struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        counters.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Shared {
    /// Assign a sequence number and count the submission as outstanding
    fn register(&self) -> u64 {
        let mut tracker = self.tracker.lock();
        let seq = tracker.next_seq;
        tracker.next_seq += 1;
        tracker.outstanding.insert(seq);
        drop(tracker);

        if self.collect_stats {
            self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        }

        seq
    }

    fn complete(&self, seq: u64) {
        let mut tracker = self.tracker.lock();
        tracker.outstanding.remove(&seq);
        drop(tracker);
        self.drained.notify_all();
    }

    /// Block until no submission numbered below `mark` is outstanding
    fn wait_until_drained(&self, mark: u64) {
        let mut tracker = self.tracker.lock();
        while tracker
            .outstanding
            .first()
            .is_some_and(|&oldest| oldest < mark)
        {
            self.drained.wait(&mut tracker);
        }
    }

    fn admit(&self, flags: JobFlags) -> Permit<'_> {
        if flags.barrier {
            self.admission.acquire_all()
        } else {
            self.admission.acquire()
        }
    }

    fn next_job(&self) -> Option<QueuedJob> {
        let mut backlog = self.backlog.lock();
        loop {
            if let Some(job) = backlog.jobs.pop() {
                return Some(job);
            }
            if backlog.shutting_down {
                return None;
            }
            self.job_available.wait(&mut backlog);
        }
    }

    /// Run a job picked up by a worker, containing any panic
    fn execute<J: Job>(&self, job: J) -> JobResult<J::Output, J::Error> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            job.scheduled();
            let _permit = self.admit(job.flags());
            let _in_flight = InFlight::enter(&self.counters);
            job.perform()
        }));

        match outcome {
            Ok(Ok(value)) => {
                self.record(&self.counters.completed);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record(&self.counters.failed);
                Err(JobError::Failed(e))
            }
            Err(payload) => {
                self.record(&self.counters.panicked);
                let message = panic_message(payload.as_ref());
                error!("Job panicked: {}", message);
                Err(JobError::Panicked(message))
            }
        }
    }

    fn record(&self, counter: &AtomicUsize) {
        if self.collect_stats {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<unknown panic>".to_string()
    }
}

/// A job queue that runs at most `concurrency` jobs at once
pub struct JobQueue {
    shared: Arc<Shared>,

    /// Worker threads
    workers: Vec<JoinHandle<()>>,

    concurrency: usize,
}

impl JobQueue {
    /// Create a queue running at most `concurrency` jobs at once.
    ///
    /// # Panics
    ///
    /// Panics if `concurrency` is zero.
    pub fn new(concurrency: usize) -> Self {
        Self::with_config(JobQueueConfig {
            concurrency,
            ..Default::default()
        })
    }

    /// Create a queue from a configuration.
    ///
    /// # Panics
    ///
    /// Panics if `config.concurrency` is zero.
    pub fn with_config(config: JobQueueConfig) -> Self {
        assert!(
            config.concurrency > 0,
            "Must provide at least one concurrent job"
        );

        info!(
            "Creating job queue with {} workers",
            config.concurrency
        );

        let shared = Arc::new(Shared {
            backlog: Mutex::new(Backlog::default()),
            job_available: Condvar::new(),
            admission: Semaphore::new(config.concurrency),
            tracker: Mutex::new(Tracker::default()),
            drained: Condvar::new(),
            counters: Counters::default(),
            collect_stats: config.collect_stats,
        });

        let mut workers = Vec::with_capacity(config.concurrency);

        for id in 0..config.concurrency {
            let thread_name = format!("{}-{}", config.thread_name_prefix, id);
            let shared = Arc::clone(&shared);

            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || Self::worker_loop(id, &shared))
                .expect("Failed to spawn worker thread");

            workers.push(handle);
        }

        Self {
            shared,
            workers,
            concurrency: config.concurrency,
        }
    }

    /// Worker thread main loop
    fn worker_loop(id: usize, shared: &Shared) {
        debug!("Worker {}: Starting", id);

        while let Some(job) = shared.next_job() {
            trace!(
                "Worker {}: Picked up job {} (queue time: {:.2}ms)",
                id,
                job.seq,
                job.enqueued_at.elapsed().as_secs_f64() * 1000.0
            );

            (job.work)(shared);
        }

        debug!("Worker {}: Shutting down", id);
    }

    /// Queue `job` and return a handle to its eventual outcome
    pub fn submit<J: Job>(&self, job: J) -> JobHandle<J::Output, J::Error> {
        self.enqueue(job, None)
    }

    /// Queue `job` as a member of `group`.
    ///
    /// The job leaves the group once its handle is resolved, so
    /// [`JobGroup::wait`] returns only after every member's outcome is ready.
    pub fn submit_in<J: Job>(
        &self,
        group: &JobGroup,
        job: J,
    ) -> JobHandle<J::Output, J::Error> {
        self.enqueue(job, Some(group.enter()))
    }

    fn enqueue<J: Job>(
        &self,
        job: J,
        member: Option<GroupMember>,
    ) -> JobHandle<J::Output, J::Error> {
        let seq = self.shared.register();
        let (resolver, handle) = handle::pair(seq);
        let priority = job.priority();

        let work: Work = Box::new(move |shared: &Shared| {
            let outcome = shared.execute(job);
            resolver.resolve(outcome);
            shared.complete(seq);
            drop(member);
        });

        let mut backlog = self.shared.backlog.lock();
        backlog.jobs.push(QueuedJob {
            priority,
            seq,
            enqueued_at: Instant::now(),
            work,
        });
        drop(backlog);
        self.shared.job_available.notify_one();

        trace!("Job {} submitted with priority {:?}", seq, priority);

        handle
    }

    /// Queue a closure as a job with default priority and no flags
    pub fn submit_fn<F, T, E>(&self, f: F) -> JobHandle<T, E>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.submit(BlockJob::new(f))
    }

    /// Run `job` on the calling thread once a slot is free and return its outcome.
    ///
    /// The job counts against the same concurrency limit as queued jobs.
    /// Panics inside the job propagate to the caller.
    pub fn submit_and_wait<J: Job>(&self, job: J) -> Result<J::Output, J::Error> {
        let seq = self.shared.register();
        let _completion = Completion {
            shared: &self.shared,
            seq,
        };

        job.scheduled();
        let _permit = self.shared.admit(job.flags());
        let _in_flight = InFlight::enter(&self.shared.counters);

        trace!("Job {} performing on the calling thread", seq);

        let result = match panic::catch_unwind(AssertUnwindSafe(|| job.perform())) {
            Ok(result) => result,
            Err(payload) => {
                self.shared.record(&self.shared.counters.panicked);
                panic::resume_unwind(payload);
            }
        };

        match &result {
            Ok(_) => self.shared.record(&self.shared.counters.completed),
            Err(_) => self.shared.record(&self.shared.counters.failed),
        }

        result
    }

    /// Block until every job submitted before this call has resolved
    pub fn wait(&self) {
        let mark = self.shared.tracker.lock().next_seq;
        self.shared.wait_until_drained(mark);
    }

    /// Maximum number of jobs performing at once
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Get current statistics for the queue
    pub fn stats(&self) -> JobQueueStats {
        let queued = self.shared.backlog.lock().jobs.len();
        let counters = &self.shared.counters;

        if self.shared.collect_stats {
            JobQueueStats {
                submitted: counters.submitted.load(Ordering::Relaxed),
                completed: counters.completed.load(Ordering::Relaxed),
                failed: counters.failed.load(Ordering::Relaxed),
                panicked: counters.panicked.load(Ordering::Relaxed),
                in_flight: counters.in_flight.load(Ordering::SeqCst),
                queued,
            }
        } else {
            JobQueueStats {
                in_flight: counters.in_flight.load(Ordering::SeqCst),
                queued,
                ..Default::default()
            }
        }
    }

    /// Finish every queued job, then stop the workers
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        info!("Shutting down job queue");
        self.shared.backlog.lock().shutting_down = true;
        self.shared.job_available.notify_all();

        for worker in self.workers.drain(..) {
            worker.join().unwrap_or_else(|e| {
                error!("Worker thread panicked during shutdown: {:?}", e);
            });
        }

        info!("Job queue shutdown complete");
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::with_config(JobQueueConfig::default())
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("concurrency", &self.concurrency)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Runs the closure on the calling thread once no job holds a slot, like a
/// barrier job. Not reentrant.
impl Synchronized for JobQueue {
    fn synchronized<T>(&self, f: impl FnOnce() -> T) -> T {
        let _permit = self.shared.admission.acquire_all();
        f()
    }
}
