//! Step schedulers that drive a [`Pipeline`] on one or many threads of this process.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tessel_cluster::{Job, panic_message};
use tessel_error::{NestedResult, TesselResult, tessel_bail, tessel_err};

use crate::pipeline::Pipeline;
use crate::rendezvous::Rendezvous;

/// The contract every training backend satisfies.
pub trait Trainer: Send + Sync {
    /// A pipeline whose parameters alias the ones being trained.
    fn layers(&self) -> TesselResult<Pipeline>;

    /// Begin training in the background. A trainer can be started once.
    fn start(&self) -> TesselResult<()>;

    /// Wait for training to stop, returning the first failure of any worker.
    fn join(&self) -> TesselResult<()>;

    /// Rows processed so far.
    fn samples(&self) -> u64;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainerOptions {
    /// Total steps to run, `0` for unbounded.
    pub steps: u64,
    /// Worker threads of a [`Threaded`] trainer.
    pub threads: usize,
    /// Re-anneal every stage after this many of a worker's steps, `0` to never adjust.
    pub adjust_interval: u64,
}

impl Default for TrainerOptions {
    fn default() -> Self {
        Self {
            steps: 0,
            threads: thread::available_parallelism().map_or(4, usize::from),
            adjust_interval: 1_000,
        }
    }
}

impl TrainerOptions {
    pub fn with_steps(mut self, steps: u64) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_adjust_interval(mut self, adjust_interval: u64) -> Self {
        self.adjust_interval = adjust_interval;
        self
    }
}

struct Worker {
    name: String,
    pipeline: Pipeline,
    quota: Option<u64>,
    processed: Arc<AtomicU64>,
    job: Arc<Job>,
    rendezvous: Option<Arc<Rendezvous>>,
    adjust_interval: u64,
}

impl Worker {
    fn run(&mut self) -> TesselResult<u64> {
        let mut done = 0u64;
        while self.quota.is_none_or(|quota| done < quota) && !self.job.is_cancelled() {
            if let Some(rendezvous) = &self.rendezvous {
                if !rendezvous.checkpoint() {
                    break;
                }
            }
            self.pipeline.step()?;
            self.pipeline.input_mut().advance();
            done += 1;
            let samples = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
            if self.adjust_interval > 0 && done % self.adjust_interval == 0 {
                self.pipeline.adjust(samples);
            }
        }
        Ok(done)
    }

    fn spawn(mut self) -> TesselResult<JoinHandle<TesselResult<u64>>> {
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| self.run())).unwrap_or_else(|panic| {
                    Err(tessel_err!(Generic: "{} panicked: {}", self.name, panic_message(&*panic)))
                });
                if let Some(rendezvous) = &self.rendezvous {
                    rendezvous.retire();
                }
                match &result {
                    Ok(done) => log::debug!("{} stopped after {done} steps", self.name),
                    Err(e) => {
                        log::error!("{} failed: {e}", self.name);
                        self.job.cancel(format!("{} failed: {e}", self.name));
                        if let Some(rendezvous) = &self.rendezvous {
                            rendezvous.cancel();
                        }
                    }
                }
                result
            })?;
        Ok(handle)
    }
}

fn join_workers(job: &Job, handles: Vec<JoinHandle<TesselResult<u64>>>) -> TesselResult<()> {
    let mut failure = None;
    for handle in handles {
        let result = handle
            .join()
            .map_err(|panic| tessel_err!(Generic: "trainer thread panicked: {}", panic_message(&*panic)))
            .settle();
        if let Err(e) = result {
            failure.get_or_insert(e);
        }
    }
    if failure.is_none() {
        job.finish();
    }
    failure.map_or(Ok(()), Err)
}

/// Trains on the calling pipeline from a single background thread.
pub struct Direct {
    view: Mutex<Pipeline>,
    pending: Mutex<Option<Pipeline>>,
    options: TrainerOptions,
    processed: Arc<AtomicU64>,
    job: Arc<Job>,
    worker: Mutex<Option<JoinHandle<TesselResult<u64>>>>,
}

impl Direct {
    pub fn try_new(pipeline: Pipeline, options: TrainerOptions) -> TesselResult<Self> {
        Ok(Self {
            view: Mutex::new(pipeline.replicate()?),
            pending: Mutex::new(Some(pipeline)),
            options,
            processed: Arc::new(AtomicU64::new(0)),
            job: Arc::new(Job::new("direct training")),
            worker: Mutex::new(None),
        })
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn cancel(&self, reason: &str) {
        self.job.cancel(reason);
    }
}

impl Trainer for Direct {
    fn layers(&self) -> TesselResult<Pipeline> {
        self.view.lock().replicate()
    }

    fn start(&self) -> TesselResult<()> {
        let Some(pipeline) = self.pending.lock().take() else {
            tessel_bail!(InvalidArgument: "direct trainer already started");
        };
        let worker = Worker {
            name: "direct-trainer".to_string(),
            pipeline,
            quota: (self.options.steps > 0).then_some(self.options.steps),
            processed: self.processed.clone(),
            job: self.job.clone(),
            rendezvous: None,
            adjust_interval: self.options.adjust_interval,
        };
        *self.worker.lock() = Some(worker.spawn()?);
        Ok(())
    }

    fn join(&self) -> TesselResult<()> {
        let handles = self.worker.lock().take().into_iter().collect();
        join_workers(&self.job, handles)
    }

    fn samples(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

/// Trains replicas that share one set of parameters, one per thread, without locking.
///
/// Replica `t` of `K` starts reading at row `len * t / K` and runs its share of the steps.
/// Updates to the shared parameters race and may occasionally be lost.
pub struct Threaded {
    view: Mutex<Pipeline>,
    pending: Mutex<Vec<(u64, Pipeline)>>,
    options: TrainerOptions,
    processed: Arc<AtomicU64>,
    rendezvous: Arc<Rendezvous>,
    job: Arc<Job>,
    workers: Mutex<Vec<JoinHandle<TesselResult<u64>>>>,
}

impl Threaded {
    pub fn try_new(pipeline: Pipeline, options: TrainerOptions) -> TesselResult<Self> {
        let threads = options.threads;
        if threads == 0 {
            tessel_bail!(InvalidArgument: "threaded trainer needs at least one thread");
        }
        let k = threads as u64;
        let len = pipeline.input().len();
        let replicas = (0..k)
            .map(|t| {
                let mut input = pipeline.input().boxed_clone();
                input.seek(len * t / k);
                let quota = options.steps / k + u64::from(t < options.steps % k);
                Ok((quota, pipeline.replicate_with_input(input, 0)?))
            })
            .collect::<TesselResult<Vec<_>>>()?;
        Ok(Self {
            view: Mutex::new(pipeline),
            pending: Mutex::new(replicas),
            options,
            processed: Arc::new(AtomicU64::new(0)),
            rendezvous: Arc::new(Rendezvous::new(0)),
            job: Arc::new(Job::new("threaded training")),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    /// Block until every live worker is parked between steps. Returns `false` if the trainer was
    /// cancelled meanwhile, and fails before [`Trainer::start`].
    pub fn suspend(&self) -> TesselResult<bool> {
        if !self.pending.lock().is_empty() {
            tessel_bail!(InvalidArgument: "threaded trainer is not running");
        }
        Ok(self.rendezvous.suspend())
    }

    pub fn resume(&self) {
        self.rendezvous.resume();
    }

    pub fn cancel(&self, reason: &str) {
        self.job.cancel(reason);
        self.rendezvous.cancel();
    }
}

impl Trainer for Threaded {
    fn layers(&self) -> TesselResult<Pipeline> {
        self.view.lock().replicate()
    }

    fn start(&self) -> TesselResult<()> {
        let replicas = std::mem::take(&mut *self.pending.lock());
        if replicas.is_empty() {
            tessel_bail!(InvalidArgument: "threaded trainer already started");
        }
        let unbounded = self.options.steps == 0;
        let mut workers = self.workers.lock();
        for (t, (quota, pipeline)) in replicas.into_iter().enumerate() {
            let worker = Worker {
                name: format!("threaded-trainer-{t}"),
                pipeline,
                quota: (!unbounded).then_some(quota),
                processed: self.processed.clone(),
                job: self.job.clone(),
                rendezvous: Some(self.rendezvous.clone()),
                adjust_interval: self.options.adjust_interval,
            };
            self.rendezvous.enlist();
            match worker.spawn() {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    self.rendezvous.retire();
                    self.cancel(&format!("starting threaded-trainer-{t} failed: {e}"));
                    return Err(e);
                }
            }
        }
        log::info!("started {} training threads", workers.len());
        Ok(())
    }

    fn join(&self) -> TesselResult<()> {
        let handles = std::mem::take(&mut *self.workers.lock());
        join_workers(&self.job, handles)
    }

    fn samples(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}
