//! Data-parallel training across the nodes of a [`Cluster`].
//!
//! Every node trains on the chunks it is home to. The node that starts a run owns its
//! [`Authority`]; the others reconcile with it through [`Shuttle`]s, so the cluster-wide sample
//! count is exact even though parameter updates are merged asynchronously.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tessel_chunk::Column;
use tessel_cluster::{Cluster, Job, NodeId, panic_message, wait_all};
use tessel_error::{NestedResult, TesselResult, tessel_bail, tessel_err};
use tessel_store::{Key, MemStore, Store};

pub use authority::*;
pub use node::*;

use crate::pipeline::Pipeline;
use crate::trainer::Trainer;

mod authority;
mod node;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescentOptions {
    /// Passes over every node's batches, `0` for unbounded.
    pub epochs: u64,
    /// How long a node's sync loop sleeps when it had nothing to do.
    pub sync_interval: Duration,
    /// Batches a node trains concurrently, `0` for all of them at once.
    pub worker_threads: usize,
}

impl Default for DescentOptions {
    fn default() -> Self {
        Self {
            epochs: 1,
            sync_interval: Duration::from_millis(1),
            worker_threads: 0,
        }
    }
}

impl DescentOptions {
    pub fn with_epochs(mut self, epochs: u64) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_sync_interval(mut self, sync_interval: Duration) -> Self {
        self.sync_interval = sync_interval;
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }
}

/// A cluster together with the stores and per-node run registries distributed runs use.
pub struct Grid {
    cluster: Cluster,
    chunks: Arc<dyn Store<Bytes>>,
    runs: Arc<dyn Store<RunRecord>>,
    registries: Vec<RunRegistry>,
}

impl Grid {
    pub fn new(cluster: Cluster, chunks: Arc<dyn Store<Bytes>>) -> Arc<Self> {
        let runs: Arc<dyn Store<RunRecord>> = Arc::new(MemStore::new(cluster.metrics().clone()));
        Self::with_run_store(cluster, chunks, runs)
    }

    pub fn with_run_store(
        cluster: Cluster,
        chunks: Arc<dyn Store<Bytes>>,
        runs: Arc<dyn Store<RunRecord>>,
    ) -> Arc<Self> {
        let registries = cluster.node_ids().map(|_| RunRegistry::default()).collect();
        Arc::new(Self {
            cluster,
            chunks,
            runs,
            registries,
        })
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn chunks(&self) -> &dyn Store<Bytes> {
        self.chunks.as_ref()
    }

    pub fn runs(&self) -> &dyn Store<RunRecord> {
        self.runs.as_ref()
    }

    /// The runs owned by `node`.
    pub fn registry(&self, node: NodeId) -> TesselResult<&RunRegistry> {
        self.registries
            .get(node.index())
            .ok_or_else(|| tessel_err!(NotFound: "{node} has no run registry"))
    }

    pub fn shutdown(&self) -> TesselResult<()> {
        self.cluster.shutdown()
    }
}

/// What every node of a run shares.
pub(crate) struct RunContext {
    grid: Arc<Grid>,
    run: Key,
    owner: NodeId,
    job: Arc<Job>,
    features: Vec<Arc<Column>>,
    response: Arc<Column>,
    finalized: AtomicBool,
}

fn same_layout(a: &Column, b: &Column) -> bool {
    a.nchunks() == b.nchunks()
        && (0..a.nchunks())
            .all(|cidx| a.chunk_start(cidx) == b.chunk_start(cidx) && a.home(cidx) == b.home(cidx))
        && a.len() == b.len()
}

/// The owner side of a distributed run.
///
/// Dropping a run that was never started unpublishes it. A started run keeps going until it
/// finishes or is cancelled.
pub struct Distributed {
    ctx: Arc<RunContext>,
    authority: Arc<Authority>,
    view: Mutex<Pipeline>,
    nodes: Vec<Arc<NodeDescent>>,
    options: DescentOptions,
    drivers: Mutex<Vec<JoinHandle<TesselResult<()>>>>,
    started: AtomicBool,
}

impl Distributed {
    /// Register a run of `pipeline` over `features` and `response`, owned by `owner`.
    ///
    /// All columns must share one chunk layout. Nothing trains until [`Trainer::start`].
    pub fn try_new(
        grid: Arc<Grid>,
        owner: NodeId,
        pipeline: Pipeline,
        features: Vec<Arc<Column>>,
        response: Arc<Column>,
        options: DescentOptions,
    ) -> TesselResult<Self> {
        if features.len() != pipeline.input().width() {
            tessel_bail!(
                InvalidArgument: "{} feature columns for a pipeline of width {}",
                features.len(),
                pipeline.input().width()
            );
        }
        if let Some(column) = features.iter().find(|c| !same_layout(c, &response)) {
            tessel_bail!(
                InvalidArgument: "{} is not chunked like the response {}",
                column.key(),
                response.key()
            );
        }
        let registry = grid.registry(owner)?;

        let job = grid
            .cluster()
            .jobs()
            .create(format!("distributed descent over {}", response.key()));
        let run = Key::random("run");
        let chunk_lens = (0..response.nchunks())
            .map(|cidx| response.chunk_len(cidx) as u64)
            .collect();
        let authority = Arc::new(Authority::new(
            run.clone(),
            owner,
            job.clone(),
            pipeline.params(),
            chunk_lens,
            grid.cluster().len() - 1,
            grid.cluster().metrics(),
        ));
        let record = RunRecord::new(owner, job.id(), response.nchunks());
        let ctx = Arc::new(RunContext {
            grid: grid.clone(),
            run,
            owner,
            job,
            features,
            response,
            finalized: AtomicBool::new(false),
        });
        let nodes = grid
            .cluster()
            .node_ids()
            .map(|node| {
                let descent = if node == owner {
                    NodeDescent::owner(ctx.clone(), authority.clone(), pipeline.replicate()?)
                } else {
                    NodeDescent::participant(ctx.clone(), node, pipeline.deep_clone())
                };
                Ok(Arc::new(descent))
            })
            .collect::<TesselResult<Vec<_>>>();
        let nodes = match nodes {
            Ok(nodes) => nodes,
            Err(e) => {
                grid.cluster().jobs().remove(ctx.job.id());
                return Err(e);
            }
        };
        grid.runs().put(ctx.run.clone(), record);
        registry.register(authority.clone());
        log::info!("registered run {} owned by {owner} over {} nodes", ctx.run, nodes.len());

        Ok(Self {
            ctx,
            authority,
            view: Mutex::new(pipeline),
            nodes,
            options,
            drivers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn run(&self) -> &Key {
        &self.ctx.run
    }

    pub fn owner(&self) -> NodeId {
        self.ctx.owner
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.ctx.job
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }

    pub fn node(&self, node: NodeId) -> TesselResult<&Arc<NodeDescent>> {
        self.nodes
            .get(node.index())
            .ok_or_else(|| tessel_err!(NotFound: "{node} takes no part in run {}", self.ctx.run))
    }

    /// Cancel the run. A run that was never started is torn down right away.
    pub fn cancel(&self, reason: &str) {
        self.ctx.job.cancel(reason);
        if !self.started.load(Ordering::Acquire) {
            finalize(&self.ctx, &self.authority);
        }
    }

    fn collect(&self) -> TesselResult<usize> {
        let grid = &self.ctx.grid;
        let tasks = self
            .nodes
            .iter()
            .map(|descent| {
                let descent = descent.clone();
                grid.cluster().submit_remote(descent.node(), move || descent.collect())
            })
            .collect::<TesselResult<Vec<_>>>()?;
        let found = wait_all(tasks)?
            .into_iter()
            .collect::<TesselResult<Vec<_>>>()?;
        Ok(found.into_iter().sum())
    }

    fn spawn_driver(&self, descent: Arc<NodeDescent>) -> TesselResult<JoinHandle<TesselResult<()>>> {
        let ctx = self.ctx.clone();
        let authority = self.authority.clone();
        let options = self.options.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-descent", descent.node()))
            .spawn(move || {
                let result = descent.drive(options.epochs, options.worker_threads, options.sync_interval);
                if descent.is_owner() {
                    if !authority.wait_participants(options.sync_interval.max(Duration::from_millis(1))) {
                        log::debug!("{} stopped waiting for participants of {}", ctx.owner, ctx.run);
                    }
                    finalize(&ctx, &authority);
                } else if !ctx.job.is_cancelled() {
                    report_done(&ctx)?;
                }
                result
            })?;
        Ok(handle)
    }
}

/// Tell the owner a participant has flushed its last shuttle.
fn report_done(ctx: &RunContext) -> TesselResult<()> {
    let grid = ctx.grid.clone();
    let (owner, run) = (ctx.owner, ctx.run.clone());
    ctx.grid
        .cluster()
        .submit_remote(owner, move || grid.registry(owner)?.get(&run).map(|a| a.participant_done()))?
        .wait()?
}

/// Tear the run down on the owner, leaving the job done unless it was cancelled. Only the first
/// call has any effect.
fn finalize(ctx: &RunContext, authority: &Authority) {
    if ctx.finalized.swap(true, Ordering::AcqRel) {
        return;
    }
    if let Ok(registry) = ctx.grid.registry(ctx.owner) {
        registry.deregister(&ctx.run);
    }
    ctx.grid.runs().remove(&ctx.run);
    ctx.grid.cluster().jobs().remove(ctx.job.id());
    let summary = ctx.grid.cluster().metrics().summary("descent.");
    if ctx.job.finish() {
        log::info!("run {} done after {} samples: {summary}", ctx.run, authority.samples());
    } else {
        log::warn!("run {} cancelled after {} samples: {summary}", ctx.run, authority.samples());
    }
}

impl Trainer for Distributed {
    fn layers(&self) -> TesselResult<Pipeline> {
        self.view.lock().replicate()
    }

    fn start(&self) -> TesselResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            tessel_bail!(InvalidArgument: "run {} already started", self.ctx.run);
        }
        if self.ctx.job.is_cancelled() {
            finalize(&self.ctx, &self.authority);
            tessel_bail!(Cancelled: "run {} was cancelled before it started", self.ctx.run);
        }
        let batches = match self.collect() {
            Ok(batches) => batches,
            Err(e) => {
                self.ctx.job.cancel(format!("collecting batches failed: {e}"));
                finalize(&self.ctx, &self.authority);
                return Err(e);
            }
        };
        log::info!("run {} training on {batches} batches", self.ctx.run);

        let mut drivers = self.drivers.lock();
        let mut owner_driving = false;
        for descent in &self.nodes {
            match self.spawn_driver(descent.clone()) {
                Ok(handle) => {
                    owner_driving |= descent.is_owner();
                    drivers.push(handle);
                }
                Err(e) => {
                    self.ctx.job.cancel(format!("starting {} failed: {e}", descent.node()));
                    // Without its driver the owner never tears the run down.
                    if !owner_driving {
                        finalize(&self.ctx, &self.authority);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn join(&self) -> TesselResult<()> {
        let handles = std::mem::take(&mut *self.drivers.lock());
        let mut failure = None;
        for handle in handles {
            let result = handle
                .join()
                .map_err(|panic| tessel_err!(Generic: "descent driver panicked: {}", panic_message(&*panic)))
                .settle();
            if let Err(e) = result {
                failure.get_or_insert(e);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    /// Rows processed across the cluster, counted exactly once each.
    fn samples(&self) -> u64 {
        self.authority.samples()
    }
}

impl Drop for Distributed {
    fn drop(&mut self) {
        if !self.started.load(Ordering::Acquire) && !self.ctx.finalized.load(Ordering::Acquire) {
            self.cancel("dropped before it started");
        }
    }
}
