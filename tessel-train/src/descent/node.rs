use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tessel_cluster::{NodeId, panic_message, wait_all};
use tessel_error::{NestedResult, ResultContext, TesselResult, tessel_err};
use tessel_metrics::Counter;

use super::RunContext;
use super::authority::{Authority, Shuttle};
use crate::input::{Batch, ChunksInput};
use crate::params::ModelParams;
use crate::pipeline::Pipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescentState {
    Idle,
    Collecting,
    Running,
    Done,
    Cancelled,
}

impl Display for DescentState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DescentState::Idle => "idle",
            DescentState::Collecting => "collecting",
            DescentState::Running => "running",
            DescentState::Done => "done",
            DescentState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

struct DescentMetrics {
    steps: Arc<Counter>,
    sent: Arc<Counter>,
}

/// One node's share of a distributed run.
///
/// The owner trains directly on the authoritative parameters. Every other node trains a private
/// copy and periodically ships what changed, with the chunk passes it completed, to the owner in a
/// [`Shuttle`], adopting the merged parameters that come back.
pub struct NodeDescent {
    ctx: Arc<RunContext>,
    node: NodeId,
    authority: Option<Arc<Authority>>,
    template: Mutex<Pipeline>,
    local: ModelParams,
    snapshot: ModelParams,
    pending: DashMap<usize, u32>,
    total: AtomicU64,
    seq: AtomicU64,
    sync_lock: Mutex<()>,
    batches: Mutex<Vec<Arc<Batch>>>,
    state: Mutex<DescentState>,
    epochs_over: AtomicBool,
    metrics: DescentMetrics,
}

impl NodeDescent {
    /// The owner's descent; `template` must alias the authority's parameters.
    pub(crate) fn owner(ctx: Arc<RunContext>, authority: Arc<Authority>, template: Pipeline) -> Self {
        Self::new(ctx.owner, ctx, Some(authority), template)
    }

    /// A participant's descent; `template` must own an independent copy of the parameters.
    pub(crate) fn participant(ctx: Arc<RunContext>, node: NodeId, template: Pipeline) -> Self {
        Self::new(node, ctx, None, template)
    }

    fn new(node: NodeId, ctx: Arc<RunContext>, authority: Option<Arc<Authority>>, template: Pipeline) -> Self {
        let local = template.params();
        let metrics = ctx.grid.cluster().metrics();
        Self {
            metrics: DescentMetrics {
                steps: metrics.counter("descent.steps"),
                sent: metrics.counter("descent.shuttles.sent"),
            },
            snapshot: local.deep_clone(),
            local,
            ctx,
            node,
            authority,
            template: Mutex::new(template),
            pending: DashMap::new(),
            total: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            sync_lock: Mutex::new(()),
            batches: Mutex::new(Vec::new()),
            state: Mutex::new(DescentState::Idle),
            epochs_over: AtomicBool::new(false),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn is_owner(&self) -> bool {
        self.authority.is_some()
    }

    pub fn state(&self) -> DescentState {
        *self.state.lock()
    }

    fn set_state(&self, state: DescentState) {
        let mut current = self.state.lock();
        log::trace!("{} descent {} -> {state}", self.node, *current);
        *current = state;
    }

    /// The parameters this node trains.
    pub fn params(&self) -> &ModelParams {
        &self.local
    }

    /// The parameters as of the last sync.
    pub fn snapshot(&self) -> &ModelParams {
        &self.snapshot
    }

    /// Cluster-wide rows processed, as last learned from the owner.
    pub fn samples(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Chunk passes completed here and not yet shipped to the owner.
    pub fn pending(&self, cidx: usize) -> u32 {
        self.pending.get(&cidx).map_or(0, |n| *n)
    }

    pub fn batches(&self) -> Vec<Arc<Batch>> {
        self.batches.lock().clone()
    }

    /// Gather the batches whose chunks live on this node. Returns how many were found.
    pub fn collect(&self) -> TesselResult<usize> {
        self.set_state(DescentState::Collecting);
        let chunks = self.ctx.grid.chunks();
        let response = &self.ctx.response;
        let batches = response
            .chunks_on(self.node)
            .map(|cidx| {
                let features = self
                    .ctx
                    .features
                    .iter()
                    .map(|column| column.chunk(chunks, cidx))
                    .collect::<TesselResult<Vec<_>>>()?;
                Ok(Arc::new(Batch::try_new(features, response.chunk(chunks, cidx)?)?))
            })
            .collect::<TesselResult<Vec<_>>>()?;
        let found = batches.len();
        *self.batches.lock() = batches;
        log::debug!("{} collected {found} batches for {}", self.node, self.ctx.run);
        self.set_state(DescentState::Idle);
        Ok(found)
    }

    /// Record one completed pass over chunk `cidx`.
    pub fn stepped(&self, cidx: usize) {
        match &self.authority {
            Some(authority) => authority.stepped(cidx),
            None => *self.pending.entry(cidx).or_insert(0) += 1,
        }
    }

    /// Ship local progress to the owner and adopt the merged parameters it replies with.
    ///
    /// Returns `false` without contacting the owner when no chunk pass is pending.
    pub fn sync(&self) -> TesselResult<bool> {
        let _guard = self.sync_lock.lock();
        let cidxs = self.pending.iter().map(|e| *e.key()).collect::<Vec<_>>();
        let counts = cidxs
            .into_iter()
            .filter_map(|cidx| self.pending.remove(&cidx))
            .collect::<Vec<_>>();
        if counts.is_empty() {
            return Ok(false);
        }

        let shuttle = Shuttle {
            run: self.ctx.run.clone(),
            node: self.node,
            seq: self.seq.fetch_add(1, Ordering::AcqRel) + 1,
            deltas: self.local.take_delta(&self.snapshot),
            counts,
        };
        let grid = self.ctx.grid.clone();
        let owner = self.ctx.owner;
        let reply = self
            .ctx
            .grid
            .cluster()
            .submit_remote(owner, move || {
                grid.registry(owner)?.get(&shuttle.run)?.merge(grid.runs(), &shuttle)
            })?
            .wait()
            .settle()
            .context(|| format!("{} sync with {owner}", self.node))?;
        self.metrics.sent.inc();

        self.local.rebase(&self.snapshot, &reply.params)?;
        self.total.store(reply.total, Ordering::Release);
        Ok(true)
    }

    /// Train on every row of `batch` in order, then count the pass. Does nothing once the run is
    /// cancelled.
    pub fn descend(&self, batch: &Arc<Batch>) -> TesselResult<()> {
        if self.ctx.job.is_cancelled() {
            return Ok(());
        }
        let input = Box::new(ChunksInput::new(batch.clone()));
        let mut pipeline = self.template.lock().replicate_with_input(input, self.samples())?;
        for _ in 0..batch.len() {
            pipeline.step()?;
            pipeline.input_mut().advance();
            self.metrics.steps.inc();
        }
        self.stepped(batch.cidx);
        Ok(())
    }

    fn epochs(self: &Arc<Self>, epochs: u64, wave: usize, idle: Duration) -> TesselResult<()> {
        self.set_state(DescentState::Running);
        let node = self.ctx.grid.cluster().node(self.node)?.clone();
        let batches = self.batches();
        let wave = if wave == 0 { batches.len().max(1) } else { wave };
        let mut completed = 0u64;
        while (epochs == 0 || completed < epochs) && !self.ctx.job.is_cancelled() {
            if batches.is_empty() && epochs == 0 {
                if self.ctx.job.wait_for(idle).is_err() {
                    break;
                }
                continue;
            }
            for group in batches.chunks(wave) {
                let tasks = group
                    .iter()
                    .map(|batch| {
                        let this = self.clone();
                        let batch = batch.clone();
                        node.submit(move || this.descend(&batch))
                    })
                    .collect::<TesselResult<Vec<_>>>()?;
                wait_all(tasks)?.into_iter().collect::<TesselResult<Vec<()>>>()?;
            }
            completed += 1;
            log::debug!("{} finished epoch {completed} of {}", self.node, self.ctx.run);
        }
        Ok(())
    }

    fn background(&self, interval: Duration) -> TesselResult<()> {
        loop {
            if self.ctx.job.is_cancelled() {
                return Ok(());
            }
            let finished = self.epochs_over.load(Ordering::Acquire);
            let worked = match &self.authority {
                Some(authority) => {
                    self.total.store(authority.samples(), Ordering::Release);
                    false
                }
                None => self.sync()?,
            };
            if finished && !worked {
                return Ok(());
            }
            if !worked {
                thread::sleep(interval);
            }
        }
    }

    /// Run this node's epochs alongside its sync loop. Once the epochs end, a participant
    /// flushes its remaining progress before this returns. Any fault cancels the run.
    pub(crate) fn drive(self: &Arc<Self>, epochs: u64, wave: usize, interval: Duration) -> TesselResult<()> {
        let this = self.clone();
        let background = thread::Builder::new()
            .name(format!("{}-descent-sync", self.node))
            .spawn(move || this.background(interval))?;

        let trained = self.epochs(epochs, wave, interval);
        self.epochs_over.store(true, Ordering::Release);
        let synced = background
            .join()
            .map_err(|panic| tessel_err!(Generic: "{} sync loop panicked: {}", self.node, panic_message(&*panic)))
            .settle();

        let result = trained.and(synced);
        let cancelled_before = self.ctx.job.is_cancelled();
        if let Err(e) = &result {
            if cancelled_before {
                log::debug!("{} stopped after cancellation of {}: {e}", self.node, self.ctx.run);
            } else {
                log::error!("{} descent of {} failed: {e}", self.node, self.ctx.run);
                self.ctx.job.cancel(format!("{} failed: {e}", self.node));
            }
        }
        if self.ctx.job.is_cancelled() {
            self.set_state(DescentState::Cancelled);
        } else {
            self.set_state(DescentState::Done);
        }
        if cancelled_before { Ok(()) } else { result }
    }
}
