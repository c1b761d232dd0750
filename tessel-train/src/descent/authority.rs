use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tessel_cluster::{Job, JobId, NodeId};
use tessel_error::{TesselResult, tessel_bail, tessel_err};
use tessel_metrics::{Counter, Histogram, TesselMetrics, Timer};
use tessel_store::{Key, Store};

use crate::params::{ModelParams, StageValues};

/// The published record of a distributed run, stored under the run key.
///
/// `merged` holds the highest shuttle sequence applied per node, which is what makes a replayed
/// shuttle detectable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    pub owner: NodeId,
    pub job: JobId,
    pub nchunks: usize,
    pub merged: HashMap<NodeId, u64>,
}

impl RunRecord {
    pub fn new(owner: NodeId, job: JobId, nchunks: usize) -> Self {
        Self {
            owner,
            job,
            nchunks,
            merged: HashMap::new(),
        }
    }

    /// The record after accepting `seq` from `node`, or `None` if that sequence was already seen.
    fn accept(&self, node: NodeId, seq: u64) -> Option<RunRecord> {
        if self.merged.get(&node).is_some_and(|&last| last >= seq) {
            return None;
        }
        let mut next = self.clone();
        next.merged.insert(node, seq);
        Some(next)
    }
}

/// A parameter delta and the per-chunk step counts accumulated by one node since its last sync.
#[derive(Debug, Clone)]
pub struct Shuttle {
    pub run: Key,
    pub node: NodeId,
    /// Strictly increasing per node and run.
    pub seq: u64,
    pub deltas: Vec<StageValues>,
    pub counts: Vec<(usize, u32)>,
}

impl Display for Shuttle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "shuttle {} from {} for {}", self.seq, self.node, self.run)
    }
}

/// The authoritative parameters and sample total after a merge.
#[derive(Debug, Clone)]
pub struct ShuttleReply {
    pub params: Vec<StageValues>,
    pub total: u64,
}

#[derive(Clone)]
struct MergeMetrics {
    merged: Arc<Counter>,
    duplicate: Arc<Counter>,
    latency: Arc<Timer>,
    chunks: Arc<Histogram>,
}

impl MergeMetrics {
    fn new(metrics: &TesselMetrics) -> Self {
        Self {
            merged: metrics.counter("descent.shuttles.merged"),
            duplicate: metrics.counter("descent.shuttles.duplicate"),
            latency: metrics.timer("descent.merge.latency"),
            chunks: metrics.histogram("descent.merge.chunks"),
        }
    }
}

/// The owner-side state of a distributed run: the live parameters and per-chunk step counts.
pub struct Authority {
    run: Key,
    owner: NodeId,
    job: Arc<Job>,
    params: ModelParams,
    counts: Arc<[AtomicU64]>,
    chunk_lens: Vec<u64>,
    merge_lock: Mutex<()>,
    participants: Mutex<usize>,
    participants_done: Condvar,
    metrics: MergeMetrics,
}

impl Authority {
    pub fn new(
        run: Key,
        owner: NodeId,
        job: Arc<Job>,
        params: ModelParams,
        chunk_lens: Vec<u64>,
        participants: usize,
        metrics: &TesselMetrics,
    ) -> Self {
        Self {
            counts: chunk_lens.iter().map(|_| AtomicU64::new(0)).collect(),
            run,
            owner,
            job,
            params,
            chunk_lens,
            merge_lock: Mutex::new(()),
            participants: Mutex::new(participants),
            participants_done: Condvar::new(),
            metrics: MergeMetrics::new(metrics),
        }
    }

    pub fn run(&self) -> &Key {
        &self.run
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn nchunks(&self) -> usize {
        self.counts.len()
    }

    /// Record one completed pass over chunk `cidx`.
    pub fn stepped(&self, cidx: usize) {
        self.counts[cidx].fetch_add(1, Ordering::AcqRel);
    }

    pub fn count(&self, cidx: usize) -> u64 {
        self.counts[cidx].load(Ordering::Acquire)
    }

    /// Rows processed across the cluster: every chunk's pass count times its length.
    pub fn samples(&self) -> u64 {
        self.counts
            .iter()
            .zip(&self.chunk_lens)
            .map(|(count, len)| count.load(Ordering::Acquire).saturating_mul(*len))
            .fold(0, u64::saturating_add)
    }

    /// Fold a shuttle into the authoritative state, at most once per `(node, seq)`.
    ///
    /// The run record is updated through [`Store::apply`]; a sequence the record has already seen
    /// is answered with the current state without being applied again. Fails with `NotFound` once
    /// the run record is gone.
    pub fn merge(&self, runs: &dyn Store<RunRecord>, shuttle: &Shuttle) -> TesselResult<ShuttleReply> {
        if shuttle.run != self.run {
            tessel_bail!(InvalidArgument: "{shuttle} sent to {}", self.run);
        }
        self.params.check_shape(&shuttle.deltas)?;
        if let Some(&(cidx, _)) = shuttle.counts.iter().find(|(cidx, _)| *cidx >= self.nchunks()) {
            tessel_bail!(OutOfBounds: cidx as u64, 0, self.nchunks() as u64);
        }

        let _time = self.metrics.latency.time();
        let _guard = self.merge_lock.lock();
        let mut fresh = false;
        runs.apply(&self.run, &mut |current| {
            let record = current.ok_or_else(|| tessel_err!(NotFound: "run {} is not registered", shuttle.run))?;
            let next = record.accept(shuttle.node, shuttle.seq);
            fresh = next.is_some();
            Ok(next)
        })?;

        if fresh {
            self.params.add(&shuttle.deltas)?;
            for &(cidx, n) in &shuttle.counts {
                self.counts[cidx].fetch_add(u64::from(n), Ordering::AcqRel);
            }
            self.metrics.merged.inc();
            self.metrics
                .chunks
                .update(i64::try_from(shuttle.counts.len()).unwrap_or(i64::MAX));
            log::trace!("merged {shuttle}");
        } else {
            self.metrics.duplicate.inc();
            log::debug!("ignored replayed {shuttle}");
        }

        Ok(ShuttleReply {
            params: self.params.values(),
            total: self.samples(),
        })
    }

    /// A participating node finished its epochs and flushed its last shuttle.
    pub fn participant_done(&self) {
        let mut remaining = self.participants.lock();
        *remaining = remaining.saturating_sub(1);
        self.participants_done.notify_all();
    }

    /// Wait until every participant is done or the job is cancelled. Returns whether all finished.
    pub fn wait_participants(&self, poll: Duration) -> bool {
        let mut remaining = self.participants.lock();
        while *remaining > 0 && !self.job.is_cancelled() {
            self.participants_done.wait_for(&mut remaining, poll);
        }
        *remaining == 0
    }
}

/// The runs a node owns.
#[derive(Default)]
pub struct RunRegistry {
    runs: DashMap<Key, Arc<Authority>>,
}

impl RunRegistry {
    pub fn register(&self, authority: Arc<Authority>) {
        self.runs.insert(authority.run().clone(), authority);
    }

    pub fn get(&self, run: &Key) -> TesselResult<Arc<Authority>> {
        self.runs
            .get(run)
            .map(|a| a.value().clone())
            .ok_or_else(|| tessel_err!(NotFound: "no authority for run {run}"))
    }

    pub fn deregister(&self, run: &Key) -> Option<Arc<Authority>> {
        self.runs.remove(run).map(|(_, a)| a)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
