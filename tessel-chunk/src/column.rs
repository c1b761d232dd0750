use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use num_traits::ToPrimitive;
use tessel_error::{TesselExpect, TesselResult, tessel_bail, tessel_err};
use tessel_metrics::{Counter, TesselMetrics};
use tessel_store::{Key, NodeId, Store};

use crate::{Chunk, NewChunk};

/// A logical column: a sequence of rows partitioned into contiguous chunks.
///
/// `espc` holds the first row of every chunk plus a trailing total row count, so chunk `c`
/// covers rows `espc[c]..espc[c + 1]`. Chunk `c` is stored under [`Column::chunk_key`] and
/// lives on node [`Column::home`].
pub struct Column {
    key: Key,
    espc: Vec<u64>,
    homes: Vec<NodeId>,
    metrics: ChunkMetrics,
}

#[derive(Clone)]
pub(crate) struct ChunkMetrics {
    pub(crate) promotions: Arc<Counter>,
    pub(crate) finalized: Arc<Counter>,
}

impl ChunkMetrics {
    fn new(metrics: &TesselMetrics) -> Self {
        Self {
            promotions: metrics.counter("chunk.promotions"),
            finalized: metrics.counter("chunk.finalized"),
        }
    }
}

impl Column {
    pub fn try_new(key: Key, espc: Vec<u64>, homes: Vec<NodeId>) -> TesselResult<Self> {
        Self::try_new_with_metrics(key, espc, homes, &TesselMetrics::default())
    }

    pub fn try_new_with_metrics(
        key: Key,
        espc: Vec<u64>,
        homes: Vec<NodeId>,
        metrics: &TesselMetrics,
    ) -> TesselResult<Self> {
        if espc.first() != Some(&0) {
            tessel_bail!(InvalidArgument: "chunk layout of {key} must start at row 0");
        }
        if !espc.is_sorted() {
            tessel_bail!(InvalidArgument: "chunk layout of {key} is not monotonic");
        }
        if homes.len() + 1 != espc.len() {
            tessel_bail!(
                InvalidArgument: "{key} has {} chunks but {} homes",
                espc.len() - 1,
                homes.len()
            );
        }
        Ok(Self {
            key,
            espc,
            homes,
            metrics: ChunkMetrics::new(metrics),
        })
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Total number of rows.
    pub fn len(&self) -> u64 {
        self.espc.last().copied().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nchunks(&self) -> usize {
        self.homes.len()
    }

    pub fn chunk_start(&self, cidx: usize) -> u64 {
        self.espc[cidx]
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn chunk_len(&self, cidx: usize) -> usize {
        (self.espc[cidx + 1] - self.espc[cidx]) as usize
    }

    /// The index of the chunk holding `row`.
    pub fn locate(&self, row: u64) -> TesselResult<usize> {
        if row >= self.len() {
            tessel_bail!(OutOfBounds: row, 0, self.len());
        }
        // Empty chunks share their start with the next one; the last match wins.
        Ok(self.espc.partition_point(|start| *start <= row) - 1)
    }

    pub fn chunk_key(&self, cidx: usize) -> Key {
        self.key.child(cidx)
    }

    /// The node that holds chunk `cidx`.
    pub fn home(&self, cidx: usize) -> NodeId {
        self.homes[cidx]
    }

    /// Indices of the chunks homed on `node`.
    pub fn chunks_on(&self, node: NodeId) -> impl Iterator<Item = usize> + '_ {
        self.homes
            .iter()
            .enumerate()
            .filter(move |(_, home)| **home == node)
            .map(|(cidx, _)| cidx)
    }

    /// Fetch and decode chunk `cidx`.
    pub fn chunk(self: &Arc<Self>, store: &dyn Store<Bytes>, cidx: usize) -> TesselResult<Chunk> {
        if cidx >= self.nchunks() {
            tessel_bail!(OutOfBounds: cidx as u64, 0, self.nchunks() as u64);
        }
        let key = self.chunk_key(cidx);
        let bytes = store
            .get(&key)
            .ok_or_else(|| tessel_err!(NotFound: "no chunk stored under {key}"))?;
        Chunk::decode(self.clone(), cidx, &bytes)
    }

    /// Read a single row, fetching its chunk from the store.
    pub fn at(self: &Arc<Self>, store: &dyn Store<Bytes>, row: u64) -> TesselResult<f64> {
        self.chunk(store, self.locate(row)?)?.at(row)
    }

    /// Read a single row as an integer, fetching its chunk from the store.
    pub fn at_i64(self: &Arc<Self>, store: &dyn Store<Bytes>, row: u64) -> TesselResult<i64> {
        self.chunk(store, self.locate(row)?)?.at_i64(row)
    }

    pub(crate) fn metrics(&self) -> &ChunkMetrics {
        &self.metrics
    }
}

impl Debug for Column {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("key", &self.key)
            .field("espc", &self.espc)
            .field("homes", &self.homes)
            .finish()
    }
}

/// Builds a [`Column`] from scratch by appending rows.
///
/// Every `rows_per_chunk` rows the staged values are compressed and published, with chunk homes
/// assigned round-robin over `nodes`.
pub struct ColumnWriter<'a> {
    store: &'a dyn Store<Bytes>,
    key: Key,
    rows_per_chunk: usize,
    nodes: Vec<NodeId>,
    espc: Vec<u64>,
    homes: Vec<NodeId>,
    staged: NewChunk,
    metrics: TesselMetrics,
}

impl<'a> ColumnWriter<'a> {
    pub fn new(
        store: &'a dyn Store<Bytes>,
        key: Key,
        rows_per_chunk: usize,
        nodes: Vec<NodeId>,
    ) -> TesselResult<Self> {
        if rows_per_chunk == 0 {
            tessel_bail!(InvalidArgument: "rows_per_chunk must be positive");
        }
        if nodes.is_empty() {
            tessel_bail!(InvalidArgument: "a column needs at least one home node");
        }
        Ok(Self {
            store,
            key,
            rows_per_chunk,
            nodes,
            espc: vec![0],
            homes: Vec::new(),
            staged: NewChunk::with_capacity(rows_per_chunk),
            metrics: TesselMetrics::default(),
        })
    }

    pub fn with_metrics(mut self, metrics: TesselMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn append_i64(&mut self, value: i64) {
        self.staged.append_i64(value);
        self.cut_if_full();
    }

    pub fn append_f64(&mut self, value: f64) {
        self.staged.append_f64(value);
        self.cut_if_full();
    }

    pub fn append_missing(&mut self) {
        self.staged.append_missing();
        self.cut_if_full();
    }

    fn cut_if_full(&mut self) {
        if self.staged.len() >= self.rows_per_chunk {
            self.cut();
        }
    }

    fn cut(&mut self) {
        let staged = std::mem::replace(&mut self.staged, NewChunk::with_capacity(self.rows_per_chunk));
        let cidx = self.homes.len();
        let rows = staged.len();
        let data = staged.compress();
        self.store.put(self.key.child(cidx), data.encode());

        let start = self.espc.last().copied().unwrap_or_default();
        let end = start
            + rows
                .to_u64()
                .tessel_expect("chunk row count fits in u64");
        self.espc.push(end);
        self.homes.push(self.nodes[cidx % self.nodes.len()]);
    }

    /// Publish the trailing partial chunk and return the column.
    pub fn finish(mut self) -> TesselResult<Arc<Column>> {
        if !self.staged.is_empty() {
            self.cut();
        }
        log::debug!(
            "wrote {} rows of {} in {} chunks",
            self.espc.last().copied().unwrap_or_default(),
            self.key,
            self.homes.len()
        );
        Column::try_new_with_metrics(self.key, self.espc, self.homes, &self.metrics).map(Arc::new)
    }
}
