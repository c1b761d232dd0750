//! An in-process cluster: a fixed set of nodes, each with its own task dispatcher, plus the
//! registry of running jobs.

use std::sync::Arc;

pub use dispatcher::*;
pub use job::*;
use tessel_error::{TesselResult, tessel_bail, tessel_err};
use tessel_metrics::TesselMetrics;
pub use tessel_store::NodeId;

mod dispatcher;
mod job;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterOptions {
    pub nodes: u16,
    pub threads_per_node: usize,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            nodes: 1,
            threads_per_node: std::thread::available_parallelism().map_or(4, usize::from),
        }
    }
}

impl ClusterOptions {
    pub fn with_nodes(mut self, nodes: u16) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_threads_per_node(mut self, threads: usize) -> Self {
        self.threads_per_node = threads;
        self
    }
}

/// One member of a [`Cluster`].
pub struct Node {
    id: NodeId,
    name: String,
    dispatcher: Dispatcher,
    metrics: TesselMetrics,
}

impl Node {
    fn new(id: NodeId, threads: usize, metrics: TesselMetrics) -> Self {
        let name = id.to_string();
        Self {
            dispatcher: Dispatcher::new(&name, threads, &metrics),
            id,
            name,
            metrics,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &TesselMetrics {
        &self.metrics
    }

    /// Run `task` on one of this node's worker threads.
    pub fn submit<F, R>(&self, task: F) -> TesselResult<Completion<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.dispatcher.submit(task)
    }
}

pub struct Cluster {
    nodes: Vec<Arc<Node>>,
    jobs: Jobs,
    metrics: TesselMetrics,
}

impl Cluster {
    pub fn try_new(options: ClusterOptions) -> TesselResult<Self> {
        Self::try_new_with_metrics(options, TesselMetrics::default())
    }

    pub fn try_new_with_metrics(options: ClusterOptions, metrics: TesselMetrics) -> TesselResult<Self> {
        if options.nodes == 0 {
            tessel_bail!(InvalidArgument: "a cluster needs at least one node");
        }
        if options.threads_per_node == 0 {
            tessel_bail!(InvalidArgument: "nodes need at least one worker thread");
        }
        let nodes = (0..options.nodes)
            .map(|id| Arc::new(Node::new(NodeId::new(id), options.threads_per_node, metrics.clone())))
            .collect();
        log::info!(
            "started cluster of {} nodes with {} threads each",
            options.nodes,
            options.threads_per_node
        );
        Ok(Self {
            nodes,
            jobs: Jobs::default(),
            metrics,
        })
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().map(|node| node.id())
    }

    pub fn node(&self, id: NodeId) -> TesselResult<&Arc<Node>> {
        self.nodes
            .get(id.index())
            .ok_or_else(|| tessel_err!(NotFound: "{id} is not a member of the cluster"))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn jobs(&self) -> &Jobs {
        &self.jobs
    }

    pub fn metrics(&self) -> &TesselMetrics {
        &self.metrics
    }

    /// Run `task` on the node `target`.
    pub fn submit_remote<F, R>(&self, target: NodeId, task: F) -> TesselResult<Completion<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.node(target)?.submit(task)
    }

    /// Drain and stop every node's workers.
    pub fn shutdown(&self) -> TesselResult<()> {
        self.nodes
            .iter()
            .map(|node| node.dispatcher.shutdown())
            .fold(Ok(()), |acc, res| acc.and(res))
    }
}
