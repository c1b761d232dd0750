#![cfg(test)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tessel_chunk::{ChunkStore, Column, ColumnWriter};
use tessel_cluster::{Cluster, ClusterOptions, JobStatus};
use tessel_store::{Key, NodeId, Store};
use tessel_train::{
    DescentOptions, Distributed, Grid, LayerOptions, Linear, Pipeline, RowsInput, Softmax, Trainer,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn grid(nodes: u16) -> (Arc<Grid>, Arc<ChunkStore>) {
    let cluster = Cluster::try_new(ClusterOptions::default().with_nodes(nodes).with_threads_per_node(2)).unwrap();
    let store = Arc::new(ChunkStore::default());
    (Grid::new(cluster, store.clone()), store)
}

fn column(grid: &Grid, store: &ChunkStore, values: &[f64], rows_per_chunk: usize) -> Arc<Column> {
    let nodes = grid.cluster().node_ids().collect();
    let mut writer = ColumnWriter::new(store, Key::random("column"), rows_per_chunk, nodes).unwrap();
    values.iter().for_each(|v| writer.append_f64(*v));
    writer.finish().unwrap()
}

/// `y = 2x + 1` over `rows` points, as a feature and a response column.
fn regression(grid: &Grid, store: &ChunkStore, rows: usize, rows_per_chunk: usize) -> (Arc<Column>, Arc<Column>) {
    let xs = (0..rows).map(|r| r as f64 / rows as f64).collect::<Vec<_>>();
    let ys = xs.iter().map(|x| 2.0 * x + 1.0).collect::<Vec<_>>();
    (
        column(grid, store, &xs, rows_per_chunk),
        column(grid, store, &ys, rows_per_chunk),
    )
}

fn linear_model() -> Pipeline {
    Pipeline::try_new(
        Box::new(RowsInput::try_new(vec![0.0], vec![0.0], 1).unwrap()),
        vec![Box::new(Linear::new(1, LayerOptions::default().with_rate(0.01)))],
        0,
    )
    .unwrap()
}

#[test]
fn one_sync_reconciles_pending_counts_and_params() {
    init_logger();
    let (grid, store) = grid(2);
    let (x, y) = regression(&grid, &store, 16, 2);
    let run = Distributed::try_new(
        grid.clone(),
        NodeId::new(0),
        linear_model(),
        vec![x],
        y,
        DescentOptions::default(),
    )
    .unwrap();
    let participant = run.node(NodeId::new(1)).unwrap().clone();
    assert!(!participant.is_owner());
    let before = run.authority().params().values();

    (0..5).for_each(|_| participant.stepped(3));
    (0..2).for_each(|_| participant.stepped(7));
    participant.params().stages()[0].weights.add(0, 0.5);
    assert_eq!(participant.pending(3), 5);

    assert!(participant.sync().unwrap());
    assert_eq!(participant.snapshot().values(), run.authority().params().values());
    assert_eq!(participant.params().values(), participant.snapshot().values());
    assert_eq!(run.authority().count(3), 5);
    assert_eq!(run.authority().count(7), 2);
    assert_eq!(participant.pending(3), 0);
    assert_eq!(participant.samples(), 14);
    assert_eq!(run.samples(), 14);
    assert_eq!(
        run.authority().params().values()[0].weights[0],
        before[0].weights[0] + 0.5
    );

    assert!(!participant.sync().unwrap());
    assert_eq!(grid.cluster().metrics().count("descent.shuttles.sent"), 1);
    grid.shutdown().unwrap();
}

#[test]
fn counts_are_exact_under_concurrent_steps_and_syncs() {
    init_logger();
    let (grid, store) = grid(2);
    let (x, y) = regression(&grid, &store, 8, 2);
    let run = Distributed::try_new(grid.clone(), NodeId::new(0), linear_model(), vec![x], y, DescentOptions::default())
        .unwrap();
    let participant = run.node(NodeId::new(1)).unwrap().clone();
    let owner = run.node(NodeId::new(0)).unwrap().clone();

    let steppers = (0..4)
        .map(|t| {
            let participant = participant.clone();
            let owner = owner.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    participant.stepped((t + i) % 4);
                    owner.stepped(i % 4);
                }
            })
        })
        .collect::<Vec<_>>();
    let syncer = {
        let participant = participant.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                participant.sync().unwrap();
            }
        })
    };
    steppers.into_iter().for_each(|h| h.join().unwrap());
    syncer.join().unwrap();
    while participant.sync().unwrap() {}

    let counted = (0..4).map(|cidx| run.authority().count(cidx)).sum::<u64>();
    assert_eq!(counted, 4_000);
    assert_eq!(run.samples(), 8_000);
    grid.shutdown().unwrap();
}

#[test]
fn every_row_is_counted_once_per_epoch() {
    init_logger();
    let (grid, store) = grid(3);
    let (x, y) = regression(&grid, &store, 60, 5);
    let run = Distributed::try_new(
        grid.clone(),
        NodeId::new(1),
        linear_model(),
        vec![x],
        y,
        DescentOptions::default().with_epochs(2).with_worker_threads(2),
    )
    .unwrap();
    let view = run.layers().unwrap();
    let before = view.params().values();

    run.start().unwrap();
    run.join().unwrap();

    assert_eq!(run.samples(), 120);
    assert_eq!(grid.cluster().metrics().count("descent.steps"), 120);
    assert_eq!(run.job().status(), JobStatus::Done);
    assert!(grid.runs().get(run.run()).is_none());
    assert!(grid.registry(run.owner()).unwrap().is_empty());
    assert!(grid.cluster().jobs().is_empty());
    assert_ne!(view.params().values(), before);
    assert!(run.start().is_err());
    grid.shutdown().unwrap();
}

#[test]
fn samples_are_monotone_and_stable_after_cancel() {
    init_logger();
    let (grid, store) = grid(2);
    let (x, y) = regression(&grid, &store, 40, 4);
    let run = Distributed::try_new(
        grid.clone(),
        NodeId::new(0),
        linear_model(),
        vec![x],
        y,
        DescentOptions::default().with_epochs(0),
    )
    .unwrap();
    run.start().unwrap();

    let mut last = 0;
    while last < 400 {
        let samples = run.samples();
        assert!(samples >= last);
        last = samples;
        thread::yield_now();
    }
    run.cancel("enough");
    run.join().unwrap();

    let stopped = run.samples();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(run.samples(), stopped);
    assert!(run.job().is_cancelled());
    assert!(grid.runs().get(run.run()).is_none());
    grid.shutdown().unwrap();
}

#[test]
fn faulting_step_cancels_the_run() {
    init_logger();
    let (grid, store) = grid(1);
    let x = column(&grid, &store, &[0.0, 1.0, 2.0, 3.0], 2);
    let labels = column(&grid, &store, &[0.0, 1.0, 5.0, 1.0], 2);
    let model = Pipeline::try_new(
        Box::new(RowsInput::try_new(vec![0.0], vec![0.0], 1).unwrap()),
        vec![Box::new(Softmax::new(2, LayerOptions::default()))],
        0,
    )
    .unwrap();
    let run = Distributed::try_new(grid.clone(), NodeId::new(0), model, vec![x], labels, DescentOptions::default())
        .unwrap();
    run.start().unwrap();
    assert!(run.join().is_err());
    assert!(run.job().is_cancelled());
    assert!(grid.registry(NodeId::new(0)).unwrap().is_empty());
    grid.shutdown().unwrap();
}

#[test]
fn columns_must_share_a_layout() {
    let (grid, store) = grid(2);
    let x = column(&grid, &store, &[0.0, 1.0, 2.0, 3.0], 2);
    let y = column(&grid, &store, &[0.0, 1.0, 2.0, 3.0], 3);
    let options = DescentOptions::default();
    let owner = NodeId::new(0);

    let rechunked = Distributed::try_new(grid.clone(), owner, linear_model(), vec![x.clone()], y, options.clone());
    assert!(rechunked.is_err());
    let too_wide = Distributed::try_new(grid.clone(), owner, linear_model(), vec![x.clone(), x.clone()], x, options);
    assert!(too_wide.is_err());
    assert!(grid.cluster().jobs().is_empty());
    grid.shutdown().unwrap();
}

#[test]
fn cancelling_an_unstarted_run_unpublishes_it() {
    let (grid, store) = grid(2);
    let (x, y) = regression(&grid, &store, 8, 2);
    let run = Distributed::try_new(grid.clone(), NodeId::new(0), linear_model(), vec![x], y, DescentOptions::default())
        .unwrap();
    assert!(grid.runs().get(run.run()).is_some());
    assert_eq!(grid.registry(NodeId::new(0)).unwrap().len(), 1);

    run.cancel("not needed");
    assert!(grid.runs().get(run.run()).is_none());
    assert!(grid.registry(NodeId::new(0)).unwrap().is_empty());
    assert!(grid.cluster().jobs().is_empty());
    assert!(run.job().is_cancelled());
    assert!(run.start().is_err());
    run.join().unwrap();
    grid.shutdown().unwrap();
}

#[test]
fn dropping_an_unstarted_run_unpublishes_it() {
    let (grid, store) = grid(2);
    let (x, y) = regression(&grid, &store, 8, 2);
    let run = Distributed::try_new(grid.clone(), NodeId::new(1), linear_model(), vec![x], y, DescentOptions::default())
        .unwrap();
    let (key, job) = (run.run().clone(), run.job().clone());
    drop(run);

    assert!(grid.runs().get(&key).is_none());
    assert!(grid.registry(NodeId::new(1)).unwrap().is_empty());
    assert!(grid.cluster().jobs().is_empty());
    assert!(job.is_cancelled());
    grid.shutdown().unwrap();
}
