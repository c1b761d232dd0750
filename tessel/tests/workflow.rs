#![cfg(test)]

use std::sync::Arc;

use tessel::cluster::{Cluster, ClusterOptions, JobStatus};
use tessel::store::{Key, NodeId};
use tessel::train::{
    DescentOptions, Distributed, Grid, LayerOptions, Linear, Pipeline, RowsInput, Tanh, Threaded, Trainer,
    TrainerOptions,
};
use tessel::{ChunkStore, ColumnWriter, EncodingId};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn model(width: usize) -> Pipeline {
    let options = LayerOptions::default().with_rate(0.01).with_seed(7);
    Pipeline::try_new(
        Box::new(RowsInput::try_new(vec![0.0; width], vec![0.0], width).unwrap()),
        vec![
            Box::new(Tanh::new(4, options.clone())),
            Box::new(Linear::new(1, options)),
        ],
        0,
    )
    .unwrap()
}

#[test]
fn edit_columns_then_train_across_the_cluster() {
    init_logger();
    let cluster = Cluster::try_new(ClusterOptions::default().with_nodes(2).with_threads_per_node(2)).unwrap();
    let nodes = cluster.node_ids().collect::<Vec<_>>();
    let store = Arc::new(ChunkStore::default());

    let mut a = ColumnWriter::new(&*store, Key::new("a"), 8, nodes.clone()).unwrap();
    let mut b = ColumnWriter::new(&*store, Key::new("b"), 8, nodes.clone()).unwrap();
    let mut y = ColumnWriter::new(&*store, Key::new("y"), 8, nodes).unwrap();
    for row in 0..64i64 {
        a.append_i64(row % 8);
        if row % 5 == 0 {
            b.append_missing();
        } else {
            b.append_i64(row / 8);
        }
        y.append_i64(row % 8 + row / 8);
    }
    let (a, b, y) = (a.finish().unwrap(), b.finish().unwrap(), y.finish().unwrap());

    // A fractional response does not fit the integer encoding the column was written with.
    let mut chunk = y.chunk(&*store, 2).unwrap();
    chunk.set_f64(16, 2.5).unwrap();
    assert!(chunk.is_promoted());
    let chunk = chunk.finalize(&*store).unwrap();
    assert_ne!(chunk.encoding(), Some(EncodingId::Narrow));
    assert_eq!(y.at(&*store, 16).unwrap(), 2.5);

    let grid = Grid::new(cluster, store);
    let run = Distributed::try_new(
        grid.clone(),
        NodeId::new(0),
        model(2),
        vec![a, b],
        y,
        DescentOptions::default().with_epochs(3),
    )
    .unwrap();
    run.start().unwrap();
    run.join().unwrap();

    assert_eq!(run.samples(), 3 * 64);
    assert_eq!(run.job().status(), JobStatus::Done);
    let descent = grid.cluster().metrics().counts("descent.");
    assert_eq!(descent["descent.steps"], 3 * 64);
    assert!(descent["descent.shuttles.merged"] > 0);
    grid.shutdown().unwrap();
}

#[test]
fn threaded_training_shares_one_model() {
    init_logger();
    let features = (0..200).flat_map(|r| [r as f32 / 200.0, 1.0 - r as f32 / 200.0]).collect::<Vec<_>>();
    let targets = features.chunks(2).map(|f| f[0] - f[1]).collect::<Vec<_>>();
    let input = RowsInput::try_new(features, targets, 2).unwrap();
    let pipeline = model(2).replicate_with_input(Box::new(input), 0).unwrap();

    let trainer = Threaded::try_new(pipeline, TrainerOptions::default().with_steps(2_000).with_threads(4)).unwrap();
    let view = trainer.layers().unwrap();
    let before = view.params().values();
    trainer.start().unwrap();
    trainer.join().unwrap();

    assert_eq!(trainer.samples(), 2_000);
    assert_eq!(trainer.job().status(), JobStatus::Done);
    assert_ne!(view.params().values(), before);
}
