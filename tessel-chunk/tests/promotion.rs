#![cfg(test)]

use std::sync::Arc;

use bytes::Bytes;
use tessel_chunk::{ChunkData, ChunkStore, Codes, Column, ColumnWriter, EncodingId, Number};
use tessel_metrics::TesselMetrics;
use tessel_store::{Key, NodeId, Store};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A single-chunk column stored as `data`.
fn stored(store: &ChunkStore, data: ChunkData, metrics: &TesselMetrics) -> Arc<Column> {
    let key = Key::random("column");
    let column = Column::try_new_with_metrics(
        key,
        vec![0, data.len() as u64],
        vec![NodeId::new(0)],
        metrics,
    )
    .unwrap();
    store.put(column.chunk_key(0), data.encode());
    Arc::new(column)
}

#[test]
fn narrow_write_out_of_range_promotes() {
    init_logger();
    let store = ChunkStore::default();
    let metrics = TesselMetrics::default();
    let column = stored(
        &store,
        ChunkData::Narrow {
            bias: 1,
            codes: Codes::U8(vec![0, 1, 2, 3]),
        },
        &metrics,
    );

    let mut chunk = column.chunk(&store, 0).unwrap();
    assert_eq!(chunk.encoding(), Some(EncodingId::Narrow));
    chunk.set_i64(2, 1000).unwrap();
    assert!(chunk.is_promoted());

    let values = (0..4).map(|row| chunk.at_i64(row).unwrap()).collect::<Vec<_>>();
    assert_eq!(values, vec![1, 2, 1000, 4]);

    let chunk = chunk.finalize(&store).unwrap();
    assert_eq!(store.puts(), 2);
    assert_eq!(metrics.count("chunk.promotions"), 1);
    assert_eq!(metrics.count("chunk.finalized"), 1);

    let reread = column.chunk(&store, 0).unwrap();
    assert_eq!(reread.encoding(), chunk.encoding());
    assert_eq!(column.at_i64(&store, 2).unwrap(), 1000);
    assert_eq!(column.at(&store, 3).unwrap(), 4.0);
}

#[test]
fn reads_follow_latest_write_across_promotions() {
    init_logger();
    let store = ChunkStore::default();
    let metrics = TesselMetrics::default();
    let column = stored(
        &store,
        ChunkData::Constant {
            len: 64,
            value: Some(Number::Long(0)),
        },
        &metrics,
    );
    let mut chunk = column.chunk(&store, 0).unwrap();
    let mut expected = vec![Some(Number::Long(0)); 64];

    for step in 0..512_usize {
        let idx = (step * 37) % 64;
        let value = match step % 5 {
            0 => None,
            1 => Some(Number::Long(step as i64)),
            2 => Some(Number::Double(step as f64 + 0.25)),
            3 => Some(Number::Long(-(1 << 40))),
            _ => Some(Number::Double(1e-9 * step as f64)),
        };
        match value {
            None => chunk.set_missing_local(idx),
            Some(Number::Long(v)) => chunk.set_i64_local(idx, v),
            Some(Number::Double(d)) => chunk.set_f64_local(idx, d),
        }
        expected[idx] = value;

        for (i, want) in expected.iter().enumerate() {
            match want {
                None => assert!(chunk.is_missing_local(i)),
                Some(n) => assert_eq!(chunk.at_local(i).to_bits(), n.as_f64().to_bits()),
            }
        }
    }
    assert_eq!(metrics.count("chunk.promotions"), 1);

    let chunk = chunk.finalize(&store).unwrap();
    for (i, want) in expected.iter().enumerate() {
        assert_eq!(chunk.is_missing_local(i), want.is_none());
        if let Some(n) = want {
            assert_eq!(chunk.at_local(i).to_bits(), n.as_f64().to_bits());
        }
    }
}

#[test]
fn untouched_chunks_are_never_rewritten() {
    let store = ChunkStore::default();
    let mut writer = ColumnWriter::new(&store, "untouched".into(), 4, vec![NodeId::new(0)]).unwrap();
    (0..12).for_each(|v| writer.append_f64(f64::from(v) / 4.0));
    let column = writer.finish().unwrap();
    let written = store.puts();
    assert_eq!(written, 3);

    for cidx in 0..column.nchunks() {
        let chunk = column.chunk(&store, cidx).unwrap();
        assert_eq!(chunk.at(column.chunk_start(cidx) + 1).unwrap(), (cidx * 4 + 1) as f64 / 4.0);
        chunk.finalize(&store).unwrap();
    }
    assert_eq!(store.puts(), written);
}

#[test]
fn chunk_reads_reject_foreign_rows() {
    let store = ChunkStore::default();
    let mut writer =
        ColumnWriter::new(&store, "bounds".into(), 5, vec![NodeId::new(0), NodeId::new(1)]).unwrap();
    (0..10).for_each(|v| writer.append_i64(v));
    let column = writer.finish().unwrap();

    let mut chunk = column.chunk(&store, 1).unwrap();
    for row in [0, 4, 10, u64::MAX] {
        assert!(chunk.at(row).is_err());
        assert!(chunk.set_f64(row, 1.0).is_err());
    }
    assert!(!chunk.is_modified());
    assert_eq!(chunk.at_slow(&store, 2).unwrap(), 2.0);
    assert_eq!(chunk.at_slow(&store, 7).unwrap(), 7.0);
    assert!(chunk.at_slow(&store, 10).is_err());
}

#[test]
fn missing_chunk_is_not_found() {
    let store: &dyn Store<Bytes> = &ChunkStore::default();
    let column = Arc::new(Column::try_new("nothing".into(), vec![0, 3], vec![NodeId::new(0)]).unwrap());
    assert!(column.chunk(store, 0).is_err());
    assert!(column.chunk(store, 1).is_err());
}

#[test]
fn wide_integers_and_fractions_survive_finalize() {
    init_logger();
    let store = ChunkStore::default();
    let metrics = TesselMetrics::default();
    let column = stored(&store, ChunkData::Long(vec![1, 2, 3]), &metrics);

    let mut chunk = column.chunk(&store, 0).unwrap();
    chunk.set_i64(0, i64::MAX - 1).unwrap();
    chunk.set_f64(1, 0.5).unwrap();
    assert!(chunk.is_promoted());

    let chunk = chunk.finalize(&store).unwrap();
    assert_eq!(chunk.encoding(), Some(EncodingId::Mixed));
    assert_eq!(column.at_i64(&store, 0).unwrap(), i64::MAX - 1);
    assert_eq!(column.at(&store, 1).unwrap(), 0.5);
    assert_eq!(column.at_i64(&store, 2).unwrap(), 3);
}
