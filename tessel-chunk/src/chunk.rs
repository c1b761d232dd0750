use std::sync::Arc;

use bytes::Bytes;
use tessel_error::{TesselResult, tessel_bail, tessel_err, tessel_panic};
use tessel_store::Store;

use crate::{ChunkData, Column, EncodingId, NewChunk, Number};

/// The copy of a chunk that reads and writes go through.
#[derive(Debug, Clone, Default)]
enum Active {
    /// Untouched; reads go to the decoded original.
    #[default]
    Original,
    /// Written in place on a private copy of the original encoding.
    Written(ChunkData),
    /// A write did not fit the encoding, every value now lives in a staging buffer.
    Promoted(NewChunk),
}

/// One contiguous, compressed row range `[start, start + len)` of a [`Column`].
///
/// Writes never touch the decoded original: the first write copies it, and a write the encoding
/// cannot absorb promotes the chunk to a [`NewChunk`]. A chunk is promoted at most once;
/// [`Chunk::finalize`] publishes the result.
#[derive(Debug, Clone)]
pub struct Chunk {
    column: Arc<Column>,
    cidx: usize,
    start: u64,
    len: usize,
    original: ChunkData,
    active: Active,
}

impl Chunk {
    pub fn try_new(column: Arc<Column>, cidx: usize, data: ChunkData) -> TesselResult<Self> {
        if cidx >= column.nchunks() {
            tessel_bail!(OutOfBounds: cidx as u64, 0, column.nchunks() as u64);
        }
        let len = column.chunk_len(cidx);
        if data.len() != len {
            tessel_bail!(
                InvalidArgument: "chunk {cidx} of {} holds {} rows, expected {len}",
                column.key(),
                data.len()
            );
        }
        Ok(Self {
            start: column.chunk_start(cidx),
            column,
            cidx,
            len,
            original: data,
            active: Active::Original,
        })
    }

    /// Rebuild chunk `cidx` of `column` from its wire format.
    pub fn decode(column: Arc<Column>, cidx: usize, bytes: &[u8]) -> TesselResult<Self> {
        Self::try_new(column, cidx, ChunkData::decode(bytes)?)
    }

    pub fn column(&self) -> &Arc<Column> {
        &self.column
    }

    /// Index of this chunk within its column.
    pub fn cidx(&self) -> usize {
        self.cidx
    }

    /// Global row of local index 0.
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True once any write has been made.
    pub fn is_modified(&self) -> bool {
        !matches!(self.active, Active::Original)
    }

    pub fn is_promoted(&self) -> bool {
        matches!(self.active, Active::Promoted(_))
    }

    /// The encoding reads currently go through, or `None` if promoted.
    pub fn encoding(&self) -> Option<EncodingId> {
        match &self.active {
            Active::Original => Some(self.original.encoding()),
            Active::Written(data) => Some(data.encoding()),
            Active::Promoted(_) => None,
        }
    }

    /// In-memory size of the original encoding plus the active copy.
    pub fn nbytes(&self) -> usize {
        self.original.nbytes()
            + match &self.active {
                Active::Original => 0,
                Active::Written(data) => data.nbytes(),
                Active::Promoted(staged) => staged.nbytes(),
            }
    }

    #[allow(clippy::cast_possible_truncation)]
    #[inline]
    fn local(&self, row: u64) -> TesselResult<usize> {
        let end = self.start + self.len as u64;
        if row < self.start || row >= end {
            tessel_bail!(OutOfBounds: row, self.start, end);
        }
        Ok((row - self.start) as usize)
    }

    #[inline]
    fn value_local(&self, idx: usize) -> Option<Number> {
        match &self.active {
            Active::Original => self.original.value(idx),
            Active::Written(data) => data.value(idx),
            Active::Promoted(staged) => staged.value(idx),
        }
    }

    /// Read global `row` as a float; missing reads as `NaN`.
    pub fn at(&self, row: u64) -> TesselResult<f64> {
        Ok(self.at_local(self.local(row)?))
    }

    /// Read global `row` as an integer; missing is a [`MissingValue`](tessel_error::TesselError::MissingValue) error.
    pub fn at_i64(&self, row: u64) -> TesselResult<i64> {
        self.at_i64_local(self.local(row)?)
    }

    pub fn is_missing(&self, row: u64) -> TesselResult<bool> {
        Ok(self.is_missing_local(self.local(row)?))
    }

    #[inline]
    pub fn at_local(&self, idx: usize) -> f64 {
        match &self.active {
            Active::Original => self.original.at_f64(idx),
            Active::Written(data) => data.at_f64(idx),
            Active::Promoted(staged) => staged.at_f64(idx),
        }
    }

    #[inline]
    pub fn at_i64_local(&self, idx: usize) -> TesselResult<i64> {
        self.value_local(idx).map(Number::as_i64).ok_or_else(|| {
            tessel_err!(
                MissingValue: "row {} of {}",
                self.start + idx as u64,
                self.column.key()
            )
        })
    }

    #[inline]
    pub fn is_missing_local(&self, idx: usize) -> bool {
        match &self.active {
            Active::Original => self.original.is_missing(idx),
            Active::Written(data) => data.is_missing(idx),
            Active::Promoted(staged) => staged.is_missing(idx),
        }
    }

    /// Read any row of the column: rows of this chunk are read locally, others through `store`.
    pub fn at_slow(&self, store: &dyn Store<Bytes>, row: u64) -> TesselResult<f64> {
        match self.local(row) {
            Ok(idx) => Ok(self.at_local(idx)),
            Err(_) => self.column.at(store, row),
        }
    }

    /// Write `value` at global `row`; `i64::MIN` writes the missing marker.
    pub fn set_i64(&mut self, row: u64, value: i64) -> TesselResult<()> {
        let idx = self.local(row)?;
        self.set_i64_local(idx, value);
        Ok(())
    }

    /// Write `value` at global `row`; `NaN` writes the missing marker.
    pub fn set_f64(&mut self, row: u64, value: f64) -> TesselResult<()> {
        let idx = self.local(row)?;
        self.set_f64_local(idx, value);
        Ok(())
    }

    pub fn set_f32(&mut self, row: u64, value: f32) -> TesselResult<()> {
        let idx = self.local(row)?;
        self.set_f32_local(idx, value);
        Ok(())
    }

    pub fn set_missing(&mut self, row: u64) -> TesselResult<()> {
        let idx = self.local(row)?;
        self.set_missing_local(idx);
        Ok(())
    }

    pub fn set_i64_local(&mut self, idx: usize, value: i64) {
        self.write((value != i64::MIN).then_some(Number::Long(value)), idx)
    }

    pub fn set_f64_local(&mut self, idx: usize, value: f64) {
        self.write((!value.is_nan()).then_some(Number::Double(value)), idx)
    }

    pub fn set_f32_local(&mut self, idx: usize, value: f32) {
        self.set_f64_local(idx, f64::from(value))
    }

    pub fn set_missing_local(&mut self, idx: usize) {
        self.write(None, idx)
    }

    fn write(&mut self, value: Option<Number>, idx: usize) {
        if idx >= self.len {
            tessel_panic!(OutOfBounds: idx as u64, 0, self.len as u64);
        }
        self.active = match std::mem::take(&mut self.active) {
            Active::Original => self.write_encoded(self.original.clone(), idx, value),
            Active::Written(data) => self.write_encoded(data, idx, value),
            Active::Promoted(mut staged) => {
                staged.set(idx, value);
                Active::Promoted(staged)
            }
        };
    }

    fn write_encoded(&self, mut data: ChunkData, idx: usize, value: Option<Number>) -> Active {
        if data.try_set(idx, value) {
            return Active::Written(data);
        }
        log::trace!(
            "promoting chunk {} of {} from {} on write of {}",
            self.cidx,
            self.column.key(),
            data.encoding(),
            value.map_or(f64::NAN, Number::as_f64)
        );
        self.column.metrics().promotions.inc();
        let mut staged = data.inflate();
        staged.set(idx, value);
        Active::Promoted(staged)
    }

    /// Publish any writes under the chunk's key and return the chunk as now stored.
    ///
    /// An unwritten chunk is returned as is, without touching the store.
    pub fn finalize(self, store: &dyn Store<Bytes>) -> TesselResult<Chunk> {
        let data = match self.active {
            Active::Original => return Ok(self),
            Active::Written(data) => data,
            Active::Promoted(staged) => staged.compress(),
        };
        log::debug!(
            "finalizing chunk {} of {} as {}",
            self.cidx,
            self.column.key(),
            data.encoding()
        );
        store.put(self.column.chunk_key(self.cidx), data.encode());
        self.column.metrics().finalized.inc();
        Chunk::try_new(self.column, self.cidx, data)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tessel_store::{MemStore, NodeId};

    use super::*;
    use crate::Codes;

    fn narrow_chunk(values: &[u8]) -> Chunk {
        let len = values.len() as u64;
        let column = Column::try_new("narrow".into(), vec![0, 10, 10 + len], vec![NodeId::new(0); 2]);
        Chunk::try_new(
            Arc::new(column.unwrap()),
            1,
            ChunkData::Narrow {
                bias: 0,
                codes: Codes::U8(values.to_vec()),
            },
        )
        .unwrap()
    }

    #[test]
    fn in_place_write_does_not_promote() {
        let mut chunk = narrow_chunk(&[1, 2, 3, 4]);
        chunk.set_i64(11, 7).unwrap();
        assert!(chunk.is_modified());
        assert!(!chunk.is_promoted());
        assert_eq!(chunk.at_i64(11).unwrap(), 7);
        assert_eq!(chunk.original.value(1), Some(Number::Long(2)));
    }

    #[rstest]
    #[case(Some(Number::Long(1000)))]
    #[case(Some(Number::Long(-1)))]
    #[case(Some(Number::Double(0.5)))]
    fn unrepresentable_write_promotes(#[case] value: Option<Number>) {
        let mut chunk = narrow_chunk(&[1, 2, 3, 4]);
        match value {
            Some(Number::Long(v)) => chunk.set_i64_local(2, v),
            Some(Number::Double(d)) => chunk.set_f64_local(2, d),
            None => chunk.set_missing_local(2),
        }
        assert!(chunk.is_promoted());
        assert_eq!(chunk.value_local(2), value);
        assert_eq!(chunk.at_local(3), 4.0);
        assert_eq!(chunk.encoding(), None);
    }

    #[test]
    fn missing_reads() {
        let mut chunk = narrow_chunk(&[1, u8::MAX]);
        assert!(chunk.is_missing(11).unwrap());
        assert!(chunk.at(11).unwrap().is_nan());
        assert!(chunk.at_i64(11).is_err());

        chunk.set_f64(10, f64::NAN).unwrap();
        assert!(chunk.is_missing_local(0));
        chunk.set_f32(10, 2.0).unwrap();
        assert_eq!(chunk.at_i64_local(0).unwrap(), 2);
    }

    #[rstest]
    #[case(9)]
    #[case(14)]
    fn out_of_bounds_rows_fault(#[case] row: u64) {
        let mut chunk = narrow_chunk(&[1, 2, 3, 4]);
        assert!(chunk.at(row).is_err());
        assert!(chunk.at_i64(row).is_err());
        assert!(chunk.is_missing(row).is_err());
        assert!(chunk.set_i64(row, 1).is_err());
        assert!(chunk.set_missing(row).is_err());
        assert!(!chunk.is_modified());
    }

    #[test]
    fn finalize_republishes_only_written_chunks() {
        let store = MemStore::<Bytes>::default();
        let chunk = narrow_chunk(&[1, 2]);
        let chunk = chunk.finalize(&store).unwrap();
        assert_eq!(store.puts(), 0);

        let mut chunk = chunk;
        chunk.set_i64_local(0, 5);
        let chunk = chunk.finalize(&store).unwrap();
        assert_eq!(store.puts(), 1);
        assert!(!chunk.is_modified());
        assert_eq!(chunk.at_i64_local(0).unwrap(), 5);
    }
}
