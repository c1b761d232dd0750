use bit_vec::BitVec;

use crate::compress::compress;
use crate::{ChunkData, Number};

/// A fully decoded, mutable staging buffer.
///
/// Receives writes a chunk's encoding cannot represent, and bulk appends when a column is
/// written from scratch. Any `i64`/`f64` content and missing markers are admitted; the encoding
/// is only chosen when the buffer is [compressed](NewChunk::compress).
#[derive(Debug, Clone, Default)]
pub struct NewChunk {
    values: Vec<Number>,
    missing: BitVec,
}

impl NewChunk {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            missing: BitVec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn append(&mut self, value: Option<Number>) {
        let value = present(value);
        self.values.push(value.unwrap_or(Number::Long(0)));
        self.missing.push(value.is_none());
    }

    pub fn append_i64(&mut self, value: i64) {
        self.append((value != i64::MIN).then_some(Number::Long(value)))
    }

    pub fn append_f64(&mut self, value: f64) {
        self.append((!value.is_nan()).then_some(Number::Double(value)))
    }

    pub fn append_missing(&mut self) {
        self.append(None)
    }

    #[inline]
    pub fn value(&self, idx: usize) -> Option<Number> {
        (!self.is_missing(idx)).then(|| self.values[idx])
    }

    #[inline]
    pub fn is_missing(&self, idx: usize) -> bool {
        self.missing.get(idx).unwrap_or(true)
    }

    #[inline]
    pub fn at_f64(&self, idx: usize) -> f64 {
        self.value(idx).map_or(f64::NAN, Number::as_f64)
    }

    /// Overwrite row `idx`; always succeeds.
    #[inline]
    pub fn set(&mut self, idx: usize, value: Option<Number>) {
        let value = present(value);
        self.values[idx] = value.unwrap_or(Number::Long(0));
        self.missing.set(idx, value.is_none());
    }

    #[inline]
    pub fn set_missing(&mut self, idx: usize) {
        self.set(idx, None);
    }

    /// In-memory size of the decoded values and missing flags.
    pub fn nbytes(&self) -> usize {
        self.values.len() * size_of::<Number>() + self.missing.storage().len() * size_of::<u32>()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<Number>> + '_ {
        (0..self.len()).map(|idx| self.value(idx))
    }

    /// Consume the buffer, choosing the most compact encoding that reproduces every value.
    pub fn compress(self) -> ChunkData {
        compress(&self)
    }
}

impl FromIterator<Option<Number>> for NewChunk {
    fn from_iter<T: IntoIterator<Item = Option<Number>>>(iter: T) -> Self {
        let mut staged = NewChunk::default();
        for value in iter {
            staged.append(value);
        }
        staged
    }
}

/// Missing markers passed as values are stored as missing.
fn present(value: Option<Number>) -> Option<Number> {
    value.filter(|v| match v {
        Number::Long(l) => *l != i64::MIN,
        Number::Double(d) => !d.is_nan(),
    })
}
