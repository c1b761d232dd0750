//! Column segments ("chunks"): compressed, contiguous row ranges of a distributed column that can
//! be mutated in place without decompressing the whole column.
//!
//! A [`Chunk`] reads through its active copy. The first write clones the encoded data; a write
//! the encoding cannot absorb promotes the chunk to a [`NewChunk`] staging buffer, which
//! [`Chunk::finalize`] compresses back into the most compact exact [`ChunkData`] encoding.

use bytes::Bytes;
pub use chunk::*;
pub use column::*;
pub use encoding::*;
pub use new_chunk::*;
use num_traits::ToPrimitive;
use tessel_store::MemStore;

mod chunk;
mod column;
mod compress;
mod encoding;
mod new_chunk;
mod serde;

/// The store segments are published to, keyed by [`Column::chunk_key`].
pub type ChunkStore = MemStore<Bytes>;

/// A decoded cell value. Missing cells are represented as `None` around a `Number`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Long(i64),
    Double(f64),
}

impl Number {
    /// The value as read through a floating accessor.
    #[allow(clippy::cast_precision_loss)]
    #[inline]
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Long(v) => v as f64,
            Number::Double(d) => d,
        }
    }

    /// The value as read through an integer accessor; fractional values are truncated.
    #[allow(clippy::cast_possible_truncation)]
    #[inline]
    pub fn as_i64(self) -> i64 {
        match self {
            Number::Long(v) => v,
            Number::Double(d) => d as i64,
        }
    }

    /// The value as an `i64`, if it is exactly an integer.
    pub fn exact_i64(self) -> Option<i64> {
        match self {
            Number::Long(v) => Some(v),
            Number::Double(d) => {
                // -0.0 is integral but would lose its sign.
                let integral = d.is_finite() && d.fract() == 0.0 && !(d == 0.0 && d.is_sign_negative());
                integral.then(|| d.to_i64()).flatten()
            }
        }
    }

    /// The value as an `f64`, if that conversion is lossless.
    pub fn exact_f64(self) -> Option<f64> {
        match self {
            Number::Double(d) => Some(d),
            Number::Long(v) => v.to_f64().filter(|d| d.to_i64() == Some(v)),
        }
    }

    /// True if both values read back identically through every accessor.
    pub fn same(self, other: Number) -> bool {
        match (self.exact_i64(), other.exact_i64()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.as_f64().to_bits() == other.as_f64().to_bits(),
            _ => false,
        }
    }
}

impl From<i64> for Number {
    fn from(value: i64) -> Self {
        Number::Long(value)
    }
}

impl From<f64> for Number {
    fn from(value: f64) -> Self {
        Number::Double(value)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Number::Long(5), Some(5))]
    #[case(Number::Double(5.0), Some(5))]
    #[case(Number::Double(5.5), None)]
    #[case(Number::Double(-0.0), None)]
    #[case(Number::Double(f64::INFINITY), None)]
    #[case(Number::Double(1e19), None)]
    fn exact_integers(#[case] n: Number, #[case] expected: Option<i64>) {
        assert_eq!(n.exact_i64(), expected);
    }

    #[rstest]
    #[case(Number::Long(1 << 53), true)]
    #[case(Number::Long((1 << 53) + 1), false)]
    #[case(Number::Long(i64::MAX), false)]
    #[case(Number::Long(i64::MIN), true)]
    fn exact_doubles(#[case] n: Number, #[case] exact: bool) {
        assert_eq!(n.exact_f64().is_some(), exact);
    }

    #[test]
    fn same_across_kinds() {
        assert!(Number::Long(3).same(Number::Double(3.0)));
        assert!(!Number::Long(3).same(Number::Double(3.5)));
        assert!(Number::Double(0.25).same(Number::Double(0.25)));
        assert!(!Number::Double(0.0).same(Number::Double(-0.0)));
    }
}
