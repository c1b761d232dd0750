use itertools::Itertools;
use num_traits::ToPrimitive;
use tessel_error::tessel_panic;

use crate::encoding::{MAX_SCALE_EXPONENT, narrow_f32, scale, split_cell};
use crate::{ChunkData, Codes, NewChunk, Number};

/// Statistics gathered in one pass over a staging buffer.
#[derive(Debug, Clone)]
struct ChunkStats {
    len: usize,
    missing: usize,
    first: Option<Number>,
    all_same: bool,
    /// Min and max, if every present value is an exact integer.
    int_range: Option<(i64, i64)>,
    all_f64: bool,
    all_f32: bool,
}

impl ChunkStats {
    fn generate(staged: &NewChunk) -> Self {
        let mut stats = ChunkStats {
            len: staged.len(),
            missing: 0,
            first: None,
            all_same: true,
            int_range: None,
            all_f64: true,
            all_f32: true,
        };
        let mut all_int = true;

        for value in staged.iter() {
            let Some(v) = value else {
                stats.missing += 1;
                continue;
            };
            match stats.first {
                None => stats.first = Some(v),
                Some(first) => stats.all_same &= first.same(v),
            }
            match (all_int, v.exact_i64()) {
                (true, Some(l)) => {
                    stats.int_range = Some(match stats.int_range {
                        None => (l, l),
                        Some((lo, hi)) => (lo.min(l), hi.max(l)),
                    })
                }
                _ => {
                    all_int = false;
                    stats.int_range = None;
                }
            }
            let exact = v.exact_f64();
            stats.all_f64 &= exact.is_some();
            stats.all_f32 &= exact.and_then(narrow_f32).is_some();
        }
        stats
    }

    fn present(&self) -> usize {
        self.len - self.missing
    }
}

/// A candidate encoding and its estimated size.
#[derive(Debug, Clone, Copy)]
enum Scheme {
    Narrow { bias: i64, range: u64 },
    Scaled { bias: i64, exponent: u8, range: u64 },
    Long,
    Single,
    Double,
}

impl Scheme {
    fn blank(self, len: usize) -> Option<ChunkData> {
        Some(match self {
            Scheme::Narrow { bias, range } => ChunkData::Narrow {
                bias,
                codes: Codes::for_range(range, len)?,
            },
            Scheme::Scaled {
                bias,
                exponent,
                range,
            } => ChunkData::Scaled {
                bias,
                exponent,
                codes: Codes::for_range(range, len)?,
            },
            Scheme::Long => ChunkData::Long(vec![i64::MIN; len]),
            Scheme::Single => ChunkData::Single(vec![f32::NAN; len]),
            Scheme::Double => ChunkData::Double(vec![f64::NAN; len]),
        })
    }

    /// Fill a blank encoding with every value, failing if any value does not round trip.
    fn build(self, staged: &NewChunk) -> Option<ChunkData> {
        let mut data = self.blank(staged.len())?;
        for (idx, value) in staged.iter().enumerate() {
            if value.is_some() && !data.try_set(idx, value) {
                return None;
            }
        }
        Some(data)
    }
}

fn range_of(lo: i64, hi: i64) -> Option<u64> {
    (i128::from(hi) - i128::from(lo)).to_u64()
}

/// Wide integers next to fractions: keep each kind in its own lane.
fn split(staged: &NewChunk) -> Option<ChunkData> {
    let (longs, doubles) = staged
        .iter()
        .map(split_cell)
        .collect::<Option<(Vec<i64>, Vec<f64>)>>()?;
    Some(ChunkData::Mixed { longs, doubles })
}

/// Smallest decimal exponent at which every present value is an exact scaled integer.
fn scaled_scheme(staged: &NewChunk) -> Option<Scheme> {
    (1..=MAX_SCALE_EXPONENT).find_map(|exponent| {
        let mantissas: Option<Vec<i64>> = staged
            .iter()
            .flatten()
            .map(|v| v.exact_f64().and_then(|d| scale(d, exponent)))
            .collect();
        let (lo, hi) = match mantissas?.into_iter().minmax().into_option() {
            Some(bounds) => bounds,
            None => (0, 0),
        };
        Some(Scheme::Scaled {
            bias: lo,
            exponent,
            range: range_of(lo, hi)?,
        })
    })
}

fn candidates(staged: &NewChunk, stats: &ChunkStats) -> Vec<Scheme> {
    let mut schemes = Vec::new();
    if let Some((lo, hi)) = stats.int_range {
        if let Some(range) = range_of(lo, hi) {
            schemes.push(Scheme::Narrow { bias: lo, range });
        }
        if lo != i64::MIN {
            schemes.push(Scheme::Long);
        }
    } else if let Some(scaled) = scaled_scheme(staged) {
        schemes.push(scaled);
    }
    if stats.all_f32 {
        schemes.push(Scheme::Single);
    }
    if stats.all_f64 {
        schemes.push(Scheme::Double);
    }
    schemes
}

/// Encoded size of `scheme` over `len` rows, or `None` if its codes would not fit in 32 bits.
fn estimated_nbytes(scheme: Scheme, len: usize) -> Option<usize> {
    let width = |range: u64| Codes::for_range(range, 0).map(|codes| usize::from(codes.width()));
    Some(match scheme {
        Scheme::Narrow { range, .. } => 9 + len * width(range)?,
        Scheme::Scaled { range, .. } => 10 + len * width(range)?,
        Scheme::Long | Scheme::Double => 8 * len,
        Scheme::Single => 4 * len,
    })
}

/// Pick the smallest encoding that represents every value of `staged` exactly.
pub(crate) fn compress(staged: &NewChunk) -> ChunkData {
    let stats = ChunkStats::generate(staged);

    if stats.present() == 0 {
        return ChunkData::Constant {
            len: stats.len,
            value: None,
        };
    }
    if stats.missing == 0 && stats.all_same {
        return ChunkData::Constant {
            len: stats.len,
            value: stats.first,
        };
    }

    let chosen = candidates(staged, &stats)
        .into_iter()
        .filter_map(|scheme| Some((estimated_nbytes(scheme, stats.len)?, scheme)))
        .sorted_by_key(|(nbytes, _)| *nbytes)
        .find_map(|(_, scheme)| scheme.build(staged))
        .or_else(|| split(staged));

    match chosen {
        Some(data) => {
            log::debug!(
                "compressed {} rows ({} missing) as {}: {} bytes",
                stats.len,
                stats.missing,
                data.encoding(),
                data.nbytes()
            );
            data
        }
        // Every present value is an exact long or an exact double.
        None => tessel_panic!("no exact encoding for {} rows", stats.len),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::EncodingId;

    fn staged_longs(values: &[i64]) -> NewChunk {
        let mut staged = NewChunk::default();
        values.iter().for_each(|v| staged.append_i64(*v));
        staged
    }

    fn staged_doubles(values: &[f64]) -> NewChunk {
        let mut staged = NewChunk::default();
        values.iter().for_each(|v| staged.append_f64(*v));
        staged
    }

    fn assert_round_trip(staged: &NewChunk, data: &ChunkData) {
        assert_eq!(data.len(), staged.len());
        for idx in 0..staged.len() {
            match (staged.value(idx), data.value(idx)) {
                (None, None) => {}
                (Some(a), Some(b)) => assert!(a.same(b), "row {idx}: {a:?} != {b:?}"),
                (a, b) => unreachable!("row {idx}: {a:?} != {b:?}"),
            }
        }
    }

    #[rstest]
    #[case(staged_longs(&[1, 2, 3, 4]), EncodingId::Narrow, 1)]
    #[case(staged_longs(&[1_000_000, 1_000_100, 1_000_050, 1_000_000]), EncodingId::Narrow, 1)]
    #[case(staged_longs(&[0, 1_000, 500, 250, 750, 1]), EncodingId::Narrow, 2)]
    #[case(staged_longs(&[0, 100_000_001, 7]), EncodingId::Narrow, 4)]
    #[case(staged_longs(&[0, 1_000]), EncodingId::Single, 0)]
    #[case(staged_longs(&[i64::MAX, 0]), EncodingId::Long, 8)]
    #[case(staged_longs(&[3, 3, 3]), EncodingId::Constant, 0)]
    #[case(staged_longs(&[i64::MIN, i64::MIN]), EncodingId::Constant, 0)]
    #[case(staged_doubles(&[1.25, 2.5, 1.5, 2.25, 1.75, f64::NAN]), EncodingId::Scaled, 1)]
    #[case(staged_doubles(&[0.1, 0.2, 1_000.75]), EncodingId::Scaled, 4)]
    #[case(staged_doubles(&[0.1, 1e-7]), EncodingId::Double, 8)]
    #[case(staged_doubles(&[0.5, 1.0 / 1_073_741_824.0]), EncodingId::Single, 0)]
    #[case(staged_doubles(&[]), EncodingId::Constant, 0)]
    fn picks_compact_exact_encoding(
        #[case] staged: NewChunk,
        #[case] expected: EncodingId,
        #[case] width: u8,
    ) {
        let data = staged.clone().compress();
        assert_eq!(data.encoding(), expected);
        if let ChunkData::Narrow { codes, .. } | ChunkData::Scaled { codes, .. } = &data {
            assert_eq!(codes.width(), width);
        }
        assert_round_trip(&staged, &data);
    }

    #[test]
    fn mixed_missing_is_not_constant() {
        let mut staged = staged_longs(&[5, 5]);
        staged.append_missing();
        let data = staged.clone().compress();
        assert_eq!(data.encoding(), EncodingId::Narrow);
        assert_round_trip(&staged, &data);
    }

    #[test]
    fn wide_integers_beside_fractions_split() {
        let mut staged = staged_longs(&[i64::MAX - 1, -(1 << 60)]);
        staged.append_f64(0.5);
        staged.append_missing();
        let data = staged.clone().compress();
        assert_eq!(data.encoding(), EncodingId::Mixed);
        assert_round_trip(&staged, &data);
        assert_eq!(data.value(0), Some(Number::Long(i64::MAX - 1)));
    }

    #[test]
    fn negative_zero_survives() {
        let staged = staged_doubles(&[-0.0, 1.0]);
        let data = staged.clone().compress();
        assert_round_trip(&staged, &data);
        assert!(data.at_f64(0).is_sign_negative());
    }
}
