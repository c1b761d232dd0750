use std::fmt::{Display, Formatter};

use num_traits::ToPrimitive;
use tessel_error::{TesselError, TesselResult, tessel_err};

use crate::{NewChunk, Number};

/// The wire tag of a [`ChunkData`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EncodingId {
    Constant = 0,
    Narrow = 1,
    Scaled = 2,
    Long = 3,
    Single = 4,
    Double = 5,
    Mixed = 6,
}

impl TryFrom<u8> for EncodingId {
    type Error = TesselError;

    fn try_from(value: u8) -> TesselResult<Self> {
        Ok(match value {
            0 => EncodingId::Constant,
            1 => EncodingId::Narrow,
            2 => EncodingId::Scaled,
            3 => EncodingId::Long,
            4 => EncodingId::Single,
            5 => EncodingId::Double,
            6 => EncodingId::Mixed,
            _ => return Err(tessel_err!("unknown encoding tag {}", value)),
        })
    }
}

impl Display for EncodingId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EncodingId::Constant => "tessel.constant",
            EncodingId::Narrow => "tessel.narrow",
            EncodingId::Scaled => "tessel.scaled",
            EncodingId::Long => "tessel.long",
            EncodingId::Single => "tessel.single",
            EncodingId::Double => "tessel.double",
            EncodingId::Mixed => "tessel.mixed",
        };
        f.write_str(name)
    }
}

/// Unsigned frame-of-reference codes. The maximum value of each width is the missing marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Codes {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl Codes {
    /// Smallest code width whose non-marker codes cover `0..=range`.
    pub(crate) fn for_range(range: u64, len: usize) -> Option<Self> {
        if range < u64::from(u8::MAX) {
            Some(Codes::U8(vec![u8::MAX; len]))
        } else if range < u64::from(u16::MAX) {
            Some(Codes::U16(vec![u16::MAX; len]))
        } else if range < u64::from(u32::MAX) {
            Some(Codes::U32(vec![u32::MAX; len]))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Codes::U8(c) => c.len(),
            Codes::U16(c) => c.len(),
            Codes::U32(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes per code.
    pub fn width(&self) -> u8 {
        match self {
            Codes::U8(_) => 1,
            Codes::U16(_) => 2,
            Codes::U32(_) => 4,
        }
    }

    /// The code at `idx`, or `None` for the missing marker.
    #[inline]
    pub fn get(&self, idx: usize) -> Option<u32> {
        match self {
            Codes::U8(c) => (c[idx] != u8::MAX).then(|| u32::from(c[idx])),
            Codes::U16(c) => (c[idx] != u16::MAX).then(|| u32::from(c[idx])),
            Codes::U32(c) => (c[idx] != u32::MAX).then_some(c[idx]),
        }
    }

    /// Store `code` at `idx`; false if it collides with or exceeds the missing marker.
    #[inline]
    pub fn try_set(&mut self, idx: usize, code: Option<u64>) -> bool {
        match self {
            Codes::U8(c) => match code {
                None => c[idx] = u8::MAX,
                Some(v) => match u8::try_from(v) {
                    Ok(v) if v != u8::MAX => c[idx] = v,
                    _ => return false,
                },
            },
            Codes::U16(c) => match code {
                None => c[idx] = u16::MAX,
                Some(v) => match u16::try_from(v) {
                    Ok(v) if v != u16::MAX => c[idx] = v,
                    _ => return false,
                },
            },
            Codes::U32(c) => match code {
                None => c[idx] = u32::MAX,
                Some(v) => match u32::try_from(v) {
                    Ok(v) if v != u32::MAX => c[idx] = v,
                    _ => return false,
                },
            },
        }
        true
    }
}

/// Decimal scale factors for [`ChunkData::Scaled`], indexed by exponent.
pub(crate) const POW10: [f64; 5] = [1.0, 10.0, 100.0, 1_000.0, 10_000.0];

/// Largest decimal exponent a scaled chunk may declare.
pub const MAX_SCALE_EXPONENT: u8 = 4;

/// The encoded body of a chunk: one variant per compression scheme.
///
/// Every operation is a single `match` over the variants, so adding a scheme means extending
/// each table below rather than implementing a trait somewhere else.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkData {
    /// Every row holds the same value (or every row is missing).
    Constant { len: usize, value: Option<Number> },
    /// Integers stored as `bias + code`.
    Narrow { bias: i64, codes: Codes },
    /// Decimals stored as `(bias + code) / 10^exponent`.
    Scaled { bias: i64, exponent: u8, codes: Codes },
    /// Plain integers; `i64::MIN` marks a missing row.
    Long(Vec<i64>),
    /// Plain single precision floats; `NaN` marks a missing row.
    Single(Vec<f32>),
    /// Plain double precision floats; `NaN` marks a missing row.
    Double(Vec<f64>),
    /// Integers too wide for a double next to fractional values. A row reads `longs[idx]` unless
    /// that is `i64::MIN`, then `doubles[idx]`; both markers together mean missing.
    Mixed { longs: Vec<i64>, doubles: Vec<f64> },
}

impl ChunkData {
    pub fn encoding(&self) -> EncodingId {
        match self {
            ChunkData::Constant { .. } => EncodingId::Constant,
            ChunkData::Narrow { .. } => EncodingId::Narrow,
            ChunkData::Scaled { .. } => EncodingId::Scaled,
            ChunkData::Long(_) => EncodingId::Long,
            ChunkData::Single(_) => EncodingId::Single,
            ChunkData::Double(_) => EncodingId::Double,
            ChunkData::Mixed { .. } => EncodingId::Mixed,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ChunkData::Constant { len, .. } => *len,
            ChunkData::Narrow { codes, .. } | ChunkData::Scaled { codes, .. } => codes.len(),
            ChunkData::Long(v) => v.len(),
            ChunkData::Single(v) => v.len(),
            ChunkData::Double(v) => v.len(),
            ChunkData::Mixed { longs, .. } => longs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the encoded payload in bytes.
    pub fn nbytes(&self) -> usize {
        match self {
            ChunkData::Constant { .. } => 9,
            ChunkData::Narrow { codes, .. } => 9 + codes.len() * usize::from(codes.width()),
            ChunkData::Scaled { codes, .. } => 10 + codes.len() * usize::from(codes.width()),
            ChunkData::Long(v) => v.len() * 8,
            ChunkData::Single(v) => v.len() * 4,
            ChunkData::Double(v) => v.len() * 8,
            ChunkData::Mixed { longs, .. } => longs.len() * 16,
        }
    }

    /// True if the encoding can hold fractional values.
    pub fn has_float(&self) -> bool {
        match self {
            ChunkData::Constant { value, .. } => {
                matches!(value, Some(n) if n.exact_i64().is_none())
            }
            ChunkData::Narrow { .. } | ChunkData::Long(_) => false,
            ChunkData::Scaled { .. }
            | ChunkData::Single(_)
            | ChunkData::Double(_)
            | ChunkData::Mixed { .. } => true,
        }
    }

    /// The decoded value at `idx`, or `None` if the row is missing.
    #[inline]
    pub fn value(&self, idx: usize) -> Option<Number> {
        match self {
            ChunkData::Constant { value, .. } => *value,
            ChunkData::Narrow { bias, codes } => {
                codes.get(idx).map(|c| Number::Long(bias.wrapping_add(i64::from(c))))
            }
            ChunkData::Scaled {
                bias,
                exponent,
                codes,
            } => codes
                .get(idx)
                .map(|c| Number::Double(descale(bias.wrapping_add(i64::from(c)), *exponent))),
            ChunkData::Long(v) => (v[idx] != i64::MIN).then_some(Number::Long(v[idx])),
            ChunkData::Single(v) => (!v[idx].is_nan()).then_some(Number::Double(f64::from(v[idx]))),
            ChunkData::Double(v) => (!v[idx].is_nan()).then_some(Number::Double(v[idx])),
            ChunkData::Mixed { longs, doubles } => match longs[idx] {
                i64::MIN => (!doubles[idx].is_nan()).then_some(Number::Double(doubles[idx])),
                l => Some(Number::Long(l)),
            },
        }
    }

    #[inline]
    pub fn at_f64(&self, idx: usize) -> f64 {
        match self {
            ChunkData::Single(v) => f64::from(v[idx]),
            ChunkData::Double(v) => v[idx],
            _ => self.value(idx).map_or(f64::NAN, Number::as_f64),
        }
    }

    #[inline]
    pub fn is_missing(&self, idx: usize) -> bool {
        self.value(idx).is_none()
    }

    /// Attempt an in-place update of row `idx`; `None` writes the missing marker.
    ///
    /// Returns false, leaving the row untouched, if the value is not exactly representable.
    pub fn try_set(&mut self, idx: usize, value: Option<Number>) -> bool {
        match self {
            ChunkData::Constant { value: current, .. } => match (current, value) {
                (None, None) => true,
                (Some(c), Some(v)) => c.same(v),
                _ => false,
            },
            ChunkData::Narrow { bias, codes } => match value {
                None => codes.try_set(idx, None),
                Some(v) => match v.exact_i64().and_then(|v| offset(v, *bias)) {
                    Some(code) => codes.try_set(idx, Some(code)),
                    None => false,
                },
            },
            ChunkData::Scaled {
                bias,
                exponent,
                codes,
            } => match value {
                None => codes.try_set(idx, None),
                Some(v) => match v
                    .exact_f64()
                    .and_then(|d| scale(d, *exponent))
                    .and_then(|m| offset(m, *bias))
                {
                    Some(code) => codes.try_set(idx, Some(code)),
                    None => false,
                },
            },
            ChunkData::Long(values) => match value {
                None => {
                    values[idx] = i64::MIN;
                    true
                }
                Some(v) => match v.exact_i64() {
                    Some(l) if l != i64::MIN => {
                        values[idx] = l;
                        true
                    }
                    _ => false,
                },
            },
            ChunkData::Single(values) => match value {
                None => {
                    values[idx] = f32::NAN;
                    true
                }
                Some(v) => match v.exact_f64().and_then(narrow_f32) {
                    Some(f) => {
                        values[idx] = f;
                        true
                    }
                    None => false,
                },
            },
            ChunkData::Double(values) => match value {
                None => {
                    values[idx] = f64::NAN;
                    true
                }
                Some(v) => match v.exact_f64() {
                    Some(d) if !d.is_nan() => {
                        values[idx] = d;
                        true
                    }
                    _ => false,
                },
            },
            ChunkData::Mixed { longs, doubles } => match split_cell(value) {
                Some((l, d)) => {
                    longs[idx] = l;
                    doubles[idx] = d;
                    true
                }
                None => false,
            },
        }
    }

    /// Decode every row into a staging buffer.
    pub fn inflate(&self) -> NewChunk {
        let mut staged = NewChunk::with_capacity(self.len());
        for idx in 0..self.len() {
            staged.append(self.value(idx));
        }
        staged
    }
}

/// The `(longs, doubles)` pair a [`ChunkData::Mixed`] row stores for `value`.
pub(crate) fn split_cell(value: Option<Number>) -> Option<(i64, f64)> {
    let Some(v) = value else {
        return Some((i64::MIN, f64::NAN));
    };
    match v.exact_i64() {
        Some(l) if l != i64::MIN => Some((l, f64::NAN)),
        _ => v.exact_f64().filter(|d| !d.is_nan()).map(|d| (i64::MIN, d)),
    }
}

#[inline]
pub(crate) fn descale(mantissa: i64, exponent: u8) -> f64 {
    mantissa.to_f64().map_or(f64::NAN, |m| m / POW10[usize::from(exponent)])
}

/// Mantissas at or above this magnitude are not exact in an `f64`.
const F64_EXACT_MANTISSA: f64 = 9_007_199_254_740_992.0;

/// The mantissa `m` with `m / 10^exponent == d` exactly, if there is one.
pub(crate) fn scale(d: f64, exponent: u8) -> Option<i64> {
    let m = (d * POW10[usize::from(exponent)]).round();
    if !m.is_finite() || m.abs() >= F64_EXACT_MANTISSA {
        return None;
    }
    let m = m.to_i64()?;
    (descale(m, exponent).to_bits() == d.to_bits()).then_some(m)
}

/// `value - bias` as an unsigned code, if non-negative.
pub(crate) fn offset(value: i64, bias: i64) -> Option<u64> {
    (i128::from(value) - i128::from(bias)).to_u64()
}

pub(crate) fn narrow_f32(d: f64) -> Option<f32> {
    d.to_f32()
        .filter(|f| !d.is_nan() && f64::from(*f).to_bits() == d.to_bits())
}
