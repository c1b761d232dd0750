//! Chunk wire format.
//!
//! `[tag u8][len u32 LE][variant header][payload]`, all little endian:
//!
//! | variant  | header                         | payload            |
//! |----------|--------------------------------|--------------------|
//! | Constant | `kind u8`, `value 8 bytes`     |                    |
//! | Narrow   | `bias i64`, `width u8`         | `len` codes        |
//! | Scaled   | `bias i64`, `exp u8`, `width u8` | `len` codes      |
//! | Long     |                                | `len` × `i64`      |
//! | Single   |                                | `len` × `f32`      |
//! | Double   |                                | `len` × `f64`      |
//! | Mixed    |                                | `len` × `i64`, then `len` × `f64` |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tessel_error::{TesselResult, tessel_bail, tessel_err};

use crate::encoding::MAX_SCALE_EXPONENT;
use crate::{ChunkData, Codes, EncodingId, Number};

const HEADER_LEN: usize = 5;

const CONSTANT_MISSING: u8 = 0;
const CONSTANT_LONG: u8 = 1;
const CONSTANT_DOUBLE: u8 = 2;

impl ChunkData {
    /// Serialize into the chunk wire format.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.nbytes());
        buf.put_u8(self.encoding() as u8);
        // Chunks are bounded well below u32::MAX rows.
        buf.put_u32_le(self.len() as u32);

        match self {
            ChunkData::Constant { value, .. } => match value {
                None => {
                    buf.put_u8(CONSTANT_MISSING);
                    buf.put_u64_le(0);
                }
                Some(Number::Long(v)) => {
                    buf.put_u8(CONSTANT_LONG);
                    buf.put_i64_le(*v);
                }
                Some(Number::Double(d)) => {
                    buf.put_u8(CONSTANT_DOUBLE);
                    buf.put_f64_le(*d);
                }
            },
            ChunkData::Narrow { bias, codes } => {
                buf.put_i64_le(*bias);
                put_codes(&mut buf, codes);
            }
            ChunkData::Scaled {
                bias,
                exponent,
                codes,
            } => {
                buf.put_i64_le(*bias);
                buf.put_u8(*exponent);
                put_codes(&mut buf, codes);
            }
            ChunkData::Long(values) => values.iter().for_each(|v| buf.put_i64_le(*v)),
            ChunkData::Single(values) => values.iter().for_each(|v| buf.put_f32_le(*v)),
            ChunkData::Double(values) => values.iter().for_each(|v| buf.put_f64_le(*v)),
            ChunkData::Mixed { longs, doubles } => {
                longs.iter().for_each(|v| buf.put_i64_le(*v));
                doubles.iter().for_each(|v| buf.put_f64_le(*v));
            }
        }
        buf.freeze()
    }

    /// Parse the chunk wire format. Truncated or inconsistent input is an `InvalidArgument` error.
    pub fn decode(bytes: &[u8]) -> TesselResult<ChunkData> {
        let mut buf = bytes;
        ensure(buf, HEADER_LEN, "chunk header")?;
        let encoding = EncodingId::try_from(buf.get_u8())?;
        let len = usize::try_from(buf.get_u32_le())
            .map_err(|_| tessel_err!(InvalidArgument: "chunk length exceeds address space"))?;

        let data = match encoding {
            EncodingId::Constant => {
                ensure(buf, 9, "constant value")?;
                let value = match buf.get_u8() {
                    CONSTANT_MISSING => {
                        buf.advance(8);
                        None
                    }
                    CONSTANT_LONG => Some(Number::Long(buf.get_i64_le())),
                    CONSTANT_DOUBLE => Some(Number::Double(buf.get_f64_le())),
                    kind => tessel_bail!(InvalidArgument: "unknown constant kind {kind}"),
                };
                ChunkData::Constant { len, value }
            }
            EncodingId::Narrow => {
                ensure(buf, 9, "narrow header")?;
                let bias = buf.get_i64_le();
                ChunkData::Narrow {
                    bias,
                    codes: get_codes(&mut buf, len)?,
                }
            }
            EncodingId::Scaled => {
                ensure(buf, 10, "scaled header")?;
                let bias = buf.get_i64_le();
                let exponent = buf.get_u8();
                if exponent == 0 || exponent > MAX_SCALE_EXPONENT {
                    tessel_bail!(InvalidArgument: "scale exponent {exponent} out of range");
                }
                ChunkData::Scaled {
                    bias,
                    exponent,
                    codes: get_codes(&mut buf, len)?,
                }
            }
            EncodingId::Long => {
                ensure_values(buf, len, 8)?;
                ChunkData::Long((0..len).map(|_| buf.get_i64_le()).collect())
            }
            EncodingId::Single => {
                ensure_values(buf, len, 4)?;
                ChunkData::Single((0..len).map(|_| buf.get_f32_le()).collect())
            }
            EncodingId::Double => {
                ensure_values(buf, len, 8)?;
                ChunkData::Double((0..len).map(|_| buf.get_f64_le()).collect())
            }
            EncodingId::Mixed => {
                ensure_values(buf, len, 16)?;
                let longs = (0..len).map(|_| buf.get_i64_le()).collect();
                let doubles = (0..len).map(|_| buf.get_f64_le()).collect();
                ChunkData::Mixed { longs, doubles }
            }
        };

        if buf.has_remaining() {
            tessel_bail!(InvalidArgument: "{} trailing bytes after {encoding} chunk", buf.remaining());
        }
        Ok(data)
    }
}

fn ensure(buf: &[u8], needed: usize, what: &str) -> TesselResult<()> {
    if buf.len() < needed {
        tessel_bail!(InvalidArgument: "truncated {what}: need {needed} bytes, have {}", buf.len());
    }
    Ok(())
}

fn ensure_values(buf: &[u8], len: usize, width: usize) -> TesselResult<()> {
    let needed = len
        .checked_mul(width)
        .ok_or_else(|| tessel_err!(InvalidArgument: "chunk of {len} rows overflows"))?;
    ensure(buf, needed, "chunk payload")
}

fn put_codes(buf: &mut BytesMut, codes: &Codes) {
    buf.put_u8(codes.width());
    match codes {
        Codes::U8(c) => buf.put_slice(c),
        Codes::U16(c) => c.iter().for_each(|v| buf.put_u16_le(*v)),
        Codes::U32(c) => c.iter().for_each(|v| buf.put_u32_le(*v)),
    }
}

fn get_codes(buf: &mut &[u8], len: usize) -> TesselResult<Codes> {
    let width = buf.get_u8();
    ensure_values(buf, len, usize::from(width))?;
    Ok(match width {
        1 => {
            let mut codes = vec![0; len];
            buf.copy_to_slice(&mut codes);
            Codes::U8(codes)
        }
        2 => Codes::U16((0..len).map(|_| buf.get_u16_le()).collect()),
        4 => Codes::U32((0..len).map(|_| buf.get_u32_le()).collect()),
        w => tessel_bail!(InvalidArgument: "unsupported code width {w}"),
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn assert_same(a: &ChunkData, b: &ChunkData) {
        assert_eq!(a.encoding(), b.encoding());
        assert_eq!(a.len(), b.len());
        for idx in 0..a.len() {
            match (a.value(idx), b.value(idx)) {
                (None, None) => {}
                (Some(x), Some(y)) => assert!(x.same(y), "row {idx}: {x:?} != {y:?}"),
                (x, y) => unreachable!("row {idx}: {x:?} != {y:?}"),
            }
        }
    }

    #[rstest]
    #[case(ChunkData::Constant { len: 3, value: None })]
    #[case(ChunkData::Constant { len: 3, value: Some(Number::Long(-4)) })]
    #[case(ChunkData::Constant { len: 1, value: Some(Number::Double(0.5)) })]
    #[case(ChunkData::Narrow { bias: -10, codes: Codes::U8(vec![0, 3, u8::MAX]) })]
    #[case(ChunkData::Narrow { bias: 7, codes: Codes::U16(vec![400, u16::MAX]) })]
    #[case(ChunkData::Scaled { bias: 0, exponent: 2, codes: Codes::U32(vec![125, u32::MAX, 70_000]) })]
    #[case(ChunkData::Long(vec![i64::MAX, i64::MIN, 0]))]
    #[case(ChunkData::Single(vec![1.5, f32::NAN]))]
    #[case(ChunkData::Double(vec![-0.0, f64::NAN, 1e300]))]
    #[case(ChunkData::Mixed { longs: vec![i64::MAX, i64::MIN, i64::MIN], doubles: vec![f64::NAN, 0.25, f64::NAN] })]
    fn encoding_is_lossless(#[case] data: ChunkData) {
        let bytes = data.encode();
        assert_eq!(bytes.len(), HEADER_LEN + data.nbytes());
        assert_same(&data, &ChunkData::decode(&bytes).unwrap());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = ChunkData::Long(vec![1, 2, 3]).encode();
        for cut in 0..bytes.len() {
            let err = ChunkData::decode(&bytes[..cut]).unwrap_err();
            assert!(err.to_string().contains("truncated"), "{err}");
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = ChunkData::Single(vec![1.0]).encode().to_vec();
        bytes.push(0);
        assert!(ChunkData::decode(&bytes).is_err());
    }

    #[rstest]
    #[case(&[9, 0, 0, 0, 0])]
    #[case(&[1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 3, 0])]
    #[case(&[2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 9, 1])]
    #[case(&[0, 1, 0, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0, 0])]
    fn malformed_headers_are_rejected(#[case] bytes: &[u8]) {
        assert!(ChunkData::decode(bytes).is_err());
    }
}
