//! Bitmap values, held as the sorted set of set bit offsets. Bit and byte
//! numbering is MSB-first within a byte, matching Redis.

use crate::commands::NodeKind;
use crate::error::{ServerError, ServerResult};
use crate::resp::Reply;
use crate::routing::Payload;
use crate::snapshot::{put_u32, put_u64, Reader};
use std::collections::BTreeSet;
use std::io;

use super::{int_arg, uint_arg, NodeCtx, Outcome, Value};

#[derive(Debug, Default)]
pub struct BitValue {
    bits: BTreeSet<u64>,
}

enum BitCmd {
    SetBit { offset: u64, value: bool },
    GetBit(u64),
    BitCount(Option<(i64, i64)>),
    BitPos { bit: bool, start: i64, end: Option<i64> },
    Store(Vec<u64>),
    Get,
}

impl BitCmd {
    fn parse(payload: &Payload) -> ServerResult<BitCmd> {
        let args = &payload.args;
        Ok(match payload.command.as_str() {
            "setbit" => BitCmd::SetBit {
                offset: uint_arg(&args[0])?,
                value: parse_bit(&args[1])?,
            },
            "getbit" => BitCmd::GetBit(uint_arg(&args[0])?),
            "bitcount" => match args.len() {
                0 => BitCmd::BitCount(None),
                2 => BitCmd::BitCount(Some((int_arg(&args[0])?, int_arg(&args[1])?))),
                _ => return Err(ServerError::Syntax),
            },
            "bitpos" => BitCmd::BitPos {
                bit: parse_bit(&args[0])?,
                start: args.get(1).map(|s| int_arg(s)).transpose()?.unwrap_or(0),
                end: args.get(2).map(|s| int_arg(s)).transpose()?,
            },
            "_bstore" => BitCmd::Store(
                args.iter()
                    .map(|s| uint_arg(s))
                    .collect::<ServerResult<Vec<u64>>>()?,
            ),
            "_bget" => BitCmd::Get,
            other => return Err(ServerError::Generic(format!("unexpected command '{other}'"))),
        })
    }
}

fn parse_bit(s: &str) -> ServerResult<bool> {
    match s {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(ServerError::Syntax),
    }
}

impl Value for BitValue {
    const KIND: NodeKind = NodeKind::Bitmap;

    fn new(_ctx: &NodeCtx) -> Self {
        BitValue::default()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.bits.len() as u32);
        for &bit in &self.bits {
            put_u64(buf, bit);
        }
    }

    fn decode(_ctx: &NodeCtx, reader: &mut Reader) -> io::Result<Self> {
        let count = reader.u32()?;
        let mut bits = BTreeSet::new();
        for _ in 0..count {
            bits.insert(reader.u64()?);
        }
        Ok(BitValue { bits })
    }

    fn apply(&mut self, _ctx: &NodeCtx, payload: &Payload) -> ServerResult<Outcome> {
        Ok(match BitCmd::parse(payload)? {
            BitCmd::SetBit { offset, value } => {
                let previous = if value {
                    !self.bits.insert(offset)
                } else {
                    self.bits.remove(&offset)
                };
                Outcome::wrote(Reply::Int(i64::from(previous)))
            }
            BitCmd::GetBit(offset) => {
                Outcome::read(Reply::Int(i64::from(self.bits.contains(&offset))))
            }
            BitCmd::BitCount(range) => Outcome::read(Reply::Int(self.count(range))),
            BitCmd::BitPos { bit, start, end } => {
                Outcome::read(Reply::Int(self.position(bit, start, end)))
            }
            BitCmd::Store(indices) => {
                self.bits = indices.into_iter().collect();
                Outcome::wrote(Reply::Ok)
            }
            BitCmd::Get => Outcome::read(Reply::Bits(self.bits.clone())),
        })
    }

    fn store_command(&self) -> (&'static str, Vec<String>) {
        ("_bstore", self.bits.iter().map(|b| b.to_string()).collect())
    }
}

impl BitValue {
    /// Occupied length in bytes, as a zero-padded string would have.
    fn byte_len(&self) -> u64 {
        match self.bits.iter().next_back() {
            Some(&max) => max / 8 + 1,
            None => 0,
        }
    }

    /// Resolve a byte range with negative wrap against the occupied
    /// length. Returns a bit range, or `None` when it is empty.
    fn byte_range(&self, start: i64, end: i64) -> Option<(u64, u64)> {
        let len = self.byte_len() as i64;
        if len == 0 {
            return None;
        }
        let start = if start < 0 { len + start } else { start };
        let end = if end < 0 { len + end } else { end };
        if start > end {
            return None;
        }
        let start = start.max(0);
        let end = end.min(len - 1);
        if start >= len || end < 0 {
            return None;
        }
        Some((start as u64 * 8, end as u64 * 8 + 7))
    }

    fn count(&self, range: Option<(i64, i64)>) -> i64 {
        match range {
            None => self.bits.len() as i64,
            Some((start, end)) => match self.byte_range(start, end) {
                Some((lo, hi)) => self.bits.range(lo..=hi).count() as i64,
                None => 0,
            },
        }
    }

    fn position(&self, bit: bool, start: i64, end: Option<i64>) -> i64 {
        let explicit_end = end.is_some();
        let len = self.byte_len() as i64;
        if len == 0 {
            return if bit { -1 } else { 0 };
        }
        let (lo, hi) = match self.byte_range(start, end.unwrap_or(len - 1)) {
            Some(range) => range,
            None => return -1,
        };
        if bit {
            return self.bits.range(lo..=hi).next().map_or(-1, |&b| b as i64);
        }
        for offset in lo..=hi {
            if !self.bits.contains(&offset) {
                return offset as i64;
            }
        }
        // The whole range is ones. With no explicit end Redis pretends the
        // value continues with zeros; with one it does not.
        if explicit_end {
            -1
        } else {
            (hi + 1) as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testutil::{apply, ctx};

    #[test]
    fn setbit_reports_previous_value() {
        let (ctx, _rx) = ctx("bit-set");
        let mut v = BitValue::new(&ctx);
        assert_eq!(apply(&mut v, &ctx, "setbit", &["7", "1"]), Reply::Int(0));
        assert_eq!(apply(&mut v, &ctx, "setbit", &["7", "1"]), Reply::Int(1));
        assert_eq!(apply(&mut v, &ctx, "getbit", &["7"]), Reply::Int(1));
        assert_eq!(apply(&mut v, &ctx, "setbit", &["7", "0"]), Reply::Int(1));
        assert_eq!(apply(&mut v, &ctx, "getbit", &["7"]), Reply::Int(0));
        assert_eq!(apply(&mut v, &ctx, "getbit", &["100"]), Reply::Int(0));
    }

    #[test]
    fn setbit_rejects_non_binary_value() {
        let (ctx, _rx) = ctx("bit-bad");
        let mut v = BitValue::new(&ctx);
        assert!(apply(&mut v, &ctx, "setbit", &["0", "2"]).is_error());
    }

    #[test]
    fn bitcount_full_and_byte_ranges() {
        let (ctx, _rx) = ctx("bit-count");
        let mut v = BitValue::new(&ctx);
        // "foobar" has 26 set bits; bits of byte 0 are 1,2,5,6 etc. Use a
        // simpler fixture: one bit in each of bytes 0, 1, 2.
        for offset in ["0", "8", "16"] {
            apply(&mut v, &ctx, "setbit", &[offset, "1"]);
        }
        assert_eq!(apply(&mut v, &ctx, "bitcount", &[]), Reply::Int(3));
        assert_eq!(apply(&mut v, &ctx, "bitcount", &["0", "0"]), Reply::Int(1));
        assert_eq!(apply(&mut v, &ctx, "bitcount", &["1", "2"]), Reply::Int(2));
        assert_eq!(apply(&mut v, &ctx, "bitcount", &["-1", "-1"]), Reply::Int(1));
        assert_eq!(apply(&mut v, &ctx, "bitcount", &["2", "1"]), Reply::Int(0));
    }

    #[test]
    fn bitpos_finds_first_set_bit() {
        let (ctx, _rx) = ctx("bit-pos1");
        let mut v = BitValue::new(&ctx);
        apply(&mut v, &ctx, "setbit", &["12", "1"]);
        assert_eq!(apply(&mut v, &ctx, "bitpos", &["1"]), Reply::Int(12));
        assert_eq!(apply(&mut v, &ctx, "bitpos", &["1", "1"]), Reply::Int(12));
        assert_eq!(apply(&mut v, &ctx, "bitpos", &["1", "2"]), Reply::Int(-1));
    }

    #[test]
    fn bitpos_zero_over_all_ones_prefix() {
        let (ctx, _rx) = ctx("bit-pos0");
        let mut v = BitValue::new(&ctx);
        for offset in 0..8 {
            apply(&mut v, &ctx, "setbit", &[&offset.to_string(), "1"]);
        }
        // No end given: the value is treated as followed by zeros.
        assert_eq!(apply(&mut v, &ctx, "bitpos", &["0"]), Reply::Int(8));
        // Explicit end: no clear bit in range.
        assert_eq!(apply(&mut v, &ctx, "bitpos", &["0", "0", "0"]), Reply::Int(-1));
        apply(&mut v, &ctx, "setbit", &["9", "1"]);
        assert_eq!(apply(&mut v, &ctx, "bitpos", &["0"]), Reply::Int(8));
    }

    #[test]
    fn empty_value_positions() {
        let (ctx, _rx) = ctx("bit-empty");
        let mut v = BitValue::new(&ctx);
        assert_eq!(apply(&mut v, &ctx, "bitpos", &["0"]), Reply::Int(0));
        assert_eq!(apply(&mut v, &ctx, "bitpos", &["1"]), Reply::Int(-1));
        assert_eq!(apply(&mut v, &ctx, "bitcount", &[]), Reply::Int(0));
    }

    #[test]
    fn store_and_expose_round_trip() {
        let (ctx, _rx) = ctx("bit-store");
        let mut v = BitValue::new(&ctx);
        assert_eq!(apply(&mut v, &ctx, "_bstore", &["3", "11", "4"]), Reply::Ok);
        match apply(&mut v, &ctx, "_bget", &[]) {
            Reply::Bits(bits) => {
                assert_eq!(bits.into_iter().collect::<Vec<u64>>(), vec![3, 4, 11])
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn snapshot_round_trip() {
        let (ctx, _rx) = ctx("bit-snap");
        let mut v = BitValue::new(&ctx);
        for offset in ["5", "42", "1000"] {
            apply(&mut v, &ctx, "setbit", &[offset, "1"]);
        }
        let mut buf = Vec::new();
        v.encode(&mut buf);
        let restored = BitValue::decode(&ctx, &mut Reader::new(&buf)).unwrap();
        assert_eq!(restored.bits, v.bits);
    }
}
