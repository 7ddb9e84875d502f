//! HyperLogLog cardinality sketches.
//!
//! Geometry comes from the configuration: `2^register_log` registers of
//! `register_width` bits each, packed into a byte vector. Estimation uses
//! the harmonic mean with the usual small-range (linear counting) and
//! large-range corrections.

use crate::commands::NodeKind;
use crate::error::{ServerError, ServerResult};
use crate::resp::Reply;
use crate::routing::Payload;
use crate::snapshot::{put_u32, Reader};
use std::io;

use super::{NodeCtx, Outcome, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct HllValue {
    register_log: u8,
    register_width: u8,
    registers: Vec<u8>,
}

enum HllCmd {
    Add(Vec<String>),
    Count,
    Get,
    Store(Option<String>),
}

impl HllCmd {
    fn parse(payload: &Payload) -> ServerResult<HllCmd> {
        Ok(match payload.command.as_str() {
            "pfadd" => HllCmd::Add(payload.args.clone()),
            "_pfcount" => HllCmd::Count,
            "_pfget" => HllCmd::Get,
            "_pfstore" => HllCmd::Store(payload.args.first().cloned()),
            other => return Err(ServerError::Generic(format!("unexpected command '{other}'"))),
        })
    }
}

impl Value for HllValue {
    const KIND: NodeKind = NodeKind::HyperLogLog;

    fn new(ctx: &NodeCtx) -> Self {
        HllValue::with_geometry(ctx.config.register_log, ctx.config.register_width)
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        let bytes = self.to_bytes();
        put_u32(buf, bytes.len() as u32);
        buf.extend_from_slice(&bytes);
    }

    fn decode(ctx: &NodeCtx, reader: &mut Reader) -> io::Result<Self> {
        let len = reader.u32()? as usize;
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            bytes.push(reader.u8()?);
        }
        Ok(HllValue::from_bytes(&bytes)
            .unwrap_or_else(|| HllValue::with_geometry(ctx.config.register_log, ctx.config.register_width)))
    }

    fn apply(&mut self, ctx: &NodeCtx, payload: &Payload) -> ServerResult<Outcome> {
        Ok(match HllCmd::parse(payload)? {
            HllCmd::Add(elements) => {
                let mut changed = false;
                for element in &elements {
                    changed |= self.add(element.as_bytes());
                }
                Outcome::wrote(Reply::Int(i64::from(changed)))
            }
            HllCmd::Count => Outcome::read(Reply::Int(self.count() as i64)),
            HllCmd::Get => Outcome::read(Reply::Sketch(self.to_bytes())),
            HllCmd::Store(hex) => {
                let restored = hex
                    .as_deref()
                    .and_then(from_hex)
                    .and_then(|bytes| HllValue::from_bytes(&bytes));
                *self = restored.unwrap_or_else(|| {
                    HllValue::with_geometry(ctx.config.register_log, ctx.config.register_width)
                });
                Outcome::wrote(Reply::Ok)
            }
        })
    }

    fn store_command(&self) -> (&'static str, Vec<String>) {
        ("_pfstore", vec![to_hex(&self.to_bytes())])
    }
}

impl HllValue {
    pub fn with_geometry(register_log: u8, register_width: u8) -> Self {
        let registers = 1usize << register_log;
        let bytes = (registers * register_width as usize).div_ceil(8);
        HllValue {
            register_log,
            register_width,
            registers: vec![0; bytes],
        }
    }

    fn register_count(&self) -> usize {
        1 << self.register_log
    }

    fn max_run(&self) -> u8 {
        ((1u16 << self.register_width) - 1) as u8
    }

    fn register(&self, index: usize) -> u8 {
        let width = self.register_width as usize;
        let mut value = 0u8;
        for bit in 0..width {
            let pos = index * width + bit;
            if self.registers[pos / 8] >> (pos % 8) & 1 == 1 {
                value |= 1 << bit;
            }
        }
        value
    }

    fn set_register(&mut self, index: usize, value: u8) {
        let width = self.register_width as usize;
        for bit in 0..width {
            let pos = index * width + bit;
            if value >> bit & 1 == 1 {
                self.registers[pos / 8] |= 1 << (pos % 8);
            } else {
                self.registers[pos / 8] &= !(1 << (pos % 8));
            }
        }
    }

    /// Observe one element. Returns whether the sketch changed.
    pub fn add(&mut self, element: &[u8]) -> bool {
        let hash = fnv1a(element);
        let index = (hash & (self.register_count() as u64 - 1)) as usize;
        let rest = hash >> self.register_log;
        let window = 64 - self.register_log as u32;

        // Position of the first set bit in the remaining window, 1-based.
        let mut run = window as u8 + 1;
        for i in 0..window {
            if rest >> (window - 1 - i) & 1 == 1 {
                run = i as u8 + 1;
                break;
            }
        }
        let run = run.min(self.max_run());

        if run > self.register(index) {
            self.set_register(index, run);
            true
        } else {
            false
        }
    }

    pub fn count(&self) -> u64 {
        let m = self.register_count() as f64;
        let mut sum = 0.0f64;
        let mut zero_registers = 0u64;
        for i in 0..self.register_count() {
            let value = self.register(i);
            sum += 2.0f64.powi(-i32::from(value));
            if value == 0 {
                zero_registers += 1;
            }
        }

        let raw = alpha(self.register_count()) * m * m / sum;
        if raw <= 2.5 * m {
            if zero_registers > 0 {
                (m * (m / zero_registers as f64).ln()) as u64
            } else {
                raw as u64
            }
        } else if raw > (1u64 << 32) as f64 / 30.0 {
            let two_32 = (1u64 << 32) as f64;
            (-two_32 * (1.0 - raw / two_32).ln()) as u64
        } else {
            raw as u64
        }
    }

    /// Union: take the maximum of each register pair. Sketches with a
    /// different geometry cannot be combined and are ignored.
    pub fn merge(&mut self, other: &HllValue) {
        if other.register_log != self.register_log || other.register_width != self.register_width {
            return;
        }
        for i in 0..self.register_count() {
            let theirs = other.register(i);
            if theirs > self.register(i) {
                self.set_register(i, theirs);
            }
        }
    }

    /// Wire form: geometry header plus the packed registers.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.registers.len());
        bytes.push(self.register_log);
        bytes.push(self.register_width);
        bytes.extend_from_slice(&self.registers);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<HllValue> {
        if bytes.len() < 2 {
            return None;
        }
        let (register_log, register_width) = (bytes[0], bytes[1]);
        if register_log == 0 || register_log > 18 || register_width == 0 || register_width > 8 {
            return None;
        }
        let expected = ((1usize << register_log) * register_width as usize).div_ceil(8);
        if bytes.len() != 2 + expected {
            return None;
        }
        Some(HllValue {
            register_log,
            register_width,
            registers: bytes[2..].to_vec(),
        })
    }
}

fn alpha(m: usize) -> f64 {
    match m {
        16 => 0.673,
        32 => 0.697,
        64 => 0.709,
        _ => 0.7213 / (1.0 + 1.079 / m as f64),
    }
}

fn fnv1a(data: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x00000100000001B3;
    let mut hash = OFFSET_BASIS;
    for &byte in data {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testutil::{apply, ctx};

    #[test]
    fn empty_sketch_counts_zero() {
        let sketch = HllValue::with_geometry(11, 6);
        assert_eq!(sketch.count(), 0);
    }

    #[test]
    fn pfadd_reports_changes() {
        let (ctx, _rx) = ctx("hll-add");
        let mut v = HllValue::new(&ctx);
        assert_eq!(apply(&mut v, &ctx, "pfadd", &["a"]), Reply::Int(1));
        assert_eq!(apply(&mut v, &ctx, "pfadd", &["a"]), Reply::Int(0));
        assert_eq!(apply(&mut v, &ctx, "pfadd", &["a", "b"]), Reply::Int(1));
    }

    #[test]
    fn estimate_tracks_cardinality() {
        let mut sketch = HllValue::with_geometry(11, 6);
        let n = 10_000u32;
        for i in 0..n {
            sketch.add(format!("element-{i}").as_bytes());
        }
        let estimate = sketch.count();
        let error = (estimate as f64 - n as f64).abs() / n as f64;
        assert!(error < 0.1, "estimate {estimate} too far from {n}");
    }

    #[test]
    fn merge_is_union() {
        let mut a = HllValue::with_geometry(11, 6);
        let mut b = HllValue::with_geometry(11, 6);
        for i in 0..3000 {
            a.add(format!("a-{i}").as_bytes());
            b.add(format!("b-{i}").as_bytes());
        }
        let before = a.count();
        a.merge(&b);
        assert!(a.count() > before);
        assert!(a.count() > b.count());
    }

    #[test]
    fn merge_ignores_mismatched_geometry() {
        let mut a = HllValue::with_geometry(11, 6);
        let mut b = HllValue::with_geometry(10, 6);
        b.add(b"x");
        a.merge(&b);
        assert_eq!(a.count(), 0);
    }

    #[test]
    fn bytes_round_trip_through_hex() {
        let mut sketch = HllValue::with_geometry(11, 6);
        for i in 0..500 {
            sketch.add(format!("e{i}").as_bytes());
        }
        let hex = to_hex(&sketch.to_bytes());
        let restored = HllValue::from_bytes(&from_hex(&hex).unwrap()).unwrap();
        assert_eq!(restored, sketch);
    }

    #[test]
    fn store_and_get_round_trip() {
        let (ctx, _rx) = ctx("hll-store");
        let mut v = HllValue::new(&ctx);
        apply(&mut v, &ctx, "pfadd", &["x", "y", "z"]);
        let sketch = match apply(&mut v, &ctx, "_pfget", &[]) {
            Reply::Sketch(bytes) => bytes,
            other => panic!("unexpected reply: {other:?}"),
        };

        let mut w = HllValue::new(&ctx);
        apply(&mut w, &ctx, "_pfstore", &[&to_hex(&sketch)]);
        assert_eq!(w, v);
    }

    #[test]
    fn snapshot_round_trip() {
        let (ctx, _rx) = ctx("hll-snap");
        let mut v = HllValue::new(&ctx);
        apply(&mut v, &ctx, "pfadd", &["p", "q"]);
        let mut buf = Vec::new();
        v.encode(&mut buf);
        let restored = HllValue::decode(&ctx, &mut Reader::new(&buf)).unwrap();
        assert_eq!(restored, v);
    }
}
