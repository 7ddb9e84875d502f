//! String values: plain text plus the counter commands layered on top.

use crate::commands::NodeKind;
use crate::error::{ServerError, ServerResult};
use crate::resp::Reply;
use crate::routing::Payload;
use crate::snapshot::{put_str, Reader};
use std::io;

use super::{clamp_index, float_arg, int_arg, uint_arg, NodeCtx, Outcome, Value};

#[derive(Debug, Default)]
pub struct StrValue {
    data: String,
}

enum StrCmd {
    Get,
    Set(String),
    SetNx(String),
    GetSet(String),
    Append(String),
    GetRange(i64, i64),
    SetRange(u64, String),
    StrLen,
    IncrBy(i64),
    IncrByFloat(f64),
    /// Set, then schedule expiry for our own key.
    SetWithTtl { millis: u64, value: String },
}

impl StrCmd {
    fn parse(payload: &Payload) -> ServerResult<StrCmd> {
        let args = &payload.args;
        Ok(match payload.command.as_str() {
            "get" => StrCmd::Get,
            "set" | "_store" => StrCmd::Set(args[0].clone()),
            "setnx" => StrCmd::SetNx(args[0].clone()),
            "getset" => StrCmd::GetSet(args[0].clone()),
            "append" => StrCmd::Append(args[0].clone()),
            "getrange" => StrCmd::GetRange(int_arg(&args[0])?, int_arg(&args[1])?),
            "setrange" => StrCmd::SetRange(uint_arg(&args[0])?, args[1].clone()),
            "strlen" => StrCmd::StrLen,
            "incr" => StrCmd::IncrBy(1),
            "decr" => StrCmd::IncrBy(-1),
            "incrby" => StrCmd::IncrBy(int_arg(&args[0])?),
            "decrby" => StrCmd::IncrBy(
                int_arg(&args[0])?
                    .checked_neg()
                    .ok_or(ServerError::NotInteger)?,
            ),
            "incrbyfloat" => StrCmd::IncrByFloat(float_arg(&args[0])?),
            "setex" => StrCmd::SetWithTtl {
                millis: uint_arg(&args[0])?.saturating_mul(1000),
                value: args[1].clone(),
            },
            "psetex" => StrCmd::SetWithTtl {
                millis: uint_arg(&args[0])?,
                value: args[1].clone(),
            },
            other => return Err(ServerError::Generic(format!("unexpected command '{other}'"))),
        })
    }
}

impl Value for StrValue {
    const KIND: NodeKind = NodeKind::Str;

    fn new(_ctx: &NodeCtx) -> Self {
        StrValue::default()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_str(buf, &self.data);
    }

    fn decode(_ctx: &NodeCtx, reader: &mut Reader) -> io::Result<Self> {
        Ok(StrValue { data: reader.str()? })
    }

    fn apply(&mut self, ctx: &NodeCtx, payload: &Payload) -> ServerResult<Outcome> {
        Ok(match StrCmd::parse(payload)? {
            StrCmd::Get => Outcome::read(Reply::Bulk(self.data.clone())),
            StrCmd::Set(value) => {
                self.data = value;
                Outcome::wrote(Reply::Ok)
            }
            StrCmd::SetNx(value) => {
                // Absence was checked on the way in; the key is ours.
                self.data = value;
                Outcome::wrote(Reply::Bool(true))
            }
            StrCmd::GetSet(value) => {
                let old = std::mem::replace(&mut self.data, value);
                Outcome::wrote(Reply::Bulk(old))
            }
            StrCmd::Append(suffix) => {
                self.data.push_str(&suffix);
                Outcome::wrote(Reply::Int(self.data.len() as i64))
            }
            StrCmd::GetRange(start, end) => {
                Outcome::read(Reply::Bulk(self.getrange(start, end)))
            }
            StrCmd::SetRange(offset, patch) => {
                let len = self.setrange(offset as usize, &patch);
                Outcome::wrote(Reply::Int(len as i64))
            }
            StrCmd::StrLen => Outcome::read(Reply::Int(self.data.len() as i64)),
            StrCmd::IncrBy(delta) => {
                let new = self.incr_by(delta)?;
                Outcome::wrote(Reply::Int(new))
            }
            StrCmd::IncrByFloat(delta) => {
                self.incr_by_float(delta)?;
                Outcome::wrote(Reply::Bulk(self.data.clone()))
            }
            StrCmd::SetWithTtl { millis, value } => {
                self.data = value;
                ctx.route("pexpire", &ctx.key, vec![millis.to_string()]);
                Outcome::wrote(Reply::Ok)
            }
        })
    }

    fn store_command(&self) -> (&'static str, Vec<String>) {
        ("_store", vec![self.data.clone()])
    }
}

impl StrValue {
    /// Inclusive byte range with Redis's negative-index wrap.
    fn getrange(&self, start: i64, end: i64) -> String {
        let bytes = self.data.as_bytes();
        let len = bytes.len();
        if len == 0 {
            return String::new();
        }
        let start = clamp_index(start, len);
        let end = clamp_index(end, len).min(len - 1);
        if start > end {
            return String::new();
        }
        String::from_utf8_lossy(&bytes[start..=end]).into_owned()
    }

    /// Overwrite bytes at `offset`, zero-padding any gap.
    fn setrange(&mut self, offset: usize, patch: &str) -> usize {
        let mut bytes = std::mem::take(&mut self.data).into_bytes();
        let needed = offset + patch.len();
        if needed > bytes.len() {
            bytes.resize(needed, 0);
        }
        bytes[offset..needed].copy_from_slice(patch.as_bytes());
        self.data = String::from_utf8_lossy(&bytes).into_owned();
        self.data.len()
    }

    fn incr_by(&mut self, delta: i64) -> ServerResult<i64> {
        let current: i64 = if self.data.is_empty() {
            0
        } else {
            self.data.parse().map_err(|_| ServerError::NotInteger)?
        };
        let new = current
            .checked_add(delta)
            .ok_or_else(|| ServerError::Generic("increment or decrement would overflow".into()))?;
        self.data = new.to_string();
        Ok(new)
    }

    fn incr_by_float(&mut self, delta: f64) -> ServerResult<f64> {
        let current: f64 = if self.data.is_empty() {
            0.0
        } else {
            self.data.parse().map_err(|_| ServerError::NotFloat)?
        };
        let new = current + delta;
        if new.is_nan() || new.is_infinite() {
            return Err(ServerError::Generic(
                "increment would produce NaN or Infinity".into(),
            ));
        }
        self.data = format_float(new);
        Ok(new)
    }
}

/// Format a float the way Redis prints it: shortest representation that
/// round-trips, and never `-0`.
pub fn format_float(n: f64) -> String {
    if n == 0.0 {
        return "0".to_string();
    }
    let simple = format!("{n}");
    if simple.parse::<f64>().ok() == Some(n) {
        simple
    } else {
        format!("{n:.17}")
    }
}
