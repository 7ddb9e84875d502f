//! List values, including the blocking pops.
//!
//! A blocking pop against an empty list parks its payload in a FIFO held
//! by the value. Every size-increasing mutation drains that FIFO while
//! elements remain; a timeout timer answers `nil` instead. Each parked
//! payload is answered exactly once: serving removes it from the FIFO, and
//! a late timer firing for a served token finds nothing to do.

use crate::commands::NodeKind;
use crate::error::{ServerError, ServerResult};
use crate::resp::Reply;
use crate::routing::Payload;
use crate::snapshot::{put_str, put_u32, Reader};
use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use super::set::SortSpec;
use super::{clamp_index, float_arg, int_arg, NodeCtx, NodeMsg, Outcome, Value};

#[derive(Debug, Default)]
pub struct ListValue {
    items: VecDeque<String>,
    blocked: VecDeque<Blocked>,
    next_token: u64,
}

#[derive(Debug)]
struct Blocked {
    token: u64,
    payload: Payload,
}

enum ListCmd {
    Push { front: bool, values: Vec<String> },
    Pop { front: bool },
    Len,
    Range(i64, i64),
    Trim(i64, i64),
    Set(i64, String),
    Index(i64),
    RemoveAt(i64),
    Insert { before: bool, pivot: String, value: String },
    PopPush { destination: String },
    BlockingPop { front: bool, timeout: f64 },
    BlockingPopPush { destination: String, timeout: f64 },
    Store(Vec<String>),
    Sort(SortSpec),
}

impl ListCmd {
    fn parse(payload: &Payload) -> ServerResult<ListCmd> {
        let args = &payload.args;
        Ok(match payload.command.as_str() {
            "lpush" | "lpushx" => ListCmd::Push { front: true, values: args.clone() },
            "rpush" | "rpushx" => ListCmd::Push { front: false, values: args.clone() },
            "lpop" => ListCmd::Pop { front: true },
            "rpop" => ListCmd::Pop { front: false },
            "llen" => ListCmd::Len,
            "lrange" => ListCmd::Range(int_arg(&args[0])?, int_arg(&args[1])?),
            "ltrim" => ListCmd::Trim(int_arg(&args[0])?, int_arg(&args[1])?),
            "lset" => ListCmd::Set(int_arg(&args[0])?, args[1].clone()),
            "lindex" => ListCmd::Index(int_arg(&args[0])?),
            "lrem" => ListCmd::RemoveAt(int_arg(&args[0])?),
            "linsert" => ListCmd::Insert {
                before: match args[0].to_uppercase().as_str() {
                    "BEFORE" => true,
                    "AFTER" => false,
                    _ => return Err(ServerError::Syntax),
                },
                pivot: args[1].clone(),
                value: args[2].clone(),
            },
            "rpoplpush" => ListCmd::PopPush { destination: args[0].clone() },
            "blpop" => ListCmd::BlockingPop { front: true, timeout: float_arg(&args[0])? },
            "brpop" => ListCmd::BlockingPop { front: false, timeout: float_arg(&args[0])? },
            "brpoplpush" => ListCmd::BlockingPopPush {
                destination: args[0].clone(),
                timeout: float_arg(&args[1])?,
            },
            "_lstore" => ListCmd::Store(args.clone()),
            "sort" => ListCmd::Sort(SortSpec::parse(args)?),
            other => return Err(ServerError::Generic(format!("unexpected command '{other}'"))),
        })
    }
}

impl Value for ListValue {
    const KIND: NodeKind = NodeKind::List;

    fn new(_ctx: &NodeCtx) -> Self {
        ListValue::default()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.items.len() as u32);
        for item in &self.items {
            put_str(buf, item);
        }
    }

    fn decode(_ctx: &NodeCtx, reader: &mut Reader) -> io::Result<Self> {
        let count = reader.u32()?;
        let mut items = VecDeque::with_capacity(count as usize);
        for _ in 0..count {
            items.push_back(reader.str()?);
        }
        Ok(ListValue { items, ..ListValue::default() })
    }

    fn apply(&mut self, ctx: &NodeCtx, payload: &Payload) -> ServerResult<Outcome> {
        Ok(match ListCmd::parse(payload)? {
            ListCmd::Push { front, values } => {
                for value in values {
                    if front {
                        self.items.push_front(value);
                    } else {
                        self.items.push_back(value);
                    }
                }
                self.drain_blocked(ctx);
                Outcome::wrote(Reply::Int(self.items.len() as i64))
            }
            ListCmd::Pop { front } => {
                let popped = if front { self.items.pop_front() } else { self.items.pop_back() };
                match popped {
                    Some(value) => Outcome::wrote(Reply::Bulk(value)),
                    None => Outcome::read(Reply::Nil),
                }
            }
            ListCmd::Len => Outcome::read(Reply::Int(self.items.len() as i64)),
            ListCmd::Range(start, stop) => {
                Outcome::read(Reply::Array(
                    self.range(start, stop).into_iter().map(Reply::Bulk).collect(),
                ))
            }
            ListCmd::Trim(start, stop) => {
                let kept = self.range(start, stop);
                self.items = kept.into();
                Outcome::wrote(Reply::Ok)
            }
            ListCmd::Set(index, value) => {
                let index = self.resolve(index).ok_or(ServerError::IndexOutOfRange)?;
                self.items[index] = value;
                Outcome::wrote(Reply::Ok)
            }
            ListCmd::Index(index) => Outcome::read(
                self.resolve(index)
                    .and_then(|i| self.items.get(i))
                    .map_or(Reply::Nil, |v| Reply::Bulk(v.clone())),
            ),
            ListCmd::RemoveAt(index) => match self.resolve(index) {
                Some(i) => {
                    self.items.remove(i);
                    Outcome::wrote(Reply::Int(1))
                }
                None => Outcome::read(Reply::Int(0)),
            },
            ListCmd::Insert { before, pivot, value } => {
                match self.items.iter().position(|v| *v == pivot) {
                    Some(at) => {
                        self.items.insert(if before { at } else { at + 1 }, value);
                        self.drain_blocked(ctx);
                        Outcome::wrote(Reply::Int(self.items.len() as i64))
                    }
                    None => Outcome::read(Reply::Int(-1)),
                }
            }
            ListCmd::PopPush { destination } => match self.items.pop_back() {
                Some(value) => {
                    ctx.route("lpush", &destination, vec![value.clone()]);
                    Outcome::wrote(Reply::Bulk(value))
                }
                None => Outcome::read(Reply::Nil),
            },
            ListCmd::BlockingPop { front, .. } if !self.items.is_empty() => {
                let value = if front {
                    self.items.pop_front()
                } else {
                    self.items.pop_back()
                };
                Outcome::wrote(Reply::Bulk(value.unwrap_or_default()))
            }
            ListCmd::BlockingPopPush { destination, .. } if !self.items.is_empty() => {
                let value = self.items.pop_back().unwrap_or_default();
                ctx.route("lpush", &destination, vec![value.clone()]);
                Outcome::wrote(Reply::Bulk(value))
            }
            ListCmd::BlockingPop { timeout, .. } | ListCmd::BlockingPopPush { timeout, .. } => {
                self.park(ctx, payload.clone(), timeout);
                Outcome::parked()
            }
            ListCmd::Store(values) => {
                self.items = values.into();
                self.drain_blocked(ctx);
                Outcome::wrote(Reply::Ok)
            }
            ListCmd::Sort(spec) => {
                Outcome::read(spec.run(self.items.iter().cloned().collect())?)
            }
        })
    }

    fn store_command(&self) -> (&'static str, Vec<String>) {
        ("_lstore", self.items.iter().cloned().collect())
    }

    fn unblock(&mut self, _ctx: &NodeCtx, token: u64) {
        if let Some(at) = self.blocked.iter().position(|b| b.token == token) {
            let blocked = self.blocked.remove(at).expect("position was valid");
            blocked.payload.respond(Reply::Nil);
        }
    }
}

impl ListValue {
    fn resolve(&self, index: i64) -> Option<usize> {
        let len = self.items.len() as i64;
        let index = if index < 0 { len + index } else { index };
        if index < 0 || index >= len {
            None
        } else {
            Some(index as usize)
        }
    }

    /// Inclusive range with negative wrap, Redis style.
    fn range(&self, start: i64, stop: i64) -> Vec<String> {
        let len = self.items.len();
        let start = clamp_index(start, len);
        let stop = clamp_index(stop, len);
        if start > stop || start >= len {
            return Vec::new();
        }
        let stop = stop.min(len - 1);
        self.items.range(start..=stop).cloned().collect()
    }

    fn park(&mut self, ctx: &NodeCtx, payload: Payload, timeout: f64) {
        let token = self.next_token;
        self.next_token += 1;
        self.blocked.push_back(Blocked { token, payload });

        // A zero timeout blocks until data arrives.
        if timeout > 0.0 {
            let tx = ctx.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(timeout)).await;
                let _ = tx.send(NodeMsg::Unblock { token });
            });
        }
    }

    /// Serve parked pops oldest-first while elements remain.
    fn drain_blocked(&mut self, ctx: &NodeCtx) {
        while !self.items.is_empty() {
            let blocked = match self.blocked.pop_front() {
                Some(blocked) => blocked,
                None => break,
            };
            let reply = match blocked.payload.command.as_str() {
                "blpop" => self.items.pop_front().map(Reply::Bulk),
                "brpop" => self.items.pop_back().map(Reply::Bulk),
                "brpoplpush" => self.items.pop_back().map(|value| {
                    if let Some(destination) = blocked.payload.args.first() {
                        ctx.route("lpush", destination, vec![value.clone()]);
                    }
                    Reply::Bulk(value)
                }),
                _ => None,
            };
            blocked.payload.respond(reply.unwrap_or(Reply::Nil));
        }
    }
}
