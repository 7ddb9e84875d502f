//! Set values.

use crate::commands::NodeKind;
use crate::error::{ServerError, ServerResult};
use crate::glob::glob_match;
use crate::resp::Reply;
use crate::routing::Payload;
use crate::snapshot::{put_str, put_u32, Reader};
use rand::seq::IteratorRandom;
use std::collections::HashSet;
use std::io;

use super::{int_arg, NodeCtx, Outcome, Value};

#[derive(Debug, Default)]
pub struct SetValue {
    members: HashSet<String>,
}

enum SetCmd {
    Add(Vec<String>),
    Rem(Vec<String>),
    Card,
    IsMember(String),
    Members,
    RandMember(Option<i64>),
    Pop(Option<i64>),
    Scan { cursor: usize, pattern: Option<String>, count: usize },
    Move { destination: String, member: String },
    Store(Vec<String>),
    Sort(SortSpec),
}

impl SetCmd {
    fn parse(payload: &Payload) -> ServerResult<SetCmd> {
        let args = &payload.args;
        Ok(match payload.command.as_str() {
            "sadd" => SetCmd::Add(args.clone()),
            "srem" => SetCmd::Rem(args.clone()),
            "scard" => SetCmd::Card,
            "sismember" => SetCmd::IsMember(args[0].clone()),
            "smembers" => SetCmd::Members,
            "srandmember" => {
                SetCmd::RandMember(args.first().map(|s| int_arg(s)).transpose()?)
            }
            "spop" => SetCmd::Pop(args.first().map(|s| int_arg(s)).transpose()?),
            "sscan" => {
                let (cursor, pattern, count) = parse_scan(args)?;
                SetCmd::Scan { cursor, pattern, count }
            }
            "smove" => SetCmd::Move {
                destination: args[0].clone(),
                member: args[1].clone(),
            },
            "_sstore" => SetCmd::Store(args.clone()),
            "sort" => SetCmd::Sort(SortSpec::parse(args)?),
            other => return Err(ServerError::Generic(format!("unexpected command '{other}'"))),
        })
    }
}

impl Value for SetValue {
    const KIND: NodeKind = NodeKind::Set;

    fn new(_ctx: &NodeCtx) -> Self {
        SetValue::default()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.members.len() as u32);
        for member in &self.members {
            put_str(buf, member);
        }
    }

    fn decode(_ctx: &NodeCtx, reader: &mut Reader) -> io::Result<Self> {
        let count = reader.u32()?;
        let mut members = HashSet::with_capacity(count as usize);
        for _ in 0..count {
            members.insert(reader.str()?);
        }
        Ok(SetValue { members })
    }

    fn apply(&mut self, ctx: &NodeCtx, payload: &Payload) -> ServerResult<Outcome> {
        Ok(match SetCmd::parse(payload)? {
            SetCmd::Add(new) => {
                let mut added = 0;
                for member in new {
                    if self.members.insert(member) {
                        added += 1;
                    }
                }
                Outcome::wrote(Reply::Int(added))
            }
            SetCmd::Rem(gone) => {
                let mut removed = 0;
                for member in &gone {
                    if self.members.remove(member) {
                        removed += 1;
                    }
                }
                Outcome { reply: Some(Reply::Int(removed)), wrote: removed > 0 }
            }
            SetCmd::Card => Outcome::read(Reply::Int(self.members.len() as i64)),
            SetCmd::IsMember(member) => {
                Outcome::read(Reply::Bool(self.members.contains(&member)))
            }
            SetCmd::Members => {
                let mut members: Vec<&String> = self.members.iter().collect();
                members.sort();
                Outcome::read(Reply::Array(
                    members.into_iter().map(|m| Reply::Bulk(m.clone())).collect(),
                ))
            }
            SetCmd::RandMember(count) => Outcome::read(self.random_members(count)),
            SetCmd::Pop(count) => {
                let reply = self.random_members(count);
                let popped: Vec<String> = match &reply {
                    Reply::Bulk(m) => vec![m.clone()],
                    Reply::Array(items) => items
                        .iter()
                        .filter_map(|r| match r {
                            Reply::Bulk(m) => Some(m.clone()),
                            _ => None,
                        })
                        .collect(),
                    _ => Vec::new(),
                };
                let wrote = !popped.is_empty();
                for member in popped {
                    self.members.remove(&member);
                }
                Outcome { reply: Some(reply), wrote }
            }
            SetCmd::Scan { cursor, pattern, count } => {
                let mut members: Vec<&String> = self.members.iter().collect();
                members.sort();
                let page: Vec<Reply> = members
                    .iter()
                    .skip(cursor)
                    .take(count)
                    .filter(|m| pattern.as_deref().map_or(true, |p| glob_match(p, m)))
                    .map(|m| Reply::Bulk((*m).clone()))
                    .collect();
                let next = if cursor + count >= members.len() { 0 } else { cursor + count };
                Outcome::read(Reply::Array(vec![
                    Reply::Bulk(next.to_string()),
                    Reply::Array(page),
                ]))
            }
            SetCmd::Move { destination, member } => {
                if self.members.remove(&member) {
                    ctx.route("sadd", &destination, vec![member]);
                    Outcome::wrote(Reply::Bool(true))
                } else {
                    Outcome::read(Reply::Bool(false))
                }
            }
            SetCmd::Store(members) => {
                self.members = members.into_iter().collect();
                Outcome::wrote(Reply::Int(self.members.len() as i64))
            }
            SetCmd::Sort(spec) => {
                let members: Vec<String> = self.members.iter().cloned().collect();
                Outcome::read(spec.run(members)?)
            }
        })
    }

    fn store_command(&self) -> (&'static str, Vec<String>) {
        ("_sstore", self.members.iter().cloned().collect())
    }
}

impl SetValue {
    /// `None` count: one random member as a bulk reply. `Some(n)`: up to
    /// `|n|` members as an array, distinct for positive counts.
    fn random_members(&self, count: Option<i64>) -> Reply {
        let mut rng = rand::thread_rng();
        match count {
            None => self
                .members
                .iter()
                .choose(&mut rng)
                .map_or(Reply::Nil, |m| Reply::Bulk(m.clone())),
            Some(n) if n >= 0 => {
                let picked = self
                    .members
                    .iter()
                    .choose_multiple(&mut rng, n as usize);
                Reply::Array(picked.into_iter().map(|m| Reply::Bulk(m.clone())).collect())
            }
            Some(n) => {
                // Negative count allows repeats.
                let mut picked = Vec::new();
                for _ in 0..n.unsigned_abs() {
                    match self.members.iter().choose(&mut rng) {
                        Some(m) => picked.push(Reply::Bulk(m.clone())),
                        None => break,
                    }
                }
                Reply::Array(picked)
            }
        }
    }
}

/// `SORT` options shared by lists and sets.
pub(crate) struct SortSpec {
    alpha: bool,
    descending: bool,
    limit: Option<(usize, usize)>,
}

impl SortSpec {
    pub(crate) fn parse(args: &[String]) -> ServerResult<SortSpec> {
        let mut spec = SortSpec { alpha: false, descending: false, limit: None };
        let mut i = 0;
        while i < args.len() {
            match args[i].to_uppercase().as_str() {
                "ALPHA" => spec.alpha = true,
                "ASC" => spec.descending = false,
                "DESC" => spec.descending = true,
                "LIMIT" => {
                    let offset = args.get(i + 1).ok_or(ServerError::Syntax)?;
                    let count = args.get(i + 2).ok_or(ServerError::Syntax)?;
                    spec.limit = Some((
                        offset.parse().map_err(|_| ServerError::Syntax)?,
                        count.parse().map_err(|_| ServerError::Syntax)?,
                    ));
                    i += 2;
                }
                _ => return Err(ServerError::Syntax),
            }
            i += 1;
        }
        Ok(spec)
    }

    pub(crate) fn run(&self, mut items: Vec<String>) -> ServerResult<Reply> {
        if self.alpha {
            items.sort();
        } else {
            let mut keyed: Vec<(f64, String)> = Vec::with_capacity(items.len());
            for item in items {
                let weight: f64 = item.parse().map_err(|_| {
                    ServerError::Generic("One or more scores can't be converted into double".into())
                })?;
                keyed.push((weight, item));
            }
            keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
            items = keyed.into_iter().map(|(_, item)| item).collect();
        }
        if self.descending {
            items.reverse();
        }
        if let Some((offset, count)) = self.limit {
            items = items.into_iter().skip(offset).take(count).collect();
        }
        Ok(Reply::Array(items.into_iter().map(Reply::Bulk).collect()))
    }
}

/// Common `cursor [MATCH pattern] [COUNT n]` argument shape.
pub(crate) fn parse_scan(args: &[String]) -> ServerResult<(usize, Option<String>, usize)> {
    let cursor = args
        .first()
        .and_then(|s| s.parse().ok())
        .ok_or(ServerError::Syntax)?;
    let mut pattern = None;
    let mut count = 10;
    let mut i = 1;
    while i < args.len() {
        match args[i].to_uppercase().as_str() {
            "MATCH" => {
                pattern = Some(args.get(i + 1).ok_or(ServerError::Syntax)?.clone());
                i += 1;
            }
            "COUNT" => {
                count = args
                    .get(i + 1)
                    .and_then(|s| s.parse().ok())
                    .filter(|&n| n > 0)
                    .ok_or(ServerError::Syntax)?;
                i += 1;
            }
            _ => return Err(ServerError::Syntax),
        }
        i += 1;
    }
    Ok((cursor, pattern, count))
}
