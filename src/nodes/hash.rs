//! Hash values: a field map with counter helpers.

use crate::commands::NodeKind;
use crate::error::{ServerError, ServerResult};
use crate::resp::Reply;
use crate::routing::Payload;
use crate::snapshot::{put_str, put_u32, Reader};
use std::collections::HashMap;
use std::io;

use super::string::format_float;
use super::{float_arg, int_arg, NodeCtx, Outcome, Value};

#[derive(Debug, Default)]
pub struct HashValue {
    fields: HashMap<String, String>,
}

enum HashCmd {
    Set(Vec<(String, String)>),
    SetNx(String, String),
    MSet(Vec<(String, String)>),
    Get(String),
    MGet(Vec<String>),
    GetAll,
    Del(Vec<String>),
    Keys,
    Vals,
    Len,
    Exists(String),
    IncrBy(String, i64),
    IncrByFloat(String, f64),
    Scan { cursor: usize, pattern: Option<String>, count: usize },
    Store(Vec<(String, String)>),
}

impl HashCmd {
    fn parse(payload: &Payload) -> ServerResult<HashCmd> {
        let args = &payload.args;
        Ok(match payload.command.as_str() {
            "hset" => HashCmd::Set(payload.pairs()),
            "hsetnx" => HashCmd::SetNx(args[0].clone(), args[1].clone()),
            "hmset" => HashCmd::MSet(payload.pairs()),
            "hget" => HashCmd::Get(args[0].clone()),
            "hmget" => HashCmd::MGet(args.clone()),
            "hgetall" => HashCmd::GetAll,
            "hdel" => HashCmd::Del(args.clone()),
            "hkeys" => HashCmd::Keys,
            "hvals" => HashCmd::Vals,
            "hlen" => HashCmd::Len,
            "hexists" => HashCmd::Exists(args[0].clone()),
            "hincrby" => HashCmd::IncrBy(args[0].clone(), int_arg(&args[1])?),
            "hincrbyfloat" => HashCmd::IncrByFloat(args[0].clone(), float_arg(&args[1])?),
            "hscan" => {
                let (cursor, pattern, count) = super::set::parse_scan(args)?;
                HashCmd::Scan { cursor, pattern, count }
            }
            "_hstore" => HashCmd::Store(payload.pairs()),
            other => return Err(ServerError::Generic(format!("unexpected command '{other}'"))),
        })
    }
}

impl Value for HashValue {
    const KIND: NodeKind = NodeKind::Hash;

    fn new(_ctx: &NodeCtx) -> Self {
        HashValue::default()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.fields.len() as u32);
        for (field, value) in &self.fields {
            put_str(buf, field);
            put_str(buf, value);
        }
    }

    fn decode(_ctx: &NodeCtx, reader: &mut Reader) -> io::Result<Self> {
        let count = reader.u32()?;
        let mut fields = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let field = reader.str()?;
            let value = reader.str()?;
            fields.insert(field, value);
        }
        Ok(HashValue { fields })
    }

    fn apply(&mut self, _ctx: &NodeCtx, payload: &Payload) -> ServerResult<Outcome> {
        Ok(match HashCmd::parse(payload)? {
            HashCmd::Set(pairs) => {
                let mut added = 0;
                for (field, value) in pairs {
                    if self.fields.insert(field, value).is_none() {
                        added += 1;
                    }
                }
                Outcome::wrote(Reply::Int(added))
            }
            HashCmd::SetNx(field, value) => {
                if self.fields.contains_key(&field) {
                    Outcome::read(Reply::Bool(false))
                } else {
                    self.fields.insert(field, value);
                    Outcome::wrote(Reply::Bool(true))
                }
            }
            HashCmd::MSet(pairs) | HashCmd::Store(pairs) => {
                if payload.command == "_hstore" {
                    self.fields.clear();
                }
                for (field, value) in pairs {
                    self.fields.insert(field, value);
                }
                Outcome::wrote(Reply::Ok)
            }
            HashCmd::Get(field) => Outcome::read(
                self.fields
                    .get(&field)
                    .map_or(Reply::Nil, |v| Reply::Bulk(v.clone())),
            ),
            HashCmd::MGet(fields) => Outcome::read(Reply::Array(
                fields
                    .iter()
                    .map(|f| self.fields.get(f).map_or(Reply::Nil, |v| Reply::Bulk(v.clone())))
                    .collect(),
            )),
            HashCmd::GetAll => {
                let mut entries: Vec<(&String, &String)> = self.fields.iter().collect();
                entries.sort();
                Outcome::read(Reply::Array(
                    entries
                        .into_iter()
                        .flat_map(|(f, v)| [Reply::Bulk(f.clone()), Reply::Bulk(v.clone())])
                        .collect(),
                ))
            }
            HashCmd::Del(fields) => {
                let mut removed = 0;
                for field in &fields {
                    if self.fields.remove(field).is_some() {
                        removed += 1;
                    }
                }
                Outcome { reply: Some(Reply::Int(removed)), wrote: removed > 0 }
            }
            HashCmd::Keys => {
                let mut keys: Vec<&String> = self.fields.keys().collect();
                keys.sort();
                Outcome::read(Reply::Array(
                    keys.into_iter().map(|f| Reply::Bulk(f.clone())).collect(),
                ))
            }
            HashCmd::Vals => {
                let mut entries: Vec<(&String, &String)> = self.fields.iter().collect();
                entries.sort();
                Outcome::read(Reply::Array(
                    entries.into_iter().map(|(_, v)| Reply::Bulk(v.clone())).collect(),
                ))
            }
            HashCmd::Len => Outcome::read(Reply::Int(self.fields.len() as i64)),
            HashCmd::Exists(field) => {
                Outcome::read(Reply::Bool(self.fields.contains_key(&field)))
            }
            HashCmd::IncrBy(field, delta) => {
                let current: i64 = match self.fields.get(&field) {
                    Some(v) => v.parse().map_err(|_| ServerError::NotInteger)?,
                    None => 0,
                };
                let new = current.checked_add(delta).ok_or_else(|| {
                    ServerError::Generic("increment or decrement would overflow".into())
                })?;
                self.fields.insert(field, new.to_string());
                Outcome::wrote(Reply::Int(new))
            }
            HashCmd::IncrByFloat(field, delta) => {
                let current: f64 = match self.fields.get(&field) {
                    Some(v) => v.parse().map_err(|_| ServerError::NotFloat)?,
                    None => 0.0,
                };
                let new = current + delta;
                if new.is_nan() || new.is_infinite() {
                    return Err(ServerError::Generic(
                        "increment would produce NaN or Infinity".into(),
                    ));
                }
                let formatted = format_float(new);
                self.fields.insert(field, formatted.clone());
                Outcome::wrote(Reply::Bulk(formatted))
            }
            HashCmd::Scan { cursor, pattern, count } => {
                let mut keys: Vec<&String> = self.fields.keys().collect();
                keys.sort();
                let page: Vec<Reply> = keys
                    .iter()
                    .skip(cursor)
                    .take(count)
                    .filter(|f| {
                        pattern
                            .as_deref()
                            .map_or(true, |p| crate::glob::glob_match(p, f))
                    })
                    .flat_map(|f| {
                        [Reply::Bulk((*f).clone()), Reply::Bulk(self.fields[*f].clone())]
                    })
                    .collect();
                let next = if cursor + count >= keys.len() { 0 } else { cursor + count };
                Outcome::read(Reply::Array(vec![
                    Reply::Bulk(next.to_string()),
                    Reply::Array(page),
                ]))
            }
        })
    }

    fn store_command(&self) -> (&'static str, Vec<String>) {
        let mut args = Vec::with_capacity(self.fields.len() * 2);
        for (field, value) in &self.fields {
            args.push(field.clone());
            args.push(value.clone());
        }
        ("_hstore", args)
    }
}
