//! Sorted set values.
//!
//! Two indices are kept consistent on every mutation: member to score for
//! lookups and lex ranges, and `(score, member)` for rank and score
//! ranges. Ties on score order by member ascending. Scores are integers;
//! exclusive score bounds shift the inclusive bound by one.

use crate::commands::NodeKind;
use crate::error::{ServerError, ServerResult};
use crate::resp::Reply;
use crate::routing::Payload;
use crate::snapshot::{put_i64, put_str, put_u32, Reader};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::ops::Bound;

use super::{clamp_index, int_arg, NodeCtx, Outcome, Value};

#[derive(Debug, Default)]
pub struct ZsetValue {
    by_member: BTreeMap<String, i64>,
    by_score: BTreeSet<(i64, String)>,
}

enum ZsetCmd {
    Add(Vec<(i64, String)>),
    Rem(Vec<String>),
    Card,
    Score(String),
    IncrBy(i64, String),
    Rank { member: String, rev: bool },
    Range { start: i64, stop: i64, withscores: bool, rev: bool },
    RangeByScore { min: i64, max: i64, withscores: bool, limit: Option<(usize, usize)>, rev: bool },
    RangeByLex { min: LexBound, max: LexBound, limit: Option<(usize, usize)>, rev: bool },
    Count(i64, i64),
    LexCount(LexBound, LexBound),
    RemRangeByRank(i64, i64),
    RemRangeByScore(i64, i64),
    RemRangeByLex(LexBound, LexBound),
    Get,
    Store(Vec<(i64, String)>),
}

#[derive(Debug, Clone)]
enum LexBound {
    Open,
    Inclusive(String),
    Exclusive(String),
}

impl ZsetCmd {
    fn parse(payload: &Payload) -> ServerResult<ZsetCmd> {
        let args = &payload.args;
        Ok(match payload.command.as_str() {
            "zadd" => ZsetCmd::Add(score_pairs(payload)?),
            "zrem" => ZsetCmd::Rem(args.clone()),
            "zcard" => ZsetCmd::Card,
            "zscore" => ZsetCmd::Score(args[0].clone()),
            "zincrby" => ZsetCmd::IncrBy(int_arg(&args[0])?, args[1].clone()),
            "zrank" => ZsetCmd::Rank { member: args[0].clone(), rev: false },
            "zrevrank" => ZsetCmd::Rank { member: args[0].clone(), rev: true },
            "zrange" | "zrevrange" => ZsetCmd::Range {
                start: int_arg(&args[0])?,
                stop: int_arg(&args[1])?,
                withscores: parse_withscores(&args[2..])?,
                rev: payload.command == "zrevrange",
            },
            "zrangebyscore" | "zrevrangebyscore" => {
                let rev = payload.command == "zrevrangebyscore";
                // The reversed form takes max first.
                let (lo, hi) = if rev { (&args[1], &args[0]) } else { (&args[0], &args[1]) };
                let (withscores, limit) = parse_range_options(&args[2..])?;
                ZsetCmd::RangeByScore {
                    min: score_bound(lo, true)?,
                    max: score_bound(hi, false)?,
                    withscores,
                    limit,
                    rev,
                }
            }
            "zrangebylex" | "zrevrangebylex" => {
                let rev = payload.command == "zrevrangebylex";
                let (lo, hi) = if rev { (&args[1], &args[0]) } else { (&args[0], &args[1]) };
                let (_, limit) = parse_range_options(&args[2..])?;
                ZsetCmd::RangeByLex {
                    min: lex_bound(lo)?,
                    max: lex_bound(hi)?,
                    limit,
                    rev,
                }
            }
            "zcount" => ZsetCmd::Count(score_bound(&args[0], true)?, score_bound(&args[1], false)?),
            "zlexcount" => ZsetCmd::LexCount(lex_bound(&args[0])?, lex_bound(&args[1])?),
            "zremrangebyrank" => ZsetCmd::RemRangeByRank(int_arg(&args[0])?, int_arg(&args[1])?),
            "zremrangebyscore" => ZsetCmd::RemRangeByScore(
                score_bound(&args[0], true)?,
                score_bound(&args[1], false)?,
            ),
            "zremrangebylex" => {
                ZsetCmd::RemRangeByLex(lex_bound(&args[0])?, lex_bound(&args[1])?)
            }
            "_zget" => ZsetCmd::Get,
            "_zstore" => ZsetCmd::Store(score_pairs(payload)?),
            other => return Err(ServerError::Generic(format!("unexpected command '{other}'"))),
        })
    }
}

fn score_pairs(payload: &Payload) -> ServerResult<Vec<(i64, String)>> {
    payload
        .pairs()
        .into_iter()
        .map(|(score, member)| Ok((int_arg(&score)?, member)))
        .collect()
}

/// Score bound: `-inf`/`+inf`, `(n` exclusive, or a plain integer.
fn score_bound(token: &str, is_min: bool) -> ServerResult<i64> {
    match token {
        "-inf" => Ok(i64::MIN),
        "+inf" | "inf" => Ok(i64::MAX),
        _ => {
            if let Some(rest) = token.strip_prefix('(') {
                let n = int_arg(rest)?;
                Ok(if is_min { n.saturating_add(1) } else { n.saturating_sub(1) })
            } else {
                int_arg(token)
            }
        }
    }
}

/// Lex bound: `-`/`+` unbounded, `[x` inclusive, `(x` exclusive.
fn lex_bound(token: &str) -> ServerResult<LexBound> {
    match token {
        "-" | "+" => Ok(LexBound::Open),
        _ => {
            if let Some(rest) = token.strip_prefix('[') {
                Ok(LexBound::Inclusive(rest.to_string()))
            } else if let Some(rest) = token.strip_prefix('(') {
                Ok(LexBound::Exclusive(rest.to_string()))
            } else {
                Err(ServerError::Syntax)
            }
        }
    }
}

fn parse_withscores(rest: &[String]) -> ServerResult<bool> {
    match rest {
        [] => Ok(false),
        [token] if token.eq_ignore_ascii_case("withscores") => Ok(true),
        _ => Err(ServerError::Syntax),
    }
}

fn parse_range_options(rest: &[String]) -> ServerResult<(bool, Option<(usize, usize)>)> {
    let mut withscores = false;
    let mut limit = None;
    let mut i = 0;
    while i < rest.len() {
        match rest[i].to_uppercase().as_str() {
            "WITHSCORES" => withscores = true,
            "LIMIT" => {
                let offset = rest.get(i + 1).ok_or(ServerError::Syntax)?;
                let count = rest.get(i + 2).ok_or(ServerError::Syntax)?;
                limit = Some((
                    offset.parse().map_err(|_| ServerError::Syntax)?,
                    count.parse().map_err(|_| ServerError::Syntax)?,
                ));
                i += 2;
            }
            _ => return Err(ServerError::Syntax),
        }
        i += 1;
    }
    Ok((withscores, limit))
}

impl Value for ZsetValue {
    const KIND: NodeKind = NodeKind::SortedSet;

    fn new(_ctx: &NodeCtx) -> Self {
        ZsetValue::default()
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.by_score.len() as u32);
        for (score, member) in &self.by_score {
            put_i64(buf, *score);
            put_str(buf, member);
        }
    }

    fn decode(_ctx: &NodeCtx, reader: &mut Reader) -> io::Result<Self> {
        let count = reader.u32()?;
        let mut value = ZsetValue::default();
        for _ in 0..count {
            let score = reader.i64()?;
            let member = reader.str()?;
            value.add(member, score);
        }
        Ok(value)
    }

    fn apply(&mut self, _ctx: &NodeCtx, payload: &Payload) -> ServerResult<Outcome> {
        Ok(match ZsetCmd::parse(payload)? {
            ZsetCmd::Add(pairs) => {
                let mut added = 0;
                for (score, member) in pairs {
                    if self.add(member, score) {
                        added += 1;
                    }
                }
                Outcome::wrote(Reply::Int(added))
            }
            ZsetCmd::Rem(members) => {
                let mut removed = 0;
                for member in &members {
                    if self.remove(member) {
                        removed += 1;
                    }
                }
                Outcome { reply: Some(Reply::Int(removed)), wrote: removed > 0 }
            }
            ZsetCmd::Card => Outcome::read(Reply::Int(self.len() as i64)),
            ZsetCmd::Score(member) => Outcome::read(
                self.by_member
                    .get(&member)
                    .map_or(Reply::Nil, |s| Reply::Bulk(s.to_string())),
            ),
            ZsetCmd::IncrBy(delta, member) => {
                let current = self.by_member.get(&member).copied().unwrap_or(0);
                let new = current.checked_add(delta).ok_or_else(|| {
                    ServerError::Generic("increment or decrement would overflow".into())
                })?;
                self.add(member, new);
                Outcome::wrote(Reply::Bulk(new.to_string()))
            }
            ZsetCmd::Rank { member, rev } => Outcome::read(match self.rank(&member) {
                Some(rank) if rev => Reply::Int((self.len() - 1 - rank) as i64),
                Some(rank) => Reply::Int(rank as i64),
                None => Reply::Nil,
            }),
            ZsetCmd::Range { start, stop, withscores, rev } => {
                let len = self.len();
                let start = clamp_index(start, len);
                let stop = clamp_index(stop, len);
                let slice: Vec<(i64, String)> = if start > stop || start >= len {
                    Vec::new()
                } else {
                    let take = stop.min(len - 1) - start + 1;
                    if rev {
                        self.by_score
                            .iter()
                            .rev()
                            .skip(start)
                            .take(take)
                            .cloned()
                            .collect()
                    } else {
                        self.by_score.iter().skip(start).take(take).cloned().collect()
                    }
                };
                Outcome::read(render(slice, withscores))
            }
            ZsetCmd::RangeByScore { min, max, withscores, limit, rev } => {
                let mut slice = self.score_range(min, max);
                if rev {
                    slice.reverse();
                }
                Outcome::read(render(apply_limit(slice, limit), withscores))
            }
            ZsetCmd::RangeByLex { min, max, limit, rev } => {
                let mut slice = self.lex_range(&min, &max);
                if rev {
                    slice.reverse();
                }
                Outcome::read(Reply::Array(
                    apply_limit(slice, limit)
                        .into_iter()
                        .map(|(_, member)| Reply::Bulk(member))
                        .collect(),
                ))
            }
            ZsetCmd::Count(min, max) => {
                Outcome::read(Reply::Int(self.score_range(min, max).len() as i64))
            }
            ZsetCmd::LexCount(min, max) => {
                Outcome::read(Reply::Int(self.lex_range(&min, &max).len() as i64))
            }
            ZsetCmd::RemRangeByRank(start, stop) => {
                let len = self.len();
                let start = clamp_index(start, len);
                let stop = clamp_index(stop, len);
                let doomed: Vec<String> = if start > stop || start >= len {
                    Vec::new()
                } else {
                    self.by_score
                        .iter()
                        .skip(start)
                        .take(stop.min(len - 1) - start + 1)
                        .map(|(_, member)| member.clone())
                        .collect()
                };
                Outcome::wrote(Reply::Int(self.remove_all(doomed)))
            }
            ZsetCmd::RemRangeByScore(min, max) => {
                let doomed: Vec<String> = self
                    .score_range(min, max)
                    .into_iter()
                    .map(|(_, member)| member)
                    .collect();
                Outcome::wrote(Reply::Int(self.remove_all(doomed)))
            }
            ZsetCmd::RemRangeByLex(min, max) => {
                let doomed: Vec<String> = self
                    .lex_range(&min, &max)
                    .into_iter()
                    .map(|(_, member)| member)
                    .collect();
                Outcome::wrote(Reply::Int(self.remove_all(doomed)))
            }
            ZsetCmd::Get => {
                Outcome::read(Reply::Scores(self.by_score.iter().cloned().collect()))
            }
            ZsetCmd::Store(pairs) => {
                self.by_member.clear();
                self.by_score.clear();
                for (score, member) in pairs {
                    self.add(member, score);
                }
                Outcome::wrote(Reply::Int(self.len() as i64))
            }
        })
    }

    fn store_command(&self) -> (&'static str, Vec<String>) {
        let mut args = Vec::with_capacity(self.len() * 2);
        for (score, member) in &self.by_score {
            args.push(score.to_string());
            args.push(member.clone());
        }
        ("_zstore", args)
    }
}

impl ZsetValue {
    pub fn len(&self) -> usize {
        self.by_member.len()
    }

    /// Insert or re-score a member. Returns whether it was new.
    fn add(&mut self, member: String, score: i64) -> bool {
        let new = match self.by_member.insert(member.clone(), score) {
            Some(old) => {
                self.by_score.remove(&(old, member.clone()));
                false
            }
            None => true,
        };
        self.by_score.insert((score, member));
        new
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.by_member.remove(member) {
            Some(score) => {
                self.by_score.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn remove_all(&mut self, members: Vec<String>) -> i64 {
        let mut removed = 0;
        for member in members {
            if self.remove(&member) {
                removed += 1;
            }
        }
        removed
    }

    fn rank(&self, member: &str) -> Option<usize> {
        let score = *self.by_member.get(member)?;
        Some(self.by_score.range(..(score, member.to_string())).count())
    }

    /// Members with `min <= score <= max`, in score order.
    fn score_range(&self, min: i64, max: i64) -> Vec<(i64, String)> {
        if min > max {
            return Vec::new();
        }
        self.by_score
            .range((min, String::new())..)
            .take_while(|(score, _)| *score <= max)
            .cloned()
            .collect()
    }

    /// Members between two lex bounds, in member order.
    fn lex_range(&self, min: &LexBound, max: &LexBound) -> Vec<(i64, String)> {
        let lower: Bound<&String> = match min {
            LexBound::Open => Bound::Unbounded,
            LexBound::Inclusive(s) => Bound::Included(s),
            LexBound::Exclusive(s) => Bound::Excluded(s),
        };
        let upper: Bound<&String> = match max {
            LexBound::Open => Bound::Unbounded,
            LexBound::Inclusive(s) => Bound::Included(s),
            LexBound::Exclusive(s) => Bound::Excluded(s),
        };
        // BTreeMap::range panics on inverted bounds, and on equal bounds
        // when both are exclusive.
        match (&lower, &upper) {
            (Bound::Included(lo) | Bound::Excluded(lo), Bound::Included(hi) | Bound::Excluded(hi))
                if lo > hi =>
            {
                return Vec::new()
            }
            (Bound::Excluded(lo), Bound::Excluded(hi)) if lo == hi => return Vec::new(),
            _ => {}
        }
        self.by_member
            .range::<String, _>((lower, upper))
            .map(|(member, score)| (*score, member.clone()))
            .collect()
    }
}

fn apply_limit(slice: Vec<(i64, String)>, limit: Option<(usize, usize)>) -> Vec<(i64, String)> {
    match limit {
        Some((offset, count)) => slice.into_iter().skip(offset).take(count).collect(),
        None => slice,
    }
}

fn render(slice: Vec<(i64, String)>, withscores: bool) -> Reply {
    Reply::Array(if withscores {
        slice
            .into_iter()
            .flat_map(|(score, member)| [Reply::Bulk(member), Reply::Bulk(score.to_string())])
            .collect()
    } else {
        slice.into_iter().map(|(_, member)| Reply::Bulk(member)).collect()
    })
}
