//! Scatter/gather aggregators for multi-key commands.
//!
//! Each aggregator is an ephemeral task: it fans single-key commands out
//! through the router with its own mailbox as the reply destination,
//! collects until the expected count is reached, reduces, answers the
//! client once, and stops. Responses are keyed by originating key; a key
//! that appears twice in a request pre-claims two reply slots, filled in
//! arrival order. A deadline bounds every aggregator so a silent
//! partition surfaces as `ERR timeout` instead of a hang.

use crate::error::{ServerError, ServerResult};
use crate::nodes::hyperloglog::{to_hex, HllValue};
use crate::nodes::set::parse_scan;
use crate::resp::Reply;
use crate::routing::{Delivery, Payload, Router};
use rand::seq::IteratorRandom;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;

const DEADLINE: Duration = Duration::from_secs(5);

/// Spawn the aggregator for a validated multi-key command.
pub fn dispatch(payload: Payload, router: Router) {
    tokio::spawn(async move {
        let reply = match tokio::time::timeout(DEADLINE, run(&payload, &router)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => e.into_reply(),
            Err(_) => ServerError::Timeout.into_reply(),
        };
        payload.respond(reply);
    });
}

async fn run(payload: &Payload, router: &Router) -> ServerResult<Reply> {
    let db = payload.db.as_str();
    let args = &payload.args;
    match payload.command.as_str() {
        "mget" => {
            let keys = with_lead_key(payload);
            let replies = scatter(router, db, "get", &keys, |_| Vec::new()).await?;
            Ok(Reply::Array(
                replies
                    .into_iter()
                    .map(|r| match r {
                        Reply::Bulk(v) => Reply::Bulk(v),
                        _ => Reply::Nil,
                    })
                    .collect(),
            ))
        }
        "mset" => {
            for (key, value) in payload.pairs() {
                router.route(Payload::new("set", db, key, vec![value], None));
            }
            Ok(Reply::Ok)
        }
        "msetnx" => {
            let keys: Vec<String> = payload.pairs().into_iter().map(|(k, _)| k).collect();
            let replies = scatter(router, db, "exists", &keys, |_| Vec::new()).await?;
            if replies.iter().any(truthy) {
                return Ok(Reply::Int(0));
            }
            for (key, value) in payload.pairs() {
                router.route(Payload::new("set", db, key, vec![value], None));
            }
            Ok(Reply::Int(1))
        }
        "del" => {
            let keys = with_lead_key(payload);
            let replies = scatter(router, db, "_del", &keys, |_| Vec::new()).await?;
            Ok(Reply::Int(replies.iter().filter(|r| truthy(r)).count() as i64))
        }
        "sdiff" | "sinter" | "sunion" => {
            let keys = with_lead_key(payload);
            let folded = set_algebra(router, db, &payload.command, &keys).await?;
            match folded {
                Ok(members) => Ok(Reply::Array(members.into_iter().map(Reply::Bulk).collect())),
                Err(error) => Ok(error),
            }
        }
        "sdiffstore" | "sinterstore" | "sunionstore" => {
            let op = payload.command.trim_end_matches("store");
            match set_algebra(router, db, op, args).await? {
                Ok(members) => {
                    let size = members.len() as i64;
                    router.route(Payload::new(
                        "_sstore",
                        db,
                        payload.key.clone(),
                        members.into_iter().collect(),
                        None,
                    ));
                    Ok(Reply::Int(size))
                }
                Err(error) => Ok(error),
            }
        }
        "zunionstore" | "zinterstore" => zstore(payload, router).await,
        "bitop" => bitop(payload, router).await,
        "pfcount" => {
            let keys = with_lead_key(payload);
            let replies = scatter(router, db, "_pfcount", &keys, |_| Vec::new()).await?;
            // Per-key estimates are summed, not union-merged.
            Ok(Reply::Int(replies.iter().map(int_value).sum()))
        }
        "pfmerge" => {
            let keys = with_lead_key(payload);
            let replies = scatter(router, db, "_pfget", &keys, |_| Vec::new()).await?;
            let mut merged: Option<HllValue> = None;
            for reply in replies {
                if let Reply::Sketch(bytes) = reply {
                    if let Some(sketch) = HllValue::from_bytes(&bytes) {
                        match merged.as_mut() {
                            Some(acc) => acc.merge(&sketch),
                            None => merged = Some(sketch),
                        }
                    }
                }
            }
            let store_args = merged.map(|m| vec![to_hex(&m.to_bytes())]).unwrap_or_default();
            router.route(Payload::new("_pfstore", db, payload.key.clone(), store_args, None));
            Ok(Reply::Ok)
        }
        "keys" => {
            let pattern = args.first().cloned().unwrap_or_else(|| "*".to_string());
            Ok(Reply::Array(
                all_keys(router, db, &pattern).await?.into_iter().map(Reply::Bulk).collect(),
            ))
        }
        "scan" => {
            let (cursor, pattern, count) = parse_scan(args)?;
            let keys = all_keys(router, db, pattern.as_deref().unwrap_or("*")).await?;
            let page: Vec<Reply> =
                keys.iter().skip(cursor).take(count).cloned().map(Reply::Bulk).collect();
            let next = if cursor + count >= keys.len() { 0 } else { cursor + count };
            Ok(Reply::Array(vec![
                Reply::Bulk(next.to_string()),
                Reply::Array(page),
            ]))
        }
        "dbsize" => {
            let replies = survey(router, db, "dbsize", Vec::new()).await?;
            Ok(Reply::Int(replies.iter().map(int_value).sum()))
        }
        "randomkey" => {
            let replies = survey(router, db, "randomkey", Vec::new()).await?;
            let candidates: Vec<String> = replies
                .into_iter()
                .filter_map(|r| match r {
                    Reply::Bulk(key) => Some(key),
                    _ => None,
                })
                .collect();
            let mut rng = rand::thread_rng();
            Ok(candidates.into_iter().choose(&mut rng).map_or(Reply::Nil, Reply::Bulk))
        }
        "flushdb" | "flushall" => {
            survey(router, db, &payload.command, Vec::new()).await?;
            Ok(Reply::Ok)
        }
        "pubsub" => pubsub(payload, router).await,
        "renamenx" => {
            let destination = args.first().cloned().ok_or(ServerError::Syntax)?;
            let exists =
                scatter(router, db, "exists", &[destination.clone()], |_| Vec::new()).await?;
            if exists.iter().any(truthy) {
                return Ok(Reply::Int(0));
            }
            let renamed = scatter(router, db, "rename", &[payload.key.clone()], |_| {
                vec![destination.clone()]
            })
            .await?;
            match renamed.into_iter().next() {
                Some(Reply::Error(e)) => Ok(Reply::Error(e)),
                _ => Ok(Reply::Int(1)),
            }
        }
        other => Err(ServerError::UnknownCommand(other.to_string())),
    }
}

/// Keyed multi-key commands carry their first key in the key slot.
fn with_lead_key(payload: &Payload) -> Vec<String> {
    let mut keys = Vec::with_capacity(payload.args.len() + 1);
    keys.push(payload.key.clone());
    keys.extend(payload.args.iter().cloned());
    keys
}

fn truthy(reply: &Reply) -> bool {
    matches!(reply, Reply::Bool(true) | Reply::Int(1))
}

fn int_value(reply: &Reply) -> i64 {
    match reply {
        Reply::Int(n) => *n,
        Reply::Bool(b) => i64::from(*b),
        _ => 0,
    }
}

/// Route one command per key and collect every reply, in key order.
async fn scatter(
    router: &Router,
    db: &str,
    command: &str,
    keys: &[String],
    args_for: impl Fn(&str) -> Vec<String>,
) -> ServerResult<Vec<Reply>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut slots: HashMap<&str, VecDeque<usize>> = HashMap::new();
    for (index, key) in keys.iter().enumerate() {
        slots.entry(key.as_str()).or_default().push_back(index);
    }
    for key in keys {
        router.route(Payload::new(command, db, key.clone(), args_for(key), Some(tx.clone())));
    }
    drop(tx);

    let mut results: Vec<Option<Reply>> = vec![None; keys.len()];
    let mut filled = 0;
    while filled < keys.len() {
        match rx.recv().await {
            Some(Delivery::Response { key, reply }) => {
                if let Some(slot) = slots.get_mut(key.as_str()).and_then(VecDeque::pop_front) {
                    results[slot] = Some(reply);
                    filled += 1;
                }
            }
            Some(_) => {}
            None => return Err(ServerError::Timeout),
        }
    }
    Ok(results.into_iter().map(|r| r.unwrap_or(Reply::Nil)).collect())
}

/// Broadcast one command and collect one reply per partition.
async fn survey(
    router: &Router,
    db: &str,
    command: &str,
    args: Vec<String>,
) -> ServerResult<Vec<Reply>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    router.broadcast(Payload::new(command, db, "", args, Some(tx.clone())));
    drop(tx);

    let mut replies = Vec::with_capacity(router.partition_count());
    while replies.len() < router.partition_count() {
        match rx.recv().await {
            Some(Delivery::Response { reply, .. }) => replies.push(reply),
            Some(_) => {}
            None => return Err(ServerError::Timeout),
        }
    }
    Ok(replies)
}

async fn all_keys(router: &Router, db: &str, pattern: &str) -> ServerResult<Vec<String>> {
    let replies = survey(router, db, "keys", vec![pattern.to_string()]).await?;
    let mut keys: Vec<String> = replies
        .into_iter()
        .flat_map(|reply| match reply {
            Reply::Array(items) => items,
            _ => Vec::new(),
        })
        .filter_map(|item| match item {
            Reply::Bulk(key) => Some(key),
            _ => None,
        })
        .collect();
    keys.sort();
    Ok(keys)
}

/// Left-fold of SMEMBERS results. The outer result is transport failure;
/// the inner one surfaces a per-key error reply (WRONGTYPE) verbatim.
async fn set_algebra(
    router: &Router,
    db: &str,
    op: &str,
    keys: &[String],
) -> ServerResult<Result<BTreeSet<String>, Reply>> {
    let replies = scatter(router, db, "smembers", keys, |_| Vec::new()).await?;
    let mut folded: Option<BTreeSet<String>> = None;
    for reply in replies {
        let members: BTreeSet<String> = match reply {
            Reply::Array(items) => items
                .into_iter()
                .filter_map(|item| match item {
                    Reply::Bulk(member) => Some(member),
                    _ => None,
                })
                .collect(),
            Reply::Error(e) => return Ok(Err(Reply::Error(e))),
            _ => BTreeSet::new(),
        };
        folded = Some(match folded {
            None => members,
            Some(acc) => match op {
                "sdiff" => acc.difference(&members).cloned().collect(),
                "sinter" => acc.intersection(&members).cloned().collect(),
                _ => acc.union(&members).cloned().collect(),
            },
        });
    }
    Ok(Ok(folded.unwrap_or_default()))
}

#[derive(Clone, Copy)]
enum Combine {
    Sum,
    Min,
    Max,
}

/// ZUNIONSTORE / ZINTERSTORE: gather `_zget` per source, combine with
/// WEIGHTS and AGGREGATE, store the result at the destination.
async fn zstore(payload: &Payload, router: &Router) -> ServerResult<Reply> {
    let args = &payload.args;
    let numkeys: usize = args
        .first()
        .and_then(|s| s.parse().ok())
        .filter(|&n| n > 0)
        .ok_or(ServerError::Syntax)?;
    if args.len() < 1 + numkeys {
        return Err(ServerError::Syntax);
    }
    let keys: Vec<String> = args[1..1 + numkeys].to_vec();

    let mut weights = vec![1i64; numkeys];
    let mut combine = Combine::Sum;
    let mut i = 1 + numkeys;
    while i < args.len() {
        match args[i].to_uppercase().as_str() {
            "WEIGHTS" => {
                for w in weights.iter_mut() {
                    i += 1;
                    *w = args
                        .get(i)
                        .and_then(|s| s.parse().ok())
                        .ok_or(ServerError::Syntax)?;
                }
            }
            "AGGREGATE" => {
                i += 1;
                combine = match args.get(i).map(|s| s.to_uppercase()) {
                    Some(ref s) if s == "SUM" => Combine::Sum,
                    Some(ref s) if s == "MIN" => Combine::Min,
                    Some(ref s) if s == "MAX" => Combine::Max,
                    _ => return Err(ServerError::Syntax),
                };
            }
            _ => return Err(ServerError::Syntax),
        }
        i += 1;
    }

    let replies = scatter(router, &payload.db, "_zget", &keys, |_| Vec::new()).await?;
    let mut acc: HashMap<String, (i64, usize)> = HashMap::new();
    for (index, reply) in replies.into_iter().enumerate() {
        let pairs = match reply {
            Reply::Scores(pairs) => pairs,
            _ => Vec::new(),
        };
        for (score, member) in pairs {
            let weighted = score.saturating_mul(weights[index]);
            acc.entry(member)
                .and_modify(|(total, seen)| {
                    *total = match combine {
                        Combine::Sum => total.saturating_add(weighted),
                        Combine::Min => (*total).min(weighted),
                        Combine::Max => (*total).max(weighted),
                    };
                    *seen += 1;
                })
                .or_insert((weighted, 1));
        }
    }
    if payload.command == "zinterstore" {
        acc.retain(|_, (_, seen)| *seen == numkeys);
    }

    let mut members: Vec<(i64, String)> =
        acc.into_iter().map(|(member, (score, _))| (score, member)).collect();
    members.sort();
    let size = members.len() as i64;
    let mut store_args = Vec::with_capacity(members.len() * 2);
    for (score, member) in members {
        store_args.push(score.to_string());
        store_args.push(member);
    }
    router.route(Payload::new("_zstore", &payload.db, payload.key.clone(), store_args, None));
    Ok(Reply::Int(size))
}

/// BITOP AND/OR/XOR/NOT over `_bget` bitsets.
async fn bitop(payload: &Payload, router: &Router) -> ServerResult<Reply> {
    let args = &payload.args;
    let op = args[0].to_uppercase();
    let destination = args[1].clone();
    let sources: Vec<String> = args[2..].to_vec();
    if op == "NOT" && sources.len() != 1 {
        return Err(ServerError::Generic(
            "BITOP NOT must be called with a single source key".into(),
        ));
    }
    if !matches!(op.as_str(), "AND" | "OR" | "XOR" | "NOT") {
        return Err(ServerError::Syntax);
    }

    let replies = scatter(router, &payload.db, "_bget", &sources, |_| Vec::new()).await?;
    let operands: Vec<BTreeSet<u64>> = replies
        .into_iter()
        .map(|reply| match reply {
            Reply::Bits(bits) => bits,
            _ => BTreeSet::new(),
        })
        .collect();
    let occupied = |bits: &BTreeSet<u64>| -> u64 {
        bits.iter().next_back().map_or(0, |&max| max / 8 + 1)
    };
    // The destination is as long as the longest operand, like a
    // zero-padded string would be.
    let length = operands.iter().map(occupied).max().unwrap_or(0);

    let result: BTreeSet<u64> = if op == "NOT" {
        let first = &operands[0];
        (0..length * 8).filter(|offset| !first.contains(offset)).collect()
    } else {
        let mut iter = operands.into_iter();
        let mut acc = iter.next().unwrap_or_default();
        for next in iter {
            acc = match op.as_str() {
                "AND" => acc.intersection(&next).cloned().collect(),
                "OR" => acc.union(&next).cloned().collect(),
                _ => acc.symmetric_difference(&next).cloned().collect(),
            };
        }
        acc
    };

    router.route(Payload::new(
        "_bstore",
        &payload.db,
        destination,
        result.iter().map(|b| b.to_string()).collect(),
        None,
    ));
    Ok(Reply::Int(length as i64))
}

/// PUBSUB CHANNELS / NUMSUB / NUMPAT.
async fn pubsub(payload: &Payload, router: &Router) -> ServerResult<Reply> {
    let args = &payload.args;
    match args[0].to_lowercase().as_str() {
        "channels" => {
            let pattern = args.get(1).cloned().unwrap_or_default();
            let replies = survey(router, &payload.db, "_channels", vec![pattern]).await?;
            let mut channels: Vec<String> = replies
                .into_iter()
                .flat_map(|reply| match reply {
                    Reply::Array(items) => items,
                    _ => Vec::new(),
                })
                .filter_map(|item| match item {
                    Reply::Bulk(channel) => Some(channel),
                    _ => None,
                })
                .collect();
            channels.sort();
            channels.dedup();
            Ok(Reply::Array(channels.into_iter().map(Reply::Bulk).collect()))
        }
        "numsub" => {
            let channels: Vec<String> = args[1..].to_vec();
            let replies =
                scatter(router, &payload.db, "_numsub", &channels, |_| Vec::new()).await?;
            let mut out = Vec::with_capacity(channels.len() * 2);
            for (channel, reply) in channels.into_iter().zip(replies) {
                out.push(Reply::Bulk(channel));
                out.push(Reply::Int(int_value(&reply)));
            }
            Ok(Reply::Array(out))
        }
        "numpat" => {
            // Every partition holds the full pattern registry.
            let replies = survey(router, &payload.db, "_numpat", Vec::new()).await?;
            Ok(Reply::Int(replies.iter().map(int_value).max().unwrap_or(0)))
        }
        _ => Err(ServerError::Syntax),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::keyspace;
    use crate::snapshot::SnapshotStore;
    use std::sync::Arc;

    /// A little mesh with several partitions so scatter really scatters.
    fn mesh(tag: &str) -> Router {
        let dir = std::env::temp_dir().join(format!("swarmkv-agg-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let snapshots = Arc::new(SnapshotStore::open(dir).unwrap());
        let config = Arc::new(Config { persist_after: -1, ..Config::default() });

        let mut pairs = Vec::new();
        let mut senders = Vec::new();
        for _ in 0..4 {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx.clone());
            pairs.push((tx, rx));
        }
        let router = Router::new(senders);
        for (index, (tx, rx)) in pairs.into_iter().enumerate() {
            keyspace::spawn(index, tx, rx, router.clone(), snapshots.clone(), config.clone());
        }
        router
    }

    async fn call(router: &Router, command: &str, key: &str, args: &[&str]) -> Reply {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let payload = Payload::new(
            command,
            "0",
            key,
            args.iter().map(|s| s.to_string()).collect(),
            Some(tx),
        );
        if crate::commands::is_aggregate(command) {
            dispatch(payload, router.clone());
        } else {
            router.route(payload);
        }
        loop {
            match tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .expect("reply timed out")
                .expect("channel closed")
            {
                Delivery::Response { reply, .. } => return reply,
                _ => continue,
            }
        }
    }

    fn bulks(items: &[&str]) -> Reply {
        Reply::Array(items.iter().map(|s| Reply::Bulk(s.to_string())).collect())
    }

    #[tokio::test]
    async fn mget_returns_values_and_nils_in_order() {
        let router = mesh("mget");
        call(&router, "set", "a", &["1"]).await;
        call(&router, "set", "c", &["3"]).await;
        assert_eq!(
            call(&router, "mget", "a", &["b", "c"]).await,
            Reply::Array(vec![Reply::Bulk("1".into()), Reply::Nil, Reply::Bulk("3".into())])
        );
    }

    #[tokio::test]
    async fn mget_duplicate_keys_keep_multiplicity() {
        let router = mesh("mget-dup");
        call(&router, "set", "a", &["1"]).await;
        assert_eq!(
            call(&router, "mget", "a", &["a", "a"]).await,
            Reply::Array(vec![
                Reply::Bulk("1".into()),
                Reply::Bulk("1".into()),
                Reply::Bulk("1".into())
            ])
        );
    }

    #[tokio::test]
    async fn mset_and_msetnx() {
        let router = mesh("mset");
        assert_eq!(call(&router, "mset", "", &["a", "1", "b", "2"]).await, Reply::Ok);
        assert_eq!(call(&router, "get", "a", &[]).await, Reply::Bulk("1".into()));
        assert_eq!(call(&router, "msetnx", "", &["b", "9", "c", "3"]).await, Reply::Int(0));
        assert_eq!(call(&router, "get", "c", &[]).await, Reply::Nil);
        assert_eq!(call(&router, "msetnx", "", &["c", "3", "d", "4"]).await, Reply::Int(1));
        assert_eq!(call(&router, "get", "d", &[]).await, Reply::Bulk("4".into()));
    }

    #[tokio::test]
    async fn del_counts_existing_keys_only() {
        let router = mesh("del");
        call(&router, "set", "a", &["1"]).await;
        call(&router, "set", "b", &["2"]).await;
        assert_eq!(call(&router, "del", "a", &["b", "ghost"]).await, Reply::Int(2));
        assert_eq!(call(&router, "exists", "a", &[]).await, Reply::Bool(false));
    }

    #[tokio::test]
    async fn set_algebra_matches_mathematics() {
        let router = mesh("algebra");
        call(&router, "sadd", "s1", &["a", "b", "c"]).await;
        call(&router, "sadd", "s2", &["b", "c", "d"]).await;
        assert_eq!(call(&router, "sunion", "s1", &["s2"]).await, bulks(&["a", "b", "c", "d"]));
        assert_eq!(call(&router, "sinter", "s1", &["s2"]).await, bulks(&["b", "c"]));
        assert_eq!(call(&router, "sdiff", "s1", &["s2"]).await, bulks(&["a"]));
        // Missing keys are empty sets.
        assert_eq!(call(&router, "sunion", "s1", &["ghost"]).await, bulks(&["a", "b", "c"]));
        assert_eq!(call(&router, "sinter", "s1", &["ghost"]).await, bulks(&[]));
    }

    #[tokio::test]
    async fn sunionstore_leaves_the_union_at_destination() {
        let router = mesh("algebra-store");
        call(&router, "sadd", "s1", &["a", "b"]).await;
        call(&router, "sadd", "s2", &["b", "c"]).await;
        assert_eq!(call(&router, "sunionstore", "dst", &["s1", "s2"]).await, Reply::Int(3));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(call(&router, "smembers", "dst", &[]).await, bulks(&["a", "b", "c"]));
    }

    #[tokio::test]
    async fn zunionstore_weights_and_aggregate() {
        let router = mesh("zstore");
        call(&router, "zadd", "z1", &["1", "a", "2", "b"]).await;
        call(&router, "zadd", "z2", &["3", "b", "4", "c"]).await;

        assert_eq!(call(&router, "zunionstore", "out", &["2", "z1", "z2"]).await, Reply::Int(3));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            call(&router, "zrange", "out", &["0", "-1", "WITHSCORES"]).await,
            bulks(&["a", "1", "c", "4", "b", "5"])
        );

        assert_eq!(
            call(&router, "zinterstore", "out2", &["2", "z1", "z2", "AGGREGATE", "MAX"]).await,
            Reply::Int(1)
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            call(&router, "zrange", "out2", &["0", "-1", "WITHSCORES"]).await,
            bulks(&["b", "3"])
        );

        assert_eq!(
            call(&router, "zunionstore", "out3", &["1", "z1", "WEIGHTS", "10"]).await,
            Reply::Int(2)
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            call(&router, "zrange", "out3", &["0", "-1", "WITHSCORES"]).await,
            bulks(&["a", "10", "b", "20"])
        );
    }

    #[tokio::test]
    async fn bitop_folds_and_not_complements() {
        let router = mesh("bitop");
        call(&router, "setbit", "b1", &["0", "1"]).await;
        call(&router, "setbit", "b1", &["3", "1"]).await;
        call(&router, "setbit", "b2", &["3", "1"]).await;
        call(&router, "setbit", "b2", &["5", "1"]).await;

        assert_eq!(call(&router, "bitop", "", &["AND", "dst", "b1", "b2"]).await, Reply::Int(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(call(&router, "getbit", "dst", &["3"]).await, Reply::Int(1));
        assert_eq!(call(&router, "getbit", "dst", &["0"]).await, Reply::Int(0));

        call(&router, "bitop", "", &["OR", "dst2", "b1", "b2"]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(call(&router, "bitcount", "dst2", &[]).await, Reply::Int(3));

        call(&router, "bitop", "", &["XOR", "dst3", "b1", "b2"]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(call(&router, "bitcount", "dst3", &[]).await, Reply::Int(2));

        call(&router, "bitop", "", &["NOT", "dst4", "b1"]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(call(&router, "getbit", "dst4", &["0"]).await, Reply::Int(0));
        assert_eq!(call(&router, "getbit", "dst4", &["1"]).await, Reply::Int(1));
        assert_eq!(call(&router, "bitcount", "dst4", &[]).await, Reply::Int(6));
    }

    #[tokio::test]
    async fn pfcount_sums_and_pfmerge_unions() {
        let router = mesh("pf");
        call(&router, "pfadd", "h1", &["a", "b", "c"]).await;
        call(&router, "pfadd", "h2", &["c", "d"]).await;
        assert_eq!(call(&router, "pfcount", "h1", &[]).await, Reply::Int(3));
        assert_eq!(call(&router, "pfcount", "h1", &["h2"]).await, Reply::Int(5));

        assert_eq!(call(&router, "pfmerge", "merged", &["h1", "h2"]).await, Reply::Ok);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(call(&router, "pfcount", "merged", &[]).await, Reply::Int(4));
    }

    #[tokio::test]
    async fn keys_scan_dbsize_span_partitions() {
        let router = mesh("keyspace");
        for key in ["alpha", "beta", "gamma", "delta"] {
            call(&router, "set", key, &["x"]).await;
        }
        assert_eq!(
            call(&router, "keys", "", &["*a*"]).await,
            bulks(&["alpha", "beta", "delta", "gamma"])
        );
        assert_eq!(call(&router, "keys", "", &["*lpha"]).await, bulks(&["alpha"]));
        assert_eq!(call(&router, "dbsize", "", &[]).await, Reply::Int(4));

        assert_eq!(
            call(&router, "scan", "", &["0", "COUNT", "3"]).await,
            Reply::Array(vec![Reply::Bulk("3".into()), bulks(&["alpha", "beta", "delta"])])
        );
        assert_eq!(
            call(&router, "scan", "", &["3", "COUNT", "3"]).await,
            Reply::Array(vec![Reply::Bulk("0".into()), bulks(&["gamma"])])
        );
    }

    #[tokio::test]
    async fn flushdb_empties_every_partition() {
        let router = mesh("flush");
        for key in ["a", "b", "c"] {
            call(&router, "set", key, &["x"]).await;
        }
        assert_eq!(call(&router, "flushdb", "", &[]).await, Reply::Ok);
        assert_eq!(call(&router, "dbsize", "", &[]).await, Reply::Int(0));
    }

    #[tokio::test]
    async fn renamenx_refuses_existing_destination() {
        let router = mesh("renamenx");
        call(&router, "set", "src", &["v"]).await;
        call(&router, "set", "dst", &["w"]).await;
        assert_eq!(call(&router, "renamenx", "src", &["dst"]).await, Reply::Int(0));
        assert_eq!(call(&router, "renamenx", "src", &["fresh"]).await, Reply::Int(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(call(&router, "get", "fresh", &[]).await, Reply::Bulk("v".into()));
        assert_eq!(call(&router, "exists", "src", &[]).await, Reply::Bool(false));
    }
}
