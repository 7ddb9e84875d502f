//! The command descriptor table.
//!
//! Every command the server understands, client-facing or internal
//! (`_`-prefixed), has one entry here: which node family serves it, whether
//! its first argument is a key, whether it writes, whether it may overwrite
//! a key of a different type, its arity, and the reply produced when the
//! key does not exist. Keeping this as data means arity checks and
//! missing-key defaults live in one place instead of being scattered
//! across handlers.

use crate::resp::Reply;
use std::collections::HashMap;
use std::sync::OnceLock;

/// The family of actor a command is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Str,
    Hash,
    List,
    Set,
    SortedSet,
    Bitmap,
    HyperLogLog,
    /// Served directly by the KeyManager.
    Keys,
    /// Served locally by the client session.
    Client,
}

impl NodeKind {
    /// The name reported by `TYPE`. Bitmaps and sketches are strings on
    /// the wire, as in Redis.
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Str | NodeKind::Bitmap | NodeKind::HyperLogLog => "string",
            NodeKind::Hash => "hash",
            NodeKind::List => "list",
            NodeKind::Set => "set",
            NodeKind::SortedSet => "zset",
            NodeKind::Keys => "keys",
            NodeKind::Client => "client",
        }
    }

    pub fn from_tag(tag: u8) -> Option<NodeKind> {
        Some(match tag {
            0 => NodeKind::Str,
            1 => NodeKind::Hash,
            2 => NodeKind::List,
            3 => NodeKind::Set,
            4 => NodeKind::SortedSet,
            5 => NodeKind::Bitmap,
            6 => NodeKind::HyperLogLog,
            _ => return None,
        })
    }

    pub fn tag(&self) -> u8 {
        match self {
            NodeKind::Str => 0,
            NodeKind::Hash => 1,
            NodeKind::List => 2,
            NodeKind::Set => 3,
            NodeKind::SortedSet => 4,
            NodeKind::Bitmap => 5,
            NodeKind::HyperLogLog => 6,
            NodeKind::Keys => 7,
            NodeKind::Client => 8,
        }
    }
}

/// Accepted argument counts, not counting the command name or the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    Range(usize, usize),
    AtLeast(usize),
    /// An even, non-zero number of arguments.
    Pairs,
}

impl Arity {
    pub fn accepts(&self, count: usize) -> bool {
        match *self {
            Arity::Exactly(n) => count == n,
            Arity::Range(lo, hi) => count >= lo && count <= hi,
            Arity::AtLeast(n) => count >= n,
            Arity::Pairs => count >= 2 && count % 2 == 0,
        }
    }
}

/// The reply produced when a keyed command addresses a missing key.
/// `None` means the command is forwarded anyway (creating the node).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultReply {
    EmptyString,
    Ok,
    Nil,
    Zero,
    NegOne,
    NegTwo,
    EmptySeq,
    /// One nil per argument (`HMGET` against a missing key).
    Nils,
    /// Behave as an all-zeros value (`BITPOS`): searching for a clear bit
    /// finds offset 0, searching for a set bit finds nothing.
    Zeros,
    ScanEmpty,
    Error,
    None,
}

impl DefaultReply {
    /// Materialize the default for a concrete invocation, or `None` when
    /// the command should be forwarded.
    pub fn materialize(&self, args: &[String]) -> Option<Reply> {
        Some(match self {
            DefaultReply::EmptyString => Reply::Bulk(String::new()),
            DefaultReply::Ok => Reply::Ok,
            DefaultReply::Nil => Reply::Nil,
            DefaultReply::Zero => Reply::Int(0),
            DefaultReply::NegOne => Reply::Int(-1),
            DefaultReply::NegTwo => Reply::Int(-2),
            DefaultReply::EmptySeq => Reply::Array(Vec::new()),
            DefaultReply::Nils => Reply::Array(vec![Reply::Nil; args.len()]),
            DefaultReply::Zeros => {
                if args.first().map(String::as_str) == Some("0") {
                    Reply::Int(0)
                } else {
                    Reply::Int(-1)
                }
            }
            DefaultReply::ScanEmpty => {
                Reply::Array(vec![Reply::Bulk("0".into()), Reply::Array(Vec::new())])
            }
            DefaultReply::Error => Reply::Error("ERR no such key".into()),
            DefaultReply::None => return None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub kind: NodeKind,
    pub keyed: bool,
    pub writes: bool,
    pub overwrites: bool,
    pub arity: Arity,
    pub default: DefaultReply,
}

const fn cmd(
    name: &'static str,
    kind: NodeKind,
    keyed: bool,
    writes: bool,
    overwrites: bool,
    arity: Arity,
    default: DefaultReply,
) -> CommandSpec {
    CommandSpec { name, kind, keyed, writes, overwrites, arity, default }
}

use Arity::{AtLeast, Exactly, Pairs, Range};
use DefaultReply as D;
use NodeKind as K;

#[rustfmt::skip]
static COMMANDS: &[CommandSpec] = &[
    // Strings
    cmd("get",          K::Str, true,  false, false, Exactly(0),  D::Nil),
    cmd("set",          K::Str, true,  true,  true,  Exactly(1),  D::None),
    cmd("setnx",        K::Str, true,  true,  false, Exactly(1),  D::None),
    cmd("getset",       K::Str, true,  true,  false, Exactly(1),  D::None),
    cmd("append",       K::Str, true,  true,  false, Exactly(1),  D::None),
    cmd("getrange",     K::Str, true,  false, false, Exactly(2),  D::EmptyString),
    cmd("setrange",     K::Str, true,  true,  false, Exactly(2),  D::None),
    cmd("strlen",       K::Str, true,  false, false, Exactly(0),  D::Zero),
    cmd("incr",         K::Str, true,  true,  false, Exactly(0),  D::None),
    cmd("decr",         K::Str, true,  true,  false, Exactly(0),  D::None),
    cmd("incrby",       K::Str, true,  true,  false, Exactly(1),  D::None),
    cmd("decrby",       K::Str, true,  true,  false, Exactly(1),  D::None),
    cmd("incrbyfloat",  K::Str, true,  true,  false, Exactly(1),  D::None),
    cmd("setex",        K::Str, true,  true,  true,  Exactly(2),  D::None),
    cmd("psetex",       K::Str, true,  true,  true,  Exactly(2),  D::None),
    cmd("_store",       K::Str, true,  true,  true,  Exactly(1),  D::None),
    // Bitmaps
    cmd("setbit",       K::Bitmap, true,  true,  false, Exactly(2),  D::None),
    cmd("getbit",       K::Bitmap, true,  false, false, Exactly(1),  D::Zero),
    cmd("bitcount",     K::Bitmap, true,  false, false, Range(0, 2), D::Zero),
    cmd("bitpos",       K::Bitmap, true,  false, false, Range(1, 3), D::Zeros),
    cmd("_bstore",      K::Bitmap, true,  true,  true,  AtLeast(0),  D::None),
    cmd("_bget",        K::Bitmap, true,  false, false, Exactly(0),  D::EmptySeq),
    // HyperLogLogs
    cmd("pfadd",        K::HyperLogLog, true,  true,  false, AtLeast(1), D::None),
    cmd("_pfcount",     K::HyperLogLog, true,  false, false, Exactly(0), D::Zero),
    cmd("_pfget",       K::HyperLogLog, true,  false, false, Exactly(0), D::EmptyString),
    cmd("_pfstore",     K::HyperLogLog, true,  true,  true,  Range(0, 1), D::None),
    // Hashes
    cmd("hset",         K::Hash, true,  true,  false, Pairs,       D::None),
    cmd("hsetnx",       K::Hash, true,  true,  false, Exactly(2),  D::None),
    cmd("hmset",        K::Hash, true,  true,  false, Pairs,       D::None),
    cmd("hget",         K::Hash, true,  false, false, Exactly(1),  D::Nil),
    cmd("hmget",        K::Hash, true,  false, false, AtLeast(1),  D::Nils),
    cmd("hgetall",      K::Hash, true,  false, false, Exactly(0),  D::EmptySeq),
    cmd("hdel",         K::Hash, true,  true,  false, AtLeast(1),  D::Zero),
    cmd("hkeys",        K::Hash, true,  false, false, Exactly(0),  D::EmptySeq),
    cmd("hvals",        K::Hash, true,  false, false, Exactly(0),  D::EmptySeq),
    cmd("hlen",         K::Hash, true,  false, false, Exactly(0),  D::Zero),
    cmd("hexists",      K::Hash, true,  false, false, Exactly(1),  D::Zero),
    cmd("hincrby",      K::Hash, true,  true,  false, Exactly(2),  D::None),
    cmd("hincrbyfloat", K::Hash, true,  true,  false, Exactly(2),  D::None),
    cmd("hscan",        K::Hash, true,  false, false, Range(1, 5), D::ScanEmpty),
    cmd("_hstore",      K::Hash, true,  true,  true,  AtLeast(0),  D::None),
    // Lists
    cmd("lpush",        K::List, true,  true,  false, AtLeast(1),  D::None),
    cmd("rpush",        K::List, true,  true,  false, AtLeast(1),  D::None),
    cmd("lpushx",       K::List, true,  true,  false, AtLeast(1),  D::Zero),
    cmd("rpushx",       K::List, true,  true,  false, AtLeast(1),  D::Zero),
    cmd("lpop",         K::List, true,  true,  false, Exactly(0),  D::Nil),
    cmd("rpop",         K::List, true,  true,  false, Exactly(0),  D::Nil),
    cmd("llen",         K::List, true,  false, false, Exactly(0),  D::Zero),
    cmd("lrange",       K::List, true,  false, false, Exactly(2),  D::EmptySeq),
    cmd("ltrim",        K::List, true,  true,  false, Exactly(2),  D::Ok),
    cmd("lset",         K::List, true,  true,  false, Exactly(2),  D::Error),
    cmd("lindex",       K::List, true,  false, false, Exactly(1),  D::Nil),
    cmd("lrem",         K::List, true,  true,  false, Exactly(1),  D::Zero),
    cmd("linsert",      K::List, true,  true,  false, Exactly(3),  D::Zero),
    cmd("rpoplpush",    K::List, true,  true,  false, Exactly(1),  D::Nil),
    cmd("blpop",        K::List, true,  true,  false, Exactly(1),  D::None),
    cmd("brpop",        K::List, true,  true,  false, Exactly(1),  D::None),
    cmd("brpoplpush",   K::List, true,  true,  false, Exactly(2),  D::None),
    cmd("_lstore",      K::List, true,  true,  true,  AtLeast(0),  D::None),
    // Sets
    cmd("sadd",         K::Set, true,  true,  false, AtLeast(1),  D::None),
    cmd("srem",         K::Set, true,  true,  false, AtLeast(1),  D::Zero),
    cmd("scard",        K::Set, true,  false, false, Exactly(0),  D::Zero),
    cmd("sismember",    K::Set, true,  false, false, Exactly(1),  D::Zero),
    cmd("smembers",     K::Set, true,  false, false, Exactly(0),  D::EmptySeq),
    cmd("srandmember",  K::Set, true,  false, false, Range(0, 1), D::Nil),
    cmd("spop",         K::Set, true,  true,  false, Range(0, 1), D::Nil),
    cmd("sscan",        K::Set, true,  false, false, Range(1, 5), D::ScanEmpty),
    cmd("smove",        K::Set, true,  true,  false, Exactly(2),  D::Zero),
    cmd("_sstore",      K::Set, true,  true,  true,  AtLeast(0),  D::None),
    // Sorted sets
    cmd("zadd",             K::SortedSet, true,  true,  false, Pairs,       D::None),
    cmd("zrem",             K::SortedSet, true,  true,  false, AtLeast(1),  D::Zero),
    cmd("zcard",            K::SortedSet, true,  false, false, Exactly(0),  D::Zero),
    cmd("zscore",           K::SortedSet, true,  false, false, Exactly(1),  D::Nil),
    cmd("zincrby",          K::SortedSet, true,  true,  false, Exactly(2),  D::None),
    cmd("zrank",            K::SortedSet, true,  false, false, Exactly(1),  D::Nil),
    cmd("zrevrank",         K::SortedSet, true,  false, false, Exactly(1),  D::Nil),
    cmd("zrange",           K::SortedSet, true,  false, false, Range(2, 3), D::EmptySeq),
    cmd("zrevrange",        K::SortedSet, true,  false, false, Range(2, 3), D::EmptySeq),
    cmd("zrangebyscore",    K::SortedSet, true,  false, false, Range(2, 6), D::EmptySeq),
    cmd("zrevrangebyscore", K::SortedSet, true,  false, false, Range(2, 6), D::EmptySeq),
    cmd("zrangebylex",      K::SortedSet, true,  false, false, Range(2, 5), D::EmptySeq),
    cmd("zrevrangebylex",   K::SortedSet, true,  false, false, Range(2, 5), D::EmptySeq),
    cmd("zcount",           K::SortedSet, true,  false, false, Exactly(2),  D::Zero),
    cmd("zlexcount",        K::SortedSet, true,  false, false, Exactly(2),  D::Zero),
    cmd("zremrangebyrank",  K::SortedSet, true,  true,  false, Exactly(2),  D::Zero),
    cmd("zremrangebyscore", K::SortedSet, true,  true,  false, Exactly(2),  D::Zero),
    cmd("zremrangebylex",   K::SortedSet, true,  true,  false, Exactly(2),  D::Zero),
    cmd("_zget",            K::SortedSet, true,  false, false, Exactly(0),  D::EmptySeq),
    cmd("_zstore",          K::SortedSet, true,  true,  true,  AtLeast(0),  D::None),
    // Keyspace, served by the KeyManager
    cmd("del",          K::Keys, true,  true,  false, AtLeast(0),  D::Zero),
    cmd("_del",         K::Keys, true,  true,  false, Exactly(0),  D::Zero),
    cmd("exists",       K::Keys, true,  false, false, Exactly(0),  D::Zero),
    cmd("type",         K::Keys, true,  false, false, Exactly(0),  D::None),
    cmd("keys",         K::Keys, false, false, false, Exactly(1),  D::EmptySeq),
    cmd("randomkey",    K::Keys, false, false, false, Exactly(0),  D::Nil),
    cmd("flushdb",      K::Keys, false, true,  false, Exactly(0),  D::Ok),
    cmd("flushall",     K::Keys, false, true,  false, Exactly(0),  D::Ok),
    cmd("dbsize",       K::Keys, false, false, false, Exactly(0),  D::Zero),
    cmd("scan",         K::Keys, false, false, false, Range(1, 5), D::ScanEmpty),
    cmd("ttl",          K::Keys, true,  false, false, Exactly(0),  D::NegTwo),
    cmd("pttl",         K::Keys, true,  false, false, Exactly(0),  D::NegTwo),
    cmd("expire",       K::Keys, true,  true,  false, Exactly(1),  D::Zero),
    cmd("pexpire",      K::Keys, true,  true,  false, Exactly(1),  D::Zero),
    cmd("expireat",     K::Keys, true,  true,  false, Exactly(1),  D::Zero),
    cmd("pexpireat",    K::Keys, true,  true,  false, Exactly(1),  D::Zero),
    cmd("persist",      K::Keys, true,  true,  false, Exactly(0),  D::Zero),
    cmd("rename",       K::Keys, true,  true,  false, Exactly(1),  D::Error),
    cmd("renamenx",     K::Keys, true,  true,  false, Exactly(1),  D::Error),
    cmd("sort",         K::Keys, true,  false, false, AtLeast(0),  D::EmptySeq),
    cmd("publish",      K::Keys, true,  false, false, Exactly(1),  D::Zero),
    cmd("pubsub",       K::Keys, false, false, false, AtLeast(1),  D::None),
    cmd("_subscribe",   K::Keys, true,  false, false, Exactly(1),  D::None),
    cmd("_unsubscribe", K::Keys, true,  false, false, Exactly(1),  D::None),
    cmd("_psubscribe",  K::Keys, false, false, false, Exactly(2),  D::None),
    cmd("_punsubscribe",K::Keys, false, false, false, Exactly(2),  D::None),
    cmd("_numsub",      K::Keys, true,  false, false, Exactly(0),  D::Zero),
    cmd("_numpat",      K::Keys, false, false, false, Exactly(0),  D::Zero),
    cmd("_channels",    K::Keys, false, false, false, Exactly(1),  D::EmptySeq),
    // Session-local
    cmd("select",       K::Client, false, false, false, Exactly(1),  D::None),
    cmd("client",       K::Client, false, false, false, AtLeast(0),  D::None),
    cmd("echo",         K::Client, false, false, false, Exactly(1),  D::None),
    cmd("ping",         K::Client, false, false, false, Range(0, 1), D::None),
    cmd("time",         K::Client, false, false, false, Exactly(0),  D::None),
    cmd("shutdown",     K::Client, false, false, false, Range(0, 1), D::None),
    cmd("quit",         K::Client, false, false, false, Exactly(0),  D::None),
    cmd("subscribe",    K::Client, false, false, false, AtLeast(1),  D::None),
    cmd("unsubscribe",  K::Client, false, false, false, AtLeast(0),  D::None),
    cmd("psubscribe",   K::Client, false, false, false, AtLeast(1),  D::None),
    cmd("punsubscribe", K::Client, false, false, false, AtLeast(0),  D::None),
    // Multi-key commands, decomposed by an aggregator
    cmd("mget",         K::Str, true,  false, false, AtLeast(0),  D::None),
    cmd("mset",         K::Str, false, true,  true,  Pairs,       D::None),
    cmd("msetnx",       K::Str, false, true,  false, Pairs,       D::None),
    cmd("sdiff",        K::Set, true,  false, false, AtLeast(0),  D::None),
    cmd("sinter",       K::Set, true,  false, false, AtLeast(0),  D::None),
    cmd("sunion",       K::Set, true,  false, false, AtLeast(0),  D::None),
    cmd("sdiffstore",   K::Set, true,  true,  true,  AtLeast(1),  D::None),
    cmd("sinterstore",  K::Set, true,  true,  true,  AtLeast(1),  D::None),
    cmd("sunionstore",  K::Set, true,  true,  true,  AtLeast(1),  D::None),
    cmd("zunionstore",  K::SortedSet, true, true, true, AtLeast(2), D::None),
    cmd("zinterstore",  K::SortedSet, true, true, true, AtLeast(2), D::None),
    cmd("bitop",        K::Bitmap, false, true, true,  AtLeast(3),  D::None),
    cmd("pfcount",      K::HyperLogLog, true, false, false, AtLeast(0), D::None),
    cmd("pfmerge",      K::HyperLogLog, true, true,  false, AtLeast(0), D::None),
];

/// Commands decomposed into a scatter/gather aggregator by the session.
const AGGREGATES: &[&str] = &[
    "mget", "mset", "msetnx", "del", "sdiff", "sinter", "sunion", "sdiffstore",
    "sinterstore", "sunionstore", "zunionstore", "zinterstore", "bitop",
    "pfcount", "pfmerge", "keys", "scan", "dbsize", "randomkey", "flushdb",
    "flushall", "pubsub", "renamenx",
];

fn table() -> &'static HashMap<&'static str, &'static CommandSpec> {
    static TABLE: OnceLock<HashMap<&'static str, &'static CommandSpec>> = OnceLock::new();
    TABLE.get_or_init(|| COMMANDS.iter().map(|spec| (spec.name, spec)).collect())
}

/// Look up a command by its lowercased name.
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    table().get(name).copied()
}

pub fn is_aggregate(name: &str) -> bool {
    AGGREGATES.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_and_unknown() {
        assert!(lookup("get").is_some());
        assert!(lookup("zadd").is_some());
        assert!(lookup("_bstore").is_some());
        assert!(lookup("nonesuch").is_none());
        // Lookup is by lowercase name only.
        assert!(lookup("GET").is_none());
    }

    #[test]
    fn table_has_no_duplicates() {
        assert_eq!(table().len(), COMMANDS.len());
    }

    #[test]
    fn arity_bounds() {
        assert!(Arity::Exactly(2).accepts(2));
        assert!(!Arity::Exactly(2).accepts(1));
        assert!(Arity::Range(0, 2).accepts(0));
        assert!(!Arity::Range(1, 3).accepts(0));
        assert!(Arity::AtLeast(1).accepts(9));
        assert!(Arity::Pairs.accepts(4));
        assert!(!Arity::Pairs.accepts(3));
        assert!(!Arity::Pairs.accepts(0));
    }

    #[test]
    fn defaults_materialize() {
        let args: Vec<String> = vec!["f1".into(), "f2".into()];
        assert_eq!(DefaultReply::Zero.materialize(&args), Some(Reply::Int(0)));
        assert_eq!(DefaultReply::Nil.materialize(&args), Some(Reply::Nil));
        assert_eq!(
            DefaultReply::Nils.materialize(&args),
            Some(Reply::Array(vec![Reply::Nil, Reply::Nil]))
        );
        assert_eq!(DefaultReply::None.materialize(&args), None);
        assert_eq!(
            DefaultReply::Error.materialize(&args),
            Some(Reply::Error("ERR no such key".into()))
        );
    }

    #[test]
    fn bitpos_default_depends_on_target_bit() {
        let zero: Vec<String> = vec!["0".into()];
        let one: Vec<String> = vec!["1".into()];
        assert_eq!(DefaultReply::Zeros.materialize(&zero), Some(Reply::Int(0)));
        assert_eq!(DefaultReply::Zeros.materialize(&one), Some(Reply::Int(-1)));
    }

    #[test]
    fn aggregates_are_known_commands() {
        for name in AGGREGATES {
            assert!(lookup(name).is_some(), "aggregate {name} missing from table");
        }
    }
}
