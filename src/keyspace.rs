//! Keyspace partitions.
//!
//! A KeyManager owns one partition's directory of keys: for each
//! `(db, key)` a [`NodeEntry`] records the value's kind, the live node
//! handle (absent while passivated), and any expiry or passivation
//! timers. The manager validates every keyed command against the
//! descriptor table before forwarding it to the owning node, serves the
//! keyspace commands itself, and holds the partition's pub/sub registry.
//!
//! The `(db, key) -> kind` skeleton is snapshotted so entries survive a
//! restart; handles and timers are transient and rebuilt on demand.

use crate::commands::{self, CommandSpec, NodeKind};
use crate::config::Config;
use crate::error::ServerError;
use crate::glob::glob_match;
use crate::nodes::{self, NodeHandle, NodeMsg};
use crate::resp::Reply;
use crate::routing::{Delivery, Destination, Payload, Router, SubKind};
use crate::snapshot::{put_str, put_u32, Reader, SnapshotStore};
use rand::seq::IteratorRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum ManagerMsg {
    Command(Payload),
    ExpireFired { db: String, key: String, at: u64 },
    PassivationFired { db: String, key: String, generation: u64 },
    PersistTick,
}

/// Directory record for one key.
struct NodeEntry {
    kind: NodeKind,
    /// Live actor handle; `None` while passivated.
    node: Option<NodeHandle>,
    /// Absolute expiry in ms since the epoch, with its timer token.
    expiry: Option<(u64, CancellationToken)>,
    passivation: Option<CancellationToken>,
    /// Guards against stale passivation timer messages.
    passivation_gen: u64,
}

impl NodeEntry {
    fn new(kind: NodeKind) -> Self {
        NodeEntry {
            kind,
            node: None,
            expiry: None,
            passivation: None,
            passivation_gen: 0,
        }
    }

    fn cancel_timers(&mut self) {
        if let Some((_, token)) = self.expiry.take() {
            token.cancel();
        }
        if let Some(token) = self.passivation.take() {
            token.cancel();
        }
    }
}

pub struct KeyManager {
    index: usize,
    router: Router,
    tx: mpsc::UnboundedSender<ManagerMsg>,
    snapshots: Arc<SnapshotStore>,
    config: Arc<Config>,
    dbs: HashMap<String, HashMap<String, NodeEntry>>,
    channels: HashMap<String, HashMap<u64, Destination>>,
    patterns: HashMap<String, HashMap<u64, Destination>>,
    dirty: bool,
    persist_scheduled: bool,
}

/// Spawn one partition actor; `tx` must be the sender paired with `rx`.
pub fn spawn(
    index: usize,
    tx: mpsc::UnboundedSender<ManagerMsg>,
    rx: mpsc::UnboundedReceiver<ManagerMsg>,
    router: Router,
    snapshots: Arc<SnapshotStore>,
    config: Arc<Config>,
) {
    let manager = KeyManager {
        index,
        router,
        tx,
        snapshots,
        config,
        dbs: HashMap::new(),
        channels: HashMap::new(),
        patterns: HashMap::new(),
        dirty: false,
        persist_scheduled: false,
    };
    tokio::spawn(manager.run(rx));
}

impl KeyManager {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ManagerMsg>) {
        self.recover();
        while let Some(msg) = rx.recv().await {
            match msg {
                ManagerMsg::Command(payload) => self.command(payload),
                ManagerMsg::ExpireFired { db, key, at } => self.expire_fired(&db, &key, at),
                ManagerMsg::PassivationFired { db, key, generation } => {
                    self.passivation_fired(&db, &key, generation)
                }
                ManagerMsg::PersistTick => {
                    self.persist_scheduled = false;
                    if self.dirty {
                        self.save_skeleton();
                    }
                }
            }
        }
    }

    fn command(&mut self, payload: Payload) {
        let spec = match commands::lookup(&payload.command) {
            Some(spec) => spec,
            None => {
                warn!("partition {} got unroutable command {}", self.index, payload.command);
                payload.respond(
                    ServerError::UnknownCommand(payload.command.clone()).into_reply(),
                );
                return;
            }
        };
        if spec.kind == NodeKind::Keys {
            self.keys_command(payload);
        } else {
            self.typed_command(payload, spec);
        }
    }

    /// Validation and dispatch for commands owned by a value node.
    fn typed_command(&mut self, payload: Payload, spec: &CommandSpec) {
        self.expire_if_due(&payload.db, &payload.key);

        let exists = self.entry(&payload.db, &payload.key).is_some();
        if let Some(entry) = self.entry(&payload.db, &payload.key) {
            if entry.kind != spec.kind && !spec.overwrites {
                payload.respond(ServerError::WrongType.into_reply());
                return;
            }
            if payload.command == "setnx" {
                payload.respond(Reply::Int(0));
                return;
            }
        } else {
            if payload.command == "lpushx" || payload.command == "rpushx" {
                payload.respond(Reply::Int(0));
                return;
            }
            if let Some(default) = spec.default.materialize(&payload.args) {
                payload.respond(default);
                return;
            }
        }

        // Type change via an overwriting command: drop the old value
        // first, then build the new one from scratch.
        if exists {
            let old_kind = self.entry(&payload.db, &payload.key).map(|e| e.kind);
            if spec.overwrites && old_kind != Some(spec.kind) {
                self.remove_entry(&payload.db, &payload.key, true);
            }
        }

        let db = payload.db.clone();
        let key = payload.key.clone();
        self.forward(&db, &key, spec.kind, payload);
        self.arm_passivation(&db, &key);
    }

    /// Get or create the entry and its node, then hand over the payload.
    fn forward(&mut self, db: &str, key: &str, kind: NodeKind, payload: Payload) {
        let router = self.router.clone();
        let snapshots = self.snapshots.clone();
        let config = self.config.clone();

        let map = self.dbs.entry(db.to_string()).or_default();
        if !map.contains_key(key) {
            map.insert(key.to_string(), NodeEntry::new(kind));
            self.dirty = true;
        }
        let entry = match map.get_mut(key) {
            Some(entry) => entry,
            None => return,
        };
        let entry_kind = entry.kind;
        let node = entry.node.get_or_insert_with(|| {
            nodes::spawn(entry_kind, db.to_string(), key.to_string(), router, snapshots, config)
        });
        let _ = node.send(NodeMsg::Command(payload));
        if self.dirty {
            self.schedule_persist();
        }
    }

    fn keys_command(&mut self, payload: Payload) {
        self.expire_if_due(&payload.db, &payload.key);
        match payload.command.as_str() {
            "del" | "_del" => {
                let existed = self.remove_entry(&payload.db, &payload.key, true);
                self.schedule_persist();
                payload.respond(Reply::Bool(existed));
            }
            "exists" => {
                let exists = self.entry(&payload.db, &payload.key).is_some();
                payload.respond(Reply::Bool(exists));
            }
            "type" => {
                let name = self
                    .entry(&payload.db, &payload.key)
                    .map_or("none", |entry| entry.kind.type_name());
                payload.respond(Reply::Simple(name.to_string()));
            }
            "keys" => {
                let pattern = payload.args.first().cloned().unwrap_or_default();
                let keys = self.matching_keys(&payload.db, &pattern);
                payload.respond(Reply::Array(keys.into_iter().map(Reply::Bulk).collect()));
            }
            "randomkey" => {
                let keys = self.matching_keys(&payload.db, "*");
                let mut rng = rand::thread_rng();
                payload.respond(keys.into_iter().choose(&mut rng).map_or(Reply::Nil, Reply::Bulk));
            }
            "dbsize" => {
                let count = self.matching_keys(&payload.db, "*").len();
                payload.respond(Reply::Int(count as i64));
            }
            "flushdb" => {
                self.flush_db(&payload.db.clone());
                self.schedule_persist();
                payload.respond(Reply::Ok);
            }
            "flushall" => {
                let names: Vec<String> = self.dbs.keys().cloned().collect();
                for db in names {
                    self.flush_db(&db);
                }
                self.schedule_persist();
                payload.respond(Reply::Ok);
            }
            "ttl" | "pttl" => {
                let millis = payload.command == "pttl";
                payload.respond(Reply::Int(self.ttl(&payload.db, &payload.key, millis)));
            }
            "expire" | "pexpire" | "expireat" | "pexpireat" => self.set_expiry(payload),
            "persist" => {
                let cleared = match self.entry_mut(&payload.db, &payload.key) {
                    Some(entry) => match entry.expiry.take() {
                        Some((_, token)) => {
                            token.cancel();
                            true
                        }
                        None => false,
                    },
                    None => false,
                };
                payload.respond(Reply::Bool(cleared));
            }
            "rename" => self.rename(payload),
            "sort" => {
                match self.entry(&payload.db, &payload.key) {
                    Some(entry) => {
                        let (db, key, kind) = (payload.db.clone(), payload.key.clone(), entry.kind);
                        self.forward(&db, &key, kind, payload);
                    }
                    None => payload.respond(Reply::Array(Vec::new())),
                }
            }
            "publish" => {
                let message = payload.args.first().cloned().unwrap_or_default();
                let delivered = self.publish(&payload.key, &message);
                payload.respond(Reply::Int(delivered));
            }
            "_subscribe" | "_unsubscribe" => self.channel_subscription(payload),
            "_psubscribe" | "_punsubscribe" => self.pattern_subscription(payload),
            "_numsub" => {
                let count = self.channels.get(&payload.key).map_or(0, HashMap::len);
                payload.respond(Reply::Int(count as i64));
            }
            "_numpat" => payload.respond(Reply::Int(self.patterns.len() as i64)),
            "_channels" => {
                let pattern = payload.args.first().cloned().unwrap_or_default();
                let mut names: Vec<&String> = self
                    .channels
                    .keys()
                    .filter(|ch| pattern.is_empty() || glob_match(&pattern, ch))
                    .collect();
                names.sort();
                payload.respond(Reply::Array(
                    names.into_iter().map(|ch| Reply::Bulk(ch.clone())).collect(),
                ));
            }
            other => {
                payload.respond(Reply::err(format!("ERR unknown command '{other}'")));
            }
        }
    }

    // Directory plumbing.

    fn entry(&self, db: &str, key: &str) -> Option<&NodeEntry> {
        self.dbs.get(db).and_then(|map| map.get(key))
    }

    fn entry_mut(&mut self, db: &str, key: &str) -> Option<&mut NodeEntry> {
        self.dbs.get_mut(db).and_then(|map| map.get_mut(key))
    }

    fn remove_entry(&mut self, db: &str, key: &str, delete_snapshot: bool) -> bool {
        let mut entry = match self.dbs.get_mut(db).and_then(|map| map.remove(key)) {
            Some(entry) => entry,
            None => return false,
        };
        entry.cancel_timers();
        match entry.node {
            Some(node) => {
                let _ = node.send(NodeMsg::Stop { persist: false, delete: delete_snapshot });
            }
            None if delete_snapshot => {
                self.snapshots.delete(&nodes::node_id(db, entry.kind, key));
            }
            None => {}
        }
        self.dirty = true;
        true
    }

    fn flush_db(&mut self, db: &str) {
        let keys: Vec<String> = self
            .dbs
            .get(db)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        for key in keys {
            self.remove_entry(db, &key, true);
        }
    }

    /// Lazy expiry: a due key is removed before any command observes it.
    fn expire_if_due(&mut self, db: &str, key: &str) {
        let due = matches!(
            self.entry(db, key).and_then(|entry| entry.expiry.as_ref()),
            Some((at, _)) if *at <= now_millis()
        );
        if due {
            debug!("expired {db}/{key}");
            self.remove_entry(db, key, true);
            self.schedule_persist();
        }
    }

    fn matching_keys(&self, db: &str, pattern: &str) -> Vec<String> {
        let now = now_millis();
        self.dbs
            .get(db)
            .map(|map| {
                let mut keys: Vec<String> = map
                    .iter()
                    .filter(|(_, entry)| {
                        entry.expiry.as_ref().map_or(true, |(at, _)| *at > now)
                    })
                    .filter(|(key, _)| glob_match(pattern, key))
                    .map(|(key, _)| key.clone())
                    .collect();
                keys.sort();
                keys
            })
            .unwrap_or_default()
    }

    // Expiry.

    fn ttl(&self, db: &str, key: &str, millis: bool) -> i64 {
        match self.entry(db, key) {
            None => -2,
            Some(entry) => match &entry.expiry {
                None => -1,
                Some((at, _)) => {
                    let remaining = at.saturating_sub(now_millis());
                    if millis {
                        remaining as i64
                    } else {
                        // Round up so TTL right after EXPIRE n reports n.
                        remaining.div_ceil(1000) as i64
                    }
                }
            },
        }
    }

    fn set_expiry(&mut self, payload: Payload) {
        let amount: i64 = match payload.args.first().and_then(|s| s.parse().ok()) {
            Some(n) => n,
            None => {
                payload.respond(ServerError::NotInteger.into_reply());
                return;
            }
        };
        if self.entry(&payload.db, &payload.key).is_none() {
            payload.respond(Reply::Int(0));
            return;
        }
        let at = match payload.command.as_str() {
            "expire" => now_millis() as i64 + amount.saturating_mul(1000),
            "pexpire" => now_millis() as i64 + amount,
            "expireat" => amount.saturating_mul(1000),
            _ => amount,
        };

        if at <= now_millis() as i64 {
            // Already in the past: the key goes away right now.
            self.remove_entry(&payload.db, &payload.key, true);
            self.schedule_persist();
            payload.respond(Reply::Int(1));
            return;
        }

        let at = at as u64;
        let token = CancellationToken::new();
        if let Some(entry) = self.entry_mut(&payload.db, &payload.key) {
            if let Some((_, old)) = entry.expiry.replace((at, token.clone())) {
                old.cancel();
            }
        }
        let tx = self.tx.clone();
        let (db, key) = (payload.db.clone(), payload.key.clone());
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(at.saturating_sub(now_millis()))) => {
                    let _ = tx.send(ManagerMsg::ExpireFired { db, key, at });
                }
                _ = token.cancelled() => {}
            }
        });
        payload.respond(Reply::Int(1));
    }

    fn expire_fired(&mut self, db: &str, key: &str, at: u64) {
        // Ignore stale timers: the entry may be gone or re-armed.
        let current = self
            .entry(db, key)
            .and_then(|entry| entry.expiry.as_ref())
            .map(|(deadline, _)| *deadline);
        if current == Some(at) && at <= now_millis() {
            debug!("expiry fired for {db}/{key}");
            self.remove_entry(db, key, true);
            self.schedule_persist();
        }
    }

    // Passivation.

    fn arm_passivation(&mut self, db: &str, key: &str) {
        if self.config.sleep_after == 0 {
            return;
        }
        let sleep_after = self.config.sleep_after;
        let tx = self.tx.clone();
        if let Some(entry) = self.entry_mut(db, key) {
            entry.passivation_gen += 1;
            let generation = entry.passivation_gen;
            let token = CancellationToken::new();
            if let Some(old) = entry.passivation.replace(token.clone()) {
                old.cancel();
            }
            let (db, key) = (db.to_string(), key.to_string());
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(sleep_after)) => {
                        let _ = tx.send(ManagerMsg::PassivationFired { db, key, generation });
                    }
                    _ = token.cancelled() => {}
                }
            });
        }
    }

    fn passivation_fired(&mut self, db: &str, key: &str, generation: u64) {
        if let Some(entry) = self.entry_mut(db, key) {
            if entry.passivation_gen != generation {
                return;
            }
            entry.passivation = None;
            if let Some(node) = entry.node.take() {
                debug!("passivating {db}/{key}");
                let _ = node.send(NodeMsg::Stop { persist: true, delete: false });
            }
        }
    }

    // Rename.

    fn rename(&mut self, payload: Payload) {
        let destination = match payload.args.first() {
            Some(dst) => dst.clone(),
            None => {
                payload.respond(ServerError::Syntax.into_reply());
                return;
            }
        };
        let kind = match self.entry(&payload.db, &payload.key) {
            Some(entry) => entry.kind,
            None => {
                payload.respond(ServerError::NoSuchKey.into_reply());
                return;
            }
        };
        if destination == payload.key {
            payload.respond(Reply::Ok);
            return;
        }
        // The node reproduces itself at the destination and deletes
        // itself; it also answers the client.
        let (db, key) = (payload.db.clone(), payload.key.clone());
        let rename = Payload {
            command: "_rename".to_string(),
            args: vec![destination],
            ..payload
        };
        self.forward(&db, &key, kind, rename);
    }

    // Pub/sub registry.

    fn channel_subscription(&mut self, payload: Payload) {
        let subscribe = payload.command == "_subscribe";
        let sid = match payload.args.first().and_then(|s| s.parse().ok()) {
            Some(sid) => sid,
            None => return,
        };
        let channel = payload.key.clone();
        if subscribe {
            if let Some(dest) = payload.reply.clone() {
                self.channels.entry(channel.clone()).or_default().insert(sid, dest);
            }
        } else if let Some(subscribers) = self.channels.get_mut(&channel) {
            subscribers.remove(&sid);
            if subscribers.is_empty() {
                self.channels.remove(&channel);
            }
        }
        if let Some(dest) = &payload.reply {
            let _ = dest.send(Delivery::Subscribed {
                kind: SubKind::Channel,
                name: channel,
                active: subscribe,
            });
        }
    }

    fn pattern_subscription(&mut self, payload: Payload) {
        let subscribe = payload.command == "_psubscribe";
        let pattern = match payload.args.first() {
            Some(pattern) => pattern.clone(),
            None => return,
        };
        let sid = match payload.args.get(1).and_then(|s| s.parse().ok()) {
            Some(sid) => sid,
            None => return,
        };
        if subscribe {
            if let Some(dest) = payload.reply.clone() {
                self.patterns.entry(pattern.clone()).or_default().insert(sid, dest);
            }
        } else if let Some(subscribers) = self.patterns.get_mut(&pattern) {
            subscribers.remove(&sid);
            if subscribers.is_empty() {
                self.patterns.remove(&pattern);
            }
        }
        // Patterns live on every partition; exactly one confirms to the
        // session, the one the pattern hashes to.
        if self.router.partition_for(&pattern) == self.index {
            if let Some(dest) = &payload.reply {
                let _ = dest.send(Delivery::Subscribed {
                    kind: SubKind::Pattern,
                    name: pattern,
                    active: subscribe,
                });
            }
        }
    }

    fn publish(&mut self, channel: &str, message: &str) -> i64 {
        let mut delivered = 0;
        let mut dead: Vec<(String, u64)> = Vec::new();

        if let Some(subscribers) = self.channels.get(channel) {
            for (&sid, dest) in subscribers {
                let push = Reply::Array(vec![
                    Reply::Bulk("message".into()),
                    Reply::Bulk(channel.to_string()),
                    Reply::Bulk(message.to_string()),
                ]);
                if dest.send(Delivery::Push(push)).is_ok() {
                    delivered += 1;
                } else {
                    dead.push((channel.to_string(), sid));
                }
            }
        }
        for (pattern, subscribers) in &self.patterns {
            if !glob_match(pattern, channel) {
                continue;
            }
            for dest in subscribers.values() {
                let push = Reply::Array(vec![
                    Reply::Bulk("pmessage".into()),
                    Reply::Bulk(pattern.clone()),
                    Reply::Bulk(channel.to_string()),
                    Reply::Bulk(message.to_string()),
                ]);
                if dest.send(Delivery::Push(push)).is_ok() {
                    delivered += 1;
                }
            }
        }

        // Sessions that vanished without unsubscribing prune here.
        for (channel, sid) in dead {
            if let Some(subscribers) = self.channels.get_mut(&channel) {
                subscribers.remove(&sid);
                if subscribers.is_empty() {
                    self.channels.remove(&channel);
                }
            }
        }
        delivered
    }

    // Skeleton persistence.

    fn skeleton_id(&self) -> String {
        format!("keys-{}", self.index)
    }

    fn schedule_persist(&mut self) {
        if !self.dirty {
            return;
        }
        match self.config.persist_after {
            ms if ms < 0 => {}
            0 => self.save_skeleton(),
            ms => {
                if !self.persist_scheduled {
                    self.persist_scheduled = true;
                    let tx = self.tx.clone();
                    let after = Duration::from_millis(ms as u64);
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(ManagerMsg::PersistTick);
                    });
                }
            }
        }
    }

    fn save_skeleton(&mut self) {
        let mut buf = Vec::new();
        let count: usize = self.dbs.values().map(HashMap::len).sum();
        put_u32(&mut buf, count as u32);
        for (db, map) in &self.dbs {
            for (key, entry) in map {
                put_str(&mut buf, db);
                put_str(&mut buf, key);
                buf.push(entry.kind.tag());
            }
        }
        if let Err(e) = self.snapshots.save(&self.skeleton_id(), &buf) {
            warn!("skeleton snapshot failed for partition {}: {e}", self.index);
        } else {
            self.dirty = false;
        }
    }

    /// Rebuild the directory from the last skeleton snapshot. Nodes are
    /// materialized eagerly unless passivation will do it lazily anyway.
    fn recover(&mut self) {
        let bytes = match self.snapshots.load(&self.skeleton_id()) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(e) => {
                warn!("skeleton load failed for partition {}: {e}", self.index);
                return;
            }
        };
        let mut reader = Reader::new(&bytes);
        let count = match reader.u32() {
            Ok(count) => count,
            Err(_) => return,
        };
        for _ in 0..count {
            let (db, key, tag) = match (reader.str(), reader.str(), reader.u8()) {
                (Ok(db), Ok(key), Ok(tag)) => (db, key, tag),
                _ => {
                    warn!("truncated skeleton for partition {}", self.index);
                    break;
                }
            };
            let kind = match NodeKind::from_tag(tag) {
                Some(kind) => kind,
                None => continue,
            };
            let mut entry = NodeEntry::new(kind);
            if self.config.sleep_after == 0 {
                entry.node = Some(nodes::spawn(
                    kind,
                    db.clone(),
                    key.clone(),
                    self.router.clone(),
                    self.snapshots.clone(),
                    self.config.clone(),
                ));
            }
            self.dbs.entry(db).or_default().insert(key, entry);
        }
        debug!(
            "partition {} recovered {} keys",
            self.index,
            self.dbs.values().map(HashMap::len).sum::<usize>()
        );
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One-partition mesh with its own snapshot directory.
    fn mesh(tag: &str, config: Config) -> (Router, Arc<SnapshotStore>, Arc<Config>) {
        let dir = std::env::temp_dir().join(format!("swarmkv-km-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        boot(dir, config)
    }

    fn boot(
        dir: std::path::PathBuf,
        config: Config,
    ) -> (Router, Arc<SnapshotStore>, Arc<Config>) {
        let snapshots = Arc::new(SnapshotStore::open(dir).unwrap());
        let config = Arc::new(config);
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Router::new(vec![tx.clone()]);
        spawn(0, tx, rx, router.clone(), snapshots.clone(), config.clone());
        (router, snapshots, config)
    }

    async fn call(router: &Router, command: &str, key: &str, args: &[&str]) -> Reply {
        let (tx, mut rx) = mpsc::unbounded_channel();
        router.route(Payload::new(
            command,
            "0",
            key,
            args.iter().map(|s| s.to_string()).collect(),
            Some(tx),
        ));
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("reply timed out")
                .expect("channel closed")
            {
                Delivery::Response { reply, .. } => return reply,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn missing_keys_answer_their_defaults() {
        let (router, _, _) = mesh("defaults", Config { persist_after: -1, ..Config::default() });
        assert_eq!(call(&router, "get", "nope", &[]).await, Reply::Nil);
        assert_eq!(call(&router, "strlen", "nope", &[]).await, Reply::Int(0));
        assert_eq!(call(&router, "lrange", "nope", &["0", "-1"]).await, Reply::Array(vec![]));
        assert_eq!(call(&router, "ttl", "nope", &[]).await, Reply::Int(-2));
        assert_eq!(
            call(&router, "hmget", "nope", &["a", "b"]).await,
            Reply::Array(vec![Reply::Nil, Reply::Nil])
        );
        assert_eq!(call(&router, "lpushx", "nope", &["x"]).await, Reply::Int(0));
        assert_eq!(call(&router, "exists", "nope", &[]).await, Reply::Bool(false));
    }

    #[tokio::test]
    async fn wrong_type_is_rejected_without_touching_the_value() {
        let (router, _, _) = mesh("wrongtype", Config { persist_after: -1, ..Config::default() });
        assert_eq!(call(&router, "rpush", "l", &["a"]).await, Reply::Int(1));
        let reply = call(&router, "get", "l", &[]).await;
        assert_eq!(
            reply,
            Reply::err("WRONGTYPE Operation against a key holding the wrong kind of value")
        );
        assert_eq!(call(&router, "llen", "l", &[]).await, Reply::Int(1));
    }

    #[tokio::test]
    async fn overwriting_set_replaces_other_types() {
        let (router, _, _) = mesh("overwrite", Config { persist_after: -1, ..Config::default() });
        call(&router, "rpush", "k", &["a"]).await;
        assert_eq!(call(&router, "set", "k", &["v"]).await, Reply::Ok);
        assert_eq!(call(&router, "get", "k", &[]).await, Reply::Bulk("v".into()));
        assert_eq!(call(&router, "type", "k", &[]).await, Reply::Simple("string".into()));
    }

    #[tokio::test]
    async fn setnx_only_writes_once() {
        let (router, _, _) = mesh("setnx", Config { persist_after: -1, ..Config::default() });
        assert_eq!(call(&router, "setnx", "k", &["1"]).await, Reply::Bool(true));
        assert_eq!(call(&router, "setnx", "k", &["2"]).await, Reply::Int(0));
        assert_eq!(call(&router, "get", "k", &[]).await, Reply::Bulk("1".into()));
    }

    #[tokio::test]
    async fn expiry_lifecycle() {
        let (router, _, _) = mesh("expiry", Config { persist_after: -1, ..Config::default() });
        call(&router, "set", "k", &["v"]).await;
        assert_eq!(call(&router, "ttl", "k", &[]).await, Reply::Int(-1));
        assert_eq!(call(&router, "expire", "k", &["10"]).await, Reply::Int(1));
        let ttl = match call(&router, "ttl", "k", &[]).await {
            Reply::Int(n) => n,
            other => panic!("unexpected reply: {other:?}"),
        };
        assert!(ttl > 0 && ttl <= 10);
        assert_eq!(call(&router, "persist", "k", &[]).await, Reply::Bool(true));
        assert_eq!(call(&router, "ttl", "k", &[]).await, Reply::Int(-1));

        assert_eq!(call(&router, "pexpire", "k", &["40"]).await, Reply::Int(1));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(call(&router, "get", "k", &[]).await, Reply::Nil);
        assert_eq!(call(&router, "ttl", "k", &[]).await, Reply::Int(-2));
    }

    #[tokio::test]
    async fn expire_on_missing_key_returns_zero() {
        let (router, _, _) = mesh("expiry-missing", Config { persist_after: -1, ..Config::default() });
        assert_eq!(call(&router, "expire", "nope", &["5"]).await, Reply::Int(0));
        assert_eq!(call(&router, "persist", "nope", &[]).await, Reply::Bool(false));
    }

    #[tokio::test]
    async fn del_exists_type_keys() {
        let (router, _, _) = mesh("delkeys", Config { persist_after: -1, ..Config::default() });
        call(&router, "set", "a", &["1"]).await;
        call(&router, "rpush", "b", &["x"]).await;
        assert_eq!(call(&router, "exists", "a", &[]).await, Reply::Bool(true));
        assert_eq!(call(&router, "type", "b", &[]).await, Reply::Simple("list".into()));
        assert_eq!(call(&router, "type", "zz", &[]).await, Reply::Simple("none".into()));
        assert_eq!(
            call(&router, "keys", "", &["*"]).await,
            Reply::Array(vec![Reply::Bulk("a".into()), Reply::Bulk("b".into())])
        );
        assert_eq!(call(&router, "del", "a", &[]).await, Reply::Bool(true));
        assert_eq!(call(&router, "del", "a", &[]).await, Reply::Bool(false));
        assert_eq!(call(&router, "dbsize", "", &[]).await, Reply::Int(1));
    }

    #[tokio::test]
    async fn rename_moves_the_value() {
        let (router, _, _) = mesh("rename", Config { persist_after: -1, ..Config::default() });
        call(&router, "rpush", "src", &["a", "b"]).await;
        assert_eq!(call(&router, "rename", "src", &["dst"]).await, Reply::Ok);
        // The store and delete flow through the router; give them a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(call(&router, "exists", "src", &[]).await, Reply::Bool(false));
        assert_eq!(
            call(&router, "lrange", "dst", &["0", "-1"]).await,
            Reply::Array(vec![Reply::Bulk("a".into()), Reply::Bulk("b".into())])
        );
        assert_eq!(
            call(&router, "rename", "ghost", &["x"]).await,
            Reply::err("ERR no such key")
        );
    }

    #[tokio::test]
    async fn publish_reaches_channel_and_matching_patterns() {
        let (router, _, _) = mesh("pubsub", Config { persist_after: -1, ..Config::default() });
        let (tx, mut rx) = mpsc::unbounded_channel();

        router.route(Payload::new("_subscribe", "0", "news", vec!["7".into()], Some(tx.clone())));
        router.broadcast(Payload::new(
            "_psubscribe",
            "0",
            "",
            vec!["n*".into(), "7".into()],
            Some(tx.clone()),
        ));
        // Two bookkeeping events: channel and pattern.
        let mut events = 0;
        while events < 2 {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
                Some(Delivery::Subscribed { active: true, .. }) => events += 1,
                other => panic!("unexpected delivery: {other:?}"),
            }
        }

        assert_eq!(call(&router, "publish", "news", &["hi"]).await, Reply::Int(2));
        let mut pushes = Vec::new();
        while pushes.len() < 2 {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
                Some(Delivery::Push(reply)) => pushes.push(reply),
                other => panic!("unexpected delivery: {other:?}"),
            }
        }
        assert!(pushes.contains(&Reply::Array(vec![
            Reply::Bulk("message".into()),
            Reply::Bulk("news".into()),
            Reply::Bulk("hi".into()),
        ])));
        assert!(pushes.contains(&Reply::Array(vec![
            Reply::Bulk("pmessage".into()),
            Reply::Bulk("n*".into()),
            Reply::Bulk("news".into()),
            Reply::Bulk("hi".into()),
        ])));

        // Nobody listens on other channels.
        assert_eq!(call(&router, "publish", "weather", &["x"]).await, Reply::Int(0));
    }

    #[tokio::test]
    async fn values_survive_a_restart() {
        let dir = std::env::temp_dir().join(format!("swarmkv-km-restart-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let config = Config { persist_after: 0, ..Config::default() };

        let (router, _, _) = boot(dir.clone(), config.clone());
        call(&router, "set", "foo", &["bar"]).await;
        call(&router, "zadd", "z", &["1", "a", "2", "b"]).await;

        // A second mesh over the same directory plays the part of the
        // restarted process.
        let (reborn, _, _) = boot(dir, config);
        assert_eq!(call(&reborn, "get", "foo", &[]).await, Reply::Bulk("bar".into()));
        assert_eq!(
            call(&reborn, "zrange", "z", &["0", "-1"]).await,
            Reply::Array(vec![Reply::Bulk("a".into()), Reply::Bulk("b".into())])
        );
        assert_eq!(call(&reborn, "type", "z", &[]).await, Reply::Simple("zset".into()));
    }

    #[tokio::test]
    async fn passivation_is_transparent() {
        let (router, _, _) = mesh(
            "passivate",
            Config { persist_after: 0, sleep_after: 30, ..Config::default() },
        );
        call(&router, "set", "k", &["v"]).await;
        // Long enough for the idle timer to stop the node.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(call(&router, "get", "k", &[]).await, Reply::Bulk("v".into()));
        assert_eq!(call(&router, "append", "k", &["!"]).await, Reply::Int(2));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(call(&router, "get", "k", &[]).await, Reply::Bulk("v!".into()));
    }
}
