//! Payloads, reply destinations and the consistent-hash router.

use crate::keyspace::ManagerMsg;
use crate::resp::Reply;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Where replies and pub/sub traffic for an actor are sent. Sessions and
/// aggregators each hold the receiving end of one of these.
pub type Destination = mpsc::UnboundedSender<Delivery>;

/// Subscription flavor, for bookkeeping events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubKind {
    Channel,
    Pattern,
}

/// A message delivered to a session or aggregator mailbox.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Reply to a routed command, tagged with the key it originated from
    /// so aggregators can slot it.
    Response { key: String, reply: Reply },
    /// A subscription was added or removed for this destination.
    Subscribed { kind: SubKind, name: String, active: bool },
    /// Pub/sub fan-out (`message` / `pmessage` arrays).
    Push(Reply),
}

/// One command instance flowing through the mesh.
#[derive(Debug, Clone)]
pub struct Payload {
    /// Lowercased command name.
    pub command: String,
    /// Logical database.
    pub db: String,
    /// Target key; empty for unkeyed commands.
    pub key: String,
    /// Positional arguments after the key.
    pub args: Vec<String>,
    /// Reply destination; `None` for fire-and-forget internal commands.
    pub reply: Option<Destination>,
}

impl Payload {
    pub fn new(
        command: impl Into<String>,
        db: impl Into<String>,
        key: impl Into<String>,
        args: Vec<String>,
        reply: Option<Destination>,
    ) -> Self {
        Payload {
            command: command.into(),
            db: db.into(),
            key: key.into(),
            args,
            reply,
        }
    }

    /// Arguments grouped two at a time: `(a, b), (c, d), ...`
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.args
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect()
    }

    /// Send a reply to the destination, if any, tagged with this
    /// payload's key.
    pub fn respond(&self, reply: Reply) {
        if let Some(dest) = &self.reply {
            let _ = dest.send(Delivery::Response {
                key: self.key.clone(),
                reply,
            });
        }
    }
}

/// Stateless dispatch of payloads to keyspace partitions. Delivery is
/// best-effort with no acknowledgement; per (sender, partition) ordering
/// is FIFO by construction of the mailboxes.
#[derive(Clone)]
pub struct Router {
    partitions: Arc<Vec<mpsc::UnboundedSender<ManagerMsg>>>,
}

impl Router {
    pub fn new(partitions: Vec<mpsc::UnboundedSender<ManagerMsg>>) -> Self {
        assert!(!partitions.is_empty(), "router needs at least one partition");
        Router {
            partitions: Arc::new(partitions),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// The partition index owning a key.
    pub fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    /// Deliver to the partition owning `payload.key`.
    pub fn route(&self, payload: Payload) {
        let index = self.partition_for(&payload.key);
        let _ = self.partitions[index].send(ManagerMsg::Command(payload));
    }

    /// Deliver a copy of the payload to every partition.
    pub fn broadcast(&self, payload: Payload) {
        for partition in self.partitions.iter() {
            let _ = partition.send(ManagerMsg::Command(payload.clone()));
        }
    }
}
