//! Value node actors.
//!
//! Each node owns exactly one typed value, identified by
//! `(db, kind, key)`, and is driven by its own mailbox: commands for one
//! key are applied strictly in arrival order. Nodes persist their value to
//! the snapshot store on write (debounced), reload it on spawn, and stop
//! on delete, passivation or rename.

pub mod bitmap;
pub mod hash;
pub mod hyperloglog;
pub mod list;
pub mod set;
pub mod sorted_set;
pub mod string;

use crate::commands::NodeKind;
use crate::config::Config;
use crate::error::ServerResult;
use crate::resp::Reply;
use crate::routing::{Payload, Router};
use crate::snapshot::{Reader, SnapshotStore};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

pub type NodeHandle = mpsc::UnboundedSender<NodeMsg>;

#[derive(Debug)]
pub enum NodeMsg {
    Command(Payload),
    /// Persistence debounce fired.
    Persist,
    /// A blocking-command timeout fired.
    Unblock { token: u64 },
    Stop { persist: bool, delete: bool },
}

/// Everything a node needs besides its value: identity, the router for
/// follow-up commands, its own mailbox for timers, and shared services.
pub struct NodeCtx {
    pub db: String,
    pub key: String,
    pub router: Router,
    pub tx: NodeHandle,
    pub snapshots: Arc<SnapshotStore>,
    pub config: Arc<Config>,
}

impl NodeCtx {
    /// Route a follow-up command with no reply expectation.
    pub fn route(&self, command: &str, key: &str, args: Vec<String>) {
        self.router
            .route(Payload::new(command, self.db.clone(), key, args, None));
    }
}

/// Result of applying one command to a value. A `None` reply means the
/// command is parked (blocking pop) and will be answered later.
pub struct Outcome {
    pub reply: Option<Reply>,
    pub wrote: bool,
}

impl Outcome {
    pub fn read(reply: Reply) -> Self {
        Outcome { reply: Some(reply), wrote: false }
    }

    pub fn wrote(reply: Reply) -> Self {
        Outcome { reply: Some(reply), wrote: true }
    }

    pub fn parked() -> Self {
        Outcome { reply: None, wrote: false }
    }
}

/// One typed value and its command set.
pub trait Value: Send + 'static {
    const KIND: NodeKind;

    fn new(ctx: &NodeCtx) -> Self;

    fn encode(&self, buf: &mut Vec<u8>);

    fn decode(ctx: &NodeCtx, reader: &mut Reader) -> io::Result<Self>
    where
        Self: Sized;

    fn apply(&mut self, ctx: &NodeCtx, payload: &Payload) -> ServerResult<Outcome>;

    /// The typed constructor command reproducing this value at another
    /// key, used by rename.
    fn store_command(&self) -> (&'static str, Vec<String>);

    /// Blocking-timeout wakeup; only lists park payloads.
    fn unblock(&mut self, _ctx: &NodeCtx, _token: u64) {}
}

/// Snapshot id token per kind. Distinct from the wire-level `TYPE` name,
/// which reports bitmaps and sketches as strings.
pub fn kind_token(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Str => "str",
        NodeKind::Hash => "hash",
        NodeKind::List => "list",
        NodeKind::Set => "set",
        NodeKind::SortedSet => "zset",
        NodeKind::Bitmap => "bitmap",
        NodeKind::HyperLogLog => "hll",
        NodeKind::Keys => "keys",
        NodeKind::Client => "client",
    }
}

pub fn node_id(db: &str, kind: NodeKind, key: &str) -> String {
    format!("{db}-{}-{key}", kind_token(kind))
}

/// Spawn the actor for a typed value and hand back its mailbox.
pub fn spawn(
    kind: NodeKind,
    db: String,
    key: String,
    router: Router,
    snapshots: Arc<SnapshotStore>,
    config: Arc<Config>,
) -> NodeHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let ctx = NodeCtx {
        db,
        key,
        router,
        tx: tx.clone(),
        snapshots,
        config,
    };
    match kind {
        NodeKind::Str => drop(tokio::spawn(run::<string::StrValue>(ctx, rx))),
        NodeKind::Hash => drop(tokio::spawn(run::<hash::HashValue>(ctx, rx))),
        NodeKind::List => drop(tokio::spawn(run::<list::ListValue>(ctx, rx))),
        NodeKind::Set => drop(tokio::spawn(run::<set::SetValue>(ctx, rx))),
        NodeKind::SortedSet => drop(tokio::spawn(run::<sorted_set::ZsetValue>(ctx, rx))),
        NodeKind::Bitmap => drop(tokio::spawn(run::<bitmap::BitValue>(ctx, rx))),
        NodeKind::HyperLogLog => drop(tokio::spawn(run::<hyperloglog::HllValue>(ctx, rx))),
        NodeKind::Keys | NodeKind::Client => unreachable!("not value node kinds"),
    }
    tx
}

async fn run<V: Value>(ctx: NodeCtx, mut rx: mpsc::UnboundedReceiver<NodeMsg>) {
    let id = node_id(&ctx.db, V::KIND, &ctx.key);
    let mut value = load::<V>(&ctx, &id).unwrap_or_else(|| V::new(&ctx));
    let mut dirty = false;
    let mut scheduled = false;

    while let Some(msg) = rx.recv().await {
        match msg {
            NodeMsg::Command(payload) => {
                if payload.command == "_rename" {
                    rename(&ctx, &value, &payload);
                    continue;
                }
                match value.apply(&ctx, &payload) {
                    Ok(outcome) => {
                        // Persist before answering so a synchronous
                        // policy really is synchronous.
                        if outcome.wrote {
                            dirty = true;
                            match ctx.config.persist_after {
                                0 => {
                                    save(&ctx, &id, &value);
                                    dirty = false;
                                }
                                ms if ms > 0 && !scheduled => {
                                    scheduled = true;
                                    let tx = ctx.tx.clone();
                                    let after = Duration::from_millis(ms as u64);
                                    tokio::spawn(async move {
                                        tokio::time::sleep(after).await;
                                        let _ = tx.send(NodeMsg::Persist);
                                    });
                                }
                                _ => {}
                            }
                        }
                        if let Some(reply) = outcome.reply {
                            payload.respond(reply);
                        }
                    }
                    Err(e) => payload.respond(e.into_reply()),
                }
            }
            NodeMsg::Persist => {
                scheduled = false;
                if dirty {
                    save(&ctx, &id, &value);
                    dirty = false;
                }
            }
            NodeMsg::Unblock { token } => value.unblock(&ctx, token),
            NodeMsg::Stop { persist, delete } => {
                if delete {
                    ctx.snapshots.delete(&id);
                } else if persist && dirty && ctx.config.persist_after >= 0 {
                    save(&ctx, &id, &value);
                }
                break;
            }
        }
    }
}

/// Rename: reproduce the value at the destination key, then delete
/// ourselves. Both follow-ups go through the router so ordering per
/// partition is preserved.
fn rename<V: Value>(ctx: &NodeCtx, value: &V, payload: &Payload) {
    let dst = match payload.args.first() {
        Some(dst) => dst.clone(),
        None => return,
    };
    let (command, args) = value.store_command();
    ctx.route(command, &dst, args);
    ctx.route("_del", &ctx.key, Vec::new());
    payload.respond(Reply::Ok);
}

fn save<V: Value>(ctx: &NodeCtx, id: &str, value: &V) {
    if ctx.config.persist_after < 0 {
        return;
    }
    let mut buf = vec![V::KIND.tag()];
    value.encode(&mut buf);
    if let Err(e) = ctx.snapshots.save(id, &buf) {
        warn!("snapshot write failed for {id}: {e}");
    }
}

fn load<V: Value>(ctx: &NodeCtx, id: &str) -> Option<V> {
    let bytes = match ctx.snapshots.load(id) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return None,
        Err(e) => {
            warn!("snapshot read failed for {id}: {e}");
            return None;
        }
    };
    let mut reader = Reader::new(&bytes);
    let tag = reader.u8().ok()?;
    if tag != V::KIND.tag() {
        warn!("snapshot {id} has wrong kind tag {tag}");
        return None;
    }
    match V::decode(ctx, &mut reader) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("snapshot {id} failed to decode: {e}");
            None
        }
    }
}

// Argument parsing helpers shared by the command enums.

pub(crate) fn int_arg(s: &str) -> ServerResult<i64> {
    s.parse().map_err(|_| crate::error::ServerError::NotInteger)
}

pub(crate) fn uint_arg(s: &str) -> ServerResult<u64> {
    s.parse().map_err(|_| crate::error::ServerError::NotInteger)
}

pub(crate) fn float_arg(s: &str) -> ServerResult<f64> {
    s.parse().map_err(|_| crate::error::ServerError::NotFloat)
}

/// Resolve a possibly negative index against a length, Redis style:
/// negative counts from the end, clamped to the start.
pub(crate) fn clamp_index(index: i64, len: usize) -> usize {
    if index < 0 {
        (len as i64 + index).max(0) as usize
    } else {
        index as usize
    }
}
