//! Per-connection client sessions.
//!
//! A session owns its socket and read buffer, parses frames, validates
//! commands against the descriptor table, and dispatches: client-local
//! commands run here, multi-key commands spawn an aggregator, everything
//! else is routed to the owning partition. Replies, subscription events
//! and pub/sub pushes all arrive on the session's mailbox; the socket and
//! the mailbox are multiplexed with `select!`.
//!
//! Commands are answered in request order: after dispatching, the session
//! waits for that command's reply before parsing the next frame, while
//! still forwarding any pub/sub traffic that lands in between.

use crate::aggregate;
use crate::commands::{self, NodeKind};
use crate::error::ServerError;
use crate::resp::{FrameParser, Reply};
use crate::routing::{Delivery, Destination, Payload, Router, SubKind};
use bytes::BytesMut;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

struct Session {
    id: u64,
    db: String,
    channels: HashSet<String>,
    patterns: HashSet<String>,
    closing: bool,
    router: Router,
    tx: Destination,
    shutdown: mpsc::Sender<()>,
}

pub async fn run<S>(mut stream: S, router: Router, shutdown: mpsc::Sender<()>) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = Session {
        id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
        db: "0".to_string(),
        channels: HashSet::new(),
        patterns: HashSet::new(),
        closing: false,
        router,
        tx,
        shutdown,
    };
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        loop {
            match FrameParser::parse(&mut buf) {
                Ok(Some(frame)) => {
                    let tokens = frame.into_tokens();
                    if tokens.is_empty() {
                        continue;
                    }
                    session.handle(tokens, &mut stream, &mut rx).await?;
                    if session.closing {
                        stream.flush().await?;
                        session.cleanup();
                        return Ok(());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let error = Reply::err(format!("ERR Protocol error: {e}"));
                    stream.write_all(&error.serialize()).await?;
                    session.cleanup();
                    return Ok(());
                }
            }
        }

        tokio::select! {
            read = stream.read_buf(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!("session {} closed by peer", session.id);
                        session.cleanup();
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        session.cleanup();
                        return Err(e);
                    }
                }
            }
            delivery = rx.recv() => {
                if let Some(delivery) = delivery {
                    session.deliver(delivery, &mut stream).await?;
                }
            }
        }
    }
}

impl Session {
    async fn handle<S>(
        &mut self,
        tokens: Vec<String>,
        stream: &mut S,
        rx: &mut mpsc::UnboundedReceiver<Delivery>,
    ) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = tokens[0].to_lowercase();
        let spec = match commands::lookup(&name) {
            Some(spec) => spec,
            None => {
                return self
                    .write(stream, ServerError::UnknownCommand(name).into_reply())
                    .await
            }
        };

        let (key, args) = if spec.keyed {
            if tokens.len() < 2 {
                return self.wrong_args(stream, &name).await;
            }
            (tokens[1].clone(), tokens[2..].to_vec())
        } else {
            (String::new(), tokens[1..].to_vec())
        };
        if !spec.arity.accepts(args.len()) {
            return self.wrong_args(stream, &name).await;
        }

        if spec.kind == NodeKind::Client {
            return self.client_command(&name, args, stream, rx).await;
        }

        let payload = Payload::new(name.clone(), self.db.clone(), key, args, Some(self.tx.clone()));
        if commands::is_aggregate(&name) {
            aggregate::dispatch(payload, self.router.clone());
        } else {
            self.router.route(payload);
        }
        self.await_replies(1, stream, rx).await
    }

    async fn client_command<S>(
        &mut self,
        name: &str,
        args: Vec<String>,
        stream: &mut S,
        rx: &mut mpsc::UnboundedReceiver<Delivery>,
    ) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match name {
            "select" => {
                self.db = args[0].clone();
                self.write(stream, Reply::Ok).await
            }
            // Client library handshakes (SETINFO, SETNAME) are accepted
            // and ignored.
            "client" => self.write(stream, Reply::Ok).await,
            "echo" => {
                let message = args.into_iter().next().unwrap_or_default();
                self.write(stream, Reply::Bulk(message)).await
            }
            "ping" => match args.into_iter().next() {
                Some(message) => self.write(stream, Reply::Bulk(message)).await,
                None => self.write(stream, Reply::Simple("PONG".into())).await,
            },
            "time" => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                self.write(
                    stream,
                    Reply::Array(vec![
                        Reply::Bulk(now.as_secs().to_string()),
                        Reply::Bulk(now.subsec_micros().to_string()),
                    ]),
                )
                .await
            }
            "quit" => {
                self.closing = true;
                self.write(stream, Reply::Ok).await
            }
            "shutdown" => {
                let _ = self.shutdown.try_send(());
                self.closing = true;
                Ok(())
            }
            "subscribe" => {
                let count = args.len();
                for channel in args {
                    self.router.route(Payload::new(
                        "_subscribe",
                        self.db.clone(),
                        channel,
                        vec![self.id.to_string()],
                        Some(self.tx.clone()),
                    ));
                }
                self.await_replies(count, stream, rx).await
            }
            "unsubscribe" => {
                let targets: Vec<String> = if args.is_empty() {
                    self.channels.iter().cloned().collect()
                } else {
                    args
                };
                if targets.is_empty() {
                    return self
                        .write(
                            stream,
                            Reply::Array(vec![
                                Reply::Bulk("unsubscribe".into()),
                                Reply::Nil,
                                Reply::Int(self.subscription_count()),
                            ]),
                        )
                        .await;
                }
                let count = targets.len();
                for channel in targets {
                    self.router.route(Payload::new(
                        "_unsubscribe",
                        self.db.clone(),
                        channel,
                        vec![self.id.to_string()],
                        Some(self.tx.clone()),
                    ));
                }
                self.await_replies(count, stream, rx).await
            }
            "psubscribe" => {
                let count = args.len();
                for pattern in args {
                    self.router.broadcast(Payload::new(
                        "_psubscribe",
                        self.db.clone(),
                        "",
                        vec![pattern, self.id.to_string()],
                        Some(self.tx.clone()),
                    ));
                }
                self.await_replies(count, stream, rx).await
            }
            "punsubscribe" => {
                let targets: Vec<String> = if args.is_empty() {
                    self.patterns.iter().cloned().collect()
                } else {
                    args
                };
                if targets.is_empty() {
                    return self
                        .write(
                            stream,
                            Reply::Array(vec![
                                Reply::Bulk("punsubscribe".into()),
                                Reply::Nil,
                                Reply::Int(self.subscription_count()),
                            ]),
                        )
                        .await;
                }
                let count = targets.len();
                for pattern in targets {
                    self.router.broadcast(Payload::new(
                        "_punsubscribe",
                        self.db.clone(),
                        "",
                        vec![pattern, self.id.to_string()],
                        Some(self.tx.clone()),
                    ));
                }
                self.await_replies(count, stream, rx).await
            }
            _ => self.write(stream, Reply::err(format!("ERR unknown command '{name}'"))).await,
        }
    }

    /// Wait for `count` command replies or subscription events, passing
    /// through any pub/sub pushes that arrive in between.
    async fn await_replies<S>(
        &mut self,
        count: usize,
        stream: &mut S,
        rx: &mut mpsc::UnboundedReceiver<Delivery>,
    ) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut remaining = count;
        while remaining > 0 {
            match rx.recv().await {
                Some(delivery) => {
                    if self.deliver(delivery, stream).await? {
                        remaining -= 1;
                    }
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Returns whether the delivery answered a pending command.
    async fn deliver<S>(&mut self, delivery: Delivery, stream: &mut S) -> std::io::Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match delivery {
            Delivery::Response { reply, .. } => {
                self.write(stream, reply).await?;
                Ok(true)
            }
            Delivery::Subscribed { kind, name, active } => {
                let set = match kind {
                    SubKind::Channel => &mut self.channels,
                    SubKind::Pattern => &mut self.patterns,
                };
                if active {
                    set.insert(name.clone());
                } else {
                    set.remove(&name);
                }
                let event = match (kind, active) {
                    (SubKind::Channel, true) => "subscribe",
                    (SubKind::Channel, false) => "unsubscribe",
                    (SubKind::Pattern, true) => "psubscribe",
                    (SubKind::Pattern, false) => "punsubscribe",
                };
                let total = self.subscription_count();
                self.write(
                    stream,
                    Reply::Array(vec![
                        Reply::Bulk(event.into()),
                        Reply::Bulk(name),
                        Reply::Int(total),
                    ]),
                )
                .await?;
                Ok(true)
            }
            Delivery::Push(reply) => {
                self.write(stream, reply).await?;
                Ok(false)
            }
        }
    }

    fn subscription_count(&self) -> i64 {
        (self.channels.len() + self.patterns.len()) as i64
    }

    async fn write<S>(&self, stream: &mut S, reply: Reply) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        stream.write_all(&reply.serialize()).await
    }

    async fn wrong_args<S>(&self, stream: &mut S, name: &str) -> std::io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.write(stream, ServerError::WrongArgCount(name.to_string()).into_reply())
            .await
    }

    /// Drop every remaining subscription when the connection goes away.
    fn cleanup(&mut self) {
        for channel in self.channels.drain() {
            self.router.route(Payload::new(
                "_unsubscribe",
                self.db.clone(),
                channel,
                vec![self.id.to_string()],
                None,
            ));
        }
        for pattern in self.patterns.drain() {
            self.router.broadcast(Payload::new(
                "_punsubscribe",
                self.db.clone(),
                "",
                vec![pattern, self.id.to_string()],
                None,
            ));
        }
    }
}
