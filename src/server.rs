//! TCP front door and mesh bootstrap.

use crate::config::Config;
use crate::keyspace::{self, ManagerMsg};
use crate::routing::Router;
use crate::session;
use crate::snapshot::SnapshotStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Spawn every keyspace partition and wire up the router.
pub fn boot_mesh(config: &Arc<Config>, snapshots: &Arc<SnapshotStore>) -> Router {
    let partitions = config.partitions();
    let mut senders: Vec<mpsc::UnboundedSender<ManagerMsg>> = Vec::with_capacity(partitions);
    let mut receivers = Vec::with_capacity(partitions);
    for _ in 0..partitions {
        let (tx, rx) = mpsc::unbounded_channel();
        senders.push(tx);
        receivers.push(rx);
    }
    let router = Router::new(senders.clone());
    for (index, rx) in receivers.into_iter().enumerate() {
        keyspace::spawn(
            index,
            senders[index].clone(),
            rx,
            router.clone(),
            snapshots.clone(),
            config.clone(),
        );
    }
    info!("keyspace online with {partitions} partitions");
    router
}

pub async fn run_server(config: Arc<Config>, snapshots: Arc<SnapshotStore>) -> std::io::Result<()> {
    let router = boot_mesh(&config, &snapshots);

    let (bind, port) = config.bind_addr();
    let listener = TcpListener::bind(format!("{bind}:{port}")).await?;
    info!("listening on {bind}:{port}");

    // SHUTDOWN from any session lands here.
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!("connection from {peer}");
                let router = router.clone();
                let shutdown = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = session::run(stream, router, shutdown).await {
                        debug!("connection error from {peer}: {e}");
                    }
                    debug!("connection closed: {peer}");
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                return Ok(());
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown requested by client");
                return Ok(());
            }
        }
    }
}
