use std::sync::Arc;
use swarmkv::config::Config;
use swarmkv::server;
use swarmkv::snapshot::SnapshotStore;
use tracing::info;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Arc::new(Config::from_args(&args));

    let snapshots = Arc::new(SnapshotStore::open(&config.dir)?);
    info!(
        "snapshots in {}, persist-after {}ms, sleep-after {}ms",
        config.dir, config.persist_after, config.sleep_after
    );
    if !config.node.is_empty() {
        info!("node {} of {} in topology", config.node, config.nodes.len().max(1));
    }

    server::run_server(config, snapshots).await
}
