use std::env;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use strobe_common::EngineConfig;
use strobe_distributed::grpc::{MasterServer, MasterService};
use strobe_distributed::Master;
use strobe_engine::EvaluatorRegistry;
use strobe_storage::FsBackend;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize_or_default(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let bind = env_or_default("STROBE_MASTER_BIND", "0.0.0.0:5001");
    let addr: SocketAddr = bind.parse()?;
    let storage_root = env_or_default("STROBE_STORAGE_ROOT", "./strobe_db");
    let io_item_size = env_usize_or_default("STROBE_IO_ITEM_SIZE", 1024);
    let work_item_size = env_usize_or_default("STROBE_WORK_ITEM_SIZE", 128);
    let warmup_size = env_usize_or_default("STROBE_WARMUP_SIZE", 0);

    let config = EngineConfig {
        io_item_size,
        work_item_size,
        warmup_size,
        storage_root: storage_root.clone(),
        ..EngineConfig::default()
    };
    let backend = Arc::new(FsBackend::new(&storage_root)?);
    // Deployments register their evaluator catalog before serving jobs;
    // the stock binary starts with an empty registry.
    let evaluators = Arc::new(EvaluatorRegistry::default());

    let master = Arc::new(Mutex::new(Master::new(config, backend, evaluators)));
    let service = MasterService::from_shared(master);

    info!(
        %addr,
        storage_root = %storage_root,
        io_item_size,
        work_item_size,
        "strobe-master listening"
    );
    Server::builder()
        .add_service(MasterServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}
