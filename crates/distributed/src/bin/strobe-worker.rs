use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use strobe_common::{EngineConfig, MemoryPoolConfig};
use strobe_distributed::grpc::{GrpcMasterControlPlane, WorkerServer, WorkerService};
use strobe_distributed::worker::{MasterControlPlane, WorkerController};
use strobe_engine::{EvaluatorRegistry, KernelRegistry};
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

fn env_u16_or_default(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_gpu_ids(key: &str) -> Vec<i32> {
    env::var(key)
        .ok()
        .map(|v| {
            v.split(',')
                .filter_map(|part| part.trim().parse::<i32>().ok())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let master_endpoint = env_or_default("STROBE_MASTER_ENDPOINT", "http://127.0.0.1:5001");
    let listen_port = env_u16_or_default("STROBE_WORKER_PORT", 5002);
    let bind: SocketAddr = format!("0.0.0.0:{listen_port}").parse()?;
    let storage_root = env_or_default("STROBE_STORAGE_ROOT", "./strobe_db");

    let config = EngineConfig {
        io_item_size: env_usize_or_default("STROBE_IO_ITEM_SIZE", 1024),
        work_item_size: env_usize_or_default("STROBE_WORK_ITEM_SIZE", 128),
        load_workers_per_node: env_usize_or_default("STROBE_LOAD_WORKERS", 2),
        pus_per_node: env_usize_or_default("STROBE_PUS_PER_NODE", 1),
        save_workers_per_node: env_usize_or_default("STROBE_SAVE_WORKERS", 2),
        tasks_in_queue_per_pu: env_usize_or_default("STROBE_TASKS_IN_QUEUE_PER_PU", 4),
        gpu_device_ids: env_gpu_ids("STROBE_GPU_DEVICE_IDS"),
        warmup_size: env_usize_or_default("STROBE_WARMUP_SIZE", 0),
        memory: MemoryPoolConfig {
            cpu_pool_bytes: env_usize_or_default(
                "STROBE_CPU_POOL_BYTES",
                MemoryPoolConfig::default().cpu_pool_bytes,
            ),
            gpu_pool_bytes: env_usize_or_default(
                "STROBE_GPU_POOL_BYTES",
                MemoryPoolConfig::default().gpu_pool_bytes,
            ),
        },
        storage_root: storage_root.clone(),
        master_endpoint: Some(master_endpoint.clone()),
        worker_listen_port: listen_port,
    };

    let backend = Arc::new(FsBackend::new(&storage_root)?);
    // Deployments register their kernel/evaluator catalogs before serving;
    // the stock binary starts with empty registries.
    let kernels = Arc::new(KernelRegistry::default());
    let evaluators = Arc::new(EvaluatorRegistry::default());

    let control: Arc<dyn MasterControlPlane> =
        Arc::new(GrpcMasterControlPlane::connect(&master_endpoint).await?);
    let controller = tokio::task::spawn_blocking(move || {
        WorkerController::connect(config, backend, kernels, evaluators, control)
    })
    .await??;
    let controller = Arc::new(controller);

    info!(
        node_id = %controller.node_id(),
        %bind,
        master = %master_endpoint,
        storage_root = %storage_root,
        "strobe-worker listening"
    );
    Server::builder()
        .add_service(WorkerServer::new(WorkerService::new(Arc::clone(&controller))))
        .serve(bind)
        .await?;

    Ok(())
}
