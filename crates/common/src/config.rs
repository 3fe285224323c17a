use serde::{Deserialize, Serialize};

/// Byte budgets for the worker-wide memory pools, initialized at worker
/// construction and torn down at worker shutdown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryPoolConfig {
    /// Budget for host-side staging buffers shared by all stages.
    pub cpu_pool_bytes: usize,
    /// Budget per GPU device for kernel input/output buffers.
    pub gpu_pool_bytes: usize,
}

impl Default for MemoryPoolConfig {
    fn default() -> Self {
        Self {
            cpu_pool_bytes: 4 * 1024 * 1024 * 1024,
            gpu_pool_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

/// Engine/runtime configuration shared by master and workers.
///
/// The row-partitioning tunables must agree between the master and every
/// worker of a deployment: both sides re-run the IO item planner and the
/// resulting item indexes are exchanged bare over `NextIOItem`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Rows per IO item, the unit of master->worker scheduling.
    pub io_item_size: usize,
    /// Rows per intra-pipeline work item; the eval stage sub-batches kernel
    /// input in ranges of this size.
    pub work_item_size: usize,

    /// Load worker threads per node.
    pub load_workers_per_node: usize,
    /// Processing units per node; each hosts one pre/eval/post chain.
    pub pus_per_node: usize,
    /// Save worker threads per node.
    pub save_workers_per_node: usize,
    /// Steady-state cap on outstanding items per PU; the pull loop keeps
    /// `accepted - retired < pus_per_node * tasks_in_queue_per_pu`.
    pub tasks_in_queue_per_pu: usize,

    /// GPU ordinals available on this node, in round-robin assignment order.
    #[serde(default)]
    pub gpu_device_ids: Vec<i32>,

    /// Extra rows loaded before each item's start row to prime stateful
    /// kernels. The job API currently provides no way to set this; it
    /// defaults to 0 and is honored end to end when configured.
    #[serde(default)]
    pub warmup_size: usize,

    /// Memory pool budgets.
    #[serde(default)]
    pub memory: MemoryPoolConfig,

    /// Root directory (or backend-specific root key) of the blob store.
    pub storage_root: String,
    /// Master endpoint a worker connects to (for example `http://127.0.0.1:5001`).
    #[serde(default)]
    pub master_endpoint: Option<String>,
    /// Port the worker advertises to the master at registration.
    #[serde(default = "default_worker_listen_port")]
    pub worker_listen_port: u16,
}

fn default_worker_listen_port() -> u16 {
    5002
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            io_item_size: 1024,
            work_item_size: 128,
            load_workers_per_node: 2,
            pus_per_node: 1,
            save_workers_per_node: 2,
            tasks_in_queue_per_pu: 4,
            gpu_device_ids: Vec::new(),
            warmup_size: 0,
            memory: MemoryPoolConfig::default(),
            storage_root: "./strobe_db".to_string(),
            master_endpoint: None,
            worker_listen_port: default_worker_listen_port(),
        }
    }
}

impl EngineConfig {
    /// Aggregate cap on outstanding IO items enforced by the worker pull loop.
    pub fn in_flight_cap(&self) -> usize {
        self.pus_per_node * self.tasks_in_queue_per_pu
    }
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;

    #[test]
    fn defaults_round_trip_through_json() {
        let config = EngineConfig::default();
        let encoded = serde_json::to_string(&config).expect("encode");
        let decoded: EngineConfig = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.io_item_size, config.io_item_size);
        assert_eq!(decoded.worker_listen_port, 5002);
        assert_eq!(decoded.warmup_size, 0);
    }

    #[test]
    fn in_flight_cap_multiplies_pus_by_queue_depth() {
        let config = EngineConfig {
            pus_per_node: 3,
            tasks_in_queue_per_pu: 5,
            ..EngineConfig::default()
        };
        assert_eq!(config.in_flight_cap(), 15);
    }
}
