//! Worker controller: per-job lifecycle on one node.
//!
//! Responsibilities:
//! - register with the master at construction (hostname discovery failure is
//!   fatal) and receive the node id;
//! - on `NewJob`: bind the evaluator chain, re-plan IO items, build the
//!   internal pipeline, pull items from the master until drain, drive the
//!   ordered shutdown and emit the node profiler file;
//! - expose in-process control-plane/stub adapters for embedded use and
//!   tests (the gRPC adapters live in `grpc`, feature-gated).
//!
//! Pull semantics: the loop keeps `accepted - retired` strictly below
//! `pus_per_node * tasks_in_queue_per_pu` and yields between iterations;
//! `NextIOItem` failures abort the job rather than masquerading as drain.

use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use strobe_common::metrics::global_metrics;
use strobe_common::{EngineConfig, JobId, MemoryPools, NodeId, Result, StrobeError};
use strobe_engine::{
    build_evaluator_chain, create_io_items, EvaluatorRegistry, KernelRegistry, NodeProfile,
    Pipeline, PipelineConfig, ProfilerBase,
};
use strobe_storage::{layout, save_blob, StorageBackend};
use tracing::{debug, info};

use crate::master::{JobParameters, Master, WorkerStub};

/// Worker-side view of the master control plane.
///
/// Synchronous by design: the pull loop runs on a blocking OS thread, like
/// every other stage of the pipeline. The gRPC implementation bridges onto
/// its async client internally.
pub trait MasterControlPlane: Send + Sync {
    /// Register this worker's advertised address; returns the node id.
    fn register_worker(&self, address: &str) -> Result<NodeId>;
    /// Pull the next IO item id; -1 signals drain.
    fn next_io_item(&self) -> Result<i64>;
}

/// Per-node job runner.
pub struct WorkerController {
    config: EngineConfig,
    node_id: NodeId,
    control: Arc<dyn MasterControlPlane>,
    backend: Arc<dyn StorageBackend>,
    kernels: Arc<KernelRegistry>,
    evaluators: Arc<EvaluatorRegistry>,
    pools: Arc<MemoryPools>,
}

impl WorkerController {
    /// Discover the local hostname, register with the master and initialize
    /// the memory pools. Hostname discovery failure is fatal.
    pub fn connect(
        config: EngineConfig,
        backend: Arc<dyn StorageBackend>,
        kernels: Arc<KernelRegistry>,
        evaluators: Arc<EvaluatorRegistry>,
        control: Arc<dyn MasterControlPlane>,
    ) -> Result<Self> {
        let host = hostname::get()
            .map_err(|e| StrobeError::InvalidConfig(format!("hostname discovery failed: {e}")))?;
        let host = host.to_str().ok_or_else(|| {
            StrobeError::InvalidConfig("hostname is not valid utf-8".to_string())
        })?;
        let address = format!("{host}:{}", config.worker_listen_port);
        let node_id = control.register_worker(&address)?;
        let pools = MemoryPools::new(config.memory, &config.gpu_device_ids);
        info!(node_id = %node_id, address = %address, "worker connected to master");
        Ok(Self {
            config,
            node_id,
            control,
            backend,
            kernels,
            evaluators,
            pools,
        })
    }

    /// Node id assigned by the master.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Run one job to completion: pull items until the master reports drain,
    /// shut the pipeline down in stage order, write the profiler file.
    pub fn new_job(&self, job_id: JobId, params: &JobParameters) -> Result<()> {
        let base = ProfilerBase::capture();

        let chain = build_evaluator_chain(
            &params.task_set,
            &self.kernels,
            &self.evaluators,
            &self.config.gpu_device_ids,
        )?;
        let (io_items, load_work_entries) = create_io_items(
            &params.task_set,
            self.config.io_item_size,
            self.config.warmup_size,
        );
        let io_items = Arc::new(io_items);
        info!(
            job_id = %job_id,
            job = %params.job_name,
            node_id = %self.node_id,
            io_items = io_items.len(),
            kernels = chain.len(),
            "job accepted"
        );

        let pipeline = Pipeline::build(
            PipelineConfig {
                job_name: params.job_name.clone(),
                load_workers: self.config.load_workers_per_node,
                pus: self.config.pus_per_node,
                save_workers: self.config.save_workers_per_node,
                tasks_in_queue_per_pu: self.config.tasks_in_queue_per_pu,
                work_item_size: self.config.work_item_size,
            },
            Arc::clone(&io_items),
            Arc::new(chain),
            Arc::clone(&self.backend),
            Arc::clone(&self.pools),
            base,
        );

        let start_time_ns = base.now_ns();
        let threshold = self.config.in_flight_cap() as i64;
        let mut accepted: i64 = 0;
        loop {
            let retired = pipeline.retired_items();
            if accepted - retired < threshold {
                let next = self.control.next_io_item()?;
                if next == -1 {
                    break;
                }
                let entry = load_work_entries
                    .get(next as usize)
                    .cloned()
                    .ok_or_else(|| {
                        StrobeError::Rpc(format!("master served out-of-range io item {next}"))
                    })?;
                debug!(io_item = next, "io item accepted");
                pipeline.push(entry)?;
                accepted += 1;
                global_metrics()
                    .set_in_flight(&params.job_name, accepted - pipeline.retired_items());
            }
            thread::yield_now();
        }

        let profile = pipeline.shutdown()?;
        let end_time_ns = base.now_ns();
        global_metrics().set_in_flight(&params.job_name, 0);

        let saved: usize = profile.save.iter().map(|p| p.intervals().len()).sum();
        debug_assert_eq!(saved as i64, accepted, "retired items must match accepted");

        let node_profile = NodeProfile {
            start_time_ns,
            end_time_ns,
            out_rank: self.node_id.0 as i64,
            load: profile.load,
            eval: profile.eval,
            save: profile.save,
        };
        save_blob(
            self.backend.as_ref(),
            &layout::job_profiler_path(job_id, self.node_id),
            &node_profile.encode(),
        )?;

        info!(
            job_id = %job_id,
            job = %params.job_name,
            node_id = %self.node_id,
            accepted,
            "job drained"
        );
        Ok(())
    }
}

/// In-process control plane over a shared [`Master`], for embedded runtimes
/// and tests. Registration creates an [`InProcessWorkerStub`] that is bound
/// to its controller once the controller exists.
pub struct InProcessMasterControlPlane {
    master: Arc<Mutex<Master>>,
    stubs: Mutex<Vec<Arc<InProcessWorkerStub>>>,
}

impl InProcessMasterControlPlane {
    /// Create an adapter over shared master state.
    pub fn new(master: Arc<Mutex<Master>>) -> Arc<Self> {
        Arc::new(Self {
            master,
            stubs: Mutex::new(Vec::new()),
        })
    }

    /// Bind the stub registered for `node_id` to its controller.
    pub fn bind(&self, node_id: NodeId, controller: Arc<WorkerController>) {
        let stubs = self.stubs.lock().expect("stub list lock poisoned");
        if let Some(stub) = stubs.get(node_id.0 as usize) {
            stub.bind(Arc::clone(&controller));
        }
    }
}

impl MasterControlPlane for InProcessMasterControlPlane {
    fn register_worker(&self, address: &str) -> Result<NodeId> {
        let stub = Arc::new(InProcessWorkerStub::new(address));
        let node_id = self
            .master
            .lock()
            .expect("master lock poisoned")
            .register_worker(stub.clone())?;
        self.stubs.lock().expect("stub list lock poisoned").push(stub);
        Ok(node_id)
    }

    fn next_io_item(&self) -> Result<i64> {
        Ok(self
            .master
            .lock()
            .expect("master lock poisoned")
            .next_io_item())
    }
}

/// In-process [`WorkerStub`] calling straight into a [`WorkerController`].
pub struct InProcessWorkerStub {
    address: String,
    controller: OnceLock<Arc<WorkerController>>,
}

impl InProcessWorkerStub {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            controller: OnceLock::new(),
        }
    }

    fn bind(&self, controller: Arc<WorkerController>) {
        let _ = self.controller.set(controller);
    }
}

impl WorkerStub for InProcessWorkerStub {
    fn address(&self) -> &str {
        &self.address
    }

    fn new_job(&self, job_id: JobId, params: &JobParameters) -> Result<()> {
        self.controller
            .get()
            .ok_or_else(|| {
                StrobeError::Execution(format!(
                    "worker stub for {} not bound to a controller",
                    self.address
                ))
            })?
            .new_job(job_id, params)
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
