//! Master scheduler state machine and job orchestration.
//!
//! Responsibilities:
//! - register workers and assign node ids;
//! - plan IO items for a submitted job and serve `NextIOItem` pulls in
//!   strictly ascending order, returning -1 at drain;
//! - fan `NewJob` out to every worker in parallel and wait for all of them;
//! - persist `DatabaseMetadata` and the `JobDescriptor` once every worker
//!   drained, through the backend's atomic save.
//!
//! Failure semantics:
//! - zero registered workers abort a job before any persistence;
//! - the first worker failure aborts the job and nothing is persisted;
//! - `RegisterWorker` is rejected while a job is running (membership is
//!   fixed for a job's duration).

use std::sync::{Arc, Mutex};
use std::thread;

use serde::{Deserialize, Serialize};
use strobe_common::metrics::global_metrics;
use strobe_common::{EngineConfig, JobId, NodeId, Result, StrobeError};
use strobe_engine::meta::{ColumnDesc, ColumnType, DatabaseMetadata, JobDescriptor};
use strobe_engine::{create_io_items, job_output_columns, write_job_descriptor, EvaluatorRegistry, TaskSet};
use strobe_storage::StorageBackend;
use tracing::{error, info};

/// Job submission payload shared by the RPC layer and embedded use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParameters {
    /// Output namespace for saved columns; also recorded in the catalog.
    pub job_name: String,
    /// The pipeline description.
    pub task_set: TaskSet,
}

/// Master-side handle to one registered worker.
pub trait WorkerStub: Send + Sync {
    /// Advertised `host:port` of the worker.
    fn address(&self) -> &str;
    /// Run a job on the worker; blocks until its pipeline drains.
    fn new_job(&self, job_id: JobId, params: &JobParameters) -> Result<()>;
}

/// Everything `run_job` needs outside the master lock.
struct PreparedJob {
    job_id: JobId,
    descriptor: JobDescriptor,
    workers: Vec<Arc<dyn WorkerStub>>,
}

/// Master scheduler state. Lives behind `Arc<Mutex<_>>`; every operation
/// holds the lock briefly so `NextIOItem` stays serviceable while a job's
/// worker fan-out is in flight.
pub struct Master {
    config: EngineConfig,
    backend: Arc<dyn StorageBackend>,
    evaluators: Arc<EvaluatorRegistry>,
    workers: Vec<Arc<dyn WorkerStub>>,
    num_io_items: i64,
    next_io_item_to_allocate: i64,
    job_running: bool,
    current_job_name: String,
}

impl Master {
    /// Create a master over a storage backend and evaluator registry.
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn StorageBackend>,
        evaluators: Arc<EvaluatorRegistry>,
    ) -> Self {
        Self {
            config,
            backend,
            evaluators,
            workers: Vec::new(),
            num_io_items: 0,
            next_io_item_to_allocate: 0,
            job_running: false,
            current_job_name: String::new(),
        }
    }

    /// Register a worker and return its node id. Workers are accepted only
    /// between jobs; membership is fixed while a job runs.
    pub fn register_worker(&mut self, stub: Arc<dyn WorkerStub>) -> Result<NodeId> {
        if self.job_running {
            return Err(StrobeError::InvalidConfig(
                "worker registration rejected while a job is running".to_string(),
            ));
        }
        let node_id = NodeId(self.workers.len() as i32);
        info!(node_id = %node_id, address = stub.address(), "worker registered");
        self.workers.push(stub);
        Ok(node_id)
    }

    /// Registered worker count.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Serve one IO item id; -1 once the current job's items are exhausted.
    /// Ids are strictly ascending: a single counter, no ties possible.
    pub fn next_io_item(&mut self) -> i64 {
        if self.next_io_item_to_allocate < self.num_io_items {
            let item = self.next_io_item_to_allocate;
            self.next_io_item_to_allocate += 1;
            global_metrics().record_io_item_served(&self.current_job_name);
            item
        } else {
            -1
        }
    }

    fn prepare_job(&mut self, params: &JobParameters) -> Result<PreparedJob> {
        if self.workers.is_empty() {
            return Err(StrobeError::InvalidConfig(
                "cannot run a job with zero registered workers".to_string(),
            ));
        }
        if self.job_running {
            return Err(StrobeError::InvalidConfig(format!(
                "job {} still running",
                self.current_job_name
            )));
        }

        let output_columns = job_output_columns(&params.task_set, &self.evaluators)?;
        let columns = output_columns
            .into_iter()
            .enumerate()
            .map(|(id, name)| ColumnDesc {
                id: id as i32,
                name,
                column_type: ColumnType::None,
            })
            .collect();

        let meta = DatabaseMetadata::read_or_default(self.backend.as_ref())?;
        let job_id = meta.next_job_id();

        let (io_items, _) = create_io_items(
            &params.task_set,
            self.config.io_item_size,
            self.config.warmup_size,
        );
        self.num_io_items = io_items.len() as i64;
        self.next_io_item_to_allocate = 0;
        self.job_running = true;
        self.current_job_name = params.job_name.clone();

        let descriptor = JobDescriptor {
            id: job_id,
            name: params.job_name.clone(),
            io_item_size: self.config.io_item_size,
            work_item_size: self.config.work_item_size,
            num_nodes: self.workers.len(),
            columns,
            tasks: params.task_set.tasks.clone(),
        };

        info!(
            job_id = %job_id,
            job = %params.job_name,
            io_items = self.num_io_items,
            workers = self.workers.len(),
            "job prepared"
        );
        Ok(PreparedJob {
            job_id,
            descriptor,
            workers: self.workers.clone(),
        })
    }

    fn finish_job(&mut self, prepared: &PreparedJob) -> Result<()> {
        let mut meta = DatabaseMetadata::read_or_default(self.backend.as_ref())?;
        let job_id = meta.add_job(&prepared.descriptor.name);
        if job_id != prepared.job_id {
            self.job_running = false;
            return Err(StrobeError::Execution(format!(
                "catalog moved underneath the running job: expected {} got {job_id}",
                prepared.job_id
            )));
        }
        meta.write(self.backend.as_ref())?;
        write_job_descriptor(self.backend.as_ref(), &prepared.descriptor)?;
        self.job_running = false;
        info!(job_id = %job_id, job = %prepared.descriptor.name, "job metadata persisted");
        Ok(())
    }

    fn abort_job(&mut self) {
        self.job_running = false;
    }
}

/// Run one job to completion: prepare under the lock, fan `NewJob` out to
/// every worker on its own thread, wait for all of them, then persist
/// metadata. The first worker failure aborts the job with nothing persisted.
pub fn run_job(master: &Arc<Mutex<Master>>, params: JobParameters) -> Result<JobId> {
    let prepared = master
        .lock()
        .expect("master lock poisoned")
        .prepare_job(&params)?;

    let results: Vec<Result<()>> = thread::scope(|scope| {
        let handles: Vec<_> = prepared
            .workers
            .iter()
            .map(|worker| {
                let params = &params;
                let job_id = prepared.job_id;
                scope.spawn(move || worker.new_job(job_id, params))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(StrobeError::Execution(
                        "worker new_job thread panicked".to_string(),
                    ))
                })
            })
            .collect()
    });

    if let Some(first_failure) = results.into_iter().find_map(|r| r.err()) {
        error!(job = %params.job_name, error = %first_failure, "job aborted");
        master.lock().expect("master lock poisoned").abort_job();
        return Err(first_failure);
    }

    master
        .lock()
        .expect("master lock poisoned")
        .finish_job(&prepared)?;
    Ok(prepared.job_id)
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use strobe_common::{DeviceType, EngineConfig, JobId};
    use strobe_engine::{EvaluatorDef, EvaluatorInfo, Task, TableSample};
    use strobe_storage::{layout, FsBackend};

    use super::*;

    struct NoopWorkerStub;

    impl WorkerStub for NoopWorkerStub {
        fn address(&self) -> &str {
            "test:5002"
        }

        fn new_job(&self, _job_id: JobId, _params: &JobParameters) -> Result<()> {
            Ok(())
        }
    }

    fn temp_backend(prefix: &str) -> Arc<FsBackend> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        Arc::new(
            FsBackend::new(std::env::temp_dir().join(format!("{prefix}_{nanos}"))).expect("backend"),
        )
    }

    fn evaluators() -> Arc<EvaluatorRegistry> {
        let registry = EvaluatorRegistry::default();
        registry.register(EvaluatorInfo {
            name: "decode".to_string(),
            output_columns: vec!["frame".to_string(), "frame_info".to_string()],
        });
        Arc::new(registry)
    }

    fn params_with_rows(rows: i64) -> JobParameters {
        JobParameters {
            job_name: "test_job".to_string(),
            task_set: TaskSet {
                tasks: vec![Task {
                    samples: vec![TableSample {
                        job_id: JobId(0),
                        table_id: strobe_common::TableId(0),
                        column_ids: vec![strobe_common::ColumnId(0)],
                        rows: (0..rows).collect(),
                    }],
                }],
                evaluators: vec![EvaluatorDef {
                    name: "decode".to_string(),
                    device_type: DeviceType::Cpu,
                    device_count: 1,
                    kernel_args: Vec::new(),
                    inputs: Vec::new(),
                }],
            },
        }
    }

    fn master_with_workers(backend: Arc<FsBackend>, workers: usize) -> Master {
        let config = EngineConfig {
            io_item_size: 1000,
            ..EngineConfig::default()
        };
        let mut master = Master::new(config, backend, evaluators());
        for _ in 0..workers {
            master
                .register_worker(Arc::new(NoopWorkerStub))
                .expect("register");
        }
        master
    }

    #[test]
    fn node_ids_are_assigned_in_registration_order() {
        let mut master = master_with_workers(temp_backend("strobe_master_ids"), 0);
        for expected in 0..3 {
            let id = master
                .register_worker(Arc::new(NoopWorkerStub))
                .expect("register");
            assert_eq!(id, strobe_common::NodeId(expected));
        }
        assert_eq!(master.num_workers(), 3);
    }

    #[test]
    fn next_io_item_serves_ascending_then_drains() {
        let backend = temp_backend("strobe_master_items");
        let mut master = master_with_workers(backend, 1);
        // Before any job is prepared there is nothing to serve.
        assert_eq!(master.next_io_item(), -1);

        let prepared = master.prepare_job(&params_with_rows(2500)).expect("prepare");
        assert_eq!(prepared.descriptor.columns.len(), 2);
        assert_eq!(master.next_io_item(), 0);
        assert_eq!(master.next_io_item(), 1);
        assert_eq!(master.next_io_item(), 2);
        assert_eq!(master.next_io_item(), -1);
        assert_eq!(master.next_io_item(), -1);
    }

    #[test]
    fn zero_workers_abort_before_any_persistence() {
        let backend = temp_backend("strobe_master_zero");
        let master = Arc::new(Mutex::new(master_with_workers(backend.clone(), 0)));
        let err = run_job(&master, params_with_rows(100)).expect_err("must abort");
        assert!(matches!(err, StrobeError::InvalidConfig(_)));
        assert!(!backend.exists(&layout::db_metadata_path()));
    }

    #[test]
    fn registration_is_rejected_mid_job() {
        let backend = temp_backend("strobe_master_midjob");
        let mut master = master_with_workers(backend, 1);
        master.prepare_job(&params_with_rows(100)).expect("prepare");
        let err = master
            .register_worker(Arc::new(NoopWorkerStub))
            .expect_err("mid-job registration must fail");
        assert!(matches!(err, StrobeError::InvalidConfig(_)));
        master.abort_job();
        assert!(master.register_worker(Arc::new(NoopWorkerStub)).is_ok());
    }

    #[test]
    fn first_worker_failure_aborts_without_persistence() {
        struct FailingStub;
        impl WorkerStub for FailingStub {
            fn address(&self) -> &str {
                "bad:5002"
            }
            fn new_job(&self, _job_id: JobId, _params: &JobParameters) -> Result<()> {
                Err(StrobeError::Execution("kernel exploded".to_string()))
            }
        }

        let backend = temp_backend("strobe_master_fail");
        let config = EngineConfig::default();
        let mut master = Master::new(config, backend.clone(), evaluators());
        master.register_worker(Arc::new(NoopWorkerStub)).expect("ok worker");
        master.register_worker(Arc::new(FailingStub)).expect("bad worker");
        let master = Arc::new(Mutex::new(master));

        let err = run_job(&master, params_with_rows(100)).expect_err("must abort");
        assert!(matches!(err, StrobeError::Execution(_)));
        assert!(!backend.exists(&layout::db_metadata_path()));
        // The abort reset the running flag: a resubmission reaches the
        // workers again instead of bouncing off "job still running".
        let err = run_job(&master, params_with_rows(100)).expect_err("worker still failing");
        assert!(matches!(err, StrobeError::Execution(_)));
    }

    #[test]
    fn completed_jobs_assign_sequential_ids_and_identical_schemas() {
        let backend = temp_backend("strobe_master_rerun");
        let master = Arc::new(Mutex::new(master_with_workers(backend.clone(), 1)));

        let first = run_job(&master, params_with_rows(100)).expect("first run");
        let second = run_job(&master, params_with_rows(100)).expect("second run");
        assert_eq!(first, JobId(0));
        assert_eq!(second, JobId(1));

        let d0 = strobe_engine::read_job_descriptor(backend.as_ref(), first).expect("d0");
        let d1 = strobe_engine::read_job_descriptor(backend.as_ref(), second).expect("d1");
        assert_eq!(d0.columns, d1.columns);
        assert_eq!(d0.name, d1.name);

        let meta = DatabaseMetadata::read_or_default(backend.as_ref()).expect("meta");
        assert_eq!(meta.jobs().len(), 2);
    }
}
