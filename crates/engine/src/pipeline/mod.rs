//! The worker-internal load -> evaluate -> save pipeline.
//!
//! Topology, per node:
//!
//! ```text
//! load_work -> [Load x N] -> initial_eval_work
//!   -> [Pre(pu) -> mid -> Eval(pu) -> post -> Post(pu)] per PU
//!   -> save_work -> [Save x M] -> store
//! ```
//!
//! Stages are OS threads joined by bounded channels; producers block when a
//! queue is full, consumers block when it is empty. Entries move strictly
//! downstream and are owned by exactly one stage at a time.
//!
//! End-of-stream is channel disconnection, not a sentinel payload: each
//! stage pool holds the only senders of its downstream queue, so dropping
//! the controller's `load_work` sender unwinds the stages one layer at a
//! time. Load workers drain and exit, which closes `initial_eval_work`,
//! and so on through save. Joining in stage order therefore guarantees that
//! every entry enqueued before shutdown has been fully processed.

mod evaluate;
mod load;
mod save;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use strobe_common::{MemoryPools, MemoryReservation, Result, StrobeError};
use strobe_storage::StorageBackend;
use tracing::debug;

use crate::kernel::{BoundKernel, ColumnBlock};
use crate::plan::{IoItem, LoadWorkEntry};
use crate::profiler::{Profiler, ProfilerBase, PuProfile};

use evaluate::{EvalWorkerArgs, PostWorkerArgs, PreWorkerArgs};
use load::LoadWorkerArgs;
use save::SaveWorkerArgs;

/// The in-flight payload between pipeline stages.
///
/// Move-only by construction: it carries the host memory reservation for its
/// buffers, released when the entry is dropped after save.
#[derive(Debug)]
pub struct EvalWorkEntry {
    /// IO item this entry belongs to; the only cross-stage identity key.
    pub io_item_index: usize,
    /// Leading rows loaded purely to prime stateful kernels; trimmed from
    /// the chain output before save.
    pub warmup_rows: usize,
    /// Per-stage column data. Schema is defined by the evaluator chain.
    pub columns: Vec<ColumnBlock>,
    /// Host pool reservation backing `columns`.
    pub host_reservation: Option<MemoryReservation>,
}

/// Worker pool sizes and batching parameters for one pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Output namespace, used for saved-output keys and metric labels.
    pub job_name: String,
    /// Load workers.
    pub load_workers: usize,
    /// Processing units, each hosting a pre/eval/post chain.
    pub pus: usize,
    /// Save workers.
    pub save_workers: usize,
    /// Bound of each per-PU queue; shared queues use `pus` times this.
    pub tasks_in_queue_per_pu: usize,
    /// Rows per eval-stage work item.
    pub work_item_size: usize,
}

/// Per-pool profilers collected at shutdown, ready for the node profile.
#[derive(Debug)]
pub struct PipelineProfile {
    /// One profiler per load worker.
    pub load: Vec<Profiler>,
    /// One chain of profilers per PU.
    pub eval: Vec<PuProfile>,
    /// One profiler per save worker.
    pub save: Vec<Profiler>,
}

/// A running pipeline: the controller's handle for feeding work and driving
/// orderly shutdown.
pub struct Pipeline {
    load_tx: Option<Sender<LoadWorkEntry>>,
    retired: Arc<AtomicI64>,
    load_handles: Vec<JoinHandle<Result<Profiler>>>,
    pre_handles: Vec<JoinHandle<Result<Profiler>>>,
    eval_handles: Vec<JoinHandle<Result<Profiler>>>,
    post_handles: Vec<JoinHandle<Result<Profiler>>>,
    save_handles: Vec<JoinHandle<Result<Profiler>>>,
}

impl Pipeline {
    /// Spawn all stage threads and wire their queues.
    pub fn build(
        config: PipelineConfig,
        io_items: Arc<Vec<IoItem>>,
        chain: Arc<Vec<BoundKernel>>,
        backend: Arc<dyn StorageBackend>,
        pools: Arc<MemoryPools>,
        base: ProfilerBase,
    ) -> Self {
        let load_workers = config.load_workers.max(1);
        let pus = config.pus.max(1);
        let save_workers = config.save_workers.max(1);
        let pu_cap = config.tasks_in_queue_per_pu.max(1);
        let shared_cap = pus * pu_cap;
        let retired = Arc::new(AtomicI64::new(0));

        let (load_tx, load_rx) = bounded::<LoadWorkEntry>(shared_cap);
        let (initial_tx, initial_rx) = bounded::<EvalWorkEntry>(shared_cap);
        let (save_tx, save_rx) = bounded::<EvalWorkEntry>(shared_cap);

        let mut load_handles = Vec::with_capacity(load_workers);
        for worker_id in 0..load_workers {
            let args = LoadWorkerArgs {
                worker_id,
                job_label: config.job_name.clone(),
                io_items: Arc::clone(&io_items),
                backend: Arc::clone(&backend),
                pools: Arc::clone(&pools),
                input: load_rx.clone(),
                output: initial_tx.clone(),
                base,
            };
            load_handles.push(thread::spawn(move || load::run_load_worker(args)));
        }
        drop(load_rx);
        drop(initial_tx);

        let mut pre_handles = Vec::with_capacity(pus);
        let mut eval_handles = Vec::with_capacity(pus);
        let mut post_handles = Vec::with_capacity(pus);
        for pu in 0..pus {
            let (mid_tx, mid_rx) = bounded::<EvalWorkEntry>(pu_cap);
            let (post_tx, post_rx) = bounded::<EvalWorkEntry>(pu_cap);

            let pre_args = PreWorkerArgs {
                pu,
                input: initial_rx.clone(),
                output: mid_tx,
                base,
            };
            pre_handles.push(thread::spawn(move || evaluate::run_pre_worker(pre_args)));

            let eval_args = EvalWorkerArgs {
                pu,
                chain: Arc::clone(&chain),
                work_item_size: config.work_item_size,
                input: mid_rx,
                output: post_tx,
                base,
            };
            eval_handles.push(thread::spawn(move || evaluate::run_eval_worker(eval_args)));

            let post_args = PostWorkerArgs {
                pu,
                io_items: Arc::clone(&io_items),
                input: post_rx,
                output: save_tx.clone(),
                base,
            };
            post_handles.push(thread::spawn(move || evaluate::run_post_worker(post_args)));
        }
        drop(initial_rx);
        drop(save_tx);

        let mut save_handles = Vec::with_capacity(save_workers);
        for worker_id in 0..save_workers {
            let args = SaveWorkerArgs {
                worker_id,
                job_name: config.job_name.clone(),
                io_items: Arc::clone(&io_items),
                backend: Arc::clone(&backend),
                retired: Arc::clone(&retired),
                input: save_rx.clone(),
                base,
            };
            save_handles.push(thread::spawn(move || save::run_save_worker(args)));
        }
        drop(save_rx);

        Self {
            load_tx: Some(load_tx),
            retired,
            load_handles,
            pre_handles,
            eval_handles,
            post_handles,
            save_handles,
        }
    }

    /// Feed one load work entry; blocks while the load queue is full.
    pub fn push(&self, entry: LoadWorkEntry) -> Result<()> {
        let tx = self
            .load_tx
            .as_ref()
            .ok_or_else(|| StrobeError::Execution("pipeline already shut down".to_string()))?;
        tx.send(entry)
            .map_err(|_| StrobeError::Execution("load stage exited early".to_string()))
    }

    /// Items fully committed by save workers so far.
    pub fn retired_items(&self) -> i64 {
        self.retired.load(Ordering::SeqCst)
    }

    /// Drain and join every stage in strict order, collecting profilers.
    ///
    /// The first stage error (or panic) aborts the job, but every thread is
    /// joined regardless so no worker outlives the pipeline.
    pub fn shutdown(mut self) -> Result<PipelineProfile> {
        drop(self.load_tx.take());

        let mut first_err: Option<StrobeError> = None;
        let load = join_pool(self.load_handles, "load", &mut first_err);
        let pre = join_pool(self.pre_handles, "pre", &mut first_err);
        let eval = join_pool(self.eval_handles, "eval", &mut first_err);
        let post = join_pool(self.post_handles, "post", &mut first_err);
        let save = join_pool(self.save_handles, "save", &mut first_err);

        if let Some(err) = first_err {
            return Err(err);
        }

        let eval_chains = pre
            .into_iter()
            .zip(eval)
            .zip(post)
            .map(|((pre, eval), post)| PuProfile { pre, eval, post })
            .collect();
        debug!("pipeline drained and joined");
        Ok(PipelineProfile {
            load,
            eval: eval_chains,
            save,
        })
    }
}

fn join_pool(
    handles: Vec<JoinHandle<Result<Profiler>>>,
    pool: &str,
    first_err: &mut Option<StrobeError>,
) -> Vec<Profiler> {
    let mut profilers = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.join() {
            Ok(Ok(profiler)) => profilers.push(profiler),
            Ok(Err(e)) => {
                if first_err.is_none() {
                    *first_err = Some(e);
                }
            }
            Err(_) => {
                if first_err.is_none() {
                    *first_err =
                        Some(StrobeError::Execution(format!("{pool} thread panicked")));
                }
            }
        }
    }
    profilers
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use strobe_common::{
        ColumnId, DeviceType, JobId, MemoryPoolConfig, MemoryPools, TableId,
    };
    use strobe_storage::{encode_column, layout, save_blob, ColumnReader, FsBackend};

    use super::*;
    use crate::kernel::{
        build_evaluator_chain, ColumnBlock, EvaluatorInfo, EvaluatorRegistry, Kernel,
        KernelConfig, KernelFactory, KernelRegistry,
    };
    use crate::plan::{create_io_items, EvaluatorDef, Task, TableSample, TaskSet};

    struct UpperFactory;

    impl KernelFactory for UpperFactory {
        fn name(&self) -> &str {
            "upper"
        }

        fn device_type(&self) -> DeviceType {
            DeviceType::Cpu
        }

        fn new_kernel(&self, _config: KernelConfig) -> strobe_common::Result<Box<dyn Kernel>> {
            struct Upper;
            impl Kernel for Upper {
                fn execute(
                    &mut self,
                    input: &[ColumnBlock],
                ) -> strobe_common::Result<Vec<ColumnBlock>> {
                    let rows = input[0]
                        .rows
                        .iter()
                        .map(|r| r.to_ascii_uppercase())
                        .collect();
                    Ok(vec![ColumnBlock { rows }])
                }
            }
            Ok(Box::new(Upper))
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

    fn seed_source_column(backend: &FsBackend, rows: usize) {
        let payloads: Vec<Vec<u8>> = (0..rows).map(|i| format!("row{i}").into_bytes()).collect();
        save_blob(
            backend,
            &layout::table_column_path(JobId(0), TableId(0), ColumnId(0)),
            &encode_column(&payloads),
        )
        .expect("seed");
    }

    #[test]
    fn pipeline_processes_all_items_and_profiles_each_stage() {
        let backend = temp_backend("strobe_pipeline");
        seed_source_column(backend.as_ref(), 10);

        let task_set = TaskSet {
            tasks: vec![Task {
                samples: vec![TableSample {
                    job_id: JobId(0),
                    table_id: TableId(0),
                    column_ids: vec![ColumnId(0)],
                    rows: (0..10).collect(),
                }],
            }],
            evaluators: vec![EvaluatorDef {
                name: "upper".to_string(),
                device_type: DeviceType::Cpu,
                device_count: 1,
                kernel_args: Vec::new(),
                inputs: Vec::new(),
            }],
        };

        let kernels = KernelRegistry::default();
        kernels.register(Arc::new(UpperFactory));
        let evaluators = EvaluatorRegistry::default();
        evaluators.register(EvaluatorInfo {
            name: "upper".to_string(),
            output_columns: vec!["text".to_string()],
        });

        let (io_items, entries) = create_io_items(&task_set, 3, 0);
        assert_eq!(io_items.len(), 4);
        let chain =
            build_evaluator_chain(&task_set, &kernels, &evaluators, &[]).expect("chain");

        let pipeline = Pipeline::build(
            PipelineConfig {
                job_name: "upper_job".to_string(),
                load_workers: 2,
                pus: 2,
                save_workers: 1,
                tasks_in_queue_per_pu: 2,
                work_item_size: 2,
            },
            Arc::new(io_items),
            Arc::new(chain),
            backend.clone(),
            MemoryPools::new(MemoryPoolConfig::default(), &[]),
            ProfilerBase::capture(),
        );

        for entry in entries {
            pipeline.push(entry).expect("push");
        }
        let profile = pipeline.shutdown().expect("shutdown");

        assert_eq!(profile.load.len(), 2);
        assert_eq!(profile.eval.len(), 2);
        assert_eq!(profile.save.len(), 1);

        // One save interval per IO item across the save pool.
        let save_intervals: usize = profile.save.iter().map(|p| p.intervals().len()).sum();
        assert_eq!(save_intervals, 4);
        // Each item passed exactly one PU chain.
        let eval_intervals: usize = profile
            .eval
            .iter()
            .map(|c| c.eval.intervals().len())
            .sum();
        assert_eq!(eval_intervals, 4);

        // Every item has exactly one output per column, with transformed rows.
        for index in 0..4 {
            let key = layout::output_item_path("upper_job", TableId(0), ColumnId(0), index);
            let blob = backend.read_blob(&key).expect("output exists");
            let reader = ColumnReader::new(&blob).expect("column");
            assert!(reader.row_count() > 0);
            assert_eq!(reader.read_row(0).expect("row")[..3], b"ROW"[..]);
        }
    }

    #[test]
    fn warmup_rows_are_trimmed_from_outputs() {
        let backend = temp_backend("strobe_pipeline_warmup");
        seed_source_column(backend.as_ref(), 8);

        let task_set = TaskSet {
            tasks: vec![Task {
                samples: vec![TableSample {
                    job_id: JobId(0),
                    table_id: TableId(0),
                    column_ids: vec![ColumnId(0)],
                    rows: (0..8).collect(),
                }],
            }],
            evaluators: vec![EvaluatorDef {
                name: "upper".to_string(),
                device_type: DeviceType::Cpu,
                device_count: 1,
                kernel_args: Vec::new(),
                inputs: Vec::new(),
            }],
        };
        let kernels = KernelRegistry::default();
        kernels.register(Arc::new(UpperFactory));
        let evaluators = EvaluatorRegistry::default();
        evaluators.register(EvaluatorInfo {
            name: "upper".to_string(),
            output_columns: vec!["text".to_string()],
        });

        let (io_items, entries) = create_io_items(&task_set, 4, 2);
        let chain =
            build_evaluator_chain(&task_set, &kernels, &evaluators, &[]).expect("chain");
        let pipeline = Pipeline::build(
            PipelineConfig {
                job_name: "warmup_job".to_string(),
                load_workers: 1,
                pus: 1,
                save_workers: 1,
                tasks_in_queue_per_pu: 2,
                work_item_size: 8,
            },
            Arc::new(io_items),
            Arc::new(chain),
            backend.clone(),
            MemoryPools::new(MemoryPoolConfig::default(), &[]),
            ProfilerBase::capture(),
        );
        for entry in entries {
            pipeline.push(entry).expect("push");
        }
        pipeline.shutdown().expect("shutdown");

        // Item 1 loads rows [2..8) (2 warmup rows) but saves exactly 4.
        let blob = backend
            .read_blob(&layout::output_item_path("warmup_job", TableId(0), ColumnId(0), 1))
            .expect("output");
        let reader = ColumnReader::new(&blob).expect("column");
        assert_eq!(reader.row_count(), 4);
        assert_eq!(reader.read_row(0).expect("row"), b"ROW4");
    }
}
