use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use strobe_common::{ColumnId, DeviceType, EngineConfig, JobId, Result, StrobeError, TableId};
use strobe_engine::{
    read_node_profile, ColumnBlock, DatabaseMetadata, EvalInput, EvaluatorDef, EvaluatorInfo,
    EvaluatorRegistry, Kernel, KernelConfig, KernelFactory, KernelRegistry, Task, TableSample,
    TaskSet,
};
use strobe_storage::{encode_column, layout, save_blob, ColumnReader, FsBackend, StorageBackend};

use super::{InProcessMasterControlPlane, MasterControlPlane, WorkerController};
use crate::master::{run_job, JobParameters, Master};

/// Identity decoder: passes the first source column through as `frame`.
struct DecodeFactory;

impl KernelFactory for DecodeFactory {
    fn name(&self) -> &str {
        "decode"
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn new_kernel(&self, _config: KernelConfig) -> Result<Box<dyn Kernel>> {
        struct Decode;
        impl Kernel for Decode {
            fn execute(&mut self, input: &[ColumnBlock]) -> Result<Vec<ColumnBlock>> {
                let first = input.first().ok_or_else(|| {
                    StrobeError::Execution("decode expects a source column".to_string())
                })?;
                Ok(vec![first.clone()])
            }
        }
        Ok(Box::new(Decode))
    }
}

/// Maps every byte of `frame` to 0/1 against a threshold carried in the
/// kernel args blob.
struct ThresholdFactory;

impl KernelFactory for ThresholdFactory {
    fn name(&self) -> &str {
        "threshold"
    }

    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn new_kernel(&self, config: KernelConfig) -> Result<Box<dyn Kernel>> {
        let threshold = config.args.first().copied().unwrap_or(128);
        struct Threshold {
            threshold: u8,
        }
        impl Kernel for Threshold {
            fn execute(&mut self, input: &[ColumnBlock]) -> Result<Vec<ColumnBlock>> {
                let rows = input[0]
                    .rows
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|b| u8::from(*b >= self.threshold))
                            .collect::<Vec<u8>>()
                    })
                    .collect();
                Ok(vec![ColumnBlock { rows }])
            }
        }
        Ok(Box::new(Threshold { threshold }))
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
    let payloads: Vec<Vec<u8>> = (0..rows)
        .map(|i| vec![(i % 256) as u8, ((i * 7) % 256) as u8])
        .collect();
    save_blob(
        backend,
        &layout::table_column_path(JobId(0), TableId(0), ColumnId(0)),
        &encode_column(&payloads),
    )
    .expect("seed source column");
}

fn registries() -> (Arc<KernelRegistry>, Arc<EvaluatorRegistry>) {
    let kernels = KernelRegistry::default();
    kernels.register(Arc::new(DecodeFactory));
    kernels.register(Arc::new(ThresholdFactory));
    let evaluators = EvaluatorRegistry::default();
    evaluators.register(EvaluatorInfo {
        name: "decode".to_string(),
        output_columns: vec!["frame".to_string()],
    });
    evaluators.register(EvaluatorInfo {
        name: "threshold".to_string(),
        output_columns: vec!["mask".to_string()],
    });
    (Arc::new(kernels), Arc::new(evaluators))
}

fn job_params(job_name: &str, rows: i64) -> JobParameters {
    JobParameters {
        job_name: job_name.to_string(),
        task_set: TaskSet {
            tasks: vec![Task {
                samples: vec![TableSample {
                    job_id: JobId(0),
                    table_id: TableId(0),
                    column_ids: vec![ColumnId(0)],
                    rows: (0..rows).collect(),
                }],
            }],
            evaluators: vec![
                EvaluatorDef {
                    name: "decode".to_string(),
                    device_type: DeviceType::Cpu,
                    device_count: 1,
                    kernel_args: Vec::new(),
                    inputs: Vec::new(),
                },
                EvaluatorDef {
                    name: "threshold".to_string(),
                    device_type: DeviceType::Cpu,
                    device_count: 1,
                    kernel_args: vec![4],
                    inputs: vec![EvalInput {
                        evaluator_index: 0,
                        columns: vec!["frame".to_string()],
                    }],
                },
            ],
        },
    }
}

struct Cluster {
    backend: Arc<FsBackend>,
    master: Arc<Mutex<Master>>,
    control: Arc<InProcessMasterControlPlane>,
}

fn start_cluster(prefix: &str, config: &EngineConfig, workers: usize) -> Cluster {
    let backend = temp_backend(prefix);
    let (kernels, evaluators) = registries();
    let master = Arc::new(Mutex::new(Master::new(
        config.clone(),
        backend.clone(),
        Arc::clone(&evaluators),
    )));
    let control = InProcessMasterControlPlane::new(Arc::clone(&master));
    for _ in 0..workers {
        let controller = Arc::new(
            WorkerController::connect(
                config.clone(),
                backend.clone(),
                Arc::clone(&kernels),
                Arc::clone(&evaluators),
                control.clone() as Arc<dyn MasterControlPlane>,
            )
            .expect("worker connect"),
        );
        control.bind(controller.node_id(), controller);
    }
    Cluster {
        backend,
        master,
        control,
    }
}

#[test]
fn single_worker_job_runs_end_to_end() {
    let config = EngineConfig {
        io_item_size: 3,
        work_item_size: 4,
        load_workers_per_node: 2,
        pus_per_node: 2,
        save_workers_per_node: 1,
        tasks_in_queue_per_pu: 2,
        ..EngineConfig::default()
    };
    let cluster = start_cluster("strobe_e2e_single", &config, 1);
    seed_source_column(cluster.backend.as_ref(), 10);

    let job_id = run_job(&cluster.master, job_params("mask_job", 10)).expect("run job");
    assert_eq!(job_id, JobId(0));

    // 10 rows at io_item_size 3 -> 4 items, each with one output column.
    for index in 0..4 {
        let key = layout::output_item_path("mask_job", TableId(0), ColumnId(0), index);
        let blob = cluster.backend.read_blob(&key).expect("output exists");
        let reader = ColumnReader::new(&blob).expect("column");
        assert!(reader.row_count() > 0);
    }
    // Threshold 4 against payload [row % 256, (row * 7) % 256]: row 5 -> [1, 1].
    let blob = cluster
        .backend
        .read_blob(&layout::output_item_path("mask_job", TableId(0), ColumnId(0), 1))
        .expect("item 1");
    let reader = ColumnReader::new(&blob).expect("column");
    assert_eq!(reader.read_row(2).expect("row 5"), &[1, 1]);

    // Descriptor records the final evaluator's schema; catalog has the job.
    let descriptor =
        strobe_engine::read_job_descriptor(cluster.backend.as_ref(), job_id).expect("descriptor");
    assert_eq!(descriptor.num_nodes, 1);
    assert_eq!(descriptor.columns.len(), 1);
    assert_eq!(descriptor.columns[0].name, "mask");
    let meta = DatabaseMetadata::read_or_default(cluster.backend.as_ref()).expect("meta");
    assert_eq!(meta.jobs().len(), 1);

    // Profiler file: one block per load worker, three per PU, one per save
    // worker, with one save interval per retired item.
    let profiler_blob = cluster
        .backend
        .read_blob(&layout::job_profiler_path(job_id, strobe_common::NodeId(0)))
        .expect("profiler blob");
    let summary = read_node_profile(&profiler_blob).expect("profiler parse");
    assert_eq!(summary.blocks.len(), 2 + 3 * 2 + 1);
    let save_intervals: usize = summary
        .blocks
        .iter()
        .filter(|b| b.kind == "save")
        .map(|b| b.intervals.len())
        .sum();
    assert_eq!(save_intervals, 4);
    assert!(summary.end_time_ns >= summary.start_time_ns);

    // The master stays drained after the job.
    assert_eq!(cluster.control.next_io_item().expect("drained"), -1);
}

#[test]
fn two_workers_partition_items_without_duplicates() {
    let config = EngineConfig {
        io_item_size: 3,
        work_item_size: 8,
        load_workers_per_node: 1,
        pus_per_node: 1,
        save_workers_per_node: 1,
        tasks_in_queue_per_pu: 2,
        ..EngineConfig::default()
    };
    let cluster = start_cluster("strobe_e2e_two", &config, 2);
    seed_source_column(cluster.backend.as_ref(), 30);

    let job_id = run_job(&cluster.master, job_params("split_job", 30)).expect("run job");

    // 30 rows -> 10 items; the union of both workers' saves covers them all.
    for index in 0..10 {
        let key = layout::output_item_path("split_job", TableId(0), ColumnId(0), index);
        assert!(cluster.backend.exists(&key), "missing output item {index}");
    }

    // Items are served exactly once: the save intervals across both node
    // profiles sum to the item count.
    let mut total_saved = 0usize;
    for node in 0..2 {
        let blob = cluster
            .backend
            .read_blob(&layout::job_profiler_path(job_id, strobe_common::NodeId(node)))
            .expect("profiler blob");
        let summary = read_node_profile(&blob).expect("profiler parse");
        total_saved += summary
            .blocks
            .iter()
            .filter(|b| b.kind == "save")
            .map(|b| b.intervals.len())
            .sum::<usize>();
    }
    assert_eq!(total_saved, 10);
    assert_eq!(cluster.control.next_io_item().expect("drained"), -1);
}

#[test]
fn bounded_pipeline_drains_with_small_queue_cap() {
    // 1 load, 1 PU, 1 save, queue cap 2: the pull loop holds
    // accepted - retired < 2 throughout, and all four items still retire.
    let config = EngineConfig {
        io_item_size: 3,
        work_item_size: 2,
        load_workers_per_node: 1,
        pus_per_node: 1,
        save_workers_per_node: 1,
        tasks_in_queue_per_pu: 2,
        ..EngineConfig::default()
    };
    let cluster = start_cluster("strobe_e2e_cap", &config, 1);
    seed_source_column(cluster.backend.as_ref(), 12);

    let job_id = run_job(&cluster.master, job_params("cap_job", 12)).expect("run job");

    let blob = cluster
        .backend
        .read_blob(&layout::job_profiler_path(job_id, strobe_common::NodeId(0)))
        .expect("profiler blob");
    let summary = read_node_profile(&blob).expect("profiler parse");
    assert_eq!(summary.blocks.len(), 1 + 3 + 1);
    let save_intervals: usize = summary
        .blocks
        .iter()
        .filter(|b| b.kind == "save")
        .map(|b| b.intervals.len())
        .sum();
    assert_eq!(save_intervals, 4);
}

#[test]
fn rerunning_a_job_name_reproduces_the_schema() {
    let config = EngineConfig {
        io_item_size: 5,
        ..EngineConfig::default()
    };
    let cluster = start_cluster("strobe_e2e_rerun", &config, 1);
    seed_source_column(cluster.backend.as_ref(), 10);

    let first = run_job(&cluster.master, job_params("repeat_job", 10)).expect("first");
    let second = run_job(&cluster.master, job_params("repeat_job", 10)).expect("second");
    assert_eq!(first, JobId(0));
    assert_eq!(second, JobId(1));

    let d0 = strobe_engine::read_job_descriptor(cluster.backend.as_ref(), first).expect("d0");
    let d1 = strobe_engine::read_job_descriptor(cluster.backend.as_ref(), second).expect("d1");
    assert_eq!(d0.columns, d1.columns);
}

#[test]
fn unknown_evaluator_aborts_the_job() {
    let config = EngineConfig::default();
    let cluster = start_cluster("strobe_e2e_badeval", &config, 1);
    seed_source_column(cluster.backend.as_ref(), 10);

    let mut params = job_params("bad_job", 10);
    params.task_set.evaluators[1].name = "missing".to_string();
    let err = run_job(&cluster.master, params).expect_err("must abort");
    assert!(matches!(err, StrobeError::InvalidConfig(_)));
    assert!(!cluster.backend.exists(&layout::db_metadata_path()));
}
