//! Per-worker execution engine for strobe.
//!
//! Architecture role:
//! - the task-set model and the deterministic IO item planner shared by
//!   master and workers
//! - kernel/evaluator registries and per-job chain building with device
//!   placement
//! - the internal load -> pre/eval/post -> save pipeline with bounded queues
//! - the per-stage profiler and the node profiler file format
//! - job catalog and descriptor persistence
//!
//! Key modules:
//! - [`plan`]
//! - [`kernel`]
//! - [`pipeline`]
//! - [`profiler`]
//! - [`meta`]

pub mod kernel;
pub mod meta;
pub mod pipeline;
pub mod plan;
pub mod profiler;

pub use kernel::{
    build_evaluator_chain, job_output_columns, BoundKernel, ColumnBlock, EvaluatorInfo,
    EvaluatorRegistry, Kernel, KernelConfig, KernelFactory, KernelRegistry,
};
pub use meta::{
    read_job_descriptor, write_job_descriptor, ColumnDesc, ColumnType, DatabaseMetadata,
    JobDescriptor, JobEntry,
};
pub use pipeline::{EvalWorkEntry, Pipeline, PipelineConfig, PipelineProfile};
pub use plan::{
    create_io_items, EvalInput, EvaluatorDef, IoItem, LoadSample, LoadWorkEntry, TableSample,
    Task, TaskSet,
};
pub use profiler::{
    read_node_profile, Interval, NodeProfile, NodeProfileSummary, Profiler, ProfilerBase,
    ProfilerBlock, PuProfile,
};
