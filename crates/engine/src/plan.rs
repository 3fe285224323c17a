//! Task-set model and the IO item planner.
//!
//! Contract:
//! - IO items for one task are a row-contiguous partition of `[0, R_task)`,
//!   each at most `io_item_size` rows;
//! - emission order is (task index ascending, then start_row ascending) and
//!   the flat position in that sequence is the `io_item_index` every other
//!   component keys on;
//! - one [`LoadWorkEntry`] exists per IO item, with each sample's rows
//!   extended backwards by the warmup prefix clamped at row 0.
//!
//! The planner is a pure function: master and workers each run it over the
//! same task set and rely on getting byte-identical sequences.

use serde::{Deserialize, Serialize};
use strobe_common::{ColumnId, DeviceType, JobId, TableId};

/// One source sample of a task: a `(job, table)` pair, the columns to read
/// and the ordered source row indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSample {
    /// Job that produced the source table (0 for the base ingest job).
    pub job_id: JobId,
    /// Source table within that job.
    pub table_id: TableId,
    /// Columns to read, in kernel input order.
    pub column_ids: Vec<ColumnId>,
    /// Ordered source row indices; all samples of a task have equal length.
    pub rows: Vec<i64>,
}

/// A user-supplied unit of work over one logical output table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Source samples; every sample has the same row count.
    pub samples: Vec<TableSample>,
}

impl Task {
    /// Row count of this task, defined by its first sample.
    pub fn row_count(&self) -> usize {
        self.samples.first().map(|s| s.rows.len()).unwrap_or(0)
    }
}

/// An input edge of an evaluator, referencing a predecessor by arena index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalInput {
    /// Index of the upstream evaluator in [`TaskSet::evaluators`]; always
    /// less than the referencing evaluator's own index.
    pub evaluator_index: usize,
    /// Names of the upstream output columns consumed by this edge.
    pub columns: Vec<String>,
}

/// One user-declared pipeline node of the evaluator chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatorDef {
    /// Registered evaluator name.
    pub name: String,
    /// Device class the kernel should be built for.
    pub device_type: DeviceType,
    /// Number of device placements for GPU kernels (round-robin assigned).
    pub device_count: i32,
    /// Raw argument blob handed to the kernel factory untouched.
    #[serde(default)]
    pub kernel_args: Vec<u8>,
    /// Upstream input edges. Empty for the chain head, which consumes the
    /// loaded source columns positionally.
    #[serde(default)]
    pub inputs: Vec<EvalInput>,
}

/// The full pipeline description submitted with a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSet {
    /// Ordered tasks; task index doubles as the output table id.
    pub tasks: Vec<Task>,
    /// Evaluator arena; edges reference predecessors by index.
    pub evaluators: Vec<EvaluatorDef>,
}

/// A fixed-size row slice of one task, the unit of master->worker scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoItem {
    /// Index of the owning task (also the output table id).
    pub table_id: i32,
    /// Per-task sequence number starting at 0.
    pub item_id: i64,
    /// First row of the slice, inclusive.
    pub start_row: i64,
    /// Last row of the slice, exclusive.
    pub end_row: i64,
}

impl IoItem {
    /// Rows covered by this item, excluding any warmup prefix.
    pub fn row_count(&self) -> usize {
        (self.end_row - self.start_row) as usize
    }
}

/// Concrete row set of one sample for one IO item, warmup prefix included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSample {
    /// Source job.
    pub job_id: JobId,
    /// Source table.
    pub table_id: TableId,
    /// Columns to read.
    pub column_ids: Vec<ColumnId>,
    /// Concrete source rows for this item:
    /// `task.sample.rows[max(start_row - warmup, 0) .. end_row)`.
    pub rows: Vec<i64>,
}

/// The load stage's input record for one IO item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadWorkEntry {
    /// Position of the item in the flat planner output.
    pub io_item_index: usize,
    /// Per-sample concrete row sets.
    pub samples: Vec<LoadSample>,
}

/// Partition a task set into IO items and their load work entries.
pub fn create_io_items(
    task_set: &TaskSet,
    io_item_size: usize,
    warmup_size: usize,
) -> (Vec<IoItem>, Vec<LoadWorkEntry>) {
    let io_item_size = io_item_size.max(1) as i64;
    let warmup_size = warmup_size as i64;
    let mut io_items = Vec::new();
    let mut load_work_entries = Vec::new();

    for (task_index, task) in task_set.tasks.iter().enumerate() {
        debug_assert!(
            task.samples.iter().all(|s| s.rows.len() == task.row_count()),
            "samples of one task must share a row count"
        );
        let rows_in_task = task.row_count() as i64;
        let mut item_id = 0i64;
        let mut allocated_rows = 0i64;
        while allocated_rows < rows_in_task {
            let rows_to_allocate = io_item_size.min(rows_in_task - allocated_rows);
            let start_row = allocated_rows;
            let end_row = allocated_rows + rows_to_allocate;

            io_items.push(IoItem {
                table_id: task_index as i32,
                item_id,
                start_row,
                end_row,
            });
            item_id += 1;

            let samples = task
                .samples
                .iter()
                .map(|sample| {
                    let s = (start_row - warmup_size).max(0) as usize;
                    let e = end_row as usize;
                    LoadSample {
                        job_id: sample.job_id,
                        table_id: sample.table_id,
                        column_ids: sample.column_ids.clone(),
                        rows: sample.rows[s..e].to_vec(),
                    }
                })
                .collect();
            load_work_entries.push(LoadWorkEntry {
                io_item_index: io_items.len() - 1,
                samples,
            });

            allocated_rows += rows_to_allocate;
        }
    }

    (io_items, load_work_entries)
}
