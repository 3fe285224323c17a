//! Save stage: commit output columns to the store and retire the item.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use strobe_common::metrics::global_metrics;
use strobe_common::{ColumnId, Result, TableId};
use strobe_storage::{encode_column, layout, save_blob, StorageBackend};
use tracing::debug;

use crate::plan::IoItem;
use crate::profiler::{Profiler, ProfilerBase};

use super::load::item_for;
use super::EvalWorkEntry;

pub(crate) struct SaveWorkerArgs {
    pub worker_id: usize,
    pub job_name: String,
    pub io_items: Arc<Vec<IoItem>>,
    pub backend: Arc<dyn StorageBackend>,
    pub retired: Arc<AtomicI64>,
    pub input: Receiver<EvalWorkEntry>,
    pub base: ProfilerBase,
}

pub(crate) fn run_save_worker(args: SaveWorkerArgs) -> Result<Profiler> {
    let mut profiler = Profiler::new(args.base);
    while let Ok(entry) = args.input.recv() {
        let start_ns = profiler.now_ns();
        let item = item_for(&args.io_items, entry.io_item_index)?;

        let mut rows_saved = 0u64;
        for (column_index, block) in entry.columns.iter().enumerate() {
            let key = layout::output_item_path(
                &args.job_name,
                TableId(item.table_id),
                ColumnId(column_index as i32),
                entry.io_item_index,
            );
            save_blob(args.backend.as_ref(), &key, &encode_column(&block.rows))?;
            rows_saved += block.rows.len() as u64;
        }

        // The item counts as retired only once every column is committed.
        args.retired.fetch_add(1, Ordering::SeqCst);

        let end_ns = profiler.now_ns();
        profiler.add_interval("save", start_ns, end_ns);
        let metrics = global_metrics();
        metrics.record_io_item_retired(&args.job_name);
        metrics.record_rows_saved(&args.job_name, rows_saved);
        metrics.observe_stage_seconds("save", (end_ns - start_ns) as f64 / 1e9);
        debug!(
            worker = args.worker_id,
            io_item = entry.io_item_index,
            rows = rows_saved,
            "io item saved"
        );
    }
    Ok(profiler)
}
