//! Load stage: materialize the source rows of one IO item from the store.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use strobe_common::memory::reserve_host;
use strobe_common::metrics::global_metrics;
use strobe_common::{ColumnId, JobId, MemoryPools, Result, StrobeError, TableId};
use strobe_storage::{layout, ColumnReader, StorageBackend};
use tracing::debug;

use crate::kernel::ColumnBlock;
use crate::plan::{IoItem, LoadWorkEntry};
use crate::profiler::{Profiler, ProfilerBase};

use super::EvalWorkEntry;

pub(crate) struct LoadWorkerArgs {
    pub worker_id: usize,
    pub job_label: String,
    pub io_items: Arc<Vec<IoItem>>,
    pub backend: Arc<dyn StorageBackend>,
    pub pools: Arc<MemoryPools>,
    pub input: Receiver<LoadWorkEntry>,
    pub output: Sender<EvalWorkEntry>,
    pub base: ProfilerBase,
}

pub(crate) fn run_load_worker(args: LoadWorkerArgs) -> Result<Profiler> {
    let mut profiler = Profiler::new(args.base);
    // Column blobs are reread across items of the same table; cache per worker.
    let mut blob_cache: HashMap<(JobId, TableId, ColumnId), Vec<u8>> = HashMap::new();

    while let Ok(entry) = args.input.recv() {
        let start_ns = profiler.now_ns();
        let item = item_for(&args.io_items, entry.io_item_index)?;

        let mut columns = Vec::new();
        let mut loaded_rows = 0u64;
        let mut total_bytes = 0usize;
        for sample in &entry.samples {
            for &column_id in &sample.column_ids {
                let key = (sample.job_id, sample.table_id, column_id);
                let blob = match blob_cache.entry(key) {
                    Entry::Occupied(occupied) => occupied.into_mut(),
                    Entry::Vacant(vacant) => {
                        let path =
                            layout::table_column_path(sample.job_id, sample.table_id, column_id);
                        vacant.insert(args.backend.read_blob(&path)?)
                    }
                };
                let reader = ColumnReader::new(blob)?;
                let rows = reader.read_rows(&sample.rows)?;
                loaded_rows += rows.len() as u64;
                let block = ColumnBlock { rows };
                total_bytes += block.byte_size();
                columns.push(block);
            }
        }

        let reservation = reserve_host(&args.pools, total_bytes)?;
        let warmup_rows = entry
            .samples
            .first()
            .map(|s| s.rows.len())
            .unwrap_or(0)
            .saturating_sub(item.row_count());

        debug!(
            worker = args.worker_id,
            io_item = entry.io_item_index,
            rows = loaded_rows,
            bytes = total_bytes,
            "io item loaded"
        );
        let eval_entry = EvalWorkEntry {
            io_item_index: entry.io_item_index,
            warmup_rows,
            columns,
            host_reservation: Some(reservation),
        };
        if args.output.send(eval_entry).is_err() {
            return Err(StrobeError::Execution(
                "eval stage exited before load finished".to_string(),
            ));
        }

        let end_ns = profiler.now_ns();
        profiler.add_interval("load", start_ns, end_ns);
        let metrics = global_metrics();
        metrics.record_rows_loaded(&args.job_label, loaded_rows);
        metrics.observe_stage_seconds("load", (end_ns - start_ns) as f64 / 1e9);
    }

    Ok(profiler)
}

pub(super) fn item_for(io_items: &[IoItem], index: usize) -> Result<&IoItem> {
    io_items.get(index).ok_or_else(|| {
        StrobeError::Execution(format!("io item index {index} out of range"))
    })
}
