//! Evaluate stage chain: pre (host staging), eval (kernel chain), post
//! (output repackaging), one chain per processing unit.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use strobe_common::metrics::global_metrics;
use strobe_common::{Result, StrobeError};
use tracing::debug;

use crate::kernel::{BoundKernel, ColumnBlock, Kernel};
use crate::plan::IoItem;
use crate::profiler::{Profiler, ProfilerBase};

use super::load::item_for;
use super::EvalWorkEntry;

pub(crate) struct PreWorkerArgs {
    pub pu: usize,
    pub input: Receiver<EvalWorkEntry>,
    pub output: Sender<EvalWorkEntry>,
    pub base: ProfilerBase,
}

/// Host-side staging ahead of the kernel chain. Kernel-independent by
/// contract: validates that every column block carries the same row count so
/// the eval stage can batch blindly.
pub(crate) fn run_pre_worker(args: PreWorkerArgs) -> Result<Profiler> {
    let mut profiler = Profiler::new(args.base);
    while let Ok(entry) = args.input.recv() {
        let start_ns = profiler.now_ns();
        let mut row_counts = entry.columns.iter().map(|c| c.rows.len());
        if let Some(first) = row_counts.next() {
            if row_counts.any(|count| count != first) {
                return Err(StrobeError::Execution(format!(
                    "io item {} loaded columns with mismatched row counts",
                    entry.io_item_index
                )));
            }
        }
        let end_ns = profiler.now_ns();
        profiler.add_interval("pre", start_ns, end_ns);
        global_metrics().observe_stage_seconds("pre", (end_ns - start_ns) as f64 / 1e9);
        if args.output.send(entry).is_err() {
            return Err(StrobeError::Execution(
                "eval stage exited before pre finished".to_string(),
            ));
        }
    }
    debug!(pu = args.pu, "pre worker drained");
    Ok(profiler)
}

pub(crate) struct EvalWorkerArgs {
    pub pu: usize,
    pub chain: Arc<Vec<BoundKernel>>,
    pub work_item_size: usize,
    pub input: Receiver<EvalWorkEntry>,
    pub output: Sender<EvalWorkEntry>,
    pub base: ProfilerBase,
}

/// Run the kernel chain for this PU. Kernels are instantiated once per PU at
/// thread start and pinned to their configured devices for the job's
/// duration. Entries are processed in work items of `work_item_size` rows;
/// within a work item, data flows kernel to kernel without re-enqueuing.
pub(crate) fn run_eval_worker(args: EvalWorkerArgs) -> Result<Profiler> {
    let mut profiler = Profiler::new(args.base);
    let mut kernels: Vec<Box<dyn Kernel>> = Vec::with_capacity(args.chain.len());
    for bound in args.chain.iter() {
        kernels.push(bound.factory.new_kernel(bound.config.clone())?);
    }
    let step = args.work_item_size.max(1);

    while let Ok(mut entry) = args.input.recv() {
        let start_ns = profiler.now_ns();
        let total_rows = entry.columns.first().map(|c| c.rows.len()).unwrap_or(0);

        let outputs = if args.chain.is_empty() {
            std::mem::take(&mut entry.columns)
        } else {
            let out_width = args
                .chain
                .last()
                .map(|b| b.info.output_columns.len())
                .unwrap_or(0);
            let mut accum = vec![ColumnBlock::default(); out_width];
            let mut start = 0usize;
            while start < total_rows {
                let end = (start + step).min(total_rows);
                let batch = run_chain_over_batch(
                    &args.chain,
                    &mut kernels,
                    &entry.columns,
                    start,
                    end,
                )?;
                for (accum_block, batch_block) in accum.iter_mut().zip(batch) {
                    accum_block.rows.extend(batch_block.rows);
                }
                start = end;
            }
            accum
        };

        let mut columns = outputs;
        for block in &mut columns {
            let warmup = entry.warmup_rows.min(block.rows.len());
            block.rows.drain(0..warmup);
        }
        entry.columns = columns;

        let end_ns = profiler.now_ns();
        profiler.add_interval("eval", start_ns, end_ns);
        global_metrics().observe_stage_seconds("eval", (end_ns - start_ns) as f64 / 1e9);
        debug!(pu = args.pu, io_item = entry.io_item_index, "io item evaluated");
        if args.output.send(entry).is_err() {
            return Err(StrobeError::Execution(
                "post stage exited before eval finished".to_string(),
            ));
        }
    }
    Ok(profiler)
}

/// Run every kernel over one work item's row range.
///
/// The loaded source columns feed the chain head (an evaluator without input
/// edges) positionally; every later kernel resolves its declared input
/// columns from the outputs of its predecessors for the same rows.
fn run_chain_over_batch(
    chain: &[BoundKernel],
    kernels: &mut [Box<dyn Kernel>],
    source: &[ColumnBlock],
    start: usize,
    end: usize,
) -> Result<Vec<ColumnBlock>> {
    let batch_rows = end - start;
    let source_batch: Vec<ColumnBlock> = source
        .iter()
        .map(|c| ColumnBlock {
            rows: c.rows[start..end].to_vec(),
        })
        .collect();

    let mut produced: HashMap<&str, ColumnBlock> = HashMap::new();
    let mut last_output: Vec<ColumnBlock> = Vec::new();
    for (bound, kernel) in chain.iter().zip(kernels.iter_mut()) {
        let input: Vec<ColumnBlock> = if bound.config.input_columns.is_empty() {
            source_batch.clone()
        } else {
            bound
                .config
                .input_columns
                .iter()
                .map(|name| {
                    produced.get(name.as_str()).cloned().ok_or_else(|| {
                        StrobeError::Execution(format!(
                            "kernel {} input column {name} not produced upstream",
                            bound.info.name
                        ))
                    })
                })
                .collect::<Result<_>>()?
        };

        let output = kernel.execute(&input)?;
        if output.len() != bound.info.output_columns.len() {
            return Err(StrobeError::Execution(format!(
                "kernel {} produced {} columns, declared {}",
                bound.info.name,
                output.len(),
                bound.info.output_columns.len()
            )));
        }
        for block in &output {
            if block.rows.len() != batch_rows {
                return Err(StrobeError::Execution(format!(
                    "kernel {} returned {} rows for a {batch_rows}-row work item",
                    bound.info.name,
                    block.rows.len()
                )));
            }
        }
        for (name, block) in bound.info.output_columns.iter().zip(output.iter()) {
            produced.insert(name.as_str(), block.clone());
        }
        last_output = output;
    }
    Ok(last_output)
}

pub(crate) struct PostWorkerArgs {
    pub pu: usize,
    pub io_items: Arc<Vec<IoItem>>,
    pub input: Receiver<EvalWorkEntry>,
    pub output: Sender<EvalWorkEntry>,
    pub base: ProfilerBase,
}

/// Final CPU-side repackaging behind the kernel chain: checks that the chain
/// output covers exactly the item's row range before handing off to save.
pub(crate) fn run_post_worker(args: PostWorkerArgs) -> Result<Profiler> {
    let mut profiler = Profiler::new(args.base);
    while let Ok(entry) = args.input.recv() {
        let start_ns = profiler.now_ns();
        let item = item_for(&args.io_items, entry.io_item_index)?;
        for block in &entry.columns {
            if block.rows.len() != item.row_count() {
                return Err(StrobeError::Execution(format!(
                    "io item {} output has {} rows, item spans {}",
                    entry.io_item_index,
                    block.rows.len(),
                    item.row_count()
                )));
            }
        }
        let end_ns = profiler.now_ns();
        profiler.add_interval("post", start_ns, end_ns);
        global_metrics().observe_stage_seconds("post", (end_ns - start_ns) as f64 / 1e9);
        if args.output.send(entry).is_err() {
            return Err(StrobeError::Execution(
                "save stage exited before post finished".to_string(),
            ));
        }
    }
    debug!(pu = args.pu, "post worker drained");
    Ok(profiler)
}
