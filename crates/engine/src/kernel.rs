//! Kernel and evaluator registries, kernel configuration and chain building.
//!
//! Evaluators are the user-declared pipeline nodes; kernels are their
//! executable realizations for a specific device type. Both registries are
//! explicit context objects constructed at process startup and threaded
//! through master/worker construction.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use strobe_common::{
    DeviceHandle, DeviceType, Result, StrobeError, CPU_DEVICE,
};

use crate::plan::TaskSet;

/// A column of row payloads flowing between pipeline stages and kernels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnBlock {
    /// One raw payload per row.
    pub rows: Vec<Vec<u8>>,
}

impl ColumnBlock {
    /// Total payload bytes held by this block.
    pub fn byte_size(&self) -> usize {
        self.rows.iter().map(|r| r.len()).sum()
    }
}

/// Per-invocation kernel configuration, built once per job.
#[derive(Debug, Clone, Default)]
pub struct KernelConfig {
    /// Raw argument blob supplied by the user, passed through untouched.
    pub args: Vec<u8>,
    /// Input column names in evaluator-input order, concatenated across the
    /// evaluator's upstream edges.
    pub input_columns: Vec<String>,
    /// Devices this kernel instance is pinned to for the job's duration.
    pub devices: Vec<DeviceHandle>,
}

/// One kernel instance, owned by a single eval thread.
///
/// Kernels are row-aligned: `execute` must return one output block per
/// declared output column, each with exactly as many rows as the input
/// blocks. Stateful kernels may use warmup rows to prime themselves; the
/// eval stage trims warmup rows from the chain output.
pub trait Kernel: Send {
    /// Run the kernel over one work item.
    fn execute(&mut self, input: &[ColumnBlock]) -> Result<Vec<ColumnBlock>>;
}

/// Factory for kernels of one `(evaluator name, device type)` pair.
pub trait KernelFactory: Send + Sync {
    /// Evaluator name this factory realizes.
    fn name(&self) -> &str;
    /// Device class this factory builds kernels for.
    fn device_type(&self) -> DeviceType;
    /// Instantiate a kernel pinned to `config.devices`.
    fn new_kernel(&self, config: KernelConfig) -> Result<Box<dyn Kernel>>;
}

/// Static description of an evaluator's output schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatorInfo {
    /// Registered evaluator name.
    pub name: String,
    /// Output column names, in production order.
    pub output_columns: Vec<String>,
}

/// Registry of evaluator descriptions keyed by name.
#[derive(Default)]
pub struct EvaluatorRegistry {
    inner: RwLock<HashMap<String, EvaluatorInfo>>,
}

impl std::fmt::Debug for EvaluatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.inner.read().map(|m| m.len()).unwrap_or_default();
        f.debug_struct("EvaluatorRegistry")
            .field("evaluators", &count)
            .finish()
    }
}

impl EvaluatorRegistry {
    /// Register or replace an evaluator description.
    pub fn register(&self, info: EvaluatorInfo) -> bool {
        self.inner
            .write()
            .expect("evaluator registry lock poisoned")
            .insert(info.name.clone(), info)
            .is_some()
    }

    /// Fetch an evaluator description by name.
    pub fn get(&self, name: &str) -> Option<EvaluatorInfo> {
        self.inner
            .read()
            .expect("evaluator registry lock poisoned")
            .get(name)
            .cloned()
    }
}

/// Registry of kernel factories keyed by `(evaluator name, device type)`.
#[derive(Default)]
pub struct KernelRegistry {
    inner: RwLock<HashMap<(String, DeviceType), Arc<dyn KernelFactory>>>,
}

impl std::fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.inner.read().map(|m| m.len()).unwrap_or_default();
        f.debug_struct("KernelRegistry")
            .field("factories", &count)
            .finish()
    }
}

impl KernelRegistry {
    /// Register or replace a factory under its own `(name, device)` key.
    pub fn register(&self, factory: Arc<dyn KernelFactory>) -> bool {
        let key = (factory.name().to_string(), factory.device_type());
        self.inner
            .write()
            .expect("kernel registry lock poisoned")
            .insert(key, factory)
            .is_some()
    }

    /// Fetch the factory for an evaluator on a device type.
    pub fn get(&self, name: &str, device_type: DeviceType) -> Option<Arc<dyn KernelFactory>> {
        self.inner
            .read()
            .expect("kernel registry lock poisoned")
            .get(&(name.to_string(), device_type))
            .cloned()
    }
}

/// One evaluator bound to its factory and per-job kernel configuration.
#[derive(Clone)]
pub struct BoundKernel {
    /// Factory used by each PU to instantiate its own kernel.
    pub factory: Arc<dyn KernelFactory>,
    /// Per-job configuration shared by all instances.
    pub config: KernelConfig,
    /// Output schema of this evaluator.
    pub info: EvaluatorInfo,
}

impl std::fmt::Debug for BoundKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundKernel")
            .field("name", &self.info.name)
            .field("devices", &self.config.devices)
            .finish()
    }
}

/// Build the bound evaluator chain for a job.
///
/// Fatal at job start: unknown evaluator name, no kernel factory registered
/// for the evaluator's device type, or GPU placement with no GPUs
/// configured. GPU device ids are assigned round-robin (`i % num_gpus`);
/// this mapping is deterministic because downstream allocators key cached
/// buffers by it.
pub fn build_evaluator_chain(
    task_set: &TaskSet,
    kernels: &KernelRegistry,
    evaluators: &EvaluatorRegistry,
    gpu_device_ids: &[i32],
) -> Result<Vec<BoundKernel>> {
    let mut chain = Vec::with_capacity(task_set.evaluators.len());
    for def in &task_set.evaluators {
        let info = evaluators.get(&def.name).ok_or_else(|| {
            StrobeError::InvalidConfig(format!("unknown evaluator: {}", def.name))
        })?;
        let factory = kernels.get(&def.name, def.device_type).ok_or_else(|| {
            StrobeError::InvalidConfig(format!(
                "no kernel registered for evaluator {} on {}",
                def.name, def.device_type
            ))
        })?;

        let mut input_columns = Vec::new();
        for input in &def.inputs {
            let upstream = task_set.evaluators.get(input.evaluator_index).ok_or_else(|| {
                StrobeError::InvalidConfig(format!(
                    "evaluator {} references out-of-range input {}",
                    def.name, input.evaluator_index
                ))
            })?;
            let upstream_info = evaluators.get(&upstream.name).ok_or_else(|| {
                StrobeError::InvalidConfig(format!("unknown evaluator: {}", upstream.name))
            })?;
            for column in &input.columns {
                if !upstream_info.output_columns.contains(column) {
                    return Err(StrobeError::InvalidConfig(format!(
                        "evaluator {} requests column {column} not produced by {}",
                        def.name, upstream.name
                    )));
                }
            }
            input_columns.extend(input.columns.iter().cloned());
        }

        let devices = match def.device_type {
            DeviceType::Cpu => vec![CPU_DEVICE],
            DeviceType::Gpu => {
                if gpu_device_ids.is_empty() {
                    return Err(StrobeError::InvalidConfig(format!(
                        "evaluator {} requires gpus but none are configured",
                        def.name
                    )));
                }
                (0..def.device_count.max(1))
                    .map(|i| DeviceHandle {
                        device_type: DeviceType::Gpu,
                        device_id: gpu_device_ids[i as usize % gpu_device_ids.len()],
                    })
                    .collect()
            }
        };

        chain.push(BoundKernel {
            factory,
            config: KernelConfig {
                args: def.kernel_args.clone(),
                input_columns,
                devices,
            },
            info,
        });
    }
    Ok(chain)
}

/// Output column names of a job, defined by its last evaluator.
pub fn job_output_columns(
    task_set: &TaskSet,
    evaluators: &EvaluatorRegistry,
) -> Result<Vec<String>> {
    let last = task_set.evaluators.last().ok_or_else(|| {
        StrobeError::InvalidConfig("task set declares no evaluators".to_string())
    })?;
    let info = evaluators.get(&last.name).ok_or_else(|| {
        StrobeError::InvalidConfig(format!("unknown evaluator: {}", last.name))
    })?;
    Ok(info.output_columns)
}
