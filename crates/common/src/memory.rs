//! Worker-wide memory pools.
//!
//! One pool exists per device (the CPU plus every configured GPU). Stage
//! threads reserve bytes before materializing buffers and release them by
//! dropping the reservation. Grants are clamped to what the pool has left
//! rather than blocking; callers that receive less than requested proceed
//! with the clamped amount, which keeps the pipeline moving under pressure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::MemoryPoolConfig;
use crate::device::{DeviceHandle, DeviceType, CPU_DEVICE};
use crate::error::{Result, StrobeError};

#[derive(Debug)]
struct PoolState {
    budget_bytes: usize,
    in_use_bytes: AtomicUsize,
}

impl PoolState {
    fn new(budget_bytes: usize) -> Self {
        Self {
            budget_bytes,
            in_use_bytes: AtomicUsize::new(0),
        }
    }

    fn reserve(&self, requested_bytes: usize) -> usize {
        loop {
            let current = self.in_use_bytes.load(Ordering::Acquire);
            let available = self.budget_bytes.saturating_sub(current);
            let granted = requested_bytes.min(available);
            let next = current.saturating_add(granted);
            if self
                .in_use_bytes
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return granted;
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.in_use_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// Process-wide memory pools, initialized once at worker construction.
#[derive(Debug)]
pub struct MemoryPools {
    cpu: PoolState,
    gpus: HashMap<i32, PoolState>,
}

impl MemoryPools {
    /// Build pools from config for the CPU plus the given GPU ordinals.
    pub fn new(config: MemoryPoolConfig, gpu_device_ids: &[i32]) -> Arc<Self> {
        let gpus = gpu_device_ids
            .iter()
            .map(|id| (*id, PoolState::new(config.gpu_pool_bytes)))
            .collect();
        Arc::new(Self {
            cpu: PoolState::new(config.cpu_pool_bytes),
            gpus,
        })
    }

    /// Reserve up to `requested_bytes` on `device`, clamped to the remaining
    /// budget. Reserving on an unconfigured GPU is a configuration error.
    pub fn reserve(
        self: &Arc<Self>,
        device: DeviceHandle,
        requested_bytes: usize,
    ) -> Result<MemoryReservation> {
        let granted = match device.device_type {
            DeviceType::Cpu => self.cpu.reserve(requested_bytes),
            DeviceType::Gpu => self
                .gpus
                .get(&device.device_id)
                .ok_or_else(|| {
                    StrobeError::InvalidConfig(format!(
                        "no memory pool for gpu device {}",
                        device.device_id
                    ))
                })?
                .reserve(requested_bytes),
        };
        Ok(MemoryReservation {
            pools: Arc::clone(self),
            device,
            reserved_bytes: granted,
        })
    }

    /// Bytes currently reserved on the CPU pool.
    pub fn cpu_in_use_bytes(&self) -> usize {
        self.cpu.in_use_bytes.load(Ordering::Acquire)
    }

    fn release(&self, device: DeviceHandle, bytes: usize) {
        match device.device_type {
            DeviceType::Cpu => self.cpu.release(bytes),
            DeviceType::Gpu => {
                if let Some(pool) = self.gpus.get(&device.device_id) {
                    pool.release(bytes);
                }
            }
        }
    }
}

/// RAII reservation returned by [`MemoryPools::reserve`]; releases on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    pools: Arc<MemoryPools>,
    device: DeviceHandle,
    reserved_bytes: usize,
}

impl MemoryReservation {
    /// Bytes actually granted (may be less than requested under pressure).
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.pools.release(self.device, self.reserved_bytes);
    }
}

/// Reserve host-side staging memory.
pub fn reserve_host(pools: &Arc<MemoryPools>, requested_bytes: usize) -> Result<MemoryReservation> {
    pools.reserve(CPU_DEVICE, requested_bytes)
}
