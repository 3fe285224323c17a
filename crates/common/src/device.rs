//! Device vocabulary shared by kernel placement and memory pools.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution device class a kernel can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Host CPU.
    Cpu,
    /// CUDA-class accelerator addressed by ordinal id.
    Gpu,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Cpu => write!(f, "cpu"),
            DeviceType::Gpu => write!(f, "gpu"),
        }
    }
}

/// A concrete device a kernel instance is pinned to for a job's duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Device class.
    pub device_type: DeviceType,
    /// Ordinal id within the class. Always 0 for CPU.
    pub device_id: i32,
}

/// The host CPU device.
pub const CPU_DEVICE: DeviceHandle = DeviceHandle {
    device_type: DeviceType::Cpu,
    device_id: 0,
};

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_type, self.device_id)
    }
}
