#![deny(missing_docs)]

//! Shared configuration, error types, ids, device model and observability
//! primitives for strobe crates.
//!
//! Architecture role:
//! - defines engine/runtime configuration passed across layers
//! - provides common [`StrobeError`] / [`Result`] contracts
//! - hosts the device vocabulary, memory pools and metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`device`]
//! - [`error`]
//! - [`ids`]
//! - [`memory`]
//! - [`metrics`]

/// Shared engine/runtime configuration types.
pub mod config;
/// Device vocabulary for kernel placement and memory pools.
pub mod device;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Worker-wide memory pools.
pub mod memory;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::{EngineConfig, MemoryPoolConfig};
pub use device::{DeviceHandle, DeviceType, CPU_DEVICE};
pub use error::{Result, StrobeError};
pub use ids::*;
pub use memory::{MemoryPools, MemoryReservation};
pub use metrics::MetricsRegistry;
