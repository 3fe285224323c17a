//! Distributed master/worker runtime building blocks.
//!
//! Architecture role:
//! - master scheduler state machine and pull-based IO item distribution
//! - worker controller driving the per-node pipeline
//! - gRPC services and client/server glue (feature-gated)
//!
//! Key modules:
//! - [`master`]
//! - [`worker`]
//! - `grpc` (feature-gated)
//!
//! Feature flags:
//! - `grpc`: enables tonic-generated RPC services and client/server glue.

pub mod master;
pub mod worker;

#[cfg(feature = "grpc")]
pub mod grpc;

pub use master::{run_job, JobParameters, Master, WorkerStub};
pub use worker::{
    InProcessMasterControlPlane, InProcessWorkerStub, MasterControlPlane, WorkerController,
};

#[cfg(feature = "grpc")]
pub use grpc::{
    GrpcMasterControlPlane, GrpcWorkerStub, MasterService, WorkerService,
};
