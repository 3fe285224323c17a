use thiserror::Error;

/// Canonical strobe error taxonomy used across crates.
///
/// Classification guidance:
/// - [`StrobeError::InvalidConfig`]: job/evaluator/device/tunable contract violations
///   discovered before or at job start
/// - [`StrobeError::Execution`]: stage-thread, kernel, or pipeline failures after a
///   job started
/// - [`StrobeError::Storage`]: blob backend read/commit failures, including backoff
///   exhaustion
/// - [`StrobeError::Rpc`]: master/worker transport or protocol failures
/// - [`StrobeError::Io`]: raw filesystem IO failures from std APIs
/// - [`StrobeError::Unsupported`]: valid request for functionality not built into
///   this binary (for example a feature-gated surface)
#[derive(Debug, Error)]
pub enum StrobeError {
    /// Invalid or inconsistent job/engine configuration.
    ///
    /// Examples:
    /// - unknown evaluator name or no kernel registered for a device type
    /// - GPU placement requested on a node with no GPU ids configured
    /// - job submitted with zero registered workers
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Runtime failures after a job was accepted.
    ///
    /// Examples:
    /// - kernel execution error
    /// - stage thread panicked or returned an error at join
    /// - row-count invariant violated between stages
    #[error("execution error: {0}")]
    Execution(String),

    /// Blob storage failures.
    ///
    /// Examples:
    /// - missing source column blob
    /// - corrupt column/profiler framing
    /// - commit (`save`) retries exhausted
    #[error("storage error: {0}")]
    Storage(String),

    /// Master/worker RPC failures. Fatal for the running job.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for functionality not compiled into this binary.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Standard strobe result alias.
pub type Result<T> = std::result::Result<T, StrobeError>;
