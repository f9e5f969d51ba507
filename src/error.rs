//! Recoverable error type and the fatal-path logging/abort helper.
//!
//! Per the error handling design, only a handful of boundaries return a
//! `Result` at all: everything else either succeeds or is fatal. Fatal
//! conditions are reported through [`fatal`] rather than a bare `unwrap`,
//! so the last thing in the logs before the process dies is always the
//! reason why.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("I/O error in serializer backing store: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("subscene partitioner could not reduce shape {shape_id} below budget: {primitive_count} primitives remain")]
    PartitionerIrreducible {
        shape_id: u32,
        primitive_count: usize,
    },

    #[error("scratch directory {0:?} could not be created")]
    ScratchDir(PathBuf),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Logs a fatal condition and aborts the process.
///
/// Kernels running inside the task graph's worker pool call this instead of
/// panicking: a panic unwinding through rayon/crossbeam machinery could leave
/// the residency cache's eviction mutex or a task queue in a state no other
/// thread can make progress against, so we abort outright from those
/// contexts. Single-threaded setup code (scene construction, preprocessing,
/// building the worker pool itself) has no such concurrent state to
/// protect and should use [`fatal_setup`] instead, which panics rather than
/// aborting.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        std::process::abort();
    }};
}

/// Logs a fatal condition and panics.
///
/// For single-threaded setup code only (scene construction, preprocessing,
/// worker-pool construction): no kernel can be mid-flight there, so
/// unwind-and-report is safe and preferable to an unconditional abort. Code
/// running inside a task graph kernel must use [`fatal`] instead.
#[macro_export]
macro_rules! fatal_setup {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        panic!($($arg)*);
    }};
}
