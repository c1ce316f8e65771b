//! Engine errors
//!
//! Only unrecoverable faults surface here. Language-level problems (unbound
//! names, failed imports, host-call exceptions) are recorded as strings in
//! [`Context::errors`](crate::context::Context) and evaluation continues
//! with `null`.

use thiserror::Error;

/// Engine result type
pub type Result<T> = std::result::Result<T, Error>;

/// Unrecoverable engine faults; any of these aborts the current run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("stack discipline violation at instruction {pc}: {message}")]
    StackDiscipline { pc: usize, message: String },

    #[error("jump out of program bounds at instruction {pc}")]
    JumpOutOfBounds { pc: usize },

    #[error("instruction {pc} executed outside of a loop")]
    NoLoopFrame { pc: usize },

    #[error("unlinked program: label {label} survived to execution")]
    UnlinkedLabel { label: usize },
}
