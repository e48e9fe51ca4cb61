//! Error kinds surfaced by the runtime.

use std::{error::Error, fmt};

/// The page source could not obtain memory from the OS.
///
/// This is the only failure the allocator chain can produce; every decorator
/// propagates it unchanged. It is fatal to a running for-each iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("out of memory: the OS rejected a page mapping")
    }
}
impl Error for OutOfMemory {}

/// Why a [`for_each`](crate::executor::Runtime::for_each) iteration failed.
///
/// The engine records the first failure it observes, drains the worklist
/// without invoking further operator work, and then surfaces that failure.
#[derive(Debug)]
pub enum ForEachError<E> {
    /// Allocation failed while the iteration was running.
    OutOfMemory,
    /// The worklist/worker configuration is inconsistent; reported at entry
    /// before any worker starts.
    InvalidConfiguration(String),
    /// The user operator reported an error; first one wins.
    Operator(E),
}

impl<E> From<OutOfMemory> for ForEachError<E> {
    fn from(_: OutOfMemory) -> Self {
        ForEachError::OutOfMemory
    }
}

impl<E: fmt::Debug> fmt::Display for ForEachError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForEachError::OutOfMemory => OutOfMemory.fmt(f),
            ForEachError::InvalidConfiguration(why) => {
                write!(f, "invalid configuration: {}", why)
            }
            ForEachError::Operator(e) => write!(f, "operator error: {:?}", e),
        }
    }
}
impl<E: fmt::Debug> Error for ForEachError<E> {}
