//! Buffer-level error taxonomy.
//!
//! These are the errors a ring buffer endpoint can hand back to its
//! caller; they sit one level below the graph-level errors in the
//! `flowgraph` crate's `error` module.

use thiserror::Error;

/// Errors surfaced by [`crate::ring_buffer`] readers and writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    /// The writer side has closed and every byte it wrote has been
    /// drained; there is nothing left for a reader to wait for.
    #[error("end of stream")]
    EndOfStream,

    /// A peer on the other side of the buffer has gone away mid-stream
    /// (a reader dropped while the writer still had data, or vice
    /// versa). Unlike `EndOfStream` this is not a clean shutdown and
    /// should cascade as a failure, not a normal drain.
    #[error("broken stream")]
    BrokenStream,

    /// A bounded wait for available space or data elapsed before the
    /// requested count could be satisfied.
    #[error("timed out waiting on buffer")]
    Timeout,
}

/// Result type alias for `flowgraph_core` operations.
pub type Result<T> = core::result::Result<T, BufferError>;
