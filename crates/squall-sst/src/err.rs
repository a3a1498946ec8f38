//! Declare error types for squall-sst.

use thiserror::Error;

use squall_rdma::NodeId;

/// An error returned by the shared state table.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The transport layer failed.
    #[error("Transport error")]
    Rdma(#[from] squall_rdma::Error),

    /// A write addressed a row this process does not own.
    ///
    /// Only the local row is writable; mirrors are updated exclusively
    /// by their owners' remote writes.
    #[error("Row {row} is not writable from this node (the local row is {local})")]
    NotLocalRow {
        /// The row the caller tried to write.
        row: usize,
        /// The row this process owns.
        local: usize,
    },

    /// A row index past the end of the table.
    #[error("No row {row} in a table of {rows} rows")]
    NoSuchRow {
        /// The requested row.
        row: usize,
        /// How many rows the table has.
        rows: usize,
    },

    /// The local node is not listed in the member table.
    #[error("Node {peer} is not a member of this table")]
    NotAMember {
        /// The absent node.
        peer: NodeId,
    },

    /// A field handle from a different layout, or one whose bytes do
    /// not fit in this table's row stride.
    #[error("Field at offset {offset} (width {width}) does not fit a row of {stride} bytes")]
    FieldOutOfRow {
        /// Byte offset of the field within its row.
        offset: usize,
        /// Byte width of the field.
        width: usize,
        /// This table's row stride.
        stride: usize,
    },

    /// A vector element index past the end of the field.
    #[error("No element {idx} in a vector field of length {len}")]
    IndexOutOfBounds {
        /// The requested element.
        idx: usize,
        /// The vector field's length.
        len: usize,
    },

    /// An internal error of some kind that should never occur.
    #[error("Internal error: {0}")]
    Internal(&'static str),
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Error {
        Error::Internal("thread failed while holding lock")
    }
}
