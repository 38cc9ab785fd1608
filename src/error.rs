//! Error types for ipcator.

use thiserror::Error;

/// Result type alias using ipcator's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ipcator operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A shared memory object with this name already exists.
    #[error("shared memory object already exists: {0}")]
    AlreadyExists(String),

    /// The shared memory object does not exist (or never became ready
    /// within the retry window).
    #[error("shared memory object not found: {0}")]
    NotFound(String),

    /// The shm subsystem or `mmap` refused access.
    #[error("permission denied for shared memory object {0}")]
    PermissionDenied(String),

    /// The system refused to back the mapping.
    #[error("cannot back shared memory mapping of {0} bytes")]
    OutOfMemory(usize),

    /// Requested alignment exceeds the page size (or is not a power of two).
    #[error("unsupported alignment {align} (page size is {page_size})")]
    AlignmentUnsupported {
        /// The alignment that was requested.
        align: usize,
        /// The host page size.
        page_size: usize,
    },

    /// An argument violated a documented precondition (zero size, foreign
    /// pointer, malformed name, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A reader-side access would run past the end of the region.
    #[error("offset {offset} + {len} bytes exceeds region length {region_len}")]
    OutOfBounds {
        /// Byte offset of the access within the region.
        offset: usize,
        /// Length of the access in bytes.
        len: usize,
        /// Total length of the region.
        region_len: usize,
    },

    /// System call error (via rustix) that maps to no documented kind.
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
