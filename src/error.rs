//! Error types for Mirage.

use thiserror::Error;

/// Result type alias using Mirage's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mapping operations.
///
/// The variants mirror the POSIX error codes the equivalent libc calls
/// would report (`EINVAL`, `EBADF`, `EACCES`, `ENOMEM`, `EMFILE`, `EOVERFLOW`).
#[derive(Error, Debug)]
pub enum Error {
    /// Bad flags, misaligned address or offset, or a zero-length request.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The descriptor is missing or does not refer to a regular file.
    #[error("bad file descriptor: {0}")]
    BadDescriptor(&'static str),

    /// Requested protection or flags are incompatible with the file's open
    /// mode, or the protection change class is not supported.
    #[error("access denied: {0}")]
    AccessDenied(&'static str),

    /// An allocation failed. Partial state has been unwound.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Handle duplication exhausted the process descriptor table even after
    /// raising the limit once.
    #[error("no space for a duplicated file handle")]
    NoSpace,

    /// Region arithmetic overflowed the addressable range.
    #[error("offset/length overflow")]
    Overflow,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
