//! Per-(process, file) duplicated handles and dirty state.

use crate::error::{Error, Result};
use crate::registry::FileKey;
use crate::vm::bitmap::DirtyBitmap;
use rustix::fd::{BorrowedFd, OwnedFd};
use rustix::io::Errno;
use rustix::process::{Resource, Rlimit};

/// One duplicated OS handle plus the dirty-page bitmap for a file within a
/// process. Shared by every mapping of that file in the process and
/// reference-counted the same way as memory objects; dropping it closes the
/// duplicate.
pub(crate) struct FileHandle {
    pub fd: OwnedFd,
    pub key: FileKey,
    pub dirty: DirtyBitmap,
    pub users: u32,
}

impl FileHandle {
    /// Duplicate `fd` for this process's own use.
    ///
    /// Private mappings get a close-on-exec duplicate (the handle must not
    /// leak across exec); shared mappings keep the duplicate inheritable.
    pub fn duplicate(fd: BorrowedFd<'_>, key: FileKey, inheritable: bool) -> Result<Self> {
        let fd = dup_with_limit_retry(fd, inheritable)?;
        Ok(Self {
            fd,
            key,
            dirty: DirtyBitmap::new(),
            users: 0,
        })
    }
}

fn try_dup(fd: BorrowedFd<'_>, inheritable: bool) -> rustix::io::Result<OwnedFd> {
    if inheritable {
        rustix::io::dup(fd)
    } else {
        rustix::io::fcntl_dupfd_cloexec(fd, 0)
    }
}

/// Duplicate a descriptor, raising `RLIMIT_NOFILE` once if the table is
/// full. A second failure is reported as `NoSpace`.
fn dup_with_limit_retry(fd: BorrowedFd<'_>, inheritable: bool) -> Result<OwnedFd> {
    match try_dup(fd, inheritable) {
        Ok(dup) => Ok(dup),
        Err(Errno::MFILE) => {
            raise_nofile_limit()?;
            try_dup(fd, inheritable).map_err(|_| Error::NoSpace)
        }
        Err(err) => Err(err.into()),
    }
}

fn raise_nofile_limit() -> Result<()> {
    let limit = rustix::process::getrlimit(Resource::Nofile);
    let raised = match (limit.current, limit.maximum) {
        (Some(cur), Some(max)) if cur < max => Rlimit {
            current: Some(max),
            maximum: Some(max),
        },
        (Some(_), None) => Rlimit {
            current: None,
            maximum: None,
        },
        _ => return Err(Error::NoSpace),
    };
    tracing::warn!(
        current = ?limit.current,
        maximum = ?limit.maximum,
        "descriptor table full; raising RLIMIT_NOFILE"
    );
    rustix::process::setrlimit(Resource::Nofile, raised).map_err(|_| Error::NoSpace)
}
