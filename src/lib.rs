//! # Mirage
//!
//! POSIX `mmap` semantics on hosts that only offer a flat reserve/commit
//! memory model with per-page protection and synchronous fault reporting.
//!
//! Mirage emulates shared and private, file-backed and anonymous mappings:
//! pages commit on first touch, file bytes are demand-read through
//! duplicated handles, writes to shared writable mappings are dirty-tracked
//! per page and written back by a debounced per-process flusher or a
//! synchronous `msync`.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use mirage::prelude::*;
//!
//! let store = MapStore::new();
//! let space = store.attach(Pid(1))?;
//!
//! let file = FileDesc::open("data.bin")?;
//! let addr = space.mmap(
//!     0,
//!     8192,
//!     Prot::READ | Prot::WRITE,
//!     MapFlags::SHARED,
//!     Some(&file),
//!     0,
//! )?;
//!
//! // The embedder's trap glue forwards faults:
//! space.resolve_fault(addr.as_ptr() as usize, Access::Write)?;
//!
//! space.msync(addr, 8192, MsyncFlags::Sync)?;
//! space.munmap(addr, 8192)?;
//! # Ok::<(), mirage::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod defaults;
pub mod error;
pub mod host;
pub mod registry;
pub mod vm;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::host::{HostMem, SystemHost};
    pub use crate::registry::{FileDesc, Pid};
    pub use crate::vm::{
        Access, AddressSpace, Advice, FaultDisposition, MapFlags, MapStore, MsyncFlags, Prot,
    };
}

pub use error::{Error, Result};
