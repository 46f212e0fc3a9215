//! Default tunables for the mapping layer.
//!
//! These values are deliberately conservative. They can be overridden per
//! store through [`StoreOptions`](crate::vm::StoreOptions).

use std::time::Duration;

/// Delay between a write fault (or asynchronous `msync`) and the background
/// write-back it schedules. Bursts of write faults inside this window are
/// coalesced into a single flush pass.
pub const FLUSH_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Depth of the bounded channel feeding a process's flush worker. Requests
/// beyond this depth are dropped; the pending flag guarantees one is enough.
pub const FLUSH_CHANNEL_DEPTH: usize = 4;

/// Fallback page size when the host cannot report one.
pub const FALLBACK_PAGE_SIZE: usize = 4096;
