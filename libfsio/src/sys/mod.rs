//! The native operations every platform must provide. Exactly one
//! implementation is compiled in and aliased as `Sys`.

use std::os::fd::RawFd;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::handle::{Caching, Creation, Mode};
use crate::native::NativeHandle;

#[cfg(unix)]
mod posix;

#[cfg(unix)]
pub(crate) use posix::Posix as Sys;

#[cfg(all(test, unix))]
pub(crate) use posix::{lock_with, unlock_with};

/// Readiness a deadline-bounded transfer waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Read,
    Write,
}

/// Outcome of one attempt to take a byte range lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockAttempt {
    /// Held. `insane` reports that the lock has close-drops-all semantics.
    Acquired { insane: bool },
    /// Somebody else holds a conflicting lock.
    Contended,
}

pub(crate) trait NativeOps {
    fn open(path: &Path, mode: Mode, creation: Creation, caching: Caching) -> Result<NativeHandle>;

    /// Probes an already open descriptor.
    fn adopt(fd: RawFd) -> Result<NativeHandle>;

    fn close(native: NativeHandle) -> Result<()>;

    fn duplicate(native: NativeHandle) -> Result<NativeHandle>;

    fn sync(native: NativeHandle) -> Result<()>;

    fn sync_parent_dir(path: &Path) -> Result<()>;

    fn unlink(path: &Path) -> Result<()>;

    fn set_append_only(native: NativeHandle, enable: bool) -> Result<()>;

    /// Returns the handle to use from now on, which may carry new
    /// capability bits. The descriptor number is preserved.
    fn set_caching(native: NativeHandle, caching: Caching) -> Result<NativeHandle>;

    fn read(native: NativeHandle, buffers: &mut [&mut [u8]], offset: u64) -> Result<usize>;

    /// Like `read` but never blocks; `Ok(None)` when nothing is available.
    fn read_nowait(native: NativeHandle, buffers: &mut [&mut [u8]], offset: u64) -> Result<Option<usize>>;

    fn write(native: NativeHandle, buffers: &[&[u8]], offset: u64) -> Result<usize>;

    /// Like `write` but never blocks; `Ok(None)` when no space is available.
    fn write_nowait(native: NativeHandle, buffers: &[&[u8]], offset: u64) -> Result<Option<usize>>;

    /// Waits up to `timeout` for readiness. `Ok(false)` on timeout or signal.
    fn wait(native: NativeHandle, interest: Interest, timeout: Duration) -> Result<bool>;

    fn lock(
        native: NativeHandle,
        offset: u64,
        length: u64,
        exclusive: bool,
        blocking: bool,
    ) -> Result<LockAttempt>;

    fn unlock(native: NativeHandle, offset: u64, length: u64) -> Result<()>;

    fn truncate(native: NativeHandle, length: u64) -> Result<()>;

    fn length(native: NativeHandle) -> Result<u64>;
}
