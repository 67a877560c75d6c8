use std::fmt;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::native::{Disposition, NativeHandle};
use crate::sys::{NativeOps, Sys};

/// What a handle may do with the resource it opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Neither read nor write, only synchronise.
    None,
    AttrRead,
    AttrWrite,
    Read,
    /// Read and write.
    Write,
    /// Atomic append with respect to every other appender.
    Append,
}

/// Whether opening also creates or truncates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Creation {
    OpenExisting,
    OnlyIfNotExist,
    IfNeeded,
    /// Atomically truncate an existing file on open.
    Truncate,
}

/// Kernel caching contract, from least to most cached.
///
/// | mode | reads cached | writes durable on completion | safety fsyncs |
/// |---|---|---|---|
/// | `None` | no | yes | yes |
/// | `OnlyMetadata` | metadata only | data yes | yes |
/// | `Reads` | yes | yes | yes |
/// | `ReadsAndMetadata` | yes | data yes | yes |
/// | `All` | yes | no | no |
/// | `SafetyFsyncs` | yes | no | yes |
/// | `Temporary` | yes | no, deferred to last close | no |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Caching {
    None,
    OnlyMetadata,
    Reads,
    ReadsAndMetadata,
    All,
    SafetyFsyncs,
    Temporary,
}

impl Caching {
    pub fn are_reads_from_cache(self) -> bool {
        !matches!(self, Caching::None | Caching::OnlyMetadata)
    }

    pub fn are_writes_durable(self) -> bool {
        matches!(
            self,
            Caching::None | Caching::OnlyMetadata | Caching::Reads | Caching::ReadsAndMetadata
        )
    }

    /// Modes which get an fsync at truncation and close unless disabled.
    pub fn implies_safety_fsyncs(self) -> bool {
        !matches!(self, Caching::All | Caching::Temporary)
    }
}

impl fmt::Display for Caching {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Caching::None => "none",
            Caching::OnlyMetadata => "only_metadata",
            Caching::Reads => "reads",
            Caching::ReadsAndMetadata => "reads_and_metadata",
            Caching::All => "all",
            Caching::SafetyFsyncs => "safety_fsyncs",
            Caching::Temporary => "temporary",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Behavioural flags a handle is opened with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HandleFlags: u32 {
        /// Windows only. Recorded, no effect on POSIX.
        const DELETE_ON_LAST_CLOSE = 1 << 0;
        /// POSIX only. Unlink the path when this handle closes.
        const UNLINK_ON_FIRST_CLOSE = 1 << 1;
        /// Suppress the extra fsyncs implied by the caching mode.
        const DISABLE_SAFETY_FSYNCS = 1 << 2;
        /// Windows only. Recorded, no effect on POSIX.
        const OVERLAPPED = 1 << 28;
        /// Byte range locks on this handle have the POSIX property that
        /// closing any descriptor to the file drops all of them.
        const BYTE_LOCK_INSANITY = 1 << 29;
    }
}

/// Exclusive owner of one native descriptor.
///
/// A handle is either empty or owns a valid descriptor. Dropping a handle
/// which still owns its descriptor closes it, discarding any error.
pub struct Handle {
    native: NativeHandle,
    caching: Caching,
    flags: HandleFlags,
    // Set through `&self` by the locking paths.
    lock_insanity: AtomicBool,
    path: Option<PathBuf>,
}

impl Handle {
    /// Takes ownership of `native`.
    pub fn new(native: NativeHandle, caching: Caching, flags: HandleFlags) -> Self {
        Handle {
            native,
            caching,
            flags,
            lock_insanity: AtomicBool::new(flags.contains(HandleFlags::BYTE_LOCK_INSANITY)),
            path: None,
        }
    }

    /// Adopts a raw descriptor, probing its capabilities. The descriptor is
    /// closed when the handle is.
    pub fn from_raw_fd(fd: RawFd, caching: Caching, flags: HandleFlags) -> Result<Self> {
        let native = Sys::adopt(fd)?;
        Ok(Handle::new(native, caching, flags))
    }

    pub(crate) fn with_path(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }

    pub fn empty() -> Self {
        Handle::new(NativeHandle::invalid(), Caching::None, HandleFlags::empty())
    }

    pub fn is_valid(&self) -> bool {
        self.native.is_valid()
    }

    /// The path this handle was opened with, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn native_handle(&self) -> NativeHandle {
        self.native
    }

    pub fn flags(&self) -> HandleFlags {
        let mut flags = self.flags;
        flags.set(
            HandleFlags::BYTE_LOCK_INSANITY,
            self.lock_insanity.load(Ordering::Relaxed),
        );
        flags
    }

    pub(crate) fn note_lock_insanity(&self) {
        self.lock_insanity.store(true, Ordering::Relaxed);
    }

    pub fn kernel_caching(&self) -> Caching {
        self.caching
    }

    pub fn are_reads_from_cache(&self) -> bool {
        self.caching.are_reads_from_cache()
    }

    pub fn are_writes_durable(&self) -> bool {
        self.caching.are_writes_durable()
    }

    pub fn are_safety_fsyncs_issued(&self) -> bool {
        !self.flags.contains(HandleFlags::DISABLE_SAFETY_FSYNCS)
            && self.caching.implies_safety_fsyncs()
    }

    pub fn is_readable(&self) -> bool {
        self.native.is_readable()
    }

    pub fn is_writable(&self) -> bool {
        self.native.is_writable()
    }

    pub fn is_append_only(&self) -> bool {
        self.native.is_append_only()
    }

    pub fn is_overlapped(&self) -> bool {
        self.native.is_overlapped()
    }

    pub fn is_seekable(&self) -> bool {
        self.native.is_seekable()
    }

    pub fn requires_aligned_io(&self) -> bool {
        self.native.requires_aligned_io()
    }

    pub fn is_regular(&self) -> bool {
        self.native.is_regular()
    }

    pub fn is_directory(&self) -> bool {
        self.native.is_directory()
    }

    pub fn is_symlink(&self) -> bool {
        self.native.is_symlink()
    }

    pub fn is_multiplexer(&self) -> bool {
        self.native.is_multiplexer()
    }

    pub fn is_process(&self) -> bool {
        self.native.is_process()
    }

    /// Closes the descriptor now. A no-op on an empty handle.
    ///
    /// When safety fsyncs are issued the file, and on Linux its parent
    /// directory, are synced first. The handle is empty afterwards even if
    /// the close itself failed.
    pub fn close(&mut self) -> Result<()> {
        if !self.native.is_valid() {
            return Ok(());
        }
        let native = std::mem::take(&mut self.native);
        let path = self.path.take();

        let synced = if self.are_safety_fsyncs_issued() {
            sync_for_close(native, path.as_deref())
        } else {
            Ok(())
        };
        if self.flags.contains(HandleFlags::UNLINK_ON_FIRST_CLOSE) {
            if let Some(path) = path.as_deref() {
                if let Err(e) = Sys::unlink(path) {
                    tracing::debug!(path = %path.display(), %e, "unlink on first close failed");
                }
            }
        }
        let closed = Sys::close(native);
        synced.and(closed)
    }

    /// Gives up ownership without closing.
    pub fn release(&mut self) -> NativeHandle {
        self.path = None;
        std::mem::take(&mut self.native)
    }

    /// Duplicates the descriptor at the kernel level. The clone owns its own
    /// descriptor and shares caching and flags.
    pub fn try_clone(&self) -> Result<Self> {
        let native = Sys::duplicate(self.native)?;
        let mut clone = Handle::new(native, self.caching, self.flags());
        clone.path = self.path.clone();
        Ok(clone)
    }

    pub fn set_append_only(&mut self, enable: bool) -> Result<()> {
        Sys::set_append_only(self.native, enable)?;
        self.native.set_disposition(Disposition::APPEND_ONLY, enable);
        tracing::debug!(fd = self.native.fd(), enable, "append only changed");
        Ok(())
    }

    /// Switches the caching contract. This may reopen the file, which drops
    /// any byte range locks held through this handle's open description.
    /// On failure nothing changes.
    pub fn set_kernel_caching(&mut self, caching: Caching) -> Result<()> {
        if caching == self.caching {
            return Ok(());
        }
        let native = Sys::set_caching(self.native, caching)?;
        tracing::debug!(
            fd = native.fd(),
            from = %self.caching,
            to = %caching,
            "kernel caching changed"
        );
        self.native = native;
        self.caching = caching;
        Ok(())
    }
}

/// Pipes, sockets and devices have nothing to flush and reject `fsync`.
fn sync_for_close(native: NativeHandle, path: Option<&Path>) -> Result<()> {
    let persistent = native.is_regular() || native.is_directory();
    if persistent && (native.is_writable() || native.is_append_only()) {
        Sys::sync(native)?;
        #[cfg(target_os = "linux")]
        if let Some(path) = path {
            Sys::sync_parent_dir(path)?;
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = path;
    Ok(())
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.native.is_valid() {
            let fd = self.native.fd();
            if let Err(e) = self.close() {
                tracing::warn!(fd, %e, "implicit close failed, error discarded");
            }
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("native", &self.native)
            .field("caching", &self.caching)
            .field("flags", &self.flags())
            .field("path", &self.path)
            .finish()
    }
}
