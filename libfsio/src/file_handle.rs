use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::Path;

use crate::error::Result;
use crate::handle::{Caching, Creation, Handle, HandleFlags, Mode};
use crate::io_handle::IoHandle;
use crate::native::NativeHandle;
use crate::sys::{NativeOps, Sys};

/// An `IoHandle` opened from a filesystem path.
pub struct FileHandle {
    io: IoHandle,
    created: bool,
}

impl FileHandle {
    /// Opens `path`. With safety fsyncs issued, a file this call created
    /// has its parent directory synced (Linux) and an open-time truncation
    /// is synced too.
    pub fn open(
        path: impl AsRef<Path>,
        mode: Mode,
        creation: Creation,
        caching: Caching,
        flags: HandleFlags,
    ) -> Result<Self> {
        let path = path.as_ref();
        let (native, created) = open_noting_creation(path, mode, creation, caching)?;
        let handle = Handle::new(native, caching, flags).with_path(path.to_path_buf());

        if handle.are_safety_fsyncs_issued() && handle.is_writable() {
            if creation == Creation::Truncate {
                Sys::sync(native)?;
            }
            #[cfg(target_os = "linux")]
            if created {
                Sys::sync_parent_dir(path)?;
            }
        }
        Ok(FileHandle {
            io: IoHandle::new(handle),
            created,
        })
    }

    /// True when this handle's open created the file.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn length(&self) -> Result<u64> {
        Sys::length(self.native_handle())
    }

    /// Sets the file length, syncing afterwards when safety fsyncs are issued.
    pub fn truncate(&mut self, length: u64) -> Result<()> {
        Sys::truncate(self.native_handle(), length)?;
        if self.are_safety_fsyncs_issued() {
            Sys::sync(self.native_handle())?;
        }
        Ok(())
    }

    pub fn into_io_handle(self) -> IoHandle {
        self.io
    }
}

/// `IfNeeded` is split into an exclusive create and a plain open so the
/// caller learns which one happened.
fn open_noting_creation(
    path: &Path,
    mode: Mode,
    creation: Creation,
    caching: Caching,
) -> Result<(NativeHandle, bool)> {
    match creation {
        Creation::OnlyIfNotExist => Ok((Sys::open(path, mode, creation, caching)?, true)),
        Creation::IfNeeded => loop {
            match Sys::open(path, mode, Creation::OnlyIfNotExist, caching) {
                Ok(native) => return Ok((native, true)),
                Err(e) if e.raw_os_error() == libc::EEXIST => {}
                Err(e) => return Err(e),
            }
            match Sys::open(path, mode, Creation::OpenExisting, caching) {
                Ok(native) => return Ok((native, false)),
                // removed in between, try creating again
                Err(e) if e.raw_os_error() == libc::ENOENT => {}
                Err(e) => return Err(e),
            }
        },
        Creation::OpenExisting | Creation::Truncate => {
            Ok((Sys::open(path, mode, creation, caching)?, false))
        }
    }
}

impl Deref for FileHandle {
    type Target = IoHandle;

    fn deref(&self) -> &IoHandle {
        &self.io
    }
}

impl DerefMut for FileHandle {
    fn deref_mut(&mut self) -> &mut IoHandle {
        &mut self.io
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FileHandle").field(&self.io).finish()
    }
}
