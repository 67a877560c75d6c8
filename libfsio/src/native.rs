use std::fmt;
use std::os::fd::RawFd;

use bitflags::bitflags;

bitflags! {
    /// Static capabilities of a native descriptor, probed once when it is
    /// opened or adopted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Disposition: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const APPEND_ONLY = 1 << 2;
        const OVERLAPPED = 1 << 4;
        const SEEKABLE = 1 << 5;
        /// Opened with `O_DIRECT`; i/o must be block aligned.
        const ALIGNED_IO = 1 << 6;
        /// Regular file.
        const FILE = 1 << 8;
        const DIRECTORY = 1 << 9;
        const SYMLINK = 1 << 10;
        /// epoll, kqueue and friends.
        const MULTIPLEXER = 1 << 11;
        const PROCESS = 1 << 12;
    }
}

/// A raw OS descriptor plus what it can do. Copying this does not
/// duplicate or own the descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle {
    fd: RawFd,
    disposition: Disposition,
}

impl NativeHandle {
    pub const fn new(fd: RawFd, disposition: Disposition) -> Self {
        NativeHandle { fd, disposition }
    }

    pub const fn invalid() -> Self {
        NativeHandle {
            fd: -1,
            disposition: Disposition::empty(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }

    pub(crate) fn set_disposition(&mut self, disposition: Disposition, on: bool) {
        self.disposition.set(disposition, on);
    }

    pub fn is_readable(&self) -> bool {
        self.disposition.contains(Disposition::READABLE)
    }

    pub fn is_writable(&self) -> bool {
        self.disposition.contains(Disposition::WRITABLE)
    }

    pub fn is_append_only(&self) -> bool {
        self.disposition.contains(Disposition::APPEND_ONLY)
    }

    pub fn is_overlapped(&self) -> bool {
        self.disposition.contains(Disposition::OVERLAPPED)
    }

    pub fn is_seekable(&self) -> bool {
        self.disposition.contains(Disposition::SEEKABLE)
    }

    pub fn requires_aligned_io(&self) -> bool {
        self.disposition.contains(Disposition::ALIGNED_IO)
    }

    pub fn is_regular(&self) -> bool {
        self.disposition.contains(Disposition::FILE)
    }

    pub fn is_directory(&self) -> bool {
        self.disposition.contains(Disposition::DIRECTORY)
    }

    pub fn is_symlink(&self) -> bool {
        self.disposition.contains(Disposition::SYMLINK)
    }

    pub fn is_multiplexer(&self) -> bool {
        self.disposition.contains(Disposition::MULTIPLEXER)
    }

    pub fn is_process(&self) -> bool {
        self.disposition.contains(Disposition::PROCESS)
    }
}

impl Default for NativeHandle {
    fn default() -> Self {
        NativeHandle::invalid()
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeHandle({}, {:?})", self.fd, self.disposition)
    }
}
