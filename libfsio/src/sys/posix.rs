use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{BorrowedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use libc::c_int;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::stat::Mode as FileMode;
use nix::sys::uio::{preadv, pwritev, readv, writev};

use super::{Interest, LockAttempt, NativeOps};
use crate::error::{Error, Result};
use crate::handle::{Caching, Creation, Mode};
use crate::native::{Disposition, NativeHandle};

/// Set once the kernel refuses open file description locks. Every lock
/// taken afterwards in this process uses classic `fcntl` semantics.
static LOCK_INSANITY: AtomicBool = AtomicBool::new(!cfg!(target_os = "linux"));

const IOV_MAX: usize = 1024;

#[cfg(target_os = "linux")]
const O_DIRECT: c_int = libc::O_DIRECT;
#[cfg(not(target_os = "linux"))]
const O_DIRECT: c_int = 0;

#[cfg(target_os = "linux")]
const O_DSYNC: c_int = libc::O_DSYNC;
#[cfg(not(target_os = "linux"))]
const O_DSYNC: c_int = libc::O_SYNC;

const CACHING_MASK: c_int = O_DIRECT | libc::O_SYNC | O_DSYNC;

pub(crate) struct Posix;

fn access_flags(mode: Mode) -> c_int {
    match mode {
        Mode::None | Mode::AttrRead | Mode::AttrWrite | Mode::Read => libc::O_RDONLY,
        Mode::Write => libc::O_RDWR,
        Mode::Append => libc::O_RDWR | libc::O_APPEND,
    }
}

fn creation_flags(creation: Creation) -> c_int {
    match creation {
        Creation::OpenExisting => 0,
        Creation::OnlyIfNotExist => libc::O_CREAT | libc::O_EXCL,
        Creation::IfNeeded => libc::O_CREAT,
        Creation::Truncate => libc::O_TRUNC,
    }
}

fn caching_flags(caching: Caching) -> Result<c_int> {
    let flags = match caching {
        Caching::None => O_DIRECT | libc::O_SYNC,
        Caching::OnlyMetadata => O_DIRECT,
        Caching::Reads => libc::O_SYNC,
        Caching::ReadsAndMetadata => O_DSYNC,
        Caching::All | Caching::SafetyFsyncs | Caching::Temporary => 0,
    };
    if O_DIRECT == 0 && matches!(caching, Caching::None | Caching::OnlyMetadata) {
        return Err(Error::NotSupported("uncached i/o on this platform"));
    }
    Ok(flags)
}

/// For the nix calls which take `AsFd`.
fn borrowed(native: &NativeHandle) -> BorrowedFd<'_> {
    // SAFETY: the owning Handle keeps the descriptor open while any
    // operation on its NativeHandle runs.
    unsafe { BorrowedFd::borrow_raw(native.fd()) }
}

fn getfl(fd: RawFd) -> Result<c_int> {
    Ok(fcntl(fd, FcntlArg::F_GETFL)?)
}

fn setfl(fd: RawFd, flags: c_int) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFL(OFlag::from_bits_retain(flags)))?;
    Ok(())
}

/// Runs `f` with `O_NONBLOCK` set, restoring the previous status flags.
fn without_blocking<T>(fd: RawFd, f: impl FnOnce() -> T) -> Result<T> {
    let fl = getfl(fd)?;
    if fl & libc::O_NONBLOCK != 0 {
        return Ok(f());
    }
    setfl(fd, fl | libc::O_NONBLOCK)?;
    let out = f();
    setfl(fd, fl)?;
    Ok(out)
}

fn probe(fd: RawFd) -> Result<NativeHandle> {
    let fl = getfl(fd)?;
    let st = nix::sys::stat::fstat(fd)?;
    let mut disposition = Disposition::empty();

    match fl & libc::O_ACCMODE {
        libc::O_RDONLY => disposition |= Disposition::READABLE,
        libc::O_WRONLY => disposition |= Disposition::WRITABLE,
        _ => disposition |= Disposition::READABLE | Disposition::WRITABLE,
    }
    disposition.set(Disposition::APPEND_ONLY, fl & libc::O_APPEND != 0);
    disposition.set(Disposition::ALIGNED_IO, O_DIRECT != 0 && fl & O_DIRECT != 0);

    match st.st_mode & libc::S_IFMT {
        libc::S_IFREG => disposition |= Disposition::FILE | Disposition::SEEKABLE,
        libc::S_IFBLK => disposition |= Disposition::SEEKABLE,
        libc::S_IFCHR => {}
        libc::S_IFDIR => disposition |= Disposition::DIRECTORY,
        libc::S_IFLNK => disposition |= Disposition::SYMLINK,
        _ => disposition |= anon_inode_kind(fd),
    }
    Ok(NativeHandle::new(fd, disposition))
}

#[cfg(target_os = "linux")]
fn anon_inode_kind(fd: RawFd) -> Disposition {
    match std::fs::read_link(format!("/proc/self/fd/{fd}")) {
        Ok(target) => match target.to_string_lossy().as_ref() {
            "anon_inode:[eventpoll]" => Disposition::MULTIPLEXER,
            "anon_inode:[pidfd]" => Disposition::PROCESS,
            _ => Disposition::empty(),
        },
        Err(_) => Disposition::empty(),
    }
}

#[cfg(not(target_os = "linux"))]
fn anon_inode_kind(_fd: RawFd) -> Disposition {
    Disposition::empty()
}

#[cfg(target_os = "linux")]
fn reopen(fd: RawFd, flags: c_int) -> Result<()> {
    let proc_path = format!("/proc/self/fd/{fd}");
    let keep = libc::O_ACCMODE | libc::O_APPEND | libc::O_NONBLOCK | CACHING_MASK;
    let newfd = nix::fcntl::open(
        proc_path.as_str(),
        OFlag::from_bits_truncate((flags & keep) | libc::O_CLOEXEC),
        FileMode::empty(),
    )?;
    let replaced = nix::unistd::dup3(newfd, fd, OFlag::O_CLOEXEC);
    let _ = nix::unistd::close(newfd);
    replaced?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn reopen(_fd: RawFd, _flags: c_int) -> Result<()> {
    Err(Error::NotSupported("changing synchronous i/o needs a reopen"))
}

fn clamp_offset(offset: u64) -> libc::off_t {
    // POSIX offsets are signed; the top bit is always cleared.
    (offset & i64::MAX as u64) as libc::off_t
}

fn flock_record(kind: c_int, offset: u64, length: u64) -> libc::flock {
    // SAFETY: flock is plain old data; all-zero is a valid value.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind as _;
    fl.l_whence = libc::SEEK_SET as _;
    if length == 0 {
        // the whole file
        fl.l_start = 0;
        fl.l_len = 0;
    } else {
        fl.l_start = clamp_offset(offset);
        fl.l_len = clamp_offset(length);
    }
    fl
}

/// Which `fcntl` record lock command to issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockCmd {
    /// Owned by the process, dropped when any descriptor to the file closes.
    Classic { wait: bool },
    #[cfg(target_os = "linux")]
    OpenFileDescription { wait: bool },
}

impl LockCmd {
    fn arg(self, fl: &libc::flock) -> FcntlArg<'_> {
        match self {
            LockCmd::Classic { wait: false } => FcntlArg::F_SETLK(fl),
            LockCmd::Classic { wait: true } => FcntlArg::F_SETLKW(fl),
            #[cfg(target_os = "linux")]
            LockCmd::OpenFileDescription { wait: false } => FcntlArg::F_OFD_SETLK(fl),
            #[cfg(target_os = "linux")]
            LockCmd::OpenFileDescription { wait: true } => FcntlArg::F_OFD_SETLKW(fl),
        }
    }
}

/// `Ok(false)` when a conflicting lock is held elsewhere.
fn fcntl_lock(fd: RawFd, cmd: LockCmd, fl: &libc::flock) -> std::result::Result<bool, Errno> {
    loop {
        match fcntl(fd, cmd.arg(fl)) {
            Ok(_) => return Ok(true),
            Err(Errno::EAGAIN) | Err(Errno::EACCES) => return Ok(false),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(not(target_os = "linux"))]
#[allow(deprecated)]
fn flock_whole(fd: RawFd, exclusive: bool, blocking: bool) -> Result<LockAttempt> {
    use nix::fcntl::FlockArg;
    let arg = match (exclusive, blocking) {
        (true, true) => FlockArg::LockExclusive,
        (true, false) => FlockArg::LockExclusiveNonblock,
        (false, true) => FlockArg::LockShared,
        (false, false) => FlockArg::LockSharedNonblock,
    };
    loop {
        match nix::fcntl::flock(fd, arg) {
            Ok(()) => return Ok(LockAttempt::Acquired { insane: false }),
            Err(Errno::EAGAIN) => return Ok(LockAttempt::Contended),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Byte range lock whose fallback state lives in `insanity`.
pub(crate) fn lock_with(
    insanity: &AtomicBool,
    native: NativeHandle,
    offset: u64,
    length: u64,
    exclusive: bool,
    blocking: bool,
) -> Result<LockAttempt> {
    let fd = native.fd();
    #[cfg(not(target_os = "linux"))]
    if length == 0 {
        return flock_whole(fd, exclusive, blocking);
    }
    let kind = if exclusive { libc::F_WRLCK } else { libc::F_RDLCK };
    let fl = flock_record(kind as c_int, offset, length);

    #[cfg(target_os = "linux")]
    if !insanity.load(Ordering::Relaxed) {
        match fcntl_lock(fd, LockCmd::OpenFileDescription { wait: blocking }, &fl) {
            Ok(true) => return Ok(LockAttempt::Acquired { insane: false }),
            Ok(false) => return Ok(LockAttempt::Contended),
            Err(Errno::EINVAL) => {
                if !insanity.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        "open file description locks unavailable, falling back to \
                         fcntl locks which are dropped when any descriptor closes"
                    );
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    match fcntl_lock(fd, LockCmd::Classic { wait: blocking }, &fl)? {
        true => Ok(LockAttempt::Acquired { insane: true }),
        false => Ok(LockAttempt::Contended),
    }
}

pub(crate) fn unlock_with(
    insanity: &AtomicBool,
    native: NativeHandle,
    offset: u64,
    length: u64,
) -> Result<()> {
    let fd = native.fd();
    #[cfg(not(target_os = "linux"))]
    if length == 0 {
        #[allow(deprecated)]
        nix::fcntl::flock(fd, nix::fcntl::FlockArg::Unlock)?;
        return Ok(());
    }
    let fl = flock_record(libc::F_UNLCK as c_int, offset, length);
    let cmd = unlock_cmd(insanity.load(Ordering::Relaxed));
    fcntl_lock(fd, cmd, &fl)?;
    Ok(())
}

fn unlock_cmd(insane: bool) -> LockCmd {
    #[cfg(target_os = "linux")]
    if !insane {
        return LockCmd::OpenFileDescription { wait: false };
    }
    #[cfg(not(target_os = "linux"))]
    let _ = insane;
    LockCmd::Classic { wait: false }
}

fn read_vectored(native: NativeHandle, buffers: &mut [&mut [u8]], offset: u64) -> std::result::Result<usize, Errno> {
    let mut iov: Vec<IoSliceMut<'_>> = buffers
        .iter_mut()
        .take(IOV_MAX)
        .map(|b| IoSliceMut::new(b))
        .collect();
    let fd = borrowed(&native);
    loop {
        let done = if native.is_seekable() {
            preadv(fd, &mut iov, clamp_offset(offset))
        } else {
            readv(fd, &mut iov)
        };
        match done {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

fn write_vectored(native: NativeHandle, buffers: &[&[u8]], offset: u64) -> std::result::Result<usize, Errno> {
    let iov: Vec<IoSlice<'_>> = buffers.iter().take(IOV_MAX).map(|b| IoSlice::new(b)).collect();
    let fd = borrowed(&native);
    let positional = native.is_seekable() && !native.is_append_only();
    loop {
        let done = if positional {
            pwritev(fd, &iov, clamp_offset(offset))
        } else {
            writev(fd, &iov)
        };
        match done {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// `None` for `EAGAIN`.
fn would_block(done: std::result::Result<usize, Errno>) -> Result<Option<usize>> {
    match done {
        Ok(n) => Ok(Some(n)),
        Err(Errno::EAGAIN) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl NativeOps for Posix {
    fn open(path: &Path, mode: Mode, creation: Creation, caching: Caching) -> Result<NativeHandle> {
        let flags = access_flags(mode)
            | creation_flags(creation)
            | caching_flags(caching)?
            | libc::O_CLOEXEC;
        let perms = FileMode::S_IRUSR | FileMode::S_IWUSR | FileMode::S_IRGRP | FileMode::S_IWGRP;
        let fd = nix::fcntl::open(path, OFlag::from_bits_truncate(flags), perms)?;
        match probe(fd) {
            Ok(native) => Ok(native),
            Err(e) => {
                let _ = nix::unistd::close(fd);
                Err(e)
            }
        }
    }

    fn adopt(fd: RawFd) -> Result<NativeHandle> {
        probe(fd)
    }

    fn close(native: NativeHandle) -> Result<()> {
        nix::unistd::close(native.fd())?;
        Ok(())
    }

    fn duplicate(native: NativeHandle) -> Result<NativeHandle> {
        let fd = fcntl(native.fd(), FcntlArg::F_DUPFD_CLOEXEC(0))?;
        Ok(NativeHandle::new(fd, native.disposition()))
    }

    fn sync(native: NativeHandle) -> Result<()> {
        nix::unistd::fsync(native.fd())?;
        Ok(())
    }

    fn sync_parent_dir(path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let fd = nix::fcntl::open(
            parent,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            FileMode::empty(),
        )?;
        let synced = nix::unistd::fsync(fd);
        let _ = nix::unistd::close(fd);
        synced?;
        Ok(())
    }

    fn unlink(path: &Path) -> Result<()> {
        nix::unistd::unlink(path)?;
        Ok(())
    }

    fn set_append_only(native: NativeHandle, enable: bool) -> Result<()> {
        let fl = getfl(native.fd())?;
        let wanted = if enable {
            fl | libc::O_APPEND
        } else {
            fl & !libc::O_APPEND
        };
        if wanted != fl {
            setfl(native.fd(), wanted)?;
        }
        Ok(())
    }

    fn set_caching(native: NativeHandle, caching: Caching) -> Result<NativeHandle> {
        let fd = native.fd();
        let cached = caching_flags(caching)?;
        let current = getfl(fd)?;
        let wanted = (current & !CACHING_MASK) | cached;
        if wanted == current {
            return probe(fd);
        }
        // Linux applies O_DIRECT through F_SETFL but silently ignores the
        // sync flags, hence the check and the reopen.
        setfl(fd, wanted)?;
        if getfl(fd)? & CACHING_MASK != cached {
            if let Err(e) = reopen(fd, wanted) {
                let _ = setfl(fd, current);
                return Err(e);
            }
        }
        probe(fd)
    }

    fn read(native: NativeHandle, buffers: &mut [&mut [u8]], offset: u64) -> Result<usize> {
        Ok(read_vectored(native, buffers, offset)?)
    }

    fn read_nowait(native: NativeHandle, buffers: &mut [&mut [u8]], offset: u64) -> Result<Option<usize>> {
        would_block(without_blocking(native.fd(), || {
            read_vectored(native, buffers, offset)
        })?)
    }

    fn write(native: NativeHandle, buffers: &[&[u8]], offset: u64) -> Result<usize> {
        Ok(write_vectored(native, buffers, offset)?)
    }

    fn write_nowait(native: NativeHandle, buffers: &[&[u8]], offset: u64) -> Result<Option<usize>> {
        would_block(without_blocking(native.fd(), || {
            write_vectored(native, buffers, offset)
        })?)
    }

    fn wait(native: NativeHandle, interest: Interest, timeout: Duration) -> Result<bool> {
        let events = match interest {
            Interest::Read => PollFlags::POLLIN,
            Interest::Write => PollFlags::POLLOUT,
        };
        let mut fds = [PollFd::new(borrowed(&native), events)];
        let timeout =
            PollTimeout::try_from(timeout.as_micros().div_ceil(1000)).unwrap_or(PollTimeout::MAX);
        match nix::poll::poll(&mut fds, timeout) {
            Ok(0) | Err(Errno::EINTR) => Ok(false),
            Ok(_) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn lock(
        native: NativeHandle,
        offset: u64,
        length: u64,
        exclusive: bool,
        blocking: bool,
    ) -> Result<LockAttempt> {
        lock_with(&LOCK_INSANITY, native, offset, length, exclusive, blocking)
    }

    fn unlock(native: NativeHandle, offset: u64, length: u64) -> Result<()> {
        unlock_with(&LOCK_INSANITY, native, offset, length)
    }

    fn truncate(native: NativeHandle, length: u64) -> Result<()> {
        nix::unistd::ftruncate(borrowed(&native), clamp_offset(length))?;
        Ok(())
    }

    fn length(native: NativeHandle) -> Result<u64> {
        Ok(nix::sys::stat::fstat(native.fd())?.st_size as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_offset_clears_top_bit() {
        assert_eq!(clamp_offset(u64::MAX), i64::MAX);
        assert_eq!(clamp_offset(42), 42);
    }

    #[test]
    fn test_zero_length_record_covers_whole_file() {
        let fl = flock_record(libc::F_WRLCK as c_int, 4096, 0);
        assert_eq!(fl.l_start, 0);
        assert_eq!(fl.l_len, 0);
        let fl = flock_record(libc::F_RDLCK as c_int, 7, 1);
        assert_eq!((fl.l_start, fl.l_len), (7, 1));
    }

    #[test]
    fn test_caching_flags() {
        assert_eq!(caching_flags(Caching::All).unwrap(), 0);
        assert_eq!(caching_flags(Caching::Temporary).unwrap(), 0);
        assert_eq!(caching_flags(Caching::Reads).unwrap(), libc::O_SYNC);
    }

    #[test]
    fn test_unlock_follows_lock_semantics() {
        assert_eq!(unlock_cmd(true), LockCmd::Classic { wait: false });
        #[cfg(target_os = "linux")]
        assert_eq!(unlock_cmd(false), LockCmd::OpenFileDescription { wait: false });
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_classic_fallback_locks_and_unlocks() {
        use std::os::fd::AsRawFd;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let fa = std::fs::File::options().read(true).write(true).create(true).open(&path).unwrap();
        let fb = std::fs::File::options().read(true).write(true).open(&path).unwrap();
        let a = probe(fa.as_raw_fd()).unwrap();
        let b = probe(fb.as_raw_fd()).unwrap();

        let insane = AtomicBool::new(true);
        let sane = AtomicBool::new(false);
        assert_eq!(
            lock_with(&insane, a, 10, 1, true, false).unwrap(),
            LockAttempt::Acquired { insane: true }
        );
        // description locks conflict with the process's classic lock
        assert_eq!(lock_with(&sane, b, 10, 1, true, false).unwrap(), LockAttempt::Contended);

        unlock_with(&insane, a, 10, 1).unwrap();
        assert_eq!(
            lock_with(&sane, b, 10, 1, true, false).unwrap(),
            LockAttempt::Acquired { insane: false }
        );
        assert!(!sane.load(Ordering::Relaxed));
    }

    #[test]
    fn test_write_nowait_stops_on_full_pipe() {
        use std::os::fd::AsRawFd;
        let (r, w) = nix::unistd::pipe().unwrap();
        let writer = probe(w.as_raw_fd()).unwrap();
        let chunk = vec![1u8; 64 * 1024];
        let mut total = 0;
        while let Some(n) = Posix::write_nowait(writer, &[&chunk[..]], 0).unwrap() {
            total += n;
            assert!(total <= 64 * 1024 * 1024);
        }
        assert!(total > 0);
        // the descriptor is blocking again afterwards
        assert_eq!(getfl(w.as_raw_fd()).unwrap() & libc::O_NONBLOCK, 0);

        let reader = probe(r.as_raw_fd()).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(Posix::read_nowait(reader, &mut [&mut buf[..]], 0).unwrap(), Some(16));
    }

    #[test]
    fn test_read_nowait_on_empty_pipe() {
        use std::os::fd::AsRawFd;
        let (r, _w) = nix::unistd::pipe().unwrap();
        let reader = probe(r.as_raw_fd()).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(Posix::read_nowait(reader, &mut [&mut buf[..]], 0).unwrap(), None);
    }

    #[test]
    fn test_probe_pipe() {
        let (r, w) = nix::unistd::pipe().unwrap();
        use std::os::fd::AsRawFd;
        let reader = probe(r.as_raw_fd()).unwrap();
        let writer = probe(w.as_raw_fd()).unwrap();
        assert!(reader.is_readable() && !reader.is_writable());
        assert!(writer.is_writable() && !writer.is_readable());
        assert!(!reader.is_seekable() && !reader.is_regular());
    }
}
