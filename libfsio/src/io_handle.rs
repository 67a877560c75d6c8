use std::cell::OnceCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::deadline::{Deadline, DeadlineTimer};
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::native::NativeHandle;
use crate::sys::{Interest, LockAttempt, NativeOps, Sys};

const LOCK_POLL_MIN: Duration = Duration::from_micros(50);
const LOCK_POLL_MAX: Duration = Duration::from_millis(10);

/// Scatter-gather buffers consumed or filled in order, starting at `offset`.
#[derive(Debug)]
pub struct IoRequest<B> {
    pub buffers: Vec<B>,
    pub offset: u64,
}

impl<B> IoRequest<B> {
    pub fn new(buffers: Vec<B>, offset: u64) -> Self {
        IoRequest { buffers, offset }
    }
}

impl<B: AsRef<[u8]>> IoRequest<B> {
    /// Total bytes the request covers.
    pub fn len(&self) -> u64 {
        self.buffers.iter().map(|b| b.as_ref().len() as u64).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The buffers actually transferred. Each buffer's length is what moved
/// through it, which may be less than requested.
pub struct IoResult<B> {
    buffers: Vec<B>,
    bytes_transferred: OnceCell<usize>,
}

impl<B> IoResult<B> {
    fn new(buffers: Vec<B>) -> Self {
        IoResult {
            buffers,
            bytes_transferred: OnceCell::new(),
        }
    }

    pub fn buffers(&self) -> &[B] {
        &self.buffers
    }

    pub fn into_buffers(self) -> Vec<B> {
        self.buffers
    }
}

impl<B: AsRef<[u8]>> IoResult<B> {
    /// Summed once on first call.
    pub fn bytes_transferred(&self) -> usize {
        *self
            .bytes_transferred
            .get_or_init(|| self.buffers.iter().map(|b| b.as_ref().len()).sum())
    }
}

impl<B: AsRef<[u8]>> fmt::Debug for IoResult<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sizes: Vec<usize> = self.buffers.iter().map(|b| b.as_ref().len()).collect();
        f.debug_struct("IoResult").field("sizes", &sizes).finish()
    }
}

/// Requests which imply a lock extent: reads lock shared, writes exclusive.
pub trait RequestExtent {
    fn extent(&self) -> (u64, u64);
    fn exclusive(&self) -> bool;
}

impl<'a> RequestExtent for IoRequest<&'a mut [u8]> {
    fn extent(&self) -> (u64, u64) {
        (self.offset, self.len())
    }

    fn exclusive(&self) -> bool {
        false
    }
}

impl<'a> RequestExtent for IoRequest<&'a [u8]> {
    fn extent(&self) -> (u64, u64) {
        (self.offset, self.len())
    }

    fn exclusive(&self) -> bool {
        true
    }
}

fn shrink_mut(buffer: &mut [u8], len: usize) -> &mut [u8] {
    &mut buffer[..len]
}

fn shrink(buffer: &[u8], len: usize) -> &[u8] {
    &buffer[..len]
}

/// The part of `buffers` after the first `done` bytes.
fn unwritten<'a>(buffers: &[&'a [u8]], mut done: usize) -> Vec<&'a [u8]> {
    let mut rest = Vec::with_capacity(buffers.len());
    for &b in buffers {
        if done >= b.len() {
            done -= b.len();
            continue;
        }
        rest.push(&b[done..]);
        done = 0;
    }
    rest
}

/// A handle capable of scatter-gather i/o and byte range locking.
pub struct IoHandle {
    handle: Handle,
}

impl IoHandle {
    pub fn new(handle: Handle) -> Self {
        IoHandle { handle }
    }

    pub fn into_handle(self) -> Handle {
        self.handle
    }

    /// Reads into `req`'s buffers. Only the returned buffers are meaningful;
    /// each is cut down to the bytes it received.
    ///
    /// A deadline on a regular file or directory is refused with
    /// `NotSupported` since synchronous file i/o cannot be abandoned.
    /// Otherwise the read waits for data until the deadline and never
    /// blocks past it.
    pub fn read<'a>(
        &self,
        req: IoRequest<&'a mut [u8]>,
        d: Option<Deadline>,
    ) -> Result<IoResult<&'a mut [u8]>> {
        let timer = DeadlineTimer::start(d);
        let IoRequest {
            mut buffers,
            offset,
        } = req;
        let mut left = if timer.is_infinite() {
            Sys::read(self.native_handle(), &mut buffers, offset)?
        } else {
            self.check_deadline_io(&timer)?;
            self.read_within(&timer, &mut buffers, offset)?
        };
        let filled = buffers
            .into_iter()
            .map(|b| {
                let take = left.min(b.len());
                left -= take;
                shrink_mut(b, take)
            })
            .collect();
        Ok(IoResult::new(filled))
    }

    /// Writes `req`'s buffers. With a deadline the write stops when it
    /// expires: whatever was written by then is returned, and if nothing
    /// was written the result is `TimedOut`.
    pub fn write<'a>(
        &self,
        req: IoRequest<&'a [u8]>,
        d: Option<Deadline>,
    ) -> Result<IoResult<&'a [u8]>> {
        let timer = DeadlineTimer::start(d);
        let mut left = if timer.is_infinite() {
            Sys::write(self.native_handle(), &req.buffers, req.offset)?
        } else {
            self.check_deadline_io(&timer)?;
            self.write_within(&timer, &req.buffers, req.offset)?
        };
        let written = req
            .buffers
            .into_iter()
            .map(|b| {
                let take = left.min(b.len());
                left -= take;
                shrink(b, take)
            })
            .collect();
        Ok(IoResult::new(written))
    }

    pub fn read_at<'a>(
        &self,
        offset: u64,
        buffer: &'a mut [u8],
        d: Option<Deadline>,
    ) -> Result<&'a mut [u8]> {
        let mut done = self.read(IoRequest::new(vec![buffer], offset), d)?;
        Ok(done.buffers.remove(0))
    }

    pub fn write_at<'a>(&self, offset: u64, buffer: &'a [u8], d: Option<Deadline>) -> Result<&'a [u8]> {
        let mut done = self.write(IoRequest::new(vec![buffer], offset), d)?;
        Ok(done.buffers.remove(0))
    }

    fn check_deadline_io(&self, timer: &DeadlineTimer) -> Result<()> {
        if timer.expired() {
            return Err(Error::TimedOut);
        }
        if self.is_regular() || self.is_directory() {
            return Err(Error::NotSupported("deadline i/o on a synchronous file"));
        }
        Ok(())
    }

    /// Polls until ready or out of time.
    fn await_ready(&self, interest: Interest, timer: &DeadlineTimer) -> Result<()> {
        loop {
            let left = timer.remaining().unwrap_or(Duration::ZERO);
            if left.is_zero() {
                return Err(Error::TimedOut);
            }
            if Sys::wait(self.native_handle(), interest, left)? {
                return Ok(());
            }
        }
    }

    fn read_within(&self, timer: &DeadlineTimer, buffers: &mut [&mut [u8]], offset: u64) -> Result<usize> {
        loop {
            self.await_ready(Interest::Read, timer)?;
            if let Some(n) = Sys::read_nowait(self.native_handle(), buffers, offset)? {
                return Ok(n);
            }
        }
    }

    fn write_within(&self, timer: &DeadlineTimer, buffers: &[&[u8]], offset: u64) -> Result<usize> {
        let total: usize = buffers.iter().map(|b| b.len()).sum();
        let mut done = 0;
        while done < total {
            match self.await_ready(Interest::Write, timer) {
                Ok(()) => {}
                Err(Error::TimedOut) if done > 0 => break,
                Err(e) => return Err(e),
            }
            let rest = unwritten(buffers, done);
            match Sys::write_nowait(self.native_handle(), &rest, offset + done as u64)? {
                Some(0) => break,
                Some(n) => done += n,
                None => {}
            }
        }
        Ok(done)
    }

    /// Locks `length` bytes at `offset`; zero length locks the whole file.
    ///
    /// A zero deadline makes exactly one non-blocking attempt, no deadline
    /// blocks in the kernel, anything else polls until it expires. Failing
    /// to acquire in time is `TimedOut`. Native lock semantics pass through
    /// unchanged: if they are the kind dropped by closing any descriptor to
    /// the file, `HandleFlags::BYTE_LOCK_INSANITY` becomes set.
    pub fn lock(
        &self,
        offset: u64,
        length: u64,
        exclusive: bool,
        d: Option<Deadline>,
    ) -> Result<ExtentGuard<'_>> {
        self.lock_by(offset, length, exclusive, d, Sys::lock)
    }

    fn lock_by(
        &self,
        offset: u64,
        length: u64,
        exclusive: bool,
        d: Option<Deadline>,
        attempt: impl Fn(NativeHandle, u64, u64, bool, bool) -> Result<LockAttempt>,
    ) -> Result<ExtentGuard<'_>> {
        let timer = DeadlineTimer::start(d);
        let native = self.native_handle();
        let mut nap = LOCK_POLL_MIN;
        loop {
            match attempt(native, offset, length, exclusive, timer.is_infinite())? {
                LockAttempt::Acquired { insane } => {
                    if insane {
                        self.handle.note_lock_insanity();
                    }
                    tracing::trace!(fd = native.fd(), offset, length, exclusive, "extent locked");
                    return Ok(ExtentGuard {
                        handle: Some(self),
                        offset,
                        length,
                        exclusive,
                    });
                }
                LockAttempt::Contended => {
                    let left = timer.remaining().unwrap_or(LOCK_POLL_MAX);
                    if left.is_zero() {
                        return Err(Error::TimedOut);
                    }
                    std::thread::sleep(nap.min(left));
                    nap = (nap * 2).min(LOCK_POLL_MAX);
                }
            }
        }
    }

    pub fn try_lock(&self, offset: u64, length: u64, exclusive: bool) -> Result<ExtentGuard<'_>> {
        self.lock(offset, length, exclusive, Some(Deadline::zero()))
    }

    /// Locks the extent a request covers, shared for reads and exclusive
    /// for writes.
    pub fn lock_request<R: RequestExtent>(&self, req: &R, d: Option<Deadline>) -> Result<ExtentGuard<'_>> {
        let (offset, length) = req.extent();
        self.lock(offset, length, req.exclusive(), d)
    }

    /// Releases a range locked through this handle. Unlocking a range that
    /// is not held has no defined result; use `ExtentGuard` for idempotence.
    pub fn unlock(&self, offset: u64, length: u64) -> Result<()> {
        tracing::trace!(fd = self.native_handle().fd(), offset, length, "extent unlocked");
        Sys::unlock(self.native_handle(), offset, length)
    }
}

impl From<Handle> for IoHandle {
    fn from(handle: Handle) -> Self {
        IoHandle::new(handle)
    }
}

impl Deref for IoHandle {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl DerefMut for IoHandle {
    fn deref_mut(&mut self) -> &mut Handle {
        &mut self.handle
    }
}

impl fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IoHandle").field(&self.handle).finish()
    }
}

/// One held byte range lock. Dropping it, or calling `unlock`, releases the
/// range exactly once.
#[derive(Default)]
pub struct ExtentGuard<'h> {
    handle: Option<&'h IoHandle>,
    offset: u64,
    length: u64,
    exclusive: bool,
}

impl<'h> ExtentGuard<'h> {
    pub fn is_locked(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<&'h IoHandle> {
        self.handle
    }

    /// `(offset, length, exclusive)`
    pub fn extent(&self) -> (u64, u64, bool) {
        (self.offset, self.length, self.exclusive)
    }

    /// Unlocks now. Later calls, and the drop, do nothing.
    pub fn unlock(&mut self) -> Result<()> {
        match self.handle {
            Some(h) => {
                let unlocked = h.unlock(self.offset, self.length);
                self.release();
                unlocked
            }
            None => Ok(()),
        }
    }

    /// Forgets the lock without unlocking it.
    pub fn release(&mut self) {
        self.handle = None;
        self.offset = 0;
        self.length = 0;
        self.exclusive = false;
    }
}

impl Drop for ExtentGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            tracing::debug!(%e, "unlock on drop failed");
        }
    }
}

impl fmt::Debug for ExtentGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtentGuard")
            .field("locked", &self.is_locked())
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_handle::FileHandle;
    use crate::handle::{Caching, Creation, HandleFlags, Mode};
    use std::os::fd::IntoRawFd;
    use std::path::Path;
    use std::time::{Instant, SystemTime};

    fn open(path: &Path) -> FileHandle {
        FileHandle::open(path, Mode::Write, Creation::IfNeeded, Caching::All, HandleFlags::empty())
            .unwrap()
    }

    fn pipe() -> (IoHandle, IoHandle) {
        let (r, w) = nix::unistd::pipe().unwrap();
        let r = Handle::from_raw_fd(r.into_raw_fd(), Caching::All, HandleFlags::empty()).unwrap();
        let w = Handle::from_raw_fd(w.into_raw_fd(), Caching::All, HandleFlags::empty()).unwrap();
        (r.into(), w.into())
    }

    #[test]
    fn test_scatter_gather_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let h = open(&dir.path().join("data"));

        let head = b"hello ".as_slice();
        let tail = b"world".as_slice();
        let written = h.write(IoRequest::new(vec![head, tail], 10), None).unwrap();
        assert_eq!(written.bytes_transferred(), 11);

        let mut a = [0u8; 4];
        let mut b = [0u8; 32];
        let read = h
            .read(IoRequest::new(vec![&mut a[..], &mut b[..]], 10), None)
            .unwrap();
        let sizes: Vec<usize> = read.buffers().iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![4, 7]);
        assert_eq!(read.bytes_transferred(), 11);
        let bufs = read.into_buffers();
        assert_eq!(&*bufs[0], b"hell");
        assert_eq!(&*bufs[1], b"o world");
    }

    #[test]
    fn test_short_read_at_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let h = open(&dir.path().join("data"));
        h.write_at(0, b"abc", None).unwrap();
        let mut buf = [0u8; 16];
        let got = h.read_at(1, &mut buf, None).unwrap();
        assert_eq!(got, b"bc");
    }

    #[test]
    fn test_deadline_read_on_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let h = open(&dir.path().join("data"));
        let mut buf = [0u8; 8];

        let past = Deadline::at(SystemTime::now() - Duration::from_secs(1));
        assert!(matches!(h.read_at(0, &mut buf, Some(past)), Err(Error::TimedOut)));

        let future = Deadline::after(Duration::from_secs(5));
        assert!(matches!(
            h.read_at(0, &mut buf, Some(future)),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            h.write_at(0, b"x", Some(future)),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_deadline_read_on_pipe() {
        let (r, w) = pipe();
        let mut buf = [0u8; 8];

        let began = Instant::now();
        let waited = r.read_at(0, &mut buf, Some(Deadline::after(Duration::from_millis(30))));
        assert!(matches!(waited, Err(Error::TimedOut)));
        assert!(began.elapsed() >= Duration::from_millis(25));

        w.write_at(0, b"ping", Some(Deadline::after(Duration::from_secs(1))))
            .unwrap();
        let got = r
            .read_at(0, &mut buf, Some(Deadline::after(Duration::from_secs(1))))
            .unwrap();
        assert_eq!(got, b"ping");
    }

    #[test]
    fn test_deadline_write_into_unread_pipe() {
        let (r, w) = pipe();
        let payload = vec![7u8; 1 << 20];

        let began = Instant::now();
        let sent = w
            .write_at(0, &payload, Some(Deadline::after(Duration::from_millis(100))))
            .unwrap()
            .len();
        assert!(began.elapsed() < Duration::from_secs(2));
        assert!(sent > 0 && sent < payload.len(), "sent {sent}");

        // pipe is full now
        let began = Instant::now();
        let again = w.write_at(0, &payload, Some(Deadline::after(Duration::from_millis(50))));
        assert!(matches!(again, Err(Error::TimedOut)));
        assert!(began.elapsed() < Duration::from_secs(2));

        let mut buf = [0u8; 32];
        let got = r
            .read_at(0, &mut buf, Some(Deadline::after(Duration::from_secs(1))))
            .unwrap();
        assert_eq!(got, &[7u8; 32][..]);
    }

    #[test]
    fn test_unwritten_skips_sent_bytes() {
        let bufs: Vec<&[u8]> = vec![&b"abc"[..], &b"de"[..], &b"fgh"[..]];
        assert_eq!(unwritten(&bufs, 0), bufs);
        assert_eq!(unwritten(&bufs, 4), vec![&b"e"[..], &b"fgh"[..]]);
        assert_eq!(unwritten(&bufs, 5), vec![&b"fgh"[..]]);
        assert!(unwritten(&bufs, 8).is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_classic_lock_marks_handle() {
        use crate::sys::{lock_with, unlock_with};
        use std::sync::atomic::AtomicBool;

        let dir = tempfile::tempdir().unwrap();
        let h = open(&dir.path().join("lock"));
        assert!(!h.flags().contains(HandleFlags::BYTE_LOCK_INSANITY));

        let classic = AtomicBool::new(true);
        let mut guard = h
            .lock_by(0, 1, true, None, |n, o, l, e, b| lock_with(&classic, n, o, l, e, b))
            .unwrap();
        assert!(guard.is_locked());
        assert!(h.flags().contains(HandleFlags::BYTE_LOCK_INSANITY));

        guard.release();
        unlock_with(&classic, h.native_handle(), 0, 1).unwrap();
    }

    #[test]
    fn test_expired_deadline_transfers_nothing() {
        let (r, w) = pipe();
        w.write_at(0, b"data", None).unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(
            r.read_at(0, &mut buf, Some(Deadline::zero())),
            Err(Error::TimedOut)
        ));
        // the data is still there for the next reader
        assert_eq!(r.read_at(0, &mut buf, None).unwrap(), b"data");
    }

    #[test]
    fn test_try_lock_conflicts_across_descriptions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let a = open(&path);
        let b = open(&path);

        let guard = a.try_lock(100, 10, true).unwrap();
        assert!(guard.is_locked());
        assert_eq!(guard.extent(), (100, 10, true));

        let began = Instant::now();
        assert!(matches!(b.try_lock(105, 1, false), Err(Error::TimedOut)));
        assert!(began.elapsed() < Duration::from_millis(500));

        // disjoint ranges do not conflict
        b.try_lock(0, 10, true).unwrap();

        drop(guard);
        b.try_lock(105, 1, true).unwrap();
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let a = open(&path);
        let b = open(&path);
        let _ga = a.try_lock(0, 1, false).unwrap();
        let _gb = b.try_lock(0, 1, false).unwrap();
        let c = open(&path);
        assert!(matches!(c.try_lock(0, 1, true), Err(Error::TimedOut)));
    }

    #[test]
    fn test_lock_waits_until_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let a = open(&path);
        let b = open(&path);
        let _held = a.lock(0, 0, true, None).unwrap();

        let began = Instant::now();
        let res = b.lock(0, 0, true, Some(Deadline::after(Duration::from_millis(40))));
        assert!(matches!(res, Err(Error::TimedOut)));
        assert!(began.elapsed() >= Duration::from_millis(35));
    }

    #[test]
    fn test_guard_unlocks_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let a = open(&path);
        let other = open(&path);

        let mut first = a.try_lock(7, 1, true).unwrap();
        first.unlock().unwrap();
        assert!(!first.is_locked());
        first.unlock().unwrap();

        // same description relocks; dropping the spent guard must not free it
        let _second = a.try_lock(7, 1, true).unwrap();
        drop(first);
        assert!(matches!(other.try_lock(7, 1, true), Err(Error::TimedOut)));
    }

    #[test]
    fn test_released_guard_keeps_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let a = open(&path);
        let other = open(&path);

        let mut guard = a.try_lock(3, 1, true).unwrap();
        guard.release();
        drop(guard);
        assert!(matches!(other.try_lock(3, 1, true), Err(Error::TimedOut)));
        a.unlock(3, 1).unwrap();
        other.try_lock(3, 1, true).unwrap();
    }

    #[test]
    fn test_lock_request_uses_request_extent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let a = open(&path);
        let other = open(&path);

        let payload = [1u8; 8];
        let req = IoRequest::new(vec![&payload[..4], &payload[4..]], 64);
        let guard = a.lock_request(&req, None).unwrap();
        assert_eq!(guard.extent(), (64, 8, true));
        assert!(matches!(other.try_lock(71, 1, false), Err(Error::TimedOut)));
        other.try_lock(72, 1, true).unwrap();

        let mut space = [0u8; 2];
        let read_req = IoRequest::new(vec![&mut space[..]], 200);
        let shared = a.lock_request(&read_req, None).unwrap();
        assert_eq!(shared.extent(), (200, 2, false));
    }

    #[test]
    fn test_default_guard_holds_nothing() {
        let mut guard = ExtentGuard::default();
        assert!(!guard.is_locked());
        guard.unlock().unwrap();
        assert!(guard.handle().is_none());
    }
}
