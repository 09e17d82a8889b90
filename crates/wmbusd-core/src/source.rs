//! Byte source abstraction.
//!
//! A byte source is anything that produces telegram bytes: a radio dongle or
//! raw M-Bus TTY, a sub-process stdout, a file or stdin, or a simulator
//! replaying a script. The manager polls sources by fd where one exists and
//! pumps fd-less sources once per loop iteration.
//!
//! State flags are atomics; `receive` and `send` are serialized by per-source
//! read/write locks so callbacks may call them from any thread.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

/// What kind of byte source this is; used in every log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Tty,
    Subprocess,
    File,
    Stdin,
    Simulator,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tty => write!(f, "tty"),
            Self::Subprocess => write!(f, "subprocess"),
            Self::File => write!(f, "file"),
            Self::Stdin => write!(f, "stdin"),
            Self::Simulator => write!(f, "simulator"),
        }
    }
}

/// Result of trying to open a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCheck {
    AccessOk,
    /// The device path does not exist or cannot be configured.
    NotThere,
    /// The device exists but is locked by another process.
    NotSameGroup,
}

/// Wakes the readiness loop; handed to fd-less sources so injected data is
/// noticed without waiting out the poll timeout.
pub type Notifier = Arc<dyn Fn() + Send + Sync>;

/// Uniform interface over all byte producers.
pub trait ByteSource: Send + Sync {
    /// Path or alias identifying this source.
    fn identity(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Pollable file descriptor, `-1` when the source has none.
    fn fd(&self) -> RawFd;

    /// Open the source; idempotent. `strict` enables the single 1 s retry
    /// used when devices are expected to exist.
    fn open(&self, strict: bool) -> AccessCheck;

    /// Release fd and lock; at-most-once.
    fn close(&self);

    /// Drain all currently available bytes without blocking.
    fn receive(&self) -> Vec<u8>;

    /// Write all bytes; read-only sources silently report success.
    fn send(&self, _data: &[u8]) -> bool {
        true
    }

    fn opened(&self) -> bool;
    fn working(&self) -> bool;
    fn is_closed(&self) -> bool;

    /// Working but without a valid fd during a reconnect.
    fn resetting(&self) -> bool {
        false
    }

    fn readonly(&self) -> bool {
        true
    }

    fn skipping_callbacks(&self) -> bool;

    /// Temporarily mute `on_data` delivery for this source.
    fn mute_callbacks(&self, mute: bool);

    /// Cheap peek: is data waiting to be received?
    fn check_if_data_is_pending(&self) -> bool;

    /// Manager hook for fd-less sources: move due bytes into the read
    /// buffer. Returns true when new data became available.
    fn pump(&self) -> bool {
        false
    }

    /// Keep the manager's notifier; fd-less sources invoke it when data is
    /// injected from outside the readiness loop.
    fn set_notifier(&self, _notifier: Notifier) {}

    /// Should the readiness loop watch this source right now?
    fn readable(&self) -> bool {
        self.opened() && self.working() && !self.resetting() && !self.skipping_callbacks()
    }
}

/// Shared runtime state embedded in every concrete source.
pub(crate) struct SourceCore {
    identity: String,
    kind: SourceKind,
    fd: AtomicI32,
    /// False for fds borrowed from elsewhere (stdin, child pipes).
    owns_fd: AtomicBool,
    opened: AtomicBool,
    working: AtomicBool,
    closed: AtomicBool,
    muted: AtomicBool,
    read_lock: Mutex<()>,
    write_lock: Mutex<()>,
}

impl SourceCore {
    pub(crate) fn new(identity: &str, kind: SourceKind) -> Self {
        Self {
            identity: identity.to_string(),
            kind,
            fd: AtomicI32::new(-1),
            owns_fd: AtomicBool::new(true),
            opened: AtomicBool::new(false),
            working: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            read_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
        }
    }

    pub(crate) fn identity(&self) -> &str {
        &self.identity
    }

    pub(crate) fn kind(&self) -> SourceKind {
        self.kind
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.load(Ordering::SeqCst)
    }

    pub(crate) fn opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_muted(&self, mute: bool) {
        self.muted.store(mute, Ordering::SeqCst);
    }

    pub(crate) fn stop_working(&self) {
        self.working.store(false, Ordering::SeqCst);
    }

    /// Take ownership of a freshly opened fd.
    pub(crate) fn adopt_fd(&self, fd: RawFd, owns: bool) {
        self.fd.store(fd, Ordering::SeqCst);
        self.owns_fd.store(owns, Ordering::SeqCst);
        self.opened.store(true, Ordering::SeqCst);
        self.working.store(true, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Mark opened without any fd (simulator).
    pub(crate) fn mark_opened(&self) {
        self.opened.store(true, Ordering::SeqCst);
        self.working.store(true, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Release fd and lock; safe to call repeatedly, acts once.
    pub(crate) fn close_fds(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.working.store(false, Ordering::SeqCst);
        let fd = self.fd.swap(-1, Ordering::SeqCst);
        if fd >= 0 && self.owns_fd.load(Ordering::SeqCst) {
            // SAFETY: fd was opened by this source and nobody else closes it.
            unsafe {
                libc::flock(fd, libc::LOCK_UN);
                libc::close(fd);
            }
        }
        debug!("({}) {} closed", self.identity, self.kind);
    }

    /// Drain the fd. EINTR retries, EAGAIN ends the batch, EOF and EBADF
    /// mark the source not working.
    pub(crate) fn receive_from_fd(&self) -> Vec<u8> {
        let _guard = self.read_lock.lock().unwrap();
        let fd = self.fd();
        if fd < 0 {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            // SAFETY: buf is a valid writable buffer of the stated length.
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                out.extend_from_slice(&buf[..n as usize]);
                continue;
            }
            if n == 0 {
                debug!("({}) end of stream", self.identity);
                self.stop_working();
                break;
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => break,
                Some(libc::EBADF) => {
                    warn!("({}) fd became invalid while reading", self.identity);
                    self.stop_working();
                    break;
                }
                e => {
                    warn!("({}) read error {e:?}", self.identity);
                    self.stop_working();
                    break;
                }
            }
        }
        out
    }

    /// Write all bytes, retrying EINTR and briefly backing off on EAGAIN.
    pub(crate) fn send_to_fd(&self, data: &[u8]) -> bool {
        let _guard = self.write_lock.lock().unwrap();
        let fd = self.fd();
        if fd < 0 {
            return false;
        }
        let mut written = 0usize;
        while written < data.len() {
            // SAFETY: the slice is valid for its whole length.
            let n = unsafe {
                libc::write(
                    fd,
                    data[written..].as_ptr().cast(),
                    data.len() - written,
                )
            };
            if n >= 0 {
                written += n as usize;
                continue;
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    continue;
                }
                e => {
                    warn!("({}) write error {e:?}", self.identity);
                    return false;
                }
            }
        }
        true
    }

    /// Queued byte count via FIONREAD.
    pub(crate) fn pending_bytes(&self) -> usize {
        let fd = self.fd();
        if fd < 0 {
            return 0;
        }
        let mut available: libc::c_int = 0;
        // SAFETY: available is a valid out-pointer for the ioctl.
        let r = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut available) };
        if r < 0 {
            return 0;
        }
        available.max(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_flag_lifecycle() {
        let core = SourceCore::new("/dev/null0", SourceKind::Tty);
        assert!(!core.opened());
        assert!(!core.working());
        assert!(!core.is_closed());

        core.mark_opened();
        assert!(core.opened());
        assert!(core.working());

        core.stop_working();
        assert!(core.opened());
        assert!(!core.working());

        core.close_fds();
        assert!(core.is_closed());
        // At-most-once: a second close is a no-op.
        core.close_fds();
        assert!(core.is_closed());
        assert_eq!(core.fd(), -1);
    }

    #[test]
    fn receive_without_fd_is_empty() {
        let core = SourceCore::new("x", SourceKind::File);
        assert!(core.receive_from_fd().is_empty());
        assert_eq!(core.pending_bytes(), 0);
        assert!(!core.send_to_fd(b"ab"));
    }
}
