//! Serial TTY byte source.
//!
//! Opens the device non-blocking, takes an exclusive advisory lock (two
//! daemons on one dongle is always a configuration mistake), and configures
//! raw non-canonical mode with VMIN=0/VTIME=0 so reads never block.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::time::Duration;

use log::{debug, info, warn};

use crate::source::{AccessCheck, ByteSource, SourceCore, SourceKind};

/// Supported line speeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Baud {
    B300,
    B600,
    B1200,
    B2400,
    B4800,
    B9600,
    B19200,
    B38400,
    B57600,
    B115200,
}

impl Baud {
    pub fn from_u32(n: u32) -> Option<Self> {
        match n {
            300 => Some(Self::B300),
            600 => Some(Self::B600),
            1200 => Some(Self::B1200),
            2400 => Some(Self::B2400),
            4800 => Some(Self::B4800),
            9600 => Some(Self::B9600),
            19200 => Some(Self::B19200),
            38400 => Some(Self::B38400),
            57600 => Some(Self::B57600),
            115200 => Some(Self::B115200),
            _ => None,
        }
    }

    fn speed(self) -> libc::speed_t {
        match self {
            Self::B300 => libc::B300,
            Self::B600 => libc::B600,
            Self::B1200 => libc::B1200,
            Self::B2400 => libc::B2400,
            Self::B4800 => libc::B4800,
            Self::B9600 => libc::B9600,
            Self::B19200 => libc::B19200,
            Self::B38400 => libc::B38400,
            Self::B57600 => libc::B57600,
            Self::B115200 => libc::B115200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

pub struct TtySource {
    core: SourceCore,
    baud: Baud,
    parity: Parity,
}

impl TtySource {
    pub fn new(path: &str, baud: Baud, parity: Parity) -> Self {
        Self {
            core: SourceCore::new(path, SourceKind::Tty),
            baud,
            parity,
        }
    }

    fn try_open(&self) -> AccessCheck {
        let Ok(path) = CString::new(self.core.identity()) else {
            return AccessCheck::NotThere;
        };
        // SAFETY: path is a valid nul-terminated string for the call.
        let fd = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK,
            )
        };
        if fd < 0 {
            return AccessCheck::NotThere;
        }
        // SAFETY: fd is a valid descriptor we just opened.
        if unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            warn!("({}) device is locked by another process", self.core.identity());
            // SAFETY: fd is still ours to close.
            unsafe { libc::close(fd) };
            return AccessCheck::NotSameGroup;
        }
        if !self.configure(fd) {
            // SAFETY: lock and fd are released on the failure path.
            unsafe {
                libc::flock(fd, libc::LOCK_UN);
                libc::close(fd);
            }
            return AccessCheck::NotThere;
        }
        self.core.adopt_fd(fd, true);
        info!(
            "({}) tty opened at {:?} baud, parity {:?}",
            self.core.identity(),
            self.baud,
            self.parity
        );
        AccessCheck::AccessOk
    }

    /// Raw 8-bit mode, configured speed and parity, no flow control,
    /// VMIN=0/VTIME=0.
    fn configure(&self, fd: RawFd) -> bool {
        let mut tios = std::mem::MaybeUninit::<libc::termios>::zeroed();
        // SAFETY: tios is a valid out-pointer; assume_init only after success.
        if unsafe { libc::tcgetattr(fd, tios.as_mut_ptr()) } != 0 {
            return false;
        }
        // SAFETY: tcgetattr filled the struct.
        let mut tios = unsafe { tios.assume_init() };
        // SAFETY: cfmakeraw only mutates the struct we own.
        unsafe { libc::cfmakeraw(&mut tios) };
        tios.c_cflag |= libc::CLOCAL | libc::CREAD;
        tios.c_cflag &= !libc::CRTSCTS;
        match self.parity {
            Parity::None => tios.c_cflag &= !libc::PARENB,
            Parity::Even => {
                tios.c_cflag |= libc::PARENB;
                tios.c_cflag &= !libc::PARODD;
            }
            Parity::Odd => tios.c_cflag |= libc::PARENB | libc::PARODD,
        }
        tios.c_cc[libc::VMIN] = 0;
        tios.c_cc[libc::VTIME] = 0;
        let speed = self.baud.speed();
        // SAFETY: tios is valid; fd is open.
        unsafe {
            if libc::cfsetispeed(&mut tios, speed) != 0
                || libc::cfsetospeed(&mut tios, speed) != 0
                || libc::tcsetattr(fd, libc::TCSANOW, &tios) != 0
            {
                return false;
            }
            libc::tcflush(fd, libc::TCIOFLUSH);
        }
        true
    }
}

impl ByteSource for TtySource {
    fn identity(&self) -> &str {
        self.core.identity()
    }

    fn kind(&self) -> SourceKind {
        self.core.kind()
    }

    fn fd(&self) -> RawFd {
        self.core.fd()
    }

    fn open(&self, strict: bool) -> AccessCheck {
        if self.core.opened() && !self.core.is_closed() {
            return AccessCheck::AccessOk;
        }
        let check = self.try_open();
        if check != AccessCheck::AccessOk && strict {
            // USB dongles enumerate slowly after plug-in.
            debug!("({}) open failed, retrying once", self.core.identity());
            std::thread::sleep(Duration::from_secs(1));
            return self.try_open();
        }
        check
    }

    fn close(&self) {
        self.core.close_fds();
    }

    fn receive(&self) -> Vec<u8> {
        self.core.receive_from_fd()
    }

    fn send(&self, data: &[u8]) -> bool {
        self.core.send_to_fd(data)
    }

    fn opened(&self) -> bool {
        self.core.opened()
    }

    fn working(&self) -> bool {
        self.core.working()
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    fn readonly(&self) -> bool {
        false
    }

    fn skipping_callbacks(&self) -> bool {
        self.core.muted()
    }

    fn mute_callbacks(&self, mute: bool) {
        self.core.set_muted(mute);
    }

    fn check_if_data_is_pending(&self) -> bool {
        self.core.pending_bytes() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_table_covers_enumerated_speeds() {
        for n in [300u32, 600, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200] {
            assert!(Baud::from_u32(n).is_some(), "{n} must be supported");
        }
        assert!(Baud::from_u32(1234).is_none());
    }

    #[test]
    fn missing_device_is_not_there() {
        let tty = TtySource::new("/dev/does-not-exist-0", Baud::B9600, Parity::None);
        assert_eq!(tty.open(false), AccessCheck::NotThere);
        assert!(!tty.opened());
    }
}
