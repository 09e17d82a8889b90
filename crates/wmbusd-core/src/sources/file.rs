//! File and stdin byte sources.
//!
//! A file delivers its whole content and ends; stdin streams until EOF.
//! Either way the EOF marks the source not-working, the manager sweeps it
//! away, and with `expect_devices_to_work` latched the daemon stops.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use log::info;

use crate::source::{AccessCheck, ByteSource, SourceCore, SourceKind};

/// Pseudo-path selecting the stdin variant.
pub const STDIN_PATH: &str = "stdin";

pub struct FileSource {
    core: SourceCore,
}

impl FileSource {
    pub fn new(path: &str) -> Self {
        let kind = if path == STDIN_PATH {
            SourceKind::Stdin
        } else {
            SourceKind::File
        };
        Self {
            core: SourceCore::new(path, kind),
        }
    }
}

impl ByteSource for FileSource {
    fn identity(&self) -> &str {
        self.core.identity()
    }

    fn kind(&self) -> SourceKind {
        self.core.kind()
    }

    fn fd(&self) -> RawFd {
        self.core.fd()
    }

    fn open(&self, _strict: bool) -> AccessCheck {
        if self.core.opened() && !self.core.is_closed() {
            return AccessCheck::AccessOk;
        }
        if self.core.kind() == SourceKind::Stdin {
            // Borrow fd 0; never close it on behalf of the process.
            self.core.adopt_fd(libc::STDIN_FILENO, false);
            return AccessCheck::AccessOk;
        }
        let Ok(path) = CString::new(self.core.identity()) else {
            return AccessCheck::NotThere;
        };
        // SAFETY: path is a valid nul-terminated string.
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
        if fd < 0 {
            return AccessCheck::NotThere;
        }
        self.core.adopt_fd(fd, true);
        info!("({}) file opened", self.core.identity());
        AccessCheck::AccessOk
    }

    fn close(&self) {
        self.core.close_fds();
    }

    fn receive(&self) -> Vec<u8> {
        self.core.receive_from_fd()
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
