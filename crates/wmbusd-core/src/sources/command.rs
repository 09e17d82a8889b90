//! Sub-process byte source: spawn a program, read its stdout.
//!
//! Used for dongle helper tools (rtl_sdr | rtl_wmbus pipelines etc.). The
//! child's stdout fd is polled like any TTY; child exit shows up as EOF and
//! the source stops working.

use std::os::unix::io::{AsRawFd, RawFd};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use log::{debug, info, warn};

use crate::source::{AccessCheck, ByteSource, SourceCore, SourceKind};

pub struct CommandSource {
    core: SourceCore,
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    child: Mutex<Option<Child>>,
}

impl CommandSource {
    pub fn new(program: &str, args: &[String], envs: &[(String, String)]) -> Self {
        let identity = format!("cmd:{program}");
        Self {
            core: SourceCore::new(&identity, SourceKind::Subprocess),
            program: program.to_string(),
            args: args.to_vec(),
            envs: envs.to_vec(),
            child: Mutex::new(None),
        }
    }

    fn set_nonblocking(fd: RawFd) -> bool {
        // SAFETY: fcntl on a valid fd; flags round-trip untouched otherwise.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            flags >= 0 && libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) >= 0
        }
    }
}

impl ByteSource for CommandSource {
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
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!("({}) spawn failed: {e}", self.core.identity());
                return AccessCheck::NotThere;
            }
        };
        let Some(stdout) = child.stdout.as_ref() else {
            return AccessCheck::NotThere;
        };
        let fd = stdout.as_raw_fd();
        if !Self::set_nonblocking(fd) {
            return AccessCheck::NotThere;
        }
        // The fd stays owned by the Child; we only borrow it for polling.
        self.core.adopt_fd(fd, false);
        info!("({}) subprocess started (pid {})", self.core.identity(), child.id());
        *self.child.lock().unwrap() = Some(child);
        AccessCheck::AccessOk
    }

    fn close(&self) {
        if let Some(mut child) = self.child.lock().unwrap().take() {
            debug!("({}) terminating subprocess", self.core.identity());
            let _ = child.kill();
            let _ = child.wait();
        }
        self.core.close_fds();
    }

    fn receive(&self) -> Vec<u8> {
        let out = self.core.receive_from_fd();
        if !self.core.working() {
            // EOF: reap the child so it does not linger as a zombie.
            if let Some(mut child) = self.child.lock().unwrap().take() {
                let _ = child.wait();
            }
        }
        out
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
