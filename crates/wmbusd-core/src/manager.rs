//! Event loop and timer wheel.
//!
//! Two long-lived threads cooperate:
//!
//! - The **readiness thread** polls every readable source fd (plus the
//!   tickle pipe) with a 1 s ceiling, delivers `on_data` callbacks outside
//!   the source-list lock, then sweeps: dead sources are closed, closed
//!   sources are removed and their `on_disappear` hook fires exactly once.
//! - The **timer thread** wakes at most every second, runs the timers whose
//!   period has elapsed, and enforces `exit_after`.
//!
//! The tickle pipe replaces raw signal delivery: writing one byte (from any
//! thread, including a signal handler via [`SerialManager::tickle_fd`])
//! unblocks the poll immediately. Shutdown is cooperative: `stop()` clears
//! the running flag, tickles, and both loops drain within a tick.
//!
//! Lock order inside an iteration is event-loop lock, then source-list,
//! then timers; callbacks run with none of the manager locks held.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::Result;
use crate::source::ByteSource;

pub type OnData = Box<dyn FnMut() + Send>;
pub type OnDisappear = Box<dyn FnOnce() + Send>;

const TICK: Duration = Duration::from_secs(1);
const POLL_TIMEOUT_MS: libc::c_int = 1000;

struct SourceEntry {
    source: Arc<dyn ByteSource>,
    on_data: Mutex<Option<OnData>>,
    on_disappear: Mutex<Option<OnDisappear>>,
}

impl SourceEntry {
    /// Run the on-data callback; the slot mutex serializes callbacks
    /// per source without holding any manager lock.
    fn fire_on_data(&self) {
        let mut slot = self.on_data.lock().unwrap();
        if let Some(cb) = slot.as_mut() {
            cb();
        }
    }
}

struct TimerEntry {
    period: Duration,
    last_call: Instant,
    cb: Arc<Mutex<OnData>>,
}

struct Inner {
    /// Guards the source list itself; never held while callbacks run.
    sources: Mutex<Vec<Arc<SourceEntry>>>,
    /// Held for the whole readiness iteration.
    event_lock: Mutex<()>,
    timers: Mutex<Vec<TimerEntry>>,
    running: AtomicBool,
    expect_devices_to_work: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    exit_after: Mutex<Option<Duration>>,
    tickle_rx: RawFd,
    tickle_tx: RawFd,
    stopped: Mutex<bool>,
    stop_cv: Condvar,
}

impl Inner {
    fn tickle(&self) {
        let b = [1u8];
        // SAFETY: one-byte write to our own non-blocking pipe; a full pipe
        // already guarantees a wakeup.
        unsafe { libc::write(self.tickle_tx, b.as_ptr().cast(), 1) };
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: valid buffer of the stated length.
            let n = unsafe { libc::read(self.tickle_rx, buf.as_mut_ptr().cast(), buf.len()) };
            if n < buf.len() as isize {
                break;
            }
        }
    }

    fn request_stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("serial manager stopping");
        *self.stopped.lock().unwrap() = true;
        self.stop_cv.notify_all();
        self.tickle();
    }
}

/// Owns the byte sources and the two worker threads.
pub struct SerialManager {
    inner: Arc<Inner>,
    readiness: Mutex<Option<JoinHandle<()>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl SerialManager {
    pub fn new() -> Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: fds is a valid out-array for pipe2.
        let r = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if r != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self {
            inner: Arc::new(Inner {
                sources: Mutex::new(Vec::new()),
                event_lock: Mutex::new(()),
                timers: Mutex::new(Vec::new()),
                running: AtomicBool::new(true),
                expect_devices_to_work: AtomicBool::new(false),
                started_at: Mutex::new(None),
                exit_after: Mutex::new(None),
                tickle_rx: fds[0],
                tickle_tx: fds[1],
                stopped: Mutex::new(false),
                stop_cv: Condvar::new(),
            }),
            readiness: Mutex::new(None),
            timer: Mutex::new(None),
        })
    }

    /// Spawn the readiness and timer threads.
    pub fn start(&self) {
        *self.inner.started_at.lock().unwrap() = Some(Instant::now());
        let inner = Arc::clone(&self.inner);
        *self.readiness.lock().unwrap() = Some(
            std::thread::Builder::new()
                .name("readiness".into())
                .spawn(move || readiness_loop(inner))
                .expect("spawn readiness thread"),
        );
        let inner = Arc::clone(&self.inner);
        *self.timer.lock().unwrap() = Some(
            std::thread::Builder::new()
                .name("timers".into())
                .spawn(move || timer_loop(inner))
                .expect("spawn timer thread"),
        );
    }

    /// Add a source to the poll set. The source keeps a notifier so
    /// out-of-band data injection (simulator `fill`) wakes the loop.
    pub fn add_source(&self, source: Arc<dyn ByteSource>) {
        let entry = Arc::new(SourceEntry {
            source: Arc::clone(&source),
            on_data: Mutex::new(None),
            on_disappear: Mutex::new(None),
        });
        let inner = Arc::clone(&self.inner);
        source.set_notifier(Arc::new(move || inner.tickle()));
        self.inner.sources.lock().unwrap().push(entry);
        self.inner.tickle();
    }

    /// Attach the on-data callback for a previously added source.
    pub fn listen_to(&self, source: &Arc<dyn ByteSource>, cb: OnData) {
        let sources = self.inner.sources.lock().unwrap();
        if let Some(e) = sources.iter().find(|e| Arc::ptr_eq(&e.source, source)) {
            *e.on_data.lock().unwrap() = Some(cb);
        } else {
            warn!("({}) listen_to on unknown source", source.identity());
        }
    }

    /// Attach the one-shot disappearance hook for a source.
    pub fn on_disappear(&self, source: &Arc<dyn ByteSource>, cb: OnDisappear) {
        let sources = self.inner.sources.lock().unwrap();
        if let Some(e) = sources.iter().find(|e| Arc::ptr_eq(&e.source, source)) {
            *e.on_disappear.lock().unwrap() = Some(cb);
        }
    }

    /// Register a periodic callback on the timer thread.
    pub fn add_timer(&self, period: Duration, cb: OnData) {
        self.inner.timers.lock().unwrap().push(TimerEntry {
            period,
            last_call: Instant::now(),
            cb: Arc::new(Mutex::new(cb)),
        });
    }

    pub fn source_count(&self) -> usize {
        self.inner.sources.lock().unwrap().len()
    }

    /// Latch the expectation that devices keep working; once latched, all
    /// sources disappearing stops the manager.
    pub fn set_expect_devices_to_work(&self, yes: bool) {
        self.inner.expect_devices_to_work.store(yes, Ordering::SeqCst);
    }

    /// Bound the total process lifetime.
    pub fn set_exit_after(&self, limit: Duration) {
        *self.inner.exit_after.lock().unwrap() = Some(limit);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Wake the readiness loop.
    pub fn tickle(&self) {
        self.inner.tickle();
    }

    /// Write end of the tickle pipe; safe to write from a signal handler.
    pub fn tickle_fd(&self) -> RawFd {
        self.inner.tickle_tx
    }

    /// Initiate orderly shutdown; idempotent and callable from callbacks.
    pub fn stop(&self) {
        self.inner.request_stop();
    }

    /// Block until shutdown has been initiated.
    pub fn wait_for_stop(&self) {
        let mut stopped = self.inner.stopped.lock().unwrap();
        while !*stopped {
            stopped = self.inner.stop_cv.wait(stopped).unwrap();
        }
    }

    /// Join both worker threads.
    pub fn join(&self) {
        if let Some(h) = self.readiness.lock().unwrap().take() {
            let _ = h.join();
        }
        if let Some(h) = self.timer.lock().unwrap().take() {
            let _ = h.join();
        }
    }
}

impl Drop for SerialManager {
    fn drop(&mut self) {
        self.stop();
        self.join();
        // SAFETY: the worker threads are joined, nothing uses the pipe.
        unsafe {
            libc::close(self.inner.tickle_rx);
            libc::close(self.inner.tickle_tx);
        }
    }
}

fn readiness_loop(inner: Arc<Inner>) {
    while inner.running.load(Ordering::SeqCst) {
        {
            let _event = inner.event_lock.lock().unwrap();
            let snapshot: Vec<Arc<SourceEntry>> = inner.sources.lock().unwrap().clone();

            // Move due simulator bytes into their buffers before polling.
            for e in &snapshot {
                if e.source.fd() < 0 {
                    e.source.pump();
                }
            }

            let mut fds = vec![libc::pollfd {
                fd: inner.tickle_rx,
                events: libc::POLLIN,
                revents: 0,
            }];
            let mut polled: Vec<Arc<SourceEntry>> = Vec::new();
            for e in &snapshot {
                let fd = e.source.fd();
                if fd >= 0 && e.source.readable() {
                    fds.push(libc::pollfd {
                        fd,
                        events: libc::POLLIN,
                        revents: 0,
                    });
                    polled.push(Arc::clone(e));
                }
            }

            // SAFETY: fds is an initialized pollfd array of the given length.
            let r = unsafe {
                libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS)
            };
            if r < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    warn!("poll failed: {err}");
                }
                continue;
            }
            if fds[0].revents & libc::POLLIN != 0 {
                inner.drain_tickle();
            }

            // Deliver callbacks without holding the source-list lock.
            // POLLERR/POLLHUP also deliver: receive() observes the failure
            // and marks the source not working.
            for (i, e) in polled.iter().enumerate() {
                let revents = fds[i + 1].revents;
                if revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP | libc::POLLNVAL)
                    != 0
                {
                    e.fire_on_data();
                }
            }
            for e in &snapshot {
                if e.source.fd() < 0
                    && e.source.readable()
                    && e.source.check_if_data_is_pending()
                {
                    e.fire_on_data();
                }
            }
        }

        sweep(&inner);
        check_emergency_stop(&inner);
    }
    debug!("readiness loop done");
}

/// Close dead sources, remove closed ones, fire their disappearance hooks.
fn sweep(inner: &Inner) {
    let mut disappeared = Vec::new();
    {
        let mut sources = inner.sources.lock().unwrap();
        for e in sources.iter() {
            let s = &e.source;
            if s.opened() && !s.working() && !s.is_closed() {
                s.close();
            }
        }
        sources.retain(|e| {
            if e.source.is_closed() {
                disappeared.push(Arc::clone(e));
                false
            } else {
                true
            }
        });
    }
    for e in disappeared {
        info!("({}) source disappeared", e.source.identity());
        if let Some(cb) = e.on_disappear.lock().unwrap().take() {
            cb();
        }
    }
}

fn check_emergency_stop(inner: &Inner) {
    if !inner.expect_devices_to_work.load(Ordering::SeqCst) {
        return;
    }
    let all_gone = {
        let sources = inner.sources.lock().unwrap();
        sources.iter().all(|e| !e.source.working())
    };
    if all_gone {
        info!("all devices gone and devices are expected to work");
        inner.request_stop();
    }
}

fn timer_loop(inner: Arc<Inner>) {
    while inner.running.load(Ordering::SeqCst) {
        {
            let stopped = inner.stopped.lock().unwrap();
            let (stopped, _) = inner.stop_cv.wait_timeout(stopped, TICK).unwrap();
            if *stopped {
                break;
            }
        }

        let now = Instant::now();
        let due: Vec<Arc<Mutex<OnData>>> = {
            let mut timers = inner.timers.lock().unwrap();
            timers
                .iter_mut()
                .filter(|t| t.last_call + t.period <= now)
                .map(|t| {
                    t.last_call = now;
                    Arc::clone(&t.cb)
                })
                .collect()
        };
        // Timer callbacks are serialized on this thread, no lock held.
        for cb in due {
            (cb.lock().unwrap())();
        }

        let deadline_hit = {
            let started = inner.started_at.lock().unwrap();
            let limit = inner.exit_after.lock().unwrap();
            matches!(
                (*started, *limit),
                (Some(s), Some(l)) if s.elapsed() >= l
            )
        };
        if deadline_hit {
            info!("exit_after elapsed");
            inner.request_stop();
        }
    }
    debug!("timer loop done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{SimEvent, SimulatorSource};
    use std::sync::atomic::AtomicUsize;

    fn wait_until(deadline: Duration, mut pred: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        pred()
    }

    /// A simulator that stays alive: one event in the far future.
    fn long_lived_sim() -> Arc<SimulatorSource> {
        let sim = SimulatorSource::new(
            "sim",
            vec![SimEvent {
                bytes: vec![0xFF],
                after: Some(Duration::from_secs(3600)),
            }],
        );
        sim.open(false);
        Arc::new(sim)
    }

    #[test]
    fn injected_data_reaches_on_data_callback() {
        let manager = SerialManager::new().unwrap();
        let sim = long_lived_sim();
        let source: Arc<dyn ByteSource> = sim.clone();
        manager.add_source(Arc::clone(&source));

        let got = Arc::new(Mutex::new(Vec::new()));
        let g = Arc::clone(&got);
        let s = Arc::clone(&source);
        manager.listen_to(
            &source,
            Box::new(move || {
                g.lock().unwrap().extend(s.receive());
            }),
        );
        manager.start();

        sim.fill(&[0xE5, 0x42]);
        assert!(wait_until(Duration::from_secs(2), || {
            got.lock().unwrap().len() == 2
        }));
        assert_eq!(*got.lock().unwrap(), vec![0xE5, 0x42]);
    }

    #[test]
    fn finished_source_disappears_exactly_once() {
        let manager = SerialManager::new().unwrap();
        let sim = SimulatorSource::new(
            "sim",
            vec![SimEvent { bytes: vec![0xE5], after: None }],
        );
        sim.open(false);
        let source: Arc<dyn ByteSource> = Arc::new(sim);
        manager.add_source(Arc::clone(&source));

        let disappeared = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&disappeared);
        let s = Arc::clone(&source);
        manager.listen_to(&source, Box::new(move || {
            let _ = s.receive();
        }));
        manager.on_disappear(
            &source,
            Box::new(move || {
                d.fetch_add(1, Ordering::SeqCst);
            }),
        );
        manager.start();

        assert!(wait_until(Duration::from_secs(4), || {
            manager.source_count() == 0
        }));
        assert_eq!(disappeared.load(Ordering::SeqCst), 1);
        // A few more sweeps cannot fire the hook again.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(disappeared.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn emergency_stop_when_all_devices_gone() {
        let manager = SerialManager::new().unwrap();
        let sim = SimulatorSource::new(
            "sim",
            vec![SimEvent { bytes: vec![0xE5], after: None }],
        );
        sim.open(false);
        let source: Arc<dyn ByteSource> = Arc::new(sim);
        manager.add_source(Arc::clone(&source));
        let s = Arc::clone(&source);
        manager.listen_to(&source, Box::new(move || {
            let _ = s.receive();
        }));
        manager.set_expect_devices_to_work(true);
        manager.start();

        assert!(wait_until(Duration::from_secs(5), || !manager.is_running()));
    }

    #[test]
    fn stop_terminates_loops_within_two_ticks() {
        let manager = SerialManager::new().unwrap();
        let sim = long_lived_sim();
        manager.add_source(sim);
        manager.start();
        std::thread::sleep(Duration::from_millis(50));

        let t0 = Instant::now();
        manager.stop();
        manager.join();
        assert!(t0.elapsed() <= 2 * TICK, "loops took {:?}", t0.elapsed());
    }

    #[test]
    fn timers_fire_and_update_last_call() {
        let manager = SerialManager::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        manager.add_timer(
            Duration::from_millis(10),
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        manager.start();
        assert!(wait_until(Duration::from_secs(3), || {
            fired.load(Ordering::SeqCst) >= 1
        }));
    }

    #[test]
    fn exit_after_initiates_stop() {
        let manager = SerialManager::new().unwrap();
        let sim = long_lived_sim();
        manager.add_source(sim);
        manager.set_exit_after(Duration::from_secs(1));
        manager.start();
        assert!(wait_until(Duration::from_secs(4), || !manager.is_running()));
    }
}
