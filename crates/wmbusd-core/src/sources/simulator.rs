//! Script-driven simulator source.
//!
//! A simulation script holds one directive per line:
//!
//! ```text
//! telegram=2E449315785634123303...      inject immediately
//! telegram=2E449315785634123303...|+5   inject 5 s after start
//! ```
//!
//! Other lines are ignored. The manager pumps the simulator once per loop
//! iteration, so injection granularity is the loop tick; there are no
//! blocking sleeps anywhere, which keeps cancellation prompt by
//! construction. When every event has been delivered and drained the source
//! reports not-working and disappears like an unplugged dongle.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::source::{AccessCheck, ByteSource, Notifier, SourceCore, SourceKind};

/// One scripted injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimEvent {
    pub bytes: Vec<u8>,
    /// Delay relative to `open()`; `None` injects on the first pump.
    pub after: Option<Duration>,
}

/// Parse a simulation script into its events.
pub fn parse_simulation_script(text: &str) -> Result<Vec<SimEvent>> {
    let mut events = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("telegram=") else {
            continue;
        };
        let (hexpart, after) = match rest.split_once('|') {
            Some((h, tail)) => {
                let secs = tail
                    .strip_prefix('+')
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(|| Error::BadSimulationLine(line.to_string()))?;
                (h, Some(Duration::from_secs(secs)))
            }
            None => (rest, None),
        };
        let bytes =
            hex::decode(hexpart).map_err(|_| Error::BadSimulationLine(line.to_string()))?;
        events.push(SimEvent { bytes, after });
    }
    Ok(events)
}

pub struct SimulatorSource {
    core: SourceCore,
    events: Mutex<VecDeque<SimEvent>>,
    buffer: Mutex<Vec<u8>>,
    started: Mutex<Option<Instant>>,
    notifier: Mutex<Option<Notifier>>,
}

impl SimulatorSource {
    pub fn new(identity: &str, events: Vec<SimEvent>) -> Self {
        Self {
            core: SourceCore::new(identity, SourceKind::Simulator),
            events: Mutex::new(events.into()),
            buffer: Mutex::new(Vec::new()),
            started: Mutex::new(None),
            notifier: Mutex::new(None),
        }
    }

    pub fn from_script(identity: &str, text: &str) -> Result<Self> {
        Ok(Self::new(identity, parse_simulation_script(text)?))
    }

    /// Inject bytes immediately; the attached on-data callback fires exactly
    /// once for this batch (via the manager notifier).
    pub fn fill(&self, bytes: &[u8]) {
        self.buffer.lock().unwrap().extend_from_slice(bytes);
        if let Some(n) = self.notifier.lock().unwrap().as_ref() {
            n();
        }
    }
}

impl ByteSource for SimulatorSource {
    fn identity(&self) -> &str {
        self.core.identity()
    }

    fn kind(&self) -> SourceKind {
        self.core.kind()
    }

    fn fd(&self) -> RawFd {
        -1
    }

    fn open(&self, _strict: bool) -> AccessCheck {
        if self.core.opened() && !self.core.is_closed() {
            return AccessCheck::AccessOk;
        }
        *self.started.lock().unwrap() = Some(Instant::now());
        self.core.mark_opened();
        info!(
            "({}) simulation started with {} events",
            self.core.identity(),
            self.events.lock().unwrap().len()
        );
        AccessCheck::AccessOk
    }

    fn close(&self) {
        self.core.close_fds();
    }

    fn receive(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buffer.lock().unwrap())
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
        !self.buffer.lock().unwrap().is_empty()
    }

    fn pump(&self) -> bool {
        if !self.core.opened() || !self.core.working() {
            return false;
        }
        let started = *self.started.lock().unwrap();
        let Some(start) = started else {
            return false;
        };

        let mut due: Vec<SimEvent> = Vec::new();
        {
            let mut events = self.events.lock().unwrap();
            while let Some(front) = events.front() {
                let ready = match front.after {
                    None => true,
                    Some(d) => start.elapsed() >= d,
                };
                if !ready {
                    break;
                }
                due.push(events.pop_front().expect("front just checked"));
            }
            if events.is_empty() && due.is_empty() && self.buffer.lock().unwrap().is_empty() {
                // Replay finished and drained: behave like an unplugged
                // device so the sweep removes us.
                debug!("({}) simulation complete", self.core.identity());
                self.core.stop_working();
                return false;
            }
        }

        if due.is_empty() {
            return false;
        }
        let mut buffer = self.buffer.lock().unwrap();
        for e in due {
            buffer.extend_from_slice(&e.bytes);
        }
        true
    }

    fn set_notifier(&self, notifier: Notifier) {
        *self.notifier.lock().unwrap() = Some(notifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn parses_script_lines() {
        let script = "\
# comment line is ignored
telegram=AABB
telegram=CCDD|+2
noise
";
        let events = parse_simulation_script(script).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], SimEvent { bytes: vec![0xAA, 0xBB], after: None });
        assert_eq!(
            events[1],
            SimEvent { bytes: vec![0xCC, 0xDD], after: Some(Duration::from_secs(2)) }
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_simulation_script("telegram=XYZ").is_err());
        assert!(parse_simulation_script("telegram=AA|2").is_err());
        assert!(parse_simulation_script("telegram=AA|+x").is_err());
    }

    #[test]
    fn pump_delivers_immediate_events() {
        let sim = SimulatorSource::new(
            "sim",
            vec![SimEvent { bytes: vec![1, 2], after: None }],
        );
        assert_eq!(sim.open(false), AccessCheck::AccessOk);
        assert!(sim.pump());
        assert!(sim.check_if_data_is_pending());
        assert_eq!(sim.receive(), vec![1, 2]);
        // Next pump finds nothing left and retires the source.
        assert!(!sim.pump());
        assert!(!sim.working());
    }

    #[test]
    fn pump_holds_back_timed_events() {
        let sim = SimulatorSource::new(
            "sim",
            vec![SimEvent { bytes: vec![9], after: Some(Duration::from_secs(60)) }],
        );
        sim.open(false);
        assert!(!sim.pump());
        assert!(sim.working(), "timed event still outstanding");
        assert!(!sim.check_if_data_is_pending());
    }

    #[test]
    fn fill_triggers_notifier_once() {
        let sim = SimulatorSource::new("sim", Vec::new());
        sim.open(false);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        sim.set_notifier(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        sim.fill(&[0xE5]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(sim.receive(), vec![0xE5]);
    }
}
