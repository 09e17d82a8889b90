//! wmbusd — listen to wireless and wired M-Bus meters.
//!
//! The daemon core lives in `wmbusd-core`; this binary owns everything the
//! core deliberately does not: argument parsing, logging setup, signal
//! handling and the rendering of readings to stdout.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use wmbusd_core::{
    attach_source, AccessCheck, Baud, ByteSource, CommandSource, Error, FileSource,
    FramingKind, Meter, MeterBus, MeterKeys, Parity, Result, SerialManager, SimulatorSource,
    SourceKind, Telegram, TtySource,
};

#[derive(Parser)]
#[command(name = "wmbusd")]
#[command(about = "wmbusd — decode wireless and wired M-Bus telegrams into meter readings")]
#[command(version = wmbusd_core::VERSION)]
struct Cli {
    /// Byte source: /dev/ttyUSB0[:baud[:parity]], 'stdin', a file path,
    /// a simulation_*.txt replay script, or cmd:<shell command>
    device: String,

    /// Meter quadruples: <name> <driver> <id-pattern> <key|NOKEY>
    #[arg(num_args = 0.., value_name = "METER")]
    meters: Vec<String>,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECONDS")]
    exitafter: Option<u64>,

    /// Reading output format
    #[arg(long, default_value = "hr", value_parser = ["hr", "fields", "json"])]
    format: String,

    /// Stop when all devices have disappeared
    #[arg(long)]
    expect_devices_to_work: bool,

    /// Wired M-Bus framing instead of wM-Bus
    #[arg(long)]
    mbus: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if cli.meters.len() % 4 != 0 {
        return Err(Error::Config(
            "meters must be given as <name> <driver> <id-pattern> <key|NOKEY> quadruples"
                .into(),
        ));
    }

    let mut bus = MeterBus::new();
    for quad in cli.meters.chunks(4) {
        bus.add_meter(&quad[0], &quad[1], &quad[2], MeterKeys::from_hex(&quad[3])?)?;
        info!("meter {} ({}) listening for {}", quad[0], quad[1], quad[2]);
    }
    let format = cli.format.clone();
    bus.on_reading(Box::new(move |t, m| print_reading(&format, t, m)));
    let bus = Arc::new(Mutex::new(bus));

    let manager = Arc::new(SerialManager::new()?);
    let source = open_source(&cli.device)?;
    let kind = if cli.mbus {
        FramingKind::MBus
    } else {
        FramingKind::WMBus
    };
    attach_source(&manager, Arc::clone(&source), kind, bus);
    {
        let id = source.identity().to_string();
        manager.on_disappear(&source, Box::new(move || warn!("({id}) device gone")));
    }

    if let Some(secs) = cli.exitafter {
        manager.set_exit_after(Duration::from_secs(secs));
    }
    // Replays and files end; leaving the latch off would idle forever.
    let finite_source = matches!(
        source.kind(),
        SourceKind::Simulator | SourceKind::File | SourceKind::Stdin
    );
    if cli.expect_devices_to_work || finite_source {
        manager.set_expect_devices_to_work(true);
    }

    install_signal_shim(&manager);

    manager.start();
    manager.wait_for_stop();
    manager.join();
    info!("wmbusd done");
    Ok(())
}

/// Parse a device specification and open the source.
fn open_source(spec: &str) -> Result<Arc<dyn ByteSource>> {
    let (source, strict): (Arc<dyn ByteSource>, bool) = if spec == "stdin" {
        (Arc::new(FileSource::new("stdin")), false)
    } else if let Some(cmd) = spec.strip_prefix("cmd:") {
        (
            Arc::new(CommandSource::new(
                "/bin/sh",
                &["-c".to_string(), cmd.to_string()],
                &[],
            )),
            false,
        )
    } else if is_simulation_script(spec) {
        let text = std::fs::read_to_string(spec)?;
        (Arc::new(SimulatorSource::from_script(spec, &text)?), false)
    } else if spec.starts_with("/dev/") {
        let (path, baud, parity) = parse_tty_spec(spec)?;
        (Arc::new(TtySource::new(&path, baud, parity)), true)
    } else {
        (Arc::new(FileSource::new(spec)), false)
    };

    match source.open(strict) {
        AccessCheck::AccessOk => Ok(source),
        AccessCheck::NotThere => Err(Error::Config(format!(
            "device {spec} does not exist or cannot be configured"
        ))),
        AccessCheck::NotSameGroup => Err(Error::Config(format!(
            "device {spec} is locked by another process"
        ))),
    }
}

fn is_simulation_script(spec: &str) -> bool {
    std::path::Path::new(spec)
        .file_name()
        .and_then(|f| f.to_str())
        .is_some_and(|f| f.starts_with("simulation") && f.ends_with(".txt"))
}

/// `/dev/ttyUSB0[:baud[:parity]]`, e.g. `/dev/ttyUSB0:38400:even`.
fn parse_tty_spec(spec: &str) -> Result<(String, Baud, Parity)> {
    let mut parts = spec.splitn(3, ':');
    let path = parts.next().unwrap_or_default().to_string();
    let baud = match parts.next() {
        None => Baud::B9600,
        Some(b) => b
            .parse::<u32>()
            .ok()
            .and_then(Baud::from_u32)
            .ok_or_else(|| Error::Config(format!("unsupported baud rate in {spec}")))?,
    };
    let parity = match parts.next() {
        None | Some("none") => Parity::None,
        Some("even") => Parity::Even,
        Some("odd") => Parity::Odd,
        Some(p) => return Err(Error::Config(format!("unsupported parity {p} in {spec}"))),
    };
    Ok((path, baud, parity))
}

/// Write end of the manager's tickle pipe, for async-signal-safe wakeups.
static TICKLE_FD: AtomicI32 = AtomicI32::new(-1);
/// Latched by SIGUSR2; a 1 s timer turns it into an orderly stop.
static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn wake_handler(sig: libc::c_int) {
    if sig == libc::SIGUSR2 {
        STOP_REQUESTED.store(true, Ordering::Relaxed);
    }
    let fd = TICKLE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let b = [1u8];
        // SAFETY: write(2) is async-signal-safe; the fd outlives the handler.
        unsafe { libc::write(fd, b.as_ptr().cast(), 1) };
    }
}

/// SIGUSR1 tickles the loops, SIGUSR2 requests a stop, SIGCHLD wakes the
/// readiness thread so sub-process exits are observed promptly. SIGINT and
/// SIGTERM stop via the ctrlc handler.
fn install_signal_shim(manager: &Arc<SerialManager>) {
    TICKLE_FD.store(manager.tickle_fd(), Ordering::Relaxed);
    let handler = wake_handler as extern "C" fn(libc::c_int);
    // SAFETY: the handler only touches atomics and write(2).
    unsafe {
        libc::signal(libc::SIGUSR1, handler as libc::sighandler_t);
        libc::signal(libc::SIGUSR2, handler as libc::sighandler_t);
        libc::signal(libc::SIGCHLD, handler as libc::sighandler_t);
    }

    let m = Arc::downgrade(manager);
    manager.add_timer(
        Duration::from_secs(1),
        Box::new(move || {
            if STOP_REQUESTED.load(Ordering::Relaxed) {
                if let Some(m) = m.upgrade() {
                    m.stop();
                }
            }
        }),
    );

    let m = Arc::downgrade(manager);
    if let Err(e) = ctrlc::set_handler(move || {
        if let Some(m) = m.upgrade() {
            m.stop();
        }
    }) {
        warn!("cannot install SIGINT handler: {e}");
    }
}

/// Render one reading in the selected format.
fn print_reading(format: &str, telegram: &Telegram, meter: &Meter) {
    let fields = meter.driver.print_fields();
    let ts = meter.timestamps();

    match format {
        "json" => {
            let mut obj = serde_json::Map::new();
            obj.insert("meter".into(), meter.driver.tag().into());
            obj.insert("name".into(), meter.name.clone().into());
            obj.insert("id".into(), telegram.id_string().into());
            for f in fields.iter().filter(|f| f.in_json) {
                obj.insert(
                    f.name.into(),
                    serde_json::to_value(&f.value).unwrap_or(serde_json::Value::Null),
                );
            }
            if let Some(ts) = ts {
                obj.insert("timestamp_ut".into(), ts.timestamp_ut.into());
                obj.insert("timestamp_utc".into(), ts.timestamp_utc.into());
                obj.insert("timestamp_lt".into(), ts.timestamp_lt.into());
            }
            println!("{}", serde_json::Value::Object(obj));
        }
        "fields" => {
            let mut cols = vec![meter.name.clone(), telegram.id_string()];
            cols.extend(
                fields
                    .iter()
                    .filter(|f| f.in_fields)
                    .map(|f| f.value.render()),
            );
            if let Some(ts) = ts {
                cols.push(ts.timestamp_lt);
            }
            println!("{}", cols.join(";"));
        }
        _ => {
            let mut row = format!("{}\t{}", meter.name, telegram.id_string());
            for f in fields.iter().filter(|f| f.in_fields) {
                row.push('\t');
                row.push_str(&f.value.render());
                if !f.quantity.is_empty() {
                    row.push(' ');
                    row.push_str(f.quantity);
                }
            }
            if let Some(ts) = ts {
                row.push('\t');
                row.push_str(&ts.timestamp_lt);
            }
            println!("{row}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tty_spec_parsing() {
        let (path, baud, parity) = parse_tty_spec("/dev/ttyUSB0").unwrap();
        assert_eq!(path, "/dev/ttyUSB0");
        assert_eq!(baud, Baud::B9600);
        assert_eq!(parity, Parity::None);

        let (_, baud, parity) = parse_tty_spec("/dev/ttyUSB0:38400:even").unwrap();
        assert_eq!(baud, Baud::B38400);
        assert_eq!(parity, Parity::Even);

        assert!(parse_tty_spec("/dev/ttyUSB0:12345").is_err());
        assert!(parse_tty_spec("/dev/ttyUSB0:9600:sometimes").is_err());
    }

    #[test]
    fn simulation_script_detection() {
        assert!(is_simulation_script("simulation_c1.txt"));
        assert!(is_simulation_script("/tmp/simulation_meters.txt"));
        assert!(!is_simulation_script("telegrams.txt"));
        assert!(!is_simulation_script("simulation.bin"));
    }
}
