//! # wmbusd-core
//!
//! **Every meter in radio range is a broadcaster; this crate listens.**
//!
//! `wmbusd-core` is the ingestion pipeline of the wmbusd daemon: bytes from
//! a radio dongle, serial TTY, sub-process stdout, file or replay script are
//! framed into telegrams, authenticated and decrypted, walked as DIF/VIF
//! record streams, and dispatched to the meter driver configured for the
//! sending address.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::{Arc, Mutex};
//! use wmbusd_core::{
//!     attach_source, ByteSource, FramingKind, MeterBus, MeterKeys, SerialManager, SimulatorSource,
//! };
//!
//! let mut bus = MeterBus::new();
//! bus.add_meter("heat", "multical302", "12345678", MeterKeys::default()).unwrap();
//! bus.on_reading(Box::new(|_telegram, meter| {
//!     for field in meter.driver.print_fields() {
//!         println!("{}={}", field.name, field.value.render());
//!     }
//! }));
//! let bus = Arc::new(Mutex::new(bus));
//!
//! let manager = SerialManager::new().unwrap();
//! let sim = SimulatorSource::from_script("sim", "telegram=2E44...").unwrap();
//! sim.open(false);
//! attach_source(&manager, Arc::new(sim), FramingKind::WMBus, bus);
//! manager.set_expect_devices_to_work(true);
//! manager.start();
//! manager.wait_for_stop();
//! ```
//!
//! ## Architecture
//!
//! Sources → Manager (readiness + timers) → Framing → Crypto → Records →
//! Dispatch → Driver → reading callback.
//!
//! The core performs no output itself; sinks hang off
//! [`MeterBus::on_reading`]. Recoverable errors stay inside the per-telegram
//! boundary, warnings are deduplicated per address, and a failed integrity
//! check permanently ignores the sender after warning once.

pub mod crc;
pub mod crypto;
pub mod drivers;
pub mod error;
pub mod framing;
pub mod manager;
pub mod meter;
pub mod records;
pub mod source;
pub mod sources;
pub mod telegram;

pub use crypto::{decrypt_telegram, MeterKeys};
pub use drivers::{all_drivers, attach_source, detect_driver, lookup_driver, MeterBus};
pub use error::{Error, Result};
pub use framing::{check_frame, FrameBuffer, FrameStatus, FramingKind};
pub use manager::SerialManager;
pub use meter::{FieldValue, LinkMode, Meter, MeterDriver, Print};
pub use records::{parse_records, DvDate, DvEntry, MeasurementType, RecordMap, ValueInformation};
pub use source::{AccessCheck, ByteSource, SourceKind};
pub use sources::{Baud, CommandSource, FileSource, Parity, SimulatorSource, TtySource};
pub use telegram::{SecurityMode, Telegram};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
