//! Concrete byte source implementations.

pub mod command;
pub mod file;
pub mod simulator;
pub mod tty;

pub use command::CommandSource;
pub use file::FileSource;
pub use simulator::{parse_simulation_script, SimEvent, SimulatorSource};
pub use tty::{Baud, Parity, TtySource};
