//! Error taxonomy for the ingestion pipeline.
//!
//! Recoverable errors never unwind past the per-telegram boundary: the
//! dispatch layer logs them (with per-address suppression where noted) and
//! moves on to the next frame. Fatal errors make the manager stop.

use thiserror::Error;

/// All failure modes surfaced by the core.
#[derive(Error, Debug)]
pub enum Error {
    #[error("telegram too short")]
    TelegramTooShort,

    #[error("telegram too long")]
    TelegramTooLong,

    #[error("telegram length field disagrees with frame")]
    LengthMismatch,

    #[error("crc mismatch")]
    CrcMismatch,

    #[error("unsupported C field {0:#04x}")]
    UnsupportedCField(u8),

    #[error("unsupported CI field {0:#04x}")]
    UnsupportedCiField(u8),

    #[error("security mode {0} not supported")]
    SecurityModeNotSupported(u8),

    #[error("no decryption key configured for id {0}")]
    NoKey(String),

    #[error("decryption failed for id {0}")]
    DecryptionFailed(String),

    #[error("malformed record stream at offset {0}")]
    MalformedRecords(usize),

    #[error("bad AES key \"{0}\" (expected 32 hex digits)")]
    BadKey(String),

    #[error("bad meter id pattern \"{0}\"")]
    BadIdPattern(String),

    #[error("unknown meter driver \"{0}\"")]
    UnknownDriver(String),

    #[error("bad simulation line \"{0}\"")]
    BadSimulationLine(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
