//! EN 13757 CRC handling for wM-Bus frames.
//!
//! Radio telegrams are CRC-protected in blocks: the first block covers the
//! 10-byte DLL header, every following block covers up to 16 payload bytes,
//! each followed by a 2-byte CRC (high byte first). Most dongles verify and
//! strip these blocks in firmware; raw taps deliver them intact and run
//! [`check_and_strip_crc_blocks`] before the telegram decoder sees the frame.

use crc16::{State, EN_13757};

use crate::error::{Error, Result};

const FIRST_BLOCK_LEN: usize = 10;
const BLOCK_LEN: usize = 16;

/// CRC-16/EN-13757 over `data` (poly 0x3D65, output complemented).
pub fn crc16_en13757(data: &[u8]) -> u16 {
    State::<EN_13757>::calculate(data)
}

fn check_block(data: &[u8], crc_hi: u8, crc_lo: u8) -> bool {
    let expected = u16::from(crc_hi) << 8 | u16::from(crc_lo);
    crc16_en13757(data) == expected
}

/// Verify and remove the per-block CRCs of a raw wM-Bus frame.
///
/// Returns the stripped frame with the L-field rewritten to the new length.
/// Any block CRC mismatch fails the whole frame.
pub fn check_and_strip_crc_blocks(frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < FIRST_BLOCK_LEN + 2 {
        return Err(Error::TelegramTooShort);
    }

    let mut out = Vec::with_capacity(frame.len());
    if !check_block(&frame[..FIRST_BLOCK_LEN], frame[FIRST_BLOCK_LEN], frame[FIRST_BLOCK_LEN + 1])
    {
        return Err(Error::CrcMismatch);
    }
    out.extend_from_slice(&frame[..FIRST_BLOCK_LEN]);

    let mut rest = &frame[FIRST_BLOCK_LEN + 2..];
    while !rest.is_empty() {
        if rest.len() <= 2 {
            return Err(Error::LengthMismatch);
        }
        let data_len = (rest.len() - 2).min(BLOCK_LEN);
        if !check_block(&rest[..data_len], rest[data_len], rest[data_len + 1]) {
            return Err(Error::CrcMismatch);
        }
        out.extend_from_slice(&rest[..data_len]);
        rest = &rest[data_len + 2..];
    }

    // The L-field counted the CRC bytes on the wire; rewrite it so the
    // stripped frame is self-consistent for the decoder.
    out[0] = (out.len() - 1) as u8;
    Ok(out)
}
