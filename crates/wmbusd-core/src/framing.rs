//! Frame recognition for unreliable byte streams.
//!
//! Two framing dialects are supported, selected per byte source:
//!
//! - **wM-Bus** (radio dongles, raw wM-Bus TTYs): the L-field comes first and
//!   the full frame is `L + 1` bytes. CRC blocks are assumed to be stripped
//!   by the dongle layer; raw taps run [`crate::crc::check_and_strip_crc_blocks`]
//!   before handing the frame on.
//! - **M-Bus** (wired TTYs): single-char `0xE5`, short `10 C A CS 16` and
//!   long `68 L L 68 C A CI … CS 16` frames.
//!
//! The recognizers are pure functions over the accumulated buffer: they never
//! block and never copy. A [`FrameBuffer`] wraps the accumulation/extraction
//! cycle for the manager's `on_data` path.

use log::warn;

/// Outcome of inspecting an accumulated byte buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Not enough bytes yet; keep the buffer and wait for more.
    Partial,
    /// A complete frame starts at the beginning of the buffer.
    Full {
        /// Total bytes to erase from the buffer.
        frame_len: usize,
        /// Telegram payload length within the frame.
        payload_len: usize,
        /// Offset of the telegram payload within the frame.
        payload_offset: usize,
    },
    /// The buffer cannot contain a valid frame; discard it.
    ErrorInFrame,
}

/// Framing dialect of a byte source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingKind {
    /// EN 13757-4 radio framing, L-field first.
    WMBus,
    /// EN 13757-2 wired framing (single-char / short / long frames).
    MBus,
}

/// Minimum plausible wM-Bus L-field: DLL header (10 bytes) + CI.
const WMBUS_MIN_LEN: u8 = 10;

/// Inspect `buf` for one wM-Bus frame.
///
/// The L-field counts every byte after itself, so a full frame is `L + 1`
/// bytes. Bytes beyond the frame stay in the buffer for the next round.
pub fn check_wmbus_frame(buf: &[u8]) -> FrameStatus {
    if buf.is_empty() {
        return FrameStatus::Partial;
    }
    let len = buf[0];
    if len < WMBUS_MIN_LEN {
        return FrameStatus::ErrorInFrame;
    }
    let total = len as usize + 1;
    if buf.len() < total {
        return FrameStatus::Partial;
    }
    FrameStatus::Full {
        frame_len: total,
        payload_len: total,
        payload_offset: 0,
    }
}

/// Inspect `buf` for one M-Bus frame (single-char, short or long shape).
pub fn check_mbus_frame(buf: &[u8]) -> FrameStatus {
    if buf.is_empty() {
        return FrameStatus::Partial;
    }
    match buf[0] {
        0xE5 => FrameStatus::Full {
            frame_len: 1,
            payload_len: 1,
            payload_offset: 0,
        },
        0x10 => check_mbus_short_frame(buf),
        0x68 => check_mbus_long_frame(buf),
        _ => FrameStatus::ErrorInFrame,
    }
}

/// Short frame: `10 C A CS 16`, CS = (C + A) mod 256.
fn check_mbus_short_frame(buf: &[u8]) -> FrameStatus {
    if buf.len() < 5 {
        return FrameStatus::Partial;
    }
    let cs = buf[1].wrapping_add(buf[2]);
    if buf[3] != cs || buf[4] != 0x16 {
        return FrameStatus::ErrorInFrame;
    }
    FrameStatus::Full {
        frame_len: 5,
        payload_len: 2,
        payload_offset: 1,
    }
}

/// Long frame: `68 L L 68 C A CI data… CS 16`, L counts C..last data byte,
/// CS = low byte of the sum over the same span.
fn check_mbus_long_frame(buf: &[u8]) -> FrameStatus {
    if buf.len() < 4 {
        return FrameStatus::Partial;
    }
    let len = buf[1];
    if buf[2] != len || buf[3] != 0x68 || len < 3 {
        return FrameStatus::ErrorInFrame;
    }
    let total = 4 + len as usize + 2;
    if buf.len() < total {
        return FrameStatus::Partial;
    }
    if buf[total - 1] != 0x16 {
        return FrameStatus::ErrorInFrame;
    }
    let sum: u32 = buf[4..4 + len as usize].iter().map(|&b| u32::from(b)).sum();
    if buf[4 + len as usize] != (sum & 0xFF) as u8 {
        return FrameStatus::ErrorInFrame;
    }
    FrameStatus::Full {
        frame_len: total,
        payload_len: len as usize,
        payload_offset: 4,
    }
}

/// Inspect `buf` for one frame of the given dialect.
pub fn check_frame(kind: FramingKind, buf: &[u8]) -> FrameStatus {
    match kind {
        FramingKind::WMBus => check_wmbus_frame(buf),
        FramingKind::MBus => check_mbus_frame(buf),
    }
}

/// Append-only accumulation buffer feeding the frame recognizer.
///
/// One per byte source. `push` appends a received batch, `pop_frame` extracts
/// the next complete frame if one is buffered. A protocol error discards the
/// whole buffer, resynchronizing on the next batch.
pub struct FrameBuffer {
    kind: FramingKind,
    identity: String,
    data: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(kind: FramingKind, identity: &str) -> Self {
        Self {
            kind,
            identity: identity.to_string(),
            data: Vec::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Extract the next complete telegram, if any.
    ///
    /// Returns the telegram payload bytes and erases the full frame from the
    /// buffer. On a protocol error the buffer is dropped and a warning is
    /// logged; call again after the next batch arrives.
    pub fn pop_frame(&mut self) -> Option<Vec<u8>> {
        match check_frame(self.kind, &self.data) {
            FrameStatus::Partial => None,
            FrameStatus::ErrorInFrame => {
                warn!(
                    "({}) protocol error in frame, dropping {} buffered bytes",
                    self.identity,
                    self.data.len()
                );
                self.data.clear();
                None
            }
            FrameStatus::Full {
                frame_len,
                payload_len,
                payload_offset,
            } => {
                let payload = self.data[payload_offset..payload_offset + payload_len].to_vec();
                self.data.drain(..frame_len);
                Some(payload)
            }
        }
    }
}
