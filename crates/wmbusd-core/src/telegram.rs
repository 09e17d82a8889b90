//! Telegram model and link/transport header decoding.
//!
//! A [`Telegram`] is built from one CRC-stripped frame. Parsing stops after
//! the DLL/ELL/TPL headers; decryption ([`crate::crypto`]) and the record
//! walk ([`crate::records`]) fill in the rest. The explanation trace collects
//! one `(offset, hex, annotation)` entry per decoded span, for human/debug
//! output only.

use crate::error::{Error, Result};
use crate::records::RecordMap;

/// TPL CI values that carry a short header (ACC, STATUS, CFG).
const TPL_SHORT_HEADER_CIS: &[u8] = &[0x67, 0x6E, 0x74, 0x7A, 0x7D, 0x7F, 0x9E];
/// TPL CI values that carry a long header (ID, MFCT, VER, TYPE, ACC, STATUS, CFG).
const TPL_LONG_HEADER_CIS: &[u8] = &[0x68, 0x6F, 0x72, 0x75, 0x7C, 0x7E, 0x9F];
/// TPL CI values with no header at all.
const TPL_NO_HEADER_CIS: &[u8] = &[0x78, 0x79];
/// Extended link layer with session number (AES-CTR security).
const ELL_SN_CI: u8 = 0x8D;

/// Data link layer header, first 10 bytes of every telegram.
#[derive(Debug, Clone)]
pub struct DllHeader {
    pub len: u8,
    pub c_field: u8,
    /// Manufacturer code, 2 bytes little-endian on the wire.
    pub manufacturer: u16,
    /// Meter address as transmitted (BCD id, least significant byte first).
    pub id: [u8; 4],
    pub version: u8,
    pub device_type: u8,
}

/// Extended link layer header (CI 0x8D): CC, ACC, 4-byte session number.
#[derive(Debug, Clone)]
pub struct EllHeader {
    pub cc: u8,
    pub acc: u8,
    pub session_number: u32,
}

/// Transport layer header.
#[derive(Debug, Clone)]
pub struct TplHeader {
    pub access_number: u8,
    pub status: u8,
    pub configuration: u16,
}

/// Security applied to the application payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    None,
    /// ELL AES-128-CTR (mode 1, Kamstrup C1 radio).
    EllAesCtr,
    /// TPL AES-128-CBC with IV (OMS security profile A, mode 5).
    TplAesCbcIv,
}

/// One annotated span of the raw frame.
#[derive(Debug, Clone)]
pub struct Explanation {
    pub offset: usize,
    pub hex: String,
    pub info: String,
}

/// One framed, self-contained message from a meter.
pub struct Telegram {
    /// Frame as received (CRC-stripped).
    pub frame: Vec<u8>,
    pub dll: DllHeader,
    pub ell: Option<EllHeader>,
    pub tpl: Option<TplHeader>,
    /// CI of the application layer.
    pub ci: u8,
    /// Offset of the application payload within `frame`.
    pub header_size: usize,
    /// Application layer bytes; ciphertext until decryption runs.
    pub payload: Vec<u8>,
    /// Parsed record set, filled by the DIF/VIF walk.
    pub records: RecordMap,
    pub explanations: Vec<Explanation>,
}

impl Telegram {
    /// Decode the DLL header and whatever ELL/TPL header follows the CI.
    ///
    /// `frame` must be CRC-stripped. The payload is left encrypted; call
    /// [`crate::crypto::decrypt_telegram`] next when
    /// [`Telegram::security_mode`] says so.
    pub fn parse_header(frame: &[u8]) -> Result<Telegram> {
        if frame.len() < 11 {
            return Err(Error::TelegramTooShort);
        }
        if frame.len() > 256 {
            return Err(Error::TelegramTooLong);
        }
        let len = frame[0];
        if len as usize + 1 > frame.len() {
            return Err(Error::LengthMismatch);
        }
        let c_field = frame[1];
        if c_field != 0x44 {
            return Err(Error::UnsupportedCField(c_field));
        }
        let dll = DllHeader {
            len,
            c_field,
            manufacturer: u16::from(frame[2]) | u16::from(frame[3]) << 8,
            id: [frame[4], frame[5], frame[6], frame[7]],
            version: frame[8],
            device_type: frame[9],
        };
        let ci = frame[10];

        let mut t = Telegram {
            frame: frame[..len as usize + 1].to_vec(),
            dll,
            ell: None,
            tpl: None,
            ci,
            header_size: 11,
            payload: Vec::new(),
            records: RecordMap::new(),
            explanations: Vec::new(),
        };
        t.add_explanation(0, 1, "length");
        t.add_explanation(1, 1, "c-field (SND_NR)");
        t.add_explanation(2, 2, format!("manufacturer {}", t.manufacturer_flag()));
        t.add_explanation(4, 4, format!("id {}", t.id_string()));
        t.add_explanation(8, 1, "version");
        t.add_explanation(9, 1, "device type");

        if ci == ELL_SN_CI {
            t.parse_ell()?;
        } else if TPL_SHORT_HEADER_CIS.contains(&ci) {
            t.parse_tpl_short()?;
        } else if TPL_LONG_HEADER_CIS.contains(&ci) {
            t.parse_tpl_long()?;
        } else if TPL_NO_HEADER_CIS.contains(&ci) || ci >= 0xA0 {
            // No transport header: plain records, or a manufacturer-specific
            // application layer the driver decodes itself.
            t.add_explanation(10, 1, "tpl ci (no header)");
        } else {
            return Err(Error::UnsupportedCiField(ci));
        }

        t.payload = t.frame[t.header_size..].to_vec();
        Ok(t)
    }

    fn parse_ell(&mut self) -> Result<()> {
        if self.frame.len() < 17 {
            return Err(Error::TelegramTooShort);
        }
        let f = &self.frame;
        self.ell = Some(EllHeader {
            cc: f[11],
            acc: f[12],
            session_number: u32::from_le_bytes([f[13], f[14], f[15], f[16]]),
        });
        self.header_size = 17;
        self.add_explanation(10, 1, "ell ci");
        self.add_explanation(11, 1, "ell cc");
        self.add_explanation(12, 1, "ell acc");
        self.add_explanation(13, 4, "ell session number");
        Ok(())
    }

    fn parse_tpl_short(&mut self) -> Result<()> {
        if self.frame.len() < 15 {
            return Err(Error::TelegramTooShort);
        }
        let f = &self.frame;
        self.tpl = Some(TplHeader {
            access_number: f[11],
            status: f[12],
            configuration: u16::from(f[13]) | u16::from(f[14]) << 8,
        });
        self.header_size = 15;
        self.add_explanation(10, 1, "tpl ci (short header)");
        self.add_explanation(11, 1, "tpl acc");
        self.add_explanation(12, 1, "tpl status");
        self.add_explanation(13, 2, "tpl configuration");
        Ok(())
    }

    /// Long header: the addressed meter may differ from the DLL sender.
    /// The embedded id replaces the DLL one for dispatch purposes.
    fn parse_tpl_long(&mut self) -> Result<()> {
        if self.frame.len() < 23 {
            return Err(Error::TelegramTooShort);
        }
        let f = &self.frame;
        self.dll.id = [f[11], f[12], f[13], f[14]];
        self.dll.manufacturer = u16::from(f[15]) | u16::from(f[16]) << 8;
        self.dll.version = f[17];
        self.dll.device_type = f[18];
        self.tpl = Some(TplHeader {
            access_number: f[19],
            status: f[20],
            configuration: u16::from(f[21]) | u16::from(f[22]) << 8,
        });
        self.header_size = 23;
        self.add_explanation(10, 1, "tpl ci (long header)");
        self.add_explanation(11, 4, "tpl id");
        self.add_explanation(15, 2, "tpl manufacturer");
        self.add_explanation(17, 1, "tpl version");
        self.add_explanation(18, 1, "tpl device type");
        self.add_explanation(19, 1, "tpl acc");
        self.add_explanation(20, 1, "tpl status");
        self.add_explanation(21, 2, "tpl configuration");
        Ok(())
    }

    /// Meter id as printed, most significant digits first.
    pub fn id_string(&self) -> String {
        let id = &self.dll.id;
        format!("{:02x}{:02x}{:02x}{:02x}", id[3], id[2], id[1], id[0])
    }

    /// Three-letter manufacturer flag decoded from the M-field.
    pub fn manufacturer_flag(&self) -> String {
        manufacturer_flag(self.dll.manufacturer)
    }

    /// Security the payload is under, derived from the headers.
    pub fn security_mode(&self) -> SecurityMode {
        if self.ell.is_some() {
            return SecurityMode::EllAesCtr;
        }
        if let Some(tpl) = &self.tpl {
            if (tpl.configuration >> 8) & 0x1F == 5 {
                return SecurityMode::TplAesCbcIv;
            }
        }
        SecurityMode::None
    }

    /// Number of encrypted 16-byte blocks announced by the TPL configuration.
    pub fn encrypted_block_count(&self) -> usize {
        self.tpl
            .as_ref()
            .map(|tpl| ((tpl.configuration >> 4) & 0x0F) as usize)
            .unwrap_or(0)
    }

    /// Record a decoded span of the frame in the explanation trace.
    ///
    /// Offsets always point into the raw frame, also for spans whose bytes
    /// were decrypted in place.
    pub fn add_explanation(&mut self, offset: usize, len: usize, info: impl Into<String>) {
        debug_assert!(offset < self.frame.len());
        let end = (offset + len).min(self.frame.len());
        self.explanations.push(Explanation {
            offset,
            hex: hex::encode_upper(&self.frame[offset..end]),
            info: info.into(),
        });
    }

    /// Record a span whose plaintext differs from the frame bytes.
    pub fn add_explanation_hex(&mut self, offset: usize, hex: String, info: impl Into<String>) {
        debug_assert!(offset < self.frame.len());
        self.explanations.push(Explanation {
            offset,
            hex,
            info: info.into(),
        });
    }

    /// Annotate the trace entry at `offset`; drivers use this to label the
    /// records they consumed.
    pub fn annotate(&mut self, offset: usize, info: impl Into<String>) {
        if let Some(e) = self.explanations.iter_mut().find(|e| e.offset == offset) {
            e.info = info.into();
        }
    }
}

/// Decode a 2-byte manufacturer code into its three-letter flag.
pub fn manufacturer_flag(m: u16) -> String {
    let l = |v: u16| -> char { (b'@' + (v & 0x1F) as u8) as char };
    format!("{}{}{}", l(m >> 10), l(m >> 5), l(m))
}

/// Encode a three-letter flag ("KAM") into the 2-byte manufacturer code.
pub fn manufacturer_code(flag: &str) -> Option<u16> {
    let b = flag.as_bytes();
    if b.len() != 3 || !b.iter().all(|c| c.is_ascii_uppercase()) {
        return None;
    }
    Some(
        (u16::from(b[0] - b'@') << 10)
            | (u16::from(b[1] - b'@') << 5)
            | u16::from(b[2] - b'@'),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    /// OMS Vol.2 Annex N (N.2.1) meter telegram, CRC blocks stripped.
    const ANNEX_N: &str =
        "2E4493157856341233037A2A0020255923C95AAA26D1B2E7493B013EC4A6F6D3529B520EDFF0EA6DEFC99D6D69EBF3";

    #[test]
    fn manufacturer_codec_roundtrip() {
        assert_eq!(manufacturer_code("ELS"), Some(0x1593));
        assert_eq!(manufacturer_flag(0x1593), "ELS");
        assert_eq!(manufacturer_flag(0x2C2D), "KAM");
        assert_eq!(manufacturer_code("KAM"), Some(0x2C2D));
        assert_eq!(manufacturer_code("TCH"), Some(0x5068));
        assert_eq!(manufacturer_code("kam"), None);
    }

    #[test]
    fn parses_annex_n_headers() {
        let frame = hex::decode(ANNEX_N).unwrap();
        let t = Telegram::parse_header(&frame).unwrap();
        assert_eq!(t.manufacturer_flag(), "ELS");
        assert_eq!(t.id_string(), "12345678");
        assert_eq!(t.dll.version, 0x33);
        assert_eq!(t.dll.device_type, 0x03);
        assert_eq!(t.ci, 0x7A);
        let tpl = t.tpl.as_ref().unwrap();
        assert_eq!(tpl.access_number, 0x2A);
        assert_eq!(tpl.status, 0x00);
        assert_eq!(tpl.configuration, 0x2520);
        assert_eq!(t.security_mode(), SecurityMode::TplAesCbcIv);
        assert_eq!(t.encrypted_block_count(), 2);
        assert_eq!(t.payload.len(), 32);
    }

    #[test]
    fn rejects_short_and_inconsistent_frames() {
        assert!(matches!(
            Telegram::parse_header(&[0x05, 0x44]),
            Err(Error::TelegramTooShort)
        ));
        let mut frame = hex::decode(ANNEX_N).unwrap();
        frame[0] = 0xFF;
        assert!(matches!(
            Telegram::parse_header(&frame),
            Err(Error::LengthMismatch)
        ));
        let mut frame = hex::decode(ANNEX_N).unwrap();
        frame[1] = 0x08;
        assert!(matches!(
            Telegram::parse_header(&frame),
            Err(Error::UnsupportedCField(0x08))
        ));
    }

    #[test]
    fn explanation_offsets_inside_frame() {
        let frame = hex::decode(ANNEX_N).unwrap();
        let t = Telegram::parse_header(&frame).unwrap();
        assert!(!t.explanations.is_empty());
        for e in &t.explanations {
            assert!(e.offset < t.frame.len());
        }
    }
}
