//! Payload decryption and integrity checks.
//!
//! Two security schemes appear on real meters:
//!
//! - **ELL AES-128-CTR** (Kamstrup C1 radio): the extended link layer
//!   carries a session number; everything after it is ciphertext whose first
//!   two plaintext bytes are a CRC over the remaining plaintext. A CRC
//!   mismatch after decryption means the key is wrong (or the frame is
//!   damaged) — either way an integrity failure.
//! - **TPL AES-128-CBC with IV** (OMS security profile A, mode 5): the
//!   encrypted blocks start with the `2F 2F` verification bytes and are
//!   padded with `2F` idle fillers the record walk skips.
//!
//! Integrity failures are reported to the dispatch layer, which permanently
//! ignores the offending address after warning once.

use aes::Aes128;
use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};

use crate::crc::crc16_en13757;
use crate::error::{Error, Result};
use crate::telegram::{SecurityMode, Telegram};

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128Ctr = ctr::Ctr128BE<Aes128>;

pub const AES_KEY_LEN: usize = 16;

/// Key material configured for one meter.
#[derive(Debug, Clone, Default)]
pub struct MeterKeys {
    pub confidentiality_key: Option<[u8; AES_KEY_LEN]>,
}

impl MeterKeys {
    /// Parse a configured key: 32 hex digits, or `NOKEY` for plaintext meters.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("NOKEY") {
            return Ok(Self { confidentiality_key: None });
        }
        let bytes = hex::decode(s).map_err(|_| Error::BadKey(s.to_string()))?;
        let key: [u8; AES_KEY_LEN] =
            bytes.try_into().map_err(|_| Error::BadKey(s.to_string()))?;
        Ok(Self { confidentiality_key: Some(key) })
    }
}

/// IV for ELL AES-CTR: M-field, full A-field, CC, SN, then a zeroed frame
/// counter and block counter. The CTR counter increments from the last byte.
fn ell_iv(t: &Telegram) -> [u8; 16] {
    let ell = t.ell.as_ref().expect("ELL header required for CTR IV");
    let mut iv = [0u8; 16];
    iv[0] = (t.dll.manufacturer & 0xFF) as u8;
    iv[1] = (t.dll.manufacturer >> 8) as u8;
    iv[2..6].copy_from_slice(&t.dll.id);
    iv[6] = t.dll.version;
    iv[7] = t.dll.device_type;
    iv[8] = ell.cc;
    iv[9..13].copy_from_slice(&ell.session_number.to_le_bytes());
    // iv[13..16]: FN and BC start at zero.
    iv
}

/// IV for TPL AES-CBC mode 5: M-field, full A-field, then the access number
/// replicated across the remaining 8 bytes.
fn tpl_iv(t: &Telegram) -> [u8; 16] {
    let tpl = t.tpl.as_ref().expect("TPL header required for CBC IV");
    let mut iv = [0u8; 16];
    iv[0] = (t.dll.manufacturer & 0xFF) as u8;
    iv[1] = (t.dll.manufacturer >> 8) as u8;
    iv[2..6].copy_from_slice(&t.dll.id);
    iv[6] = t.dll.version;
    iv[7] = t.dll.device_type;
    iv[8..16].fill(tpl.access_number);
    iv
}

/// Apply the AES-CTR keystream; encryption and decryption are the same
/// operation.
pub fn aes_ctr_apply(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) {
    let mut cipher =
        Aes128Ctr::new_from_slices(key, iv).expect("fixed-length key and iv");
    cipher.apply_keystream(data);
}

/// Decrypt whole AES-CBC blocks in place; `data` must be a multiple of 16.
pub fn aes_cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> Result<()> {
    Aes128CbcDec::new_from_slices(key, iv)
        .expect("fixed-length key and iv")
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| Error::LengthMismatch)?;
    Ok(())
}

/// Encrypt whole AES-CBC blocks in place (simulators and tests).
pub fn aes_cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], data: &mut [u8]) -> Result<()> {
    let n = data.len();
    Aes128CbcEnc::new_from_slices(key, iv)
        .expect("fixed-length key and iv")
        .encrypt_padded_mut::<NoPadding>(data, n)
        .map_err(|_| Error::LengthMismatch)?;
    Ok(())
}

/// Decrypt the telegram payload according to its headers and verify the
/// post-decrypt plausibility markers.
///
/// On success the frame holds plaintext, `header_size` has advanced past the
/// verification bytes and the payload is ready for the record walk. A
/// telegram that fails here must not reach any driver.
pub fn decrypt_telegram(t: &mut Telegram, keys: &MeterKeys) -> Result<()> {
    match t.security_mode() {
        SecurityMode::None => {
            // Any mode other than plaintext or 5 is out of reach here;
            // treating it as plaintext would parse keystream as records.
            if let Some(tpl) = &t.tpl {
                let mode = ((tpl.configuration >> 8) & 0x1F) as u8;
                if mode != 0 {
                    return Err(Error::SecurityModeNotSupported(mode));
                }
            }
            Ok(())
        }
        SecurityMode::EllAesCtr => decrypt_ell(t, keys),
        SecurityMode::TplAesCbcIv => decrypt_tpl(t, keys),
    }
}

fn require_key(t: &Telegram, keys: &MeterKeys) -> Result<[u8; 16]> {
    keys.confidentiality_key
        .ok_or_else(|| Error::NoKey(t.id_string()))
}

fn decrypt_ell(t: &mut Telegram, keys: &MeterKeys) -> Result<()> {
    let key = require_key(t, keys)?;
    if t.payload.len() < 3 {
        return Err(Error::TelegramTooShort);
    }

    let iv = ell_iv(t);
    let mut data = t.payload.clone();
    aes_ctr_apply(&key, &iv, &mut data);

    // The payload CRC doubles as the plaintext plausibility check.
    let expected = u16::from(data[0]) | u16::from(data[1]) << 8;
    if crc16_en13757(&data[2..]) != expected {
        return Err(Error::DecryptionFailed(t.id_string()));
    }

    let hs = t.header_size;
    t.frame.truncate(hs);
    t.frame.extend_from_slice(&data);
    t.add_explanation_hex(hs, hex::encode_upper(&data[..2]), "payload crc (verified)");

    // Past the CRC sits the application CI. Only the full-frame layout is
    // understood here; the compact-frame cache (CI 0x79) is not implemented.
    t.ci = data[2];
    match t.ci {
        0x78 => {
            t.add_explanation_hex(hs + 2, hex::encode_upper(&data[2..3]), "tpl ci");
            t.header_size = hs + 3;
        }
        other => return Err(Error::UnsupportedCiField(other)),
    }
    t.payload = t.frame[t.header_size..].to_vec();
    Ok(())
}

fn decrypt_tpl(t: &mut Telegram, keys: &MeterKeys) -> Result<()> {
    let key = require_key(t, keys)?;
    let enc_len = t.encrypted_block_count() * 16;
    if enc_len == 0 || enc_len > t.payload.len() {
        return Err(Error::LengthMismatch);
    }

    let iv = tpl_iv(t);
    let mut data = t.payload.clone();
    aes_cbc_decrypt(&key, &iv, &mut data[..enc_len])?;

    if data[0] != 0x2F || data[1] != 0x2F {
        return Err(Error::DecryptionFailed(t.id_string()));
    }

    let hs = t.header_size;
    t.frame.truncate(hs);
    t.frame.extend_from_slice(&data);
    t.add_explanation_hex(hs, "2F2F".into(), "decrypt verification (ok)");
    // Skip the verification bytes; trailing 2F fillers are left for the
    // record walk to annotate.
    t.header_size = hs + 2;
    t.payload = t.frame[t.header_size..].to_vec();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::parse_records;

    const KEY_HEX: &str = "000102030405060708090A0B0C0D0E0F";

    fn key() -> [u8; 16] {
        MeterKeys::from_hex(KEY_HEX)
            .unwrap()
            .confidentiality_key
            .unwrap()
    }

    #[test]
    fn key_parsing() {
        assert!(MeterKeys::from_hex("NOKEY")
            .unwrap()
            .confidentiality_key
            .is_none());
        assert!(MeterKeys::from_hex("0011").is_err());
        assert!(MeterKeys::from_hex("zz0102030405060708090A0B0C0D0E0F").is_err());
    }

    /// Build a mode-5 encrypted short-header telegram around `records`.
    fn encrypted_mode5_telegram(key: &[u8; 16], records: &[u8]) -> Vec<u8> {
        let mut plaintext = vec![0x2F, 0x2F];
        plaintext.extend_from_slice(records);
        while plaintext.len() % 16 != 0 {
            plaintext.push(0x2F);
        }
        let blocks = (plaintext.len() / 16) as u8;

        // DLL + short TPL header, cfg announces mode 5 and the block count.
        let acc = 0x2A;
        let cfg_lo = blocks << 4;
        let mut frame = vec![
            0x00, 0x44, 0x2D, 0x2C, 0x78, 0x56, 0x34, 0x12, 0x30, 0x04, 0x7A, acc, 0x00,
            cfg_lo, 0x05,
        ];
        let mut iv = [0u8; 16];
        iv[0] = 0x2D;
        iv[1] = 0x2C;
        iv[2..6].copy_from_slice(&[0x78, 0x56, 0x34, 0x12]);
        iv[6] = 0x30;
        iv[7] = 0x04;
        iv[8..16].fill(acc);
        aes_cbc_encrypt(key, &iv, &mut plaintext).unwrap();
        frame.extend_from_slice(&plaintext);
        frame[0] = (frame.len() - 1) as u8;
        frame
    }

    #[test]
    fn mode5_roundtrip_and_record_walk() {
        let records = hex::decode("03062C0000").unwrap();
        let frame = encrypted_mode5_telegram(&key(), &records);

        let mut t = Telegram::parse_header(&frame).unwrap();
        assert_eq!(t.security_mode(), SecurityMode::TplAesCbcIv);
        decrypt_telegram(&mut t, &MeterKeys::from_hex(KEY_HEX).unwrap()).unwrap();
        parse_records(&mut t).unwrap();

        let (_, v) = crate::records::extract_dv_double(&t.records, "0306").unwrap();
        assert_eq!(v, 44.0);
    }

    #[test]
    fn mode5_wrong_key_fails_marker_check() {
        let records = hex::decode("03062C0000").unwrap();
        let frame = encrypted_mode5_telegram(&key(), &records);

        let mut t = Telegram::parse_header(&frame).unwrap();
        let wrong = MeterKeys::from_hex("FF0102030405060708090A0B0C0D0EFF").unwrap();
        assert!(matches!(
            decrypt_telegram(&mut t, &wrong),
            Err(Error::DecryptionFailed(_))
        ));
    }

    #[test]
    fn unsupported_security_mode_is_rejected() {
        // Short TPL header announcing security mode 7.
        let mut frame = vec![
            0x00, 0x44, 0x2D, 0x2C, 0x78, 0x56, 0x34, 0x12, 0x30, 0x04, 0x7A, 0x01, 0x00,
            0x10, 0x07,
        ];
        frame.extend_from_slice(&[0u8; 16]);
        frame[0] = (frame.len() - 1) as u8;
        let mut t = Telegram::parse_header(&frame).unwrap();
        assert_eq!(t.security_mode(), SecurityMode::None);
        assert!(matches!(
            decrypt_telegram(&mut t, &MeterKeys::from_hex(KEY_HEX).unwrap()),
            Err(Error::SecurityModeNotSupported(7))
        ));
    }

    #[test]
    fn mode5_without_key_is_rejected() {
        let records = hex::decode("03062C0000").unwrap();
        let frame = encrypted_mode5_telegram(&key(), &records);
        let mut t = Telegram::parse_header(&frame).unwrap();
        assert!(matches!(
            decrypt_telegram(&mut t, &MeterKeys::default()),
            Err(Error::NoKey(_))
        ));
    }

    /// Build an ELL AES-CTR telegram (Kamstrup C1 style) around `records`.
    fn encrypted_ell_telegram(key: &[u8; 16], records: &[u8]) -> Vec<u8> {
        let sn: u32 = 0x00B0_05B4;
        let mut frame = vec![
            0x00, 0x44, 0x2D, 0x2C, 0x78, 0x56, 0x34, 0x12, 0x30, 0x04, 0x8D, 0x20, 0x91,
        ];
        frame.extend_from_slice(&sn.to_le_bytes());

        let mut plaintext = vec![0, 0, 0x78];
        plaintext.extend_from_slice(records);
        let crc = crc16_en13757(&plaintext[2..]);
        plaintext[0] = (crc & 0xFF) as u8;
        plaintext[1] = (crc >> 8) as u8;

        let mut iv = [0u8; 16];
        iv[0] = 0x2D;
        iv[1] = 0x2C;
        iv[2..6].copy_from_slice(&[0x78, 0x56, 0x34, 0x12]);
        iv[6] = 0x30;
        iv[7] = 0x04;
        iv[8] = 0x20;
        iv[9..13].copy_from_slice(&sn.to_le_bytes());
        aes_ctr_apply(key, &iv, &mut plaintext);

        frame.extend_from_slice(&plaintext);
        frame[0] = (frame.len() - 1) as u8;
        frame
    }

    #[test]
    fn ell_ctr_roundtrip_and_crc_check() {
        let records = hex::decode("03062C0000022D1300").unwrap();
        let frame = encrypted_ell_telegram(&key(), &records);

        let mut t = Telegram::parse_header(&frame).unwrap();
        assert_eq!(t.security_mode(), SecurityMode::EllAesCtr);
        decrypt_telegram(&mut t, &MeterKeys::from_hex(KEY_HEX).unwrap()).unwrap();
        parse_records(&mut t).unwrap();

        let (_, energy) = crate::records::extract_dv_double(&t.records, "0306").unwrap();
        assert_eq!(energy, 44.0);
        let (_, power) = crate::records::extract_dv_double(&t.records, "022D").unwrap();
        assert!((power - 1.9).abs() < 1e-9);
    }

    #[test]
    fn ell_wrong_key_fails_crc_check() {
        let records = hex::decode("03062C0000").unwrap();
        let frame = encrypted_ell_telegram(&key(), &records);
        let mut t = Telegram::parse_header(&frame).unwrap();
        let wrong = MeterKeys::from_hex("FF0102030405060708090A0B0C0D0EFF").unwrap();
        assert!(matches!(
            decrypt_telegram(&mut t, &wrong),
            Err(Error::DecryptionFailed(_))
        ));
    }

    #[test]
    fn explanation_offsets_stay_inside_frame_after_decrypt() {
        let records = hex::decode("03062C0000").unwrap();
        let frame = encrypted_mode5_telegram(&key(), &records);
        let mut t = Telegram::parse_header(&frame).unwrap();
        decrypt_telegram(&mut t, &MeterKeys::from_hex(KEY_HEX).unwrap()).unwrap();
        parse_records(&mut t).unwrap();
        for e in &t.explanations {
            assert!(e.offset < t.frame.len());
        }
    }
}
