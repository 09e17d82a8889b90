//! Application-layer record stream: the DIF/VIF walk.
//!
//! Each record is a DIF byte (data field width + function), optional DIFE
//! extensions (storage number / tariff / subunit), a VIF byte (quantity,
//! unit, decimal exponent; escape codes 0xFB/0xFD switch to the extended
//! tables, 0x7C/0xFC is a plain-text VIF), optional VIFE combinables, and a
//! payload whose length the DIF determines.
//!
//! Records land in a [`RecordMap`] keyed by the hex of the whole
//! DIF‖DIFEs‖VIF‖VIFEs chain. Drivers pull values out through the
//! `find_key` / `extract_dv_*` helpers.

use std::fmt;

use crate::error::{Error, Result};
use crate::telegram::Telegram;

/// Function field of the DIF (bits 4-5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementType {
    Instantaneous,
    Maximum,
    Minimum,
    AtError,
    /// Wildcard in lookups; never produced by the parser.
    Unknown,
}

impl MeasurementType {
    fn from_dif(dif: u8) -> Self {
        match (dif >> 4) & 0x03 {
            0 => Self::Instantaneous,
            1 => Self::Maximum,
            2 => Self::Minimum,
            _ => Self::AtError,
        }
    }
}

/// Which VIF table a code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VifTable {
    Primary,
    /// Escape 0xFB.
    Fb,
    /// Escape 0xFD.
    Fd,
}

/// A VIF code with its table, extension bit cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vif {
    pub table: VifTable,
    pub code: u8,
}

/// Physical quantity classification of a primary-table VIF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueInformation {
    EnergyWh,
    EnergyJ,
    Volume,
    Mass,
    OnTime,
    OperatingTime,
    PowerW,
    PowerJh,
    VolumeFlow,
    VolumeFlowExt,
    MassFlow,
    FlowTemperature,
    ReturnTemperature,
    TemperatureDifference,
    ExternalTemperature,
    Pressure,
    Date,
    DateTime,
    HeatCostAllocation,
    FabricationNo,
    EnhancedIdentification,
    PlainText,
    AnyVif,
    ManufacturerSpecific,
    Unknown,
}

/// Classify a VIF into its physical quantity.
pub fn value_information(vif: &Vif) -> ValueInformation {
    use ValueInformation::*;
    if vif.table != VifTable::Primary {
        return Unknown;
    }
    match vif.code & 0x7F {
        0x00..=0x07 => EnergyWh,
        0x08..=0x0F => EnergyJ,
        0x10..=0x17 => Volume,
        0x18..=0x1F => Mass,
        0x20..=0x23 => OnTime,
        0x24..=0x27 => OperatingTime,
        0x28..=0x2F => PowerW,
        0x30..=0x37 => PowerJh,
        0x38..=0x3F => VolumeFlow,
        0x40..=0x4F => VolumeFlowExt,
        0x50..=0x57 => MassFlow,
        0x58..=0x5B => FlowTemperature,
        0x5C..=0x5F => ReturnTemperature,
        0x60..=0x63 => TemperatureDifference,
        0x64..=0x67 => ExternalTemperature,
        0x68..=0x6B => Pressure,
        0x6C => Date,
        0x6D => DateTime,
        0x6E => HeatCostAllocation,
        0x78 => FabricationNo,
        0x79 => EnhancedIdentification,
        0x7C => PlainText,
        0x7E => AnyVif,
        0x7F => ManufacturerSpecific,
        _ => Unknown,
    }
}

/// Decimal exponent scaling a record's count into the quantity's display
/// unit: kWh, m³, m³/h, kg, kW, °C, K, bar.
fn scale_exponent(vif: &Vif) -> i32 {
    if vif.table != VifTable::Primary {
        return 0;
    }
    let c = vif.code & 0x7F;
    let n3 = i32::from(c & 0x07);
    let n2 = i32::from(c & 0x03);
    match c {
        0x00..=0x07 => n3 - 6, // kWh
        0x08..=0x0F => n3,     // J
        0x10..=0x17 => n3 - 6, // m³
        0x18..=0x1F => n3 - 3, // kg
        0x28..=0x2F => n3 - 6, // kW
        0x30..=0x37 => n3,     // J/h
        0x38..=0x3F => n3 - 6, // m³/h
        0x40..=0x47 => n3 - 7, // m³/h
        0x48..=0x4F => n3 - 9, // m³/h
        0x50..=0x57 => n3 - 3, // kg/h
        0x58..=0x6B => n2 - 3, // °C / K / bar
        _ => 0,
    }
}

/// One parsed data record, minus its position (kept in [`RecordEntry`]).
#[derive(Debug, Clone)]
pub struct DvEntry {
    pub measurement_type: MeasurementType,
    pub vif: Vif,
    pub storage_nr: u32,
    pub tariff: u32,
    pub subunit: u32,
    /// Data field nibble of the DIF; decides how `raw` decodes.
    pub data_field: u8,
    /// Payload bytes as on the (decrypted) wire.
    pub raw: Vec<u8>,
}

/// Record plus its DV-key and the offset of its payload in the frame.
#[derive(Debug, Clone)]
pub struct RecordEntry {
    pub key: String,
    pub offset: usize,
    pub entry: DvEntry,
}

/// Insertion-ordered record set with unique DV-keys.
#[derive(Default)]
pub struct RecordMap {
    entries: Vec<RecordEntry>,
}

impl RecordMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record. Telegrams can legitimately repeat a DV-key (Compact5
    /// sends two `0215` entries); the later record overwrites the earlier
    /// one, keeping its position. Last-writer-wins is observable behavior
    /// relied on by drivers.
    pub fn insert(&mut self, key: String, offset: usize, entry: DvEntry) {
        if let Some(existing) = self.entries.iter_mut().find(|r| r.key == key) {
            existing.offset = offset;
            existing.entry = entry;
        } else {
            self.entries.push(RecordEntry { key, offset, entry });
        }
    }

    pub fn get(&self, key: &str) -> Option<&RecordEntry> {
        self.entries.iter().find(|r| r.key == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecordEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Data length for a DIF data-field nibble; `None` means variable length.
fn data_field_len(nibble: u8) -> Option<usize> {
    match nibble {
        0x0 | 0x8 => Some(0),
        0x1 | 0x9 => Some(1),
        0x2 | 0xA => Some(2),
        0x3 | 0xB => Some(3),
        0x4 | 0x5 | 0xC => Some(4),
        0x6 | 0xE => Some(6),
        0x7 => Some(8),
        0xD => None,
        _ => Some(0),
    }
}

/// Walk the application-layer record stream of a decoded telegram.
///
/// Fills the telegram's record map and explanation trace. A malformed chain
/// aborts the walk: there is no unambiguous re-sync point inside a record,
/// so the rest of the telegram is dropped with a single error.
pub fn parse_records(t: &mut Telegram) -> Result<()> {
    let payload = std::mem::take(&mut t.payload);
    let base = t.header_size;
    let res = walk(t, &payload, base);
    t.payload = payload;
    res
}

fn walk(t: &mut Telegram, p: &[u8], base: usize) -> Result<()> {
    let mut i = 0usize;
    while i < p.len() {
        let start = i;
        let dif = p[i];
        i += 1;

        // Idle filler between records.
        if dif == 0x2F {
            t.add_explanation_hex(base + start, "2F".into(), "filler");
            continue;
        }
        // Manufacturer data: everything to the end of the telegram.
        if dif == 0x0F || dif == 0x1F {
            let raw = p[i..].to_vec();
            t.add_explanation_hex(
                base + start,
                hex::encode_upper(&p[start..]),
                "manufacturer data",
            );
            t.records.insert(
                hex::encode_upper([dif]),
                base + i,
                DvEntry {
                    measurement_type: MeasurementType::Instantaneous,
                    vif: Vif { table: VifTable::Primary, code: 0x7F },
                    storage_nr: 0,
                    tariff: 0,
                    subunit: 0,
                    data_field: dif & 0x0F,
                    raw,
                },
            );
            break;
        }

        let mut key_bytes = vec![dif];
        let measurement_type = MeasurementType::from_dif(dif);
        let mut storage_nr = u32::from((dif >> 6) & 0x01);
        let mut tariff = 0u32;
        let mut subunit = 0u32;

        // DIFE chain: 4 storage bits, 2 tariff bits, 1 subunit bit per DIFE.
        let mut ext = dif & 0x80 != 0;
        let mut j = 0u32;
        while ext {
            if i >= p.len() || j >= 10 {
                return malformed(t, base + start);
            }
            let dife = p[i];
            i += 1;
            key_bytes.push(dife);
            storage_nr |= u32::from(dife & 0x0F) << (1 + 4 * j);
            tariff |= u32::from((dife >> 4) & 0x03) << (2 * j);
            subunit |= u32::from((dife >> 6) & 0x01) << j;
            ext = dife & 0x80 != 0;
            j += 1;
        }

        if i >= p.len() {
            return malformed(t, base + start);
        }
        let vif_byte = p[i];
        i += 1;
        key_bytes.push(vif_byte);

        let vif;
        let mut ext = match vif_byte {
            0xFB | 0xFD => {
                if i >= p.len() {
                    return malformed(t, base + start);
                }
                let table = if vif_byte == 0xFB { VifTable::Fb } else { VifTable::Fd };
                let b = p[i];
                i += 1;
                key_bytes.push(b);
                vif = Vif { table, code: b & 0x7F };
                b & 0x80 != 0
            }
            _ => {
                vif = Vif { table: VifTable::Primary, code: vif_byte & 0x7F };
                vif_byte & 0x80 != 0
            }
        };

        // Plain-text VIF: a length byte and ASCII unit string belong to the
        // DIF/VIF chain, not the data.
        if vif.table == VifTable::Primary && vif.code == 0x7C {
            if i >= p.len() {
                return malformed(t, base + start);
            }
            let n = p[i] as usize;
            i += 1;
            key_bytes.push(n as u8);
            if i + n > p.len() {
                return malformed(t, base + start);
            }
            key_bytes.extend_from_slice(&p[i..i + n]);
            i += n;
        }

        let mut k = 0u32;
        while ext {
            if i >= p.len() || k >= 10 {
                return malformed(t, base + start);
            }
            let vife = p[i];
            i += 1;
            key_bytes.push(vife);
            ext = vife & 0x80 != 0;
            k += 1;
        }

        let data_field = dif & 0x0F;
        let len = match data_field_len(data_field) {
            Some(n) => n,
            None => {
                // Variable length: LVAR byte precedes the data.
                if i >= p.len() {
                    return malformed(t, base + start);
                }
                let n = p[i] as usize;
                i += 1;
                n
            }
        };
        if i + len > p.len() {
            return malformed(t, base + start);
        }
        let data_start = i;
        let raw = p[i..i + len].to_vec();
        i += len;

        t.add_explanation_hex(
            base + start,
            hex::encode_upper(&p[start..data_start]),
            "",
        );
        if len > 0 {
            t.add_explanation_hex(base + data_start, hex::encode_upper(&raw), "");
        }
        t.records.insert(
            hex::encode_upper(&key_bytes),
            base + data_start,
            DvEntry {
                measurement_type,
                vif,
                storage_nr,
                tariff,
                subunit,
                data_field,
                raw,
            },
        );
    }
    Ok(())
}

fn malformed(t: &mut Telegram, offset: usize) -> Result<()> {
    t.add_explanation_hex(offset, String::new(), "malformed record");
    Err(Error::MalformedRecords(offset))
}

// ---------------------------------------------------------------------------
// Driver-facing lookups
// ---------------------------------------------------------------------------

/// Linear search for the first record matching the given criteria.
/// `MeasurementType::Unknown` and `None` act as wildcards.
pub fn find_key(
    map: &RecordMap,
    mtype: MeasurementType,
    vi: ValueInformation,
    storage_nr: Option<u32>,
    tariff: Option<u32>,
) -> Option<String> {
    for r in map.iter() {
        let e = &r.entry;
        if mtype != MeasurementType::Unknown && e.measurement_type != mtype {
            continue;
        }
        if value_information(&e.vif) != vi {
            continue;
        }
        if let Some(s) = storage_nr {
            if e.storage_nr != s {
                continue;
            }
        }
        if let Some(tr) = tariff {
            if e.tariff != tr {
                continue;
            }
        }
        return Some(r.key.clone());
    }
    None
}

fn le_uint(raw: &[u8]) -> u64 {
    let mut v = 0u64;
    for (i, &b) in raw.iter().take(8).enumerate() {
        v |= u64::from(b) << (8 * i);
    }
    v
}

/// Decode little-endian BCD. The top nibble 0xF of the most significant
/// byte marks a negative value; any other nibble above 9 poisons the
/// record to NaN.
fn bcd_to_double(raw: &[u8]) -> f64 {
    let mut v = 0f64;
    let mut negative = false;
    for (i, &b) in raw.iter().enumerate().rev() {
        let hi = b >> 4;
        let lo = b & 0x0F;
        if i == raw.len() - 1 && hi == 0x0F {
            negative = true;
        } else {
            if hi > 9 {
                return f64::NAN;
            }
            v = v * 10.0 + f64::from(hi);
        }
        if lo > 9 {
            return f64::NAN;
        }
        v = v * 10.0 + f64::from(lo);
    }
    if negative { -v } else { v }
}

/// Little-endian unsigned integer of the record payload.
pub fn extract_dv_uint(map: &RecordMap, key: &str) -> Option<(usize, u64)> {
    let r = map.get(key)?;
    Some((r.offset, le_uint(&r.entry.raw)))
}

/// Numeric value of the record, BCD or binary per the DIF, scaled by the
/// VIF's decimal exponent into the quantity's display unit.
pub fn extract_dv_double(map: &RecordMap, key: &str) -> Option<(usize, f64)> {
    let r = map.get(key)?;
    let e = &r.entry;
    let count = match e.data_field {
        0x1..=0x4 | 0x6 | 0x7 => le_uint(&e.raw) as f64,
        0x5 => {
            if e.raw.len() < 4 {
                return None;
            }
            f64::from(f32::from_le_bytes([e.raw[0], e.raw[1], e.raw[2], e.raw[3]]))
        }
        0x9 | 0xA | 0xB | 0xC | 0xE => bcd_to_double(&e.raw),
        _ => return None,
    };
    Some((r.offset, count * 10f64.powi(scale_exponent(&e.vif))))
}

/// Broken-down date from a type G (2 byte) or type F (4 byte) record.
pub fn extract_dv_date(map: &RecordMap, key: &str) -> Option<(usize, DvDate)> {
    let r = map.get(key)?;
    let raw = &r.entry.raw;
    let date = match raw.len() {
        2 => DvDate::from_type_g([raw[0], raw[1]]),
        4 => DvDate::from_type_f([raw[0], raw[1], raw[2], raw[3]]),
        _ => return None,
    };
    Some((r.offset, date))
}

/// Broken-down date decoded from the M-Bus type G/F encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DvDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    /// False for type G records; the Display still prints 00:00.
    pub has_time: bool,
}

impl DvDate {
    /// Type G: `day(5) year-low(3) | month(4) year-high(4)`.
    pub fn from_type_g(b: [u8; 2]) -> Self {
        let year = 2000 + i32::from((b[0] & 0xE0) >> 5 | (b[1] & 0xF0) >> 1);
        Self {
            year,
            month: u32::from(b[1] & 0x0F),
            day: u32::from(b[0] & 0x1F),
            hour: 0,
            minute: 0,
            has_time: false,
        }
    }

    /// Type F: minute, hour, then a type G date in the last two bytes.
    pub fn from_type_f(b: [u8; 4]) -> Self {
        let mut d = Self::from_type_g([b[2], b[3]]);
        d.minute = u32::from(b[0] & 0x3F);
        d.hour = u32::from(b[1] & 0x1F);
        d.has_time = true;
        d
    }

    pub fn to_naive(&self) -> Option<chrono::NaiveDateTime> {
        chrono::NaiveDate::from_ymd_opt(self.year, self.month, self.day)?
            .and_hms_opt(self.hour, self.minute, 0)
    }
}

impl fmt::Display for DvDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute
        )
    }
}

// ---------------------------------------------------------------------------
// Telegram-level convenience wrappers
// ---------------------------------------------------------------------------

impl Telegram {
    pub fn find_key(
        &self,
        mtype: MeasurementType,
        vi: ValueInformation,
        storage_nr: Option<u32>,
        tariff: Option<u32>,
    ) -> Option<String> {
        find_key(&self.records, mtype, vi, storage_nr, tariff)
    }

    pub fn extract_dv_uint(&self, key: &str) -> Option<(usize, u64)> {
        extract_dv_uint(&self.records, key)
    }

    pub fn extract_dv_double(&mut self, key: &str) -> Option<(usize, f64)> {
        let r = extract_dv_double(&self.records, key);
        if let Some((offset, v)) = r {
            if v.is_nan() {
                self.annotate(offset, "bad bcd digit");
            }
        }
        r
    }

    pub fn extract_dv_date(&self, key: &str) -> Option<(usize, DvDate)> {
        extract_dv_date(&self.records, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Wrap an application payload in a minimal unencrypted telegram
    /// (KAM multical302-style DLL header, CI 0x78).
    fn telegram_with(payload: &[u8]) -> Telegram {
        let mut frame = vec![0x00, 0x44, 0x2D, 0x2C, 0x78, 0x56, 0x34, 0x12, 0x30, 0x04, 0x78];
        frame.extend_from_slice(payload);
        frame[0] = (frame.len() - 1) as u8;
        let mut t = Telegram::parse_header(&frame).unwrap();
        parse_records(&mut t).unwrap();
        t
    }

    // -----------------------------------------------------------------------
    // Record walk
    // -----------------------------------------------------------------------

    #[test]
    fn walks_multical302_style_payload() {
        let payload = hex::decode(
            "03062C000043060000000314630000426C7F2A022D130001FF2100",
        )
        .unwrap();
        let t = telegram_with(&payload);

        assert_eq!(t.records.len(), 6);
        let keys: Vec<&str> = t.records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["0306", "4306", "0314", "426C", "022D", "01FF21"]);

        let e = &t.records.get("4306").unwrap().entry;
        assert_eq!(e.storage_nr, 1);
        assert_eq!(e.measurement_type, MeasurementType::Instantaneous);

        // Every record offset points inside the original frame.
        for r in t.records.iter() {
            assert!(r.offset < t.frame.len());
        }
    }

    #[test]
    fn extracts_scaled_doubles() {
        let payload = hex::decode(
            "03062C000043060000000314630000426C7F2A022D130001FF2100",
        )
        .unwrap();
        let mut t = telegram_with(&payload);

        let (_, energy) = t.extract_dv_double("0306").unwrap();
        assert_eq!(energy, 44.0);
        let (_, target) = t.extract_dv_double("4306").unwrap();
        assert_eq!(target, 0.0);
        let (_, volume) = t.extract_dv_double("0314").unwrap();
        assert!((volume - 0.99).abs() < 1e-9);
        let (_, power) = t.extract_dv_double("022D").unwrap();
        assert!((power - 1.9).abs() < 1e-9);
    }

    #[test]
    fn extracts_type_g_date() {
        let payload = hex::decode("426C7F2A").unwrap();
        let t = telegram_with(&payload);
        let (_, date) = t.extract_dv_date("426C").unwrap();
        assert_eq!((date.year, date.month, date.day), (2019, 10, 31));
        assert_eq!(date.to_string(), "2019-10-31 00:00");
    }

    #[test]
    fn extracts_type_f_datetime() {
        // 13:37 on 2019-10-31.
        let payload = vec![0x04, 0x6D, 37, 13, 0x7F, 0x2A];
        let t = telegram_with(&payload);
        let (_, date) = t.extract_dv_date("046D").unwrap();
        assert!(date.has_time);
        assert_eq!(date.to_string(), "2019-10-31 13:37");
    }

    #[test]
    fn duplicate_dv_key_last_writer_wins() {
        // Two 0215 records (flow temp, 16-bit): the second value sticks.
        let payload = hex::decode("02155A0002159A01").unwrap();
        let t = telegram_with(&payload);
        assert_eq!(t.records.len(), 1);
        let (_, v) = extract_dv_double(&t.records, "0215").unwrap();
        // 0x019A = 410, VIF 0x15 scales by 10^-1 into m³.
        assert!((v - 41.0).abs() < 1e-9);
    }

    #[test]
    fn dife_accumulates_storage_tariff_subunit() {
        // DIF 0x84 (32-bit, ext), DIFE 0x5A: storage 0xA<<1, tariff 1, subunit 1.
        let payload = hex::decode("845A0601000000").unwrap();
        let t = telegram_with(&payload);
        let r = t.records.iter().next().unwrap();
        assert_eq!(r.key, "845A06");
        assert_eq!(r.entry.storage_nr, 0xA << 1);
        assert_eq!(r.entry.tariff, 1);
        assert_eq!(r.entry.subunit, 1);
    }

    #[test]
    fn bcd_decoding_and_nan_policy() {
        // BCD8 0x0C: 12345678 stored little-endian.
        let payload = hex::decode("0C0678563412").unwrap();
        let mut t = telegram_with(&payload);
        let (_, v) = t.extract_dv_double("0C06").unwrap();
        assert_eq!(v, 12345678.0);

        // Nibble 0xB in a BCD digit poisons the record.
        let payload = hex::decode("0C067856B412").unwrap();
        let mut t = telegram_with(&payload);
        let (_, v) = t.extract_dv_double("0C06").unwrap();
        assert!(v.is_nan());

        // Top nibble 0xF flags a negative value; VIF 0x14 scales by 10^-2.
        let payload = hex::decode("0A1445F3").unwrap();
        let mut t = telegram_with(&payload);
        let (_, v) = t.extract_dv_double("0A14").unwrap();
        assert!((v - -3.45).abs() < 1e-9);
    }

    #[test]
    fn lvar_record_length_comes_from_stream() {
        // DIF 0x0D (variable), VIF 0x78 (fabrication no), LVAR 3.
        let payload = hex::decode("0D7803414243").unwrap();
        let t = telegram_with(&payload);
        let r = t.records.get("0D78").unwrap();
        assert_eq!(r.entry.raw, b"ABC");
    }

    #[test]
    fn filler_and_manufacturer_data() {
        let payload = hex::decode("2F2F0F0102030405").unwrap();
        let t = telegram_with(&payload);
        let r = t.records.get("0F").unwrap();
        assert_eq!(r.entry.raw, vec![0x01, 0x02, 0x03, 0x04, 0x05]);
    }

    #[test]
    fn truncated_record_aborts_walk() {
        let frame_payload = hex::decode("03062C").unwrap();
        let mut frame =
            vec![0x00, 0x44, 0x2D, 0x2C, 0x78, 0x56, 0x34, 0x12, 0x30, 0x04, 0x78];
        frame.extend_from_slice(&frame_payload);
        frame[0] = (frame.len() - 1) as u8;
        let mut t = Telegram::parse_header(&frame).unwrap();
        assert!(matches!(
            parse_records(&mut t),
            Err(Error::MalformedRecords(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    #[test]
    fn find_key_with_wildcards() {
        let payload = hex::decode(
            "03062C000043060000000314630000426C7F2A022D130001FF2100",
        )
        .unwrap();
        let t = telegram_with(&payload);

        let k = t
            .find_key(
                MeasurementType::Instantaneous,
                ValueInformation::EnergyWh,
                Some(0),
                None,
            )
            .unwrap();
        assert_eq!(k, "0306");

        let k = t
            .find_key(
                MeasurementType::Unknown,
                ValueInformation::EnergyWh,
                Some(1),
                None,
            )
            .unwrap();
        assert_eq!(k, "4306");

        assert!(t
            .find_key(
                MeasurementType::Maximum,
                ValueInformation::EnergyWh,
                None,
                None
            )
            .is_none());
    }

    #[test]
    fn uint_extraction_is_little_endian() {
        let payload = hex::decode("04FF07D2040000").unwrap();
        let t = telegram_with(&payload);
        let (_, v) = t.extract_dv_uint("04FF07").unwrap();
        assert_eq!(v, 1234);
    }
}
