//! Meter driver contract and per-meter runtime state.
//!
//! A driver is a pure transformation of parsed records into typed scalar
//! state: no I/O, no allocation of sources, nothing but `process_content`
//! and the print schema. The [`Meter`] wraps one driver instance with its
//! configured addresses, keys and update bookkeeping.

use chrono::{DateTime, Local, Utc};
use serde::Serialize;

use crate::crypto::MeterKeys;
use crate::error::{Error, Result};
use crate::telegram::Telegram;

/// Radio profile a driver expects its telegrams on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Any,
    C1,
    T1,
    S1,
}

/// One rendered value of the print schema.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Double(f64),
    Uint(u64),
    Text(String),
}

impl FieldValue {
    /// Human-readable rendering; numeric quantities keep three decimals.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Double(v) if v.is_nan() => "null".to_string(),
            FieldValue::Double(v) => format!("{v:.3}"),
            FieldValue::Uint(v) => v.to_string(),
            FieldValue::Text(s) => s.clone(),
        }
    }
}

/// One entry of a driver's print schema.
#[derive(Debug, Clone, Serialize)]
pub struct Print {
    pub name: &'static str,
    pub quantity: &'static str,
    pub value: FieldValue,
    pub in_fields: bool,
    pub in_json: bool,
}

/// Contract every meter driver implements.
pub trait MeterDriver: Send {
    /// Driver tag as used in configuration, e.g. `"multical302"`.
    fn tag(&self) -> &'static str;

    /// Consume the parsed records of one telegram, updating typed state.
    /// A missing optional record leaves the previous value untouched.
    fn process_content(&mut self, t: &mut Telegram) -> Result<()>;

    /// Ordered print schema with current values.
    fn print_fields(&self) -> Vec<Print>;

    /// Space-separated status tokens; empty when no info codes are set.
    fn status(&self) -> String {
        String::new()
    }
}

/// Update timestamps handed to sinks alongside each reading.
#[derive(Debug, Clone, Serialize)]
pub struct Timestamps {
    pub timestamp_ut: i64,
    pub timestamp_utc: String,
    pub timestamp_lt: String,
}

/// One configured meter: driver instance plus addresses, keys and counters.
pub struct Meter {
    pub name: String,
    pub id_patterns: Vec<String>,
    pub keys: MeterKeys,
    pub link_modes: &'static [LinkMode],
    pub driver: Box<dyn MeterDriver>,
    pub num_updates: u64,
    last_update: Option<DateTime<Utc>>,
}

impl Meter {
    pub fn new(
        name: &str,
        driver: Box<dyn MeterDriver>,
        link_modes: &'static [LinkMode],
        id_patterns: Vec<String>,
        keys: MeterKeys,
    ) -> Result<Self> {
        for p in &id_patterns {
            if !id_pattern_valid(p) {
                return Err(Error::BadIdPattern(p.clone()));
            }
        }
        Ok(Self {
            name: name.to_string(),
            id_patterns,
            keys,
            link_modes,
            driver,
            num_updates: 0,
            last_update: None,
        })
    }

    /// Does any configured address pattern match this telegram id?
    pub fn matches_id(&self, id: &str) -> bool {
        self.id_patterns.iter().any(|p| match_id_pattern(p, id))
    }

    /// Run the driver over a decoded telegram and stamp the update.
    pub fn update(&mut self, t: &mut Telegram) -> Result<()> {
        self.driver.process_content(t)?;
        self.num_updates += 1;
        self.last_update = Some(Utc::now());
        Ok(())
    }

    pub fn timestamps(&self) -> Option<Timestamps> {
        let utc = self.last_update?;
        let lt: DateTime<Local> = utc.into();
        Some(Timestamps {
            timestamp_ut: utc.timestamp(),
            timestamp_utc: utc.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            timestamp_lt: lt.format("%Y-%m-%d %H:%M:%S").to_string(),
        })
    }
}

/// A pattern is `*` or eight nibbles, each a hex digit or the `*` wildcard.
pub fn id_pattern_valid(pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    pattern.len() == 8
        && pattern
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '*')
}

/// Match a telegram id ("12345678") against a configured pattern with
/// per-nibble wildcards.
pub fn match_id_pattern(pattern: &str, id: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern.len() != id.len() {
        return false;
    }
    pattern
        .chars()
        .zip(id.chars())
        .all(|(p, c)| p == '*' || p.eq_ignore_ascii_case(&c))
}

/// Render a bitfield through a per-driver token enumeration.
pub fn status_tokens(info_codes: u64, tokens: &[(u64, &str)]) -> String {
    let mut out = Vec::new();
    for (bit, name) in tokens {
        if info_codes & bit != 0 {
            out.push(*name);
        }
    }
    out.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_pattern_validation() {
        assert!(id_pattern_valid("*"));
        assert!(id_pattern_valid("12345678"));
        assert!(id_pattern_valid("1234567*"));
        assert!(id_pattern_valid("**34*678"));
        assert!(!id_pattern_valid("1234567"));
        assert!(!id_pattern_valid("123456789"));
        assert!(!id_pattern_valid("1234567g"));
    }

    #[test]
    fn id_pattern_matching() {
        assert!(match_id_pattern("*", "12345678"));
        assert!(match_id_pattern("12345678", "12345678"));
        assert!(match_id_pattern("1234567*", "12345670"));
        assert!(match_id_pattern("**345678", "ab345678"));
        assert!(!match_id_pattern("12345678", "12345679"));
        assert!(!match_id_pattern("1234567*", "22345678"));
    }

    #[test]
    fn status_token_rendering() {
        let tokens: &[(u64, &str)] = &[(0x01, "SENSOR"), (0x04, "SUPPLY")];
        assert_eq!(status_tokens(0, tokens), "");
        assert_eq!(status_tokens(0x05, tokens), "SENSOR SUPPLY");
        assert_eq!(status_tokens(0x02, tokens), "");
    }

    #[test]
    fn field_value_rendering() {
        assert_eq!(FieldValue::Double(44.0).render(), "44.000");
        assert_eq!(FieldValue::Double(f64::NAN).render(), "null");
        assert_eq!(FieldValue::Uint(7).render(), "7");
        assert_eq!(FieldValue::Text("ok".into()).render(), "ok");
    }
}
