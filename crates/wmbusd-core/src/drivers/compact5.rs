//! Techem Compact V heat meter.
//!
//! The radio payload is proprietary (CI 0xA2): no DIF/VIF records, just
//! fixed byte positions. Previous-period energy sits at payload offsets 3-4,
//! current-period at 7-8, both little-endian kWh counts.

use crate::error::Result;
use crate::meter::{FieldValue, LinkMode, MeterDriver, Print};
use crate::telegram::Telegram;

const PROPRIETARY_CI: u8 = 0xA2;
const PREV_OFFSET: usize = 3;
const CURR_OFFSET: usize = 7;

pub const LINK_MODES: &[LinkMode] = &[LinkMode::T1];

#[derive(Default)]
pub struct Compact5 {
    prev_energy_kwh: f64,
    curr_energy_kwh: f64,
    total_energy_kwh: f64,
}

impl Compact5 {
    pub fn new() -> Box<dyn MeterDriver> {
        Box::new(Self::default())
    }
}

impl MeterDriver for Compact5 {
    fn tag(&self) -> &'static str {
        "compact5"
    }

    fn process_content(&mut self, t: &mut Telegram) -> Result<()> {
        if t.ci != PROPRIETARY_CI {
            return Ok(());
        }
        if t.payload.len() < CURR_OFFSET + 2 {
            return Ok(());
        }
        let word = |off: usize| {
            f64::from(u16::from(t.payload[off]) | u16::from(t.payload[off + 1]) << 8)
        };
        self.prev_energy_kwh = word(PREV_OFFSET);
        self.curr_energy_kwh = word(CURR_OFFSET);
        self.total_energy_kwh = self.prev_energy_kwh + self.curr_energy_kwh;

        let base = t.header_size;
        t.add_explanation(base + PREV_OFFSET, 2, "previous period energy (kWh)");
        t.add_explanation(base + CURR_OFFSET, 2, "current period energy (kWh)");
        Ok(())
    }

    fn print_fields(&self) -> Vec<Print> {
        vec![
            Print {
                name: "prev_energy_kwh",
                quantity: "kWh",
                value: FieldValue::Double(self.prev_energy_kwh),
                in_fields: true,
                in_json: true,
            },
            Print {
                name: "curr_energy_kwh",
                quantity: "kWh",
                value: FieldValue::Double(self.curr_energy_kwh),
                in_fields: true,
                in_json: true,
            },
            Print {
                name: "total_energy_kwh",
                quantity: "kWh",
                value: FieldValue::Double(self.total_energy_kwh),
                in_fields: true,
                in_json: true,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Proprietary payload: prev=100 at offsets 3-4, curr=200 at 7-8.
    fn reference_telegram() -> Vec<u8> {
        let payload = [0x11u8, 0x22, 0x33, 0x64, 0x00, 0x55, 0x66, 0xC8, 0x00, 0x77];
        let mut frame =
            vec![0x00, 0x44, 0x68, 0x50, 0x01, 0x02, 0x03, 0x04, 0x45, 0x43, 0xA2];
        frame.extend_from_slice(&payload);
        frame[0] = (frame.len() - 1) as u8;
        frame
    }

    #[test]
    fn decodes_period_counters() {
        let frame = reference_telegram();
        let mut t = Telegram::parse_header(&frame).unwrap();

        let mut driver = Compact5::default();
        driver.process_content(&mut t).unwrap();

        assert_eq!(driver.prev_energy_kwh, 100.0);
        assert_eq!(driver.curr_energy_kwh, 200.0);
        assert_eq!(driver.total_energy_kwh, 300.0);
    }

    #[test]
    fn short_payload_leaves_state_untouched() {
        let mut frame =
            vec![0x00, 0x44, 0x68, 0x50, 0x01, 0x02, 0x03, 0x04, 0x45, 0x43, 0xA2, 0x01];
        frame[0] = (frame.len() - 1) as u8;
        let mut t = Telegram::parse_header(&frame).unwrap();
        let mut driver = Compact5::default();
        driver.process_content(&mut t).unwrap();
        assert_eq!(driver.total_energy_kwh, 0.0);
    }
}
