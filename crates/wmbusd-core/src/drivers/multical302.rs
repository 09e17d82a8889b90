//! Kamstrup Multical 302 heat meter (compact C1 radio, ELL AES-CTR).

use crate::error::Result;
use crate::meter::{status_tokens, FieldValue, LinkMode, MeterDriver, Print};
use crate::records::{DvDate, MeasurementType, ValueInformation};
use crate::telegram::Telegram;

/// Vendor info-code record, manufacturer specific VIF chain.
const KEY_INFO_CODES: &str = "01FF21";

const INFO_TOKENS: &[(u64, &str)] = &[
    (0x01, "SENSOR_T1"),
    (0x02, "SENSOR_T2"),
    (0x04, "FLOW_SENSOR"),
    (0x08, "SUPPLY_VOLTAGE"),
];

pub const LINK_MODES: &[LinkMode] = &[LinkMode::C1];

#[derive(Default)]
pub struct Multical302 {
    total_energy_kwh: f64,
    target_energy_kwh: f64,
    total_volume_m3: f64,
    current_power_kw: f64,
    target_date: Option<DvDate>,
    info_codes: u64,
}

impl Multical302 {
    pub fn new() -> Box<dyn MeterDriver> {
        Box::new(Self::default())
    }
}

impl MeterDriver for Multical302 {
    fn tag(&self) -> &'static str {
        "multical302"
    }

    fn process_content(&mut self, t: &mut Telegram) -> Result<()> {
        if let Some(key) = t.find_key(
            MeasurementType::Instantaneous,
            ValueInformation::EnergyWh,
            Some(0),
            None,
        ) {
            if let Some((offset, v)) = t.extract_dv_double(&key) {
                self.total_energy_kwh = v;
                t.annotate(offset, "total energy consumption (kWh)");
            }
        }
        if let Some(key) = t.find_key(
            MeasurementType::Instantaneous,
            ValueInformation::EnergyWh,
            Some(1),
            None,
        ) {
            if let Some((offset, v)) = t.extract_dv_double(&key) {
                self.target_energy_kwh = v;
                t.annotate(offset, "energy at target date (kWh)");
            }
        }
        if let Some(key) = t.find_key(
            MeasurementType::Instantaneous,
            ValueInformation::Volume,
            Some(0),
            None,
        ) {
            if let Some((offset, v)) = t.extract_dv_double(&key) {
                self.total_volume_m3 = v;
                t.annotate(offset, "total volume (m3)");
            }
        }
        if let Some(key) = t.find_key(
            MeasurementType::Instantaneous,
            ValueInformation::PowerW,
            Some(0),
            None,
        ) {
            if let Some((offset, v)) = t.extract_dv_double(&key) {
                self.current_power_kw = v;
                t.annotate(offset, "current power consumption (kW)");
            }
        }
        if let Some(key) = t.find_key(
            MeasurementType::Instantaneous,
            ValueInformation::Date,
            Some(1),
            None,
        ) {
            if let Some((offset, d)) = t.extract_dv_date(&key) {
                self.target_date = Some(d);
                t.annotate(offset, "target date");
            }
        }
        if let Some((offset, v)) = t.extract_dv_uint(KEY_INFO_CODES) {
            self.info_codes = v;
            t.annotate(offset, "info codes");
        }
        Ok(())
    }

    fn print_fields(&self) -> Vec<Print> {
        vec![
            Print {
                name: "total_energy_kwh",
                quantity: "kWh",
                value: FieldValue::Double(self.total_energy_kwh),
                in_fields: true,
                in_json: true,
            },
            Print {
                name: "target_energy_kwh",
                quantity: "kWh",
                value: FieldValue::Double(self.target_energy_kwh),
                in_fields: true,
                in_json: true,
            },
            Print {
                name: "total_volume_m3",
                quantity: "m3",
                value: FieldValue::Double(self.total_volume_m3),
                in_fields: true,
                in_json: true,
            },
            Print {
                name: "current_power_kw",
                quantity: "kW",
                value: FieldValue::Double(self.current_power_kw),
                in_fields: true,
                in_json: true,
            },
            Print {
                name: "target_date",
                quantity: "",
                value: FieldValue::Text(
                    self.target_date.map(|d| d.to_string()).unwrap_or_default(),
                ),
                in_fields: false,
                in_json: true,
            },
            Print {
                name: "status",
                quantity: "",
                value: FieldValue::Text(self.status()),
                in_fields: true,
                in_json: true,
            },
        ]
    }

    fn status(&self) -> String {
        status_tokens(self.info_codes, INFO_TOKENS)
    }
}
