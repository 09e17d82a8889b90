//! Kamstrup Multical 603 heat meter.
//!
//! Vendor extension records `04FF07`/`04FF08` ("energy forward/returned")
//! have undocumented units; they are surfaced as raw counts, no scaling.

use crate::error::Result;
use crate::meter::{status_tokens, FieldValue, LinkMode, MeterDriver, Print};
use crate::records::{MeasurementType, ValueInformation};
use crate::telegram::Telegram;

const KEY_INFO_CODES: &str = "04FF22";
const KEY_ENERGY_FORWARD: &str = "04FF07";
const KEY_ENERGY_RETURNED: &str = "04FF08";

const INFO_TOKENS: &[(u64, &str)] = &[
    (0x01, "VOLTAGE_INTERRUPTED"),
    (0x02, "SENSOR_T1"),
    (0x04, "SENSOR_T2"),
    (0x08, "FLOW_SENSOR_V1"),
    (0x10, "SUPPLY_VOLTAGE"),
];

pub const LINK_MODES: &[LinkMode] = &[LinkMode::C1];

#[derive(Default)]
pub struct Multical603 {
    total_energy_kwh: f64,
    total_volume_m3: f64,
    volume_flow_m3h: f64,
    t1_temperature_c: f64,
    t2_temperature_c: f64,
    energy_forward_kwh: u64,
    energy_returned_kwh: u64,
    info_codes: u64,
}

impl Multical603 {
    pub fn new() -> Box<dyn MeterDriver> {
        Box::new(Self::default())
    }
}

impl MeterDriver for Multical603 {
    fn tag(&self) -> &'static str {
        "multical603"
    }

    fn process_content(&mut self, t: &mut Telegram) -> Result<()> {
        let pull = |t: &mut Telegram,
                        vi: ValueInformation,
                        info: &'static str|
         -> Option<f64> {
            let key = t.find_key(MeasurementType::Instantaneous, vi, Some(0), None)?;
            let (offset, v) = t.extract_dv_double(&key)?;
            t.annotate(offset, info);
            Some(v)
        };

        if let Some(v) = pull(t, ValueInformation::EnergyWh, "total energy consumption (kWh)")
        {
            self.total_energy_kwh = v;
        }
        if let Some(v) = pull(t, ValueInformation::Volume, "total volume (m3)") {
            self.total_volume_m3 = v;
        }
        if let Some(v) = pull(t, ValueInformation::VolumeFlow, "volume flow (m3/h)") {
            self.volume_flow_m3h = v;
        }
        if let Some(v) = pull(t, ValueInformation::FlowTemperature, "t1 flow temperature (c)")
        {
            self.t1_temperature_c = v;
        }
        if let Some(v) =
            pull(t, ValueInformation::ReturnTemperature, "t2 return temperature (c)")
        {
            self.t2_temperature_c = v;
        }

        if let Some((offset, v)) = t.extract_dv_uint(KEY_ENERGY_FORWARD) {
            self.energy_forward_kwh = v;
            t.annotate(offset, "energy forward (raw count)");
        }
        if let Some((offset, v)) = t.extract_dv_uint(KEY_ENERGY_RETURNED) {
            self.energy_returned_kwh = v;
            t.annotate(offset, "energy returned (raw count)");
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
                name: "total_volume_m3",
                quantity: "m3",
                value: FieldValue::Double(self.total_volume_m3),
                in_fields: true,
                in_json: true,
            },
            Print {
                name: "volume_flow_m3h",
                quantity: "m3/h",
                value: FieldValue::Double(self.volume_flow_m3h),
                in_fields: true,
                in_json: true,
            },
            Print {
                name: "t1_temperature_c",
                quantity: "c",
                value: FieldValue::Double(self.t1_temperature_c),
                in_fields: true,
                in_json: true,
            },
            Print {
                name: "t2_temperature_c",
                quantity: "c",
                value: FieldValue::Double(self.t2_temperature_c),
                in_fields: true,
                in_json: true,
            },
            Print {
                name: "energy_forward_kwh",
                quantity: "",
                value: FieldValue::Uint(self.energy_forward_kwh),
                in_fields: false,
                in_json: true,
            },
            Print {
                name: "energy_returned_kwh",
                quantity: "",
                value: FieldValue::Uint(self.energy_returned_kwh),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::parse_records;

    /// Unencrypted full-frame telegram: energy, volume, flow, t1/t2,
    /// vendor forward/returned counts, info codes.
    fn reference_telegram() -> Vec<u8> {
        let records = hex::decode(
            "0406A50000000414210200000\
             43B120000000259D014025D000904FF07150000\
             0004FF080A00000004FF2200000000",
        )
        .unwrap();
        let mut frame =
            vec![0x00, 0x44, 0x2D, 0x2C, 0x66, 0x77, 0x88, 0x99, 0x35, 0x04, 0x78];
        frame.extend_from_slice(&records);
        frame[0] = (frame.len() - 1) as u8;
        frame
    }

    #[test]
    fn decodes_reference_telegram() {
        let frame = reference_telegram();
        let mut t = Telegram::parse_header(&frame).unwrap();
        parse_records(&mut t).unwrap();

        let mut driver = Multical603::default();
        driver.process_content(&mut t).unwrap();

        assert_eq!(driver.total_energy_kwh, 165.0);
        assert!((driver.total_volume_m3 - 5.45).abs() < 1e-9);
        assert!((driver.volume_flow_m3h - 0.018).abs() < 1e-9);
        assert!((driver.t1_temperature_c - 53.28).abs() < 1e-9);
        assert!((driver.t2_temperature_c - 23.04).abs() < 1e-9);
        assert_eq!(driver.energy_forward_kwh, 21);
        assert_eq!(driver.energy_returned_kwh, 10);
        assert_eq!(driver.info_codes, 0);
        assert_eq!(driver.status(), "");
    }

    #[test]
    fn info_codes_render_as_tokens() {
        let mut driver = Multical603 {
            info_codes: 0x0A,
            ..Default::default()
        };
        assert_eq!(driver.status(), "SENSOR_T1 FLOW_SENSOR_V1");
        driver.info_codes = 0;
        assert_eq!(driver.status(), "");
    }
}
