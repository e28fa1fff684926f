//! C5: the declarative register schema — attribute name to registers,
//! pre-conversion, optional post-conversion, and writable range.

use std::collections::HashMap;

use chrono::NaiveDate;

use crate::error::{GivEnergyError, Result};
use crate::register::{Register, RegisterCache};

/// First-stage conversion applied to the raw 16-bit register words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreConv {
    /// Single register, unsigned.
    Uint16,
    /// Single register, two's-complement signed.
    Int16,
    /// Two registers, `(hi << 16) | lo`.
    Uint32,
    /// High byte of a single register (`duint8[0]`).
    DUint8High,
    /// Low byte of a single register (`duint8[1]`).
    DUint8Low,
    /// Non-zero is true.
    Bool,
    /// Contiguous inclusive bit slice `[lo..hi]` of a single register.
    Bitfield(u8, u8),
    /// Two registers, each packed `HHMM`.
    Timeslot,
    /// Six registers: year-2000, month, day, hour, minute, second.
    Datetime,
    /// Two registers: dsp then arm firmware version, formatted `D0.A-A0`.
    FirmwareVersion,
    /// Four registers forming a dotted gateway version string.
    GatewayVersion,
    /// Scale by 10^-3.
    Milli,
    /// Scale by 10^-2.
    Centi,
    /// Scale by 10^-1.
    Deci,
    /// Render as a fixed-width hex string.
    Hex,
    /// Concatenate registers as big-endian byte pairs, latin-1, NUL-
    /// stripped, uppercased.
    StringType,
}

/// Second-stage conversion applied to the pre-converted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostConv {
    None,
    BatteryPowerMode,
    BatteryPauseMode,
    Generation,
    InverterMaxPower,
}

/// The outcome of applying `pre_conv` (and optionally `post_conv`) to a
/// register's raw value(s).
#[derive(Debug, Clone, PartialEq)]
pub enum ConvValue {
    UInt(u64),
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    TimeSlot { start: u16, end: u16 },
    DateTime(chrono::NaiveDateTime),
}

impl ConvValue {
    fn as_u64(&self) -> Option<u64> {
        match self {
            ConvValue::UInt(v) => Some(*v),
            ConvValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }
}

/// One entry in the register lookup table: which registers back this
/// attribute, how to convert them, and (if writable) the valid range.
#[derive(Debug, Clone)]
pub struct RegisterSchemaEntry {
    pub registers: Vec<Register>,
    pub pre_conv: PreConv,
    pub post_conv: PostConv,
    /// Presence marks the attribute writable. `max == 2359` means the raw
    /// value is an `HHMM` pair and the minute part must additionally be
    /// `< 60`.
    pub valid: Option<(i64, i64)>,
}

impl RegisterSchemaEntry {
    pub fn new(registers: Vec<Register>, pre_conv: PreConv) -> Self {
        Self { registers, pre_conv, post_conv: PostConv::None, valid: None }
    }

    pub fn with_post_conv(mut self, post_conv: PostConv) -> Self {
        self.post_conv = post_conv;
        self
    }

    pub fn with_valid(mut self, min: i64, max: i64) -> Self {
        self.valid = Some((min, max));
        self
    }

    pub fn is_writable(&self) -> bool {
        self.valid.is_some()
    }
}

/// A named collection of [`RegisterSchemaEntry`]s for one device class.
#[derive(Debug, Clone, Default)]
pub struct RegisterSchema {
    entries: HashMap<&'static str, RegisterSchemaEntry>,
}

impl RegisterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &'static str, entry: RegisterSchemaEntry) {
        self.entries.insert(name, entry);
    }

    pub fn entry(&self, name: &str) -> Option<&RegisterSchemaEntry> {
        self.entries.get(name)
    }

    /// Attribute lookup: fetch registers, apply pre/post conversion.
    /// Returns `Ok(None)` when any backing register is absent.
    pub fn get(&self, name: &str, cache: &RegisterCache) -> Result<Option<ConvValue>> {
        let entry = self
            .entry(name)
            .ok_or_else(|| GivEnergyError::protocol(format!("unknown attribute {name}")))?;

        let mut raw = Vec::with_capacity(entry.registers.len());
        for &register in &entry.registers {
            match cache.get(register) {
                Some(v) => raw.push(v),
                None => return Ok(None),
            }
        }

        let pre = apply_pre_conv(entry.pre_conv, &raw)
            .map_err(|e| GivEnergyError::conversion(name, e))?;
        let value = apply_post_conv(entry.post_conv, pre);
        Ok(Some(value))
    }

    /// Resolves `(name, value)` to the single register to write, enforcing
    /// the schema's validity range (including the `HHMM` minute check).
    pub fn resolve_write(&self, name: &str, value: i64) -> Result<Register> {
        let entry = self
            .entry(name)
            .ok_or_else(|| GivEnergyError::validation(format!("unknown attribute {name}")))?;

        let Some((min, max)) = entry.valid else {
            return Err(GivEnergyError::validation(format!("{name} is not writable")));
        };

        if entry.registers.len() != 1 {
            return Err(GivEnergyError::validation(format!(
                "{name} does not map to a single register"
            )));
        }

        if value < min || value > max {
            return Err(GivEnergyError::validation(format!("{value} out of range for {name}")));
        }

        if max == 2359 {
            let minute = value % 100;
            if !(0..=59).contains(&minute) {
                return Err(GivEnergyError::validation(format!(
                    "{value} is not a valid HHMM time for {name}"
                )));
            }
        }

        Ok(entry.registers[0])
    }
}

fn apply_pre_conv(conv: PreConv, raw: &[u16]) -> std::result::Result<ConvValue, String> {
    match conv {
        PreConv::Uint16 => Ok(ConvValue::UInt(raw[0] as u64)),
        PreConv::Int16 => Ok(ConvValue::Int(raw[0] as i16 as i64)),
        PreConv::Uint32 => Ok(ConvValue::UInt(((raw[0] as u32) << 16 | raw[1] as u32) as u64)),
        PreConv::DUint8High => Ok(ConvValue::UInt((raw[0] >> 8) as u64)),
        PreConv::DUint8Low => Ok(ConvValue::UInt((raw[0] & 0xFF) as u64)),
        PreConv::Bool => Ok(ConvValue::Bool(raw[0] != 0)),
        PreConv::Bitfield(lo, hi) => {
            if hi < lo || hi > 15 {
                return Err(format!("invalid bitfield range {lo}..{hi}"));
            }
            let width = hi - lo + 1;
            let mask: u16 = if width == 16 { 0xFFFF } else { (1u16 << width) - 1 };
            Ok(ConvValue::UInt(((raw[0] >> lo) & mask) as u64))
        }
        PreConv::Timeslot => Ok(ConvValue::TimeSlot { start: raw[0], end: raw[1] }),
        PreConv::Datetime => {
            let year = 2000 + raw[0] as i32;
            let (month, day, hour, minute, second) =
                (raw[1] as u32, raw[2] as u32, raw[3] as u32, raw[4] as u32, raw[5] as u32);
            let date = NaiveDate::from_ymd_opt(year, month, day)
                .ok_or_else(|| format!("impossible date {year}-{month}-{day}"))?;
            let time = date
                .and_hms_opt(hour, minute, second)
                .ok_or_else(|| format!("impossible time {hour}:{minute}:{second}"))?;
            Ok(ConvValue::DateTime(time))
        }
        PreConv::FirmwareVersion => {
            Ok(ConvValue::Str(format!("D0.{}-A{}", raw[0], raw[1])))
        }
        PreConv::GatewayVersion => Ok(ConvValue::Str(
            raw.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("."),
        )),
        PreConv::Milli => Ok(ConvValue::Float(raw[0] as f64 / 1000.0)),
        PreConv::Centi => Ok(ConvValue::Float(raw[0] as f64 / 100.0)),
        PreConv::Deci => Ok(ConvValue::Float(raw[0] as f64 / 10.0)),
        PreConv::Hex => Ok(ConvValue::Str(format!("{:04x}", raw[0]))),
        PreConv::StringType => {
            let bytes: Vec<u8> = raw
                .iter()
                .flat_map(|v| v.to_be_bytes())
                .collect();
            let s: String = bytes
                .into_iter()
                .take_while(|&b| b != 0)
                .map(|b| b as char)
                .collect();
            Ok(ConvValue::Str(s.to_uppercase()))
        }
    }
}

fn apply_post_conv(conv: PostConv, value: ConvValue) -> ConvValue {
    match conv {
        PostConv::None => value,
        PostConv::BatteryPowerMode => ConvValue::Str(battery_power_mode_name(value.as_u64().unwrap_or(u64::MAX))),
        PostConv::BatteryPauseMode => ConvValue::Str(battery_pause_mode_name(value.as_u64().unwrap_or(u64::MAX))),
        PostConv::Generation => ConvValue::Str(generation_name(value.as_u64().unwrap_or(0))),
        PostConv::InverterMaxPower => {
            let code = match &value {
                ConvValue::Str(s) => s.clone(),
                _ => String::new(),
            };
            ConvValue::UInt(inverter_max_power(&code))
        }
    }
}

/// Total enumeration: any value outside the known set maps to `UNKNOWN`.
fn battery_power_mode_name(v: u64) -> String {
    match v {
        0 => "EXPORT".to_string(),
        1 => "SELF_CONSUMPTION".to_string(),
        other => format!("UNKNOWN({other})"),
    }
}

fn battery_pause_mode_name(v: u64) -> String {
    match v {
        0 => "DISABLED".to_string(),
        1 => "PAUSE_CHARGE".to_string(),
        2 => "PAUSE_DISCHARGE".to_string(),
        3 => "PAUSE_BOTH".to_string(),
        other => format!("UNKNOWN({other})"),
    }
}

/// Derived from `arm_firmware_version / 100`; unlike the other total
/// enumerations this one defaults to `GEN1` rather than an `UNKNOWN`
/// variant, matching the original's `_missing_` fallback.
fn generation_name(arm_firmware_version: u64) -> String {
    match arm_firmware_version / 100 {
        3 => "GEN3".to_string(),
        8 | 9 => "GEN2".to_string(),
        _ => "GEN1".to_string(),
    }
}

fn inverter_max_power(device_type_code: &str) -> u64 {
    match device_type_code {
        "2001" => 5000,
        "2002" => 4600,
        "2003" => 3600,
        "3001" => 3000,
        "3002" => 3600,
        "4001" => 6000,
        "4002" => 8000,
        "4003" => 10000,
        "4004" => 11000,
        "5001" => 5000,
        "8001" => 6000,
        _ => 0,
    }
}

/// Builds the representative inverter schema used for these tests and by
/// the composer: the handful of registers exercised by the documented
/// scenarios, not the exhaustive per-model vendor table (out of scope).
pub fn inverter_schema() -> RegisterSchema {
    use crate::register::Register as R;

    let mut s = RegisterSchema::new();
    let hr = |i: u16| vec![R::holding(i)];

    s.insert("device_type_code", RegisterSchemaEntry::new(hr(0), PreConv::Hex));
    s.insert(
        "inverter_max_power",
        RegisterSchemaEntry::new(hr(0), PreConv::Hex).with_post_conv(PostConv::InverterMaxPower),
    );
    s.insert(
        "num_mppt",
        RegisterSchemaEntry::new(hr(3), PreConv::DUint8High),
    );
    s.insert("num_phases", RegisterSchemaEntry::new(hr(3), PreConv::DUint8Low));
    s.insert(
        "serial_number",
        RegisterSchemaEntry::new(vec![R::holding(13), R::holding(14), R::holding(15), R::holding(16), R::holding(17)], PreConv::StringType),
    );
    s.insert("dsp_firmware_version", RegisterSchemaEntry::new(hr(19), PreConv::Uint16));
    s.insert(
        "enable_charge_target",
        RegisterSchemaEntry::new(hr(20), PreConv::Bool).with_valid(0, 1),
    );
    s.insert("arm_firmware_version", RegisterSchemaEntry::new(hr(21), PreConv::Uint16));
    s.insert(
        "generation",
        RegisterSchemaEntry::new(hr(21), PreConv::Uint16).with_post_conv(PostConv::Generation),
    );
    s.insert(
        "firmware_version",
        RegisterSchemaEntry::new(vec![R::holding(19), R::holding(21)], PreConv::FirmwareVersion),
    );
    s.insert(
        "battery_power_mode",
        RegisterSchemaEntry::new(hr(27), PreConv::Uint16)
            .with_post_conv(PostConv::BatteryPowerMode)
            .with_valid(0, 1),
    );
    s.insert(
        "system_time",
        RegisterSchemaEntry::new(
            vec![R::holding(35), R::holding(36), R::holding(37), R::holding(38), R::holding(39), R::holding(40)],
            PreConv::Datetime,
        ),
    );
    s.insert("system_time_year", RegisterSchemaEntry::new(hr(35), PreConv::Uint16).with_valid(0, 99));
    s.insert("system_time_month", RegisterSchemaEntry::new(hr(36), PreConv::Uint16).with_valid(1, 12));
    s.insert("system_time_day", RegisterSchemaEntry::new(hr(37), PreConv::Uint16).with_valid(1, 31));
    s.insert("system_time_hour", RegisterSchemaEntry::new(hr(38), PreConv::Uint16).with_valid(0, 23));
    s.insert("system_time_minute", RegisterSchemaEntry::new(hr(39), PreConv::Uint16).with_valid(0, 59));
    s.insert("system_time_second", RegisterSchemaEntry::new(hr(40), PreConv::Uint16).with_valid(0, 59));
    s.insert(
        "discharge_slot_2",
        RegisterSchemaEntry::new(vec![R::holding(44), R::holding(45)], PreConv::Timeslot),
    );
    s.insert("discharge_slot_2_start", RegisterSchemaEntry::new(hr(44), PreConv::Uint16).with_valid(0, 2359));
    s.insert("discharge_slot_2_end", RegisterSchemaEntry::new(hr(45), PreConv::Uint16).with_valid(0, 2359));
    s.insert(
        "discharge_slot_1",
        RegisterSchemaEntry::new(vec![R::holding(56), R::holding(57)], PreConv::Timeslot),
    );
    s.insert("discharge_slot_1_start", RegisterSchemaEntry::new(hr(56), PreConv::Uint16).with_valid(0, 2359));
    s.insert("discharge_slot_1_end", RegisterSchemaEntry::new(hr(57), PreConv::Uint16).with_valid(0, 2359));
    s.insert("enable_discharge", RegisterSchemaEntry::new(hr(59), PreConv::Bool).with_valid(0, 1));
    s.insert(
        "charge_slot_1",
        RegisterSchemaEntry::new(vec![R::holding(94), R::holding(95)], PreConv::Timeslot),
    );
    s.insert("charge_slot_1_start", RegisterSchemaEntry::new(hr(94), PreConv::Uint16).with_valid(0, 2359));
    s.insert("charge_slot_1_end", RegisterSchemaEntry::new(hr(95), PreConv::Uint16).with_valid(0, 2359));
    s.insert("enable_charge", RegisterSchemaEntry::new(hr(96), PreConv::Bool).with_valid(0, 1));
    // Gen-1 defines charge_slot_2 at HR(31)/HR(32); later generations move it
    // to HR(243)/HR(244). This table follows the later layout.
    s.insert(
        "charge_slot_2",
        RegisterSchemaEntry::new(vec![R::holding(243), R::holding(244)], PreConv::Timeslot),
    );
    s.insert("charge_slot_2_start", RegisterSchemaEntry::new(hr(243), PreConv::Uint16).with_valid(0, 2359));
    s.insert("charge_slot_2_end", RegisterSchemaEntry::new(hr(244), PreConv::Uint16).with_valid(0, 2359));
    s.insert("battery_soc_reserve", RegisterSchemaEntry::new(hr(110), PreConv::Uint16).with_valid(4, 100));
    s.insert("battery_charge_limit", RegisterSchemaEntry::new(hr(111), PreConv::Uint16).with_valid(0, 50));
    s.insert("battery_discharge_limit", RegisterSchemaEntry::new(hr(112), PreConv::Uint16).with_valid(0, 50));
    s.insert(
        "battery_discharge_min_power_reserve",
        RegisterSchemaEntry::new(hr(114), PreConv::Uint16).with_valid(4, 100),
    );
    s.insert("charge_target_soc", RegisterSchemaEntry::new(hr(116), PreConv::Uint16).with_valid(4, 100));
    s.insert("inverter_reboot", RegisterSchemaEntry::new(hr(163), PreConv::Uint16).with_valid(100, 100));
    s.insert(
        "battery_pause_mode",
        RegisterSchemaEntry::new(hr(318), PreConv::Uint16)
            .with_post_conv(PostConv::BatteryPauseMode)
            .with_valid(0, 3),
    );

    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with(pairs: &[(u16, u16)]) -> RegisterCache {
        let mut cache = RegisterCache::new();
        for &(idx, val) in pairs {
            cache.set(Register::holding(idx), val);
        }
        cache
    }

    // ========== get() tests ==========

    #[test]
    fn get_returns_none_when_register_absent() {
        let schema = inverter_schema();
        let cache = RegisterCache::new();
        assert_eq!(schema.get("dsp_firmware_version", &cache).unwrap(), None);
    }

    #[test]
    fn get_unknown_attribute_is_an_error() {
        let schema = inverter_schema();
        let cache = RegisterCache::new();
        assert!(schema.get("not_a_real_attribute", &cache).is_err());
    }

    #[test]
    fn get_uint16_attribute() {
        let schema = inverter_schema();
        let cache = cache_with(&[(19, 146)]);
        assert_eq!(schema.get("dsp_firmware_version", &cache).unwrap(), Some(ConvValue::UInt(146)));
    }

    #[test]
    fn get_duint8_splits_high_and_low_byte() {
        let schema = inverter_schema();
        let cache = cache_with(&[(3, 0x0102)]);
        assert_eq!(schema.get("num_mppt", &cache).unwrap(), Some(ConvValue::UInt(1)));
        assert_eq!(schema.get("num_phases", &cache).unwrap(), Some(ConvValue::UInt(2)));
    }

    #[test]
    fn get_string_type_strips_nul_and_uppercases() {
        let schema = inverter_schema();
        let word = |s: &str| u16::from_be_bytes([s.as_bytes()[0], s.as_bytes()[1]]);
        let cache = cache_with(&[(13, word("sa")), (14, word("11")), (15, word("22")), (16, word("g5")), (17, 0x3700)]);
        let value = schema.get("serial_number", &cache).unwrap().unwrap();
        assert_eq!(value, ConvValue::Str("SA1122G57".to_string()));
    }

    #[test]
    fn generation_post_conv_total_enumeration() {
        let schema = inverter_schema();
        assert_eq!(
            schema.get("generation", &cache_with(&[(21, 304)])).unwrap(),
            Some(ConvValue::Str("GEN3".to_string()))
        );
        assert_eq!(
            schema.get("generation", &cache_with(&[(21, 812)])).unwrap(),
            Some(ConvValue::Str("GEN2".to_string()))
        );
        assert_eq!(
            schema.get("generation", &cache_with(&[(21, 150)])).unwrap(),
            Some(ConvValue::Str("GEN1".to_string()))
        );
    }

    #[test]
    fn battery_power_mode_unknown_value_is_total() {
        let schema = inverter_schema();
        let cache = cache_with(&[(27, 99)]);
        assert_eq!(
            schema.get("battery_power_mode", &cache).unwrap(),
            Some(ConvValue::Str("UNKNOWN(99)".to_string()))
        );
    }

    #[test]
    fn datetime_rejects_impossible_date() {
        let schema = inverter_schema();
        let cache = cache_with(&[(35, 24), (36, 2), (37, 30), (38, 0), (39, 0), (40, 0)]);
        assert!(schema.get("system_time", &cache).is_err());
    }

    #[test]
    fn datetime_accepts_valid_date() {
        let schema = inverter_schema();
        let cache = cache_with(&[(35, 24), (36, 2), (37, 29), (38, 12), (39, 30), (40, 0)]);
        let value = schema.get("system_time", &cache).unwrap().unwrap();
        match value {
            ConvValue::DateTime(dt) => assert_eq!(dt.to_string(), "2024-02-29 12:30:00"),
            other => panic!("expected DateTime, got {other:?}"),
        }
    }

    // ========== resolve_write / validation tests ==========

    #[test]
    fn resolve_write_accepts_in_range_value() {
        let schema = inverter_schema();
        assert_eq!(schema.resolve_write("charge_target_soc", 45).unwrap(), Register::holding(116));
    }

    #[test]
    fn resolve_write_rejects_out_of_range_value() {
        let schema = inverter_schema();
        let err = schema.resolve_write("charge_target_soc", 0).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn resolve_write_rejects_non_writable_attribute() {
        let schema = inverter_schema();
        assert!(schema.resolve_write("dsp_firmware_version", 1).is_err());
    }

    #[test]
    fn resolve_write_hhmm_accepts_valid_minute() {
        let schema = inverter_schema();
        assert!(schema.resolve_write("charge_slot_1_start", 2359).is_ok());
    }

    #[test]
    fn resolve_write_hhmm_rejects_minute_ge_60() {
        let schema = inverter_schema();
        assert!(schema.resolve_write("charge_slot_1_start", 2360).is_err());
        assert!(schema.resolve_write("charge_slot_1_start", 2399).is_err());
    }

    #[test]
    fn resolve_write_unknown_attribute_is_an_error() {
        let schema = inverter_schema();
        assert!(schema.resolve_write("not_a_real_attribute", 1).is_err());
    }
}
