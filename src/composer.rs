//! C8: turns high-level plant intent into ordered lists of read/write
//! requests, validating every write against the register schema before any
//! bytes reach the wire.

use crate::error::Result;
use crate::pdu::{ReadRegistersRequest, TransparentRequest, WriteHoldingRegisterRequest};
use crate::schema::RegisterSchema;

const PRIMARY_SLAVE_ADDRESS: u8 = 0x32;

/// A packed `HHMM` start/end pair, as used by the charge/discharge slot
/// registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSlot {
    pub start: u16,
    pub end: u16,
}

impl TimeSlot {
    /// Builds a slot from two packed `HHMM` values, e.g. `TimeSlot::from_repr(1600, 700)`.
    pub fn from_repr(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn new(start_hour: u16, start_minute: u16, end_hour: u16, end_minute: u16) -> Self {
        Self {
            start: start_hour * 100 + start_minute,
            end: end_hour * 100 + end_minute,
        }
    }
}

/// A naive wall-clock timestamp for `set_system_date_time`, avoiding a
/// timezone-aware type since the device has no concept of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemDateTime {
    pub year: u16,
    pub month: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
}

/// Battery pause behaviour for `set_battery_pause_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryPauseMode {
    Disabled = 0,
    PauseCharge = 1,
    PauseDischarge = 2,
    PauseBoth = 3,
}

/// Turns named attributes and high-level intents into ordered
/// [`TransparentRequest`] lists, validating writes via the schema they're
/// built against.
pub struct Commands<'a> {
    schema: &'a RegisterSchema,
}

impl<'a> Commands<'a> {
    pub fn new(schema: &'a RegisterSchema) -> Self {
        Self { schema }
    }

    /// Looks up a writable register by name and builds the write request.
    /// Range checking happens here, before anything is enqueued.
    pub fn write_named_register(&self, name: &str, value: i64) -> Result<TransparentRequest> {
        let register = self.schema.resolve_write(name, value)?;
        Ok(TransparentRequest::WriteHolding(WriteHoldingRegisterRequest::new(
            PRIMARY_SLAVE_ADDRESS,
            register.index,
            value as u16,
        )))
    }

    pub fn refresh_plant_data(
        &self,
        complete: bool,
        mut number_batteries: u8,
        max_batteries: u8,
    ) -> Result<Vec<TransparentRequest>> {
        let read_input = |base: u16, count: u16, slave: u8| -> Result<TransparentRequest> {
            Ok(TransparentRequest::ReadInput(ReadRegistersRequest::new(slave, base, count)?))
        };
        let read_holding = |base: u16, count: u16, slave: u8| -> Result<TransparentRequest> {
            Ok(TransparentRequest::ReadHolding(ReadRegistersRequest::new(slave, base, count)?))
        };

        let mut requests = vec![
            read_input(0, 60, PRIMARY_SLAVE_ADDRESS)?,
            read_input(180, 60, PRIMARY_SLAVE_ADDRESS)?,
        ];

        if complete {
            requests.push(read_holding(0, 60, PRIMARY_SLAVE_ADDRESS)?);
            requests.push(read_holding(60, 60, PRIMARY_SLAVE_ADDRESS)?);
            requests.push(read_holding(120, 60, PRIMARY_SLAVE_ADDRESS)?);
            requests.push(read_input(120, 60, PRIMARY_SLAVE_ADDRESS)?);
            number_batteries = max_batteries;
        }

        for i in 0..number_batteries {
            requests.push(read_input(60, 60, PRIMARY_SLAVE_ADDRESS + i)?);
        }

        Ok(requests)
    }

    pub fn disable_charge_target(&self) -> Result<Vec<TransparentRequest>> {
        Ok(vec![
            self.write_named_register("enable_charge_target", 0)?,
            self.write_named_register("charge_target_soc", 100)?,
        ])
    }

    /// `set_charge_target(100)` is equivalent to disabling the target
    /// entirely, rather than writing a literal 100% target.
    pub fn set_charge_target(&self, target_soc: i64) -> Result<Vec<TransparentRequest>> {
        let mut requests = self.set_enable_charge(true)?;
        if target_soc == 100 {
            requests.extend(self.disable_charge_target()?);
        } else {
            requests.push(self.write_named_register("enable_charge_target", 1)?);
            requests.push(self.write_named_register("charge_target_soc", target_soc)?);
        }
        Ok(requests)
    }

    pub fn set_enable_charge(&self, enabled: bool) -> Result<Vec<TransparentRequest>> {
        Ok(vec![self.write_named_register("enable_charge", enabled as i64)?])
    }

    pub fn set_enable_discharge(&self, enabled: bool) -> Result<Vec<TransparentRequest>> {
        Ok(vec![self.write_named_register("enable_discharge", enabled as i64)?])
    }

    #[deprecated(note = "use set_enable_charge(true) instead")]
    pub fn enable_charge(&self) -> Result<Vec<TransparentRequest>> {
        self.set_enable_charge(true)
    }

    #[deprecated(note = "use set_enable_charge(false) instead")]
    pub fn disable_charge(&self) -> Result<Vec<TransparentRequest>> {
        self.set_enable_charge(false)
    }

    #[deprecated(note = "use set_enable_discharge(true) instead")]
    pub fn enable_discharge(&self) -> Result<Vec<TransparentRequest>> {
        self.set_enable_discharge(true)
    }

    #[deprecated(note = "use set_enable_discharge(false) instead")]
    pub fn disable_discharge(&self) -> Result<Vec<TransparentRequest>> {
        self.set_enable_discharge(false)
    }

    pub fn set_inverter_reboot(&self) -> Result<Vec<TransparentRequest>> {
        Ok(vec![self.write_named_register("inverter_reboot", 100)?])
    }

    pub fn set_discharge_mode_max_power(&self) -> Result<Vec<TransparentRequest>> {
        Ok(vec![self.write_named_register("battery_power_mode", 0)?])
    }

    pub fn set_discharge_mode_to_match_demand(&self) -> Result<Vec<TransparentRequest>> {
        Ok(vec![self.write_named_register("battery_power_mode", 1)?])
    }

    pub fn set_battery_soc_reserve(&self, val: i64) -> Result<Vec<TransparentRequest>> {
        Ok(vec![self.write_named_register("battery_soc_reserve", val)?])
    }

    pub fn set_battery_charge_limit(&self, val: i64) -> Result<Vec<TransparentRequest>> {
        Ok(vec![self.write_named_register("battery_charge_limit", val)?])
    }

    pub fn set_battery_discharge_limit(&self, val: i64) -> Result<Vec<TransparentRequest>> {
        Ok(vec![self.write_named_register("battery_discharge_limit", val)?])
    }

    pub fn set_battery_power_reserve(&self, val: i64) -> Result<Vec<TransparentRequest>> {
        Ok(vec![self.write_named_register("battery_discharge_min_power_reserve", val)?])
    }

    pub fn set_battery_pause_mode(&self, val: BatteryPauseMode) -> Result<Vec<TransparentRequest>> {
        Ok(vec![self.write_named_register("battery_pause_mode", val as i64)?])
    }

    fn set_charge_slot(&self, discharge: bool, idx: u8, slot: Option<TimeSlot>) -> Result<Vec<TransparentRequest>> {
        let kind = if discharge { "discharge" } else { "charge" };
        let (start, end) = match slot {
            Some(s) => (s.start, s.end),
            None => (0, 0),
        };
        Ok(vec![
            self.write_named_register(&format!("{kind}_slot_{idx}_start"), start as i64)?,
            self.write_named_register(&format!("{kind}_slot_{idx}_end"), end as i64)?,
        ])
    }

    pub fn set_charge_slot_1(&self, slot: TimeSlot) -> Result<Vec<TransparentRequest>> {
        self.set_charge_slot(false, 1, Some(slot))
    }

    pub fn reset_charge_slot_1(&self) -> Result<Vec<TransparentRequest>> {
        self.set_charge_slot(false, 1, None)
    }

    pub fn set_charge_slot_2(&self, slot: TimeSlot) -> Result<Vec<TransparentRequest>> {
        self.set_charge_slot(false, 2, Some(slot))
    }

    pub fn reset_charge_slot_2(&self) -> Result<Vec<TransparentRequest>> {
        self.set_charge_slot(false, 2, None)
    }

    pub fn set_discharge_slot_1(&self, slot: TimeSlot) -> Result<Vec<TransparentRequest>> {
        self.set_charge_slot(true, 1, Some(slot))
    }

    pub fn reset_discharge_slot_1(&self) -> Result<Vec<TransparentRequest>> {
        self.set_charge_slot(true, 1, None)
    }

    pub fn set_discharge_slot_2(&self, slot: TimeSlot) -> Result<Vec<TransparentRequest>> {
        self.set_charge_slot(true, 2, Some(slot))
    }

    pub fn reset_discharge_slot_2(&self) -> Result<Vec<TransparentRequest>> {
        self.set_charge_slot(true, 2, None)
    }

    /// Six independent single-register writes. Because `execute` dispatches
    /// them concurrently, a minute boundary crossed mid-flight can leave
    /// the device's clock briefly inconsistent; see DESIGN.md for the
    /// accepted tradeoff.
    pub fn set_system_date_time(&self, dt: SystemDateTime) -> Result<Vec<TransparentRequest>> {
        Ok(vec![
            self.write_named_register("system_time_year", (dt.year as i64) - 2000)?,
            self.write_named_register("system_time_month", dt.month as i64)?,
            self.write_named_register("system_time_day", dt.day as i64)?,
            self.write_named_register("system_time_hour", dt.hour as i64)?,
            self.write_named_register("system_time_minute", dt.minute as i64)?,
            self.write_named_register("system_time_second", dt.second as i64)?,
        ])
    }

    /// Maximise self-consumption of solar generation: match demand, reserve
    /// only the minimum SOC, and never discharge on a schedule.
    pub fn set_mode_dynamic(&self) -> Result<Vec<TransparentRequest>> {
        let mut requests = self.set_discharge_mode_to_match_demand()?;
        requests.extend(self.set_battery_soc_reserve(4)?);
        requests.extend(self.set_enable_discharge(false)?);
        Ok(requests)
    }

    /// Store excess solar generation and discharge it on a schedule
    /// (default 16:00-07:00), optionally exporting surplus to the grid.
    pub fn set_mode_storage(
        &self,
        discharge_slot_1: TimeSlot,
        discharge_slot_2: Option<TimeSlot>,
        discharge_for_export: bool,
    ) -> Result<Vec<TransparentRequest>> {
        let mut requests = if discharge_for_export {
            self.set_discharge_mode_max_power()?
        } else {
            self.set_discharge_mode_to_match_demand()?
        };
        requests.extend(self.set_battery_soc_reserve(100)?);
        requests.extend(self.set_enable_discharge(true)?);
        requests.extend(self.set_discharge_slot_1(discharge_slot_1)?);
        match discharge_slot_2 {
            Some(slot) => requests.extend(self.set_discharge_slot_2(slot)?),
            None => requests.extend(self.reset_discharge_slot_2()?),
        }
        Ok(requests)
    }
}
