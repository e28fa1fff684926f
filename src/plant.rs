//! C7: projects the raw register caches, one per slave address, into a
//! structured view of the inverter, its batteries, and the other devices
//! that can appear on the bus.

use std::collections::HashMap;

use crate::pdu::TransparentResponse;
use crate::register::{Register, RegisterCache};
use crate::schema::{inverter_schema, ConvValue, RegisterSchema};

/// Addresses that get folded into the canonical primary-inverter cache
/// rather than kept separately, per the device's quirk of occasionally
/// reporting under `0x00`/`0x11`.
const REWRITE_SOURCES: [u8; 2] = [0x00, 0x11];
const CANONICAL_SLAVE_ADDRESS: u8 = 0x32;

/// Device family, selected from the first hex digit of `HR(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceModel {
    /// `2`, `3`: single-phase hybrid/AC inverter.
    SinglePhase,
    /// `4`, `6`: three-phase inverter.
    ThreePhase,
    /// `5`: energy management system.
    Ems,
    /// `7`: gateway.
    Gateway,
    /// `8`: all-in-one.
    AllInOne,
    /// No `HR(0)` seen yet, or a digit outside the known set.
    Unknown,
}

impl DeviceModel {
    fn from_hr0(value: u16) -> Self {
        match (value >> 12) & 0xF {
            2 | 3 => DeviceModel::SinglePhase,
            4 | 6 => DeviceModel::ThreePhase,
            5 => DeviceModel::Ems,
            7 => DeviceModel::Gateway,
            8 => DeviceModel::AllInOne,
            _ => DeviceModel::Unknown,
        }
    }
}

/// A bundle of register caches keyed by slave address, with the primary
/// inverter always at `0x32`.
#[derive(Debug, Clone)]
pub struct Plant {
    pub slave_address: u8,
    pub register_caches: HashMap<u8, RegisterCache>,
    pub number_batteries: usize,
    schema: RegisterSchema,
}

impl Default for Plant {
    fn default() -> Self {
        Self::new()
    }
}

impl Plant {
    pub fn new() -> Self {
        Self {
            slave_address: CANONICAL_SLAVE_ADDRESS,
            register_caches: HashMap::new(),
            number_batteries: 0,
            schema: inverter_schema(),
        }
    }

    /// Resolves `0x00`/`0x11` to the canonical primary-inverter address.
    fn canonicalize(&self, address: u8) -> u8 {
        if REWRITE_SOURCES.contains(&address) {
            self.slave_address
        } else {
            address
        }
    }

    pub fn cache_for(&self, address: u8) -> Option<&RegisterCache> {
        self.register_caches.get(&self.canonicalize(address))
    }

    pub fn inverter_cache(&self) -> Option<&RegisterCache> {
        self.cache_for(self.slave_address)
    }

    /// Applies an incoming transparent response to the register cache for
    /// its (canonicalized) slave address. Non-transparent PDUs and error
    /// responses never reach here (filtered upstream by the client's
    /// consumer loop); a write-holding response to register 0 is dropped
    /// as the device occasionally emits those for unrelated internal
    /// reasons and they're not trustworthy.
    pub fn update(&mut self, response: &TransparentResponse) {
        if response.error() {
            return;
        }

        let address = self.canonicalize(response.slave_address());
        let cache = self.register_caches.entry(address).or_default();

        match response {
            TransparentResponse::Null(_) => {}
            TransparentResponse::ReadHolding(r) => cache.update(r.enumerate(crate::register::Bank::Holding)),
            TransparentResponse::ReadInput(r) | TransparentResponse::ReadBatteryInput(r) => {
                cache.update(r.enumerate(crate::register::Bank::Input))
            }
            TransparentResponse::WriteHolding(w) => {
                if w.register == 0 {
                    tracing::warn!("dropping write-holding response to register 0 (corrupt)");
                    return;
                }
                cache.set(Register::holding(w.register), w.value);
            }
        }
    }

    /// The device family of the primary inverter, or `Unknown` before the
    /// first `HR(0)` read lands.
    pub fn device_model(&self) -> DeviceModel {
        self.inverter_cache()
            .and_then(|c| c.get(Register::holding(0)))
            .map(DeviceModel::from_hr0)
            .unwrap_or(DeviceModel::Unknown)
    }

    /// Reads a named attribute off the primary inverter's cache.
    pub fn inverter_attr(&self, name: &str) -> crate::error::Result<Option<ConvValue>> {
        match self.inverter_cache() {
            Some(cache) => self.schema.get(name, cache),
            None => Ok(None),
        }
    }

    pub fn schema(&self) -> &RegisterSchema {
        &self.schema
    }

    /// Whether battery `i`'s cache (at `slave_address + i`) looks like a
    /// real battery: its serial number is neither empty nor all NULs/spaces.
    /// Grounded on `HVBCU.Battery.is_valid` in the original.
    pub fn battery_is_valid(&self, i: u8) -> bool {
        let Some(cache) = self.register_caches.get(&(self.slave_address + i)) else {
            return false;
        };
        let Ok(Some(ConvValue::Str(serial))) = self.schema.get("serial_number", cache) else {
            return false;
        };
        let trimmed = serial.trim_matches(|c: char| c == '\0' || c == ' ');
        !trimmed.is_empty()
    }

    /// Counts contiguous valid batteries starting at offset 0, matching the
    /// original's short-circuiting `detect_batteries` loop.
    pub fn detect_batteries(&mut self, max_batteries: u8) {
        let mut count = 0;
        for i in 0..max_batteries {
            if self.battery_is_valid(i) {
                count += 1;
            } else {
                break;
            }
        }
        self.number_batteries = count as usize;
    }
}
