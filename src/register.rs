//! C6: the register identifier type and the sparse cache that backs it.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which of the two register address spaces a [`Register`] lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bank {
    Holding,
    Input,
}

impl Bank {
    fn tag(self) -> &'static str {
        match self {
            Bank::Holding => "HR",
            Bank::Input => "IR",
        }
    }
}

/// A stable identifier for one 16-bit register: which bank, and its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    pub bank: Bank,
    pub index: u16,
}

impl Register {
    pub fn new(bank: Bank, index: u16) -> Self {
        Self { bank, index }
    }

    pub fn holding(index: u16) -> Self {
        Self::new(Bank::Holding, index)
    }

    pub fn input(index: u16) -> Self {
        Self::new(Bank::Input, index)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.bank.tag(), self.index)
    }
}

/// Sparse `{(bank, index) -> u16}` store. Absence is meaningful: a register
/// that has never been seen is distinct from one holding zero.
#[derive(Debug, Clone, Default)]
pub struct RegisterCache {
    values: HashMap<Register, u16>,
}

impl RegisterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, register: Register) -> Option<u16> {
        self.values.get(&register).copied()
    }

    pub fn set(&mut self, register: Register, value: u16) {
        self.values.insert(register, value);
    }

    /// Writes every `(register, value)` pair, in iteration order.
    pub fn update<I: IntoIterator<Item = (Register, u16)>>(&mut self, pairs: I) {
        for (register, value) in pairs {
            self.set(register, value);
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Register, u16)> + '_ {
        self.values.iter().map(|(&r, &v)| (r, v))
    }

    /// Serializes to `{"HR(17)": 123, ...}`, matching the Python client's
    /// on-disk representation.
    pub fn to_json(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .values
            .iter()
            .map(|(reg, val)| (format!("{}({})", reg.bank.tag(), reg.index), Value::from(*val)))
            .collect();
        Value::Object(map)
    }

    /// Parses `{"HR(17)": 123, ...}` (also accepting `"HR:17"`), silently
    /// discarding any key that doesn't match either form.
    pub fn from_json(value: &Value) -> Self {
        let mut cache = Self::new();
        let Some(map) = value.as_object() else {
            return cache;
        };
        for (key, val) in map {
            let Some(register) = parse_register_key(key) else {
                continue;
            };
            let Some(value) = val.as_u64() else {
                continue;
            };
            cache.set(register, value as u16);
        }
        cache
    }
}

fn parse_register_key(key: &str) -> Option<Register> {
    let (tag, rest) = key.split_once(['(', ':'])?;
    let idx_str = rest.trim_end_matches(')');
    let bank = match tag {
        "HR" => Bank::Holding,
        "IR" => Bank::Input,
        _ => return None,
    };
    let index: u16 = idx_str.parse().ok()?;
    Some(Register::new(bank, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== Register display/equality tests ==========

    #[test]
    fn display_format_matches_lexical_form() {
        assert_eq!(Register::holding(17).to_string(), "HR_17");
        assert_eq!(Register::input(2045).to_string(), "IR_2045");
    }

    #[test]
    fn equal_bank_and_index_are_equal() {
        assert_eq!(Register::holding(5), Register::new(Bank::Holding, 5));
        assert_ne!(Register::holding(5), Register::input(5));
    }

    // ========== RegisterCache basic tests ==========

    #[test]
    fn missing_register_is_none_not_zero() {
        let cache = RegisterCache::new();
        assert_eq!(cache.get(Register::holding(0)), None);
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut cache = RegisterCache::new();
        cache.set(Register::holding(17), 123);
        assert_eq!(cache.get(Register::holding(17)), Some(123));
    }

    #[test]
    fn update_writes_all_pairs() {
        let mut cache = RegisterCache::new();
        cache.update(vec![(Register::holding(0), 1), (Register::holding(1), 2)]);
        assert_eq!(cache.get(Register::holding(0)), Some(1));
        assert_eq!(cache.get(Register::holding(1)), Some(2));
    }

    // ========== JSON round-trip tests ==========

    #[test]
    fn json_round_trips_through_hr_ir_keys() {
        let mut cache = RegisterCache::new();
        cache.set(Register::holding(17), 123);
        cache.set(Register::input(2045), 456);

        let json = cache.to_json();
        let restored = RegisterCache::from_json(&json);
        assert_eq!(restored.get(Register::holding(17)), Some(123));
        assert_eq!(restored.get(Register::input(2045)), Some(456));
    }

    #[test]
    fn from_json_accepts_colon_form() {
        let json = serde_json::json!({"HR:17": 123});
        let cache = RegisterCache::from_json(&json);
        assert_eq!(cache.get(Register::holding(17)), Some(123));
    }

    #[test]
    fn from_json_silently_drops_unparseable_keys() {
        let json = serde_json::json!({"bogus": 1, "XX(1)": 2, "HR(1)": 3});
        let cache = RegisterCache::from_json(&json);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(Register::holding(1)), Some(3));
    }

    #[test]
    fn from_json_non_object_yields_empty_cache() {
        let cache = RegisterCache::from_json(&Value::Null);
        assert!(cache.is_empty());
    }
}
