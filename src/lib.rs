//! Asynchronous client for the GivEnergy transparent Modbus/TCP dialect
//! spoken by solar inverters, batteries, gateways, and EMS units.

pub mod client;
pub mod codec;
pub mod composer;
pub mod config;
pub mod error;
pub mod framer;
pub mod pdu;
pub mod plant;
pub mod register;
pub mod schema;

pub use client::Client;
pub use composer::Commands;
pub use config::ClientConfig;
pub use error::{GivEnergyError, Result};
pub use plant::{DeviceModel, Plant};
pub use register::{Bank, Register, RegisterCache};
pub use schema::RegisterSchema;
