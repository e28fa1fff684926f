//! C3: typed representations of every message variant the device speaks,
//! plus their self-contained encode/decode.
//!
//! The wire doesn't distinguish requests from responses by function code;
//! which decoder to pick is a property of which side of the TCP connection
//! you are. This client only ever needs to *decode* `TransparentResponse`s
//! and `HeartbeatRequest`s (things the device sends us), and *encode*
//! `TransparentRequest`s and `HeartbeatResponse`s (things we send it).

use crate::codec::{append_crc, split_and_verify_crc, PayloadDecoder, PayloadEncoder};
use crate::error::{GivEnergyError, Result};
use crate::register::{Bank, Register};

const TRANSACTION_ID: u16 = 0x5959;
const PROTOCOL_ID: u16 = 0x0001;
const UNIT_ID: u8 = 0x01;

const FUNCTION_HEARTBEAT: u8 = 1;
const FUNCTION_TRANSPARENT: u8 = 2;

const TFC_NULL: u8 = 0;
const TFC_READ_HOLDING: u8 = 3;
const TFC_READ_INPUT: u8 = 4;
const TFC_WRITE_HOLDING: u8 = 6;
const TFC_READ_BATTERY: u8 = 22;

const ERROR_BIT: u8 = 0x80;

const DEFAULT_DATA_ADAPTER_SERIAL: &str = "AB1234G567";
const DEFAULT_PADDING: u64 = 0x0000_0000_0000_0008;

/// Shape-hash scale factors, in ascending significance. See spec §3/§8.4:
/// values and the error flag deliberately don't participate.
const SCALE_ADDRESS: u64 = 1;
const SCALE_FUNC: u64 = SCALE_ADDRESS * 1000;
const SCALE_COUNT: u64 = SCALE_FUNC * 100;
const SCALE_BASE: u64 = SCALE_COUNT * 100;

/// Any decoded PDU the client engine's consumer loop needs to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum Pdu {
    HeartbeatRequest(HeartbeatMessage),
    TransparentResponse(TransparentResponse),
}

/// Heartbeat request or response payload; the two are identical on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatMessage {
    pub data_adapter_serial_number: String,
    pub data_adapter_type: u8,
}

impl HeartbeatMessage {
    pub fn new(data_adapter_type: u8) -> Self {
        Self {
            data_adapter_serial_number: DEFAULT_DATA_ADAPTER_SERIAL.to_string(),
            data_adapter_type,
        }
    }

    /// Builds the response this client owes the device within ~5s.
    pub fn expected_response(&self) -> HeartbeatMessage {
        HeartbeatMessage::new(self.data_adapter_type)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut builder = PayloadEncoder::new();
        builder.add_fixed_string(&self.data_adapter_serial_number, 10);
        builder.add_u8(self.data_adapter_type);
        encode_mbap_frame(FUNCTION_HEARTBEAT, builder.into_bytes())
    }

    fn decode_body(decoder: &mut PayloadDecoder) -> Result<Self> {
        let serial = decode_fixed_string(decoder, 10)?;
        let data_adapter_type = decoder.read_u8()?;
        Ok(Self {
            data_adapter_serial_number: serial,
            data_adapter_type,
        })
    }
}

/// Which optional fields a transparent message carries, and in what order
/// they must appear (SERIAL, BASE, COUNT, VALUES).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    serial: bool,
    base: bool,
    count: bool,
    values: bool,
}

fn fields_for(tfc: u8, is_response: bool) -> FieldSet {
    match (tfc, is_response) {
        (TFC_NULL, true) => FieldSet { serial: true, base: false, count: false, values: true },
        (TFC_READ_HOLDING, false) | (TFC_READ_INPUT, false) | (TFC_READ_BATTERY, false) => {
            FieldSet { serial: false, base: true, count: true, values: false }
        }
        (TFC_READ_HOLDING, true) | (TFC_READ_INPUT, true) | (TFC_READ_BATTERY, true) => {
            FieldSet { serial: true, base: true, count: true, values: true }
        }
        (TFC_WRITE_HOLDING, false) => FieldSet { serial: false, base: true, count: false, values: true },
        (TFC_WRITE_HOLDING, true) => FieldSet { serial: true, base: true, count: false, values: true },
        _ => FieldSet { serial: false, base: false, count: false, values: false },
    }
}

/// A read request: read-holding, read-input, or read-battery-input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRegistersRequest {
    pub slave_address: u8,
    pub base_register: u16,
    pub register_count: u16,
}

impl ReadRegistersRequest {
    pub fn new(slave_address: u8, base_register: u16, register_count: u16) -> Result<Self> {
        if !(1..=60).contains(&register_count) {
            return Err(GivEnergyError::InvalidPduState(format!(
                "register_count {register_count} out of range 1..=60"
            )));
        }
        Ok(Self { slave_address, base_register, register_count })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteHoldingRegisterRequest {
    pub slave_address: u8,
    pub register: u16,
    pub value: u16,
}

impl WriteHoldingRegisterRequest {
    pub fn new(slave_address: u8, register: u16, value: u16) -> Self {
        Self { slave_address, register, value }
    }
}

/// Requests this client can send: reads of each bank and a single-register
/// write. Function codes outside this set are rejected by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransparentRequest {
    ReadHolding(ReadRegistersRequest),
    ReadInput(ReadRegistersRequest),
    ReadBatteryInput(ReadRegistersRequest),
    WriteHolding(WriteHoldingRegisterRequest),
}

impl TransparentRequest {
    pub fn slave_address(&self) -> u8 {
        match self {
            Self::ReadHolding(r) | Self::ReadInput(r) | Self::ReadBatteryInput(r) => r.slave_address,
            Self::WriteHolding(w) => w.slave_address,
        }
    }

    fn transparent_function_code(&self) -> u8 {
        match self {
            Self::ReadHolding(_) => TFC_READ_HOLDING,
            Self::ReadInput(_) => TFC_READ_INPUT,
            Self::ReadBatteryInput(_) => TFC_READ_BATTERY,
            Self::WriteHolding(_) => TFC_WRITE_HOLDING,
        }
    }

    fn base_register(&self) -> u16 {
        match self {
            Self::ReadHolding(r) | Self::ReadInput(r) | Self::ReadBatteryInput(r) => r.base_register,
            Self::WriteHolding(w) => w.register,
        }
    }

    fn register_count(&self) -> u16 {
        match self {
            Self::ReadHolding(r) | Self::ReadInput(r) | Self::ReadBatteryInput(r) => r.register_count,
            Self::WriteHolding(_) => 1,
        }
    }

    /// The bank a matching response's VALUES field should be written into.
    pub fn response_bank(&self) -> Bank {
        match self {
            Self::ReadHolding(_) | Self::WriteHolding(_) => Bank::Holding,
            Self::ReadInput(_) | Self::ReadBatteryInput(_) => Bank::Input,
        }
    }

    pub fn shape_hash(&self) -> u64 {
        shape_hash_of(self.slave_address(), self.transparent_function_code(), self.register_count(), self.base_register())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut crc_builder = PayloadEncoder::new();
        crc_builder.add_u8(self.slave_address());
        crc_builder.add_u8(self.transparent_function_code());

        let fields = fields_for(self.transparent_function_code(), false);
        if fields.base {
            crc_builder.add_u16(self.base_register());
        }
        if fields.count {
            crc_builder.add_u16(self.register_count());
        }
        if fields.values {
            if let Self::WriteHolding(w) = self {
                crc_builder.add_u16(w.value);
            }
        }

        let mut crc_bytes = crc_builder.into_bytes();
        append_crc(&mut crc_bytes);

        let mut builder = PayloadEncoder::new();
        builder.add_fixed_string(DEFAULT_DATA_ADAPTER_SERIAL, 10);
        builder.buf_mut().extend_from_slice(&DEFAULT_PADDING.to_be_bytes());
        builder.buf_mut().extend_from_slice(&crc_bytes);

        encode_mbap_frame(FUNCTION_TRANSPARENT, builder.into_bytes())
    }
}

/// A decoded response to a read-holding/read-input/read-battery-input
/// request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRegistersResponse {
    pub slave_address: u8,
    pub inverter_serial_number: String,
    pub base_register: u16,
    pub register_count: u16,
    pub register_values: Vec<u16>,
    pub error: bool,
}

impl ReadRegistersResponse {
    /// Yields `(Register, value)` pairs ready for `RegisterCache::update`.
    pub fn enumerate(&self, bank: Bank) -> impl Iterator<Item = (Register, u16)> + '_ {
        self.register_values
            .iter()
            .enumerate()
            .map(move |(i, &v)| (Register::new(bank, self.base_register + i as u16), v))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteHoldingRegisterResponse {
    pub slave_address: u8,
    pub inverter_serial_number: String,
    pub register: u16,
    pub value: u16,
    pub error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullResponse {
    pub slave_address: u8,
    pub inverter_serial_number: String,
    pub register_values: Vec<u16>,
    pub error: bool,
}

/// Responses this client decodes: everything the device can send back, plus
/// the unsolicited null frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransparentResponse {
    Null(NullResponse),
    ReadHolding(ReadRegistersResponse),
    ReadInput(ReadRegistersResponse),
    ReadBatteryInput(ReadRegistersResponse),
    WriteHolding(WriteHoldingRegisterResponse),
}

impl TransparentResponse {
    pub fn slave_address(&self) -> u8 {
        match self {
            Self::Null(r) => r.slave_address,
            Self::ReadHolding(r) | Self::ReadInput(r) | Self::ReadBatteryInput(r) => r.slave_address,
            Self::WriteHolding(r) => r.slave_address,
        }
    }

    pub fn error(&self) -> bool {
        match self {
            Self::Null(r) => r.error,
            Self::ReadHolding(r) | Self::ReadInput(r) | Self::ReadBatteryInput(r) => r.error,
            Self::WriteHolding(r) => r.error,
        }
    }

    fn transparent_function_code(&self) -> u8 {
        match self {
            Self::Null(_) => TFC_NULL,
            Self::ReadHolding(_) => TFC_READ_HOLDING,
            Self::ReadInput(_) => TFC_READ_INPUT,
            Self::ReadBatteryInput(_) => TFC_READ_BATTERY,
            Self::WriteHolding(_) => TFC_WRITE_HOLDING,
        }
    }

    fn base_register(&self) -> u16 {
        match self {
            Self::Null(_) => 0,
            Self::ReadHolding(r) | Self::ReadInput(r) | Self::ReadBatteryInput(r) => r.base_register,
            Self::WriteHolding(r) => r.register,
        }
    }

    fn register_count(&self) -> u16 {
        match self {
            Self::Null(r) => r.register_values.len() as u16,
            Self::ReadHolding(r) | Self::ReadInput(r) | Self::ReadBatteryInput(r) => r.register_count,
            Self::WriteHolding(_) => 1,
        }
    }

    /// Shape hash matching the request that caused this response, per §3.
    /// `Null` carries no base register and correlates with nothing; it's
    /// given a sentinel hash that no real request can produce.
    pub fn shape_hash(&self) -> u64 {
        match self {
            Self::Null(_) => u64::MAX,
            _ => shape_hash_of(
                self.slave_address(),
                self.transparent_function_code(),
                self.register_count(),
                self.base_register(),
            ),
        }
    }

    /// The bank a read response's values should land in; `None` for
    /// messages that don't carry a VALUES-as-registers payload in the
    /// request/response sense (null, write-holding has its own path).
    pub fn read_bank(&self) -> Option<Bank> {
        match self {
            Self::ReadHolding(_) => Some(Bank::Holding),
            Self::ReadInput(_) | Self::ReadBatteryInput(_) => Some(Bank::Input),
            _ => None,
        }
    }
}

fn shape_hash_of(slave_address: u8, tfc: u8, register_count: u16, base_register: u16) -> u64 {
    slave_address as u64 * SCALE_ADDRESS
        + tfc as u64 * SCALE_FUNC
        + register_count as u64 * SCALE_COUNT
        + base_register as u64 * SCALE_BASE
}

fn decode_fixed_string(decoder: &mut PayloadDecoder, len: usize) -> Result<String> {
    let bytes = decoder.read_bytes(len)?;
    Ok(bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect::<String>()
        .to_uppercase())
}

fn encode_mbap_frame(function_code: u8, inner_frame: Vec<u8>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8 + inner_frame.len());
    frame.extend_from_slice(&TRANSACTION_ID.to_be_bytes());
    frame.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    frame.extend_from_slice(&((inner_frame.len() + 2) as u16).to_be_bytes());
    frame.push(UNIT_ID);
    frame.push(function_code);
    frame.extend_from_slice(&inner_frame);
    frame
}

/// Decodes one complete MBAP-framed message, choosing the response decoder
/// for transparent messages (this is a client, never a server).
pub fn decode(data: &[u8]) -> Result<Pdu> {
    let mut decoder = PayloadDecoder::new(data);

    let transaction_id = decoder.read_u16()?;
    if transaction_id != TRANSACTION_ID {
        return Err(GivEnergyError::invalid_frame(format!(
            "transaction id {transaction_id:#06x} != {TRANSACTION_ID:#06x}"
        )));
    }

    let protocol_id = decoder.read_u16()?;
    if protocol_id != PROTOCOL_ID {
        return Err(GivEnergyError::invalid_frame(format!(
            "protocol id {protocol_id:#06x} != {PROTOCOL_ID:#06x}"
        )));
    }

    let declared_len = decoder.read_u16()? as usize;
    let remaining = decoder.remaining();
    if declared_len != remaining {
        return Err(GivEnergyError::invalid_frame(format!(
            "declared length {declared_len} != remaining frame length {remaining}"
        )));
    }

    let unit_id = decoder.read_u8()?;
    if unit_id != 0x00 && unit_id != 0x01 {
        return Err(GivEnergyError::invalid_frame(format!("unit id {unit_id:#04x} != 0x00/0x01")));
    }

    let function_code = decoder.read_u8()?;
    let pdu = match function_code {
        FUNCTION_HEARTBEAT => Pdu::HeartbeatRequest(HeartbeatMessage::decode_body(&mut decoder)?),
        FUNCTION_TRANSPARENT => Pdu::TransparentResponse(decode_transparent_response(&mut decoder)?),
        other => {
            return Err(GivEnergyError::invalid_frame(format!("unsupported function code {other}")))
        }
    };

    if !decoder.decoding_complete() {
        tracing::warn!(
            remaining = decoder.remaining(),
            "decoder did not fully consume frame, discarding trailing bytes"
        );
    }

    Ok(pdu)
}

fn decode_transparent_response(decoder: &mut PayloadDecoder) -> Result<TransparentResponse> {
    let _data_adapter_serial_number = decode_fixed_string(decoder, 10)?;
    let _padding = {
        let bytes = decoder.read_bytes(8)?;
        u64::from_be_bytes(bytes.try_into().unwrap())
    };
    let crc_start = decoder.pos();
    let slave_address = decoder.read_u8()?;

    let raw_tfc = decoder.read_u8()?;
    let error = raw_tfc & ERROR_BIT != 0;
    let tfc = raw_tfc & !ERROR_BIT;

    let fields = fields_for(tfc, true);

    let inverter_serial_number = if fields.serial {
        decode_fixed_string(decoder, 10)?
    } else {
        String::new()
    };

    let base_register = if fields.base { decoder.read_u16()? } else { 0 };

    let register_count = if fields.count {
        decoder.read_u16()?
    } else if tfc == TFC_WRITE_HOLDING {
        1
    } else if tfc == TFC_NULL {
        62
    } else {
        0
    };

    let register_values = if fields.values {
        decoder.read_u16_vec(register_count as usize)?
    } else {
        Vec::new()
    };

    let response = match tfc {
        TFC_NULL => TransparentResponse::Null(NullResponse {
            slave_address,
            inverter_serial_number,
            register_values,
            error,
        }),
        TFC_READ_HOLDING => TransparentResponse::ReadHolding(ReadRegistersResponse {
            slave_address,
            inverter_serial_number,
            base_register,
            register_count,
            register_values,
            error,
        }),
        TFC_READ_INPUT => TransparentResponse::ReadInput(ReadRegistersResponse {
            slave_address,
            inverter_serial_number,
            base_register,
            register_count,
            register_values,
            error,
        }),
        TFC_READ_BATTERY => TransparentResponse::ReadBatteryInput(ReadRegistersResponse {
            slave_address,
            inverter_serial_number,
            base_register,
            register_count,
            register_values,
            error,
        }),
        TFC_WRITE_HOLDING => TransparentResponse::WriteHolding(WriteHoldingRegisterResponse {
            slave_address,
            inverter_serial_number,
            register: base_register,
            value: *register_values.first().ok_or_else(|| {
                GivEnergyError::InvalidPduState("write-holding response missing value".into())
            })?,
            error,
        }),
        other => {
            return Err(GivEnergyError::invalid_frame(format!(
                "unknown transparent function code {other}"
            )))
        }
    };

    let crc_payload_end = decoder.pos();
    let crc_span_end = crc_payload_end + 2;
    if crc_span_end > decoder.full_data().len() {
        return Err(GivEnergyError::invalid_frame("frame too short for CRC"));
    }
    split_and_verify_crc(&decoder.full_data()[crc_start..crc_span_end])?;
    let _check = decoder.read_u16()?; // already verified above

    Ok(response)
}
