//! C1 (payload codec) and C2 (CRC) primitives shared by the PDU and framer
//! layers.
//!
//! Everything on the wire is big-endian apart from the trailing CRC, which is
//! appended little-endian, and the MBAP frame length, which counts the bytes
//! following itself (unit id + function code + inner frame).

use crc::{Crc, CRC_16_MODBUS};

use crate::error::{GivEnergyError, Result};

/// CRC-16/MODBUS: poly 0xA001 (reflected 0x8005), init 0xFFFF, no final xor.
const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Computes the CRC over `data` the way the inverter does: run the whole
/// slice through CRC-16/MODBUS.
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Appends `crc16(data)` to `data`, little-endian.
pub fn append_crc(data: &mut Vec<u8>) {
    let crc = crc16(data);
    data.extend_from_slice(&crc.to_le_bytes());
}

/// Splits `data` into its payload and trailing little-endian CRC, verifying
/// the CRC matches.
pub fn split_and_verify_crc(data: &[u8]) -> Result<&[u8]> {
    if data.len() < 2 {
        return Err(GivEnergyError::invalid_frame("frame too short for CRC"));
    }
    let (payload, trailer) = data.split_at(data.len() - 2);
    let expected = u16::from_le_bytes([trailer[0], trailer[1]]);
    let actual = crc16(payload);
    if expected != actual {
        return Err(GivEnergyError::invalid_frame(format!(
            "CRC mismatch: expected {expected:#06x}, computed {actual:#06x}"
        )));
    }
    Ok(payload)
}

/// A small cursor over a byte slice for decoding big-endian primitives, used
/// by `pdu.rs`.
pub struct PayloadDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn decoding_complete(&self) -> bool {
        self.pos == self.data.len()
    }

    /// Current cursor offset into the underlying slice, for callers that
    /// need to re-slice a span they've already partially consumed (e.g. to
    /// verify a trailing CRC over a range of already-decoded fields).
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// The full underlying slice, independent of the cursor position.
    pub fn full_data(&self) -> &'a [u8] {
        self.data
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(GivEnergyError::invalid_frame("unexpected end of payload (u8)"));
        }
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        if self.remaining() < 2 {
            return Err(GivEnergyError::invalid_frame("unexpected end of payload (u16)"));
        }
        let v = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    /// Reads `len` raw bytes, e.g. for a serial number field.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(GivEnergyError::invalid_frame("unexpected end of payload (bytes)"));
        }
        let v = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(v)
    }

    /// Reads every remaining 16-bit word (e.g. the VALUES field).
    pub fn read_u16_vec(&mut self, count: usize) -> Result<Vec<u16>> {
        (0..count).map(|_| self.read_u16()).collect()
    }
}

/// A small byte builder for encoding big-endian primitives, used by
/// `pdu.rs`.
#[derive(Default)]
pub struct PayloadEncoder {
    buf: Vec<u8>,
}

impl PayloadEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn add_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn add_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Adds a fixed-width latin-1 string, truncated or NUL-padded to `len`.
    pub fn add_fixed_string(&mut self, s: &str, len: usize) -> &mut Self {
        let mut bytes: Vec<u8> = s.bytes().take(len).collect();
        bytes.resize(len, 0);
        self.buf.extend_from_slice(&bytes);
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Direct access to the buffer, for appending an already-built,
    /// CRC-protected tail rather than one primitive at a time.
    pub fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== CRC tests ==========

    #[test]
    fn crc16_matches_known_vector() {
        // Classic Modbus RTU reference frame: 01 03 00 00 00 0A, CRC bytes on
        // the wire are C5 CD (low byte first), i.e. the register value 0xCDC5.
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];
        assert_eq!(crc16(&data), 0xCDC5);
    }

    #[test]
    fn append_and_verify_round_trips() {
        let mut data = vec![0x31, 0x03, 0x00, 0x01];
        append_crc(&mut data);
        let payload = split_and_verify_crc(&data).unwrap();
        assert_eq!(payload, &[0x31, 0x03, 0x00, 0x01]);
    }

    #[test]
    fn single_bit_flip_is_detected() {
        let mut data = vec![0x31, 0x03, 0x00, 0x01];
        append_crc(&mut data);
        data[0] ^= 0x01;
        assert!(split_and_verify_crc(&data).is_err());
    }

    #[test]
    fn too_short_for_crc_is_an_error() {
        assert!(split_and_verify_crc(&[0x01]).is_err());
    }

    // ========== PayloadEncoder / PayloadDecoder tests ==========

    #[test]
    fn encoder_decoder_round_trip() {
        let mut enc = PayloadEncoder::new();
        enc.add_u8(0x11).add_u16(0x1234).add_fixed_string("AB1234G567", 10);
        let bytes = enc.into_bytes();

        let mut dec = PayloadDecoder::new(&bytes);
        assert_eq!(dec.read_u8().unwrap(), 0x11);
        assert_eq!(dec.read_u16().unwrap(), 0x1234);
        assert_eq!(dec.read_bytes(10).unwrap(), b"AB1234G567");
        assert!(dec.decoding_complete());
    }

    #[test]
    fn fixed_string_pads_with_nul() {
        let mut enc = PayloadEncoder::new();
        enc.add_fixed_string("AB", 5);
        assert_eq!(enc.into_bytes(), vec![b'A', b'B', 0, 0, 0]);
    }

    #[test]
    fn fixed_string_truncates_overlong_input() {
        let mut enc = PayloadEncoder::new();
        enc.add_fixed_string("ABCDEFGH", 4);
        assert_eq!(enc.into_bytes(), vec![b'A', b'B', b'C', b'D']);
    }

    #[test]
    fn decoder_errors_on_short_read() {
        let data = [0x01];
        let mut dec = PayloadDecoder::new(&data);
        assert!(dec.read_u16().is_err());
    }

    #[test]
    fn read_u16_vec_reads_requested_count() {
        let mut enc = PayloadEncoder::new();
        enc.add_u16(1).add_u16(2).add_u16(3);
        let bytes = enc.into_bytes();
        let mut dec = PayloadDecoder::new(&bytes);
        assert_eq!(dec.read_u16_vec(3).unwrap(), vec![1, 2, 3]);
    }
}
