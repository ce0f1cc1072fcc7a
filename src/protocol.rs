//! Modbus RTU wire format and the register map of the RS485 soil probe.
//!
//! Everything in here is pure: frames are built from values and responses are
//! validated from byte slices. The [`crate::transport`] module moves the bytes.

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Function code: Read Holding Registers.
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
/// Function code: Write Single Register.
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
/// Bit set in the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Maximum number of registers in one Read Holding Registers request.
pub const MAX_READ_REGISTERS: u16 = 125;
/// Both supported requests are exactly eight bytes long.
pub const REQUEST_LEN: usize = 8;
/// An exception response is `address | function | code | crc(2)`.
pub const EXCEPTION_RESPONSE_LEN: usize = 5;
/// How many leading noise bytes are scanned for the start of a response.
pub const MAX_RESYNC_OFFSET: usize = 4;

/// Calculates the Modbus CRC-16 of `data`.
///
/// The result is sent low byte first.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Reads the little-endian CRC stored in the last two bytes of `frame`.
fn trailing_crc(frame: &[u8]) -> u16 {
    let len = frame.len();
    u16::from_le_bytes([frame[len - 2], frame[len - 1]])
}

/// An eight byte request frame, immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFrame([u8; REQUEST_LEN]);

impl RequestFrame {
    fn build(address: u8, function: u8, first: u16, second: u16) -> Self {
        let [first_hi, first_lo] = first.to_be_bytes();
        let [second_hi, second_lo] = second.to_be_bytes();
        let mut frame = [
            address, function, first_hi, first_lo, second_hi, second_lo, 0, 0,
        ];
        let [crc_lo, crc_hi] = crc16(&frame[..6]).to_le_bytes();
        frame[6] = crc_lo;
        frame[7] = crc_hi;
        Self(frame)
    }

    /// Builds a Read Holding Registers request.
    ///
    /// Fails with [`Error::InvalidRegisterCount`] for more than 125 registers.
    pub fn read_holding_registers(address: u8, start: u16, count: u16) -> Result<Self> {
        if count > MAX_READ_REGISTERS {
            return Err(Error::InvalidRegisterCount(count));
        }
        Ok(Self::build(address, READ_HOLDING_REGISTERS, start, count))
    }

    /// Builds a Write Single Register request.
    pub fn write_single_register(address: u8, register: u16, value: u16) -> Self {
        Self::build(address, WRITE_SINGLE_REGISTER, register, value)
    }

    pub fn address(&self) -> u8 {
        self.0[0]
    }

    pub fn function(&self) -> u8 {
        self.0[1]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for RequestFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X?}", self.0)
    }
}

/// Expected length of a Read Holding Registers response for `count` registers.
pub const fn read_response_len(count: u16) -> usize {
    5 + 2 * count as usize
}

/// Scans the first bytes of `buf` for `[address, function]` or its exception variant.
///
/// Returns the offset at which the response frame starts.
pub fn find_frame_start(buf: &[u8], address: u8, function: u8) -> Option<usize> {
    let last = MAX_RESYNC_OFFSET.min(buf.len().saturating_sub(2));
    (0..=last).find(|&offset| {
        buf.len() >= offset + 2
            && buf[offset] == address
            && (buf[offset + 1] == function || buf[offset + 1] == function | EXCEPTION_FLAG)
    })
}

/// Returns `true` when `buf` holds enough bytes to stop waiting for a response.
///
/// Used by the receive loop: either the full expected frame is present behind
/// the detected start, a complete exception frame is present, or no frame
/// start can be found anymore within the scan window.
pub fn response_complete(buf: &[u8], address: u8, function: u8, expected_len: usize) -> bool {
    match find_frame_start(buf, address, function) {
        Some(offset) => {
            let frame = &buf[offset..];
            if frame[1] & EXCEPTION_FLAG != 0 {
                frame.len() >= EXCEPTION_RESPONSE_LEN
            } else {
                frame.len() >= expected_len
            }
        }
        None => buf.len() >= expected_len + MAX_RESYNC_OFFSET,
    }
}

/// Decodes an exception frame that starts at `frame[0]`.
fn decode_exception(frame: &[u8]) -> Error {
    if frame.len() < EXCEPTION_RESPONSE_LEN {
        return Error::IncompleteResponse {
            expected: EXCEPTION_RESPONSE_LEN,
            received: frame.len(),
        };
    }
    let frame = &frame[..EXCEPTION_RESPONSE_LEN];
    let expected = trailing_crc(frame);
    let actual = crc16(&frame[..EXCEPTION_RESPONSE_LEN - 2]);
    if expected != actual {
        return Error::CrcError { expected, actual };
    }
    Error::ModbusException(frame[2])
}

/// Validates a Read Holding Registers response and decodes it into `registers`.
///
/// The number of requested registers is `registers.len()`. Leading noise
/// bytes in front of the frame are skipped. `registers` is only written once
/// the whole frame has been validated.
pub fn decode_read_response(buf: &[u8], address: u8, registers: &mut [u16]) -> Result<()> {
    let count = registers.len();
    let expected_len = read_response_len(count as u16);
    let offset = find_frame_start(buf, address, READ_HOLDING_REGISTERS).unwrap_or(0);
    let frame = &buf[offset..];

    if frame.len() >= 2
        && frame[0] == address
        && frame[1] == READ_HOLDING_REGISTERS | EXCEPTION_FLAG
    {
        return Err(decode_exception(frame));
    }
    if frame.len() < expected_len {
        return Err(Error::IncompleteResponse {
            expected: expected_len,
            received: frame.len(),
        });
    }
    let frame = &frame[..expected_len];
    if frame[0] != address {
        return Err(Error::WrongDeviceAddress);
    }
    if frame[1] != READ_HOLDING_REGISTERS {
        return Err(Error::WrongFunctionCode(frame[1]));
    }
    if frame[2] as usize != 2 * count {
        return Err(Error::WrongByteCount(frame[2]));
    }
    let expected = trailing_crc(frame);
    let actual = crc16(&frame[..expected_len - 2]);
    if expected != actual {
        return Err(Error::CrcError { expected, actual });
    }

    for (register, bytes) in registers.iter_mut().zip(frame[3..].chunks_exact(2)) {
        *register = u16::from_be_bytes([bytes[0], bytes[1]]);
    }
    Ok(())
}

/// Validates that `buf` holds the echo of a Write Single Register `request`.
pub fn verify_write_echo(request: &RequestFrame, buf: &[u8]) -> Result<()> {
    let offset = find_frame_start(buf, request.address(), request.function()).unwrap_or(0);
    let frame = &buf[offset..];

    if frame.len() >= 2
        && frame[0] == request.address()
        && frame[1] == request.function() | EXCEPTION_FLAG
    {
        return Err(decode_exception(frame));
    }
    if frame.len() < REQUEST_LEN {
        return Err(Error::IncompleteResponse {
            expected: REQUEST_LEN,
            received: frame.len(),
        });
    }
    let frame = &frame[..REQUEST_LEN];
    if frame[..6] != request.as_bytes()[..6] {
        return Err(Error::EchoMismatch);
    }
    let expected = trailing_crc(frame);
    let actual = crc16(&frame[..6]);
    if expected != actual {
        return Err(Error::CrcError { expected, actual });
    }
    Ok(())
}

pub const FACTORY_DEFAULT_ADDRESS: u8 = 0x01;
pub const ADDRESS_MIN: u8 = 1;
pub const ADDRESS_MAX: u8 = 247;

/// First register of the measurement block of the soil probe.
pub const SOIL_BLOCK_REG_ADDR: u16 = 0x0000;
/// Number of registers in the measurement block.
pub const SOIL_BLOCK_REG_QUAN: u16 = 8;
/// First register of the calibration factor block, one register per parameter.
pub const SOIL_CALIBRATION_REG_ADDR: u16 = 0x0050;
/// Calibration factors are stored on the probe in thousandths.
pub const SOIL_CALIBRATION_SCALE: f32 = 1000.0;

/// A quantity measured by the soil probe.
///
/// The discriminant is the register offset within the measurement block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SoilParameter {
    Moisture = 0,
    Temperature = 1,
    Ph = 2,
    Ec = 3,
    Nitrogen = 4,
    Phosphorus = 5,
    Potassium = 6,
    Humidity = 7,
}

impl SoilParameter {
    pub const ALL: [SoilParameter; SOIL_BLOCK_REG_QUAN as usize] = [
        SoilParameter::Moisture,
        SoilParameter::Temperature,
        SoilParameter::Ph,
        SoilParameter::Ec,
        SoilParameter::Nitrogen,
        SoilParameter::Phosphorus,
        SoilParameter::Potassium,
        SoilParameter::Humidity,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn register(&self) -> u16 {
        SOIL_BLOCK_REG_ADDR + *self as u16
    }

    pub fn calibration_register(&self) -> u16 {
        SOIL_CALIBRATION_REG_ADDR + *self as u16
    }

    pub fn name(&self) -> &'static str {
        match self {
            SoilParameter::Moisture => "moisture",
            SoilParameter::Temperature => "temperature",
            SoilParameter::Ph => "ph",
            SoilParameter::Ec => "ec",
            SoilParameter::Nitrogen => "nitrogen",
            SoilParameter::Phosphorus => "phosphorus",
            SoilParameter::Potassium => "potassium",
            SoilParameter::Humidity => "humidity",
        }
    }

    /// An out-of-range value of a critical parameter fails the whole read.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            SoilParameter::Moisture
                | SoilParameter::Temperature
                | SoilParameter::Humidity
                | SoilParameter::Ph
        )
    }

    /// Converts a raw register value into engineering units, without calibration.
    pub fn decode(&self, raw: u16) -> f32 {
        match self {
            SoilParameter::Moisture | SoilParameter::Ph | SoilParameter::Humidity => {
                raw as f32 / 10.0
            }
            // Signed 16 bit with 0.1 °C resolution
            SoilParameter::Temperature => raw as i16 as f32 / 10.0,
            SoilParameter::Ec
            | SoilParameter::Nitrogen
            | SoilParameter::Phosphorus
            | SoilParameter::Potassium => raw as f32,
        }
    }

    /// Valid range applied unless overridden on the sensor.
    pub fn default_range(&self) -> (f32, f32) {
        match self {
            SoilParameter::Moisture | SoilParameter::Humidity => (0.0, 100.0),
            SoilParameter::Temperature => (-40.0, 80.0),
            SoilParameter::Ph => (3.0, 9.0),
            SoilParameter::Ec => (0.0, 20_000.0),
            SoilParameter::Nitrogen | SoilParameter::Phosphorus | SoilParameter::Potassium => {
                (0.0, 2_000.0)
            }
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            SoilParameter::Moisture | SoilParameter::Humidity => "%",
            SoilParameter::Temperature => "°C",
            SoilParameter::Ph => "pH",
            SoilParameter::Ec => "µS/cm",
            SoilParameter::Nitrogen | SoilParameter::Phosphorus | SoilParameter::Potassium => {
                "mg/kg"
            }
        }
    }
}

impl fmt::Display for SoilParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SoilParameter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SoilParameter::ALL
            .into_iter()
            .find(|parameter| parameter.name().eq_ignore_ascii_case(s))
            .ok_or(Error::InvalidArgument)
    }
}

/// Encodes a calibration factor for the probe's calibration register.
pub fn calibration_factor_encode(factor: f32) -> Result<u16> {
    let scaled = (factor * SOIL_CALIBRATION_SCALE).round();
    if scaled.is_finite() && (0.0..=u16::MAX as f32).contains(&scaled) {
        Ok(scaled as u16)
    } else {
        Err(Error::InvalidArgument)
    }
}
