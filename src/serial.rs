//! Serial port plumbing for the RS485 transport.
//!
//! It provides the port builder with the line settings of the soil probe and
//! the [`SerialChannel`] / [`DirectionControl`] implementations on top of a
//! `tokio_serial::SerialPort`.
use crate::transport::{DirectionControl, SerialChannel};
use crate::{Error, Result};
use std::io::{Read, Write};
use std::time::Duration;
use tokio_serial::{ClearBuffer, SerialPort};

/// The parity used for serial communication.
pub const PARITY: &tokio_serial::Parity = &tokio_serial::Parity::None;
/// The number of stop bits used for serial communication.
pub const STOP_BITS: &tokio_serial::StopBits = &tokio_serial::StopBits::One;
/// The number of data bits used for serial communication.
pub const DATA_BITS: &tokio_serial::DataBits = &tokio_serial::DataBits::Eight;
/// The factory baud rate of the soil probe.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Creates a `tokio_serial::SerialPortBuilder` with the specified settings.
///
/// # Arguments
///
/// * `device` - The path to the serial port device (e.g., `/dev/ttyUSB0`).
/// * `baud_rate` - The baud rate for the serial communication.
pub fn serial_port_builder(device: &str, baud_rate: u32) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(device, baud_rate)
        .parity(*PARITY)
        .stop_bits(*STOP_BITS)
        .data_bits(*DATA_BITS)
        .flow_control(tokio_serial::FlowControl::None)
        // Reads only happen after `bytes_to_read` reported data.
        .timeout(Duration::from_millis(10))
}

fn map_serial_error(err: tokio_serial::Error) -> Error {
    Error::Io(std::io::Error::from(err).kind())
}

/// A [`SerialChannel`] backed by an opened serial port.
pub struct SerialPortChannel {
    port: Box<dyn SerialPort>,
}

impl SerialPortChannel {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl std::fmt::Debug for SerialPortChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPortChannel")
            .field("port", &self.port.name())
            .finish()
    }
}

impl SerialChannel for SerialPortChannel {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let pending = self.port.bytes_to_read().map_err(map_serial_error)? as usize;
        if pending == 0 {
            return Ok(0);
        }
        let len = pending.min(buf.len());
        match self.port.read(&mut buf[..len]) {
            Ok(received) => Ok(received),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        Ok(Write::write_all(&mut self.port, data)?)
    }

    fn flush(&mut self) -> Result<()> {
        // Drains the transmit queue on the tty.
        Ok(Write::flush(&mut self.port)?)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(map_serial_error)
    }
}

/// Drives DE/RE through the RTS line of the port.
///
/// Most USB to RS485 adapters without automatic direction control wire the
/// transceiver enable to RTS.
pub struct RtsDirection {
    port: Box<dyn SerialPort>,
    active_high: bool,
}

impl RtsDirection {
    /// `port` is usually a `try_clone()` of the port used for the data.
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            active_high: true,
        }
    }

    /// Inverts the line for adapters that enable the driver on low RTS.
    pub fn inverted(mut self) -> Self {
        self.active_high = false;
        self
    }

    fn set(&mut self, transmit: bool) -> Result<()> {
        self.port
            .write_request_to_send(transmit == self.active_high)
            .map_err(map_serial_error)
    }
}

impl DirectionControl for RtsDirection {
    fn set_transmit(&mut self) -> Result<()> {
        self.set(true)
    }

    fn set_receive(&mut self) -> Result<()> {
        self.set(false)
    }
}
