//! Modbus RTU master over a half-duplex RS485 channel.
//!
//! The [`ModbusTransport`] owns a [`SerialChannel`] and a [`DirectionControl`]
//! line and performs one request/response exchange per call. It never retries
//! on its own and never waits longer than its configured timeout for a
//! response.
//!
//! ```no_run
//! # #[cfg(feature = "serial")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use irrigator_lib::serial::{serial_port_builder, RtsDirection, SerialPortChannel};
//! use irrigator_lib::transport::{ModbusClient, ModbusTransport};
//!
//! let port = serial_port_builder("/dev/ttyUSB0", 9600).open()?;
//! let direction = RtsDirection::new(port.try_clone()?);
//! let mut transport = ModbusTransport::new(SerialPortChannel::new(port), direction);
//!
//! let mut registers = [0u16; 8];
//! transport.read_holding_registers(0x01, 0x0000, &mut registers)?;
//! println!("Registers: {registers:?}");
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "serial"))]
//! # fn main() {}
//! ```

use crate::{protocol as proto, Error, Result};
use log::*;
use std::thread;
use std::time::{Duration, Instant};

/// Default response timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
/// Default settling time after switching the transceiver direction.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_micros(50);
/// Sleep between two polls of an empty receive buffer.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A byte channel to the bus, typically a UART.
pub trait SerialChannel {
    /// Reads whatever is currently buffered into `buf` without blocking.
    ///
    /// Returns `0` when nothing has arrived yet.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Queues `data` for transmission.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Blocks until all queued bytes have left the transmitter.
    fn flush(&mut self) -> Result<()>;

    /// Discards every byte received so far.
    fn clear_input(&mut self) -> Result<()>;
}

/// The DE/RE line of a half-duplex transceiver.
pub trait DirectionControl {
    fn set_transmit(&mut self) -> Result<()>;
    fn set_receive(&mut self) -> Result<()>;
}

/// Direction control for transceivers that switch automatically.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoDirection;

impl DirectionControl for AutoDirection {
    fn set_transmit(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_receive(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<D: DirectionControl + ?Sized> DirectionControl for Box<D> {
    fn set_transmit(&mut self) -> Result<()> {
        (**self).set_transmit()
    }

    fn set_receive(&mut self) -> Result<()> {
        (**self).set_receive()
    }
}

/// The two Modbus functions the soil probe needs.
pub trait ModbusClient {
    /// Prepares the bus for use. Calling it again is a no-op.
    fn initialize(&mut self) -> Result<()>;

    /// Reads `registers.len()` holding registers starting at `start`.
    ///
    /// On failure `registers` is left untouched.
    fn read_holding_registers(&mut self, address: u8, start: u16, registers: &mut [u16])
        -> Result<()>;

    /// Writes a single holding register and checks the echoed response.
    fn write_single_register(&mut self, address: u8, register: u16, value: u16) -> Result<()>;

    /// The error of the most recent exchange, `None` after a success.
    fn last_error(&self) -> Option<Error>;
}

/// Success and error counters of a transport.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    pub success_count: u32,
    pub error_count: u32,
}

/// Modbus RTU master.
#[derive(Debug)]
pub struct ModbusTransport<S, D> {
    channel: S,
    direction: D,
    initialized: bool,
    last_error: Option<Error>,
    timeout: Duration,
    settle_delay: Duration,
    statistics: Statistics,
}

impl<S: SerialChannel, D: DirectionControl> ModbusTransport<S, D> {
    pub fn new(channel: S, direction: D) -> Self {
        Self {
            channel,
            direction,
            initialized: false,
            last_error: None,
            timeout: DEFAULT_TIMEOUT,
            settle_delay: DEFAULT_SETTLE_DELAY,
            statistics: Statistics::default(),
        }
    }

    /// Sets how long to wait for a response after the request has been sent.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sets the settling time after each direction switch.
    ///
    /// This depends on the transceiver: too short corrupts the first or last
    /// bits of a frame, too long wastes bus turnaround time.
    pub fn set_settle_delay(&mut self, delay: Duration) {
        self.settle_delay = delay;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn statistics(&self) -> Statistics {
        self.statistics
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => {
                self.statistics.success_count = self.statistics.success_count.saturating_add(1);
                self.last_error = None;
            }
            Err(err) => {
                self.statistics.error_count = self.statistics.error_count.saturating_add(1);
                self.last_error = Some(*err);
                warn!("Modbus exchange failed: {err}");
            }
        }
        result
    }

    fn ensure_initialized(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.initialize()
    }

    fn transmit(&mut self, request: &proto::RequestFrame) -> Result<()> {
        // Leftovers of a previous failed exchange would shift the response.
        self.channel.clear_input()?;

        self.direction.set_transmit()?;
        thread::sleep(self.settle_delay);
        debug!("TX {request}");
        let sent = self
            .channel
            .write_all(request.as_bytes())
            .and_then(|_| self.channel.flush());
        // Always release the bus, even when the write failed.
        let released = self.direction.set_receive();
        thread::sleep(self.settle_delay);
        sent.and(released)
    }

    fn receive(&mut self, address: u8, function: u8, expected_len: usize) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let mut response = Vec::with_capacity(expected_len + proto::MAX_RESYNC_OFFSET);
        let mut chunk = [0u8; 64];
        loop {
            let received = self.channel.read_available(&mut chunk)?;
            response.extend_from_slice(&chunk[..received]);
            if proto::response_complete(&response, address, function, expected_len) {
                break;
            }
            if Instant::now() >= deadline {
                debug!(
                    "Response timeout after {:?}, received {} bytes",
                    self.timeout,
                    response.len()
                );
                break;
            }
            if received == 0 {
                thread::sleep(RECEIVE_POLL_INTERVAL);
            }
        }
        debug!("RX {response:02X?}");
        Ok(response)
    }

    fn exchange_read(&mut self, address: u8, start: u16, registers: &mut [u16]) -> Result<()> {
        let count = u16::try_from(registers.len()).unwrap_or(u16::MAX);
        let request = proto::RequestFrame::read_holding_registers(address, start, count)?;
        self.ensure_initialized()?;
        self.transmit(&request)?;
        let response = self.receive(
            address,
            proto::READ_HOLDING_REGISTERS,
            proto::read_response_len(count),
        )?;
        proto::decode_read_response(&response, address, registers)
    }

    fn exchange_write(&mut self, address: u8, register: u16, value: u16) -> Result<()> {
        let request = proto::RequestFrame::write_single_register(address, register, value);
        self.ensure_initialized()?;
        self.transmit(&request)?;
        let response = self.receive(address, proto::WRITE_SINGLE_REGISTER, proto::REQUEST_LEN)?;
        proto::verify_write_echo(&request, &response)
    }
}

impl<S: SerialChannel, D: DirectionControl> ModbusClient for ModbusTransport<S, D> {
    fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.direction.set_receive()?;
        thread::sleep(self.settle_delay);
        self.channel.clear_input()?;
        self.initialized = true;
        self.last_error = None;
        debug!("Modbus transport initialized");
        Ok(())
    }

    fn read_holding_registers(
        &mut self,
        address: u8,
        start: u16,
        registers: &mut [u16],
    ) -> Result<()> {
        let result = self.exchange_read(address, start, registers);
        self.record(result)
    }

    fn write_single_register(&mut self, address: u8, register: u16, value: u16) -> Result<()> {
        let result = self.exchange_write(address, register, value);
        self.record(result)
    }

    fn last_error(&self) -> Option<Error> {
        self.last_error
    }
}
