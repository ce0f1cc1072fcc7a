//! A library for an RS-485 soil probe driven irrigation controller.
//!
//! The crate is organized bottom-up:
//!
//! 1.  **Wire level**: [`protocol`] holds the Modbus RTU framing (CRC-16,
//!     request construction, response resynchronization and validation) and
//!     the register map of the soil probe. [`transport`] drives the half-duplex
//!     exchange over a [`transport::SerialChannel`] with explicit direction
//!     control; [`serial`] provides the channel for a real serial port.
//! 2.  **Devices**: [`soil_sensor::ModbusSoilSensor`] turns the probe's register
//!     block into calibrated, range-checked [`sensor::SoilReading`]s;
//!     [`pump::TimedPump`] runs a pump output for a bounded time.
//! 3.  **Control**: [`acquisition`] polls the sensors in a background thread and
//!     publishes into a mutex guarded region; [`controller::WateringController`]
//!     decides from it when to water and stops the pump whenever the data
//!     cannot be trusted.
//!
//! ## Quick Start
//!
//! ```no_run
//! use irrigator_lib::controller::{Components, WateringController};
//! use irrigator_lib::pump::{SysfsGpio, TimedPump};
//! use irrigator_lib::serial::{serial_port_builder, RtsDirection, SerialPortChannel};
//! use irrigator_lib::soil_sensor::ModbusSoilSensor;
//! use irrigator_lib::storage::FileStorage;
//! use irrigator_lib::transport::ModbusTransport;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = serial_port_builder("/dev/ttyUSB0", 9600).open()?;
//!     let direction = RtsDirection::new(port.try_clone()?);
//!     let transport = ModbusTransport::new(SerialPortChannel::new(port), direction);
//!
//!     let gpio = SysfsGpio::new(17);
//!     gpio.export()?;
//!
//!     let mut controller = WateringController::new(Components {
//!         soil: Some(Box::new(ModbusSoilSensor::new(transport, 1))),
//!         environment: None,
//!         pump: Some(Box::new(TimedPump::new(gpio, "pump"))),
//!         storage: Some(Box::new(FileStorage::new("/var/lib/irrigator"))),
//!     });
//!     controller.initialize()?;
//!     loop {
//!         controller.update();
//!         std::thread::sleep(std::time::Duration::from_millis(100));
//!     }
//! }
//! ```

pub mod acquisition;
pub mod controller;
pub mod error;
pub mod protocol;
pub mod pump;
pub mod sensor;
pub mod soil_sensor;
pub mod storage;
pub mod transport;

#[cfg_attr(docsrs, doc(cfg(feature = "serial")))]
#[cfg(feature = "serial")]
pub mod serial;

pub use error::{Error, Result};
