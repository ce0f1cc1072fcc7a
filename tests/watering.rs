//! End to end: simulated soil probe on the bus, background acquisition,
//! decision pass and pump.

use irrigator_lib::controller::{CONFIG_KEY, Components, Decision, WateringController};
use irrigator_lib::protocol::{self as proto, crc16};
use irrigator_lib::pump::{PumpOutput, TimedPump};
use irrigator_lib::soil_sensor::ModbusSoilSensor;
use irrigator_lib::storage::{DataStorage, MemoryStorage};
use irrigator_lib::transport::{AutoDirection, ModbusTransport, SerialChannel};
use irrigator_lib::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const PROBE_ADDRESS: u8 = 0x01;

/// A soil probe answering Modbus requests from its register block.
struct SimulatedProbe {
    registers: Arc<Mutex<[u16; 8]>>,
    silent: Arc<AtomicBool>,
    pending: Vec<u8>,
}

impl SimulatedProbe {
    fn respond(&self, request: &[u8]) -> Vec<u8> {
        let address = request[0];
        let function = request[1];
        let start = u16::from_be_bytes([request[2], request[3]]) as usize;
        let mut response = match function {
            proto::READ_HOLDING_REGISTERS => {
                let count = u16::from_be_bytes([request[4], request[5]]) as usize;
                let registers = self.registers.lock().unwrap();
                if start + count > registers.len() {
                    vec![address, function | proto::EXCEPTION_FLAG, 0x02]
                } else {
                    let mut response = vec![address, function, (2 * count) as u8];
                    for register in &registers[start..start + count] {
                        response.extend_from_slice(&register.to_be_bytes());
                    }
                    response
                }
            }
            proto::WRITE_SINGLE_REGISTER => request[..6].to_vec(),
            _ => vec![address, function | proto::EXCEPTION_FLAG, 0x01],
        };
        let crc = crc16(&response);
        response.extend_from_slice(&crc.to_le_bytes());
        response
    }
}

impl SerialChannel for SimulatedProbe {
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = self.pending.len().min(buf.len());
        buf[..len].copy_from_slice(&self.pending[..len]);
        self.pending.drain(..len);
        Ok(len)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if !self.silent.load(Ordering::SeqCst) && data.len() == proto::REQUEST_LEN {
            let response = self.respond(data);
            self.pending.extend(response);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct Relay(Arc<Mutex<Vec<bool>>>);

impl PumpOutput for Relay {
    fn set(&mut self, on: bool) -> Result<()> {
        self.0.lock().unwrap().push(on);
        Ok(())
    }
}

struct Rig {
    controller: WateringController,
    registers: Arc<Mutex<[u16; 8]>>,
    silent: Arc<AtomicBool>,
    relay: Relay,
}

fn rig(moisture_raw: u16) -> Rig {
    let registers = Arc::new(Mutex::new([moisture_raw, 215, 65, 900, 30, 40, 50, 550]));
    let silent = Arc::new(AtomicBool::new(false));
    let probe = SimulatedProbe {
        registers: registers.clone(),
        silent: silent.clone(),
        pending: Vec::new(),
    };
    let mut transport = ModbusTransport::new(probe, AutoDirection);
    transport.set_timeout(Duration::from_millis(50));

    let mut storage = MemoryStorage::new();
    storage
        .store_config(
            CONFIG_KEY,
            r#"{"sensorReadInterval":100,"wateringDuration":300}"#,
        )
        .unwrap();

    let relay = Relay::default();
    let mut controller = WateringController::new(Components {
        soil: Some(Box::new(ModbusSoilSensor::new(transport, PROBE_ADDRESS))),
        environment: None,
        pump: Some(Box::new(TimedPump::new(relay.clone(), "pump"))),
        storage: Some(Box::new(storage)),
    });
    controller.initialize().unwrap();
    Rig {
        controller,
        registers,
        silent,
        relay,
    }
}

fn wait_for(
    controller: &mut WateringController,
    condition: impl Fn(&mut WateringController) -> bool,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        controller.update();
        if condition(controller) {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn dry_soil_is_watered_until_wet() {
    let Rig {
        mut controller,
        registers,
        relay,
        ..
    } = rig(200);
    assert!(controller.is_automatic());
    assert_eq!(controller.last_error(), None);

    assert!(wait_for(&mut controller, |c| c.is_pump_running()));
    assert_eq!(controller.last_decision(), Some(Decision::Started));
    assert_eq!(controller.current_moisture(), Some(20.0));

    registers.lock().unwrap()[0] = 700;
    assert!(wait_for(&mut controller, |c| !c.is_pump_running()));
    assert_eq!(controller.last_decision(), Some(Decision::StoppedEarly));

    drop(controller);
    assert_eq!(*relay.0.lock().unwrap(), vec![false, true, false]);
}

#[test]
fn silent_probe_stops_the_pump() {
    let Rig {
        mut controller,
        silent,
        relay,
        ..
    } = rig(150);
    assert!(wait_for(&mut controller, |c| c.is_pump_running()));

    silent.store(true, Ordering::SeqCst);
    assert!(wait_for(&mut controller, |c| !c.is_pump_running()));
    assert_eq!(controller.last_error(), Some(Error::SensorReadFailed));
    assert_eq!(controller.current_moisture(), None);
    assert_eq!(relay.0.lock().unwrap().last(), Some(&false));
}

#[test]
fn implausible_probe_data_never_starts_the_pump() {
    // Moisture register 1500 decodes to 150 %.
    let Rig {
        mut controller,
        relay,
        ..
    } = rig(1500);
    let deadline = Instant::now() + Duration::from_millis(500);
    while Instant::now() < deadline {
        controller.update();
        assert!(!controller.is_pump_running());
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(controller.last_error(), Some(Error::SensorReadFailed));
    assert_eq!(*relay.0.lock().unwrap(), vec![false]);
}

#[test]
fn manual_watering_without_probe() {
    let relay = Relay::default();
    let mut controller = WateringController::new(Components {
        pump: Some(Box::new(TimedPump::new(relay.clone(), "pump"))),
        storage: Some(Box::new(MemoryStorage::new())),
        ..Default::default()
    });
    controller.manual_watering(Duration::from_millis(200)).unwrap();
    assert!(controller.is_pump_running());
    assert!(wait_for(&mut controller, |c| !c.is_pump_running()));
    assert_eq!(*relay.0.lock().unwrap(), vec![false, true, false]);
}
