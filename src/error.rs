//! Error taxonomy shared by the transport, the sensor adapters and the
//! watering controller.
//!
//! All errors are plain values (`Copy`), so state holders can keep the most
//! recent one around and hand it out through their `last_error()` accessor.

/// Represents every failure the controller stack can report.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The component was used before it was initialized, or initialization failed.
    #[error("Not initialized")]
    NotInitialized,

    /// More registers requested than a single Modbus frame can carry.
    #[error("Invalid register count: {0} (maximum is 125)")]
    InvalidRegisterCount(u16),

    /// The response did not arrive completely before the timeout.
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: usize, received: usize },

    /// The response frame does not start with the addressed device.
    #[error("Wrong device address in response")]
    WrongDeviceAddress,

    /// The response carries an unexpected function code.
    #[error("Wrong function code in response: 0x{0:02X}")]
    WrongFunctionCode(u8),

    /// The device answered with a Modbus exception response.
    #[error("Modbus exception code 0x{0:02X}")]
    ModbusException(u8),

    /// The byte count field does not match the requested register count.
    #[error("Wrong byte count in response: {0}")]
    WrongByteCount(u8),

    /// The trailing CRC does not match the frame content.
    #[error("CRC error: expected 0x{expected:04X}, actual 0x{actual:04X}")]
    CrcError { expected: u16, actual: u16 },

    /// A write single register response is not an echo of the request.
    #[error("Echo mismatch in write response")]
    EchoMismatch,

    /// The serial channel reported an I/O failure.
    #[error("Serial I/O error: {0}")]
    Io(std::io::ErrorKind),

    /// The wire exchange succeeded but the decoded values are implausible.
    #[error("Invalid reading values")]
    InvalidReadingValues,

    /// The raw value used as calibration base is too close to zero.
    #[error("Calibration reference too small")]
    CalibrationReferenceTooSmall,

    /// The pump or the storage were not supplied.
    #[error("Missing critical component")]
    MissingCriticalComponent,

    /// The storage backend could not be initialized.
    #[error("Storage initialization failed")]
    StorageInitFailed,

    /// The pump could not be initialized.
    #[error("Pump initialization failed")]
    PumpInitFailed,

    /// A sensor failed to initialize, automatic watering is degraded.
    #[error("Sensor initialization failed")]
    SensorInitFailed,

    /// The last sensor acquisition failed.
    #[error("Sensor read failed")]
    SensorReadFailed,

    /// The pump is missing or refused the command.
    #[error("Pump invalid")]
    PumpInvalid,

    /// An argument lies outside its accepted range.
    #[error("Invalid argument")]
    InvalidArgument,

    /// The requested threshold would make the low threshold reach the high one.
    #[error("Low moisture threshold must stay below the high threshold")]
    InvalidThresholdOrder,

    /// The storage backend failed to read or write.
    #[error("Storage error")]
    Storage,
}

impl Error {
    /// Numeric code as reported in status output.
    ///
    /// Device exceptions map to `100 + exception code`.
    pub fn code(&self) -> u16 {
        match self {
            Error::NotInitialized => 1,
            Error::InvalidRegisterCount(_) => 2,
            Error::IncompleteResponse { .. } => 3,
            Error::WrongDeviceAddress => 4,
            Error::WrongFunctionCode(_) => 5,
            Error::WrongByteCount(_) => 6,
            Error::CrcError { .. } => 7,
            Error::EchoMismatch => 8,
            Error::Io(_) => 9,
            Error::InvalidReadingValues => 20,
            Error::CalibrationReferenceTooSmall => 21,
            Error::MissingCriticalComponent => 30,
            Error::StorageInitFailed => 31,
            Error::PumpInitFailed => 32,
            Error::SensorInitFailed => 33,
            Error::SensorReadFailed => 34,
            Error::PumpInvalid => 35,
            Error::InvalidArgument => 36,
            Error::InvalidThresholdOrder => 37,
            Error::Storage => 38,
            Error::ModbusException(code) => 100 + *code as u16,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.kind())
    }
}

/// The result type used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_codes_are_offset() {
        assert_eq!(Error::ModbusException(2).code(), 102);
        assert_eq!(Error::CrcError { expected: 0, actual: 1 }.code(), 7);
    }

    #[test]
    fn io_errors_keep_their_kind() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert_eq!(err, Error::Io(std::io::ErrorKind::TimedOut));
    }
}
