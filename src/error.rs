use std::os::raw::c_int;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Invalid pin: {0}")]
    InvalidPin(i64),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Hardware fault: {0}")]
    HardwareFault(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GpioError {
    /// Negative status code reported across the C boundary.
    pub fn code(&self) -> c_int {
        match self {
            GpioError::InvalidPin(_) => -1,
            GpioError::InvalidOperation(_) => -2,
            GpioError::HardwareFault(_) => -3,
            GpioError::Config(_) => -4,
        }
    }
}
