mod backend;
mod config;
mod controller;
mod dispatch;
mod engine;
mod error;
pub mod ffi;
mod gpio;
mod registers;
mod table;

pub use config::{BackendConfig, CONFIG_ENV, ControllerConfig, MAX_PINS};
pub use controller::Controller;
pub use error::GpioError;
pub use gpio::{Direction, State, TransitionEvent, UserData};
pub use registers::{Register, RegisterBackend};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::{MockGpioBackend, SysfsBackend, open_backend};
