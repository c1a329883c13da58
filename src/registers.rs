use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::FairMutex;

use crate::error::GpioError;
use crate::gpio::State;

/// Registers of a GPIO bank. Bit `n` of each register belongs to pin `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// 1 = output, 0 = input.
    Direction,
    Enable,
    /// Level driven on output pins.
    Output,
    /// Live level of every pin. Read-only.
    Input,
}

impl Register {
    pub fn offset(self) -> u32 {
        match self {
            Register::Direction => 0x00,
            Register::Enable => 0x04,
            Register::Output => 0x08,
            Register::Input => 0x0c,
        }
    }
}

/// Hardware behind a register bank. Implementations must be internally
/// synchronized; `wait_input` runs concurrently with register access.
pub trait RegisterBackend: Send + Sync {
    fn read_register(&self, register: Register) -> Result<u32, GpioError>;
    fn write_register(&self, register: Register, value: u32) -> Result<(), GpioError>;

    /// Blocks until an input level may have changed or `timeout` elapses.
    fn wait_input(&self, timeout: Duration) -> Result<(), GpioError> {
        thread::sleep(timeout);
        Ok(())
    }
}

/// Masked, exclusive access to a backend's registers.
pub struct RegisterAccess {
    backend: Arc<dyn RegisterBackend>,
    pin_count: u32,
    bus: FairMutex<()>,
}

impl RegisterAccess {
    pub fn new(backend: Arc<dyn RegisterBackend>, pin_count: u32) -> Self {
        Self {
            backend,
            pin_count,
            bus: FairMutex::new(()),
        }
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count
    }

    pub fn mask(&self) -> u32 {
        pin_mask(self.pin_count)
    }

    pub fn read_register(&self, register: Register) -> Result<u32, GpioError> {
        let _bus = self.bus.lock();
        Ok(self.backend.read_register(register)? & self.mask())
    }

    pub fn write_register(&self, register: Register, value: u32) -> Result<(), GpioError> {
        if register == Register::Input {
            return Err(GpioError::HardwareFault(format!(
                "register {:#04x} is read-only",
                register.offset()
            )));
        }
        let _bus = self.bus.lock();
        self.backend.write_register(register, value & self.mask())
    }

    pub fn read_level(&self, pin: u32) -> Result<State, GpioError> {
        let levels = self.read_register(Register::Input)?;
        Ok(State::from_bit(levels & (1 << pin) != 0))
    }

    pub fn wait_input(&self, timeout: Duration) -> Result<(), GpioError> {
        self.backend.wait_input(timeout)
    }
}

pub(crate) fn pin_mask(pin_count: u32) -> u32 {
    if pin_count >= 32 {
        u32::MAX
    } else {
        (1u32 << pin_count) - 1
    }
}

/// Calls `ready` every `slice` until it reports a change or `timeout`
/// elapses. Nothing is held between calls, so `ready` should only take its
/// locks for a non-blocking check.
#[cfg_attr(not(feature = "hardware-gpio"), allow(dead_code))]
pub(crate) fn wait_sliced(
    timeout: Duration,
    slice: Duration,
    mut ready: impl FnMut() -> Result<bool, GpioError>,
) -> Result<(), GpioError> {
    let deadline = Instant::now() + timeout;
    loop {
        if ready()? {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep(slice.min(deadline - now));
    }
}

/// Returns `value` with `pin`'s bit set to `on`.
pub(crate) fn with_bit(value: u32, pin: u32, on: bool) -> u32 {
    if on {
        value | (1 << pin)
    } else {
        value & !(1 << pin)
    }
}
