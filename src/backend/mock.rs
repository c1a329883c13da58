use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::GpioError;
use crate::gpio::State;
use crate::registers::{Register, RegisterBackend, with_bit};

/// In-memory register bank. Input levels are driven by the test through
/// [`MockGpioBackend::drive_input`]; output pins loop back into `Input`.
#[derive(Default)]
pub struct MockGpioBackend {
    registers: Mutex<MockRegisters>,
    input_changed: Condvar,
    reads: AtomicUsize,
    writes: AtomicUsize,
    faulted: AtomicBool,
    read_faulted: AtomicBool,
}

#[derive(Default)]
struct MockRegisters {
    direction: u32,
    enable: u32,
    output: u32,
    external: u32,
    dirty: bool,
}

impl MockRegisters {
    fn input(&self) -> u32 {
        (self.external & !self.direction) | (self.output & self.direction)
    }
}

impl MockGpioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the externally applied level of `pin` and wakes the monitor.
    pub fn drive_input(&self, pin: u32, state: State) {
        let mut regs = self.registers.lock();
        regs.external = with_bit(regs.external, pin, state.is_high());
        regs.dirty = true;
        self.input_changed.notify_all();
    }

    /// Makes every register access fail until cleared.
    pub fn set_fault(&self, faulted: bool) {
        self.faulted.store(faulted, Ordering::SeqCst);
    }

    /// Makes register reads fail while writes keep working.
    pub fn set_read_fault(&self, faulted: bool) {
        self.read_faulted.store(faulted, Ordering::SeqCst);
    }

    pub fn register_reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn register_writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Peeks at a register without counting an access.
    pub fn register(&self, register: Register) -> u32 {
        let regs = self.registers.lock();
        match register {
            Register::Direction => regs.direction,
            Register::Enable => regs.enable,
            Register::Output => regs.output,
            Register::Input => regs.input(),
        }
    }

    fn check_fault(&self) -> Result<(), GpioError> {
        if self.faulted.load(Ordering::SeqCst) {
            Err(GpioError::HardwareFault("mock device unavailable".into()))
        } else {
            Ok(())
        }
    }
}

impl RegisterBackend for MockGpioBackend {
    fn read_register(&self, register: Register) -> Result<u32, GpioError> {
        self.check_fault()?;
        if self.read_faulted.load(Ordering::SeqCst) {
            return Err(GpioError::HardwareFault("mock input latch unreadable".into()));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.register(register))
    }

    fn write_register(&self, register: Register, value: u32) -> Result<(), GpioError> {
        self.check_fault()?;
        self.writes.fetch_add(1, Ordering::SeqCst);

        let mut regs = self.registers.lock();
        match register {
            Register::Direction => regs.direction = value,
            Register::Enable => regs.enable = value,
            Register::Output => regs.output = value,
            Register::Input => {
                return Err(GpioError::HardwareFault(
                    "input register is read-only".into(),
                ));
            }
        }
        Ok(())
    }

    fn wait_input(&self, timeout: Duration) -> Result<(), GpioError> {
        let mut regs = self.registers.lock();
        if !regs.dirty {
            self.input_changed.wait_for(&mut regs, timeout);
        }
        regs.dirty = false;
        Ok(())
    }
}
