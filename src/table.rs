use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::engine::{EdgeDetector, Transition};
use crate::error::GpioError;
use crate::gpio::{Direction, State};
use crate::registers::{Register, RegisterAccess, with_bit};

#[derive(Debug, Clone, Copy, Default)]
struct PinEntry {
    direction: Direction,
    enabled: bool,
    state: State,
    detector: EdgeDetector,
}

struct Pins {
    entries: Vec<PinEntry>,
    /// Last successfully written `Output` register value.
    latch: u32,
}

impl Pins {
    fn direction_mask(&self) -> u32 {
        self.entries
            .iter()
            .enumerate()
            .fold(0, |acc, (pin, e)| {
                with_bit(acc, pin as u32, e.direction == Direction::Output)
            })
    }

    fn enable_mask(&self) -> u32 {
        self.entries
            .iter()
            .enumerate()
            .fold(0, |acc, (pin, e)| with_bit(acc, pin as u32, e.enabled))
    }
}

/// Authoritative direction, enable flag and state of every pin, kept in sync
/// with the register bank. The inner mutex is the per-controller hardware lock.
pub struct PinTable {
    registers: RegisterAccess,
    pins: Mutex<Pins>,
    epochs: Box<[AtomicU64]>,
}

impl PinTable {
    /// Writes the power-on baseline (all inputs, disabled, low) to the bank.
    pub fn new(registers: RegisterAccess) -> Result<Self, GpioError> {
        let count = registers.pin_count() as usize;

        registers.write_register(Register::Direction, 0)?;
        registers.write_register(Register::Enable, 0)?;
        registers.write_register(Register::Output, 0)?;

        Ok(Self {
            registers,
            pins: Mutex::new(Pins {
                entries: vec![PinEntry::default(); count],
                latch: 0,
            }),
            epochs: (0..count).map(|_| AtomicU64::new(0)).collect(),
        })
    }

    pub fn pin_count(&self) -> u32 {
        self.registers.pin_count()
    }

    pub fn registers(&self) -> &RegisterAccess {
        &self.registers
    }

    fn check_pin(&self, pin: u32) -> Result<usize, GpioError> {
        if pin < self.pin_count() {
            Ok(pin as usize)
        } else {
            Err(GpioError::InvalidPin(pin as i64))
        }
    }

    pub fn set_direction(&self, pin: u32, direction: Direction) -> Result<(), GpioError> {
        let idx = self.check_pin(pin)?;
        let mut pins = self.pins.lock();

        let previous = pins.direction_mask();
        let mask = with_bit(previous, pin, direction == Direction::Output);
        self.registers.write_register(Register::Direction, mask)?;

        let entry = &mut pins.entries[idx];
        match direction {
            Direction::Output => self.disarm(pin, entry),
            Direction::Input if entry.enabled => {
                if let Err(e) = self.arm(pin, entry) {
                    self.restore(Register::Direction, previous);
                    return Err(e);
                }
            }
            Direction::Input => {}
        }
        entry.direction = direction;
        Ok(())
    }

    pub fn direction(&self, pin: u32) -> Result<Direction, GpioError> {
        let idx = self.check_pin(pin)?;
        Ok(self.pins.lock().entries[idx].direction)
    }

    pub fn set_enable(&self, pin: u32, on: bool) -> Result<(), GpioError> {
        let idx = self.check_pin(pin)?;
        let mut pins = self.pins.lock();

        let previous = pins.enable_mask();
        let mask = with_bit(previous, pin, on);
        self.registers.write_register(Register::Enable, mask)?;

        let entry = &mut pins.entries[idx];
        if !on {
            self.disarm(pin, entry);
        } else if entry.direction == Direction::Input
            && let Err(e) = self.arm(pin, entry)
        {
            self.restore(Register::Enable, previous);
            return Err(e);
        }
        entry.enabled = on;
        Ok(())
    }

    pub fn enabled(&self, pin: u32) -> Result<bool, GpioError> {
        let idx = self.check_pin(pin)?;
        Ok(self.pins.lock().entries[idx].enabled)
    }

    pub fn get_state(&self, pin: u32) -> Result<State, GpioError> {
        let idx = self.check_pin(pin)?;
        let mut pins = self.pins.lock();
        let entry = &mut pins.entries[idx];

        if entry.enabled && entry.direction == Direction::Input {
            entry.state = self.registers.read_level(pin)?;
        }
        Ok(entry.state)
    }

    pub fn set_state(&self, pin: u32, state: State) -> Result<(), GpioError> {
        let idx = self.check_pin(pin)?;
        let mut pins = self.pins.lock();

        if pins.entries[idx].direction != Direction::Output {
            return Err(GpioError::InvalidOperation(format!(
                "pin {pin} must be an output to set its state"
            )));
        }

        let latch = with_bit(pins.latch, pin, state.is_high());
        self.registers.write_register(Register::Output, latch)?;
        pins.latch = latch;
        pins.entries[idx].state = state;
        Ok(())
    }

    /// Reads the input bank once and feeds every armed detector. Touches no
    /// register when nothing is armed.
    pub fn scan(&self) -> Result<Vec<Transition>, GpioError> {
        let mut pins = self.pins.lock();
        if !pins.entries.iter().any(|e| e.detector.is_armed()) {
            return Ok(Vec::new());
        }

        let levels = self.registers.read_register(Register::Input)?;
        let mut transitions = Vec::new();

        for (idx, entry) in pins.entries.iter_mut().enumerate() {
            if !entry.detector.is_armed() {
                continue;
            }
            let level = State::from_bit(levels & (1 << idx) != 0);
            if let Some(state) = entry.detector.observe(level) {
                entry.state = state;
                transitions.push(Transition {
                    pin: idx as u32,
                    state,
                    epoch: self.epochs[idx].load(Ordering::Acquire),
                });
                entry.detector.rearm();
            }
        }
        Ok(transitions)
    }

    /// True while no disable or direction change happened since `epoch`.
    pub fn is_current(&self, pin: u32, epoch: u64) -> bool {
        self.epochs
            .get(pin as usize)
            .map(|e| e.load(Ordering::Acquire) == epoch)
            .unwrap_or(false)
    }

    fn arm(&self, pin: u32, entry: &mut PinEntry) -> Result<(), GpioError> {
        if entry.detector.is_armed() {
            return Ok(());
        }
        let level = self.registers.read_level(pin)?;
        entry.state = level;
        entry.detector.arm(level);
        debug!("pin {pin} armed at {level}");
        Ok(())
    }

    /// Puts back a register value after a call failed half way.
    fn restore(&self, register: Register, value: u32) {
        if let Err(e) = self.registers.write_register(register, value) {
            warn!("could not restore register {:#04x}: {e}", register.offset());
        }
    }

    fn disarm(&self, pin: u32, entry: &mut PinEntry) {
        entry.detector.disarm();
        self.epochs[pin as usize].fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::MockGpioBackend;

    fn table(mock: &Arc<MockGpioBackend>) -> PinTable {
        PinTable::new(RegisterAccess::new(mock.clone(), 8)).unwrap()
    }

    #[test]
    fn new_table_writes_baseline() {
        let mock = Arc::new(MockGpioBackend::new());
        let table = table(&mock);
        assert_eq!(mock.register_writes(), 3);
        assert_eq!(table.direction(0).unwrap(), Direction::Input);
        assert!(!table.enabled(0).unwrap());
    }

    #[test]
    fn out_of_range_pin_is_rejected_before_hardware() {
        let mock = Arc::new(MockGpioBackend::new());
        let table = table(&mock);
        let writes = mock.register_writes();

        assert!(matches!(
            table.set_direction(8, Direction::Output),
            Err(GpioError::InvalidPin(8))
        ));
        assert!(matches!(table.get_state(42), Err(GpioError::InvalidPin(42))));
        assert_eq!(mock.register_writes(), writes);
        assert_eq!(mock.register_reads(), 0);
    }

    #[test]
    fn output_latch_keeps_other_pins() {
        let mock = Arc::new(MockGpioBackend::new());
        let table = table(&mock);

        table.set_direction(1, Direction::Output).unwrap();
        table.set_direction(2, Direction::Output).unwrap();
        table.set_state(1, State::High).unwrap();
        table.set_state(2, State::High).unwrap();
        table.set_state(1, State::Low).unwrap();

        assert_eq!(mock.register(Register::Output), 0b100);
        assert_eq!(mock.register(Register::Direction), 0b110);
    }

    #[test]
    fn scan_without_armed_pins_reads_nothing() {
        let mock = Arc::new(MockGpioBackend::new());
        let table = table(&mock);

        table.set_direction(0, Direction::Input).unwrap();
        assert!(table.scan().unwrap().is_empty());
        assert_eq!(mock.register_reads(), 0);
    }

    #[test]
    fn disarm_invalidates_epoch() {
        let mock = Arc::new(MockGpioBackend::new());
        let table = table(&mock);

        table.set_enable(3, true).unwrap();
        mock.drive_input(3, State::High);
        let transitions = table.scan().unwrap();
        assert_eq!(transitions.len(), 1);
        let t = transitions[0];
        assert!(table.is_current(t.pin, t.epoch));

        table.set_enable(3, false).unwrap();
        assert!(!table.is_current(t.pin, t.epoch));
    }

    #[test]
    fn failed_arm_rolls_back_enable_and_direction() {
        let mock = Arc::new(MockGpioBackend::new());
        let table = table(&mock);
        table.set_direction(2, Direction::Output).unwrap();
        table.set_enable(2, true).unwrap();

        mock.set_read_fault(true);
        assert!(matches!(
            table.set_enable(3, true),
            Err(GpioError::HardwareFault(_))
        ));
        assert!(!table.enabled(3).unwrap());
        assert_eq!(mock.register(Register::Enable), 0b100);

        assert!(matches!(
            table.set_direction(2, Direction::Input),
            Err(GpioError::HardwareFault(_))
        ));
        assert_eq!(table.direction(2).unwrap(), Direction::Output);
        assert_eq!(mock.register(Register::Direction), 0b100);

        mock.set_read_fault(false);
        table.set_enable(3, true).unwrap();
        mock.drive_input(3, State::High);
        assert_eq!(table.scan().unwrap().len(), 1);
    }
}
