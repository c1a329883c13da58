use log::{debug, warn};
use std::path::PathBuf;
use std::time::Duration;

use libgpiod::{chip::Chip, line, request};
use parking_lot::{FairMutex, Mutex};

use crate::error::GpioError;
use crate::registers::{Register, RegisterBackend, wait_sliced};

const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_BACKEND_EDGE_POLL_SLICE: Duration = Duration::from_millis(1);

/// Register bank over one GPIO character device. All pins share a single
/// line request; input lines always report both edges. `wait_input` checks
/// the edge queue without blocking and sleeps with the handle unlocked.
pub struct LibgpiodBackend {
    lines: Vec<u32>,
    shadow: Mutex<Shadow>,
    gpiod_handle: FairMutex<GpiodHandle>,
}

#[derive(Default)]
struct Shadow {
    direction: u32,
    enable: u32,
    output: u32,
}

struct GpiodHandle {
    request: request::Request,
    buffer: request::Buffer,
}

impl GpiodHandle {
    fn new(chip: &str, line_cfg: &line::Config) -> Result<Self, GpioError> {
        let chip = Self::open_chip(chip)?;
        let request = Self::request_lines(&chip, line_cfg)?;
        let buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| GpioError::HardwareFault(format!("event buffer: {e}")))?;
        Ok(Self { request, buffer })
    }

    fn open_chip(path: &str) -> Result<Chip, GpioError> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| GpioError::HardwareFault(format!("open chip {path}: {e}")))
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, GpioError> {
        let mut req_cfg = request::Config::new()
            .map_err(|e| GpioError::HardwareFault(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| GpioError::HardwareFault(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| GpioError::HardwareFault(format!("request lines: {e}")))
    }
}

impl LibgpiodBackend {
    /// Requests every line of `lines` on `chip` as an edge-reporting input.
    pub fn open(chip: &str, lines: &[u32]) -> Result<Self, GpioError> {
        let line_cfg = Self::make_line_config(lines, 0)?;
        let gpiod_handle = FairMutex::new(GpiodHandle::new(chip, &line_cfg)?);
        debug!("libgpiod backend requested {} lines on {chip}", lines.len());

        Ok(Self {
            lines: lines.to_vec(),
            shadow: Mutex::new(Shadow::default()),
            gpiod_handle,
        })
    }

    fn make_line_settings(output: bool) -> Result<line::Settings, GpioError> {
        let mut ls = line::Settings::new()
            .map_err(|e| GpioError::HardwareFault(format!("libgpiod settings: {e}")))?;

        if output {
            ls.set_direction(line::Direction::Output)
                .map_err(|e| GpioError::HardwareFault(format!("set direction: {e}")))?;
            ls.set_drive(line::Drive::PushPull)
                .map_err(|e| GpioError::HardwareFault(format!("set drive: {e}")))?;
        } else {
            ls.set_direction(line::Direction::Input)
                .map_err(|e| GpioError::HardwareFault(format!("set direction: {e}")))?;
            ls.set_edge_detection(Some(line::Edge::Both))
                .map_err(|e| GpioError::HardwareFault(format!("set edge detection: {e}")))?;
        }
        Ok(ls)
    }

    fn make_line_config(lines: &[u32], direction: u32) -> Result<line::Config, GpioError> {
        let mut cfg = line::Config::new()
            .map_err(|e| GpioError::HardwareFault(format!("line config: {e}")))?;
        for (pin, offset) in lines.iter().enumerate() {
            let settings = Self::make_line_settings(direction & (1 << pin) != 0)?;
            cfg.add_line_settings(&[*offset], settings)
                .map_err(|e| GpioError::HardwareFault(format!("line config add settings: {e}")))?;
        }
        Ok(cfg)
    }

    fn value(level: bool) -> line::Value {
        if level {
            line::Value::Active
        } else {
            line::Value::InActive
        }
    }

    /// Non-blocking edge check. Levels are re-read from the `Input`
    /// register by the scan, so the events are only drained.
    fn drain_edge_events(&self) -> Result<bool, GpioError> {
        let mut hdl = self.gpiod_handle.lock();
        let has_event = hdl
            .request
            .wait_edge_events(Some(Duration::ZERO))
            .map_err(|e| GpioError::HardwareFault(format!("wait edge events: {e}")))?;
        if !has_event {
            return Ok(false);
        }

        let GpiodHandle { request, buffer } = &mut *hdl;
        let events = request
            .read_edge_events(buffer)
            .map_err(|e| GpioError::HardwareFault(format!("read edge events: {e}")))?;
        let dropped = events.filter(|evt| evt.is_err()).count();
        if dropped > 0 {
            warn!("{dropped} malformed edge events");
        }
        Ok(true)
    }

    fn drive_outputs(
        &self,
        hdl: &mut GpiodHandle,
        direction: u32,
        output: u32,
    ) -> Result<(), GpioError> {
        for (pin, offset) in self.lines.iter().enumerate() {
            let bit = 1 << pin;
            if direction & bit == 0 {
                continue;
            }
            hdl.request
                .set_value(*offset, Self::value(output & bit != 0))
                .map_err(|e| GpioError::HardwareFault(format!("set value: {e}")))?;
        }
        Ok(())
    }
}

impl RegisterBackend for LibgpiodBackend {
    fn read_register(&self, register: Register) -> Result<u32, GpioError> {
        match register {
            Register::Direction => Ok(self.shadow.lock().direction),
            Register::Enable => Ok(self.shadow.lock().enable),
            Register::Output => Ok(self.shadow.lock().output),
            Register::Input => {
                let hdl = self.gpiod_handle.lock();
                let mut levels = 0;
                for (pin, offset) in self.lines.iter().enumerate() {
                    let value = hdl
                        .request
                        .value(*offset)
                        .map_err(|e| GpioError::HardwareFault(format!("get value: {e}")))?;
                    if matches!(value, line::Value::Active) {
                        levels |= 1 << pin;
                    }
                }
                Ok(levels)
            }
        }
    }

    fn write_register(&self, register: Register, value: u32) -> Result<(), GpioError> {
        let mut shadow = self.shadow.lock();
        match register {
            Register::Direction => {
                let line_cfg = Self::make_line_config(&self.lines, value)?;
                let mut hdl = self.gpiod_handle.lock();
                hdl.request
                    .reconfigure_lines(&line_cfg)
                    .map_err(|e| GpioError::HardwareFault(format!("reconfigure lines: {e}")))?;
                self.drive_outputs(&mut hdl, value, shadow.output)?;
                shadow.direction = value;
            }
            // the character device has no per-line enable; sensing is gated in the table
            Register::Enable => shadow.enable = value,
            Register::Output => {
                let mut hdl = self.gpiod_handle.lock();
                self.drive_outputs(&mut hdl, shadow.direction, value)?;
                shadow.output = value;
            }
            Register::Input => {
                return Err(GpioError::HardwareFault(
                    "input register is read-only".into(),
                ));
            }
        }
        Ok(())
    }

    fn wait_input(&self, timeout: Duration) -> Result<(), GpioError> {
        wait_sliced(timeout, LIBGPIOD_BACKEND_EDGE_POLL_SLICE, || {
            self.drain_edge_events()
        })
    }
}
