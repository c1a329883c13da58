use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::dispatch::EventSink;
use crate::error::GpioError;
use crate::gpio::State;
use crate::table::PinTable;

/// A level change detected on an armed pin, tagged with the pin's epoch at
/// detection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub pin: u32,
    pub state: State,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum DetectorState {
    #[default]
    Idle,
    Armed(State),
    Fired(State),
}

/// Edge-triggered detector for one input pin. Re-arms after every fire.
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeDetector {
    state: DetectorState,
}

impl EdgeDetector {
    pub fn arm(&mut self, level: State) {
        self.state = DetectorState::Armed(level);
    }

    pub fn disarm(&mut self) {
        self.state = DetectorState::Idle;
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, DetectorState::Armed(_))
    }

    /// Returns the new level when it differs from the armed baseline.
    pub fn observe(&mut self, level: State) -> Option<State> {
        match self.state {
            DetectorState::Armed(last) if last != level => {
                self.state = DetectorState::Fired(level);
                Some(level)
            }
            _ => None,
        }
    }

    pub fn rearm(&mut self) {
        if let DetectorState::Fired(level) = self.state {
            self.state = DetectorState::Armed(level);
        }
    }
}

/// Background thread that waits on the backend and scans armed pins.
pub struct Monitor {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Monitor {
    pub fn spawn(
        table: Arc<PinTable>,
        sink: EventSink,
        poll_interval: Duration,
    ) -> Result<Self, GpioError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();

        let handle = thread::Builder::new()
            .name("mica-gpio-monitor".into())
            .spawn(move || {
                debug!("monitor started, poll interval {poll_interval:?}");
                while !cancel_flag.load(Ordering::Relaxed) {
                    if let Err(e) = table.registers().wait_input(poll_interval) {
                        warn!("wait for input change failed: {e}");
                        thread::sleep(poll_interval);
                        continue;
                    }

                    let generation = sink.stamp();
                    let transitions = match table.scan() {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("input scan failed: {e}");
                            thread::sleep(poll_interval);
                            continue;
                        }
                    };
                    for transition in transitions {
                        if !sink.emit(transition, generation, &cancel_flag) {
                            debug!("monitor stopping with events unsent");
                            return;
                        }
                    }
                }
                debug!("monitor stopped");
            })
            .map_err(|e| GpioError::HardwareFault(format!("spawn monitor thread: {e}")))?;

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
