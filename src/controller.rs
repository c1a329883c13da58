use std::sync::Arc;

use log::info;

use crate::backend::open_backend;
use crate::config::ControllerConfig;
use crate::dispatch::Dispatcher;
use crate::engine::Monitor;
use crate::error::GpioError;
use crate::gpio::{Direction, State, TransitionEvent, UserData};
use crate::registers::{RegisterAccess, RegisterBackend};
use crate::table::PinTable;

/// Handle to one GPIO controller.
///
/// Owns the pin table, the monitor thread watching armed inputs and the
/// dispatch thread calling the subscriber. Every method is synchronous and
/// may be called from any thread. Dropping the handle stops both threads and
/// destroys the subscription.
pub struct Controller {
    table: Arc<PinTable>,
    // must stop before the dispatcher closes its queue
    monitor: Option<Monitor>,
    dispatcher: Dispatcher,
}

impl Controller {
    pub fn new(
        config: &ControllerConfig,
        backend: Arc<dyn RegisterBackend>,
    ) -> Result<Self, GpioError> {
        config.validate()?;

        let registers = RegisterAccess::new(backend, config.pin_count);
        let table = Arc::new(PinTable::new(registers)?);
        let dispatcher = Dispatcher::spawn(table.clone(), config.event_queue_capacity)?;
        let sink = dispatcher
            .sink()
            .ok_or_else(|| GpioError::HardwareFault("dispatcher closed".into()))?;
        let monitor = Monitor::spawn(table.clone(), sink, config.poll_interval())?;

        info!("controller up with {} pins", config.pin_count);
        Ok(Self {
            table,
            monitor: Some(monitor),
            dispatcher,
        })
    }

    /// Opens the backend named in `config` and builds a controller on it.
    pub fn from_config(config: &ControllerConfig) -> Result<Self, GpioError> {
        config.validate()?;
        let backend = open_backend(config)?;
        Self::new(config, backend)
    }

    pub fn pin_count(&self) -> u32 {
        self.table.pin_count()
    }

    pub fn set_direction(&self, pin: u32, direction: Direction) -> Result<(), GpioError> {
        self.table.set_direction(pin, direction)
    }

    pub fn get_direction(&self, pin: u32) -> Result<Direction, GpioError> {
        self.table.direction(pin)
    }

    pub fn set_enable(&self, pin: u32, enabled: bool) -> Result<(), GpioError> {
        self.table.set_enable(pin, enabled)
    }

    pub fn get_enable(&self, pin: u32) -> Result<bool, GpioError> {
        self.table.enabled(pin)
    }

    /// Live level for enabled inputs, the cached level otherwise.
    pub fn get_state(&self, pin: u32) -> Result<State, GpioError> {
        self.table.get_state(pin)
    }

    pub fn set_state(&self, pin: u32, state: State) -> Result<(), GpioError> {
        self.table.set_state(pin, state)
    }

    /// Registers `callback` as the only subscriber, replacing any previous
    /// one, and returns the previous subscriber's user data. Callbacks run on
    /// the dispatch thread, one at a time; a callback of the previous
    /// subscriber that is already running finishes after this returns.
    pub fn set_callback<F>(&self, callback: F, user_data: UserData) -> Option<UserData>
    where
        F: Fn(TransitionEvent) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(Arc::new(callback), user_data)
    }

    pub fn clear_callback(&self) -> Option<UserData> {
        self.dispatcher.unsubscribe()
    }

    /// Events detected but not yet handed to the subscriber.
    pub fn pending_events(&self) -> usize {
        self.dispatcher.pending()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.dispatcher.unsubscribe();
        drop(self.monitor.take());
        info!("controller down");
    }
}
