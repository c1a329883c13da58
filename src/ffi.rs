//! C ABI matching `mica_gpio.h`.
//!
//! All functions share one process-wide [`Controller`], created on first use
//! from [`ControllerConfig::from_env`] and torn down by [`mica_gpio_shutdown`]
//! or at process exit. Pins are numbered from 1 on this side, as the header
//! does. Setters return `0` or a negative [`GpioError::code`]; getters return
//! the value or a negative code.

use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::{Arc, Once};

use log::{error, info, warn};
use parking_lot::{Mutex, const_mutex};

use crate::config::ControllerConfig;
use crate::controller::Controller;
use crate::error::GpioError;
use crate::gpio::{Direction, State, TransitionEvent, UserData};

pub type MicaGpioCallback = unsafe extern "C" fn(id: c_int, state: c_int, data: *mut c_void);

static CONTROLLER: Mutex<Option<Arc<Controller>>> = const_mutex(None);
static EXIT_HOOK: Once = Once::new();

unsafe extern "C" {
    fn atexit(callback: extern "C" fn()) -> c_int;
}

extern "C" fn shutdown_at_exit() {
    // exit() may run on a thread that holds the slot
    let controller = CONTROLLER.try_lock().and_then(|mut slot| slot.take());
    drop(controller);
}

fn controller() -> Result<Arc<Controller>, GpioError> {
    let mut slot = CONTROLLER.lock();
    if let Some(controller) = slot.as_ref() {
        return Ok(controller.clone());
    }

    let _ = env_logger::try_init();
    let config = ControllerConfig::from_env()?;
    let controller = Arc::new(Controller::from_config(&config)?);
    *slot = Some(controller.clone());

    EXIT_HOOK.call_once(|| {
        // SAFETY: `shutdown_at_exit` takes no arguments and does not unwind.
        if unsafe { atexit(shutdown_at_exit) } != 0 {
            warn!("could not register exit-time teardown");
        }
    });
    Ok(controller)
}

fn pin_id(id: c_int) -> Result<u32, GpioError> {
    match u32::try_from(id) {
        Ok(id) if id > 0 => Ok(id - 1),
        _ => Err(GpioError::InvalidPin(id as i64)),
    }
}

fn status(result: Result<(), GpioError>) -> c_int {
    value(result.map(|_| 0))
}

fn value(result: Result<c_int, GpioError>) -> c_int {
    match result {
        Ok(v) => v,
        Err(e) => {
            error!("{e}");
            e.code()
        }
    }
}

/// Adapts a C callback to a subscriber, translating the pin back to the
/// 1-based id and the user data back to the caller's pointer.
fn c_subscriber(callback: MicaGpioCallback) -> impl Fn(TransitionEvent) + Send + Sync + 'static {
    move |event| {
        // SAFETY: the caller guarantees `callback` stays valid until it is
        // replaced or the library shuts down.
        unsafe {
            callback(
                event.pin as c_int + 1,
                event.state as c_int,
                event.user_data.0 as *mut c_void,
            )
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn mica_gpio_set_direction(id: c_int, direction: c_int) -> c_int {
    status((|| -> Result<(), GpioError> {
        let direction = Direction::try_from(direction)?;
        controller()?.set_direction(pin_id(id)?, direction)
    })())
}

#[unsafe(no_mangle)]
pub extern "C" fn mica_gpio_get_direction(id: c_int) -> c_int {
    value((|| -> Result<c_int, GpioError> {
        Ok(controller()?.get_direction(pin_id(id)?)? as c_int)
    })())
}

#[unsafe(no_mangle)]
pub extern "C" fn mica_gpio_set_enable(id: c_int, enable: c_int) -> c_int {
    status((|| -> Result<(), GpioError> {
        controller()?.set_enable(pin_id(id)?, enable != 0)
    })())
}

#[unsafe(no_mangle)]
pub extern "C" fn mica_gpio_get_enable(id: c_int) -> c_int {
    value((|| -> Result<c_int, GpioError> {
        Ok(controller()?.get_enable(pin_id(id)?)? as c_int)
    })())
}

#[unsafe(no_mangle)]
pub extern "C" fn mica_gpio_get_state(id: c_int) -> c_int {
    value((|| -> Result<c_int, GpioError> {
        Ok(controller()?.get_state(pin_id(id)?)? as c_int)
    })())
}

#[unsafe(no_mangle)]
pub extern "C" fn mica_gpio_set_state(id: c_int, state: c_int) -> c_int {
    status((|| -> Result<(), GpioError> {
        let state = State::try_from(state)?;
        controller()?.set_state(pin_id(id)?, state)
    })())
}

/// Registers `callback`, or clears the subscription when it is NULL. `data`
/// is handed back untouched on every call.
///
/// Returns the `data` of the replaced subscription, NULL when there was none
/// or the library failed to start. A replaced callback that is already
/// running may still be using that `data`.
#[unsafe(no_mangle)]
pub extern "C" fn mica_gpio_set_callback(
    callback: Option<MicaGpioCallback>,
    data: *mut c_void,
) -> *mut c_void {
    let previous = controller().map(|controller| match callback {
        Some(callback) => controller.set_callback(c_subscriber(callback), UserData(data as usize)),
        None => controller.clear_callback(),
    });
    match previous {
        Ok(previous) => previous.map_or(ptr::null_mut(), |d| d.0 as *mut c_void),
        Err(e) => {
            error!("{e}");
            ptr::null_mut()
        }
    }
}

/// Drops the process-wide controller. The next call re-initializes it.
#[unsafe(no_mangle)]
pub extern "C" fn mica_gpio_shutdown() {
    let controller = CONTROLLER.lock().take();
    if controller.is_some() {
        info!("shutting down process-wide controller");
    }
    drop(controller);
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::backend::MockGpioBackend;

    static SEEN: Mutex<Vec<(c_int, c_int, usize)>> = const_mutex(Vec::new());

    unsafe extern "C" fn remember(id: c_int, state: c_int, data: *mut c_void) {
        SEEN.lock().push((id, state, data as usize));
    }

    #[test]
    fn pin_ids_start_at_one() {
        assert_eq!(pin_id(1).unwrap(), 0);
        assert_eq!(pin_id(8).unwrap(), 7);
        assert!(matches!(pin_id(0), Err(GpioError::InvalidPin(0))));
        assert!(matches!(pin_id(-3), Err(GpioError::InvalidPin(-3))));
    }

    #[test]
    fn c_callback_sees_one_based_pin_state_and_data() {
        let mock = Arc::new(MockGpioBackend::new());
        let config = ControllerConfig {
            poll_interval_ms: 1,
            ..ControllerConfig::default()
        };
        let controller = Controller::new(&config, mock.clone()).unwrap();
        let mut token = 0u32;
        let data = &mut token as *mut u32 as usize;

        controller.set_callback(c_subscriber(remember), UserData(data));
        controller.set_enable(2, true).unwrap();
        mock.drive_input(2, State::High);

        let deadline = Instant::now() + Duration::from_secs(2);
        while SEEN.lock().is_empty() {
            assert!(Instant::now() < deadline, "no callback delivered");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(SEEN.lock()[0], (3, 1, data));
    }

    #[test]
    fn exit_hook_tears_down_process_controller() {
        let weak = Arc::downgrade(&controller().unwrap());
        assert!(EXIT_HOOK.is_completed());

        shutdown_at_exit();
        assert!(CONTROLLER.lock().is_none());
        assert!(weak.upgrade().is_none());
    }
}
