use log::info;
use std::thread::sleep;
use std::time::Duration;

use mica_gpio::{CONFIG_ENV, Controller, ControllerConfig, Direction, GpioError, State, UserData};

const DEMO_PIN: u32 = 1;

fn main() -> Result<(), GpioError> {
    env_logger::init();

    let config = match std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
    {
        Some(path) => ControllerConfig::load_from_file(&path)
            .unwrap_or_else(|e| panic!("Failed to load config: {e}")),
        None => ControllerConfig::default(),
    };

    let controller = Controller::from_config(&config)?;
    controller.set_callback(
        |event| {
            info!(
                "Input: {} state: {} changed (data: {:#x})",
                event.pin, event.state, event.user_data.0
            )
        },
        UserData(0xda7a),
    );

    controller.set_direction(DEMO_PIN, Direction::Input)?;
    controller.set_enable(DEMO_PIN, true)?;
    sleep(Duration::from_secs(5));
    controller.set_enable(DEMO_PIN, false)?;
    info!("State {}", controller.get_state(DEMO_PIN)?);

    controller.set_direction(DEMO_PIN, Direction::Output)?;
    controller.set_state(DEMO_PIN, State::High)?;
    sleep(Duration::from_secs(1));
    controller.set_state(DEMO_PIN, State::Low)?;

    controller.clear_callback();
    Ok(())
}
