use std::sync::Arc;

use log::info;

use crate::config::{BackendConfig, ControllerConfig};
use crate::error::GpioError;
use crate::registers::RegisterBackend;

#[cfg(feature = "hardware-gpio")]
pub mod libgpiod;
pub mod mock;
pub mod sysfs;

#[cfg(feature = "hardware-gpio")]
pub use libgpiod::LibgpiodBackend;
pub use mock::MockGpioBackend;
pub use sysfs::SysfsBackend;

/// Opens the register backend selected by `config`.
pub fn open_backend(config: &ControllerConfig) -> Result<Arc<dyn RegisterBackend>, GpioError> {
    let lines = config.line_offsets();
    let backend: Arc<dyn RegisterBackend> = match &config.backend {
        BackendConfig::Mock => Arc::new(MockGpioBackend::new()),
        BackendConfig::Sysfs { root, base } => Arc::new(SysfsBackend::open(root, *base, &lines)?),
        #[cfg(feature = "hardware-gpio")]
        BackendConfig::Libgpiod { chip } => Arc::new(LibgpiodBackend::open(chip, &lines)?),
        #[cfg(not(feature = "hardware-gpio"))]
        BackendConfig::Libgpiod { .. } => {
            return Err(GpioError::Config(
                "libgpiod backend requires the `hardware-gpio` feature".into(),
            ));
        }
    };
    info!("opened {:?} register backend", config.backend);
    Ok(backend)
}
