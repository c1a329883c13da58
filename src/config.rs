use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::GpioError;

/// Environment variable naming the JSON config used by the C ABI and the demo.
pub const CONFIG_ENV: &str = "MICA_GPIO_CONFIG";

/// Widest register bank the register layer can address.
pub const MAX_PINS: u32 = 32;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackendConfig {
    Mock,
    Sysfs {
        #[serde(default = "default_sysfs_root")]
        root: String,
        #[serde(default)]
        base: u32,
    },
    Libgpiod {
        chip: String,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Mock
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ControllerConfig {
    #[serde(default = "default_pin_count")]
    pub pin_count: u32,
    #[serde(default)]
    pub lines: Option<Vec<u32>>,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            pin_count: default_pin_count(),
            lines: None,
            backend: BackendConfig::default(),
            poll_interval_ms: default_poll_interval_ms(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl ControllerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the file named by `MICA_GPIO_CONFIG`, or the defaults when unset.
    pub fn from_env() -> Result<Self, GpioError> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::load_from_file(path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), GpioError> {
        if self.pin_count == 0 || self.pin_count > MAX_PINS {
            return Err(GpioError::Config(format!(
                "pin_count must be between 1 and {MAX_PINS}, got {}",
                self.pin_count
            )));
        }
        if self.event_queue_capacity == 0 {
            return Err(GpioError::Config(
                "event_queue_capacity must be non-zero".into(),
            ));
        }
        if let Some(lines) = &self.lines
            && lines.len() != self.pin_count as usize
        {
            return Err(GpioError::Config(format!(
                "expected {} line offsets, got {}",
                self.pin_count,
                lines.len()
            )));
        }
        Ok(())
    }

    /// Hardware line offset for every pin id, identity when `lines` is unset.
    pub fn line_offsets(&self) -> Vec<u32> {
        self.lines
            .clone()
            .unwrap_or_else(|| (0..self.pin_count).collect())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_pin_count() -> u32 {
    8
}

fn default_poll_interval_ms() -> u64 {
    5
}

fn default_event_queue_capacity() -> usize {
    64
}

fn default_sysfs_root() -> String {
    "/sys/class/gpio".to_string()
}
