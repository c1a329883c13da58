use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::GpioError;
use crate::registers::{Register, RegisterBackend};

const SYSFS_EXPORT_RETRIES: usize = 100;
const SYSFS_EXPORT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Register bank emulated over the `/sys/class/gpio` class interface.
pub struct SysfsBackend {
    root: PathBuf,
    lines: Vec<u32>,
    shadow: Mutex<Shadow>,
}

#[derive(Default)]
struct Shadow {
    direction: u32,
    enable: u32,
    output: u32,
    /// Set after the first direction write reached every line.
    synced: bool,
}

impl SysfsBackend {
    /// Exports `base + line` for every pin under `root`.
    pub fn open<P: AsRef<Path>>(root: P, base: u32, lines: &[u32]) -> Result<Self, GpioError> {
        let root = root.as_ref().to_path_buf();
        let lines: Vec<u32> = lines.iter().map(|l| base + l).collect();

        for &gpio in &lines {
            export_gpio(&root, gpio)?;
        }
        debug!("sysfs backend exported {} lines under {}", lines.len(), root.display());

        Ok(Self {
            root,
            lines,
            shadow: Mutex::new(Shadow::default()),
        })
    }

    fn gpio_dir(&self, gpio: u32) -> PathBuf {
        self.root.join(format!("gpio{gpio}"))
    }

    fn read_attr(&self, gpio: u32, attr: &str) -> Result<String, GpioError> {
        let path = self.gpio_dir(gpio).join(attr);
        fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|e| GpioError::HardwareFault(format!("read {}: {e}", path.display())))
    }

    fn write_attr(&self, gpio: u32, attr: &str, value: &str) -> Result<(), GpioError> {
        let path = self.gpio_dir(gpio).join(attr);
        fs::write(&path, value)
            .map_err(|e| GpioError::HardwareFault(format!("write {}: {e}", path.display())))
    }

    fn read_levels(&self) -> Result<u32, GpioError> {
        let mut levels = 0;
        for (pin, &gpio) in self.lines.iter().enumerate() {
            match self.read_attr(gpio, "value")?.as_str() {
                "0" => {}
                "1" => levels |= 1 << pin,
                other => {
                    return Err(GpioError::HardwareFault(format!(
                        "gpio{gpio} reports undecodable level {other:?}"
                    )));
                }
            }
        }
        Ok(levels)
    }

    fn read_directions(&self) -> Result<u32, GpioError> {
        let mut mask = 0;
        for (pin, &gpio) in self.lines.iter().enumerate() {
            match self.read_attr(gpio, "direction")?.as_str() {
                "in" => {}
                "out" | "high" | "low" => mask |= 1 << pin,
                other => {
                    return Err(GpioError::HardwareFault(format!(
                        "gpio{gpio} reports unknown direction {other:?}"
                    )));
                }
            }
        }
        Ok(mask)
    }
}

impl RegisterBackend for SysfsBackend {
    fn read_register(&self, register: Register) -> Result<u32, GpioError> {
        match register {
            Register::Direction => self.read_directions(),
            Register::Enable => Ok(self.shadow.lock().enable),
            Register::Output => Ok(self.shadow.lock().output),
            Register::Input => self.read_levels(),
        }
    }

    fn write_register(&self, register: Register, value: u32) -> Result<(), GpioError> {
        let mut shadow = self.shadow.lock();
        match register {
            Register::Direction => {
                for (pin, &gpio) in self.lines.iter().enumerate() {
                    let bit = 1 << pin;
                    let out = value & bit != 0;
                    if shadow.synced && out == (shadow.direction & bit != 0) {
                        continue;
                    }
                    // "low"/"high" switch to output glitch-free at the latched level
                    let dir = match (out, shadow.output & bit != 0) {
                        (false, _) => "in",
                        (true, false) => "low",
                        (true, true) => "high",
                    };
                    self.write_attr(gpio, "direction", dir)?;
                }
                shadow.direction = value;
                shadow.synced = true;
            }
            Register::Enable => shadow.enable = value,
            Register::Output => {
                for (pin, &gpio) in self.lines.iter().enumerate() {
                    let bit = 1 << pin;
                    if shadow.direction & bit == 0 || (value ^ shadow.output) & bit == 0 {
                        continue;
                    }
                    self.write_attr(gpio, "value", if value & bit != 0 { "1" } else { "0" })?;
                }
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
}

impl Drop for SysfsBackend {
    fn drop(&mut self) {
        for &gpio in &self.lines {
            if let Err(e) = unexport_gpio(&self.root, gpio) {
                warn!("{e}");
            }
        }
    }
}

fn export_gpio(root: &Path, gpio: u32) -> Result<(), GpioError> {
    let gpio_dir = root.join(format!("gpio{gpio}"));
    if !gpio_dir.exists() {
        fs::write(root.join("export"), gpio.to_string())
            .map_err(|e| GpioError::HardwareFault(format!("export gpio{gpio}: {e}")))?;
    }

    let value = gpio_dir.join("value");
    for _ in 0..SYSFS_EXPORT_RETRIES {
        if value.exists() {
            return Ok(());
        }
        thread::sleep(SYSFS_EXPORT_RETRY_DELAY);
    }
    Err(GpioError::HardwareFault(format!(
        "gpio{gpio} did not appear after export"
    )))
}

fn unexport_gpio(root: &Path, gpio: u32) -> Result<(), GpioError> {
    if root.join(format!("gpio{gpio}")).exists() {
        fs::write(root.join("unexport"), gpio.to_string())
            .map_err(|e| GpioError::HardwareFault(format!("unexport gpio{gpio}: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Temporary sysfs tree, removed on drop.
    struct FakeSysfs {
        root: PathBuf,
    }

    impl FakeSysfs {
        fn new(name: &str, gpios: &[u32]) -> Self {
            let root = std::env::temp_dir().join(format!(
                "mica-gpio-sysfs-{name}-{}",
                std::process::id()
            ));
            let _ = fs::remove_dir_all(&root);
            for gpio in gpios {
                let dir = root.join(format!("gpio{gpio}"));
                fs::create_dir_all(&dir).unwrap();
                fs::write(dir.join("direction"), "in\n").unwrap();
                fs::write(dir.join("value"), "0\n").unwrap();
            }
            Self { root }
        }

        fn path(&self) -> &Path {
            &self.root
        }
    }

    impl Drop for FakeSysfs {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[test]
    fn reads_levels_with_base_offset() {
        let root = FakeSysfs::new("levels", &[100, 101]);
        fs::write(root.path().join("gpio101/value"), "1\n").unwrap();

        let backend = SysfsBackend::open(root.path(), 100, &[0, 1]).unwrap();
        assert_eq!(backend.read_register(Register::Input).unwrap(), 0b10);
    }

    #[test]
    fn undecodable_level_is_a_fault() {
        let root = FakeSysfs::new("sentinel", &[0]);
        fs::write(root.path().join("gpio0/value"), "-1\n").unwrap();

        let backend = SysfsBackend::open(root.path(), 0, &[0]).unwrap();
        assert!(matches!(
            backend.read_register(Register::Input),
            Err(GpioError::HardwareFault(_))
        ));
    }

    #[test]
    fn direction_and_output_are_written_per_line() {
        let root = FakeSysfs::new("write", &[0, 1]);
        let backend = SysfsBackend::open(root.path(), 0, &[0, 1]).unwrap();

        backend.write_register(Register::Direction, 0b10).unwrap();
        backend.write_register(Register::Output, 0b10).unwrap();

        let attr = |rel: &str| fs::read_to_string(root.path().join(rel)).unwrap();
        assert_eq!(attr("gpio0/direction"), "in");
        assert_eq!(attr("gpio1/direction"), "low");
        assert_eq!(attr("gpio1/value"), "1");
        assert_eq!(backend.read_register(Register::Direction).unwrap(), 0b10);
    }

    #[test]
    fn missing_device_node_is_a_fault() {
        let root = FakeSysfs::new("missing", &[]);
        assert!(matches!(
            SysfsBackend::open(root.path().join("absent"), 0, &[3]),
            Err(GpioError::HardwareFault(_))
        ));
    }

    #[test]
    fn fake_tree_is_removed_after_use() {
        let path = {
            let root = FakeSysfs::new("cleanup", &[0]);
            let _backend = SysfsBackend::open(root.path(), 0, &[0]).unwrap();
            root.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
