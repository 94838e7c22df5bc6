//! Process-wide compute configuration
//!
//! Device selection happens once per process, on the first `initialize`.
//! Afterwards the configuration is read-only and shared by every session.
//! [`current`] exposes it to code embedding the rlib; the C ABI only reports
//! it through the log.

use std::env;
use std::sync::OnceLock;

use thiserror::Error;

/// Environment variable read by [`EnvDevices`]
pub const DEVICE_COUNT_ENV: &str = "SOLVERTRAY_DEVICE_COUNT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Cpu,
    Gpu,
}

/// Selected compute devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub mode: Mode,
    pub devices: Vec<i32>,
    /// Data-parallel replication factor
    pub solver_count: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Cpu,
            devices: Vec::new(),
            solver_count: 1,
        }
    }
}

impl DeviceConfig {
    pub fn from_devices(devices: Vec<i32>) -> Self {
        if devices.is_empty() {
            return Self::default();
        }
        Self {
            mode: Mode::Gpu,
            solver_count: devices.len(),
            devices,
        }
    }

    /// Active device, the first selected one.
    pub fn active_device(&self) -> Option<i32> {
        self.devices.first().copied()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceSpecError {
    #[error("invalid device id '{0}' in device list")]
    InvalidDevice(String),
}

/// Source of the accelerator count for the `"all"` spec.
pub trait DeviceSource {
    fn device_count(&self) -> usize;
}

/// Reads the count from `SOLVERTRAY_DEVICE_COUNT`, defaulting to none.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvDevices;

impl DeviceSource for EnvDevices {
    fn device_count(&self) -> usize {
        env::var(DEVICE_COUNT_ENV)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

/// Parse a device spec: `""` for CPU, `"all"`, or a comma-separated id list.
pub fn parse_device_spec(spec: &str, source: &dyn DeviceSource) -> Result<Vec<i32>, DeviceSpecError> {
    match spec {
        "" => Ok(Vec::new()),
        "all" => Ok((0..source.device_count() as i32).collect()),
        list => list
            .split(',')
            .map(|id| id.trim().parse().map_err(|_| DeviceSpecError::InvalidDevice(id.to_string())))
            .collect(),
    }
}

static CONFIG: OnceLock<DeviceConfig> = OnceLock::new();

/// Select devices from `spec`. Only the first call in a process has effect;
/// returns whether this call was the one that configured the process.
pub fn initialize(spec: &str, source: &dyn DeviceSource) -> bool {
    let mut configured = false;
    CONFIG.get_or_init(|| {
        configured = true;
        let devices = parse_device_spec(spec, source).unwrap_or_else(|e| {
            log::error!("{}; falling back to CPU", e);
            Vec::new()
        });
        let config = DeviceConfig::from_devices(devices);
        log_config(&config);
        config
    });

    if !configured {
        log::debug!("Devices already configured; ignoring device spec '{}'", spec);
    }
    configured
}

fn log_config(config: &DeviceConfig) {
    for line in describe(config) {
        log::info!("{}", line);
    }
}

/// Log lines announcing a configuration.
fn describe(config: &DeviceConfig) -> Vec<String> {
    match (config.mode, config.active_device()) {
        (Mode::Gpu, Some(active)) => {
            let list: Vec<String> = config.devices.iter().map(|d| d.to_string()).collect();
            vec![
                format!("Using GPUs {}", list.join(", ")),
                format!("Active device {}, solver count {}", active, config.solver_count),
            ]
        }
        _ => vec!["Use CPU.".to_string()],
    }
}

/// Current configuration; CPU-only before `initialize`.
pub fn current() -> DeviceConfig {
    CONFIG.get().cloned().unwrap_or_default()
}

/// Selected devices; empty before `initialize`.
pub fn devices() -> &'static [i32] {
    CONFIG.get().map(|c| c.devices.as_slice()).unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct FixedDevices(usize);

    impl DeviceSource for FixedDevices {
        fn device_count(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn test_empty_spec_is_cpu() {
        let devices = parse_device_spec("", &FixedDevices(4)).unwrap();
        assert!(devices.is_empty());
        let config = DeviceConfig::from_devices(devices);
        assert_eq!(config.mode, Mode::Cpu);
        assert_eq!(config.active_device(), None);
    }

    #[test]
    fn test_all_enumerates_devices() {
        assert_eq!(parse_device_spec("all", &FixedDevices(3)).unwrap(), vec![0, 1, 2]);

        let config = DeviceConfig::from_devices(parse_device_spec("all", &FixedDevices(0)).unwrap());
        assert_eq!(config, DeviceConfig::default());
        assert_eq!(config.mode, Mode::Cpu);
    }

    #[test]
    fn test_explicit_list() {
        let config = DeviceConfig::from_devices(parse_device_spec("0,1", &FixedDevices(0)).unwrap());
        assert_eq!(
            config,
            DeviceConfig {
                mode: Mode::Gpu,
                devices: vec![0, 1],
                solver_count: 2,
            }
        );
        assert_eq!(config.active_device(), Some(0));
        assert_eq!(parse_device_spec("2", &FixedDevices(0)).unwrap(), vec![2]);
    }

    #[test]
    fn test_describe_config() {
        assert_eq!(describe(&DeviceConfig::default()), vec!["Use CPU.".to_string()]);
        assert_eq!(
            describe(&DeviceConfig::from_devices(vec![2, 0])),
            vec![
                "Using GPUs 2, 0".to_string(),
                "Active device 2, solver count 2".to_string(),
            ]
        );
    }

    #[test]
    fn test_invalid_list() {
        assert_eq!(
            parse_device_spec("0,x", &FixedDevices(0)),
            Err(DeviceSpecError::InvalidDevice("x".to_string()))
        );
        assert!(parse_device_spec("0,,1", &FixedDevices(0)).is_err());
        assert!(parse_device_spec("ALL", &FixedDevices(2)).is_err());
    }
}
