//! Configuration loading using Figment
//!
//! A single TOML file describes the board topology together with the kernel and
//! tool settings used to exercise it. Configuration is loaded from:
//! 1. the TOML file given on the command line (base configuration)
//! 2. Environment variables (prefixed with `BSP_I2C_`, `__` between nested keys)
//!
//! # Example
//! ```no_run
//! use bsp_i2c::config::BspConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BspConfig::load_from("config/bsp_i2c.toml")?;
//! config.validate()?;
//! println!("FPGAs: {}", config.topology.fpgas.len());
//! # Ok(())
//! # }
//! ```
//!
//! Override a single setting: `BSP_I2C_CONCURRENCY__MAX_WORKERS=16`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{BspError, Result};
use crate::topology::{AuxDevice, FpgaSpec, Topology};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BspConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// i2c-tools invocation settings
    #[serde(default)]
    pub tools: ToolsConfig,
    /// Kernel interfaces used for provisioning
    #[serde(default)]
    pub kernel: KernelConfig,
    /// Worker pool settings
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// Board description
    #[serde(flatten)]
    pub topology: Topology,
}

/// Paths of the external binaries and per-transaction deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_i2cdump")]
    pub i2cdump: PathBuf,
    #[serde(default = "default_i2cget")]
    pub i2cget: PathBuf,
    #[serde(default = "default_i2cdetect")]
    pub i2cdetect: PathBuf,
    #[serde(default = "default_modprobe")]
    pub modprobe: PathBuf,
    /// Deadline for a single tool invocation (unset = wait forever)
    #[serde(default, with = "humantime_serde")]
    pub transaction_timeout: Option<Duration>,
}

/// Where the kernel exposes the BSP, and how aux devices are driven.
///
/// The template strings are rendered with `strfmt`; available keys are `fpga`,
/// `vendor_id`, `device_id`, `sub_system_vendor_id`, `sub_system_device_id`, `cdev`,
/// `aux_name` and `aux_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Directory holding `i2c-N` bus entries
    #[serde(default = "default_sysfs_i2c_root")]
    pub sysfs_i2c_root: PathBuf,
    /// Directory holding auxiliary device entries
    #[serde(default = "default_auxiliary_root")]
    pub auxiliary_root: PathBuf,
    /// Character device path template
    #[serde(default = "default_cdev_path")]
    pub cdev_path: String,
    /// Name of the aux device entry under `auxiliary_root`
    #[serde(default = "default_aux_sysfs_name")]
    pub aux_sysfs_name: String,
    /// Command (program + args) that instantiates an aux device
    #[serde(default = "default_aux_create_command")]
    pub aux_create_command: Vec<String>,
    /// Command (program + args) that removes an aux device
    #[serde(default = "default_aux_remove_command")]
    pub aux_remove_command: Vec<String>,
    /// Kernel modules loaded before every scenario, in load order
    #[serde(default)]
    pub modules: Vec<String>,
    /// How long to wait for new busses after creating an aux device
    #[serde(default = "default_bus_settle_timeout", with = "humantime_serde")]
    pub bus_settle_timeout: Duration,
    /// Polling interval while waiting for busses
    #[serde(default = "default_bus_poll_interval", with = "humantime_serde")]
    pub bus_poll_interval: Duration,
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Maximum transaction units in flight at once (must be > 1)
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_i2cdump() -> PathBuf {
    PathBuf::from("i2cdump")
}

fn default_i2cget() -> PathBuf {
    PathBuf::from("i2cget")
}

fn default_i2cdetect() -> PathBuf {
    PathBuf::from("i2cdetect")
}

fn default_modprobe() -> PathBuf {
    PathBuf::from("modprobe")
}

fn default_sysfs_i2c_root() -> PathBuf {
    PathBuf::from("/sys/bus/i2c/devices")
}

fn default_auxiliary_root() -> PathBuf {
    PathBuf::from("/sys/bus/auxiliary/devices")
}

fn default_cdev_path() -> String {
    "/dev/fbiob_{vendor_id}.{device_id}.{sub_system_vendor_id}.{sub_system_device_id}".to_string()
}

fn default_aux_sysfs_name() -> String {
    "{fpga}.{aux_name}.{aux_id}".to_string()
}

fn default_aux_create_command() -> Vec<String> {
    ["fbiob_ioctl", "-c", "{cdev}", "create", "{aux_name}", "{aux_id}"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_aux_remove_command() -> Vec<String> {
    ["fbiob_ioctl", "-c", "{cdev}", "delete", "{aux_name}", "{aux_id}"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_bus_settle_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_bus_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_max_workers() -> usize {
    8
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            i2cdump: default_i2cdump(),
            i2cget: default_i2cget(),
            i2cdetect: default_i2cdetect(),
            modprobe: default_modprobe(),
            transaction_timeout: None,
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            sysfs_i2c_root: default_sysfs_i2c_root(),
            auxiliary_root: default_auxiliary_root(),
            cdev_path: default_cdev_path(),
            aux_sysfs_name: default_aux_sysfs_name(),
            aux_create_command: default_aux_create_command(),
            aux_remove_command: default_aux_remove_command(),
            modules: Vec::new(),
            bus_settle_timeout: default_bus_settle_timeout(),
            bus_poll_interval: default_bus_poll_interval(),
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

impl BspConfig {
    /// Load configuration from a specific file path and `BSP_I2C_` environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_figment(Figment::new().merge(Toml::file(path.as_ref())))
    }

    /// Load configuration from an in-memory TOML document (environment still applies).
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(toml)))
    }

    fn from_figment(base: Figment) -> Result<Self> {
        Ok(base
            .merge(Env::prefixed("BSP_I2C_").split("__"))
            .extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(BspError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.concurrency.max_workers < 2 {
            return Err(BspError::Configuration(format!(
                "Invalid max_workers {}. Concurrent scenarios need at least 2",
                self.concurrency.max_workers
            )));
        }

        for (name, command) in [
            ("aux_create_command", &self.kernel.aux_create_command),
            ("aux_remove_command", &self.kernel.aux_remove_command),
        ] {
            if command.is_empty() {
                return Err(BspError::Configuration(format!("{name} must not be empty")));
            }
        }

        if self.kernel.bus_poll_interval.is_zero() {
            return Err(BspError::Configuration(
                "bus_poll_interval must be greater than zero".to_string(),
            ));
        }

        self.topology.validate()
    }

    /// Render the effective configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| BspError::Configuration(format!("Failed to render config: {e}")))
    }
}

/// Template variables describing an FPGA (and optionally one of its aux devices).
pub fn template_vars(fpga: &FpgaSpec, aux: Option<&AuxDevice>) -> HashMap<String, String> {
    let mut vars = HashMap::from([
        ("fpga".to_string(), fpga.name.clone()),
        ("vendor_id".to_string(), fpga.vendor_id.clone()),
        ("device_id".to_string(), fpga.device_id.clone()),
        (
            "sub_system_vendor_id".to_string(),
            fpga.sub_system_vendor_id.clone(),
        ),
        (
            "sub_system_device_id".to_string(),
            fpga.sub_system_device_id.clone(),
        ),
    ]);
    if let Some(aux) = aux {
        vars.insert("aux_name".to_string(), aux.name.clone());
        vars.insert("aux_id".to_string(), aux.id.to_string());
    }
    vars
}

/// Render a `strfmt` template, mapping failures to configuration errors.
pub fn render(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    strfmt::strfmt(template, vars)
        .map_err(|e| BspError::Configuration(format!("Bad template '{template}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
log_level = "debug"

[tools]
transaction_timeout = "2s"

[kernel]
modules = ["fbiob_pci", "i2c_master"]
bus_settle_timeout = "500ms"

[[fpgas]]
name = "iob"
vendor_id = "1d9b"
device_id = "0011"
sub_system_vendor_id = "10ee"
sub_system_device_id = "0007"
"#;

    #[test]
    fn test_load_minimal_config() {
        let config = BspConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.tools.transaction_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.tools.i2cdump, PathBuf::from("i2cdump"));
        assert_eq!(config.kernel.bus_settle_timeout, Duration::from_millis(500));
        assert_eq!(config.kernel.modules.len(), 2);
        assert_eq!(config.concurrency.max_workers, 8);
        assert_eq!(config.topology.fpgas.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = BspConfig::from_toml_str(MINIMAL).unwrap();
        config.log_level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = BspConfig::from_toml_str(MINIMAL).unwrap();
        config.concurrency.max_workers = 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_workers"));

        let mut config = BspConfig::from_toml_str(MINIMAL).unwrap();
        config.kernel.aux_create_command.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cdev_template_renders() {
        let config = BspConfig::from_toml_str(MINIMAL).unwrap();
        let fpga = &config.topology.fpgas[0];
        let path = render(&config.kernel.cdev_path, &template_vars(fpga, None)).unwrap();
        assert_eq!(path, "/dev/fbiob_1d9b.0011.10ee.0007");
    }

    #[test]
    fn test_missing_template_key_is_an_error() {
        let config = BspConfig::from_toml_str(MINIMAL).unwrap();
        let fpga = &config.topology.fpgas[0];
        assert!(render("{aux_name}", &template_vars(fpga, None)).is_err());
    }

    #[test]
    fn test_round_trip_to_toml() {
        let config = BspConfig::from_toml_str(MINIMAL).unwrap();
        let rendered = config.to_toml_string().unwrap();
        let reloaded = BspConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(reloaded.topology, config.topology);
        assert_eq!(reloaded.tools.transaction_timeout, config.tools.transaction_timeout);
    }
}
