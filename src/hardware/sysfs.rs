//! Read-side and client-instantiation access to the kernel's I2C sysfs tree.
//!
//! Layout relied on (rooted at `sysfs_i2c_root`, normally `/sys/bus/i2c/devices`):
//!
//! ```text
//! i2c-10/name          adapter name
//! i2c-10/new_device    write "<driver> <addr>" to instantiate a client
//! 10-0050/             client directory once instantiated
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{BspError, Result};
use crate::hardware::capabilities::{BusDescriptor, I2cDeviceBinder};
use crate::topology::{DeviceSpec, I2cAddress};

/// Handle on the sysfs I2C device directory.
#[derive(Debug, Clone)]
pub struct SysfsI2c {
    root: PathBuf,
}

impl SysfsI2c {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every `i2c-N` bus currently registered, sorted by bus number.
    ///
    /// A bus whose `name` attribute disappears mid-scan (it was just removed) is skipped.
    pub async fn list_busses(&self) -> Result<Vec<BusDescriptor>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut busses = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(bus_num) = file_name
                .to_str()
                .and_then(|n| n.strip_prefix("i2c-"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            match tokio::fs::read_to_string(entry.path().join("name")).await {
                Ok(name) => busses.push(BusDescriptor {
                    bus_num,
                    name: name.trim().to_string(),
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(bus_num, "Bus vanished while listing");
                }
                Err(e) => return Err(e.into()),
            }
        }
        busses.sort();
        Ok(busses)
    }

    /// Client directory for `address` on `bus` (e.g. `10-0050`).
    pub fn client_path(&self, bus: u32, address: I2cAddress) -> PathBuf {
        self.root.join(format!("{bus}-{:04x}", address.value()))
    }

    fn new_device_path(&self, bus: u32) -> PathBuf {
        self.root.join(format!("i2c-{bus}")).join("new_device")
    }
}

#[async_trait]
impl I2cDeviceBinder for SysfsI2c {
    async fn bind(&self, device: &DeviceSpec, bus: u32) -> Result<bool> {
        if device.device_name.is_empty() {
            return Err(BspError::Topology(format!(
                "device {} on channel {} has no device_name to bind",
                device.address, device.channel
            )));
        }
        let request = format!("{} {}", device.device_name, device.address);
        tokio::fs::write(self.new_device_path(bus), request.as_bytes()).await?;

        let created = tokio::fs::try_exists(self.client_path(bus, device.address)).await?;
        info!(bus, address = %device.address, driver = %device.device_name, created, "Bound I2C client");
        Ok(created)
    }
}
