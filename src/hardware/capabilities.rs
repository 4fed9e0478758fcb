//! Collaborator traits the validation engine is written against.
//!
//! Each trait covers one narrow kernel-facing concern, so procedures can be exercised
//! against the in-memory [`FakeBoard`](crate::hardware::mock::FakeBoard) exactly as they
//! run against real sysfs and i2c-tools:
//!
//! - [`BusProvisioner`] - create and destroy the busses behind an adapter
//! - [`DeviceProbe`] - is anything answering at `(bus, address)`?
//! - [`I2cTool`] - ranged dump and single-register get transactions
//! - [`I2cDeviceBinder`] - instantiate a kernel client for a device
//! - [`KernelModules`] - load and unload the BSP drivers
//! - [`CdevPaths`] - where an FPGA's character device is expected to live
//! - [`AuxDeviceControl`] - create and remove auxiliary devices on the FPGA
//!
//! # Design Philosophy
//!
//! Each trait:
//! - Is async (uses #[async_trait]) where it touches the kernel or spawns a tool
//! - Is thread-safe (requires Send + Sync) so it can be shared with worker tasks
//! - Uses [`crate::error::Result`] so failures keep their kind across the join barrier

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;
use crate::topology::{AdapterSpec, AuxDevice, DeviceSpec, FpgaSpec, I2cAddress, Register};

/// One kernel I2C bus as listed under sysfs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusDescriptor {
    pub bus_num: u32,
    /// Adapter name reported by the kernel (`/sys/bus/i2c/devices/i2c-N/name`).
    pub name: String,
}

/// The busses created by provisioning one adapter.
///
/// Only ever obtained from [`BusProvisioner::create`] and only lives for one scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveAdapter {
    /// Created busses in ascending bus-number order.
    pub busses: Vec<BusDescriptor>,
    /// Lowest bus number among `busses`; channel 0 of the adapter.
    pub base_bus_num: u32,
}

impl LiveAdapter {
    /// Build a live adapter from the busses that appeared, sorting them by number.
    ///
    /// Returns `None` if no bus appeared.
    pub fn from_busses(mut busses: Vec<BusDescriptor>) -> Option<Self> {
        busses.sort();
        let base_bus_num = busses.first()?.bus_num;
        Some(Self {
            busses,
            base_bus_num,
        })
    }

    /// Bus number serving `channel`.
    pub fn bus_for(&self, channel: u32) -> u32 {
        self.base_bus_num + channel
    }

    /// Bus number serving `device`.
    pub fn bus_for_device(&self, device: &DeviceSpec) -> u32 {
        self.bus_for(device.channel)
    }

    /// Number of distinct bus names.
    pub fn distinct_names(&self) -> usize {
        self.busses
            .iter()
            .map(|b| b.name.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len()
    }
}

/// Capability: Adapter Provisioning
///
/// # Contract
/// - `create` returns only after every channel bus exists, with a stable `base_bus_num`
/// - every returned descriptor has a unique name
/// - `destroy` removes the aux device and all busses below it; an absent device is `Ok(())`
#[async_trait]
pub trait BusProvisioner: Send + Sync {
    /// Instantiate the adapter's aux device and report the busses that appeared.
    async fn create(&self, fpga: &FpgaSpec, adapter: &AdapterSpec) -> Result<LiveAdapter>;

    /// Remove the aux device. Must be idempotent.
    async fn destroy(&self, fpga: &FpgaSpec, aux: &AuxDevice) -> Result<()>;
}

/// Capability: Presence Detection
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    /// Minimal probe transaction.
    ///
    /// # Returns
    /// - Ok(true) if the device acknowledged or a driver already owns the address
    /// - Ok(false) on no response / NACK
    /// - Err(DetectionFault) if the bus itself could not be accessed
    async fn detect(&self, bus: u32, address: I2cAddress) -> Result<bool>;
}

/// Capability: Register Transactions
///
/// Both methods return the tool's raw stdout; parsing and comparison are done by
/// [`TransactionRunner`](crate::verify::TransactionRunner).
#[async_trait]
pub trait I2cTool: Send + Sync {
    /// Ranged read of `[start, end]`, returning the `i2cdump` grid text.
    async fn dump(
        &self,
        bus: u32,
        address: I2cAddress,
        start: Register,
        end: Register,
    ) -> Result<String>;

    /// Single-register read, returning the `i2cget` output (one hex token).
    async fn get(&self, bus: u32, address: I2cAddress, reg: Register) -> Result<String>;
}

/// Capability: Kernel Client Instantiation
#[async_trait]
pub trait I2cDeviceBinder: Send + Sync {
    /// Instantiate a client for `device` on `bus`.
    ///
    /// # Returns
    /// - Ok(true) if the client now exists
    /// - Ok(false) if the kernel accepted the request but no client appeared
    async fn bind(&self, device: &DeviceSpec, bus: u32) -> Result<bool>;
}

/// Capability: Kernel Module Management
#[async_trait]
pub trait KernelModules: Send + Sync {
    /// Make sure every driver needed for provisioning is loaded.
    async fn load(&self) -> Result<()>;

    /// Unload the drivers. Only valid once no adapter from this scenario is live.
    async fn unload(&self) -> Result<()>;
}

/// Capability: Character Device Location
pub trait CdevPaths: Send + Sync {
    /// Expected device-node path for `fpga`. Existence is checked by the caller.
    fn cdev_path(&self, fpga: &FpgaSpec) -> Result<PathBuf>;
}

/// Capability: Auxiliary Device Control
///
/// Lower-level seam used by [`KernelBusProvisioner`](crate::hardware::provisioner::KernelBusProvisioner).
#[async_trait]
pub trait AuxDeviceControl: Send + Sync {
    /// Ask the FPGA driver to instantiate `aux`.
    async fn create(&self, fpga: &FpgaSpec, aux: &AuxDevice) -> Result<()>;

    /// Ask the FPGA driver to remove `aux`.
    async fn remove(&self, fpga: &FpgaSpec, aux: &AuxDevice) -> Result<()>;

    /// Whether `aux` currently exists in the kernel.
    async fn is_present(&self, fpga: &FpgaSpec, aux: &AuxDevice) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus(bus_num: u32, name: &str) -> BusDescriptor {
        BusDescriptor {
            bus_num,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_live_adapter_base_is_lowest_bus() {
        let live = LiveAdapter::from_busses(vec![bus(12, "c2"), bus(10, "c0"), bus(11, "c1")])
            .unwrap();
        assert_eq!(live.base_bus_num, 10);
        assert_eq!(live.bus_for(1), 11);
        assert_eq!(
            live.busses.iter().map(|b| b.bus_num).collect::<Vec<_>>(),
            vec![10, 11, 12]
        );
    }

    #[test]
    fn test_live_adapter_requires_a_bus() {
        assert!(LiveAdapter::from_busses(Vec::new()).is_none());
    }

    #[test]
    fn test_distinct_names_counts_duplicates_once() {
        let live = LiveAdapter::from_busses(vec![bus(3, "dup"), bus(4, "dup")]).unwrap();
        assert_eq!(live.distinct_names(), 1);
    }
}
