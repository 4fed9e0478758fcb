//! Adapter provisioning against the real kernel.
//!
//! Bus numbers are assigned by the kernel, so `create` discovers them by diffing the
//! sysfs bus list before and after the aux device is instantiated. Allocation is
//! therefore stateless per call: whatever the kernel hands out this time is what the
//! returned [`LiveAdapter`] reports. Adapters must be provisioned one at a time for the
//! diff to be attributable.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::KernelConfig;
use crate::error::{BspError, Result};
use crate::hardware::capabilities::{AuxDeviceControl, BusProvisioner, LiveAdapter};
use crate::hardware::sysfs::SysfsI2c;
use crate::topology::{AdapterSpec, AuxDevice, FpgaSpec};

/// [`BusProvisioner`] backed by an [`AuxDeviceControl`] and the sysfs bus list.
pub struct KernelBusProvisioner {
    aux: Arc<dyn AuxDeviceControl>,
    sysfs: SysfsI2c,
    settle_timeout: Duration,
    poll_interval: Duration,
}

impl KernelBusProvisioner {
    pub fn new(aux: Arc<dyn AuxDeviceControl>, config: &KernelConfig) -> Self {
        Self {
            aux,
            sysfs: SysfsI2c::new(config.sysfs_i2c_root.clone()),
            settle_timeout: config.bus_settle_timeout,
            poll_interval: config.bus_poll_interval,
        }
    }
}

#[async_trait]
impl BusProvisioner for KernelBusProvisioner {
    async fn create(&self, fpga: &FpgaSpec, adapter: &AdapterSpec) -> Result<LiveAdapter> {
        let aux = &adapter.aux_device;
        let expected = aux.num_channels().ok_or_else(|| {
            BspError::provision(aux.to_string(), "aux device declares no i2c_info")
        })? as usize;

        let existing: HashSet<u32> = self
            .sysfs
            .list_busses()
            .await?
            .into_iter()
            .map(|b| b.bus_num)
            .collect();

        self.aux.create(fpga, aux).await?;

        let deadline = Instant::now() + self.settle_timeout;
        let created = loop {
            let created: Vec<_> = self
                .sysfs
                .list_busses()
                .await?
                .into_iter()
                .filter(|b| !existing.contains(&b.bus_num))
                .collect();
            if created.len() >= expected || Instant::now() >= deadline {
                break created;
            }
            debug!(%aux, found = created.len(), expected, "Waiting for busses");
            sleep(self.poll_interval).await;
        };

        if created.len() != expected {
            return Err(BspError::provision(
                aux.to_string(),
                format!("expected {expected} new bus(ses), found {}", created.len()),
            ));
        }

        let live = LiveAdapter::from_busses(created).ok_or_else(|| {
            BspError::provision(aux.to_string(), "no busses were created")
        })?;
        if live.distinct_names() != live.busses.len() {
            return Err(BspError::provision(
                aux.to_string(),
                format!("created busses have duplicate names: {:?}", live.busses),
            ));
        }

        info!(fpga = %fpga.name, %aux, base_bus = live.base_bus_num, busses = live.busses.len(), "Adapter created");
        Ok(live)
    }

    async fn destroy(&self, fpga: &FpgaSpec, aux: &AuxDevice) -> Result<()> {
        if !self.aux.is_present(fpga, aux).await? {
            debug!(fpga = %fpga.name, %aux, "Aux device already absent");
            return Ok(());
        }
        self.aux.remove(fpga, aux).await.inspect_err(|e| {
            warn!(fpga = %fpga.name, %aux, error = %e, "Aux device removal failed");
        })?;
        info!(fpga = %fpga.name, %aux, "Adapter destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    /// Aux control that materializes busses in a temporary sysfs tree.
    struct TreeAux {
        root: PathBuf,
        names: Vec<&'static str>,
        first_bus: u32,
        present: Mutex<bool>,
        removals: Mutex<usize>,
    }

    fn add_bus(root: &Path, bus: u32, name: &str) {
        let dir = root.join(format!("i2c-{bus}"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("name"), name).unwrap();
    }

    #[async_trait]
    impl AuxDeviceControl for TreeAux {
        async fn create(&self, _fpga: &FpgaSpec, _aux: &AuxDevice) -> Result<()> {
            for (i, name) in self.names.iter().enumerate() {
                add_bus(&self.root, self.first_bus + i as u32, name);
            }
            *self.present.lock().unwrap() = true;
            Ok(())
        }

        async fn remove(&self, _fpga: &FpgaSpec, _aux: &AuxDevice) -> Result<()> {
            for i in 0..self.names.len() {
                let _ = std::fs::remove_dir_all(
                    self.root.join(format!("i2c-{}", self.first_bus + i as u32)),
                );
            }
            *self.present.lock().unwrap() = false;
            *self.removals.lock().unwrap() += 1;
            Ok(())
        }

        async fn is_present(&self, _fpga: &FpgaSpec, _aux: &AuxDevice) -> Result<bool> {
            Ok(*self.present.lock().unwrap())
        }
    }

    fn fpga() -> FpgaSpec {
        FpgaSpec {
            name: "iob".into(),
            vendor_id: "1d9b".into(),
            device_id: "0011".into(),
            sub_system_vendor_id: "10ee".into(),
            sub_system_device_id: "0007".into(),
            i2c_adapters: Vec::new(),
        }
    }

    fn adapter(channels: u32) -> AdapterSpec {
        toml::from_str(&format!(
            "aux_device = {{ name = \"i2c_master\", i2c_info = {{ num_channels = {channels} }} }}"
        ))
        .unwrap()
    }

    fn provisioner(
        dir: &tempfile::TempDir,
        names: Vec<&'static str>,
    ) -> (KernelBusProvisioner, Arc<TreeAux>) {
        add_bus(dir.path(), 0, "SMBus I801");
        let aux = Arc::new(TreeAux {
            root: dir.path().to_path_buf(),
            names,
            first_bus: 10,
            present: Mutex::new(false),
            removals: Mutex::new(0),
        });
        let config = KernelConfig {
            sysfs_i2c_root: dir.path().to_path_buf(),
            bus_settle_timeout: Duration::from_millis(200),
            bus_poll_interval: Duration::from_millis(10),
            ..KernelConfig::default()
        };
        (KernelBusProvisioner::new(aux.clone(), &config), aux)
    }

    #[tokio::test]
    async fn test_create_discovers_new_busses() {
        let dir = tempfile::tempdir().unwrap();
        let (prov, _) = provisioner(&dir, vec!["ch0", "ch1"]);

        let live = prov.create(&fpga(), &adapter(2)).await.unwrap();
        assert_eq!(live.base_bus_num, 10);
        assert_eq!(live.busses.len(), 2);
        assert_eq!(live.distinct_names(), 2);
    }

    #[tokio::test]
    async fn test_channel_count_mismatch_is_provision_error() {
        let dir = tempfile::tempdir().unwrap();
        let (prov, _) = provisioner(&dir, vec!["ch0"]);

        let err = prov.create(&fpga(), &adapter(2)).await.unwrap_err();
        assert!(matches!(err, BspError::Provision { .. }));
        assert!(err.to_string().contains("expected 2 new bus(ses), found 1"));
    }

    #[tokio::test]
    async fn test_duplicate_bus_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (prov, _) = provisioner(&dir, vec!["same", "same"]);

        let err = prov.create(&fpga(), &adapter(2)).await.unwrap_err();
        assert!(err.to_string().contains("duplicate names"));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (prov, aux) = provisioner(&dir, vec!["ch0", "ch1"]);
        let adapter = adapter(2);

        prov.create(&fpga(), &adapter).await.unwrap();
        prov.destroy(&fpga(), &adapter.aux_device).await.unwrap();
        prov.destroy(&fpga(), &adapter.aux_device).await.unwrap();
        assert_eq!(*aux.removals.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_recreate_yields_same_base() {
        let dir = tempfile::tempdir().unwrap();
        let (prov, _) = provisioner(&dir, vec!["ch0", "ch1"]);
        let adapter = adapter(2);

        let first = prov.create(&fpga(), &adapter).await.unwrap();
        prov.destroy(&fpga(), &adapter.aux_device).await.unwrap();
        let second = prov.create(&fpga(), &adapter).await.unwrap();
        assert_eq!(first.base_bus_num, second.base_bus_num);
    }
}
