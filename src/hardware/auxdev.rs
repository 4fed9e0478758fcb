//! Auxiliary device control through configured command templates.
//!
//! The FPGA driver exposes aux-device creation through its character device. The
//! exact helper differs between BSPs, so the create/remove invocations are `strfmt`
//! templates from [`KernelConfig`]; presence is read back from the auxiliary bus in
//! sysfs.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::{render, template_vars, KernelConfig};
use crate::error::{BspError, Result};
use crate::hardware::capabilities::{AuxDeviceControl, CdevPaths};
use crate::hardware::command::run_tool;
use crate::topology::{AuxDevice, FpgaSpec};

/// Renders the configured character-device path template.
#[derive(Debug, Clone)]
pub struct TemplateCdevPaths {
    template: String,
}

impl TemplateCdevPaths {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl CdevPaths for TemplateCdevPaths {
    fn cdev_path(&self, fpga: &FpgaSpec) -> Result<PathBuf> {
        render(&self.template, &template_vars(fpga, None)).map(PathBuf::from)
    }
}

/// Creates and removes aux devices by running the configured commands.
#[derive(Debug, Clone)]
pub struct CommandAuxDevices {
    create_command: Vec<String>,
    remove_command: Vec<String>,
    sysfs_name: String,
    auxiliary_root: PathBuf,
    cdev: TemplateCdevPaths,
    deadline: Option<Duration>,
}

impl CommandAuxDevices {
    pub fn new(config: &KernelConfig, deadline: Option<Duration>) -> Self {
        Self {
            create_command: config.aux_create_command.clone(),
            remove_command: config.aux_remove_command.clone(),
            sysfs_name: config.aux_sysfs_name.clone(),
            auxiliary_root: config.auxiliary_root.clone(),
            cdev: TemplateCdevPaths::new(config.cdev_path.clone()),
            deadline,
        }
    }

    async fn run(&self, template: &[String], fpga: &FpgaSpec, aux: &AuxDevice) -> Result<()> {
        let mut vars = template_vars(fpga, Some(aux));
        let cdev = self.cdev.cdev_path(fpga)?;
        vars.insert("cdev".to_string(), cdev.display().to_string());

        let rendered = template
            .iter()
            .map(|part| render(part, &vars))
            .collect::<Result<Vec<_>>>()?;
        let (program, args) = rendered
            .split_first()
            .ok_or_else(|| BspError::Configuration("empty aux device command".to_string()))?;

        run_tool(&PathBuf::from(program), args, self.deadline)
            .await
            .map(|_| ())
            .map_err(|e| BspError::provision(aux.to_string(), e.to_string()))
    }
}

#[async_trait]
impl AuxDeviceControl for CommandAuxDevices {
    async fn create(&self, fpga: &FpgaSpec, aux: &AuxDevice) -> Result<()> {
        info!(fpga = %fpga.name, %aux, "Creating aux device");
        self.run(&self.create_command, fpga, aux).await
    }

    async fn remove(&self, fpga: &FpgaSpec, aux: &AuxDevice) -> Result<()> {
        info!(fpga = %fpga.name, %aux, "Removing aux device");
        self.run(&self.remove_command, fpga, aux).await
    }

    async fn is_present(&self, fpga: &FpgaSpec, aux: &AuxDevice) -> Result<bool> {
        let name = render(&self.sysfs_name, &template_vars(fpga, Some(aux)))?;
        Ok(tokio::fs::try_exists(self.auxiliary_root.join(name)).await?)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

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

    fn aux() -> AuxDevice {
        AuxDevice {
            name: "i2c_master".into(),
            id: 3,
            i2c_info: None,
        }
    }

    fn kernel(dir: &tempfile::TempDir, log: &std::path::Path) -> KernelConfig {
        let log = log.display().to_string();
        KernelConfig {
            auxiliary_root: dir.path().to_path_buf(),
            aux_create_command: vec![
                "sh".into(),
                "-c".into(),
                format!("echo create {{cdev}} {{aux_name}} {{aux_id}} >> {log}"),
            ],
            aux_remove_command: vec!["false".into()],
            ..KernelConfig::default()
        }
    }

    #[tokio::test]
    async fn test_create_renders_command() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let control = CommandAuxDevices::new(&kernel(&dir, &log), None);

        control.create(&fpga(), &aux()).await.unwrap();
        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls.trim(), "create /dev/fbiob_1d9b.0011.10ee.0007 i2c_master 3");
    }

    #[tokio::test]
    async fn test_failed_command_is_a_provision_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let control = CommandAuxDevices::new(&kernel(&dir, &log), None);

        let err = control.remove(&fpga(), &aux()).await.unwrap_err();
        assert!(matches!(err, BspError::Provision { .. }));
    }

    #[tokio::test]
    async fn test_presence_follows_sysfs_entry() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let control = CommandAuxDevices::new(&kernel(&dir, &log), None);

        assert!(!control.is_present(&fpga(), &aux()).await.unwrap());
        std::fs::create_dir(dir.path().join("iob.i2c_master.3")).unwrap();
        assert!(control.is_present(&fpga(), &aux()).await.unwrap());
    }
}
