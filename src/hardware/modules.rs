//! Kernel module management through `modprobe`.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::hardware::capabilities::KernelModules;
use crate::hardware::command::run_tool;

/// Loads the configured modules in order and unloads them in reverse.
#[derive(Debug, Clone)]
pub struct Modprobe {
    program: PathBuf,
    modules: Vec<String>,
}

impl Modprobe {
    pub fn new(program: impl Into<PathBuf>, modules: Vec<String>) -> Self {
        Self {
            program: program.into(),
            modules,
        }
    }
}

#[async_trait]
impl KernelModules for Modprobe {
    async fn load(&self) -> Result<()> {
        for module in &self.modules {
            run_tool(&self.program, &[module.as_str()], None).await?;
        }
        info!(modules = ?self.modules, "Kernel modules loaded");
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        for module in self.modules.iter().rev() {
            run_tool(&self.program, &["-r", module.as_str()], None).await?;
        }
        info!(modules = ?self.modules, "Kernel modules unloaded");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn test_load_in_order_unload_in_reverse() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("modprobe.log");
        let script = dir.path().join("modprobe");
        std::fs::write(&script, format!("#!/bin/sh\necho \"$@\" >> {}\n", log.display())).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let modprobe = Modprobe::new(&script, vec!["fbiob_pci".into(), "i2c_master".into()]);
        modprobe.load().await.unwrap();
        modprobe.unload().await.unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(
            calls,
            vec!["fbiob_pci", "i2c_master", "-r i2c_master", "-r fbiob_pci"]
        );
    }
}
