//! i2c-tools backed transactions and presence probing.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::ToolsConfig;
use crate::error::{BspError, Result};
use crate::hardware::capabilities::{DeviceProbe, I2cTool};
use crate::hardware::command::run_tool;
use crate::topology::{I2cAddress, Register};
use crate::verify::parser::parse_detect_output;

/// Runs `i2cdump`, `i2cget` and `i2cdetect` non-interactively (`-y`).
#[derive(Debug, Clone)]
pub struct I2cTools {
    i2cdump: PathBuf,
    i2cget: PathBuf,
    i2cdetect: PathBuf,
    deadline: Option<Duration>,
}

impl I2cTools {
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            i2cdump: config.i2cdump.clone(),
            i2cget: config.i2cget.clone(),
            i2cdetect: config.i2cdetect.clone(),
            deadline: config.transaction_timeout,
        }
    }
}

#[async_trait]
impl I2cTool for I2cTools {
    async fn dump(
        &self,
        bus: u32,
        address: I2cAddress,
        start: Register,
        end: Register,
    ) -> Result<String> {
        let args = [
            "-y".to_string(),
            "-r".to_string(),
            format!("{start}-{end}"),
            bus.to_string(),
            address.to_string(),
        ];
        run_tool(&self.i2cdump, &args, self.deadline).await
    }

    async fn get(&self, bus: u32, address: I2cAddress, reg: Register) -> Result<String> {
        let args = [
            "-y".to_string(),
            bus.to_string(),
            address.to_string(),
            reg.to_string(),
        ];
        run_tool(&self.i2cget, &args, self.deadline).await
    }
}

#[async_trait]
impl DeviceProbe for I2cTools {
    /// Scans exactly one address. `i2cdetect` picks the probe style itself (quick write,
    /// or receive byte for EEPROM ranges), so no register contents are read. `-a` lifts
    /// the tool's 0x03-0x77 window so every valid 7-bit address can be probed.
    async fn detect(&self, bus: u32, address: I2cAddress) -> Result<bool> {
        let args = [
            "-y".to_string(),
            "-a".to_string(),
            bus.to_string(),
            address.to_string(),
            address.to_string(),
        ];
        let output = run_tool(&self.i2cdetect, &args, self.deadline)
            .await
            .map_err(|e| BspError::DetectionFault {
                bus,
                address,
                message: e.to_string(),
            })?;

        let present = parse_detect_output(&output, address).ok_or_else(|| {
            BspError::DetectionFault {
                bus,
                address,
                message: "i2cdetect output has no cell for the address".to_string(),
            }
        })?;
        debug!(bus, %address, present, "Probed device");
        Ok(present)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Write an executable shell script standing in for one of the tools.
    fn fake_tool(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn tools(dir: &tempfile::TempDir, detect_body: &str) -> I2cTools {
        I2cTools::new(&ToolsConfig {
            i2cdump: fake_tool(dir, "i2cdump", "echo \"$@\""),
            i2cget: fake_tool(dir, "i2cget", "echo \"  0x12  \""),
            i2cdetect: fake_tool(dir, "i2cdetect", detect_body),
            modprobe: PathBuf::from("modprobe"),
            transaction_timeout: Some(Duration::from_secs(5)),
        })
    }

    #[tokio::test]
    async fn test_dump_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let tools = tools(&dir, "true");
        let addr = I2cAddress::new(0x50).unwrap();
        let out = tools.dump(11, addr, Register(0), Register(0x0f)).await.unwrap();
        assert_eq!(out.trim(), "-y -r 0x00-0x0f 11 0x50");
    }

    #[tokio::test]
    async fn test_get_returns_raw_output() {
        let dir = tempfile::tempdir().unwrap();
        let tools = tools(&dir, "true");
        let addr = I2cAddress::new(0x50).unwrap();
        let out = tools.get(11, addr, Register(0)).await.unwrap();
        assert_eq!(out.trim(), "0x12");
    }

    #[tokio::test]
    async fn test_detect_present_and_absent() {
        let dir = tempfile::tempdir().unwrap();
        let present = tools(&dir, "echo '50: 50 -- -- -- -- -- -- -- -- -- -- -- -- -- -- --'");
        let addr = I2cAddress::new(0x50).unwrap();
        assert!(present.detect(3, addr).await.unwrap());

        let dir = tempfile::tempdir().unwrap();
        let absent = tools(&dir, "echo '50: -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- --'");
        assert!(!absent.detect(3, addr).await.unwrap());
    }

    #[tokio::test]
    async fn test_detect_reaches_reserved_addresses() {
        let dir = tempfile::tempdir().unwrap();
        // Real i2cdetect refuses addresses below 0x03 without -a
        let tools = tools(
            &dir,
            "[ \"$*\" = \"-y -a 3 0x02 0x02\" ] || exit 1\nprintf '00:%7s02\\n' ''",
        );
        let addr = I2cAddress::new(0x02).unwrap();
        assert!(tools.detect(3, addr).await.unwrap());
    }

    #[tokio::test]
    async fn test_detect_bus_fault_is_not_absence() {
        let dir = tempfile::tempdir().unwrap();
        let broken = tools(&dir, "echo 'Error: Could not open file' >&2; exit 1");
        let addr = I2cAddress::new(0x50).unwrap();
        let err = broken.detect(99, addr).await.unwrap_err();
        assert!(matches!(err, BspError::DetectionFault { bus: 99, .. }));
    }
}
