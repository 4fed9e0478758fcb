//! Golden-value verification of dump and get transactions.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{AcquireError, Semaphore};
use tracing::{debug, warn, Instrument};

use crate::error::{BspError, Mismatch, Observation, Result, TransactionKind, VerificationFailure};
use crate::hardware::capabilities::I2cTool;
use crate::topology::{DeviceSpec, DumpCase, GetCase, Register};
use crate::verify::parser::parse_dump_output;

/// Runs a device's declared transactions and compares them with the expected values.
///
/// Cheap to clone; clones share the underlying tool.
#[derive(Clone)]
pub struct TransactionRunner {
    tool: Arc<dyn I2cTool>,
}

impl TransactionRunner {
    pub fn new(tool: Arc<dyn I2cTool>) -> Self {
        Self { tool }
    }

    /// Ranged dump of `[case.start, case.end]`, compared element-wise.
    pub async fn run_dump_case(&self, device: &DeviceSpec, bus: u32, case: &DumpCase) -> Result<()> {
        let raw = self
            .tool
            .dump(bus, device.address, case.start, case.end)
            .await?;
        let actual = parse_dump_output(&raw);

        if actual == case.expected {
            debug!(bus, address = %device.address, range = %case.range(), "Dump matched");
            return Ok(());
        }

        let first_mismatch = actual
            .iter()
            .zip(case.expected.iter())
            .enumerate()
            .find(|(_, (a, e))| a != e)
            .map(|(i, (a, e))| Mismatch {
                offset: Register(case.start.0.wrapping_add(i as u8)),
                actual: *a,
                expected: *e,
            });

        let failure = VerificationFailure {
            address: device.address,
            bus,
            kind: TransactionKind::Dump,
            location: case.range(),
            observation: Observation::Registers {
                actual,
                expected: case.expected.clone(),
                first_mismatch,
            },
        };
        warn!(%failure, "Dump mismatch");
        Err(failure.into())
    }

    /// Single-register get, compared textually after trimming whitespace.
    pub async fn run_get_case(&self, device: &DeviceSpec, bus: u32, case: &GetCase) -> Result<()> {
        let raw = self.tool.get(bus, device.address, case.reg).await?;
        let actual = raw.trim();
        let expected = case.expected.trim();

        if actual == expected {
            debug!(bus, address = %device.address, reg = %case.reg, "Get matched");
            return Ok(());
        }

        let failure = VerificationFailure {
            address: device.address,
            bus,
            kind: TransactionKind::Get,
            location: case.reg.to_string(),
            observation: Observation::Text {
                actual: actual.to_string(),
                expected: expected.to_string(),
            },
        };
        warn!(%failure, "Get mismatch");
        Err(failure.into())
    }

    /// Every dump case of `device`, each attempted once. Failures do not stop the rest.
    pub async fn run_dump_cases(&self, device: &DeviceSpec, bus: u32) -> Vec<BspError> {
        let mut failures = Vec::new();
        let Some(data) = &device.test_data else {
            return failures;
        };
        for case in &data.i2c_dump_data {
            if let Err(e) = self.run_dump_case(device, bus, case).await {
                failures.push(e);
            }
        }
        failures
    }

    /// Every get case of `device`, each attempted once. Failures do not stop the rest.
    pub async fn run_get_cases(&self, device: &DeviceSpec, bus: u32) -> Vec<BspError> {
        let mut failures = Vec::new();
        let Some(data) = &device.test_data else {
            return failures;
        };
        for case in &data.i2c_get_data {
            if let Err(e) = self.run_get_case(device, bus, case).await {
                failures.push(e);
            }
        }
        failures
    }

    /// All dump cases, then all get cases. No-op for a device without test data.
    pub async fn run_all(&self, device: &DeviceSpec, bus: u32) -> Result<()> {
        if !device.has_test_data() {
            return Ok(());
        }
        let mut failures = self.run_dump_cases(device, bus).await;
        failures.extend(self.run_get_cases(device, bus).await);
        BspError::aggregate(failures)
    }

    /// Like [`run_all`](Self::run_all), but the dump sequence and the get sequence run as
    /// two independent tasks on the runtime's worker pool.
    ///
    /// Both tasks are always joined. Failures are reported dump-first, so the verdict and
    /// its contents match the sequential path for the same hardware state.
    pub async fn run_all_concurrent(&self, device: &DeviceSpec, bus: u32) -> Result<()> {
        self.run_all_bounded(device, bus, Arc::new(Semaphore::new(2))).await
    }

    /// [`run_all_concurrent`](Self::run_all_concurrent) with each unit holding one
    /// permit of `limit` for as long as it talks to the bus.
    ///
    /// Sharing `limit` across devices caps the number of units in flight for the
    /// whole run, not per device.
    pub async fn run_all_bounded(
        &self,
        device: &DeviceSpec,
        bus: u32,
        limit: Arc<Semaphore>,
    ) -> Result<()> {
        let Some(data) = &device.test_data else {
            return Ok(());
        };

        let dumps = (!data.i2c_dump_data.is_empty()).then(|| {
            let runner = self.clone();
            let device = device.clone();
            let limit = Arc::clone(&limit);
            tokio::spawn(
                async move {
                    let _permit = limit.acquire_owned().await?;
                    Ok::<_, AcquireError>(runner.run_dump_cases(&device, bus).await)
                }
                .in_current_span(),
            )
        });
        let gets = (!data.i2c_get_data.is_empty()).then(|| {
            let runner = self.clone();
            let device = device.clone();
            let limit = Arc::clone(&limit);
            tokio::spawn(
                async move {
                    let _permit = limit.acquire_owned().await?;
                    Ok::<_, AcquireError>(runner.run_get_cases(&device, bus).await)
                }
                .in_current_span(),
            )
        });

        let mut failures = Vec::new();
        for (label, handle) in [("dump", dumps), ("get", gets)] {
            let Some(handle) = handle else {
                continue;
            };
            match handle.await {
                Ok(Ok(unit_failures)) => failures.extend(unit_failures),
                Ok(Err(e)) => failures.push(unit_error(label, device, bus, e)),
                Err(e) => failures.push(unit_error(label, device, bus, e)),
            }
        }
        BspError::aggregate(failures)
    }
}

fn unit_error(label: &str, device: &DeviceSpec, bus: u32, err: impl fmt::Display) -> BspError {
    BspError::Task(format!("{label} unit for {} on bus {bus}: {err}", device.address))
}
