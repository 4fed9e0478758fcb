//! BSP I2C Validation Scenarios
//!
//! The suite drives the kernel's I2C stack through the lifecycle an FPGA BSP must
//! support, one scenario at a time.
//!
//! # Key Concepts
//!
//! - **Scenario**: one self-contained check (character device present, adapter
//!   creates busses, devices answer, transactions match golden values, ...)
//! - **Platform**: the set of collaborators a scenario talks to; real kernel or fake
//! - **Scoped adapter**: every adapter a scenario creates is destroyed before the
//!   scenario returns, whether the body passed, failed or panicked
//! - **ScenarioReport**: structured verdict with every failure listed
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                         BspTestSuite                               │
//! │   load modules → scenario body → ScenarioReport                    │
//! ├────────────────────────────────────────────────────────────────────┤
//! │                  with_live_adapter (guard)                         │
//! │   create → body(LiveAdapter) → destroy (always)                    │
//! ├──────────────────────────────┬─────────────────────────────────────┤
//! │  TransactionRunner           │  ConcurrencyOrchestrator            │
//! │  dump/get + compare          │  JoinSet + Semaphore(max_workers)   │
//! ├──────────────────────────────┴─────────────────────────────────────┤
//! │                    Platform (capabilities)                         │
//! │  BusProvisioner | DeviceProbe | I2cTool | I2cDeviceBinder | ...    │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use bsp_i2c::config::BspConfig;
//! use bsp_i2c::procedures::{BspTestSuite, Scenario};
//!
//! let config = BspConfig::load_from("bsp_i2c.toml")?;
//! let suite = BspTestSuite::from_config(&config);
//!
//! let report = suite.run(Scenario::SimultaneousTransactions).await;
//! println!("{}", report.summary());
//! ```

pub mod guard;
pub mod orchestrator;
pub mod result;

// Re-exports
pub use guard::with_live_adapter;
pub use orchestrator::{ConcurrencyOrchestrator, CrossChannel};
pub use result::{Outcome, ScenarioReport, SuiteReport};

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, Instrument};

use crate::config::{BspConfig, ConcurrencyConfig};
use crate::error::{BspError, Result};
use crate::hardware::auxdev::{CommandAuxDevices, TemplateCdevPaths};
use crate::hardware::capabilities::{
    BusProvisioner, CdevPaths, DeviceProbe, I2cDeviceBinder, I2cTool, KernelModules, LiveAdapter,
};
use crate::hardware::mock::FakeBoard;
use crate::hardware::modules::Modprobe;
use crate::hardware::provisioner::KernelBusProvisioner;
use crate::hardware::sysfs::SysfsI2c;
use crate::hardware::tools::I2cTools;
use crate::topology::{AdapterSpec, FpgaSpec, Topology};
use crate::verify::TransactionRunner;
use guard::record;

// =============================================================================
// Scenario
// =============================================================================

/// The checks the suite knows how to run, in their default execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// Every FPGA's character device exists once the modules are loaded
    CdevIsCreated,
    /// Every adapter creates its busses, each with a distinct name
    AdapterCreatesBusses,
    /// Every declared device answers on `base + channel`
    AdapterDevicesExist,
    /// Clients can be bound on a live adapter and the modules still unload
    BusWithDevicesCanBeUnloaded,
    /// Declared transactions match their golden values, device by device
    Transactions,
    /// Declared transactions match while running concurrently across channels
    SimultaneousTransactions,
}

impl Scenario {
    /// Every scenario, in execution order.
    pub const ALL: [Scenario; 6] = [
        Scenario::CdevIsCreated,
        Scenario::AdapterCreatesBusses,
        Scenario::AdapterDevicesExist,
        Scenario::BusWithDevicesCanBeUnloaded,
        Scenario::Transactions,
        Scenario::SimultaneousTransactions,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::CdevIsCreated => "cdev-is-created",
            Scenario::AdapterCreatesBusses => "adapter-creates-busses",
            Scenario::AdapterDevicesExist => "adapter-devices-exist",
            Scenario::BusWithDevicesCanBeUnloaded => "bus-with-devices-can-be-unloaded",
            Scenario::Transactions => "transactions",
            Scenario::SimultaneousTransactions => "simultaneous-transactions",
        }
    }

    /// One-line description for `list-scenarios`.
    pub fn description(self) -> &'static str {
        match self {
            Scenario::CdevIsCreated => "character device exists for every FPGA",
            Scenario::AdapterCreatesBusses => "each adapter creates uniquely named busses",
            Scenario::AdapterDevicesExist => "each declared device responds on its bus",
            Scenario::BusWithDevicesCanBeUnloaded => {
                "bind clients on a live adapter, then unload the modules"
            }
            Scenario::Transactions => "dump/get transactions match golden values",
            Scenario::SimultaneousTransactions => {
                "transactions match while running concurrently across channels"
            }
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Platform
// =============================================================================

/// Collaborators the scenarios run against.
#[derive(Clone)]
pub struct Platform {
    pub provisioner: Arc<dyn BusProvisioner>,
    pub probe: Arc<dyn DeviceProbe>,
    pub tool: Arc<dyn I2cTool>,
    pub binder: Arc<dyn I2cDeviceBinder>,
    pub kmods: Arc<dyn KernelModules>,
    pub cdev: Arc<dyn CdevPaths>,
}

impl Platform {
    /// Real kernel: i2c-tools, sysfs, modprobe and the configured aux-device commands.
    pub fn from_config(config: &BspConfig) -> Self {
        let tools = Arc::new(I2cTools::new(&config.tools));
        let aux = Arc::new(CommandAuxDevices::new(
            &config.kernel,
            config.tools.transaction_timeout,
        ));
        Self {
            provisioner: Arc::new(KernelBusProvisioner::new(aux, &config.kernel)),
            probe: tools.clone(),
            tool: tools,
            binder: Arc::new(SysfsI2c::new(config.kernel.sysfs_i2c_root.clone())),
            kmods: Arc::new(Modprobe::new(
                config.tools.modprobe.clone(),
                config.kernel.modules.clone(),
            )),
            cdev: Arc::new(TemplateCdevPaths::new(config.kernel.cdev_path.clone())),
        }
    }

    /// Every role played by one simulated board.
    pub fn from_fake(board: Arc<FakeBoard>) -> Self {
        Self {
            provisioner: board.clone(),
            probe: board.clone(),
            tool: board.clone(),
            binder: board.clone(),
            kmods: board.clone(),
            cdev: board,
        }
    }
}

// =============================================================================
// Suite
// =============================================================================

/// Runs scenarios against one topology and platform.
pub struct BspTestSuite {
    topology: Arc<Topology>,
    platform: Platform,
    runner: TransactionRunner,
    orchestrator: ConcurrencyOrchestrator,
}

impl BspTestSuite {
    pub fn new(topology: Arc<Topology>, platform: Platform, concurrency: ConcurrencyConfig) -> Self {
        let runner = TransactionRunner::new(platform.tool.clone());
        let orchestrator = ConcurrencyOrchestrator::new(runner.clone(), concurrency.max_workers);
        Self {
            topology,
            platform,
            runner,
            orchestrator,
        }
    }

    /// Suite against the real kernel, as described by `config`.
    pub fn from_config(config: &BspConfig) -> Self {
        Self::new(
            Arc::new(config.topology.clone()),
            Platform::from_config(config),
            config.concurrency.clone(),
        )
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Run one scenario. Never panics on scenario failure; failures land in the report.
    pub async fn run(&self, scenario: Scenario) -> ScenarioReport {
        let started = Instant::now();
        let outcome = self
            .execute(scenario)
            .instrument(info_span!("scenario", %scenario))
            .await
            .unwrap_or_else(|err| Outcome::from_error(&err));
        let report = ScenarioReport::new(scenario, outcome, started.elapsed());

        match &report.outcome {
            Outcome::Passed => info!(%scenario, "Scenario passed"),
            Outcome::Skipped { reason } => info!(%scenario, %reason, "Scenario skipped"),
            Outcome::Failed { failures } => {
                error!(%scenario, failures = failures.len(), "Scenario failed")
            }
        }
        report
    }

    /// Run `scenarios` in order.
    pub async fn run_many(&self, scenarios: &[Scenario]) -> SuiteReport {
        let mut suite = SuiteReport::default();
        for scenario in scenarios {
            suite.push(self.run(*scenario).await);
        }
        suite
    }

    /// Run every scenario in default order.
    pub async fn run_all(&self) -> SuiteReport {
        self.run_many(&Scenario::ALL).await
    }

    async fn execute(&self, scenario: Scenario) -> Result<Outcome> {
        self.platform.kmods.load().await?;
        match scenario {
            Scenario::CdevIsCreated => self.cdev_is_created().await,
            Scenario::AdapterCreatesBusses => self.adapter_creates_busses().await,
            Scenario::AdapterDevicesExist => self.adapter_devices_exist().await,
            Scenario::BusWithDevicesCanBeUnloaded => self.bus_with_devices_can_be_unloaded().await,
            Scenario::Transactions => self.transactions().await,
            Scenario::SimultaneousTransactions => self.simultaneous_transactions().await,
        }
    }

    fn adapters(&self) -> impl Iterator<Item = (&FpgaSpec, &AdapterSpec)> {
        self.topology
            .fpgas
            .iter()
            .flat_map(|fpga| fpga.i2c_adapters.iter().map(move |adapter| (fpga, adapter)))
    }

    async fn cdev_is_created(&self) -> Result<Outcome> {
        if self.topology.fpgas.is_empty() {
            return Ok(Outcome::skipped("topology declares no FPGAs"));
        }
        let mut failures = Vec::new();
        for fpga in &self.topology.fpgas {
            let path = self.platform.cdev.cdev_path(fpga)?;
            if tokio::fs::try_exists(&path).await? {
                debug!(fpga = %fpga.name, path = %path.display(), "Character device present");
            } else {
                failures.push(BspError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!(
                        "character device {} for FPGA {} does not exist",
                        path.display(),
                        fpga.name
                    ),
                )));
            }
        }
        BspError::aggregate(failures)?;
        Ok(Outcome::Passed)
    }

    async fn adapter_creates_busses(&self) -> Result<Outcome> {
        let mut failures = Vec::new();
        let mut ran = 0;
        for (fpga, adapter) in self.adapters() {
            ran += 1;
            let result = with_live_adapter(
                self.platform.provisioner.as_ref(),
                fpga,
                adapter,
                |live| async move {
                    if live.distinct_names() != live.busses.len() {
                        return Err(BspError::provision(
                            adapter.aux_device.to_string(),
                            format!("bus names are not unique: {:?}", live.busses),
                        ));
                    }
                    Ok(())
                },
            )
            .await;
            record(&mut failures, result);
        }
        if ran == 0 {
            return Ok(Outcome::skipped("topology declares no adapters"));
        }
        BspError::aggregate(failures)?;
        Ok(Outcome::Passed)
    }

    async fn adapter_devices_exist(&self) -> Result<Outcome> {
        let mut failures = Vec::new();
        let mut ran = 0;
        for (fpga, adapter) in self.adapters() {
            ran += 1;
            if adapter.aux_device.i2c_info.is_none() {
                failures.push(BspError::Topology(format!(
                    "adapter {} on {} declares no i2c_info",
                    adapter.aux_device, fpga.name
                )));
                continue;
            }
            let result = with_live_adapter(
                self.platform.provisioner.as_ref(),
                fpga,
                adapter,
                |live| async move { self.detect_all(adapter, &live).await },
            )
            .await;
            record(&mut failures, result);
        }
        if ran == 0 {
            return Ok(Outcome::skipped("topology declares no adapters"));
        }
        BspError::aggregate(failures)?;
        Ok(Outcome::Passed)
    }

    /// Adapters of the first FPGA, in reverse declaration order.
    async fn bus_with_devices_can_be_unloaded(&self) -> Result<Outcome> {
        let Some(fpga) = self.topology.fpgas.first() else {
            return Ok(Outcome::skipped("topology declares no FPGAs"));
        };
        if fpga.i2c_adapters.is_empty() {
            return Ok(Outcome::skipped(format!("{} declares no adapters", fpga.name)));
        }

        let mut failures = Vec::new();
        for adapter in fpga.i2c_adapters.iter().rev() {
            if let Err(err) = self.platform.kmods.load().await {
                failures.push(err);
                continue;
            }
            let result = with_live_adapter(
                self.platform.provisioner.as_ref(),
                fpga,
                adapter,
                |live| async move {
                    let mut failures = Vec::new();
                    record(&mut failures, self.detect_all(adapter, &live).await);
                    record(&mut failures, self.bind_all(adapter, &live).await);
                    record(&mut failures, self.platform.kmods.unload().await);
                    BspError::aggregate(failures)
                },
            )
            .await;
            record(&mut failures, result);
        }
        BspError::aggregate(failures)?;
        Ok(Outcome::Passed)
    }

    async fn transactions(&self) -> Result<Outcome> {
        let mut failures = Vec::new();
        let mut ran = 0;
        for (fpga, adapter) in self.adapters().filter(|(_, a)| a.any_test_data()) {
            ran += 1;
            let result = with_live_adapter(
                self.platform.provisioner.as_ref(),
                fpga,
                adapter,
                |live| async move {
                    let mut failures = Vec::new();
                    for device in adapter.i2c_devices.iter().filter(|d| d.has_test_data()) {
                        let bus = live.bus_for_device(device);
                        record(&mut failures, self.runner.run_all(device, bus).await);
                    }
                    BspError::aggregate(failures)
                },
            )
            .await;
            record(&mut failures, result);
        }
        if ran == 0 {
            return Ok(Outcome::skipped("no adapter declares test data"));
        }
        BspError::aggregate(failures)?;
        Ok(Outcome::Passed)
    }

    async fn simultaneous_transactions(&self) -> Result<Outcome> {
        let mut failures = Vec::new();
        let mut ran = 0;
        let candidates = self
            .adapters()
            .filter(|(_, a)| a.tested_devices_by_channel().len() >= 2);
        for (fpga, adapter) in candidates {
            ran += 1;
            let result = with_live_adapter(
                self.platform.provisioner.as_ref(),
                fpga,
                adapter,
                |live| async move { self.orchestrator.run_cross_channel(adapter, &live).await },
            )
            .await;
            match result {
                Ok(CrossChannel::Completed { devices, channels }) => {
                    debug!(aux = %adapter.aux_device, devices, channels, "Cross-channel run passed")
                }
                Ok(CrossChannel::Skipped(reason)) => debug!(%reason, "Cross-channel run skipped"),
                Err(err) => failures.push(err),
            }
        }
        if ran == 0 {
            return Ok(Outcome::skipped(
                "no adapter has test data on two or more channels",
            ));
        }
        BspError::aggregate(failures)?;
        Ok(Outcome::Passed)
    }

    /// Probe every device of `adapter`. Absent devices and bus faults are both failures.
    async fn detect_all(&self, adapter: &AdapterSpec, live: &LiveAdapter) -> Result<()> {
        let mut failures = Vec::new();
        for device in &adapter.i2c_devices {
            let bus = live.bus_for_device(device);
            match self.platform.probe.detect(bus, device.address).await {
                Ok(true) => {}
                Ok(false) => failures.push(BspError::DeviceMissing {
                    bus,
                    address: device.address,
                }),
                Err(err) => failures.push(err),
            }
        }
        BspError::aggregate(failures)
    }

    async fn bind_all(&self, adapter: &AdapterSpec, live: &LiveAdapter) -> Result<()> {
        let mut failures = Vec::new();
        for device in &adapter.i2c_devices {
            let bus = live.bus_for_device(device);
            match self.platform.binder.bind(device, bus).await {
                Ok(true) => {}
                Ok(false) => failures.push(BspError::provision(
                    adapter.aux_device.to_string(),
                    format!(
                        "client {} {} did not appear on bus {bus}",
                        device.device_name, device.address
                    ),
                )),
                Err(err) => failures.push(err),
            }
        }
        BspError::aggregate(failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_names_match_cli_values() {
        use clap::ValueEnum;
        for scenario in Scenario::ALL {
            let value = scenario.to_possible_value().unwrap();
            assert_eq!(value.get_name(), scenario.name());
            assert_eq!(
                serde_json::to_value(scenario).unwrap(),
                serde_json::Value::String(scenario.name().to_string())
            );
        }
    }

    #[tokio::test]
    async fn test_empty_topology_skips_everything() {
        let board = Arc::new(FakeBoard::new());
        let suite = BspTestSuite::new(
            Arc::new(Topology::default()),
            Platform::from_fake(board),
            ConcurrencyConfig::default(),
        );
        let report = suite.run_all().await;
        assert_eq!(report.reports.len(), Scenario::ALL.len());
        assert!(report
            .reports
            .iter()
            .all(|r| matches!(r.outcome, Outcome::Skipped { .. })));
    }
}
