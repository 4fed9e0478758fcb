//! Cross-channel fan-out of transaction units.
//!
//! Every device with test data becomes one task on the runtime's worker pool. Each
//! task splits into a dump unit and a get unit, and every unit holds one permit of a
//! semaphore sized `max_workers` while it talks to the bus, so at most `max_workers`
//! units are in flight across the whole adapter. Tasks never share mutable state; each
//! one returns its own verdict through the join barrier, which waits for all of them
//! before anything is reported.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

use crate::error::{BspError, Result};
use crate::hardware::capabilities::LiveAdapter;
use crate::topology::AdapterSpec;
use crate::verify::TransactionRunner;

/// What a cross-channel run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrossChannel {
    /// Every unit ran and passed.
    Completed { devices: usize, channels: usize },
    /// Fewer than two channels carry devices with test data.
    Skipped(String),
}

/// Bounded concurrent executor for [`TransactionRunner`] units.
#[derive(Clone)]
pub struct ConcurrencyOrchestrator {
    runner: TransactionRunner,
    max_workers: usize,
}

impl ConcurrencyOrchestrator {
    pub fn new(runner: TransactionRunner, max_workers: usize) -> Self {
        Self {
            runner,
            max_workers: max_workers.max(1),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run every tested device of `adapter` concurrently on its bus in `live`.
    ///
    /// All units are joined even after one fails or panics. Failures come back in
    /// device declaration order, so the same hardware state always yields the same
    /// report.
    pub async fn run_cross_channel(
        &self,
        adapter: &AdapterSpec,
        live: &LiveAdapter,
    ) -> Result<CrossChannel> {
        let channels = adapter.tested_devices_by_channel().len();
        if channels < 2 {
            return Ok(CrossChannel::Skipped(format!(
                "{} has test data on {channels} channel(s); cross-channel run needs at least 2",
                adapter.aux_device
            )));
        }

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();
        let mut devices = 0;

        for (index, device) in adapter
            .i2c_devices
            .iter()
            .filter(|d| d.has_test_data())
            .enumerate()
        {
            let runner = self.runner.clone();
            let device = device.clone();
            let bus = live.bus_for_device(&device);
            let semaphore = Arc::clone(&semaphore);
            devices += 1;

            tasks.spawn(
                async move {
                    debug!(bus, address = %device.address, "Unit started");
                    let result = AssertUnwindSafe(runner.run_all_bounded(&device, bus, semaphore))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            Err(BspError::Task(format!(
                                "unit for {} on bus {bus} panicked",
                                device.address
                            )))
                        });
                    (index, result)
                }
                .in_current_span(),
            );
        }

        let mut failures: Vec<(usize, BspError)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((index, Err(err))) => failures.push((index, err)),
                Err(e) => {
                    warn!(error = %e, "Unit could not be joined");
                    failures.push((usize::MAX, BspError::Task(e.to_string())));
                }
            }
        }
        failures.sort_by_key(|(index, _)| *index);

        info!(
            aux = %adapter.aux_device,
            devices,
            channels,
            failed = failures.len(),
            "Cross-channel run joined"
        );
        BspError::aggregate(failures.into_iter().map(|(_, err)| err).collect())?;
        Ok(CrossChannel::Completed { devices, channels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::capabilities::{BusDescriptor, I2cTool};
    use crate::topology::{I2cAddress, Register};
    use async_trait::async_trait;

    /// Tool whose dumps match golden data except on one bus.
    struct BadBus(u32);

    #[async_trait]
    impl I2cTool for BadBus {
        async fn dump(&self, bus: u32, _: I2cAddress, _: Register, _: Register) -> Result<String> {
            tokio::task::yield_now().await;
            Ok(if bus == self.0 {
                "00: ff ff".to_string()
            } else {
                "00: 00 01".to_string()
            })
        }

        async fn get(&self, bus: u32, _: I2cAddress, _: Register) -> Result<String> {
            if bus == self.0 {
                panic!("bus {bus} exploded");
            }
            Ok("0x00".to_string())
        }
    }

    const ADAPTER: &str = r#"
        aux_device = { name = "i2c_master", i2c_info = { num_channels = 3 } }

        [[i2c_devices]]
        address = "0x50"
        channel = 0
        [i2c_devices.test_data]
        i2c_dump_data = [{ start = "0x00", end = "0x01", expected = ["0x00", "0x01"] }]

        [[i2c_devices]]
        address = "0x51"
        channel = 1
        [i2c_devices.test_data]
        i2c_dump_data = [{ start = "0x00", end = "0x01", expected = ["0x00", "0x01"] }]

        [[i2c_devices]]
        address = "0x52"
        channel = 2
        [i2c_devices.test_data]
        i2c_get_data = [{ reg = "0x00", expected = "0x00" }]
    "#;

    fn live() -> LiveAdapter {
        LiveAdapter::from_busses(
            (0..3)
                .map(|c| BusDescriptor {
                    bus_num: 10 + c,
                    name: format!("ch{c}"),
                })
                .collect(),
        )
        .unwrap()
    }

    fn orchestrator(bad_bus: u32) -> ConcurrencyOrchestrator {
        ConcurrencyOrchestrator::new(TransactionRunner::new(Arc::new(BadBus(bad_bus))), 4)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_all_units_pass() {
        let adapter: AdapterSpec = toml::from_str(ADAPTER).unwrap();
        let outcome = orchestrator(99).run_cross_channel(&adapter, &live()).await.unwrap();
        assert_eq!(
            outcome,
            CrossChannel::Completed {
                devices: 3,
                channels: 3
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_is_reported_and_siblings_complete() {
        let adapter: AdapterSpec = toml::from_str(ADAPTER).unwrap();
        let err = orchestrator(11).run_cross_channel(&adapter, &live()).await.unwrap_err();
        let failures = err.failures();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].to_string().contains("on bus 11"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_panicking_unit_becomes_failure() {
        let adapter: AdapterSpec = toml::from_str(ADAPTER).unwrap();
        let err = orchestrator(12).run_cross_channel(&adapter, &live()).await.unwrap_err();
        assert!(matches!(err, BspError::Task(_)));
    }

    #[tokio::test]
    async fn test_single_channel_is_skipped() {
        let adapter: AdapterSpec = toml::from_str(
            r#"
            aux_device = { name = "i2c_master", i2c_info = { num_channels = 1 } }
            [[i2c_devices]]
            address = "0x50"
            channel = 0
            [i2c_devices.test_data]
            i2c_get_data = [{ reg = "0x00", expected = "0x00" }]
            "#,
        )
        .unwrap();
        let outcome = orchestrator(99).run_cross_channel(&adapter, &live()).await.unwrap();
        assert!(matches!(outcome, CrossChannel::Skipped(_)));
    }
}
