//! # BSP I2C Validation Library
//!
//! Validates the kernel-level I2C drivers of an FPGA-based board support package. The
//! library models the board's I2C topology (FPGAs → adapters → channels → devices),
//! provisions and tears down the kernel busses behind each adapter, probes every
//! declared device, and verifies register transactions against golden values, both
//! sequentially and concurrently across channels.
//!
//! ## Crate Structure
//!
//! - **`topology`**: Immutable board description (`Topology`, `FpgaSpec`, `AdapterSpec`,
//!   `DeviceSpec`) and its load-time validation.
//! - **`config`**: Figment-based configuration (TOML + `BSP_I2C_` environment) that
//!   carries the topology plus tool paths, kernel paths and worker limits.
//! - **`hardware`**: Capability traits for every kernel-facing concern, their real
//!   implementations, and the `FakeBoard` used for tests and `--simulate`.
//! - **`verify`**: `i2cdump`/`i2cdetect` grid parsing and the `TransactionRunner`.
//! - **`procedures`**: The scenario suite, the scoped-adapter guard and the
//!   cross-channel `ConcurrencyOrchestrator`.
//! - **`error`**: The `BspError` enum shared by every layer.
//! - **`tracing_init`**: Subscriber setup for structured logs.

pub mod config;
pub mod error;
pub mod hardware;
pub mod procedures;
pub mod topology;
pub mod tracing_init;
pub mod verify;

pub use config::BspConfig;
pub use error::{BspError, Result};
pub use procedures::{BspTestSuite, Platform, Scenario};
pub use topology::Topology;
