//! Kernel-facing collaborators
//!
//! Capability traits plus their real implementations (sysfs, i2c-tools, modprobe,
//! aux-device commands) and the in-memory fake board used by tests and `--simulate`.

pub mod auxdev;
pub mod capabilities;
pub mod command;
pub mod mock;
pub mod modules;
pub mod provisioner;
pub mod sysfs;
pub mod tools;

pub use capabilities::{
    AuxDeviceControl, BusDescriptor, BusProvisioner, CdevPaths, DeviceProbe, I2cDeviceBinder,
    I2cTool, KernelModules, LiveAdapter,
};
pub use mock::FakeBoard;
pub use provisioner::KernelBusProvisioner;
pub use tools::I2cTools;
