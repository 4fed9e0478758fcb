//! Board topology: FPGAs, their I2C adapters, and the devices behind each channel.
//!
//! The topology is loaded once (see [`crate::config::BspConfig`]) and then shared as an
//! immutable `Arc<Topology>`. Nothing in here touches the kernel.
//!
//! Addresses and registers are written as hex strings in configuration files
//! (`address = "0x50"`), but plain integers are accepted as well.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{BspError, Result};

// =============================================================================
// Scalar types
// =============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Int(u64),
    Text(String),
}

fn parse_hex_u8(text: &str) -> Option<u8> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() || digits.len() > 2 {
        return None;
    }
    u8::from_str_radix(digits, 16).ok()
}

/// A 7-bit I2C device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct I2cAddress(u8);

impl I2cAddress {
    /// Highest valid 7-bit address.
    pub const MAX: u8 = 0x7f;

    /// Create an address, rejecting anything outside the 7-bit range.
    pub fn new(value: u8) -> Result<Self> {
        if value > Self::MAX {
            return Err(BspError::Topology(format!(
                "I2C address 0x{value:02x} exceeds 7-bit range"
            )));
        }
        Ok(Self(value))
    }

    /// Raw address value.
    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for I2cAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

impl FromStr for I2cAddress {
    type Err = BspError;

    fn from_str(s: &str) -> Result<Self> {
        let value = parse_hex_u8(s)
            .ok_or_else(|| BspError::Topology(format!("invalid I2C address '{s}'")))?;
        Self::new(value)
    }
}

impl Serialize for I2cAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for I2cAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let parsed = match RawScalar::deserialize(deserializer)? {
            RawScalar::Int(v) => u8::try_from(v)
                .map_err(|_| BspError::Topology(format!("I2C address {v} out of range")))
                .and_then(I2cAddress::new),
            RawScalar::Text(s) => s.parse(),
        };
        parsed.map_err(serde::de::Error::custom)
    }
}

/// An 8-bit register offset within a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register(pub u8);

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

impl FromStr for Register {
    type Err = BspError;

    fn from_str(s: &str) -> Result<Self> {
        parse_hex_u8(s)
            .map(Register)
            .ok_or_else(|| BspError::Topology(format!("invalid register '{s}'")))
    }
}

impl Serialize for Register {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Register {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let parsed = match RawScalar::deserialize(deserializer)? {
            RawScalar::Int(v) => u8::try_from(v)
                .map(Register)
                .map_err(|_| BspError::Topology(format!("register {v} out of range"))),
            RawScalar::Text(s) => s.parse(),
        };
        parsed.map_err(serde::de::Error::custom)
    }
}

/// One register value as reported by `i2cdump`.
///
/// `Unreadable` is the `XX` placeholder the tool prints when a register read fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterValue {
    Byte(u8),
    Unreadable,
}

impl RegisterValue {
    /// The `i2cdump` placeholder for registers that could not be read.
    pub const PLACEHOLDER: &'static str = "XX";
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::Byte(b) => write!(f, "0x{b:02x}"),
            RegisterValue::Unreadable => f.write_str(Self::PLACEHOLDER),
        }
    }
}

impl From<u8> for RegisterValue {
    fn from(value: u8) -> Self {
        RegisterValue::Byte(value)
    }
}

impl FromStr for RegisterValue {
    type Err = BspError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case(Self::PLACEHOLDER) {
            return Ok(RegisterValue::Unreadable);
        }
        parse_hex_u8(s)
            .map(RegisterValue::Byte)
            .ok_or_else(|| BspError::Topology(format!("invalid register value '{s}'")))
    }
}

impl Serialize for RegisterValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RegisterValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let parsed = match RawScalar::deserialize(deserializer)? {
            RawScalar::Int(v) => u8::try_from(v)
                .map(RegisterValue::Byte)
                .map_err(|_| BspError::Topology(format!("register value {v} out of range"))),
            RawScalar::Text(s) => s.parse(),
        };
        parsed.map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Test vectors
// =============================================================================

/// Ranged read `[start, end]` and the values it must return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpCase {
    pub start: Register,
    pub end: Register,
    pub expected: Vec<RegisterValue>,
}

impl DumpCase {
    /// Range in the form `i2cdump -r` accepts, e.g. `0x00-0x0f`.
    pub fn range(&self) -> String {
        format!("{}-{}", self.start, self.end)
    }

    /// Number of registers covered by the range.
    pub fn len(&self) -> usize {
        usize::from(self.end.0.saturating_sub(self.start.0)) + 1
    }
}

/// Single-register read and the exact text `i2cget` must print.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCase {
    pub reg: Register,
    pub expected: String,
}

/// Golden transactions declared for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestData {
    #[serde(default)]
    pub i2c_dump_data: Vec<DumpCase>,
    #[serde(default)]
    pub i2c_get_data: Vec<GetCase>,
}

// =============================================================================
// Topology
// =============================================================================

/// A device behind one channel of an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub address: I2cAddress,
    pub channel: u32,
    /// Kernel driver name used when instantiating a client for this device.
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub test_data: Option<TestData>,
}

impl DeviceSpec {
    pub fn has_test_data(&self) -> bool {
        self.test_data.is_some()
    }
}

/// Static I2C metadata carried by an auxiliary device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct I2cInfo {
    pub num_channels: u32,
}

/// Kernel auxiliary device that instantiates an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxDevice {
    pub name: String,
    #[serde(default = "default_aux_id")]
    pub id: u32,
    #[serde(default)]
    pub i2c_info: Option<I2cInfo>,
}

fn default_aux_id() -> u32 {
    1
}

impl AuxDevice {
    /// Declared channel count, if the aux device carries I2C metadata.
    pub fn num_channels(&self) -> Option<u32> {
        self.i2c_info.map(|info| info.num_channels)
    }
}

impl fmt::Display for AuxDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.id)
    }
}

/// An I2C adapter exposed through an auxiliary device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub aux_device: AuxDevice,
    #[serde(default)]
    pub i2c_devices: Vec<DeviceSpec>,
}

impl AdapterSpec {
    pub fn any_test_data(&self) -> bool {
        self.i2c_devices.iter().any(DeviceSpec::has_test_data)
    }

    /// Devices that declare test data, grouped by channel in ascending channel order.
    pub fn tested_devices_by_channel(&self) -> BTreeMap<u32, Vec<&DeviceSpec>> {
        let mut grouped: BTreeMap<u32, Vec<&DeviceSpec>> = BTreeMap::new();
        for device in self.i2c_devices.iter().filter(|d| d.has_test_data()) {
            grouped.entry(device.channel).or_default().push(device);
        }
        grouped
    }
}

/// One FPGA and the adapters it exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FpgaSpec {
    pub name: String,
    pub vendor_id: String,
    pub device_id: String,
    pub sub_system_vendor_id: String,
    pub sub_system_device_id: String,
    #[serde(default)]
    pub i2c_adapters: Vec<AdapterSpec>,
}

/// The whole board.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub fpgas: Vec<FpgaSpec>,
}

impl Topology {
    /// Check structural invariants that must hold before anything touches the kernel.
    ///
    /// Two devices on the same channel of one adapter may not share an address: the
    /// orchestrator assumes every concurrent unit targets a distinct `(bus, address)`.
    pub fn validate(&self) -> Result<()> {
        let mut fpga_names = HashSet::new();
        for fpga in &self.fpgas {
            if !fpga_names.insert(fpga.name.as_str()) {
                return Err(BspError::Topology(format!(
                    "duplicate FPGA name '{}'",
                    fpga.name
                )));
            }

            let mut aux_names = HashSet::new();
            for adapter in &fpga.i2c_adapters {
                let aux = &adapter.aux_device;
                if aux.name.is_empty() {
                    return Err(BspError::Topology(format!(
                        "adapter on FPGA '{}' has an empty aux device name",
                        fpga.name
                    )));
                }
                if !aux_names.insert((aux.name.as_str(), aux.id)) {
                    return Err(BspError::Topology(format!(
                        "duplicate aux device {aux} on FPGA '{}'",
                        fpga.name
                    )));
                }
                validate_adapter(adapter)?;
            }
        }
        Ok(())
    }

    /// Total number of adapters across all FPGAs.
    pub fn adapter_count(&self) -> usize {
        self.fpgas.iter().map(|f| f.i2c_adapters.len()).sum()
    }
}

fn validate_adapter(adapter: &AdapterSpec) -> Result<()> {
    let aux = &adapter.aux_device;
    if let Some(channels) = aux.num_channels() {
        if channels == 0 {
            return Err(BspError::Topology(format!(
                "aux device {aux} declares zero I2C channels"
            )));
        }
    }

    let mut seen = HashSet::new();
    for device in &adapter.i2c_devices {
        if let Some(channels) = aux.num_channels() {
            if device.channel >= channels {
                return Err(BspError::Topology(format!(
                    "device {} on aux device {aux} uses channel {} but only {channels} exist",
                    device.address, device.channel
                )));
            }
        }
        if !seen.insert((device.channel, device.address)) {
            return Err(BspError::Topology(format!(
                "duplicate address {} on channel {} of aux device {aux}",
                device.address, device.channel
            )));
        }
        if let Some(data) = &device.test_data {
            for case in &data.i2c_dump_data {
                if case.start > case.end {
                    return Err(BspError::Topology(format!(
                        "dump range {} on {} is reversed",
                        case.range(),
                        device.address
                    )));
                }
                if case.expected.len() != case.len() {
                    return Err(BspError::Topology(format!(
                        "dump range {} on {} covers {} register(s) but {} value(s) are expected",
                        case.range(),
                        device.address,
                        case.len(),
                        case.expected.len()
                    )));
                }
            }
        }
    }
    Ok(())
}
