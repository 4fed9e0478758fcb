//! Simulated BSP for running every procedure without a kernel.
//!
//! [`FakeBoard`] plays all collaborator roles at once: kernel modules, aux-device
//! provisioning, bus numbering, presence probing, i2c-tools transactions and client
//! binding. It behaves like the real stack in the ways the engine depends on:
//!
//! - busses only exist while their aux device does, and are numbered from the lowest
//!   free block (so destroy + create hands back the same numbers)
//! - creating an adapter requires the modules to be loaded, and fails if the aux
//!   device is already live
//! - loading the modules creates a character device per known FPGA; unloading removes
//!   them together with every aux device
//! - `dump` renders the same fixed-width grid `i2cdump` prints
//!
//! # Performance Characteristics
//!
//! Transactions complete immediately unless a latency is configured with
//! [`FakeBoard::with_latency`]; the latency is awaited with `tokio::time::sleep`,
//! never `std::thread::sleep`. The board records how many transactions were in flight
//! at once, which is how tests prove concurrency actually happened.
//!
//! # Example
//!
//! ```rust,ignore
//! let board = Arc::new(
//!     FakeBoard::new()
//!         .with_first_bus(10)
//!         .with_chip("iob", &aux, 0, addr, [(0x00, RegisterValue::Byte(0x12))]),
//! );
//! let suite = BspTestSuite::new(topology, Platform::from_fake(board), Default::default());
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

use crate::error::{BspError, Result};
use crate::hardware::capabilities::{
    BusDescriptor, BusProvisioner, CdevPaths, DeviceProbe, I2cDeviceBinder, I2cTool,
    KernelModules, LiveAdapter,
};
use crate::topology::{
    AdapterSpec, AuxDevice, DeviceSpec, FpgaSpec, I2cAddress, Register, RegisterValue, Topology,
};

static BOARD_IDS: AtomicUsize = AtomicUsize::new(0);

type ChipKey = (String, u32, I2cAddress);

/// Bus registered by a live fake adapter.
#[derive(Debug, Clone)]
struct FakeBus {
    adapter: String,
    channel: u32,
    name: String,
}

#[derive(Debug, Default)]
struct FakeState {
    modules_loaded: bool,
    /// Live adapter key -> bus numbers it owns
    adapters: HashMap<String, Vec<u32>>,
    busses: BTreeMap<u32, FakeBus>,
    bound: HashSet<(u32, I2cAddress)>,
    create_calls: usize,
    destroy_calls: usize,
}

/// In-memory stand-in for the FPGA, its kernel drivers and the i2c-tools.
pub struct FakeBoard {
    state: Mutex<FakeState>,
    /// Register contents keyed by (adapter key, channel, address)
    chips: HashMap<ChipKey, BTreeMap<u8, RegisterValue>>,
    faulty_channels: HashSet<(String, u32)>,
    rejected_adapters: HashSet<String>,
    /// FPGAs whose character device appears when modules load
    fpgas: HashSet<String>,
    first_bus: u32,
    latency: Duration,
    cdev_root: PathBuf,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    transactions: AtomicUsize,
}

fn adapter_key(fpga: &str, aux: &AuxDevice) -> String {
    format!("{fpga}/{aux}")
}

impl FakeBoard {
    /// Empty board: no chips, busses numbered from 1, no latency.
    pub fn new() -> Self {
        let id = BOARD_IDS.fetch_add(1, Ordering::Relaxed);
        Self {
            state: Mutex::new(FakeState::default()),
            chips: HashMap::new(),
            faulty_channels: HashSet::new(),
            rejected_adapters: HashSet::new(),
            fpgas: HashSet::new(),
            first_bus: 1,
            latency: Duration::ZERO,
            cdev_root: std::env::temp_dir()
                .join(format!("bsp_i2c-fake-{}-{id}", std::process::id())),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            transactions: AtomicUsize::new(0),
        }
    }

    /// Board whose chips answer with exactly the golden values of `topology`.
    ///
    /// Every declared device is present. Dump expectations fill the register map, and
    /// get expectations that parse as hex bytes are added on top.
    pub fn from_topology(topology: &Topology) -> Self {
        let mut board = Self::new();
        for fpga in &topology.fpgas {
            board = board.with_fpga(&fpga.name);
            for adapter in &fpga.i2c_adapters {
                for device in &adapter.i2c_devices {
                    board = board.with_chip(
                        &fpga.name,
                        &adapter.aux_device,
                        device.channel,
                        device.address,
                        golden_registers(device),
                    );
                }
            }
        }
        board
    }

    /// Lowest bus number handed out to fake adapters.
    pub fn with_first_bus(mut self, first_bus: u32) -> Self {
        self.first_bus = first_bus;
        self
    }

    /// Delay applied to every dump/get transaction.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Directory where character devices appear while modules are loaded.
    pub fn with_cdev_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cdev_root = root.into();
        self
    }

    /// Register an FPGA so its character device appears once modules are loaded.
    pub fn with_fpga(mut self, fpga: &str) -> Self {
        self.fpgas.insert(fpga.to_string());
        self
    }

    /// Place a chip at `address` on `channel` of an adapter, merging register contents.
    pub fn with_chip(
        mut self,
        fpga: &str,
        aux: &AuxDevice,
        channel: u32,
        address: I2cAddress,
        registers: impl IntoIterator<Item = (u8, RegisterValue)>,
    ) -> Self {
        self.fpgas.insert(fpga.to_string());
        self.chips
            .entry((adapter_key(fpga, aux), channel, address))
            .or_default()
            .extend(registers);
        self
    }

    /// Make every bus access on `channel` fail as if the controller were wedged.
    pub fn with_faulty_channel(mut self, fpga: &str, aux: &AuxDevice, channel: u32) -> Self {
        self.faulty_channels.insert((adapter_key(fpga, aux), channel));
        self
    }

    /// Make the kernel reject creation of this adapter.
    pub fn with_rejected_adapter(mut self, fpga: &str, aux: &AuxDevice) -> Self {
        self.rejected_adapters.insert(adapter_key(fpga, aux));
        self
    }

    /// Highest number of transactions observed in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Total dump/get transactions served.
    pub fn transaction_count(&self) -> usize {
        self.transactions.load(Ordering::SeqCst)
    }

    /// Number of adapters currently live.
    pub async fn live_adapters(&self) -> usize {
        self.state.lock().await.adapters.len()
    }

    /// Number of `destroy` calls received, including no-op ones.
    pub async fn destroy_calls(&self) -> usize {
        self.state.lock().await.destroy_calls
    }

    /// Number of `create` calls received, including rejected ones.
    pub async fn create_calls(&self) -> usize {
        self.state.lock().await.create_calls
    }

    pub async fn modules_loaded(&self) -> bool {
        self.state.lock().await.modules_loaded
    }

    /// Whether a client has been bound at `(bus, address)`.
    pub async fn is_bound(&self, bus: u32, address: I2cAddress) -> bool {
        self.state.lock().await.bound.contains(&(bus, address))
    }

    /// Resolve a bus number to its chip key, failing like the tools do for bad busses.
    async fn resolve(&self, bus: u32) -> Option<(String, u32)> {
        let state = self.state.lock().await;
        state
            .busses
            .get(&bus)
            .map(|b| (b.adapter.clone(), b.channel))
    }

    fn chip(&self, adapter: &str, channel: u32, address: I2cAddress) -> Option<&BTreeMap<u8, RegisterValue>> {
        self.chips.get(&(adapter.to_string(), channel, address))
    }

    async fn transaction<T>(&self, work: impl FnOnce() -> T) -> T {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.transactions.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        let result = work();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Bus lookup shared by dump/get: missing bus or wedged channel is a tool error.
    async fn open_bus(&self, program: &str, bus: u32) -> Result<(String, u32)> {
        let (adapter, channel) = self.resolve(bus).await.ok_or_else(|| {
            BspError::tool(
                program,
                format!("Error: Could not open file `/dev/i2c-{bus}': No such file or directory"),
            )
        })?;
        if self.faulty_channels.contains(&(adapter.clone(), channel)) {
            return Err(BspError::tool(program, format!("Error: bus {bus} timed out")));
        }
        Ok((adapter, channel))
    }

    fn cdev_file(&self, fpga: &str) -> PathBuf {
        self.cdev_root.join(fpga)
    }
}

impl Default for FakeBoard {
    fn default() -> Self {
        Self::new()
    }
}

fn golden_registers(device: &DeviceSpec) -> Vec<(u8, RegisterValue)> {
    let Some(data) = &device.test_data else {
        return Vec::new();
    };
    let mut registers = Vec::new();
    for case in &data.i2c_dump_data {
        for (offset, value) in (case.start.0..=case.end.0).zip(case.expected.iter()) {
            registers.push((offset, *value));
        }
    }
    for case in &data.i2c_get_data {
        if let Ok(value) = case.expected.parse::<RegisterValue>() {
            registers.push((case.reg.0, value));
        }
    }
    registers
}

/// Render register values the way `i2cdump -r start-end` prints them.
pub fn render_dump_grid(
    start: Register,
    end: Register,
    read: impl Fn(u8) -> RegisterValue,
) -> String {
    let mut out =
        String::from("     0  1  2  3  4  5  6  7  8  9  a  b  c  d  e  f    0123456789abcdef\n");
    let first_row = start.0 & 0xf0;
    for row in (first_row..=end.0).step_by(16) {
        let mut ascii = String::new();
        let _ = write!(out, "{row:02x}:");
        for column in 0..16u8 {
            let offset = row.wrapping_add(column);
            if offset < start.0 || offset > end.0 {
                out.push_str("   ");
                ascii.push(' ');
                continue;
            }
            match read(offset) {
                RegisterValue::Byte(b) => {
                    let _ = write!(out, " {b:02x}");
                    ascii.push(if (0x20..0x7f).contains(&b) { b as char } else { '.' });
                }
                RegisterValue::Unreadable => {
                    out.push_str(" XX");
                    ascii.push('X');
                }
            }
        }
        let _ = writeln!(out, "    {}", ascii.trim_end());
    }
    out
}

#[async_trait]
impl KernelModules for FakeBoard {
    async fn load(&self) -> Result<()> {
        self.state.lock().await.modules_loaded = true;
        tokio::fs::create_dir_all(&self.cdev_root).await?;
        for fpga in &self.fpgas {
            tokio::fs::write(self.cdev_file(fpga), b"").await?;
        }
        debug!(root = %self.cdev_root.display(), "Fake modules loaded");
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.modules_loaded = false;
        state.adapters.clear();
        state.busses.clear();
        state.bound.clear();
        drop(state);
        match tokio::fs::remove_dir_all(&self.cdev_root).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

impl CdevPaths for FakeBoard {
    fn cdev_path(&self, fpga: &FpgaSpec) -> Result<PathBuf> {
        Ok(self.cdev_file(&fpga.name))
    }
}

#[async_trait]
impl BusProvisioner for FakeBoard {
    async fn create(&self, fpga: &FpgaSpec, adapter: &AdapterSpec) -> Result<LiveAdapter> {
        let aux = &adapter.aux_device;
        let key = adapter_key(&fpga.name, aux);
        let mut state = self.state.lock().await;
        state.create_calls += 1;

        if !state.modules_loaded {
            return Err(BspError::provision(aux.to_string(), "driver not loaded"));
        }
        if state.adapters.contains_key(&key) || self.rejected_adapters.contains(&key) {
            return Err(BspError::provision(aux.to_string(), "resource already bound"));
        }
        let channels = aux.num_channels().ok_or_else(|| {
            BspError::provision(aux.to_string(), "aux device declares no i2c_info")
        })?;

        // Lowest free contiguous block at or above first_bus.
        let mut base = self.first_bus;
        while (base..base + channels).any(|b| state.busses.contains_key(&b)) {
            base += 1;
        }

        let mut busses = Vec::with_capacity(channels as usize);
        for channel in 0..channels {
            let bus_num = base + channel;
            let name = format!("{} {} channel {}", fpga.name, aux, channel);
            state.busses.insert(
                bus_num,
                FakeBus {
                    adapter: key.clone(),
                    channel,
                    name: name.clone(),
                },
            );
            busses.push(BusDescriptor { bus_num, name });
        }
        state
            .adapters
            .insert(key, busses.iter().map(|b| b.bus_num).collect());

        LiveAdapter::from_busses(busses)
            .ok_or_else(|| BspError::provision(aux.to_string(), "no busses were created"))
    }

    async fn destroy(&self, fpga: &FpgaSpec, aux: &AuxDevice) -> Result<()> {
        let key = adapter_key(&fpga.name, aux);
        let mut state = self.state.lock().await;
        state.destroy_calls += 1;
        let Some(busses) = state.adapters.remove(&key) else {
            debug!(%aux, "Fake aux device already absent");
            return Ok(());
        };
        for bus in busses {
            state.busses.remove(&bus);
            state.bound.retain(|(b, _)| *b != bus);
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceProbe for FakeBoard {
    async fn detect(&self, bus: u32, address: I2cAddress) -> Result<bool> {
        let fault = |message: String| BspError::DetectionFault {
            bus,
            address,
            message,
        };
        let (adapter, channel) = self
            .resolve(bus)
            .await
            .ok_or_else(|| fault(format!("Could not open file `/dev/i2c-{bus}'")))?;
        if self.faulty_channels.contains(&(adapter.clone(), channel)) {
            return Err(fault("bus timed out".to_string()));
        }
        Ok(self.chip(&adapter, channel, address).is_some())
    }
}

#[async_trait]
impl I2cTool for FakeBoard {
    async fn dump(
        &self,
        bus: u32,
        address: I2cAddress,
        start: Register,
        end: Register,
    ) -> Result<String> {
        let (adapter, channel) = self.open_bus("i2cdump", bus).await?;
        let chip = self.chip(&adapter, channel, address);
        Ok(self
            .transaction(|| {
                render_dump_grid(start, end, |offset| {
                    chip.and_then(|regs| regs.get(&offset).copied())
                        .unwrap_or(RegisterValue::Unreadable)
                })
            })
            .await)
    }

    async fn get(&self, bus: u32, address: I2cAddress, reg: Register) -> Result<String> {
        let (adapter, channel) = self.open_bus("i2cget", bus).await?;
        let chip = self.chip(&adapter, channel, address);
        let value = self
            .transaction(|| chip.and_then(|regs| regs.get(&reg.0).copied()))
            .await;
        match value {
            Some(RegisterValue::Byte(b)) => Ok(format!("0x{b:02x}\n")),
            _ => Err(BspError::tool("i2cget", "Error: Read failed")),
        }
    }
}

#[async_trait]
impl I2cDeviceBinder for FakeBoard {
    async fn bind(&self, device: &DeviceSpec, bus: u32) -> Result<bool> {
        let Some((adapter, channel)) = self.resolve(bus).await else {
            return Err(BspError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("/sys/bus/i2c/devices/i2c-{bus}/new_device"),
            )));
        };
        let present = self.chip(&adapter, channel, device.address).is_some();
        if present {
            self.state.lock().await.bound.insert((bus, device.address));
        }
        Ok(present)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::parser::parse_dump_output;

    fn aux() -> AuxDevice {
        AuxDevice {
            name: "i2c_master".into(),
            id: 1,
            i2c_info: Some(crate::topology::I2cInfo { num_channels: 2 }),
        }
    }

    fn fpga() -> FpgaSpec {
        FpgaSpec {
            name: "iob".into(),
            vendor_id: "1d9b".into(),
            device_id: "0011".into(),
            sub_system_vendor_id: "10ee".into(),
            sub_system_device_id: "0007".into(),
            i2c_adapters: vec![AdapterSpec {
                aux_device: aux(),
                i2c_devices: Vec::new(),
            }],
        }
    }

    fn addr(v: u8) -> I2cAddress {
        I2cAddress::new(v).unwrap()
    }

    #[test]
    fn test_rendered_grid_parses_back() {
        let grid = render_dump_grid(Register(0x0e), Register(0x11), |o| RegisterValue::Byte(o));
        assert!(grid.contains("00:"));
        assert!(grid.contains("10:"));
        let values: Vec<RegisterValue> = (0x0e..=0x11).map(RegisterValue::Byte).collect();
        assert_eq!(parse_dump_output(&grid), values);
    }

    #[test]
    fn test_rendered_grid_full_page() {
        let grid = render_dump_grid(Register(0x00), Register(0xff), |_| RegisterValue::Unreadable);
        assert_eq!(parse_dump_output(&grid).len(), 256);
    }

    #[tokio::test]
    async fn test_create_requires_modules() {
        let board = FakeBoard::new();
        let fpga = fpga();
        let err = board.create(&fpga, &fpga.i2c_adapters[0]).await.unwrap_err();
        assert!(err.to_string().contains("driver not loaded"));
    }

    #[tokio::test]
    async fn test_numbering_reuses_lowest_free_block() {
        let board = FakeBoard::new().with_first_bus(10);
        let fpga = fpga();
        board.load().await.unwrap();

        let live = board.create(&fpga, &fpga.i2c_adapters[0]).await.unwrap();
        assert_eq!(live.base_bus_num, 10);
        assert!(board.create(&fpga, &fpga.i2c_adapters[0]).await.is_err());

        board.destroy(&fpga, &aux()).await.unwrap();
        let again = board.create(&fpga, &fpga.i2c_adapters[0]).await.unwrap();
        assert_eq!(again.base_bus_num, 10);
        board.unload().await.unwrap();
    }

    #[tokio::test]
    async fn test_transactions_follow_chip_contents() {
        let board = FakeBoard::new()
            .with_first_bus(10)
            .with_chip("iob", &aux(), 1, addr(0x50), [(0x00, RegisterValue::Byte(0x34))]);
        let fpga = fpga();
        board.load().await.unwrap();
        board.create(&fpga, &fpga.i2c_adapters[0]).await.unwrap();

        assert!(board.detect(11, addr(0x50)).await.unwrap());
        assert!(!board.detect(10, addr(0x50)).await.unwrap());
        assert!(board.detect(42, addr(0x50)).await.is_err());

        assert_eq!(board.get(11, addr(0x50), Register(0)).await.unwrap().trim(), "0x34");
        assert!(board.get(11, addr(0x50), Register(1)).await.is_err());
        assert_eq!(board.transaction_count(), 2);
        board.unload().await.unwrap();
    }
}
