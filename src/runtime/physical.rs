//! Physical device discovery, ranking and selection

use super::traits::{Device, DeviceConfig, DeviceType};
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Environment variable overriding the default device
pub const DEFAULT_DEVICE_ENV: &str = "DENOISE_DEFAULT_DEVICE";

/// PCI bus address of a device
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PciAddress {
    /// PCI domain
    pub domain: u32,
    /// Bus number
    pub bus: u32,
    /// Device number
    pub device: u32,
    /// Function number
    pub function: u32,
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = Error;

    /// Parse `dddd:bb:dd.f` or `bb:dd.f` (hexadecimal)
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::invalid_argument("pci_address", format!("malformed PCI address '{s}'"));
        let hex = |v: &str| u32::from_str_radix(v, 16).map_err(|_| bad());

        let (head, function) = s.rsplit_once('.').ok_or_else(bad)?;
        let parts: Vec<&str> = head.split(':').collect();
        let (domain, bus, device) = match parts.as_slice() {
            [d, b, dev] => (hex(d)?, hex(b)?, hex(dev)?),
            [b, dev] => (0, hex(b)?, hex(dev)?),
            _ => return Err(bad()),
        };
        Ok(Self {
            domain,
            bus,
            device,
            function: hex(function)?,
        })
    }
}

/// A discoverable compute device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalDevice {
    /// Backend that drives the device
    pub device_type: DeviceType,
    /// Desirability, higher is preferred
    pub score: u32,
    /// Human-readable name
    pub name: String,
    /// Device UUID, when the backend reports one
    pub uuid: Option<[u8; 16]>,
    /// PCI address, when the backend reports one
    pub pci_address: Option<PciAddress>,
    /// Index within the backend's own enumeration
    pub backend_index: usize,
}

/// Criterion for picking a physical device
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceSelector {
    /// Highest score, unless `DENOISE_DEFAULT_DEVICE` says otherwise
    Default,
    /// Highest-scoring device of a backend
    Type(DeviceType),
    /// Position in [`enumerate_physical_devices`]
    Index(usize),
    /// Device UUID
    Uuid([u8; 16]),
    /// PCI address
    PciAddress(PciAddress),
}

/// Parse a selector string: a backend name or a device index
pub fn parse_device_selector(s: &str) -> Option<DeviceSelector> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(index) = s.parse::<usize>() {
        return Some(DeviceSelector::Index(index));
    }
    s.parse::<DeviceType>().ok().map(DeviceSelector::Type)
}

/// All supported physical devices, sorted by descending score
///
/// Backends that are not compiled in, lack a driver, or find no supported
/// architecture contribute nothing.
pub fn enumerate_physical_devices() -> Vec<PhysicalDevice> {
    let mut devices = Vec::new();
    #[cfg(feature = "cuda")]
    devices.extend(super::cuda::enumerate());
    #[cfg(feature = "wgpu")]
    devices.extend(super::wgpu::enumerate());
    #[cfg(feature = "cpu")]
    devices.extend(super::cpu::enumerate());
    devices.sort_by(|a, b| b.score.cmp(&a.score));
    devices
}

/// Pick a device from `devices` (already ranked)
pub fn select_from(devices: &[PhysicalDevice], selector: &DeviceSelector) -> Result<PhysicalDevice> {
    let selector = match selector {
        DeviceSelector::Default => std::env::var(DEFAULT_DEVICE_ENV)
            .ok()
            .and_then(|v| parse_device_selector(&v))
            .unwrap_or(DeviceSelector::Default),
        other => other.clone(),
    };
    let found = match &selector {
        DeviceSelector::Default => devices.first(),
        DeviceSelector::Type(t) => devices.iter().find(|d| d.device_type == *t),
        DeviceSelector::Index(i) => devices.get(*i),
        DeviceSelector::Uuid(uuid) => devices.iter().find(|d| d.uuid.as_ref() == Some(uuid)),
        DeviceSelector::PciAddress(pci) => {
            devices.iter().find(|d| d.pci_address.as_ref() == Some(pci))
        }
    };
    found
        .cloned()
        .ok_or_else(|| Error::unsupported_hardware(format!("no physical device matches {selector:?}")))
}

/// Pick a physical device among all discoverable ones
pub fn select_physical_device(selector: &DeviceSelector) -> Result<PhysicalDevice> {
    select_from(&enumerate_physical_devices(), selector)
}

/// Create a device for a physical device
pub fn create_device(physical: &PhysicalDevice, config: DeviceConfig) -> Result<Arc<dyn Device>> {
    if config.verbose >= 1 {
        tracing::info!(
            device = %physical.name,
            backend = %physical.device_type,
            score = physical.score,
            "Creating device"
        );
    }
    match physical.device_type {
        #[cfg(feature = "cpu")]
        DeviceType::Cpu => super::cpu::CpuDevice::create(config),
        #[cfg(feature = "cuda")]
        DeviceType::Cuda => super::cuda::CudaDevice::create(physical.backend_index, config),
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => super::wgpu::WgpuDevice::create(physical.backend_index, config),
        #[allow(unreachable_patterns)]
        other => Err(Error::unsupported_hardware(format!(
            "backend '{other}' is not compiled in"
        ))),
    }
}

/// Select and create a device, configured from the environment
pub fn new_device(selector: &DeviceSelector) -> Result<Arc<dyn Device>> {
    let physical = select_physical_device(selector)?;
    create_device(&physical, DeviceConfig::from_env())
}
