// src/runtime/device.rs - Device identity as seen by the offload runtime
use std::fmt;
use std::str::FromStr;

use crate::descriptors::map_device_kind;
use crate::dlpack::DLDevice;
use crate::{HandoffError, Result};

/// The runtime's own device classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Accelerator,
    /// Host-only emulation device
    Host,
    Custom,
}

impl DeviceType {
    /// Backend-less filter prefix, e.g. `cpu` in `cpu:0`.
    pub fn filter_name(&self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Gpu => "gpu",
            DeviceType::Accelerator => "accelerator",
            DeviceType::Host => "host",
            DeviceType::Custom => "custom",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.filter_name())
    }
}

impl FromStr for DeviceType {
    type Err = HandoffError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(DeviceType::Cpu),
            "gpu" => Ok(DeviceType::Gpu),
            "accelerator" => Ok(DeviceType::Accelerator),
            "host" => Ok(DeviceType::Host),
            "custom" => Ok(DeviceType::Custom),
            other => Err(HandoffError::InvalidConfig(format!(
                "unknown device type '{}'",
                other
            ))),
        }
    }
}

/// A root device: its type plus its position among root devices of that type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    device_type: DeviceType,
    ordinal: u32,
}

impl Device {
    pub const fn new(device_type: DeviceType, ordinal: u32) -> Self {
        Self {
            device_type,
            ordinal,
        }
    }

    pub const fn cpu(ordinal: u32) -> Self {
        Self::new(DeviceType::Cpu, ordinal)
    }

    pub const fn gpu(ordinal: u32) -> Self {
        Self::new(DeviceType::Gpu, ordinal)
    }

    pub const fn accelerator(ordinal: u32) -> Self {
        Self::new(DeviceType::Accelerator, ordinal)
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Filter string without backend, e.g. `gpu:1`.
    pub fn filter_string(&self) -> String {
        format!("{}:{}", self.device_type.filter_name(), self.ordinal)
    }

    /// Parse `type:ordinal`, ignoring a leading backend component such as `level_zero:gpu:0`.
    pub fn from_filter_string(filter: &str) -> Result<Self> {
        let parts: Vec<&str> = filter.split(':').collect();
        let (ty, ordinal) = match parts.as_slice() {
            [ty, ordinal] | [_, ty, ordinal] => (*ty, *ordinal),
            _ => {
                return Err(HandoffError::InvalidConfig(format!(
                    "malformed device filter '{}'",
                    filter
                )))
            }
        };
        let ordinal = ordinal.parse::<u32>().map_err(|_| {
            HandoffError::InvalidConfig(format!("bad device ordinal in '{}'", filter))
        })?;
        Ok(Device::new(ty.parse()?, ordinal))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filter_string())
    }
}

/// The root devices a runtime exposes, in enumeration order.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    root_devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new(root_devices: Vec<Device>) -> Self {
        Self { root_devices }
    }

    /// A registry with a single CPU device, what a host-only runtime exposes.
    pub fn host() -> Self {
        Self::new(vec![Device::cpu(0)])
    }

    pub fn devices(&self) -> &[Device] {
        &self.root_devices
    }

    pub fn contains(&self, device: &Device) -> bool {
        self.root_devices.contains(device)
    }

    /// Position of `device` among registered devices of the same type.
    pub fn dlpack_index(&self, device: &Device) -> Option<i32> {
        self.root_devices
            .iter()
            .filter(|d| d.device_type == device.device_type)
            .position(|d| d == device)
            .map(|idx| idx as i32)
    }

    /// Descriptor for a registered device; the index is recomputed from enumeration order.
    pub fn descriptor(&self, device: &Device) -> Result<DLDevice> {
        let kind = map_device_kind(device.device_type)?;
        let index = self.dlpack_index(device).ok_or_else(|| {
            HandoffError::InvalidConfig(format!("device {} is not registered", device))
        })?;
        Ok(DLDevice::new(kind, index))
    }

    /// Resolve a descriptor received over the ABI back to a registered device.
    pub fn device_from_descriptor(&self, descriptor: &DLDevice) -> Result<Device> {
        let kind = descriptor.kind().ok_or_else(|| {
            HandoffError::UnsupportedDeviceKind(format!("raw kind {}", descriptor.device_type))
        })?;
        let device_type = crate::descriptors::device_type_of(kind);
        if descriptor.device_id < 0 {
            return Err(HandoffError::InvalidConfig(format!(
                "negative device index {}",
                descriptor.device_id
            )));
        }
        self.root_devices
            .iter()
            .filter(|d| d.device_type == device_type)
            .nth(descriptor.device_id as usize)
            .copied()
            .ok_or_else(|| {
                HandoffError::InvalidConfig(format!(
                    "no {} device at index {}",
                    device_type, descriptor.device_id
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlpack::DeviceKind;

    #[test]
    fn test_filter_string_round_trip() {
        let device = Device::gpu(1);
        assert_eq!(device.filter_string(), "gpu:1");
        assert_eq!(Device::from_filter_string("gpu:1").unwrap(), device);
        assert_eq!(
            Device::from_filter_string("level_zero:gpu:1").unwrap(),
            device
        );
        assert!(Device::from_filter_string("gpu").is_err());
        assert!(Device::from_filter_string("gpu:x").is_err());
        assert!(Device::from_filter_string("fpga:0").is_err());
    }

    #[test]
    fn test_index_counts_within_type() {
        let registry = DeviceRegistry::new(vec![
            Device::cpu(0),
            Device::gpu(0),
            Device::gpu(1),
            Device::accelerator(0),
        ]);
        assert_eq!(registry.dlpack_index(&Device::gpu(1)), Some(1));
        assert_eq!(registry.dlpack_index(&Device::accelerator(0)), Some(0));
        assert_eq!(registry.dlpack_index(&Device::cpu(3)), None);

        let desc = registry.descriptor(&Device::gpu(1)).unwrap();
        assert_eq!(desc, DLDevice::new(DeviceKind::OneApiGpu, 1));
        assert_eq!(registry.device_from_descriptor(&desc).unwrap(), Device::gpu(1));
    }

    #[test]
    fn test_descriptor_rejects_unknown() {
        let registry = DeviceRegistry::host();
        let bogus = DLDevice {
            device_type: 2,
            device_id: 0,
        };
        assert!(matches!(
            registry.device_from_descriptor(&bogus),
            Err(HandoffError::UnsupportedDeviceKind(_))
        ));
        let missing = DLDevice::new(DeviceKind::OneApiGpu, 0);
        assert!(registry.device_from_descriptor(&missing).is_err());
    }
}
