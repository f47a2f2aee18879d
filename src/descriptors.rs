// src/descriptors.rs - Device kind and element type mapping tables
//! Pure mappings from the runtime's vocabulary onto DLPack descriptors.

use crate::dlpack::{type_code, DLDataType, DeviceKind};
use crate::runtime::DeviceType;
use crate::{HandoffError, Result};

/// Logical element type name → `(code, bits, lanes)`.
const DATA_TYPE_TABLE: &[(&str, DLDataType)] = &[
    ("bool", DLDataType::new(type_code::UINT, 1, 1)),
    ("int8", DLDataType::new(type_code::INT, 8, 1)),
    ("uint8", DLDataType::new(type_code::UINT, 8, 1)),
    ("int16", DLDataType::new(type_code::INT, 16, 1)),
    ("uint16", DLDataType::new(type_code::UINT, 16, 1)),
    ("int32", DLDataType::new(type_code::INT, 32, 1)),
    ("uint32", DLDataType::new(type_code::UINT, 32, 1)),
    ("int64", DLDataType::new(type_code::INT, 64, 1)),
    ("uint64", DLDataType::new(type_code::UINT, 64, 1)),
    ("float16", DLDataType::new(type_code::FLOAT, 16, 1)),
    ("float32", DLDataType::new(type_code::FLOAT, 32, 1)),
    ("float64", DLDataType::new(type_code::FLOAT, 64, 1)),
    ("complex64", DLDataType::new(type_code::COMPLEX, 64, 1)),
    ("complex128", DLDataType::new(type_code::COMPLEX, 128, 1)),
];

/// Array-protocol short codes accepted as aliases.
const TYPE_ALIASES: &[(&str, &str)] = &[
    ("?", "bool"),
    ("i1", "int8"),
    ("u1", "uint8"),
    ("i2", "int16"),
    ("u2", "uint16"),
    ("i4", "int32"),
    ("u4", "uint32"),
    ("i8", "int64"),
    ("u8", "uint64"),
    ("f2", "float16"),
    ("f4", "float32"),
    ("f8", "float64"),
    ("c8", "complex64"),
    ("c16", "complex128"),
];

/// Canonical name for `name`, resolving short codes. Unknown names pass through.
pub fn normalize_type_name(name: &str) -> &str {
    TYPE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(name)
}

/// Exact-match lookup of a logical element type.
pub fn map_data_type(name: &str) -> Result<DLDataType> {
    let canonical = normalize_type_name(name);
    DATA_TYPE_TABLE
        .iter()
        .find(|(entry, _)| *entry == canonical)
        .map(|(_, dtype)| *dtype)
        .ok_or_else(|| HandoffError::UnsupportedDataType(name.to_string()))
}

/// Bytes per element. `bool` occupies a full byte in memory.
pub fn element_size(name: &str) -> Result<usize> {
    let dtype = map_data_type(name)?;
    Ok(((dtype.bits as usize * dtype.lanes as usize) + 7) / 8)
}

pub fn map_device_kind(device_type: DeviceType) -> Result<DeviceKind> {
    match device_type {
        DeviceType::Cpu => Ok(DeviceKind::OneApiCpu),
        DeviceType::Gpu => Ok(DeviceKind::OneApiGpu),
        DeviceType::Accelerator => Ok(DeviceKind::OneApiAccelerator),
        other => Err(HandoffError::UnsupportedDeviceKind(other.to_string())),
    }
}

/// Inverse of [`map_device_kind`].
pub fn device_type_of(kind: DeviceKind) -> DeviceType {
    match kind {
        DeviceKind::OneApiCpu => DeviceType::Cpu,
        DeviceKind::OneApiGpu => DeviceType::Gpu,
        DeviceKind::OneApiAccelerator => DeviceType::Accelerator,
    }
}
