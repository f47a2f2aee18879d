// src/dlpack.rs - DLPack ABI records shared with the consumer
//! `#[repr(C)]` mirrors of the DLPack structures exchanged with the consumer.
//!
//! Field order and sizes follow `dlpack.h`. Nothing in this module owns memory:
//! the shape/stride arrays and the managed tensor itself are owned by the
//! capsule machinery in [`crate::capsule`].

use std::ffi::c_void;
use std::fmt;
use std::os::raw::c_int;

/// (major, minor) of the legacy unversioned `DLManagedTensor` layout.
pub const DLPACK_VERSION: (u32, u32) = (0, 8);

/// oneAPI device kinds. The discriminants are part of the external ABI.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    OneApiGpu = 14,
    OneApiCpu = 15,
    OneApiAccelerator = 16,
}

impl DeviceKind {
    /// Decode a raw `device_type` field; `None` for kinds outside the closed set.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            14 => Some(DeviceKind::OneApiGpu),
            15 => Some(DeviceKind::OneApiCpu),
            16 => Some(DeviceKind::OneApiAccelerator),
            _ => None,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

/// DLPack type codes used by this producer.
pub mod type_code {
    pub const INT: u8 = 0;
    pub const UINT: u8 = 1;
    pub const FLOAT: u8 = 2;
    pub const COMPLEX: u8 = 5;
}

/// Where the tensor data lives: `(device_type, device_id)`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DLDevice {
    pub device_type: i32,
    pub device_id: i32,
}

impl DLDevice {
    pub const fn new(kind: DeviceKind, device_id: i32) -> Self {
        Self {
            device_type: kind as i32,
            device_id,
        }
    }

    pub fn kind(&self) -> Option<DeviceKind> {
        DeviceKind::from_raw(self.device_type)
    }
}

/// Element type: `(code, bits, lanes)`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DLDataType {
    pub code: u8,
    pub bits: u8,
    pub lanes: u16,
}

impl DLDataType {
    #[inline]
    pub const fn new(code: u8, bits: u8, lanes: u16) -> Self {
        Self { code, bits, lanes }
    }

    pub fn as_triple(&self) -> (u8, u8, u16) {
        (self.code, self.bits, self.lanes)
    }
}

/// Plain tensor description without ownership.
#[repr(C)]
#[derive(Debug)]
pub struct DLTensor {
    /// Base address of the allocation; indexing starts at `data + byte_offset`.
    pub data: *mut c_void,
    pub device: DLDevice,
    pub ndim: c_int,
    pub dtype: DLDataType,
    /// `ndim` extents, null when `ndim == 0`.
    pub shape: *mut i64,
    /// `ndim` strides in elements, null when `ndim == 0`.
    pub strides: *mut i64,
    pub byte_offset: u64,
}

impl Default for DLTensor {
    fn default() -> Self {
        Self {
            data: std::ptr::null_mut(),
            device: DLDevice::default(),
            ndim: 0,
            dtype: DLDataType::default(),
            shape: std::ptr::null_mut(),
            strides: std::ptr::null_mut(),
            byte_offset: 0,
        }
    }
}

impl DLTensor {
    /// Borrow the shape array.
    ///
    /// # Safety
    /// `shape` must be null or point to `ndim` readable `i64`s that outlive the borrow.
    pub unsafe fn shape(&self) -> Option<&[i64]> {
        raw_dims(self.shape, self.ndim)
    }

    /// Borrow the stride array.
    ///
    /// # Safety
    /// Same contract as [`DLTensor::shape`].
    pub unsafe fn strides(&self) -> Option<&[i64]> {
        raw_dims(self.strides, self.ndim)
    }
}

unsafe fn raw_dims<'a>(ptr: *mut i64, ndim: c_int) -> Option<&'a [i64]> {
    if ptr.is_null() || ndim <= 0 {
        None
    } else {
        Some(std::slice::from_raw_parts(ptr, ndim as usize))
    }
}

/// Deleter signature: receives the address of the managed tensor it belongs to.
pub type DLManagedTensorDeleter = unsafe extern "C" fn(*mut DLManagedTensor);

/// The unit handed to the consumer.
#[repr(C)]
pub struct DLManagedTensor {
    pub dl_tensor: DLTensor,
    /// Opaque producer context, only interpreted by `deleter`.
    pub manager_ctx: *mut c_void,
    pub deleter: Option<DLManagedTensorDeleter>,
}

impl fmt::Debug for DLManagedTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DLManagedTensor")
            .field("dl_tensor", &self.dl_tensor)
            .field("manager_ctx", &self.manager_ctx)
            .field("has_deleter", &self.deleter.is_some())
            .finish()
    }
}

/// What a consumer observed when it received a tensor, decoded off the ABI
/// record into owned values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSummary {
    pub data: usize,
    pub device: DLDevice,
    pub dtype: DLDataType,
    pub ndim: i32,
    pub shape: Vec<i64>,
    pub strides: Vec<i64>,
    pub byte_offset: u64,
}

impl TensorSummary {
    /// # Safety
    /// The shape/stride pointers of `tensor` must satisfy [`DLTensor::shape`].
    pub unsafe fn from_dl_tensor(tensor: &DLTensor) -> Self {
        Self {
            data: tensor.data as usize,
            device: tensor.device,
            dtype: tensor.dtype,
            ndim: tensor.ndim,
            shape: tensor.shape().map(<[i64]>::to_vec).unwrap_or_default(),
            strides: tensor.strides().map(<[i64]>::to_vec).unwrap_or_default(),
            byte_offset: tensor.byte_offset,
        }
    }
}

impl fmt::Display for TensorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "data={:#x} device=({}, {}) dtype={{code: {}, bits: {}, lanes: {}}} ndim={} shape={:?} strides={:?} byte_offset={}",
            self.data,
            self.device.device_type,
            self.device.device_id,
            self.dtype.code,
            self.dtype.bits,
            self.dtype.lanes,
            self.ndim,
            self.shape,
            self.strides,
            self.byte_offset,
        )
    }
}
