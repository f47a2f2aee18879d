// src/view.rs - Tensor view builder
use std::ffi::c_void;
use std::fmt;

use crate::buffer::{ArrayLike, UsmNdArray};
use crate::descriptors::map_data_type;
use crate::dlpack::{DLDataType, DLDevice, DLTensor};
use crate::{HandoffError, Result};

/// Description of an array without its data: pointer, device, dtype and
/// geometry. Owns the shape and stride storage the ABI record points into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorView {
    data: usize,
    device: DLDevice,
    dtype: DLDataType,
    /// `None` for 0-d tensors.
    shape: Option<Box<[i64]>>,
    strides: Option<Box<[i64]>>,
    byte_offset: u64,
}

impl TensorView {
    pub fn data(&self) -> *mut c_void {
        self.data as *mut c_void
    }

    pub fn device(&self) -> DLDevice {
        self.device
    }

    pub fn dtype(&self) -> DLDataType {
        self.dtype
    }

    pub fn rank(&self) -> usize {
        self.shape.as_ref().map_or(0, |s| s.len())
    }

    pub fn shape(&self) -> Option<&[i64]> {
        self.shape.as_deref()
    }

    pub fn strides(&self) -> Option<&[i64]> {
        self.strides.as_deref()
    }

    pub fn byte_offset(&self) -> u64 {
        self.byte_offset
    }

    /// ABI record pointing into this view's shape/stride storage; valid while `self` is.
    pub(crate) fn to_dl_tensor(&mut self) -> DLTensor {
        DLTensor {
            data: self.data(),
            device: self.device,
            ndim: self.rank() as i32,
            dtype: self.dtype,
            shape: dims_ptr(&mut self.shape),
            strides: dims_ptr(&mut self.strides),
            byte_offset: self.byte_offset,
        }
    }
}

fn dims_ptr(dims: &mut Option<Box<[i64]>>) -> *mut i64 {
    dims.as_mut()
        .map_or(std::ptr::null_mut(), |d| d.as_mut_ptr())
}

impl fmt::Display for TensorView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TensorView {{ data: {:#x}, device: ({}, {}), rank: {}, dtype: {:?}, shape: {:?}, strides: {:?}, byte_offset: {} }}",
            self.data,
            self.device.device_type,
            self.device.device_id,
            self.rank(),
            self.dtype.as_triple(),
            self.shape(),
            self.strides(),
            self.byte_offset,
        )
    }
}

/// Describe `array` for export. Only [`UsmNdArray`] is accepted.
pub fn build_view(array: &dyn ArrayLike) -> Result<TensorView> {
    let array = downcast_array(array)?;

    // The index is the device's position in its runtime's enumeration.
    let device = array
        .memory()
        .runtime()
        .registry()
        .descriptor(&array.device())?;
    let dtype = map_data_type(array.dtype())?;

    let (shape, strides) = if array.ndim() == 0 {
        (None, None)
    } else {
        let shape: Box<[i64]> = array.shape().iter().map(|&d| d as i64).collect();
        let strides: Box<[i64]> = array.strides().iter().map(|&s| s as i64).collect();
        (Some(shape), Some(strides))
    };

    let byte_offset = (array.data_ptr() as usize - array.base_ptr() as usize) as u64;

    let view = TensorView {
        data: array.base_ptr() as usize,
        device,
        dtype,
        shape,
        strides,
        byte_offset,
    };
    log::trace!("Built view: {}", view);
    Ok(view)
}

pub(crate) fn downcast_array(array: &dyn ArrayLike) -> Result<&UsmNdArray> {
    array
        .as_any()
        .downcast_ref::<UsmNdArray>()
        .ok_or_else(|| HandoffError::UnsupportedBufferKind(array.type_name()))
}
