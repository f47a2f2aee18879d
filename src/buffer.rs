// src/buffer.rs - The producer's concrete array type over USM allocations
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::descriptors::{element_size, normalize_type_name};
use crate::runtime::{AllocKind, Device, OffloadRuntime, UsmMemory};
use crate::{HandoffError, Result};

/// Anything that looks like an array to a caller. Only [`UsmNdArray`] can be
/// exported; the trait exists so the view builder can refuse everything else.
pub trait ArrayLike: fmt::Debug {
    fn type_name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug)]
struct ArrayInner {
    memory: Arc<UsmMemory>,
    /// Offset of element `[0, .., 0]` from the allocation base, in elements.
    offset: usize,
    shape: Vec<usize>,
    strides: Vec<isize>,
    dtype: String,
    itemsize: usize,
}

/// Strided n-dimensional array over a [`UsmMemory`] allocation.
///
/// Cloning produces another counted handle to the same array object; the
/// count is what [`crate::lifecycle::pin`] raises. Sub-views are separate
/// array objects sharing the allocation.
#[derive(Debug, Clone)]
pub struct UsmNdArray {
    inner: Arc<ArrayInner>,
}

impl UsmNdArray {
    /// Allocate a zero-initialised C-ordered array.
    pub fn empty(
        runtime: Arc<dyn OffloadRuntime>,
        device: Device,
        shape: &[usize],
        dtype: &str,
        kind: AllocKind,
    ) -> Result<Self> {
        let itemsize = element_size(dtype)?;
        let elements = checked_product(shape)?;
        let bytes = elements.checked_mul(itemsize).ok_or_else(|| {
            HandoffError::InvalidGeometry(format!("{:?} x {} bytes overflows", shape, itemsize))
        })?;
        let memory = Arc::new(UsmMemory::allocate(runtime, device, bytes, kind)?);

        Ok(Self::from_parts(ArrayInner {
            memory,
            offset: 0,
            shape: shape.to_vec(),
            strides: c_strides(shape)?,
            dtype: normalize_type_name(dtype).to_string(),
            itemsize,
        }))
    }

    /// Wrap an existing allocation with explicit geometry.
    ///
    /// `dtype` is recorded as given; it is only checked against the DLPack
    /// type table at export time.
    pub fn from_memory(
        memory: Arc<UsmMemory>,
        dtype: impl Into<String>,
        itemsize: usize,
        shape: &[usize],
        strides: &[isize],
        offset: usize,
    ) -> Result<Self> {
        if itemsize == 0 {
            return Err(HandoffError::InvalidGeometry("itemsize must be positive".to_string()));
        }
        if shape.len() != strides.len() {
            return Err(HandoffError::InvalidGeometry(format!(
                "shape has {} dims but strides has {}",
                shape.len(),
                strides.len()
            )));
        }
        let inner = ArrayInner {
            memory,
            offset,
            shape: shape.to_vec(),
            strides: strides.to_vec(),
            dtype: dtype.into(),
            itemsize,
        };
        check_bounds(&inner)?;
        Ok(Self::from_parts(inner))
    }

    fn from_parts(inner: ArrayInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Address of element `[0, .., 0]`.
    pub fn data_ptr(&self) -> *mut u8 {
        // SAFETY: offset was bounds-checked against the allocation at construction.
        unsafe {
            self.inner
                .memory
                .as_ptr()
                .add(self.inner.offset * self.inner.itemsize)
        }
    }

    /// Start of the backing allocation.
    pub fn base_ptr(&self) -> *mut u8 {
        self.inner.memory.as_ptr()
    }

    pub fn shape(&self) -> &[usize] {
        &self.inner.shape
    }

    /// Strides in elements.
    pub fn strides(&self) -> &[isize] {
        &self.inner.strides
    }

    pub fn ndim(&self) -> usize {
        self.inner.shape.len()
    }

    pub fn dtype(&self) -> &str {
        &self.inner.dtype
    }

    pub fn itemsize(&self) -> usize {
        self.inner.itemsize
    }

    pub fn size(&self) -> usize {
        self.inner.shape.iter().product()
    }

    pub fn nbytes(&self) -> usize {
        self.size() * self.inner.itemsize
    }

    pub fn device(&self) -> Device {
        self.inner.memory.device()
    }

    pub fn alloc_kind(&self) -> AllocKind {
        self.inner.memory.kind()
    }

    pub fn memory(&self) -> &Arc<UsmMemory> {
        &self.inner.memory
    }

    pub fn is_c_contiguous(&self) -> bool {
        let mut expected = 1isize;
        for (&extent, &stride) in self.inner.shape.iter().zip(&self.inner.strides).rev() {
            if extent == 0 {
                return true;
            }
            if extent != 1 && stride != expected {
                return false;
            }
            expected = match isize::try_from(extent).ok().and_then(|e| expected.checked_mul(e)) {
                Some(next) => next,
                None => return false,
            };
        }
        true
    }

    /// Counted handles to this array object, pins included.
    pub(crate) fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// View of rows `start..end` along the leading axis.
    pub fn slice_leading(&self, start: usize, end: usize) -> Result<UsmNdArray> {
        let extent = *self.inner.shape.first().ok_or_else(|| {
            HandoffError::InvalidGeometry("cannot slice a 0-d array".to_string())
        })?;
        if start > end || end > extent {
            return Err(HandoffError::InvalidGeometry(format!(
                "slice {}..{} out of range for leading extent {}",
                start, end, extent
            )));
        }
        let mut shape = self.inner.shape.clone();
        shape[0] = end - start;
        let delta = signed(start)?
            .checked_mul(self.inner.strides[0])
            .ok_or_else(|| overflow("slice offset"))?;
        let offset = self.offset_by(delta)?;
        self.derive(shape, self.inner.strides.clone(), offset)
    }

    /// 0-d view of a single element.
    pub fn element_view(&self, index: &[usize]) -> Result<UsmNdArray> {
        if index.len() != self.ndim() {
            return Err(HandoffError::InvalidGeometry(format!(
                "index has {} components for a {}-d array",
                index.len(),
                self.ndim()
            )));
        }
        let mut delta = 0isize;
        for (axis, (&i, &extent)) in index.iter().zip(&self.inner.shape).enumerate() {
            if i >= extent {
                return Err(HandoffError::InvalidGeometry(format!(
                    "index {} out of range for axis {} of extent {}",
                    i, axis, extent
                )));
            }
            delta = signed(i)?
                .checked_mul(self.inner.strides[axis])
                .and_then(|step| delta.checked_add(step))
                .ok_or_else(|| overflow("element offset"))?;
        }
        let offset = self.offset_by(delta)?;
        self.derive(Vec::new(), Vec::new(), offset)
    }

    /// Reverse the axes without moving data.
    pub fn transpose(&self) -> Result<UsmNdArray> {
        let mut shape = self.inner.shape.clone();
        let mut strides = self.inner.strides.clone();
        shape.reverse();
        strides.reverse();
        self.derive(shape, strides, self.inner.offset)
    }

    /// Fill a C-contiguous array from host bytes.
    pub fn copy_from_host(&self, bytes: &[u8]) -> Result<()> {
        self.require_contiguous(bytes.len())?;
        // SAFETY: the destination range lies within the allocation (contiguous,
        // bounds-checked) and does not overlap a host slice.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data_ptr(), bytes.len());
        }
        Ok(())
    }

    /// Copy a C-contiguous array out to host bytes.
    pub fn copy_to_host(&self) -> Result<Vec<u8>> {
        self.require_contiguous(self.nbytes())?;
        let mut out = vec![0u8; self.nbytes()];
        // SAFETY: same range as in `copy_from_host`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.data_ptr(), out.as_mut_ptr(), out.len());
        }
        Ok(out)
    }

    fn require_contiguous(&self, len: usize) -> Result<()> {
        if !self.is_c_contiguous() {
            return Err(HandoffError::InvalidGeometry(
                "host copies need a C-contiguous array".to_string(),
            ));
        }
        if len != self.nbytes() {
            return Err(HandoffError::InvalidGeometry(format!(
                "expected {} bytes, got {}",
                self.nbytes(),
                len
            )));
        }
        Ok(())
    }

    fn offset_by(&self, delta: isize) -> Result<usize> {
        let offset = signed(self.inner.offset)?
            .checked_add(delta)
            .ok_or_else(|| overflow("view offset"))?;
        usize::try_from(offset).map_err(|_| {
            HandoffError::InvalidGeometry(format!("view starts before allocation ({})", offset))
        })
    }

    fn derive(&self, shape: Vec<usize>, strides: Vec<isize>, offset: usize) -> Result<UsmNdArray> {
        let inner = ArrayInner {
            memory: Arc::clone(&self.inner.memory),
            offset,
            shape,
            strides,
            dtype: self.inner.dtype.clone(),
            itemsize: self.inner.itemsize,
        };
        check_bounds(&inner)?;
        Ok(Self::from_parts(inner))
    }
}

impl ArrayLike for UsmNdArray {
    fn type_name(&self) -> &'static str {
        "UsmNdArray"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Display for UsmNdArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "data={:p} dtype={} ndim={} shape={:?} strides={:?} device={} ({})",
            self.data_ptr(),
            self.dtype(),
            self.ndim(),
            self.shape(),
            self.strides(),
            self.device(),
            self.alloc_kind(),
        )
    }
}

fn c_strides(shape: &[usize]) -> Result<Vec<isize>> {
    let mut strides = vec![0isize; shape.len()];
    let mut acc = 1isize;
    for (stride, &extent) in strides.iter_mut().zip(shape).rev() {
        *stride = acc;
        acc = acc
            .checked_mul(signed(extent.max(1))?)
            .ok_or_else(|| overflow("strides"))?;
    }
    Ok(strides)
}

fn signed(value: usize) -> Result<isize> {
    isize::try_from(value).map_err(|_| overflow("extent"))
}

fn overflow(what: &str) -> HandoffError {
    HandoffError::InvalidGeometry(format!("{} overflows isize", what))
}

fn checked_product(shape: &[usize]) -> Result<usize> {
    shape.iter().try_fold(1usize, |acc, &extent| {
        acc.checked_mul(extent)
            .ok_or_else(|| HandoffError::InvalidGeometry(format!("{:?} overflows", shape)))
    })
}

/// Every reachable element must lie inside the allocation.
fn check_bounds(inner: &ArrayInner) -> Result<()> {
    let capacity = inner.memory.size() / inner.itemsize;
    if inner.shape.iter().any(|&extent| extent == 0) {
        return if inner.offset <= capacity {
            Ok(())
        } else {
            Err(HandoffError::InvalidGeometry(format!(
                "offset {} beyond allocation of {} elements",
                inner.offset, capacity
            )))
        };
    }

    let start = signed(inner.offset)?;
    let (mut low, mut high) = (start, start);
    for (&extent, &stride) in inner.shape.iter().zip(&inner.strides) {
        let span = signed(extent - 1)?
            .checked_mul(stride)
            .ok_or_else(|| overflow("array span"))?;
        if span < 0 {
            low = low.checked_add(span).ok_or_else(|| overflow("array span"))?;
        } else {
            high = high.checked_add(span).ok_or_else(|| overflow("array span"))?;
        }
    }
    if low < 0 || high >= signed(capacity)? {
        return Err(HandoffError::InvalidGeometry(format!(
            "elements {}..={} outside allocation of {} elements",
            low, high, capacity
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::HostRuntime;

    fn runtime() -> Arc<HostRuntime> {
        Arc::new(HostRuntime::new())
    }

    #[test]
    fn test_empty_is_c_ordered() {
        let array = UsmNdArray::empty(runtime(), Device::cpu(0), &[3, 1, 30], "f4", AllocKind::Shared)
            .unwrap();
        assert_eq!(array.shape(), &[3, 1, 30]);
        assert_eq!(array.strides(), &[30, 30, 1]);
        assert_eq!(array.dtype(), "float32");
        assert_eq!(array.nbytes(), 360);
        assert_eq!(array.data_ptr(), array.base_ptr());
        assert!(array.is_c_contiguous());
    }

    #[test]
    fn test_unknown_dtype_refused_at_allocation() {
        let rt = runtime();
        let err = UsmNdArray::empty(rt.clone(), Device::cpu(0), &[4], "bfloat16", AllocKind::Shared)
            .unwrap_err();
        assert!(matches!(err, HandoffError::UnsupportedDataType(_)));
        assert_eq!(rt.stats().allocations, 0);
    }

    #[test]
    fn test_slice_leading_moves_data_pointer() {
        let array =
            UsmNdArray::empty(runtime(), Device::cpu(0), &[4, 5], "float64", AllocKind::Device).unwrap();
        let rows = array.slice_leading(1, 3).unwrap();
        assert_eq!(rows.shape(), &[2, 5]);
        assert_eq!(rows.data_ptr() as usize - array.base_ptr() as usize, 5 * 8);
        assert_eq!(rows.base_ptr(), array.base_ptr());
        assert!(array.slice_leading(3, 5).is_err());
    }

    #[test]
    fn test_transpose_and_contiguity() {
        let array =
            UsmNdArray::empty(runtime(), Device::cpu(0), &[2, 3], "int32", AllocKind::Shared).unwrap();
        let t = array.transpose().unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.strides(), &[1, 3]);
        assert!(!t.is_c_contiguous());
        assert!(t.copy_to_host().is_err());
    }

    #[test]
    fn test_element_view_is_zero_dim() {
        let array =
            UsmNdArray::empty(runtime(), Device::cpu(0), &[2, 3], "int16", AllocKind::Shared).unwrap();
        let scalar = array.element_view(&[1, 2]).unwrap();
        assert_eq!(scalar.ndim(), 0);
        assert_eq!(scalar.size(), 1);
        assert_eq!(scalar.data_ptr() as usize - array.base_ptr() as usize, 5 * 2);
        assert!(array.element_view(&[2, 0]).is_err());
        assert!(array.element_view(&[0]).is_err());
    }

    #[test]
    fn test_host_copies() {
        let array =
            UsmNdArray::empty(runtime(), Device::cpu(0), &[2, 2], "uint8", AllocKind::Shared).unwrap();
        array.copy_from_host(&[1, 2, 3, 4]).unwrap();
        assert_eq!(array.copy_to_host().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(
            array.slice_leading(1, 2).unwrap().copy_to_host().unwrap(),
            vec![3, 4]
        );
        assert!(array.copy_from_host(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_from_memory_checks_geometry() {
        let rt = runtime();
        let memory = Arc::new(UsmMemory::allocate(rt, Device::cpu(0), 64, AllocKind::Shared).unwrap());
        assert!(UsmNdArray::from_memory(memory.clone(), "float32", 4, &[4, 4], &[4, 1], 0).is_ok());
        assert!(UsmNdArray::from_memory(memory.clone(), "float32", 4, &[4, 4], &[4, 1], 1).is_err());
        assert!(UsmNdArray::from_memory(memory.clone(), "float32", 4, &[4], &[4, 1], 0).is_err());
        assert!(UsmNdArray::from_memory(memory.clone(), "float32", 4, &[4], &[-1], 3).is_ok());
        assert!(UsmNdArray::from_memory(memory, "float32", 0, &[], &[], 0).is_err());
    }

    #[test]
    fn test_overflowing_geometry_is_an_error() {
        let rt = runtime();
        let memory = Arc::new(UsmMemory::allocate(rt, Device::cpu(0), 64, AllocKind::Shared).unwrap());
        for (shape, strides, offset) in [
            (vec![3usize], vec![isize::MAX], 0usize),
            (vec![3], vec![isize::MIN], 0),
            (vec![2, 2], vec![isize::MAX / 2 + 1, 1], 0),
            (vec![1], vec![1], usize::MAX),
        ] {
            let result = UsmNdArray::from_memory(memory.clone(), "float32", 4, &shape, &strides, offset);
            assert!(
                matches!(result, Err(HandoffError::InvalidGeometry(_))),
                "{:?} / {:?} / {}",
                shape,
                strides,
                offset
            );
        }

        let array = UsmNdArray::from_memory(memory, "float32", 4, &[2, 2], &[2, 1], 0).unwrap();
        assert!(array.element_view(&[1, 1]).is_ok());
        assert!(array.slice_leading(1, 2).is_ok());
    }

    #[test]
    fn test_memory_outlives_parent_handle() {
        let rt = runtime();
        let array =
            UsmNdArray::empty(rt.clone(), Device::cpu(0), &[8], "int64", AllocKind::Shared).unwrap();
        let tail = array.slice_leading(4, 8).unwrap();
        drop(array);
        assert_eq!(rt.stats().frees, 0);
        drop(tail);
        assert_eq!(rt.stats().frees, 1);
    }

    #[test]
    fn test_display_mentions_device() {
        let array =
            UsmNdArray::empty(runtime(), Device::cpu(0), &[2], "bool", AllocKind::Host).unwrap();
        let text = array.to_string();
        assert!(text.contains("device=cpu:0"));
        assert!(text.contains("USM-host"));
    }
}
