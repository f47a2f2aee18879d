// src/runtime/memory.rs - USM allocations and the host-backed runtime
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::device::{Device, DeviceRegistry};
use crate::config::HandoffConfig;
use crate::{HandoffError, Result};

/// Unified shared memory allocation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocKind {
    Shared,
    Device,
    Host,
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocKind::Shared => f.write_str("USM-shared"),
            AllocKind::Device => f.write_str("USM-device"),
            AllocKind::Host => f.write_str("USM-host"),
        }
    }
}

/// The compute-offload runtime as this crate uses it: enumerate devices,
/// allocate on a device, free.
pub trait OffloadRuntime: Send + Sync + fmt::Debug {
    fn registry(&self) -> &DeviceRegistry;

    fn allocate(&self, device: &Device, bytes: usize, kind: AllocKind) -> Result<NonNull<u8>>;

    /// Release an allocation previously returned by [`OffloadRuntime::allocate`].
    ///
    /// # Safety
    /// `ptr` and `bytes` must come from one `allocate` call on this runtime and
    /// must not be freed twice.
    unsafe fn free(&self, ptr: NonNull<u8>, bytes: usize);
}

/// Allocation counters of a runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub allocations: usize,
    pub frees: usize,
    pub live_bytes: usize,
}

impl RuntimeStats {
    pub fn live_allocations(&self) -> usize {
        self.allocations - self.frees
    }
}

/// Runtime whose devices are all backed by host memory.
#[derive(Debug)]
pub struct HostRuntime {
    registry: DeviceRegistry,
    alignment: usize,
    max_allocation_bytes: usize,
    allocations: AtomicUsize,
    frees: AtomicUsize,
    live_bytes: AtomicUsize,
}

impl HostRuntime {
    pub fn new() -> Self {
        Self::with_devices(DeviceRegistry::host(), &HandoffConfig::default())
    }

    pub fn with_devices(registry: DeviceRegistry, config: &HandoffConfig) -> Self {
        Self {
            registry,
            alignment: config.alignment,
            max_allocation_bytes: config.max_allocation_bytes,
            allocations: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            allocations: self.allocations.load(Ordering::Acquire),
            frees: self.frees.load(Ordering::Acquire),
            live_bytes: self.live_bytes.load(Ordering::Acquire),
        }
    }

    fn layout(&self, bytes: usize) -> Result<Layout> {
        Layout::from_size_align(bytes.max(1), self.alignment).map_err(|_| {
            HandoffError::AllocationFailed {
                bytes,
                reason: format!("invalid layout for alignment {}", self.alignment),
            }
        })
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl OffloadRuntime for HostRuntime {
    fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    fn allocate(&self, device: &Device, bytes: usize, kind: AllocKind) -> Result<NonNull<u8>> {
        if !self.registry.contains(device) {
            return Err(HandoffError::AllocationFailed {
                bytes,
                reason: format!("device {} is not provided by this runtime", device),
            });
        }
        if bytes > self.max_allocation_bytes {
            return Err(HandoffError::AllocationFailed {
                bytes,
                reason: format!("exceeds limit of {} bytes", self.max_allocation_bytes),
            });
        }

        let layout = self.layout(bytes)?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| HandoffError::AllocationFailed {
            bytes,
            reason: "host allocator returned null".to_string(),
        })?;

        self.allocations.fetch_add(1, Ordering::AcqRel);
        self.live_bytes.fetch_add(bytes, Ordering::AcqRel);
        log::debug!(
            "Allocated {} bytes of {} memory on {} at {:p}",
            bytes,
            kind,
            device,
            ptr.as_ptr()
        );
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, bytes: usize) {
        match self.layout(bytes) {
            Ok(layout) => {
                dealloc(ptr.as_ptr(), layout);
                self.frees.fetch_add(1, Ordering::AcqRel);
                self.live_bytes.fetch_sub(bytes, Ordering::AcqRel);
                log::debug!("Freed {} bytes at {:p}", bytes, ptr.as_ptr());
            }
            Err(e) => log::error!("Leaking allocation at {:p}: {}", ptr.as_ptr(), e),
        }
    }
}

/// One runtime allocation bound to a device, returned to its runtime on drop.
pub struct UsmMemory {
    ptr: NonNull<u8>,
    bytes: usize,
    device: Device,
    kind: AllocKind,
    runtime: Arc<dyn OffloadRuntime>,
}

impl UsmMemory {
    pub fn allocate(
        runtime: Arc<dyn OffloadRuntime>,
        device: Device,
        bytes: usize,
        kind: AllocKind,
    ) -> Result<Self> {
        let ptr = runtime.allocate(&device, bytes, kind)?;
        Ok(Self {
            ptr,
            bytes,
            device,
            kind,
            runtime,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.bytes
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn kind(&self) -> AllocKind {
        self.kind
    }

    /// The runtime that owns this allocation and enumerates its device.
    pub fn runtime(&self) -> &Arc<dyn OffloadRuntime> {
        &self.runtime
    }
}

impl fmt::Debug for UsmMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsmMemory")
            .field("ptr", &self.ptr)
            .field("bytes", &self.bytes)
            .field("device", &self.device)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for UsmMemory {
    fn drop(&mut self) {
        // SAFETY: ptr/bytes came from `runtime.allocate` and this is the only owner.
        unsafe { self.runtime.free(self.ptr, self.bytes) };
    }
}

// The allocation is plain memory; access is coordinated by its owners.
unsafe impl Send for UsmMemory {}
unsafe impl Sync for UsmMemory {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_aligned_and_counted() {
        let runtime = Arc::new(HostRuntime::new());
        let memory =
            UsmMemory::allocate(runtime.clone(), Device::cpu(0), 360, AllocKind::Shared).unwrap();
        assert_eq!(memory.as_ptr() as usize % crate::config::DEFAULT_ALIGNMENT, 0);
        assert_eq!(memory.size(), 360);
        assert_eq!(runtime.stats().live_allocations(), 1);
        assert_eq!(runtime.stats().live_bytes, 360);

        drop(memory);
        let stats = runtime.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.live_bytes, 0);
    }

    #[test]
    fn test_zero_byte_allocation() {
        let runtime = Arc::new(HostRuntime::new());
        let memory =
            UsmMemory::allocate(runtime.clone(), Device::cpu(0), 0, AllocKind::Device).unwrap();
        assert_eq!(memory.size(), 0);
        drop(memory);
        assert_eq!(runtime.stats().frees, 1);
    }

    #[test]
    fn test_unknown_device_refused() {
        let runtime = Arc::new(HostRuntime::new());
        let err = UsmMemory::allocate(runtime.clone(), Device::gpu(0), 16, AllocKind::Device)
            .unwrap_err();
        assert!(matches!(err, HandoffError::AllocationFailed { bytes: 16, .. }));
        assert_eq!(runtime.stats().allocations, 0);
    }

    #[test]
    fn test_limit_enforced() {
        let config = HandoffConfig {
            max_allocation_bytes: 1024,
            ..Default::default()
        };
        let runtime = Arc::new(HostRuntime::with_devices(DeviceRegistry::host(), &config));
        assert!(UsmMemory::allocate(runtime.clone(), Device::cpu(0), 2048, AllocKind::Host).is_err());
        assert!(UsmMemory::allocate(runtime, Device::cpu(0), 1024, AllocKind::Host).is_ok());
    }
}
