//! Zero-copy handoff of USM device arrays to a foreign consumer through the
//! DLPack `DLManagedTensor` ABI.
//!
//! A producer holds a [`UsmNdArray`]. [`export`] describes it as a
//! [`TensorView`] and wraps that in an [`OwnershipCapsule`] which pins the
//! array. [`give`] hands the capsule's address to a [`Consumer`]; from then on
//! only the capsule's deleter, run by the consumer whenever it likes, unpins
//! the array. The producer can drop its own handle straight after `give`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use usm_dlpack_handoff::*;
//!
//! let runtime = Arc::new(HostRuntime::new());
//! let array = UsmNdArray::empty(runtime, Device::cpu(0), &[3, 1, 30], "float32", AllocKind::Shared)?;
//! let consumer = InProcessConsumer::new();
//! let receipt = give(export(&array)?, &consumer);
//! drop(array);
//! finalize(&consumer);
//! assert!(receipt.is_released());
//! # Ok::<(), HandoffError>(())
//! ```

pub mod buffer;
pub mod capsule;
pub mod config;
pub mod descriptors;
pub mod dlpack;
pub mod ffi;
pub mod handoff;
pub mod lifecycle;
pub mod runtime;
pub mod view;

pub use buffer::{ArrayLike, UsmNdArray};
pub use capsule::{
    export, make_capsule, outstanding_capsules, rejected_releases, release_capsule,
    CapsuleState, OwnershipCapsule,
};
pub use config::HandoffConfig;
pub use descriptors::{map_data_type, map_device_kind};
pub use dlpack::{DLDataType, DLDevice, DLManagedTensor, DLTensor, DeviceKind, TensorSummary};
pub use handoff::{finalize, give, CapsuleReceipt, Consumer, InProcessConsumer, ThreadedConsumer};
pub use lifecycle::{pin, reference_count, unpin, PinToken};
pub use runtime::{AllocKind, Device, DeviceRegistry, DeviceType, HostRuntime, OffloadRuntime};
pub use view::{build_view, TensorView};

#[cfg(feature = "shared-library")]
pub use ffi::SharedLibraryConsumer;

/// Everything that can go wrong before a capsule reaches the consumer.
/// Nothing is reported after `give`.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("unsupported device kind: {0}")]
    UnsupportedDeviceKind(String),

    #[error("unsupported data type: {0}")]
    UnsupportedDataType(String),

    #[error("unsupported buffer kind: {0} (expected a USM ndarray)")]
    UnsupportedBufferKind(&'static str),

    #[error("failed to allocate {bytes} bytes: {reason}")]
    AllocationFailed { bytes: usize, reason: String },

    #[error("invalid array geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to load consumer library: {0}")]
    LibraryLoad(String),
}

pub type Result<T> = std::result::Result<T, HandoffError>;
