// src/runtime/mod.rs - Compute-offload runtime capability
//! The producer only needs three things from its offload runtime: the devices
//! it enumerates, "allocate on device D", and "free". [`HostRuntime`] provides
//! them over host memory; other runtimes plug in through [`OffloadRuntime`].

pub mod device;
pub mod memory;

pub use device::{Device, DeviceRegistry, DeviceType};
pub use memory::{AllocKind, HostRuntime, OffloadRuntime, RuntimeStats, UsmMemory};
