// src/ffi.rs - C-facing surface: exported diagnostics and the shared-library consumer
use std::ffi::c_void;

use crate::capsule::{is_live, outstanding_capsules, rejected_releases};
use crate::dlpack::DLPACK_VERSION;

// Error codes
pub const USM_DLPACK_SUCCESS: i32 = 0;
pub const USM_DLPACK_ERROR_INVALID_PARAM: i32 = -2;
pub const USM_DLPACK_ERROR_PANIC: i32 = -3;

/// Run `operation` so that a panic becomes an error code instead of
/// unwinding into C.
pub fn safe_ffi_wrapper<F, T>(operation: F) -> Result<T, i32>
where
    F: FnOnce() -> T + std::panic::UnwindSafe,
{
    std::panic::catch_unwind(operation).map_err(|_| USM_DLPACK_ERROR_PANIC)
}

/// DLPack ABI version this library speaks.
#[no_mangle]
pub extern "C" fn usm_dlpack_get_version(major_out: *mut u32, minor_out: *mut u32) -> i32 {
    if major_out.is_null() || minor_out.is_null() {
        return USM_DLPACK_ERROR_INVALID_PARAM;
    }
    unsafe {
        *major_out = DLPACK_VERSION.0;
        *minor_out = DLPACK_VERSION.1;
    }
    USM_DLPACK_SUCCESS
}

/// Capsules built and not yet released.
#[no_mangle]
pub extern "C" fn usm_dlpack_outstanding_capsules() -> usize {
    safe_ffi_wrapper(outstanding_capsules).unwrap_or(0)
}

/// Release calls refused because the address was not a live capsule.
#[no_mangle]
pub extern "C" fn usm_dlpack_rejected_releases() -> usize {
    rejected_releases()
}

/// 1 if `managed` is a capsule awaiting release, 0 if not, negative on error.
#[no_mangle]
pub extern "C" fn usm_dlpack_is_live(managed: *const c_void) -> i32 {
    if managed.is_null() {
        return USM_DLPACK_ERROR_INVALID_PARAM;
    }
    let address = managed as usize;
    match safe_ffi_wrapper(move || is_live(address)) {
        Ok(live) => live as i32,
        Err(code) => code,
    }
}

#[cfg(feature = "shared-library")]
pub use shared::SharedLibraryConsumer;

#[cfg(feature = "shared-library")]
mod shared {
    use std::fmt;
    use std::path::{Path, PathBuf};

    use libloading::Library;

    use crate::config::HandoffConfig;
    use crate::dlpack::DLManagedTensor;
    use crate::handoff::Consumer;
    use crate::{HandoffError, Result};

    type GiveFn = unsafe extern "C" fn(*mut DLManagedTensor);
    type FinalizeFn = unsafe extern "C" fn();

    /// Consumer implemented by a foreign shared library exporting
    /// `void Give(DLManagedTensor*)` and `void Finalize(void)`.
    pub struct SharedLibraryConsumer {
        give_fn: GiveFn,
        finalize_fn: FinalizeFn,
        path: PathBuf,
        // Keeps the code behind the two function pointers mapped.
        _library: Library,
    }

    // The library's entry points are plain C functions with no thread affinity.
    unsafe impl Send for SharedLibraryConsumer {}
    unsafe impl Sync for SharedLibraryConsumer {}

    impl SharedLibraryConsumer {
        /// Load the library named by `config.consumer_library`.
        pub fn open(config: &HandoffConfig) -> Result<Self> {
            let path = config.consumer_library.as_deref().ok_or_else(|| {
                HandoffError::InvalidConfig("no consumer library configured".to_string())
            })?;
            Self::load(path, &config.give_symbol, &config.finalize_symbol)
        }

        pub fn load(path: &Path, give_symbol: &str, finalize_symbol: &str) -> Result<Self> {
            // SAFETY: the library is trusted to export both symbols with the
            // C signatures above. Loading runs its initializers.
            unsafe {
                let library = Library::new(path).map_err(|e| {
                    HandoffError::LibraryLoad(format!("Failed to load library {:?}: {}", path, e))
                })?;

                let give_fn = *library
                    .get::<GiveFn>(give_symbol.as_bytes())
                    .map_err(|e| {
                        HandoffError::LibraryLoad(format!(
                            "Missing entry point '{}': {}",
                            give_symbol, e
                        ))
                    })?;
                let finalize_fn = *library
                    .get::<FinalizeFn>(finalize_symbol.as_bytes())
                    .map_err(|e| {
                        HandoffError::LibraryLoad(format!(
                            "Missing entry point '{}': {}",
                            finalize_symbol, e
                        ))
                    })?;

                log::info!("Loaded consumer library {:?}", path);
                Ok(Self {
                    give_fn,
                    finalize_fn,
                    path: path.to_path_buf(),
                    _library: library,
                })
            }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Consumer for SharedLibraryConsumer {
        fn give(&self, managed: *mut DLManagedTensor) {
            // SAFETY: `managed` is a given capsule; the library now owns it.
            unsafe { (self.give_fn)(managed) }
        }

        fn finalize(&self) {
            unsafe { (self.finalize_fn)() }
        }
    }

    impl fmt::Debug for SharedLibraryConsumer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("SharedLibraryConsumer")
                .field("path", &self.path)
                .finish()
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capsule::export;
    use crate::runtime::{AllocKind, Device, HostRuntime};
    use crate::buffer::UsmNdArray;
    use std::sync::Arc;

    #[test]
    fn test_version_out_params() {
        let (mut major, mut minor) = (0u32, 0u32);
        assert_eq!(usm_dlpack_get_version(&mut major, &mut minor), USM_DLPACK_SUCCESS);
        assert_eq!((major, minor), DLPACK_VERSION);
        assert_eq!(
            usm_dlpack_get_version(std::ptr::null_mut(), &mut minor),
            USM_DLPACK_ERROR_INVALID_PARAM
        );
    }

    #[test]
    fn test_is_live_reports_built_capsule() {
        let rt = Arc::new(HostRuntime::new());
        let array = UsmNdArray::empty(rt, Device::cpu(0), &[2], "uint8", AllocKind::Shared).unwrap();
        let capsule = export(&array).unwrap();
        assert_eq!(usm_dlpack_is_live(capsule.as_ptr() as *const c_void), 1);
        assert!(usm_dlpack_outstanding_capsules() >= 1);
        assert_eq!(usm_dlpack_is_live(std::ptr::null()), USM_DLPACK_ERROR_INVALID_PARAM);
    }

    #[test]
    fn test_wrapper_maps_panic() {
        let result: Result<(), i32> = safe_ffi_wrapper(|| panic!("boom"));
        assert_eq!(result, Err(USM_DLPACK_ERROR_PANIC));
    }
}
