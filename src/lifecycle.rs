// src/lifecycle.rs - Pin/unpin of exported arrays
//! The array object's reference count is an atomic `Arc` count. A pin is one
//! more counted handle, held by a capsule independently of any handle the
//! producer keeps; storage goes away when the last handle of either kind drops.

use std::fmt;

use crate::buffer::UsmNdArray;

/// One counted reference to an array object, obtained from [`pin`].
pub struct PinToken {
    array: UsmNdArray,
}

impl PinToken {
    pub fn array(&self) -> &UsmNdArray {
        &self.array
    }
}

impl fmt::Debug for PinToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinToken")
            .field("data", &self.array.data_ptr())
            .field("ref_count", &self.array.handle_count())
            .finish()
    }
}

/// Take an extra counted reference on `array`.
pub fn pin(array: &UsmNdArray) -> PinToken {
    let token = PinToken {
        array: array.clone(),
    };
    log::trace!(
        "Pinned array at {:p} (ref_count={})",
        array.data_ptr(),
        array.handle_count()
    );
    token
}

/// Give back the reference taken by [`pin`]. If it was the last one, the
/// array object and, with it, its share of the allocation are dropped here.
pub fn unpin(token: PinToken) {
    let remaining = token.array.handle_count() - 1;
    log::trace!(
        "Unpinning array at {:p} (ref_count -> {})",
        token.array.data_ptr(),
        remaining
    );
    drop(token);
}

/// Current number of counted references to `array`, including `array` itself.
pub fn reference_count(array: &UsmNdArray) -> usize {
    array.handle_count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{AllocKind, Device, HostRuntime};
    use std::sync::Arc;

    #[test]
    fn test_pin_unpin_restores_count() {
        let rt = Arc::new(HostRuntime::new());
        let array = UsmNdArray::empty(rt, Device::cpu(0), &[4], "float32", AllocKind::Shared).unwrap();
        assert_eq!(reference_count(&array), 1);
        let token = pin(&array);
        assert_eq!(reference_count(&array), 2);
        assert_eq!(token.array().data_ptr(), array.data_ptr());
        unpin(token);
        assert_eq!(reference_count(&array), 1);
    }

    #[test]
    fn test_storage_released_once_by_last_holder() {
        let rt = Arc::new(HostRuntime::new());
        let array =
            UsmNdArray::empty(rt.clone(), Device::cpu(0), &[16], "uint32", AllocKind::Device).unwrap();
        let token = pin(&array);
        drop(array);
        assert_eq!(rt.stats().frees, 0, "pin must keep storage alive");
        unpin(token);
        assert_eq!(rt.stats().frees, 1);
        assert_eq!(rt.stats().live_bytes, 0);
    }

    #[test]
    fn test_concurrent_pins() {
        let rt = Arc::new(HostRuntime::new());
        let array =
            UsmNdArray::empty(rt.clone(), Device::cpu(0), &[8], "int8", AllocKind::Shared).unwrap();
        let tokens: Vec<PinToken> = (0..8).map(|_| pin(&array)).collect();
        assert_eq!(reference_count(&array), 9);

        crossbeam::thread::scope(|scope| {
            for token in tokens {
                scope.spawn(move |_| unpin(token));
            }
        })
        .unwrap();

        assert_eq!(reference_count(&array), 1);
        drop(array);
        assert_eq!(rt.stats().frees, 1);
    }
}
