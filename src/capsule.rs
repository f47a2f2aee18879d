// src/capsule.rs - Ownership capsule assembly and the release callback
//! A capsule is a heap-allocated [`DLManagedTensor`] whose `manager_ctx`
//! points at a [`CapsuleContext`]: the view (which owns the shape and stride
//! arrays the ABI record points into) and a pin on the exported array.
//!
//! Every capsule is entered in a process-wide registry when built and removed
//! by the release callback. A release for an address that is not registered
//! (released twice, or never produced here) is rejected without touching the
//! pointer, and capsules that were never released stay visible through
//! [`outstanding_capsules`].

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::buffer::{ArrayLike, UsmNdArray};
use crate::dlpack::{DLManagedTensor, DLTensor};
use crate::lifecycle::{pin, unpin, PinToken};
use crate::view::{build_view, downcast_array, TensorView};
use crate::{HandoffError, Result};

/// Per-capsule lifecycle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapsuleState {
    /// Assembled, still owned by the producer.
    Built = 0,
    /// Address handed to the consumer.
    Given = 1,
    /// Release callback ran; terminal.
    Released = 2,
    /// Dropped by the producer without ever being given; terminal.
    Aborted = 3,
}

impl CapsuleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => CapsuleState::Built,
            1 => CapsuleState::Given,
            2 => CapsuleState::Released,
            _ => CapsuleState::Aborted,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CapsuleState::Released | CapsuleState::Aborted)
    }
}

/// Shared state cell, readable after the capsule itself is gone.
#[derive(Debug)]
pub struct CapsuleStatus {
    state: AtomicU8,
}

impl CapsuleStatus {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(CapsuleState::Built as u8),
        }
    }

    pub fn state(&self) -> CapsuleState {
        CapsuleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move `from -> to`; false if the capsule was not in `from`.
    pub(crate) fn advance(&self, from: CapsuleState, to: CapsuleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct CapsuleContext {
    view: TensorView,
    pin: PinToken,
    status: Arc<CapsuleStatus>,
}

lazy_static::lazy_static! {
    static ref LIVE_CAPSULES: Mutex<HashMap<usize, Arc<CapsuleStatus>>> =
        Mutex::new(HashMap::new());
}

static REJECTED_RELEASES: AtomicUsize = AtomicUsize::new(0);

fn live_capsules() -> MutexGuard<'static, HashMap<usize, Arc<CapsuleStatus>>> {
    LIVE_CAPSULES.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Capsules built in this process and not yet released or aborted.
pub fn outstanding_capsules() -> usize {
    live_capsules().len()
}

/// Whether `address` is a capsule still awaiting release.
pub fn is_live(address: usize) -> bool {
    live_capsules().contains_key(&address)
}

/// Release calls that were refused because their address was not live.
pub fn rejected_releases() -> usize {
    REJECTED_RELEASES.load(Ordering::Acquire)
}

/// A fully assembled capsule still owned by the producer.
///
/// Dropping it without calling [`crate::handoff::give`] aborts the export:
/// the pin is dropped directly and the capsule freed.
pub struct OwnershipCapsule {
    managed: NonNull<DLManagedTensor>,
    status: Arc<CapsuleStatus>,
}

// The capsule is exclusively owned until given away.
unsafe impl Send for OwnershipCapsule {}

impl OwnershipCapsule {
    pub fn as_ptr(&self) -> *mut DLManagedTensor {
        self.managed.as_ptr()
    }

    pub fn dl_tensor(&self) -> &DLTensor {
        // SAFETY: the capsule is live while `self` exists.
        unsafe { &self.managed.as_ref().dl_tensor }
    }

    pub fn view(&self) -> &TensorView {
        &self.context().view
    }

    /// The array this capsule keeps alive.
    pub fn array(&self) -> &UsmNdArray {
        self.context().pin.array()
    }

    pub fn state(&self) -> CapsuleState {
        self.status.state()
    }

    pub fn status(&self) -> Arc<CapsuleStatus> {
        Arc::clone(&self.status)
    }

    /// Explicitly abandon a capsule that will not be given.
    pub fn abort(self) {
        drop(self);
    }

    /// Mark the capsule given and surrender the address.
    pub(crate) fn into_given(self) -> *mut DLManagedTensor {
        let ptr = self.managed.as_ptr();
        self.status.advance(CapsuleState::Built, CapsuleState::Given);
        std::mem::forget(self);
        ptr
    }

    fn context(&self) -> &CapsuleContext {
        // SAFETY: manager_ctx was set from `Box::into_raw` in `make_capsule` and
        // is only reclaimed by the release callback, which cannot have run yet.
        unsafe { &*(self.managed.as_ref().manager_ctx as *const CapsuleContext) }
    }
}

impl fmt::Debug for OwnershipCapsule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnershipCapsule")
            .field("address", &self.managed)
            .field("state", &self.state())
            .field("view", self.view())
            .finish()
    }
}

impl Drop for OwnershipCapsule {
    fn drop(&mut self) {
        log::debug!("Aborting capsule {:p} that was never given", self.managed);
        // SAFETY: the capsule was never handed out, so this is its only owner.
        unsafe { release_capsule(self.managed.as_ptr()) };
    }
}

/// Assemble a capsule around `view`, pinning `array` for as long as the
/// capsule lives. `view` must describe `array` exactly, or the pin would keep
/// the wrong storage alive.
pub fn make_capsule(view: TensorView, array: &UsmNdArray) -> Result<OwnershipCapsule> {
    let expected = build_view(array)?;
    if view != expected {
        return Err(HandoffError::InvalidGeometry(format!(
            "view {} does not describe the pinned array {}",
            view, expected
        )));
    }

    let status = Arc::new(CapsuleStatus::new());
    let mut context = Box::new(CapsuleContext {
        view,
        pin: pin(array),
        status: Arc::clone(&status),
    });
    let dl_tensor = context.view.to_dl_tensor();

    let managed = Box::new(DLManagedTensor {
        dl_tensor,
        manager_ctx: Box::into_raw(context) as *mut c_void,
        deleter: Some(release_capsule),
    });
    let managed = NonNull::from(Box::leak(managed));

    live_capsules().insert(managed.as_ptr() as usize, Arc::clone(&status));
    log::debug!("Built capsule {:p}", managed);

    Ok(OwnershipCapsule { managed, status })
}

/// Build the view of `array` and wrap it in a capsule.
pub fn export(array: &dyn ArrayLike) -> Result<OwnershipCapsule> {
    let view = build_view(array)?;
    let array = downcast_array(array)?;
    make_capsule(view, array)
}

/// The deleter installed in every capsule.
///
/// # Safety
/// `managed` must be null, or an address whose memory is either a live
/// capsule from [`make_capsule`] or not dereferenced by this crate at all
/// (unknown addresses are rejected before any access).
pub unsafe extern "C" fn release_capsule(managed: *mut DLManagedTensor) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| release_inner(managed)));
    if outcome.is_err() {
        log::error!("Panic while releasing capsule {:p}", managed);
    }
}

unsafe fn release_inner(managed: *mut DLManagedTensor) {
    let registered = live_capsules().remove(&(managed as usize));
    if registered.is_none() {
        REJECTED_RELEASES.fetch_add(1, Ordering::AcqRel);
        log::warn!(
            "Rejected release of {:p}: not a live capsule (double release?)",
            managed
        );
        return;
    }

    // SAFETY: registered addresses come from `Box::leak` in `make_capsule`, and
    // removal from the registry above makes this the single reclaim.
    let managed = Box::from_raw(managed);
    let context = Box::from_raw(managed.manager_ctx as *mut CapsuleContext);
    let CapsuleContext { view, pin, status } = *context;

    // Terminal before any storage goes away.
    if status.advance(CapsuleState::Given, CapsuleState::Released) {
        log::debug!("Capsule released by consumer");
    } else if status.advance(CapsuleState::Built, CapsuleState::Aborted) {
        log::debug!("Capsule aborted before handoff");
    }

    unpin(pin);
    drop(managed);
    drop(view);
}
