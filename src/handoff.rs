// src/handoff.rs - Transfer of capsules to a consumer
//! [`give`] is fire-and-forget: once it returns, the only way the exported
//! array is unpinned is the consumer invoking the capsule's deleter.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::queue::SegQueue;

use crate::capsule::{CapsuleState, CapsuleStatus, OwnershipCapsule};
use crate::config::HandoffConfig;
use crate::dlpack::{DLManagedTensor, TensorSummary};

/// The receiving side of the exchange.
pub trait Consumer: Send + Sync {
    /// Take logical ownership of the capsule at `managed`.
    fn give(&self, managed: *mut DLManagedTensor);

    /// Tear down consumer-side bookkeeping.
    fn finalize(&self);
}

/// What the producer keeps after a handoff: the address, for ordering
/// checks only, and the capsule's observable state.
#[derive(Clone)]
pub struct CapsuleReceipt {
    address: usize,
    status: Arc<CapsuleStatus>,
}

impl CapsuleReceipt {
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn state(&self) -> CapsuleState {
        self.status.state()
    }

    pub fn is_released(&self) -> bool {
        self.state() == CapsuleState::Released
    }
}

impl fmt::Debug for CapsuleReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapsuleReceipt")
            .field("address", &format_args!("{:#x}", self.address))
            .field("state", &self.state())
            .finish()
    }
}

/// Hand `capsule` to `consumer`. The capsule is marked given before the
/// consumer sees it, so a consumer that releases immediately is fine.
pub fn give(capsule: OwnershipCapsule, consumer: &dyn Consumer) -> CapsuleReceipt {
    let status = capsule.status();
    let managed = capsule.into_given();
    log::info!("Giving capsule {:p} to consumer", managed);
    consumer.give(managed);
    CapsuleReceipt {
        address: managed as usize,
        status,
    }
}

/// Issue the consumer's teardown call.
pub fn finalize(consumer: &dyn Consumer) {
    log::info!("Finalizing consumer");
    consumer.finalize();
}

/// Call the deleter stored in a managed tensor, the way any consumer must.
///
/// # Safety
/// `managed` must be a capsule this consumer owns and has not released yet.
pub unsafe fn invoke_deleter(managed: *mut DLManagedTensor) {
    if managed.is_null() {
        return;
    }
    match (*managed).deleter {
        Some(deleter) => deleter(managed),
        None => log::warn!("Managed tensor {:p} carries no deleter", managed),
    }
}

/// Capsule address that may cross threads. Ownership of the capsule moves
/// with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CapsuleAddress(usize);

impl CapsuleAddress {
    fn new(managed: *mut DLManagedTensor) -> Self {
        Self(managed as usize)
    }

    fn as_ptr(self) -> *mut DLManagedTensor {
        self.0 as *mut DLManagedTensor
    }
}

/// Consumer living in the same process: keeps given capsules until
/// [`Consumer::finalize`] or [`InProcessConsumer::release_next`].
#[derive(Debug)]
pub struct InProcessConsumer {
    held: SegQueue<CapsuleAddress>,
    record_summaries: bool,
    received: Mutex<Vec<TensorSummary>>,
}

impl InProcessConsumer {
    pub fn new() -> Self {
        Self::with_config(&HandoffConfig::default())
    }

    pub fn with_config(config: &HandoffConfig) -> Self {
        Self {
            held: SegQueue::new(),
            record_summaries: config.record_summaries,
            received: Mutex::new(Vec::new()),
        }
    }

    /// Capsules given and not yet released.
    pub fn pending(&self) -> usize {
        self.held.len()
    }

    /// Summaries of every tensor received so far, in order.
    pub fn received(&self) -> Vec<TensorSummary> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Release the oldest held capsule. Returns false if none was held.
    pub fn release_next(&self) -> bool {
        match self.held.pop() {
            Some(address) => {
                // SAFETY: addresses are queued once in `give` and popped once.
                unsafe { invoke_deleter(address.as_ptr()) };
                true
            }
            None => false,
        }
    }
}

impl Default for InProcessConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl Consumer for InProcessConsumer {
    fn give(&self, managed: *mut DLManagedTensor) {
        if managed.is_null() {
            log::warn!("In-process consumer was given a null capsule");
            return;
        }
        // SAFETY: a given capsule stays valid until its deleter runs, which
        // only this consumer triggers.
        let summary = unsafe { TensorSummary::from_dl_tensor(&(*managed).dl_tensor) };
        log::info!("Consumer received {}", summary);
        if self.record_summaries {
            self.received
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(summary);
        }
        self.held.push(CapsuleAddress::new(managed));
    }

    fn finalize(&self) {
        let mut released = 0;
        while self.release_next() {
            released += 1;
        }
        log::debug!("In-process consumer released {} capsule(s)", released);
    }
}

enum WorkerMessage {
    Hold(CapsuleAddress),
    ReleaseAll(Sender<usize>),
    Shutdown,
}

/// Consumer that owns capsules on a dedicated worker thread and releases
/// them there, never on the producer's thread.
pub struct ThreadedConsumer {
    sender: Sender<WorkerMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadedConsumer {
    pub fn spawn() -> Self {
        let (sender, receiver) = channel::unbounded();
        let worker = thread::Builder::new()
            .name("dlpack-consumer".to_string())
            .spawn(move || consumer_loop(receiver))
            .ok();
        if worker.is_none() {
            log::error!("Failed to spawn consumer thread; capsules will not be released");
        }
        Self {
            sender,
            worker: Mutex::new(worker),
        }
    }
}

fn consumer_loop(receiver: Receiver<WorkerMessage>) {
    let mut held: Vec<CapsuleAddress> = Vec::new();
    let release_all = |held: &mut Vec<CapsuleAddress>| {
        let count = held.len();
        for address in held.drain(..) {
            // SAFETY: each address was sent exactly once by `give`.
            unsafe { invoke_deleter(address.as_ptr()) };
        }
        count
    };

    for message in receiver.iter() {
        match message {
            WorkerMessage::Hold(address) => held.push(address),
            WorkerMessage::ReleaseAll(ack) => {
                let count = release_all(&mut held);
                let _ = ack.send(count);
            }
            WorkerMessage::Shutdown => break,
        }
    }

    if !held.is_empty() {
        log::warn!(
            "Consumer thread stopping with {} unreleased capsule(s); releasing them",
            held.len()
        );
        release_all(&mut held);
    }
}

impl Consumer for ThreadedConsumer {
    fn give(&self, managed: *mut DLManagedTensor) {
        if self
            .sender
            .send(WorkerMessage::Hold(CapsuleAddress::new(managed)))
            .is_err()
        {
            log::error!("Consumer thread is gone; capsule {:p} leaks", managed);
        }
    }

    /// Blocks until the worker has released everything it held.
    fn finalize(&self) {
        let (ack, done) = channel::bounded(1);
        if self.sender.send(WorkerMessage::ReleaseAll(ack)).is_err() {
            log::error!("Consumer thread is gone; nothing to finalize");
            return;
        }
        match done.recv() {
            Ok(count) => log::debug!("Consumer thread released {} capsule(s)", count),
            Err(_) => log::error!("Consumer thread exited during finalize"),
        }
    }
}

impl Drop for ThreadedConsumer {
    fn drop(&mut self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                log::error!("Consumer thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::UsmNdArray;
    use crate::capsule::export;
    use crate::lifecycle::reference_count;
    use crate::runtime::{AllocKind, Device, HostRuntime};

    fn array(rt: &Arc<HostRuntime>) -> UsmNdArray {
        UsmNdArray::empty(rt.clone(), Device::cpu(0), &[2, 2], "int32", AllocKind::Shared).unwrap()
    }

    #[test]
    fn test_give_then_finalize() {
        let rt = Arc::new(HostRuntime::new());
        let a = array(&rt);
        let consumer = InProcessConsumer::new();

        let receipt = give(export(&a).unwrap(), &consumer);
        assert_eq!(receipt.state(), CapsuleState::Given);
        assert_eq!(consumer.pending(), 1);
        assert_eq!(reference_count(&a), 2);

        finalize(&consumer);
        assert!(receipt.is_released());
        assert_eq!(consumer.pending(), 0);
        assert_eq!(reference_count(&a), 1);
    }

    #[test]
    fn test_consumer_records_what_it_saw() {
        let rt = Arc::new(HostRuntime::new());
        let a = array(&rt);
        let consumer = InProcessConsumer::new();
        give(export(&a).unwrap(), &consumer);

        let seen = consumer.received();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].shape, vec![2, 2]);
        assert_eq!(seen[0].strides, vec![2, 1]);
        assert_eq!(seen[0].dtype.as_triple(), (0, 32, 1));
        finalize(&consumer);
    }

    #[test]
    fn test_summaries_can_be_disabled() {
        let rt = Arc::new(HostRuntime::new());
        let a = array(&rt);
        let config = HandoffConfig {
            record_summaries: false,
            ..Default::default()
        };
        let consumer = InProcessConsumer::with_config(&config);
        give(export(&a).unwrap(), &consumer);
        assert!(consumer.received().is_empty());
        assert!(consumer.release_next());
        assert!(!consumer.release_next());
    }

    #[test]
    fn test_threaded_consumer_releases_off_thread() {
        let rt = Arc::new(HostRuntime::new());
        let a = array(&rt);
        let consumer = ThreadedConsumer::spawn();

        let receipts: Vec<CapsuleReceipt> =
            (0..4).map(|_| give(export(&a).unwrap(), &consumer)).collect();
        drop(a);

        finalize(&consumer);
        assert!(receipts.iter().all(CapsuleReceipt::is_released));
        assert_eq!(rt.stats().frees, 1);
    }

    #[test]
    fn test_threaded_consumer_drop_releases_pending() {
        let rt = Arc::new(HostRuntime::new());
        let a = array(&rt);
        let consumer = ThreadedConsumer::spawn();
        let receipt = give(export(&a).unwrap(), &consumer);
        drop(consumer);
        assert!(receipt.is_released());
        assert_eq!(reference_count(&a), 1);
    }
}
