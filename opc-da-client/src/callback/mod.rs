//! Client-side callback sinks and the intake side of the dispatch pipeline.
//!
//! The foreign server invokes the sinks on a thread the client does not
//! control. Within the call a sink only copies the raw arrays into an owned
//! envelope, offers it to a bounded intake queue with `try_send` and returns.
//! It never calls back into the server.

mod data;
mod shutdown;

pub use data::DataCallback;
pub use shutdown::ShutdownCallback;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::com::StatusCode;
use crate::variant::{CodecError, FileTime, Value};

/// One item of a data-change or read-complete batch, copied out of the
/// callback arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct RawItem {
    pub client_handle: u32,
    /// Decoded in the callback; a decode failure stays attached to the item.
    pub value: Result<Value, CodecError>,
    pub quality: u16,
    pub timestamp: FileTime,
    pub error: StatusCode,
}

/// Owned copy of an `OnDataChange` or `OnReadComplete` invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct DataEnvelope {
    pub transaction_id: u32,
    pub group: u32,
    pub master_quality: StatusCode,
    pub master_error: StatusCode,
    pub items: Vec<RawItem>,
}

/// Owned copy of an `OnWriteComplete` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEnvelope {
    pub transaction_id: u32,
    pub group: u32,
    pub master_error: StatusCode,
    /// `(client handle, status)` pairs in callback order.
    pub items: Vec<(u32, StatusCode)>,
}

/// Owned copy of an `OnCancelComplete` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelEnvelope {
    pub transaction_id: u32,
    pub group: u32,
}

/// Producer half of the intake queues, one bounded channel per event kind.
#[derive(Debug, Clone)]
pub struct Intake {
    data_change: mpsc::Sender<DataEnvelope>,
    read_complete: mpsc::Sender<DataEnvelope>,
    write_complete: mpsc::Sender<WriteEnvelope>,
    cancel_complete: mpsc::Sender<CancelEnvelope>,
    dropped: Arc<AtomicU64>,
}

/// Consumer half of the intake queues, owned by the dispatcher.
#[derive(Debug)]
pub struct IntakeReceivers {
    pub data_change: mpsc::Receiver<DataEnvelope>,
    pub read_complete: mpsc::Receiver<DataEnvelope>,
    pub write_complete: mpsc::Receiver<WriteEnvelope>,
    pub cancel_complete: mpsc::Receiver<CancelEnvelope>,
}

/// Creates the intake queues with `capacity` slots per event kind. A zero
/// capacity is raised to one.
pub fn intake(capacity: usize) -> (Intake, IntakeReceivers) {
    intake_counting(capacity, Arc::new(AtomicU64::new(0)))
}

/// Like [`intake`] but adds drops to an existing counter, so a group keeps
/// one tally across successive subscriptions.
pub fn intake_counting(capacity: usize, dropped: Arc<AtomicU64>) -> (Intake, IntakeReceivers) {
    let capacity = capacity.max(1);
    let (data_change, data_change_rx) = mpsc::channel(capacity);
    let (read_complete, read_complete_rx) = mpsc::channel(capacity);
    let (write_complete, write_complete_rx) = mpsc::channel(capacity);
    let (cancel_complete, cancel_complete_rx) = mpsc::channel(capacity);
    (
        Intake {
            data_change,
            read_complete,
            write_complete,
            cancel_complete,
            dropped,
        },
        IntakeReceivers {
            data_change: data_change_rx,
            read_complete: read_complete_rx,
            write_complete: write_complete_rx,
            cancel_complete: cancel_complete_rx,
        },
    )
}

impl Intake {
    /// Number of envelopes dropped because a queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Shared drop counter, read by the group after the sink is gone.
    pub fn drop_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    pub fn offer_data_change(&self, envelope: DataEnvelope) {
        self.offer(&self.data_change, envelope, "data_change");
    }

    pub fn offer_read_complete(&self, envelope: DataEnvelope) {
        self.offer(&self.read_complete, envelope, "read_complete");
    }

    pub fn offer_write_complete(&self, envelope: WriteEnvelope) {
        self.offer(&self.write_complete, envelope, "write_complete");
    }

    pub fn offer_cancel_complete(&self, envelope: CancelEnvelope) {
        self.offer(&self.cancel_complete, envelope, "cancel_complete");
    }

    fn offer<T>(&self, queue: &mpsc::Sender<T>, envelope: T, kind: &'static str) {
        if queue.try_send(envelope).is_err() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(kind, dropped = total, "intake queue unavailable, callback event dropped");
        } else {
            tracing::trace!(kind, "callback event queued");
        }
    }
}

/// Runs a callback body, turning a panic into `E_UNEXPECTED` so it never
/// unwinds into the foreign caller.
pub(crate) fn guarded(body: impl FnOnce()) -> StatusCode {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(()) => StatusCode::S_OK,
        Err(_) => {
            tracing::warn!("callback panicked");
            StatusCode::E_UNEXPECTED
        }
    }
}

/// Borrows a callback array, treating a null pointer as empty.
///
/// # Safety
/// A non-null `ptr` must point to `count` initialized elements that stay
/// valid for `'a`.
pub(crate) unsafe fn borrowed<'a, T>(ptr: *const T, count: u32) -> &'a [T] {
    if ptr.is_null() || count == 0 {
        &[]
    } else {
        // SAFETY: forwarded contract.
        unsafe { std::slice::from_raw_parts(ptr, count as usize) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel(tid: u32) -> CancelEnvelope {
        CancelEnvelope {
            transaction_id: tid,
            group: 1,
        }
    }

    #[test]
    fn test_full_queue_counts_drop() {
        let (intake, mut receivers) = intake(1);
        intake.offer_cancel_complete(cancel(1));
        intake.offer_cancel_complete(cancel(2));
        assert_eq!(intake.dropped(), 1);
        assert_eq!(receivers.cancel_complete.try_recv().unwrap(), cancel(1));
        assert!(receivers.cancel_complete.try_recv().is_err());
    }

    #[test]
    fn test_closed_queue_counts_drop() {
        let (intake, receivers) = intake(4);
        drop(receivers);
        intake.offer_cancel_complete(cancel(1));
        assert_eq!(intake.dropped(), 1);
    }

    #[test]
    fn test_guarded_catches_panic() {
        assert_eq!(guarded(|| {}), StatusCode::S_OK);
        assert_eq!(guarded(|| panic!("boom")), StatusCode::E_UNEXPECTED);
    }

    #[test]
    fn test_null_array_is_empty() {
        // SAFETY: null is accepted and yields an empty slice.
        let items: &[u32] = unsafe { borrowed(std::ptr::null(), 5) };
        assert!(items.is_empty());
    }
}
