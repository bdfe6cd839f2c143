//! Consumer side of the callback pipeline.
//!
//! One dispatcher per advised group drains the intake queues on its own
//! thread, resolves status codes, refreshes the cached item values and fans
//! each event out to the subscriber queues with `try_send`. A full
//! subscriber queue loses the event for that subscriber only; nothing is
//! pushed back towards the server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::callback::{CancelEnvelope, DataEnvelope, IntakeReceivers, RawItem, WriteEnvelope};
use crate::com::StatusCode;
use crate::errors::{ItemError, OpcError, OpcResult};
use crate::items::ItemTable;
use crate::records::{GroupHandle, ItemHandle, ItemValue, Quality};
use crate::variant::filetime_to_datetime;

/// A value change or an asynchronous read result for one item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemUpdate {
    pub client_handle: ItemHandle,
    /// `None` when the handle is no longer registered in the group.
    pub item_id: Option<String>,
    pub result: Result<ItemValue, ItemError>,
}

/// A batch of item values delivered by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct DataEvent {
    pub transaction_id: u32,
    pub group: GroupHandle,
    pub master_quality: StatusCode,
    pub master: Result<(), ItemError>,
    pub items: Vec<ItemUpdate>,
}

/// Subscription data change (transaction id 0) or refresh result.
pub type DataChangeEvent = DataEvent;
/// Completion of an asynchronous read.
pub type ReadCompleteEvent = DataEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub client_handle: ItemHandle,
    pub item_id: Option<String>,
    pub result: Result<(), ItemError>,
}

/// Completion of an asynchronous write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCompleteEvent {
    pub transaction_id: u32,
    pub group: GroupHandle,
    pub master: Result<(), ItemError>,
    pub items: Vec<WriteOutcome>,
}

/// Acknowledgement of a cancelled asynchronous transaction. Cancellation is
/// advisory; this event may never arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelCompleteEvent {
    pub transaction_id: u32,
    pub group: GroupHandle,
}

/// The server announced it is going away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownEvent {
    pub reason: String,
}

/// Snapshot of the events lost to backpressure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounters {
    /// Dropped by the sink because an intake queue was full.
    pub intake: u64,
    /// Dropped by the dispatcher because a subscriber queue was full.
    pub subscriber: u64,
}

/// A dynamic set of bounded subscriber queues for one event kind.
pub struct Fanout<T> {
    queues: Mutex<Vec<mpsc::Sender<T>>>,
    dropped: AtomicU64,
}

impl<T> Default for Fanout<T> {
    fn default() -> Self {
        Self {
            queues: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }
}

impl<T> std::fmt::Debug for Fanout<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fanout")
            .field("subscribers", &self.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl<T: Clone> Fanout<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber queue holding up to `capacity` events.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.lock().push(tx);
        rx
    }

    /// Offers `event` to every live subscriber without waiting. Closed
    /// queues are pruned; full ones lose the event.
    ///
    /// # Returns
    /// How many subscribers accepted the event.
    pub fn publish(&self, event: &T) -> usize {
        let mut queues = self.lock();
        let mut delivered = 0;
        queues.retain(|queue| match queue.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("subscriber queue full, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("pruning closed subscriber queue");
                false
            }
        });
        delivered
    }
}

impl<T> Fanout<T> {
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of registered queues, including closed ones not yet pruned.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every subscriber queue; receivers observe the channel closing.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::Sender<T>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Subscriber queues of one group, per event kind.
#[derive(Debug, Default)]
pub struct GroupSubscribers {
    pub data_change: Fanout<DataChangeEvent>,
    pub read_complete: Fanout<ReadCompleteEvent>,
    pub write_complete: Fanout<WriteCompleteEvent>,
    pub cancel_complete: Fanout<CancelCompleteEvent>,
}

impl GroupSubscribers {
    pub fn dropped(&self) -> u64 {
        self.data_change.dropped()
            + self.read_complete.dropped()
            + self.write_complete.dropped()
            + self.cancel_complete.dropped()
    }

    pub fn clear(&self) {
        self.data_change.clear();
        self.read_complete.clear();
        self.write_complete.clear();
        self.cancel_complete.clear();
    }
}

/// The dispatch thread of one group. Stopping it is idempotent and also
/// happens on drop.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    cancel: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Dispatcher {
    pub(crate) fn spawn(
        label: &str,
        receivers: IntakeReceivers,
        subscribers: Arc<GroupSubscribers>,
        items: Arc<RwLock<ItemTable>>,
    ) -> OpcResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .map_err(|e| OpcError::Internal(format!("dispatcher runtime: {e}")))?;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let thread = thread::Builder::new()
            .name(format!("opc-dispatch-{label}"))
            .spawn(move || runtime.block_on(run(cancel_rx, receivers, &subscribers, &items)))
            .map_err(|e| OpcError::Internal(format!("dispatcher thread: {e}")))?;
        debug!(group = label, "dispatcher started");
        Ok(Self {
            cancel: Some(cancel_tx),
            thread: Some(thread),
        })
    }

    /// Signals the loop and waits for the thread. Envelopes still queued
    /// in the intake are discarded.
    pub(crate) fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            // The loop may already have ended on its own.
            let _ = cancel.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("dispatcher thread panicked");
            }
            debug!("dispatcher stopped");
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    mut cancel: oneshot::Receiver<()>,
    mut intake: IntakeReceivers,
    subscribers: &GroupSubscribers,
    items: &RwLock<ItemTable>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut cancel => break,
            Some(envelope) = intake.data_change.recv() => {
                subscribers.data_change.publish(&resolve_data(envelope, items));
            }
            Some(envelope) = intake.read_complete.recv() => {
                subscribers.read_complete.publish(&resolve_data(envelope, items));
            }
            Some(envelope) = intake.write_complete.recv() => {
                subscribers.write_complete.publish(&resolve_write(envelope, items));
            }
            Some(envelope) = intake.cancel_complete.recv() => {
                subscribers.cancel_complete.publish(&resolve_cancel(envelope));
            }
            // Every intake sender is gone: the sink was released.
            else => break,
        }
    }
}

fn master(code: StatusCode) -> Result<(), ItemError> {
    if code.is_err() {
        Err(ItemError::from_code(code))
    } else {
        Ok(())
    }
}

fn item_value(raw: RawItem) -> Result<ItemValue, ItemError> {
    if raw.error.is_err() {
        return Err(ItemError::from_code(raw.error));
    }
    let value = raw
        .value
        .map_err(|e| ItemError::new(StatusCode::DISP_E_BADVARTYPE, e.to_string()))?;
    Ok(ItemValue {
        client_handle: ItemHandle(raw.client_handle),
        value,
        quality: Quality(raw.quality),
        timestamp: filetime_to_datetime(raw.timestamp),
    })
}

pub(crate) fn resolve_data(envelope: DataEnvelope, items: &RwLock<ItemTable>) -> DataEvent {
    let mut table = items.write().unwrap_or_else(PoisonError::into_inner);
    let updates = envelope
        .items
        .into_iter()
        .map(|raw| {
            let client_handle = ItemHandle(raw.client_handle);
            let result = item_value(raw);
            let item_id = match &result {
                Ok(value) => table.record_value(value),
                Err(_) => table.item_id(client_handle).map(str::to_owned),
            };
            ItemUpdate {
                client_handle,
                item_id,
                result,
            }
        })
        .collect();
    DataEvent {
        transaction_id: envelope.transaction_id,
        group: GroupHandle(envelope.group),
        master_quality: envelope.master_quality,
        master: master(envelope.master_error),
        items: updates,
    }
}

pub(crate) fn resolve_write(envelope: WriteEnvelope, items: &RwLock<ItemTable>) -> WriteCompleteEvent {
    let table = items.read().unwrap_or_else(PoisonError::into_inner);
    let outcomes = envelope
        .items
        .into_iter()
        .map(|(handle, code)| {
            let client_handle = ItemHandle(handle);
            WriteOutcome {
                client_handle,
                item_id: table.item_id(client_handle).map(str::to_owned),
                result: master(code),
            }
        })
        .collect();
    WriteCompleteEvent {
        transaction_id: envelope.transaction_id,
        group: GroupHandle(envelope.group),
        master: master(envelope.master_error),
        items: outcomes,
    }
}

fn resolve_cancel(envelope: CancelEnvelope) -> CancelCompleteEvent {
    CancelCompleteEvent {
        transaction_id: envelope.transaction_id,
        group: GroupHandle(envelope.group),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::intake;
    use crate::items::ItemRecord;
    use crate::variant::{CodecError, FileTime, Value};
    use std::time::Duration;

    fn table_with(item_id: &str, client: u32) -> Arc<RwLock<ItemTable>> {
        let mut table = ItemTable::default();
        table.insert(ItemRecord::new(item_id, ItemHandle(client), ItemHandle(100 + client)));
        Arc::new(RwLock::new(table))
    }

    fn raw(client: u32, value: Result<Value, CodecError>, error: StatusCode) -> RawItem {
        RawItem {
            client_handle: client,
            value,
            quality: 0xC0,
            timestamp: FileTime::from_u64(133_000_000_000_000_000),
            error,
        }
    }

    #[test]
    fn test_fanout_counts_full_and_prunes_closed() {
        let fanout = Fanout::new();
        let mut slow = fanout.subscribe(1);
        let closed = fanout.subscribe(1);
        drop(closed);

        assert_eq!(fanout.publish(&1u32), 1);
        assert_eq!(fanout.len(), 1);
        assert_eq!(fanout.publish(&2u32), 0);
        assert_eq!(fanout.dropped(), 1);
        assert_eq!(slow.try_recv().unwrap(), 1);
    }

    #[test]
    fn test_fanout_debug_without_clone_events() {
        struct Opaque;
        let fanout: Fanout<Opaque> = Fanout::default();
        let _rx = {
            let (tx, rx) = mpsc::channel::<Opaque>(1);
            fanout.lock().push(tx);
            rx
        };
        assert_eq!(fanout.dropped(), 0);
        assert_eq!(format!("{fanout:?}"), "Fanout { subscribers: 1, dropped: 0 }");
    }

    #[test]
    fn test_resolve_attributes_each_item() {
        let items = table_with("X.Y", 1);
        let envelope = DataEnvelope {
            transaction_id: 0,
            group: 4,
            master_quality: StatusCode::S_FALSE,
            master_error: StatusCode::S_FALSE,
            items: vec![
                raw(1, Ok(Value::I32(5)), StatusCode::S_OK),
                raw(2, Ok(Value::Empty), StatusCode::OPC_E_UNKNOWNITEMID),
                raw(1, Err(CodecError::UnsupportedType(0x4003)), StatusCode::S_OK),
            ],
        };
        let event = resolve_data(envelope, &items);

        assert!(event.master.is_ok());
        assert_eq!(event.items[0].item_id.as_deref(), Some("X.Y"));
        assert_eq!(event.items[0].result.as_ref().unwrap().value, Value::I32(5));
        assert_eq!(
            event.items[1].result.as_ref().unwrap_err().code(),
            StatusCode::OPC_E_UNKNOWNITEMID
        );
        assert_eq!(event.items[1].item_id, None);
        assert_eq!(
            event.items[2].result.as_ref().unwrap_err().code(),
            StatusCode::DISP_E_BADVARTYPE
        );

        let table = items.read().unwrap();
        assert_eq!(table.by_client(ItemHandle(1)).unwrap().value, Some(Value::I32(5)));
    }

    #[test]
    fn test_dispatcher_delivers_and_stops() {
        let (intake, receivers) = intake(8);
        let subscribers = Arc::new(GroupSubscribers::default());
        let mut rx = subscribers.write_complete.subscribe(8);
        let items = table_with("A", 3);
        let mut dispatcher =
            Dispatcher::spawn("test", receivers, Arc::clone(&subscribers), items).unwrap();

        intake.offer_write_complete(WriteEnvelope {
            transaction_id: 11,
            group: 2,
            master_error: StatusCode::S_OK,
            items: vec![(3, StatusCode::S_OK)],
        });
        let event = rx.blocking_recv().unwrap();
        assert_eq!(event.transaction_id, 11);
        assert_eq!(event.items[0].item_id.as_deref(), Some("A"));

        dispatcher.stop();
        assert!(!dispatcher.is_running());
        dispatcher.stop();
    }

    #[test]
    fn test_dispatcher_ends_when_sink_is_gone() {
        let (intake, receivers) = intake(1);
        let subscribers = Arc::new(GroupSubscribers::default());
        let dispatcher = Dispatcher::spawn(
            "orphan",
            receivers,
            subscribers,
            Arc::new(RwLock::new(ItemTable::default())),
        )
        .unwrap();
        drop(intake);
        for _ in 0..100 {
            if !dispatcher.is_running() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!dispatcher.is_running());
    }
}
