//! One OPC group: its foreign interfaces, its items and its subscription.
//!
//! The interfaces live behind a lock so that [`OpcGroup::release`] can drop
//! them deterministically while clones of the group are still around; any
//! later call fails with `InvalidState`. Release tears the subscription down
//! first (unadvise, then stop the dispatcher) and only then lets go of the
//! group's handles and removes it from the server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tokio::sync::mpsc;
use tracing::{debug, info_span, warn};

use crate::callback::{DataCallback, intake_counting};
use crate::com::handle::ReleaseFlag;
use crate::com::vtables::{
    IConnectionPoint, IConnectionPointContainer, IOPCAsyncIO2, IOPCDataCallback,
    IOPCGroupStateMgt, IOPCItemMgt, IOPCItemProperties, IOPCServer, IOPCSyncIO,
};
use crate::com::{Handle, Interface, StatusCode};
use crate::config::{ClientConfig, ItemDefaults};
use crate::dispatch::{
    CancelCompleteEvent, DataChangeEvent, Dispatcher, DropCounters, GroupSubscribers,
    ReadCompleteEvent, WriteCompleteEvent,
};
use crate::errors::{ItemError, OpcError, OpcResult};
use crate::items::{ItemTable, OpcItems, raw_handles};
use crate::records::{DataSource, GroupHandle, GroupState, ItemHandle, ItemValue, item_statuses};
use crate::traits::{
    AsyncIo2Trait, ConnectionPointContainerTrait, GroupStateChange, GroupStateMgtTrait,
    ItemMgtTrait, ItemPropertiesTrait, ServerTrait, SyncIoTrait, advise, unadvise,
};
use crate::variant::{Value, as_raw_slice, encode_all};

/// The foreign interfaces a group holds while it is alive.
pub(crate) struct GroupInterfaces {
    server: Handle<IOPCServer>,
    state_mgt: Handle<IOPCGroupStateMgt>,
    sync_io: Handle<IOPCSyncIO>,
    async_io2: Handle<IOPCAsyncIO2>,
    item_mgt: Handle<IOPCItemMgt>,
    container: Handle<IConnectionPointContainer>,
}

impl GroupInterfaces {
    /// Queries the sibling interfaces of a new group. On failure every
    /// reference acquired so far is released.
    pub(crate) fn acquire(
        server: Handle<IOPCServer>,
        state_mgt: Handle<IOPCGroupStateMgt>,
    ) -> OpcResult<Self> {
        Ok(Self {
            sync_io: state_mgt.cast()?,
            async_io2: state_mgt.cast()?,
            item_mgt: state_mgt.cast()?,
            container: state_mgt.cast()?,
            state_mgt,
            server,
        })
    }
}

impl GroupStateMgtTrait for GroupInterfaces {
    fn interface(&self) -> OpcResult<&Handle<IOPCGroupStateMgt>> {
        Ok(&self.state_mgt)
    }
}

impl SyncIoTrait for GroupInterfaces {
    fn interface(&self) -> OpcResult<&Handle<IOPCSyncIO>> {
        Ok(&self.sync_io)
    }
}

impl AsyncIo2Trait for GroupInterfaces {
    fn interface(&self) -> OpcResult<&Handle<IOPCAsyncIO2>> {
        Ok(&self.async_io2)
    }
}

impl ItemMgtTrait for GroupInterfaces {
    fn interface(&self) -> OpcResult<&Handle<IOPCItemMgt>> {
        Ok(&self.item_mgt)
    }
}

impl ConnectionPointContainerTrait for GroupInterfaces {
    fn interface(&self) -> OpcResult<&Handle<IConnectionPointContainer>> {
        Ok(&self.container)
    }
}

/// The server's property interface, queried for a single lookup.
struct ServerProperties(Handle<IOPCItemProperties>);

impl ItemPropertiesTrait for ServerProperties {
    fn interface(&self) -> OpcResult<&Handle<IOPCItemProperties>> {
        Ok(&self.0)
    }
}

/// Groups of one connection keyed by server handle.
pub(crate) type GroupMap = RwLock<BTreeMap<GroupHandle, OpcGroup>>;

/// An advised data callback and the thread draining it.
struct Subscription {
    point: Handle<IConnectionPoint>,
    cookie: u32,
    sink: Handle<IOPCDataCallback>,
    dispatcher: Dispatcher,
}

pub(crate) struct GroupInner {
    client_handle: GroupHandle,
    server_handle: GroupHandle,
    name: RwLock<String>,
    interfaces: RwLock<Option<GroupInterfaces>>,
    items: Arc<RwLock<ItemTable>>,
    subscribers: Arc<GroupSubscribers>,
    subscription: Mutex<Option<Subscription>>,
    intake_dropped: Arc<AtomicU64>,
    next_item: AtomicU32,
    item_defaults: RwLock<ItemDefaults>,
    config: Arc<ClientConfig>,
    /// The registry that lists this group; a release through any clone
    /// unlists it there.
    registry: Weak<GroupMap>,
    released: ReleaseFlag,
}

impl GroupInner {
    pub(crate) fn new(
        name: String,
        client_handle: GroupHandle,
        server_handle: GroupHandle,
        interfaces: GroupInterfaces,
        config: Arc<ClientConfig>,
        registry: Weak<GroupMap>,
    ) -> Self {
        Self {
            client_handle,
            server_handle,
            name: RwLock::new(name),
            interfaces: RwLock::new(Some(interfaces)),
            items: Arc::new(RwLock::new(ItemTable::default())),
            subscribers: Arc::new(GroupSubscribers::default()),
            subscription: Mutex::new(None),
            intake_dropped: Arc::new(AtomicU64::new(0)),
            next_item: AtomicU32::new(1),
            item_defaults: RwLock::new(config.items.clone()),
            config,
            registry,
            released: ReleaseFlag::default(),
        }
    }

    pub(crate) fn name(&self) -> String {
        self.name
            .read()
            .map(|n| n.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    pub(crate) fn item_defaults(&self) -> &RwLock<ItemDefaults> {
        &self.item_defaults
    }

    /// Next client handle from the group's counter that no record or call
    /// in flight holds. Zero is never handed out.
    pub(crate) fn next_free_item_handle(&self, table: &ItemTable) -> ItemHandle {
        loop {
            let handle = ItemHandle(self.next_item.fetch_add(1, Ordering::Relaxed));
            if handle.0 != 0 && !table.is_claimed(handle) {
                return handle;
            }
        }
    }

    /// Runs `f` against the live interfaces.
    ///
    /// # Errors
    /// `InvalidState` once the group has been released.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&GroupInterfaces) -> OpcResult<R>) -> OpcResult<R> {
        let guard = self
            .interfaces
            .read()
            .map_err(|_| OpcError::poisoned("group interfaces"))?;
        let interfaces = guard.as_ref().ok_or_else(|| {
            OpcError::InvalidState(format!("group '{}' has been released", self.name()))
        })?;
        f(interfaces)
    }

    pub(crate) fn read_items(&self) -> OpcResult<RwLockReadGuard<'_, ItemTable>> {
        self.items.read().map_err(|_| OpcError::poisoned("item table"))
    }

    pub(crate) fn write_items(&self) -> OpcResult<RwLockWriteGuard<'_, ItemTable>> {
        self.items.write().map_err(|_| OpcError::poisoned("item table"))
    }

    pub(crate) fn write_items_unpoisoned(&self) -> RwLockWriteGuard<'_, ItemTable> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscription(&self) -> OpcResult<std::sync::MutexGuard<'_, Option<Subscription>>> {
        self.subscription
            .lock()
            .map_err(|_| OpcError::poisoned("group subscription"))
    }

    /// Advises a data callback on first use and starts its dispatcher.
    fn ensure_subscribed(&self) -> OpcResult<()> {
        let mut slot = self.lock_subscription()?;
        if slot.is_some() {
            return Ok(());
        }
        let name = self.name();
        let (intake, receivers) =
            intake_counting(self.config.intake_capacity, Arc::clone(&self.intake_dropped));
        let mut dispatcher = Dispatcher::spawn(
            &name,
            receivers,
            Arc::clone(&self.subscribers),
            Arc::clone(&self.items),
        )?;
        let sink = DataCallback::create(intake);
        let advised = self.with(|itf| itf.advise(&IOPCDataCallback::IID, sink.as_raw()));
        match advised {
            Ok((point, cookie)) => {
                debug!(group = %name, cookie, "data callback advised");
                *slot = Some(Subscription {
                    point,
                    cookie,
                    sink,
                    dispatcher,
                });
                Ok(())
            }
            Err(e) => {
                drop(sink);
                dispatcher.stop();
                Err(e)
            }
        }
    }

    /// Unadvises the data callback and waits for the dispatcher to stop.
    fn cancel_subscription(&self) -> OpcResult<()> {
        let taken = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Subscription {
            point,
            cookie,
            sink,
            mut dispatcher,
        }) = taken
        else {
            return Ok(());
        };
        let result = unadvise(&point, cookie);
        match &result {
            Ok(()) => debug!(group = %self.name(), cookie, "data callback unadvised"),
            Err(e) => warn!(group = %self.name(), error = ?e, "unadvise failed"),
        }
        drop(point);
        drop(sink);
        dispatcher.stop();
        result
    }

    fn teardown(&self) -> OpcResult<()> {
        let unadvised = self.cancel_subscription();
        self.subscribers.clear();
        let interfaces = self
            .interfaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(GroupInterfaces {
            server,
            state_mgt,
            sync_io,
            async_io2,
            item_mgt,
            container,
        }) = interfaces
        else {
            return unadvised;
        };
        drop((state_mgt, sync_io, async_io2, item_mgt, container));
        debug!(group = %self.name(), "group interfaces released");
        let removed = server.remove_group(self.server_handle, false);
        if let Err(e) = &removed {
            warn!(group = %self.name(), error = ?e, "RemoveGroup failed");
        }
        self.write_items_unpoisoned().clear();
        unadvised.and(removed)
    }

    pub(crate) fn release(&self) -> OpcResult<()> {
        let name = self.name();
        self.released.mark(&format!("group '{name}'"))?;
        let _span = info_span!("opc.release_group", group = %name).entered();
        self.unlist();
        self.teardown()
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.is_released()
    }

    /// Reads item properties through the server that owns this group.
    pub(crate) fn item_properties(
        &self,
        item_id: &str,
        property_ids: &[u32],
    ) -> OpcResult<Vec<Result<Value, ItemError>>> {
        let properties = self.with(|itf| itf.server.cast::<IOPCItemProperties>())?;
        ServerProperties(properties).get_item_properties(item_id, property_ids)
    }

    /// Drops the registry's entry for this group, if it still has one.
    fn unlist(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let entry = registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.server_handle);
        if entry.is_some() {
            debug!(group = %self.name(), "group unlisted");
        }
    }
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        if !self.released.is_released() {
            if let Err(e) = self.teardown() {
                warn!(group = %self.name(), error = ?e, "implicit group release failed");
            }
        }
    }
}

/// Result of starting an asynchronous read or write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncRequest {
    /// Hand to [`OpcGroup::async_cancel`]; zero when nothing was sent.
    pub cancel_id: u32,
    /// One entry per requested item. Only items without an error appear in
    /// the completion event.
    pub items: Vec<Result<(), ItemError>>,
}

/// A group on a connected server.
///
/// Cloning yields another reference to the same group.
#[derive(Clone)]
pub struct OpcGroup {
    inner: Arc<GroupInner>,
}

impl std::fmt::Debug for OpcGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpcGroup")
            .field("name", &self.name())
            .field("client_handle", &self.inner.client_handle)
            .field("server_handle", &self.inner.server_handle)
            .field("released", &self.inner.is_released())
            .finish()
    }
}

impl OpcGroup {
    pub(crate) fn new(inner: GroupInner) -> Self {
        Self::from_inner(Arc::new(inner))
    }

    pub(crate) fn from_inner(inner: Arc<GroupInner>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> String {
        self.inner.name()
    }

    pub fn client_handle(&self) -> GroupHandle {
        self.inner.client_handle
    }

    pub fn server_handle(&self) -> GroupHandle {
        self.inner.server_handle
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_released()
    }

    pub fn items(&self) -> OpcItems {
        OpcItems::new(Arc::clone(&self.inner))
    }

    // ── State ───────────────────────────────────────────────────────

    /// Reads the group state from the server.
    pub fn state(&self) -> OpcResult<GroupState> {
        self.inner.with(|itf| itf.get_state())
    }

    /// Applies a state change and returns the revised update rate.
    pub fn set_state(&self, change: &GroupStateChange) -> OpcResult<u32> {
        self.inner.with(|itf| itf.set_state(change))
    }

    pub fn set_name(&self, name: &str) -> OpcResult<()> {
        self.inner.with(|itf| itf.set_name(name))?;
        *self
            .inner
            .name
            .write()
            .map_err(|_| OpcError::poisoned("group name"))? = name.to_string();
        Ok(())
    }

    pub fn is_active(&self) -> OpcResult<bool> {
        Ok(self.state()?.active)
    }

    pub fn set_active(&self, active: bool) -> OpcResult<()> {
        self.set_state(&GroupStateChange {
            active: Some(active),
            ..GroupStateChange::default()
        })
        .map(drop)
    }

    pub fn update_rate(&self) -> OpcResult<u32> {
        Ok(self.state()?.update_rate)
    }

    /// Requests a new update rate; the server may revise it.
    pub fn set_update_rate(&self, update_rate: u32) -> OpcResult<u32> {
        self.set_state(&GroupStateChange {
            update_rate: Some(update_rate),
            ..GroupStateChange::default()
        })
    }

    pub fn locale_id(&self) -> OpcResult<u32> {
        Ok(self.state()?.locale_id)
    }

    pub fn set_locale_id(&self, locale_id: u32) -> OpcResult<()> {
        self.set_state(&GroupStateChange {
            locale_id: Some(locale_id),
            ..GroupStateChange::default()
        })
        .map(drop)
    }

    pub fn time_bias(&self) -> OpcResult<i32> {
        Ok(self.state()?.time_bias)
    }

    pub fn set_time_bias(&self, time_bias: i32) -> OpcResult<()> {
        self.set_state(&GroupStateChange {
            time_bias: Some(time_bias),
            ..GroupStateChange::default()
        })
        .map(drop)
    }

    pub fn deadband(&self) -> OpcResult<f32> {
        Ok(self.state()?.percent_deadband)
    }

    pub fn set_deadband(&self, percent: f32) -> OpcResult<()> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(OpcError::InvalidArgument(format!(
                "deadband must be within 0..=100, got {percent}"
            )));
        }
        self.set_state(&GroupStateChange {
            percent_deadband: Some(percent),
            ..GroupStateChange::default()
        })
        .map(drop)
    }

    // ── Synchronous I/O ─────────────────────────────────────────────

    /// Reads items by server handle and refreshes their cached values.
    ///
    /// # Returns
    /// One entry per handle. A batch-level failure is the top-level error
    /// and yields no per-item results.
    pub fn sync_read(
        &self,
        source: DataSource,
        server_handles: &[ItemHandle],
    ) -> OpcResult<Vec<Result<ItemValue, ItemError>>> {
        if server_handles.is_empty() {
            return Ok(Vec::new());
        }
        let _span = info_span!("opc.sync_read", group = %self.name(), tag_count = server_handles.len())
            .entered();
        let raw = raw_handles(server_handles);
        let (mut states, errors) = self.inner.with(|itf| SyncIoTrait::read(itf, source, &raw))?;

        // Take every payload, failed items included, so nothing leaks.
        let mut decoded = Vec::with_capacity(raw.len());
        for state in states.as_mut_slice() {
            // SAFETY: the state array and its variants belong to us.
            decoded.push(Some(unsafe { ItemValue::take(state) }));
        }
        decoded.resize_with(raw.len(), || None);

        let mut table = self.inner.write_items()?;
        let results: Vec<_> = item_statuses(&errors, raw.len())
            .into_iter()
            .zip(decoded)
            .map(|(status, value)| {
                status?;
                let value = value
                    .ok_or_else(|| ItemError::from_code(StatusCode::E_FAIL))?
                    .map_err(|e| {
                        ItemError::new(StatusCode::DISP_E_BADVARTYPE, e.to_string())
                    })?;
                table.record_value(&value);
                Ok(value)
            })
            .collect();
        log_item_failures("read", server_handles, &results);
        Ok(results)
    }

    /// Writes values to items by server handle.
    ///
    /// # Errors
    /// `InvalidArgument` when the lengths differ; `Codec` when a value
    /// cannot be encoded. Per-item failures are entries of the result.
    pub fn sync_write(
        &self,
        server_handles: &[ItemHandle],
        values: &[Value],
    ) -> OpcResult<Vec<Result<(), ItemError>>> {
        crate::traits::ensure_same_len(server_handles.len(), values.len(), "server handles and values")?;
        if server_handles.is_empty() {
            return Ok(Vec::new());
        }
        let _span = info_span!("opc.sync_write", group = %self.name(), tag_count = server_handles.len())
            .entered();
        let raw = raw_handles(server_handles);
        let encoded = encode_all(values)?;
        let errors = self
            .inner
            .with(|itf| SyncIoTrait::write(itf, &raw, as_raw_slice(&encoded)))?;
        let results = item_statuses(&errors, raw.len());
        log_item_failures("write", server_handles, &results);
        Ok(results)
    }

    // ── Asynchronous I/O ────────────────────────────────────────────

    /// Starts an asynchronous read; values arrive as [`ReadCompleteEvent`]s.
    pub fn async_read(&self, server_handles: &[ItemHandle], transaction_id: u32) -> OpcResult<AsyncRequest> {
        if server_handles.is_empty() {
            return Ok(AsyncRequest {
                cancel_id: 0,
                items: Vec::new(),
            });
        }
        self.inner.ensure_subscribed()?;
        let raw = raw_handles(server_handles);
        let (cancel_id, errors) = self
            .inner
            .with(|itf| AsyncIo2Trait::read(itf, &raw, transaction_id))?;
        Ok(AsyncRequest {
            cancel_id,
            items: item_statuses(&errors, raw.len()),
        })
    }

    /// Starts an asynchronous write; outcomes arrive as
    /// [`WriteCompleteEvent`]s.
    pub fn async_write(
        &self,
        server_handles: &[ItemHandle],
        values: &[Value],
        transaction_id: u32,
    ) -> OpcResult<AsyncRequest> {
        crate::traits::ensure_same_len(server_handles.len(), values.len(), "server handles and values")?;
        if server_handles.is_empty() {
            return Ok(AsyncRequest {
                cancel_id: 0,
                items: Vec::new(),
            });
        }
        self.inner.ensure_subscribed()?;
        let raw = raw_handles(server_handles);
        let encoded = encode_all(values)?;
        let (cancel_id, errors) = self
            .inner
            .with(|itf| AsyncIo2Trait::write(itf, &raw, as_raw_slice(&encoded), transaction_id))?;
        Ok(AsyncRequest {
            cancel_id,
            items: item_statuses(&errors, raw.len()),
        })
    }

    /// Asks for every active item as a [`DataChangeEvent`] carrying
    /// `transaction_id`.
    pub fn async_refresh(&self, source: DataSource, transaction_id: u32) -> OpcResult<u32> {
        self.inner.ensure_subscribed()?;
        self.inner.with(|itf| itf.refresh2(source, transaction_id))
    }

    /// Requests cancellation of an outstanding transaction. A matching
    /// [`CancelCompleteEvent`] may or may not follow.
    pub fn async_cancel(&self, cancel_id: u32) -> OpcResult<()> {
        self.inner.with(|itf| itf.cancel2(cancel_id))
    }

    pub fn set_enable(&self, enable: bool) -> OpcResult<()> {
        self.inner.with(|itf| itf.set_enable(enable))
    }

    pub fn is_enabled(&self) -> OpcResult<bool> {
        self.inner.with(|itf| itf.get_enable())
    }

    // ── Subscriptions ───────────────────────────────────────────────

    /// Receives data changes. The first subscription of any kind advises
    /// the group's data callback.
    pub fn subscribe_data_change(&self) -> OpcResult<mpsc::Receiver<DataChangeEvent>> {
        self.inner.ensure_subscribed()?;
        Ok(self
            .inner
            .subscribers
            .data_change
            .subscribe(self.inner.config.subscriber_capacity))
    }

    pub fn subscribe_read_complete(&self) -> OpcResult<mpsc::Receiver<ReadCompleteEvent>> {
        self.inner.ensure_subscribed()?;
        Ok(self
            .inner
            .subscribers
            .read_complete
            .subscribe(self.inner.config.subscriber_capacity))
    }

    pub fn subscribe_write_complete(&self) -> OpcResult<mpsc::Receiver<WriteCompleteEvent>> {
        self.inner.ensure_subscribed()?;
        Ok(self
            .inner
            .subscribers
            .write_complete
            .subscribe(self.inner.config.subscriber_capacity))
    }

    pub fn subscribe_cancel_complete(&self) -> OpcResult<mpsc::Receiver<CancelCompleteEvent>> {
        self.inner.ensure_subscribed()?;
        Ok(self
            .inner
            .subscribers
            .cancel_complete
            .subscribe(self.inner.config.subscriber_capacity))
    }

    /// Unadvises the data callback, stops the dispatcher and closes every
    /// subscriber queue.
    pub fn unsubscribe_all(&self) -> OpcResult<()> {
        let result = self.inner.cancel_subscription();
        self.inner.subscribers.clear();
        result
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner
            .subscription
            .lock()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    /// Events lost so far to full intake or subscriber queues.
    pub fn drop_counters(&self) -> DropCounters {
        DropCounters {
            intake: self.inner.intake_dropped.load(Ordering::Relaxed),
            subscriber: self.inner.subscribers.dropped(),
        }
    }

    /// Tears down the subscription, releases the group's interfaces and
    /// removes it from the server.
    ///
    /// # Errors
    /// `InvalidState` on a second release (and a debug assertion in debug
    /// builds); otherwise the first unadvise or `RemoveGroup` failure.
    pub fn release(&self) -> OpcResult<()> {
        self.inner.release()
    }
}

fn log_item_failures<T>(operation: &str, handles: &[ItemHandle], results: &[Result<T, ItemError>]) {
    for (handle, result) in handles.iter().zip(results) {
        if let Err(e) = result {
            warn!(operation, server_handle = %handle, code = %e.code(), error = ?e, "item failed");
        }
    }
}
