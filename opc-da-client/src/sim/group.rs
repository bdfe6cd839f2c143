//! Group-level objects and callback delivery.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use super::connection::group_container;
use super::state::{Sample, SimItem, is_convertible, revise_update_rate};
use super::{SimGroup, SimState, Tracker, batch_status, call, lock, object, out_object, out_string, out_vec, sim_object};
use crate::callback::borrowed;
use crate::com::memory::wide_ptr_to_string;
use crate::com::object::{ComBox, unknown_vtbl};
use crate::com::vtables::{
    IConnectionPointContainer, IOPCAsyncIO2, IOPCAsyncIO2Vtbl, IOPCDataCallback,
    IOPCGroupStateMgt, IOPCGroupStateMgtVtbl, IOPCItemMgt, IOPCItemMgtVtbl, IOPCSyncIO,
    IOPCSyncIOVtbl,
};
use crate::com::{Guid, Handle, Interface, StatusCode};
use crate::records::{DataSource, OpcItemDef, OpcItemResult, OpcItemState, Quality};
use crate::variant::{FileTime, OwnedVariant, VarType, Variant, as_raw_slice, decode, encode};

/// Quality of cache reads on inactive groups or items.
const OUT_OF_SERVICE: Quality = Quality(0x1C);

/// Answers a capability query against any object of `group`.
pub(crate) fn facet(state: &Arc<SimState>, group: &Arc<SimGroup>, iid: &Guid) -> Option<NonNull<c_void>> {
    if state.is_refused(iid) {
        return None;
    }
    let parts = || GroupParts {
        tracker: Tracker::group(state, group),
        group: Arc::clone(group),
    };
    let raw = if *iid == IOPCGroupStateMgt::IID {
        ComBox::create_raw(StateFacet(parts()))
    } else if *iid == IOPCSyncIO::IID {
        ComBox::create_raw(SyncIoFacet(parts()))
    } else if *iid == IOPCAsyncIO2::IID {
        ComBox::create_raw(AsyncIoFacet(parts()))
    } else if *iid == IOPCItemMgt::IID {
        ComBox::create_raw(ItemMgtFacet(parts()))
    } else if *iid == IConnectionPointContainer::IID {
        group_container(state, group)
    } else {
        return None;
    };
    Some(raw)
}

/// What every group object carries.
struct GroupParts {
    tracker: Tracker,
    group: Arc<SimGroup>,
}

impl GroupParts {
    fn state(&self) -> &Arc<SimState> {
        self.tracker.state()
    }
}

macro_rules! group_facets {
    ($($ty:ident: $itf:ident => $vtable:ident;)*) => {
        $(
            struct $ty(GroupParts);

            impl std::ops::Deref for $ty {
                type Target = GroupParts;

                fn deref(&self) -> &GroupParts {
                    &self.0
                }
            }

            impl $ty {
                fn facet(&self, iid: &Guid) -> Option<NonNull<c_void>> {
                    facet(self.state(), &self.group, iid)
                }
            }

            sim_object!($ty: $itf => $vtable);
        )*
    };
}

group_facets! {
    StateFacet: IOPCGroupStateMgt => STATE_VTBL;
    SyncIoFacet: IOPCSyncIO => SYNC_VTBL;
    AsyncIoFacet: IOPCAsyncIO2 => ASYNC_VTBL;
    ItemMgtFacet: IOPCItemMgt => ITEM_MGT_VTBL;
}

/// A group item as seen by one request.
#[derive(Clone)]
struct ItemRef {
    client_handle: u32,
    item_id: String,
    requested_type: VarType,
    active: bool,
}

impl From<&SimItem> for ItemRef {
    fn from(item: &SimItem) -> Self {
        Self {
            client_handle: item.client_handle,
            item_id: item.item_id.clone(),
            requested_type: item.requested_type,
            active: item.active,
        }
    }
}

fn lookup(group: &SimGroup, handles: &[u32]) -> Vec<Result<ItemRef, StatusCode>> {
    let data = lock(&group.data);
    handles
        .iter()
        .map(|h| {
            data.items
                .get(h)
                .map(ItemRef::from)
                .ok_or(StatusCode::OPC_E_INVALIDHANDLE)
        })
        .collect()
}

/// Reads a wide input string.
///
/// # Safety
/// `ptr` must be null or a terminated wide string.
unsafe fn wide(ptr: *const u16) -> String {
    // SAFETY: forwarded contract.
    unsafe { wide_ptr_to_string(ptr) }
}

/// Writes per-item statuses and returns the batch status.
///
/// # Safety
/// `errors` must be null or writable.
unsafe fn finish(codes: Vec<StatusCode>, errors: *mut *mut StatusCode) -> StatusCode {
    let status = batch_status(&codes);
    // SAFETY: forwarded contract.
    let written = unsafe { out_vec(codes, errors) };
    if written.is_err() { written } else { status }
}

// ── Callback payloads ───────────────────────────────────────────────

#[derive(Default)]
struct DataBatch {
    client_items: Vec<u32>,
    values: Vec<OwnedVariant>,
    qualities: Vec<u16>,
    timestamps: Vec<FileTime>,
    errors: Vec<StatusCode>,
}

impl DataBatch {
    fn sample(state: &SimState, items: &[ItemRef], source: DataSource) -> Self {
        let mut batch = Self::default();
        for item in items {
            let sample = state.sample(&item.item_id, source, item.requested_type);
            batch.push(item.client_handle, sample);
        }
        batch
    }

    fn push(&mut self, client_handle: u32, sample: Result<Sample, StatusCode>) {
        let encoded = sample.and_then(|s| {
            encode(&s.value)
                .map(|variant| (variant, s.quality, s.timestamp))
                .map_err(|_| StatusCode::E_FAIL)
        });
        self.client_items.push(client_handle);
        match encoded {
            Ok((variant, quality, timestamp)) => {
                self.values.push(variant);
                self.qualities.push(quality.0);
                self.timestamps.push(timestamp);
                self.errors.push(StatusCode::S_OK);
            }
            Err(code) => {
                self.values.push(OwnedVariant::empty());
                self.qualities.push(Quality::BAD.0);
                self.timestamps.push(FileTime::default());
                self.errors.push(code);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.client_items.is_empty()
    }

    fn count(&self) -> u32 {
        u32::try_from(self.client_items.len()).unwrap_or(u32::MAX)
    }

    fn master_quality(&self) -> StatusCode {
        if self.qualities.iter().all(|q| Quality(*q).is_good()) {
            StatusCode::S_OK
        } else {
            StatusCode::S_FALSE
        }
    }

    fn send_data_change(&self, sink: &Handle<IOPCDataCallback>, transaction_id: u32, group: u32) {
        // SAFETY: every array holds `count` elements and outlives the call.
        let status = unsafe {
            (sink.vtable().on_data_change)(
                sink.as_raw(),
                transaction_id,
                group,
                self.master_quality(),
                batch_status(&self.errors),
                self.count(),
                self.client_items.as_ptr(),
                as_raw_slice(&self.values).as_ptr(),
                self.qualities.as_ptr(),
                self.timestamps.as_ptr(),
                self.errors.as_ptr(),
            )
        };
        log_sink_status(status, "OnDataChange");
    }

    fn send_read_complete(&self, sink: &Handle<IOPCDataCallback>, transaction_id: u32, group: u32) {
        // SAFETY: as in `send_data_change`.
        let status = unsafe {
            (sink.vtable().on_read_complete)(
                sink.as_raw(),
                transaction_id,
                group,
                self.master_quality(),
                batch_status(&self.errors),
                self.count(),
                self.client_items.as_ptr(),
                as_raw_slice(&self.values).as_ptr(),
                self.qualities.as_ptr(),
                self.timestamps.as_ptr(),
                self.errors.as_ptr(),
            )
        };
        log_sink_status(status, "OnReadComplete");
    }
}

fn send_write_complete(
    sink: &Handle<IOPCDataCallback>,
    transaction_id: u32,
    group: u32,
    client_items: &[u32],
    errors: &[StatusCode],
) {
    let count = u32::try_from(client_items.len()).unwrap_or(u32::MAX);
    // SAFETY: both arrays hold `count` elements and outlive the call.
    let status = unsafe {
        (sink.vtable().on_write_complete)(
            sink.as_raw(),
            transaction_id,
            group,
            batch_status(errors),
            count,
            client_items.as_ptr(),
            errors.as_ptr(),
        )
    };
    log_sink_status(status, "OnWriteComplete");
}

fn send_cancel_complete(sink: &Handle<IOPCDataCallback>, transaction_id: u32, group: u32) {
    // SAFETY: plain call on an advised sink.
    let status = unsafe { (sink.vtable().on_cancel_complete)(sink.as_raw(), transaction_id, group) };
    log_sink_status(status, "OnCancelComplete");
}

fn log_sink_status(status: StatusCode, what: &str) {
    if status.is_err() {
        tracing::debug!(%status, callback = what, "sink returned failure");
    }
}

/// Sends a data change for the active items of every active, enabled group.
pub(crate) fn publish_updates(state: &SimState) -> usize {
    let mut calls = 0;
    for group in state.group_snapshot() {
        let (items, client_group) = {
            let data = lock(&group.data);
            if !data.active || !data.enabled {
                continue;
            }
            let items: Vec<ItemRef> = data
                .items
                .values()
                .filter(|i| i.active)
                .map(ItemRef::from)
                .collect();
            (items, data.client_handle)
        };
        let sinks = group.sinks.snapshot();
        if items.is_empty() || sinks.is_empty() {
            continue;
        }
        let batch = DataBatch::sample(state, &items, DataSource::Cache);
        for sink in &sinks {
            batch.send_data_change(sink, 0, client_group);
            calls += 1;
        }
    }
    calls
}

type Completion = Box<dyn FnOnce(&SimState, u32, &[Handle<IOPCDataCallback>]) + Send>;

/// Runs `job` on a separate thread after the configured delay, or sends a
/// cancel completion if the request was cancelled in between.
fn schedule(
    state: &Arc<SimState>,
    group: &Arc<SimGroup>,
    transaction_id: u32,
    job: Completion,
) -> Result<u32, StatusCode> {
    let cancel_id = state.next_cancel_id();
    lock(&group.pending).insert(cancel_id);
    let delay: Duration = state.async_delay();
    let worker_state = Arc::clone(state);
    let worker_group = Arc::clone(group);
    let spawned = std::thread::Builder::new()
        .name("sim-async".into())
        .spawn(move || {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            let still_pending = lock(&worker_group.pending).remove(&cancel_id);
            let sinks = worker_group.sinks.snapshot();
            let client_group = worker_group.client_handle();
            if still_pending {
                job(&worker_state, client_group, sinks.as_slice());
            } else {
                for sink in &sinks {
                    send_cancel_complete(sink, transaction_id, client_group);
                }
            }
        });
    if spawned.is_err() {
        lock(&group.pending).remove(&cancel_id);
        return Err(StatusCode::E_OUTOFMEMORY);
    }
    Ok(cancel_id)
}

// ── IOPCGroupStateMgt ───────────────────────────────────────────────

static STATE_VTBL: IOPCGroupStateMgtVtbl = IOPCGroupStateMgtVtbl {
    base: unknown_vtbl::<StateFacet>(),
    get_state,
    set_state,
    set_name,
    clone_group,
};

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn get_state(
    this: *mut c_void,
    update_rate: *mut u32,
    active: *mut i32,
    name: *mut *mut u16,
    time_bias: *mut i32,
    percent_deadband: *mut f32,
    locale_id: *mut u32,
    client_group: *mut u32,
    server_group: *mut u32,
) -> StatusCode {
    call(|| {
        if update_rate.is_null()
            || active.is_null()
            || time_bias.is_null()
            || percent_deadband.is_null()
            || locale_id.is_null()
            || client_group.is_null()
            || server_group.is_null()
        {
            return StatusCode::E_POINTER;
        }
        // SAFETY: `this` is a `ComBox<StateFacet>`.
        let facet = unsafe { object::<StateFacet>(this) };
        let data = lock(&facet.group.data);
        // SAFETY: every output slot was checked non-null; `name` is checked
        // by `out_string`.
        unsafe {
            *update_rate = data.update_rate;
            *active = i32::from(data.active);
            *time_bias = data.time_bias;
            *percent_deadband = data.deadband;
            *locale_id = data.locale_id;
            *client_group = data.client_handle;
            *server_group = facet.group.server_handle;
            out_string(&data.name, name)
        }
    })
}

unsafe extern "system" fn set_state(
    this: *mut c_void,
    requested_update_rate: *const u32,
    revised_update_rate: *mut u32,
    active: *const i32,
    time_bias: *const i32,
    percent_deadband: *const f32,
    locale_id: *const u32,
    client_group: *const u32,
) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<StateFacet>`; every input is null or readable.
        let (facet, rate, active, time_bias, deadband, locale_id, client_group) = unsafe {
            (
                object::<StateFacet>(this),
                requested_update_rate.as_ref().copied(),
                active.as_ref().copied(),
                time_bias.as_ref().copied(),
                percent_deadband.as_ref().copied(),
                locale_id.as_ref().copied(),
                client_group.as_ref().copied(),
            )
        };
        if deadband.is_some_and(|d| !(0.0..=100.0).contains(&d)) {
            return StatusCode::E_INVALIDARG;
        }
        let mut data = lock(&facet.group.data);
        let mut status = StatusCode::S_OK;
        if let Some(rate) = rate {
            let revised = revise_update_rate(rate);
            if revised != rate {
                status = StatusCode::OPC_S_UNSUPPORTEDRATE;
            }
            data.update_rate = revised;
        }
        if let Some(active) = active {
            data.active = active != 0;
        }
        if let Some(bias) = time_bias {
            data.time_bias = bias;
        }
        if let Some(deadband) = deadband {
            data.deadband = deadband;
        }
        if let Some(locale) = locale_id {
            data.locale_id = locale;
        }
        if let Some(client) = client_group {
            data.client_handle = client;
        }
        if !revised_update_rate.is_null() {
            // SAFETY: checked non-null.
            unsafe { *revised_update_rate = data.update_rate };
        }
        status
    })
}

unsafe extern "system" fn set_name(this: *mut c_void, name: *const u16) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<StateFacet>`; `name` is null or terminated.
        let (facet, name) = unsafe { (object::<StateFacet>(this), wide(name)) };
        if name.is_empty() {
            return StatusCode::E_INVALIDARG;
        }
        if facet.state().is_name_taken(&name, facet.group.server_handle) {
            return StatusCode::OPC_E_DUPLICATENAME;
        }
        lock(&facet.group.data).name = name;
        StatusCode::S_OK
    })
}

unsafe extern "system" fn clone_group(
    _this: *mut c_void,
    _name: *const u16,
    _riid: *const Guid,
    out: *mut *mut c_void,
) -> StatusCode {
    // SAFETY: `out` is null or writable.
    unsafe { out_object(None, out) };
    StatusCode::E_NOTIMPL
}

// ── IOPCItemMgt ─────────────────────────────────────────────────────

static ITEM_MGT_VTBL: IOPCItemMgtVtbl = IOPCItemMgtVtbl {
    base: unknown_vtbl::<ItemMgtFacet>(),
    add_items,
    validate_items,
    remove_items,
    set_active_state,
    set_client_handles,
    set_datatypes,
    create_enumerator,
};

/// Validates (and, when `add` is set, registers) item definitions.
///
/// # Safety
/// `defs` must hold `count` definitions; output slots null or writable.
unsafe fn define_items(
    facet: &ItemMgtFacet,
    count: u32,
    defs: *const OpcItemDef,
    add: bool,
    results: *mut *mut OpcItemResult,
    errors: *mut *mut StatusCode,
) -> StatusCode {
    if count == 0 {
        return StatusCode::E_INVALIDARG;
    }
    // SAFETY: forwarded contract.
    let defs = unsafe { borrowed(defs, count) };
    let state = facet.state();
    let mut out_results = Vec::with_capacity(defs.len());
    let mut codes = Vec::with_capacity(defs.len());
    for def in defs {
        // SAFETY: the definition's strings are null or terminated.
        let (item_id, access_path) = unsafe { (wide(def.item_id), wide(def.access_path)) };
        let requested_type = VarType(def.requested_type);
        match state.validate_item(&item_id, &access_path, requested_type) {
            Ok((canonical, rights)) => {
                let server_handle = if add {
                    let handle = state.next_item_handle();
                    lock(&facet.group.data).items.insert(
                        handle,
                        SimItem {
                            item_id,
                            client_handle: def.client_handle,
                            active: def.active != 0,
                            requested_type,
                        },
                    );
                    handle
                } else {
                    0
                };
                out_results.push(OpcItemResult {
                    server_handle,
                    canonical_type: canonical.0,
                    access_rights: rights.0,
                    ..OpcItemResult::default()
                });
                codes.push(StatusCode::S_OK);
            }
            Err(code) => {
                out_results.push(OpcItemResult::default());
                codes.push(code);
            }
        }
    }
    // SAFETY: forwarded contract.
    unsafe {
        let written = out_vec(out_results, results);
        if written.is_err() {
            return written;
        }
        finish(codes, errors)
    }
}

unsafe extern "system" fn add_items(
    this: *mut c_void,
    count: u32,
    defs: *const OpcItemDef,
    results: *mut *mut OpcItemResult,
    errors: *mut *mut StatusCode,
) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<ItemMgtFacet>`; the rest is forwarded.
        unsafe { define_items(object::<ItemMgtFacet>(this), count, defs, true, results, errors) }
    })
}

unsafe extern "system" fn validate_items(
    this: *mut c_void,
    count: u32,
    defs: *const OpcItemDef,
    _blob_update: i32,
    results: *mut *mut OpcItemResult,
    errors: *mut *mut StatusCode,
) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<ItemMgtFacet>`; the rest is forwarded.
        unsafe { define_items(object::<ItemMgtFacet>(this), count, defs, false, results, errors) }
    })
}

/// Applies `f` to each addressed item.
///
/// # Safety
/// `handles` must hold `count` elements; `errors` null or writable.
unsafe fn per_item(
    this: *mut c_void,
    count: u32,
    handles: *const u32,
    errors: *mut *mut StatusCode,
    mut f: impl FnMut(&mut std::collections::BTreeMap<u32, SimItem>, usize, u32) -> StatusCode,
) -> StatusCode {
    if count == 0 {
        return StatusCode::E_INVALIDARG;
    }
    // SAFETY: forwarded contract.
    let (facet, handles) = unsafe { (object::<ItemMgtFacet>(this), borrowed(handles, count)) };
    let codes: Vec<StatusCode> = {
        let mut data = lock(&facet.group.data);
        handles
            .iter()
            .enumerate()
            .map(|(index, handle)| f(&mut data.items, index, *handle))
            .collect()
    };
    // SAFETY: forwarded contract.
    unsafe { finish(codes, errors) }
}

unsafe extern "system" fn remove_items(
    this: *mut c_void,
    count: u32,
    server_handles: *const u32,
    errors: *mut *mut StatusCode,
) -> StatusCode {
    call(|| {
        // SAFETY: forwarded contract.
        unsafe {
            per_item(this, count, server_handles, errors, |items, _, handle| {
                match items.remove(&handle) {
                    Some(_) => StatusCode::S_OK,
                    None => StatusCode::OPC_E_INVALIDHANDLE,
                }
            })
        }
    })
}

unsafe extern "system" fn set_active_state(
    this: *mut c_void,
    count: u32,
    server_handles: *const u32,
    active: i32,
    errors: *mut *mut StatusCode,
) -> StatusCode {
    call(|| {
        // SAFETY: forwarded contract.
        unsafe {
            per_item(this, count, server_handles, errors, |items, _, handle| {
                match items.get_mut(&handle) {
                    Some(item) => {
                        item.active = active != 0;
                        StatusCode::S_OK
                    }
                    None => StatusCode::OPC_E_INVALIDHANDLE,
                }
            })
        }
    })
}

unsafe extern "system" fn set_client_handles(
    this: *mut c_void,
    count: u32,
    server_handles: *const u32,
    client_handles: *const u32,
    errors: *mut *mut StatusCode,
) -> StatusCode {
    call(|| {
        // SAFETY: both arrays hold `count` elements.
        let clients = unsafe { borrowed(client_handles, count) };
        if clients.len() != count as usize {
            return StatusCode::E_INVALIDARG;
        }
        // SAFETY: forwarded contract.
        unsafe {
            per_item(this, count, server_handles, errors, |items, index, handle| {
                match items.get_mut(&handle) {
                    Some(item) => {
                        item.client_handle = clients[index];
                        StatusCode::S_OK
                    }
                    None => StatusCode::OPC_E_INVALIDHANDLE,
                }
            })
        }
    })
}

unsafe extern "system" fn set_datatypes(
    this: *mut c_void,
    count: u32,
    server_handles: *const u32,
    requested_types: *const u16,
    errors: *mut *mut StatusCode,
) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<ItemMgtFacet>`; the types array holds
        // `count` elements.
        let (facet, types) = unsafe { (object::<ItemMgtFacet>(this), borrowed(requested_types, count)) };
        if types.len() != count as usize {
            return StatusCode::E_INVALIDARG;
        }
        let state = Arc::clone(facet.state());
        // SAFETY: forwarded contract.
        unsafe {
            per_item(this, count, server_handles, errors, |items, index, handle| {
                let Some(item) = items.get_mut(&handle) else {
                    return StatusCode::OPC_E_INVALIDHANDLE;
                };
                let requested = VarType(types[index]);
                let canonical = state
                    .tag(&item.item_id)
                    .map_or(VarType::EMPTY, |t| t.canonical_type());
                if !is_convertible(canonical, requested) {
                    return StatusCode::OPC_E_BADTYPE;
                }
                item.requested_type = requested;
                StatusCode::S_OK
            })
        }
    })
}

unsafe extern "system" fn create_enumerator(
    _this: *mut c_void,
    _riid: *const Guid,
    out: *mut *mut c_void,
) -> StatusCode {
    // SAFETY: `out` is null or writable.
    unsafe { out_object(None, out) };
    StatusCode::E_NOTIMPL
}

// ── IOPCSyncIO ──────────────────────────────────────────────────────

static SYNC_VTBL: IOPCSyncIOVtbl = IOPCSyncIOVtbl {
    base: unknown_vtbl::<SyncIoFacet>(),
    read: sync_read,
    write: sync_write,
};

fn data_source(raw: u32) -> Option<DataSource> {
    match raw {
        1 => Some(DataSource::Cache),
        2 => Some(DataSource::Device),
        _ => None,
    }
}

unsafe extern "system" fn sync_read(
    this: *mut c_void,
    source: u32,
    count: u32,
    server_handles: *const u32,
    states: *mut *mut OpcItemState,
    errors: *mut *mut StatusCode,
) -> StatusCode {
    call(|| {
        let Some(source) = data_source(source) else {
            return StatusCode::E_INVALIDARG;
        };
        if count == 0 {
            return StatusCode::E_INVALIDARG;
        }
        // SAFETY: `this` is a `ComBox<SyncIoFacet>`; the handle array holds
        // `count` elements.
        let (facet, handles) = unsafe { (object::<SyncIoFacet>(this), borrowed(server_handles, count)) };
        let group_active = lock(&facet.group.data).active;
        let mut out_states = Vec::with_capacity(handles.len());
        let mut codes = Vec::with_capacity(handles.len());
        for item in lookup(&facet.group, handles) {
            let client_handle = item.as_ref().map_or(0, |i| i.client_handle);
            let sample = item.and_then(|i| {
                let mut sample = facet.state().sample(&i.item_id, source, i.requested_type)?;
                if source == DataSource::Cache && !(group_active && i.active) {
                    sample.quality = OUT_OF_SERVICE;
                }
                encode(&sample.value)
                    .map(|variant| (variant, sample))
                    .map_err(|_| StatusCode::E_FAIL)
            });
            match sample {
                Ok((variant, sample)) => {
                    out_states.push(OpcItemState {
                        client_handle,
                        timestamp: sample.timestamp,
                        quality: sample.quality.0,
                        reserved: 0,
                        value: variant.into_raw(),
                    });
                    codes.push(StatusCode::S_OK);
                }
                Err(code) => {
                    out_states.push(OpcItemState {
                        client_handle,
                        timestamp: FileTime::default(),
                        quality: Quality::BAD.0,
                        reserved: 0,
                        value: Variant::default(),
                    });
                    codes.push(code);
                }
            }
        }
        // SAFETY: output slots are null or writable.
        unsafe {
            let written = out_vec(out_states, states);
            if written.is_err() {
                return written;
            }
            finish(codes, errors)
        }
    })
}

fn write_one(state: &SimState, item: Result<ItemRef, StatusCode>, value: &Variant) -> StatusCode {
    let written = item.and_then(|item| {
        let value = decode(value).map_err(|_| StatusCode::OPC_E_BADTYPE)?;
        state.write(&item.item_id, &value)
    });
    match written {
        Ok(()) => StatusCode::S_OK,
        Err(code) => code,
    }
}

unsafe extern "system" fn sync_write(
    this: *mut c_void,
    count: u32,
    server_handles: *const u32,
    values: *const Variant,
    errors: *mut *mut StatusCode,
) -> StatusCode {
    call(|| {
        if count == 0 {
            return StatusCode::E_INVALIDARG;
        }
        // SAFETY: `this` is a `ComBox<SyncIoFacet>`; both arrays hold
        // `count` elements.
        let (facet, handles, values) = unsafe {
            (
                object::<SyncIoFacet>(this),
                borrowed(server_handles, count),
                borrowed(values, count),
            )
        };
        if values.len() != handles.len() {
            return StatusCode::E_INVALIDARG;
        }
        let codes: Vec<StatusCode> = lookup(&facet.group, handles)
            .into_iter()
            .zip(values)
            .map(|(item, value)| write_one(facet.state(), item, value))
            .collect();
        // SAFETY: `errors` is null or writable.
        unsafe { finish(codes, errors) }
    })
}

// ── IOPCAsyncIO2 ────────────────────────────────────────────────────

static ASYNC_VTBL: IOPCAsyncIO2Vtbl = IOPCAsyncIO2Vtbl {
    base: unknown_vtbl::<AsyncIoFacet>(),
    read: async_read,
    write: async_write,
    refresh2,
    cancel2,
    set_enable,
    get_enable,
};

/// Splits addressed items into immediate statuses and the valid ones.
fn triage(group: &SimGroup, handles: &[u32]) -> (Vec<StatusCode>, Vec<(usize, ItemRef)>) {
    let mut codes = Vec::with_capacity(handles.len());
    let mut valid = Vec::new();
    for (index, item) in lookup(group, handles).into_iter().enumerate() {
        match item {
            Ok(item) => {
                codes.push(StatusCode::S_OK);
                valid.push((index, item));
            }
            Err(code) => codes.push(code),
        }
    }
    (codes, valid)
}

unsafe extern "system" fn async_read(
    this: *mut c_void,
    count: u32,
    server_handles: *const u32,
    transaction_id: u32,
    cancel_id: *mut u32,
    errors: *mut *mut StatusCode,
) -> StatusCode {
    call(|| {
        if count == 0 || cancel_id.is_null() {
            return StatusCode::E_INVALIDARG;
        }
        // SAFETY: `this` is a `ComBox<AsyncIoFacet>`; the handle array holds
        // `count` elements.
        let (facet, handles) = unsafe { (object::<AsyncIoFacet>(this), borrowed(server_handles, count)) };
        if facet.group.sinks.is_empty() {
            return StatusCode::CONNECT_E_NOCONNECTION;
        }
        let (codes, valid) = triage(&facet.group, handles);
        if !valid.is_empty() {
            let items: Vec<ItemRef> = valid.into_iter().map(|(_, item)| item).collect();
            let job: Completion = Box::new(move |state: &SimState, client_group: u32, sinks: &[Handle<IOPCDataCallback>]| {
                let batch = DataBatch::sample(state, &items, DataSource::Device);
                for sink in sinks {
                    batch.send_read_complete(sink, transaction_id, client_group);
                }
            });
            match schedule(facet.state(), &facet.group, transaction_id, job) {
                // SAFETY: `cancel_id` was checked non-null.
                Ok(id) => unsafe { *cancel_id = id },
                Err(code) => return code,
            }
        }
        // SAFETY: `errors` is null or writable.
        unsafe { finish(codes, errors) }
    })
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn async_write(
    this: *mut c_void,
    count: u32,
    server_handles: *const u32,
    values: *const Variant,
    transaction_id: u32,
    cancel_id: *mut u32,
    errors: *mut *mut StatusCode,
) -> StatusCode {
    call(|| {
        if count == 0 || cancel_id.is_null() {
            return StatusCode::E_INVALIDARG;
        }
        // SAFETY: `this` is a `ComBox<AsyncIoFacet>`; both arrays hold
        // `count` elements.
        let (facet, handles, values) = unsafe {
            (
                object::<AsyncIoFacet>(this),
                borrowed(server_handles, count),
                borrowed(values, count),
            )
        };
        if values.len() != handles.len() {
            return StatusCode::E_INVALIDARG;
        }
        if facet.group.sinks.is_empty() {
            return StatusCode::CONNECT_E_NOCONNECTION;
        }
        let (codes, valid) = triage(&facet.group, handles);
        if !valid.is_empty() {
            // Decode now: the caller's variants are only borrowed for the call.
            let work: Vec<(ItemRef, Result<crate::variant::Value, StatusCode>)> = valid
                .into_iter()
                .map(|(index, item)| {
                    let value = decode(&values[index]).map_err(|_| StatusCode::OPC_E_BADTYPE);
                    (item, value)
                })
                .collect();
            let job: Completion = Box::new(move |state: &SimState, client_group: u32, sinks: &[Handle<IOPCDataCallback>]| {
                let mut client_items = Vec::with_capacity(work.len());
                let mut results = Vec::with_capacity(work.len());
                for (item, value) in &work {
                    client_items.push(item.client_handle);
                    let outcome = value.clone().and_then(|v| state.write(&item.item_id, &v));
                    results.push(outcome.err().unwrap_or(StatusCode::S_OK));
                }
                for sink in sinks {
                    send_write_complete(sink, transaction_id, client_group, &client_items, &results);
                }
            });
            match schedule(facet.state(), &facet.group, transaction_id, job) {
                // SAFETY: `cancel_id` was checked non-null.
                Ok(id) => unsafe { *cancel_id = id },
                Err(code) => return code,
            }
        }
        // SAFETY: `errors` is null or writable.
        unsafe { finish(codes, errors) }
    })
}

unsafe extern "system" fn refresh2(
    this: *mut c_void,
    source: u32,
    transaction_id: u32,
    cancel_id: *mut u32,
) -> StatusCode {
    call(|| {
        let Some(source) = data_source(source) else {
            return StatusCode::E_INVALIDARG;
        };
        if cancel_id.is_null() {
            return StatusCode::E_INVALIDARG;
        }
        // SAFETY: `this` is a `ComBox<AsyncIoFacet>`.
        let facet = unsafe { object::<AsyncIoFacet>(this) };
        if facet.group.sinks.is_empty() {
            return StatusCode::CONNECT_E_NOCONNECTION;
        }
        let items: Vec<ItemRef> = {
            let data = lock(&facet.group.data);
            if !data.active {
                return StatusCode::E_FAIL;
            }
            data.items.values().filter(|i| i.active).map(ItemRef::from).collect()
        };
        if items.is_empty() {
            return StatusCode::E_FAIL;
        }
        let job: Completion = Box::new(move |state: &SimState, client_group: u32, sinks: &[Handle<IOPCDataCallback>]| {
            let batch = DataBatch::sample(state, &items, source);
            if batch.is_empty() {
                return;
            }
            for sink in sinks {
                batch.send_data_change(sink, transaction_id, client_group);
            }
        });
        match schedule(facet.state(), &facet.group, transaction_id, job) {
            Ok(id) => {
                // SAFETY: `cancel_id` was checked non-null.
                unsafe { *cancel_id = id };
                StatusCode::S_OK
            }
            Err(code) => code,
        }
    })
}

unsafe extern "system" fn cancel2(this: *mut c_void, cancel_id: u32) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<AsyncIoFacet>`.
        let facet = unsafe { object::<AsyncIoFacet>(this) };
        if lock(&facet.group.pending).remove(&cancel_id) {
            StatusCode::S_OK
        } else {
            StatusCode::E_FAIL
        }
    })
}

unsafe extern "system" fn set_enable(this: *mut c_void, enable: i32) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<AsyncIoFacet>`.
        let facet = unsafe { object::<AsyncIoFacet>(this) };
        if facet.group.sinks.is_empty() {
            return StatusCode::CONNECT_E_NOCONNECTION;
        }
        lock(&facet.group.data).enabled = enable != 0;
        StatusCode::S_OK
    })
}

unsafe extern "system" fn get_enable(this: *mut c_void, enable: *mut i32) -> StatusCode {
    call(|| {
        if enable.is_null() {
            return StatusCode::E_POINTER;
        }
        // SAFETY: `this` is a `ComBox<AsyncIoFacet>`; `enable` is writable.
        unsafe {
            let facet = object::<AsyncIoFacet>(this);
            if facet.group.sinks.is_empty() {
                return StatusCode::CONNECT_E_NOCONNECTION;
            }
            *enable = i32::from(lock(&facet.group.data).enabled);
        }
        StatusCode::S_OK
    })
}
