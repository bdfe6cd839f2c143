//! Server-level objects: `IOPCServer` and its sibling interfaces.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::connection::server_container;
use super::enumerators;
use super::state::{
    GroupData, LOCALE_ENGLISH, LOCALE_GERMAN, is_convertible, matches_filter, now,
    revise_update_rate,
};
use super::{
    SIM_E_DEVICE_FAULT, SimEvent, SimState, Tracker, call, lock, object, out_object, out_string,
    out_vec, sim_object,
};
use crate::com::alloc::task_alloc_wide;
use crate::com::handle::IUnknown;
use crate::com::memory::wide_ptr_to_string;
use crate::com::object::{ComBox, unknown_vtbl};
use crate::com::vtables::{
    IConnectionPointContainer, IOPCBrowseServerAddressSpace, IOPCBrowseServerAddressSpaceVtbl,
    IOPCCommon, IOPCCommonVtbl, IOPCItemProperties, IOPCItemPropertiesVtbl, IOPCServer,
    IOPCServerVtbl,
};
use crate::com::{Guid, Handle, Interface, LocalWide, StatusCode};
use crate::config::{LOCALE_SYSTEM_DEFAULT, LOCALE_USER_DEFAULT};
use crate::records::{BrowseDirection, BrowseType, OpcServerStatus, ServerState};
use crate::variant::{ArrayValue, OwnedVariant, Value, VarType, encode, filetime_to_datetime};

const VENDOR_INFO: &str = "opc-da-client simulator";
const AVAILABLE_LOCALES: [u32; 2] = [LOCALE_ENGLISH, LOCALE_GERMAN];

/// Activates a new server object.
pub(crate) fn create(state: &Arc<SimState>) -> Handle<IUnknown> {
    let raw = ComBox::create_raw(ServerObject {
        tracker: Tracker::server(state),
    });
    // SAFETY: a fresh object with one reference, laid out behind an
    // `IUnknown`-compatible table.
    unsafe { Handle::from_non_null(raw) }
}

/// Answers a capability query against any server-level object.
pub(crate) fn facet(state: &Arc<SimState>, iid: &Guid) -> Option<NonNull<c_void>> {
    if state.is_refused(iid) {
        return None;
    }
    let tracker = || Tracker::server(state);
    let raw = if *iid == IOPCServer::IID {
        ComBox::create_raw(ServerObject { tracker: tracker() })
    } else if *iid == IOPCCommon::IID {
        ComBox::create_raw(CommonFacet { tracker: tracker() })
    } else if *iid == IOPCBrowseServerAddressSpace::IID {
        ComBox::create_raw(BrowseFacet { tracker: tracker() })
    } else if *iid == IOPCItemProperties::IID {
        ComBox::create_raw(PropertiesFacet { tracker: tracker() })
    } else if *iid == IConnectionPointContainer::IID {
        server_container(state)
    } else {
        return None;
    };
    Some(raw)
}

/// Calls `ShutdownRequest` on every advised sink.
pub(crate) fn request_shutdown(state: &SimState, reason: &str) -> usize {
    let sinks = state.shutdown_sinks.snapshot();
    let reason = LocalWide::new(reason);
    for sink in &sinks {
        // SAFETY: the sink is a live advised `IOPCShutdown`; `reason`
        // outlives the call.
        let status = unsafe { (sink.vtable().shutdown_request)(sink.as_raw(), reason.as_ptr()) };
        if status.is_err() {
            tracing::debug!(%status, "shutdown sink refused the notice");
        }
    }
    sinks.len()
}

fn error_text(code: StatusCode) -> Option<String> {
    if code == SIM_E_DEVICE_FAULT {
        return Some("Simulated device fault".into());
    }
    code.describe().map(str::to_string)
}

/// Reads an input string.
///
/// # Safety
/// `ptr` must be null or a terminated wide string.
unsafe fn wide(ptr: *const u16) -> String {
    // SAFETY: forwarded contract.
    unsafe { wide_ptr_to_string(ptr) }
}

// ── IOPCServer ──────────────────────────────────────────────────────

struct ServerObject {
    tracker: Tracker,
}

impl ServerObject {
    fn facet(&self, iid: &Guid) -> Option<NonNull<c_void>> {
        facet(self.tracker.state(), iid)
    }
}

static SERVER_VTBL: IOPCServerVtbl = IOPCServerVtbl {
    base: unknown_vtbl::<ServerObject>(),
    add_group,
    get_error_string,
    get_group_by_name,
    get_status,
    remove_group,
    create_group_enumerator,
};

sim_object!(ServerObject: IOPCServer => SERVER_VTBL);

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn add_group(
    this: *mut c_void,
    name: *const u16,
    active: i32,
    requested_update_rate: u32,
    client_group: u32,
    time_bias: *const i32,
    percent_deadband: *const f32,
    locale_id: u32,
    server_group: *mut u32,
    revised_update_rate: *mut u32,
    riid: *const Guid,
    group: *mut *mut c_void,
) -> StatusCode {
    call(|| {
        if server_group.is_null() || revised_update_rate.is_null() || riid.is_null() || group.is_null() {
            return StatusCode::E_POINTER;
        }
        // SAFETY: `this` is a `ComBox<ServerObject>`; the optional inputs
        // are null or readable and `riid` was checked above.
        let (server, name, time_bias, deadband, riid) = unsafe {
            (
                object::<ServerObject>(this),
                wide(name),
                time_bias.as_ref().copied().unwrap_or(0),
                percent_deadband.as_ref().copied().unwrap_or(0.0),
                *riid,
            )
        };
        if !(0.0..=100.0).contains(&deadband) {
            return StatusCode::E_INVALIDARG;
        }
        let state = server.tracker.state();
        let revised = revise_update_rate(requested_update_rate);
        let created = state.add_group(GroupData {
            name,
            active: active != 0,
            update_rate: revised,
            time_bias,
            deadband,
            locale_id,
            client_handle: client_group,
            enabled: true,
            items: Default::default(),
        });
        let sim_group = match created {
            Ok(g) => g,
            Err(code) => return code,
        };
        let Some(itf) = super::group::facet(state, &sim_group, &riid) else {
            state.remove_group(sim_group.server_handle);
            // SAFETY: `group` was checked non-null.
            unsafe { *group = std::ptr::null_mut() };
            return StatusCode::E_NOINTERFACE;
        };
        // SAFETY: the output slots were checked non-null.
        unsafe {
            *server_group = sim_group.server_handle;
            *revised_update_rate = revised;
            *group = itf.as_ptr();
        }
        if revised == requested_update_rate {
            StatusCode::S_OK
        } else {
            StatusCode::OPC_S_UNSUPPORTEDRATE
        }
    })
}

unsafe extern "system" fn get_error_string(
    _this: *mut c_void,
    error: StatusCode,
    _locale_id: u32,
    out: *mut *mut u16,
) -> StatusCode {
    call(|| match error_text(error) {
        // SAFETY: `out` is null or writable.
        Some(text) => unsafe { out_string(&text, out) },
        None => StatusCode::E_INVALIDARG,
    })
}

unsafe extern "system" fn get_group_by_name(
    this: *mut c_void,
    name: *const u16,
    riid: *const Guid,
    out: *mut *mut c_void,
) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<ServerObject>`; `riid` is null or readable.
        let (server, name, riid) = unsafe { (object::<ServerObject>(this), wide(name), riid.as_ref()) };
        let Some(riid) = riid else {
            return StatusCode::E_POINTER;
        };
        let state = server.tracker.state();
        let Some(group) = state.group_by_name(&name) else {
            // SAFETY: `out` is null or writable.
            unsafe { out_object(None, out) };
            return StatusCode::E_INVALIDARG;
        };
        // SAFETY: `out` is null or writable.
        unsafe { out_object(super::group::facet(state, &group, riid), out) }
    })
}

unsafe extern "system" fn get_status(this: *mut c_void, out: *mut *mut OpcServerStatus) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<ServerObject>`.
        let state = unsafe { object::<ServerObject>(this) }.tracker.state();
        let Ok(vendor_info) = task_alloc_wide(VENDOR_INFO) else {
            return StatusCode::E_OUTOFMEMORY;
        };
        let current = now();
        let status = OpcServerStatus {
            start_time: state.start_time,
            current_time: current,
            last_update_time: current,
            server_state: ServerState::Running.as_raw(),
            group_count: u32::try_from(lock(&state.groups).len()).unwrap_or(u32::MAX),
            band_width: u32::MAX,
            major_version: 1,
            minor_version: 0,
            build_number: 1,
            reserved: 0,
            vendor_info,
        };
        // SAFETY: `out` is null or writable.
        unsafe { out_vec(vec![status], out) }
    })
}

unsafe extern "system" fn remove_group(this: *mut c_void, server_group: u32, force: i32) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<ServerObject>`.
        let state = unsafe { object::<ServerObject>(this) }.tracker.state();
        let Some(group) = state.remove_group(server_group) else {
            return StatusCode::E_INVALIDARG;
        };
        group.sinks.clear();
        let in_use = group.facets.load(Ordering::SeqCst) > 0;
        state.log(SimEvent::GroupRemoved {
            server_handle: server_group,
            in_use,
        });
        if in_use && force == 0 {
            StatusCode::OPC_S_INUSE
        } else {
            StatusCode::S_OK
        }
    })
}

unsafe extern "system" fn create_group_enumerator(
    _this: *mut c_void,
    _scope: u32,
    _riid: *const Guid,
    out: *mut *mut c_void,
) -> StatusCode {
    // SAFETY: `out` is null or writable.
    unsafe { out_object(None, out) };
    StatusCode::E_NOTIMPL
}

// ── IOPCCommon ──────────────────────────────────────────────────────

struct CommonFacet {
    tracker: Tracker,
}

impl CommonFacet {
    fn facet(&self, iid: &Guid) -> Option<NonNull<c_void>> {
        facet(self.tracker.state(), iid)
    }
}

static COMMON_VTBL: IOPCCommonVtbl = IOPCCommonVtbl {
    base: unknown_vtbl::<CommonFacet>(),
    set_locale_id,
    get_locale_id,
    query_available_locale_ids,
    get_error_string: common_error_string,
    set_client_name,
};

sim_object!(CommonFacet: IOPCCommon => COMMON_VTBL);

unsafe extern "system" fn set_locale_id(this: *mut c_void, locale_id: u32) -> StatusCode {
    call(|| {
        if !AVAILABLE_LOCALES.contains(&locale_id)
            && locale_id != LOCALE_SYSTEM_DEFAULT
            && locale_id != LOCALE_USER_DEFAULT
        {
            return StatusCode::E_INVALIDARG;
        }
        // SAFETY: `this` is a `ComBox<CommonFacet>`.
        let state = unsafe { object::<CommonFacet>(this) }.tracker.state();
        state.locale_id.store(locale_id, Ordering::SeqCst);
        StatusCode::S_OK
    })
}

unsafe extern "system" fn get_locale_id(this: *mut c_void, out: *mut u32) -> StatusCode {
    call(|| {
        if out.is_null() {
            return StatusCode::E_POINTER;
        }
        // SAFETY: `this` is a `ComBox<CommonFacet>`; `out` is writable.
        unsafe { *out = object::<CommonFacet>(this).tracker.state().locale_id.load(Ordering::SeqCst) };
        StatusCode::S_OK
    })
}

unsafe extern "system" fn query_available_locale_ids(
    _this: *mut c_void,
    count: *mut u32,
    out: *mut *mut u32,
) -> StatusCode {
    call(|| {
        if count.is_null() {
            return StatusCode::E_POINTER;
        }
        // SAFETY: `count` is writable; `out` is null or writable.
        unsafe {
            *count = AVAILABLE_LOCALES.len() as u32;
            out_vec(AVAILABLE_LOCALES.to_vec(), out)
        }
    })
}

unsafe extern "system" fn common_error_string(
    this: *mut c_void,
    error: StatusCode,
    out: *mut *mut u16,
) -> StatusCode {
    // SAFETY: forwarded to the server-level implementation.
    unsafe { get_error_string(this, error, LOCALE_SYSTEM_DEFAULT, out) }
}

unsafe extern "system" fn set_client_name(this: *mut c_void, name: *const u16) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<CommonFacet>`; `name` is null or terminated.
        let (facet, name) = unsafe { (object::<CommonFacet>(this), wide(name)) };
        let state = facet.tracker.state();
        *lock(&state.client_name) = Some(name.clone());
        state.log(SimEvent::ClientName(name));
        StatusCode::S_OK
    })
}

// ── IOPCBrowseServerAddressSpace ────────────────────────────────────

struct BrowseFacet {
    tracker: Tracker,
}

impl BrowseFacet {
    fn facet(&self, iid: &Guid) -> Option<NonNull<c_void>> {
        facet(self.tracker.state(), iid)
    }
}

static BROWSE_VTBL: IOPCBrowseServerAddressSpaceVtbl = IOPCBrowseServerAddressSpaceVtbl {
    base: unknown_vtbl::<BrowseFacet>(),
    query_organization,
    change_browse_position,
    browse_opc_item_ids,
    get_item_id,
    browse_access_paths,
};

sim_object!(BrowseFacet: IOPCBrowseServerAddressSpace => BROWSE_VTBL);

unsafe extern "system" fn query_organization(_this: *mut c_void, out: *mut u32) -> StatusCode {
    if out.is_null() {
        return StatusCode::E_POINTER;
    }
    // SAFETY: `out` is writable.
    unsafe { *out = 1 };
    StatusCode::S_OK
}

unsafe extern "system" fn change_browse_position(
    this: *mut c_void,
    direction: u32,
    name: *const u16,
) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<BrowseFacet>`; `name` is null or terminated.
        let (facet, name) = unsafe { (object::<BrowseFacet>(this), wide(name)) };
        let state = facet.tracker.state();
        let mut path = lock(&state.browse_path).clone();
        match direction {
            d if d == BrowseDirection::Up as u32 => {
                if path.pop().is_none() {
                    return StatusCode::E_FAIL;
                }
            }
            d if d == BrowseDirection::Down as u32 => {
                path.push(name);
                if !state.is_branch(&path) {
                    return StatusCode::E_INVALIDARG;
                }
            }
            d if d == BrowseDirection::To as u32 => {
                path = if name.is_empty() {
                    Vec::new()
                } else {
                    name.split('.').map(str::to_string).collect()
                };
                if !state.is_branch(&path) {
                    return StatusCode::E_INVALIDARG;
                }
            }
            _ => return StatusCode::E_INVALIDARG,
        }
        *lock(&state.browse_path) = path;
        StatusCode::S_OK
    })
}

unsafe extern "system" fn browse_opc_item_ids(
    this: *mut c_void,
    browse_type: u32,
    filter: *const u16,
    data_type: u16,
    access_rights: u32,
    out: *mut *mut c_void,
) -> StatusCode {
    call(|| {
        if out.is_null() {
            return StatusCode::E_POINTER;
        }
        // SAFETY: `this` is a `ComBox<BrowseFacet>`; `filter` is null or terminated.
        let (facet, filter) = unsafe { (object::<BrowseFacet>(this), wide(filter)) };
        let state = facet.tracker.state();
        let path = lock(&state.browse_path).clone();
        let data_type = VarType(data_type);
        let keep = |name: &str, tag: &super::state::SimTag| {
            matches_filter(name, &filter)
                && is_convertible(tag.canonical_type(), data_type)
                && tag.rights.0 & access_rights == access_rights
        };
        let names: Vec<String> = match browse_type {
            t if t == BrowseType::Branch as u32 => state
                .branches(&path)
                .into_iter()
                .filter(|n| matches_filter(n, &filter))
                .collect(),
            t if t == BrowseType::Leaf as u32 => state
                .leaves(&path)
                .into_iter()
                .filter(|(n, tag)| keep(n, tag))
                .map(|(n, _)| n)
                .collect(),
            t if t == BrowseType::Flat as u32 => state
                .flat(&path)
                .into_iter()
                .filter(|(n, tag)| keep(n, tag))
                .map(|(n, _)| n)
                .collect(),
            _ => return StatusCode::E_INVALIDARG,
        };
        let status = if names.is_empty() {
            StatusCode::S_FALSE
        } else {
            StatusCode::S_OK
        };
        // SAFETY: `out` was checked non-null.
        unsafe { *out = enumerators::strings(names).into_raw() };
        status
    })
}

unsafe extern "system" fn get_item_id(this: *mut c_void, data_item: *const u16, out: *mut *mut u16) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<BrowseFacet>`; `data_item` is null or terminated.
        let (facet, name) = unsafe { (object::<BrowseFacet>(this), wide(data_item)) };
        let state = facet.tracker.state();
        let mut path = lock(&state.browse_path).clone();
        if !name.is_empty() {
            path.push(name.clone());
        }
        let qualified = path.join(".");
        let item_id = if state.tag(&qualified).is_some() || state.is_branch(&path) {
            qualified
        } else if state.tag(&name).is_some() {
            name
        } else {
            return StatusCode::OPC_E_UNKNOWNITEMID;
        };
        // SAFETY: `out` is null or writable.
        unsafe { out_string(&item_id, out) }
    })
}

unsafe extern "system" fn browse_access_paths(
    this: *mut c_void,
    item_id: *const u16,
    out: *mut *mut c_void,
) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<BrowseFacet>`; `item_id` is null or terminated.
        let (facet, item_id) = unsafe { (object::<BrowseFacet>(this), wide(item_id)) };
        // SAFETY: `out` is null or writable.
        unsafe { out_object(None, out) };
        if facet.tracker.state().tag(&item_id).is_none() {
            return StatusCode::OPC_E_UNKNOWNITEMID;
        }
        StatusCode::S_FALSE
    })
}

// ── IOPCItemProperties ──────────────────────────────────────────────

struct PropertiesFacet {
    tracker: Tracker,
}

impl PropertiesFacet {
    fn facet(&self, iid: &Guid) -> Option<NonNull<c_void>> {
        facet(self.tracker.state(), iid)
    }
}

static PROPERTIES_VTBL: IOPCItemPropertiesVtbl = IOPCItemPropertiesVtbl {
    base: unknown_vtbl::<PropertiesFacet>(),
    query_available_properties,
    get_item_properties,
    lookup_item_ids,
};

sim_object!(PropertiesFacet: IOPCItemProperties => PROPERTIES_VTBL);

/// Standard properties every simulated tag carries.
const PROPERTIES: [(u32, &str, VarType); 8] = [
    (1, "Item Canonical DataType", VarType::I2),
    (2, "Item Value", VarType::VARIANT),
    (3, "Item Quality", VarType::I2),
    (4, "Item Timestamp", VarType::DATE),
    (5, "Item Access Rights", VarType::I4),
    (7, "Item EU Type", VarType::I4),
    (8, "Item EUInfo", VarType::VARIANT),
    (101, "Item Description", VarType::BSTR),
];

/// States of the `*.Status` tags, indexed by value.
const STATUS_NAMES: [&str; 3] = ["Stopped", "Running", "Faulted"];

/// Engineering units of a tag: `*.Status` tags are enumerated, floating
/// point tags are analog over 0..=100, everything else has none.
fn engineering_units(item_id: &str, tag: &super::state::SimTag) -> (i32, Value) {
    if item_id.ends_with(".Status") {
        let names = STATUS_NAMES.iter().map(|n| (*n).to_string()).collect();
        return (2, Value::Array(ArrayValue::String(names)));
    }
    match tag.value {
        Value::F32(_) | Value::F64(_) => (1, Value::Array(ArrayValue::F64(vec![0.0, 100.0]))),
        _ => (0, Value::Empty),
    }
}

#[allow(clippy::cast_possible_wrap)]
fn property_value(item_id: &str, tag: &super::state::SimTag, id: u32) -> Result<Value, StatusCode> {
    let value = match id {
        1 => Value::I16(tag.canonical_type().0 as i16),
        2 => tag.value.clone(),
        3 => Value::I16(tag.quality.0 as i16),
        4 => filetime_to_datetime(tag.timestamp).map_or(Value::Empty, Value::Date),
        5 => Value::I32(tag.rights.0 as i32),
        7 => Value::I32(engineering_units(item_id, tag).0),
        8 => engineering_units(item_id, tag).1,
        101 => Value::String(format!("Simulated tag {item_id}")),
        _ => return Err(StatusCode::OPC_E_INVALID_PID),
    };
    Ok(value)
}

unsafe extern "system" fn query_available_properties(
    this: *mut c_void,
    item_id: *const u16,
    count: *mut u32,
    property_ids: *mut *mut u32,
    descriptions: *mut *mut *mut u16,
    data_types: *mut *mut u16,
) -> StatusCode {
    call(|| {
        if count.is_null() {
            return StatusCode::E_POINTER;
        }
        // SAFETY: `this` is a `ComBox<PropertiesFacet>`; `item_id` is null or terminated.
        let (facet, item_id) = unsafe { (object::<PropertiesFacet>(this), wide(item_id)) };
        if facet.tracker.state().tag(&item_id).is_none() {
            return StatusCode::OPC_E_UNKNOWNITEMID;
        }
        let mut texts = Vec::with_capacity(PROPERTIES.len());
        for (_, text, _) in PROPERTIES {
            match task_alloc_wide(text) {
                Ok(ptr) => texts.push(ptr),
                Err(_) => return StatusCode::E_OUTOFMEMORY,
            }
        }
        // SAFETY: every output slot is null or writable.
        unsafe {
            *count = PROPERTIES.len() as u32;
            let status = out_vec(PROPERTIES.iter().map(|p| p.0).collect(), property_ids);
            if status.is_err() {
                return status;
            }
            let status = out_vec(texts, descriptions);
            if status.is_err() {
                return status;
            }
            out_vec(PROPERTIES.iter().map(|p| p.2.0).collect(), data_types)
        }
    })
}

unsafe extern "system" fn get_item_properties(
    this: *mut c_void,
    item_id: *const u16,
    count: u32,
    property_ids: *const u32,
    data: *mut *mut crate::variant::Variant,
    errors: *mut *mut StatusCode,
) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<PropertiesFacet>`; the ids array
        // holds `count` elements.
        let (facet, item_id, ids) = unsafe {
            (
                object::<PropertiesFacet>(this),
                wide(item_id),
                crate::callback::borrowed(property_ids, count),
            )
        };
        let Some(tag) = facet.tracker.state().tag(&item_id) else {
            return StatusCode::OPC_E_UNKNOWNITEMID;
        };
        let mut values = Vec::with_capacity(ids.len());
        let mut codes = Vec::with_capacity(ids.len());
        for id in ids {
            let encoded = property_value(&item_id, &tag, *id)
                .and_then(|value| encode(&value).map_err(|_| StatusCode::E_FAIL));
            match encoded {
                Ok(variant) => {
                    values.push(variant.into_raw());
                    codes.push(StatusCode::S_OK);
                }
                Err(code) => {
                    values.push(OwnedVariant::empty().into_raw());
                    codes.push(code);
                }
            }
        }
        let status = super::batch_status(&codes);
        // SAFETY: output slots are null or writable.
        unsafe {
            let written = out_vec(values, data);
            if written.is_err() {
                return written;
            }
            let written = out_vec(codes, errors);
            if written.is_err() {
                return written;
            }
        }
        status
    })
}

unsafe extern "system" fn lookup_item_ids(
    this: *mut c_void,
    item_id: *const u16,
    count: u32,
    property_ids: *const u32,
    new_item_ids: *mut *mut *mut u16,
    errors: *mut *mut StatusCode,
) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<PropertiesFacet>`; the ids array
        // holds `count` elements.
        let (facet, item_id, ids) = unsafe {
            (
                object::<PropertiesFacet>(this),
                wide(item_id),
                crate::callback::borrowed(property_ids, count),
            )
        };
        if facet.tracker.state().tag(&item_id).is_none() {
            return StatusCode::OPC_E_UNKNOWNITEMID;
        }
        // None of the standard properties maps to a separate item.
        let names = vec![std::ptr::null_mut::<u16>(); ids.len()];
        let codes = vec![StatusCode::OPC_E_INVALID_PID; ids.len()];
        // SAFETY: output slots are null or writable.
        unsafe {
            let written = out_vec(names, new_item_ids);
            if written.is_err() {
                return written;
            }
            let written = out_vec(codes, errors);
            if written.is_err() {
                return written;
            }
        }
        StatusCode::S_FALSE
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_text_knows_vendor_code() {
        assert_eq!(error_text(SIM_E_DEVICE_FAULT).as_deref(), Some("Simulated device fault"));
        assert!(error_text(StatusCode::OPC_E_UNKNOWNITEMID).is_some());
        assert!(error_text(StatusCode::from_u32(0xE004_0199)).is_none());
    }
}
