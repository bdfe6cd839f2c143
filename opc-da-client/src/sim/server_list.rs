//! The server enumerator, registering the simulator as its only class.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

use super::{
    SIM_CLSID, SIM_PROG_ID, SIM_PROG_ID_INDEPENDENT, SimState, Tracker, call, enumerators,
    out_string, sim_object,
};
use crate::com::handle::IUnknown;
use crate::com::memory::wide_ptr_to_string;
use crate::com::object::{ComBox, unknown_vtbl};
use crate::com::vtables::{
    CATID_OPC_DA10, CATID_OPC_DA20, CATID_OPC_DA30, IOPCServerList2, IOPCServerList2Vtbl,
};
use crate::callback::borrowed;
use crate::com::{Guid, Handle, StatusCode};

const USER_TYPE: &str = "OPC DA Simulator";

pub(crate) fn create(state: &Arc<SimState>) -> Handle<IUnknown> {
    let raw = ComBox::create_raw(ServerList {
        tracker: Tracker::server(state),
    });
    // SAFETY: a fresh object with one reference behind an
    // `IUnknown`-compatible table.
    unsafe { Handle::from_non_null(raw) }
}

struct ServerList {
    tracker: Tracker,
}

impl ServerList {
    fn facet(&self, _iid: &Guid) -> Option<NonNull<c_void>> {
        None
    }
}

static SERVER_LIST_VTBL: IOPCServerList2Vtbl = IOPCServerList2Vtbl {
    base: unknown_vtbl::<ServerList>(),
    enum_classes_of_categories,
    get_class_details,
    clsid_from_prog_id,
};

sim_object!(ServerList: IOPCServerList2 => SERVER_LIST_VTBL);

unsafe extern "system" fn enum_classes_of_categories(
    _this: *mut c_void,
    implemented_count: u32,
    implemented: *const Guid,
    _required_count: u32,
    _required: *const Guid,
    out: *mut *mut c_void,
) -> StatusCode {
    call(|| {
        if out.is_null() {
            return StatusCode::E_POINTER;
        }
        // SAFETY: the caller passes `implemented_count` readable ids.
        let categories = unsafe { borrowed(implemented, implemented_count) };
        let is_da = categories.is_empty()
            || categories
                .iter()
                .any(|c| [CATID_OPC_DA10, CATID_OPC_DA20, CATID_OPC_DA30].contains(c));
        let classes = if is_da { vec![SIM_CLSID] } else { Vec::new() };
        // SAFETY: `out` is writable; ownership of the reference moves to
        // the caller.
        unsafe { *out = enumerators::guids(classes).into_raw() };
        StatusCode::S_OK
    })
}

unsafe extern "system" fn get_class_details(
    _this: *mut c_void,
    clsid: *const Guid,
    prog_id: *mut *mut u16,
    user_type: *mut *mut u16,
    version_independent_prog_id: *mut *mut u16,
) -> StatusCode {
    call(|| {
        // SAFETY: `clsid` is null or readable.
        let Some(clsid) = (unsafe { clsid.as_ref() }) else {
            return StatusCode::E_POINTER;
        };
        if *clsid != SIM_CLSID {
            return StatusCode::REGDB_E_CLASSNOTREG;
        }
        // SAFETY: the output slots are null or writable.
        unsafe {
            for (value, out) in [
                (SIM_PROG_ID, prog_id),
                (USER_TYPE, user_type),
                (SIM_PROG_ID_INDEPENDENT, version_independent_prog_id),
            ] {
                let status = out_string(value, out);
                if status.is_err() {
                    return status;
                }
            }
        }
        StatusCode::S_OK
    })
}

unsafe extern "system" fn clsid_from_prog_id(
    _this: *mut c_void,
    prog_id: *const u16,
    clsid: *mut Guid,
) -> StatusCode {
    call(|| {
        if clsid.is_null() {
            return StatusCode::E_POINTER;
        }
        // SAFETY: `prog_id` is null or a terminated string.
        let prog_id = unsafe { wide_ptr_to_string(prog_id) };
        if prog_id != SIM_PROG_ID && prog_id != SIM_PROG_ID_INDEPENDENT {
            return StatusCode::CO_E_CLASSSTRING;
        }
        // SAFETY: `clsid` is writable.
        unsafe { *clsid = SIM_CLSID };
        StatusCode::S_OK
    })
}
