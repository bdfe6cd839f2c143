//! Connection points of the simulated server and group.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::{SimEvent, SimGroup, SimState, Tracker, call, lock, object, out_object, sim_object};
use crate::com::handle::IUnknown;
use crate::com::object::{ComBox, unknown_vtbl};
use crate::com::vtables::{
    IConnectionPoint, IConnectionPointContainer, IConnectionPointContainerVtbl,
    IConnectionPointVtbl, IOPCDataCallback, IOPCShutdown,
};
use crate::com::{Guid, Handle, Interface, StatusCode};

/// Sinks advised on one connection point, by cookie.
pub(crate) struct Sinks<I: Interface> {
    next_cookie: AtomicU32,
    entries: Mutex<Vec<(u32, Handle<I>)>>,
}

impl<I: Interface> Default for Sinks<I> {
    fn default() -> Self {
        Self {
            next_cookie: AtomicU32::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<I: Interface> Sinks<I> {
    /// Holds a reference to `sink` through `I`.
    ///
    /// # Safety
    /// `sink` must be null or a live object.
    unsafe fn advise(&self, sink: *mut c_void) -> Result<u32, StatusCode> {
        // SAFETY: forwarded contract; the borrowed reference is counted.
        let unknown = unsafe { Handle::<IUnknown>::from_borrowed(sink) }.ok_or(StatusCode::E_POINTER)?;
        let typed = unknown
            .query::<I>()
            .map_err(|_| StatusCode::CONNECT_E_CANNOTCONNECT)?;
        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        lock(&self.entries).push((cookie, typed));
        Ok(cookie)
    }

    fn unadvise(&self, cookie: u32) -> bool {
        let removed = {
            let mut entries = lock(&self.entries);
            entries
                .iter()
                .position(|(c, _)| *c == cookie)
                .map(|at| entries.remove(at))
        };
        removed.is_some()
    }

    pub(crate) fn snapshot(&self) -> Vec<Handle<I>> {
        lock(&self.entries).iter().map(|(_, h)| h.clone()).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Drops every sink reference.
    pub(crate) fn clear(&self) {
        let entries = std::mem::take(&mut *lock(&self.entries));
        drop(entries);
    }
}

/// Which connection a container or point belongs to.
#[derive(Clone)]
enum Target {
    Data(Arc<SimGroup>),
    Shutdown,
}

impl Target {
    fn iid(&self) -> Guid {
        match self {
            Self::Data(_) => IOPCDataCallback::IID,
            Self::Shutdown => IOPCShutdown::IID,
        }
    }

    fn group_handle(&self) -> Option<u32> {
        match self {
            Self::Data(group) => Some(group.server_handle),
            Self::Shutdown => None,
        }
    }
}

// ── Container ───────────────────────────────────────────────────────

pub(crate) struct Container {
    tracker: Tracker,
    target: Target,
}

impl Container {
    fn facet(&self, iid: &Guid) -> Option<NonNull<c_void>> {
        let state = self.tracker.state();
        match &self.target {
            Target::Data(group) => super::group::facet(state, group, iid),
            Target::Shutdown => super::server::facet(state, iid),
        }
    }
}

static CONTAINER_VTBL: IConnectionPointContainerVtbl = IConnectionPointContainerVtbl {
    base: unknown_vtbl::<Container>(),
    enum_connection_points,
    find_connection_point,
};

sim_object!(Container: IConnectionPointContainer => CONTAINER_VTBL);

/// The container of a group's data connection.
pub(crate) fn group_container(state: &Arc<SimState>, group: &Arc<SimGroup>) -> NonNull<c_void> {
    ComBox::create_raw(Container {
        tracker: Tracker::group(state, group),
        target: Target::Data(Arc::clone(group)),
    })
}

/// The container of the server's shutdown connection.
pub(crate) fn server_container(state: &Arc<SimState>) -> NonNull<c_void> {
    ComBox::create_raw(Container {
        tracker: Tracker::server(state),
        target: Target::Shutdown,
    })
}

unsafe extern "system" fn enum_connection_points(_this: *mut c_void, out: *mut *mut c_void) -> StatusCode {
    if !out.is_null() {
        // SAFETY: `out` is writable per the calling convention.
        unsafe { *out = std::ptr::null_mut() };
    }
    StatusCode::E_NOTIMPL
}

unsafe extern "system" fn find_connection_point(
    this: *mut c_void,
    riid: *const Guid,
    out: *mut *mut c_void,
) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<Container>`; `riid` is null or readable.
        let (container, riid) = unsafe { (object::<Container>(this), riid.as_ref()) };
        let Some(riid) = riid else {
            return StatusCode::E_POINTER;
        };
        if *riid != container.target.iid() {
            // SAFETY: `out` is null or writable.
            unsafe { out_object(None, out) };
            return StatusCode::CONNECT_E_NOCONNECTION;
        }
        let state = container.tracker.state();
        let tracker = match &container.target {
            Target::Data(group) => Tracker::group(state, group),
            Target::Shutdown => Tracker::server(state),
        };
        let point = ComBox::create_raw(ConnectionPoint {
            tracker,
            target: container.target.clone(),
        });
        // SAFETY: `out` is null or writable.
        unsafe { out_object(Some(point), out) }
    })
}

// ── Connection point ────────────────────────────────────────────────

pub(crate) struct ConnectionPoint {
    tracker: Tracker,
    target: Target,
}

impl ConnectionPoint {
    fn facet(&self, _iid: &Guid) -> Option<NonNull<c_void>> {
        None
    }
}

static POINT_VTBL: IConnectionPointVtbl = IConnectionPointVtbl {
    base: unknown_vtbl::<ConnectionPoint>(),
    get_connection_interface,
    get_connection_point_container,
    advise,
    unadvise,
    enum_connections,
};

sim_object!(ConnectionPoint: IConnectionPoint => POINT_VTBL);

unsafe extern "system" fn get_connection_interface(this: *mut c_void, iid: *mut Guid) -> StatusCode {
    call(|| {
        if iid.is_null() {
            return StatusCode::E_POINTER;
        }
        // SAFETY: `this` is a `ComBox<ConnectionPoint>`; `iid` is writable.
        unsafe { *iid = object::<ConnectionPoint>(this).target.iid() };
        StatusCode::S_OK
    })
}

unsafe extern "system" fn get_connection_point_container(
    _this: *mut c_void,
    out: *mut *mut c_void,
) -> StatusCode {
    if !out.is_null() {
        // SAFETY: `out` is writable per the calling convention.
        unsafe { *out = std::ptr::null_mut() };
    }
    StatusCode::E_NOTIMPL
}

unsafe extern "system" fn advise(this: *mut c_void, sink: *mut c_void, cookie: *mut u32) -> StatusCode {
    call(|| {
        if cookie.is_null() {
            return StatusCode::E_POINTER;
        }
        // SAFETY: `this` is a `ComBox<ConnectionPoint>`.
        let point = unsafe { object::<ConnectionPoint>(this) };
        let state = point.tracker.state();
        // SAFETY: `sink` is the caller's object pointer.
        let advised = unsafe {
            match &point.target {
                Target::Data(group) => group.sinks.advise(sink),
                Target::Shutdown => state.shutdown_sinks.advise(sink),
            }
        };
        match advised {
            Ok(id) => {
                // SAFETY: `cookie` is writable.
                unsafe { *cookie = id };
                state.log(SimEvent::Advised {
                    group: point.target.group_handle(),
                    cookie: id,
                });
                StatusCode::S_OK
            }
            Err(code) => code,
        }
    })
}

unsafe extern "system" fn unadvise(this: *mut c_void, cookie: u32) -> StatusCode {
    call(|| {
        // SAFETY: `this` is a `ComBox<ConnectionPoint>`.
        let point = unsafe { object::<ConnectionPoint>(this) };
        let state = point.tracker.state();
        let removed = match &point.target {
            Target::Data(group) => group.sinks.unadvise(cookie),
            Target::Shutdown => state.shutdown_sinks.unadvise(cookie),
        };
        if !removed {
            return StatusCode::CONNECT_E_NOCONNECTION;
        }
        state.log(SimEvent::Unadvised {
            group: point.target.group_handle(),
            cookie,
        });
        StatusCode::S_OK
    })
}

unsafe extern "system" fn enum_connections(_this: *mut c_void, out: *mut *mut c_void) -> StatusCode {
    if !out.is_null() {
        // SAFETY: `out` is writable per the calling convention.
        unsafe { *out = std::ptr::null_mut() };
    }
    StatusCode::E_NOTIMPL
}
