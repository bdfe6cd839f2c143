//! An in-process OPC DA server for tests and demos.
//!
//! Every server-side interface is a real function table over a
//! reference-counted object, so the client talks to it through exactly the
//! same entry points it uses against a production server. Objects are never
//! freed: when the last reference goes away they are marked dead and kept
//! around so that an extra `Release` is counted instead of corrupting
//! memory. [`SimServer::live_objects`] and [`SimServer::over_releases`] let
//! tests assert balanced lifetimes.
//!
//! Callbacks (async completions, data changes, shutdown) are delivered from
//! threads the client does not own, as a real server would.

mod connection;
pub mod enumerators;
mod group;
mod server;
mod server_list;
mod state;

use std::ffi::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::com::alloc::{task_alloc, task_alloc_wide};
use crate::com::handle::IUnknown;
use crate::com::object::ComBox;
use crate::com::vtables::CLSID_OPC_SERVER_LIST;
use crate::com::{Activator, Guid, Handle, Location, StatusCode};
use crate::config::ClientConfig;
use crate::errors::{OpcError, OpcResult};
use crate::records::{AccessRights, Quality};
use crate::server::OpcServer;
use crate::variant::Value;

pub(crate) use state::{SimGroup, SimState};

/// ProgID the simulator registers under.
pub const SIM_PROG_ID: &str = "OpcDa.Simulator.1";
/// Version-independent ProgID of the simulator.
pub const SIM_PROG_ID_INDEPENDENT: &str = "OpcDa.Simulator";
/// Class id of the simulator.
pub const SIM_CLSID: Guid = Guid::from_u128(0x6a0f_2c1e_8b7d_4c35_9e41_5d2a_7f3b_c801);
/// A vendor code with no entry in the static table; the simulator knows
/// its text.
pub const SIM_E_DEVICE_FAULT: StatusCode = StatusCode::from_u32(0xE004_0100);

/// Something the simulator observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    GroupAdded { server_handle: u32, name: String },
    /// A sink was registered; `group` is `None` for the server's shutdown
    /// connection.
    Advised { group: Option<u32>, cookie: u32 },
    Unadvised { group: Option<u32>, cookie: u32 },
    /// The last client reference to the group's objects went away.
    GroupReleased { server_handle: u32 },
    /// `RemoveGroup` ran; `in_use` when group objects were still alive.
    GroupRemoved { server_handle: u32, in_use: bool },
    ClientName(String),
}

/// Handle on a simulated server: configure it, drive it and inspect what
/// the client did to it. Clones share the same server.
#[derive(Clone, Default)]
pub struct SimServer {
    state: Arc<SimState>,
}

impl std::fmt::Debug for SimServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimServer")
            .field("groups", &self.group_count())
            .field("live_objects", &self.live_objects())
            .finish_non_exhaustive()
    }
}

impl SimServer {
    /// A server with the default address space.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activator(&self) -> SimActivator {
        SimActivator {
            state: Arc::clone(&self.state),
        }
    }

    /// Connects a client through this server's activator.
    pub fn connect(&self, config: ClientConfig) -> OpcResult<OpcServer> {
        OpcServer::connect_with(&self.activator(), SIM_PROG_ID, "", config)
    }

    /// Adds or replaces a tag. Its canonical type is the value's type.
    pub fn add_tag(&self, item_id: &str, value: Value, rights: AccessRights) {
        self.state.insert_tag(item_id, value, rights);
    }

    /// Changes a tag's value, with good quality and a fresh timestamp.
    pub fn set_tag(&self, item_id: &str, value: Value) -> bool {
        self.state.update_tag(item_id, |tag| tag.set(value))
    }

    pub fn set_quality(&self, item_id: &str, quality: Quality) -> bool {
        self.state.update_tag(item_id, |tag| tag.quality = quality)
    }

    pub fn tag(&self, item_id: &str) -> Option<Value> {
        self.state.tag_value(item_id)
    }

    /// Refuses capability queries for `iid` from now on.
    pub fn refuse_interface(&self, iid: Guid) {
        lock(&self.state.refused).push(iid);
    }

    /// Delay before asynchronous completions are delivered.
    pub fn set_async_delay(&self, delay: Duration) {
        *lock(&self.state.async_delay) = delay;
    }

    /// Sends a data change with the current values of the active items of
    /// every active, enabled group.
    ///
    /// # Returns
    /// The number of callbacks made
    pub fn publish_updates(&self) -> usize {
        group::publish_updates(&self.state)
    }

    /// Sends `IOPCShutdown::ShutdownRequest` to every advised sink.
    pub fn request_shutdown(&self, reason: &str) -> usize {
        server::request_shutdown(&self.state, reason)
    }

    pub fn group_count(&self) -> usize {
        lock(&self.state.groups).len()
    }

    pub fn group_names(&self) -> Vec<String> {
        lock(&self.state.groups)
            .values()
            .map(|g| g.name())
            .collect()
    }

    /// Number of server-side objects the client still holds.
    pub fn live_objects(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Number of `Release` calls on objects that were already dead.
    pub fn over_releases(&self) -> usize {
        self.state.over_releases.load(Ordering::SeqCst)
    }

    pub fn client_name(&self) -> Option<String> {
        lock(&self.state.client_name).clone()
    }

    pub fn events(&self) -> Vec<SimEvent> {
        lock(&self.state.events).clone()
    }
}

/// Activates the simulator and its server enumerator. Any other class id
/// is reported as unregistered.
#[derive(Clone)]
pub struct SimActivator {
    state: Arc<SimState>,
}

impl std::fmt::Debug for SimActivator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SimActivator")
    }
}

impl Activator for SimActivator {
    fn create_instance(
        &self,
        clsid: &Guid,
        location: &Location,
        iid: &Guid,
    ) -> OpcResult<Handle<IUnknown>> {
        let unknown = if *clsid == SIM_CLSID {
            server::create(&self.state)
        } else if *clsid == CLSID_OPC_SERVER_LIST {
            server_list::create(&self.state)
        } else {
            return Err(OpcError::com(StatusCode::REGDB_E_CLASSNOTREG, format!("activate {clsid}")));
        };
        tracing::debug!(%clsid, %location, "simulated activation");
        unknown
            .query_iid(iid)
            .map_err(|code| OpcError::com(code, "QueryInterface"))
    }
}

// ── Object plumbing ─────────────────────────────────────────────────

/// Lifetime bookkeeping carried by every simulated object.
pub(crate) struct Tracker {
    state: Arc<SimState>,
    group: Option<Arc<SimGroup>>,
}

impl Tracker {
    pub(crate) fn server(state: &Arc<SimState>) -> Self {
        state.live.fetch_add(1, Ordering::SeqCst);
        Self {
            state: Arc::clone(state),
            group: None,
        }
    }

    pub(crate) fn group(state: &Arc<SimState>, group: &Arc<SimGroup>) -> Self {
        state.live.fetch_add(1, Ordering::SeqCst);
        group.facets.fetch_add(1, Ordering::SeqCst);
        Self {
            state: Arc::clone(state),
            group: Some(Arc::clone(group)),
        }
    }

    pub(crate) fn state(&self) -> &Arc<SimState> {
        &self.state
    }

    pub(crate) fn final_release(&self) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
        if let Some(group) = &self.group {
            if group.facets.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.state.log(SimEvent::GroupReleased {
                    server_handle: group.server_handle,
                });
            }
        }
    }

    pub(crate) fn over_release(&self) {
        self.state.over_releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Implements `ComObject` for a simulated object with a `tracker` field and
/// a `facet(&self, &Guid)` method answering sibling queries.
macro_rules! sim_object {
    ($ty:ident: $itf:ident => $vtable:ident) => {
        // SAFETY: every entry of the table treats `this` as `ComBox<$ty>`.
        unsafe impl $crate::com::object::ComObject for $ty {
            type Interface = $itf;

            fn vtable() -> &'static <$itf as $crate::com::Interface>::Vtable {
                &$vtable
            }

            fn query_other(&self, iid: &$crate::com::Guid) -> Option<::std::ptr::NonNull<::std::ffi::c_void>> {
                self.facet(iid)
            }

            fn on_final_release(&self) -> bool {
                self.tracker.final_release();
                false
            }

            fn on_over_release(&self) {
                self.tracker.over_release();
            }
        }
    };
}
pub(crate) use sim_object;

/// Borrows the value behind `this`.
///
/// # Safety
/// `this` must point to a live `ComBox<T>`.
pub(crate) unsafe fn object<'a, T: crate::com::object::ComObject>(this: *mut c_void) -> &'a T {
    // SAFETY: forwarded contract.
    unsafe { ComBox::<T>::from_this(this).inner() }
}

/// Runs an entry point body, turning a panic into `E_UNEXPECTED`.
pub(crate) fn call(body: impl FnOnce() -> StatusCode) -> StatusCode {
    catch_unwind(AssertUnwindSafe(body)).unwrap_or(StatusCode::E_UNEXPECTED)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Moves `items` into a task-memory block handed to the caller.
///
/// # Safety
/// `out` must be null or writable.
pub(crate) unsafe fn out_vec<T>(items: Vec<T>, out: *mut *mut T) -> StatusCode {
    if out.is_null() {
        return StatusCode::E_POINTER;
    }
    let bytes = std::mem::size_of::<T>() * items.len().max(1);
    // SAFETY: the block is sized for `items`; each slot is written once.
    unsafe {
        let block = task_alloc(bytes).cast::<T>();
        if block.is_null() {
            *out = std::ptr::null_mut();
            return StatusCode::E_OUTOFMEMORY;
        }
        for (index, item) in items.into_iter().enumerate() {
            block.add(index).write(item);
        }
        *out = block;
    }
    StatusCode::S_OK
}

/// Hands a task-memory copy of `value` to the caller.
///
/// # Safety
/// `out` must be null or writable.
pub(crate) unsafe fn out_string(value: &str, out: *mut *mut u16) -> StatusCode {
    if out.is_null() {
        return StatusCode::E_POINTER;
    }
    match task_alloc_wide(value) {
        Ok(ptr) => {
            // SAFETY: `out` is writable per contract.
            unsafe { *out = ptr };
            StatusCode::S_OK
        }
        Err(_) => StatusCode::E_OUTOFMEMORY,
    }
}

/// Writes an object pointer (or null) to an interface output slot.
///
/// # Safety
/// `out` must be null or writable.
pub(crate) unsafe fn out_object(object: Option<NonNull<c_void>>, out: *mut *mut c_void) -> StatusCode {
    if out.is_null() {
        return StatusCode::E_POINTER;
    }
    // SAFETY: `out` is writable per contract.
    unsafe {
        *out = object.map_or(std::ptr::null_mut(), NonNull::as_ptr);
    }
    if object.is_some() {
        StatusCode::S_OK
    } else {
        StatusCode::E_NOINTERFACE
    }
}

/// `S_FALSE` when any per-item status failed, `S_OK` otherwise.
pub(crate) fn batch_status(errors: &[StatusCode]) -> StatusCode {
    if errors.iter().any(|e| e.is_err()) {
        StatusCode::S_FALSE
    } else {
        StatusCode::S_OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::com::runtime::activate;
    use crate::com::Interface;
    use crate::com::vtables::{IOPCCommon, IOPCServer};

    #[test]
    fn test_activation_and_balanced_release() {
        let sim = SimServer::new();
        let server = activate::<IOPCServer, _>(&sim.activator(), &SIM_CLSID, &Location::Local).unwrap();
        let common = server.cast::<IOPCCommon>().unwrap();
        assert_eq!(sim.live_objects(), 2);
        drop(common);
        drop(server);
        assert_eq!(sim.live_objects(), 0);
        assert_eq!(sim.over_releases(), 0);
    }

    #[test]
    fn test_over_release_is_counted() {
        let sim = SimServer::new();
        let server = activate::<IOPCServer, _>(&sim.activator(), &SIM_CLSID, &Location::Local).unwrap();
        let raw = server.as_raw();
        drop(server);
        // SAFETY: simulated objects stay allocated after the last release,
        // so the extra call is observable instead of undefined.
        unsafe {
            let vtable = &**raw.cast::<*const crate::com::vtables::IUnknownVtbl>();
            (vtable.release)(raw);
        }
        assert_eq!(sim.over_releases(), 1);
    }

    #[test]
    fn test_unknown_class_is_not_registered() {
        let sim = SimServer::new();
        let err = sim
            .activator()
            .create_instance(&Guid::from_u128(7), &Location::Local, &IOPCServer::IID)
            .unwrap_err();
        assert_eq!(err.code(), Some(StatusCode::REGDB_E_CLASSNOTREG));
    }

    #[test]
    fn test_prog_id_resolves_through_server_list() {
        let sim = SimServer::new();
        let clsid = sim
            .activator()
            .clsid_from_prog_id(SIM_PROG_ID, &Location::Local)
            .unwrap();
        assert_eq!(clsid, SIM_CLSID);
        assert_eq!(sim.live_objects(), 0);
    }
}
