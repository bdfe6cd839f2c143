use std::ffi::c_void;

use crate::com::vtables::{IConnectionPoint, IConnectionPointContainer};
use crate::com::{Guid, Handle, StatusCode};
use crate::errors::{OpcError, OpcResult};

/// Connection point container functionality.
///
/// Finds the connection point for an outgoing interface and manages
/// advise/unadvise of client sinks on it.
pub trait ConnectionPointContainerTrait {
    fn interface(&self) -> OpcResult<&Handle<IConnectionPointContainer>>;

    /// Finds the connection point for `iid`.
    ///
    /// # Errors
    /// `CONNECT_E_NOCONNECTION` when the server does not source `iid`.
    fn find_connection_point(&self, iid: &Guid) -> OpcResult<Handle<IConnectionPoint>> {
        let itf = self.interface()?;
        let mut point = std::ptr::null_mut();
        // SAFETY: `iid` and the output slot are valid for the call.
        let status = unsafe { (itf.vtable().find_connection_point)(itf.as_raw(), iid, &mut point) };
        // SAFETY: a non-null output is a counted reference.
        let handle = unsafe { Handle::<IConnectionPoint>::from_raw(point) };
        status.ok_or_com("IConnectionPointContainer::FindConnectionPoint")?;
        handle.ok_or_else(|| {
            OpcError::com(StatusCode::E_POINTER, "IConnectionPointContainer::FindConnectionPoint")
        })
    }

    /// Hands `sink` to the connection point for `iid`.
    ///
    /// # Returns
    /// The connection point and the advise cookie; both are needed to
    /// unadvise.
    fn advise(&self, iid: &Guid, sink: *mut c_void) -> OpcResult<(Handle<IConnectionPoint>, u32)> {
        let point = self.find_connection_point(iid)?;
        let cookie = advise(&point, sink)?;
        Ok((point, cookie))
    }
}

/// Registers `sink` with a connection point. The server adds its own
/// reference to the sink on success.
pub fn advise(point: &Handle<IConnectionPoint>, sink: *mut c_void) -> OpcResult<u32> {
    let mut cookie = 0u32;
    // SAFETY: `sink` is a live callback object and `cookie` a valid slot.
    unsafe { (point.vtable().advise)(point.as_raw(), sink, &mut cookie) }
        .ok_or_com("IConnectionPoint::Advise")?;
    Ok(cookie)
}

/// Cancels a registration made by [`advise`].
pub fn unadvise(point: &Handle<IConnectionPoint>, cookie: u32) -> OpcResult<()> {
    // SAFETY: plain call on a live handle.
    unsafe { (point.vtable().unadvise)(point.as_raw(), cookie) }
        .ok_or_com("IConnectionPoint::Unadvise")
}
