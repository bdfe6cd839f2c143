use std::ffi::c_void;
use std::sync::Arc;

use super::guarded;
use crate::com::memory::wide_ptr_to_string;
use crate::com::object::{ComBox, ComObject, unknown_vtbl};
use crate::com::vtables::{IOPCShutdown, IOPCShutdownVtbl};
use crate::com::{Handle, StatusCode};
use crate::dispatch::{Fanout, ShutdownEvent};

/// Sink for `IOPCShutdown`, advised on the server object by the first
/// [`crate::OpcServer::subscribe_shutdown`] call.
///
/// Shutdown notices are rare and carry a single string, so they skip the
/// intake stage and go straight to the subscriber queues with `try_send`.
pub struct ShutdownCallback {
    subscribers: Arc<Fanout<ShutdownEvent>>,
}

impl ShutdownCallback {
    pub fn create(subscribers: Arc<Fanout<ShutdownEvent>>) -> Handle<IOPCShutdown> {
        ComBox::create(Self { subscribers })
    }
}

static VTABLE: IOPCShutdownVtbl = IOPCShutdownVtbl {
    base: unknown_vtbl::<ShutdownCallback>(),
    shutdown_request,
};

// SAFETY: `shutdown_request` treats `this` as `ComBox<ShutdownCallback>`.
unsafe impl ComObject for ShutdownCallback {
    type Interface = IOPCShutdown;

    fn vtable() -> &'static IOPCShutdownVtbl {
        &VTABLE
    }
}

unsafe extern "system" fn shutdown_request(this: *mut c_void, reason: *const u16) -> StatusCode {
    guarded(|| {
        // SAFETY: the server calls through our table; `reason` is null or a
        // terminated string valid for the call.
        let (sink, reason) = unsafe {
            (
                ComBox::<ShutdownCallback>::from_this(this).inner(),
                wide_ptr_to_string(reason),
            )
        };
        tracing::warn!(reason = %reason, "server requested shutdown");
        sink.subscribers.publish(&ShutdownEvent { reason });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::com::LocalWide;

    #[test]
    fn test_reason_reaches_subscribers() {
        let fanout = Arc::new(Fanout::new());
        let mut rx = fanout.subscribe(4);
        let handle = ShutdownCallback::create(Arc::clone(&fanout));
        let reason = LocalWide::new("maintenance");
        // SAFETY: `reason` is a terminated wide string.
        let status = unsafe { (handle.vtable().shutdown_request)(handle.as_raw(), reason.as_ptr()) };
        assert_eq!(status, StatusCode::S_OK);
        assert_eq!(rx.try_recv().unwrap().reason, "maintenance");
    }

    #[test]
    fn test_null_reason_is_empty() {
        let fanout = Arc::new(Fanout::new());
        let mut rx = fanout.subscribe(1);
        let handle = ShutdownCallback::create(Arc::clone(&fanout));
        // SAFETY: a null reason is accepted.
        let status = unsafe { (handle.vtable().shutdown_request)(handle.as_raw(), std::ptr::null()) };
        assert_eq!(status, StatusCode::S_OK);
        assert_eq!(rx.try_recv().unwrap().reason, "");
    }
}
