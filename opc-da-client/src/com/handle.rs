//! Reference-counted ownership of foreign objects.

use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::com::vtables::IUnknownVtbl;
use crate::com::{Guid, StatusCode};
use crate::errors::{OpcError, OpcResult};

/// Binds a capability identifier to its function table layout.
///
/// # Safety
///
/// `Vtable` must be `#[repr(C)]`, start with an [`IUnknownVtbl`] and list
/// the remaining entry points in the exact slot order of the interface
/// named by `IID`.
pub unsafe trait Interface: 'static {
    type Vtable;
    const IID: Guid;
    const NAME: &'static str;
}

/// An owned reference to a foreign object seen through interface `I`.
///
/// Cloning calls `AddRef`, dropping calls `Release`, so every acquisition
/// is released exactly once on every path.
pub struct Handle<I: Interface> {
    raw: NonNull<c_void>,
    _interface: PhantomData<I>,
}

// SAFETY: handles are only created after the runtime joined the
// multi-threaded apartment (or for free-threaded in-process objects), where
// interface pointers may be used and released from any thread.
unsafe impl<I: Interface> Send for Handle<I> {}
// SAFETY: see `Send`; the wrapper holds no interior state of its own.
unsafe impl<I: Interface> Sync for Handle<I> {}

impl<I: Interface> Handle<I> {
    /// Takes ownership of one reference already counted by the producer
    /// (`QueryInterface`, a factory call or an explicit `AddRef`).
    ///
    /// # Safety
    /// `raw` must be null or a live object implementing `I` whose first
    /// field is a pointer to `I::Vtable`.
    pub unsafe fn from_raw(raw: *mut c_void) -> Option<Self> {
        NonNull::new(raw).map(|raw| Self {
            raw,
            _interface: PhantomData,
        })
    }

    /// Like [`Handle::from_raw`] for pointers known to be non-null.
    ///
    /// # Safety
    /// Same requirements as [`Handle::from_raw`].
    pub(crate) unsafe fn from_non_null(raw: NonNull<c_void>) -> Self {
        Self {
            raw,
            _interface: PhantomData,
        }
    }

    /// Adds a reference to a borrowed pointer and owns the new reference.
    ///
    /// # Safety
    /// Same requirements as [`Handle::from_raw`].
    pub unsafe fn from_borrowed(raw: *mut c_void) -> Option<Self> {
        // SAFETY: forwarded contract.
        let handle = unsafe { Self::from_raw(raw) }?;
        handle.add_ref();
        Some(handle)
    }

    /// Gives up ownership without releasing.
    pub fn into_raw(self) -> *mut c_void {
        let raw = self.raw.as_ptr();
        std::mem::forget(self);
        raw
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.raw.as_ptr()
    }

    /// The interface's function table.
    pub fn vtable(&self) -> &I::Vtable {
        // SAFETY: the object's first field is the vtable pointer and the
        // table outlives every reference to the object.
        unsafe { &**self.raw.as_ptr().cast::<*const I::Vtable>() }
    }

    fn unknown(&self) -> &IUnknownVtbl {
        // SAFETY: every `Interface::Vtable` starts with `IUnknownVtbl`.
        unsafe { &**self.raw.as_ptr().cast::<*const IUnknownVtbl>() }
    }

    fn add_ref(&self) -> u32 {
        // SAFETY: the handle owns a live reference.
        unsafe { (self.unknown().add_ref)(self.as_raw()) }
    }

    /// Negotiates capability `J`. Success yields an independently owned
    /// handle; failure never leaks an output reference.
    pub fn query<J: Interface>(&self) -> Result<Handle<J>, StatusCode> {
        let raw = self.query_iid(&J::IID)?;
        // SAFETY: QueryInterface for `J::IID` returned a counted `J` pointer.
        unsafe { Handle::from_raw(raw.into_raw()) }.ok_or(StatusCode::E_POINTER)
    }

    /// Negotiates an arbitrary capability, returned through `IUnknown`.
    pub fn query_iid(&self, iid: &Guid) -> Result<Handle<IUnknown>, StatusCode> {
        let mut out = ptr::null_mut();
        // SAFETY: `iid` and `out` are valid for the duration of the call.
        let status = unsafe { (self.unknown().query_interface)(self.as_raw(), iid, &mut out) };
        if status.is_err() {
            if !out.is_null() {
                // SAFETY: a non-null output is a counted reference we now own.
                drop(unsafe { Handle::<IUnknown>::from_raw(out) });
            }
            return Err(status);
        }
        // SAFETY: success hands back a counted reference.
        unsafe { Handle::from_raw(out) }.ok_or(StatusCode::E_POINTER)
    }

    /// Like [`Handle::query`] but maps failure into an [`OpcError`].
    pub fn cast<J: Interface>(&self) -> OpcResult<Handle<J>> {
        self.query::<J>()
            .map_err(|code| OpcError::com(code, format!("QueryInterface({})", J::NAME)))
    }

    /// Releases this reference now.
    pub fn release(self) {
        drop(self);
    }
}

impl<I: Interface> Clone for Handle<I> {
    fn clone(&self) -> Self {
        self.add_ref();
        Self {
            raw: self.raw,
            _interface: PhantomData,
        }
    }
}

impl<I: Interface> Drop for Handle<I> {
    fn drop(&mut self) {
        // SAFETY: the handle owns exactly one reference, released here once.
        unsafe {
            (self.unknown().release)(self.as_raw());
        }
    }
}

impl<I: Interface> fmt::Debug for Handle<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle<{}>({:p})", I::NAME, self.raw)
    }
}

/// The universal base capability.
pub struct IUnknown;

// SAFETY: `IUnknownVtbl` is the base table itself.
unsafe impl Interface for IUnknown {
    type Vtable = IUnknownVtbl;
    const IID: Guid = Guid::from_u128(0x0000_0000_0000_0000_c000_0000_0000_0046);
    const NAME: &'static str = "IUnknown";
}

/// Tracks that a logical owner tears down its foreign handles only once.
///
/// A second release is a programming error: debug builds panic, release
/// builds get [`OpcError::InvalidState`].
#[derive(Debug, Default)]
pub(crate) struct ReleaseFlag(AtomicBool);

impl ReleaseFlag {
    pub(crate) fn mark(&self, owner: &str) -> OpcResult<()> {
        if self.0.swap(true, Ordering::AcqRel) {
            debug_assert!(false, "{owner} released twice");
            return Err(OpcError::InvalidState(format!("{owner} released twice")));
        }
        Ok(())
    }

    pub(crate) fn is_released(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_live(&self, owner: &str) -> OpcResult<()> {
        if self.is_released() {
            Err(OpcError::InvalidState(format!("{owner} has been released")))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[repr(C)]
    struct Counted {
        vtable: *const IUnknownVtbl,
        refs: AtomicU32,
        releases: AtomicU32,
    }

    unsafe extern "system" fn qi(
        this: *mut c_void,
        iid: *const Guid,
        out: *mut *mut c_void,
    ) -> StatusCode {
        // SAFETY: test object; pointers supplied by `Handle`.
        unsafe {
            if *iid == IUnknown::IID {
                add_ref(this);
                *out = this;
                StatusCode::S_OK
            } else {
                *out = ptr::null_mut();
                StatusCode::E_NOINTERFACE
            }
        }
    }

    unsafe extern "system" fn add_ref(this: *mut c_void) -> u32 {
        // SAFETY: `this` is a live `Counted`.
        unsafe { (*this.cast::<Counted>()).refs.fetch_add(1, Ordering::SeqCst) + 1 }
    }

    unsafe extern "system" fn release(this: *mut c_void) -> u32 {
        // SAFETY: `this` is a live `Counted`; it is leaked by the test.
        unsafe {
            let obj = &*this.cast::<Counted>();
            obj.releases.fetch_add(1, Ordering::SeqCst);
            obj.refs.fetch_sub(1, Ordering::SeqCst) - 1
        }
    }

    static VTBL: IUnknownVtbl = IUnknownVtbl {
        query_interface: qi,
        add_ref,
        release,
    };

    fn counted() -> &'static Counted {
        Box::leak(Box::new(Counted {
            vtable: &VTBL,
            refs: AtomicU32::new(1),
            releases: AtomicU32::new(0),
        }))
    }

    fn handle(obj: &'static Counted) -> Handle<IUnknown> {
        // SAFETY: `obj` starts with its vtable pointer and holds one reference.
        unsafe { Handle::from_raw(std::ptr::from_ref(obj).cast_mut().cast()) }.unwrap()
    }

    #[test]
    fn test_clone_and_drop_balance() {
        let obj = counted();
        let h = handle(obj);
        let h2 = h.clone();
        assert_eq!(obj.refs.load(Ordering::SeqCst), 2);
        drop(h);
        drop(h2);
        assert_eq!(obj.refs.load(Ordering::SeqCst), 0);
        assert_eq!(obj.releases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_query_success_is_independent() {
        let obj = counted();
        let h = handle(obj);
        let q = h.query::<IUnknown>().unwrap();
        assert_eq!(obj.refs.load(Ordering::SeqCst), 2);
        q.release();
        assert_eq!(obj.refs.load(Ordering::SeqCst), 1);
        drop(h);
    }

    #[test]
    fn test_query_failure_does_not_leak() {
        struct Other;
        // SAFETY: test-only marker reusing the base table.
        unsafe impl Interface for Other {
            type Vtable = IUnknownVtbl;
            const IID: Guid = Guid::from_u128(42);
            const NAME: &'static str = "Other";
        }

        let obj = counted();
        let h = handle(obj);
        assert_eq!(h.query::<Other>().unwrap_err(), StatusCode::E_NOINTERFACE);
        assert_eq!(obj.refs.load(Ordering::SeqCst), 1);
        let err = h.cast::<Other>().unwrap_err();
        assert!(err.to_string().contains("QueryInterface(Other)"));
        drop(h);
        assert_eq!(obj.refs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_into_raw_keeps_reference() {
        let obj = counted();
        let raw = handle(obj).into_raw();
        assert_eq!(obj.refs.load(Ordering::SeqCst), 1);
        // SAFETY: reclaiming the reference given up by `into_raw`.
        drop(unsafe { Handle::<IUnknown>::from_raw(raw) });
        assert_eq!(obj.refs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_release_flag_single_release() {
        let flag = ReleaseFlag::default();
        assert!(flag.ensure_live("group").is_ok());
        flag.mark("group").unwrap();
        assert!(flag.is_released());
        assert!(flag.ensure_live("group").is_err());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "released twice")]
    fn test_release_flag_detects_double_release() {
        let flag = ReleaseFlag::default();
        flag.mark("group").unwrap();
        let _ = flag.mark("group");
    }
}
