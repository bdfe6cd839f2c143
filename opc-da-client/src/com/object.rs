//! Client-side objects the foreign runtime can call into.
//!
//! A [`ComBox`] places a function-table pointer in front of a Rust value and
//! implements the `IUnknown` slots generically: capability queries for the
//! object's own interface or `IUnknown` succeed, everything else fails with
//! `E_NOINTERFACE` and a null output. The box is freed when the last
//! reference goes away.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering, fence};

use crate::com::handle::IUnknown;
use crate::com::vtables::IUnknownVtbl;
use crate::com::{Guid, Handle, Interface, StatusCode};

/// A Rust value exposed through one foreign interface.
///
/// # Safety
///
/// `vtable()` must return a table for `Self::Interface` whose `IUnknown`
/// slots are [`query_interface::<Self>`], [`add_ref::<Self>`] and
/// [`release::<Self>`], and whose remaining slots cast `this` to
/// `ComBox<Self>`.
pub unsafe trait ComObject: Send + Sync + Sized + 'static {
    type Interface: Interface;

    fn vtable() -> &'static <Self::Interface as Interface>::Vtable;

    /// Answers capability queries beyond the object's own interface with a
    /// counted pointer.
    fn query_other(&self, _iid: &Guid) -> Option<NonNull<c_void>> {
        None
    }

    /// Called when the count reaches zero; returning `false` keeps the
    /// memory alive so later misuse stays observable.
    fn on_final_release(&self) -> bool {
        true
    }

    /// Called for a release on an object whose count is already zero.
    fn on_over_release(&self) {}
}

/// Layout of every client-side object: the table pointer comes first.
#[repr(C)]
pub struct ComBox<T: ComObject> {
    vtable: *const <T::Interface as Interface>::Vtable,
    refs: AtomicU32,
    inner: T,
}

impl<T: ComObject> ComBox<T> {
    /// Allocates the object with one reference, owned by the returned handle.
    pub fn create(inner: T) -> Handle<T::Interface> {
        let raw = Self::create_raw(inner);
        // SAFETY: `raw` is a fresh object for `T::Interface` with one reference.
        unsafe { Handle::from_non_null(raw) }
    }

    /// Allocates the object with one reference and hands back the raw pointer.
    pub fn create_raw(inner: T) -> NonNull<c_void> {
        let boxed = Box::new(Self {
            vtable: T::vtable(),
            refs: AtomicU32::new(1),
            inner,
        });
        NonNull::from(Box::leak(boxed)).cast()
    }

    /// Borrows the object behind an interface pointer.
    ///
    /// # Safety
    /// `this` must point to a live `ComBox<T>`.
    pub unsafe fn from_this<'a>(this: *mut c_void) -> &'a Self {
        // SAFETY: forwarded contract.
        unsafe { &*this.cast::<Self>() }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }
}

/// Borrows the Rust value behind a handle created by [`ComBox::create`].
///
/// # Safety
/// `handle` must refer to a `ComBox<T>`.
pub unsafe fn inner_of<T: ComObject>(handle: &Handle<T::Interface>) -> &T {
    // SAFETY: forwarded contract; the handle keeps the object alive.
    unsafe { ComBox::<T>::from_this(handle.as_raw()).inner() }
}

/// The `IUnknown` slots of a [`ComObject`].
pub const fn unknown_vtbl<T: ComObject>() -> IUnknownVtbl {
    IUnknownVtbl {
        query_interface: query_interface::<T>,
        add_ref: add_ref::<T>,
        release: release::<T>,
    }
}

/// # Safety
/// `this` must point to a live `ComBox<T>`; `out` must be null or writable.
pub unsafe extern "system" fn query_interface<T: ComObject>(
    this: *mut c_void,
    iid: *const Guid,
    out: *mut *mut c_void,
) -> StatusCode {
    if out.is_null() {
        return StatusCode::E_POINTER;
    }
    // SAFETY: `out` is writable and `iid` is null or readable per contract.
    unsafe {
        *out = std::ptr::null_mut();
        let Some(iid) = iid.as_ref() else {
            return StatusCode::E_POINTER;
        };
        if *iid == IUnknown::IID || *iid == T::Interface::IID {
            add_ref::<T>(this);
            *out = this;
            return StatusCode::S_OK;
        }
        match ComBox::<T>::from_this(this).inner.query_other(iid) {
            Some(other) => {
                *out = other.as_ptr();
                StatusCode::S_OK
            }
            None => StatusCode::E_NOINTERFACE,
        }
    }
}

/// # Safety
/// `this` must point to a live `ComBox<T>`.
pub unsafe extern "system" fn add_ref<T: ComObject>(this: *mut c_void) -> u32 {
    // SAFETY: forwarded contract.
    let object = unsafe { ComBox::<T>::from_this(this) };
    object.refs.fetch_add(1, Ordering::Relaxed) + 1
}

/// # Safety
/// `this` must point to a `ComBox<T>` created by [`ComBox::create`].
pub unsafe extern "system" fn release<T: ComObject>(this: *mut c_void) -> u32 {
    // SAFETY: forwarded contract.
    let object = unsafe { ComBox::<T>::from_this(this) };
    let previous = object
        .refs
        .fetch_update(Ordering::Release, Ordering::Relaxed, |n| n.checked_sub(1));
    match previous {
        Ok(1) => {
            fence(Ordering::Acquire);
            if object.inner.on_final_release() {
                // SAFETY: the last reference is gone; the box was leaked in
                // `create_raw` and is reclaimed exactly once here.
                drop(unsafe { Box::from_raw(this.cast::<ComBox<T>>()) });
            }
            0
        }
        Ok(n) => n - 1,
        Err(_) => {
            object.inner.on_over_release();
            tracing::warn!(interface = T::Interface::NAME, "release on a dead object");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::com::vtables::{IOPCShutdown, IOPCShutdownVtbl};
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    struct Counted {
        dropped: Arc<AtomicUsize>,
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    unsafe extern "system" fn shutdown_request(_this: *mut c_void, _reason: *const u16) -> StatusCode {
        StatusCode::S_OK
    }

    static COUNTED_VTBL: IOPCShutdownVtbl = IOPCShutdownVtbl {
        base: unknown_vtbl::<Counted>(),
        shutdown_request,
    };

    // SAFETY: the table uses the generic unknown slots for `Counted`.
    unsafe impl ComObject for Counted {
        type Interface = IOPCShutdown;

        fn vtable() -> &'static IOPCShutdownVtbl {
            &COUNTED_VTBL
        }
    }

    #[test]
    fn test_last_release_frees_the_object() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let handle = ComBox::create(Counted {
            dropped: dropped.clone(),
        });
        let second = handle.clone();
        drop(handle);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_query_own_and_base_interfaces() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let handle = ComBox::create(Counted {
            dropped: dropped.clone(),
        });
        let unknown = handle.query::<IUnknown>().unwrap();
        let again = unknown.query::<IOPCShutdown>().unwrap();
        // SAFETY: the handle refers to a `ComBox<Counted>`.
        let object = unsafe { ComBox::<Counted>::from_this(handle.as_raw()) };
        assert_eq!(object.ref_count(), 3);
        drop((unknown, again));
        assert_eq!(object.ref_count(), 1);
        drop(handle);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_interface_is_refused_with_null_output() {
        let handle = ComBox::create(Counted {
            dropped: Arc::new(AtomicUsize::new(0)),
        });
        let mut out = NonNull::<c_void>::dangling().as_ptr();
        let iid = crate::com::vtables::IOPCServer::IID;
        // SAFETY: valid object, IID and output slot.
        let status = unsafe { query_interface::<Counted>(handle.as_raw(), &iid, &mut out) };
        assert_eq!(status, StatusCode::E_NOINTERFACE);
        assert!(out.is_null());
    }
}
