//! OLE-backed allocator.

use std::ffi::c_void;
use std::ptr;

use windows::Win32::Foundation::{SysAllocStringLen, SysFreeString, SysStringLen};
use windows::Win32::System::Com::{CoTaskMemAlloc, CoTaskMemFree, SAFEARRAY};
use windows::Win32::System::Ole::{
    SafeArrayAccessData, SafeArrayCreateVector, SafeArrayDestroy, SafeArrayGetVartype,
    SafeArrayUnaccessData,
};
use windows::Win32::System::Variant::{VARENUM, VARIANT, VariantClear};
use windows::core::BSTR;

use crate::com::StatusCode;
use crate::variant::{CodecError, SafeArray, VarType, Variant};

pub(super) unsafe fn task_alloc(size: usize) -> *mut c_void {
    // SAFETY: plain allocation call; ownership moves to the caller.
    unsafe { CoTaskMemAlloc(size) }
}

pub(super) unsafe fn task_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: caller guarantees `ptr` is task memory released once.
    unsafe { CoTaskMemFree(Some(ptr.cast_const())) }
}

pub(super) fn alloc_bstr(units: &[u16]) -> *mut u16 {
    // SAFETY: the slice is valid for the call; the returned BSTR is
    // detached from its RAII wrapper so the caller owns it.
    let bstr = unsafe { SysAllocStringLen(Some(units)) };
    bstr.into_raw().cast_mut()
}

pub(super) unsafe fn free_bstr(bstr: *mut u16) {
    if bstr.is_null() {
        return;
    }
    // SAFETY: caller transfers ownership of a live BSTR.
    unsafe {
        let owned = BSTR::from_raw(bstr.cast_const());
        SysFreeString(&owned);
        std::mem::forget(owned);
    }
}

pub(super) unsafe fn bstr_len(bstr: *const u16) -> usize {
    if bstr.is_null() {
        return 0;
    }
    // SAFETY: the BSTR is borrowed for the length query only.
    unsafe {
        let borrowed = std::mem::ManuallyDrop::new(BSTR::from_raw(bstr));
        SysStringLen(&borrowed) as usize
    }
}

pub(super) fn create_vector(vt: VarType, len: u32) -> Result<*mut SafeArray, CodecError> {
    // SAFETY: plain allocation call; the caller owns the descriptor.
    let psa = unsafe { SafeArrayCreateVector(VARENUM(vt.0), 0, len) };
    if psa.is_null() {
        return Err(CodecError::UnsupportedArrayElement(vt.0));
    }
    Ok(psa.cast())
}

pub(super) unsafe fn destroy_array(psa: *mut SafeArray) -> StatusCode {
    if psa.is_null() {
        return StatusCode::S_OK;
    }
    // SAFETY: `SafeArray` mirrors the SAFEARRAY layout.
    match unsafe { SafeArrayDestroy(psa.cast::<SAFEARRAY>().cast_const()) } {
        Ok(()) => StatusCode::S_OK,
        Err(e) => e.into(),
    }
}

pub(super) unsafe fn array_vartype(psa: *const SafeArray) -> Result<VarType, StatusCode> {
    // SAFETY: `SafeArray` mirrors the SAFEARRAY layout.
    unsafe { SafeArrayGetVartype(psa.cast::<SAFEARRAY>()) }
        .map(|vt| VarType(vt.0))
        .map_err(StatusCode::from)
}

pub(super) unsafe fn access_data(psa: *mut SafeArray) -> Result<*mut c_void, StatusCode> {
    let mut data = ptr::null_mut();
    // SAFETY: `SafeArray` mirrors the SAFEARRAY layout; `data` is a valid out slot.
    unsafe { SafeArrayAccessData(psa.cast::<SAFEARRAY>().cast_const(), &mut data) }
        .map_err(StatusCode::from)?;
    Ok(data)
}

pub(super) unsafe fn unaccess_data(psa: *mut SafeArray) {
    // SAFETY: paired with a successful `access_data`.
    if let Err(e) = unsafe { SafeArrayUnaccessData(psa.cast::<SAFEARRAY>().cast_const()) } {
        tracing::warn!(error = ?e, "SafeArrayUnaccessData failed");
    }
}

pub(super) unsafe fn variant_clear(variant: *mut Variant) -> StatusCode {
    // SAFETY: `Variant` mirrors the VARIANT layout.
    match unsafe { VariantClear(variant.cast::<VARIANT>()) } {
        Ok(()) => StatusCode::S_OK,
        Err(e) => e.into(),
    }
}
