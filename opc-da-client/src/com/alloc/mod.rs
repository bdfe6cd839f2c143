//! The foreign allocator.
//!
//! Memory that crosses the boundary (task memory, BSTRs, SAFEARRAYs and
//! the payloads owned by a VARIANT) must be allocated and released by the
//! same allocator the server uses. On Windows that is OLE itself; other
//! targets get a portable allocator with the same ownership rules so the
//! codec and the simulated server behave identically everywhere.

use std::ffi::c_void;

use crate::com::StatusCode;
use crate::variant::{CodecError, SafeArray, VarType, Variant};

#[cfg(windows)]
mod native;
#[cfg(windows)]
use native as imp;

#[cfg(not(windows))]
mod portable;
#[cfg(not(windows))]
use portable as imp;

/// Allocates `size` bytes of task memory. Returns null on exhaustion.
///
/// # Safety
/// The result must be released with [`task_free`] exactly once.
pub unsafe fn task_alloc(size: usize) -> *mut c_void {
    // SAFETY: forwarded contract.
    unsafe { imp::task_alloc(size) }
}

/// Releases task memory. Null is ignored.
///
/// # Safety
/// `ptr` must come from [`task_alloc`] (or the foreign side's task
/// allocator) and must not be used afterwards.
pub unsafe fn task_free(ptr: *mut c_void) {
    // SAFETY: forwarded contract.
    unsafe { imp::task_free(ptr) }
}

/// Copies `items` into a fresh task-memory block.
pub fn task_alloc_slice<T: Copy>(items: &[T]) -> Result<*mut T, CodecError> {
    let bytes = std::mem::size_of_val(items);
    // SAFETY: the block is sized for `items` and initialized by the copy.
    unsafe {
        let ptr = task_alloc(bytes).cast::<T>();
        if ptr.is_null() {
            return Err(CodecError::Allocation);
        }
        std::ptr::copy_nonoverlapping(items.as_ptr(), ptr, items.len());
        Ok(ptr)
    }
}

/// Allocates a null-terminated UTF-16 copy of `value` in task memory.
pub fn task_alloc_wide(value: &str) -> Result<*mut u16, CodecError> {
    let wide: Vec<u16> = value.encode_utf16().chain(std::iter::once(0)).collect();
    task_alloc_slice(&wide)
}

/// Allocates a BSTR holding `units`. An empty input may yield null, which
/// every BSTR consumer treats as the empty string.
pub fn alloc_bstr(units: &[u16]) -> Result<*mut u16, CodecError> {
    let ptr = imp::alloc_bstr(units);
    if ptr.is_null() && !units.is_empty() {
        Err(CodecError::Allocation)
    } else {
        Ok(ptr)
    }
}

/// Releases a BSTR. Null is ignored.
///
/// # Safety
/// `bstr` must be a live BSTR from the foreign allocator.
pub unsafe fn free_bstr(bstr: *mut u16) {
    // SAFETY: forwarded contract.
    unsafe { imp::free_bstr(bstr) }
}

/// Length of a BSTR in UTF-16 code units (null means empty).
///
/// # Safety
/// `bstr` must be null or a live BSTR.
pub unsafe fn bstr_len(bstr: *const u16) -> usize {
    // SAFETY: forwarded contract.
    unsafe { imp::bstr_len(bstr) }
}

/// Creates a one-dimensional SAFEARRAY of `len` zeroed elements of `vt`,
/// lower bound 0.
pub fn create_vector(vt: VarType, len: u32) -> Result<*mut SafeArray, CodecError> {
    let psa = imp::create_vector(vt, len)?;
    if psa.is_null() {
        Err(CodecError::Allocation)
    } else {
        Ok(psa)
    }
}

/// Destroys a SAFEARRAY together with every BSTR/VARIANT element.
///
/// # Safety
/// `psa` must be a live, unlocked SAFEARRAY owned by the caller.
pub unsafe fn destroy_array(psa: *mut SafeArray) -> StatusCode {
    // SAFETY: forwarded contract.
    unsafe { imp::destroy_array(psa) }
}

/// Element type recorded in the array header.
///
/// # Safety
/// `psa` must be a live SAFEARRAY.
pub unsafe fn array_vartype(psa: *const SafeArray) -> Result<VarType, StatusCode> {
    // SAFETY: forwarded contract.
    unsafe { imp::array_vartype(psa) }
}

/// Locks the array and returns its element buffer.
///
/// # Safety
/// `psa` must be a live SAFEARRAY; every successful call must be paired
/// with [`unaccess_data`].
pub unsafe fn access_data(psa: *mut SafeArray) -> Result<*mut c_void, StatusCode> {
    // SAFETY: forwarded contract.
    unsafe { imp::access_data(psa) }
}

/// Unlocks an array previously locked by [`access_data`].
///
/// # Safety
/// `psa` must be a live SAFEARRAY locked by this caller.
pub unsafe fn unaccess_data(psa: *mut SafeArray) {
    // SAFETY: forwarded contract.
    unsafe { imp::unaccess_data(psa) }
}

/// Releases whatever `variant` owns and resets it to `VT_EMPTY`.
///
/// # Safety
/// `variant` must point to an initialized VARIANT whose payload is owned
/// by the caller.
pub unsafe fn variant_clear(variant: *mut Variant) -> StatusCode {
    // SAFETY: forwarded contract.
    unsafe { imp::variant_clear(variant) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bstr_alloc_len_free() {
        let units: Vec<u16> = "héllo".encode_utf16().collect();
        let bstr = alloc_bstr(&units).unwrap();
        // SAFETY: `bstr` was just allocated and is released once below.
        unsafe {
            assert_eq!(bstr_len(bstr), units.len());
            assert_eq!(std::slice::from_raw_parts(bstr, units.len()), units.as_slice());
            assert_eq!(*bstr.add(units.len()), 0);
            free_bstr(bstr);
        }
    }

    #[test]
    fn test_empty_bstr_and_null() {
        let bstr = alloc_bstr(&[]).unwrap();
        // SAFETY: valid BSTR from above; null is allowed for len/free.
        unsafe {
            assert_eq!(bstr_len(bstr), 0);
            free_bstr(bstr);
            assert_eq!(bstr_len(std::ptr::null()), 0);
            free_bstr(std::ptr::null_mut());
        }
    }

    #[test]
    fn test_vector_header_and_destroy() {
        let psa = create_vector(VarType::R8, 3).unwrap();
        // SAFETY: `psa` is a fresh vector destroyed exactly once.
        unsafe {
            assert_eq!(array_vartype(psa), Ok(VarType::R8));
            assert_eq!((*psa).dims, 1);
            assert_eq!((*psa).bounds[0].elements, 3);
            assert_eq!((*psa).bounds[0].lower_bound, 0);
            let data = access_data(psa).unwrap().cast::<f64>();
            *data.add(2) = 2.5;
            assert_eq!(destroy_array(psa), StatusCode::DISP_E_ARRAYISLOCKED);
            unaccess_data(psa);
            assert_eq!(destroy_array(psa), StatusCode::S_OK);
        }
    }

    #[test]
    fn test_task_slice_roundtrip() {
        let ptr = task_alloc_slice(&[1u32, 2, 3]).unwrap();
        // SAFETY: three elements were copied in; freed once.
        unsafe {
            assert_eq!(std::slice::from_raw_parts(ptr, 3), &[1, 2, 3]);
            task_free(ptr.cast());
        }
    }

    #[test]
    fn test_unsupported_vector_type() {
        assert!(create_vector(VarType::RECORD, 1).is_err());
    }
}
