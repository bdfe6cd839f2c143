//! Portable stand-in for the OLE allocator on targets without COM.
//!
//! Task memory carries a 16-byte header holding the block size. BSTRs are
//! task blocks with a 4-byte length prefix, and SAFEARRAY descriptors keep
//! their element type in the 4 bytes before the descriptor, the same place
//! OLE records it for `FADF_HAVEVARTYPE` arrays.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ffi::c_void;
use std::mem::size_of;
use std::ptr;

use crate::com::StatusCode;
use crate::variant::{
    CodecError, FADF_BSTR, FADF_HAVEVARTYPE, FADF_VARIANT, SafeArray, SafeArrayBound, VarType,
    Variant,
};

const HEADER: usize = 16;
const BSTR_PREFIX: usize = 4;

pub(super) unsafe fn task_alloc(size: usize) -> *mut c_void {
    let Some(total) = size.checked_add(HEADER) else {
        return ptr::null_mut();
    };
    let Ok(layout) = Layout::from_size_align(total, HEADER) else {
        return ptr::null_mut();
    };
    // SAFETY: `layout` has a non-zero size.
    let base = unsafe { alloc_zeroed(layout) };
    if base.is_null() {
        return ptr::null_mut();
    }
    // SAFETY: the block is at least HEADER bytes and 16-aligned.
    unsafe {
        base.cast::<usize>().write(total);
        base.add(HEADER).cast()
    }
}

pub(super) unsafe fn task_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: `ptr` came from `task_alloc`, so the header precedes it.
    unsafe {
        let base = ptr.cast::<u8>().sub(HEADER);
        let total = base.cast::<usize>().read();
        dealloc(base, Layout::from_size_align_unchecked(total, HEADER));
    }
}

pub(super) fn alloc_bstr(units: &[u16]) -> *mut u16 {
    let Some(bytes) = units.len().checked_mul(2) else {
        return ptr::null_mut();
    };
    let Ok(prefix) = u32::try_from(bytes) else {
        return ptr::null_mut();
    };
    // SAFETY: the block holds prefix + payload + terminator and is zeroed,
    // so the terminator is already in place.
    unsafe {
        let base = task_alloc(BSTR_PREFIX + bytes + 2).cast::<u8>();
        if base.is_null() {
            return ptr::null_mut();
        }
        base.cast::<u32>().write(prefix);
        let text = base.add(BSTR_PREFIX).cast::<u16>();
        ptr::copy_nonoverlapping(units.as_ptr(), text, units.len());
        text
    }
}

pub(super) unsafe fn free_bstr(bstr: *mut u16) {
    if bstr.is_null() {
        return;
    }
    // SAFETY: a BSTR points just past its length prefix.
    unsafe { task_free(bstr.cast::<u8>().sub(BSTR_PREFIX).cast()) }
}

pub(super) unsafe fn bstr_len(bstr: *const u16) -> usize {
    if bstr.is_null() {
        return 0;
    }
    // SAFETY: the prefix precedes every BSTR.
    let bytes = unsafe { bstr.cast::<u8>().sub(BSTR_PREFIX).cast::<u32>().read() };
    bytes as usize / 2
}

fn element_size(vt: VarType) -> Option<u32> {
    let size = match vt {
        VarType::I1 | VarType::UI1 => 1,
        VarType::I2 | VarType::UI2 | VarType::BOOL => 2,
        VarType::I4
        | VarType::UI4
        | VarType::INT
        | VarType::UINT
        | VarType::R4
        | VarType::ERROR => 4,
        VarType::I8 | VarType::UI8 | VarType::R8 | VarType::DATE | VarType::CY => 8,
        VarType::BSTR => size_of::<*mut u16>(),
        VarType::VARIANT => size_of::<Variant>(),
        _ => return None,
    };
    u32::try_from(size).ok()
}

pub(super) fn create_vector(vt: VarType, len: u32) -> Result<*mut SafeArray, CodecError> {
    let element = element_size(vt).ok_or(CodecError::UnsupportedArrayElement(vt.0))?;
    let data_bytes = (element as usize)
        .checked_mul(len as usize)
        .ok_or(CodecError::Allocation)?;

    let mut features = FADF_HAVEVARTYPE;
    if vt == VarType::BSTR {
        features |= FADF_BSTR;
    } else if vt == VarType::VARIANT {
        features |= FADF_VARIANT;
    }

    // SAFETY: both blocks are freshly allocated, zeroed and sized for what
    // is written into them; on failure nothing leaks.
    unsafe {
        let block = task_alloc(HEADER + size_of::<SafeArray>()).cast::<u8>();
        if block.is_null() {
            return Err(CodecError::Allocation);
        }
        let data = task_alloc(data_bytes);
        if data.is_null() {
            task_free(block.cast());
            return Err(CodecError::Allocation);
        }

        let descriptor = block.add(HEADER).cast::<SafeArray>();
        block.add(HEADER - 4).cast::<u32>().write(u32::from(vt.0));
        descriptor.write(SafeArray {
            dims: 1,
            features,
            element_size: element,
            locks: 0,
            data,
            bounds: [SafeArrayBound {
                elements: len,
                lower_bound: 0,
            }],
        });
        Ok(descriptor)
    }
}

pub(super) unsafe fn destroy_array(psa: *mut SafeArray) -> StatusCode {
    if psa.is_null() {
        return StatusCode::S_OK;
    }
    // SAFETY: `psa` was produced by `create_vector`; elements are owned.
    unsafe {
        let array = &mut *psa;
        if array.locks > 0 {
            return StatusCode::DISP_E_ARRAYISLOCKED;
        }
        let len = array.bounds[0].elements as usize;
        if array.features & FADF_BSTR != 0 {
            let items = array.data.cast::<*mut u16>();
            for i in 0..len {
                free_bstr(*items.add(i));
            }
        } else if array.features & FADF_VARIANT != 0 {
            let items = array.data.cast::<Variant>();
            for i in 0..len {
                variant_clear(items.add(i));
            }
        }
        task_free(array.data);
        task_free(psa.cast::<u8>().sub(HEADER).cast());
    }
    StatusCode::S_OK
}

pub(super) unsafe fn array_vartype(psa: *const SafeArray) -> Result<VarType, StatusCode> {
    if psa.is_null() {
        return Err(StatusCode::E_INVALIDARG);
    }
    // SAFETY: caller guarantees a live descriptor.
    let features = unsafe { (*psa).features };
    if features & FADF_HAVEVARTYPE != 0 {
        // SAFETY: arrays flagged with a vartype carry it just before the descriptor.
        let raw = unsafe { psa.cast::<u8>().sub(4).cast::<u32>().read() };
        Ok(VarType(raw as u16))
    } else if features & FADF_BSTR != 0 {
        Ok(VarType::BSTR)
    } else if features & FADF_VARIANT != 0 {
        Ok(VarType::VARIANT)
    } else {
        Err(StatusCode::E_INVALIDARG)
    }
}

pub(super) unsafe fn access_data(psa: *mut SafeArray) -> Result<*mut c_void, StatusCode> {
    if psa.is_null() {
        return Err(StatusCode::E_INVALIDARG);
    }
    // SAFETY: caller guarantees a live descriptor.
    unsafe {
        (*psa).locks += 1;
        Ok((*psa).data)
    }
}

pub(super) unsafe fn unaccess_data(psa: *mut SafeArray) {
    if psa.is_null() {
        return;
    }
    // SAFETY: caller guarantees a live descriptor.
    unsafe {
        (*psa).locks = (*psa).locks.saturating_sub(1);
    }
}

pub(super) unsafe fn variant_clear(variant: *mut Variant) -> StatusCode {
    if variant.is_null() {
        return StatusCode::E_INVALIDARG;
    }
    // SAFETY: caller owns the payload; the tag selects the live union arm.
    unsafe {
        let vt = VarType((*variant).vt);
        if vt.is_byref() {
            // borrowed payload, nothing to free
        } else if vt.is_array() {
            let status = destroy_array((*variant).data.parray);
            if status.is_err() {
                return status;
            }
        } else if vt == VarType::BSTR {
            free_bstr((*variant).data.bstr_val);
        } else if vt == VarType::UNKNOWN || vt == VarType::DISPATCH {
            let unknown = (*variant).data.punk_val;
            if !unknown.is_null() {
                let vtbl = *unknown.cast::<*const crate::com::vtables::IUnknownVtbl>();
                ((*vtbl).release)(unknown);
            }
        }
        variant.write(Variant::default());
    }
    StatusCode::S_OK
}
