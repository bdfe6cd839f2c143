//! One-dimensional SAFEARRAY encoding.

use std::ffi::c_void;

use chrono::{DateTime, Utc};

use super::{
    ArrayValue, CodecError, VarType, bool_to_wire, bstr_to_string, datetime_to_ole_date,
    ole_date_to_datetime,
};
use crate::com::alloc;

/// Bounds of one array dimension.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafeArrayBound {
    pub elements: u32,
    pub lower_bound: i32,
}

/// Layout-compatible SAFEARRAY descriptor, declared with one dimension.
#[repr(C)]
#[derive(Debug)]
pub struct SafeArray {
    pub dims: u16,
    pub features: u16,
    pub element_size: u32,
    pub locks: u32,
    pub data: *mut c_void,
    pub bounds: [SafeArrayBound; 1],
}

/// Unlocks and optionally destroys an array when dropped.
struct Locked {
    psa: *mut SafeArray,
    data: *mut c_void,
    destroy: bool,
}

impl Locked {
    /// # Safety
    /// `psa` must be a live array descriptor.
    unsafe fn new(psa: *mut SafeArray, destroy: bool) -> Result<Self, CodecError> {
        // SAFETY: forwarded contract.
        match unsafe { alloc::access_data(psa) } {
            Ok(data) => Ok(Self { psa, data, destroy }),
            Err(code) => {
                if destroy {
                    // SAFETY: the caller handed the array over for destruction.
                    unsafe { alloc::destroy_array(psa) };
                }
                Err(CodecError::Access(code))
            }
        }
    }

    /// Keeps the array alive after unlocking.
    fn keep(mut self) -> *mut SafeArray {
        self.destroy = false;
        self.psa
    }

    /// # Safety
    /// The array must hold at least `items.len()` elements of type `T`.
    unsafe fn write<T: Copy>(&self, items: impl ExactSizeIterator<Item = T>) {
        let base = self.data.cast::<T>();
        for (i, item) in items.enumerate() {
            // SAFETY: forwarded contract.
            unsafe { base.add(i).write(item) };
        }
    }

    /// # Safety
    /// The array must hold `len` initialized elements of type `T`.
    unsafe fn read<T: Copy>(&self, len: usize) -> Vec<T> {
        if len == 0 {
            return Vec::new();
        }
        // SAFETY: forwarded contract.
        unsafe { std::slice::from_raw_parts(self.data.cast::<T>(), len).to_vec() }
    }
}

impl Drop for Locked {
    fn drop(&mut self) {
        // SAFETY: paired with the successful `access_data` in `new`.
        unsafe {
            alloc::unaccess_data(self.psa);
            if self.destroy {
                alloc::destroy_array(self.psa);
            }
        }
    }
}

/// Allocates a foreign vector (lower bound 0) and copies `array` into it.
pub(super) fn encode_vector(array: &ArrayValue) -> Result<*mut SafeArray, CodecError> {
    let len = array.len();
    let count = u32::try_from(len).map_err(|_| CodecError::TooLarge(len))?;
    let psa = alloc::create_vector(array.element_type(), count)?;
    // SAFETY: `psa` is a fresh vector of `len` elements of the matching
    // element type; on failure the guard destroys it with every BSTR
    // written so far.
    unsafe {
        let locked = Locked::new(psa, true)?;
        match array {
            ArrayValue::I8(v) => locked.write(v.iter().copied()),
            ArrayValue::U8(v) => locked.write(v.iter().copied()),
            ArrayValue::I16(v) => locked.write(v.iter().copied()),
            ArrayValue::U16(v) => locked.write(v.iter().copied()),
            ArrayValue::I32(v) => locked.write(v.iter().copied()),
            ArrayValue::U32(v) => locked.write(v.iter().copied()),
            ArrayValue::I64(v) => locked.write(v.iter().copied()),
            ArrayValue::U64(v) => locked.write(v.iter().copied()),
            ArrayValue::F32(v) => locked.write(v.iter().copied()),
            ArrayValue::F64(v) => locked.write(v.iter().copied()),
            ArrayValue::Bool(v) => locked.write(v.iter().map(|b| bool_to_wire(*b))),
            ArrayValue::Date(v) => locked.write(v.iter().map(datetime_to_ole_date)),
            ArrayValue::String(v) => {
                let slots = locked.data.cast::<*mut u16>();
                for (i, s) in v.iter().enumerate() {
                    let units: Vec<u16> = s.encode_utf16().collect();
                    slots.add(i).write(alloc::alloc_bstr(&units)?);
                }
            }
        }
        Ok(locked.keep())
    }
}

/// Copies a foreign vector into a native array. The header's element type
/// decides the decoding; `declared` is only a fallback when the header
/// does not record one. Any unsupported element type fails the whole array.
///
/// # Safety
/// `psa` must be null or a live array descriptor.
pub(super) unsafe fn decode_vector(
    psa: *mut SafeArray,
    declared: VarType,
) -> Result<ArrayValue, CodecError> {
    if psa.is_null() {
        return Err(CodecError::NullPayload(declared.array_of().0));
    }
    // SAFETY: `psa` is a live descriptor.
    unsafe {
        let dims = (*psa).dims;
        if dims != 1 {
            return Err(CodecError::Dimensions(dims));
        }
        let vt = alloc::array_vartype(psa).unwrap_or(declared);
        let len = (*psa).bounds[0].elements as usize;
        let locked = Locked::new(psa, false)?;
        let array = match vt {
            VarType::I1 => ArrayValue::I8(locked.read(len)),
            VarType::UI1 => ArrayValue::U8(locked.read(len)),
            VarType::I2 => ArrayValue::I16(locked.read(len)),
            VarType::UI2 => ArrayValue::U16(locked.read(len)),
            VarType::I4 | VarType::INT => ArrayValue::I32(locked.read(len)),
            VarType::UI4 | VarType::UINT => ArrayValue::U32(locked.read(len)),
            VarType::I8 => ArrayValue::I64(locked.read(len)),
            VarType::UI8 => ArrayValue::U64(locked.read(len)),
            VarType::R4 => ArrayValue::F32(locked.read(len)),
            VarType::R8 => ArrayValue::F64(locked.read(len)),
            VarType::BOOL => ArrayValue::Bool(
                locked.read::<i16>(len).into_iter().map(|b| b != 0).collect(),
            ),
            VarType::DATE => ArrayValue::Date(
                locked
                    .read::<f64>(len)
                    .into_iter()
                    .map(ole_date_to_datetime)
                    .collect::<Result<Vec<DateTime<Utc>>, _>>()?,
            ),
            VarType::BSTR => {
                let mut strings = Vec::with_capacity(len);
                for bstr in locked.read::<*mut u16>(len) {
                    strings.push(bstr_to_string(bstr));
                }
                ArrayValue::String(strings)
            }
            other => return Err(CodecError::UnsupportedArrayElement(other.0)),
        };
        Ok(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_sets_header() {
        let psa = encode_vector(&ArrayValue::I16(vec![1, -2, 3])).unwrap();
        // SAFETY: fresh vector, destroyed once.
        unsafe {
            assert_eq!((*psa).dims, 1);
            assert_eq!((*psa).locks, 0);
            assert_eq!((*psa).bounds[0].elements, 3);
            assert_eq!((*psa).bounds[0].lower_bound, 0);
            assert_eq!(alloc::array_vartype(psa), Ok(VarType::I2));
            assert_eq!(
                decode_vector(psa, VarType::EMPTY).unwrap(),
                ArrayValue::I16(vec![1, -2, 3])
            );
            assert_eq!((*psa).locks, 0);
            alloc::destroy_array(psa);
        }
    }

    #[test]
    fn test_decode_null_array() {
        // SAFETY: null is explicitly allowed.
        let err = unsafe { decode_vector(std::ptr::null_mut(), VarType::I4) }.unwrap_err();
        assert_eq!(err, CodecError::NullPayload(VarType::I4.array_of().0));
    }

    #[test]
    fn test_decode_rejects_multi_dimensional() {
        let psa = alloc::create_vector(VarType::I4, 4).unwrap();
        // SAFETY: header tweak on a vector we own; restored before destroy.
        unsafe {
            (*psa).dims = 2;
            assert_eq!(
                decode_vector(psa, VarType::I4).unwrap_err(),
                CodecError::Dimensions(2)
            );
            (*psa).dims = 1;
            alloc::destroy_array(psa);
        }
    }
}
