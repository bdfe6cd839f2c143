//! The tagged-union value codec.
//!
//! [`Variant`] mirrors the platform `VARIANT` byte for byte so it can be
//! handed straight to foreign function tables. [`encode`] and [`decode`]
//! convert between it and the native [`Value`].

pub mod date;
mod safearray;
mod value;

use std::fmt;
use std::mem::ManuallyDrop;
use std::str::FromStr;

use thiserror::Error;

use crate::com::StatusCode;
use crate::com::alloc;

pub use date::{
    FileTime, datetime_to_filetime, datetime_to_ole_date, filetime_to_datetime,
    ole_date_to_datetime,
};
pub use safearray::{SafeArray, SafeArrayBound};
pub use value::{ArrayValue, Value};

/// Array descriptor carries its element type in front of the header.
pub const FADF_HAVEVARTYPE: u16 = 0x0080;
/// Array elements are BSTRs.
pub const FADF_BSTR: u16 = 0x0100;
/// Array elements are VARIANTs.
pub const FADF_VARIANT: u16 = 0x0800;

/// Failure to convert between [`Variant`] and [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unsupported type {}", VarType(*.0))]
    UnsupportedType(u16),

    #[error("unsupported array element type {}", VarType(*.0))]
    UnsupportedArrayElement(u16),

    #[error("only one-dimensional arrays are supported, got {0} dimensions")]
    Dimensions(u16),

    #[error("{} value carries a null payload", VarType(*.0))]
    NullPayload(u16),

    #[error("date out of range: {0}")]
    DateOutOfRange(String),

    #[error("array of {0} elements exceeds the wire limit")]
    TooLarge(usize),

    #[error("array data could not be accessed: {0}")]
    Access(StatusCode),

    #[error("foreign allocator returned null")]
    Allocation,
}

/// A VARIANT type tag, optionally combined with [`VarType::ARRAY`] or
/// [`VarType::BYREF`].
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VarType(pub u16);

impl VarType {
    pub const EMPTY: Self = Self(0);
    pub const NULL: Self = Self(1);
    pub const I2: Self = Self(2);
    pub const I4: Self = Self(3);
    pub const R4: Self = Self(4);
    pub const R8: Self = Self(5);
    pub const CY: Self = Self(6);
    pub const DATE: Self = Self(7);
    pub const BSTR: Self = Self(8);
    pub const DISPATCH: Self = Self(9);
    pub const ERROR: Self = Self(10);
    pub const BOOL: Self = Self(11);
    pub const VARIANT: Self = Self(12);
    pub const UNKNOWN: Self = Self(13);
    pub const I1: Self = Self(16);
    pub const UI1: Self = Self(17);
    pub const UI2: Self = Self(18);
    pub const UI4: Self = Self(19);
    pub const I8: Self = Self(20);
    pub const UI8: Self = Self(21);
    pub const INT: Self = Self(22);
    pub const UINT: Self = Self(23);
    pub const RECORD: Self = Self(36);

    pub const ARRAY: u16 = 0x2000;
    pub const BYREF: u16 = 0x4000;
    pub const TYPEMASK: u16 = 0x0fff;

    /// The tag with array/byref flags stripped.
    pub const fn base(self) -> Self {
        Self(self.0 & Self::TYPEMASK)
    }

    pub const fn is_array(self) -> bool {
        self.0 & Self::ARRAY != 0
    }

    pub const fn is_byref(self) -> bool {
        self.0 & Self::BYREF != 0
    }

    pub const fn array_of(self) -> Self {
        Self(self.0 | Self::ARRAY)
    }

    /// Short display name of the base type, `None` for unnamed tags.
    pub fn name(self) -> Option<&'static str> {
        let name = match self.base() {
            Self::EMPTY => "VT_EMPTY",
            Self::NULL => "VT_NULL",
            Self::I2 => "VT_I2",
            Self::I4 => "VT_I4",
            Self::R4 => "VT_R4",
            Self::R8 => "VT_R8",
            Self::CY => "VT_CY",
            Self::DATE => "VT_DATE",
            Self::BSTR => "VT_BSTR",
            Self::DISPATCH => "VT_DISPATCH",
            Self::ERROR => "VT_ERROR",
            Self::BOOL => "VT_BOOL",
            Self::VARIANT => "VT_VARIANT",
            Self::UNKNOWN => "VT_UNKNOWN",
            Self::I1 => "VT_I1",
            Self::UI1 => "VT_UI1",
            Self::UI2 => "VT_UI2",
            Self::UI4 => "VT_UI4",
            Self::I8 => "VT_I8",
            Self::UI8 => "VT_UI8",
            Self::INT => "VT_INT",
            Self::UINT => "VT_UINT",
            Self::RECORD => "VT_RECORD",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_byref() {
            f.write_str("VT_BYREF|")?;
        }
        if self.is_array() {
            f.write_str("VT_ARRAY|")?;
        }
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "VT({})", self.base().0),
        }
    }
}

impl fmt::Debug for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarType({self})")
    }
}

impl FromStr for VarType {
    type Err = String;

    /// Parses the short names accepted on the command line
    /// (`i1 i2 i4 i8 u1 u2 u4 u8 r4 r8 bool str date`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let vt = match s.to_ascii_lowercase().as_str() {
            "i1" => Self::I1,
            "i2" => Self::I2,
            "i4" => Self::I4,
            "i8" => Self::I8,
            "u1" => Self::UI1,
            "u2" => Self::UI2,
            "u4" => Self::UI4,
            "u8" => Self::UI8,
            "r4" => Self::R4,
            "r8" => Self::R8,
            "bool" => Self::BOOL,
            "str" => Self::BSTR,
            "date" => Self::DATE,
            "empty" => Self::EMPTY,
            other => return Err(format!("unknown type '{other}'")),
        };
        Ok(vt)
    }
}

/// Payload of a [`Variant`]. The active arm is selected by [`Variant::vt`].
#[repr(C)]
#[derive(Clone, Copy)]
pub union VariantData {
    pub c_val: i8,
    pub b_val: u8,
    pub i_val: i16,
    pub ui_val: u16,
    pub l_val: i32,
    pub ul_val: u32,
    pub ll_val: i64,
    pub ull_val: u64,
    pub flt_val: f32,
    pub dbl_val: f64,
    pub bool_val: i16,
    pub scode: i32,
    pub date: f64,
    pub bstr_val: *mut u16,
    pub parray: *mut SafeArray,
    pub punk_val: *mut std::ffi::c_void,
    pub record: [*mut std::ffi::c_void; 2],
}

/// Layout-compatible VARIANT.
///
/// A bare `Variant` does not own its payload; see [`OwnedVariant`].
#[repr(C)]
pub struct Variant {
    pub vt: u16,
    pub reserved1: u16,
    pub reserved2: u16,
    pub reserved3: u16,
    pub data: VariantData,
}

impl Default for Variant {
    fn default() -> Self {
        Self {
            vt: VarType::EMPTY.0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
            data: VariantData {
                record: [std::ptr::null_mut(); 2],
            },
        }
    }
}

impl Variant {
    pub const fn var_type(&self) -> VarType {
        VarType(self.vt)
    }

    fn scalar(vt: VarType, data: VariantData) -> Self {
        Self {
            vt: vt.0,
            data,
            ..Self::default()
        }
    }
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Variant({})", self.var_type())
    }
}

/// A [`Variant`] whose payload is owned and released on drop through the
/// foreign allocator.
#[repr(transparent)]
#[derive(Default)]
pub struct OwnedVariant(Variant);

impl OwnedVariant {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Takes ownership of a variant's payload.
    ///
    /// # Safety
    /// The payload must be owned by the caller and not released elsewhere.
    pub unsafe fn from_raw(variant: Variant) -> Self {
        Self(variant)
    }

    /// Moves the payload out of `slot`, leaving `VT_EMPTY` behind.
    ///
    /// # Safety
    /// The payload in `slot` must be owned by the caller.
    pub unsafe fn take(slot: &mut Variant) -> Self {
        Self(std::mem::take(slot))
    }

    pub fn as_variant(&self) -> &Variant {
        &self.0
    }

    pub fn as_mut_ptr(&mut self) -> *mut Variant {
        &mut self.0
    }

    pub fn var_type(&self) -> VarType {
        self.0.var_type()
    }

    /// Decodes a copy; the payload stays owned.
    pub fn to_value(&self) -> Result<Value, CodecError> {
        decode(&self.0)
    }

    /// Decodes and releases the payload immediately afterwards.
    pub fn into_value(self) -> Result<Value, CodecError> {
        decode(&self.0)
    }

    /// Gives up ownership of the payload without releasing it.
    pub fn into_raw(self) -> Variant {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the payload moves out once.
        unsafe { std::ptr::read(&this.0) }
    }
}

impl Drop for OwnedVariant {
    fn drop(&mut self) {
        // SAFETY: the payload is owned by this wrapper.
        let status = unsafe { alloc::variant_clear(&mut self.0) };
        if status.is_err() {
            tracing::warn!(code = %status, vt = %self.0.var_type(), "VariantClear failed");
        }
    }
}

impl fmt::Debug for OwnedVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_value() {
            Ok(value) => write!(f, "OwnedVariant({value:?})"),
            Err(_) => write!(f, "OwnedVariant({})", self.var_type()),
        }
    }
}

/// Encodes a native value. Strings and arrays are allocated with the
/// foreign allocator and released when the result drops (or by whoever
/// takes it over through [`OwnedVariant::into_raw`]).
pub fn encode(value: &Value) -> Result<OwnedVariant, CodecError> {
    let variant = match value {
        Value::Empty => Variant::default(),
        Value::I8(v) => Variant::scalar(VarType::I1, VariantData { c_val: *v }),
        Value::U8(v) => Variant::scalar(VarType::UI1, VariantData { b_val: *v }),
        Value::I16(v) => Variant::scalar(VarType::I2, VariantData { i_val: *v }),
        Value::U16(v) => Variant::scalar(VarType::UI2, VariantData { ui_val: *v }),
        Value::I32(v) => Variant::scalar(VarType::I4, VariantData { l_val: *v }),
        Value::U32(v) => Variant::scalar(VarType::UI4, VariantData { ul_val: *v }),
        Value::I64(v) => Variant::scalar(VarType::I8, VariantData { ll_val: *v }),
        Value::U64(v) => Variant::scalar(VarType::UI8, VariantData { ull_val: *v }),
        Value::F32(v) => Variant::scalar(VarType::R4, VariantData { flt_val: *v }),
        Value::F64(v) => Variant::scalar(VarType::R8, VariantData { dbl_val: *v }),
        Value::Bool(v) => Variant::scalar(
            VarType::BOOL,
            VariantData {
                bool_val: bool_to_wire(*v),
            },
        ),
        Value::String(s) => {
            let units: Vec<u16> = s.encode_utf16().collect();
            let bstr = alloc::alloc_bstr(&units)?;
            Variant::scalar(VarType::BSTR, VariantData { bstr_val: bstr })
        }
        Value::Date(dt) => Variant::scalar(
            VarType::DATE,
            VariantData {
                date: datetime_to_ole_date(dt),
            },
        ),
        Value::Array(array) => {
            let parray = safearray::encode_vector(array)?;
            Variant::scalar(array.element_type().array_of(), VariantData { parray })
        }
    };
    Ok(OwnedVariant(variant))
}

/// Encodes a batch of values for a bulk write.
pub fn encode_all(values: &[Value]) -> Result<Vec<OwnedVariant>, CodecError> {
    values.iter().map(encode).collect()
}

/// Views owned variants as the raw array a bulk call expects.
pub fn as_raw_slice(values: &[OwnedVariant]) -> &[Variant] {
    // SAFETY: `OwnedVariant` is a transparent wrapper around `Variant`.
    unsafe { std::slice::from_raw_parts(values.as_ptr().cast::<Variant>(), values.len()) }
}

/// Decodes a borrowed variant into an owned native value. The variant's
/// payload is left untouched.
pub fn decode(variant: &Variant) -> Result<Value, CodecError> {
    let vt = variant.var_type();
    if vt.is_byref() {
        return Err(CodecError::UnsupportedType(vt.0));
    }
    // SAFETY: each arm reads the union field selected by `vt`.
    unsafe {
        if vt.is_array() {
            return safearray::decode_vector(variant.data.parray, vt.base()).map(Value::Array);
        }
        let data = &variant.data;
        let value = match vt {
            VarType::EMPTY | VarType::NULL => Value::Empty,
            VarType::I1 => Value::I8(data.c_val),
            VarType::UI1 => Value::U8(data.b_val),
            VarType::I2 => Value::I16(data.i_val),
            VarType::UI2 => Value::U16(data.ui_val),
            VarType::I4 | VarType::INT => Value::I32(data.l_val),
            VarType::UI4 | VarType::UINT => Value::U32(data.ul_val),
            VarType::I8 => Value::I64(data.ll_val),
            VarType::UI8 => Value::U64(data.ull_val),
            VarType::R4 => Value::F32(data.flt_val),
            VarType::R8 => Value::F64(data.dbl_val),
            VarType::BOOL => Value::Bool(data.bool_val != 0),
            VarType::BSTR => Value::String(bstr_to_string(data.bstr_val)),
            VarType::DATE => Value::Date(ole_date_to_datetime(data.date)?),
            other => return Err(CodecError::UnsupportedType(other.0)),
        };
        Ok(value)
    }
}

pub(crate) const fn bool_to_wire(value: bool) -> i16 {
    if value { -1 } else { 0 }
}

/// Copies a BSTR into a native string. Null reads as empty.
///
/// # Safety
/// `bstr` must be null or a live BSTR.
pub(crate) unsafe fn bstr_to_string(bstr: *const u16) -> String {
    if bstr.is_null() {
        return String::new();
    }
    // SAFETY: a live BSTR holds `bstr_len` code units.
    unsafe {
        let len = alloc::bstr_len(bstr);
        String::from_utf16_lossy(std::slice::from_raw_parts(bstr, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn roundtrip(value: Value) {
        let encoded = encode(&value).unwrap();
        assert_eq!(encoded.to_value().unwrap(), value);
        assert_eq!(encoded.into_value().unwrap(), value);
    }

    #[test]
    fn test_layout_matches_platform() {
        #[cfg(target_pointer_width = "64")]
        assert_eq!(std::mem::size_of::<Variant>(), 24);
        #[cfg(target_pointer_width = "32")]
        assert_eq!(std::mem::size_of::<Variant>(), 16);
        assert_eq!(std::mem::size_of::<OwnedVariant>(), std::mem::size_of::<Variant>());
    }

    #[test]
    fn test_scalar_roundtrip_boundaries() {
        roundtrip(Value::Empty);
        roundtrip(Value::I8(i8::MIN));
        roundtrip(Value::U8(u8::MAX));
        roundtrip(Value::I16(i16::MIN));
        roundtrip(Value::U16(u16::MAX));
        roundtrip(Value::I32(i32::MIN));
        roundtrip(Value::U32(u32::MAX));
        roundtrip(Value::I64(i64::MIN));
        roundtrip(Value::U64(u64::MAX));
        roundtrip(Value::F32(-1.5e38));
        roundtrip(Value::F64(f64::MAX));
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::String(String::new()));
        roundtrip(Value::String("Grüße, 世界".into()));
        roundtrip(Value::Date(
            Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 58).unwrap()
                + chrono::Duration::milliseconds(999),
        ));
    }

    #[test]
    fn test_array_roundtrip_including_empty() {
        roundtrip(Value::Array(ArrayValue::I32(vec![i32::MIN, 0, i32::MAX])));
        roundtrip(Value::Array(ArrayValue::U64(vec![u64::MAX, 1])));
        roundtrip(Value::Array(ArrayValue::Bool(vec![true, false, true])));
        roundtrip(Value::Array(ArrayValue::String(vec!["a".into(), String::new(), "ç".into()])));
        roundtrip(Value::Array(ArrayValue::F64(vec![])));
        roundtrip(Value::Array(ArrayValue::String(vec![])));
        roundtrip(Value::Array(ArrayValue::Date(vec![
            Utc.with_ymd_and_hms(1899, 12, 29, 6, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
        ])));
    }

    #[test]
    fn test_bool_uses_all_ones() {
        let encoded = encode(&Value::Bool(true)).unwrap();
        assert_eq!(encoded.var_type(), VarType::BOOL);
        // SAFETY: tag is VT_BOOL.
        assert_eq!(unsafe { encoded.as_variant().data.bool_val }, -1);
        let encoded = encode(&Value::Bool(false)).unwrap();
        // SAFETY: tag is VT_BOOL.
        assert_eq!(unsafe { encoded.as_variant().data.bool_val }, 0);
    }

    #[test]
    fn test_int_uint_and_null_decode() {
        let int = Variant::scalar(VarType::INT, VariantData { l_val: -7 });
        assert_eq!(decode(&int).unwrap(), Value::I32(-7));
        let uint = Variant::scalar(VarType::UINT, VariantData { ul_val: 7 });
        assert_eq!(decode(&uint).unwrap(), Value::U32(7));
        let null = Variant::scalar(VarType::NULL, VariantData { ll_val: 0 });
        assert_eq!(decode(&null).unwrap(), Value::Empty);
    }

    #[test]
    fn test_unsupported_tags_fail_explicitly() {
        let cy = Variant::scalar(VarType::CY, VariantData { ll_val: 10_000 });
        assert_eq!(decode(&cy), Err(CodecError::UnsupportedType(VarType::CY.0)));

        let byref = Variant::scalar(VarType(VarType::I4.0 | VarType::BYREF), VariantData {
            ll_val: 0,
        });
        assert!(matches!(decode(&byref), Err(CodecError::UnsupportedType(_))));

        let err = decode(&cy).unwrap_err();
        assert!(err.to_string().contains("unsupported type VT_CY"));
    }

    #[test]
    fn test_unsupported_array_element_fails_whole_array() {
        let psa = alloc::create_vector(VarType::VARIANT, 2).unwrap();
        let variant = OwnedVariant(Variant::scalar(VarType::VARIANT.array_of(), VariantData {
            parray: psa,
        }));
        assert_eq!(
            variant.to_value(),
            Err(CodecError::UnsupportedArrayElement(VarType::VARIANT.0))
        );
    }

    #[test]
    fn test_null_bstr_reads_empty() {
        let v = Variant::scalar(VarType::BSTR, VariantData {
            bstr_val: std::ptr::null_mut(),
        });
        assert_eq!(decode(&v).unwrap(), Value::String(String::new()));
    }

    #[test]
    fn test_into_raw_transfers_ownership() {
        let encoded = encode(&Value::String("owned".into())).unwrap();
        let raw = encoded.into_raw();
        assert_eq!(raw.var_type(), VarType::BSTR);
        // SAFETY: reclaiming the payload released by `into_raw`.
        let back = unsafe { OwnedVariant::from_raw(raw) };
        assert_eq!(back.into_value().unwrap(), Value::String("owned".into()));
    }

    #[test]
    fn test_vartype_names_and_parse() {
        assert_eq!(VarType::I4.to_string(), "VT_I4");
        assert_eq!(VarType::R8.array_of().to_string(), "VT_ARRAY|VT_R8");
        assert_eq!(VarType(0x77).to_string(), "VT(119)");
        assert_eq!("u2".parse::<VarType>().unwrap(), VarType::UI2);
        assert_eq!("STR".parse::<VarType>().unwrap(), VarType::BSTR);
        assert!("x9".parse::<VarType>().is_err());
    }
}
