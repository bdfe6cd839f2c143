use std::fmt;

use chrono::{DateTime, Utc};

use super::VarType;

/// A native value that can cross the foreign boundary.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Empty,
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    String(String),
    Date(DateTime<Utc>),
    Array(ArrayValue),
}

/// A homogeneous one-dimensional array.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayValue {
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
    String(Vec<String>),
    Date(Vec<DateTime<Utc>>),
}

impl Value {
    /// The wire tag this value encodes to.
    pub fn var_type(&self) -> VarType {
        match self {
            Self::Empty => VarType::EMPTY,
            Self::I8(_) => VarType::I1,
            Self::U8(_) => VarType::UI1,
            Self::I16(_) => VarType::I2,
            Self::U16(_) => VarType::UI2,
            Self::I32(_) => VarType::I4,
            Self::U32(_) => VarType::UI4,
            Self::I64(_) => VarType::I8,
            Self::U64(_) => VarType::UI8,
            Self::F32(_) => VarType::R4,
            Self::F64(_) => VarType::R8,
            Self::Bool(_) => VarType::BOOL,
            Self::String(_) => VarType::BSTR,
            Self::Date(_) => VarType::DATE,
            Self::Array(array) => array.element_type().array_of(),
        }
    }

    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Parses `text` as a value of type `vt` (scalar types only).
    ///
    /// # Examples
    /// ```
    /// use opc_da_client::variant::{Value, VarType};
    ///
    /// assert_eq!(Value::parse_as("42", VarType::I4), Ok(Value::I32(42)));
    /// assert_eq!(Value::parse_as("true", VarType::BOOL), Ok(Value::Bool(true)));
    /// assert!(Value::parse_as("abc", VarType::UI1).is_err());
    /// ```
    pub fn parse_as(text: &str, vt: VarType) -> Result<Self, String> {
        fn num<T: std::str::FromStr>(text: &str, vt: VarType) -> Result<T, String>
        where
            T::Err: fmt::Display,
        {
            text.trim()
                .parse::<T>()
                .map_err(|e| format!("'{text}' is not a valid {vt}: {e}"))
        }

        let value = match vt {
            VarType::EMPTY => Self::Empty,
            VarType::I1 => Self::I8(num(text, vt)?),
            VarType::UI1 => Self::U8(num(text, vt)?),
            VarType::I2 => Self::I16(num(text, vt)?),
            VarType::UI2 => Self::U16(num(text, vt)?),
            VarType::I4 | VarType::INT => Self::I32(num(text, vt)?),
            VarType::UI4 | VarType::UINT => Self::U32(num(text, vt)?),
            VarType::I8 => Self::I64(num(text, vt)?),
            VarType::UI8 => Self::U64(num(text, vt)?),
            VarType::R4 => Self::F32(num(text, vt)?),
            VarType::R8 => Self::F64(num(text, vt)?),
            VarType::BOOL => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => Self::Bool(true),
                "false" | "0" | "off" => Self::Bool(false),
                _ => return Err(format!("'{text}' is not a valid {vt}")),
            },
            VarType::BSTR => Self::String(text.to_string()),
            VarType::DATE => Self::Date(
                DateTime::parse_from_rfc3339(text.trim())
                    .map_err(|e| format!("'{text}' is not an RFC 3339 date: {e}"))?
                    .with_timezone(&Utc),
            ),
            other => return Err(format!("cannot parse values of type {other}")),
        };
        Ok(value)
    }

    /// Best-effort guess used when the caller gives no type: integer, then
    /// float, then boolean, then string.
    pub fn infer(text: &str) -> Self {
        let trimmed = text.trim();
        if let Ok(v) = trimmed.parse::<i32>() {
            Self::I32(v)
        } else if let Ok(v) = trimmed.parse::<f64>() {
            Self::F64(v)
        } else if let Ok(v) = trimmed.parse::<bool>() {
            Self::Bool(v)
        } else {
            Self::String(text.to_string())
        }
    }
}

impl ArrayValue {
    /// The element type tag (without the array flag).
    pub fn element_type(&self) -> VarType {
        match self {
            Self::I8(_) => VarType::I1,
            Self::U8(_) => VarType::UI1,
            Self::I16(_) => VarType::I2,
            Self::U16(_) => VarType::UI2,
            Self::I32(_) => VarType::I4,
            Self::U32(_) => VarType::UI4,
            Self::I64(_) => VarType::I8,
            Self::U64(_) => VarType::UI8,
            Self::F32(_) => VarType::R4,
            Self::F64(_) => VarType::R8,
            Self::Bool(_) => VarType::BOOL,
            Self::String(_) => VarType::BSTR,
            Self::Date(_) => VarType::DATE,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::I8(v) => v.len(),
            Self::U8(v) => v.len(),
            Self::I16(v) => v.len(),
            Self::U16(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::U32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::U64(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
            Self::Bool(v) => v.len(),
            Self::String(v) => v.len(),
            Self::Date(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn write_list<T>(
    f: &mut fmt::Formatter<'_>,
    items: &[T],
    each: impl Fn(&mut fmt::Formatter<'_>, &T) -> fmt::Result,
) -> fmt::Result {
    f.write_str("[")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        each(f, item)?;
    }
    f.write_str("]")
}

fn fmt_date(date: &DateTime<Utc>) -> String {
    date.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

impl fmt::Display for ArrayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I8(v) => write_list(f, v, |f, x| write!(f, "{x}")),
            Self::U8(v) => write_list(f, v, |f, x| write!(f, "{x}")),
            Self::I16(v) => write_list(f, v, |f, x| write!(f, "{x}")),
            Self::U16(v) => write_list(f, v, |f, x| write!(f, "{x}")),
            Self::I32(v) => write_list(f, v, |f, x| write!(f, "{x}")),
            Self::U32(v) => write_list(f, v, |f, x| write!(f, "{x}")),
            Self::I64(v) => write_list(f, v, |f, x| write!(f, "{x}")),
            Self::U64(v) => write_list(f, v, |f, x| write!(f, "{x}")),
            Self::F32(v) => write_list(f, v, |f, x| write!(f, "{x}")),
            Self::F64(v) => write_list(f, v, |f, x| write!(f, "{x}")),
            Self::Bool(v) => write_list(f, v, |f, x| write!(f, "{x}")),
            Self::String(v) => write_list(f, v, |f, x| write!(f, "\"{x}\"")),
            Self::Date(v) => write_list(f, v, |f, x| f.write_str(&fmt_date(x))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::I8(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v:.2}"),
            Self::F64(v) => write!(f, "{v:.2}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "\"{v}\""),
            Self::Date(v) => f.write_str(&fmt_date(v)),
            Self::Array(v) => write!(f, "Array[{}] {v}", v.len()),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }

            impl From<Vec<$ty>> for ArrayValue {
                fn from(value: Vec<$ty>) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

impl_from! {
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    bool => Bool,
    String => String,
    DateTime<Utc> => Date,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<ArrayValue> for Value {
    fn from(value: ArrayValue) -> Self {
        Self::Array(value)
    }
}

impl TryFrom<Value> for i32 {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::I8(v) => Ok(v.into()),
            Value::U8(v) => Ok(v.into()),
            Value::I16(v) => Ok(v.into()),
            Value::U16(v) => Ok(v.into()),
            Value::I32(v) => Ok(v),
            other => Err(other),
        }
    }
}

impl TryFrom<Value> for f64 {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::F32(v) => Ok(v.into()),
            Value::F64(v) => Ok(v),
            Value::I32(v) => Ok(v.into()),
            Value::U32(v) => Ok(v.into()),
            other => Err(other),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(v) => Ok(v),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_cli_format() {
        assert_eq!(Value::I32(99).to_string(), "99");
        assert_eq!(Value::F64(3.5).to_string(), "3.50");
        assert_eq!(Value::Bool(false).to_string(), "false");
        assert_eq!(Value::from("world").to_string(), "\"world\"");
        assert_eq!(Value::Empty.to_string(), "Empty");
        assert_eq!(
            Value::Array(vec![1u16, 2, 3].into()).to_string(),
            "Array[3] [1, 2, 3]"
        );
    }

    #[test]
    fn test_var_type_of_arrays() {
        let v = Value::Array(ArrayValue::String(vec![]));
        assert_eq!(v.var_type(), VarType::BSTR.array_of());
        assert!(v.var_type().is_array());
    }

    #[test]
    fn test_parse_as() {
        assert_eq!(Value::parse_as(" -5 ", VarType::I2), Ok(Value::I16(-5)));
        assert_eq!(Value::parse_as("off", VarType::BOOL), Ok(Value::Bool(false)));
        assert_eq!(
            Value::parse_as("hello", VarType::BSTR),
            Ok(Value::String("hello".into()))
        );
        assert!(Value::parse_as("256", VarType::UI1).is_err());
        assert!(Value::parse_as("1", VarType::CY).is_err());
        let date = Value::parse_as("2024-01-02T03:04:05Z", VarType::DATE).unwrap();
        assert_eq!(date.var_type(), VarType::DATE);
    }

    #[test]
    fn test_infer() {
        assert_eq!(Value::infer("42"), Value::I32(42));
        assert_eq!(Value::infer("4.5"), Value::F64(4.5));
        assert_eq!(Value::infer("true"), Value::Bool(true));
        assert_eq!(Value::infer("abc"), Value::String("abc".into()));
    }

    #[test]
    fn test_try_from() {
        assert_eq!(i32::try_from(Value::U16(7)), Ok(7));
        assert!(i32::try_from(Value::U32(7)).is_err());
        assert_eq!(f64::try_from(Value::I32(2)), Ok(2.0));
    }
}
