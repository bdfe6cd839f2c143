use std::fmt;

use crate::errors::{OpcError, OpcResult};

/// A signed 32-bit COM/OPC result code. Negative values are failures.
///
/// # Examples
///
/// ```
/// use opc_da_client::com::StatusCode;
///
/// assert!(StatusCode::S_OK.is_ok());
/// assert!(StatusCode::OPC_E_UNKNOWNITEMID.is_err());
/// assert_eq!(StatusCode::OPC_E_UNKNOWNITEMID.to_string(), "0xC0040007");
/// ```
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatusCode(pub i32);

impl StatusCode {
    pub const S_OK: Self = Self(0);
    pub const S_FALSE: Self = Self(1);

    pub const E_NOTIMPL: Self = Self::from_u32(0x8000_4001);
    pub const E_NOINTERFACE: Self = Self::from_u32(0x8000_4002);
    pub const E_POINTER: Self = Self::from_u32(0x8000_4003);
    pub const E_ABORT: Self = Self::from_u32(0x8000_4004);
    pub const E_FAIL: Self = Self::from_u32(0x8000_4005);
    pub const E_PENDING: Self = Self::from_u32(0x8000_000A);
    pub const E_UNEXPECTED: Self = Self::from_u32(0x8000_FFFF);
    pub const E_ACCESSDENIED: Self = Self::from_u32(0x8007_0005);
    pub const E_HANDLE: Self = Self::from_u32(0x8007_0006);
    pub const E_OUTOFMEMORY: Self = Self::from_u32(0x8007_000E);
    pub const E_INVALIDARG: Self = Self::from_u32(0x8007_0057);

    pub const DISP_E_TYPEMISMATCH: Self = Self::from_u32(0x8002_0005);
    pub const DISP_E_BADVARTYPE: Self = Self::from_u32(0x8002_0008);
    pub const DISP_E_ARRAYISLOCKED: Self = Self::from_u32(0x8002_000D);

    pub const CONNECT_E_NOCONNECTION: Self = Self::from_u32(0x8004_0200);
    pub const CONNECT_E_CANNOTCONNECT: Self = Self::from_u32(0x8004_0202);
    pub const CLASS_E_CLASSNOTAVAILABLE: Self = Self::from_u32(0x8004_0111);
    pub const REGDB_E_CLASSNOTREG: Self = Self::from_u32(0x8004_0154);
    pub const CO_E_CLASSSTRING: Self = Self::from_u32(0x8004_01F3);
    pub const CO_E_SERVER_EXEC_FAILURE: Self = Self::from_u32(0x8008_0005);
    pub const RPC_S_SERVER_UNAVAILABLE: Self = Self::from_u32(0x8007_06BA);
    pub const RPC_S_CALL_FAILED: Self = Self::from_u32(0x8007_06BE);
    pub const RPC_S_CALL_FAILED_DNE: Self = Self::from_u32(0x8007_06BF);

    pub const OPC_E_INVALIDHANDLE: Self = Self::from_u32(0xC004_0001);
    pub const OPC_E_BADTYPE: Self = Self::from_u32(0xC004_0004);
    pub const OPC_E_PUBLIC: Self = Self::from_u32(0xC004_0005);
    pub const OPC_E_BADRIGHTS: Self = Self::from_u32(0xC004_0006);
    pub const OPC_E_UNKNOWNITEMID: Self = Self::from_u32(0xC004_0007);
    pub const OPC_E_INVALIDITEMID: Self = Self::from_u32(0xC004_0008);
    pub const OPC_E_INVALIDFILTER: Self = Self::from_u32(0xC004_0009);
    pub const OPC_E_UNKNOWNPATH: Self = Self::from_u32(0xC004_000A);
    pub const OPC_E_RANGE: Self = Self::from_u32(0xC004_000B);
    pub const OPC_E_DUPLICATENAME: Self = Self::from_u32(0xC004_000C);
    pub const OPC_S_UNSUPPORTEDRATE: Self = Self::from_u32(0x0004_000D);
    pub const OPC_S_CLAMP: Self = Self::from_u32(0x0004_000E);
    pub const OPC_S_INUSE: Self = Self::from_u32(0x0004_000F);
    pub const OPC_E_INVALIDCONFIG: Self = Self::from_u32(0xC004_0010);
    pub const OPC_E_NOTFOUND: Self = Self::from_u32(0xC004_0011);
    pub const OPC_E_INVALID_PID: Self = Self::from_u32(0xC004_0203);

    pub const fn from_u32(value: u32) -> Self {
        Self(value as i32)
    }

    pub const fn as_u32(self) -> u32 {
        self.0 as u32
    }

    pub const fn is_ok(self) -> bool {
        self.0 >= 0
    }

    pub const fn is_err(self) -> bool {
        self.0 < 0
    }

    /// Converts a failing code into [`OpcError::Com`] tagged with `context`.
    pub fn ok_or_com(self, context: &str) -> OpcResult<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(OpcError::com(self, context))
        }
    }

    /// Static description of well-known OPC codes.
    pub fn describe(self) -> Option<&'static str> {
        let message = match self {
            Self::OPC_E_INVALIDHANDLE => "The value of the handle is invalid",
            Self::OPC_E_BADTYPE => {
                "The server cannot convert the data between the specified format/ requested data type and the canonical data type"
            }
            Self::OPC_E_PUBLIC => "The requested operation cannot be done on a public group",
            Self::OPC_E_BADRIGHTS => "The Items AccessRights do not allow the operation",
            Self::OPC_E_UNKNOWNITEMID => {
                "The item ID is not defined in the server address space (on add or validate) or no longer exists in the server address space (for read or write)"
            }
            Self::OPC_E_INVALIDITEMID => "The item ID doesn't conform to the server's syntax",
            Self::OPC_E_INVALIDFILTER => "The filter string was not valid",
            Self::OPC_E_UNKNOWNPATH => "The item's access path is not known to the server",
            Self::OPC_E_RANGE => "The value was out of range",
            Self::OPC_E_DUPLICATENAME => "Duplicate name not allowed",
            Self::OPC_S_UNSUPPORTEDRATE => {
                "The server does not support the requested data rate but will use the closest available rate"
            }
            Self::OPC_S_CLAMP => "A value passed to WRITE was accepted but the output was clamped",
            Self::OPC_S_INUSE => {
                "The operation cannot be performed because the object is being referenced"
            }
            Self::OPC_E_INVALIDCONFIG => "The server's configuration file is an invalid format",
            Self::OPC_E_NOTFOUND => "Requested Object was not found",
            Self::OPC_E_INVALID_PID => "The passed property ID is not valid for the item",
            _ => return None,
        };
        Some(message)
    }

    /// Actionable hint for common COM/DCOM failures.
    pub fn hint(self) -> Option<&'static str> {
        crate::errors::friendly_hresult_hint(self)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.as_u32())
    }
}

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusCode({self})")
    }
}

impl From<i32> for StatusCode {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

#[cfg(windows)]
impl From<windows::core::HRESULT> for StatusCode {
    fn from(value: windows::core::HRESULT) -> Self {
        Self(value.0)
    }
}

#[cfg(windows)]
impl From<windows::core::Error> for StatusCode {
    fn from(value: windows::core::Error) -> Self {
        Self(value.code().0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_convention() {
        assert!(StatusCode::S_FALSE.is_ok());
        assert!(StatusCode::OPC_S_CLAMP.is_ok());
        assert!(StatusCode::E_FAIL.is_err());
        assert_eq!(StatusCode::E_NOINTERFACE.as_u32(), 0x8000_4002);
    }

    #[test]
    fn test_describe_known_and_unknown() {
        assert_eq!(
            StatusCode::OPC_E_INVALIDHANDLE.describe(),
            Some("The value of the handle is invalid")
        );
        assert_eq!(StatusCode::from_u32(0xC004_1234).describe(), None);
    }

    #[test]
    fn test_ok_or_com_wraps_failure() {
        assert!(StatusCode::S_FALSE.ok_or_com("Next").is_ok());
        let err = StatusCode::E_FAIL.ok_or_com("AddGroup").unwrap_err();
        assert_eq!(err.code(), Some(StatusCode::E_FAIL));
        assert!(err.to_string().contains("AddGroup"));
    }
}
