use thiserror::Error;

use crate::com::StatusCode;
use crate::variant::CodecError;

/// Result type alias for OPC DA operations.
pub type OpcResult<T> = Result<T, OpcError>;

/// Centralized error enum for the OPC DA client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OpcError {
    /// A foreign call could not be completed (object gone, capability
    /// unsupported, transport failure). Always aborts the whole operation.
    #[error("COM error: {context} failed with {code} ({})", .code.hint().unwrap_or("No hint available"))]
    Com { code: StatusCode, context: String },

    /// A VARIANT could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Connection-related errors (e.g., host unreachable, resolution failure).
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Server-specific errors reported via OPC status codes.
    #[error("Server error: {0} (0x{1:08X})")]
    Server(String, u32),

    /// Errors during data type conversion.
    #[error("Data conversion failed: {0}")]
    Conversion(String),

    /// A caller-supplied argument was rejected before any foreign call.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted in an invalid state (e.g., group already released).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Lookup by name or handle found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Feature not implemented or supported by the target OPC server.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Catch-all for unexpected internal failures.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OpcError {
    pub fn com(code: StatusCode, context: impl Into<String>) -> Self {
        Self::Com {
            code,
            context: context.into(),
        }
    }

    /// The foreign status code behind this error, if there is one.
    pub fn code(&self) -> Option<StatusCode> {
        match self {
            Self::Com { code, .. } => Some(*code),
            Self::Server(_, code) => Some(StatusCode::from_u32(*code)),
            _ => None,
        }
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        Self::Internal(format!("{what} lock poisoned"))
    }
}

impl From<anyhow::Error> for OpcError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<tokio::task::JoinError> for OpcError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("Async task join failed: {err}"))
    }
}

impl From<std::num::TryFromIntError> for OpcError {
    fn from(err: std::num::TryFromIntError) -> Self {
        Self::Conversion(format!("Integer conversion error: {err}"))
    }
}

/// A single-item call reports the item's own failure as a server error.
impl From<ItemError> for OpcError {
    fn from(err: ItemError) -> Self {
        Self::Server(err.message, err.code.as_u32())
    }
}

impl From<crate::com::GuidParseError> for OpcError {
    fn from(err: crate::com::GuidParseError) -> Self {
        Self::Conversion(err.to_string())
    }
}

/// A per-item failure inside an otherwise successful bulk call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({code})")]
pub struct ItemError {
    code: StatusCode,
    message: String,
}

impl ItemError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Builds an item error described through the static table only.
    pub fn from_code(code: StatusCode) -> Self {
        Self::new(code, describe_static(code))
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Message used when neither the static table nor the server knows a code.
pub const UNKNOWN_ERROR: &str = "unknown error";

/// Describes a code through the static table, or [`UNKNOWN_ERROR`].
pub fn describe_static(code: StatusCode) -> String {
    code.describe().unwrap_or(UNKNOWN_ERROR).to_string()
}

/// Helper to format a status code with friendly hints.
pub fn format_status(code: StatusCode) -> String {
    match friendly_hresult_hint(code) {
        Some(hint) => format!("{code}: {hint}"),
        None => code.to_string(),
    }
}

/// Maps known COM/DCOM error codes to actionable user hints.
pub fn friendly_hresult_hint(code: StatusCode) -> Option<&'static str> {
    match code.as_u32() {
        0x8004_0112 => Some("Server license does not permit OPC client connections"),
        0x8008_0005 => Some("Server process failed to start, check if it is installed and running"),
        0x8007_0005 => {
            Some("Access denied, DCOM launch/activation permissions not configured for this user")
        }
        0x8007_06BA => Some("RPC server unavailable, the target host may be offline or blocking RPC"),
        0x8007_06F4 => Some("COM marshalling error, try restarting the OPC server"),
        0x8004_0154 => Some("Server is not registered on this machine"),
        0x8004_0200 => Some("The object does not expose the requested connection point"),
        0x8004_0202 => Some("The server refused the callback sink"),
        0x8000_4002 => Some("The object does not support the requested interface (E_NOINTERFACE)"),
        0x8000_4003 => Some("Invalid pointer (E_POINTER)"),
        0xC004_0004 => {
            Some("Data type mismatch, server cannot convert the written value (OPC_E_BADTYPE)")
        }
        0xC004_0006 => Some("Server rejected access, the item may be read-only (OPC_E_BADRIGHTS)"),
        0xC004_0007 => Some("Item ID not found in server address space (OPC_E_UNKNOWNITEMID)"),
        0xC004_0008 => Some("Item ID syntax is invalid for this server (OPC_E_INVALIDITEMID)"),
        _ => None,
    }
}

/// Maps an [`OpcError`] to a friendly COM hint if it carries a status code.
///
/// # Examples
/// ```
/// use opc_da_client::{OpcError, friendly_com_hint};
/// use opc_da_client::com::StatusCode;
///
/// let err = OpcError::com(StatusCode::REGDB_E_CLASSNOTREG, "CoCreateInstanceEx");
/// assert_eq!(friendly_com_hint(&err), Some("Server is not registered on this machine"));
///
/// let other = OpcError::Internal("boom".into());
/// assert_eq!(friendly_com_hint(&other), None);
/// ```
pub fn friendly_com_hint(error: &OpcError) -> Option<&'static str> {
    error.code().and_then(friendly_hresult_hint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_friendly_hint_known_codes() {
        assert_eq!(
            friendly_hresult_hint(StatusCode::from_u32(0x8007_06F4)),
            Some("COM marshalling error, try restarting the OPC server")
        );
        assert_eq!(
            friendly_hresult_hint(StatusCode::OPC_E_BADRIGHTS),
            Some("Server rejected access, the item may be read-only (OPC_E_BADRIGHTS)")
        );
        assert_eq!(
            friendly_hresult_hint(StatusCode::OPC_E_BADTYPE),
            Some("Data type mismatch, server cannot convert the written value (OPC_E_BADTYPE)")
        );
    }

    #[test]
    fn test_friendly_hint_unknown_code() {
        assert_eq!(friendly_hresult_hint(StatusCode::from_u32(0x8000_1234)), None);
    }

    #[test]
    fn test_format_status() {
        assert_eq!(
            format_status(StatusCode::REGDB_E_CLASSNOTREG),
            "0x80040154: Server is not registered on this machine"
        );
        assert_eq!(format_status(StatusCode::from_u32(0xC004_0099)), "0xC0040099");
    }

    #[test]
    fn test_item_error_display() {
        let err = ItemError::from_code(StatusCode::OPC_E_RANGE);
        assert_eq!(err.to_string(), "The value was out of range (0xC004000B)");
        let unknown = ItemError::from_code(StatusCode::from_u32(0xC004_0099));
        assert_eq!(unknown.message(), UNKNOWN_ERROR);
    }

    #[test]
    fn test_com_error_display_includes_hint() {
        let err = OpcError::com(StatusCode::RPC_S_SERVER_UNAVAILABLE, "GetStatus");
        let text = err.to_string();
        assert!(text.contains("GetStatus"));
        assert!(text.contains("0x800706BA"));
        assert!(text.contains("RPC server unavailable"));
    }
}
