use crate::com::vtables::IOPCSyncIO;
use crate::com::{Handle, RemoteArray, StatusCode};
use crate::errors::OpcResult;
use crate::records::{DataSource, OpcItemState};
use super::item_mgt::{ensure_non_empty, ensure_same_len};
use crate::variant::Variant;

/// Synchronous I/O functionality (OPC DA 1.0).
///
/// Provides methods for basic synchronous read/write operations
/// with direct server communication.
pub trait SyncIoTrait {
    fn interface(&self) -> OpcResult<&Handle<IOPCSyncIO>>;

    /// Reads values synchronously from items.
    ///
    /// # Arguments
    /// * `source` - Whether to read from cache or device
    /// * `server_handles` - Array of server item handles
    ///
    /// # Returns
    /// Tuple containing:
    /// - Array of item states (value, quality, timestamp)
    /// - Array of per-item error codes
    ///
    /// # Errors
    /// Returns `InvalidArgument` if server_handles is empty
    fn read(
        &self,
        source: DataSource,
        server_handles: &[u32],
    ) -> OpcResult<(RemoteArray<OpcItemState>, RemoteArray<StatusCode>)> {
        let len = ensure_non_empty(server_handles.len(), "server_handles")?;
        let itf = self.interface()?;
        let mut item_values = RemoteArray::new(len);
        let mut errors = RemoteArray::new(len);
        // SAFETY: `server_handles` holds `len` handles; both outputs are owned.
        unsafe {
            (itf.vtable().read)(
                itf.as_raw(),
                source.as_raw(),
                len,
                server_handles.as_ptr(),
                item_values.as_mut_ptr(),
                errors.as_mut_ptr(),
            )
        }
        .ok_or_com("IOPCSyncIO::Read")?;
        Ok((item_values, errors))
    }

    /// Writes values synchronously to items.
    ///
    /// # Arguments
    /// * `server_handles` - Array of server item handles
    /// * `values` - Array of values to write; they stay owned by the caller
    ///
    /// # Returns
    /// Array of per-item error codes
    ///
    /// # Errors
    /// Returns `InvalidArgument` if arrays are empty or have different lengths
    fn write(&self, server_handles: &[u32], values: &[Variant]) -> OpcResult<RemoteArray<StatusCode>> {
        ensure_same_len(server_handles.len(), values.len(), "server_handles and values")?;
        let len = ensure_non_empty(server_handles.len(), "server_handles")?;
        let itf = self.interface()?;
        let mut errors = RemoteArray::new(len);
        // SAFETY: both inputs hold `len` elements; `errors` is owned.
        unsafe {
            (itf.vtable().write)(
                itf.as_raw(),
                len,
                server_handles.as_ptr(),
                values.as_ptr(),
                errors.as_mut_ptr(),
            )
        }
        .ok_or_com("IOPCSyncIO::Write")?;
        Ok(errors)
    }
}
