use crate::com::vtables::IOPCItemMgt;
use crate::com::{Handle, RemoteArray, StatusCode};
use crate::errors::{OpcError, OpcResult};
use crate::records::{OpcItemDef, OpcItemResult};

pub(crate) fn ensure_non_empty(len: usize, what: &str) -> OpcResult<u32> {
    if len == 0 {
        return Err(OpcError::InvalidArgument(format!("{what} cannot be empty")));
    }
    Ok(u32::try_from(len)?)
}

pub(crate) fn ensure_same_len(left: usize, right: usize, what: &str) -> OpcResult<()> {
    if left != right {
        return Err(OpcError::InvalidArgument(format!(
            "{what} must have the same length"
        )));
    }
    Ok(())
}

/// Item management functionality.
///
/// Provides methods to add, validate and remove items and to change their
/// attributes. Every call returns one status per input element.
pub trait ItemMgtTrait {
    fn interface(&self) -> OpcResult<&Handle<IOPCItemMgt>>;

    /// Adds items to the group.
    ///
    /// # Arguments
    /// * `items` - Raw item definitions; the strings they point to must stay
    ///   alive for the call
    ///
    /// # Returns
    /// Tuple containing:
    /// - Array of item results (server handle, canonical type, access rights)
    /// - Array of per-item error codes
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `items` is empty
    fn add_items(
        &self,
        items: &[OpcItemDef],
    ) -> OpcResult<(RemoteArray<OpcItemResult>, RemoteArray<StatusCode>)> {
        let len = ensure_non_empty(items.len(), "items")?;
        let itf = self.interface()?;
        let mut results = RemoteArray::new(len);
        let mut errors = RemoteArray::new(len);
        // SAFETY: `items` holds `len` records and both outputs are owned.
        unsafe {
            (itf.vtable().add_items)(
                itf.as_raw(),
                len,
                items.as_ptr(),
                results.as_mut_ptr(),
                errors.as_mut_ptr(),
            )
        }
        .ok_or_com("IOPCItemMgt::AddItems")?;
        Ok((results, errors))
    }

    /// Validates items without adding them.
    ///
    /// # Arguments
    /// * `items` - Raw item definitions
    /// * `blob_update` - Whether the server should return updated blobs
    fn validate_items(
        &self,
        items: &[OpcItemDef],
        blob_update: bool,
    ) -> OpcResult<(RemoteArray<OpcItemResult>, RemoteArray<StatusCode>)> {
        let len = ensure_non_empty(items.len(), "items")?;
        let itf = self.interface()?;
        let mut results = RemoteArray::new(len);
        let mut errors = RemoteArray::new(len);
        // SAFETY: as in `add_items`.
        unsafe {
            (itf.vtable().validate_items)(
                itf.as_raw(),
                len,
                items.as_ptr(),
                i32::from(blob_update),
                results.as_mut_ptr(),
                errors.as_mut_ptr(),
            )
        }
        .ok_or_com("IOPCItemMgt::ValidateItems")?;
        Ok((results, errors))
    }

    /// Removes items from the group.
    fn remove_items(&self, server_handles: &[u32]) -> OpcResult<RemoteArray<StatusCode>> {
        let len = ensure_non_empty(server_handles.len(), "server_handles")?;
        let itf = self.interface()?;
        let mut errors = RemoteArray::new(len);
        // SAFETY: `server_handles` holds `len` handles; `errors` is owned.
        unsafe {
            (itf.vtable().remove_items)(
                itf.as_raw(),
                len,
                server_handles.as_ptr(),
                errors.as_mut_ptr(),
            )
        }
        .ok_or_com("IOPCItemMgt::RemoveItems")?;
        Ok(errors)
    }

    /// Sets the active state of items.
    fn set_active_state(
        &self,
        server_handles: &[u32],
        active: bool,
    ) -> OpcResult<RemoteArray<StatusCode>> {
        let len = ensure_non_empty(server_handles.len(), "server_handles")?;
        let itf = self.interface()?;
        let mut errors = RemoteArray::new(len);
        // SAFETY: as in `remove_items`.
        unsafe {
            (itf.vtable().set_active_state)(
                itf.as_raw(),
                len,
                server_handles.as_ptr(),
                i32::from(active),
                errors.as_mut_ptr(),
            )
        }
        .ok_or_com("IOPCItemMgt::SetActiveState")?;
        Ok(errors)
    }

    /// Replaces the client handles of items.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the arrays are empty or have different lengths
    fn set_client_handles(
        &self,
        server_handles: &[u32],
        client_handles: &[u32],
    ) -> OpcResult<RemoteArray<StatusCode>> {
        ensure_same_len(
            server_handles.len(),
            client_handles.len(),
            "server_handles and client_handles",
        )?;
        let len = ensure_non_empty(server_handles.len(), "server_handles")?;
        let itf = self.interface()?;
        let mut errors = RemoteArray::new(len);
        // SAFETY: both inputs hold `len` handles; `errors` is owned.
        unsafe {
            (itf.vtable().set_client_handles)(
                itf.as_raw(),
                len,
                server_handles.as_ptr(),
                client_handles.as_ptr(),
                errors.as_mut_ptr(),
            )
        }
        .ok_or_com("IOPCItemMgt::SetClientHandles")?;
        Ok(errors)
    }

    /// Changes the requested data types of items.
    fn set_datatypes(
        &self,
        server_handles: &[u32],
        requested_types: &[u16],
    ) -> OpcResult<RemoteArray<StatusCode>> {
        ensure_same_len(
            server_handles.len(),
            requested_types.len(),
            "server_handles and requested_types",
        )?;
        let len = ensure_non_empty(server_handles.len(), "server_handles")?;
        let itf = self.interface()?;
        let mut errors = RemoteArray::new(len);
        // SAFETY: both inputs hold `len` elements; `errors` is owned.
        unsafe {
            (itf.vtable().set_datatypes)(
                itf.as_raw(),
                len,
                server_handles.as_ptr(),
                requested_types.as_ptr(),
                errors.as_mut_ptr(),
            )
        }
        .ok_or_com("IOPCItemMgt::SetDatatypes")?;
        Ok(errors)
    }
}
