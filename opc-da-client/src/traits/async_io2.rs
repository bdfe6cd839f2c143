use super::item_mgt::{ensure_non_empty, ensure_same_len};
use crate::com::vtables::IOPCAsyncIO2;
use crate::com::{Handle, RemoteArray, StatusCode};
use crate::errors::OpcResult;
use crate::records::DataSource;
use crate::variant::Variant;

/// Asynchronous I/O functionality (OPC DA 2.0).
///
/// Results arrive through the group's `IOPCDataCallback` connection; each
/// call returns a cancel id that can be handed to [`AsyncIo2Trait::cancel2`].
pub trait AsyncIo2Trait {
    fn interface(&self) -> OpcResult<&Handle<IOPCAsyncIO2>>;

    /// Starts an asynchronous device read.
    ///
    /// # Arguments
    /// * `server_handles` - Array of server item handles
    /// * `transaction_id` - Echoed back in the read-complete callback
    ///
    /// # Returns
    /// The cancel id and the per-item error codes. Only items without an
    /// error appear in the callback.
    fn read(
        &self,
        server_handles: &[u32],
        transaction_id: u32,
    ) -> OpcResult<(u32, RemoteArray<StatusCode>)> {
        let len = ensure_non_empty(server_handles.len(), "server_handles")?;
        let itf = self.interface()?;
        let mut cancel_id = 0u32;
        let mut errors = RemoteArray::new(len);
        // SAFETY: `server_handles` holds `len` handles; outputs are owned.
        unsafe {
            (itf.vtable().read)(
                itf.as_raw(),
                len,
                server_handles.as_ptr(),
                transaction_id,
                &mut cancel_id,
                errors.as_mut_ptr(),
            )
        }
        .ok_or_com("IOPCAsyncIO2::Read")?;
        Ok((cancel_id, errors))
    }

    /// Starts an asynchronous write.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if arrays are empty or have different lengths
    fn write(
        &self,
        server_handles: &[u32],
        values: &[Variant],
        transaction_id: u32,
    ) -> OpcResult<(u32, RemoteArray<StatusCode>)> {
        ensure_same_len(server_handles.len(), values.len(), "server_handles and values")?;
        let len = ensure_non_empty(server_handles.len(), "server_handles")?;
        let itf = self.interface()?;
        let mut cancel_id = 0u32;
        let mut errors = RemoteArray::new(len);
        // SAFETY: both inputs hold `len` elements; outputs are owned.
        unsafe {
            (itf.vtable().write)(
                itf.as_raw(),
                len,
                server_handles.as_ptr(),
                values.as_ptr(),
                transaction_id,
                &mut cancel_id,
                errors.as_mut_ptr(),
            )
        }
        .ok_or_com("IOPCAsyncIO2::Write")?;
        Ok((cancel_id, errors))
    }

    /// Asks for a data-change callback carrying every active item.
    ///
    /// # Returns
    /// The cancel id of the refresh transaction
    fn refresh2(&self, source: DataSource, transaction_id: u32) -> OpcResult<u32> {
        let itf = self.interface()?;
        let mut cancel_id = 0u32;
        // SAFETY: `cancel_id` is a valid output slot.
        unsafe {
            (itf.vtable().refresh2)(itf.as_raw(), source.as_raw(), transaction_id, &mut cancel_id)
        }
        .ok_or_com("IOPCAsyncIO2::Refresh2")?;
        Ok(cancel_id)
    }

    /// Requests cancellation of an outstanding transaction. Advisory only.
    fn cancel2(&self, cancel_id: u32) -> OpcResult<()> {
        let itf = self.interface()?;
        // SAFETY: plain call on a live handle.
        unsafe { (itf.vtable().cancel2)(itf.as_raw(), cancel_id) }.ok_or_com("IOPCAsyncIO2::Cancel2")
    }

    /// Enables or disables data-change callbacks for the group.
    fn set_enable(&self, enable: bool) -> OpcResult<()> {
        let itf = self.interface()?;
        // SAFETY: plain call on a live handle.
        unsafe { (itf.vtable().set_enable)(itf.as_raw(), i32::from(enable)) }
            .ok_or_com("IOPCAsyncIO2::SetEnable")
    }

    fn get_enable(&self) -> OpcResult<bool> {
        let itf = self.interface()?;
        let mut enable = 0i32;
        // SAFETY: `enable` is a valid output slot.
        unsafe { (itf.vtable().get_enable)(itf.as_raw(), &mut enable) }
            .ok_or_com("IOPCAsyncIO2::GetEnable")?;
        Ok(enable != 0)
    }
}
