use crate::com::vtables::{IOPCGroupStateMgt, IOPCServer};
use crate::com::{Handle, Interface, LocalWide, RemotePointer, RemoteString, StatusCode};
use crate::errors::{OpcError, OpcResult};
use crate::records::{GroupHandle, OpcServerStatus, ServerStatus};

/// A group freshly created by [`ServerTrait::add_group`].
#[derive(Debug)]
pub struct AddedGroup {
    pub server_handle: GroupHandle,
    /// The rate the server granted, which may differ from the request.
    pub revised_update_rate: u32,
    pub state_mgt: Handle<IOPCGroupStateMgt>,
}

/// Parameters of a new group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRequest<'a> {
    pub name: &'a str,
    pub active: bool,
    pub update_rate: u32,
    pub client_handle: GroupHandle,
    pub time_bias: i32,
    pub percent_deadband: f32,
    pub locale_id: u32,
}

/// OPC server functionality (OPC DA 1.0 and later).
///
/// Provides methods to manage groups and query server status.
pub trait ServerTrait {
    fn interface(&self) -> OpcResult<&Handle<IOPCServer>>;

    /// Adds a new group to the server.
    ///
    /// # Arguments
    /// * `request` - Name, rate, active flag and the client-side handle
    ///
    /// # Returns
    /// The server handle, the revised update rate and the group's
    /// `IOPCGroupStateMgt` handle. `OPC_S_UNSUPPORTEDRATE` counts as success.
    ///
    /// # Errors
    /// `OPC_E_DUPLICATENAME` when the name is taken, or any transport failure.
    fn add_group(&self, request: &GroupRequest<'_>) -> OpcResult<AddedGroup> {
        let name = LocalWide::new(request.name);
        let mut server_handle = 0u32;
        let mut revised_update_rate = 0u32;
        let mut group = std::ptr::null_mut();
        let server = self.interface()?;

        // SAFETY: every input outlives the call and every output is a
        // local slot; the group reference is taken over below.
        let status = unsafe {
            (server.vtable().add_group)(
                server.as_raw(),
                name.as_ptr(),
                i32::from(request.active),
                request.update_rate,
                request.client_handle.0,
                &request.time_bias,
                &request.percent_deadband,
                request.locale_id,
                &mut server_handle,
                &mut revised_update_rate,
                &IOPCGroupStateMgt::IID,
                &mut group,
            )
        };
        // SAFETY: a non-null output is a counted group reference.
        let state_mgt = unsafe { Handle::<IOPCGroupStateMgt>::from_raw(group) };
        status.ok_or_com("IOPCServer::AddGroup")?;
        let state_mgt =
            state_mgt.ok_or_else(|| OpcError::com(StatusCode::E_POINTER, "IOPCServer::AddGroup"))?;

        Ok(AddedGroup {
            server_handle: GroupHandle(server_handle),
            revised_update_rate,
            state_mgt,
        })
    }

    /// Gets the server's text for a status code in the given locale.
    fn get_error_string(&self, code: StatusCode, locale_id: u32) -> OpcResult<String> {
        let server = self.interface()?;
        let mut output = RemoteString::null();
        // SAFETY: `output` owns whatever string the server allocates.
        unsafe { (server.vtable().get_error_string)(server.as_raw(), code, locale_id, output.as_mut_ptr()) }
            .ok_or_com("IOPCServer::GetErrorString")?;
        Ok(output.to_string_lossy())
    }

    /// Gets a private group by name.
    fn get_group_by_name(&self, name: &str) -> OpcResult<Handle<IOPCGroupStateMgt>> {
        let server = self.interface()?;
        let name = LocalWide::new(name);
        let mut group = std::ptr::null_mut();
        // SAFETY: `name` outlives the call; the output is taken over below.
        let status = unsafe {
            (server.vtable().get_group_by_name)(
                server.as_raw(),
                name.as_ptr(),
                &IOPCGroupStateMgt::IID,
                &mut group,
            )
        };
        // SAFETY: a non-null output is a counted group reference.
        let handle = unsafe { Handle::<IOPCGroupStateMgt>::from_raw(group) };
        status.ok_or_com("IOPCServer::GetGroupByName")?;
        handle.ok_or_else(|| OpcError::com(StatusCode::E_POINTER, "IOPCServer::GetGroupByName"))
    }

    /// Gets the current server status.
    ///
    /// # Returns
    /// The decoded status; the foreign record and its vendor string are
    /// freed before returning.
    fn get_status(&self) -> OpcResult<ServerStatus> {
        let server = self.interface()?;
        let mut status = RemotePointer::<OpcServerStatus>::null();
        // SAFETY: `status` owns the record the server allocates.
        unsafe { (server.vtable().get_status)(server.as_raw(), status.as_mut_ptr()) }
            .ok_or_com("IOPCServer::GetStatus")?;
        let raw = status
            .get_mut()
            .ok_or_else(|| OpcError::com(StatusCode::E_POINTER, "IOPCServer::GetStatus"))?;
        // SAFETY: the vendor string inside the record is ours to free.
        unsafe { ServerStatus::take(raw) }
    }

    /// Removes a group from the server.
    ///
    /// # Arguments
    /// * `server_group` - Server handle of the group
    /// * `force` - Remove even if the client still holds references
    fn remove_group(&self, server_group: GroupHandle, force: bool) -> OpcResult<()> {
        let server = self.interface()?;
        // SAFETY: plain call on a live handle.
        unsafe { (server.vtable().remove_group)(server.as_raw(), server_group.0, i32::from(force)) }
            .ok_or_com("IOPCServer::RemoveGroup")
    }
}

/// A bare server handle, as kept by groups to remove themselves.
impl ServerTrait for Handle<IOPCServer> {
    fn interface(&self) -> OpcResult<&Handle<IOPCServer>> {
        Ok(self)
    }
}
