use crate::com::vtables::IOPCGroupStateMgt;
use crate::com::{Handle, LocalWide, RemoteString};
use crate::errors::OpcResult;
use crate::records::{GroupHandle, GroupState};

/// Requested changes to a group's state. `None` leaves a field untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GroupStateChange {
    pub update_rate: Option<u32>,
    pub active: Option<bool>,
    pub time_bias: Option<i32>,
    pub percent_deadband: Option<f32>,
    pub locale_id: Option<u32>,
    pub client_handle: Option<GroupHandle>,
}

fn opt_ptr<T>(value: Option<&T>) -> *const T {
    value.map_or(std::ptr::null(), std::ptr::from_ref)
}

/// Group state management functionality.
///
/// Provides methods to read and change the update rate, active flag,
/// deadband, locale and name of a group.
pub trait GroupStateMgtTrait {
    fn interface(&self) -> OpcResult<&Handle<IOPCGroupStateMgt>>;

    /// Gets the current state of the group.
    fn get_state(&self) -> OpcResult<GroupState> {
        let itf = self.interface()?;
        let mut state = GroupState::default();
        let mut active = 0i32;
        let mut name = RemoteString::null();
        // SAFETY: every output is a local slot; `name` owns the string.
        unsafe {
            (itf.vtable().get_state)(
                itf.as_raw(),
                &mut state.update_rate,
                &mut active,
                name.as_mut_ptr(),
                &mut state.time_bias,
                &mut state.percent_deadband,
                &mut state.locale_id,
                &mut state.client_handle.0,
                &mut state.server_handle.0,
            )
        }
        .ok_or_com("IOPCGroupStateMgt::GetState")?;
        state.active = active != 0;
        state.name = name.to_string_lossy();
        Ok(state)
    }

    /// Changes the group's state.
    ///
    /// # Returns
    /// The update rate the server actually applied
    fn set_state(&self, change: &GroupStateChange) -> OpcResult<u32> {
        let itf = self.interface()?;
        let active = change.active.map(i32::from);
        let client_handle = change.client_handle.map(|h| h.0);
        let mut revised_update_rate = 0u32;
        // SAFETY: each pointer is null or refers to a local that outlives the call.
        unsafe {
            (itf.vtable().set_state)(
                itf.as_raw(),
                opt_ptr(change.update_rate.as_ref()),
                &mut revised_update_rate,
                opt_ptr(active.as_ref()),
                opt_ptr(change.time_bias.as_ref()),
                opt_ptr(change.percent_deadband.as_ref()),
                opt_ptr(change.locale_id.as_ref()),
                opt_ptr(client_handle.as_ref()),
            )
        }
        .ok_or_com("IOPCGroupStateMgt::SetState")?;
        Ok(revised_update_rate)
    }

    /// Renames the group.
    fn set_name(&self, name: &str) -> OpcResult<()> {
        let itf = self.interface()?;
        let name = LocalWide::new(name);
        // SAFETY: `name` outlives the call.
        unsafe { (itf.vtable().set_name)(itf.as_raw(), name.as_ptr()) }
            .ok_or_com("IOPCGroupStateMgt::SetName")
    }
}
