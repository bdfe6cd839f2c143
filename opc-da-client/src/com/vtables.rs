//! Function tables and identifiers of every foreign interface used by the
//! client, in exact slot order.
//!
//! Each table starts with [`IUnknownVtbl`]. Entry points take the object
//! pointer first and return a [`StatusCode`] unless noted.

#![allow(clippy::type_complexity)]

use std::ffi::c_void;

use crate::com::{Guid, Interface, StatusCode};
use crate::records::{OpcItemDef, OpcItemResult, OpcItemState, OpcServerStatus};
use crate::variant::{FileTime, Variant};

type This = *mut c_void;
type Out = *mut *mut c_void;

#[repr(C)]
pub struct IUnknownVtbl {
    pub query_interface: unsafe extern "system" fn(This, *const Guid, Out) -> StatusCode,
    pub add_ref: unsafe extern "system" fn(This) -> u32,
    pub release: unsafe extern "system" fn(This) -> u32,
}

#[repr(C)]
pub struct IOPCServerVtbl {
    pub base: IUnknownVtbl,
    pub add_group: unsafe extern "system" fn(
        This,
        name: *const u16,
        active: i32,
        requested_update_rate: u32,
        client_group: u32,
        time_bias: *const i32,
        percent_deadband: *const f32,
        locale_id: u32,
        server_group: *mut u32,
        revised_update_rate: *mut u32,
        riid: *const Guid,
        group: Out,
    ) -> StatusCode,
    pub get_error_string:
        unsafe extern "system" fn(This, error: StatusCode, locale_id: u32, *mut *mut u16) -> StatusCode,
    pub get_group_by_name:
        unsafe extern "system" fn(This, name: *const u16, riid: *const Guid, Out) -> StatusCode,
    pub get_status: unsafe extern "system" fn(This, *mut *mut OpcServerStatus) -> StatusCode,
    pub remove_group: unsafe extern "system" fn(This, server_group: u32, force: i32) -> StatusCode,
    pub create_group_enumerator:
        unsafe extern "system" fn(This, scope: u32, riid: *const Guid, Out) -> StatusCode,
}

#[repr(C)]
pub struct IOPCCommonVtbl {
    pub base: IUnknownVtbl,
    pub set_locale_id: unsafe extern "system" fn(This, u32) -> StatusCode,
    pub get_locale_id: unsafe extern "system" fn(This, *mut u32) -> StatusCode,
    pub query_available_locale_ids:
        unsafe extern "system" fn(This, count: *mut u32, *mut *mut u32) -> StatusCode,
    pub get_error_string:
        unsafe extern "system" fn(This, error: StatusCode, *mut *mut u16) -> StatusCode,
    pub set_client_name: unsafe extern "system" fn(This, *const u16) -> StatusCode,
}

#[repr(C)]
pub struct IOPCItemMgtVtbl {
    pub base: IUnknownVtbl,
    pub add_items: unsafe extern "system" fn(
        This,
        count: u32,
        defs: *const OpcItemDef,
        results: *mut *mut OpcItemResult,
        errors: *mut *mut StatusCode,
    ) -> StatusCode,
    pub validate_items: unsafe extern "system" fn(
        This,
        count: u32,
        defs: *const OpcItemDef,
        blob_update: i32,
        results: *mut *mut OpcItemResult,
        errors: *mut *mut StatusCode,
    ) -> StatusCode,
    pub remove_items: unsafe extern "system" fn(
        This,
        count: u32,
        server_handles: *const u32,
        errors: *mut *mut StatusCode,
    ) -> StatusCode,
    pub set_active_state: unsafe extern "system" fn(
        This,
        count: u32,
        server_handles: *const u32,
        active: i32,
        errors: *mut *mut StatusCode,
    ) -> StatusCode,
    pub set_client_handles: unsafe extern "system" fn(
        This,
        count: u32,
        server_handles: *const u32,
        client_handles: *const u32,
        errors: *mut *mut StatusCode,
    ) -> StatusCode,
    pub set_datatypes: unsafe extern "system" fn(
        This,
        count: u32,
        server_handles: *const u32,
        requested_types: *const u16,
        errors: *mut *mut StatusCode,
    ) -> StatusCode,
    pub create_enumerator: unsafe extern "system" fn(This, riid: *const Guid, Out) -> StatusCode,
}

#[repr(C)]
pub struct IOPCSyncIOVtbl {
    pub base: IUnknownVtbl,
    pub read: unsafe extern "system" fn(
        This,
        source: u32,
        count: u32,
        server_handles: *const u32,
        states: *mut *mut OpcItemState,
        errors: *mut *mut StatusCode,
    ) -> StatusCode,
    pub write: unsafe extern "system" fn(
        This,
        count: u32,
        server_handles: *const u32,
        values: *const Variant,
        errors: *mut *mut StatusCode,
    ) -> StatusCode,
}

#[repr(C)]
pub struct IOPCAsyncIO2Vtbl {
    pub base: IUnknownVtbl,
    pub read: unsafe extern "system" fn(
        This,
        count: u32,
        server_handles: *const u32,
        transaction_id: u32,
        cancel_id: *mut u32,
        errors: *mut *mut StatusCode,
    ) -> StatusCode,
    pub write: unsafe extern "system" fn(
        This,
        count: u32,
        server_handles: *const u32,
        values: *const Variant,
        transaction_id: u32,
        cancel_id: *mut u32,
        errors: *mut *mut StatusCode,
    ) -> StatusCode,
    pub refresh2: unsafe extern "system" fn(
        This,
        source: u32,
        transaction_id: u32,
        cancel_id: *mut u32,
    ) -> StatusCode,
    pub cancel2: unsafe extern "system" fn(This, cancel_id: u32) -> StatusCode,
    pub set_enable: unsafe extern "system" fn(This, enable: i32) -> StatusCode,
    pub get_enable: unsafe extern "system" fn(This, enable: *mut i32) -> StatusCode,
}

#[repr(C)]
pub struct IOPCGroupStateMgtVtbl {
    pub base: IUnknownVtbl,
    pub get_state: unsafe extern "system" fn(
        This,
        update_rate: *mut u32,
        active: *mut i32,
        name: *mut *mut u16,
        time_bias: *mut i32,
        percent_deadband: *mut f32,
        locale_id: *mut u32,
        client_group: *mut u32,
        server_group: *mut u32,
    ) -> StatusCode,
    pub set_state: unsafe extern "system" fn(
        This,
        requested_update_rate: *const u32,
        revised_update_rate: *mut u32,
        active: *const i32,
        time_bias: *const i32,
        percent_deadband: *const f32,
        locale_id: *const u32,
        client_group: *const u32,
    ) -> StatusCode,
    pub set_name: unsafe extern "system" fn(This, *const u16) -> StatusCode,
    pub clone_group:
        unsafe extern "system" fn(This, name: *const u16, riid: *const Guid, Out) -> StatusCode,
}

#[repr(C)]
pub struct IConnectionPointContainerVtbl {
    pub base: IUnknownVtbl,
    pub enum_connection_points: unsafe extern "system" fn(This, Out) -> StatusCode,
    pub find_connection_point:
        unsafe extern "system" fn(This, riid: *const Guid, Out) -> StatusCode,
}

#[repr(C)]
pub struct IConnectionPointVtbl {
    pub base: IUnknownVtbl,
    pub get_connection_interface: unsafe extern "system" fn(This, *mut Guid) -> StatusCode,
    pub get_connection_point_container: unsafe extern "system" fn(This, Out) -> StatusCode,
    pub advise: unsafe extern "system" fn(This, sink: This, cookie: *mut u32) -> StatusCode,
    pub unadvise: unsafe extern "system" fn(This, cookie: u32) -> StatusCode,
    pub enum_connections: unsafe extern "system" fn(This, Out) -> StatusCode,
}

#[repr(C)]
pub struct IEnumStringVtbl {
    pub base: IUnknownVtbl,
    pub next: unsafe extern "system" fn(
        This,
        celt: u32,
        elements: *mut *mut u16,
        fetched: *mut u32,
    ) -> StatusCode,
    pub skip: unsafe extern "system" fn(This, celt: u32) -> StatusCode,
    pub reset: unsafe extern "system" fn(This) -> StatusCode,
    pub clone: unsafe extern "system" fn(This, Out) -> StatusCode,
}

#[repr(C)]
pub struct IEnumGuidVtbl {
    pub base: IUnknownVtbl,
    pub next:
        unsafe extern "system" fn(This, celt: u32, elements: *mut Guid, fetched: *mut u32) -> StatusCode,
    pub skip: unsafe extern "system" fn(This, celt: u32) -> StatusCode,
    pub reset: unsafe extern "system" fn(This) -> StatusCode,
    pub clone: unsafe extern "system" fn(This, Out) -> StatusCode,
}

#[repr(C)]
pub struct IOPCBrowseServerAddressSpaceVtbl {
    pub base: IUnknownVtbl,
    pub query_organization: unsafe extern "system" fn(This, *mut u32) -> StatusCode,
    pub change_browse_position:
        unsafe extern "system" fn(This, direction: u32, name: *const u16) -> StatusCode,
    pub browse_opc_item_ids: unsafe extern "system" fn(
        This,
        browse_type: u32,
        filter: *const u16,
        data_type: u16,
        access_rights: u32,
        Out,
    ) -> StatusCode,
    pub get_item_id:
        unsafe extern "system" fn(This, data_item: *const u16, *mut *mut u16) -> StatusCode,
    pub browse_access_paths:
        unsafe extern "system" fn(This, item_id: *const u16, Out) -> StatusCode,
}

#[repr(C)]
pub struct IOPCItemPropertiesVtbl {
    pub base: IUnknownVtbl,
    pub query_available_properties: unsafe extern "system" fn(
        This,
        item_id: *const u16,
        count: *mut u32,
        property_ids: *mut *mut u32,
        descriptions: *mut *mut *mut u16,
        data_types: *mut *mut u16,
    ) -> StatusCode,
    pub get_item_properties: unsafe extern "system" fn(
        This,
        item_id: *const u16,
        count: u32,
        property_ids: *const u32,
        data: *mut *mut Variant,
        errors: *mut *mut StatusCode,
    ) -> StatusCode,
    pub lookup_item_ids: unsafe extern "system" fn(
        This,
        item_id: *const u16,
        count: u32,
        property_ids: *const u32,
        new_item_ids: *mut *mut *mut u16,
        errors: *mut *mut StatusCode,
    ) -> StatusCode,
}

#[repr(C)]
pub struct IOPCServerList2Vtbl {
    pub base: IUnknownVtbl,
    pub enum_classes_of_categories: unsafe extern "system" fn(
        This,
        implemented_count: u32,
        implemented: *const Guid,
        required_count: u32,
        required: *const Guid,
        Out,
    ) -> StatusCode,
    pub get_class_details: unsafe extern "system" fn(
        This,
        clsid: *const Guid,
        prog_id: *mut *mut u16,
        user_type: *mut *mut u16,
        version_independent_prog_id: *mut *mut u16,
    ) -> StatusCode,
    pub clsid_from_prog_id:
        unsafe extern "system" fn(This, prog_id: *const u16, clsid: *mut Guid) -> StatusCode,
}

#[repr(C)]
pub struct IOPCDataCallbackVtbl {
    pub base: IUnknownVtbl,
    pub on_data_change: unsafe extern "system" fn(
        This,
        transaction_id: u32,
        group: u32,
        master_quality: StatusCode,
        master_error: StatusCode,
        count: u32,
        client_items: *const u32,
        values: *const Variant,
        qualities: *const u16,
        timestamps: *const FileTime,
        errors: *const StatusCode,
    ) -> StatusCode,
    pub on_read_complete: unsafe extern "system" fn(
        This,
        transaction_id: u32,
        group: u32,
        master_quality: StatusCode,
        master_error: StatusCode,
        count: u32,
        client_items: *const u32,
        values: *const Variant,
        qualities: *const u16,
        timestamps: *const FileTime,
        errors: *const StatusCode,
    ) -> StatusCode,
    pub on_write_complete: unsafe extern "system" fn(
        This,
        transaction_id: u32,
        group: u32,
        master_error: StatusCode,
        count: u32,
        client_items: *const u32,
        errors: *const StatusCode,
    ) -> StatusCode,
    pub on_cancel_complete:
        unsafe extern "system" fn(This, transaction_id: u32, group: u32) -> StatusCode,
}

#[repr(C)]
pub struct IOPCShutdownVtbl {
    pub base: IUnknownVtbl,
    pub shutdown_request: unsafe extern "system" fn(This, reason: *const u16) -> StatusCode,
}

macro_rules! interfaces {
    ($($(#[$meta:meta])* $name:ident: $vtable:ty = $iid:literal;)*) => {
        $(
            $(#[$meta])*
            pub struct $name;

            // SAFETY: the vtable declares the interface's slots in order.
            unsafe impl Interface for $name {
                type Vtable = $vtable;
                const IID: Guid = Guid::from_u128($iid);
                const NAME: &'static str = stringify!($name);
            }
        )*
    };
}

interfaces! {
    /// Server control: groups, status, error strings.
    IOPCServer: IOPCServerVtbl = 0x39c13a4d_011e_11d0_9675_0020afd8adb3;
    IOPCCommon: IOPCCommonVtbl = 0xf31dfde2_07b6_11d2_b2d8_0060083ba1fb;
    IOPCBrowseServerAddressSpace: IOPCBrowseServerAddressSpaceVtbl = 0x39c13a4f_011e_11d0_9675_0020afd8adb3;
    /// Group state: name, rate, active flag, deadband.
    IOPCGroupStateMgt: IOPCGroupStateMgtVtbl = 0x39c13a50_011e_11d0_9675_0020afd8adb3;
    IOPCSyncIO: IOPCSyncIOVtbl = 0x39c13a52_011e_11d0_9675_0020afd8adb3;
    IOPCItemMgt: IOPCItemMgtVtbl = 0x39c13a54_011e_11d0_9675_0020afd8adb3;
    /// Inbound callback contract implemented by the client.
    IOPCDataCallback: IOPCDataCallbackVtbl = 0x39c13a70_011e_11d0_9675_0020afd8adb3;
    IOPCAsyncIO2: IOPCAsyncIO2Vtbl = 0x39c13a71_011e_11d0_9675_0020afd8adb3;
    IOPCItemProperties: IOPCItemPropertiesVtbl = 0x39c13a72_011e_11d0_9675_0020afd8adb3;
    /// Inbound shutdown notice implemented by the client.
    IOPCShutdown: IOPCShutdownVtbl = 0xf31dfde1_07b6_11d2_b2d8_0060083ba1fb;
    IConnectionPointContainer: IConnectionPointContainerVtbl = 0xb196b284_bab4_101a_b69c_00aa00341d07;
    IConnectionPoint: IConnectionPointVtbl = 0xb196b286_bab4_101a_b69c_00aa00341d07;
    IEnumString: IEnumStringVtbl = 0x00000101_0000_0000_c000_000000000046;
    IEnumGuid: IEnumGuidVtbl = 0x0002e000_0000_0000_c000_000000000046;
    /// The server list's own GUID enumerator, laid out like `IEnumGUID`.
    IOPCEnumGuid: IEnumGuidVtbl = 0x55c382c8_21c7_4e88_96c1_becfb1e3f483;
    IOPCServerList2: IOPCServerList2Vtbl = 0x9dd0b56c_ad9e_43ee_8305_487f3188bf7a;
}

/// Component category of OPC DA 1.0 servers.
pub const CATID_OPC_DA10: Guid = Guid::from_u128(0x63d5f430_cfe4_11d1_b2c8_0060083ba1fb);
/// Component category of OPC DA 2.0 servers.
pub const CATID_OPC_DA20: Guid = Guid::from_u128(0x63d5f432_cfe4_11d1_b2c8_0060083ba1fb);
/// Component category of OPC DA 3.0 servers.
pub const CATID_OPC_DA30: Guid = Guid::from_u128(0xcc603642_66d7_48f1_b69a_b625e73652d7);
/// The OPC server enumerator (OpcEnum).
pub const CLSID_OPC_SERVER_LIST: Guid = Guid::from_u128(0x13486d51_4821_11d2_a494_3cb306c10000);

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_vtable_slot_counts() {
        let slot = size_of::<usize>();
        assert_eq!(size_of::<IUnknownVtbl>(), 3 * slot);
        assert_eq!(size_of::<IOPCServerVtbl>(), 9 * slot);
        assert_eq!(size_of::<IOPCItemMgtVtbl>(), 10 * slot);
        assert_eq!(size_of::<IOPCAsyncIO2Vtbl>(), 9 * slot);
        assert_eq!(size_of::<IOPCDataCallbackVtbl>(), 7 * slot);
        assert_eq!(size_of::<IConnectionPointVtbl>(), 8 * slot);
    }

    #[test]
    fn test_identifiers() {
        assert_eq!(
            IOPCItemMgt::IID.to_string(),
            "39C13A54-011E-11D0-9675-0020AFD8ADB3"
        );
        assert_eq!(IOPCDataCallback::NAME, "IOPCDataCallback");
        assert_ne!(IOPCEnumGuid::IID, IEnumGuid::IID);
    }
}
