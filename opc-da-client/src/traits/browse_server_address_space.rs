use crate::com::vtables::{IEnumString, IOPCBrowseServerAddressSpace};
use crate::com::{Handle, LocalWide, RemoteString, StringIterator};
use crate::errors::{OpcError, OpcResult};
use crate::records::{AccessRights, BrowseDirection, BrowseType, NamespaceType};
use crate::variant::VarType;

/// Server address space browsing functionality (OPC DA 2.0).
///
/// Provides methods to navigate and query the hierarchical structure
/// of items in the server's address space.
pub trait BrowseServerAddressSpaceTrait {
    fn interface(&self) -> OpcResult<&Handle<IOPCBrowseServerAddressSpace>>;

    /// Queries the organization type of the server's address space.
    fn query_organization(&self) -> OpcResult<NamespaceType> {
        let itf = self.interface()?;
        let mut organization = 0u32;
        // SAFETY: `organization` is a valid output slot.
        unsafe { (itf.vtable().query_organization)(itf.as_raw(), &mut organization) }
            .ok_or_com("IOPCBrowseServerAddressSpace::QueryOrganization")?;
        NamespaceType::from_raw(organization).ok_or_else(|| {
            OpcError::Conversion(format!("unknown namespace organization: {organization}"))
        })
    }

    /// Changes the current position in the address space.
    ///
    /// # Arguments
    /// * `direction` - Up, down into a branch, or to an absolute position
    /// * `name` - Branch name (down) or fully qualified path (to); ignored for up
    fn change_browse_position(&self, direction: BrowseDirection, name: &str) -> OpcResult<()> {
        let itf = self.interface()?;
        let name = LocalWide::new(name);
        // SAFETY: `name` outlives the call.
        unsafe { (itf.vtable().change_browse_position)(itf.as_raw(), direction as u32, name.as_ptr()) }
            .ok_or_com("IOPCBrowseServerAddressSpace::ChangeBrowsePosition")
    }

    /// Browses item IDs at the current position.
    ///
    /// # Arguments
    /// * `browse_type` - Branches, leaves, or a flat listing of everything below
    /// * `filter` - Server-specific name filter; empty matches everything
    /// * `data_type` - Only items convertible to this type; `VT_EMPTY` for any
    /// * `access_rights` - Only items with these rights; zero for any
    ///
    /// # Returns
    /// `None` when the server reports nothing to enumerate without handing
    /// back an enumerator.
    fn browse_opc_item_ids(
        &self,
        browse_type: BrowseType,
        filter: &str,
        data_type: VarType,
        access_rights: AccessRights,
    ) -> OpcResult<Option<StringIterator>> {
        let itf = self.interface()?;
        let filter = LocalWide::new(filter);
        let mut enumerator = std::ptr::null_mut();
        // SAFETY: `filter` outlives the call; the enumerator is taken over below.
        let status = unsafe {
            (itf.vtable().browse_opc_item_ids)(
                itf.as_raw(),
                browse_type as u32,
                filter.as_ptr(),
                data_type.0,
                access_rights.0,
                &mut enumerator,
            )
        };
        // SAFETY: a non-null output is a counted enumerator.
        let enumerator = unsafe { Handle::<IEnumString>::from_raw(enumerator) };
        status.ok_or_com("IOPCBrowseServerAddressSpace::BrowseOPCItemIDs")?;
        Ok(enumerator.map(StringIterator::new))
    }

    /// Gets the fully qualified item ID for a name at the current position.
    fn get_item_id(&self, item_name: &str) -> OpcResult<String> {
        let itf = self.interface()?;
        let item_name = LocalWide::new(item_name);
        let mut output = RemoteString::null();
        // SAFETY: `item_name` outlives the call; `output` owns the result.
        unsafe { (itf.vtable().get_item_id)(itf.as_raw(), item_name.as_ptr(), output.as_mut_ptr()) }
            .ok_or_com("IOPCBrowseServerAddressSpace::GetItemID")?;
        Ok(output.to_string_lossy())
    }

    /// Lists the access paths of an item; `None` when the server has none.
    fn browse_access_paths(&self, item_id: &str) -> OpcResult<Option<StringIterator>> {
        let itf = self.interface()?;
        let item_id = LocalWide::new(item_id);
        let mut enumerator = std::ptr::null_mut();
        // SAFETY: `item_id` outlives the call; the enumerator is taken over below.
        let status = unsafe {
            (itf.vtable().browse_access_paths)(itf.as_raw(), item_id.as_ptr(), &mut enumerator)
        };
        // SAFETY: a non-null output is a counted enumerator.
        let enumerator = unsafe { Handle::<IEnumString>::from_raw(enumerator) };
        status.ok_or_com("IOPCBrowseServerAddressSpace::BrowseAccessPaths")?;
        Ok(enumerator.map(StringIterator::new))
    }
}
