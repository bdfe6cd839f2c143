use super::item_mgt::ensure_non_empty;
use crate::com::vtables::IOPCItemProperties;
use crate::com::{Handle, LocalWide, RemoteArray, StatusCode};
use crate::errors::{ItemError, OpcResult};
use crate::records::{PropertyInfo, item_statuses};
use crate::variant::{OwnedVariant, Value, VarType};

/// Item properties functionality (OPC DA 2.0).
///
/// Provides methods to list the properties of an item, read their values
/// and resolve the item IDs some properties map to.
pub trait ItemPropertiesTrait {
    fn interface(&self) -> OpcResult<&Handle<IOPCItemProperties>>;

    /// Lists the properties an item supports.
    fn query_available_properties(&self, item_id: &str) -> OpcResult<Vec<PropertyInfo>> {
        let itf = self.interface()?;
        let item_id = LocalWide::new(item_id);
        let mut count = 0u32;
        let mut ids = RemoteArray::<u32>::empty();
        let mut descriptions = RemoteArray::<*mut u16>::empty();
        let mut data_types = RemoteArray::<u16>::empty();
        // SAFETY: `item_id` outlives the call; the arrays own their outputs.
        let status = unsafe {
            (itf.vtable().query_available_properties)(
                itf.as_raw(),
                item_id.as_ptr(),
                &mut count,
                ids.as_mut_ptr(),
                descriptions.as_mut_ptr(),
                data_types.as_mut_ptr(),
            )
        };
        // SAFETY: each array holds `count` elements once the call returned.
        unsafe {
            ids.set_len(count);
            descriptions.set_len(count);
            data_types.set_len(count);
        }
        status.ok_or_com("IOPCItemProperties::QueryAvailableProperties")?;

        let expected = count as usize;
        let ids = ids.to_vec_padded(expected, 0);
        let types = data_types.to_vec_padded(expected, 0);
        let mut descriptions = descriptions.take_strings();
        descriptions.resize(expected, String::new());
        Ok(ids
            .into_iter()
            .zip(descriptions)
            .zip(types)
            .map(|((id, description), data_type)| PropertyInfo {
                id,
                description,
                data_type: VarType(data_type),
            })
            .collect())
    }

    /// Reads property values of an item.
    ///
    /// # Returns
    /// One entry per requested property id; a value that cannot be decoded
    /// becomes a `DISP_E_BADVARTYPE` item error.
    fn get_item_properties(
        &self,
        item_id: &str,
        property_ids: &[u32],
    ) -> OpcResult<Vec<Result<Value, ItemError>>> {
        let len = ensure_non_empty(property_ids.len(), "property_ids")?;
        let itf = self.interface()?;
        let item_id = LocalWide::new(item_id);
        let mut data = RemoteArray::new(len);
        let mut errors = RemoteArray::new(len);
        // SAFETY: `property_ids` holds `len` ids; the arrays own their outputs.
        unsafe {
            (itf.vtable().get_item_properties)(
                itf.as_raw(),
                item_id.as_ptr(),
                len,
                property_ids.as_ptr(),
                data.as_mut_ptr(),
                errors.as_mut_ptr(),
            )
        }
        .ok_or_com("IOPCItemProperties::GetItemProperties")?;

        // Take every payload first so none leaks if a status is odd.
        let mut values: Vec<OwnedVariant> = data
            .as_mut_slice()
            .iter_mut()
            // SAFETY: each payload belongs to us and is taken exactly once.
            .map(|slot| unsafe { OwnedVariant::take(slot) })
            .collect();
        values.resize_with(property_ids.len(), OwnedVariant::empty);

        Ok(item_statuses(&errors, property_ids.len())
            .into_iter()
            .zip(values)
            .map(|(status, value)| {
                status?;
                value
                    .into_value()
                    .map_err(|e| ItemError::new(StatusCode::DISP_E_BADVARTYPE, e.to_string()))
            })
            .collect())
    }

    /// Resolves the item IDs that properties of an item map to.
    fn lookup_item_ids(
        &self,
        item_id: &str,
        property_ids: &[u32],
    ) -> OpcResult<Vec<Result<String, ItemError>>> {
        let len = ensure_non_empty(property_ids.len(), "property_ids")?;
        let itf = self.interface()?;
        let item_id = LocalWide::new(item_id);
        let mut new_ids = RemoteArray::<*mut u16>::new(len);
        let mut errors = RemoteArray::new(len);
        // SAFETY: as in `get_item_properties`.
        unsafe {
            (itf.vtable().lookup_item_ids)(
                itf.as_raw(),
                item_id.as_ptr(),
                len,
                property_ids.as_ptr(),
                new_ids.as_mut_ptr(),
                errors.as_mut_ptr(),
            )
        }
        .ok_or_com("IOPCItemProperties::LookupItemIDs")?;

        let mut names = new_ids.take_strings();
        names.resize(property_ids.len(), String::new());
        Ok(item_statuses(&errors, property_ids.len())
            .into_iter()
            .zip(names)
            .map(|(status, name)| status.map(|()| name))
            .collect())
    }
}
