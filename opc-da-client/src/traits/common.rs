use crate::com::vtables::IOPCCommon;
use crate::com::{Handle, LocalWide, RemoteArray, RemoteString, StatusCode};
use crate::errors::OpcResult;

/// Common OPC server functionality trait.
///
/// Provides methods for locale management and error string retrieval.
/// This trait is implemented by all OPC DA servers to support basic
/// configuration and error handling capabilities.
pub trait CommonTrait {
    fn interface(&self) -> OpcResult<&Handle<IOPCCommon>>;

    /// Sets the locale ID for server string localization.
    ///
    /// # Arguments
    /// * `locale_id` - Windows LCID (Locale ID) value for the desired language
    fn set_locale_id(&self, locale_id: u32) -> OpcResult<()> {
        let common = self.interface()?;
        // SAFETY: plain call on a live handle.
        unsafe { (common.vtable().set_locale_id)(common.as_raw(), locale_id) }
            .ok_or_com("IOPCCommon::SetLocaleID")
    }

    /// Gets the current locale ID used by the server.
    fn get_locale_id(&self) -> OpcResult<u32> {
        let common = self.interface()?;
        let mut locale_id = 0u32;
        // SAFETY: `locale_id` is a valid output slot.
        unsafe { (common.vtable().get_locale_id)(common.as_raw(), &mut locale_id) }
            .ok_or_com("IOPCCommon::GetLocaleID")?;
        Ok(locale_id)
    }

    /// Gets a list of locale IDs supported by the server.
    fn query_available_locale_ids(&self) -> OpcResult<Vec<u32>> {
        let common = self.interface()?;
        let mut locale_ids = RemoteArray::<u32>::empty();
        // SAFETY: the count and array slots are owned by `locale_ids`.
        unsafe {
            (common.vtable().query_available_locale_ids)(
                common.as_raw(),
                locale_ids.as_mut_len_ptr(),
                locale_ids.as_mut_ptr(),
            )
        }
        .ok_or_com("IOPCCommon::QueryAvailableLocaleIDs")?;
        Ok(locale_ids.as_slice().to_vec())
    }

    /// Gets a localized error description string in the current locale.
    fn get_error_string(&self, code: StatusCode) -> OpcResult<String> {
        let common = self.interface()?;
        let mut output = RemoteString::null();
        // SAFETY: `output` owns whatever string the server allocates.
        unsafe { (common.vtable().get_error_string)(common.as_raw(), code, output.as_mut_ptr()) }
            .ok_or_com("IOPCCommon::GetErrorString")?;
        Ok(output.to_string_lossy())
    }

    /// Sets a client name for server identification.
    fn set_client_name(&self, name: &str) -> OpcResult<()> {
        let common = self.interface()?;
        let name = LocalWide::new(name);
        // SAFETY: `name` outlives the call.
        unsafe { (common.vtable().set_client_name)(common.as_raw(), name.as_ptr()) }
            .ok_or_com("IOPCCommon::SetClientName")
    }
}
