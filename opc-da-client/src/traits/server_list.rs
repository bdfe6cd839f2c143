use crate::com::vtables::{IEnumGuid, IOPCServerList2};
use crate::com::{Guid, GuidIterator, Handle, LocalWide, RemoteString, StatusCode};
use crate::errors::{OpcError, OpcResult};

/// Registry details of one server class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDetails {
    pub prog_id: String,
    pub user_type: String,
    pub version_independent_prog_id: String,
}

/// Server discovery through the OPC server enumerator.
pub trait ServerListTrait {
    fn interface(&self) -> OpcResult<&Handle<IOPCServerList2>>;

    /// Enumerates server classes by component category.
    ///
    /// # Arguments
    /// * `implemented` - Categories a class must implement (any of them)
    /// * `required` - Categories a class requires; usually empty
    fn enum_classes_of_categories(
        &self,
        implemented: &[Guid],
        required: &[Guid],
    ) -> OpcResult<GuidIterator> {
        let itf = self.interface()?;
        let mut enumerator = std::ptr::null_mut();
        // SAFETY: both category slices outlive the call; the enumerator is
        // taken over below.
        let status = unsafe {
            (itf.vtable().enum_classes_of_categories)(
                itf.as_raw(),
                u32::try_from(implemented.len())?,
                implemented.as_ptr(),
                u32::try_from(required.len())?,
                required.as_ptr(),
                &mut enumerator,
            )
        };
        // SAFETY: the server's GUID enumerator shares the `IEnumGUID` layout.
        let enumerator = unsafe { Handle::<IEnumGuid>::from_raw(enumerator) };
        status.ok_or_com("IOPCServerList2::EnumClassesOfCategories")?;
        enumerator.map(GuidIterator::new).ok_or_else(|| {
            OpcError::com(StatusCode::E_POINTER, "IOPCServerList2::EnumClassesOfCategories")
        })
    }

    /// Gets the ProgIDs and display name of a class.
    fn get_class_details(&self, clsid: &Guid) -> OpcResult<ClassDetails> {
        let itf = self.interface()?;
        let mut prog_id = RemoteString::null();
        let mut user_type = RemoteString::null();
        let mut version_independent = RemoteString::null();
        // SAFETY: `clsid` outlives the call; each string owns its output.
        unsafe {
            (itf.vtable().get_class_details)(
                itf.as_raw(),
                clsid,
                prog_id.as_mut_ptr(),
                user_type.as_mut_ptr(),
                version_independent.as_mut_ptr(),
            )
        }
        .ok_or_com("IOPCServerList2::GetClassDetails")?;
        Ok(ClassDetails {
            prog_id: prog_id.to_string_lossy(),
            user_type: user_type.to_string_lossy(),
            version_independent_prog_id: version_independent.to_string_lossy(),
        })
    }

    /// Resolves a ProgID on the enumerator's machine.
    fn clsid_from_prog_id(&self, prog_id: &str) -> OpcResult<Guid> {
        let itf = self.interface()?;
        let wide = LocalWide::new(prog_id);
        let mut clsid = Guid::zeroed();
        // SAFETY: `wide` outlives the call and `clsid` is a valid slot.
        unsafe { (itf.vtable().clsid_from_prog_id)(itf.as_raw(), wide.as_ptr(), &mut clsid) }
            .ok_or_com(&format!("IOPCServerList2::CLSIDFromProgID({prog_id})"))?;
        Ok(clsid)
    }
}
