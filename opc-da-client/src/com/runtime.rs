//! Foreign runtime lifetime and object activation.

use std::marker::PhantomData;

use crate::com::handle::IUnknown;
use crate::com::{Guid, Handle, Interface, StatusCode};
use crate::errors::{OpcError, OpcResult};
use crate::traits::ServerListTrait;

/// Drop guard for the foreign runtime on the current thread.
///
/// [`ComRuntime::new`] joins the multi-threaded apartment and configures
/// process security; dropping the guard balances the initialization.
///
/// `ComRuntime` is intentionally `!Send` and `!Sync`: initialization is
/// per thread, so the guard must be created and dropped on the same OS
/// thread.
///
/// # Examples
///
/// ```no_run
/// use opc_da_client::com::ComRuntime;
///
/// let _runtime = ComRuntime::new()?;
/// // ... foreign calls ...
/// # Ok::<(), opc_da_client::OpcError>(())
/// ```
#[derive(Debug)]
pub struct ComRuntime {
    _not_send: PhantomData<*mut ()>,
}

impl ComRuntime {
    /// Initializes the runtime in multi-threaded mode.
    ///
    /// Already being initialized on this thread (`S_FALSE`) counts as
    /// success and is still balanced on drop.
    pub fn new() -> OpcResult<Self> {
        native::initialize()?;
        tracing::debug!("COM MTA initialized");
        Ok(Self {
            _not_send: PhantomData,
        })
    }
}

impl Drop for ComRuntime {
    fn drop(&mut self) {
        tracing::debug!("COM MTA teardown");
        native::uninitialize();
    }
}

/// Where the server object is activated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Location {
    #[default]
    Local,
    Remote { host: String },
}

impl Location {
    /// Maps a node name to a location; empty, `.`, `localhost` and the
    /// loopback address mean the local machine.
    ///
    /// ```
    /// use opc_da_client::com::Location;
    ///
    /// assert_eq!(Location::from_node(""), Location::Local);
    /// assert_eq!(Location::from_node("LOCALHOST"), Location::Local);
    /// assert_eq!(
    ///     Location::from_node("plc-host"),
    ///     Location::Remote { host: "plc-host".into() }
    /// );
    /// ```
    pub fn from_node(node: &str) -> Self {
        let node = node.trim();
        if node.is_empty()
            || node == "."
            || node == "127.0.0.1"
            || node.eq_ignore_ascii_case("localhost")
        {
            Self::Local
        } else {
            Self::Remote {
                host: node.to_string(),
            }
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Local => None,
            Self::Remote { host } => Some(host),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("localhost"),
            Self::Remote { host } => f.write_str(host),
        }
    }
}

/// Produces root objects by class identifier.
///
/// [`ComActivator`] goes through the platform runtime; the simulated server
/// ships its own implementation.
pub trait Activator: Send + Sync {
    /// Creates an instance of `clsid` at `location` and returns it through
    /// the requested capability `iid`.
    fn create_instance(
        &self,
        clsid: &Guid,
        location: &Location,
        iid: &Guid,
    ) -> OpcResult<Handle<IUnknown>>;

    /// Resolves a ProgID (or a literal GUID string) to a class identifier
    /// through the server list at `location`.
    fn clsid_from_prog_id(&self, prog_id: &str, location: &Location) -> OpcResult<Guid> {
        if let Ok(clsid) = prog_id.parse::<Guid>() {
            return Ok(clsid);
        }
        crate::discovery::ServerList::connect(self, location)?.clsid_from_prog_id(prog_id)
    }
}

/// Creates an instance and returns it typed as `I`.
pub fn activate<I: Interface, A: Activator + ?Sized>(
    activator: &A,
    clsid: &Guid,
    location: &Location,
) -> OpcResult<Handle<I>> {
    let unknown = activator.create_instance(clsid, location, &I::IID)?;
    // SAFETY: the object was created for `I::IID`, so the returned pointer
    // is an `I` reference.
    unsafe { Handle::from_raw(unknown.into_raw()) }
        .ok_or_else(|| OpcError::com(StatusCode::E_POINTER, "CoCreateInstanceEx"))
}

/// Activation through the platform runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct ComActivator;

impl Activator for ComActivator {
    fn create_instance(
        &self,
        clsid: &Guid,
        location: &Location,
        iid: &Guid,
    ) -> OpcResult<Handle<IUnknown>> {
        native::create_instance(clsid, location, iid)
    }

    fn clsid_from_prog_id(&self, prog_id: &str, location: &Location) -> OpcResult<Guid> {
        if let Ok(clsid) = prog_id.parse::<Guid>() {
            return Ok(clsid);
        }
        if *location == Location::Local {
            match native::clsid_from_prog_id(prog_id) {
                Ok(clsid) => return Ok(clsid),
                Err(e) => {
                    tracing::debug!(error = %e, prog_id, "registry lookup failed, asking the server list");
                }
            }
        }
        crate::discovery::ServerList::connect(self, location)?.clsid_from_prog_id(prog_id)
    }
}

#[cfg(windows)]
mod native {
    use std::mem::ManuallyDrop;

    use windows::Win32::System::Com::{
        CLSCTX, CLSCTX_INPROC_SERVER, CLSCTX_LOCAL_SERVER, CLSCTX_REMOTE_SERVER, CLSIDFromProgID,
        COINIT_MULTITHREADED, COSERVERINFO, CoCreateInstanceEx, CoInitializeEx,
        CoInitializeSecurity, CoUninitialize, EOAC_NONE, MULTI_QI, RPC_C_AUTHN_LEVEL_NONE,
        RPC_C_IMP_LEVEL_IMPERSONATE,
    };
    use windows::core::{GUID, Interface as _, PCWSTR, PWSTR};

    use super::Location;
    use crate::com::handle::IUnknown;
    use crate::com::{Guid, Handle, LocalWide, StatusCode};
    use crate::errors::{OpcError, OpcResult};

    pub(super) fn initialize() -> OpcResult<()> {
        // SAFETY: joins the MTA; balanced by `uninitialize` in the guard's drop.
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if let Err(e) = hr.ok() {
            tracing::error!(error = ?e, "COM MTA initialization failed");
            return Err(OpcError::com(e.into(), "CoInitializeEx"));
        }
        // SAFETY: process-wide security setup with no descriptor or
        // authentication list. Failing with RPC_E_TOO_LATE is expected when
        // another component configured security first.
        let security = unsafe {
            CoInitializeSecurity(
                None,
                -1,
                None,
                None,
                RPC_C_AUTHN_LEVEL_NONE,
                RPC_C_IMP_LEVEL_IMPERSONATE,
                None,
                EOAC_NONE,
                None,
            )
        };
        if let Err(e) = security {
            tracing::debug!(error = ?e, "CoInitializeSecurity skipped");
        }
        Ok(())
    }

    pub(super) fn uninitialize() {
        // SAFETY: paired with the successful `CoInitializeEx` in `initialize`.
        unsafe { CoUninitialize() }
    }

    fn class_context(location: &Location) -> CLSCTX {
        match location {
            Location::Local => CLSCTX_LOCAL_SERVER | CLSCTX_INPROC_SERVER,
            Location::Remote { .. } => CLSCTX_REMOTE_SERVER,
        }
    }

    pub(super) fn create_instance(
        clsid: &Guid,
        location: &Location,
        iid: &Guid,
    ) -> OpcResult<Handle<IUnknown>> {
        let clsid = GUID::from(*clsid);
        let iid = GUID::from(*iid);
        let host = location.host().map(LocalWide::new);
        let server_info = host.as_ref().map(|host| COSERVERINFO {
            dwReserved1: 0,
            pwszName: PWSTR(host.as_mut_ptr()),
            pAuthInfo: std::ptr::null_mut(),
            dwReserved2: 0,
        });
        let mut results = [MULTI_QI {
            pIID: &iid,
            pItf: ManuallyDrop::new(None),
            hr: windows::core::HRESULT(0),
        }];

        // SAFETY: every pointer (class id, interface id, host name and
        // server info) outlives the call; the result slot is owned below.
        let created = unsafe {
            CoCreateInstanceEx(
                &clsid,
                None,
                class_context(location),
                server_info.as_ref().map(std::ptr::from_ref),
                &mut results,
            )
        };
        // SAFETY: the slot was initialized above and is taken exactly once.
        let itf = unsafe { ManuallyDrop::take(&mut results[0].pItf) };
        created.map_err(|e| OpcError::com(e.into(), "CoCreateInstanceEx"))?;
        StatusCode::from(results[0].hr).ok_or_com("CoCreateInstanceEx")?;

        let itf = itf.ok_or_else(|| OpcError::com(StatusCode::E_POINTER, "CoCreateInstanceEx"))?;
        // SAFETY: `into_raw` hands over the reference counted for `iid`.
        unsafe { Handle::from_raw(itf.into_raw()) }
            .ok_or_else(|| OpcError::com(StatusCode::E_POINTER, "CoCreateInstanceEx"))
    }

    pub(super) fn clsid_from_prog_id(prog_id: &str) -> OpcResult<Guid> {
        let wide = LocalWide::new(prog_id);
        // SAFETY: `wide` is terminated and outlives the call.
        unsafe { CLSIDFromProgID(PCWSTR(wide.as_ptr())) }
            .map(Guid::from)
            .map_err(|e| OpcError::com(e.into(), format!("CLSIDFromProgID({prog_id})")))
    }
}

#[cfg(not(windows))]
mod native {
    use super::Location;
    use crate::com::handle::IUnknown;
    use crate::com::{Guid, Handle};
    use crate::errors::{OpcError, OpcResult};

    pub(super) fn initialize() -> OpcResult<()> {
        Ok(())
    }

    pub(super) fn uninitialize() {}

    pub(super) fn create_instance(
        clsid: &Guid,
        location: &Location,
        _iid: &Guid,
    ) -> OpcResult<Handle<IUnknown>> {
        Err(OpcError::NotImplemented(format!(
            "activating {clsid} on {location} requires the Windows COM runtime"
        )))
    }

    pub(super) fn clsid_from_prog_id(prog_id: &str) -> OpcResult<Guid> {
        Err(OpcError::NotImplemented(format!(
            "resolving '{prog_id}' requires the Windows registry"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_guard_constructs_and_drops() {
        let runtime = ComRuntime::new();
        assert!(runtime.is_ok(), "ComRuntime::new() should succeed: {runtime:?}");
    }

    #[test]
    fn test_location_display() {
        assert_eq!(Location::Local.to_string(), "localhost");
        assert_eq!(Location::from_node(" . "), Location::Local);
        assert_eq!(Location::from_node("10.0.0.5").host(), Some("10.0.0.5"));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_platform_activator_unavailable_off_windows() {
        let err = ComActivator
            .create_instance(&Guid::from_u128(1), &Location::Local, &IUnknown::IID)
            .unwrap_err();
        assert!(matches!(err, OpcError::NotImplemented(_)));
    }

    #[test]
    fn test_literal_guid_skips_lookup() {
        let clsid = ComActivator
            .clsid_from_prog_id("{13486D51-4821-11D2-A494-3CB306C10000}", &Location::Local)
            .unwrap();
        assert_eq!(clsid, crate::com::vtables::CLSID_OPC_SERVER_LIST);
    }
}
