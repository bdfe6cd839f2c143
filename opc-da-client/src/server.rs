//! A connection to one OPC DA server.
//!
//! [`OpcServer`] owns the root interfaces and the group registry. Optional
//! interfaces (`IOPCCommon`, browsing, item properties, the connection
//! point container) are queried once on connect; calls that need a missing
//! one fail with `NotImplemented`.

use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn};

use crate::browser::OpcBrowser;
use crate::callback::ShutdownCallback;
use crate::com::handle::ReleaseFlag;
use crate::com::runtime::activate;
use crate::com::vtables::{
    IConnectionPoint, IConnectionPointContainer, IOPCBrowseServerAddressSpace, IOPCCommon,
    IOPCItemProperties, IOPCServer, IOPCShutdown,
};
use crate::com::{Activator, ComActivator, Handle, Interface, Location, StatusCode};
use crate::config::{ClientConfig, LOCALE_SYSTEM_DEFAULT};
use crate::dispatch::{Fanout, ShutdownEvent};
use crate::errors::{ItemError, OpcError, OpcResult, UNKNOWN_ERROR};
use crate::groups::OpcGroups;
use crate::records::{PropertyInfo, ServerStatus};
use crate::traits::{
    CommonTrait, ConnectionPointContainerTrait, ItemPropertiesTrait, ServerTrait, unadvise,
};
use crate::variant::Value;

struct ServerInterfaces {
    server: Handle<IOPCServer>,
    common: Option<Handle<IOPCCommon>>,
    browse: Option<Handle<IOPCBrowseServerAddressSpace>>,
    properties: Option<Handle<IOPCItemProperties>>,
    container: Option<Handle<IConnectionPointContainer>>,
}

fn missing<I: Interface>() -> OpcError {
    OpcError::NotImplemented(format!("server does not implement {}", I::NAME))
}

fn optional<I: Interface>(server: &Handle<IOPCServer>) -> Option<Handle<I>> {
    match server.query::<I>() {
        Ok(handle) => Some(handle),
        Err(code) => {
            debug!(interface = I::NAME, %code, "optional interface unavailable");
            None
        }
    }
}

impl ServerInterfaces {
    fn acquire(server: Handle<IOPCServer>) -> Self {
        Self {
            common: optional(&server),
            browse: optional(&server),
            properties: optional(&server),
            container: optional(&server),
            server,
        }
    }
}

impl ServerTrait for ServerInterfaces {
    fn interface(&self) -> OpcResult<&Handle<IOPCServer>> {
        Ok(&self.server)
    }
}

impl CommonTrait for ServerInterfaces {
    fn interface(&self) -> OpcResult<&Handle<IOPCCommon>> {
        self.common.as_ref().ok_or_else(missing::<IOPCCommon>)
    }
}

impl ItemPropertiesTrait for ServerInterfaces {
    fn interface(&self) -> OpcResult<&Handle<IOPCItemProperties>> {
        self.properties.as_ref().ok_or_else(missing::<IOPCItemProperties>)
    }
}

impl ConnectionPointContainerTrait for ServerInterfaces {
    fn interface(&self) -> OpcResult<&Handle<IConnectionPointContainer>> {
        self.container
            .as_ref()
            .ok_or_else(missing::<IConnectionPointContainer>)
    }
}

/// The advised shutdown sink.
struct ShutdownLink {
    point: Handle<IConnectionPoint>,
    cookie: u32,
    sink: Handle<IOPCShutdown>,
}

/// A connected OPC DA server.
///
/// # Examples
///
/// ```no_run
/// use opc_da_client::OpcServer;
/// use opc_da_client::com::ComRuntime;
///
/// let _runtime = ComRuntime::new()?;
/// let server = OpcServer::connect("Matrikon.OPC.Simulation.1", "")?;
/// println!("{}", server.status()?.server_state);
/// server.disconnect()?;
/// # Ok::<(), opc_da_client::OpcError>(())
/// ```
pub struct OpcServer {
    prog_id: String,
    location: Location,
    interfaces: RwLock<Option<ServerInterfaces>>,
    groups: OpcGroups,
    shutdown: Arc<Fanout<ShutdownEvent>>,
    shutdown_link: Mutex<Option<ShutdownLink>>,
    config: Arc<ClientConfig>,
    released: ReleaseFlag,
}

impl std::fmt::Debug for OpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpcServer")
            .field("prog_id", &self.prog_id)
            .field("location", &self.location)
            .field("groups", &self.groups.count())
            .field("released", &self.released.is_released())
            .finish()
    }
}

impl OpcServer {
    /// Connects through the platform runtime with the default
    /// configuration. The calling thread must hold a
    /// [`ComRuntime`](crate::com::ComRuntime).
    ///
    /// # Arguments
    /// * `prog_id` - ProgID or `{CLSID}` of the server
    /// * `node` - Host name; empty or `localhost` for this machine
    pub fn connect(prog_id: &str, node: &str) -> OpcResult<Self> {
        Self::connect_with(&ComActivator, prog_id, node, ClientConfig::default())
    }

    /// Connects through `activator`.
    pub fn connect_with<A: Activator + ?Sized>(
        activator: &A,
        prog_id: &str,
        node: &str,
        config: ClientConfig,
    ) -> OpcResult<Self> {
        let location = Location::from_node(node);
        let _span = info_span!("opc.connect", server = prog_id, host = %location).entered();
        let clsid = activator.clsid_from_prog_id(prog_id, &location)?;
        let server = activate::<IOPCServer, _>(activator, &clsid, &location)?;
        let interfaces = ServerInterfaces::acquire(server.clone());

        if let Some(name) = &config.client_name {
            if let Err(e) = interfaces.set_client_name(name) {
                warn!(error = ?e, "SetClientName failed");
            }
        }
        let config = Arc::new(config);
        info!(%clsid, "connected");
        Ok(Self {
            prog_id: prog_id.to_string(),
            location,
            interfaces: RwLock::new(Some(interfaces)),
            groups: OpcGroups::new(server, Arc::clone(&config)),
            shutdown: Arc::new(Fanout::new()),
            shutdown_link: Mutex::new(None),
            config,
            released: ReleaseFlag::default(),
        })
    }

    pub fn prog_id(&self) -> &str {
        &self.prog_id
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn groups(&self) -> &OpcGroups {
        &self.groups
    }

    pub fn is_connected(&self) -> bool {
        !self.released.is_released()
    }

    fn with<R>(&self, f: impl FnOnce(&ServerInterfaces) -> OpcResult<R>) -> OpcResult<R> {
        let guard = self
            .interfaces
            .read()
            .map_err(|_| OpcError::poisoned("server interfaces"))?;
        let interfaces = guard.as_ref().ok_or_else(|| {
            OpcError::InvalidState(format!("server '{}' has been disconnected", self.prog_id))
        })?;
        f(interfaces)
    }

    pub fn status(&self) -> OpcResult<ServerStatus> {
        self.with(ServerInterfaces::get_status)
    }

    /// The server's text for `code` in its current locale.
    pub fn error_string(&self, code: StatusCode) -> OpcResult<String> {
        self.with(|itf| {
            if itf.common.is_some() {
                CommonTrait::get_error_string(itf, code)
            } else {
                ServerTrait::get_error_string(itf, code, LOCALE_SYSTEM_DEFAULT)
            }
        })
    }

    /// Describes `code` from the static table, then from the server, and
    /// finally as `"unknown error"`.
    pub fn describe(&self, code: StatusCode) -> String {
        if let Some(text) = code.describe() {
            return text.to_string();
        }
        match self.error_string(code) {
            Ok(text) if !text.trim().is_empty() => text.trim_end().to_string(),
            Ok(_) => UNKNOWN_ERROR.to_string(),
            Err(e) => {
                debug!(%code, error = ?e, "server has no text for code");
                UNKNOWN_ERROR.to_string()
            }
        }
    }

    pub fn locale_id(&self) -> OpcResult<u32> {
        self.with(CommonTrait::get_locale_id)
    }

    pub fn set_locale_id(&self, locale_id: u32) -> OpcResult<()> {
        self.with(|itf| CommonTrait::set_locale_id(itf, locale_id))
    }

    pub fn available_locale_ids(&self) -> OpcResult<Vec<u32>> {
        self.with(CommonTrait::query_available_locale_ids)
    }

    pub fn set_client_name(&self, name: &str) -> OpcResult<()> {
        self.with(|itf| CommonTrait::set_client_name(itf, name))
    }

    pub fn query_available_properties(&self, item_id: &str) -> OpcResult<Vec<PropertyInfo>> {
        self.with(|itf| itf.query_available_properties(item_id))
    }

    /// Reads property values; one entry per requested id.
    pub fn get_item_properties(
        &self,
        item_id: &str,
        property_ids: &[u32],
    ) -> OpcResult<Vec<Result<Value, ItemError>>> {
        if property_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with(|itf| itf.get_item_properties(item_id, property_ids))
    }

    pub fn lookup_item_ids(
        &self,
        item_id: &str,
        property_ids: &[u32],
    ) -> OpcResult<Vec<Result<String, ItemError>>> {
        if property_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with(|itf| itf.lookup_item_ids(item_id, property_ids))
    }

    /// A cursor into the server's address space.
    pub fn browser(&self) -> OpcResult<OpcBrowser> {
        self.with(|itf| {
            itf.browse
                .clone()
                .map(OpcBrowser::new)
                .ok_or_else(missing::<IOPCBrowseServerAddressSpace>)
        })
    }

    /// Receives the reason of every shutdown request the server sends.
    /// The first call advises the shutdown sink.
    pub fn subscribe_shutdown(&self) -> OpcResult<mpsc::Receiver<ShutdownEvent>> {
        let mut link = self
            .shutdown_link
            .lock()
            .map_err(|_| OpcError::poisoned("shutdown link"))?;
        if link.is_none() {
            let sink = ShutdownCallback::create(Arc::clone(&self.shutdown));
            let (point, cookie) = self.with(|itf| itf.advise(&IOPCShutdown::IID, sink.as_raw()))?;
            debug!(cookie, "shutdown sink advised");
            *link = Some(ShutdownLink {
                point,
                cookie,
                sink,
            });
        }
        Ok(self.shutdown.subscribe(self.config.subscriber_capacity))
    }

    fn unadvise_shutdown(&self) -> OpcResult<()> {
        let taken = self
            .shutdown_link
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(ShutdownLink {
            point,
            cookie,
            sink,
        }) = taken
        else {
            return Ok(());
        };
        let result = unadvise(&point, cookie);
        match &result {
            Ok(()) => debug!(cookie, "shutdown sink unadvised"),
            Err(e) => warn!(error = ?e, "shutdown unadvise failed"),
        }
        drop(point);
        drop(sink);
        result
    }

    fn teardown(&self) -> OpcResult<()> {
        let unadvised = self.unadvise_shutdown();
        self.shutdown.clear();
        let groups = self.groups.close();
        if let Err(e) = &groups {
            warn!(error = ?e, "group teardown failed");
        }
        self.interfaces
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        debug!(server = %self.prog_id, "server interfaces released");
        unadvised.and(groups)
    }

    /// Unadvises the shutdown sink, releases every group and lets go of the
    /// server. Dropping a connected server does the same.
    ///
    /// # Errors
    /// `InvalidState` on a second disconnect (a debug assertion in debug
    /// builds); otherwise the first teardown failure.
    pub fn disconnect(&self) -> OpcResult<()> {
        self.released.mark(&format!("server '{}'", self.prog_id))?;
        let _span = info_span!("opc.disconnect", server = %self.prog_id).entered();
        self.teardown()
    }
}

impl Drop for OpcServer {
    fn drop(&mut self) {
        if !self.released.is_released() {
            if let Err(e) = self.teardown() {
                warn!(server = %self.prog_id, error = ?e, "implicit disconnect failed");
            }
        }
    }
}
