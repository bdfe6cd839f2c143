//! Server discovery through the OPC server enumerator (`OpcEnum`).

use tracing::{debug, info_span, warn};

use crate::com::runtime::activate;
use crate::com::vtables::{
    CATID_OPC_DA10, CATID_OPC_DA20, CATID_OPC_DA30, CLSID_OPC_SERVER_LIST, IOPCServerList2,
};
use crate::com::{Activator, Guid, Handle, Location};
use crate::errors::OpcResult;
use crate::traits::{ClassDetails, ServerListTrait};

/// Component categories of DA 1.0, 2.0 and 3.0 servers.
pub const DA_CATEGORIES: [Guid; 3] = [CATID_OPC_DA10, CATID_OPC_DA20, CATID_OPC_DA30];

/// A connection to the server enumerator on one machine.
#[derive(Debug, Clone)]
pub struct ServerList {
    handle: Handle<IOPCServerList2>,
}

impl ServerListTrait for ServerList {
    fn interface(&self) -> OpcResult<&Handle<IOPCServerList2>> {
        Ok(&self.handle)
    }
}

impl ServerList {
    pub fn connect<A: Activator + ?Sized>(activator: &A, location: &Location) -> OpcResult<Self> {
        let handle = activate::<IOPCServerList2, _>(activator, &CLSID_OPC_SERVER_LIST, location)?;
        debug!(%location, "server enumerator connected");
        Ok(Self { handle })
    }

    /// Class ids and details of every registered DA server, sorted by
    /// ProgID. Classes whose details cannot be read are skipped.
    pub fn servers(&self) -> OpcResult<Vec<(Guid, ClassDetails)>> {
        let mut servers = Vec::new();
        for clsid in self.enum_classes_of_categories(&DA_CATEGORIES, &[])? {
            let clsid = clsid?;
            if clsid == Guid::zeroed() {
                continue;
            }
            match self.get_class_details(&clsid) {
                Ok(details) if !details.prog_id.is_empty() => servers.push((clsid, details)),
                Ok(_) => debug!(%clsid, "class without ProgID skipped"),
                Err(e) => warn!(%clsid, error = ?e, "GetClassDetails failed, skipping"),
            }
        }
        servers.sort_by(|a, b| a.1.prog_id.cmp(&b.1.prog_id));
        servers.dedup_by(|a, b| a.0 == b.0);
        Ok(servers)
    }
}

/// ProgIDs of the DA servers registered on `host` (empty for this machine).
pub fn list_servers<A: Activator + ?Sized>(activator: &A, host: &str) -> OpcResult<Vec<String>> {
    let location = Location::from_node(host);
    let _span = info_span!("opc.list_servers", host = %location).entered();
    let mut prog_ids: Vec<String> = ServerList::connect(activator, &location)?
        .servers()?
        .into_iter()
        .map(|(_, details)| details.prog_id)
        .collect();
    prog_ids.dedup();
    debug!(count = prog_ids.len(), "servers listed");
    Ok(prog_ids)
}
