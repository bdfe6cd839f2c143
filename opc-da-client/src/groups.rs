//! The groups of one server connection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info_span, warn};

use crate::com::Handle;
use crate::com::vtables::IOPCServer;
use crate::config::{ClientConfig, GroupDefaults, GroupOptions};
use crate::errors::{OpcError, OpcResult};
use crate::group::{GroupInner, GroupInterfaces, GroupMap, OpcGroup};
use crate::records::GroupHandle;
use crate::traits::{GroupRequest, ServerTrait};

/// Registry of the groups created through one connection, keyed by server
/// handle.
///
/// Adding and removing take the registry's write lock; lookups share the
/// read lock. A group released through [`OpcGroup::release`] leaves the
/// registry as well.
pub struct OpcGroups {
    server: RwLock<Option<Handle<IOPCServer>>>,
    groups: Arc<GroupMap>,
    next_client: AtomicU32,
    defaults: RwLock<GroupDefaults>,
    config: Arc<ClientConfig>,
}

impl std::fmt::Debug for OpcGroups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpcGroups")
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}

impl OpcGroups {
    pub(crate) fn new(server: Handle<IOPCServer>, config: Arc<ClientConfig>) -> Self {
        Self {
            server: RwLock::new(Some(server)),
            groups: Arc::new(RwLock::new(BTreeMap::new())),
            next_client: AtomicU32::new(1),
            defaults: RwLock::new(config.groups.clone()),
            config,
        }
    }

    /// Defaults applied by [`OpcGroups::add`].
    pub fn defaults(&self) -> GroupDefaults {
        self.defaults
            .read()
            .map(|d| d.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    pub fn set_defaults(&self, defaults: GroupDefaults) -> OpcResult<()> {
        *self
            .defaults
            .write()
            .map_err(|_| OpcError::poisoned("group defaults"))? = defaults;
        Ok(())
    }

    pub fn set_default_active(&self, active: bool) -> OpcResult<()> {
        self.update_defaults(|d| d.active = active)
    }

    pub fn set_default_update_rate(&self, update_rate: u32) -> OpcResult<()> {
        self.update_defaults(|d| d.update_rate = update_rate)
    }

    pub fn set_default_deadband(&self, percent: f32) -> OpcResult<()> {
        self.update_defaults(|d| d.percent_deadband = percent)
    }

    pub fn set_default_locale_id(&self, locale_id: u32) -> OpcResult<()> {
        self.update_defaults(|d| d.locale_id = locale_id)
    }

    pub fn set_default_time_bias(&self, time_bias: i32) -> OpcResult<()> {
        self.update_defaults(|d| d.time_bias = time_bias)
    }

    fn update_defaults(&self, f: impl FnOnce(&mut GroupDefaults)) -> OpcResult<()> {
        let mut defaults = self
            .defaults
            .write()
            .map_err(|_| OpcError::poisoned("group defaults"))?;
        f(&mut defaults);
        Ok(())
    }

    /// Adds a group with the current defaults.
    pub fn add(&self, name: &str) -> OpcResult<OpcGroup> {
        let options = self.defaults();
        self.add_with(name, &options)
    }

    /// Adds a group with explicit options.
    ///
    /// # Errors
    /// The server's `AddGroup` failure (for example `OPC_E_DUPLICATENAME`),
    /// or the failure to acquire one of the group's interfaces; in that case
    /// the server-side group is removed again.
    pub fn add_with(&self, name: &str, options: &GroupOptions) -> OpcResult<OpcGroup> {
        if !(0.0..=100.0).contains(&options.percent_deadband) {
            return Err(OpcError::InvalidArgument(format!(
                "deadband must be within 0..=100, got {}",
                options.percent_deadband
            )));
        }
        let _span = info_span!("opc.add_group", group = name).entered();
        let client_handle = GroupHandle(self.next_client.fetch_add(1, Ordering::Relaxed));
        let server = self.server()?;
        let added = server.add_group(&GroupRequest {
            name,
            active: options.active,
            update_rate: options.update_rate,
            client_handle,
            time_bias: options.time_bias,
            percent_deadband: options.percent_deadband,
            locale_id: options.locale_id,
        })?;
        let server_handle = added.server_handle;

        let interfaces = match GroupInterfaces::acquire(server.clone(), added.state_mgt) {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!(group = name, error = ?e, "group interface missing, removing group");
                if let Err(remove) = server.remove_group(server_handle, true) {
                    warn!(group = name, error = ?remove, "rollback RemoveGroup failed");
                }
                return Err(e);
            }
        };

        if added.revised_update_rate != options.update_rate {
            debug!(
                group = name,
                requested = options.update_rate,
                revised = added.revised_update_rate,
                "update rate revised"
            );
        }
        let group = OpcGroup::new(GroupInner::new(
            name.to_string(),
            client_handle,
            server_handle,
            interfaces,
            Arc::clone(&self.config),
            Arc::downgrade(&self.groups),
        ));
        self.groups
            .write()
            .map_err(|_| OpcError::poisoned("group registry"))?
            .insert(server_handle, group.clone());
        debug!(group = name, %server_handle, %client_handle, "group added");
        Ok(group)
    }

    pub fn get_by_name(&self, name: &str) -> OpcResult<Option<OpcGroup>> {
        Ok(self
            .read()?
            .values()
            .find(|g| g.name() == name)
            .cloned())
    }

    pub fn get_by_server_handle(&self, handle: GroupHandle) -> OpcResult<Option<OpcGroup>> {
        Ok(self.read()?.get(&handle).cloned())
    }

    /// The group at `index` in server-handle order.
    pub fn item(&self, index: usize) -> OpcResult<Option<OpcGroup>> {
        Ok(self.read()?.values().nth(index).cloned())
    }

    pub fn count(&self) -> usize {
        self.groups.read().map_or(0, |g| g.len())
    }

    /// Every group currently registered.
    pub fn all(&self) -> OpcResult<Vec<OpcGroup>> {
        Ok(self.read()?.values().cloned().collect())
    }

    /// Removes a group from the registry and releases it.
    ///
    /// # Errors
    /// `NotFound` when no group has that server handle.
    pub fn remove(&self, server_handle: GroupHandle) -> OpcResult<()> {
        let group = self
            .groups
            .write()
            .map_err(|_| OpcError::poisoned("group registry"))?
            .remove(&server_handle)
            .ok_or_else(|| OpcError::NotFound(format!("group {server_handle}")))?;
        release_once(&group)
    }

    pub fn remove_by_name(&self, name: &str) -> OpcResult<()> {
        let handle = self
            .get_by_name(name)?
            .ok_or_else(|| OpcError::NotFound(format!("group '{name}'")))?
            .server_handle();
        self.remove(handle)
    }

    /// Releases every group. All groups are attempted; the first failure
    /// is returned.
    pub fn remove_all(&self) -> OpcResult<()> {
        let groups = std::mem::take(
            &mut *self
                .groups
                .write()
                .map_err(|_| OpcError::poisoned("group registry"))?,
        );
        let mut first = Ok(());
        for group in groups.into_values() {
            if let Err(e) = release_once(&group) {
                warn!(group = %group.name(), error = ?e, "group release failed");
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }

    /// Releases every group and then the registry's own server reference.
    /// Later calls that need the server fail with `InvalidState`.
    pub(crate) fn close(&self) -> OpcResult<()> {
        let result = self.remove_all();
        self.server
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        result
    }

    fn server(&self) -> OpcResult<Handle<IOPCServer>> {
        self.server
            .read()
            .map_err(|_| OpcError::poisoned("group registry"))?
            .clone()
            .ok_or_else(|| OpcError::InvalidState("server has been disconnected".into()))
    }

    fn read(&self) -> OpcResult<std::sync::RwLockReadGuard<'_, BTreeMap<GroupHandle, OpcGroup>>> {
        self.groups.read().map_err(|_| OpcError::poisoned("group registry"))
    }
}

/// A caller may already have released the group through its own clone.
fn release_once(group: &OpcGroup) -> OpcResult<()> {
    if group.is_released() {
        return Ok(());
    }
    group.release()
}
