//! Items of a group: the client-side record table and the bulk calls that
//! keep it in step with the server.
//!
//! Every bulk call returns one entry per input, in input order, whether or
//! not the element succeeded. Empty inputs return empty outputs without
//! reaching the server.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info_span, warn};

use crate::config::ItemDefaults;
use crate::errors::{ItemError, OpcError, OpcResult};
use crate::group::GroupInner;
use crate::item::OpcItem;
use crate::records::{
    AccessRights, ItemDef, ItemHandle, ItemResult, ItemValue, OpcItemResult, Quality, item_statuses,
};
use crate::traits::{ItemMgtTrait, ensure_same_len};
use crate::variant::{Value, VarType};

/// Client-side view of one item of a group.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRecord {
    pub item_id: String,
    pub access_path: String,
    pub client_handle: ItemHandle,
    pub server_handle: ItemHandle,
    pub requested_type: VarType,
    pub canonical_type: VarType,
    pub access_rights: AccessRights,
    pub active: bool,
    /// Last value seen through a read or a callback.
    pub value: Option<Value>,
    pub quality: Quality,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ItemRecord {
    pub fn new(item_id: impl Into<String>, client_handle: ItemHandle, server_handle: ItemHandle) -> Self {
        Self {
            item_id: item_id.into(),
            access_path: String::new(),
            client_handle,
            server_handle,
            requested_type: VarType::EMPTY,
            canonical_type: VarType::EMPTY,
            access_rights: AccessRights::default(),
            active: true,
            value: None,
            quality: Quality::BAD,
            timestamp: None,
        }
    }

    fn added(def: &ItemDef, result: &ItemResult) -> Self {
        Self {
            access_path: def.access_path.clone(),
            requested_type: def.requested_type,
            canonical_type: result.canonical_type,
            access_rights: result.access_rights,
            active: def.active,
            ..Self::new(def.item_id.clone(), def.client_handle, result.server_handle)
        }
    }
}

/// Item records of a group keyed by client handle, with a server handle
/// index.
///
/// Client handles claimed by a bulk call still in flight are held in a
/// reserved set, so no other caller can claim them until the call has
/// registered its results.
#[derive(Debug, Default)]
pub struct ItemTable {
    records: BTreeMap<ItemHandle, ItemRecord>,
    by_server: HashMap<ItemHandle, ItemHandle>,
    reserved: HashSet<ItemHandle>,
}

impl ItemTable {
    /// Whether `client_handle` belongs to a record or to a call in flight.
    pub fn is_claimed(&self, client_handle: ItemHandle) -> bool {
        self.records.contains_key(&client_handle) || self.reserved.contains(&client_handle)
    }

    /// Claims every handle in `handles` or none of them.
    ///
    /// Handles of records listed in `moving` may be claimed again; they are
    /// about to be given up by the same call.
    ///
    /// # Errors
    /// The first handle that repeats in `handles` or is already claimed.
    pub(crate) fn reserve(
        &mut self,
        handles: &[ItemHandle],
        moving: &HashSet<ItemHandle>,
    ) -> Result<(), ItemHandle> {
        let mut seen = HashSet::with_capacity(handles.len());
        for handle in handles {
            let claimed = self.reserved.contains(handle)
                || (self.records.contains_key(handle) && !moving.contains(handle));
            if !seen.insert(*handle) || claimed {
                return Err(*handle);
            }
        }
        self.reserved.extend(handles.iter().copied());
        Ok(())
    }

    pub(crate) fn unreserve(&mut self, handles: &[ItemHandle]) {
        for handle in handles {
            self.reserved.remove(handle);
        }
    }

    /// Inserts or replaces the record with the same client handle.
    pub fn insert(&mut self, record: ItemRecord) -> Option<ItemRecord> {
        let server_handle = record.server_handle;
        self.by_server.insert(server_handle, record.client_handle);
        let previous = self.records.insert(record.client_handle, record);
        if let Some(old) = &previous {
            if old.server_handle != server_handle {
                self.by_server.remove(&old.server_handle);
            }
        }
        previous
    }

    pub fn remove_by_server(&mut self, server_handle: ItemHandle) -> Option<ItemRecord> {
        let client = self.by_server.remove(&server_handle)?;
        self.records.remove(&client)
    }

    pub fn by_client(&self, client_handle: ItemHandle) -> Option<&ItemRecord> {
        self.records.get(&client_handle)
    }

    pub fn by_server(&self, server_handle: ItemHandle) -> Option<&ItemRecord> {
        self.by_server
            .get(&server_handle)
            .and_then(|client| self.records.get(client))
    }

    fn by_server_mut(&mut self, server_handle: ItemHandle) -> Option<&mut ItemRecord> {
        let client = self.by_server.get(&server_handle)?;
        self.records.get_mut(client)
    }

    pub fn by_item_id(&self, item_id: &str) -> Option<&ItemRecord> {
        self.records.values().find(|r| r.item_id == item_id)
    }

    pub fn item_id(&self, client_handle: ItemHandle) -> Option<&str> {
        self.records.get(&client_handle).map(|r| r.item_id.as_str())
    }

    /// Caches a fresh value on the matching record.
    ///
    /// # Returns
    /// The item id, or `None` when the client handle is unknown.
    pub fn record_value(&mut self, value: &ItemValue) -> Option<String> {
        let record = self.records.get_mut(&value.client_handle)?;
        record.value = Some(value.value.clone());
        record.quality = value.quality;
        record.timestamp = value.timestamp;
        Some(record.item_id.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ItemRecord> {
        self.records.values()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.by_server.clear();
        self.reserved.clear();
    }
}

/// Client handles claimed for one bulk call; given back on drop unless the
/// call hands them back itself with [`Reservation::finish`].
struct Reservation<'a> {
    group: &'a GroupInner,
    handles: Vec<ItemHandle>,
}

impl<'a> Reservation<'a> {
    fn claim(
        group: &'a GroupInner,
        table: &mut ItemTable,
        handles: Vec<ItemHandle>,
        moving: &HashSet<ItemHandle>,
    ) -> OpcResult<Self> {
        table.reserve(&handles, moving).map_err(|handle| {
            OpcError::InvalidArgument(format!("client handle {handle} is not unique in the group"))
        })?;
        Ok(Self { group, handles })
    }

    /// Gives the handles back through a table lock the caller already holds.
    fn finish(mut self, table: &mut ItemTable) {
        table.unreserve(&std::mem::take(&mut self.handles));
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.group
            .write_items_unpoisoned()
            .unreserve(&self.handles);
    }
}

/// The items of one group.
///
/// Obtained from [`crate::OpcGroup::items`]; every call goes through the
/// group's `IOPCItemMgt` and fails with `InvalidState` once the group has
/// been released.
#[derive(Clone)]
pub struct OpcItems {
    group: Arc<GroupInner>,
}

impl std::fmt::Debug for OpcItems {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpcItems")
            .field("group", &self.group.name())
            .field("count", &self.count())
            .finish()
    }
}

impl OpcItems {
    pub(crate) fn new(group: Arc<GroupInner>) -> Self {
        Self { group }
    }

    /// Defaults applied by [`OpcItems::add_items`]; they start from
    /// [`crate::ClientConfig::items`].
    pub fn defaults(&self) -> ItemDefaults {
        self.group
            .item_defaults()
            .read()
            .map(|d| d.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    pub fn set_default_active(&self, active: bool) -> OpcResult<()> {
        self.update_defaults(|d| d.active = active)
    }

    pub fn set_default_requested_type(&self, requested_type: VarType) -> OpcResult<()> {
        self.update_defaults(|d| d.requested_type = requested_type)
    }

    pub fn set_default_access_path(&self, access_path: &str) -> OpcResult<()> {
        self.update_defaults(|d| d.access_path = access_path.to_string())
    }

    fn update_defaults(&self, f: impl FnOnce(&mut ItemDefaults)) -> OpcResult<()> {
        let mut defaults = self
            .group
            .item_defaults()
            .write()
            .map_err(|_| OpcError::poisoned("item defaults"))?;
        f(&mut defaults);
        Ok(())
    }

    /// Adds items by id with the configured item defaults and fresh client
    /// handles. Handles already used in the group are skipped.
    pub fn add_items<S: AsRef<str>>(&self, item_ids: &[S]) -> OpcResult<Vec<Result<ItemResult, ItemError>>> {
        if item_ids.is_empty() {
            return Ok(Vec::new());
        }
        let defaults = self.defaults();
        let (defs, reservation) = {
            let mut table = self.group.write_items()?;
            let defs: Vec<ItemDef> = item_ids
                .iter()
                .map(|id| {
                    ItemDef::new(id.as_ref(), self.group.next_free_item_handle(&table))
                        .with_access_path(defaults.access_path.clone())
                        .with_requested_type(defaults.requested_type)
                        .with_active(defaults.active)
                })
                .collect();
            let handles = defs.iter().map(|d| d.client_handle).collect();
            let reservation = Reservation::claim(&self.group, &mut table, handles, &HashSet::new())?;
            (defs, reservation)
        };
        self.add_reserved(&defs, reservation)
    }

    /// Adds a single item by id with the item defaults.
    ///
    /// # Errors
    /// The item's own failure comes back as `OpcError::Server`.
    pub fn add_item(&self, item_id: &str) -> OpcResult<OpcItem> {
        let added = self
            .add_items(&[item_id])?
            .pop()
            .ok_or_else(|| OpcError::Internal("bulk call returned no result".into()))??;
        Ok(OpcItem::new(Arc::clone(&self.group), added.server_handle))
    }

    /// Adds items and registers the successful ones.
    ///
    /// # Errors
    /// `InvalidArgument` when a client handle repeats within `defs` or is
    /// already used in the group; a failing batch call. Per-item failures
    /// are entries of the returned vector.
    pub fn add(&self, defs: &[ItemDef]) -> OpcResult<Vec<Result<ItemResult, ItemError>>> {
        if defs.is_empty() {
            return Ok(Vec::new());
        }
        let reservation = {
            let mut table = self.group.write_items()?;
            let handles = defs.iter().map(|d| d.client_handle).collect();
            Reservation::claim(&self.group, &mut table, handles, &HashSet::new())?
        };
        self.add_reserved(defs, reservation)
    }

    fn add_reserved(
        &self,
        defs: &[ItemDef],
        reservation: Reservation<'_>,
    ) -> OpcResult<Vec<Result<ItemResult, ItemError>>> {
        let _span = info_span!("opc.add_items", group = %self.group.name(), tag_count = defs.len())
            .entered();
        let results = self.bulk_add(defs, None)?;

        let mut table = self.group.write_items()?;
        for (def, result) in defs.iter().zip(&results) {
            match result {
                Ok(added) => {
                    table.insert(ItemRecord::added(def, added));
                }
                Err(e) => warn!(item_id = %def.item_id, code = %e.code(), error = ?e, "item not added"),
            }
        }
        reservation.finish(&mut table);
        debug!(added = results.iter().filter(|r| r.is_ok()).count(), "items added");
        Ok(results)
    }

    /// Asks the server whether items could be added, without adding them.
    pub fn validate(
        &self,
        defs: &[ItemDef],
        blob_update: bool,
    ) -> OpcResult<Vec<Result<ItemResult, ItemError>>> {
        if defs.is_empty() {
            return Ok(Vec::new());
        }
        self.bulk_add(defs, Some(blob_update))
    }

    fn bulk_add(
        &self,
        defs: &[ItemDef],
        validate: Option<bool>,
    ) -> OpcResult<Vec<Result<ItemResult, ItemError>>> {
        let bridges = defs
            .iter()
            .map(ItemDef::to_bridge)
            .collect::<OpcResult<Vec<_>>>()?;
        let raw: Vec<_> = bridges.iter().map(|b| b.as_raw()).collect();
        let (mut results, errors) = self.group.with(|itf| match validate {
            None => itf.add_items(&raw),
            Some(blob_update) => itf.validate_items(&raw, blob_update),
        })?;

        // Take every slot so each returned blob is freed, failed or not.
        let mut taken: Vec<ItemResult> = results
            .as_mut_slice()
            .iter_mut()
            // SAFETY: the result array and its blobs belong to us.
            .map(|slot| unsafe { ItemResult::take(slot) })
            .collect();
        // SAFETY: a default record owns nothing.
        taken.resize_with(defs.len(), || unsafe { ItemResult::take(&mut OpcItemResult::default()) });

        Ok(item_statuses(&errors, defs.len())
            .into_iter()
            .zip(taken)
            .map(|(status, result)| status.map(|()| result))
            .collect())
    }

    /// Removes items by server handle and forgets the removed ones.
    pub fn remove(&self, server_handles: &[ItemHandle]) -> OpcResult<Vec<Result<(), ItemError>>> {
        if server_handles.is_empty() {
            return Ok(Vec::new());
        }
        let raw = raw_handles(server_handles);
        let errors = self.group.with(|itf| itf.remove_items(&raw))?;
        let statuses = item_statuses(&errors, raw.len());
        let mut table = self.group.write_items()?;
        for (handle, status) in server_handles.iter().zip(&statuses) {
            if status.is_ok() {
                table.remove_by_server(*handle);
            }
        }
        Ok(statuses)
    }

    /// Activates or deactivates items.
    pub fn set_active(
        &self,
        server_handles: &[ItemHandle],
        active: bool,
    ) -> OpcResult<Vec<Result<(), ItemError>>> {
        if server_handles.is_empty() {
            return Ok(Vec::new());
        }
        let raw = raw_handles(server_handles);
        let errors = self.group.with(|itf| itf.set_active_state(&raw, active))?;
        let statuses = item_statuses(&errors, raw.len());
        self.update_records(server_handles, &statuses, |record| record.active = active)?;
        Ok(statuses)
    }

    /// Replaces client handles; `client_handles[i]` becomes the handle of
    /// `server_handles[i]`.
    pub fn set_client_handles(
        &self,
        server_handles: &[ItemHandle],
        client_handles: &[ItemHandle],
    ) -> OpcResult<Vec<Result<(), ItemError>>> {
        ensure_same_len(server_handles.len(), client_handles.len(), "server and client handles")?;
        if server_handles.is_empty() {
            return Ok(Vec::new());
        }
        let reservation = {
            let mut table = self.group.write_items()?;
            let moving: HashSet<_> = server_handles
                .iter()
                .filter_map(|s| table.by_server(*s).map(|r| r.client_handle))
                .collect();
            Reservation::claim(&self.group, &mut table, client_handles.to_vec(), &moving)?
        };
        let raw_server = raw_handles(server_handles);
        let raw_client = raw_handles(client_handles);
        let errors = self
            .group
            .with(|itf| itf.set_client_handles(&raw_server, &raw_client))?;
        let statuses = item_statuses(&errors, raw_server.len());

        let mut table = self.group.write_items()?;
        // Park every moved record first so swapped handles never collide.
        let moved: Vec<ItemRecord> = server_handles
            .iter()
            .zip(&statuses)
            .filter(|(_, status)| status.is_ok())
            .filter_map(|(server, _)| table.remove_by_server(*server))
            .collect();
        for mut record in moved {
            if let Some(pos) = server_handles.iter().position(|s| *s == record.server_handle) {
                record.client_handle = client_handles[pos];
            }
            table.insert(record);
        }
        reservation.finish(&mut table);
        Ok(statuses)
    }

    /// Requests new data types for items.
    pub fn set_datatypes(
        &self,
        server_handles: &[ItemHandle],
        requested_types: &[VarType],
    ) -> OpcResult<Vec<Result<(), ItemError>>> {
        ensure_same_len(server_handles.len(), requested_types.len(), "server handles and types")?;
        if server_handles.is_empty() {
            return Ok(Vec::new());
        }
        let raw = raw_handles(server_handles);
        let types: Vec<u16> = requested_types.iter().map(|t| t.0).collect();
        let errors = self.group.with(|itf| itf.set_datatypes(&raw, &types))?;
        let statuses = item_statuses(&errors, raw.len());
        let mut table = self.group.write_items()?;
        for ((handle, status), vt) in server_handles.iter().zip(&statuses).zip(requested_types) {
            if status.is_ok() {
                if let Some(record) = table.by_server_mut(*handle) {
                    record.requested_type = *vt;
                }
            }
        }
        Ok(statuses)
    }

    fn update_records(
        &self,
        server_handles: &[ItemHandle],
        statuses: &[Result<(), ItemError>],
        update: impl Fn(&mut ItemRecord),
    ) -> OpcResult<()> {
        let mut table = self.group.write_items()?;
        for (handle, status) in server_handles.iter().zip(statuses) {
            if status.is_ok() {
                if let Some(record) = table.by_server_mut(*handle) {
                    update(record);
                }
            }
        }
        Ok(())
    }

    /// A view of the item with this server handle.
    pub fn get(&self, server_handle: ItemHandle) -> OpcResult<Option<OpcItem>> {
        Ok(self
            .group
            .read_items()?
            .by_server(server_handle)
            .map(|r| OpcItem::new(Arc::clone(&self.group), r.server_handle)))
    }

    pub fn get_by_item_id(&self, item_id: &str) -> OpcResult<Option<OpcItem>> {
        Ok(self
            .group
            .read_items()?
            .by_item_id(item_id)
            .map(|r| OpcItem::new(Arc::clone(&self.group), r.server_handle)))
    }

    pub fn by_item_id(&self, item_id: &str) -> OpcResult<Option<ItemRecord>> {
        Ok(self.group.read_items()?.by_item_id(item_id).cloned())
    }

    pub fn by_server_handle(&self, handle: ItemHandle) -> OpcResult<Option<ItemRecord>> {
        Ok(self.group.read_items()?.by_server(handle).cloned())
    }

    pub fn by_client_handle(&self, handle: ItemHandle) -> OpcResult<Option<ItemRecord>> {
        Ok(self.group.read_items()?.by_client(handle).cloned())
    }

    /// Server handles for item ids, `None` where an id is not registered.
    pub fn server_handles<S: AsRef<str>>(&self, item_ids: &[S]) -> OpcResult<Vec<Option<ItemHandle>>> {
        let table = self.group.read_items()?;
        Ok(item_ids
            .iter()
            .map(|id| table.by_item_id(id.as_ref()).map(|r| r.server_handle))
            .collect())
    }

    pub fn count(&self) -> usize {
        self.group.read_items().map_or(0, |t| t.len())
    }

    /// Copies every record, ordered by client handle.
    pub fn snapshot(&self) -> OpcResult<Vec<ItemRecord>> {
        Ok(self.group.read_items()?.iter().cloned().collect())
    }
}

pub(crate) fn raw_handles(handles: &[ItemHandle]) -> Vec<u32> {
    handles.iter().map(|h| h.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, client: u32, server: u32) -> ItemRecord {
        ItemRecord::new(id, ItemHandle(client), ItemHandle(server))
    }

    #[test]
    fn test_table_indexes_stay_consistent() {
        let mut table = ItemTable::default();
        table.insert(record("A", 1, 10));
        table.insert(record("B", 2, 20));
        assert_eq!(table.by_server(ItemHandle(20)).unwrap().item_id, "B");
        assert_eq!(table.by_item_id("A").unwrap().server_handle, ItemHandle(10));

        assert_eq!(table.remove_by_server(ItemHandle(20)).unwrap().item_id, "B");
        assert_eq!(table.len(), 1);
        assert!(table.by_server(ItemHandle(20)).is_none());
    }

    #[test]
    fn test_record_value_updates_cache() {
        let mut table = ItemTable::default();
        table.insert(record("A", 1, 10));
        let value = ItemValue {
            client_handle: ItemHandle(1),
            value: Value::F64(1.5),
            quality: Quality::GOOD,
            timestamp: None,
        };
        assert_eq!(table.record_value(&value).as_deref(), Some("A"));
        let cached = table.by_client(ItemHandle(1)).unwrap();
        assert_eq!(cached.value, Some(Value::F64(1.5)));
        assert!(cached.quality.is_good());

        let unknown = ItemValue {
            client_handle: ItemHandle(9),
            ..value
        };
        assert_eq!(table.record_value(&unknown), None);
    }

    #[test]
    fn test_reserved_handles_block_other_claims() {
        let mut table = ItemTable::default();
        table.insert(record("A", 1, 10));
        let none = HashSet::new();

        assert_eq!(table.reserve(&[ItemHandle(7)], &none), Ok(()));
        assert!(table.is_claimed(ItemHandle(7)));
        assert_eq!(table.reserve(&[ItemHandle(7)], &none), Err(ItemHandle(7)));
        assert_eq!(table.reserve(&[ItemHandle(1)], &none), Err(ItemHandle(1)));
        assert_eq!(
            table.reserve(&[ItemHandle(8), ItemHandle(8)], &none),
            Err(ItemHandle(8))
        );
        assert!(!table.is_claimed(ItemHandle(8)));

        // A record's own handle may be claimed by the call moving it.
        let moving = HashSet::from([ItemHandle(1)]);
        assert_eq!(table.reserve(&[ItemHandle(1)], &moving), Ok(()));

        table.unreserve(&[ItemHandle(7), ItemHandle(1)]);
        assert!(!table.is_claimed(ItemHandle(7)));
        assert_eq!(table.reserve(&[ItemHandle(7)], &none), Ok(()));
    }

    #[test]
    fn test_reinsert_replaces_server_index() {
        let mut table = ItemTable::default();
        table.insert(record("A", 1, 10));
        table.insert(record("A", 1, 11));
        assert!(table.by_server(ItemHandle(10)).is_none());
        assert_eq!(table.by_server(ItemHandle(11)).unwrap().item_id, "A");
    }
}
