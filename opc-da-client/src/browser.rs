//! Address space navigation over `IOPCBrowseServerAddressSpace`.

use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::com::Handle;
use crate::com::vtables::IOPCBrowseServerAddressSpace;
use crate::errors::{OpcError, OpcResult};
use crate::records::{AccessRights, BrowseDirection, BrowseType, NamespaceType};
use crate::traits::BrowseServerAddressSpaceTrait;
use crate::variant::VarType;

const MAX_DEPTH: usize = 50;

#[derive(Debug, Clone)]
struct Filters {
    name: String,
    data_type: VarType,
    access_rights: AccessRights,
}

impl Default for Filters {
    fn default() -> Self {
        Self {
            name: String::new(),
            data_type: VarType::EMPTY,
            access_rights: AccessRights(0),
        }
    }
}

/// A cursor into the server's address space.
///
/// The browse position lives on the server and is shared by every browser
/// of the same connection.
#[derive(Debug)]
pub struct OpcBrowser {
    handle: Handle<IOPCBrowseServerAddressSpace>,
    filters: Mutex<Filters>,
}

impl BrowseServerAddressSpaceTrait for OpcBrowser {
    fn interface(&self) -> OpcResult<&Handle<IOPCBrowseServerAddressSpace>> {
        Ok(&self.handle)
    }
}

impl OpcBrowser {
    pub(crate) fn new(handle: Handle<IOPCBrowseServerAddressSpace>) -> Self {
        Self {
            handle,
            filters: Mutex::new(Filters::default()),
        }
    }

    fn filters(&self) -> Filters {
        self.filters
            .lock()
            .map(|f| f.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    fn update_filters(&self, f: impl FnOnce(&mut Filters)) {
        let mut filters = self
            .filters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut filters);
    }

    /// Name filter handed to the server; empty matches everything.
    pub fn set_filter(&self, filter: impl Into<String>) {
        let filter = filter.into();
        self.update_filters(|f| f.name = filter);
    }

    /// Only list items convertible to `data_type`; `VT_EMPTY` for any.
    pub fn set_data_type(&self, data_type: VarType) {
        self.update_filters(|f| f.data_type = data_type);
    }

    /// Only list items with these rights; zero for any.
    pub fn set_access_rights(&self, access_rights: AccessRights) {
        self.update_filters(|f| f.access_rights = access_rights);
    }

    pub fn organization(&self) -> OpcResult<NamespaceType> {
        self.query_organization()
    }

    /// Branch names at the current position.
    pub fn show_branches(&self) -> OpcResult<Vec<String>> {
        self.list(BrowseType::Branch)
    }

    /// Leaf names at the current position, or every item below it when
    /// `flat` is set.
    pub fn show_leafs(&self, flat: bool) -> OpcResult<Vec<String>> {
        self.list(if flat { BrowseType::Flat } else { BrowseType::Leaf })
    }

    /// Branches followed by leaves at the current position.
    pub fn names(&self) -> OpcResult<Vec<String>> {
        let mut names = self.show_branches()?;
        names.extend(self.show_leafs(false)?);
        Ok(names)
    }

    fn list(&self, browse_type: BrowseType) -> OpcResult<Vec<String>> {
        let filters = self.filters();
        let Some(iter) =
            self.browse_opc_item_ids(browse_type, &filters.name, filters.data_type, filters.access_rights)?
        else {
            return Ok(Vec::new());
        };
        iter.collect()
    }

    pub fn move_up(&self) -> OpcResult<()> {
        self.change_browse_position(BrowseDirection::Up, "")
    }

    pub fn move_down(&self, branch: &str) -> OpcResult<()> {
        if branch.is_empty() {
            return Err(OpcError::InvalidArgument("branch name cannot be empty".into()));
        }
        self.change_browse_position(BrowseDirection::Down, branch)
    }

    /// Moves to an absolute position; an empty path is the root.
    pub fn move_to(&self, path: &str) -> OpcResult<()> {
        self.change_browse_position(BrowseDirection::To, path)
    }

    pub fn move_to_root(&self) -> OpcResult<()> {
        self.move_to("")
    }

    /// Fully qualified item id for a leaf name at the current position.
    pub fn item_id(&self, leaf: &str) -> OpcResult<String> {
        self.get_item_id(leaf)
    }

    pub fn access_paths(&self, item_id: &str) -> OpcResult<Vec<String>> {
        match self.browse_access_paths(item_id)? {
            Some(iter) => iter.collect(),
            None => Ok(Vec::new()),
        }
    }

    /// Collects up to `max_items` fully qualified item ids, calling
    /// `on_item` for each as it is found.
    ///
    /// Flat namespaces are listed directly. Hierarchical ones first try a
    /// flat listing from the root and fall back to a depth-first walk when
    /// the server does not support it.
    pub fn collect_item_ids(
        &self,
        max_items: usize,
        mut on_item: impl FnMut(&str),
    ) -> OpcResult<Vec<String>> {
        let mut found = Vec::new();
        if self.organization()? == NamespaceType::Flat {
            self.take_into(BrowseType::Leaf, max_items, &mut found, &mut on_item)?;
        } else {
            self.move_to_root()?;
            let flat = self.take_into(BrowseType::Flat, max_items, &mut found, &mut on_item);
            match flat {
                Ok(()) if !found.is_empty() => {
                    debug!("flat browse supported");
                }
                Ok(()) => {
                    debug!("flat browse returned nothing, walking the hierarchy");
                    self.walk(&mut found, max_items, &mut on_item, 0)?;
                }
                Err(e) => {
                    debug!(error = ?e, "flat browse not supported, walking the hierarchy");
                    found.clear();
                    self.walk(&mut found, max_items, &mut on_item, 0)?;
                }
            }
        }
        info!(count = found.len(), "browse completed");
        Ok(found)
    }

    fn take_into(
        &self,
        browse_type: BrowseType,
        max_items: usize,
        found: &mut Vec<String>,
        on_item: &mut impl FnMut(&str),
    ) -> OpcResult<()> {
        let filters = self.filters();
        let Some(iter) =
            self.browse_opc_item_ids(browse_type, &filters.name, filters.data_type, filters.access_rights)?
        else {
            return Ok(());
        };
        for name in iter {
            if found.len() >= max_items {
                break;
            }
            let name = name?;
            on_item(&name);
            found.push(name);
        }
        Ok(())
    }

    fn walk(
        &self,
        found: &mut Vec<String>,
        max_items: usize,
        on_item: &mut impl FnMut(&str),
        depth: usize,
    ) -> OpcResult<()> {
        if found.len() >= max_items {
            return Ok(());
        }
        if depth > MAX_DEPTH {
            warn!(depth, "maximum browse depth reached, truncating");
            return Ok(());
        }
        let branches = self.show_branches()?;
        for leaf in self.show_leafs(false)? {
            if found.len() >= max_items {
                return Ok(());
            }
            let item_id = self.item_id(&leaf).unwrap_or_else(|e| {
                warn!(leaf = %leaf, error = ?e, "GetItemID failed, using the browse name");
                leaf.clone()
            });
            on_item(&item_id);
            found.push(item_id);
        }
        for branch in branches {
            if found.len() >= max_items {
                return Ok(());
            }
            if let Err(e) = self.move_down(&branch) {
                warn!(branch = %branch, error = ?e, "cannot enter branch, skipping");
                continue;
            }
            if let Err(e) = self.walk(found, max_items, on_item, depth + 1) {
                warn!(branch = %branch, error = ?e, "branch walk failed");
            }
            if let Err(e) = self.move_up() {
                warn!(error = ?e, "cannot move up, stopping the walk");
                break;
            }
        }
        Ok(())
    }
}
