//! Fixed-layout records exchanged in bulk calls and their owned
//! counterparts.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::com::alloc;
use crate::com::memory::wide_ptr_to_string;
use crate::com::{LocalWide, RemoteArray, StatusCode};
use crate::errors::{OpcError, OpcResult};
use crate::variant::{
    CodecError, FileTime, OwnedVariant, Value, VarType, Variant, filetime_to_datetime,
};

/// A group handle as exchanged with the server.
///
/// Each group carries two: the server's handle keys [`crate::OpcGroups`]
/// and is what `RemoveGroup` takes; the client handle is chosen by the
/// registry and comes back in every callback to name the group.
///
/// ```
/// use opc_da_client::GroupHandle;
/// let handle = GroupHandle(123u32);
/// assert_eq!(handle.to_string(), "123");
/// ```
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct GroupHandle(pub u32);

/// An item handle as exchanged with the server.
///
/// Server handles address items in every bulk call and index the group's
/// [`crate::ItemTable`]. Client handles are unique within a group; callbacks
/// carry only those, and the dispatcher resolves them back to item ids.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ItemHandle(pub u32);

impl fmt::Display for GroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ItemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reading source preference for synchronous reads and refreshes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSource {
    /// Serve from the server's cache (requires an active group and item).
    #[default]
    Cache = 1,
    /// Force a read from the underlying device.
    Device = 2,
}

impl DataSource {
    pub const fn as_raw(self) -> u32 {
        self as u32
    }
}

/// Read/write permissions reported for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccessRights(pub u32);

impl AccessRights {
    pub const READABLE: Self = Self(1);
    pub const WRITEABLE: Self = Self(2);
    pub const READ_WRITE: Self = Self(3);

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITEABLE.0 != 0
    }
}

impl fmt::Display for AccessRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => f.write_str("RW"),
            (true, false) => f.write_str("R"),
            (false, true) => f.write_str("W"),
            (false, false) => f.write_str("-"),
        }
    }
}

/// An OPC quality word: status bits in the top two of the low byte,
/// substatus and limit bits below.
///
/// ```
/// use opc_da_client::Quality;
///
/// assert_eq!(Quality(0xC0).to_string(), "Good");
/// assert_eq!(Quality(0x40).to_string(), "Uncertain");
/// assert!(!Quality(0x00).is_good());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Quality(pub u16);

impl Quality {
    pub const BAD: Self = Self(0x00);
    pub const UNCERTAIN: Self = Self(0x40);
    pub const GOOD: Self = Self(0xC0);
    const STATUS_MASK: u16 = 0xC0;

    pub const fn is_good(self) -> bool {
        self.0 & Self::STATUS_MASK == Self::GOOD.0
    }

    pub const fn is_uncertain(self) -> bool {
        self.0 & Self::STATUS_MASK == Self::UNCERTAIN.0
    }

    pub const fn is_bad(self) -> bool {
        self.0 & Self::STATUS_MASK == Self::BAD.0
    }

    /// `Good`, `Uncertain` or `Bad`, or `Unknown(..)` for the reserved 0x80.
    pub fn label(self) -> String {
        match self.0 & Self::STATUS_MASK {
            0xC0 => "Good".to_string(),
            0x40 => "Uncertain".to_string(),
            0x00 => "Bad".to_string(),
            _ => format!("Unknown(0x{:04X})", self.0),
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Current running state of the OPC server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Failed,
    NoConfig,
    Suspended,
    Test,
    CommunicationFault,
}

impl ServerState {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Running),
            2 => Some(Self::Failed),
            3 => Some(Self::NoConfig),
            4 => Some(Self::Suspended),
            5 => Some(Self::Test),
            6 => Some(Self::CommunicationFault),
            _ => None,
        }
    }

    pub const fn as_raw(self) -> u32 {
        match self {
            Self::Running => 1,
            Self::Failed => 2,
            Self::NoConfig => 3,
            Self::Suspended => 4,
            Self::Test => 5,
            Self::CommunicationFault => 6,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Running => "Running",
            Self::Failed => "Failed",
            Self::NoConfig => "No configuration",
            Self::Suspended => "Suspended",
            Self::Test => "Test",
            Self::CommunicationFault => "Communication fault",
        };
        f.write_str(label)
    }
}

/// Shape of the server's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceType {
    Hierarchical,
    Flat,
}

impl NamespaceType {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Hierarchical),
            2 => Some(Self::Flat),
            _ => None,
        }
    }
}

/// What an address space browse returns.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowseType {
    Branch = 1,
    Leaf = 2,
    Flat = 3,
}

/// How the browse position moves.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowseDirection {
    Up = 1,
    Down = 2,
    To = 3,
}

// ── Raw records ─────────────────────────────────────────────────────

/// Layout of `OPCITEMDEF`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct OpcItemDef {
    pub access_path: *mut u16,
    pub item_id: *mut u16,
    pub active: i32,
    pub client_handle: u32,
    pub blob_size: u32,
    pub blob: *mut u8,
    pub requested_type: u16,
    pub reserved: u16,
}

/// Layout of `OPCITEMRESULT`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct OpcItemResult {
    pub server_handle: u32,
    pub canonical_type: u16,
    pub reserved: u16,
    pub access_rights: u32,
    pub blob_size: u32,
    pub blob: *mut u8,
}

impl Default for OpcItemResult {
    fn default() -> Self {
        Self {
            server_handle: 0,
            canonical_type: 0,
            reserved: 0,
            access_rights: 0,
            blob_size: 0,
            blob: std::ptr::null_mut(),
        }
    }
}

/// Layout of `OPCITEMSTATE`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct OpcItemState {
    pub client_handle: u32,
    pub timestamp: FileTime,
    pub quality: u16,
    pub reserved: u16,
    pub value: Variant,
}

/// Layout of `OPCSERVERSTATUS`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct OpcServerStatus {
    pub start_time: FileTime,
    pub current_time: FileTime,
    pub last_update_time: FileTime,
    pub server_state: u32,
    pub group_count: u32,
    pub band_width: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub build_number: u16,
    pub reserved: u16,
    pub vendor_info: *mut u16,
}

// ── Owned records ───────────────────────────────────────────────────

/// Definition required to add a new item to an OPC group.
///
/// This structure contains the parameters needed for the server to identify
/// and initialize a tag within a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDef {
    /// The unique identifier of the tag within the server namespace.
    pub item_id: String,
    /// Optional access path for the item (server-specific).
    pub access_path: String,
    /// Whether the item should be added in an active state.
    pub active: bool,
    /// Handle assigned by the client for this item.
    pub client_handle: ItemHandle,
    /// Requested canonical data type (`VT_EMPTY` for server default).
    pub requested_type: VarType,
    /// Optional opaque blob for the item.
    pub blob: Vec<u8>,
}

impl ItemDef {
    pub fn new(item_id: impl Into<String>, client_handle: ItemHandle) -> Self {
        Self {
            item_id: item_id.into(),
            access_path: String::new(),
            active: true,
            client_handle,
            requested_type: VarType::EMPTY,
            blob: Vec::new(),
        }
    }

    pub fn with_access_path(mut self, access_path: impl Into<String>) -> Self {
        self.access_path = access_path.into();
        self
    }

    pub fn with_requested_type(mut self, requested_type: VarType) -> Self {
        self.requested_type = requested_type;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn to_bridge(&self) -> OpcResult<ItemDefBridge> {
        ItemDefBridge::new(self)
    }
}

/// Keeps the wide strings and blob of an [`ItemDef`] alive while the raw
/// record points into them.
#[derive(Debug)]
pub struct ItemDefBridge {
    access_path: LocalWide,
    item_id: LocalWide,
    blob: Vec<u8>,
    active: bool,
    client_handle: u32,
    requested_type: u16,
}

impl ItemDefBridge {
    fn new(def: &ItemDef) -> OpcResult<Self> {
        u32::try_from(def.blob.len())
            .map_err(|_| OpcError::InvalidArgument("blob size exceeds u32 maximum value".into()))?;
        Ok(Self {
            access_path: LocalWide::new(&def.access_path),
            item_id: LocalWide::new(&def.item_id),
            blob: def.blob.clone(),
            active: def.active,
            client_handle: def.client_handle.0,
            requested_type: def.requested_type.0,
        })
    }

    /// The raw record; valid while `self` is alive and unmoved.
    pub fn as_raw(&self) -> OpcItemDef {
        OpcItemDef {
            access_path: self.access_path.as_mut_ptr(),
            item_id: self.item_id.as_mut_ptr(),
            active: i32::from(self.active),
            client_handle: self.client_handle,
            #[allow(clippy::cast_possible_truncation)]
            blob_size: self.blob.len() as u32,
            blob: if self.blob.is_empty() {
                std::ptr::null_mut()
            } else {
                self.blob.as_ptr().cast_mut()
            },
            requested_type: self.requested_type,
            reserved: 0,
        }
    }
}

/// Result properties of an item after being added to (or validated
/// against) a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult {
    /// Handle assigned by the server for this item.
    pub server_handle: ItemHandle,
    /// The actual canonical data type supported by the server for this item.
    pub canonical_type: VarType,
    /// Access rights for this item (read/write permissions).
    pub access_rights: AccessRights,
    /// Optional opaque blob returned by the server.
    pub blob: Vec<u8>,
}

impl ItemResult {
    /// Copies a raw result and frees its foreign blob, leaving the slot
    /// without one.
    ///
    /// # Safety
    /// `raw.blob` must be null or task memory holding `raw.blob_size`
    /// bytes owned by the caller.
    pub unsafe fn take(raw: &mut OpcItemResult) -> Self {
        let blob_ptr = std::mem::replace(&mut raw.blob, std::ptr::null_mut());
        // SAFETY: forwarded contract; the wrapper frees the block once.
        let blob = unsafe { RemoteArray::from_raw(blob_ptr, raw.blob_size) };
        raw.blob_size = 0;
        Self {
            server_handle: ItemHandle(raw.server_handle),
            canonical_type: VarType(raw.canonical_type),
            access_rights: AccessRights(raw.access_rights),
            blob: blob.as_slice().to_vec(),
        }
    }
}

/// A decoded value with its quality and source timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemValue {
    pub client_handle: ItemHandle,
    pub value: Value,
    pub quality: Quality,
    /// `None` when the server sent an all-zero `FILETIME`.
    pub timestamp: Option<DateTime<Utc>>,
}

impl ItemValue {
    /// Decodes a raw item state, releasing its variant payload whether or
    /// not decoding succeeds.
    ///
    /// # Safety
    /// The variant payload in `raw` must be owned by the caller.
    pub unsafe fn take(raw: &mut OpcItemState) -> Result<Self, CodecError> {
        // SAFETY: forwarded contract.
        let value = unsafe { OwnedVariant::take(&mut raw.value) }.into_value()?;
        Ok(Self {
            client_handle: ItemHandle(raw.client_handle),
            value,
            quality: Quality(raw.quality),
            timestamp: filetime_to_datetime(raw.timestamp),
        })
    }
}

/// Operational status and metadata of the connected server.
///
/// This structure provides a snapshot of the server's health, current load,
/// and version information.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    /// Time when the server was started.
    pub start_time: Option<DateTime<Utc>>,
    /// Current time according to the server.
    pub current_time: Option<DateTime<Utc>>,
    /// Time of the last data update sent to this client.
    pub last_update_time: Option<DateTime<Utc>>,
    /// The current operational state of the server.
    pub server_state: ServerState,
    /// Number of groups currently managed by the server for this client.
    pub group_count: u32,
    /// Current bandwidth utilization as reported by the server.
    pub band_width: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub build_number: u16,
    /// Descriptive vendor-specific information.
    pub vendor_info: String,
}

impl ServerStatus {
    /// Copies a raw status and frees its vendor string.
    ///
    /// # Safety
    /// `raw.vendor_info` must be null or task memory owned by the caller.
    pub unsafe fn take(raw: &mut OpcServerStatus) -> OpcResult<Self> {
        let vendor = std::mem::replace(&mut raw.vendor_info, std::ptr::null_mut());
        // SAFETY: forwarded contract.
        let vendor_info = unsafe { wide_ptr_to_string(vendor) };
        // SAFETY: the string was copied above and is freed exactly once.
        unsafe { alloc::task_free(vendor.cast()) };
        let server_state = ServerState::from_raw(raw.server_state).ok_or_else(|| {
            OpcError::Conversion(format!("unknown server state: {}", raw.server_state))
        })?;
        Ok(Self {
            start_time: filetime_to_datetime(raw.start_time),
            current_time: filetime_to_datetime(raw.current_time),
            last_update_time: filetime_to_datetime(raw.last_update_time),
            server_state,
            group_count: raw.group_count,
            band_width: raw.band_width,
            major_version: raw.major_version,
            minor_version: raw.minor_version,
            build_number: raw.build_number,
            vendor_info,
        })
    }

    pub fn version(&self) -> String {
        format!(
            "{}.{}.{}",
            self.major_version, self.minor_version, self.build_number
        )
    }
}

/// Current state and properties of an active OPC group.
///
/// This structure encapsulates both the requested and currently active properties
/// of an OPC group, as reported by the server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupState {
    /// Actual update rate in milliseconds (may differ from requested).
    pub update_rate: u32,
    /// Whether the group is currently active (processing updates).
    pub active: bool,
    /// The unique name of the group.
    pub name: String,
    /// Time zone bias in minutes from UTC.
    pub time_bias: i32,
    /// Percent change for a tag value required to trigger an update.
    pub percent_deadband: f32,
    /// Locale ID used for formatting strings in this group.
    pub locale_id: u32,
    /// Handle assigned by the client for this group.
    pub client_handle: GroupHandle,
    /// Handle assigned by the server for this group.
    pub server_handle: GroupHandle,
}

/// A property of an item as listed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyInfo {
    pub id: u32,
    pub description: String,
    pub data_type: VarType,
}

/// Splits a per-item status array into results, describing failures
/// through the static table. `errors` is padded with `E_FAIL` when the
/// server returned fewer entries than `expected`.
pub(crate) fn item_statuses(
    errors: &RemoteArray<StatusCode>,
    expected: usize,
) -> Vec<Result<(), crate::errors::ItemError>> {
    errors
        .to_vec_padded(expected, StatusCode::E_FAIL)
        .into_iter()
        .map(|code| {
            if code.is_err() {
                Err(crate::errors::ItemError::from_code(code))
            } else {
                Ok(())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn test_raw_record_layouts() {
        assert_eq!(size_of::<FileTime>(), 8);
        assert_eq!(offset_of!(OpcItemState, quality), 12);
        assert_eq!(offset_of!(OpcItemState, value), 16);
        assert_eq!(offset_of!(OpcItemResult, access_rights), 8);
        assert_eq!(offset_of!(OpcServerStatus, server_state), 24);
        assert_eq!(offset_of!(OpcServerStatus, build_number), 40);
        if size_of::<usize>() == 8 {
            assert_eq!(size_of::<OpcItemState>(), 40);
            assert_eq!(size_of::<OpcItemResult>(), 24);
            assert_eq!(size_of::<OpcItemDef>(), 40);
            assert_eq!(offset_of!(OpcItemDef, blob), 24);
            assert_eq!(offset_of!(OpcServerStatus, vendor_info), 48);
        }
    }

    #[test]
    fn test_quality_labels() {
        assert_eq!(Quality(0xC0).label(), "Good");
        assert_eq!(Quality(0xD8).label(), "Good");
        assert_eq!(Quality(0x40).label(), "Uncertain");
        assert_eq!(Quality(0x18).label(), "Bad");
        assert_eq!(Quality(0x80).label(), "Unknown(0x0080)");
        assert!(Quality(0x04).is_bad());
        assert!(Quality(0x44).is_uncertain());
    }

    #[test]
    fn test_access_rights_display() {
        assert_eq!(AccessRights::READ_WRITE.to_string(), "RW");
        assert_eq!(AccessRights::READABLE.to_string(), "R");
        assert_eq!(AccessRights(0).to_string(), "-");
    }

    #[test]
    fn test_item_def_bridge_points_into_owned_text() {
        let def = ItemDef::new("Random.Int4", ItemHandle(7)).with_requested_type(VarType::I4);
        let bridge = def.to_bridge().unwrap();
        let raw = bridge.as_raw();
        // SAFETY: the bridge is alive for the reads below.
        unsafe {
            assert_eq!(crate::com::memory::wide_ptr_to_string(raw.item_id), "Random.Int4");
            assert_eq!(crate::com::memory::wide_ptr_to_string(raw.access_path), "");
        }
        assert_eq!(raw.active, 1);
        assert_eq!(raw.client_handle, 7);
        assert_eq!(raw.requested_type, VarType::I4.0);
        assert!(raw.blob.is_null());
    }

    #[test]
    fn test_item_result_take_frees_blob() {
        let blob = alloc::task_alloc_slice(&[1u8, 2, 3]).unwrap();
        let mut raw = OpcItemResult {
            server_handle: 11,
            canonical_type: VarType::R8.0,
            access_rights: 3,
            blob_size: 3,
            blob,
            ..OpcItemResult::default()
        };
        // SAFETY: the blob is task memory owned by this test.
        let result = unsafe { ItemResult::take(&mut raw) };
        assert_eq!(result.server_handle, ItemHandle(11));
        assert_eq!(result.blob, vec![1, 2, 3]);
        assert!(raw.blob.is_null());
        assert!(result.access_rights.is_writable());
    }

    #[test]
    fn test_server_status_take() {
        let mut raw = OpcServerStatus {
            start_time: FileTime::default(),
            current_time: FileTime::from_u64(116_444_736_000_000_000),
            last_update_time: FileTime::default(),
            server_state: 1,
            group_count: 2,
            band_width: u32::MAX,
            major_version: 3,
            minor_version: 0,
            build_number: 42,
            reserved: 0,
            vendor_info: alloc::task_alloc_wide("Acme").unwrap(),
        };
        // SAFETY: the vendor string is task memory owned by this test.
        let status = unsafe { ServerStatus::take(&mut raw) }.unwrap();
        assert_eq!(status.vendor_info, "Acme");
        assert_eq!(status.server_state, ServerState::Running);
        assert_eq!(status.start_time, None);
        assert_eq!(status.current_time.map(|t| t.timestamp()), Some(0));
        assert_eq!(status.version(), "3.0.42");
        assert!(raw.vendor_info.is_null());
    }

    #[test]
    fn test_unknown_server_state_is_rejected() {
        let mut raw = OpcServerStatus {
            start_time: FileTime::default(),
            current_time: FileTime::default(),
            last_update_time: FileTime::default(),
            server_state: 99,
            group_count: 0,
            band_width: 0,
            major_version: 0,
            minor_version: 0,
            build_number: 0,
            reserved: 0,
            vendor_info: std::ptr::null_mut(),
        };
        // SAFETY: null vendor string.
        let err = unsafe { ServerStatus::take(&mut raw) }.unwrap_err();
        assert!(matches!(err, OpcError::Conversion(_)));
    }

    #[test]
    fn test_item_statuses_pads_missing_entries() {
        let raw = alloc::task_alloc_slice(&[StatusCode::S_OK, StatusCode::OPC_E_UNKNOWNITEMID])
            .unwrap();
        // SAFETY: two status codes of task memory.
        let errors = unsafe { RemoteArray::from_raw(raw, 2) };
        let statuses = item_statuses(&errors, 3);
        assert_eq!(statuses.len(), 3);
        assert!(statuses[0].is_ok());
        assert_eq!(
            statuses[1].as_ref().unwrap_err().code(),
            StatusCode::OPC_E_UNKNOWNITEMID
        );
        assert_eq!(statuses[2].as_ref().unwrap_err().code(), StatusCode::E_FAIL);
    }
}
