//! # opc-da-client
//!
//! OPC DA client over the COM object model.
//!
//! The crate speaks the foreign ABI directly: `#[repr(C)]` function tables,
//! reference-counted [`com::Handle`]s and a VARIANT codec in [`variant`].
//! On top of that sit callback sinks feeding a per-group dispatcher, and a
//! registry of [`OpcServer`] → [`OpcGroups`] → [`OpcGroup`] → [`OpcItems`]
//! (with single-item views through [`OpcItem`])
//! that owns every acquired capability and releases it in order.
//!
//! ## Features
//! - `test-support`: Enables `MockOpcProvider` via `mockall` and the
//!   in-process simulated server in [`sim`]

pub mod com;
pub mod variant;

mod browser;
pub mod callback;
mod client;
mod com_worker;
mod config;
mod discovery;
pub mod dispatch;
mod errors;
mod group;
mod groups;
mod helpers;
mod item;
mod items;
mod provider;
mod records;
mod server;
pub mod traits;

#[cfg(any(test, feature = "test-support"))]
pub mod sim;

// Stable public API
pub use browser::OpcBrowser;
pub use client::OpcDaClient;
pub use config::{
    ClientConfig, GroupDefaults, GroupOptions, ItemDefaults, LOCALE_SYSTEM_DEFAULT,
    LOCALE_USER_DEFAULT,
};
pub use discovery::{DA_CATEGORIES, ServerList, list_servers};
pub use dispatch::{
    CancelCompleteEvent, DataChangeEvent, DataEvent, DropCounters, ItemUpdate, ReadCompleteEvent,
    ShutdownEvent, WriteCompleteEvent, WriteOutcome,
};
pub use errors::{
    ItemError, OpcError, OpcResult, describe_static, format_status, friendly_com_hint,
    friendly_hresult_hint,
};
pub use group::{AsyncRequest, OpcGroup};
pub use groups::OpcGroups;
pub use helpers::{item_error_to_string, tag_value, timestamp_to_string};
pub use item::{EuInfo, EuType, OpcItem};
pub use items::{ItemRecord, ItemTable, OpcItems};
pub use provider::{OpcProvider, TagValue, WriteResult};
pub use records::{
    AccessRights, BrowseDirection, BrowseType, DataSource, GroupHandle, GroupState, ItemDef,
    ItemHandle, ItemResult, ItemValue, NamespaceType, PropertyInfo, Quality, ServerState,
    ServerStatus,
};
pub use server::OpcServer;
pub use traits::{ClassDetails, GroupStateChange};

// Test support re-export
#[cfg(feature = "test-support")]
pub use provider::MockOpcProvider;
