//! One trait per foreign interface.
//!
//! Each trait exposes its interface through `interface()` and wraps the raw
//! entry points in default methods that own every foreign output. The
//! registry types implement them over the handles they hold:
//!
//! Server side:
//! - ServerTrait: groups, status and error strings
//! - CommonTrait: locale management and client name
//! - BrowseServerAddressSpaceTrait: address space navigation
//! - ItemPropertiesTrait: item property queries
//! - ServerListTrait: server discovery by component category
//!
//! Group side:
//! - GroupStateMgtTrait: name, rate, active flag, deadband
//! - ItemMgtTrait: bulk add/validate/remove and item attributes
//! - SyncIoTrait: blocking read/write
//! - AsyncIo2Trait: transaction-based read/write/refresh
//! - ConnectionPointContainerTrait: advise/unadvise of callback sinks
mod async_io2;
mod browse_server_address_space;
mod common;
mod connection_point_container;
mod group_state_mgt;
mod item_mgt;
mod item_properties;
mod server;
mod server_list;
mod sync_io;

pub use async_io2::*;
pub use browse_server_address_space::*;
pub use common::*;
pub use connection_point_container::*;
pub use group_state_mgt::*;
pub use item_mgt::*;
pub use item_properties::*;
pub use server::*;
pub use server_list::*;
pub use sync_io::*;
