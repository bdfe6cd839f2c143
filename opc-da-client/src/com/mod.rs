//! Foreign object model primitives.
//!
//! Everything that touches raw COM pointers lives below this module:
//! identifiers, status codes, the foreign allocator, reference-counted
//! handles, function tables and the runtime guard.

pub(crate) mod alloc;
pub mod guid;
pub mod handle;
pub mod iterator;
pub mod memory;
pub(crate) mod object;
pub mod runtime;
pub mod status;
pub mod vtables;

pub use guid::{Guid, GuidParseError};
pub use handle::{Handle, Interface};
pub use iterator::{GuidIterator, StringIterator};
pub use memory::{LocalWide, RemoteArray, RemotePointer, RemoteString};
pub use runtime::{Activator, ComActivator, ComRuntime, Location};
pub use status::StatusCode;
