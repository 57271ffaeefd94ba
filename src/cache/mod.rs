//! Double-buffered aggregation caches.
//!
//! [`Window`] pairs two [`Collection`]s with a switch protocol for periodic
//! persistence; [`ReadWriteSafeCache`] is the simpler variant where one lock
//! guards both buffers.

pub mod collection;
pub mod rw_safe;
pub mod window;

pub use collection::{
    AppendCollection, Collection, CollectionError, Flags, Keyed, MergeCollection, Mergeable,
    TopNCollection,
};
pub use rw_safe::{AppendBufferedData, BufferedData, MergeBufferedData, ReadWriteSafeCache};
pub use window::{SwitchGuard, Window, WriteGuard};
