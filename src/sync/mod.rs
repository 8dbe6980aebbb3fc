//! Keeping local and remote data consistent.
//!
//! - [`Synchronizer`]: stale-while-revalidate streams over the cache
//! - [`LiveBridge`]: shared push connections for live screens
//! - [`Paginator`]: cursor paging over ordered remote queries

mod live;
mod paginator;
mod result;
mod synchronizer;

pub use live::{LiveBridge, LiveSubscription, LiveUpdate, ReconnectPolicy};
pub use paginator::{PaginationCursor, Paginator};
pub use result::SyncResult;
pub use synchronizer::{Resource, SyncStream, Synchronizer};
