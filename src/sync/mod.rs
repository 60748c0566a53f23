//! Manifest-driven artifact sync: routes, transports and the router loop.

mod backend;
mod router;
mod routes;
mod seen_store;

pub use backend::{create_backend, LocalBackend, SyncBackend, SyncError};
pub use router::{ManifestOutcome, SyncRouter};
pub use routes::RouteTable;
pub use seen_store::{SeenStore, StoreError, SyncStatus};
