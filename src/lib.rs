//! Instrumental engine library.
//!
//! The engine claims job bundles from filesystem queues, runs the chunked
//! vocal-separation pipeline, publishes artifacts with a manifest, and
//! routes manifests to downstream storage. The modules are exposed for the
//! binary and for integration tests.

pub mod config;
pub mod events;
pub mod fsutil;
pub mod locks;
pub mod media;
pub mod pipeline;
pub mod sync;

pub use config::{AppConfig, CliConfig};
pub use events::{Event, EventLog};
pub use pipeline::{JobBundle, JobManifest, Processor};
pub use sync::SyncRouter;
