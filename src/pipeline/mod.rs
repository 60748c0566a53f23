//! The processing side of the engine: bundle schema, queue consumption,
//! chunk planning, metadata resolution, the processor itself and the
//! manifest contract.

mod bundle;
mod chunk;
mod manifest;
mod metadata;
mod processor;
mod queue;
mod variants;

pub use bundle::{BundleError, JobBundle};
pub use chunk::{plan_chunks, Chunk, ChunkPlan, PlanError};
pub use manifest::{sha256_file, Artifact, JobManifest, ManifestError};
pub use metadata::{find_cover_in_dir, resolve_tags, strip_track_number, ResolvedTags};
pub use processor::{ProcessError, Processor};
pub use queue::{
    ClaimableJob, ClaimedJob, Discovery, Disposition, InvalidBundle, QueueConsumer, QueueError,
    TMP_SUFFIX,
};
pub use variants::{album_output_filename, output_filename, stem_sources};
