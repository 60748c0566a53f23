//! Adapters around the external media tools.
//!
//! All subprocess invocation lives here; the processor only ever sees typed
//! results. Every call is bounded by a wall-clock timeout.

mod separator;
mod toolkit;

pub use separator::{Separator, SeparatorError, StemSet};
pub use toolkit::{MediaError, MediaToolkit, TagSet};
