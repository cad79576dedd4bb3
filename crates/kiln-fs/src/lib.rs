//! Filesystem job store for the Kiln job queue.
//!
//! Each job is one JSON file named after its id. The whole directory is read
//! on open and kept in memory; every change is written through to disk with a
//! write-then-rename so a crash never leaves a half-written record.

pub mod error;
mod record;
pub mod store;

pub use error::{FsError, FsResult};
pub use store::FsJobStore;
