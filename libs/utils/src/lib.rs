//! Small shared helpers for the cloudserver tree: path and storage-key
//! handling, glob matching for cache keys, and logging initialization.
//! No storage or network semantics live here.

pub mod glob;
pub mod logging;
pub mod path;
