//! Core of the multi-tenant cloud storage service.
//!
//! Layers a file-system-like abstraction (directories, listings, breadcrumbs,
//! thumbnails, search) over a flat S3-compatible object store, plus
//! encrypted/hidden folder access control, an asynchronous archive pipeline,
//! usage accounting, antivirus scanning and the caching that holds it all
//! together. The HTTP surface, auth policy and billing live outside this
//! crate; everything enters through [`service::CloudService`] with an
//! explicit [`context::RequestContext`].

pub mod archive;
pub mod cache_keys;
pub mod config;
pub mod context;
pub mod directory;
pub mod download;
pub mod error;
pub mod listing;
pub mod metadata;
pub mod model;
pub mod object;
pub mod scanner;
pub mod service;
pub mod upload;
pub mod usage;

/// Zero-byte object that materializes an otherwise-empty directory. Never
/// surfaced to callers.
pub const EMPTY_FOLDER_PLACEHOLDER: &str = ".emptyFolderPlaceholder";

/// Per-owner directory holding manifests and other service-internal objects;
/// hidden from every user-facing listing.
pub const SECURE_DIR: &str = ".secure";

/// Whether a storage key (relative to the owner) must be hidden from users.
pub fn is_internal_key(relative_key: &str) -> bool {
    relative_key == SECURE_DIR
        || relative_key.starts_with(".secure/")
        || utils::path::file_name(relative_key) == EMPTY_FOLDER_PLACEHOLDER
}
